//! Mapping of product descriptors onto tiles.
//!
//! Parsing the descriptor contents is left to the processing applications;
//! the orchestrator only needs to know which sensor produced a descriptor
//! and which tile it covers, both of which are encoded in product names.

use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};
use crate::model::{Descriptor, Sensor, Tile};
use crate::types::TileId;

/// Identifies the sensor and tile of a product descriptor.
pub trait DescriptorReader: Send + Sync {
    fn read(&self, path: &Path) -> PipelineResult<(TileId, Descriptor)>;
}

/// Reader relying on the standard product naming conventions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NamingConventionReader;

fn mgrs_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // 31TCJ, optionally prefixed by T, delimited by '_' or '.'
    PATTERN.get_or_init(|| Regex::new(r"(?i)(?:^|_)T?(\d{2}[A-Z]{3})(?:_|\.|$)").unwrap())
}

fn wrs_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // path/row, e.g. 196030
    PATTERN.get_or_init(|| Regex::new(r"(?:^|_)(\d{6})(?:_|\.|$)").unwrap())
}

fn spot_site_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)_N2A_([A-Z0-9]+)").unwrap())
}

impl NamingConventionReader {
    fn sensor_of(name: &str) -> Option<Sensor> {
        let upper = name.to_uppercase();
        if upper.starts_with("S2") || upper.starts_with("SENTINEL2") {
            Some(Sensor::Sentinel)
        } else if upper.starts_with("SPOT") {
            Some(Sensor::Spot)
        } else if ["L8", "LC08", "LC8", "LANDSAT"]
            .iter()
            .any(|p| upper.starts_with(p))
        {
            Some(Sensor::Landsat)
        } else {
            None
        }
    }

    fn tile_of(name: &str, sensor: Sensor) -> Option<String> {
        let captured = match sensor {
            Sensor::Sentinel => mgrs_pattern().captures(name),
            Sensor::Landsat => wrs_pattern().captures(name),
            Sensor::Spot => spot_site_pattern()
                .captures(name)
                .or_else(|| mgrs_pattern().captures(name)),
        };
        captured.map(|c| c[1].to_uppercase())
    }
}

impl DescriptorReader for NamingConventionReader {
    fn read(&self, path: &Path) -> PipelineResult<(TileId, Descriptor)> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let sensor = Self::sensor_of(&name)
            .ok_or_else(|| PipelineError::invalid_input(path, "unrecognized product sensor"))?;
        let tile = Self::tile_of(&name, sensor)
            .ok_or_else(|| PipelineError::invalid_input(path, "no tile identifier in product name"))?;

        Ok((
            TileId::new(tile),
            Descriptor {
                path: path.to_path_buf(),
                sensor,
            },
        ))
    }
}

/// Group descriptors into tiles and pick the main sensor.
///
/// Tiles keep the order in which they first appear; descriptors keep input
/// order. Crop masks and strata are filled in later.
pub fn load_tiles<P: AsRef<Path>>(
    reader: &dyn DescriptorReader,
    inputs: &[P],
) -> PipelineResult<(Vec<Tile>, Sensor)> {
    if inputs.is_empty() {
        return Err(PipelineError::config("no product descriptors given"));
    }

    let mut order: Vec<TileId> = Vec::new();
    let mut grouped: HashMap<TileId, Vec<Descriptor>> = HashMap::new();
    let mut counts: HashMap<Sensor, usize> = HashMap::new();

    for input in inputs {
        let (tile_id, descriptor) = reader.read(input.as_ref())?;
        debug!(
            "Descriptor {} -> tile {} ({})",
            descriptor.path.display(),
            tile_id,
            descriptor.sensor
        );
        *counts.entry(descriptor.sensor).or_default() += 1;
        if !grouped.contains_key(&tile_id) {
            order.push(tile_id.clone());
        }
        grouped.entry(tile_id).or_default().push(descriptor);
    }

    let mut main_sensor = Sensor::Sentinel;
    let mut best = 0;
    for sensor in [Sensor::Sentinel, Sensor::Spot, Sensor::Landsat] {
        let count = counts.get(&sensor).copied().unwrap_or(0);
        if count > best {
            best = count;
            main_sensor = sensor;
        }
    }

    let tiles: Vec<Tile> = order
        .into_iter()
        .map(|id| {
            let descriptors = grouped.remove(&id).unwrap_or_default();
            let reference_raster = descriptors
                .iter()
                .find(|d| d.sensor == main_sensor)
                .or_else(|| descriptors.first())
                .map(|d| d.path.clone())
                .unwrap_or_default();
            Tile {
                id,
                descriptors,
                crop_mask: None,
                strata: Vec::new(),
                reference_raster,
            }
        })
        .collect();

    info!(
        "Loaded {} tile(s) from {} descriptor(s), main sensor {}",
        tiles.len(),
        inputs.len(),
        main_sensor
    );

    Ok((tiles, main_sensor))
}
