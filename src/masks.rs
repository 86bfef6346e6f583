//! Crop mask resolution for tiles.
//!
//! A resolver maps a tile to an optional mask raster. The orchestration
//! code only sees the trait, so the directory scan can be replaced by a
//! manifest lookup without touching the stages.

use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info};

use crate::config::MaskSource;
use crate::error::{PipelineError, PipelineResult};
use crate::model::Tile;
use crate::types::TileId;

/// File name prefix of the segmented (post-filtered) crop mask.
pub const SEGMENTED_MASK_PREFIX: &str = "S2AGRI_L4A_CM";
/// File name prefix of the raw crop mask.
pub const RAW_MASK_PREFIX: &str = "S2AGRI_L4A_RAW";

pub trait MaskResolver: Send + Sync {
    /// `index` is the tile's position in the study area.
    fn resolve(&self, index: usize, tile: &TileId) -> Option<PathBuf>;
}

/// No masks at all.
pub struct NoMasks;

impl MaskResolver for NoMasks {
    fn resolve(&self, _index: usize, _tile: &TileId) -> Option<PathBuf> {
        None
    }
}

/// Masks given explicitly, aligned by tile index.
pub struct ExplicitMasks {
    masks: Vec<Option<PathBuf>>,
}

impl ExplicitMasks {
    pub fn new(masks: Vec<Option<PathBuf>>, tile_count: usize) -> PipelineResult<Self> {
        if masks.len() != tile_count {
            return Err(PipelineError::config(format!(
                "{} crop mask(s) given for {} tile(s)",
                masks.len(),
                tile_count
            )));
        }
        Ok(Self { masks })
    }
}

impl MaskResolver for ExplicitMasks {
    fn resolve(&self, index: usize, _tile: &TileId) -> Option<PathBuf> {
        self.masks.get(index).cloned().flatten()
    }
}

fn tile_dir_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"_T([a-zA-Z0-9]+)$").unwrap())
}

/// Index of the masks found in a crop mask product.
#[derive(Debug, Default)]
pub struct MaskProductIndex {
    masks: HashMap<TileId, PathBuf>,
}

impl MaskProductIndex {
    /// Scan `<product>/TILES/*_T<tile>/IMG_DATA` for mask rasters,
    /// preferring the segmented mask over the raw one.
    pub fn scan(product: &Path) -> PipelineResult<Self> {
        let tiles_dir = product.join("TILES");
        let mut masks = HashMap::new();

        for tile_dir in sorted_entries(&tiles_dir)? {
            let dir_name = file_name(&tile_dir);
            let Some(caps) = tile_dir_pattern().captures(&dir_name) else {
                continue;
            };
            let tile_id = TileId::new(&caps[1]);

            let img_data = tile_dir.join("IMG_DATA");
            if !img_data.is_dir() {
                debug!("No IMG_DATA in {}", tile_dir.display());
                continue;
            }

            let mut segmented = None;
            let mut raw = None;
            for file in sorted_entries(&img_data)? {
                let name = file_name(&file);
                if segmented.is_none() && name.starts_with(SEGMENTED_MASK_PREFIX) {
                    segmented = Some(file);
                } else if raw.is_none() && name.starts_with(RAW_MASK_PREFIX) {
                    raw = Some(file);
                }
            }

            if let Some(mask) = segmented.or(raw) {
                masks.insert(tile_id, mask);
            }
        }

        Ok(Self { masks })
    }

    pub fn len(&self) -> usize {
        self.masks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }
}

impl MaskResolver for MaskProductIndex {
    fn resolve(&self, _index: usize, tile: &TileId) -> Option<PathBuf> {
        self.masks.get(tile).cloned()
    }
}

/// Build the resolver for the configured mask source.
pub fn resolver_for(source: &MaskSource, tile_count: usize) -> PipelineResult<Box<dyn MaskResolver>> {
    Ok(match source {
        MaskSource::None => Box::new(NoMasks),
        MaskSource::PerTile(list) => Box::new(ExplicitMasks::new(list.clone(), tile_count)?),
        MaskSource::Product(product) => Box::new(MaskProductIndex::scan(product)?),
    })
}

/// Fill in `crop_mask` for every tile. Tiles without a mask stay unmasked.
pub fn assign_masks(tiles: &mut [Tile], resolver: &dyn MaskResolver) {
    for (index, tile) in tiles.iter_mut().enumerate() {
        tile.crop_mask = resolver.resolve(index, &tile.id);
        if let Some(mask) = &tile.crop_mask {
            info!("Crop mask for tile {}: {}", tile.id, mask.display());
        }
    }
}

fn sorted_entries(dir: &Path) -> PipelineResult<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| PipelineError::io(dir, e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect::<Vec<_>>();
    entries.sort();
    Ok(entries)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
