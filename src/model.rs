use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::types::{StratumId, TileId};

/// Acquisition platform of a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Sensor {
    Sentinel,
    Spot,
    Landsat,
}

impl Sensor {
    /// Mission name understood by the processing applications.
    pub fn mission_name(self) -> &'static str {
        match self {
            Self::Sentinel => "SENTINEL",
            Self::Spot => "SPOT",
            Self::Landsat => "LANDSAT",
        }
    }
}

impl fmt::Display for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mission_name())
    }
}

/// Reference to one acquisition's per-tile input imagery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub path: PathBuf,
    pub sensor: Sensor,
}

impl Descriptor {
    /// File name without extension, as reported in the product metadata.
    pub fn name(&self) -> String {
        file_stem(&self.path)
    }
}

/// One geographic processing unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    pub id: TileId,
    /// Descriptors in input order.
    pub descriptors: Vec<Descriptor>,
    /// Populated by `prepare-tiles`; `None` means the tile is processed unmasked.
    pub crop_mask: Option<PathBuf>,
    /// Strata the tile belongs to after filtering.
    pub strata: Vec<StratumId>,
    /// Raster whose grid is used when rasterizing vector masks for this tile.
    pub reference_raster: PathBuf,
}

impl Tile {
    pub fn descriptor_paths(&self) -> Vec<PathBuf> {
        self.descriptors.iter().map(|d| d.path.clone()).collect()
    }
}

/// A spatial subdivision with its own classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stratum {
    pub id: StratumId,
    /// Member tiles, in study-area tile order.
    pub tiles: Vec<TileId>,
}

/// Everything known about the study area once inputs are loaded.
#[derive(Debug, Clone)]
pub struct StudyArea {
    /// Tiles in insertion order; the manifest preserves this order.
    pub tiles: Vec<Tile>,
    /// Strata that survived the stratum filter, in filter order.
    pub strata: Vec<Stratum>,
    pub main_sensor: Sensor,
    /// `None` in single-stratum mode.
    pub strata_shapefile: Option<PathBuf>,
}

impl StudyArea {
    pub fn single_stratum(&self) -> bool {
        self.strata_shapefile.is_none()
    }

    pub fn tile(&self, id: &TileId) -> Option<&Tile> {
        self.tiles.iter().find(|t| &t.id == id)
    }

    pub fn stratum_tiles<'a>(&'a self, stratum: &'a Stratum) -> impl Iterator<Item = &'a Tile> + 'a {
        stratum.tiles.iter().filter_map(move |id| self.tile(id))
    }

    pub fn has_any_mask(&self) -> bool {
        self.tiles.iter().any(|t| t.crop_mask.is_some())
    }
}

/// The trained classifier and its auxiliary outputs for one stratum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelArtifact {
    pub stratum: StratumId,
    pub model: PathBuf,
    pub days: PathBuf,
    pub statistics: Option<PathBuf>,
    pub confusion_matrix: PathBuf,
}

/// Per-tile crop type maps and quality flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassificationOutput {
    pub tile: TileId,
    pub raw_map: PathBuf,
    pub masked_map: Option<PathBuf>,
    pub quality_flags: PathBuf,
}

impl ClassificationOutput {
    /// The map delivered as the tile's main product.
    pub fn final_map(&self) -> &Path {
        self.masked_map.as_deref().unwrap_or(&self.raw_map)
    }
}

/// Validation documents for one stratum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StratumMetrics {
    pub stratum: StratumId,
    pub confusion_matrix: PathBuf,
    pub quality_metrics: PathBuf,
    pub document: PathBuf,
}

/// Per-stratum and global accuracy statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationMetrics {
    pub strata: Vec<StratumMetrics>,
    /// In single-stratum mode this is the stratum's own document.
    pub global: PathBuf,
}

pub(crate) fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
