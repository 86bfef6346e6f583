//! Output artifact naming.
//!
//! Every per-tile artifact is namespaced by tile id and every per-stratum
//! artifact by stratum id, so concurrent units never write the same path.
//! In single-stratum mode per-stratum names carry no id suffix.

use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use crate::model::{ClassificationOutput, ModelArtifact, StratumMetrics, Tile};
use crate::types::{StratumId, TileId};

#[derive(Debug, Clone)]
pub struct OutputLayout {
    out_dir: PathBuf,
    single_stratum: bool,
}

impl OutputLayout {
    pub fn new(out_dir: impl Into<PathBuf>, single_stratum: bool) -> Self {
        Self {
            out_dir: out_dir.into(),
            single_stratum,
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.out_dir.join(name)
    }

    fn stratum_file(&self, prefix: &str, stratum: StratumId, ext: &str) -> PathBuf {
        if self.single_stratum {
            self.path(format!("{prefix}.{ext}"))
        } else {
            self.path(format!("{prefix}-{stratum}.{ext}"))
        }
    }

    fn tile_file(&self, prefix: &str, tile: &TileId, suffix: &str) -> PathBuf {
        self.path(format!("{prefix}{tile}{suffix}.tif"))
    }

    // per stratum

    pub fn features(&self, stratum: StratumId) -> PathBuf {
        self.stratum_file("features", stratum, "geojson")
    }

    pub fn training_polygons(&self, stratum: StratumId) -> PathBuf {
        self.stratum_file("training_polygons", stratum, "geojson")
    }

    pub fn validation_polygons(&self, stratum: StratumId) -> PathBuf {
        self.stratum_file("validation_polygons", stratum, "geojson")
    }

    /// Where a stratum's model and auxiliary outputs live, whether or not
    /// training has produced them yet.
    pub fn model_artifact(&self, stratum: StratumId, with_statistics: bool) -> ModelArtifact {
        ModelArtifact {
            stratum,
            model: self.stratum_file("model", stratum, "txt"),
            days: self.stratum_file("days", stratum, "txt"),
            statistics: with_statistics.then(|| self.stratum_file("statistics", stratum, "xml")),
            confusion_matrix: self.stratum_file("confusion-matrix-training", stratum, "csv"),
        }
    }

    pub fn stratum_metrics(&self, stratum: StratumId) -> StratumMetrics {
        StratumMetrics {
            stratum,
            confusion_matrix: self.stratum_file("confusion-matrix-validation", stratum, "csv"),
            quality_metrics: self.stratum_file("quality-metrics", stratum, "txt"),
            document: self.stratum_file("validation-metrics", stratum, "xml"),
        }
    }

    // per tile

    /// Per-pixel stratum id raster used to pick a model.
    pub fn model_mask(&self, tile: &TileId) -> PathBuf {
        self.tile_file("model-mask-", tile, "")
    }

    pub fn uncompressed_map(&self, tile: &TileId) -> PathBuf {
        self.tile_file("crop_type_map_", tile, "_uncompressed")
    }

    pub fn raw_map(&self, tile: &TileId) -> PathBuf {
        self.tile_file("crop_type_map_", tile, "")
    }

    pub fn masked_map(&self, tile: &TileId) -> PathBuf {
        self.tile_file("crop_type_map_masked_", tile, "")
    }

    pub fn quality_flags(&self, tile: &TileId) -> PathBuf {
        self.tile_file("status_flags_", tile, "")
    }

    pub fn classification_output(&self, tile: &Tile) -> ClassificationOutput {
        ClassificationOutput {
            tile: tile.id.clone(),
            raw_map: self.raw_map(&tile.id),
            masked_map: tile.crop_mask.as_ref().map(|_| self.masked_map(&tile.id)),
            quality_flags: self.quality_flags(&tile.id),
        }
    }

    // global

    pub fn global_validation_polygons(&self) -> PathBuf {
        self.path("validation_polygons_global.geojson")
    }

    pub fn global_metrics(&self) -> StratumMetrics {
        StratumMetrics {
            stratum: StratumId::new(0),
            confusion_matrix: self.path("confusion-matrix-validation-global.csv"),
            quality_metrics: self.path("quality-metrics-global.txt"),
            document: self.path("validation-metrics-global.xml"),
        }
    }

    /// Strata geometry restricted to the selected strata.
    pub fn filtered_strata(&self, source: &Path) -> PathBuf {
        let ext = source
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "shp".to_string());
        self.path(format!("filtered-strata.{ext}"))
    }

    pub fn qgis_color_map(&self) -> PathBuf {
        self.path("qgis-color-map.txt")
    }

    pub fn metadata(&self) -> PathBuf {
        self.path("metadata.json")
    }

    pub fn manifest(&self) -> PathBuf {
        self.path("product-manifest.json")
    }

    pub fn run_record(&self, run_id: Uuid) -> PathBuf {
        self.path(format!("run-{run_id}.json"))
    }
}

/// Intermediate files removed when the guard goes out of scope, whether the
/// unit succeeded or not, unless intermediates are kept.
pub(crate) struct ScratchFiles {
    paths: Vec<PathBuf>,
    keep: bool,
}

impl ScratchFiles {
    pub(crate) fn new(keep: bool) -> Self {
        Self {
            paths: Vec::new(),
            keep,
        }
    }

    pub(crate) fn track(&mut self, path: PathBuf) -> PathBuf {
        self.paths.push(path.clone());
        path
    }
}

impl Drop for ScratchFiles {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        for path in &self.paths {
            if std::fs::remove_file(path).is_ok() {
                debug!("Removed intermediate file {}", path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stratum_names_drop_suffix_in_single_mode() {
        let single = OutputLayout::new("/out", true);
        let multi = OutputLayout::new("/out", false);
        let id = StratumId::new(3);

        assert_eq!(single.model_artifact(id, false).model, PathBuf::from("/out/model.txt"));
        assert_eq!(multi.model_artifact(id, false).model, PathBuf::from("/out/model-3.txt"));
        assert_eq!(
            multi.stratum_metrics(id).document,
            PathBuf::from("/out/validation-metrics-3.xml")
        );
        assert_eq!(
            single.training_polygons(id),
            PathBuf::from("/out/training_polygons.geojson")
        );
    }

    #[test]
    fn test_statistics_only_for_margin_classifiers() {
        let layout = OutputLayout::new("/out", false);
        let id = StratumId::new(1);
        assert!(layout.model_artifact(id, false).statistics.is_none());
        assert_eq!(
            layout.model_artifact(id, true).statistics,
            Some(PathBuf::from("/out/statistics-1.xml"))
        );
    }

    #[test]
    fn test_tile_names() {
        let layout = OutputLayout::new("/out", true);
        let tile = TileId::new("31TCJ");
        assert_eq!(layout.raw_map(&tile), PathBuf::from("/out/crop_type_map_31TCJ.tif"));
        assert_eq!(
            layout.uncompressed_map(&tile),
            PathBuf::from("/out/crop_type_map_31TCJ_uncompressed.tif")
        );
        assert_eq!(
            layout.masked_map(&tile),
            PathBuf::from("/out/crop_type_map_masked_31TCJ.tif")
        );
        assert_eq!(layout.quality_flags(&tile), PathBuf::from("/out/status_flags_31TCJ.tif"));
        assert_eq!(layout.model_mask(&tile), PathBuf::from("/out/model-mask-31TCJ.tif"));
    }

    #[test]
    fn test_filtered_strata_keeps_extension() {
        let layout = OutputLayout::new("/out", false);
        assert_eq!(
            layout.filtered_strata(Path::new("/in/strata.shp")),
            PathBuf::from("/out/filtered-strata.shp")
        );
        assert_eq!(
            layout.filtered_strata(Path::new("/in/strata.geojson")),
            PathBuf::from("/out/filtered-strata.geojson")
        );
    }

    #[test]
    fn test_scratch_files_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uncompressed.tif");
        std::fs::write(&path, b"x").unwrap();
        {
            let mut scratch = ScratchFiles::new(false);
            scratch.track(path.clone());
        }
        assert!(!path.exists());

        std::fs::write(&path, b"x").unwrap();
        {
            let mut scratch = ScratchFiles::new(true);
            scratch.track(path.clone());
        }
        assert!(path.exists());
    }
}
