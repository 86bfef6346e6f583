//! Final product description.
//!
//! The metadata document describes what went into the product (inputs,
//! masks and the parameters the classifier ran with); the manifest adds
//! every artifact path the product formatter packages. Both depend only on
//! the run inputs. Per-invocation facts go to the separate [`RunRecord`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::{ClassifierConfig, RunConfig};
use crate::core::step::StepArgs;
use crate::error::{PipelineError, PipelineResult};
use crate::orchestrator::Stage;
use crate::model::{ClassificationOutput, Sensor, StudyArea, ValidationMetrics, file_stem};
use crate::types::{SiteId, StratumId, TileId};

pub const PRODUCT_TYPE: &str = "Crop Type";
pub const PRODUCT_LEVEL: &str = "L4B";
const FILE_CLASS: &str = "SVT1";
const BASELINE: &str = "01.00";
const PROCESSOR: &str = "croptype";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductMetadata {
    pub product_type: String,
    pub level: String,
    pub site_id: SiteId,
    pub reference_polygons: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strata: Option<String>,
    pub tiles: Vec<TileMetadata>,
    pub parameters: Parameters,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TileMetadata {
    pub id: TileId,
    /// Descriptor names, without directory or extension.
    pub inputs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parameters {
    pub main_mission: Sensor,
    pub pixel_size: u32,
    pub sample_ratio: f64,
    pub seed: u64,
    pub include_red_edge: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lut: Option<String>,
    pub classifier: ClassifierParameters,
}

/// The variant that ran, with only its own hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifierParameters {
    pub training_samples_per_tile: u32,
    #[serde(flatten)]
    pub settings: ClassifierConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TileArtifacts {
    pub id: TileId,
    /// Masked map when the tile has a crop mask, raw map otherwise.
    pub map: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_map: Option<PathBuf>,
    pub quality_flags: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StratumQuality {
    pub stratum: StratumId,
    pub document: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityDocuments {
    /// Whether the documents are per region (multi-stratum mode).
    pub stratified: bool,
    pub global: PathBuf,
    pub strata: Vec<StratumQuality>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductManifest {
    pub metadata: ProductMetadata,
    /// Tiles in study-area insertion order.
    pub tiles: Vec<TileArtifacts>,
    pub quality: QualityDocuments,
}

/// Paths the product formatter needs besides the manifest contents.
#[derive(Debug, Clone, Copy)]
pub struct FormatterInputs<'a> {
    pub target_folder: &'a Path,
    pub metadata: &'a Path,
    pub in_situ_data: &'a Path,
    /// Display LUT and its QGIS rendition.
    pub lut: Option<(&'a Path, &'a Path)>,
    pub out_props: Option<&'a Path>,
    pub inputs: &'a [PathBuf],
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl ProductMetadata {
    /// `lut` is the display LUT actually applied, if any.
    pub fn build(config: &RunConfig, area: &StudyArea, lut: Option<&Path>) -> Self {
        let tiles = area
            .tiles
            .iter()
            .map(|tile| TileMetadata {
                id: tile.id.clone(),
                inputs: tile.descriptors.iter().map(|d| d.name()).collect(),
                mask: tile.crop_mask.as_deref().map(file_stem),
            })
            .collect();

        Self {
            product_type: PRODUCT_TYPE.to_string(),
            level: PRODUCT_LEVEL.to_string(),
            site_id: config.site_id.clone(),
            reference_polygons: base_name(&config.reference_polygons),
            strata: area.strata_shapefile.as_deref().map(base_name),
            tiles,
            parameters: Parameters {
                main_mission: area.main_sensor,
                pixel_size: config.pixel_size,
                sample_ratio: config.ratio,
                seed: config.seed,
                include_red_edge: config.red_edge,
                lut: lut.map(base_name),
                classifier: ClassifierParameters {
                    training_samples_per_tile: config.training_samples,
                    settings: config.classifier.clone(),
                },
            },
        }
    }
}

impl ProductManifest {
    /// Assemble the manifest. `outputs` must be in tile insertion order.
    pub fn build(
        config: &RunConfig,
        area: &StudyArea,
        outputs: &[ClassificationOutput],
        metrics: &ValidationMetrics,
        lut: Option<&Path>,
    ) -> Self {
        let keep_raw = config.include_raw_map && area.has_any_mask();

        let tiles = outputs
            .iter()
            .map(|out| TileArtifacts {
                id: out.tile.clone(),
                map: out.final_map().to_path_buf(),
                raw_map: (keep_raw && out.masked_map.is_some()).then(|| out.raw_map.clone()),
                quality_flags: out.quality_flags.clone(),
            })
            .collect();

        Self {
            metadata: ProductMetadata::build(config, area, lut),
            tiles,
            quality: QualityDocuments {
                stratified: !area.single_stratum(),
                global: metrics.global.clone(),
                strata: metrics
                    .strata
                    .iter()
                    .map(|m| StratumQuality {
                        stratum: m.stratum,
                        document: m.document.clone(),
                    })
                    .collect(),
            },
        }
    }

    /// Argument list for the product formatter application.
    pub fn formatter_args(&self, inputs: &FormatterInputs<'_>) -> StepArgs {
        let mut args = StepArgs::new()
            .flag("-destroot", inputs.target_folder)
            .flag("-fileclass", FILE_CLASS)
            .flag("-level", PRODUCT_LEVEL)
            .flag("-baseline", BASELINE)
            .flag("-siteid", self.metadata.site_id.as_str())
            .flag("-gipp", inputs.metadata)
            .flag("-isd", inputs.in_situ_data)
            .flag("-processor", PROCESSOR);

        if let Some((lut, qgis)) = inputs.lut {
            args = args.flag("-lut", lut).flag("-lutqgis", qgis);
        }
        if let Some(props) = inputs.out_props {
            args = args.flag("-outprops", props);
        }

        args = args.value("-processor.croptype.file");
        for tile in &self.tiles {
            args = args.value(format!("TILE_{}", tile.id)).value(&tile.map);
        }

        if self.tiles.iter().any(|t| t.raw_map.is_some()) {
            args = args.value("-processor.croptype.rawfile");
            for tile in &self.tiles {
                if let Some(raw) = &tile.raw_map {
                    args = args.value(format!("TILE_{}", tile.id)).value(raw);
                }
            }
        }

        args = args.value("-processor.croptype.flags");
        for tile in &self.tiles {
            args = args
                .value(format!("TILE_{}", tile.id))
                .value(&tile.quality_flags);
        }

        args = args.value("-processor.croptype.quality");
        if self.quality.stratified {
            args = args.value(&self.quality.global);
        }
        for stratum in &self.quality.strata {
            if self.quality.stratified {
                args = args.value(format!("REGION_{}", stratum.stratum));
            }
            args = args.value(&stratum.document);
        }

        args.flag_list("-il", inputs.inputs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub seconds: f64,
}

/// What one invocation did: its id, when it ran and how long each stage
/// took.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageTiming>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunRecord {
    pub fn start(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            finished_at: None,
            stages: Vec::new(),
            error: None,
        }
    }

    pub fn stage_finished(&mut self, stage: Stage, seconds: f64) {
        self.stages.push(StageTiming { stage, seconds });
    }

    pub fn finish<T>(&mut self, result: &PipelineResult<T>) {
        self.finished_at = Some(Utc::now());
        self.error = result.as_ref().err().map(|e| e.to_string());
    }
}

/// Write a document as pretty-printed JSON.
pub fn save_json<T: Serialize>(value: &T, path: &Path) -> PipelineResult<()> {
    let body = serde_json::to_string_pretty(value)?;
    fs::write(path, body).map_err(|e| PipelineError::io(path, e))
}
