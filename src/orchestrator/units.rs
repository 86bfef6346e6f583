// Step sequences run for one unit (a stratum or a tile) of a stage

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::layout::{OutputLayout, ScratchFiles};
use crate::config::{ClassifierConfig, RunConfig};
use crate::core::executor::StepExecutor;
use crate::core::step::{Arg, Step, StepArgs, compressed_output};
use crate::error::{PipelineError, PipelineResult};
use crate::model::{ClassificationOutput, ModelArtifact, Stratum, StratumMetrics, StudyArea, Tile};
use crate::stratify::{self, PolygonSet};

/// No-data value of the crop type maps.
pub const NO_DATA: i64 = -10000;

const COMPRESSION: &str = "DEFLATE";

/// Read-only state shared by every unit of a stage.
pub(crate) struct StageContext {
    pub config: Arc<RunConfig>,
    pub executor: StepExecutor,
    pub layout: OutputLayout,
    pub area: StudyArea,
    /// Thread hint for multi-threaded steps.
    pub threads: Option<usize>,
}

impl StageContext {
    fn application(&self, name: impl Into<String>, app: &str) -> Step {
        Step::application(name, app, self.config.application_path.as_deref())
    }

    fn single_stratum(&self) -> bool {
        self.area.single_stratum()
    }

    /// Split features, select samples and train the stratum's classifier.
    ///
    /// Returns `None` when the stratum has nothing to train on.
    pub async fn train_stratum(
        &self,
        polygons: &PolygonSet,
        stratum: &Stratum,
    ) -> PipelineResult<Option<ModelArtifact>> {
        let id = stratum.id;
        let tiles: Vec<&Tile> = self.area.stratum_tiles(stratum).collect();
        if tiles.is_empty() {
            warn!("train: stratum {} has no tiles, skipping", id);
            return Ok(None);
        }

        let features = stratify::split_features(polygons, stratum, self.single_stratum());
        if features.is_empty() {
            warn!("train: stratum {} has no reference polygons, skipping", id);
            return Ok(None);
        }
        features.save(&self.layout.features(id))?;

        let split = stratify::select_samples(&features, self.config.ratio, self.config.seed);
        stratify::log_split(id, &split);
        let training_polygons = self.layout.training_polygons(id);
        split.training.save(&training_polygons)?;
        split.validation.save(&self.layout.validation_polygons(id))?;

        let config = &self.config;
        let artifact = self
            .layout
            .model_artifact(id, config.classifier.needs_statistics());

        let sampling_rates: Vec<Arg> = config
            .sampling_rates
            .iter()
            .flat_map(|rate| [Arg::from(rate.sensor.as_str()), Arg::from(rate.days)])
            .collect();

        let mut args = StepArgs::new()
            .flag("-mission", self.area.main_sensor.mission_name())
            .flag("-nodatalabel", NO_DATA)
            .flag("-pixsize", config.pixel_size)
            .flag("-outdays", &artifact.days)
            .flag("-mode", config.resampling.as_str())
            .flag("-io.vd", &training_polygons)
            .flag("-rand", config.seed)
            .flag("-sample.bm", 0i64)
            .flag("-io.confmatout", &artifact.confusion_matrix)
            .flag("-io.out", &artifact.model)
            .flag("-sample.mt", config.training_samples)
            .flag("-sample.mv", 10i64)
            .flag("-sample.vfn", "CODE")
            .flag("-sample.vtr", 0.01)
            .flag("-classifier", config.classifier.name())
            .flag_if(config.red_edge, "-rededge", true)
            .flag_list("-sp", sampling_rates)
            .flag_list("-prodpertile", tiles.iter().map(|t| t.descriptors.len()))
            .flag_list("-il", tiles.iter().flat_map(|t| t.descriptor_paths()));

        match &config.classifier {
            ClassifierConfig::Rf {
                nb_trees,
                max_depth,
                min_samples,
            } => {
                args = args
                    .flag("-classifier.rf.nbtrees", *nb_trees)
                    .flag("-classifier.rf.min", *min_samples)
                    .flag("-classifier.rf.max", *max_depth);
            }
            ClassifierConfig::Svm => {
                args = args
                    .flag("-classifier.svm.k", "rbf")
                    .flag("-classifier.svm.opt", 1i64);
                if let Some(statistics) = &artifact.statistics {
                    args = args.flag("-imstat", statistics);
                }
            }
        }

        let mut step = self
            .application(format!("TrainImagesClassifier_{id}"), "CropTypeTrainImagesClassifier")
            .args(args)
            .output(&artifact.model)
            .output(&artifact.days)
            .output(&artifact.confusion_matrix)
            .threads(self.threads);
        if let Some(statistics) = &artifact.statistics {
            step = step.output(statistics);
        }

        self.executor.execute(&step).await?;
        Ok(Some(artifact))
    }

    /// Models available for a tile: one per member stratum whose training
    /// has completed.
    pub fn tile_models(&self, tile: &Tile) -> Vec<ModelArtifact> {
        let with_statistics = self.config.classifier.needs_statistics();
        tile.strata
            .iter()
            .map(|id| self.layout.model_artifact(*id, with_statistics))
            .filter(|artifact| {
                let exists = artifact.model.is_file();
                if !exists {
                    warn!(
                        "classify: no model for stratum {} (tile {})",
                        artifact.stratum, tile.id
                    );
                }
                exists
            })
            .collect()
    }

    /// Classify one tile with the models of its strata.
    ///
    /// A tile without any model is skipped, not failed.
    pub async fn classify_tile(
        &self,
        tile: &Tile,
        strata_geometry: Option<&Path>,
    ) -> PipelineResult<Option<ClassificationOutput>> {
        let models = self.tile_models(tile);
        if models.is_empty() {
            warn!(
                "classify: skipping tile {}, no stratum model applies to it",
                tile.id
            );
            return Ok(None);
        }

        let mut scratch = ScratchFiles::new(self.config.keep_files);
        let config = &self.config;

        let model_mask = match (self.single_stratum(), strata_geometry) {
            (true, _) => None,
            (false, None) => {
                return Err(PipelineError::config(format!(
                    "no strata geometry to rasterize the model mask of tile {}",
                    tile.id
                )));
            }
            (false, Some(geometry)) => {
                let mask = scratch.track(self.layout.model_mask(&tile.id));
                let step = self
                    .application(format!("RasterizeModelMask_{}", tile.id), "Rasterization")
                    .args(
                        StepArgs::new()
                            .flag("-progress", false)
                            .flag("-mode", "attribute")
                            .flag("-mode.attribute.field", "ID")
                            .flag("-in", geometry)
                            .flag("-im", &tile.reference_raster)
                            .flag_list("-out", [compressed_output(&mask, COMPRESSION), Arg::from("uint8")]),
                    )
                    .output(&mask)
                    .threads(self.threads);
                self.executor.execute(&step).await?;
                Some(mask)
            }
        };

        let uncompressed = scratch.track(self.layout.uncompressed_map(&tile.id));
        let mut args = StepArgs::new()
            .flag("-progress", false)
            .flag("-mission", self.area.main_sensor.mission_name())
            .flag("-pixsize", config.pixel_size)
            .flag("-bv", NO_DATA)
            .flag("-nodatalabel", NO_DATA)
            .flag("-out", &uncompressed)
            .flag_list("-indays", models.iter().map(|m| &m.days))
            .flag_if(config.red_edge, "-rededge", true)
            .flag_list("-model", models.iter().map(|m| &m.model))
            .flag_list("-il", tile.descriptor_paths());
        if config.classifier.needs_statistics() {
            args = args.flag_list("-imstat", models.iter().filter_map(|m| m.statistics.as_ref()));
        }
        if let Some(mask) = &model_mask {
            args = args
                .flag("-mask", mask)
                .flag_list("-modelid", models.iter().map(|m| m.stratum.get()));
        }

        let step = self
            .application(format!("ImageClassifier_{}", tile.id), "CropTypeImageClassifier")
            .args(args)
            .output(&uncompressed)
            .threads(self.threads)
            .retryable();
        self.executor.execute(&step).await?;

        let output = self.layout.classification_output(tile);
        let step = Step::new(format!("Compression_{}", tile.id), "gdal_translate")
            .args(
                StepArgs::new()
                    .flag("-of", "GTiff")
                    .flag("-co", format!("COMPRESS={COMPRESSION}"))
                    .flag("-ot", "Int16")
                    .value(&uncompressed)
                    .value(&output.raw_map),
            )
            .output(&output.raw_map);
        self.executor.execute(&step).await?;

        info!("classify: tile {} done", tile.id);
        Ok(Some(output))
    }

    /// Apply the crop mask to a tile's map. Returns the masked map, or
    /// `None` for unmasked tiles.
    pub async fn postprocess_tile(&self, tile: &Tile) -> PipelineResult<Option<PathBuf>> {
        let Some(crop_mask) = &tile.crop_mask else {
            debug!("postprocess-tiles: tile {} has no crop mask", tile.id);
            return Ok(None);
        };

        let raw = self.layout.raw_map(&tile.id);
        let masked = self.layout.masked_map(&tile.id);

        let step = self
            .application(format!("MaskByCropMask_{}", tile.id), "BandMath")
            .args(
                StepArgs::new()
                    .flag("-progress", false)
                    .flag("-exp", "im2b1 == 0 ? 0 : im1b1")
                    .flag_list("-il", [&raw, crop_mask])
                    .flag_list("-out", [compressed_output(&masked, COMPRESSION), Arg::from("int16")]),
            )
            .output(&masked)
            .threads(None);
        self.executor.execute(&step).await?;

        let step = Step::new(format!("Nodata_{}", tile.id), "gdal_edit.py")
            .args(StepArgs::new().flag("-a_nodata", NO_DATA).value(&masked))
            .output(&masked);
        self.executor.execute(&step).await?;

        Ok(Some(masked))
    }

    pub async fn extract_quality_flags(&self, tile: &Tile) -> PipelineResult<PathBuf> {
        let flags = self.layout.quality_flags(&tile.id);
        let step = self
            .application(format!("QualityFlags_{}", tile.id), "QualityFlagsExtractor")
            .args(
                StepArgs::new()
                    .flag("-progress", false)
                    .flag("-mission", self.area.main_sensor.mission_name())
                    .flag("-pixsize", self.config.pixel_size)
                    .flag_list("-out", [compressed_output(&flags, COMPRESSION), Arg::from("uint8")])
                    .flag_list("-il", tile.descriptor_paths()),
            )
            .output(&flags)
            .threads(self.threads);
        self.executor.execute(&step).await?;
        Ok(flags)
    }

    /// Final maps of the tiles that were classified, in the given order.
    pub fn final_maps<'a>(&self, tiles: impl IntoIterator<Item = &'a Tile>) -> Vec<PathBuf> {
        tiles
            .into_iter()
            .filter(|tile| !tile.strata.is_empty())
            .filter_map(|tile| {
                let map = self.layout.classification_output(tile).final_map().to_path_buf();
                if map.is_file() {
                    Some(map)
                } else {
                    warn!("validate: no map for tile {}, leaving it out", tile.id);
                    None
                }
            })
            .collect()
    }

    /// Confusion matrix plus derived quality documents for one set of
    /// validation polygons against a set of maps.
    pub async fn compute_metrics(
        &self,
        label: &str,
        validation_polygons: &Path,
        maps: Vec<PathBuf>,
        metrics: &StratumMetrics,
    ) -> PipelineResult<()> {
        let step = self
            .application(format!("ComputeConfusionMatrix_{label}"), "ComputeConfusionMatrixMulti")
            .args(
                StepArgs::new()
                    .flag("-ref", "vector")
                    .flag("-ref.vector.in", validation_polygons)
                    .flag("-ref.vector.field", "CODE")
                    .flag("-out", &metrics.confusion_matrix)
                    .flag("-nodatalabel", NO_DATA)
                    .flag_list("-il", maps),
            )
            .capture_stdout(&metrics.quality_metrics)
            .output(&metrics.confusion_matrix)
            .threads(self.threads);
        self.executor.execute(&step).await?;

        let step = self
            .application(format!("XMLStatistics_{label}"), "XMLStatistics")
            .args(
                StepArgs::new()
                    .flag("-root", "CropType")
                    .flag("-confmat", &metrics.confusion_matrix)
                    .flag("-quality", &metrics.quality_metrics)
                    .flag("-out", &metrics.document),
            )
            .output(&metrics.document);
        self.executor.execute(&step).await?;
        Ok(())
    }

    /// Validate one stratum against the maps of its tiles.
    ///
    /// Returns `None` when the stratum was never trained.
    pub async fn validate_stratum(&self, stratum: &Stratum) -> PipelineResult<Option<StratumMetrics>> {
        let validation_polygons = self.layout.validation_polygons(stratum.id);
        if !validation_polygons.is_file() {
            warn!(
                "validate: stratum {} has no validation polygons, skipping",
                stratum.id
            );
            return Ok(None);
        }

        let maps = self.final_maps(self.area.stratum_tiles(stratum));
        if maps.is_empty() {
            warn!("validate: stratum {} has no classified tiles, skipping", stratum.id);
            return Ok(None);
        }

        let metrics = self.layout.stratum_metrics(stratum.id);
        self.compute_metrics(&stratum.id.to_string(), &validation_polygons, maps, &metrics)
            .await?;
        Ok(Some(metrics))
    }
}
