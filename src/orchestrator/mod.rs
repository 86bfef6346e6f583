//! Stage orchestration.
//!
//! One invocation runs one stage, or all seven in order when none is
//! selected. A stage reads the study area and the artifacts earlier stages
//! left in the output directory, fans out over strata or tiles through the
//! scheduler and returns what it produced. Stages never resume a previous
//! run on their own; each can be re-invoked on unchanged inputs.

mod layout;
mod units;


pub use layout::OutputLayout;
pub use units::NO_DATA;

use std::fmt;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{self, DescriptorReader, NamingConventionReader};
use crate::config::{RunConfig, StrataLayout};
use crate::core::executor::{ProcessRunner, StepExecutor, StepRunner};
use crate::core::scheduler::Scheduler;
use crate::core::step::{Step, StepArgs};
use crate::error::{PipelineError, PipelineResult};
use crate::lut;
use crate::manifest::{FormatterInputs, ProductManifest, RunRecord, save_json};
use crate::masks::{self, MaskResolver};
use crate::model::{ClassificationOutput, ModelArtifact, StratumMetrics, StudyArea, Tile, ValidationMetrics};
use crate::stratify::{self, PolygonSet};
use units::StageContext;

/// The named stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    PrepareSite,
    PrepareTiles,
    Train,
    Classify,
    PostprocessTiles,
    ComputeQualityFlags,
    Validate,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::PrepareSite,
        Stage::PrepareTiles,
        Stage::Train,
        Stage::Classify,
        Stage::PostprocessTiles,
        Stage::ComputeQualityFlags,
        Stage::Validate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::PrepareSite => "prepare-site",
            Stage::PrepareTiles => "prepare-tiles",
            Stage::Train => "train",
            Stage::Classify => "classify",
            Stage::PostprocessTiles => "postprocess-tiles",
            Stage::ComputeQualityFlags => "compute-quality-flags",
            Stage::Validate => "validate",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| PipelineError::config(format!("unknown stage `{s}`")))
    }
}

/// Drives the stages over one study area.
pub struct Orchestrator {
    config: Arc<RunConfig>,
    executor: StepExecutor,
    scheduler: Scheduler,
    layout: OutputLayout,
    area: StudyArea,
    masks: Box<dyn MaskResolver>,
    tiles_prepared: bool,
    run_id: Uuid,
}

impl Orchestrator {
    /// Load the study area using the product naming conventions and real
    /// processes for every step.
    pub fn load(config: RunConfig) -> PipelineResult<Self> {
        Self::with_collaborators(config, &NamingConventionReader, Arc::new(ProcessRunner))
    }

    /// Load the study area with explicit collaborators.
    ///
    /// Every configuration error surfaces here, before any stage runs.
    pub fn with_collaborators(
        config: RunConfig,
        reader: &dyn DescriptorReader,
        runner: Arc<dyn StepRunner>,
    ) -> PipelineResult<Self> {
        config.validate()?;

        let (mut tiles, main_sensor) = catalog::load_tiles(reader, &config.inputs)?;
        let masks = masks::resolver_for(&config.mask, tiles.len())?;

        let strata_layout = config
            .strata
            .as_deref()
            .map(StrataLayout::load)
            .transpose()?;
        let strata = stratify::build_strata(
            &mut tiles,
            strata_layout.as_ref(),
            config.stratum_filter.as_deref(),
        );

        let area = StudyArea {
            tiles,
            strata,
            main_sensor,
            strata_shapefile: strata_layout.map(|layout| layout.shapefile),
        };

        info!(
            "Loaded {} tile(s) and {} stratum/strata, main sensor {}",
            area.tiles.len(),
            area.strata.len(),
            area.main_sensor
        );

        let executor = StepExecutor::new(runner, config.retry, config.keep_files);
        let scheduler = Scheduler::new(config.max_parallelism, config.tile_threads_hint);
        let layout = OutputLayout::new(&config.out_dir, area.single_stratum());

        Ok(Self {
            config: Arc::new(config),
            executor,
            scheduler,
            layout,
            area,
            masks,
            tiles_prepared: false,
            run_id: Uuid::new_v4(),
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn area(&self) -> &StudyArea {
        &self.area
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Run one stage, or every stage in order when `stage` is `None`.
    ///
    /// The first fatal failure aborts the run; later stages are not started.
    pub async fn run(&mut self, stage: Option<Stage>) -> PipelineResult<()> {
        let out_dir = self.layout.out_dir().to_path_buf();
        tokio::fs::create_dir_all(&out_dir)
            .await
            .map_err(|e| PipelineError::io(&out_dir, e))?;

        let stages = match stage {
            Some(stage) => vec![stage],
            None => Stage::ALL.to_vec(),
        };
        info!("Run {} starting", self.run_id);

        let mut record = RunRecord::start(self.run_id);
        let result = self.run_stages(&stages, &mut record).await;
        record.finish(&result);

        let path = self.layout.run_record(self.run_id);
        if let Err(err) = save_json(&record, &path) {
            warn!("Could not write run record {}: {}", path.display(), err);
        }
        result
    }

    async fn run_stages(&mut self, stages: &[Stage], record: &mut RunRecord) -> PipelineResult<()> {
        for &stage in stages {
            let start = Instant::now();
            info!("Starting stage {}", stage);

            if stage != Stage::PrepareSite && stage != Stage::PrepareTiles && !self.tiles_prepared {
                self.prepare_tiles();
            }

            match stage {
                Stage::PrepareSite => {
                    self.prepare_site()?;
                }
                Stage::PrepareTiles => {
                    self.prepare_tiles();
                }
                Stage::Train => {
                    let models = self.train().await?;
                    info!("Trained {} model(s)", models.len());
                }
                Stage::Classify => {
                    let outputs = self.classify().await?;
                    info!("Classified {} tile(s)", outputs.len());
                }
                Stage::PostprocessTiles => {
                    let masked = self.postprocess_tiles().await?;
                    info!("Masked {} tile map(s)", masked.len());
                }
                Stage::ComputeQualityFlags => {
                    self.compute_quality_flags().await?;
                }
                Stage::Validate => {
                    let manifest = self.validate().await?;
                    info!(
                        "Product manifest lists {} tile(s)",
                        manifest.tiles.len()
                    );
                }
            }

            let seconds = start.elapsed().as_secs_f64();
            info!("Stage {} finished in {:.1}s", stage, seconds);
            record.stage_finished(stage, seconds);
        }

        Ok(())
    }

    fn stage_context(&self, threads: Option<usize>) -> Arc<StageContext> {
        Arc::new(StageContext {
            config: self.config.clone(),
            executor: self.executor.clone(),
            layout: self.layout.clone(),
            area: self.area.clone(),
            threads,
        })
    }

    /// Tiles the per-tile stages fan out over, in insertion order.
    fn selected_tiles(&self) -> Vec<Tile> {
        self.area
            .tiles
            .iter()
            .filter(|tile| {
                let selected = self.config.tile_selected(&tile.id);
                if !selected {
                    debug!("Tile {} is excluded by the tile filter", tile.id);
                }
                selected
            })
            .cloned()
            .collect()
    }

    /// Build the QGIS color map for the crop codes of the reference
    /// polygons. A missing or unreadable LUT only disables the mapping.
    pub fn prepare_site(&self) -> PipelineResult<Option<PathBuf>> {
        let Some(lut_path) = self.config.lut.as_deref() else {
            info!("prepare-site: no LUT, no display mapping will be applied");
            return Ok(None);
        };

        let entries = match lut::read_lut(lut_path) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("prepare-site: {}, no display mapping will be applied", err);
                let stale = self.layout.qgis_color_map();
                if stale.is_file() {
                    std::fs::remove_file(&stale).map_err(|e| PipelineError::io(&stale, e))?;
                }
                return Ok(None);
            }
        };

        let polygons = PolygonSet::load(&self.config.reference_polygons)?;
        let entries = lut::restrict_to_codes(entries, &polygons.codes());
        let path = self.layout.qgis_color_map();
        lut::save_qgis_color_map(&entries, &path)?;
        info!(
            "prepare-site: wrote {} color(s) to {}",
            entries.len(),
            path.display()
        );
        Ok(Some(path))
    }

    /// Resolve the crop mask of every tile. Returns the number of masked tiles.
    pub fn prepare_tiles(&mut self) -> usize {
        masks::assign_masks(&mut self.area.tiles, self.masks.as_ref());
        self.tiles_prepared = true;

        let masked = self
            .area
            .tiles
            .iter()
            .filter(|t| t.crop_mask.is_some())
            .count();
        info!(
            "prepare-tiles: {} of {} tile(s) have a crop mask",
            masked,
            self.area.tiles.len()
        );
        masked
    }

    /// Train one classifier per selected stratum.
    pub async fn train(&self) -> PipelineResult<Vec<ModelArtifact>> {
        let polygons = Arc::new(PolygonSet::load(&self.config.reference_polygons)?);
        let ctx = self.stage_context(self.scheduler.unit_threads());

        let artifacts = self
            .scheduler
            .run_all(Stage::Train.as_str(), self.area.strata.clone(), move |stratum| {
                let ctx = ctx.clone();
                let polygons = polygons.clone();
                async move {
                    let id = stratum.id;
                    ctx.train_stratum(&polygons, &stratum)
                        .await
                        .map_err(|e| e.in_unit(Stage::Train.as_str(), format!("stratum {id}")))
                }
            })
            .await?;

        Ok(artifacts.into_iter().flatten().collect())
    }

    /// Strata geometry the model masks are rasterized from, restricted to
    /// the selected strata when a stratum filter is set.
    async fn strata_geometry(&self) -> PipelineResult<Option<PathBuf>> {
        let Some(shapefile) = &self.area.strata_shapefile else {
            return Ok(None);
        };
        if self.config.stratum_filter.is_none() || self.area.strata.is_empty() {
            return Ok(Some(shapefile.clone()));
        }

        let ids = self
            .area
            .strata
            .iter()
            .map(|s| s.id.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let filtered = self.layout.filtered_strata(shapefile);

        let step = Step::new("FilterStrata", "ogr2ogr")
            .args(
                StepArgs::new()
                    .value("-overwrite")
                    .flag("-where", format!("ID IN ({ids})"))
                    .value(&filtered)
                    .value(shapefile),
            )
            .output(&filtered);
        self.executor
            .execute(&step)
            .await
            .map_err(|e| e.in_unit(Stage::Classify.as_str(), "strata filter"))?;

        Ok(Some(filtered))
    }

    /// Classify every selected tile with the models of its strata.
    pub async fn classify(&self) -> PipelineResult<Vec<ClassificationOutput>> {
        let geometry = self.strata_geometry().await?;
        let ctx = self.stage_context(self.scheduler.unit_threads());

        let outputs = self
            .scheduler
            .run_all(Stage::Classify.as_str(), self.selected_tiles(), move |tile| {
                let ctx = ctx.clone();
                let geometry = geometry.clone();
                async move {
                    ctx.classify_tile(&tile, geometry.as_deref())
                        .await
                        .map_err(|e| e.in_unit(Stage::Classify.as_str(), format!("tile {}", tile.id)))
                }
            })
            .await?;

        Ok(outputs.into_iter().flatten().collect())
    }

    /// Apply crop masks to the maps of the masked tiles.
    pub async fn postprocess_tiles(&self) -> PipelineResult<Vec<PathBuf>> {
        // masking does not benefit from internal threading
        let ctx = self.stage_context(None);

        let tiles: Vec<Tile> = self
            .selected_tiles()
            .into_iter()
            .filter(|tile| {
                if tile.crop_mask.is_none() {
                    return false;
                }
                // no strata, or no model for any of them
                if !self.layout.raw_map(&tile.id).is_file() {
                    warn!(
                        "postprocess-tiles: tile {} was not classified, skipping",
                        tile.id
                    );
                    return false;
                }
                true
            })
            .collect();

        let masked = self
            .scheduler
            .run_all(Stage::PostprocessTiles.as_str(), tiles, move |tile| {
                let ctx = ctx.clone();
                async move {
                    ctx.postprocess_tile(&tile)
                        .await
                        .map_err(|e| e.in_unit(Stage::PostprocessTiles.as_str(), format!("tile {}", tile.id)))
                }
            })
            .await?;

        Ok(masked.into_iter().flatten().collect())
    }

    /// Extract the status flags of every selected tile.
    pub async fn compute_quality_flags(&self) -> PipelineResult<Vec<PathBuf>> {
        if self.config.skip_quality_flags {
            info!("compute-quality-flags: skipped");
            return Ok(Vec::new());
        }

        let ctx = self.stage_context(self.scheduler.unit_threads());
        self.scheduler
            .run_all(Stage::ComputeQualityFlags.as_str(), self.selected_tiles(), move |tile| {
                let ctx = ctx.clone();
                async move {
                    ctx.extract_quality_flags(&tile).await.map_err(|e| {
                        e.in_unit(Stage::ComputeQualityFlags.as_str(), format!("tile {}", tile.id))
                    })
                }
            })
            .await
    }

    /// Compute per-stratum and global metrics, then write and format the
    /// product.
    pub async fn validate(&self) -> PipelineResult<ProductManifest> {
        let ctx = self.stage_context(self.scheduler.unit_threads());

        let per_stratum = {
            let ctx = ctx.clone();
            self.scheduler
                .run_all(Stage::Validate.as_str(), self.area.strata.clone(), move |stratum| {
                    let ctx = ctx.clone();
                    async move {
                        let id = stratum.id;
                        ctx.validate_stratum(&stratum)
                            .await
                            .map_err(|e| e.in_unit(Stage::Validate.as_str(), format!("stratum {id}")))
                    }
                })
                .await?
        };
        let strata: Vec<StratumMetrics> = per_stratum.into_iter().flatten().collect();

        let global = self
            .global_metrics(&ctx, &strata)
            .await
            .map_err(|e| e.in_unit(Stage::Validate.as_str(), "global metrics"))?;
        let metrics = ValidationMetrics { strata, global };

        let outputs: Vec<ClassificationOutput> = self
            .area
            .tiles
            .iter()
            .map(|tile| self.layout.classification_output(tile))
            .collect();
        // a LUT that never became a color map is not applied
        let qgis = self.layout.qgis_color_map();
        let lut = self.config.lut.as_deref().filter(|_| qgis.is_file());
        if self.config.lut.is_some() && lut.is_none() {
            warn!("validate: no color map at {}, the product has no display mapping", qgis.display());
        }

        let manifest = ProductManifest::build(&self.config, &self.area, &outputs, &metrics, lut);

        save_json(&manifest.metadata, &self.layout.metadata())?;
        save_json(&manifest, &self.layout.manifest())?;
        self.format_product(&manifest, lut.map(|lut| (lut, qgis.as_path())))
            .await?;

        Ok(manifest)
    }

    /// The global metrics document. With a single stratum it is that
    /// stratum's document (copied to the global name in multi-stratum mode).
    async fn global_metrics(&self, ctx: &StageContext, strata: &[StratumMetrics]) -> PipelineResult<PathBuf> {
        let Some(first) = strata.first() else {
            return Err(PipelineError::invalid_input(
                &self.config.reference_polygons,
                "no stratum could be validated",
            ));
        };

        if self.area.single_stratum() {
            return Ok(first.document.clone());
        }

        let global = self.layout.global_metrics();
        if strata.len() == 1 {
            tokio::fs::copy(&first.document, &global.document)
                .await
                .map_err(|e| PipelineError::io(&global.document, e))?;
            return Ok(global.document);
        }

        let sets = strata
            .iter()
            .map(|m| PolygonSet::load(&self.layout.validation_polygons(m.stratum)))
            .collect::<PipelineResult<Vec<_>>>()?;
        let global_polygons = self.layout.global_validation_polygons();
        let concatenated = stratify::concatenate(&sets)
            .ok_or_else(|| PipelineError::invalid_input(&global_polygons, "no validation polygons"))?;
        // the CRS travels in the GeoJSON document itself
        concatenated.save(&global_polygons)?;

        let maps = ctx.final_maps(&self.area.tiles);
        ctx.compute_metrics("Global", &global_polygons, maps, &global)
            .await?;
        Ok(global.document)
    }

    async fn format_product(&self, manifest: &ProductManifest, lut: Option<(&Path, &Path)>) -> PipelineResult<()> {
        let metadata = self.layout.metadata();

        let args = manifest.formatter_args(&FormatterInputs {
            target_folder: self.config.target_folder(),
            metadata: &metadata,
            in_situ_data: &self.config.reference_polygons,
            lut,
            out_props: self.config.out_props.as_deref(),
            inputs: &self.config.inputs,
        });

        let step = Step::application(
            "ProductFormatter",
            "ProductFormatter",
            self.config.application_path.as_deref(),
        )
        .args(args);
        self.executor
            .execute(&step)
            .await
            .map_err(|e| e.in_unit(Stage::Validate.as_str(), "product formatter"))?;
        Ok(())
    }
}
