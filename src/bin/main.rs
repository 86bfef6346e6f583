use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use croptype_orchestrator::config::{ClassifierConfig, MaskSource, ResamplingMode, RetryPolicy, RunConfig, SamplingRate};
use croptype_orchestrator::lut::resolve_lut_path;
use croptype_orchestrator::{Orchestrator, SiteId, Stage, StratumId, TileId};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ClassifierKind {
    /// Random forest
    Rf,
    /// Support vector machine
    Svm,
}

#[derive(Parser)]
#[command(name = "croptype-orchestrator")]
#[command(about = "Crop type map production over a set of tiles")]
struct Cli {
    /// Reference polygons (GeoJSON FeatureCollection with a CODE property)
    #[arg(long)]
    refp: PathBuf,

    /// Fraction of reference polygons used for training
    #[arg(long, default_value_t = 0.75)]
    ratio: f64,

    /// Product descriptors
    #[arg(long, required = true, num_args = 1..)]
    input: Vec<PathBuf>,

    /// Temporal resampling mode (resample or gapfill)
    #[arg(long, default_value = "resample")]
    trm: String,

    #[arg(long, value_enum, default_value_t = ClassifierKind::Rf)]
    classifier: ClassifierKind,

    /// Training samples extracted per tile
    #[arg(long, default_value_t = 10000)]
    nbtrsample: u32,

    /// Random seed for the sample split and the trainer
    #[arg(long, default_value_t = 0)]
    rseed: u64,

    /// Crop mask per tile, in input tile order (NONE for no mask)
    #[arg(long, num_args = 1..)]
    mask: Option<Vec<String>>,

    /// Crop mask product to scan for per-tile masks
    #[arg(long)]
    maskprod: Option<PathBuf>,

    /// Output pixel size in meters
    #[arg(long, default_value_t = 10)]
    pixsize: u32,

    /// Include the red edge bands
    #[arg(long = "red-edge", default_value_t = true, action = ArgAction::Set)]
    red_edge: bool,

    /// Per-sensor sampling rates as SENSOR RATE pairs
    #[arg(long, num_args = 1..)]
    sp: Option<Vec<String>>,

    #[arg(long)]
    outdir: PathBuf,

    /// Location of the processing applications
    #[arg(long, env = "CROPTYPE_BUILD_FOLDER")]
    buildfolder: Option<PathBuf>,

    /// Folder the final product is written to (defaults to the output directory)
    #[arg(long)]
    targetfolder: Option<PathBuf>,

    #[arg(long, default_value_t = 100)]
    rfnbtrees: u32,

    #[arg(long, default_value_t = 25)]
    rfmax: u32,

    #[arg(long, default_value_t = 25)]
    rfmin: u32,

    /// Keep intermediate files
    #[arg(long, default_value_t = false)]
    keepfiles: bool,

    #[arg(long, default_value = "nn")]
    siteid: String,

    /// Display LUT
    #[arg(long, env = "CROPTYPE_LUT")]
    lut: Option<PathBuf>,

    /// Product formatter properties file
    #[arg(long)]
    outprops: Option<PathBuf>,

    /// Strata layout document; omit for single-stratum mode
    #[arg(long)]
    strata: Option<PathBuf>,

    /// Run only this stage (prepare-site, prepare-tiles, train, classify,
    /// postprocess-tiles, compute-quality-flags, validate)
    #[arg(long)]
    mode: Option<Stage>,

    /// Only process these strata, in this order
    #[arg(long, num_args = 1..)]
    stratum_filter: Option<Vec<u32>>,

    /// Only run per-tile stages for these tiles
    #[arg(long, num_args = 1..)]
    tile_filter: Option<Vec<String>>,

    #[arg(long, default_value_t = false)]
    skip_quality_flags: bool,

    /// Deliver the unmasked maps next to the masked ones
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    include_raw_map: bool,

    /// Maximum number of tiles or strata processed at once
    #[arg(long)]
    max_parallelism: Option<usize>,

    /// Threads per tile for multi-threaded applications
    #[arg(long, default_value_t = 4)]
    tile_threads_hint: usize,

    /// Attempts for retryable steps
    #[arg(long, default_value_t = 3)]
    retry_attempts: u32,

    /// Base delay between attempts, in seconds
    #[arg(long, default_value_t = 5)]
    retry_backoff: u64,
}

impl Cli {
    fn into_config(self) -> Result<RunConfig> {
        let mut config = RunConfig::new(self.refp, self.input);

        config.ratio = self.ratio;
        config.resampling = self.trm.parse::<ResamplingMode>()?;
        config.classifier = match self.classifier {
            ClassifierKind::Rf => ClassifierConfig::Rf {
                nb_trees: self.rfnbtrees,
                max_depth: self.rfmax,
                min_samples: self.rfmin,
            },
            ClassifierKind::Svm => ClassifierConfig::Svm,
        };
        config.training_samples = self.nbtrsample;
        config.seed = self.rseed;
        config.mask = MaskSource::from_options(self.mask, self.maskprod)?;
        config.pixel_size = self.pixsize;
        config.red_edge = self.red_edge;
        if let Some(sp) = &self.sp {
            config.sampling_rates = SamplingRate::parse_pairs(sp)?;
        }
        config.out_dir = self.outdir;
        config.application_path = self.buildfolder;
        config.target_folder = self.targetfolder;
        config.keep_files = self.keepfiles;
        config.site_id = SiteId::new(self.siteid);
        config.lut = resolve_lut_path(self.lut.as_deref());
        config.out_props = self.outprops;
        config.strata = self.strata;
        config.stratum_filter = self
            .stratum_filter
            .map(|ids| ids.into_iter().map(StratumId::new).collect());
        config.tile_filter = self
            .tile_filter
            .map(|ids| ids.into_iter().map(TileId::new).collect());
        config.skip_quality_flags = self.skip_quality_flags;
        config.include_raw_map = self.include_raw_map;
        config.max_parallelism = self.max_parallelism;
        config.tile_threads_hint = self.tile_threads_hint;
        config.retry = RetryPolicy {
            max_attempts: self.retry_attempts,
            backoff: Duration::from_secs(self.retry_backoff),
        };

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("croptype_orchestrator=info".parse()?))
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();
    let mode = cli.mode;
    let config = cli.into_config().context("invalid arguments")?;

    info!(
        "Crop type processing of {} descriptor(s) into {}",
        config.inputs.len(),
        config.out_dir.display()
    );

    let mut orchestrator = Orchestrator::load(config).context("failed to load the study area")?;

    let result = orchestrator.run(mode).await;
    if let Err(err) = &result {
        error!("Run {} failed: {}", orchestrator.run_id(), err);
    }
    result.context("crop type processing failed")?;

    info!("Run {} complete", orchestrator.run_id());
    Ok(())
}
