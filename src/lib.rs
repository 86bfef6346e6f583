// Core modules
pub mod catalog;
pub mod config;
pub mod core;
pub mod error;
pub mod lut;
pub mod manifest;
pub mod masks;
pub mod model;
pub mod stratify;
pub mod types;

mod orchestrator;

// Re-export key types and functions
pub use config::{ClassifierConfig, MaskSource, ResamplingMode, RetryPolicy, RunConfig, SamplingRate};
pub use self::core::{ProcessRunner, Scheduler, Step, StepArgs, StepExecutor, StepRunner};
pub use error::{PipelineError, PipelineResult};
pub use manifest::ProductManifest;
pub use orchestrator::{NO_DATA, Orchestrator, OutputLayout, Stage};
pub use types::{SiteId, StratumId, TileId};
