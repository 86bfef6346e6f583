use serde::{Deserialize, Serialize};
use std::{env, fmt, fs, path::Path, path::PathBuf, str::FromStr, time::Duration};

use crate::error::{PipelineError, PipelineResult};
use crate::types::{SiteId, StratumId, TileId};

/// Classifier variant and its hyperparameters.
///
/// Only the hyperparameters relevant to the selected variant exist, so the
/// manifest can never report forest settings for a margin-based run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ClassifierConfig {
    Rf {
        nb_trees: u32,
        max_depth: u32,
        min_samples: u32,
    },
    Svm,
}

impl ClassifierConfig {
    pub fn random_forest() -> Self {
        Self::Rf {
            nb_trees: 100,
            max_depth: 25,
            min_samples: 25,
        }
    }

    /// Short name passed to the trainer (`rf` or `svm`).
    pub fn name(&self) -> &'static str {
        match self {
            Self::Rf { .. } => "rf",
            Self::Svm => "svm",
        }
    }

    /// Margin-based classifiers need per-feature statistics for normalization.
    pub fn needs_statistics(&self) -> bool {
        matches!(self, Self::Svm)
    }
}

/// How the trainer fills temporal gaps between acquisitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResamplingMode {
    #[default]
    Resample,
    Gapfill,
}

impl ResamplingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resample => "resample",
            Self::Gapfill => "gapfill",
        }
    }
}

impl FromStr for ResamplingMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resample" => Ok(Self::Resample),
            "gapfill" => Ok(Self::Gapfill),
            other => Err(PipelineError::config(format!(
                "unknown temporal resampling mode `{other}`"
            ))),
        }
    }
}

/// Temporal sampling rate (in days) for one sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingRate {
    pub sensor: String,
    pub days: u32,
}

impl SamplingRate {
    /// Parse a flat `SENSOR RATE SENSOR RATE ...` list.
    pub fn parse_pairs(values: &[String]) -> PipelineResult<Vec<SamplingRate>> {
        if values.len() % 2 != 0 {
            return Err(PipelineError::config(
                "per-sensor sampling rates must be given as SENSOR RATE pairs",
            ));
        }

        values
            .chunks(2)
            .map(|pair| {
                let days = pair[1].parse::<u32>().map_err(|_| {
                    PipelineError::config(format!(
                        "invalid sampling rate `{}` for sensor {}",
                        pair[1], pair[0]
                    ))
                })?;
                Ok(SamplingRate {
                    sensor: pair[0].to_uppercase(),
                    days,
                })
            })
            .collect()
    }

    pub fn defaults() -> Vec<SamplingRate> {
        [("SENTINEL", 10), ("SPOT", 5), ("LANDSAT", 16)]
            .into_iter()
            .map(|(sensor, days)| SamplingRate {
                sensor: sensor.to_string(),
                days,
            })
            .collect()
    }
}

/// Where per-tile crop masks come from.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum MaskSource {
    #[default]
    None,
    /// One entry per tile, aligned by tile index; `None` means unmasked.
    PerTile(Vec<Option<PathBuf>>),
    /// A crop-mask product whose `TILES/` tree is scanned for masks.
    Product(PathBuf),
}

impl MaskSource {
    /// Build from the two mutually exclusive command-line options.
    pub fn from_options(
        masks: Option<Vec<String>>,
        mask_product: Option<PathBuf>,
    ) -> PipelineResult<Self> {
        match (masks, mask_product) {
            (Some(_), Some(_)) => Err(PipelineError::config(
                "the -mask and -maskprod arguments are exclusive",
            )),
            (Some(list), None) => Ok(Self::PerTile(
                list.into_iter()
                    .map(|m| {
                        if m.eq_ignore_ascii_case("NONE") {
                            None
                        } else {
                            Some(PathBuf::from(m))
                        }
                    })
                    .collect(),
            )),
            (None, Some(product)) => Ok(Self::Product(product)),
            (None, None) => Ok(Self::None),
        }
    }
}

/// Bounded retry for steps flagged as retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before attempt `n + 1` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(5),
        }
    }
}

/// Immutable configuration for one run, shared by reference with every stage.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub reference_polygons: PathBuf,
    pub inputs: Vec<PathBuf>,
    pub ratio: f64,
    pub resampling: ResamplingMode,
    pub classifier: ClassifierConfig,
    pub training_samples: u32,
    pub seed: u64,
    pub mask: MaskSource,
    pub pixel_size: u32,
    pub red_edge: bool,
    pub sampling_rates: Vec<SamplingRate>,
    pub out_dir: PathBuf,
    /// Location of the processing toolbox applications, if not on the default path.
    pub application_path: Option<PathBuf>,
    pub target_folder: Option<PathBuf>,
    pub keep_files: bool,
    pub site_id: SiteId,
    /// Resolved display LUT; `None` means no mapping is applied.
    pub lut: Option<PathBuf>,
    pub out_props: Option<PathBuf>,
    pub strata: Option<PathBuf>,
    pub stratum_filter: Option<Vec<StratumId>>,
    pub tile_filter: Option<Vec<TileId>>,
    pub skip_quality_flags: bool,
    pub include_raw_map: bool,
    pub max_parallelism: Option<usize>,
    pub tile_threads_hint: usize,
    pub retry: RetryPolicy,
}

impl RunConfig {
    /// Configuration with the processor defaults for everything but the inputs.
    pub fn new(reference_polygons: impl Into<PathBuf>, inputs: Vec<PathBuf>) -> Self {
        Self {
            reference_polygons: reference_polygons.into(),
            inputs,
            ratio: 0.75,
            resampling: ResamplingMode::Resample,
            classifier: ClassifierConfig::random_forest(),
            training_samples: 10000,
            seed: 0,
            mask: MaskSource::None,
            pixel_size: 10,
            red_edge: true,
            sampling_rates: SamplingRate::defaults(),
            out_dir: PathBuf::from("."),
            application_path: None,
            target_folder: None,
            keep_files: false,
            site_id: SiteId::new("nn"),
            lut: None,
            out_props: None,
            strata: None,
            stratum_filter: None,
            tile_filter: None,
            skip_quality_flags: false,
            include_raw_map: true,
            max_parallelism: None,
            tile_threads_hint: 4,
            retry: RetryPolicy::default(),
        }
    }

    /// Reject inconsistent configurations before any stage starts.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.inputs.is_empty() {
            return Err(PipelineError::config(
                "at least one product descriptor is required",
            ));
        }
        if !(self.ratio > 0.0 && self.ratio < 1.0) {
            return Err(PipelineError::config(format!(
                "sample ratio must lie in (0, 1), got {}",
                self.ratio
            )));
        }
        if self.max_parallelism == Some(0) {
            return Err(PipelineError::config("max parallelism must be at least 1"));
        }
        if self.tile_threads_hint == 0 {
            return Err(PipelineError::config("tile thread hint must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::config("retry attempts must be at least 1"));
        }
        if let Some(filter) = &self.stratum_filter
            && filter.is_empty()
        {
            return Err(PipelineError::config("stratum filter cannot be empty"));
        }
        Ok(())
    }

    /// Folder the product formatter builds the final product in.
    pub fn target_folder(&self) -> &Path {
        self.target_folder.as_deref().unwrap_or(&self.out_dir)
    }

    pub fn tile_selected(&self, tile: &TileId) -> bool {
        self.tile_filter
            .as_ref()
            .map(|filter| filter.contains(tile))
            .unwrap_or(true)
    }
}

impl fmt::Display for ClassifierConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// On-disk description of the strata: the geometry file handed to the
/// rasterizer plus the tiles each stratum covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrataLayout {
    pub shapefile: PathBuf,
    pub strata: Vec<StratumEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratumEntry {
    pub id: StratumId,
    pub tiles: Vec<TileId>,
}

impl StrataLayout {
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let raw = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        let mut layout: StrataLayout = serde_json::from_str(&raw)
            .map_err(|e| PipelineError::invalid_input(path, e.to_string()))?;

        layout.shapefile = PathBuf::from(expand_env_vars(&layout.shapefile.to_string_lossy()));
        if layout.shapefile.is_relative()
            && let Some(parent) = path.parent()
        {
            layout.shapefile = parent.join(&layout.shapefile);
        }

        if layout.strata.is_empty() {
            return Err(PipelineError::invalid_input(path, "no strata defined"));
        }

        let mut seen = std::collections::HashSet::new();
        for entry in &layout.strata {
            if !seen.insert(entry.id) {
                return Err(PipelineError::invalid_input(
                    path,
                    format!("stratum {} is defined twice", entry.id),
                ));
            }
        }

        Ok(layout)
    }
}

/// Expand `${VAR}` references; unknown variables are left untouched.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Ok(val) = env::var(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> RunConfig {
        RunConfig::new("ref.geojson", vec![PathBuf::from("S2A_MSIL2A_T31TCJ_1.xml")])
    }

    #[test]
    fn test_defaults_validate() {
        let cfg = base_config();
        assert!(cfg.validate().is_ok());
        assert!(cfg.strata.is_none());
        assert_eq!(cfg.classifier.name(), "rf");
        assert_eq!(cfg.sampling_rates.len(), 3);
    }

    #[test]
    fn test_ratio_bounds() {
        let mut cfg = base_config();
        cfg.ratio = 1.0;
        assert!(cfg.validate().is_err());
        cfg.ratio = 0.0;
        assert!(cfg.validate().is_err());
        cfg.ratio = 0.5;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_inputs_required() {
        let cfg = RunConfig::new("ref.geojson", vec![]);
        assert!(matches!(cfg.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_mask_options_are_exclusive() {
        let res = MaskSource::from_options(
            Some(vec!["a.tif".to_string()]),
            Some(PathBuf::from("/masks")),
        );
        assert!(matches!(res, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_mask_list_none_entries() {
        let src = MaskSource::from_options(
            Some(vec!["a.tif".to_string(), "NONE".to_string()]),
            None,
        )
        .unwrap();
        assert_eq!(
            src,
            MaskSource::PerTile(vec![Some(PathBuf::from("a.tif")), None])
        );
    }

    #[test]
    fn test_sampling_rate_pairs() {
        let values: Vec<String> = ["sentinel", "10", "LANDSAT", "16"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let rates = SamplingRate::parse_pairs(&values).unwrap();
        assert_eq!(rates[0].sensor, "SENTINEL");
        assert_eq!(rates[1].days, 16);

        let odd: Vec<String> = vec!["SENTINEL".to_string()];
        assert!(SamplingRate::parse_pairs(&odd).is_err());
    }

    #[test]
    fn test_tile_filter() {
        let mut cfg = base_config();
        assert!(cfg.tile_selected(&TileId::new("31TCJ")));
        cfg.tile_filter = Some(vec![TileId::new("31TDJ")]);
        assert!(!cfg.tile_selected(&TileId::new("31TCJ")));
        assert!(cfg.tile_selected(&TileId::new("31tdj")));
    }

    #[test]
    fn test_strata_layout_load_resolves_relative_shapefile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.json");
        fs::write(
            &path,
            r#"{"shapefile": "strata.shp", "strata": [{"id": 1, "tiles": ["31TCJ"]}, {"id": 2, "tiles": ["31TDJ"]}]}"#,
        )
        .unwrap();

        let layout = StrataLayout::load(&path).unwrap();
        assert_eq!(layout.shapefile, dir.path().join("strata.shp"));
        assert_eq!(layout.strata.len(), 2);
        assert_eq!(layout.strata[1].tiles, vec![TileId::new("31TDJ")]);
    }

    #[test]
    fn test_strata_layout_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.json");
        fs::write(
            &path,
            r#"{"shapefile": "/s.shp", "strata": [{"id": 1, "tiles": []}, {"id": 1, "tiles": []}]}"#,
        )
        .unwrap();

        assert!(StrataLayout::load(&path).is_err());
    }

    #[test]
    fn test_expand_env_vars_keeps_unknown() {
        assert_eq!(
            expand_env_vars("${CROPTYPE_SURELY_UNSET_VAR}/x"),
            "${CROPTYPE_SURELY_UNSET_VAR}/x"
        );
    }
}
