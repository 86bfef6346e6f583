//! Stratification of the study area.
//!
//! Strata partition the tiles and the reference polygons; each stratum gets
//! its own training and validation polygon subsets. Geometry is carried
//! through opaquely: only feature properties are interpreted.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::config::StrataLayout;
use crate::error::{PipelineError, PipelineResult};
use crate::model::{Stratum, Tile};
use crate::types::{StratumId, TileId};

/// Stratum id used for the implicit stratum in single-stratum mode.
pub const IMPLICIT_STRATUM: StratumId = StratumId::new(0);

/// One reference polygon: the raw GeoJSON feature plus the properties the
/// orchestrator cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferencePolygon {
    pub feature: Value,
    pub code: i64,
    pub stratum: Option<StratumId>,
    pub tile: Option<TileId>,
}

/// A GeoJSON FeatureCollection of reference polygons.
#[derive(Debug, Clone, PartialEq)]
pub struct PolygonSet {
    /// Top-level members other than `features` (crs, name, ...).
    header: Map<String, Value>,
    pub polygons: Vec<ReferencePolygon>,
}

impl PolygonSet {
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let raw = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        let value: Value = serde_json::from_str(&raw)
            .map_err(|e| PipelineError::invalid_input(path, e.to_string()))?;
        Self::from_value(value).map_err(|msg| PipelineError::invalid_input(path, msg))
    }

    pub fn from_value(value: Value) -> Result<Self, String> {
        let Value::Object(mut header) = value else {
            return Err("expected a GeoJSON FeatureCollection".to_string());
        };
        let features = match header.remove("features") {
            Some(Value::Array(features)) => features,
            _ => return Err("FeatureCollection has no `features` array".to_string()),
        };

        let polygons = features
            .into_iter()
            .enumerate()
            .map(|(idx, feature)| {
                let props = feature.get("properties").cloned().unwrap_or(Value::Null);
                let code = props
                    .get("CODE")
                    .and_then(as_i64)
                    .ok_or_else(|| format!("feature {idx} has no numeric CODE"))?;
                let stratum = props
                    .get("STRATUM")
                    .and_then(as_i64)
                    .and_then(|v| u32::try_from(v).ok())
                    .map(StratumId::new);
                let tile = props
                    .get("TILE")
                    .and_then(Value::as_str)
                    .map(TileId::new);
                Ok(ReferencePolygon {
                    feature,
                    code,
                    stratum,
                    tile,
                })
            })
            .collect::<Result<Vec<_>, String>>()?;

        Ok(Self { header, polygons })
    }

    pub fn len(&self) -> usize {
        self.polygons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polygons.is_empty()
    }

    /// Crop codes present in the set.
    pub fn codes(&self) -> BTreeSet<i64> {
        self.polygons.iter().map(|p| p.code).collect()
    }

    fn subset(&self, polygons: Vec<ReferencePolygon>) -> Self {
        Self {
            header: self.header.clone(),
            polygons,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut obj = self.header.clone();
        obj.entry("type")
            .or_insert_with(|| Value::String("FeatureCollection".to_string()));
        obj.insert(
            "features".to_string(),
            Value::Array(self.polygons.iter().map(|p| p.feature.clone()).collect()),
        );
        Value::Object(obj)
    }

    pub fn save(&self, path: &Path) -> PipelineResult<()> {
        let body = serde_json::to_string(&self.to_value())?;
        fs::write(path, body).map_err(|e| PipelineError::io(path, e))
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Training and validation subsets for one stratum.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleSplit {
    pub training: PolygonSet,
    pub validation: PolygonSet,
}

/// Assign tiles to strata and return the strata that survive the filter.
///
/// Strata come back in filter order when a filter is given, layout order
/// otherwise. Every tile's `strata` list is overwritten.
pub fn build_strata(
    tiles: &mut [Tile],
    layout: Option<&StrataLayout>,
    filter: Option<&[StratumId]>,
) -> Vec<Stratum> {
    let Some(layout) = layout else {
        for tile in tiles.iter_mut() {
            tile.strata = vec![IMPLICIT_STRATUM];
        }
        return vec![Stratum {
            id: IMPLICIT_STRATUM,
            tiles: tiles.iter().map(|t| t.id.clone()).collect(),
        }];
    };

    let ordered: Vec<StratumId> = match filter {
        Some(filter) => {
            for id in filter {
                if !layout.strata.iter().any(|s| s.id == *id) {
                    warn!("Stratum {} from the stratum filter is not defined", id);
                }
            }
            filter
                .iter()
                .copied()
                .filter(|id| layout.strata.iter().any(|s| s.id == *id))
                .collect()
        }
        None => layout.strata.iter().map(|s| s.id).collect(),
    };

    for tile in tiles.iter_mut() {
        tile.strata.clear();
    }

    let mut strata = Vec::with_capacity(ordered.len());
    for id in ordered {
        let Some(entry) = layout.strata.iter().find(|s| s.id == id) else {
            continue;
        };
        let mut members = Vec::new();
        for tile in tiles.iter_mut() {
            if entry.tiles.contains(&tile.id) {
                tile.strata.push(id);
                members.push(tile.id.clone());
            }
        }
        if members.is_empty() {
            warn!("Stratum {} covers none of the input tiles", id);
        }
        strata.push(Stratum { id, tiles: members });
    }

    for tile in tiles.iter() {
        if tile.strata.is_empty() {
            warn!(
                "Tile {} belongs to no selected stratum and will not be classified",
                tile.id
            );
        }
    }

    strata
}

/// Extract the reference polygons belonging to a stratum.
///
/// A polygon belongs to a stratum when its `STRATUM` property matches, or,
/// without that property, when its `TILE` is one of the stratum's tiles.
pub fn split_features(polygons: &PolygonSet, stratum: &Stratum, single_stratum: bool) -> PolygonSet {
    if single_stratum {
        return polygons.clone();
    }

    let selected = polygons
        .polygons
        .iter()
        .filter(|p| match (p.stratum, &p.tile) {
            (Some(s), _) => s == stratum.id,
            (None, Some(tile)) => stratum.tiles.contains(tile),
            (None, None) => false,
        })
        .cloned()
        .collect();

    polygons.subset(selected)
}

/// Split polygons into training and validation subsets.
///
/// The split is made per crop class so every class is represented in the
/// training set. Given the same `(seed, ratio, polygons)` the result is
/// identical; both subsets keep the input feature order.
pub fn select_samples(polygons: &PolygonSet, ratio: f64, seed: u64) -> SampleSplit {
    let mut by_class: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (idx, p) in polygons.polygons.iter().enumerate() {
        by_class.entry(p.code).or_default().push(idx);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut training_idx = BTreeSet::new();
    for indices in by_class.values_mut() {
        indices.shuffle(&mut rng);
        let n = indices.len();
        let n_train = ((ratio * n as f64).round() as usize).clamp(1, n);
        training_idx.extend(indices[..n_train].iter().copied());
    }

    let (training, validation): (Vec<_>, Vec<_>) = polygons
        .polygons
        .iter()
        .cloned()
        .enumerate()
        .partition(|(idx, _)| training_idx.contains(idx));

    SampleSplit {
        training: polygons.subset(training.into_iter().map(|(_, p)| p).collect()),
        validation: polygons.subset(validation.into_iter().map(|(_, p)| p).collect()),
    }
}

/// Concatenate several polygon sets, keeping the first one's header.
pub fn concatenate(sets: &[PolygonSet]) -> Option<PolygonSet> {
    let first = sets.first()?;
    let polygons = sets.iter().flat_map(|s| s.polygons.iter().cloned()).collect();
    Some(first.subset(polygons))
}

/// Log a one-line summary of a split.
pub fn log_split(stratum: StratumId, split: &SampleSplit) {
    info!(
        "Stratum {}: {} training / {} validation polygon(s)",
        stratum,
        split.training.len(),
        split.validation.len()
    );
}
