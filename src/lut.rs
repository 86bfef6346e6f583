//! Display color mapping for the crop type maps.

use std::collections::BTreeSet;
use std::env;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{PipelineError, PipelineResult};

/// Locations searched, relative to the executable directory, when no
/// usable LUT was given.
const DEFAULT_LUT_LOCATIONS: &[&str] = &[
    "../share/sen2agri/crop-type.lut",
    "crop-type.lut",
    "/usr/share/sen2agri/crop-type.lut",
];

/// One LUT row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LutEntry {
    pub code: i64,
    pub rgb: [u8; 3],
    pub name: String,
}

/// Resolve the LUT to use. A missing file is never fatal: the run simply
/// has no display mapping.
pub fn resolve_lut_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        warn!(
            "The LUT file {} does not exist, using the default one",
            path.display()
        );
    }

    let exe_dir = env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_default();

    let found = DEFAULT_LUT_LOCATIONS
        .iter()
        .map(|candidate| exe_dir.join(candidate))
        .find(|candidate| candidate.is_file());

    if found.is_none() {
        info!("No crop type LUT found, no display mapping will be applied");
    }
    found
}

/// Read a LUT file (`code r g b name`, `#` comments).
pub fn read_lut(path: &Path) -> PipelineResult<Vec<LutEntry>> {
    let raw = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
    let mut entries = Vec::new();

    for (lineno, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split_whitespace();
        let mut next_num = |what: &str| -> PipelineResult<i64> {
            fields
                .next()
                .and_then(|f| f.parse::<i64>().ok())
                .ok_or_else(|| {
                    PipelineError::invalid_input(path, format!("line {}: bad {what}", lineno + 1))
                })
        };

        let code = next_num("code")?;
        let mut rgb = [0u8; 3];
        for channel in rgb.iter_mut() {
            let value = next_num("color component")?;
            *channel = u8::try_from(value).map_err(|_| {
                PipelineError::invalid_input(
                    path,
                    format!("line {}: color component {value} out of range", lineno + 1),
                )
            })?;
        }
        let name = fields.collect::<Vec<_>>().join(" ");

        entries.push(LutEntry { code, rgb, name });
    }

    Ok(entries)
}

/// Keep only the LUT rows whose code appears in the reference data.
pub fn restrict_to_codes(entries: Vec<LutEntry>, codes: &BTreeSet<i64>) -> Vec<LutEntry> {
    entries
        .into_iter()
        .filter(|e| codes.contains(&e.code))
        .collect()
}

/// Write a QGIS color map export file.
pub fn save_qgis_color_map(entries: &[LutEntry], path: &Path) -> PipelineResult<()> {
    let mut out = String::from("# QGIS Generated Color Map Export File\nINTERPOLATION:EXACT\n");
    for e in entries {
        let label = if e.name.is_empty() {
            e.code.to_string()
        } else {
            e.name.clone()
        };
        let _ = writeln!(
            out,
            "{},{},{},{},255,{}",
            e.code, e.rgb[0], e.rgb[1], e.rgb[2], label
        );
    }
    fs::write(path, out).map_err(|e| PipelineError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_and_restrict() {
        let dir = tempfile::tempdir().unwrap();
        let lut = dir.path().join("crop-type.lut");
        fs::write(
            &lut,
            "# code r g b name\n0 0 0 0 No data\n1 255 0 0 Winter wheat\n\n2 0 255 0 Maize\n",
        )
        .unwrap();

        let entries = read_lut(&lut).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].name, "Winter wheat");

        let codes: BTreeSet<i64> = [2, 7].into_iter().collect();
        let kept = restrict_to_codes(entries, &codes);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].code, 2);
    }

    #[test]
    fn test_bad_color_component() {
        let dir = tempfile::tempdir().unwrap();
        let lut = dir.path().join("bad.lut");
        fs::write(&lut, "1 300 0 0 Wheat\n").unwrap();
        assert!(read_lut(&lut).is_err());
    }

    #[test]
    fn test_qgis_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("qgis-color-map.txt");
        save_qgis_color_map(
            &[LutEntry {
                code: 1,
                rgb: [255, 0, 0],
                name: "Winter wheat".to_string(),
            }],
            &out,
        )
        .unwrap();

        let text = fs::read_to_string(&out).unwrap();
        assert!(text.starts_with("# QGIS Generated Color Map Export File\nINTERPOLATION:EXACT\n"));
        assert!(text.contains("1,255,0,0,255,Winter wheat"));
    }

    #[test]
    fn test_missing_explicit_lut_is_not_fatal() {
        // Falls back to the default locations; whatever is found there, no panic.
        let _ = resolve_lut_path(Some(Path::new("/definitely/not/here.lut")));
    }
}
