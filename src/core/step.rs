// Typed description of one external processing job

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

/// One command-line argument. Values stay typed until the executor
/// boundary, where they are stringified.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Path(PathBuf),
}

impl Arg {
    pub fn to_os_string(&self) -> OsString {
        match self {
            Arg::Str(s) => OsString::from(s),
            Arg::Int(i) => OsString::from(i.to_string()),
            Arg::Float(f) => OsString::from(f.to_string()),
            Arg::Bool(b) => OsString::from(if *b { "true" } else { "false" }),
            Arg::Path(p) => p.as_os_str().to_os_string(),
        }
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_os_string().to_string_lossy())
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Str(s.to_string())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Str(s)
    }
}

impl From<&String> for Arg {
    fn from(s: &String) -> Self {
        Arg::Str(s.clone())
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Int(v)
    }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Arg::Int(v.into())
    }
}

impl From<u32> for Arg {
    fn from(v: u32) -> Self {
        Arg::Int(v.into())
    }
}

impl From<u64> for Arg {
    fn from(v: u64) -> Self {
        // seeds above i64::MAX are passed through verbatim
        match i64::try_from(v) {
            Ok(i) => Arg::Int(i),
            Err(_) => Arg::Str(v.to_string()),
        }
    }
}

impl From<usize> for Arg {
    fn from(v: usize) -> Self {
        Arg::from(v as u64)
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Float(v)
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Bool(v)
    }
}

impl From<PathBuf> for Arg {
    fn from(p: PathBuf) -> Self {
        Arg::Path(p)
    }
}

impl From<&PathBuf> for Arg {
    fn from(p: &PathBuf) -> Self {
        Arg::Path(p.clone())
    }
}

impl From<&Path> for Arg {
    fn from(p: &Path) -> Self {
        Arg::Path(p.to_path_buf())
    }
}

/// Builder for flag/value argument lists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepArgs(Vec<Arg>);

impl StepArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// `-name value`
    pub fn flag(mut self, name: &str, value: impl Into<Arg>) -> Self {
        self.0.push(Arg::from(name));
        self.0.push(value.into());
        self
    }

    /// `-name v1 v2 ...`
    pub fn flag_list<I, A>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.0.push(Arg::from(name));
        self.0.extend(values.into_iter().map(Into::into));
        self
    }

    /// `-name value` only when `cond` holds.
    pub fn flag_if(self, cond: bool, name: &str, value: impl Into<Arg>) -> Self {
        if cond { self.flag(name, value) } else { self }
    }

    /// A bare positional value.
    pub fn value(mut self, value: impl Into<Arg>) -> Self {
        self.0.push(value.into());
        self
    }

    pub fn values<I, A>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.0.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn extend(mut self, other: StepArgs) -> Self {
        self.0.extend(other.0);
        self
    }

    pub fn as_slice(&self) -> &[Arg] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Values following `flag` up to the next argument starting with `-`.
    pub fn values_of(&self, flag: &str) -> Option<Vec<String>> {
        let pos = self
            .0
            .iter()
            .position(|a| matches!(a, Arg::Str(s) if s == flag))?;
        Some(
            self.0[pos + 1..]
                .iter()
                .map(|a| a.to_string())
                .take_while(|s| !is_flag(s))
                .collect(),
        )
    }
}

fn is_flag(s: &str) -> bool {
    s.starts_with('-') && s.len() > 1 && !s[1..].starts_with(|c: char| c.is_ascii_digit())
}

/// Extended filename asking the writer for a compressed GeoTIFF.
pub fn compressed_output(path: &Path, compression: &str) -> Arg {
    Arg::Str(format!("{}?gdal:co:COMPRESS={}", path.display(), compression))
}

/// A unit of work dispatched to an external process.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub name: String,
    pub program: String,
    pub args: StepArgs,
    /// Re-run on failure; only valid for idempotent jobs.
    pub retry: bool,
    /// File receiving the process' standard output.
    pub out_file: Option<PathBuf>,
    /// Files the step must produce for its run to count as complete.
    pub outputs: Vec<PathBuf>,
    /// Internal thread count for multi-threaded applications.
    pub threads: Option<usize>,
}

impl Step {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: StepArgs::new(),
            retry: false,
            out_file: None,
            outputs: Vec::new(),
            threads: None,
        }
    }

    /// Step running a processing-toolbox application, either through the
    /// generic launcher with an explicit module path or through the
    /// per-application wrapper.
    pub fn application(name: impl Into<String>, app: &str, module_path: Option<&Path>) -> Self {
        match module_path {
            Some(path) => {
                let mut step = Self::new(name, "otbcli");
                step.args = StepArgs::new().value(app).value(path);
                step
            }
            None => Self::new(name, format!("otbcli_{app}")),
        }
    }

    pub fn args(mut self, args: StepArgs) -> Self {
        self.args = self.args.extend(args);
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retry = true;
        self
    }

    pub fn capture_stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.out_file = Some(path.into());
        self
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }

    pub fn threads(mut self, threads: Option<usize>) -> Self {
        self.threads = threads;
        self
    }

    /// Arguments as handed to the process.
    pub fn os_args(&self) -> Vec<OsString> {
        self.args.as_slice().iter().map(Arg::to_os_string).collect()
    }

    /// Human-readable command line for logs.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in self.args.as_slice() {
            line.push(' ');
            line.push_str(&arg.to_string());
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_are_stringified_at_the_boundary() {
        let args = StepArgs::new()
            .flag("-ratio", 0.75)
            .flag("-seed", 0u64)
            .flag("-pixsize", 10u32)
            .flag("-rededge", true)
            .flag("-nodatalabel", -10000i64)
            .flag("-out", PathBuf::from("/out/model-1.txt"));

        let strings: Vec<String> = args.as_slice().iter().map(|a| a.to_string()).collect();
        assert_eq!(
            strings,
            vec![
                "-ratio", "0.75", "-seed", "0", "-pixsize", "10", "-rededge", "true",
                "-nodatalabel", "-10000", "-out", "/out/model-1.txt"
            ]
        );
        assert!(matches!(args.as_slice()[11], Arg::Path(_)));
        assert!(matches!(args.as_slice()[1], Arg::Float(_)));
        assert!(matches!(args.as_slice()[3], Arg::Int(_)));
    }

    #[test]
    fn test_flag_list_and_values_of() {
        let args = StepArgs::new()
            .flag_list("-il", ["a.xml", "b.xml"])
            .flag("-bv", -10000i64)
            .flag_list("-prodpertile", [2usize, 1]);

        assert_eq!(
            args.values_of("-il"),
            Some(vec!["a.xml".to_string(), "b.xml".to_string()])
        );
        // negative numbers are values, not flags
        assert_eq!(args.values_of("-bv"), Some(vec!["-10000".to_string()]));
        assert_eq!(
            args.values_of("-prodpertile"),
            Some(vec!["2".to_string(), "1".to_string()])
        );
        assert_eq!(args.values_of("-missing"), None);
    }

    #[test]
    fn test_application_launchers() {
        let step = Step::application("Train", "CropTypeTrainImagesClassifier", Some(Path::new("/opt/otb")));
        assert_eq!(step.program, "otbcli");
        assert_eq!(
            step.command_line(),
            "otbcli CropTypeTrainImagesClassifier /opt/otb"
        );

        let step = Step::application("Rasterize", "Rasterization", None)
            .args(StepArgs::new().flag("-mode", "attribute"));
        assert_eq!(step.command_line(), "otbcli_Rasterization -mode attribute");
    }

    #[test]
    fn test_compressed_output() {
        let arg = compressed_output(Path::new("/o/map.tif"), "DEFLATE");
        assert_eq!(arg.to_string(), "/o/map.tif?gdal:co:COMPRESS=DEFLATE");
    }

    #[test]
    fn test_flag_if() {
        let args = StepArgs::new()
            .flag_if(false, "-rededge", true)
            .flag_if(true, "-mode", "resample");
        assert_eq!(args.len(), 2);
    }
}
