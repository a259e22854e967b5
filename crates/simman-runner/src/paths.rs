//! Canonical layout of a run's output directory.
//!
//! ```text
//! <root_dir>/<name>/<index>/
//!     data/          intermediate data reused during the simulation
//!     logs/          simulation logs
//!     simulation/    raw simulation output
//!     results/       post-hoc analysis artifacts, never sealed
//!     .commit_id .patch .command .metadata.json DESCRIPTION.yaml
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{IoContext, Result, SimError};

pub const DATA_DIR: &str = "data";
pub const LOGS_DIR: &str = "logs";
pub const SIMULATION_DIR: &str = "simulation";
pub const RESULTS_DIR: &str = "results";

pub const COMMIT_ID_FILE: &str = ".commit_id";
pub const PATCH_FILE: &str = ".patch";
pub const COMMAND_FILE: &str = ".command";
pub const METADATA_FILE: &str = ".metadata.json";
pub const DESCRIPTION_FILE: &str = "DESCRIPTION.yaml";
pub const ERROR_MARKER: &str = ".error";
pub const SETUP_FAILED_MARKER: &str = ".setup_failed";
pub const SEALED_MARKER: &str = ".sealed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSet {
    output_dir: PathBuf,
    data_dir: PathBuf,
    logs_dir: PathBuf,
    simulation_dir: PathBuf,
    results_dir: PathBuf,
    suffix: String,
}

impl PathSet {
    /// Reconstructs the layout of an existing run. Touches nothing on disk.
    pub fn for_output_dir(output_dir: impl AsRef<Path>) -> Self {
        let output_dir = output_dir.as_ref().to_path_buf();
        Self {
            data_dir: output_dir.join(DATA_DIR),
            logs_dir: output_dir.join(LOGS_DIR),
            simulation_dir: output_dir.join(SIMULATION_DIR),
            results_dir: output_dir.join(RESULTS_DIR),
            output_dir,
            suffix: String::new(),
        }
    }

    /// Creates the four subdirectories under an existing `output_dir`.
    ///
    /// A subdirectory that already exists is accepted only when it is an
    /// empty directory.
    pub fn create(output_dir: impl AsRef<Path>) -> Result<Self> {
        let paths = Self::for_output_dir(output_dir);
        let meta = fs::metadata(&paths.output_dir).at(&paths.output_dir)?;
        if !meta.is_dir() {
            return Err(SimError::io(
                &paths.output_dir,
                io::Error::new(io::ErrorKind::Other, "output path is not a directory"),
            ));
        }
        for dir in paths.subdirs() {
            create_empty_dir(dir)?;
        }
        Ok(paths)
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    pub fn simulation_dir(&self) -> &Path {
        &self.simulation_dir
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn subdirs(&self) -> [&Path; 4] {
        [
            &self.data_dir,
            &self.logs_dir,
            &self.simulation_dir,
            &self.results_dir,
        ]
    }

    /// Subdirectories write-protected at finalize. `results` is excluded.
    pub fn sealed_dirs(&self) -> [&Path; 3] {
        [&self.data_dir, &self.logs_dir, &self.simulation_dir]
    }

    pub fn commit_id_file(&self) -> PathBuf {
        self.output_dir.join(COMMIT_ID_FILE)
    }

    pub fn patch_file(&self) -> PathBuf {
        self.output_dir.join(PATCH_FILE)
    }

    pub fn command_file(&self) -> PathBuf {
        self.output_dir.join(COMMAND_FILE)
    }

    pub fn metadata_file(&self) -> PathBuf {
        self.output_dir.join(METADATA_FILE)
    }

    pub fn description_file(&self) -> PathBuf {
        self.output_dir.join(DESCRIPTION_FILE)
    }

    pub fn error_marker(&self) -> PathBuf {
        self.output_dir.join(ERROR_MARKER)
    }

    pub fn setup_failed_marker(&self) -> PathBuf {
        self.output_dir.join(SETUP_FAILED_MARKER)
    }

    pub fn sealed_marker(&self) -> PathBuf {
        self.output_dir.join(SEALED_MARKER)
    }

    /// Top-level files that are sealed together with the subdirectories.
    /// `DESCRIPTION.yaml` stays editable.
    pub fn record_files(&self) -> Vec<PathBuf> {
        vec![
            self.commit_id_file(),
            self.patch_file(),
            self.command_file(),
            self.metadata_file(),
            self.error_marker(),
            self.sealed_marker(),
        ]
    }

    /// `results/<name>-<params>-<suffix>.<ext>`, skipping empty parts.
    pub fn result_file(&self, name: &str, ext: &str, params: &BTreeMap<String, Value>) -> PathBuf {
        let params = param_string(params);
        let stem = [name, params.as_str(), self.suffix.as_str()]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("-");
        self.results_dir.join(format!("{}.{}", stem, ext))
    }
}

fn create_empty_dir(dir: &Path) -> Result<()> {
    match fs::create_dir(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            let meta = fs::symlink_metadata(dir).at(dir)?;
            if !meta.is_dir() {
                return Err(SimError::io(
                    dir,
                    io::Error::new(io::ErrorKind::AlreadyExists, "exists and is not a directory"),
                ));
            }
            let mut entries = fs::read_dir(dir).at(dir)?;
            if entries.next().is_some() {
                return Err(SimError::io(
                    dir,
                    io::Error::new(io::ErrorKind::AlreadyExists, "exists and is not empty"),
                ));
            }
            Ok(())
        }
        Err(e) => Err(SimError::io(dir, e)),
    }
}

/// `key1-val1-key2-val2` over the map's sorted keys. Floats are rendered with
/// two decimals, strings without quotes.
pub fn param_string(params: &BTreeMap<String, Value>) -> String {
    let mut parts = Vec::with_capacity(params.len() * 2);
    for (key, value) in params {
        parts.push(key.clone());
        parts.push(param_value_string(value));
    }
    parts.join("-")
}

fn param_value_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) => format!("{:.2}", f),
            None => n.to_string(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::testutil::{remove_tree, temp_root};
    use serde_json::json;

    #[test]
    fn for_output_dir_is_pure() {
        let paths = PathSet::for_output_dir("/nonexistent/dice/0");
        assert_eq!(paths.data_dir(), Path::new("/nonexistent/dice/0/data"));
        assert_eq!(paths.logs_dir(), Path::new("/nonexistent/dice/0/logs"));
        assert_eq!(
            paths.simulation_dir(),
            Path::new("/nonexistent/dice/0/simulation")
        );
        assert_eq!(paths.results_dir(), Path::new("/nonexistent/dice/0/results"));
        assert!(!Path::new("/nonexistent/dice/0").exists());
    }

    #[test]
    fn create_is_idempotent_on_empty_dirs() {
        let root = temp_root("paths_idem");
        let first = PathSet::create(&root).expect("create");
        for dir in first.subdirs() {
            assert!(dir.is_dir(), "{} missing", dir.display());
        }
        let second = PathSet::create(&root).expect("re-create over empty dirs");
        assert_eq!(first, second);
        remove_tree(&root);
    }

    #[test]
    fn create_rejects_populated_subdir() {
        let root = temp_root("paths_conflict");
        fs::create_dir(root.join(SIMULATION_DIR)).expect("mkdir");
        fs::write(root.join(SIMULATION_DIR).join("dice_rolls.txt"), "4\n").expect("write");
        let err = PathSet::create(&root).expect_err("populated dir must conflict");
        match err {
            SimError::Io { path, .. } => assert_eq!(path, root.join(SIMULATION_DIR)),
            other => panic!("unexpected error: {}", other),
        }
        remove_tree(&root);
    }

    #[test]
    fn create_rejects_file_in_place_of_dir() {
        let root = temp_root("paths_file");
        fs::write(root.join(LOGS_DIR), "not a dir").expect("write");
        let err = PathSet::create(&root).expect_err("file must conflict");
        assert!(err.to_string().contains("logs"), "{}", err);
        remove_tree(&root);
    }

    #[test]
    fn create_requires_existing_output_dir() {
        let root = temp_root("paths_missing");
        let missing = root.join("dice").join("0");
        let err = PathSet::create(&missing).expect_err("missing output dir");
        assert!(err.to_string().contains("dice"), "{}", err);
        remove_tree(&root);
    }

    #[test]
    fn param_string_sorts_and_formats() {
        let mut params = BTreeMap::new();
        params.insert("seed".to_string(), json!(3));
        params.insert("alpha".to_string(), json!(0.5));
        params.insert("model".to_string(), json!("lif"));
        assert_eq!(param_string(&params), "alpha-0.50-model-lif-seed-3");
        assert_eq!(param_string(&BTreeMap::new()), "");
    }

    #[test]
    fn result_file_skips_empty_parts() {
        let paths = PathSet::for_output_dir("/out/dice/0");
        assert_eq!(
            paths.result_file("hist", "png", &BTreeMap::new()),
            PathBuf::from("/out/dice/0/results/hist.png")
        );
        let mut params = BTreeMap::new();
        params.insert("bins".to_string(), json!(20));
        let paths = paths.with_suffix("v2");
        assert_eq!(
            paths.result_file("hist", "png", &params),
            PathBuf::from("/out/dice/0/results/hist-bins-20-v2.png")
        );
    }
}
