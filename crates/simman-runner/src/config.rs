use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::allocator::DEFAULT_ALLOCATION_ATTEMPTS;
use crate::error::{IoContext, Result, SimError};
use crate::metadata::DEFAULT_VOLATILE_PATHS;

pub const CONFIG_FILE: &str = ".simman.yaml";

pub const CONFIG_TEMPLATE: &str = "\
# Root under which <name>/<index>/ run directories are created.
# Overridden by --root or SIMMAN_ROOT.
root_dir: ''
# Any directory inside the repository whose state is recorded.
source_dir: .
# File or directory names left out of patches and untracked-file checks.
volatile_paths:
  - .ipynb_checkpoints
# Appended to file names produced by PathSet::result_file.
suffix: ''
# Rescans after losing a run-index race to another process.
allocation_attempts: 16
";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimmanConfig {
    pub root_dir: Option<PathBuf>,
    pub source_dir: PathBuf,
    pub volatile_paths: Vec<String>,
    pub suffix: String,
    pub allocation_attempts: u32,
}

impl Default for SimmanConfig {
    fn default() -> Self {
        Self {
            root_dir: None,
            source_dir: PathBuf::from("."),
            volatile_paths: DEFAULT_VOLATILE_PATHS.iter().map(|s| s.to_string()).collect(),
            suffix: String::new(),
            allocation_attempts: DEFAULT_ALLOCATION_ATTEMPTS,
        }
    }
}

impl SimmanConfig {
    /// Parses a YAML config. Relative `root_dir`/`source_dir` are resolved
    /// against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).at(path)?;
        let mut config: SimmanConfig =
            serde_yaml::from_str(&raw).map_err(|e| SimError::Config {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        if config.root_dir.as_deref() == Some(Path::new("")) {
            config.root_dir = None;
        }
        let base = path.parent().unwrap_or(Path::new("."));
        if let Some(root) = &config.root_dir {
            if root.is_relative() {
                config.root_dir = Some(base.join(root));
            }
        }
        if config.source_dir.is_relative() {
            config.source_dir = base.join(&config.source_dir);
        }
        if config.allocation_attempts == 0 {
            return Err(SimError::Config {
                path: path.to_path_buf(),
                message: "allocation_attempts must be at least 1".to_string(),
            });
        }
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Nearest `.simman.yaml` in `start` or its ancestors, or defaults.
    pub fn discover(start: &Path) -> Result<Self> {
        match find_config(start) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn with_root_dir(mut self, root_dir: Option<PathBuf>) -> Self {
        if root_dir.is_some() {
            self.root_dir = root_dir;
        }
        self
    }

    pub fn require_root_dir(&self) -> Result<&Path> {
        self.root_dir.as_deref().ok_or_else(|| SimError::Config {
            path: PathBuf::from(CONFIG_FILE),
            message: "no root_dir configured (set root_dir, --root or SIMMAN_ROOT)".to_string(),
        })
    }
}

pub fn find_config(start: &Path) -> Option<PathBuf> {
    let mut cur = Some(start);
    while let Some(dir) = cur {
        let candidate = dir.join(CONFIG_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
        cur = dir.parent();
    }
    None
}
