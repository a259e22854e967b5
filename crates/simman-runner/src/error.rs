use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::session::SessionState;

pub type Result<T, E = SimError> = std::result::Result<T, E>;

/// Every failure surfaced by the runner. Each variant names the path(s) it
/// concerns.
#[derive(Debug, Error)]
pub enum SimError {
    /// Another process claimed the run index first. Retryable.
    #[error("run index {index} under {} was claimed concurrently; retry allocation", parent.display())]
    Conflict { parent: PathBuf, index: u64 },

    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error(transparent)]
    Reproduction(#[from] ReproductionError),

    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration {}: {message}", path.display())]
    Config { path: PathBuf, message: String },

    #[error("session {name} is {state:?}; cannot {action}")]
    InvalidState {
        name: String,
        state: SessionState,
        action: &'static str,
    },

    /// More than one step of finalize failed. Every step still ran.
    #[error("finalize of {} failed with {} error(s):{}", output_dir.display(), errors.len(), display_errors(errors))]
    Finalize {
        output_dir: PathBuf,
        errors: Vec<SimError>,
    },
}

fn display_errors(errors: &[SimError]) -> String {
    errors.iter().map(|e| format!("\n  {}", e)).collect()
}

impl SimError {
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        SimError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SimError::Conflict { .. })
    }
}

/// Attaches the failing path to a raw `io::Result`.
pub(crate) trait IoContext<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|e| SimError::io(path, e))
    }
}

/// Session start failed. The partially created run directory is kept for
/// inspection.
#[derive(Debug, Error)]
#[error("session setup failed for {}: {source}", output_dir.as_deref().map(|p| p.display().to_string()).unwrap_or_else(|| "<unallocated run>".to_string()))]
pub struct SetupError {
    pub output_dir: Option<PathBuf>,
    #[source]
    pub source: Box<SimError>,
}

#[derive(Debug)]
pub struct PermissionFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Aggregate of every path whose mode could not be changed during a seal or
/// unseal walk.
#[derive(Debug, Error)]
pub struct PermissionError {
    pub failures: Vec<PermissionFailure>,
}

impl PermissionError {
    pub fn paths(&self) -> Vec<&Path> {
        self.failures.iter().map(|f| f.path.as_path()).collect()
    }

    pub(crate) fn merge(errors: Vec<PermissionError>) -> Option<PermissionError> {
        let failures: Vec<PermissionFailure> =
            errors.into_iter().flat_map(|e| e.failures).collect();
        if failures.is_empty() {
            None
        } else {
            Some(PermissionError { failures })
        }
    }
}

impl fmt::Display for PermissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to change permissions on {} path(s):",
            self.failures.len()
        )?;
        for failure in &self.failures {
            write!(f, "\n  {}: {}", failure.path.display(), failure.reason)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkFailureReason {
    /// The chunk's sub-repository does not exist after `submodule update`.
    SubmoduleMissing,
    CheckoutFailed(String),
    ApplyFailed(String),
}

impl fmt::Display for ChunkFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkFailureReason::SubmoduleMissing => write!(f, "sub-repository missing"),
            ChunkFailureReason::CheckoutFailed(msg) => write!(f, "checkout failed: {}", msg),
            ChunkFailureReason::ApplyFailed(msg) => write!(f, "apply failed: {}", msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    pub path: PathBuf,
    pub reason: ChunkFailureReason,
}

#[derive(Debug, Error)]
pub enum ReproductionError {
    #[error("{} is not inside a git repository: {stderr}", dir.display())]
    NotARepository { dir: PathBuf, stderr: String },

    #[error("working tree at {} is dirty; commit or stash everything recursively first:\n{status}", repo.display())]
    DirtyTree { repo: PathBuf, status: String },

    #[error("untracked files in {} would be missing from the patch: {}", repo.display(), files.join(", "))]
    UntrackedFiles { repo: PathBuf, files: Vec<String> },

    #[error("`git {}` failed in {}: {stderr}", args.join(" "), dir.display())]
    Git {
        dir: PathBuf,
        args: Vec<String>,
        stderr: String,
    },

    #[error("malformed patch stream {}: {reason}", source_name)]
    MalformedPatch { source_name: String, reason: String },

    #[error("patch {} does not match recorded digest (expected {expected}, found {actual})", path.display())]
    DigestMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("patch applied partially; applied: [{}]; failed: [{}]", display_paths(applied), display_failures(failed))]
    PartialApply {
        applied: Vec<PathBuf>,
        failed: Vec<ChunkFailure>,
    },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn display_failures(failures: &[ChunkFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.path.display(), f.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Outcome of [`crate::SimulationSession::run`].
#[derive(Debug, Error)]
pub enum RunError<E> {
    #[error("{0}")]
    Setup(SimError),

    /// The body failed. The run was still finalized; `finalize` holds any
    /// error raised while sealing.
    #[error("simulation failed: {error}")]
    Body {
        error: E,
        finalize: Option<SimError>,
    },

    #[error("finalize failed: {0}")]
    Finalize(SimError),
}

impl<E> RunError<E> {
    pub fn body(self) -> Option<E> {
        match self {
            RunError::Body { error, .. } => Some(error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_error_lists_every_path() {
        let err = PermissionError {
            failures: vec![
                PermissionFailure {
                    path: PathBuf::from("/out/dice/0/data/a"),
                    reason: "Operation not permitted".to_string(),
                },
                PermissionFailure {
                    path: PathBuf::from("/out/dice/0/logs/b"),
                    reason: "Operation not permitted".to_string(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 path(s)"), "{}", msg);
        assert!(msg.contains("/out/dice/0/data/a"), "{}", msg);
        assert!(msg.contains("/out/dice/0/logs/b"), "{}", msg);
    }

    #[test]
    fn merge_drops_empty_aggregates() {
        assert!(PermissionError::merge(vec![PermissionError { failures: vec![] }]).is_none());
    }

    #[test]
    fn partial_apply_reports_both_sides() {
        let err = ReproductionError::PartialApply {
            applied: vec![PathBuf::from(".")],
            failed: vec![ChunkFailure {
                path: PathBuf::from("lib/sub"),
                reason: ChunkFailureReason::SubmoduleMissing,
            }],
        };
        let msg = err.to_string();
        assert!(msg.contains("applied: [.]"), "{}", msg);
        assert!(msg.contains("lib/sub (sub-repository missing)"), "{}", msg);
    }

    #[test]
    fn only_conflict_is_retryable() {
        let conflict = SimError::Conflict {
            parent: PathBuf::from("/out/dice"),
            index: 2,
        };
        assert!(conflict.is_retryable());
        let io = SimError::io("/out", io::Error::new(io::ErrorKind::Other, "disk full"));
        assert!(!io.is_retryable());
        assert!(io.to_string().contains("/out"));
    }
}
