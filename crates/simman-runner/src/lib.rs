//! Reproducible simulation runs.
//!
//! [`SimulationSession`] claims a numbered output directory under
//! `root_dir/name`, records the repository state needed to rebuild the code
//! that produced it, and write-protects the run when it ends.

use std::path::Path;

mod allocator;
mod config;
mod error;
mod fsutil;
mod git;
mod metadata;
mod paths;
mod permissions;
mod session;

pub use allocator::{
    allocate, allocate_with_retry, next_index, Allocation, DEFAULT_ALLOCATION_ATTEMPTS,
};
pub use config::{find_config, SimmanConfig, CONFIG_FILE, CONFIG_TEMPLATE};
pub use error::{
    ChunkFailure, ChunkFailureReason, PermissionError, PermissionFailure, ReproductionError,
    Result, RunError, SetupError, SimError,
};
pub use fsutil::{shell_join, shell_quote};
pub use metadata::{
    ChunkSummary, MetadataManifest, MetadataRecord, MetadataRecorder, Patch, PatchChunk,
    DEFAULT_VOLATILE_PATHS,
};
pub use paths::{param_string, PathSet};
pub use permissions::{seal, set_state, state_of, unseal, PermissionState};
pub use session::{Run, SessionState, SimulationSession, LATEST_LINK};

/// Rebuilds the code state recorded in a run directory inside the repository
/// containing `repo_dir`: checks out `.commit_id`, initializes
/// sub-repositories and applies `.patch`.
pub fn checkout_simulation(
    output_dir: &Path,
    repo_dir: &Path,
    recorder: &MetadataRecorder,
) -> Result<MetadataRecord> {
    let paths = PathSet::for_output_dir(output_dir);
    let record = MetadataRecord::load(&paths)?;
    recorder.apply(&record, repo_dir)?;
    Ok(record)
}
