//! Write protection for run subtrees.
//!
//! Sealing clears the write bits for owner, group and other while keeping
//! read and traverse bits, so a sealed tree stays browsable. The state lives
//! in the filesystem and outlives the process. Unsealing restores owner write
//! only. Symbolic links are never followed and never modified.

use std::fs;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{PermissionError, PermissionFailure};

const ALL_WRITE: u32 = 0o222;
const OWNER_WRITE: u32 = 0o200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    Writable,
    ReadOnly,
}

impl PermissionState {
    fn target_mode(self, mode: u32) -> u32 {
        match self {
            PermissionState::ReadOnly => mode & !ALL_WRITE,
            PermissionState::Writable => mode | OWNER_WRITE,
        }
    }
}

pub fn seal(dir: &Path, recursive: bool) -> Result<(), PermissionError> {
    set_state(dir, recursive, PermissionState::ReadOnly)
}

pub fn unseal(dir: &Path, recursive: bool) -> Result<(), PermissionError> {
    set_state(dir, recursive, PermissionState::Writable)
}

/// Moves every entry under `dir` to `state`, continuing past failures and
/// returning all of them at once.
pub fn set_state(
    dir: &Path,
    recursive: bool,
    state: PermissionState,
) -> Result<(), PermissionError> {
    let mut failures = Vec::new();
    let mut changed = 0usize;
    let walker = WalkDir::new(dir)
        .follow_links(false)
        .max_depth(if recursive { usize::MAX } else { 0 });
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e
                    .path()
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| dir.to_path_buf());
                failures.push(PermissionFailure {
                    path,
                    reason: e.to_string(),
                });
                continue;
            }
        };
        if entry.path_is_symlink() {
            continue;
        }
        match apply_mode(entry.path(), state) {
            Ok(true) => changed += 1,
            Ok(false) => {}
            Err(reason) => failures.push(PermissionFailure {
                path: entry.path().to_path_buf(),
                reason,
            }),
        }
    }
    debug!(
        dir = %dir.display(),
        ?state,
        changed,
        failed = failures.len(),
        "permission walk finished"
    );
    if failures.is_empty() {
        Ok(())
    } else {
        Err(PermissionError { failures })
    }
}

/// Returns whether the mode had to change.
#[cfg(unix)]
fn apply_mode(path: &Path, state: PermissionState) -> Result<bool, String> {
    let meta = fs::symlink_metadata(path).map_err(|e| e.to_string())?;
    let mode = meta.permissions().mode();
    let target = state.target_mode(mode);
    if target == mode {
        return Ok(false);
    }
    fs::set_permissions(path, fs::Permissions::from_mode(target)).map_err(|e| e.to_string())?;
    Ok(true)
}

// Without POSIX mode bits the readonly attribute is the closest equivalent.
#[cfg(not(unix))]
fn apply_mode(path: &Path, state: PermissionState) -> Result<bool, String> {
    let meta = fs::symlink_metadata(path).map_err(|e| e.to_string())?;
    let mut perms = meta.permissions();
    let readonly = state == PermissionState::ReadOnly;
    if perms.readonly() == readonly {
        return Ok(false);
    }
    perms.set_readonly(readonly);
    fs::set_permissions(path, perms).map_err(|e| e.to_string())?;
    Ok(true)
}

/// `ReadOnly` when no write bit is set on `path` itself.
#[cfg(unix)]
pub fn state_of(path: &Path) -> std::io::Result<PermissionState> {
    let mode = fs::symlink_metadata(path)?.permissions().mode();
    Ok(if mode & ALL_WRITE == 0 {
        PermissionState::ReadOnly
    } else {
        PermissionState::Writable
    })
}

#[cfg(not(unix))]
pub fn state_of(path: &Path) -> std::io::Result<PermissionState> {
    Ok(if fs::symlink_metadata(path)?.permissions().readonly() {
        PermissionState::ReadOnly
    } else {
        PermissionState::Writable
    })
}
