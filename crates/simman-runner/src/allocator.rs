use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{IoContext, Result, SimError};
use crate::fsutil::ensure_dir;

pub const DEFAULT_ALLOCATION_ATTEMPTS: u32 = 16;

/// A claimed run index and the directory created for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub index: u64,
    pub output_dir: PathBuf,
}

/// Claims `root_dir/name/<max+1>` with a single exclusive `mkdir`.
///
/// Losing the race to another process yields [`SimError::Conflict`]; the
/// caller decides whether to rescan.
pub fn allocate(root_dir: &Path, name: &str) -> Result<Allocation> {
    let parent = root_dir.join(name);
    ensure_dir(&parent)?;
    let index = next_index(&parent)?;
    claim(&parent, index)
}

/// Creates `parent/<index>` exclusively. The mkdir is the reservation.
fn claim(parent: &Path, index: u64) -> Result<Allocation> {
    let output_dir = parent.join(index.to_string());
    match fs::create_dir(&output_dir) {
        Ok(()) => {
            info!(index, dir = %output_dir.display(), "claimed run index");
            Ok(Allocation { index, output_dir })
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            debug!(index, parent = %parent.display(), "run index already claimed");
            Err(SimError::Conflict {
                parent: parent.to_path_buf(),
                index,
            })
        }
        Err(e) => Err(SimError::io(&output_dir, e)),
    }
}

/// [`allocate`], rescanning after each lost race up to `attempts` times.
pub fn allocate_with_retry(root_dir: &Path, name: &str, attempts: u32) -> Result<Allocation> {
    let attempts = attempts.max(1);
    let mut last = None;
    for _ in 0..attempts {
        match allocate(root_dir, name) {
            Err(err) if err.is_retryable() => last = Some(err),
            other => return other,
        }
    }
    Err(last.unwrap_or_else(|| SimError::Conflict {
        parent: root_dir.join(name),
        index: 0,
    }))
}

/// One past the largest numeric entry in `parent`, or 0 when there is none.
/// Non-numeric names such as `latest` are ignored.
pub fn next_index(parent: &Path) -> Result<u64> {
    let entries = match fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(SimError::io(parent, e)),
    };
    let mut next = 0u64;
    for entry in entries {
        let entry = entry.at(parent)?;
        let name = entry.file_name();
        let Some(index) = name.to_str().and_then(parse_index) else {
            continue;
        };
        next = next.max(index.saturating_add(1));
    }
    Ok(next)
}

fn parse_index(name: &str) -> Option<u64> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}
