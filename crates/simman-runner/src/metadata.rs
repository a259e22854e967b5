//! Repository snapshots that let a run's code state be rebuilt later.
//!
//! A snapshot is the HEAD commit of the repository plus an ordered list of
//! chunks, one per repository (the root is `.`, sub-repositories follow by
//! relative path). Each chunk carries that repository's own HEAD commit and
//! its working tree diff.
//!
//! On disk the chunks form the `.patch` stream. Every chunk starts with a
//! header line and is length-prefixed, so diff text can never be mistaken for
//! a delimiter:
//!
//! ```text
//! #simman-chunk path=. commit=<sha> bytes=<n>
//! <n bytes of diff>
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{
    ChunkFailure, ChunkFailureReason, IoContext, ReproductionError, Result, SimError,
};
use crate::fsutil::{atomic_write_bytes, atomic_write_json_pretty};
use crate::git::GitRepo;
use crate::paths::PathSet;

const CHUNK_HEADER: &str = "#simman-chunk ";
const ROOT_CHUNK: &str = ".";

pub const DEFAULT_VOLATILE_PATHS: &[&str] = &[".ipynb_checkpoints"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchChunk {
    /// Relative to the root repository; `.` for the root itself.
    pub path: PathBuf,
    pub commit_id: String,
    pub diff: String,
}

impl PatchChunk {
    pub fn is_root(&self) -> bool {
        self.path == Path::new(ROOT_CHUNK)
    }
}

/// Ordered chunks. The root chunk is always first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub chunks: Vec<PatchChunk>,
}

impl Patch {
    pub fn to_stream(&self) -> String {
        let mut out = String::new();
        for chunk in &self.chunks {
            out.push_str(&format!(
                "{}path={} commit={} bytes={}\n",
                CHUNK_HEADER,
                chunk.path.display(),
                chunk.commit_id,
                chunk.diff.len()
            ));
            out.push_str(&chunk.diff);
            out.push('\n');
        }
        out
    }

    pub fn parse(stream: &str, source_name: &str) -> Result<Self, ReproductionError> {
        let malformed = |reason: String| ReproductionError::MalformedPatch {
            source_name: source_name.to_string(),
            reason,
        };
        let mut chunks = Vec::new();
        let mut rest = stream;
        while !rest.is_empty() {
            let (header, body) = rest
                .split_once('\n')
                .ok_or_else(|| malformed("truncated chunk header".to_string()))?;
            let fields = header
                .strip_prefix(CHUNK_HEADER)
                .ok_or_else(|| malformed(format!("expected chunk header, found {:?}", header)))?;
            let (path, commit_id, len) = parse_header(fields).map_err(&malformed)?;
            if body.len() <= len || !body.is_char_boundary(len) {
                return Err(malformed(format!(
                    "chunk {} declares {} bytes but stream ends early",
                    path, len
                )));
            }
            let (diff, tail) = body.split_at(len);
            rest = tail
                .strip_prefix('\n')
                .ok_or_else(|| malformed(format!("chunk {} is not newline terminated", path)))?;
            chunks.push(PatchChunk {
                path: PathBuf::from(path),
                commit_id: commit_id.to_string(),
                diff: diff.to_string(),
            });
        }
        match chunks.first() {
            Some(first) if first.is_root() => Ok(Patch { chunks }),
            Some(first) => Err(malformed(format!(
                "first chunk must be the root repository, found {}",
                first.path.display()
            ))),
            None => Err(malformed("no chunks".to_string())),
        }
    }

    pub fn root(&self) -> Option<&PatchChunk> {
        self.chunks.first().filter(|c| c.is_root())
    }

    pub fn is_clean(&self) -> bool {
        self.chunks.iter().all(|c| c.diff.is_empty())
    }
}

fn parse_header(fields: &str) -> std::result::Result<(&str, &str, usize), String> {
    // `bytes=` and `commit=` never contain spaces; the path may.
    let (head, bytes) = fields
        .rsplit_once(" bytes=")
        .ok_or_else(|| format!("missing bytes= in {:?}", fields))?;
    let (path, commit) = head
        .rsplit_once(" commit=")
        .ok_or_else(|| format!("missing commit= in {:?}", fields))?;
    let path = path
        .strip_prefix("path=")
        .ok_or_else(|| format!("missing path= in {:?}", fields))?;
    let len = bytes
        .parse::<usize>()
        .map_err(|_| format!("invalid byte count {:?}", bytes))?;
    if path.is_empty() || commit.is_empty() {
        return Err(format!("empty path or commit in {:?}", fields));
    }
    Ok((path, commit, len))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub path: PathBuf,
    pub commit_id: String,
    pub diff_bytes: usize,
}

/// Sidecar written next to `.commit_id` and `.patch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataManifest {
    pub schema_version: String,
    pub commit_id: String,
    pub captured_at: DateTime<Utc>,
    pub patch_sha256: String,
    pub command: Option<String>,
    pub chunks: Vec<ChunkSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    pub commit_id: String,
    pub patch: Patch,
    pub captured_at: DateTime<Utc>,
    pub command: Option<String>,
}

impl MetadataRecord {
    /// Writes `.commit_id`, `.patch`, `.command` and `.metadata.json` into
    /// the run's output directory.
    pub fn write(&self, paths: &PathSet) -> Result<()> {
        let stream = self.patch.to_stream();
        atomic_write_bytes(&paths.commit_id_file(), self.commit_id.as_bytes())?;
        atomic_write_bytes(&paths.patch_file(), stream.as_bytes())?;
        if let Some(command) = &self.command {
            atomic_write_bytes(&paths.command_file(), command.as_bytes())?;
        }
        let manifest = MetadataManifest {
            schema_version: "simman_metadata_v1".to_string(),
            commit_id: self.commit_id.clone(),
            captured_at: self.captured_at,
            patch_sha256: sha256_hex(stream.as_bytes()),
            command: self.command.clone(),
            chunks: self
                .patch
                .chunks
                .iter()
                .map(|c| ChunkSummary {
                    path: c.path.clone(),
                    commit_id: c.commit_id.clone(),
                    diff_bytes: c.diff.len(),
                })
                .collect(),
        };
        atomic_write_json_pretty(&paths.metadata_file(), &manifest)
    }

    /// Reads a record back from a run directory. The `.patch` digest is
    /// checked against `.metadata.json` when the sidecar is present.
    pub fn load(paths: &PathSet) -> Result<Self> {
        let commit_path = paths.commit_id_file();
        let patch_path = paths.patch_file();
        let commit_id = fs::read_to_string(&commit_path)
            .at(&commit_path)?
            .trim()
            .to_string();
        let stream = fs::read_to_string(&patch_path).at(&patch_path)?;
        let manifest = read_manifest(&paths.metadata_file())?;
        if let Some(manifest) = &manifest {
            let actual = sha256_hex(stream.as_bytes());
            if actual != manifest.patch_sha256 {
                return Err(ReproductionError::DigestMismatch {
                    path: patch_path,
                    expected: manifest.patch_sha256.clone(),
                    actual,
                }
                .into());
            }
        }
        let patch = Patch::parse(&stream, &patch_path.display().to_string())?;
        if patch.root().map(|c| c.commit_id.as_str()) != Some(commit_id.as_str()) {
            return Err(ReproductionError::MalformedPatch {
                source_name: patch_path.display().to_string(),
                reason: format!(
                    "root chunk commit does not match {} ({})",
                    commit_path.display(),
                    commit_id
                ),
            }
            .into());
        }
        let command_path = paths.command_file();
        let command = match fs::read_to_string(&command_path) {
            Ok(c) => Some(c),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(SimError::io(&command_path, e)),
        };
        Ok(MetadataRecord {
            commit_id,
            captured_at: manifest
                .map(|m| m.captured_at)
                .unwrap_or_else(Utc::now),
            patch,
            command,
        })
    }
}

fn read_manifest(path: &Path) -> Result<Option<MetadataManifest>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(SimError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| SimError::io(path, std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Captures and restores repository state.
#[derive(Debug, Clone)]
pub struct MetadataRecorder {
    volatile_paths: Vec<String>,
}

impl Default for MetadataRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_VOLATILE_PATHS.iter().map(|s| s.to_string()).collect())
    }
}

impl MetadataRecorder {
    /// `volatile_paths` are file or directory names excluded from diffs and
    /// from the untracked-file check wherever they occur.
    pub fn new(volatile_paths: Vec<String>) -> Self {
        Self { volatile_paths }
    }

    pub fn volatile_paths(&self) -> &[String] {
        &self.volatile_paths
    }

    /// Snapshots the repository containing `repo_dir` and its initialized
    /// sub-repositories. Untracked files outside the volatile paths are
    /// rejected because the diff would not contain them.
    pub fn capture(&self, repo_dir: &Path) -> Result<MetadataRecord, ReproductionError> {
        let captured_at = Utc::now();
        let root = GitRepo::discover(repo_dir)?;
        let mut chunks = vec![self.capture_chunk(&root, PathBuf::from(ROOT_CHUNK))?];
        for sub in root.submodules()? {
            if !sub.initialized {
                warn!(path = %sub.path.display(), "skipping uninitialized sub-repository");
                continue;
            }
            let repo = GitRepo::at(&root.dir().join(&sub.path));
            chunks.push(self.capture_chunk(&repo, sub.path)?);
        }
        let commit_id = chunks[0].commit_id.clone();
        info!(
            repo = %root.dir().display(),
            commit = %commit_id,
            chunks = chunks.len(),
            "captured repository state"
        );
        Ok(MetadataRecord {
            commit_id,
            patch: Patch { chunks },
            captured_at,
            command: None,
        })
    }

    fn capture_chunk(
        &self,
        repo: &GitRepo,
        path: PathBuf,
    ) -> Result<PatchChunk, ReproductionError> {
        let untracked: Vec<String> = repo
            .untracked()?
            .into_iter()
            .filter(|f| !self.is_volatile(f))
            .collect();
        if !untracked.is_empty() {
            return Err(ReproductionError::UntrackedFiles {
                repo: repo.dir().to_path_buf(),
                files: untracked,
            });
        }
        Ok(PatchChunk {
            path,
            commit_id: repo.head()?,
            diff: repo.diff_head(&self.volatile_paths)?,
        })
    }

    fn is_volatile(&self, status_path: &str) -> bool {
        status_path
            .trim_matches('"')
            .split('/')
            .any(|component| self.volatile_paths.iter().any(|v| v == component))
    }

    /// Rebuilds the captured state in the repository containing `repo_dir`.
    ///
    /// Every repository involved must be clean. The root is checked out at
    /// the recorded commit, sub-repositories are initialized, then each chunk
    /// is moved to its own commit and its diff applied. Chunk failures do not
    /// stop the remaining chunks; they are reported together.
    pub fn apply(&self, record: &MetadataRecord, repo_dir: &Path) -> Result<(), ReproductionError> {
        let root = GitRepo::discover(repo_dir)?;
        self.ensure_clean(&root)?;
        for sub in root.submodules()? {
            if sub.initialized {
                self.ensure_clean(&GitRepo::at(&root.dir().join(&sub.path)))?;
            }
        }

        root.checkout(&record.commit_id)?;
        root.update_submodules()?;

        let mut applied = Vec::new();
        let mut failed = Vec::new();
        for chunk in &record.patch.chunks {
            match apply_chunk(root.dir(), chunk) {
                Ok(()) => applied.push(chunk.path.clone()),
                Err(reason) => {
                    warn!(path = %chunk.path.display(), %reason, "chunk failed to apply");
                    failed.push(ChunkFailure {
                        path: chunk.path.clone(),
                        reason,
                    });
                }
            }
        }
        if !failed.is_empty() {
            return Err(ReproductionError::PartialApply { applied, failed });
        }
        info!(
            repo = %root.dir().display(),
            commit = %record.commit_id,
            chunks = applied.len(),
            "restored repository state"
        );
        Ok(())
    }

    fn ensure_clean(&self, repo: &GitRepo) -> Result<(), ReproductionError> {
        let dirty: Vec<String> = repo
            .status()?
            .into_iter()
            .filter(|line| !(line.starts_with("?? ") && self.is_volatile(&line[3..])))
            .collect();
        if dirty.is_empty() {
            Ok(())
        } else {
            Err(ReproductionError::DirtyTree {
                repo: repo.dir().to_path_buf(),
                status: dirty.join("\n"),
            })
        }
    }

    /// Stream form of [`MetadataRecorder::capture`], as emitted by
    /// `subpatch make`.
    pub fn make_patch(&self, repo_dir: &Path) -> Result<String, ReproductionError> {
        Ok(self.capture(repo_dir)?.patch.to_stream())
    }

    /// Applies a patch stream to the current checkout without moving the
    /// root repository, as `subpatch apply` does. Sub-repositories are still
    /// moved to their recorded commits.
    pub fn apply_patch(&self, stream: &str, repo_dir: &Path) -> Result<(), ReproductionError> {
        let patch = Patch::parse(stream, "<stdin>")?;
        let root = GitRepo::discover(repo_dir)?;
        let mut applied = Vec::new();
        let mut failed = Vec::new();
        for chunk in &patch.chunks {
            let result = if chunk.is_root() {
                apply_diff(root.dir(), &chunk.diff)
            } else {
                apply_chunk(root.dir(), chunk)
            };
            match result {
                Ok(()) => applied.push(chunk.path.clone()),
                Err(reason) => failed.push(ChunkFailure {
                    path: chunk.path.clone(),
                    reason,
                }),
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(ReproductionError::PartialApply { applied, failed })
        }
    }
}

fn apply_chunk(root: &Path, chunk: &PatchChunk) -> Result<(), ChunkFailureReason> {
    let dir = root.join(&chunk.path);
    if !chunk.is_root() {
        if !dir.join(".git").exists() {
            return Err(ChunkFailureReason::SubmoduleMissing);
        }
        let repo = GitRepo::at(&dir);
        let head = repo
            .head()
            .map_err(|e| ChunkFailureReason::CheckoutFailed(e.to_string()))?;
        if head != chunk.commit_id {
            repo.checkout(&chunk.commit_id)
                .map_err(|e| ChunkFailureReason::CheckoutFailed(e.to_string()))?;
        }
    }
    apply_diff(&dir, &chunk.diff)
}

fn apply_diff(dir: &Path, diff: &str) -> Result<(), ChunkFailureReason> {
    if diff.is_empty() {
        return Ok(());
    }
    GitRepo::at(dir)
        .apply(diff)
        .map_err(|e| ChunkFailureReason::ApplyFailed(e.to_string()))
}
