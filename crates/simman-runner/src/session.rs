//! Scoped simulation runs.
//!
//! A session claims `root_dir/name/<index>`, lays out its subdirectories,
//! records the repository state and, when it ends for any reason, seals
//! `data`, `logs` and `simulation`. `results` stays writable for later
//! analysis.
//!
//! States: `Created -> Active -> Finalized`, or `Created -> Aborted` when
//! setup fails. A failing body still ends in `Finalized`, with an `.error`
//! marker in the run directory.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::allocator::{allocate_with_retry, DEFAULT_ALLOCATION_ATTEMPTS};
use crate::config::SimmanConfig;
use crate::error::{IoContext, PermissionError, Result, RunError, SetupError, SimError};
use crate::fsutil::{atomic_write_bytes, atomic_write_json_pretty, replace_symlink, shell_join};
use crate::metadata::{MetadataRecord, MetadataRecorder};
use crate::paths::PathSet;
use crate::permissions;

pub const LATEST_LINK: &str = "latest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Active,
    Finalized,
    Aborted,
}

/// One execution of a simulation. Immutable once allocated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Run {
    pub name: String,
    pub root_dir: PathBuf,
    pub index: u64,
    pub created_at: DateTime<Utc>,
    pub output_dir: PathBuf,
}

impl Run {
    pub fn latest_link(&self) -> PathBuf {
        self.root_dir.join(&self.name).join(LATEST_LINK)
    }
}

#[derive(Serialize)]
struct Description {
    title: String,
    reason: String,
    result: String,
    keywords: Vec<String>,
}

#[derive(Serialize)]
struct ErrorMarker<'a> {
    failed_at: DateTime<Utc>,
    error: &'a str,
}

#[derive(Serialize)]
struct SealedMarker {
    sealed_at: DateTime<Utc>,
    outcome: &'static str,
}

pub struct SimulationSession {
    name: String,
    root_dir: PathBuf,
    source_dir: PathBuf,
    command: Option<String>,
    suffix: String,
    allocation_attempts: u32,
    recorder: MetadataRecorder,
    state: SessionState,
    run: Option<Run>,
    paths: Option<PathSet>,
    metadata: Option<MetadataRecord>,
}

impl SimulationSession {
    pub fn new(name: impl Into<String>, root_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root_dir: root_dir.into(),
            source_dir: PathBuf::from("."),
            command: None,
            suffix: String::new(),
            allocation_attempts: DEFAULT_ALLOCATION_ATTEMPTS,
            recorder: MetadataRecorder::default(),
            state: SessionState::Created,
            run: None,
            paths: None,
            metadata: None,
        }
    }

    pub fn from_config(name: impl Into<String>, config: &SimmanConfig) -> Result<Self> {
        let root_dir = config.require_root_dir()?.to_path_buf();
        Ok(Self::new(name, root_dir)
            .with_source_dir(&config.source_dir)
            .with_suffix(config.suffix.clone())
            .with_allocation_attempts(config.allocation_attempts)
            .with_recorder(MetadataRecorder::new(config.volatile_paths.clone())))
    }

    /// Any directory inside the repository to snapshot. Defaults to `.`.
    pub fn with_source_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.source_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Command line stored in `.command`. Defaults to this process's argv.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn with_allocation_attempts(mut self, attempts: u32) -> Self {
        self.allocation_attempts = attempts;
        self
    }

    pub fn with_recorder(mut self, recorder: MetadataRecorder) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn run_info(&self) -> Option<&Run> {
        self.run.as_ref()
    }

    pub fn paths(&self) -> Option<&PathSet> {
        self.paths.as_ref()
    }

    pub fn metadata(&self) -> Option<&MetadataRecord> {
        self.metadata.as_ref()
    }

    /// Claims a run directory, lays it out and records the repository state.
    ///
    /// On failure the session moves to `Aborted`. A directory that was
    /// already claimed is left in place with a `.setup_failed` marker.
    pub fn start(&mut self) -> Result<&PathSet> {
        if self.state != SessionState::Created {
            return Err(self.invalid_state("start"));
        }
        if let Err(e) = std::fs::metadata(&self.root_dir).at(&self.root_dir) {
            self.state = SessionState::Aborted;
            return Err(SetupError {
                output_dir: None,
                source: Box::new(e),
            }
            .into());
        }
        let allocation =
            match allocate_with_retry(&self.root_dir, &self.name, self.allocation_attempts) {
                Ok(allocation) => allocation,
                Err(e) => {
                    self.state = SessionState::Aborted;
                    return Err(SetupError {
                        output_dir: None,
                        source: Box::new(e),
                    }
                    .into());
                }
            };
        let output_dir = allocation.output_dir.clone();
        match self.prepare(&output_dir) {
            Ok((paths, record)) => {
                info!(
                    name = %self.name,
                    index = allocation.index,
                    dir = %output_dir.display(),
                    commit = %record.commit_id,
                    "session started"
                );
                self.run = Some(Run {
                    name: self.name.clone(),
                    root_dir: self.root_dir.clone(),
                    index: allocation.index,
                    created_at: record.captured_at,
                    output_dir,
                });
                self.metadata = Some(record);
                self.state = SessionState::Active;
                Ok(&*self.paths.insert(paths))
            }
            Err(e) => {
                let marker = PathSet::for_output_dir(&output_dir).setup_failed_marker();
                let text = format!("failed_at: {}\nerror: {}\n", Utc::now().to_rfc3339(), e);
                if let Err(marker_err) = atomic_write_bytes(&marker, text.as_bytes()) {
                    warn!(
                        path = %marker.display(),
                        error = %marker_err,
                        "could not mark failed run"
                    );
                }
                self.state = SessionState::Aborted;
                Err(SetupError {
                    output_dir: Some(output_dir),
                    source: Box::new(e),
                }
                .into())
            }
        }
    }

    fn prepare(&self, output_dir: &Path) -> Result<(PathSet, MetadataRecord)> {
        let paths = PathSet::create(output_dir)?.with_suffix(self.suffix.clone());
        let mut record = self.recorder.capture(&self.source_dir)?;
        record.command = Some(
            self.command
                .clone()
                .unwrap_or_else(|| shell_join(&std::env::args().collect::<Vec<_>>())),
        );
        record.write(&paths)?;
        let description = Description {
            title: String::new(),
            reason: String::new(),
            result: String::new(),
            keywords: Vec::new(),
        };
        let yaml = serde_yaml::to_string(&description).map_err(|e| {
            SimError::io(
                paths.description_file(),
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;
        atomic_write_bytes(&paths.description_file(), yaml.as_bytes())?;
        Ok((paths, record))
    }

    /// Normal exit. Seals the run. Calling it again is a no-op.
    pub fn finish(&mut self) -> Result<()> {
        match self.state {
            SessionState::Active => self.finalize(None),
            _ => Ok(()),
        }
    }

    /// Exceptional exit. Writes `.error` with `failure`, then seals the run
    /// exactly as [`SimulationSession::finish`] does.
    pub fn fail(&mut self, failure: impl fmt::Display) -> Result<()> {
        match self.state {
            SessionState::Active => self.finalize(Some(failure.to_string())),
            _ => Ok(()),
        }
    }

    /// Starts the session, runs `body`, and finalizes on every exit path.
    /// A panic in `body` is finalized by `Drop` while unwinding.
    pub fn run<T, E, F>(mut self, body: F) -> std::result::Result<T, RunError<E>>
    where
        F: FnOnce(&PathSet) -> std::result::Result<T, E>,
        E: fmt::Display,
    {
        let paths = match self.start() {
            Ok(paths) => paths.clone(),
            Err(e) => return Err(RunError::Setup(e)),
        };
        match body(&paths) {
            Ok(value) => match self.finish() {
                Ok(()) => Ok(value),
                Err(e) => Err(RunError::Finalize(e)),
            },
            Err(error) => {
                let finalize = self.fail(&error).err();
                Err(RunError::Body { error, finalize })
            }
        }
    }

    /// Best effort: every step runs even when an earlier one fails.
    fn finalize(&mut self, failure: Option<String>) -> Result<()> {
        self.state = SessionState::Finalized;
        let (Some(paths), Some(run)) = (self.paths.clone(), self.run.clone()) else {
            return Ok(());
        };
        let mut errors = Vec::new();

        if let Some(message) = &failure {
            let marker = ErrorMarker {
                failed_at: Utc::now(),
                error: message,
            };
            if let Err(e) = atomic_write_json_pretty(&paths.error_marker(), &marker) {
                errors.push(e);
            }
        }
        let sealed = SealedMarker {
            sealed_at: Utc::now(),
            outcome: if failure.is_some() { "failure" } else { "success" },
        };
        if let Err(e) = atomic_write_json_pretty(&paths.sealed_marker(), &sealed) {
            errors.push(e);
        }

        let mut permission_errors = Vec::new();
        for dir in paths.sealed_dirs() {
            if let Err(e) = permissions::seal(dir, true) {
                permission_errors.push(e);
            }
        }
        for file in paths.record_files() {
            if file.exists() {
                if let Err(e) = permissions::seal(&file, false) {
                    permission_errors.push(e);
                }
            }
        }
        if let Some(e) = PermissionError::merge(permission_errors) {
            errors.push(e.into());
        }

        let link = run.latest_link();
        if let Err(e) = replace_symlink(Path::new(&run.index.to_string()), &link) {
            errors.push(e);
        }

        info!(
            name = %run.name,
            index = run.index,
            failed = failure.is_some(),
            errors = errors.len(),
            "session finalized"
        );
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(SimError::Finalize {
                output_dir: run.output_dir,
                errors,
            }),
        }
    }

    fn invalid_state(&self, action: &'static str) -> SimError {
        SimError::InvalidState {
            name: self.name.clone(),
            state: self.state,
            action,
        }
    }
}

impl Drop for SimulationSession {
    fn drop(&mut self) {
        if self.state != SessionState::Active {
            return;
        }
        let reason = if std::thread::panicking() {
            "simulation panicked"
        } else {
            "session dropped before finish"
        };
        if let Err(e) = self.finalize(Some(reason.to_string())) {
            warn!(name = %self.name, error = %e, "finalize on drop failed");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::fsutil::testutil::{git_available, init_repo, remove_tree, temp_root};
    use crate::paths::{ERROR_MARKER, SEALED_MARKER};
    use crate::permissions::{state_of, PermissionState};
    use std::fs;

    struct Fixture {
        root: PathBuf,
        repo: PathBuf,
        out: PathBuf,
    }

    fn fixture(tag: &str) -> Option<Fixture> {
        if !git_available() {
            return None;
        }
        let root = temp_root(tag);
        let repo = root.join("repo");
        init_repo(&repo, &[("dice.py", "import random\n")]);
        let out = root.join("out");
        fs::create_dir_all(&out).expect("out dir");
        Some(Fixture { root, repo, out })
    }

    fn session(fx: &Fixture) -> SimulationSession {
        SimulationSession::new("dice", &fx.out)
            .with_source_dir(&fx.repo)
            .with_command("python dice.py")
    }

    fn read_only(path: &Path) -> bool {
        state_of(path).expect("state") == PermissionState::ReadOnly
    }

    #[test]
    fn dice_scenario_seals_and_advances_index() {
        let Some(fx) = fixture("session_dice") else {
            return;
        };
        let mut first = session(&fx);
        assert_eq!(first.state(), SessionState::Created);
        let paths = first.start().expect("start").clone();
        assert_eq!(first.state(), SessionState::Active);
        assert_eq!(paths.output_dir(), fx.out.join("dice").join("0"));
        for dir in paths.subdirs() {
            assert!(dir.is_dir());
        }
        assert!(paths.commit_id_file().is_file());
        assert!(paths.patch_file().is_file());
        assert!(paths.description_file().is_file());
        assert_eq!(
            fs::read_to_string(paths.command_file()).expect("command"),
            "python dice.py"
        );

        let rolls = paths.simulation_dir().join("dice_rolls.txt");
        fs::write(&rolls, "3\n5\n").expect("write rolls");
        first.finish().expect("finish");
        assert_eq!(first.state(), SessionState::Finalized);

        assert!(read_only(&rolls));
        for dir in paths.sealed_dirs() {
            assert!(read_only(dir), "{} not sealed", dir.display());
        }
        assert!(!read_only(paths.results_dir()));
        assert!(read_only(&paths.patch_file()));
        assert!(!paths.error_marker().exists());
        assert_eq!(
            fs::read_link(fx.out.join("dice").join(LATEST_LINK)).expect("latest"),
            PathBuf::from("0")
        );

        let mut second = session(&fx);
        let second_paths = second.start().expect("second start").clone();
        assert_eq!(second_paths.output_dir(), fx.out.join("dice").join("1"));
        second.finish().expect("finish second");
        assert_eq!(fs::read_to_string(&rolls).expect("untouched"), "3\n5\n");
        assert_eq!(
            fs::read_link(fx.out.join("dice").join(LATEST_LINK)).expect("latest"),
            PathBuf::from("1")
        );
        remove_tree(&fx.root);
    }

    #[test]
    fn finish_twice_is_a_no_op() {
        let Some(fx) = fixture("session_twice") else {
            return;
        };
        let mut s = session(&fx);
        s.start().expect("start");
        s.finish().expect("first finish");
        s.finish().expect("second finish");
        s.fail("late failure").expect("fail after finish");
        let paths = s.paths().expect("paths");
        assert!(!paths.error_marker().exists());
        assert_eq!(s.state(), SessionState::Finalized);
        remove_tree(&fx.root);
    }

    #[derive(Debug)]
    struct ValueError(String);

    impl fmt::Display for ValueError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "ValueError: {}", self.0)
        }
    }

    #[test]
    fn failing_body_is_sealed_marked_and_propagated() {
        let Some(fx) = fixture("session_fail") else {
            return;
        };
        let result: std::result::Result<(), _> = session(&fx).run(|paths| {
            fs::write(paths.logs_dir().join("run.log"), "rolling\n").expect("log");
            Err(ValueError("die landed on its edge".to_string()))
        });
        let err = result.expect_err("body error must propagate");
        match err {
            RunError::Body { error, finalize } => {
                assert_eq!(error.0, "die landed on its edge");
                assert!(finalize.is_none(), "finalize failed: {:?}", finalize);
            }
            other => panic!("unexpected: {}", other),
        }
        let paths = PathSet::for_output_dir(fx.out.join("dice").join("0"));
        for dir in paths.sealed_dirs() {
            assert!(read_only(dir));
        }
        assert!(read_only(&paths.logs_dir().join("run.log")));
        let marker = fs::read_to_string(paths.output_dir().join(ERROR_MARKER)).expect("marker");
        assert!(marker.contains("die landed on its edge"), "{}", marker);
        let sealed = fs::read_to_string(paths.output_dir().join(SEALED_MARKER)).expect("sealed");
        assert!(sealed.contains("failure"), "{}", sealed);
        assert!(fx.out.join("dice").join(LATEST_LINK).exists());
        remove_tree(&fx.root);
    }

    #[test]
    fn scoped_run_returns_body_value() {
        let Some(fx) = fixture("session_ok") else {
            return;
        };
        let total = session(&fx)
            .run(|paths| fs::write(paths.data_dir().join("seed"), "3").map(|_| 42))
            .expect("run");
        assert_eq!(total, 42);
        let paths = PathSet::for_output_dir(fx.out.join("dice").join("0"));
        assert!(read_only(&paths.data_dir().join("seed")));
        remove_tree(&fx.root);
    }

    #[test]
    fn panic_in_body_still_seals() {
        let Some(fx) = fixture("session_panic") else {
            return;
        };
        let s = session(&fx);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _: std::result::Result<(), RunError<String>> =
                s.run(|_| panic!("integrator diverged"));
        }));
        assert!(outcome.is_err());
        let paths = PathSet::for_output_dir(fx.out.join("dice").join("0"));
        assert!(read_only(paths.simulation_dir()));
        let marker = fs::read_to_string(paths.error_marker()).expect("marker");
        assert!(marker.contains("panicked"), "{}", marker);
        remove_tree(&fx.root);
    }

    #[test]
    fn finalize_seals_what_it_can_and_reports_the_rest() {
        let Some(fx) = fixture("session_partial_seal") else {
            return;
        };
        let mut s = session(&fx);
        let paths = s.start().expect("start").clone();
        fs::write(paths.simulation_dir().join("dice_rolls.txt"), "2\n").expect("rolls");
        fs::remove_dir_all(paths.data_dir()).expect("remove data");

        match s.finish() {
            Err(SimError::Permission(err)) => {
                assert_eq!(err.paths(), vec![paths.data_dir()]);
            }
            other => panic!("expected permission error, got {:?}", other),
        }
        assert_eq!(s.state(), SessionState::Finalized);
        assert!(read_only(paths.logs_dir()));
        assert!(read_only(paths.simulation_dir()));
        assert!(read_only(&paths.simulation_dir().join("dice_rolls.txt")));
        assert!(read_only(&paths.commit_id_file()));
        assert_eq!(
            fs::read_link(fx.out.join("dice").join(LATEST_LINK)).expect("latest"),
            PathBuf::from("0")
        );
        s.finish().expect("second finish is a no-op");
        remove_tree(&fx.root);
    }

    #[test]
    fn dropping_active_session_finalizes() {
        let Some(fx) = fixture("session_drop") else {
            return;
        };
        {
            let mut s = session(&fx);
            s.start().expect("start");
        }
        let paths = PathSet::for_output_dir(fx.out.join("dice").join("0"));
        assert!(read_only(paths.data_dir()));
        assert!(paths.error_marker().exists());
        remove_tree(&fx.root);
    }

    #[test]
    fn setup_failure_keeps_marked_directory() {
        let root = temp_root("session_setup");
        let out = root.join("out");
        fs::create_dir_all(&out).expect("out");
        let not_a_repo = root.join("plain");
        fs::create_dir_all(&not_a_repo).expect("plain dir");
        let mut s = SimulationSession::new("dice", &out).with_source_dir(&not_a_repo);
        let err = s.start().expect_err("not a repository");
        match &err {
            SimError::Setup(setup) => {
                assert_eq!(setup.output_dir, Some(out.join("dice").join("0")));
            }
            other => panic!("unexpected: {}", other),
        }
        assert_eq!(s.state(), SessionState::Aborted);
        let run_dir = out.join("dice").join("0");
        assert!(run_dir.is_dir());
        assert!(PathSet::for_output_dir(&run_dir).setup_failed_marker().is_file());
        assert!(!read_only(&run_dir.join("data")));
        assert!(matches!(
            s.start(),
            Err(SimError::InvalidState { .. })
        ));
        s.finish().expect("finish after abort is a no-op");
        remove_tree(&root);
    }

    #[test]
    fn missing_root_dir_is_a_setup_error() {
        let root = temp_root("session_noroot");
        let mut s = SimulationSession::new("dice", root.join("absent"));
        match s.start() {
            Err(SimError::Setup(setup)) => assert!(setup.output_dir.is_none()),
            other => panic!("unexpected: {:?}", other.map(|p| p.clone())),
        }
        assert!(!root.join("absent").exists());
        remove_tree(&root);
    }
}
