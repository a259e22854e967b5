use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::ReproductionError;

/// A working tree the `git` binary is invoked in.
#[derive(Debug, Clone)]
pub(crate) struct GitRepo {
    dir: PathBuf,
}

/// A sub-repository as listed by `git submodule status --recursive`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Submodule {
    pub path: PathBuf,
    pub initialized: bool,
}

impl GitRepo {
    /// Resolves the top level of the repository containing `dir`.
    pub(crate) fn discover(dir: &Path) -> Result<Self, ReproductionError> {
        let probe = GitRepo {
            dir: dir.to_path_buf(),
        };
        match probe.run(&["rev-parse", "--show-toplevel"]) {
            Ok(top) => Ok(GitRepo {
                dir: PathBuf::from(top.trim_end_matches('\n')),
            }),
            Err(ReproductionError::Git { stderr, .. }) => Err(ReproductionError::NotARepository {
                dir: dir.to_path_buf(),
                stderr,
            }),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn at(dir: &Path) -> Self {
        GitRepo {
            dir: dir.to_path_buf(),
        }
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn head(&self) -> Result<String, ReproductionError> {
        Ok(self.run(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// `git status --porcelain` lines. Moved or modified submodules are
    /// listed; untracked content inside them is left to their own status.
    pub(crate) fn status(&self) -> Result<Vec<String>, ReproductionError> {
        let out = self.run(&[
            "status",
            "--porcelain",
            "--untracked-files=all",
            "--ignore-submodules=untracked",
        ])?;
        Ok(out.lines().map(str::to_string).collect())
    }

    pub(crate) fn untracked(&self) -> Result<Vec<String>, ReproductionError> {
        Ok(self
            .status()?
            .into_iter()
            .filter_map(|line| line.strip_prefix("?? ").map(str::to_string))
            .collect())
    }

    /// Working tree diff against HEAD. Submodule pointers are excluded; each
    /// sub-repository contributes its own diff.
    pub(crate) fn diff_head(&self, volatile: &[String]) -> Result<String, ReproductionError> {
        let mut args: Vec<String> = [
            "diff",
            "HEAD",
            "--binary",
            "--no-color",
            "--no-ext-diff",
            "--ignore-submodules=all",
            "--",
            ".",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        for name in volatile {
            args.push(format!(":(glob,exclude)**/{}/**", name));
            args.push(format!(":(glob,exclude)**/{}", name));
        }
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&refs)
    }

    pub(crate) fn submodules(&self) -> Result<Vec<Submodule>, ReproductionError> {
        let out = self.run(&["submodule", "status", "--recursive"])?;
        Ok(out.lines().filter_map(parse_submodule_line).collect())
    }

    pub(crate) fn checkout(&self, commit: &str) -> Result<(), ReproductionError> {
        self.run(&["checkout", "--quiet", "--detach", commit])
            .map(|_| ())
    }

    pub(crate) fn update_submodules(&self) -> Result<(), ReproductionError> {
        self.run(&["submodule", "update", "--init", "--recursive", "--quiet"])
            .map(|_| ())
    }

    pub(crate) fn apply(&self, diff: &str) -> Result<(), ReproductionError> {
        self.run_with_input(&["apply", "--whitespace=nowarn", "-"], diff.as_bytes())
            .map(|_| ())
    }

    pub(crate) fn run(&self, args: &[&str]) -> Result<String, ReproductionError> {
        self.exec(args, None)
    }

    pub(crate) fn run_with_input(
        &self,
        args: &[&str],
        input: &[u8],
    ) -> Result<String, ReproductionError> {
        self.exec(args, Some(input))
    }

    fn exec(&self, args: &[&str], input: Option<&[u8]>) -> Result<String, ReproductionError> {
        debug!(dir = %self.dir.display(), ?args, "git");
        let fail = |stderr: String| ReproductionError::Git {
            dir: self.dir.clone(),
            args: args.iter().map(|s| s.to_string()).collect(),
            stderr,
        };
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| fail(e.to_string()))?;
        if let (Some(bytes), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(bytes).map_err(|e| fail(e.to_string()))?;
        }
        let output = child.wait_with_output().map_err(|e| fail(e.to_string()))?;
        if !output.status.success() {
            return Err(fail(String::from_utf8_lossy(&output.stderr).trim().to_string()));
        }
        String::from_utf8(output.stdout)
            .map_err(|_| fail("output is not valid UTF-8".to_string()))
    }
}

/// ` <sha> <path> (<describe>)`; a leading `-` marks an uninitialized module.
fn parse_submodule_line(line: &str) -> Option<Submodule> {
    let mut chars = line.chars();
    let flag = chars.next()?;
    let rest = chars.as_str();
    let (_sha, tail) = rest.split_once(' ')?;
    let path = match tail.rfind(" (") {
        Some(idx) if tail.ends_with(')') => &tail[..idx],
        _ => tail,
    };
    if path.is_empty() {
        return None;
    }
    Some(Submodule {
        path: PathBuf::from(path),
        initialized: flag != '-',
    })
}
