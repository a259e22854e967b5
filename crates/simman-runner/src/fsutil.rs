use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::Utc;

use crate::error::{IoContext, Result, SimError};

pub(crate) fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).at(path)
}

/// Writes through a temp file in the same directory and renames it over
/// `path`, so readers never observe a half-written file.
pub(crate) fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = parent.join(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp).at(&tmp)?;
    file.write_all(bytes).at(&tmp)?;
    file.sync_all().at(&tmp)?;
    fs::rename(&tmp, path).at(path)?;
    if let Ok(dir) = fs::File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

pub(crate) fn atomic_write_json_pretty<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| {
        SimError::io(path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    atomic_write_bytes(path, &bytes)
}

/// Points `link` at `target` by renaming a freshly created symlink over it.
#[cfg(unix)]
pub(crate) fn replace_symlink(target: &Path, link: &Path) -> Result<()> {
    let parent = link.parent().unwrap_or(Path::new("."));
    let name = link
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("link");
    let tmp = parent.join(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    std::os::unix::fs::symlink(target, &tmp).at(&tmp)?;
    if let Err(e) = fs::rename(&tmp, link) {
        let _ = fs::remove_file(&tmp);
        return Err(SimError::io(link, e));
    }
    Ok(())
}

/// Platforms without cheap symlinks get a plain file holding the target.
#[cfg(not(unix))]
pub(crate) fn replace_symlink(target: &Path, link: &Path) -> Result<()> {
    atomic_write_bytes(link, target.to_string_lossy().as_bytes())
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use testutil::{remove_tree, temp_root};

    #[test]
    fn atomic_write_replaces_content() {
        let root = temp_root("atomic");
        let path = root.join(".commit_id");
        atomic_write_bytes(&path, b"first").expect("write");
        atomic_write_bytes(&path, b"second").expect("rewrite");
        assert_eq!(fs::read(&path).expect("read"), b"second");
        let leftovers: Vec<_> = fs::read_dir(&root)
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
        remove_tree(&root);
    }

    #[cfg(unix)]
    #[test]
    fn replace_symlink_swaps_target() {
        let root = temp_root("symlink");
        let link = root.join("latest");
        replace_symlink(Path::new("0"), &link).expect("first link");
        replace_symlink(Path::new("1"), &link).expect("second link");
        assert_eq!(fs::read_link(&link).expect("read link"), Path::new("1"));
        remove_tree(&root);
    }

    #[test]
    fn shell_quote_wraps_unsafe_args() {
        assert_eq!(shell_quote("run.py"), "run.py");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
        assert_eq!(
            shell_join(&["python".to_string(), "--seed=3".to_string()]),
            "python --seed=3"
        );
    }
}
