//! Shared utility functions.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::task::spawn_blocking;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::{Error, Result};

pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Recursively copy a file or directory tree to `dest`.
///
/// `dest` must not exist yet; its parent directory is created if needed.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let meta = std::fs::metadata(src)?;
    if meta.is_file() {
        std::fs::copy(src, dest)?;
        return Ok(());
    }

    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry.map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Remove a file, symlink or directory tree. Missing paths are not an error.
pub fn remove_path(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path)?,
        Ok(_) => std::fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// A sibling path with a unique hidden name, used as a temp target before rename.
pub fn temp_sibling(path: &Path, tag: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let short = Uuid::new_v4().simple().to_string();
    path.with_file_name(format!(".{}-{}-{}", name, tag, &short[..8]))
}

/// Serialize `value` as pretty JSON and write it with temp-then-rename.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec_pretty(value)?;
    let tmp = temp_sibling(path, "tmp");
    tokio::fs::write(&tmp, body).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Quote a string for safe inclusion in a bash command line.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Last `n` lines of `text`.
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
