//! Whole-document JSON persistence.
//!
//! Every save is a full overwrite through a sibling temp file + rename, so a crash
//! mid-write never leaves a truncated document behind.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{de::DeserializeOwned, Serialize};

use crate::{errors::Error, Result};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value)?;
    write_text_atomic(path, &body)
}

pub fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::InvalidPath {
            path: path.to_path_buf(),
            reason: "destination path cannot be empty".to_string(),
        });
    }
    if path.is_dir() {
        return Err(Error::InvalidPath {
            path: path.to_path_buf(),
            reason: "destination path is a directory".to_string(),
        });
    }

    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent_dir).map_err(|source| Error::Persistence {
        path: parent_dir.to_path_buf(),
        source,
    })?;

    let temp_path = temp_path_for(parent_dir, path);
    fs::write(&temp_path, content).map_err(|source| Error::Persistence {
        path: temp_path.clone(),
        source,
    })?;
    if let Err(source) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(Error::Persistence {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

/// Read a JSON document; a missing file is `Ok(None)`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let txt = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    };
    Ok(Some(serde_json::from_str(&txt)?))
}

/// Remove a directory tree; a missing directory is not an error.
pub fn remove_dir_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::Io(e)),
    }
}

fn temp_path_for(parent_dir: &Path, path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");
    parent_dir.join(format!(
        ".{name}.tmp-{}-{}",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_json_atomic_creates_parents_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/database.json");

        write_json_atomic(&path, &serde_json::json!({"chats": {}, "users": {}})).unwrap();
        write_json_atomic(&path, &serde_json::json!({"chats": {"x": 1}})).unwrap();

        let v: serde_json::Value = read_json(&path).unwrap().unwrap();
        assert_eq!(v, serde_json::json!({"chats": {"x": 1}}));

        // No temp files are left next to the document.
        let leftovers = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn read_json_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let v: Option<serde_json::Value> = read_json(&dir.path().join("nope.json")).unwrap();
        assert!(v.is_none());
    }

    #[test]
    fn write_rejects_directory_destination() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_text_atomic(dir.path(), "x").unwrap_err();
        assert!(matches!(err, Error::InvalidPath { .. }));
    }

    #[test]
    fn remove_dir_if_exists_reports_presence() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sessions/6281111");
        fs::create_dir_all(&target).unwrap();
        assert!(remove_dir_if_exists(&target).unwrap());
        assert!(!remove_dir_if_exists(&target).unwrap());
    }
}
