use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use camino::Utf8Path;

use crate::error::SyncError;

pub fn write_file_atomic(path: &Utf8Path, content: &[u8]) -> Result<u64, SyncError> {
    let parent = path
        .parent()
        .ok_or_else(|| SyncError::Filesystem(format!("invalid destination path: {path}")))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| SyncError::Filesystem(format!("create {parent}: {err}")))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".xml-sync")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| SyncError::Filesystem(format!("write {path}: {err}")))?;
    temp.persist(path.as_std_path())
        .map_err(|err| SyncError::Filesystem(format!("persist {path}: {}", err.error)))?;
    let size = fs::metadata(path.as_std_path())
        .map_err(|err| SyncError::Filesystem(format!("stat {path}: {err}")))?
        .len();
    Ok(size)
}

pub fn remove_file_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

pub fn list_json_files(root: &Path) -> Result<Vec<PathBuf>, SyncError> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut items = Vec::new();
    let entries = fs::read_dir(root).map_err(|err| SyncError::Filesystem(err.to_string()))?;
    for entry in entries {
        let entry = entry.map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let path = entry.path();
        if path.is_file() && path.extension().map(|ext| ext == "json").unwrap_or(false) {
            items.push(path);
        }
    }
    items.sort();
    Ok(items)
}
