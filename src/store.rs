use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::error::HarvestError;

pub const METADATA_FILE: &str = "_metadata.json";

#[derive(Debug, Clone)]
pub struct OutputStore {
    root: Utf8PathBuf,
}

impl OutputStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn partition_dir(&self, partition: &str) -> Utf8PathBuf {
        self.root.join(partition)
    }

    pub fn metadata_path(&self, partition: &str) -> Utf8PathBuf {
        self.partition_dir(partition).join(METADATA_FILE)
    }

    pub fn ledger_path(&self, file_name: &str) -> Utf8PathBuf {
        self.root.join(file_name)
    }

    pub fn ensure_root(&self) -> Result<(), HarvestError> {
        ensure_dir(&self.root)
    }

    pub fn ensure_partition(&self, partition: &str) -> Result<Utf8PathBuf, HarvestError> {
        let dir = self.partition_dir(partition);
        ensure_dir(&dir)?;
        Ok(dir)
    }
}

pub fn ensure_dir(dir: &Utf8Path) -> Result<(), HarvestError> {
    fs::create_dir_all(dir.as_std_path())
        .map_err(|err| HarvestError::Filesystem(format!("create {dir}: {err}")))
}

pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), HarvestError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    let content =
        serde_json::to_vec_pretty(value).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".paper-harvest")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    temp.write_all(&content)
        .and_then(|_| temp.write_all(b"\n"))
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| HarvestError::Filesystem(format!("write {path}: {}", err.error)))?;
    Ok(())
}

pub fn remove_file_quiet(path: &Utf8Path) -> bool {
    path.as_std_path().exists() && fs::remove_file(path.as_std_path()).is_ok()
}

pub fn walk_files(root: &Path) -> Vec<PathBuf> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let Ok(entries) = fs::read_dir(&path) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                items.push(path);
            }
        }
    }
    items.sort();
    items
}
