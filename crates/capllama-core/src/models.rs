use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use serde::Serialize;

use crate::errors::{PluginError, Result};

pub const MODEL_EXT: &str = "gguf";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailableModel {
    pub name: String,
    pub path: String,
    pub size: u64,
}

impl AvailableModel {
    fn from_abs_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        if !ext.eq_ignore_ascii_case(MODEL_EXT) {
            return None;
        }
        let size = path.metadata().ok()?.len();
        Some(Self {
            name: path.file_name()?.to_string_lossy().into_owned(),
            path: path.to_string_lossy().into_owned(),
            size,
        })
    }
}

/// Every `.gguf` under `root`, recursively, sorted by name. A missing root is empty.
pub fn list_available_models(root: &Path) -> Result<Vec<AvailableModel>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    walk_dir(root, &mut entries, &mut HashSet::new())?;
    entries.sort_by(|a, b| {
        (a.name.to_lowercase(), &a.path).cmp(&(b.name.to_lowercase(), &b.path))
    });
    Ok(entries)
}

fn walk_dir(dir: &Path, entries: &mut Vec<AvailableModel>, visited: &mut HashSet<PathBuf>) -> Result<()> {
    // symlink loops
    let key = fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    if !visited.insert(key) {
        return Ok(());
    }
    let read_dir = fs::read_dir(dir).map_err(|e| PluginError::failed(format!("read {}: {e}", dir.display())))?;
    for entry in read_dir {
        let entry = entry.map_err(|e| PluginError::failed(format!("entry in {}: {e}", dir.display())))?;
        let path = entry.path();
        if path.is_dir() {
            walk_dir(&path, entries, visited)?;
        } else if path.is_file() {
            if let Some(model) = AvailableModel::from_abs_path(&path) {
                entries.push(model);
            }
        }
    }
    Ok(())
}
