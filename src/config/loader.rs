// src/config/loader.rs

use std::path::Path;

use crate::config::model::{ProjectFile, RawProjectFile};
use crate::errors::{DevherdError, Result};
use crate::fs::FileSystem;

/// Read and deserialize the project file at `path`.
///
/// Only TOML deserialization happens here; see [`load_project_file`] for
/// validation.
pub fn read_project_file(fs: &dyn FileSystem, path: &Path) -> Result<RawProjectFile> {
    if !fs.is_file(path) {
        return Err(DevherdError::ConfigError(format!(
            "project file {:?} not found",
            path
        )));
    }
    let contents = fs.read_to_string(path)?;
    let raw: RawProjectFile = toml::from_str(&contents)?;
    Ok(raw)
}

/// Read the project file at `path` and validate it.
///
/// Service discovery and per-service resolution happen later in
/// [`crate::config::Project`], because they depend on the directory layout.
pub fn load_project_file(fs: &dyn FileSystem, path: &Path) -> Result<ProjectFile> {
    let raw = read_project_file(fs, path)?;
    ProjectFile::try_from(raw)
}
