// src/config/mod.rs

//! Configuration loading and validation for devherd.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Read a project file through the `FileSystem` seam (`loader.rs`).
//! - Validate commands, globs and timeouts (`validate.rs`).
//! - Discover services and resolve launch commands and test files (`project.rs`).

pub mod loader;
pub mod model;
pub mod project;
pub mod validate;

pub use loader::{load_project_file, read_project_file};
pub use model::{
    ConfigSection, LaunchSection, ProjectFile, RawProjectFile, ServiceOverride, TestSection,
    parse_duration,
};
pub use project::{Project, project_root};
