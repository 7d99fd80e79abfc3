// src/config/project.rs

//! Service discovery and per-service resolution on top of a validated
//! project file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::debug;

use crate::config::loader::load_project_file;
use crate::config::model::ProjectFile;
use crate::errors::{DevherdError, Result};
use crate::fs::{FileSystem, collect_files};
use crate::supervisor::LaunchSpec;

/// A project file together with the services found next to it.
#[derive(Debug, Clone)]
pub struct Project {
    root: PathBuf,
    file: ProjectFile,
    profile: String,
    services: BTreeMap<String, PathBuf>,
}

impl Project {
    /// Read, validate and resolve the project file at `path`.
    pub fn load(fs: &dyn FileSystem, path: &Path, profile: Option<&str>) -> Result<Self> {
        let file = load_project_file(fs, path)?;
        Self::discover(fs, project_root(path), file, profile)
    }

    /// Discover services under `root/<services_dir>`.
    ///
    /// Fails when the directory is missing or when a `[service.<name>]`
    /// section names a service that does not exist.
    pub fn discover(
        fs: &dyn FileSystem,
        root: PathBuf,
        file: ProjectFile,
        profile: Option<&str>,
    ) -> Result<Self> {
        let services_dir = root.join(&file.config.services_dir);
        if !fs.is_dir(&services_dir) {
            return Err(DevherdError::ConfigError(format!(
                "services directory {:?} does not exist",
                services_dir
            )));
        }

        let mut services = BTreeMap::new();
        for path in fs.read_dir(&services_dir)? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') || !fs.is_dir(&path) {
                continue;
            }
            services.insert(name.to_string(), path.clone());
        }

        for name in file.service.keys() {
            if !services.contains_key(name) {
                return Err(DevherdError::ConfigError(format!(
                    "[service.{name}] does not match any directory in {:?}",
                    services_dir
                )));
            }
        }

        let profile = profile
            .map(str::to_string)
            .unwrap_or_else(|| file.config.profile.clone());
        debug!(services = services.len(), %profile, "project resolved");

        Ok(Self {
            root,
            file,
            profile,
            services,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file(&self) -> &ProjectFile {
        &self.file
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn service_dir(&self, name: &str) -> Result<&Path> {
        self.services
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| DevherdError::ServiceNotFound(name.to_string()))
    }

    /// Command line for `name`: launch command, config profile flag, then
    /// the optional port override.
    pub fn launch_spec(
        &self,
        fs: &dyn FileSystem,
        name: &str,
        port: Option<u16>,
    ) -> Result<LaunchSpec> {
        let service_dir = self.service_dir(name)?;
        self.ensure_profile(fs, name, service_dir)?;

        let overrides = self.file.service.get(name);
        let cmd = overrides
            .and_then(|o| o.cmd.as_ref())
            .unwrap_or(&self.file.launch.cmd);

        let config_arg = format!(
            "{}/{}/config/{}",
            self.file.config.services_dir.trim_end_matches('/'),
            name,
            self.profile
        );

        let mut spec = LaunchSpec::from_command(cmd, self.cwd())?
            .arg(&self.file.config.config_flag)
            .arg(config_arg);
        for (key, value) in overrides.iter().flat_map(|o| o.env.iter()) {
            spec = spec.env(key, value);
        }

        Ok(spec.with_port_override(&self.file.config.port_flag, port))
    }

    /// Suite files of `name`, matched against paths relative to the service
    /// directory. Sorted.
    pub fn test_files(&self, fs: &dyn FileSystem, name: &str) -> Result<Vec<PathBuf>> {
        let service_dir = self.service_dir(name)?;
        let patterns = self.test_patterns(name)?;
        let files = collect_files(fs, service_dir, |rel| patterns.is_match(rel))?;
        Ok(files)
    }

    fn test_patterns(&self, name: &str) -> Result<GlobSet> {
        let overrides = self.file.service.get(name).and_then(|o| o.tests.as_ref());
        let patterns: Vec<&String> = match overrides {
            Some(list) => list.iter().collect(),
            None => vec![&self.file.test.pattern],
        };

        let mut builder = GlobSetBuilder::new();
        for pat in patterns {
            let glob = Glob::new(pat)
                .map_err(|e| DevherdError::ConfigError(format!("invalid glob '{pat}': {e}")))?;
            builder.add(glob);
        }
        builder
            .build()
            .map_err(|e| DevherdError::ConfigError(format!("building test globs failed: {e}")))
    }

    /// The profile must exist as `config/<profile>` or `config/<profile>.<ext>`.
    fn ensure_profile(&self, fs: &dyn FileSystem, name: &str, service_dir: &Path) -> Result<()> {
        let config_dir = service_dir.join("config");
        let found = fs.is_dir(&config_dir)
            && fs.read_dir(&config_dir)?.iter().any(|path| {
                fs.is_file(path)
                    && (path.file_name().and_then(|n| n.to_str()) == Some(self.profile.as_str())
                        || path.file_stem().and_then(|n| n.to_str()) == Some(self.profile.as_str()))
            });

        if found {
            Ok(())
        } else {
            Err(DevherdError::ConfigError(format!(
                "service '{name}' has no config profile '{}' in {:?}",
                self.profile, config_dir
            )))
        }
    }

    /// Services run from the project root; an empty root means the current
    /// directory.
    pub fn cwd(&self) -> Option<PathBuf> {
        if self.root.as_os_str().is_empty() {
            None
        } else {
            Some(self.root.clone())
        }
    }
}

/// Directory containing the project file, or an empty path for a bare file
/// name.
pub fn project_root(path: &Path) -> PathBuf {
    path.parent().map(Path::to_path_buf).unwrap_or_default()
}
