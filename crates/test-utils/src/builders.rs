#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use devherd::config::{
    ConfigSection, LaunchSection, ProjectFile, RawProjectFile, ServiceOverride, TestSection,
};

/// Builder for `Devherd.toml` contents.
pub struct ProjectFileBuilder {
    config: RawProjectFile,
}

impl ProjectFileBuilder {
    pub fn new(cmd: &[&str]) -> Self {
        Self {
            config: RawProjectFile {
                config: ConfigSection::default(),
                launch: LaunchSection {
                    cmd: cmd.iter().map(|s| s.to_string()).collect(),
                },
                test: TestSection::default(),
                service: BTreeMap::new(),
            },
        }
    }

    pub fn profile(mut self, profile: &str) -> Self {
        self.config.config.profile = profile.to_string();
        self
    }

    pub fn services_dir(mut self, dir: &str) -> Self {
        self.config.config.services_dir = dir.to_string();
        self
    }

    pub fn port_env(mut self, var: &str) -> Self {
        self.config.config.port_env = var.to_string();
        self
    }

    pub fn test_pattern(mut self, pattern: &str) -> Self {
        self.config.test.pattern = pattern.to_string();
        self
    }

    pub fn test_timeout(mut self, timeout: &str) -> Self {
        self.config.test.timeout = timeout.to_string();
        self
    }

    pub fn service_cmd(mut self, name: &str, cmd: &[&str]) -> Self {
        self.entry(name).cmd = Some(cmd.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn service_env(mut self, name: &str, key: &str, value: &str) -> Self {
        self.entry(name).env.insert(key.to_string(), value.to_string());
        self
    }

    fn entry(&mut self, name: &str) -> &mut ServiceOverride {
        self.config.service.entry(name.to_string()).or_default()
    }

    pub fn raw(self) -> RawProjectFile {
        self.config
    }

    pub fn to_toml(&self) -> String {
        toml::to_string(&self.config).expect("project file serializes to TOML")
    }

    pub fn build(self) -> ProjectFile {
        ProjectFile::try_from(self.config).expect("Failed to build valid project from builder")
    }

    /// Write `Devherd.toml` into `root`.
    pub fn write_to(&self, root: &Path) -> io::Result<()> {
        fs::write(root.join("Devherd.toml"), self.to_toml())
    }
}

/// Create `root/services/<name>/config/<profile>.json` so the service is
/// discoverable and launchable.
pub fn write_service(root: &Path, name: &str, profile: &str) -> io::Result<()> {
    let config_dir = root.join("services").join(name).join("config");
    fs::create_dir_all(&config_dir)?;
    fs::write(config_dir.join(format!("{profile}.json")), "{}\n")
}

/// Write a suite file below `root/services/<name>/`.
pub fn write_suite(root: &Path, name: &str, rel: &str, contents: &str) -> io::Result<()> {
    let path = root.join("services").join(name).join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)
}
