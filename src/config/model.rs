// src/config/model.rs

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level project file as read from `Devherd.toml`.
///
/// ```toml
/// [config]
/// services_dir = "services"
/// profile = "development"
///
/// [launch]
/// cmd = ["node", "--", "node_modules/yessql-core/app.js"]
///
/// [test]
/// pattern = "tests/**/*.toml"
/// timeout = "10s"
///
/// [service.scraper]
/// env = { LOG_LEVEL = "debug" }
/// ```
///
/// Only `[launch]` is required; everything else has defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawProjectFile {
    #[serde(default)]
    pub config: ConfigSection,

    pub launch: LaunchSection,

    #[serde(default)]
    pub test: TestSection,

    /// Per-service overrides from `[service.<name>]`.
    #[serde(default)]
    pub service: BTreeMap<String, ServiceOverride>,
}

/// Validated project file.
///
/// Construct through `ProjectFile::try_from(raw)` (see `validate.rs`).
#[derive(Debug, Clone)]
pub struct ProjectFile {
    pub config: ConfigSection,
    pub launch: LaunchSection,
    pub test: TestSection,
    pub service: BTreeMap<String, ServiceOverride>,
    test_timeout: Duration,
}

impl ProjectFile {
    pub(crate) fn new_unchecked(raw: RawProjectFile, test_timeout: Duration) -> Self {
        Self {
            config: raw.config,
            launch: raw.launch,
            test: raw.test,
            service: raw.service,
            test_timeout,
        }
    }

    /// Default per-case timeout parsed from `[test].timeout`.
    pub fn test_timeout(&self) -> Duration {
        self.test_timeout
    }
}

/// `[config]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConfigSection {
    /// Directory (relative to the project file) holding one folder per service.
    #[serde(default = "default_services_dir")]
    pub services_dir: String,

    /// Config profile looked up as `services/<name>/config/<profile>`.
    #[serde(default = "default_profile")]
    pub profile: String,

    /// Environment variable carrying an optional port override.
    #[serde(default = "default_port_env")]
    pub port_env: String,

    /// Flag appended before the port override value.
    #[serde(default = "default_port_flag")]
    pub port_flag: String,

    /// Flag appended before the resolved config path.
    #[serde(default = "default_config_flag")]
    pub config_flag: String,
}

fn default_services_dir() -> String {
    "services".to_string()
}

fn default_profile() -> String {
    "development".to_string()
}

fn default_port_env() -> String {
    "PORT".to_string()
}

fn default_port_flag() -> String {
    "--port".to_string()
}

fn default_config_flag() -> String {
    "--config".to_string()
}

impl Default for ConfigSection {
    fn default() -> Self {
        Self {
            services_dir: default_services_dir(),
            profile: default_profile(),
            port_env: default_port_env(),
            port_flag: default_port_flag(),
            config_flag: default_config_flag(),
        }
    }
}

/// `[launch]` section: the command every service is started with unless it
/// overrides `cmd`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LaunchSection {
    pub cmd: Vec<String>,
}

/// `[test]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestSection {
    /// Glob, relative to the service directory, selecting suite files.
    #[serde(default = "default_test_pattern")]
    pub pattern: String,

    /// Default per-case timeout, e.g. `"10s"` or `"500ms"`.
    #[serde(default = "default_test_timeout")]
    pub timeout: String,
}

fn default_test_pattern() -> String {
    "tests/**/*.toml".to_string()
}

fn default_test_timeout() -> String {
    "10s".to_string()
}

impl Default for TestSection {
    fn default() -> Self {
        Self {
            pattern: default_test_pattern(),
            timeout: default_test_timeout(),
        }
    }
}

/// `[service.<name>]` section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServiceOverride {
    /// Replaces `[launch].cmd` for this service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,

    /// Extra environment for the service process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Replaces `[test].pattern` for this service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<Vec<String>>,
}

/// Parse a simple duration string like `"3s"`, `"250ms"`, `"1m"`, `"2h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    // Find the boundary between digits and suffix.
    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}
