// src/supervisor/launch.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

use crate::errors::{DevherdError, Result};

/// Everything needed to start one service process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    /// Build from an argv-style command: first element is the program.
    pub fn from_command(cmd: &[String], cwd: Option<PathBuf>) -> Result<Self> {
        let (program, args) = cmd
            .split_first()
            .ok_or_else(|| DevherdError::ConfigError("launch command is empty".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            cwd,
            env: BTreeMap::new(),
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Append `<flag> <port>` when an override is present.
    pub fn with_port_override(self, flag: &str, port: Option<u16>) -> Self {
        match port {
            Some(port) => self.arg(flag).arg(port.to_string()),
            None => self,
        }
    }

    /// Human readable command line, for logs and `list`.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub(crate) fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Termination always goes through SIGTERM from the supervisor.
            .kill_on_drop(false);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }
}

/// Parse the value of the port override variable.
///
/// Unset or blank means no override; anything that is not a `u16` is a
/// configuration error.
pub fn parse_port(var: &str, value: Option<&str>) -> Result<Option<u16>> {
    let Some(raw) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    raw.parse::<u16>().map(Some).map_err(|_| {
        DevherdError::ConfigError(format!("{var} must be a port number, got '{raw}'"))
    })
}
