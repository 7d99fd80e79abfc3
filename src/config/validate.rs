// src/config/validate.rs

use globset::Glob;

use crate::config::model::{ProjectFile, RawProjectFile, parse_duration};
use crate::errors::{DevherdError, Result};

impl TryFrom<RawProjectFile> for ProjectFile {
    type Error = DevherdError;

    fn try_from(raw: RawProjectFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_project(&raw)?;
        let timeout = parse_duration(&raw.test.timeout).map_err(|e| {
            DevherdError::ConfigError(format!("[test].timeout is invalid: {e}"))
        })?;
        Ok(ProjectFile::new_unchecked(raw, timeout))
    }
}

fn validate_raw_project(cfg: &RawProjectFile) -> Result<()> {
    validate_command("[launch].cmd", &cfg.launch.cmd)?;
    validate_global_config(cfg)?;
    validate_test_patterns(cfg)?;
    validate_overrides(cfg)?;
    Ok(())
}

fn validate_command(what: &str, cmd: &[String]) -> Result<()> {
    if cmd.is_empty() {
        return Err(DevherdError::ConfigError(format!("{what} is empty")));
    }
    if cmd.iter().any(|c| c.trim().is_empty()) {
        return Err(DevherdError::ConfigError(format!(
            "{what} contains an empty element"
        )));
    }
    Ok(())
}

fn validate_global_config(cfg: &RawProjectFile) -> Result<()> {
    if cfg.config.services_dir.trim().is_empty() {
        return Err(DevherdError::ConfigError(
            "[config].services_dir must not be empty".to_string(),
        ));
    }
    if cfg.config.profile.trim().is_empty() {
        return Err(DevherdError::ConfigError(
            "[config].profile must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_test_patterns(cfg: &RawProjectFile) -> Result<()> {
    check_glob("[test].pattern", &cfg.test.pattern)?;
    for (name, svc) in cfg.service.iter() {
        for pat in svc.tests.iter().flatten() {
            check_glob(&format!("[service.{name}].tests"), pat)?;
        }
    }
    Ok(())
}

fn check_glob(what: &str, pattern: &str) -> Result<()> {
    Glob::new(pattern)
        .map(|_| ())
        .map_err(|e| DevherdError::ConfigError(format!("{what}: invalid glob '{pattern}': {e}")))
}

fn validate_overrides(cfg: &RawProjectFile) -> Result<()> {
    for (name, svc) in cfg.service.iter() {
        if let Some(cmd) = &svc.cmd {
            validate_command(&format!("[service.{name}].cmd"), cmd)?;
        }
    }
    Ok(())
}
