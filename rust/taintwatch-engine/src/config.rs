//! Runtime options and `taintwatch.toml` parsing.
//!
//! Options come from a `[runtime]` table and from a CLI-style option string
//! (`enable=true,jump_branch=true,run_mode=debug`). The option string is
//! applied on top of the file. The same file may extend the built-in lookup
//! tables with `[[source]]`, `[[sink]]`, and `[[override]]` records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use taintwatch_core::tagged::{Descriptor, TagKind};
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_DETECT_TIMEOUT: u64 = 10;
pub const DEFAULT_MEMORY_LIMIT: u64 = 500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("option '{0}' is missing '='")]
    MissingValue(String),
    #[error("invalid value '{value}' for option '{key}'")]
    InvalidValue { key: String, value: String },
    #[error("cannot read '{path}': {message}")]
    Read { path: String, message: String },
    #[error("invalid toml in '{path}': {message}")]
    Toml { path: String, message: String },
    #[error("table record {key} has no member name for its object kind")]
    IncompleteRecord { key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Debug,
    #[default]
    Release,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Debug => write!(f, "debug"),
            RunMode::Release => write!(f, "release"),
        }
    }
}

impl FromStr for RunMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "debug" => Ok(RunMode::Debug),
            "release" => Ok(RunMode::Release),
            _ => Err(()),
        }
    }
}

/// Engine switches. `detect_timeout` and `memory_limit` are carried into
/// reports but not enforced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub enable: bool,
    pub jump_branch: bool,
    pub run_mode: RunMode,
    pub detect_timeout: u64,
    pub memory_limit: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enable: true,
            jump_branch: false,
            run_mode: RunMode::Release,
            detect_timeout: DEFAULT_DETECT_TIMEOUT,
            memory_limit: DEFAULT_MEMORY_LIMIT,
        }
    }
}

impl RuntimeConfig {
    pub fn is_debug(&self) -> bool {
        self.run_mode == RunMode::Debug
    }

    /// Apply a `key=value,key=value` option string. Unknown keys are ignored.
    pub fn apply_options(&mut self, options: &str) -> Result<(), ConfigError> {
        for item in options.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = item
                .split_once('=')
                .ok_or_else(|| ConfigError::MissingValue(item.to_string()))?;
            self.apply(key.trim(), value.trim())?;
        }
        Ok(())
    }

    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue { key: key.to_string(), value: value.to_string() };
        match key {
            "enable" => self.enable = parse_bool(value).ok_or_else(invalid)?,
            "jump_branch" => self.jump_branch = parse_bool(value).ok_or_else(invalid)?,
            "run_mode" => self.run_mode = value.parse().map_err(|_| invalid())?,
            "detect_timeout" => self.detect_timeout = value.parse().map_err(|_| invalid())?,
            "memory_limit" => self.memory_limit = value.parse().map_err(|_| invalid())?,
            other => warn!(option = other, "ignoring unknown runtime option"),
        }
        Ok(())
    }
}

impl FromStr for RuntimeConfig {
    type Err = ConfigError;

    fn from_str(options: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_options(options)?;
        Ok(config)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Contents of a `taintwatch.toml` file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Directory prefix of host library code; frames from there are not analysed.
    #[serde(default)]
    pub library_prefix: Option<String>,
    #[serde(default, rename = "source")]
    pub sources: Vec<Descriptor>,
    #[serde(default, rename = "sink")]
    pub sinks: Vec<Descriptor>,
    #[serde(default, rename = "override")]
    pub overrides: Vec<Descriptor>,
}

impl Settings {
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::parse(&content).map_err(|e| match e {
            ConfigError::Toml { message, .. } => ConfigError::Toml { path: path.display().to_string(), message },
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut settings: Settings = toml::from_str(content)
            .map_err(|e| ConfigError::Toml { path: "<string>".into(), message: e.to_string() })?;
        for d in &mut settings.sources {
            d.tag = TagKind::Taint;
        }
        for d in &mut settings.sinks {
            d.tag = TagKind::Threat;
        }
        for d in &mut settings.overrides {
            d.tag = TagKind::Custom;
        }
        for d in settings.descriptors() {
            if d.member().is_none() {
                return Err(ConfigError::IncompleteRecord { key: d.key() });
            }
        }
        Ok(settings)
    }

    /// Extra table records from the file, sources first.
    pub fn descriptors(&self) -> impl Iterator<Item = &Descriptor> {
        self.sources.iter().chain(&self.sinks).chain(&self.overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taintwatch_core::tagged::{ObjectKind, ThreatKind};

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert!(config.enable);
        assert!(!config.jump_branch);
        assert_eq!(config.run_mode, RunMode::Release);
        assert_eq!(config.detect_timeout, 10);
        assert_eq!(config.memory_limit, 500);
    }

    #[test]
    fn test_option_string() {
        let config: RuntimeConfig =
            "enable=false, jump_branch=true,run_mode=debug,detect_timeout=30,bogus=1".parse().unwrap();
        assert!(!config.enable);
        assert!(config.jump_branch);
        assert!(config.is_debug());
        assert_eq!(config.detect_timeout, 30);
    }

    #[test]
    fn test_option_string_errors() {
        assert!(matches!("enable".parse::<RuntimeConfig>(), Err(ConfigError::MissingValue(_))));
        assert!(matches!(
            "run_mode=verbose".parse::<RuntimeConfig>(),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!("memory_limit=-4".parse::<RuntimeConfig>(), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_settings_file_with_extra_tables() {
        let settings = Settings::parse(
            r#"
            library_prefix = "/usr/lib/python3"

            [runtime]
            jump_branch = true

            [[source]]
            module = "vault"
            func = "read_secret"
            object_kind = "function"

            [[sink]]
            module = "shellkit"
            func = "run"
            object_kind = "function"
            threat = "command-exec"
            active_positions = [1]
            "#,
        )
        .unwrap();
        assert!(settings.runtime.jump_branch);
        assert!(settings.runtime.enable);
        assert_eq!(settings.library_prefix.as_deref(), Some("/usr/lib/python3"));
        assert_eq!(settings.sources[0].tag, TagKind::Taint);
        assert_eq!(settings.sinks[0].tag, TagKind::Threat);
        assert_eq!(settings.sinks[0].threat, Some(ThreatKind::CommandExec));
        assert_eq!(settings.sinks[0].object_kind, ObjectKind::Function);
        assert_eq!(settings.descriptors().count(), 2);
    }

    #[test]
    fn test_record_without_member_is_rejected() {
        let err = Settings::parse("[[sink]]\nmodule = \"x\"\nobject_kind = \"function\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::IncompleteRecord { .. }));
    }
}
