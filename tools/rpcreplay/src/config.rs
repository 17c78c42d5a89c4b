use crate::dump::{DumpOptions, DEFAULT_MAX_PAYLOAD_BYTES};
use crate::errors::ReplayError;
use crate::logging;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub format: Option<DumpFormat>,
    pub max_payload_bytes: Option<usize>,
    pub run_log: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AppConfig {
    pub dump: DumpConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DumpFormat {
    #[default]
    Text,
    Json,
    Summary,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DumpConfig {
    pub format: DumpFormat,
    pub max_payload_bytes: usize,
    pub show_initial: bool,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            format: DumpFormat::Text,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            show_initial: true,
        }
    }
}

impl DumpConfig {
    pub fn options(&self) -> DumpOptions {
        DumpOptions {
            max_payload_bytes: self.max_payload_bytes,
            show_initial: self.show_initial,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// JSONL run log; none disables run logging.
    pub run_log: Option<PathBuf>,
    pub max_payload_bytes: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            run_log: None,
            max_payload_bytes: logging::DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialAppConfig {
    dump: Option<PartialDumpConfig>,
    logging: Option<PartialLoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialDumpConfig {
    format: Option<DumpFormat>,
    max_payload_bytes: Option<usize>,
    show_initial: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialLoggingConfig {
    run_log: Option<PathBuf>,
    max_payload_bytes: Option<usize>,
}

/// Defaults, then the config file if one was given, then CLI overrides.
pub fn load_config(overrides: &CliOverrides) -> Result<AppConfig, ReplayError> {
    let mut cfg = AppConfig::default();

    if let Some(path) = &overrides.config_path {
        let partial = read_partial_config(path)?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_cli_overrides(&mut cfg, overrides);
    validate_config(&cfg)?;
    Ok(cfg)
}

/// Parse a config document on its own, without a file or overrides.
pub fn parse_config(text: &str) -> Result<AppConfig, ReplayError> {
    let partial: PartialAppConfig =
        toml::from_str(text).map_err(|e| ReplayError::ConfigParse(e.to_string()))?;
    let mut cfg = AppConfig::default();
    merge_partial_config(&mut cfg, partial);
    validate_config(&cfg)?;
    Ok(cfg)
}

fn read_partial_config(path: &Path) -> Result<PartialAppConfig, ReplayError> {
    let file_contents = std::fs::read_to_string(path).map_err(|e| {
        ReplayError::ConfigParse(format!("read {}: {e}", path.display()))
    })?;
    toml::from_str(&file_contents).map_err(|e| ReplayError::ConfigParse(e.to_string()))
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(dump) = partial.dump {
        if let Some(format) = dump.format {
            cfg.dump.format = format;
        }
        if let Some(value) = dump.max_payload_bytes {
            cfg.dump.max_payload_bytes = value;
        }
        if let Some(value) = dump.show_initial {
            cfg.dump.show_initial = value;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(run_log) = logging.run_log {
            cfg.logging.run_log = Some(run_log);
        }
        if let Some(value) = logging.max_payload_bytes {
            cfg.logging.max_payload_bytes = value;
        }
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(format) = overrides.format {
        cfg.dump.format = format;
    }
    if let Some(value) = overrides.max_payload_bytes {
        cfg.dump.max_payload_bytes = value;
    }
    if let Some(run_log) = &overrides.run_log {
        cfg.logging.run_log = Some(run_log.clone());
    }
}

fn validate_config(cfg: &AppConfig) -> Result<(), ReplayError> {
    if cfg.dump.max_payload_bytes == 0 {
        return Err(ReplayError::InvalidConfig(
            "dump.max_payload_bytes must be greater than zero".to_string(),
        ));
    }

    if cfg.logging.max_payload_bytes < 16 {
        return Err(ReplayError::InvalidConfig(
            "logging.max_payload_bytes must be at least 16".to_string(),
        ));
    }

    if let Some(path) = &cfg.logging.run_log {
        if path.as_os_str().is_empty() {
            return Err(ReplayError::InvalidConfig(
                "logging.run_log must not be empty".to_string(),
            ));
        }
    }

    Ok(())
}
