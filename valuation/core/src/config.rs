use std::{
    env, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use shared_logging::LogLevel;
use thiserror::Error;

/// Environment variable pointing at an optional TOML settings file.
pub const CONFIG_ENV: &str = "VALUATION_CONFIG";

/// Service settings resolved from defaults, an optional TOML file, then the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding `model.json`, `model_features.json` and `metrics.json`.
    pub model_dir: PathBuf,
    /// Reference dataset keyed by region code.
    pub demographics_csv: PathBuf,
    /// Name of the region-code column shared by requests and the reference dataset.
    pub region_key: String,
    /// Prediction ledger location; defaults to `model_dir/model_predictions.jsonl`.
    pub ledger_path: Option<PathBuf>,
    /// Minimum level written by telemetry.
    pub log_level: String,
    /// Optional JSON log file; stderr when unset.
    pub log_path: Option<PathBuf>,
    /// Model label reported in prediction responses.
    pub model_name: String,
    /// HTTP API metadata.
    pub api: ApiSettings,
}

/// HTTP API metadata and listener address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    /// Semantic version reported by the service.
    pub version: String,
    /// Route prefix for prediction endpoints.
    pub prefix: String,
    /// Human readable project name.
    pub project_name: String,
    /// Listener address.
    pub bind_addr: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("app/model"),
            demographics_csv: PathBuf::from("app/data/zipcode_demographics.csv"),
            region_key: "zipcode".into(),
            ledger_path: None,
            log_level: "INFO".into(),
            log_path: None,
            model_name: "KNeighborsRegressor".into(),
            api: ApiSettings::default(),
        }
    }
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            version: "1.0.0".into(),
            prefix: "/api/v1".into(),
            project_name: "Housing Price API".into(),
            bind_addr: "0.0.0.0:8000".into(),
        }
    }
}

/// Errors raised while resolving settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Settings file could not be read.
    #[error("reading settings file {}: {source}", .path.display())]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Settings file is not valid TOML for [`Settings`].
    #[error("parsing settings file {}: {source}", .path.display())]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// A value failed validation.
    #[error("invalid setting `{key}`: {reason}")]
    Invalid {
        /// Offending key.
        key: &'static str,
        /// Explanation.
        reason: String,
    },
}

impl Settings {
    /// Resolves settings: defaults, then `file` (or `$VALUATION_CONFIG`), then
    /// environment overrides.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env = env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut settings = match file.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        settings.apply_overrides(|key| env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Reads a TOML settings file; absent keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies environment-style overrides through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("MODEL_DIR") {
            self.model_dir = dir.into();
        }
        if let Some(csv) = lookup("DEMOGRAPHICS_CSV") {
            self.demographics_csv = csv.into();
        }
        if let Some(path) = lookup("LEDGER_PATH") {
            self.ledger_path = Some(path.into());
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(path) = lookup("LOG_PATH") {
            self.log_path = Some(path.into());
        }
        if let Some(name) = lookup("MODEL_NAME") {
            self.model_name = name;
        }
        if let Some(addr) = lookup("BIND_ADDR") {
            self.api.bind_addr = addr;
        }
    }

    /// Checks values that would otherwise fail late.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.level()?;
        self.bind_addr()?;
        if self.region_key.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "region_key",
                reason: "must not be empty".into(),
            });
        }
        if !self.api.prefix.starts_with('/') {
            return Err(ConfigError::Invalid {
                key: "api.prefix",
                reason: format!("`{}` must start with '/'", self.api.prefix),
            });
        }
        Ok(())
    }

    /// Parsed telemetry level.
    pub fn level(&self) -> Result<LogLevel, ConfigError> {
        self.log_level.parse().map_err(|err| ConfigError::Invalid {
            key: "log_level",
            reason: format!("{err}"),
        })
    }

    /// Parsed listener address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.api.bind_addr.parse().map_err(|err| ConfigError::Invalid {
            key: "api.bind_addr",
            reason: format!("{err}"),
        })
    }

    /// Serialized regressor artifact.
    #[must_use]
    pub fn model_path(&self) -> PathBuf {
        self.model_dir.join("model.json")
    }

    /// Persisted feature order.
    #[must_use]
    pub fn features_path(&self) -> PathBuf {
        self.model_dir.join("model_features.json")
    }

    /// Development metrics written at training time.
    #[must_use]
    pub fn dev_metrics_path(&self) -> PathBuf {
        self.model_dir.join("metrics.json")
    }

    /// Prediction ledger location.
    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        self.ledger_path
            .clone()
            .unwrap_or_else(|| self.model_dir.join("model_predictions.jsonl"))
    }
}
