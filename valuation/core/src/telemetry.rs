use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_logging::{JsonLogger, LogLevel, LogRecord};

use crate::config::Settings;

/// Builder configuring telemetry for a valuation component.
pub struct ValuationTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    to_stderr: bool,
    min_level: LogLevel,
}

impl ValuationTelemetryBuilder {
    /// Creates a new builder. Without a sink the telemetry is silent.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            to_stderr: false,
            min_level: LogLevel::Info,
        }
    }

    /// Sets the JSON log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Writes JSON lines to stderr when no log path is configured.
    #[must_use]
    pub const fn stderr(mut self) -> Self {
        self.to_stderr = true;
        self
    }

    /// Sets the minimum level that reaches the sink.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Finalizes the builder.
    pub fn build(self) -> Result<ValuationTelemetry> {
        let logger = match (self.log_path, self.to_stderr) {
            (Some(path), _) => Some(JsonLogger::new(path)?.with_min_level(self.min_level)),
            (None, true) => Some(JsonLogger::stderr().with_min_level(self.min_level)),
            (None, false) => None,
        };
        Ok(ValuationTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
            }),
        })
    }
}

/// Cloneable telemetry handle shared by the service, server and CLI.
#[derive(Clone)]
pub struct ValuationTelemetry {
    inner: Arc<TelemetryInner>,
}

struct TelemetryInner {
    module: String,
    logger: Option<JsonLogger>,
}

impl fmt::Debug for ValuationTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValuationTelemetry")
            .field("module", &self.inner.module)
            .field("sink", &self.inner.logger.as_ref().map(JsonLogger::path))
            .finish()
    }
}

impl ValuationTelemetry {
    /// Returns a builder for this telemetry helper.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> ValuationTelemetryBuilder {
        ValuationTelemetryBuilder::new(module)
    }

    /// Telemetry for a component as configured by `settings`: the JSON log
    /// file when `log_path` is set, stderr otherwise.
    pub fn from_settings(module: impl Into<String>, settings: &Settings) -> Result<Self> {
        let builder = Self::builder(module).min_level(settings.level()?);
        let builder = match &settings.log_path {
            Some(path) => builder.log_path(path),
            None => builder.stderr(),
        };
        builder.build()
    }

    /// Telemetry that drops every record.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                module: "disabled".into(),
                logger: None,
            }),
        }
    }

    /// Logs a structured record.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            let record = LogRecord::new(&self.inner.module, level, message).with_metadata(metadata);
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Logs and discards sink failures; telemetry must never fail a caller.
    pub fn emit(&self, level: LogLevel, message: &str, metadata: Value) {
        if let Err(err) = self.log(level, message, metadata) {
            eprintln!("telemetry write failed: {err:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn telemetry_writes_to_log_path() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("valuation.log");
        let telemetry = ValuationTelemetry::builder("valuation")
            .log_path(&log_path)
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Info, "predict.completed", json!({ "batch": 2 }))
            .unwrap();
        telemetry.emit(LogLevel::Debug, "below.threshold", json!({}));
        let content = std::fs::read_to_string(log_path).unwrap();
        assert!(content.contains("predict.completed"));
        assert!(!content.contains("below.threshold"));
    }

    #[test]
    fn settings_select_file_sink_and_level() {
        let dir = tempdir().unwrap();
        let settings = Settings {
            log_path: Some(dir.path().join("logs/service.log")),
            log_level: "warning".into(),
            ..Settings::default()
        };
        let telemetry = ValuationTelemetry::from_settings("api", &settings).unwrap();
        telemetry.emit(LogLevel::Info, "skipped", json!({}));
        telemetry.emit(LogLevel::Warn, "kept", json!({}));
        let content = std::fs::read_to_string(dir.path().join("logs/service.log")).unwrap();
        assert!(content.contains("kept"));
        assert!(!content.contains("skipped"));
    }

    #[test]
    fn disabled_telemetry_is_silent() {
        let telemetry = ValuationTelemetry::disabled();
        assert!(telemetry
            .log(LogLevel::Error, "ignored", json!({ "x": 1 }))
            .is_ok());
    }
}
