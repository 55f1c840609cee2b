use std::{fs::OpenOptions, sync::Mutex};

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, fmt::writer::BoxMakeWriter};

const WORKSPACE_CRATES: &[&str] = &["abp_config", "abp_engine_host"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    #[serde(default = "crate::defaults::default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub format: LoggerFormat,
    #[serde(default = "crate::defaults::default_true")]
    pub colors: bool,
    /// Optional file path for log output, stdout when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub enum LoggerFormat {
    #[serde(rename = "compact")]
    #[default]
    Compact,
    #[serde(rename = "pretty")]
    Pretty,
    #[serde(rename = "json")]
    Json,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: LogLevel::Info,
            format: LoggerFormat::Compact,
            colors: true,
            file: None,
        }
    }
}

/// Ordered from lowest to highest severity: Trace < Debug < Info < Warn < Error
#[derive(Debug, Default, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    #[serde(rename = "trace", alias = "TRACE")]
    Trace,
    #[serde(rename = "debug", alias = "DEBUG")]
    Debug,
    #[serde(rename = "info", alias = "INFO")]
    #[default]
    Info,
    #[serde(rename = "warn", alias = "WARN")]
    Warn,
    #[serde(rename = "error", alias = "ERROR")]
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Workspace crates log at `level`, everything else (deno, v8 glue) at warn
pub fn default_env_filter(level: &str) -> String {
    let mut filters: Vec<String> = WORKSPACE_CRATES
        .iter()
        .map(|crate_name| format!("{crate_name}={level}"))
        .collect();

    filters.insert(0, "warn".to_string());

    filters.join(",")
}

impl LoggerConfig {
    pub fn env_filter(&self) -> String {
        default_env_filter(self.level.as_str())
    }

    /// Installs the global `tracing` subscriber described by this config.
    /// `RUST_LOG` overrides the configured level when set.
    ///
    /// # Errors
    ///
    /// Fails if the log file cannot be opened or a global subscriber is already installed
    pub fn init(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.env_filter()));

        let (writer, ansi) = match &self.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .context(format!("Failed opening log file: {path}"))?;
                (BoxMakeWriter::new(Mutex::new(file)), false)
            }
            None => (BoxMakeWriter::new(std::io::stdout), self.colors),
        };

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(ansi)
            .with_writer(writer);

        let installed = match self.format {
            LoggerFormat::Compact => builder.compact().try_init(),
            LoggerFormat::Pretty => builder.pretty().try_init(),
            LoggerFormat::Json => builder.json().try_init(),
        };

        installed.map_err(|e| anyhow::anyhow!("Failed installing tracing subscriber: {e}"))
    }
}
