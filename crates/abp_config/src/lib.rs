use std::{fs, time::Duration};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::logger::LoggerConfig;

pub(crate) mod defaults;
pub mod logger;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(skip_serializing)]
    path: Option<Utf8PathBuf>,

    /// Script bundle evaluated at startup, it must call `__initDone`
    pub core_bundle: Utf8PathBuf,

    /// Directory that relative bundle, subscription and script file paths resolve against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_dir: Option<Utf8PathBuf>,

    /// Filter list files loaded into the script engine once initialization completes
    #[serde(default)]
    pub subscriptions: Vec<Utf8PathBuf>,

    /// Upper bound on the wait for `__initDone`, unbounded when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_timeout_ms: Option<u64>,

    /// Host logger configuration, installed by `FilterEngine::start`. Embedders
    /// that build a host directly call `logger.init()` themselves.
    #[serde(default)]
    pub logger: LoggerConfig,
}

impl Config {
    #[must_use]
    pub fn with_path(mut self, path: &Utf8PathBuf) -> Self {
        self.path = Some(path.clone());
        self
    }

    pub fn path(&self) -> Utf8PathBuf {
        self.path.clone().unwrap_or(Self::default_path())
    }

    /// Loads config from a json file
    ///
    /// # Errors
    ///
    /// This function will return an error if the config path does not exist or the content is invalid
    pub fn load(path: &Utf8PathBuf) -> Result<Self> {
        debug!("Loading config from {path}");

        if !path.exists() {
            anyhow::bail!("Config file does not exist: {path}");
        }

        let contents =
            fs::read_to_string(path).context(format!("Failed reading config: {path} "))?;

        let mut cfg: Self =
            serde_json::from_str(&contents).context(format!("Failed loading config: {path} "))?;
        cfg.path = Some(path.clone());

        Ok(cfg)
    }

    /// Saves config to json file, falling back on default path if none is provided
    ///
    /// # Errors
    /// This function will error if it fails writing the config
    pub fn save(&self) -> Result<()> {
        let dest = self.path();
        debug!("Saving config to {dest}");
        let contents = serde_json::to_string_pretty(self).unwrap_or(json!(self).to_string());

        fs::write(&dest, contents).context(format!("Failed writing config: {dest}"))?;

        Ok(())
    }

    /// Default config path is ./abp_engine.json
    pub fn default_path() -> Utf8PathBuf {
        Utf8PathBuf::new().join("abp_engine.json")
    }

    pub fn init_timeout(&self) -> Option<Duration> {
        self.init_timeout_ms.map(Duration::from_millis)
    }

    pub fn resolve(&self, path: &Utf8Path) -> Utf8PathBuf {
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    pub fn core_bundle_path(&self) -> Utf8PathBuf {
        self.resolve(&self.core_bundle)
    }

    /// Subscription files in load order, resolved against `base_dir`
    pub fn subscription_paths(&self) -> Vec<Utf8PathBuf> {
        self.subscriptions.iter().map(|p| self.resolve(p)).collect()
    }
}
