//! Client configuration
//!
//! Loaded once at startup from a JSON file and passed explicitly to each
//! component. A missing file yields the defaults; missing keys fall back to
//! their default values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::hasher::DEFAULT_SALT;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the remote document store.
    pub remote_base_url: String,
    /// Upper bound for every remote call, in milliseconds.
    pub request_timeout_ms: u64,
    /// Pause between background reconciliation passes, in seconds.
    pub reconcile_interval_secs: u64,
    /// Maximum dirty records pushed per table in one pass.
    pub reconcile_batch_size: usize,
    /// Process-wide salt for password digests.
    pub password_salt: String,
    /// SQLite cache location.
    pub cache_path: PathBuf,
    /// Session file location.
    pub session_path: PathBuf,
    /// `host:port` used by the TCP connectivity probe.
    pub probe_addr: String,
    /// Connectivity probe timeout, in milliseconds.
    pub probe_timeout_ms: u64,
    /// Pause between background connectivity probes, in seconds.
    pub probe_interval_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            remote_base_url: "http://127.0.0.1:8080".to_string(),
            request_timeout_ms: 15_000,
            reconcile_interval_secs: 60,
            reconcile_batch_size: 50,
            password_salt: DEFAULT_SALT.to_string(),
            cache_path: PathBuf::from("data/cache.sqlite"),
            session_path: PathBuf::from("data/session.json"),
            probe_addr: "127.0.0.1:8080".to_string(),
            probe_timeout_ms: 1_500,
            probe_interval_secs: 10,
        }
    }
}

impl ClientConfig {
    /// Load config from `path`, or defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        let config: ClientConfig =
            serde_json::from_str(&data).with_context(|| format!("Failed to parse config JSON in {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            anyhow::bail!("request_timeout_ms must be greater than zero");
        }
        if self.reconcile_interval_secs == 0 {
            anyhow::bail!("reconcile_interval_secs must be greater than zero");
        }
        if self.probe_interval_secs == 0 {
            anyhow::bail!("probe_interval_secs must be greater than zero");
        }
        if self.reconcile_batch_size == 0 {
            anyhow::bail!("reconcile_batch_size must be greater than zero");
        }
        if self.password_salt.is_empty() {
            anyhow::bail!("password_salt must not be empty");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}
