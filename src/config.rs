//! Session configuration.
//!
//! Defaults match the timings collaborators expect; a TOML file and a couple of
//! environment variables can override them.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{SyncError, SyncResult};

pub const ENV_RELAY_URL: &str = "CODEMATE_RELAY_URL";
pub const ENV_NAMESPACE: &str = "CODEMATE_NAMESPACE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Top-level transport namespace shared by every room
    pub namespace: String,

    /// Relay to connect to, e.g. ws://localhost:8765/ws
    pub relay_url: Option<String>,

    pub heartbeat_interval_ms: u64,
    pub sweep_interval_ms: u64,

    /// A peer silent for longer than this is evicted
    pub stale_after_ms: i64,
    /// A peer whose tab stayed hidden for longer than this is evicted
    pub hidden_grace_ms: i64,
    /// A peer whose window stayed blurred for longer than this is evicted
    pub blurred_grace_ms: i64,

    pub edit_debounce_ms: u64,
    pub list_settle_ms: u64,

    pub engine_ready_timeout_ms: u64,
    pub ack_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            namespace: "CodeMate".to_string(),
            relay_url: None,
            heartbeat_interval_ms: 3_000,
            sweep_interval_ms: 5_000,
            stale_after_ms: 15_000,
            hidden_grace_ms: 10_000,
            blurred_grace_ms: 30_000,
            edit_debounce_ms: 300,
            list_settle_ms: 100,
            engine_ready_timeout_ms: 10_000,
            ack_timeout_ms: 5_000,
        }
    }
}

impl SyncConfig {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> SyncResult<Self> {
        dotenvy::dotenv().ok();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> SyncResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> SyncResult<Self> {
        toml::from_str(text).map_err(|e| SyncError::Config(e.to_string()))
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(ENV_RELAY_URL) {
            if !url.trim().is_empty() {
                self.relay_url = Some(url);
            }
        }
        if let Ok(namespace) = std::env::var(ENV_NAMESPACE) {
            if !namespace.trim().is_empty() {
                self.namespace = namespace;
            }
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.namespace.is_empty() {
            return Err(SyncError::Config("namespace must not be empty".into()));
        }
        if self.heartbeat_interval_ms == 0 || self.sweep_interval_ms == 0 {
            return Err(SyncError::Config("timer periods must be positive".into()));
        }
        if self.stale_after_ms <= self.heartbeat_interval_ms as i64 {
            return Err(SyncError::Config(
                "stale_after_ms must exceed the heartbeat interval".into(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn edit_debounce(&self) -> Duration {
        Duration::from_millis(self.edit_debounce_ms)
    }

    pub fn list_settle(&self) -> Duration {
        Duration::from_millis(self.list_settle_ms)
    }

    pub fn engine_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.engine_ready_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}
