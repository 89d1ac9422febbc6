//! Operator station configuration.
//!
//! Loaded from an optional `weighbridge-desktop.{toml,yaml,json}` file, overridden by
//! `WEIGHBRIDGE__*` environment variables (`WEIGHBRIDGE__SERVER_URL=http://scale-01:8080`).

use config::{Config as Cfg, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct DesktopConfig {
    pub server_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Operator identity sent as `X-User-ID`.
    pub user_id: Uuid,
    #[serde(default = "default_role")]
    pub role: String,
    /// Sent as `X-Branch-ID` when set; the server otherwise uses the user's branch.
    #[serde(default)]
    pub branch_id: Option<Uuid>,
    #[serde(default = "default_queue_path")]
    pub queue_path: PathBuf,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_role() -> String {
    "operator".to_string()
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("weighbridge-queue.db")
}

fn default_flush_interval_secs() -> u64 {
    8
}

fn default_request_timeout_secs() -> u64 {
    15
}

impl DesktopConfig {
    pub fn new(server_url: impl Into<String>, user_id: Uuid) -> Self {
        Self {
            server_url: server_url.into(),
            api_key: None,
            user_id,
            role: default_role(),
            branch_id: None,
            queue_path: default_queue_path(),
            flush_interval_secs: default_flush_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    pub fn load() -> Result<Self, ConfigError> {
        Cfg::builder()
            .add_source(File::with_name("weighbridge-desktop").required(false))
            .add_source(Environment::with_prefix("WEIGHBRIDGE").separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}
