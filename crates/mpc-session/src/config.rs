//! Service configuration
//!
//! Every value can come from a flag, an environment variable or a JSON
//! file. Defaults match the deadlines all parties of a session assume.

use crate::telemetry::LogFormat;
use crate::{Error, Result};
use clap::{Args, Parser};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top level configuration for a party node
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "mpc-session")]
#[command(about = "MPC session orchestration settings")]
pub struct ServiceConfig {
    /// Relay service URL
    #[arg(long, env = "RELAY_URL", default_value = "http://127.0.0.1:8080")]
    pub relay_url: String,

    /// Directory for persisted keyshares
    #[arg(long, env = "VAULTS_DIR", default_value = "./vaults")]
    pub vaults_dir: PathBuf,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "pretty")]
    #[serde(default)]
    pub log_format: LogFormat,

    /// Per request timeout for relay HTTP calls, in seconds
    #[arg(long, env = "RELAY_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[command(flatten)]
    #[serde(default)]
    pub timeouts: Timeouts,
}

fn default_request_timeout() -> u64 {
    30
}

impl ServiceConfig {
    /// Load from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let config = Self::try_parse_from(["mpc-session"])
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.as_ref().display(), e)))?;
        let config: Self =
            serde_json::from_str(&raw).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.relay_url.trim().is_empty() {
            return Err(Error::InvalidConfig("relay_url is empty".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::InvalidConfig("request_timeout_secs must be positive".into()));
        }
        self.timeouts.validate()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Deadlines and poll intervals used by the orchestration layer
#[derive(Args, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Wait for the committee in keygen, reshare and migrate
    #[arg(long, env = "MPC_SESSION_START_SECS", default_value_t = 300)]
    pub session_start_secs: u64,

    /// Wait for the committee in keysign
    #[arg(long, env = "MPC_KEYSIGN_START_SECS", default_value_t = 183)]
    pub keysign_start_secs: u64,

    /// Follower wait for the setup payload
    #[arg(long, env = "MPC_SETUP_WAIT_SECS", default_value_t = 60)]
    pub setup_wait_secs: u64,

    /// Bound on the inbound side of one pump run
    #[arg(long, env = "MPC_INBOUND_TIMEOUT_SECS", default_value_t = 60)]
    pub inbound_timeout_secs: u64,

    /// Wait for every party to mark the session complete
    #[arg(long, env = "MPC_COMPLETION_WAIT_SECS", default_value_t = 60)]
    pub completion_wait_secs: u64,

    /// Poll interval for session start, setup and completion
    #[arg(long, env = "MPC_RELAY_POLL_MS", default_value_t = 1000)]
    pub relay_poll_ms: u64,

    /// Poll interval of the inbound task
    #[arg(long, env = "MPC_INBOUND_POLL_MS", default_value_t = 100)]
    pub inbound_poll_ms: u64,

    /// Outbound task sleep when the engine has nothing to send
    #[arg(long, env = "MPC_OUTBOUND_IDLE_MS", default_value_t = 100)]
    pub outbound_idle_ms: u64,

    /// Pause between attempts
    #[arg(long, env = "MPC_RETRY_BACKOFF_MS", default_value_t = 50)]
    pub retry_backoff_ms: u64,

    /// Attempts per key type
    #[arg(long, env = "MPC_MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,

    /// Pause between the ECDSA and EdDSA runs of a migration
    #[arg(long, env = "MPC_KEY_TYPE_PAUSE_MS", default_value_t = 500)]
    pub key_type_pause_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            session_start_secs: 300,
            keysign_start_secs: 183,
            setup_wait_secs: 60,
            inbound_timeout_secs: 60,
            completion_wait_secs: 60,
            relay_poll_ms: 1000,
            inbound_poll_ms: 100,
            outbound_idle_ms: 100,
            retry_backoff_ms: 50,
            max_attempts: 3,
            key_type_pause_ms: 500,
        }
    }
}

impl Timeouts {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidConfig("max_attempts must be at least 1".into()));
        }
        if self.inbound_poll_ms == 0 || self.outbound_idle_ms == 0 || self.relay_poll_ms == 0 {
            return Err(Error::InvalidConfig("poll intervals must be positive".into()));
        }
        Ok(())
    }

    pub fn session_start(&self) -> Duration {
        Duration::from_secs(self.session_start_secs)
    }

    pub fn keysign_start(&self) -> Duration {
        Duration::from_secs(self.keysign_start_secs)
    }

    pub fn setup_wait(&self) -> Duration {
        Duration::from_secs(self.setup_wait_secs)
    }

    pub fn inbound_timeout(&self) -> Duration {
        Duration::from_secs(self.inbound_timeout_secs)
    }

    pub fn completion_wait(&self) -> Duration {
        Duration::from_secs(self.completion_wait_secs)
    }

    pub fn relay_poll(&self) -> Duration {
        Duration::from_millis(self.relay_poll_ms)
    }

    pub fn inbound_poll(&self) -> Duration {
        Duration::from_millis(self.inbound_poll_ms)
    }

    pub fn outbound_idle(&self) -> Duration {
        Duration::from_millis(self.outbound_idle_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn key_type_pause(&self) -> Duration {
        Duration::from_millis(self.key_type_pause_ms)
    }
}
