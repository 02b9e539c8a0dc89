//! TOML schema for the guider profile.
//!
//! All fields default via `#[serde(default)]`, so any subset may be given.
//! Duration-valued fields are plain integer seconds (`*_secs`).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::SettleParams;

/// Connection, settling and retry settings for one engine instance.
///
/// Example TOML:
/// ```toml
/// host = "localhost"
/// port = 4400
/// executable = "/usr/bin/phd2"
/// settle_pixels = 1.5
/// settle_time_secs = 8
/// settle_timeout_secs = 40
/// dither_amount = 5.0
/// auto_retry = true
/// retry_timeout_secs = 300
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuiderConfig {
    /// Engine host name or address.
    pub host: String,
    /// Engine TCP port.
    pub port: u16,
    /// Engine executable, launched when the endpoint is unreachable.
    /// With no executable configured, connect fails unless the engine is
    /// already running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable: Option<PathBuf>,
    /// Settle threshold in pixels for guide and dither commands.
    pub settle_pixels: f64,
    /// Seconds the guide error must stay below the threshold.
    pub settle_time_secs: u64,
    /// Seconds the engine itself waits for settling before giving up.
    pub settle_timeout_secs: u64,
    /// Default dither amount in pixels.
    pub dither_amount: f64,
    /// Dither in right ascension only.
    pub dither_ra_only: bool,
    /// Client-side failsafe: seconds to wait for a settle-done event after
    /// a dither before continuing with a warning.
    pub dither_settle_failsafe_secs: u64,
    /// Re-send the guide command when guiding does not start in time.
    pub auto_retry: bool,
    /// Seconds each guide-start attempt may take before a retry.
    pub retry_timeout_secs: u64,
    /// Seconds to wait for a command response.
    pub command_timeout_secs: u64,
}

impl Default for GuiderConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 4400,
            executable: None,
            settle_pixels: 1.5,
            settle_time_secs: 8,
            settle_timeout_secs: 40,
            dither_amount: 5.0,
            dither_ra_only: false,
            dither_settle_failsafe_secs: 120,
            auto_retry: false,
            retry_timeout_secs: 300,
            command_timeout_secs: 60,
        }
    }
}

impl GuiderConfig {
    /// Returns the `host:port` endpoint string.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Settle criteria for guide and dither commands.
    pub fn settle_params(&self) -> SettleParams {
        SettleParams {
            pixels: self.settle_pixels,
            time: self.settle_time_secs as f64,
            timeout: self.settle_timeout_secs as f64,
        }
    }

    /// Client-side settle failsafe as a [`Duration`].
    pub fn dither_settle_failsafe(&self) -> Duration {
        Duration::from_secs(self.dither_settle_failsafe_secs)
    }

    /// Per-attempt guide-start timeout as a [`Duration`].
    pub fn retry_timeout(&self) -> Duration {
        Duration::from_secs(self.retry_timeout_secs)
    }

    /// Command response timeout as a [`Duration`].
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}
