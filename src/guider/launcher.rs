//! Engine process supervision with launch-on-demand.
//!
//! Probes the engine's TCP endpoint and, when nothing is listening, spawns
//! the configured executable in the background and retries the probe with
//! exponential backoff until the engine accepts connections.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::sleep;

use crate::config::GuiderConfig;

/// Backoff configuration for readiness probes after launching the engine.
const INITIAL_BACKOFF_MS: u64 = 10;
const MAX_BACKOFF_MS: u64 = 500;
const MAX_RETRIES: u32 = 10;

/// Failure to make the engine reachable.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// Nothing listens at the endpoint and no executable is configured.
    /// This is a configuration error the user must resolve.
    #[error(
        "engine not reachable at {endpoint} and no executable is configured; \
        start the engine manually or set its path in the profile"
    )]
    NotConfigured { endpoint: String },

    /// The endpoint probe failed in a way launching cannot fix
    /// (e.g. an unresolvable host name).
    #[error("connection to engine at {endpoint} failed with a non-recoverable error: {source}")]
    Unreachable {
        endpoint: String,
        source: std::io::Error,
    },

    /// Spawning the engine executable failed.
    #[error("failed to launch engine executable {path}: {source}")]
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The engine was launched but never accepted a connection.
    #[error("engine did not become reachable after {attempts} probe attempts")]
    StartFailed {
        attempts: u32,
        #[source]
        last_error: Option<std::io::Error>,
    },
}

/// Ensures the engine accepts connections at the configured endpoint.
///
/// Probes the endpoint first; if the engine is already running this is a
/// no-op. Otherwise the configured executable is spawned detached and the
/// probe is retried with exponential backoff (10 ms doubling, capped at
/// 500 ms, 10 attempts).
///
/// # Errors
///
/// [`LaunchError::NotConfigured`] when nothing listens and no executable
/// path is set, [`LaunchError::Spawn`] when the executable cannot be
/// started, [`LaunchError::StartFailed`] when it never comes up.
pub async fn ensure_engine(config: &GuiderConfig) -> Result<(), LaunchError> {
    let endpoint = config.endpoint();

    match TcpStream::connect(&endpoint).await {
        Ok(_probe) => {
            tracing::debug!("engine already reachable at {}", endpoint);
            return Ok(());
        }
        Err(e) => match e.kind() {
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::TimedOut => {
                tracing::info!("engine not reachable at {} ({}), attempting launch", endpoint, e);
            }
            _ => {
                tracing::error!("probe of {} failed with non-recoverable error: {}", endpoint, e);
                return Err(LaunchError::Unreachable { endpoint, source: e });
            }
        },
    }

    let Some(path) = config.executable.as_ref() else {
        return Err(LaunchError::NotConfigured { endpoint });
    };

    tracing::info!("launching engine from {}", path.display());
    let child = Command::new(path).spawn().map_err(|e| LaunchError::Spawn {
        path: path.clone(),
        source: e,
    })?;
    tracing::info!("engine launched with PID {}", child.id());

    let mut last_error: Option<std::io::Error> = None;
    for attempt in 0..MAX_RETRIES {
        sleep(calculate_backoff(attempt)).await;

        match TcpStream::connect(&endpoint).await {
            Ok(_probe) => {
                tracing::info!("engine reachable after {} probe attempts", attempt + 1);
                return Ok(());
            }
            Err(e) => {
                tracing::debug!("probe attempt {} failed: {}", attempt + 1, e);
                last_error = Some(e);
            }
        }
    }

    Err(LaunchError::StartFailed {
        attempts: MAX_RETRIES,
        last_error,
    })
}

/// Backoff delay for a zero-indexed probe attempt, doubling up to the cap.
fn calculate_backoff(attempt: u32) -> Duration {
    let delay_ms = INITIAL_BACKOFF_MS.saturating_mul(1 << attempt);
    Duration::from_millis(delay_ms.min(MAX_BACKOFF_MS))
}
