//! High-level guiding workflows.
//!
//! [`Guider`] ties the transport layer and the session state machine
//! together into the operations an imaging host calls: connect, start and
//! stop guiding, dither, pause, star selection and calibration management.
//! Commands go out through the per-call command channel; completion is
//! observed by polling the session snapshot, which the event listener
//! updates as engine events arrive.
//!
//! Every operation with a wait loop takes a [`CancellationToken`] and
//! re-checks it each poll iteration, resolving to the distinct
//! [`GuiderError::Cancelled`] outcome. Cancellation never corrupts shared
//! state: an aborted operation leaves the session exactly as the last
//! applied event set it, so callers must not assume the operation's nominal
//! postcondition after a cancel.

use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::GuiderConfig;
use crate::protocol::{CommandEnvelope, EngineEvent, MethodResponse, RpcError};
use crate::session::{Notification, SessionHandle, SessionSnapshot};
use crate::transport::{CommandChannel, EventListener, TransportError};
use crate::AppState;

pub mod launcher;
pub use launcher::LaunchError;

/// Poll interval for app-state waits.
const STATE_POLL: Duration = Duration::from_secs(1);
/// Poll interval for the dither settle wait.
const DITHER_POLL: Duration = Duration::from_millis(500);
/// Pause between guide-start retry attempts.
const RETRY_PAUSE: Duration = Duration::from_millis(100);
/// Response and state-wait timeout for stopping capture.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);
/// Failsafe for a resume that the engine never acknowledges.
const RESUME_FAILSAFE: Duration = Duration::from_secs(60);
/// Response timeout for clearing calibration.
const CLEAR_CALIBRATION_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace period for the engine to apply a calibration clear.
const CLEAR_CALIBRATION_GRACE: Duration = Duration::from_millis(100);
/// Time given to the engine to begin looping before star selection.
const LOOP_START_DELAY: Duration = Duration::from_secs(5);

/// Failure of a guiding operation.
#[derive(Debug, thiserror::Error)]
pub enum GuiderError {
    /// The operation requires an established session.
    #[error("not connected to the guiding engine")]
    NotConnected,

    /// The caller's cancellation token fired. Distinct from timeouts and
    /// engine errors; not logged as an error.
    #[error("operation cancelled")]
    Cancelled,

    /// A command exchange failed at the transport level.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The engine could not be made reachable.
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// The engine answered a command with an error the operation's
    /// contract treats as fatal.
    #[error("engine rejected {method}: {error}")]
    Rpc {
        method: &'static str,
        error: RpcError,
    },

    /// An expected state transition did not happen within its bound.
    #[error("timed out waiting for {0}")]
    StateTimeout(&'static str),
}

/// Client for one guiding engine instance.
///
/// Owns the session state, the command channel and (while connected) the
/// event listener. Cheap accessors expose the latest snapshot; workflow
/// methods drive the engine.
pub struct Guider {
    config: GuiderConfig,
    session: SessionHandle,
    commands: CommandChannel,
    listener: Mutex<Option<EventListener>>,
}

impl Guider {
    /// Creates a disconnected guider for the given profile.
    pub fn new(config: GuiderConfig) -> Self {
        let commands = CommandChannel::new(&config.host, config.port);
        Self {
            config,
            session: SessionHandle::new(),
            commands,
            listener: Mutex::new(None),
        }
    }

    /// Returns the latest session snapshot.
    pub async fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot().await
    }

    /// Returns the engine's current guiding phase, if known.
    pub async fn app_state(&self) -> Option<AppState> {
        self.session.snapshot().await.app_state
    }

    /// Returns the image scale in arcseconds per pixel (0 when unknown).
    pub async fn pixel_scale(&self) -> f64 {
        self.session.snapshot().await.pixel_scale
    }

    /// Subscribes to guide-step and connection-lost notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.session.subscribe()
    }

    /// Establishes the session.
    ///
    /// Launches the engine if it is configured but not reachable, opens the
    /// event listener connection, then issues the post-connect commands:
    /// `set_connected`, `loop`, `get_pixel_scale` (stored on the session)
    /// and `get_app_state` (applied as a synthetic app-state event).
    /// Post-connect command failures are logged as warnings; once the
    /// listener is up they do not fail the connect.
    ///
    /// # Errors
    ///
    /// [`GuiderError::Launch`] when the engine cannot be made reachable,
    /// [`GuiderError::Transport`] when the listener connection fails.
    pub async fn connect(&self) -> Result<(), GuiderError> {
        let mut guard = self.listener.lock().await;
        if guard.is_some() {
            tracing::debug!("already connected");
            return Ok(());
        }

        launcher::ensure_engine(&self.config).await?;

        let listener =
            EventListener::start(&self.config.host, self.config.port, self.session.clone())
                .await
                .map_err(GuiderError::Transport)?;
        *guard = Some(listener);
        drop(guard);

        if let Err(e) = self.request(CommandEnvelope::set_connected(true)).await {
            tracing::warn!("set_connected after connect failed: {}", e);
        }
        if let Err(e) = self.request(CommandEnvelope::loop_exposures()).await {
            tracing::warn!("loop after connect failed: {}", e);
        }

        match self.request(CommandEnvelope::get_pixel_scale()).await {
            Ok(response) => {
                if let Some(scale) = response.result.as_ref().and_then(serde_json::Value::as_f64) {
                    self.session.set_pixel_scale(scale).await;
                    tracing::info!("pixel scale: {:.3}\"/px", scale);
                }
            }
            Err(e) => tracing::warn!("get_pixel_scale after connect failed: {}", e),
        }

        match self.request(CommandEnvelope::get_app_state()).await {
            Ok(response) => {
                if let Some(state) = response.result.as_ref().and_then(serde_json::Value::as_str) {
                    self.session
                        .apply_event(&EngineEvent::AppState {
                            state: state.to_string(),
                        })
                        .await;
                }
            }
            Err(e) => tracing::warn!("get_app_state after connect failed: {}", e),
        }

        Ok(())
    }

    /// Tears the session down. Idempotent; disconnecting twice is a no-op.
    pub async fn disconnect(&self) {
        let listener = self.listener.lock().await.take();
        match listener {
            Some(listener) => listener.stop().await,
            None => tracing::debug!("already disconnected"),
        }
    }

    /// Starts guiding and waits for the engine to reach the guiding state.
    ///
    /// Already guiding: returns immediately without sending anything (the
    /// snapshot is trusted as-is; it may be momentarily stale). Currently
    /// calibrating: waits for calibration to finish instead of re-issuing
    /// the command. Otherwise sends `guide` with the profile's settle
    /// criteria.
    ///
    /// With auto-retry disabled the wait for the guiding state is unbounded
    /// (cancellation only). With auto-retry enabled, each attempt waits up
    /// to the configured retry timeout; on expiry guiding is stopped to
    /// return the engine to a clean state and the command is re-sent, until
    /// success or cancellation.
    pub async fn start_guiding(
        &self,
        force_calibration: bool,
        token: &CancellationToken,
    ) -> Result<(), GuiderError> {
        self.ensure_connected().await?;

        match self.session.snapshot().await.app_state {
            Some(AppState::Guiding) => {
                tracing::debug!("already guiding");
                return Ok(());
            }
            Some(AppState::Calibrating) => {
                tracing::info!("calibration in progress, waiting for guiding");
                return self
                    .wait_for_state("guiding after calibration", STATE_POLL, None, token, |s| {
                        s.app_state == Some(AppState::Guiding)
                    })
                    .await;
            }
            _ => {}
        }

        if !self.config.auto_retry {
            self.send_guide(force_calibration).await?;
            return self
                .wait_for_state("guiding", STATE_POLL, None, token, |s| {
                    s.app_state == Some(AppState::Guiding)
                })
                .await;
        }

        let retry_timeout = self.config.retry_timeout();
        loop {
            if token.is_cancelled() {
                return Err(GuiderError::Cancelled);
            }

            self.send_guide(force_calibration).await?;
            match self
                .wait_for_state("guiding", STATE_POLL, Some(retry_timeout), token, |s| {
                    s.app_state == Some(AppState::Guiding)
                })
                .await
            {
                Ok(()) => return Ok(()),
                Err(GuiderError::StateTimeout(_)) => {
                    tracing::warn!(
                        "guiding did not start within {:?}, stopping and retrying",
                        retry_timeout
                    );
                    match self.stop_guiding(token).await {
                        Ok(()) => {}
                        Err(GuiderError::Cancelled) => return Err(GuiderError::Cancelled),
                        Err(e) => tracing::warn!("stop before retry failed: {}", e),
                    }
                    sleep(RETRY_PAUSE).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stops capture and waits for the engine to report itself stopped.
    ///
    /// Already stopped: returns immediately without sending anything (same
    /// stale-snapshot caveat as [`start_guiding`](Self::start_guiding)).
    pub async fn stop_guiding(&self, token: &CancellationToken) -> Result<(), GuiderError> {
        self.ensure_connected().await?;

        if self.session.snapshot().await.app_state == Some(AppState::Stopped) {
            tracing::debug!("already stopped");
            return Ok(());
        }

        let response = self
            .request_with_timeout(CommandEnvelope::stop_capture(), STOP_TIMEOUT)
            .await?;
        if let Some(error) = response.error {
            return Err(GuiderError::Rpc {
                method: "stop_capture",
                error,
            });
        }

        self.wait_for_state("stopped", STATE_POLL, Some(STOP_TIMEOUT), token, |s| {
            s.app_state == Some(AppState::Stopped)
        })
        .await
    }

    /// Dithers by `amount` pixels and waits for the guider to re-settle.
    ///
    /// Completion is signaled by the settle-done event clearing the
    /// dithering flag. If no settle-done arrives within the configured
    /// failsafe window the flag is force-cleared and the operation still
    /// returns success with a warning; the engine's liveness cannot be
    /// guaranteed and a missed settle must not abort an imaging sequence.
    pub async fn dither(
        &self,
        amount: f64,
        ra_only: bool,
        token: &CancellationToken,
    ) -> Result<(), GuiderError> {
        self.ensure_connected().await?;

        let settle = self.config.settle_params();
        self.session.set_dithering(true).await;

        let response = match self
            .request(CommandEnvelope::dither(amount, ra_only, &settle))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.session.set_dithering(false).await;
                return Err(e.into());
            }
        };
        if let Some(error) = response.error {
            self.session.set_dithering(false).await;
            return Err(GuiderError::Rpc {
                method: "dither",
                error,
            });
        }

        let failsafe = self.config.dither_settle_failsafe();
        let started = Instant::now();
        loop {
            if token.is_cancelled() {
                return Err(GuiderError::Cancelled);
            }
            if !self.session.snapshot().await.is_dithering {
                tracing::debug!("dither settled");
                return Ok(());
            }
            if started.elapsed() >= failsafe {
                tracing::warn!(
                    "no settle-done received within {:?}, continuing anyway",
                    failsafe
                );
                self.session.set_dithering(false).await;
                return Ok(());
            }
            tokio::select! {
                _ = token.cancelled() => return Err(GuiderError::Cancelled),
                _ = sleep(DITHER_POLL) => {}
            }
        }
    }

    /// Pauses or resumes guiding.
    ///
    /// The pause command itself is fire-and-forget; failures are logged
    /// only. Pausing then waits for the paused state without a bound (the
    /// engine acknowledges promptly in practice; cancellation remains the
    /// escape hatch). Resuming waits for the state to leave paused with a
    /// failsafe that warns and succeeds if the engine never acknowledges.
    pub async fn pause(&self, pause: bool, token: &CancellationToken) -> Result<(), GuiderError> {
        self.ensure_connected().await?;

        if let Err(e) = self.request(CommandEnvelope::set_paused(pause)).await {
            tracing::warn!("set_paused({}) failed: {}", pause, e);
        }

        if pause {
            self.wait_for_state("paused", STATE_POLL, None, token, |s| {
                s.app_state == Some(AppState::Paused)
            })
            .await
        } else {
            match self
                .wait_for_state("resume", STATE_POLL, Some(RESUME_FAILSAFE), token, |s| {
                    s.app_state != Some(AppState::Paused)
                })
                .await
            {
                Err(GuiderError::StateTimeout(_)) => {
                    tracing::warn!(
                        "engine still paused after {:?}, continuing anyway",
                        RESUME_FAILSAFE
                    );
                    Ok(())
                }
                other => other,
            }
        }
    }

    /// Asks the engine to select a guide star.
    ///
    /// Starts looping first if the engine is not already doing so, giving
    /// it a few seconds to produce frames. Best-effort: reports `true` once
    /// the find command round-trips, regardless of the engine's answer.
    pub async fn auto_select_guide_star(
        &self,
        token: &CancellationToken,
    ) -> Result<bool, GuiderError> {
        self.ensure_connected().await?;

        if self.session.snapshot().await.app_state != Some(AppState::Looping) {
            if let Err(e) = self.request(CommandEnvelope::loop_exposures()).await {
                tracing::warn!("loop before star selection failed: {}", e);
            }
            tokio::select! {
                _ = token.cancelled() => return Err(GuiderError::Cancelled),
                _ = sleep(LOOP_START_DELAY) => {}
            }
        }

        self.request(CommandEnvelope::find_star()).await?;
        Ok(true)
    }

    /// Clears the engine's calibration data.
    ///
    /// Returns `Ok(false)` when the engine rejects the command, `Ok(true)`
    /// after a short grace period for the engine to apply the clear.
    pub async fn clear_calibration(
        &self,
        token: &CancellationToken,
    ) -> Result<bool, GuiderError> {
        self.ensure_connected().await?;

        let response = self
            .request_with_timeout(CommandEnvelope::clear_calibration(), CLEAR_CALIBRATION_TIMEOUT)
            .await?;
        if response.error.is_some() {
            return Ok(false);
        }

        tokio::select! {
            _ = token.cancelled() => return Err(GuiderError::Cancelled),
            _ = sleep(CLEAR_CALIBRATION_GRACE) => {}
        }
        Ok(true)
    }

    async fn ensure_connected(&self) -> Result<(), GuiderError> {
        if self.session.snapshot().await.connected {
            Ok(())
        } else {
            Err(GuiderError::NotConnected)
        }
    }

    async fn send_guide(&self, force_calibration: bool) -> Result<(), GuiderError> {
        let settle = self.config.settle_params();
        let response = self
            .request(CommandEnvelope::guide(&settle, force_calibration))
            .await?;
        if let Some(error) = response.error {
            return Err(GuiderError::Rpc {
                method: "guide",
                error,
            });
        }
        Ok(())
    }

    /// Sends a command with the profile's default receive timeout.
    async fn request(&self, envelope: CommandEnvelope) -> Result<MethodResponse, TransportError> {
        self.request_with_timeout(envelope, self.config.command_timeout())
            .await
    }

    async fn request_with_timeout(
        &self,
        envelope: CommandEnvelope,
        recv_timeout: Duration,
    ) -> Result<MethodResponse, TransportError> {
        let response = self.commands.send(&envelope, recv_timeout).await?;
        // A response-level error is always surfaced to the user; whether it
        // fails the operation is each caller's decision.
        if let Some(error) = &response.error {
            tracing::warn!("engine returned an error for {}: {}", envelope.method, error);
        }
        Ok(response)
    }

    /// Polls the session until `pred` holds, `deadline` expires, or the
    /// token fires. Cancellation is re-checked on every iteration and
    /// interrupts the sleep promptly.
    async fn wait_for_state<F>(
        &self,
        what: &'static str,
        poll: Duration,
        deadline: Option<Duration>,
        token: &CancellationToken,
        pred: F,
    ) -> Result<(), GuiderError>
    where
        F: Fn(&SessionSnapshot) -> bool,
    {
        let started = Instant::now();
        loop {
            if token.is_cancelled() {
                return Err(GuiderError::Cancelled);
            }
            if pred(&self.session.snapshot().await) {
                return Ok(());
            }
            if let Some(limit) = deadline {
                if started.elapsed() >= limit {
                    return Err(GuiderError::StateTimeout(what));
                }
            }
            tokio::select! {
                _ = token.cancelled() => return Err(GuiderError::Cancelled),
                _ = sleep(poll) => {}
            }
        }
    }
}

impl std::fmt::Debug for Guider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guider")
            .field("endpoint", &self.commands.endpoint())
            .finish()
    }
}
