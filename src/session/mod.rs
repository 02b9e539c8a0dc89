//! Session state for one connection to the guiding engine.
//!
//! This module provides a thread-safe snapshot store for the engine session.
//! The snapshot is wrapped in `Arc<RwLock>` so the event listener task and
//! workflow callers can share it; reads clone the current snapshot, writes
//! are exclusive.
//!
//! Ownership discipline: the event listener is the only writer of the
//! event-driven fields (`app_state`, `pixel_scale`, `settling`,
//! `settle_done`, `dithered`) via [`SessionHandle::apply_event`]; workflow
//! operations write only `is_dithering` and the connected flag through their
//! dedicated methods. `app_state` never changes except through a decoded
//! event (including the synthetic app-state event issued at connect time).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use crate::protocol::{DitherOffset, EngineEvent, GuideStep, SettleResult, SettlingProgress};
use crate::AppState;


/// Capacity of the notification channel. Guide steps arrive at most once
/// per exposure, so this allows for a slow subscriber without drops.
const NOTIFICATION_CHANNEL_CAPACITY: usize = 256;

/// Point-in-time view of the engine session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    /// Whether the event listener connection is up.
    pub connected: bool,
    /// Engine guiding phase, `None` until the first app-state event arrives
    /// and after disconnect.
    pub app_state: Option<AppState>,
    /// Image scale in arcseconds per pixel, queried once at connect.
    /// Zero when disconnected or not yet known.
    pub pixel_scale: f64,
    /// True between sending a dither command and its settle completing.
    pub is_dithering: bool,
    /// Latest settling progress, cleared once the settle completes.
    pub settling: Option<SettlingProgress>,
    /// Latest settle outcome, cleared when a new settle begins.
    pub settle_done: Option<SettleResult>,
    /// Latest dither offset, cleared once the settle completes.
    pub dithered: Option<DitherOffset>,
}

/// Notification pushed to host subscribers.
#[derive(Debug, Clone)]
pub enum Notification {
    /// One guide correction was reported by the engine.
    GuideStep(GuideStep),
    /// The event connection was lost. Fires exactly once per connected
    /// session, whether the loss was a peer close, a read error, or a
    /// deliberate disconnect.
    ConnectionLost,
}

struct SessionInner {
    state: RwLock<SessionSnapshot>,
    notify_tx: broadcast::Sender<Notification>,
    /// Armed on connect, disarmed when the connection-lost notification
    /// fires, so the signal is one-shot per session.
    lost_armed: AtomicBool,
}

/// Cloneable handle to the shared session state.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("subscriber_count", &self.inner.notify_tx.receiver_count())
            .finish()
    }
}

impl SessionHandle {
    /// Creates a new disconnected session.
    pub fn new() -> Self {
        let (notify_tx, _rx) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(SessionInner {
                state: RwLock::new(SessionSnapshot::default()),
                notify_tx,
                lost_armed: AtomicBool::new(false),
            }),
        }
    }

    /// Returns a clone of the current snapshot.
    pub async fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.read().await.clone()
    }

    /// Subscribes to guide-step and connection-lost notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.notify_tx.subscribe()
    }

    /// Marks the session connected and arms the one-shot lost signal.
    pub async fn set_connected(&self) {
        let mut state = self.inner.state.write().await;
        state.connected = true;
        self.inner.lost_armed.store(true, Ordering::SeqCst);
    }

    /// Sets the dithering-in-progress flag. Workflow use only.
    pub async fn set_dithering(&self, dithering: bool) {
        self.inner.state.write().await.is_dithering = dithering;
    }

    /// Records the image scale queried at connect time.
    pub async fn set_pixel_scale(&self, scale: f64) {
        self.inner.state.write().await.pixel_scale = scale;
    }

    /// Tears the session down after the event connection ended.
    ///
    /// Clears the connected flag, resets every ephemeral field, and emits
    /// the connection-lost notification if it has not fired yet. Safe to
    /// call repeatedly; only the first call after a connect notifies.
    pub async fn mark_disconnected(&self) {
        {
            let mut state = self.inner.state.write().await;
            *state = SessionSnapshot::default();
        }
        if self.inner.lost_armed.swap(false, Ordering::SeqCst) {
            match self.inner.notify_tx.send(Notification::ConnectionLost) {
                Ok(count) => tracing::debug!("connection-lost sent to {} subscribers", count),
                Err(_) => tracing::debug!("no subscribers for connection-lost notification"),
            }
        }
    }

    /// Applies one decoded engine event to the session.
    ///
    /// This is the single mutation point for event-driven state. Guide
    /// steps imply active guiding even without an explicit app-state event,
    /// so they also move `app_state` to `Guiding`.
    pub async fn apply_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::AppState { state } => match state.parse::<AppState>() {
                Ok(parsed) => self.set_app_state(parsed).await,
                Err(e) => tracing::warn!("ignoring app-state event: {}", e),
            },
            EngineEvent::GuideStep(step) => {
                self.set_app_state(AppState::Guiding).await;
                match self.inner.notify_tx.send(Notification::GuideStep(step.clone())) {
                    Ok(count) => tracing::trace!("guide step sent to {} subscribers", count),
                    Err(_) => tracing::trace!("no subscribers for guide step"),
                }
            }
            EngineEvent::GuidingDithered(offset) => {
                let mut state = self.inner.state.write().await;
                state.settle_done = None;
                state.dithered = Some(*offset);
            }
            EngineEvent::Settling(progress) => {
                let mut state = self.inner.state.write().await;
                state.settle_done = None;
                state.settling = Some(progress.clone());
            }
            EngineEvent::SettleDone(result) => {
                if let Some(message) = result.error_message() {
                    tracing::warn!("settle finished with error: {}", message);
                }
                let mut state = self.inner.state.write().await;
                state.dithered = None;
                state.settling = None;
                state.settle_done = Some(result.clone());
                state.is_dithering = false;
            }
            EngineEvent::Paused => self.set_app_state(AppState::Paused).await,
            EngineEvent::StartCalibration => self.set_app_state(AppState::Calibrating).await,
            EngineEvent::LoopingExposures { .. } => self.set_app_state(AppState::Looping).await,
            EngineEvent::LoopingExposuresStopped => self.set_app_state(AppState::Stopped).await,
            EngineEvent::StarLost(_) => self.set_app_state(AppState::LostLock).await,
            // The engine is the authority; these carry no state change.
            EngineEvent::LockPositionLost
            | EngineEvent::Resumed
            | EngineEvent::Version { .. }
            | EngineEvent::Unknown => {}
        }
    }

    async fn set_app_state(&self, new_state: AppState) {
        let mut state = self.inner.state.write().await;
        if state.app_state != Some(new_state) {
            tracing::debug!("app state -> {}", new_state);
        }
        state.app_state = Some(new_state);
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}
