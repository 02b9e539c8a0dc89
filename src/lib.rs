//! Guidelink library
//!
//! This crate provides a client for an external autoguiding engine that
//! speaks a newline-delimited JSON protocol over TCP. It exposes the
//! high-level guiding operations an imaging-automation host needs
//! (connect, start/stop guiding, dither, pause) on top of three layers:
//!
//! - a wire codec for command envelopes, method responses and engine events,
//! - a transport layer with one long-lived event connection and a fresh
//!   short-lived connection per command,
//! - a session state machine updated exclusively by decoded engine events.
//!
//! # Protocol Shape
//!
//! Commands and events deliberately travel over **separate** TCP connections
//! to the same endpoint. The engine expects this usage pattern: every
//! command opens its own connection, while events stream continuously on a
//! single listener connection. Do not multiplex the two onto one socket.

use std::fmt;
use std::str::FromStr;

/// Configuration loading including the profile file schema.
pub mod config;

/// High-level guiding workflows and engine process supervision.
pub mod guider;

/// Session state machine and shared snapshot store.
pub mod session;

/// TCP transport: command channel and event listener.
pub mod transport;

/// Wire types for the engine's JSON line protocol.
mod protocol;
pub use protocol::*;

pub use config::{ConfigError, GuiderConfig};
pub use guider::{Guider, GuiderError, LaunchError};
pub use session::{Notification, SessionHandle, SessionSnapshot};
pub use transport::{CommandChannel, EventListener, TransportError};

/// High-level guiding phase reported by the engine.
///
/// The engine is the sole authority over transitions; within a session any
/// state can follow any other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AppState {
    /// Capture is stopped.
    Stopped,
    /// A guide star is selected but guiding has not started.
    Selected,
    /// The engine is calibrating.
    Calibrating,
    /// The engine is actively guiding.
    Guiding,
    /// The guide star was lost.
    LostLock,
    /// Guiding is paused.
    Paused,
    /// The engine is looping exposures without guiding.
    Looping,
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl AppState {
    /// Returns the wire spelling of this state, as the engine reports it.
    pub fn as_str(self) -> &'static str {
        match self {
            AppState::Stopped => "Stopped",
            AppState::Selected => "Selected",
            AppState::Calibrating => "Calibrating",
            AppState::Guiding => "Guiding",
            AppState::LostLock => "LostLock",
            AppState::Paused => "Paused",
            AppState::Looping => "Looping",
        }
    }
}

/// Error type for parsing an [`AppState`] from its wire spelling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAppStateError(pub String);

impl fmt::Display for ParseAppStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown app state: {}", self.0)
    }
}

impl std::error::Error for ParseAppStateError {}

impl FromStr for AppState {
    type Err = ParseAppStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Stopped" => Ok(AppState::Stopped),
            "Selected" => Ok(AppState::Selected),
            "Calibrating" => Ok(AppState::Calibrating),
            "Guiding" => Ok(AppState::Guiding),
            "LostLock" => Ok(AppState::LostLock),
            "Paused" => Ok(AppState::Paused),
            "Looping" => Ok(AppState::Looping),
            _ => Err(ParseAppStateError(s.to_string())),
        }
    }
}
