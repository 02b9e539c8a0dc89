//! Wire types for the engine's newline-delimited JSON protocol.
//!
//! Outbound commands are envelopes `{"id": ..., "method": ..., "params": ...}\n`
//! with `params` omitted when a method takes none. Inbound lines are either
//! method responses (recognized by an `id` field) or events (recognized by an
//! `Event` field); anything else, including malformed JSON, is dropped at
//! this boundary so the listener loop can never be crashed by bad input.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC version string the engine stamps on responses.
pub const JSONRPC_VERSION: &str = "1.0";

/// The fixed set of operation kinds this client issues.
///
/// Request ids are drawn from this enumeration, so id uniqueness is per
/// operation kind rather than per call: at most one call per kind is assumed
/// to be in flight at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandId {
    Guide,
    Dither,
    ClearCalibration,
    StopCapture,
    FindStar,
    GetPixelScale,
    GetAppState,
    SetPaused,
    SetConnected,
    Loop,
}

impl CommandId {
    /// Returns the engine RPC method name, also used as the request id.
    pub fn method(self) -> &'static str {
        match self {
            CommandId::Guide => "guide",
            CommandId::Dither => "dither",
            CommandId::ClearCalibration => "clear_calibration",
            CommandId::StopCapture => "stop_capture",
            CommandId::FindStar => "find_star",
            CommandId::GetPixelScale => "get_pixel_scale",
            CommandId::GetAppState => "get_app_state",
            CommandId::SetPaused => "set_paused",
            CommandId::SetConnected => "set_connected",
            CommandId::Loop => "loop",
        }
    }
}

/// Settle criteria attached to guide and dither commands.
///
/// The guiding error must stay below `pixels` for `time` seconds before the
/// engine reports the operation settled; `timeout` bounds how long the
/// engine itself waits before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SettleParams {
    /// Maximum guide error, in pixels, considered settled.
    pub pixels: f64,
    /// Seconds the error must stay below `pixels`.
    pub time: f64,
    /// Seconds the engine waits for settling before reporting failure.
    pub timeout: f64,
}

/// Outgoing command envelope.
///
/// Serialized as a single JSON line: `{"id": "...", "method": "...", ...}\n`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Request id, echoed back by the engine on the matching response.
    pub id: String,
    /// Engine RPC method name.
    pub method: String,
    /// Method parameters; omitted entirely when the method takes none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl CommandEnvelope {
    /// Creates an envelope for the given operation kind.
    pub fn new(id: CommandId, params: Option<Value>) -> Self {
        Self {
            id: id.method().to_string(),
            method: id.method().to_string(),
            params,
        }
    }

    /// Starts guiding with the given settle criteria.
    pub fn guide(settle: &SettleParams, recalibrate: bool) -> Self {
        Self::new(
            CommandId::Guide,
            Some(serde_json::json!({
                "settle": settle,
                "recalibrate": recalibrate,
            })),
        )
    }

    /// Applies a small random pointing offset and re-settles.
    pub fn dither(amount: f64, ra_only: bool, settle: &SettleParams) -> Self {
        Self::new(
            CommandId::Dither,
            Some(serde_json::json!({
                "amount": amount,
                "raOnly": ra_only,
                "settle": settle,
            })),
        )
    }

    /// Clears calibration data for both axes.
    pub fn clear_calibration() -> Self {
        Self::new(
            CommandId::ClearCalibration,
            Some(serde_json::json!(["Both"])),
        )
    }

    /// Stops capture and guiding.
    pub fn stop_capture() -> Self {
        Self::new(CommandId::StopCapture, None)
    }

    /// Asks the engine to auto-select a guide star.
    pub fn find_star() -> Self {
        Self::new(CommandId::FindStar, None)
    }

    /// Queries the image scale in arcseconds per pixel.
    pub fn get_pixel_scale() -> Self {
        Self::new(CommandId::GetPixelScale, None)
    }

    /// Queries the engine's current application state.
    pub fn get_app_state() -> Self {
        Self::new(CommandId::GetAppState, None)
    }

    /// Pauses (`[true, "full"]`, stopping looping too) or resumes (`[false]`).
    pub fn set_paused(paused: bool) -> Self {
        let params = if paused {
            serde_json::json!([true, "full"])
        } else {
            serde_json::json!([false])
        };
        Self::new(CommandId::SetPaused, Some(params))
    }

    /// Connects or disconnects the engine's own equipment.
    pub fn set_connected(connected: bool) -> Self {
        Self::new(CommandId::SetConnected, Some(serde_json::json!([connected])))
    }

    /// Starts looping exposures without guiding.
    pub fn loop_exposures() -> Self {
        Self::new(CommandId::Loop, None)
    }

    /// Serializes to a JSON line (with trailing newline).
    pub fn to_json_line(&self) -> String {
        let json = serde_json::to_string(self).expect("failed to serialize CommandEnvelope");
        format!("{}\n", json)
    }
}

/// Error payload carried inside a method response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Engine-defined error code.
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Response to a command, correlated by `id`.
///
/// `error` may be non-null while `result` is also present; callers decide
/// per operation whether a non-null error is a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodResponse {
    /// Protocol version, `"1.0"` on responses from the engine.
    #[serde(default)]
    pub jsonrpc: Option<String>,
    /// Echo of the request id.
    pub id: String,
    /// Method result payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error payload, if the engine reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// One guide correction as reported by the engine.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GuideStep {
    #[serde(rename = "Frame", default)]
    pub frame: Option<u64>,
    #[serde(rename = "Time", default)]
    pub time: Option<f64>,
    #[serde(rename = "Mount", default)]
    pub mount: Option<String>,
    /// Right-ascension offset of the star from lock position, pixels.
    #[serde(default)]
    pub dx: f64,
    /// Declination offset of the star from lock position, pixels.
    #[serde(default)]
    pub dy: f64,
    #[serde(rename = "RADistanceRaw", default)]
    pub ra_distance_raw: f64,
    #[serde(rename = "DECDistanceRaw", default)]
    pub dec_distance_raw: f64,
    #[serde(rename = "RADuration", default)]
    pub ra_duration: f64,
    #[serde(rename = "RADirection", default)]
    pub ra_direction: Option<String>,
    #[serde(rename = "DECDuration", default)]
    pub dec_duration: f64,
    #[serde(rename = "DECDirection", default)]
    pub dec_direction: Option<String>,
    #[serde(rename = "StarMass", default)]
    pub star_mass: f64,
    #[serde(rename = "SNR", default)]
    pub snr: f64,
    #[serde(rename = "HFD", default)]
    pub hfd: f64,
    #[serde(rename = "AvgDist", default)]
    pub avg_dist: f64,
}

/// Settling progress after a guide start or dither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlingProgress {
    /// Current guide error distance, pixels.
    #[serde(rename = "Distance")]
    pub distance: f64,
    /// Seconds the error has stayed below the settle threshold.
    #[serde(rename = "Time")]
    pub time: f64,
    /// Seconds required below the threshold to be considered settled.
    #[serde(rename = "SettleTime")]
    pub settle_time: f64,
    #[serde(rename = "StarLocked", default)]
    pub star_locked: Option<bool>,
}

/// Terminal settle outcome. Status 0 with no error means success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettleResult {
    #[serde(rename = "Status")]
    pub status: i64,
    #[serde(rename = "Error", default)]
    pub error: Option<String>,
    #[serde(rename = "TotalFrames", default)]
    pub total_frames: Option<u64>,
    #[serde(rename = "DroppedFrames", default)]
    pub dropped_frames: Option<u64>,
}

impl SettleResult {
    /// Returns the error message if the settle failed, `None` on success.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref().filter(|m| !m.is_empty())
    }
}

/// Dither offset the engine applied, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DitherOffset {
    pub dx: f64,
    pub dy: f64,
}

/// Details of a lost guide star.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StarLost {
    #[serde(rename = "Frame", default)]
    pub frame: Option<u64>,
    #[serde(rename = "Status", default)]
    pub status: Option<i64>,
    #[serde(rename = "ErrorCode", default)]
    pub error_code: Option<i64>,
    #[serde(rename = "AvgDist", default)]
    pub avg_dist: Option<f64>,
}

/// Asynchronous event pushed by the engine on the listener connection.
///
/// Discriminated by the `Event` field. Every event also carries
/// `TimeStamp`/`Host`/`Inst` on the wire; those are accepted and ignored,
/// no consumer in this subsystem needs them. Event names outside this
/// enumeration decode as [`EngineEvent::Unknown`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Event")]
pub enum EngineEvent {
    Version {
        #[serde(rename = "PHDVersion", default)]
        version: Option<String>,
        #[serde(rename = "MsgVersion", default)]
        msg_version: Option<u64>,
    },
    AppState {
        #[serde(rename = "State")]
        state: String,
    },
    GuideStep(GuideStep),
    Settling(SettlingProgress),
    SettleDone(SettleResult),
    GuidingDithered(DitherOffset),
    Paused,
    Resumed,
    StartCalibration,
    LoopingExposures {
        #[serde(rename = "Frame", default)]
        frame: Option<u64>,
    },
    LoopingExposuresStopped,
    StarLost(StarLost),
    LockPositionLost,
    #[serde(other)]
    Unknown,
}

/// Classification of a single inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedLine {
    /// A method response, recognized by its `id` field.
    Response(MethodResponse),
    /// An engine event, recognized by its `Event` field.
    Event(EngineEvent),
    /// Anything else: malformed JSON, or JSON with neither discriminator.
    Ignored,
}

/// Decodes one inbound line.
///
/// A line with an `id` field is a response; otherwise a line with an
/// `Event` field is an event; everything else is ignored. Undecodable
/// lines are logged at debug level and dropped, never surfaced as errors.
pub fn decode_line(line: &str) -> DecodedLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return DecodedLine::Ignored;
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!("dropping unparseable line: {}", e);
            return DecodedLine::Ignored;
        }
    };

    if value.get("id").is_some() {
        match serde_json::from_value::<MethodResponse>(value) {
            Ok(response) => DecodedLine::Response(response),
            Err(e) => {
                tracing::debug!("dropping malformed response: {}", e);
                DecodedLine::Ignored
            }
        }
    } else if value.get("Event").is_some() {
        match serde_json::from_value::<EngineEvent>(value) {
            Ok(event) => DecodedLine::Event(event),
            Err(e) => {
                tracing::debug!("dropping malformed event: {}", e);
                DecodedLine::Ignored
            }
        }
    } else {
        DecodedLine::Ignored
    }
}
