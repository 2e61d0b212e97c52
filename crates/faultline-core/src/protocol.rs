//! JSON wire protocol for the control channel.
//!
//! Every frame is a UTF-8 JSON text frame. The tool sends [`ControlMessage`]s;
//! the app answers with [`ControlReply`]s (correlated by `id`) or emits
//! fire-and-forget [`Notification`]s.
//!
//! # Frames
//!
//! ```text
//! tool -> app   {"message": "getPosition:login-button", "id": "7"}
//! app  -> tool  {"position": {"id": "login-button", "x": 0.1, ...}, "id": "7"}
//! tool -> app   {"message": "click:login-button"}
//! app  -> tool  {"action": "login-button"}
//! tool -> app   {"message": "getColorScheme", "id": "8"}
//! app  -> tool  {"value": "dark", "id": "8"}
//! ```
//!
//! The `message` key is a flat string. It is decoded exactly once into the
//! closed [`Command`] enum, so every consumer dispatches through an
//! exhaustive `match`.
//!
//! # Versioning
//!
//! The envelope may carry an integer `v`. A missing `v` means version 1.
//! Frames announcing a newer version than [`PROTOCOL_VERSION`] are rejected
//! with [`ProtocolError::UnsupportedVersion`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::harness::StreamReport;

/// Highest envelope version this crate understands.
pub const PROTOCOL_VERSION: u32 = 1;

const GET_POSITION_PREFIX: &str = "getPosition:";
const CLICK_PREFIX: &str = "click:";
const FETCH_DATA: &str = "fetchData";
const SET_NETWORK_MODE: &str = "setNetworkMode";
const RUN_STREAM: &str = "runStream";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while decoding a control frame.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The frame is not valid JSON or lacks the envelope fields.
    #[error("invalid frame: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame announces an envelope version newer than supported.
    #[error("unsupported protocol version {0} (max {PROTOCOL_VERSION})")]
    UnsupportedVersion(u32),

    /// A command is missing a required payload field.
    #[error("{message}: missing field `{field}`")]
    MissingField {
        message: String,
        field: &'static str,
    },

    /// A payload field has the wrong shape.
    #[error("{message}: invalid field `{field}`: {reason}")]
    InvalidField {
        message: String,
        field: &'static str,
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A request frame sent from the tool to the app.
///
/// Extra top-level keys are kept in `payload`. A nested `"payload"` object is
/// also honoured when looking up fields, see [`ControlMessage::field`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Correlation id. Absent for fire-and-forget commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Flat command name, e.g. `getOrientation` or `click:<target>`.
    pub message: String,

    /// Envelope version (`v` on the wire).
    #[serde(default, rename = "v", skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,

    /// Any additional fields carried by the frame.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl ControlMessage {
    /// Creates a message with no id and no payload.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            id: None,
            message: message.into(),
            version: None,
            payload: Map::new(),
        }
    }

    /// Sets the correlation id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Adds a payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Looks up a payload field at the top level, then inside a nested
    /// `payload` object.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name).or_else(|| {
            self.payload
                .get("payload")
                .and_then(Value::as_object)
                .and_then(|nested| nested.get(name))
        })
    }

    /// Flattens top-level and nested payload fields into one object,
    /// top-level keys taking precedence.
    fn merged_payload(&self) -> Map<String, Value> {
        let mut merged = self
            .payload
            .get("payload")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        for (key, value) in &self.payload {
            if key != "payload" {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }
}

/// Parses one inbound text frame, enforcing the envelope version.
pub fn decode_frame(text: &str) -> Result<ControlMessage, ProtocolError> {
    let message: ControlMessage = serde_json::from_str(text)?;
    if let Some(version) = message.version {
        if version > PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
    }
    Ok(message)
}

// ---------------------------------------------------------------------------
// Replies and notifications
// ---------------------------------------------------------------------------

/// A normalized bounding box of a target within the viewport.
///
/// All four measurements are fractions of the viewport size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// The single reply to a request that carried an `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlReply {
    /// The id of the request being answered.
    pub id: String,

    /// Scalar or structured query result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    /// Target geometry, for `getPosition:<id>` requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Geometry>,
}

impl ControlReply {
    /// A reply carrying a query value.
    pub fn value(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            value: Some(value),
            position: None,
        }
    }

    /// A reply carrying a geometry measurement.
    pub fn position(id: impl Into<String>, position: Geometry) -> Self {
        Self {
            id: id.into(),
            value: None,
            position: Some(position),
        }
    }
}

/// Fire-and-forget frames emitted by the app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Notification {
    /// A target was activated, remotely or physically.
    Action { action: String },

    /// A streaming scenario finished and nobody asked for a reply.
    Stream { stream: StreamReport },
}

/// Any frame the tool can receive from the app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AppFrame {
    Reply(ControlReply),
    Notification(Notification),
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Point-in-time device and environment queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceQuery {
    ColorScheme,
    Orientation,
    FontSize,
    AppState,
    AppName,
    Localization,
    Location,
    BiometricsAvailability,
    BiometricsCheck,
}

impl DeviceQuery {
    /// Every query, in wire-table order.
    pub const ALL: [DeviceQuery; 9] = [
        DeviceQuery::ColorScheme,
        DeviceQuery::Orientation,
        DeviceQuery::FontSize,
        DeviceQuery::AppState,
        DeviceQuery::AppName,
        DeviceQuery::Localization,
        DeviceQuery::Location,
        DeviceQuery::BiometricsAvailability,
        DeviceQuery::BiometricsCheck,
    ];

    /// The wire name of this query.
    pub fn name(&self) -> &'static str {
        match self {
            DeviceQuery::ColorScheme => "getColorScheme",
            DeviceQuery::Orientation => "getOrientation",
            DeviceQuery::FontSize => "getFontSize",
            DeviceQuery::AppState => "getAppState",
            DeviceQuery::AppName => "getAppName",
            DeviceQuery::Localization => "getLocalization",
            DeviceQuery::Location => "getLocation",
            DeviceQuery::BiometricsAvailability => "checkBiometricsAvailability",
            DeviceQuery::BiometricsCheck => "performBiometricsCheck",
        }
    }

    /// Looks up a query by wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|query| query.name() == name)
    }

    /// Whether answering requires awaiting the platform (permission prompts,
    /// sensors).
    pub fn is_async(&self) -> bool {
        matches!(
            self,
            DeviceQuery::Location
                | DeviceQuery::BiometricsAvailability
                | DeviceQuery::BiometricsCheck
        )
    }
}

/// An outbound HTTP request issued on the tool's behalf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchSpec {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub headers: Map<String, Value>,

    /// A string body is sent verbatim as a URL-encoded form unless a
    /// `Content-Type` header says otherwise; any other JSON value is
    /// serialized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,

    /// `multipart/form-data` fields, sent instead of `body`. An object value
    /// with `filename`, `contentType` and `content` is a file part.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multipart: Option<Map<String, Value>>,
}

impl FetchSpec {
    /// A bare GET of `url`.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: None,
            headers: Map::new(),
            body: None,
            multipart: None,
        }
    }
}

/// How a streaming scenario consumes the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum StreamPolicy {
    /// Read to exhaustion.
    Complete,
    /// Read `after` chunks, then cancel the reader.
    Cancel { after: usize },
    /// Read `after` chunks, then drop the reader without cancelling.
    Abandon { after: usize },
    /// Ignore the stream and read the whole body as text.
    Fallback,
    /// Issue an ordinary fetch, without asking for a stream, and read the
    /// whole body as text.
    Plain,
}

impl StreamPolicy {
    /// Short name used in logs and reports.
    pub fn name(&self) -> &'static str {
        match self {
            StreamPolicy::Complete => "complete",
            StreamPolicy::Cancel { .. } => "cancel",
            StreamPolicy::Abandon { .. } => "abandon",
            StreamPolicy::Fallback => "fallback",
            StreamPolicy::Plain => "plain",
        }
    }
}

/// Parameters of a `runStream` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRequest {
    pub url: String,

    #[serde(flatten)]
    pub policy: StreamPolicy,

    /// Runs the scenario under this network mode and restores the previous
    /// one afterwards. Absent means the current mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polyfill: Option<bool>,
}

impl StreamRequest {
    pub fn new(url: impl Into<String>, policy: StreamPolicy) -> Self {
        Self {
            url: url.into(),
            policy,
            polyfill: None,
        }
    }

    pub fn with_polyfill(mut self, enabled: bool) -> Self {
        self.polyfill = Some(enabled);
        self
    }
}

/// A decoded control command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Measure a target (`getPosition:<target>`).
    GetPosition { target: String },
    /// Activate a target (`click:<target>`).
    Click { target: String },
    /// Answer a device query.
    Query(DeviceQuery),
    /// Issue an outbound request without replying (`fetchData`).
    FetchData(FetchSpec),
    /// Swap network primitives between native and polyfilled
    /// (`setNetworkMode`, payload `polyfill: bool`).
    SetNetworkMode { polyfill: bool },
    /// Run a streaming scenario (`runStream`).
    RunStream(StreamRequest),
    /// A name this build does not know.
    Unknown(String),
}

impl Command {
    /// Decodes the command carried by `message`.
    pub fn decode(message: &ControlMessage) -> Result<Self, ProtocolError> {
        let name = message.message.as_str();

        if let Some(target) = name.strip_prefix(GET_POSITION_PREFIX) {
            return Ok(Command::GetPosition {
                target: target.to_string(),
            });
        }
        if let Some(target) = name.strip_prefix(CLICK_PREFIX) {
            return Ok(Command::Click {
                target: target.to_string(),
            });
        }
        if let Some(query) = DeviceQuery::from_name(name) {
            return Ok(Command::Query(query));
        }

        match name {
            FETCH_DATA => {
                if message.field("url").is_none() {
                    return Err(ProtocolError::MissingField {
                        message: name.to_string(),
                        field: "url",
                    });
                }
                let spec = serde_json::from_value(Value::Object(message.merged_payload()))
                    .map_err(|e| ProtocolError::InvalidField {
                        message: name.to_string(),
                        field: "url",
                        reason: e.to_string(),
                    })?;
                Ok(Command::FetchData(spec))
            }
            SET_NETWORK_MODE => {
                let polyfill = message.field("polyfill").ok_or(ProtocolError::MissingField {
                    message: name.to_string(),
                    field: "polyfill",
                })?;
                let polyfill = polyfill.as_bool().ok_or_else(|| ProtocolError::InvalidField {
                    message: name.to_string(),
                    field: "polyfill",
                    reason: "expected a boolean".to_string(),
                })?;
                Ok(Command::SetNetworkMode { polyfill })
            }
            RUN_STREAM => {
                let request = serde_json::from_value(Value::Object(message.merged_payload()))
                    .map_err(|e| ProtocolError::InvalidField {
                        message: name.to_string(),
                        field: "policy",
                        reason: e.to_string(),
                    })?;
                Ok(Command::RunStream(request))
            }
            other => Ok(Command::Unknown(other.to_string())),
        }
    }

    /// Encodes this command into an envelope without an id.
    pub fn to_message(&self) -> ControlMessage {
        match self {
            Command::GetPosition { target } => {
                ControlMessage::new(format!("{GET_POSITION_PREFIX}{target}"))
            }
            Command::Click { target } => ControlMessage::new(format!("{CLICK_PREFIX}{target}")),
            Command::Query(query) => ControlMessage::new(query.name()),
            Command::FetchData(spec) => {
                let mut message = ControlMessage::new(FETCH_DATA);
                if let Ok(Value::Object(fields)) = serde_json::to_value(spec) {
                    message.payload = fields;
                }
                message
            }
            Command::SetNetworkMode { polyfill } => {
                ControlMessage::new(SET_NETWORK_MODE).with_field("polyfill", Value::Bool(*polyfill))
            }
            Command::RunStream(request) => {
                let mut message = ControlMessage::new(RUN_STREAM);
                if let Ok(Value::Object(fields)) = serde_json::to_value(request) {
                    message.payload = fields;
                }
                message
            }
            Command::Unknown(name) => ControlMessage::new(name.clone()),
        }
    }

    /// Returns a short, static name suitable for tracing span metadata.
    pub fn name(&self) -> &'static str {
        match self {
            Command::GetPosition { .. } => "get_position",
            Command::Click { .. } => "click",
            Command::Query(query) => query.name(),
            Command::FetchData(_) => "fetch_data",
            Command::SetNetworkMode { .. } => "set_network_mode",
            Command::RunStream(_) => "run_stream",
            Command::Unknown(_) => "unknown",
        }
    }
}
