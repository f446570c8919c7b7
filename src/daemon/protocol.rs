//! Envelope types exchanged between clients, the daemon and plugin hosts.
//!
//! Clients talk to the daemon with [`ClientMessage`] frames and receive
//! [`ResponseEnvelope`]s tagged with their request id. Plugin hosts receive
//! [`HostCommand`]s on stdin and answer with [`HostMessage`]s on stdout.

use crate::error::PluginError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of a response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeType {
    #[default]
    Response,
    Event,
    Error,
}

/// Path-addressed request sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Correlates responses on a shared connection.
    #[serde(default)]
    pub id: u64,
    pub path: String,
    #[serde(default)]
    pub data: Value,
    /// The caller expects a long-lived stream of events.
    #[serde(default)]
    pub stream: bool,
}

impl RequestEnvelope {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            id: 0,
            path: path.into(),
            data: Value::Null,
            stream: false,
        }
    }

    pub fn id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

/// One framed response. A request may produce many before the one with
/// `fin = true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(rename = "statusCode", default)]
    pub status_code: String,
    #[serde(default)]
    pub message: Value,
    #[serde(rename = "type", default)]
    pub kind: EnvelopeType,
    #[serde(default)]
    pub fin: bool,
    #[serde(default = "Utc::now")]
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub stack: Option<String>,
}

fn default_status() -> u16 {
    200
}

impl ResponseEnvelope {
    fn build(status: u16, kind: EnvelopeType, message: Value, fin: bool) -> Self {
        Self {
            id: None,
            status,
            status_code: status_code(status),
            message,
            kind,
            fin,
            ts: Utc::now(),
            stack: None,
        }
    }

    /// Terminal 200 response.
    pub fn ok(message: impl Into<Value>) -> Self {
        Self::build(200, EnvelopeType::Response, message.into(), true)
    }

    /// Non-terminal event in a stream.
    pub fn event(message: impl Into<Value>) -> Self {
        Self::build(200, EnvelopeType::Event, message.into(), false)
    }

    /// Terminal error response.
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self::build(status, EnvelopeType::Error, Value::String(message.into()), true)
    }

    pub fn not_found() -> Self {
        Self::from_error(&PluginError::NotFound)
    }

    pub fn from_error(err: &PluginError) -> Self {
        let mut envelope = Self::error(err.status(), err.to_string());
        envelope.stack = Some(format!("{}: {}", err.code(), err));
        envelope
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    pub fn is_error(&self) -> bool {
        self.kind == EnvelopeType::Error || self.status >= 400
    }

    /// Repairs fields a plugin host may leave out or get wrong.
    pub fn normalize(mut self) -> Self {
        self.status_code = status_code(self.status);
        if self.kind == EnvelopeType::Error && self.status < 400 {
            self.status = 500;
            self.status_code = status_code(500);
        }
        self
    }
}

/// The numeric status rendered as a fixed three character string.
pub fn status_code(status: u16) -> String {
    format!("{:03}", status)
}

/// Frames a client may send on its connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Request(RequestEnvelope),
    /// Stop relaying the stream for request `id`.
    Cancel { id: u64 },
}

/// Commands written to an external plugin host's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostCommand {
    Request { id: u64, path: String, data: Value },
    Cancel { id: u64 },
    Shutdown,
}

/// Messages read from an external plugin host's stdout.
///
/// `ready` and `shutdown-ack` are control messages; anything else is parsed
/// as a response envelope whose `type` is `response`, `event` or `error`.
#[derive(Debug, Clone, PartialEq)]
pub enum HostMessage {
    Ready,
    ShutdownAck,
    Envelope(ResponseEnvelope),
}

impl<'de> Deserialize<'de> for HostMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match value.get("type").and_then(Value::as_str) {
            Some("ready") => Ok(HostMessage::Ready),
            Some("shutdown-ack") => Ok(HostMessage::ShutdownAck),
            _ => serde_json::from_value::<ResponseEnvelope>(value)
                .map(|e| HostMessage::Envelope(e.normalize()))
                .map_err(serde::de::Error::custom),
        }
    }
}

impl Serialize for HostMessage {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            HostMessage::Ready => serde_json::json!({ "type": "ready" }).serialize(serializer),
            HostMessage::ShutdownAck => {
                serde_json::json!({ "type": "shutdown-ack" }).serialize(serializer)
            }
            HostMessage::Envelope(envelope) => envelope.serialize(serializer),
        }
    }
}
