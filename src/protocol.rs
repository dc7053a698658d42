//! Wire and control messages
//!
//! Backend frames are JSON objects discriminated by a `type` field. Control
//! surface types (start requests, status broadcasts) live here as well so the
//! HTTP layer and the session agree on one shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::ModelConfig;
use crate::error::{ErrorKind, ProtocolError};

/// Sample layout of outbound audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioFormat {
    #[serde(rename = "float32_interleaved")]
    Float32Interleaved,
}

/// Messages sent to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Configure {
        config: ModelConfig,
    },
    AudioData {
        data: Vec<f32>,
        sample_rate: u32,
        channels: u16,
        audio_format: AudioFormat,
        /// Milliseconds since the Unix epoch at chunk emission
        timestamp: i64,
    },
}

impl OutboundMessage {
    pub fn configure(config: ModelConfig) -> Self {
        OutboundMessage::Configure { config }
    }

    pub fn audio_data(data: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        OutboundMessage::AudioData {
            data,
            sample_rate,
            channels,
            audio_format: AudioFormat::Float32Interleaved,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Messages received from the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    SeparatedAudio {
        stem: String,
        data: Vec<f32>,
        /// Echo of the originating chunk timestamp, when the backend sends one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<f64>,
    },
    Status {
        status: String,
    },
    Error {
        error: String,
    },
}

impl InboundMessage {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::MalformedMessage(e.to_string()))
    }
}

/// What a status broadcast is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Connected,
    Disconnected,
    ConnectionError,
    ServerStatus,
    ServerError,
    SessionStarted,
    SessionStopped,
    SessionFailed,
}

/// Broadcast to control surface observers
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub kind: StatusKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(kind: StatusKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            error_kind: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(kind: StatusKind, error_kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error_kind: Some(error_kind),
            ..Self::new(kind, message)
        }
    }
}

/// Body of a session start request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartRequest {
    /// Overrides the configured model for this session
    pub model_config: Option<ModelConfig>,
    /// Initial per-stem volumes in [0, 1]
    pub stem_volumes: HashMap<String, f32>,
}

/// Body of a stem volume request
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VolumeRequest {
    pub volume: f32,
}
