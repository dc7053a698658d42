//! Error types for the stem relay

use serde::Serialize;
use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Machine-checkable category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Audio(AudioError::CaptureUnavailable(_)) => ErrorKind::CaptureUnavailable,
            Error::Audio(_) => ErrorKind::Playback,
            Error::Connection(_) => ErrorKind::Connection,
            Error::Protocol(_) => ErrorKind::MalformedMessage,
            Error::Session(e) => e.kind(),
            Error::Config(_) | Error::Io(_) => ErrorKind::Config,
        }
    }
}

/// Category attached to every user-visible failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    MalformedMessage,
    CaptureUnavailable,
    BackendModel,
    Playback,
    Config,
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Capture source unavailable: {0}")]
    CaptureUnavailable(String),

    #[error("Output device not found: {0}")]
    OutputUnavailable(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Backend connection errors.
///
/// Cloneable so a single attempt outcome can be handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection failed: {0}")]
    OpenFailed(String),

    #[error("Timed out waiting for connection")]
    ConnectionTimeout,

    #[error("Connection closed unexpectedly: {0}")]
    Closed(String),

    #[error("Connection attempt abandoned")]
    Aborted,
}

/// Wire message errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Session lifecycle errors
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("Backend model error: {0}")]
    BackendModel(String),

    #[error("Gave up reconnecting after {0} attempts")]
    ReconnectExhausted(u32),

    #[error("Session start failed: {0}")]
    StartFailed(String),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::BackendModel(_) => ErrorKind::BackendModel,
            SessionError::ReconnectExhausted(_) => ErrorKind::Connection,
            SessionError::StartFailed(_) => ErrorKind::Connection,
        }
    }
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
