//! Inbound message routing
//!
//! Every backend frame passes through [`InboundRouter::route`] in arrival
//! order. Audio goes straight to the mixer and status or error text goes to
//! the status broadcast. Nothing is buffered here.

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::ErrorKind;
use crate::mixer::PlaybackMixer;
use crate::protocol::{InboundMessage, StatusEvent, StatusKind};

/// Backend error text that means no separation model is usable
pub const NO_MODEL_SIGNATURE: &str = "No model loaded/configured";

/// What became of one inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// Stem audio started on the named channel
    Played { stem: String },
    /// Stem audio with no channel to play on
    Dropped,
    Status(String),
    /// Non-fatal backend error
    ServerError(String),
    /// Backend error that must end the session
    Fatal(String),
    Malformed,
}

pub struct InboundRouter {
    mixer: Arc<PlaybackMixer>,
    status_tx: broadcast::Sender<StatusEvent>,
}

impl InboundRouter {
    pub fn new(mixer: Arc<PlaybackMixer>, status_tx: broadcast::Sender<StatusEvent>) -> Self {
        Self { mixer, status_tx }
    }

    pub fn route(&self, raw: &str) -> RouteOutcome {
        let message = match InboundMessage::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping inbound frame: {}", e);
                return RouteOutcome::Malformed;
            }
        };

        match message {
            InboundMessage::SeparatedAudio { stem, data, .. } => {
                tracing::trace!("Received {} samples for stem {}", data.len(), stem);
                match self.mixer.ingest_stem(&stem, data) {
                    Some(stem) => RouteOutcome::Played { stem },
                    None => RouteOutcome::Dropped,
                }
            }
            InboundMessage::Status { status } => {
                tracing::info!("Backend status: {}", status);
                self.publish(StatusEvent::new(StatusKind::ServerStatus, status.clone()));
                RouteOutcome::Status(status)
            }
            InboundMessage::Error { error } => {
                if error.contains(NO_MODEL_SIGNATURE) {
                    tracing::error!("Backend has no usable model: {}", error);
                    self.publish(StatusEvent::failure(
                        StatusKind::ServerError,
                        ErrorKind::BackendModel,
                        error.clone(),
                    ));
                    RouteOutcome::Fatal(error)
                } else {
                    tracing::warn!("Backend error: {}", error);
                    self.publish(StatusEvent::new(StatusKind::ServerError, error.clone()));
                    RouteOutcome::ServerError(error)
                }
            }
        }
    }

    fn publish(&self, event: StatusEvent) {
        // No subscribers is fine.
        let _ = self.status_tx.send(event);
    }
}
