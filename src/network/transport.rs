//! Backend transport
//!
//! A transport opens one bidirectional text connection. The connection
//! manager only ever sees the two channel ends in [`Connection`], which keeps
//! socket handling out of the state machine and lets tests substitute an
//! in-memory transport.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::error::ConnectionError;

/// Frames written to the backend
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Text(String),
    /// Close the connection; nothing is sent after this
    Close,
}

/// Events read from the backend
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(String),
    /// Remote or local close, with the close reason when one was given
    Closed(Option<String>),
    Error(String),
}

/// One open connection
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<Outgoing>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens connections to the backend
pub trait Transport: Send + Sync {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Connection, ConnectionError>>;
}

/// WebSocket transport (text frames carrying JSON)
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

impl Transport for WebSocketTransport {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Connection, ConnectionError>> {
        let url = url.to_string();
        Box::pin(async move {
            let (socket, _response) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| ConnectionError::OpenFailed(e.to_string()))?;
            tracing::debug!("WebSocket handshake with {} complete", url);

            let (mut sink, mut stream) = socket.split();
            let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outgoing>();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<TransportEvent>();

            tokio::spawn(async move {
                while let Some(frame) = outbound_rx.recv().await {
                    let result = match frame {
                        Outgoing::Text(text) => sink.send(Message::Text(text)).await,
                        Outgoing::Close => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    };
                    if let Err(e) = result {
                        tracing::warn!("WebSocket write failed: {}", e);
                        break;
                    }
                }
                let _ = sink.close().await;
            });

            tokio::spawn(async move {
                let closing = loop {
                    match stream.next().await {
                        Some(Ok(Message::Text(text))) => {
                            if inbound_tx.send(TransportEvent::Message(text)).is_err() {
                                return;
                            }
                        }
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(text) => {
                                if inbound_tx.send(TransportEvent::Message(text)).is_err() {
                                    return;
                                }
                            }
                            Err(_) => tracing::warn!("Dropping non-UTF-8 binary frame"),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            break TransportEvent::Closed(frame.map(|f| f.reason.to_string()));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break TransportEvent::Error(e.to_string()),
                        None => break TransportEvent::Closed(None),
                    }
                };
                let _ = inbound_tx.send(closing);
            });

            Ok(Connection {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        })
    }
}
