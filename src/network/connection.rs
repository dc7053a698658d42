//! Backend connection manager
//!
//! Owns the single connection to the separation backend. Concurrent
//! `ensure_connected` callers share one attempt: the first caller starts it,
//! everyone (the first caller included) waits on a oneshot in the wait-list,
//! and the attempt outcome is delivered to all of them at once.
//!
//! Every attempt carries a generation number. `disconnect` bumps it, so an
//! attempt or a reader that finishes afterwards is recognised as stale and
//! cannot touch the current state or emit events.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::ModelConfig;
use crate::error::ConnectionError;
use crate::network::transport::{Connection, Outgoing, Transport, TransportEvent};
use crate::protocol::OutboundMessage;

/// Extra time a waiter allows beyond the attempt's own timeout, so the
/// attempt outcome normally reaches it first
const WAITER_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Reported to the single subscriber registered at construction
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Opened,
    Message(String),
    /// The open connection went away without being asked to
    Disconnected(Option<String>),
    /// An attempt failed or the connection errored
    Failed(ConnectionError),
}

type Waiter = oneshot::Sender<Result<(), ConnectionError>>;

struct Inner {
    state: ConnectionState,
    outbound: Option<mpsc::UnboundedSender<Outgoing>>,
    pending_config: Option<ModelConfig>,
    waiters: Vec<Waiter>,
    generation: u64,
    reader: Option<JoinHandle<()>>,
}

pub struct ConnectionManager {
    url: String,
    transport: Arc<dyn Transport>,
    connect_timeout: Duration,
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    attempts: AtomicU64,
    messages_sent: AtomicU64,
}

impl ConnectionManager {
    /// Create a manager and the receiver for its events
    pub fn new(
        url: impl Into<String>,
        transport: Arc<dyn Transport>,
        connect_timeout: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            url: url.into(),
            transport,
            connect_timeout,
            inner: Mutex::new(Inner {
                state: ConnectionState::Idle,
                outbound: None,
                pending_config: None,
                waiters: Vec::new(),
                generation: 0,
                reader: None,
            }),
            events,
            attempts: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
        });
        (manager, events_rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Underlying connection attempts started so far
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn has_pending_config(&self) -> bool {
        self.inner.lock().pending_config.is_some()
    }

    /// Resolve once the connection is open, starting an attempt if needed
    pub async fn ensure_connected(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            match inner.state {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Connecting => inner.waiters.push(tx),
                ConnectionState::Idle | ConnectionState::Closing | ConnectionState::Closed => {
                    inner.state = ConnectionState::Connecting;
                    inner.generation += 1;
                    if let Some(stale) = inner.outbound.take() {
                        let _ = stale.send(Outgoing::Close);
                    }
                    if let Some(reader) = inner.reader.take() {
                        reader.abort();
                    }
                    inner.waiters.push(tx);

                    let generation = inner.generation;
                    self.attempts.fetch_add(1, Ordering::Relaxed);
                    tracing::info!("Connecting to {} (attempt {})", self.url, self.attempts());
                    tokio::spawn(self.clone().run_attempt(generation));
                }
            }
        }

        match tokio::time::timeout(self.connect_timeout + WAITER_GRACE, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConnectionError::Aborted),
            Err(_) => Err(ConnectionError::ConnectionTimeout),
        }
    }

    async fn run_attempt(self: Arc<Self>, generation: u64) {
        let result = match tokio::time::timeout(self.connect_timeout, self.transport.connect(&self.url)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::ConnectionTimeout),
        };
        self.complete_attempt(generation, result);
    }

    fn complete_attempt(self: &Arc<Self>, generation: u64, result: Result<Connection, ConnectionError>) {
        let mut inner = self.inner.lock();

        if inner.generation != generation {
            tracing::debug!("Discarding outcome of abandoned attempt {}", generation);
            if let Ok(connection) = result {
                let _ = connection.outbound.send(Outgoing::Close);
            }
            return;
        }

        let waiters = std::mem::take(&mut inner.waiters);
        match result {
            Ok(Connection { outbound, inbound }) => {
                inner.state = ConnectionState::Open;
                if let Some(config) = inner.pending_config.take() {
                    match OutboundMessage::configure(config).encode() {
                        Ok(text) => {
                            if outbound.send(Outgoing::Text(text)).is_ok() {
                                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        Err(e) => tracing::error!("Failed to encode pending configuration: {}", e),
                    }
                }
                inner.outbound = Some(outbound);
                inner.reader = Some(tokio::spawn(self.clone().read_loop(generation, inbound)));
                drop(inner);

                tracing::info!("Connected to {}", self.url);
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
                let _ = self.events.send(ConnectionEvent::Opened);
            }
            Err(e) => {
                inner.state = ConnectionState::Closed;
                inner.outbound = None;
                drop(inner);

                tracing::warn!("Connection to {} failed: {}", self.url, e);
                for waiter in waiters {
                    let _ = waiter.send(Err(e.clone()));
                }
                let _ = self.events.send(ConnectionEvent::Failed(e));
            }
        }
    }

    async fn read_loop(self: Arc<Self>, generation: u64, mut inbound: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = inbound.recv().await {
            match event {
                TransportEvent::Message(text) => {
                    if !self.is_current(generation) {
                        break;
                    }
                    let _ = self.events.send(ConnectionEvent::Message(text));
                }
                TransportEvent::Closed(reason) => {
                    self.connection_lost(generation, ConnectionEvent::Disconnected(reason));
                    return;
                }
                TransportEvent::Error(err) => {
                    let event = ConnectionEvent::Failed(ConnectionError::Closed(err));
                    self.connection_lost(generation, event);
                    return;
                }
            }
        }
        self.connection_lost(generation, ConnectionEvent::Disconnected(None));
    }

    fn is_current(&self, generation: u64) -> bool {
        let inner = self.inner.lock();
        inner.generation == generation && inner.state == ConnectionState::Open
    }

    fn connection_lost(&self, generation: u64, event: ConnectionEvent) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            // Intentional shutdown: finish the close quietly.
            if inner.state == ConnectionState::Closing {
                inner.state = ConnectionState::Closed;
            }
            return;
        }

        inner.state = ConnectionState::Closed;
        inner.outbound = None;
        inner.reader = None;
        drop(inner);

        tracing::warn!("Connection to {} lost: {:?}", self.url, event);
        let _ = self.events.send(event);
    }

    /// Fire-and-forget send. Dropped (returns `false`) unless the connection is open.
    pub fn send(&self, message: &OutboundMessage) -> bool {
        if !self.is_open() {
            tracing::trace!("Connection not open, dropping outbound message");
            return false;
        }
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Failed to encode outbound message: {}", e);
                return false;
            }
        };
        self.send_text(text)
    }

    fn send_text(&self, text: String) -> bool {
        let inner = self.inner.lock();
        match (&inner.outbound, inner.state) {
            (Some(outbound), ConnectionState::Open) => {
                let sent = outbound.send(Outgoing::Text(text)).is_ok();
                if sent {
                    self.messages_sent.fetch_add(1, Ordering::Relaxed);
                }
                sent
            }
            _ => false,
        }
    }

    /// Send the model configuration now, or park it in the single pending
    /// slot (replacing any older one) and connect
    pub async fn configure(self: &Arc<Self>, config: ModelConfig) -> Result<(), ConnectionError> {
        let config = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Open {
                Some(config)
            } else {
                inner.pending_config = Some(config);
                None
            }
        };
        let Some(config) = config else {
            return self.ensure_connected().await;
        };

        tracing::info!("Configuring backend model {}", config.model);
        if self.send(&OutboundMessage::configure(config.clone())) {
            Ok(())
        } else {
            // Lost between the check and the send; keep it for the next open.
            self.inner.lock().pending_config = Some(config);
            self.ensure_connected().await
        }
    }

    /// Close the connection without reporting it upstream.
    ///
    /// Clears the pending configuration and rejects anyone still waiting.
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.pending_config = None;
        let waiters = std::mem::take(&mut inner.waiters);

        inner.state = match inner.outbound.take() {
            Some(outbound) => {
                let _ = outbound.send(Outgoing::Close);
                tracing::info!("Disconnecting from {}", self.url);
                if inner.reader.take().is_some() {
                    ConnectionState::Closing
                } else {
                    ConnectionState::Closed
                }
            }
            None => ConnectionState::Idle,
        };
        drop(inner);

        for waiter in waiters {
            let _ = waiter.send(Err(ConnectionError::Aborted));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransport;
    use futures_util::future::join_all;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn manager(transport: &Arc<FakeTransport>) -> (Arc<ConnectionManager>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        ConnectionManager::new("ws://backend", transport.clone(), TIMEOUT)
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_attempt() {
        let transport = Arc::new(FakeTransport::gated());
        let (manager, mut events) = manager(&transport);

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let m = manager.clone();
                tokio::spawn(async move { m.ensure_connected().await })
            })
            .collect();

        transport.wait_for_attempts(1).await;
        tokio::task::yield_now().await;
        assert_eq!(manager.state(), ConnectionState::Connecting);
        transport.release_ok();

        for result in join_all(callers).await {
            assert_eq!(result.unwrap(), Ok(()));
        }
        assert_eq!(transport.attempts(), 1);
        assert_eq!(manager.attempts(), 1);
        assert_eq!(manager.state(), ConnectionState::Open);
        assert_eq!(events.recv().await, Some(ConnectionEvent::Opened));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_failure() {
        let transport = Arc::new(FakeTransport::gated());
        let (manager, mut events) = manager(&transport);

        let callers: Vec<_> = (0..4)
            .map(|_| {
                let m = manager.clone();
                tokio::spawn(async move { m.ensure_connected().await })
            })
            .collect();

        transport.wait_for_attempts(1).await;
        transport.release_err("refused");

        for result in join_all(callers).await {
            assert_eq!(result.unwrap(), Err(ConnectionError::OpenFailed("refused".into())));
        }
        assert_eq!(transport.attempts(), 1);
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(matches!(events.recv().await, Some(ConnectionEvent::Failed(_))));
    }

    #[tokio::test]
    async fn test_open_resolves_immediately() {
        let transport = Arc::new(FakeTransport::new());
        let (manager, _events) = manager(&transport);

        manager.ensure_connected().await.unwrap();
        manager.ensure_connected().await.unwrap();
        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_attempt_times_out() {
        let transport = Arc::new(FakeTransport::gated());
        let (manager, _events) = manager(&transport);

        let result = manager.ensure_connected().await;
        assert_eq!(result, Err(ConnectionError::ConnectionTimeout));
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_configure_while_connecting_sends_last_once() {
        let transport = Arc::new(FakeTransport::gated());
        let (manager, _events) = manager(&transport);

        let first = {
            let m = manager.clone();
            tokio::spawn(async move { m.configure(ModelConfig::named("a")).await })
        };
        transport.wait_for_attempts(1).await;
        let second = {
            let m = manager.clone();
            tokio::spawn(async move { m.configure(ModelConfig::named("b")).await })
        };
        let third = {
            let m = manager.clone();
            tokio::spawn(async move { m.configure(ModelConfig::named("c")).await })
        };
        while !manager.has_pending_config() || manager.inner.lock().waiters.len() < 3 {
            tokio::task::yield_now().await;
        }

        transport.release_ok();
        for handle in [first, second, third] {
            assert_eq!(handle.await.unwrap(), Ok(()));
        }

        transport.wait_for_sent(1).await;
        tokio::task::yield_now().await;
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(value["type"], "configure");
        assert_eq!(value["config"]["model"], "c");
        assert!(!manager.has_pending_config());
    }

    #[tokio::test]
    async fn test_configure_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}

        let transport = Arc::new(FakeTransport::new());
        let (manager, _events) = manager(&transport);
        let pending = manager.configure(ModelConfig::named("a"));
        assert_send(&pending);
        assert_eq!(pending.await, Ok(()));
    }

    #[tokio::test]
    async fn test_send_requires_open() {
        let transport = Arc::new(FakeTransport::new());
        let (manager, _events) = manager(&transport);

        let msg = OutboundMessage::audio_data(vec![0.0; 4], 44100, 2);
        assert!(!manager.send(&msg));
        assert!(transport.sent().is_empty());

        manager.ensure_connected().await.unwrap();
        assert!(manager.send(&msg));
        transport.wait_for_sent(1).await;
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(manager.messages_sent(), 1);
    }

    #[tokio::test]
    async fn test_remote_close_reported() {
        let transport = Arc::new(FakeTransport::new());
        let (manager, mut events) = manager(&transport);
        manager.ensure_connected().await.unwrap();
        assert_eq!(events.recv().await, Some(ConnectionEvent::Opened));

        transport.push_inbound(r#"{"type":"status","status":"ok"}"#);
        assert_eq!(
            events.recv().await,
            Some(ConnectionEvent::Message(r#"{"type":"status","status":"ok"}"#.into()))
        );

        transport.close_remote(Some("bye"));
        assert_eq!(events.recv().await, Some(ConnectionEvent::Disconnected(Some("bye".into()))));
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_disconnect_is_silent() {
        let transport = Arc::new(FakeTransport::new());
        let (manager, mut events) = manager(&transport);
        manager.ensure_connected().await.unwrap();
        assert_eq!(events.recv().await, Some(ConnectionEvent::Opened));

        manager.disconnect();
        assert_ne!(manager.state(), ConnectionState::Open);
        transport.wait_for_close().await;

        // The close the transport reports back must not surface as an event.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_disconnect_discards_in_flight_attempt() {
        let transport = Arc::new(FakeTransport::gated());
        let (manager, mut events) = manager(&transport);

        let caller = {
            let m = manager.clone();
            tokio::spawn(async move { m.ensure_connected().await })
        };
        transport.wait_for_attempts(1).await;
        while manager.inner.lock().waiters.is_empty() {
            tokio::task::yield_now().await;
        }

        manager.disconnect();
        assert_eq!(caller.await.unwrap(), Err(ConnectionError::Aborted));

        // The late open must not resurrect the connection.
        transport.release_ok();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reconnect_after_close() {
        let transport = Arc::new(FakeTransport::new());
        let (manager, mut events) = manager(&transport);
        manager.ensure_connected().await.unwrap();
        events.recv().await;

        transport.close_remote(None);
        assert_eq!(events.recv().await, Some(ConnectionEvent::Disconnected(None)));

        manager.ensure_connected().await.unwrap();
        assert_eq!(transport.attempts(), 2);
        assert!(manager.is_open());
    }
}
