//! Session lifecycle
//!
//! ```text
//!   Inactive ──start──▶ Starting ──connected+configured──▶ Active
//!      ▲                   │                                  │
//!      └──── failure ──────┘          stop / fatal ──▶ Stopping ──▶ Inactive
//! ```
//!
//! A session wires capture → accumulator → uploader → connection on the way
//! out, and connection → router → mixer on the way back. While `Active` a
//! lost connection is retried with a linearly growing delay; once the
//! attempts are used up the session stops itself and reports the failure.

pub mod pipeline;

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::audio::capture::{CaptureProvider, CaptureSource};
use crate::audio::playback::AudioOutput;
use crate::config::AppConfig;
use crate::error::{AudioError, ConnectionError, Error, ErrorKind, Result, SessionError};
use crate::mixer::PlaybackMixer;
use crate::network::{
    ConnectionEvent, ConnectionManager, ConnectionState, InboundRouter, RouteOutcome, Transport,
};
use crate::protocol::{StartRequest, StatusEvent, StatusKind};

use pipeline::{UploadSnapshot, UploadStats};

/// Capacity of the status broadcast; slow observers skip ahead
const STATUS_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Inactive,
    Starting,
    Active,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
pub struct StemStatus {
    pub name: String,
    pub volume: f32,
    pub playing: bool,
}

/// Snapshot reported to the control surface
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub connection: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub reconnect_attempts: u32,
    pub upload: UploadSnapshot,
    pub messages_sent: u64,
    pub stems: Vec<StemStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Everything a running session owns
struct Wiring {
    capture: Option<Box<dyn CaptureSource>>,
    uploader: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

impl Wiring {
    fn release(mut self) {
        if let Some(retry) = self.retry.take() {
            retry.abort();
        }
        if let Some(capture) = self.capture.take() {
            release_capture(capture);
        }
        if let Some(uploader) = self.uploader.take() {
            uploader.abort();
        }
    }
}

/// Disconnect off the runtime threads; stopping a device stream joins its thread
fn release_capture(mut capture: Box<dyn CaptureSource>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(move || capture.disconnect());
        }
        Err(_) => capture.disconnect(),
    }
}

/// Any failure to open the capture stream keeps the session from starting
fn capture_unavailable(error: AudioError) -> AudioError {
    match error {
        AudioError::CaptureUnavailable(_) => error,
        other => AudioError::CaptureUnavailable(other.to_string()),
    }
}

struct SessionInner {
    state: SessionState,
    generation: u64,
    reconnect_attempts: u32,
    model: Option<String>,
    last_error: Option<String>,
    capture: Option<Box<dyn CaptureSource>>,
    uploader: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

impl SessionInner {
    fn take_wiring(&mut self) -> Wiring {
        Wiring {
            capture: self.capture.take(),
            uploader: self.uploader.take(),
            retry: self.retry.take(),
        }
    }
}

pub struct Session {
    config: AppConfig,
    capture_provider: Arc<dyn CaptureProvider>,
    connection: Arc<ConnectionManager>,
    mixer: Arc<PlaybackMixer>,
    router: InboundRouter,
    status_tx: broadcast::Sender<StatusEvent>,
    stats: Arc<UploadStats>,
    inner: Mutex<SessionInner>,
    events_task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Build a session and subscribe it to its connection's events.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: AppConfig,
        transport: Arc<dyn Transport>,
        capture_provider: Arc<dyn CaptureProvider>,
        output: Arc<dyn AudioOutput>,
    ) -> Arc<Self> {
        let (connection, events) = ConnectionManager::new(
            config.backend.url.clone(),
            transport,
            config.backend.connect_timeout(),
        );
        let (status_tx, _) = broadcast::channel(STATUS_CAPACITY);
        let mixer = Arc::new(PlaybackMixer::new(output));

        let session = Arc::new(Self {
            router: InboundRouter::new(mixer.clone(), status_tx.clone()),
            config,
            capture_provider,
            connection,
            mixer,
            status_tx,
            stats: Arc::new(UploadStats::default()),
            inner: Mutex::new(SessionInner {
                state: SessionState::Inactive,
                generation: 0,
                reconnect_attempts: 0,
                model: None,
                last_error: None,
                capture: None,
                uploader: None,
                retry: None,
            }),
            events_task: Mutex::new(None),
        });

        let task = tokio::spawn(Self::event_loop(Arc::downgrade(&session), events));
        *session.events_task.lock() = Some(task);
        session
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.status_tx.subscribe()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn mixer(&self) -> &Arc<PlaybackMixer> {
        &self.mixer
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn status(&self) -> SessionStatus {
        let (state, reconnect_attempts, model, last_error) = {
            let inner = self.inner.lock();
            (inner.state, inner.reconnect_attempts, inner.model.clone(), inner.last_error.clone())
        };
        let playing = self.mixer.playing_stems();
        let stems = self
            .mixer
            .stem_names()
            .into_iter()
            .map(|name| StemStatus {
                volume: self.mixer.volume(&name).unwrap_or(0.0),
                playing: playing.contains(&name),
                name,
            })
            .collect();

        SessionStatus {
            state,
            connection: self.connection.state(),
            model,
            reconnect_attempts,
            upload: self.stats.snapshot(),
            messages_sent: self.connection.messages_sent(),
            stems,
            last_error,
        }
    }

    /// Start separating. Returns immediately when already starting or active.
    pub async fn start(self: &Arc<Self>, request: StartRequest) -> Result<()> {
        let model = request.model_config.unwrap_or_else(|| self.config.model.clone());
        let generation = {
            let mut inner = self.inner.lock();
            match inner.state {
                SessionState::Starting | SessionState::Active => {
                    tracing::debug!("Session already {:?}, ignoring start", inner.state);
                    return Ok(());
                }
                SessionState::Stopping => {
                    return Err(SessionError::StartFailed("session is stopping".into()).into());
                }
                SessionState::Inactive => {}
            }
            inner.state = SessionState::Starting;
            inner.generation += 1;
            inner.reconnect_attempts = 0;
            inner.model = Some(model.model.clone());
            inner.last_error = None;
            inner.generation
        };
        tracing::info!("Starting session with model {}", model.model);
        self.stats.reset();

        if let Err(e) = self.wire(generation, &request.stem_volumes).await {
            self.abort_start(generation, &e);
            return Err(e);
        }

        let connected = async {
            self.connection.ensure_connected().await?;
            self.connection.configure(model).await?;
            Ok::<(), Error>(())
        }
        .await;
        if let Err(e) = connected {
            self.abort_start(generation, &e);
            return Err(e);
        }

        let activated = {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.state != SessionState::Starting {
                return Err(SessionError::StartFailed("session was shut down while starting".into()).into());
            }
            // Checked under the session lock: a loss reported after this
            // point finds the session Active and is retried.
            if self.connection.is_open() {
                inner.state = SessionState::Active;
            }
            inner.state == SessionState::Active
        };
        if !activated {
            let e = Error::from(ConnectionError::Closed("connection lost while starting".into()));
            self.abort_start(generation, &e);
            return Err(e);
        }

        tracing::info!("Session active");
        self.publish(StatusEvent::new(StatusKind::SessionStarted, "Separation started"));
        Ok(())
    }

    /// Acquire capture and build both audio paths
    async fn wire(&self, generation: u64, stem_volumes: &std::collections::HashMap<String, f32>) -> Result<()> {
        let mut capture = self.capture_provider.acquire(&self.config.capture)?;

        self.mixer.setup_channels(self.config.playback.stems.iter().cloned());
        for (stem, volume) in stem_volumes {
            if !self.mixer.set_volume(stem, *volume) {
                tracing::warn!("Ignoring initial volume for unknown stem {}", stem);
            }
        }

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let uploader = tokio::spawn(pipeline::run_uploader(
            self.connection.clone(),
            chunk_rx,
            capture.sample_rate(),
            self.stats.clone(),
        ));
        if capture.channels() != self.config.capture.channels {
            tracing::info!(
                "Capture source has {} channels, uploading {}",
                capture.channels(),
                self.config.capture.channels
            );
        }
        let sink = pipeline::capture_sink(self.config.capture.buffer_size, self.config.capture.channels, chunk_tx);

        // Opening a device stream waits on its thread.
        let connected = tokio::task::spawn_blocking(move || {
            let result = capture.connect(sink);
            (capture, result)
        })
        .await;
        let capture = match connected {
            Ok((capture, Ok(()))) => capture,
            Ok((_, Err(e))) => {
                uploader.abort();
                return Err(capture_unavailable(e).into());
            }
            Err(e) => {
                uploader.abort();
                return Err(AudioError::CaptureUnavailable(e.to_string()).into());
            }
        };

        let stale = {
            let mut inner = self.inner.lock();
            if inner.generation == generation {
                inner.capture = Some(capture);
                inner.uploader = Some(uploader);
                None
            } else {
                Some((capture, uploader))
            }
        };
        if let Some((capture, uploader)) = stale {
            release_capture(capture);
            uploader.abort();
            return Err(SessionError::StartFailed("session was shut down while starting".into()).into());
        }
        Ok(())
    }

    fn abort_start(&self, generation: u64, error: &Error) {
        let wiring = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            inner.state = SessionState::Inactive;
            inner.last_error = Some(error.to_string());
            inner.take_wiring()
        };
        wiring.release();
        self.mixer.teardown();
        self.connection.disconnect();

        tracing::error!("Session start failed: {}", error);
        self.publish(StatusEvent::failure(StatusKind::SessionFailed, error.kind(), error.to_string()));
    }

    /// Stop a running session. Only acts while `Active`.
    pub fn stop(&self) -> bool {
        let wiring = {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Active {
                return false;
            }
            inner.state = SessionState::Stopping;
            inner.generation += 1;
            inner.take_wiring()
        };

        tracing::info!("Stopping session");
        self.shutdown(wiring);
        self.publish(StatusEvent::new(StatusKind::SessionStopped, "Separation stopped"));
        true
    }

    /// Stop because of an unrecoverable error
    fn fail(&self, error: SessionError) {
        let wiring = {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Active {
                return;
            }
            inner.state = SessionState::Stopping;
            inner.generation += 1;
            inner.last_error = Some(error.to_string());
            inner.take_wiring()
        };

        tracing::error!("Session failed: {}", error);
        self.shutdown(wiring);
        self.publish(StatusEvent::failure(StatusKind::SessionFailed, error.kind(), error.to_string()));
    }

    fn shutdown(&self, wiring: Wiring) {
        wiring.release();
        self.mixer.teardown();
        self.connection.disconnect();
        self.inner.lock().state = SessionState::Inactive;
    }

    /// Set one stem's volume. `false` when the stem has no channel.
    pub fn set_volume(&self, stem: &str, level: f32) -> bool {
        self.mixer.set_volume(stem, level)
    }

    fn publish(&self, event: StatusEvent) {
        let _ = self.status_tx.send(event);
    }

    async fn event_loop(session: Weak<Self>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
        while let Some(event) = events.recv().await {
            let Some(session) = session.upgrade() else {
                break;
            };
            session.handle_event(event);
        }
    }

    fn handle_event(self: &Arc<Self>, event: ConnectionEvent) {
        let lost = matches!(event, ConnectionEvent::Disconnected(_) | ConnectionEvent::Failed(_));
        if lost && self.connection.is_open() {
            // Reported by a connection that has since been replaced.
            tracing::debug!("Ignoring stale connection event {:?}", event);
            return;
        }

        match event {
            ConnectionEvent::Opened => {
                self.inner.lock().reconnect_attempts = 0;
                self.publish(StatusEvent::new(StatusKind::Connected, "Connected to backend"));
            }
            ConnectionEvent::Message(text) => {
                if let RouteOutcome::Fatal(error) = self.router.route(&text) {
                    self.fail(SessionError::BackendModel(error));
                }
            }
            ConnectionEvent::Disconnected(reason) => {
                let message = match reason {
                    Some(reason) if !reason.is_empty() => format!("Disconnected from backend: {}", reason),
                    _ => "Disconnected from backend".to_string(),
                };
                self.publish(StatusEvent::new(StatusKind::Disconnected, message));
                self.schedule_reconnect();
            }
            ConnectionEvent::Failed(error) => {
                self.publish(StatusEvent::failure(
                    StatusKind::ConnectionError,
                    ErrorKind::Connection,
                    error.to_string(),
                ));
                self.schedule_reconnect();
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let max = self.config.session.max_reconnect_attempts;
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Active {
            return;
        }

        inner.reconnect_attempts += 1;
        let attempt = inner.reconnect_attempts;
        if attempt > max {
            drop(inner);
            self.fail(SessionError::ReconnectExhausted(max));
            return;
        }

        let delay = self.config.session.reconnect_delay(attempt);
        tracing::info!("Reconnecting in {:?} (attempt {}/{})", delay, attempt, max);

        let generation = inner.generation;
        let session = Arc::downgrade(self);
        if let Some(previous) = inner.retry.take() {
            previous.abort();
        }
        inner.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(session) = session.upgrade() else {
                return;
            };
            {
                let inner = session.inner.lock();
                if inner.generation != generation || inner.state != SessionState::Active {
                    return;
                }
            }
            // Failures come back through the event loop.
            if let Err(e) = session.connection.ensure_connected().await {
                tracing::debug!("Reconnect attempt {} failed: {}", attempt, e);
            }
        }));
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = self.events_task.lock().take() {
            task.abort();
        }
        self.inner.lock().take_wiring().release();
        self.connection.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::testing::{FakeCapture, FakeTransport, RecordingOutput};
    use std::collections::HashMap;
    use std::time::Duration;

    struct Harness {
        session: Arc<Session>,
        transport: Arc<FakeTransport>,
        capture: Arc<FakeCapture>,
        output: Arc<RecordingOutput>,
    }

    fn harness(transport: FakeTransport) -> Harness {
        let mut config = AppConfig::default();
        config.capture.buffer_size = 8;
        let transport = Arc::new(transport);
        let capture = Arc::new(FakeCapture::new());
        let output = Arc::new(RecordingOutput::new(44100));
        let session = Session::new(config, transport.clone(), capture.clone(), output.clone());
        Harness {
            session,
            transport,
            capture,
            output,
        }
    }

    fn request(model: &str) -> StartRequest {
        StartRequest {
            model_config: Some(ModelConfig::named(model)),
            stem_volumes: HashMap::new(),
        }
    }

    async fn wait_for_state(session: &Session, state: SessionState) {
        for _ in 0..1000 {
            if session.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session never reached {:?}", state);
    }

    async fn next_of_kind(rx: &mut broadcast::Receiver<StatusEvent>, kind: StatusKind) -> StatusEvent {
        loop {
            let event = rx.recv().await.unwrap();
            if event.kind == kind {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let h = harness(FakeTransport::new());
        let mut rx = h.session.subscribe();

        h.session.start(request("x")).await.unwrap();
        assert_eq!(h.session.state(), SessionState::Active);
        assert!(h.capture.is_connected());
        next_of_kind(&mut rx, StatusKind::SessionStarted).await;

        h.transport.wait_for_sent(1).await;
        let configure = h.transport.sent_of_type("configure");
        assert_eq!(configure.len(), 1);
        assert_eq!(configure[0]["config"]["model"], "x");

        assert!(h.session.stop());
        assert_eq!(h.session.state(), SessionState::Inactive);
        assert!(h.session.mixer().is_torn_down());
        h.capture.wait_for_release().await;
        next_of_kind(&mut rx, StatusKind::SessionStopped).await;
        h.transport.wait_for_close().await;
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let h = harness(FakeTransport::new());
        h.session.start(request("x")).await.unwrap();
        h.session.start(request("y")).await.unwrap();

        assert_eq!(h.capture.acquired(), 1);
        assert_eq!(h.transport.attempts(), 1);
        assert_eq!(h.session.status().model.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_stop_when_inactive_is_noop() {
        let h = harness(FakeTransport::new());
        let mut rx = h.session.subscribe();
        assert!(!h.session.stop());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_capture_unavailable_fails_start() {
        let h = harness(FakeTransport::new());
        h.capture.set_available(false);
        let mut rx = h.session.subscribe();

        let err = h.session.start(request("x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CaptureUnavailable);
        assert_eq!(h.session.state(), SessionState::Inactive);
        assert_eq!(h.transport.attempts(), 0);

        let event = next_of_kind(&mut rx, StatusKind::SessionFailed).await;
        assert_eq!(event.error_kind, Some(ErrorKind::CaptureUnavailable));
    }

    #[tokio::test]
    async fn test_capture_stream_failure_fails_start() {
        let h = harness(FakeTransport::new());
        h.capture.set_connect_error(Some("sample rate not supported"));
        let mut rx = h.session.subscribe();

        let err = h.session.start(request("x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CaptureUnavailable);
        assert!(err.to_string().contains("sample rate not supported"));
        assert_eq!(h.session.state(), SessionState::Inactive);
        assert_eq!(h.transport.attempts(), 0);

        let event = next_of_kind(&mut rx, StatusKind::SessionFailed).await;
        assert_eq!(event.error_kind, Some(ErrorKind::CaptureUnavailable));
    }

    #[tokio::test]
    async fn test_start_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}

        let h = harness(FakeTransport::new());
        let starting = h.session.start(request("x"));
        assert_send(&starting);
        starting.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_lost_while_starting() {
        let transport = FakeTransport::new();
        transport.set_close_on_open(true);
        let h = harness(transport);

        let started = h.session.start(request("x")).await;
        h.transport.set_close_on_open(false);
        match started {
            Err(e) => {
                assert_eq!(e.kind(), ErrorKind::Connection);
                assert_eq!(h.session.state(), SessionState::Inactive);
                h.capture.wait_for_release().await;
            }
            Ok(()) => {
                // Only possible when the loss came after activation; it must be retried.
                let attempts = h.transport.attempts();
                for _ in 0..100 {
                    if h.transport.attempts() > attempts && h.session.connection().is_open() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                assert!(h.session.connection().is_open());
                assert_eq!(h.session.state(), SessionState::Active);
            }
        }
    }

    #[tokio::test]
    async fn test_loss_of_replaced_connection_is_ignored() {
        let h = harness(FakeTransport::new());
        h.session.start(request("x")).await.unwrap();
        let mut rx = h.session.subscribe();

        // Left over from a connection that is no longer the current one.
        h.session.handle_event(ConnectionEvent::Disconnected(None));
        h.session.handle_event(ConnectionEvent::Failed(ConnectionError::Closed("reset".into())));

        assert_eq!(h.session.status().reconnect_attempts, 0);
        assert!(h.session.inner.lock().retry.is_none());
        assert_eq!(h.session.state(), SessionState::Active);
        while let Ok(event) = rx.try_recv() {
            assert_ne!(event.kind, StatusKind::Disconnected);
            assert_ne!(event.kind, StatusKind::ConnectionError);
        }
    }

    #[tokio::test]
    async fn test_connect_failure_unwinds_start() {
        let transport = FakeTransport::new();
        transport.set_failing(Some("refused"));
        let h = harness(transport);

        let err = h.session.start(request("x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert_eq!(h.session.state(), SessionState::Inactive);
        assert!(h.session.mixer().is_torn_down());
        h.capture.wait_for_release().await;

        // Failures while not active never schedule retries.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.transport.attempts(), 1);
    }

    #[tokio::test]
    async fn test_initial_stem_volumes() {
        let h = harness(FakeTransport::new());
        let mut req = request("x");
        req.stem_volumes.insert("drums".into(), 0.25);
        req.stem_volumes.insert("kazoo".into(), 0.5);

        h.session.start(req).await.unwrap();
        assert_eq!(h.session.mixer().volume("drums"), Some(0.25));
        assert_eq!(h.session.mixer().volume("vocals"), Some(1.0));
    }

    #[tokio::test]
    async fn test_volume_persists_across_buffers() {
        let h = harness(FakeTransport::new());
        h.session.start(request("x")).await.unwrap();

        assert!(h.session.set_volume("vocals", 0.5));
        h.transport.push_inbound(r#"{"type":"separated_audio","stem":"vocals","data":[0.1,0.1]}"#);
        while h.output.started().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.output.started()[0].gain.get(), 0.5);
        assert!(!h.session.set_volume("kazoo", 0.5));
    }

    #[tokio::test]
    async fn test_model_error_stops_session() {
        let h = harness(FakeTransport::new());
        let mut rx = h.session.subscribe();
        h.session.start(request("x")).await.unwrap();

        h.transport.push_inbound(r#"{"type":"error","error":"No model loaded/configured"}"#);
        let event = next_of_kind(&mut rx, StatusKind::SessionFailed).await;
        assert_eq!(event.error_kind, Some(ErrorKind::BackendModel));
        assert!(event.message.contains("No model loaded/configured"));
        assert_eq!(h.session.state(), SessionState::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resets_counter_after_open() {
        let h = harness(FakeTransport::new());
        let mut rx = h.session.subscribe();
        h.session.start(request("x")).await.unwrap();

        h.transport.close_remote(None);
        next_of_kind(&mut rx, StatusKind::Disconnected).await;
        assert_eq!(h.session.status().reconnect_attempts, 1);

        // First retry waits one base delay.
        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(h.transport.attempts(), 1);
        next_of_kind(&mut rx, StatusKind::Connected).await;
        assert_eq!(h.transport.attempts(), 2);
        assert_eq!(h.session.status().reconnect_attempts, 0);
        assert_eq!(h.session.state(), SessionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up() {
        let h = harness(FakeTransport::new());
        let mut rx = h.session.subscribe();
        h.session.start(request("x")).await.unwrap();

        h.transport.set_failing(Some("backend down"));
        h.transport.close_remote(None);

        let event = next_of_kind(&mut rx, StatusKind::SessionFailed).await;
        assert_eq!(event.error_kind, Some(ErrorKind::Connection));
        assert_eq!(h.session.state(), SessionState::Inactive);
        h.capture.wait_for_release().await;
        // One initial connection plus five retries.
        assert_eq!(h.transport.attempts(), 6);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.transport.attempts(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_retry() {
        let h = harness(FakeTransport::new());
        let mut rx = h.session.subscribe();
        h.session.start(request("x")).await.unwrap();

        h.transport.close_remote(None);
        next_of_kind(&mut rx, StatusKind::Disconnected).await;
        assert!(h.session.stop());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.transport.attempts(), 1);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let h = harness(FakeTransport::new());
        h.session.start(request("x")).await.unwrap();
        assert!(h.session.stop());
        wait_for_state(&h.session, SessionState::Inactive).await;

        h.session.start(request("y")).await.unwrap();
        assert_eq!(h.session.state(), SessionState::Active);
        assert!(!h.session.mixer().is_torn_down());
        assert_eq!(h.capture.acquired(), 2);
    }
}
