//! In-memory collaborators
//!
//! Stand-ins for the backend transport, the capture device and the audio
//! output. They record what the relay does so behaviour can be checked
//! without sockets or sound hardware.

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::audio::buffer::AudioBlock;
use crate::audio::capture::{BlockSink, CaptureProvider, CaptureSource};
use crate::audio::playback::{AtomicGain, AudioOutput, SourceHandle, StemBuffer};
use crate::config::CaptureConfig;
use crate::error::{AudioError, ConnectionError};
use crate::network::transport::{Connection, Outgoing, Transport, TransportEvent};

#[derive(Default)]
struct TransportShared {
    attempts: AtomicUsize,
    gates: Mutex<Vec<oneshot::Sender<Result<(), String>>>>,
    failing: Mutex<Option<String>>,
    sent: Mutex<Vec<String>>,
    close_requested: AtomicBool,
    close_on_open: AtomicBool,
    inbound: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

/// Transport that records outbound frames and lets the caller inject inbound
/// ones. A gated transport holds every attempt until released.
#[derive(Default)]
pub struct FakeTransport {
    gated: bool,
    shared: Arc<TransportShared>,
}

impl FakeTransport {
    /// Attempts succeed immediately
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts stay pending until [`release_ok`](Self::release_ok) or
    /// [`release_err`](Self::release_err)
    pub fn gated() -> Self {
        Self {
            gated: true,
            ..Self::default()
        }
    }

    /// Make every following attempt fail with `reason` (or succeed again on `None`)
    pub fn set_failing(&self, reason: Option<&str>) {
        *self.shared.failing.lock() = reason.map(str::to_string);
    }

    /// Make every following connection drop as soon as it opens
    pub fn set_close_on_open(&self, close: bool) {
        self.shared.close_on_open.store(close, Ordering::SeqCst);
    }

    pub fn release_ok(&self) {
        for gate in self.shared.gates.lock().drain(..) {
            let _ = gate.send(Ok(()));
        }
    }

    pub fn release_err(&self, reason: &str) {
        for gate in self.shared.gates.lock().drain(..) {
            let _ = gate.send(Err(reason.to_string()));
        }
    }

    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Text frames written on any connection, in order
    pub fn sent(&self) -> Vec<String> {
        self.shared.sent.lock().clone()
    }

    /// Sent frames parsed as JSON whose `type` equals `kind`
    pub fn sent_of_type(&self, kind: &str) -> Vec<serde_json::Value> {
        self.sent()
            .iter()
            .filter_map(|s| serde_json::from_str::<serde_json::Value>(s).ok())
            .filter(|v| v["type"] == kind)
            .collect()
    }

    pub fn close_requested(&self) -> bool {
        self.shared.close_requested.load(Ordering::SeqCst)
    }

    /// Deliver a text frame on the latest connection
    pub fn push_inbound(&self, text: &str) {
        if let Some(tx) = self.shared.inbound.lock().as_ref() {
            let _ = tx.send(TransportEvent::Message(text.to_string()));
        }
    }

    /// Close the latest connection from the backend side
    pub fn close_remote(&self, reason: Option<&str>) {
        if let Some(tx) = self.shared.inbound.lock().take() {
            let _ = tx.send(TransportEvent::Closed(reason.map(str::to_string)));
        }
    }

    /// Fail the latest connection with a transport error
    pub fn fail_remote(&self, error: &str) {
        if let Some(tx) = self.shared.inbound.lock().take() {
            let _ = tx.send(TransportEvent::Error(error.to_string()));
        }
    }

    pub async fn wait_for_attempts(&self, n: usize) {
        while self.attempts() < n {
            tokio::task::yield_now().await;
        }
    }

    pub async fn wait_for_sent(&self, n: usize) {
        while self.shared.sent.lock().len() < n {
            tokio::task::yield_now().await;
        }
    }

    pub async fn wait_for_close(&self) {
        while !self.close_requested() {
            tokio::task::yield_now().await;
        }
    }

    fn open(shared: &Arc<TransportShared>) -> Connection {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outgoing>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<TransportEvent>();
        if shared.close_on_open.load(Ordering::SeqCst) {
            let _ = inbound_tx.send(TransportEvent::Closed(Some("dropped on open".to_string())));
        } else {
            *shared.inbound.lock() = Some(inbound_tx.clone());
        }

        let shared = shared.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                match frame {
                    Outgoing::Text(text) => shared.sent.lock().push(text),
                    Outgoing::Close => {
                        shared.close_requested.store(true, Ordering::SeqCst);
                        let _ = inbound_tx.send(TransportEvent::Closed(None));
                        break;
                    }
                }
            }
        });

        Connection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        }
    }
}

impl Transport for FakeTransport {
    fn connect(&self, _url: &str) -> BoxFuture<'static, Result<Connection, ConnectionError>> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        let shared = self.shared.clone();
        let failing = self.shared.failing.lock().clone();

        let gate = if self.gated {
            let (tx, rx) = oneshot::channel();
            self.shared.gates.lock().push(tx);
            Some(rx)
        } else {
            None
        };

        Box::pin(async move {
            if let Some(gate) = gate {
                match gate.await {
                    Ok(Ok(())) => {}
                    Ok(Err(reason)) => return Err(ConnectionError::OpenFailed(reason)),
                    Err(_) => std::future::pending::<()>().await,
                }
            }
            if let Some(reason) = failing {
                return Err(ConnectionError::OpenFailed(reason));
            }
            Ok(Self::open(&shared))
        })
    }
}

/// Record of one voice started on a [`RecordingOutput`]
#[derive(Debug, Clone)]
pub struct StartedSource {
    pub handle: SourceHandle,
    pub buffer: StemBuffer,
    pub gain: Arc<AtomicGain>,
    /// Ids of earlier sources of the same stem already stopped at start time
    pub stopped_before_start: Vec<u64>,
}

/// Output that records started voices instead of playing them
pub struct RecordingOutput {
    sample_rate: u32,
    next_id: AtomicU64,
    started: Mutex<Vec<StartedSource>>,
}

impl RecordingOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            next_id: AtomicU64::new(0),
            started: Mutex::new(Vec::new()),
        }
    }

    pub fn started(&self) -> Vec<StartedSource> {
        self.started.lock().clone()
    }

    /// Sources of `stem` that are still playing
    pub fn playing(&self, stem: &str) -> usize {
        self.started
            .lock()
            .iter()
            .filter(|s| s.buffer.stem == stem && s.handle.is_playing())
            .count()
    }
}

impl AudioOutput for RecordingOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&self, buffer: StemBuffer, gain: Arc<AtomicGain>) -> SourceHandle {
        let handle = SourceHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut started = self.started.lock();
        let stopped_before_start = started
            .iter()
            .filter(|s| s.buffer.stem == buffer.stem && s.handle.is_stopped())
            .map(|s| s.handle.id())
            .collect();
        started.push(StartedSource {
            handle: handle.clone(),
            buffer,
            gain,
            stopped_before_start,
        });
        handle
    }
}

/// The connected sink, tagged with the id of the source that installed it
type SharedSink = Arc<Mutex<Option<(usize, BlockSink)>>>;

/// Capture source driven by the caller through [`FakeCapture::push`]
pub struct FakeCapture {
    sink: SharedSink,
    available: AtomicBool,
    connect_error: Arc<Mutex<Option<String>>>,
    acquired: AtomicUsize,
}

impl FakeCapture {
    pub fn new() -> Self {
        Self {
            sink: Arc::new(Mutex::new(None)),
            available: AtomicBool::new(true),
            connect_error: Arc::new(Mutex::new(None)),
            acquired: AtomicUsize::new(0),
        }
    }

    /// Make `acquire` fail as if no device existed
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make `connect` fail as if the stream could not be opened
    pub fn set_connect_error(&self, reason: Option<&str>) {
        *self.connect_error.lock() = reason.map(str::to_string);
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.sink.lock().is_some()
    }

    /// Yield until the last connected source has been disconnected
    pub async fn wait_for_release(&self) {
        while self.is_connected() {
            tokio::task::yield_now().await;
        }
    }

    /// Feed planar channel data; ignored while disconnected
    pub fn push(&self, channels: &[&[f32]]) {
        if let Some((_, sink)) = self.sink.lock().as_mut() {
            sink(AudioBlock::new(channels));
        }
    }
}

impl Default for FakeCapture {
    fn default() -> Self {
        Self::new()
    }
}

struct FakeCaptureSource {
    id: usize,
    sink: SharedSink,
    connect_error: Arc<Mutex<Option<String>>>,
    sample_rate: u32,
    channels: u16,
}

impl CaptureSource for FakeCaptureSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn connect(&mut self, sink: BlockSink) -> Result<(), AudioError> {
        if let Some(reason) = self.connect_error.lock().clone() {
            return Err(AudioError::StreamError(reason));
        }
        *self.sink.lock() = Some((self.id, sink));
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut sink = self.sink.lock();
        // A newer source may already own the sink.
        if matches!(sink.as_ref(), Some((id, _)) if *id == self.id) {
            sink.take();
        }
    }
}

impl CaptureProvider for FakeCapture {
    fn acquire(&self, config: &CaptureConfig) -> Result<Box<dyn CaptureSource>, AudioError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(AudioError::CaptureUnavailable("no capture source".to_string()));
        }
        let id = self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeCaptureSource {
            id,
            sink: self.sink.clone(),
            connect_error: self.connect_error.clone(),
            sample_rate: config.sample_rate,
            channels: config.channels,
        }))
    }
}
