//! Audio capture sources
//!
//! A capture source delivers planar [`AudioBlock`]s to a single sink. The
//! device-backed source runs the cpal input stream on a dedicated thread, as
//! cpal streams cannot move between threads.

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::AudioBlock;
use crate::audio::device::{open_device, Direction};
use crate::config::CaptureConfig;
use crate::error::AudioError;

/// Receives every block the source produces
pub type BlockSink = Box<dyn FnMut(AudioBlock<'_>) + Send>;

/// Something that can feed audio blocks into the relay
pub trait CaptureSource: Send {
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Start delivering blocks to `sink`, replacing any previous sink
    fn connect(&mut self, sink: BlockSink) -> Result<(), AudioError>;

    /// Stop delivering blocks. Safe to call when not connected.
    fn disconnect(&mut self);
}

/// Acquires a capture source at session start
pub trait CaptureProvider: Send + Sync {
    fn acquire(&self, config: &CaptureConfig) -> Result<Box<dyn CaptureSource>, AudioError>;
}

/// Opens cpal input devices
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceCaptureProvider;

impl CaptureProvider for DeviceCaptureProvider {
    fn acquire(&self, config: &CaptureConfig) -> Result<Box<dyn CaptureSource>, AudioError> {
        Ok(Box::new(DeviceCapture::new(config)?))
    }
}

/// Capture from a cpal input device
pub struct DeviceCapture {
    device_id: Option<String>,
    config: cpal::StreamConfig,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    frames_captured: Arc<AtomicU64>,
}

impl DeviceCapture {
    pub fn new(config: &CaptureConfig) -> Result<Self, AudioError> {
        // Resolve now so a missing device fails the session start.
        let device = open_device(config.device_id.as_deref(), Direction::Input)?;
        let default_config = device
            .default_input_config()
            .map_err(|e| AudioError::CaptureUnavailable(e.to_string()))?;

        if default_config.sample_rate().0 != config.sample_rate {
            tracing::warn!(
                "Input device runs at {}Hz, requesting {}Hz",
                default_config.sample_rate().0,
                config.sample_rate
            );
        }

        Ok(Self {
            device_id: config.device_id.clone(),
            config: cpal::StreamConfig {
                channels: default_config.channels(),
                sample_rate: cpal::SampleRate(config.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            },
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            frames_captured: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured.load(Ordering::Relaxed)
    }
}

impl CaptureSource for DeviceCapture {
    fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    fn channels(&self) -> u16 {
        self.config.channels
    }

    fn connect(&mut self, mut sink: BlockSink) -> Result<(), AudioError> {
        self.disconnect();

        let device = open_device(self.device_id.as_deref(), Direction::Input)?;
        let config = self.config.clone();
        let channels = config.channels as usize;
        let running = self.running.clone();
        let running_for_loop = self.running.clone();
        let frames_captured = self.frames_captured.clone();
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("relay-capture".to_string())
            .spawn(move || {
                let mut planar: Vec<Vec<f32>> = vec![Vec::new(); channels];

                let stream = device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }

                        let frames = data.len() / channels;
                        for (c, plane) in planar.iter_mut().enumerate() {
                            plane.clear();
                            plane.extend(data.iter().skip(c).step_by(channels).take(frames));
                        }
                        frames_captured.fetch_add(frames as u64, Ordering::Relaxed);

                        let slices: Vec<&[f32]> = planar.iter().map(Vec::as_slice).collect();
                        sink(AudioBlock::new(&slices));
                    },
                    |err| tracing::error!("Capture stream error: {}", err),
                    None,
                );

                let stream = match stream.map_err(|e| AudioError::CaptureUnavailable(e.to_string())) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::CaptureUnavailable(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                // Dropping the stream stops capture.
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);

        match ready_rx.recv() {
            Ok(Ok(())) => {
                tracing::info!(
                    "Capture started: {}Hz, {} channels",
                    self.config.sample_rate.0,
                    self.config.channels
                );
                Ok(())
            }
            Ok(Err(e)) => {
                self.disconnect();
                Err(e)
            }
            Err(_) => {
                self.disconnect();
                Err(AudioError::CaptureUnavailable("capture thread exited".to_string()))
            }
        }
    }

    fn disconnect(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::debug!("Capture stopped after {} frames", self.frames_captured());
        }
    }
}

impl Drop for DeviceCapture {
    fn drop(&mut self) {
        self.disconnect();
    }
}
