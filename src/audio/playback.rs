//! Stem playback output
//!
//! The output owns a set of voices. Each voice plays one decoded stem buffer
//! once through a shared gain, and can be stopped at any time from outside
//! the audio thread. The device-backed output mixes all live voices into a
//! cpal output stream.

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::bounded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::{open_device, Direction};
use crate::error::AudioError;

/// Lock-free gain value shared between control code and the audio thread
#[derive(Debug)]
pub struct AtomicGain {
    bits: AtomicU32,
}

impl AtomicGain {
    pub fn new(value: f32) -> Self {
        Self {
            bits: AtomicU32::new(value.to_bits()),
        }
    }

    #[inline]
    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set(&self, value: f32) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }
}

impl Default for AtomicGain {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// A decoded stem ready to be played once
#[derive(Debug, Clone)]
pub struct StemBuffer {
    pub stem: String,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl StemBuffer {
    pub fn new(stem: impl Into<String>, samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            stem: stem.into(),
            samples,
            sample_rate,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate.max(1) as f64)
    }
}

#[derive(Debug, Default)]
struct VoiceState {
    stopped: AtomicBool,
    finished: AtomicBool,
}

/// Handle to a started voice
#[derive(Debug, Clone)]
pub struct SourceHandle {
    id: u64,
    state: Arc<VoiceState>,
}

impl SourceHandle {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            state: Arc::new(VoiceState::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop playback. Idempotent.
    pub fn stop(&self) {
        self.state.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.state.stopped.load(Ordering::Acquire)
    }

    /// Mark the voice as played out
    pub fn finish(&self) {
        self.state.finished.store(true, Ordering::Release);
    }

    pub fn is_playing(&self) -> bool {
        !self.is_stopped() && !self.state.finished.load(Ordering::Acquire)
    }
}

/// Sink that plays stem buffers through caller-owned gains
pub trait AudioOutput: Send + Sync {
    fn sample_rate(&self) -> u32;

    /// Start `buffer` immediately through `gain`
    fn start(&self, buffer: StemBuffer, gain: Arc<AtomicGain>) -> SourceHandle;
}

struct Voice {
    handle: SourceHandle,
    samples: Vec<f32>,
    position: usize,
    gain: Arc<AtomicGain>,
}

type VoiceList = Arc<Mutex<Vec<Voice>>>;

/// Mixes voices into a cpal output device
pub struct DeviceOutput {
    voices: VoiceList,
    sample_rate: u32,
    next_id: AtomicU64,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl DeviceOutput {
    /// Open the output device (default when `device_id` is `None`) at `sample_rate`
    pub fn open(device_id: Option<&str>, sample_rate: u32) -> Result<Self, AudioError> {
        let device = open_device(device_id, Direction::Output)?;
        let default_config = device
            .default_output_config()
            .map_err(|e| AudioError::OutputUnavailable(e.to_string()))?;
        let sample_format = default_config.sample_format();
        let config = cpal::StreamConfig {
            channels: default_config.channels(),
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let voices: VoiceList = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let voices_cb = voices.clone();
        let running_for_loop = running.clone();
        let thread_handle = thread::Builder::new()
            .name("relay-playback".to_string())
            .spawn(move || {
                let stream = match build_output_stream(&device, &config, sample_format, voices_cb) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        let mut output = Self {
            voices,
            sample_rate,
            next_id: AtomicU64::new(0),
            running,
            thread_handle: Some(thread_handle),
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {
                tracing::info!("Playback output open at {}Hz", sample_rate);
                Ok(output)
            }
            Ok(Err(e)) => {
                output.close();
                Err(e)
            }
            Err(_) => {
                output.close();
                Err(AudioError::StreamError("playback thread exited".to_string()))
            }
        }
    }

    /// Voices currently mixed
    pub fn active_voices(&self) -> usize {
        self.voices.lock().len()
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        for voice in self.voices.lock().drain(..) {
            voice.handle.stop();
        }
    }
}

impl AudioOutput for DeviceOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&self, buffer: StemBuffer, gain: Arc<AtomicGain>) -> SourceHandle {
        let handle = SourceHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.voices.lock().push(Voice {
            handle: handle.clone(),
            samples: buffer.samples,
            position: 0,
            gain,
        });
        handle
    }
}

impl Drop for DeviceOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    voices: VoiceList,
) -> Result<cpal::Stream, AudioError> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, voices),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, voices),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, voices),
        other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    voices: VoiceList,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels = config.channels as usize;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut voices = voices.lock();
                for frame in data.chunks_mut(channels) {
                    let value = mix_frame(&mut voices);
                    let sample = <T as cpal::Sample>::from_sample::<f32>(value);
                    frame.fill(sample);
                }
                voices.retain(|v| v.handle.is_playing());
            },
            |err| tracing::error!("Playback stream error: {}", err),
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))
}

/// Sum one mono frame across live voices, advancing each
fn mix_frame(voices: &mut [Voice]) -> f32 {
    let mut sum = 0.0;
    for voice in voices.iter_mut() {
        if voice.handle.is_stopped() {
            continue;
        }
        match voice.samples.get(voice.position) {
            Some(sample) => {
                sum += sample * voice.gain.get();
                voice.position += 1;
            }
            None => voice.handle.finish(),
        }
    }
    sum.clamp(-1.0, 1.0)
}
