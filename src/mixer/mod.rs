//! Per-stem playback mixing
//!
//! Each stem owns a persistent gain and at most one playing source. A new
//! buffer for a stem stops the previous source before the new one starts, so
//! two buffers of the same stem never overlap.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::audio::playback::{AtomicGain, AudioOutput, SourceHandle, StemBuffer};

/// Stem that receives backend names no channel is set up for
pub const FALLBACK_STEM: &str = "other";

/// Backend stem names routed to [`FALLBACK_STEM`] when they have no channel
const FALLBACK_ALIASES: &[&str] = &["instrumental", "accompaniment", "no_vocals"];

/// Persistent gain plus the currently playing source of one stem
pub struct StemChannel {
    gain: Arc<AtomicGain>,
    source: Option<SourceHandle>,
}

impl StemChannel {
    fn new() -> Self {
        Self {
            gain: Arc::new(AtomicGain::default()),
            source: None,
        }
    }

    pub fn volume(&self) -> f32 {
        self.gain.get()
    }

    pub fn is_playing(&self) -> bool {
        self.source.as_ref().is_some_and(SourceHandle::is_playing)
    }

    fn stop(&mut self) {
        if let Some(source) = self.source.take() {
            source.stop();
        }
    }
}

#[derive(Default)]
struct MixerInner {
    channels: HashMap<String, StemChannel>,
    torn_down: bool,
}

/// Owns every stem channel of a session
pub struct PlaybackMixer {
    output: Arc<dyn AudioOutput>,
    inner: Mutex<MixerInner>,
}

impl PlaybackMixer {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self {
            output,
            inner: Mutex::new(MixerInner::default()),
        }
    }

    /// Create a channel for every name that does not have one yet
    pub fn setup_channels<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inner = self.inner.lock();
        inner.torn_down = false;
        for name in names {
            inner.channels.entry(name.into()).or_insert_with(StemChannel::new);
        }
        tracing::debug!("Stem channels ready: {}", inner.channels.len());
    }

    /// Play a freshly received stem buffer.
    ///
    /// Returns the stem the buffer was played on, or `None` when it was dropped.
    pub fn ingest_stem(&self, name: &str, samples: Vec<f32>) -> Option<String> {
        if samples.is_empty() {
            tracing::debug!("Ignoring empty buffer for stem {}", name);
            return None;
        }

        let mut inner = self.inner.lock();
        if inner.torn_down {
            return None;
        }

        let Some(target) = resolve_stem(&inner.channels, name) else {
            tracing::warn!("No channel for stem '{}', dropping buffer", name);
            return None;
        };

        let buffer = StemBuffer::new(target.clone(), samples, self.output.sample_rate());
        let channel = inner.channels.get_mut(&target)?;

        // Stop before start: one live source per stem.
        channel.stop();
        let source = self.output.start(buffer, channel.gain.clone());
        tracing::trace!("Stem {} playing on source {}", target, source.id());
        channel.source = Some(source);

        Some(target)
    }

    /// Set a stem's gain, clamped to [0, 1]. Effective immediately.
    ///
    /// Returns `false` when the stem has no channel or the mixer is torn down.
    pub fn set_volume(&self, name: &str, level: f32) -> bool {
        if !level.is_finite() {
            tracing::warn!("Rejecting non-finite volume for {}", name);
            return false;
        }

        let inner = self.inner.lock();
        if inner.torn_down {
            return false;
        }
        match inner.channels.get(name) {
            Some(channel) => {
                channel.gain.set(level.clamp(0.0, 1.0));
                true
            }
            None => false,
        }
    }

    /// Current gain of a stem
    pub fn volume(&self, name: &str) -> Option<f32> {
        self.inner.lock().channels.get(name).map(StemChannel::volume)
    }

    /// Stop every source and release all channels. Idempotent.
    pub fn teardown(&self) {
        let mut inner = self.inner.lock();
        for channel in inner.channels.values_mut() {
            channel.stop();
        }
        inner.channels.clear();
        if !inner.torn_down {
            tracing::debug!("Playback mixer torn down");
        }
        inner.torn_down = true;
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.lock().torn_down
    }

    /// Stems that currently have a playing source
    pub fn playing_stems(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut stems: Vec<String> = inner
            .channels
            .iter()
            .filter(|(_, c)| c.is_playing())
            .map(|(name, _)| name.clone())
            .collect();
        stems.sort();
        stems
    }

    pub fn stem_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().channels.keys().cloned().collect();
        names.sort();
        names
    }
}

fn resolve_stem(channels: &HashMap<String, StemChannel>, name: &str) -> Option<String> {
    if channels.contains_key(name) {
        return Some(name.to_string());
    }
    if FALLBACK_ALIASES.contains(&name) && channels.contains_key(FALLBACK_STEM) {
        return Some(FALLBACK_STEM.to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingOutput;

    fn mixer() -> (PlaybackMixer, Arc<RecordingOutput>) {
        let output = Arc::new(RecordingOutput::new(44100));
        let mixer = PlaybackMixer::new(output.clone());
        mixer.setup_channels(["vocals", "drums", "bass", "other"]);
        (mixer, output)
    }

    #[test]
    fn test_replacement_never_overlaps() {
        let (mixer, output) = mixer();

        mixer.ingest_stem("vocals", vec![0.1; 8]);
        mixer.ingest_stem("vocals", vec![0.2; 8]);

        let started = output.started();
        assert_eq!(started.len(), 2);
        assert!(!started[0].handle.is_playing());
        assert!(started[1].handle.is_playing());
        assert_eq!(output.playing("vocals"), 1);
        // The first source was already stopped when the second started.
        assert!(started[1].stopped_before_start.iter().any(|id| *id == started[0].handle.id()));
    }

    #[test]
    fn test_stems_are_independent() {
        let (mixer, output) = mixer();
        mixer.ingest_stem("vocals", vec![0.1; 8]);
        mixer.ingest_stem("drums", vec![0.1; 8]);
        assert_eq!(output.playing("vocals"), 1);
        assert_eq!(output.playing("drums"), 1);
        assert_eq!(mixer.playing_stems(), vec!["drums", "vocals"]);
    }

    #[test]
    fn test_fallback_mapping() {
        let (mixer, output) = mixer();
        assert_eq!(mixer.ingest_stem("instrumental", vec![0.1; 4]).as_deref(), Some("other"));
        assert_eq!(output.playing("other"), 1);

        assert_eq!(mixer.ingest_stem("piano", vec![0.1; 4]), None);
        assert_eq!(output.started().len(), 1);
    }

    #[test]
    fn test_buffers_decoded_at_output_rate() {
        let (mixer, output) = mixer();
        mixer.ingest_stem("bass", vec![0.0; 16]);
        assert_eq!(output.started()[0].buffer.sample_rate, 44100);
        assert_eq!(output.started()[0].buffer.samples.len(), 16);
    }

    #[test]
    fn test_volume_applies_to_live_gain() {
        let (mixer, output) = mixer();
        mixer.ingest_stem("vocals", vec![0.1; 8]);

        assert!(mixer.set_volume("vocals", 0.5));
        assert_eq!(output.started()[0].gain.get(), 0.5);

        // Persistent gain carries into the next buffer without re-setting.
        mixer.ingest_stem("vocals", vec![0.1; 8]);
        assert_eq!(output.started()[1].gain.get(), 0.5);
    }

    #[test]
    fn test_volume_clamped_and_missing_channel() {
        let (mixer, _) = mixer();
        assert!(mixer.set_volume("drums", 3.0));
        assert_eq!(mixer.volume("drums"), Some(1.0));
        assert!(mixer.set_volume("drums", -1.0));
        assert_eq!(mixer.volume("drums"), Some(0.0));
        assert!(!mixer.set_volume("drums", f32::NAN));
        assert!(!mixer.set_volume("kazoo", 0.5));
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let (mixer, output) = mixer();
        mixer.ingest_stem("vocals", vec![0.1; 8]);
        mixer.ingest_stem("bass", vec![0.1; 8]);

        mixer.teardown();
        mixer.teardown();

        assert!(mixer.is_torn_down());
        assert_eq!(output.playing("vocals"), 0);
        assert_eq!(output.playing("bass"), 0);
        assert!(!mixer.set_volume("vocals", 0.5));
        assert_eq!(mixer.ingest_stem("vocals", vec![0.1; 8]), None);
    }

    #[test]
    fn test_setup_after_teardown() {
        let (mixer, _) = mixer();
        mixer.teardown();
        mixer.setup_channels(["vocals"]);
        assert!(!mixer.is_torn_down());
        assert_eq!(mixer.stem_names(), vec!["vocals"]);
        assert_eq!(mixer.volume("vocals"), Some(1.0));
    }
}
