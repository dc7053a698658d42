//! Capture to backend upload path
//!
//! The capture callback only accumulates and pushes finished chunks onto an
//! unbounded channel; the uploader task drains it and sends each chunk as an
//! `audio_data` frame. Chunks that arrive while the connection is down are
//! counted and dropped.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::audio::buffer::{Chunk, ChunkAccumulator};
use crate::audio::capture::BlockSink;
use crate::network::ConnectionManager;
use crate::protocol::OutboundMessage;

/// Upload counters shared between the uploader task and status reporting
#[derive(Debug, Default)]
pub struct UploadStats {
    chunks_sent: AtomicU64,
    chunks_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UploadSnapshot {
    pub chunks_sent: u64,
    pub chunks_dropped: u64,
}

impl UploadStats {
    pub fn snapshot(&self) -> UploadSnapshot {
        UploadSnapshot {
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.chunks_sent.store(0, Ordering::Relaxed);
        self.chunks_dropped.store(0, Ordering::Relaxed);
    }
}

/// Build the block sink handed to a capture source.
///
/// Owns its accumulator, so a new sink always starts with an empty buffer.
pub fn capture_sink(buffer_size: usize, channels: u16, chunks: mpsc::UnboundedSender<Chunk>) -> BlockSink {
    let mut accumulator = ChunkAccumulator::new(buffer_size, channels);
    Box::new(move |block| {
        accumulator.ingest_with(Some(&block), |chunk| {
            // Receiver gone means the session is shutting down.
            let _ = chunks.send(chunk);
        });
    })
}

/// Drain chunks into the connection until the channel closes
pub async fn run_uploader(
    connection: Arc<ConnectionManager>,
    mut chunks: mpsc::UnboundedReceiver<Chunk>,
    sample_rate: u32,
    stats: Arc<UploadStats>,
) {
    tracing::debug!("Uploader started at {} Hz", sample_rate);

    while let Some(chunk) = chunks.recv().await {
        let message = OutboundMessage::audio_data(chunk.samples, sample_rate, chunk.channels);
        if connection.send(&message) {
            stats.chunks_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            let dropped = stats.chunks_dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % 100 == 1 {
                tracing::warn!("Connection not open, dropped {} chunks so far", dropped);
            }
        }
    }

    tracing::debug!("Uploader stopped");
}
