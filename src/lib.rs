//! # Stem Relay
//!
//! Streams captured audio to a source separation backend and plays the
//! separated stems back as they arrive.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               RELAY CLIENT                                │
//! │                                                                          │
//! │  ┌──────────────┐   ┌────────────────────┐   ┌────────────────────────┐  │
//! │  │ Capture      │──▶│ Chunk Accumulator  │──▶│ Uploader task          │  │
//! │  │ (cpal thread)│   │ (audio::buffer)    │   │ (session::pipeline)    │  │
//! │  └──────────────┘   └────────────────────┘   └───────────┬────────────┘  │
//! │                                                          │ audio_data    │
//! │                                                          ▼               │
//! │  ┌───────────────────────────────────────────────────────────────────┐  │
//! │  │         Connection Manager (network::connection) - one socket      │  │
//! │  │         shared attempts, generation-tagged, pending configure      │  │
//! │  └───────────────────────────────────────────────────────────────────┘  │
//! │                              │ separated_audio / status / error          │
//! │                              ▼                                           │
//! │  ┌────────────────────┐   ┌──────────────────────────────────────────┐  │
//! │  │ Inbound Router     │──▶│ Playback Mixer (mixer)                    │  │
//! │  │ (network::router)  │   │  vocals   drums   bass   other            │  │
//! │  └─────────┬──────────┘   │  [gain]   [gain]  [gain] [gain]           │  │
//! │            │              └────────────────────┬─────────────────────┘  │
//! │            ▼                                   ▼                        │
//! │  ┌────────────────────┐           ┌──────────────────────────┐          │
//! │  │ Session (session)  │           │ Output (cpal thread)     │          │
//! │  │ start/stop/retry   │           └──────────────────────────┘          │
//! │  └─────────┬──────────┘                                                 │
//! │            │ status events                                              │
//! │            ▼                                                            │
//! │  ┌────────────────────────────────────────────┐                         │
//! │  │ Control surface (ui) - HTTP API + /ws      │                         │
//! │  └────────────────────────────────────────────┘                         │
//! └──────────────────────────────────────────────────────────────────────────┘
//!                                │ WebSocket (JSON text frames)
//!                                ▼
//!                      SEPARATION BACKEND
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod mixer;
pub mod network;
pub mod protocol;
pub mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod ui;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Backend WebSocket endpoint
    pub const DEFAULT_BACKEND_URL: &str = "ws://localhost:8765";

    /// Backend HTTP side serving `/health`
    pub const DEFAULT_HEALTH_URL: &str = "http://localhost:8766";

    /// Time allowed for one connection attempt
    pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

    /// Default capture sample rate
    pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Frames per uploaded chunk
    pub const DEFAULT_BUFFER_SIZE: usize = 4096;

    /// Stems the backend produces
    pub const DEFAULT_STEMS: [&str; 4] = ["vocals", "drums", "bass", "other"];

    /// Reconnect attempts before an active session gives up
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

    /// Retry `n` waits `n` times this long
    pub const RECONNECT_BASE_DELAY_MS: u64 = 2000;

    /// Separation model requested when none is given
    pub const DEFAULT_MODEL: &str = "hdemucs_mmi";

    /// Control surface HTTP port
    pub const DEFAULT_UI_PORT: u16 = 8080;
}
