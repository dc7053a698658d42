//! Application configuration
//!
//! Loaded from a TOML file. Every section has defaults, so an empty or
//! missing file yields a working setup against a local backend.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    pub session: SessionConfig,
    pub model: ModelConfig,
    pub ui: UiConfig,
}

/// Separation backend endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// WebSocket endpoint carrying audio and stems
    pub url: String,
    /// Base URL of the HTTP side serving `/health`
    pub health_url: String,
    /// Bound on a single connection attempt, and on joining one in flight
    pub connect_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_BACKEND_URL.to_string(),
            health_url: DEFAULT_HEALTH_URL.to_string(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl BackendConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Capture side settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Input device id; the default input device when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per channel in one outbound chunk
    pub buffer_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Playback side settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Output device id; the default output device when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Stems that get a channel at session start
    pub stems: Vec<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            stems: DEFAULT_STEMS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Reconnect policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_reconnect_attempts: u32,
    /// Retry `n` waits `n * reconnect_base_delay_ms`
    pub reconnect_base_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay_ms: RECONNECT_BASE_DELAY_MS,
        }
    }
}

impl SessionConfig {
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms * u64::from(attempt))
    }
}

/// Model parameters sent to the backend in the `configure` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    #[serde(rename = "realTime", default = "default_real_time")]
    pub real_time: bool,
    /// Backend specific keys (e.g. `aggressiveness`) passed through untouched
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_real_time() -> bool {
    true
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::named(DEFAULT_MODEL)
    }
}

impl ModelConfig {
    pub fn named(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            real_time: true,
            extra: BTreeMap::new(),
        }
    }
}

/// Control surface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            http_port: DEFAULT_UI_PORT,
        }
    }
}

impl AppConfig {
    /// Default config file location for this platform
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "stem-relay")
            .map(|dirs| dirs.config_dir().join("relay.toml"))
    }

    /// Load from `path`, or from the platform default when `None`.
    ///
    /// A missing file is not an error; defaults are returned instead.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(p) => p,
            None => return Ok(Self::default()),
        };

        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Write to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.capture.buffer_size == 0 {
            return Err(Error::Config("capture.buffer_size must be non-zero".into()));
        }
        if self.capture.channels == 0 {
            return Err(Error::Config("capture.channels must be non-zero".into()));
        }
        if self.capture.sample_rate == 0 {
            return Err(Error::Config("capture.sample_rate must be non-zero".into()));
        }
        if self.playback.stems.is_empty() {
            return Err(Error::Config("playback.stems must name at least one stem".into()));
        }
        Ok(())
    }
}
