//! Audio device enumeration and lookup

use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;

use crate::error::AudioError;

/// Device description for listings and the control surface
#[derive(Debug, Clone, Serialize)]
pub struct AudioDeviceInfo {
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// Which side of the host a device is opened on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    fn prefix(self) -> &'static str {
        match self {
            Direction::Input => "input:",
            Direction::Output => "output:",
        }
    }

    fn unavailable(self, what: String) -> AudioError {
        match self {
            Direction::Input => AudioError::CaptureUnavailable(what),
            Direction::Output => AudioError::OutputUnavailable(what),
        }
    }
}

/// List all available audio devices
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    for (direction, default_name) in [
        (Direction::Input, default_input),
        (Direction::Output, default_output),
    ] {
        let found = match direction {
            Direction::Input => host.input_devices(),
            Direction::Output => host.output_devices(),
        };
        let Ok(found) = found else { continue };

        for device in found {
            let Ok(name) = device.name() else { continue };
            let (sample_rates, channels) = device_capabilities(&device, direction);
            devices.push(AudioDeviceInfo {
                id: format!("{}{}", direction.prefix(), name),
                is_default: default_name.as_deref() == Some(name.as_str()),
                is_input: direction == Direction::Input,
                is_output: direction == Direction::Output,
                name,
                sample_rates,
                channels,
            });
        }
    }

    devices
}

fn device_capabilities(device: &cpal::Device, direction: Direction) -> (Vec<u32>, Vec<u16>) {
    let configs: Vec<cpal::SupportedStreamConfigRange> = match direction {
        Direction::Input => device.supported_input_configs().map(|c| c.collect()),
        Direction::Output => device.supported_output_configs().map(|c| c.collect()),
    }
    .unwrap_or_default();

    let mut rates = Vec::new();
    let mut channels = Vec::new();
    for config in &configs {
        for rate in [44100u32, 48000, 88200, 96000] {
            let sr = cpal::SampleRate(rate);
            if sr >= config.min_sample_rate() && sr <= config.max_sample_rate() && !rates.contains(&rate) {
                rates.push(rate);
            }
        }
        if !channels.contains(&config.channels()) {
            channels.push(config.channels());
        }
    }
    rates.sort_unstable();
    channels.sort_unstable();
    (rates, channels)
}

/// Open a device by id (`input:<name>`, `output:<name>` or a bare name), or
/// the host default when `id` is `None`
pub fn open_device(id: Option<&str>, direction: Direction) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();

    let Some(id) = id else {
        let device = match direction {
            Direction::Input => host.default_input_device(),
            Direction::Output => host.default_output_device(),
        };
        return device.ok_or_else(|| direction.unavailable("no default device".to_string()));
    };

    let name = id.strip_prefix(direction.prefix()).unwrap_or(id);
    let devices = match direction {
        Direction::Input => host.input_devices(),
        Direction::Output => host.output_devices(),
    }
    .map_err(|e| direction.unavailable(e.to_string()))?;

    devices
        .into_iter()
        .find(|d| d.name().map(|n| n == name).unwrap_or(false))
        .ok_or_else(|| direction.unavailable(id.to_string()))
}
