//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod playback;

pub use buffer::{AudioBlock, Chunk, ChunkAccumulator};
pub use capture::{BlockSink, CaptureProvider, CaptureSource, DeviceCaptureProvider};
pub use device::{list_devices, AudioDeviceInfo};
pub use playback::{AtomicGain, AudioOutput, DeviceOutput, SourceHandle, StemBuffer};
