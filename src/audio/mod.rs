//! Audio subsystem module
//!
//! Leaf-first: the lock-free sample ring, the adaptive controller that owns
//! it, the real-time render callback, and the cpal output it runs on.

pub mod controller;
pub mod device;
pub mod playback;
pub mod render;
pub mod ring;

pub use controller::{create_adaptive_buffer, BufferPhase, BufferReader, BufferWriter, StatusReport};
pub use device::{list_output_devices, AudioDevice, OutputDeviceInfo};
pub use playback::{AudioPlayback, AudioSink, SinkFactory};
pub use render::RenderCallback;
