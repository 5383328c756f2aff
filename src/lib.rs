/// Headless scrcpy client library
///
/// Establishes mirroring sessions against the on-device scrcpy server via
/// ADB (forward and reverse tunnels), demuxes the video/audio/control
/// streams, decodes into RGB24 frames and f32 PCM, and injects input.
/// Rendering and playback consumers sit on top of the delay buffer and
/// audio sink interfaces.
pub mod adb;
pub mod audio;
pub mod client;
pub mod config;
pub mod control;
pub mod demux;
pub mod protocol;
pub mod session;
pub mod video;

pub use client::{ClientError, ScrcpyClient};
pub use config::SessionConfig;

/// Result type for the application
pub type Result<T> = anyhow::Result<T>;
