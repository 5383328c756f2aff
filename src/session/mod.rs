/// Session establishment: device selection, tunnel setup, server launch,
/// socket handshake, metadata
pub mod builder;

pub use builder::{Session, SessionBuilder};

use crate::adb::AdbError;
use crate::protocol::VideoCodecId;
use thiserror::Error;

/// Session setup and teardown errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("no usable ADB device found")]
    DeviceNotFound,

    #[error("device unauthorized: {0}; accept the debugging prompt on the device")]
    DeviceUnauthorized(String),

    #[error("connection timed out: {0}")]
    Timeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Adb(#[from] AdbError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Metadata sent by the server on the video socket right after connect:
/// 64 NUL-padded name bytes, then codec id, width and height (u32 BE each)
#[derive(Debug, Clone)]
pub struct SessionMetadata {
    pub device_name: String,
    pub codec_id: VideoCodecId,
    pub device_size: (u32, u32),
}

/// Observable session state. Mutated only by the builder, the shutdown
/// path and the TCP/IP bookkeeping; readers get consistent snapshots via
/// a lock in the client.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub connected: bool,
    pub running: bool,
    pub device_name: String,
    pub device_size: (u32, u32),
    pub codec_id: Option<VideoCodecId>,
    pub device_serial: String,
    pub forward_mode: bool,
    pub tcpip_connected: bool,
    pub tcpip_ip: Option<String>,
    pub tcpip_port: u16,
}
