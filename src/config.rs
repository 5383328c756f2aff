use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Connection configuration
    pub connection: ConnectionConfig,

    /// Video configuration
    pub video: VideoConfig,

    /// Audio configuration
    pub audio: AudioConfig,

    /// Control stream configuration
    pub control: ControlConfig,

    /// Wireless (TCP/IP) configuration
    pub tcpip: TcpipConfig,

    /// Recording configuration
    pub record: RecordConfig,

    /// Whether a video window is shown by the embedding application.
    /// Defeats lazy decode for the video path.
    pub show_window: bool,

    /// Pause decoders while idle; sockets keep draining. Screenshot and
    /// recording calls transiently resume the relevant decoder.
    pub lazy_decode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Local endpoint of the ADB tunnel
    pub host: String,

    /// Base local port for tunnels
    pub port: u16,

    /// Specific device serial (None = auto-select, USB preferred)
    pub device_serial: Option<String>,

    /// Path to the scrcpy-server blob pushed to the device
    pub server_path: PathBuf,

    /// Overall connect timeout
    pub connection_timeout: Duration,

    /// Per-read timeout on handshake socket operations
    pub socket_timeout: Duration,

    /// Skip reverse tunnels and go straight to forward mode.
    /// Reverse tunnels are unreliable on some hosts; the default follows
    /// the platform.
    pub force_forward: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Enable the video stream
    pub enabled: bool,

    /// Video codec requested from the server
    pub codec: VideoCodec,

    /// Encoder bitrate in bits per second
    pub bitrate: u32,

    /// Frame rate cap
    pub max_fps: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
    Av1,
}

impl VideoCodec {
    /// Name used in server parameters
    pub fn server_name(self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "h265",
            VideoCodec::Av1 => "av1",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Enable the audio stream
    pub enabled: bool,

    /// Audio codec requested from the server
    pub codec: AudioCodec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Raw,
    Opus,
    Aac,
    FdkAac,
    Flac,
}

impl AudioCodec {
    /// Name used in server parameters. FDK-AAC is an encoder choice on the
    /// device; on the wire it is plain AAC.
    pub fn server_name(self) -> &'static str {
        match self {
            AudioCodec::Raw => "raw",
            AudioCodec::Opus => "opus",
            AudioCodec::Aac | AudioCodec::FdkAac => "aac",
            AudioCodec::Flac => "flac",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Enable the control stream (input injection, device messages)
    pub enabled: bool,

    /// Keep host and device clipboards in sync in both directions
    pub clipboard_autosync: bool,

    /// Keep the device awake while connected
    pub stay_awake: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpipConfig {
    /// Enable TCP/IP as a parallel path next to USB (seamless wireless)
    pub enabled: bool,

    /// Specific device IP (None = auto-detect via wlan0)
    pub ip: Option<String>,

    /// ADB TCP port on the device
    pub port: u16,

    /// Drop the TCP/IP route on disconnect instead of keeping it for the
    /// next session
    pub auto_disconnect: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordConfig {
    /// When set, audio recording starts at connect and stops at disconnect
    pub file: Option<PathBuf>,

    /// Output container for the session recording
    pub format: RecordFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    Wav,
    Opus,
    Mp3,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig {
                host: "127.0.0.1".to_string(),
                port: 27183,
                device_serial: None,
                server_path: PathBuf::from("scrcpy-server"),
                connection_timeout: Duration::from_secs(10),
                socket_timeout: Duration::from_secs(5),
                force_forward: cfg!(target_os = "windows"),
            },
            video: VideoConfig {
                enabled: true,
                codec: VideoCodec::H264,
                bitrate: 8_000_000,
                max_fps: 60,
            },
            audio: AudioConfig {
                enabled: false,
                codec: AudioCodec::Opus,
            },
            control: ControlConfig {
                enabled: true,
                clipboard_autosync: false,
                stay_awake: false,
            },
            tcpip: TcpipConfig {
                enabled: false,
                ip: None,
                port: 5555,
                auto_disconnect: false,
            },
            record: RecordConfig {
                file: None,
                format: RecordFormat::Wav,
            },
            show_window: false,
            lazy_decode: true,
        }
    }
}

impl SessionConfig {
    /// Lazy decode only takes effect when nothing renders the stream
    pub fn effective_lazy_decode(&self) -> bool {
        self.lazy_decode && !self.show_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_expectations() {
        let config = SessionConfig::default();
        assert_eq!(config.connection.port, 27183);
        assert!(config.video.enabled);
        assert!(config.control.enabled);
        assert_eq!(config.tcpip.port, 5555);
    }

    #[test]
    fn test_fdk_aac_is_aac_on_the_wire() {
        assert_eq!(AudioCodec::FdkAac.server_name(), "aac");
    }

    #[test]
    fn test_show_window_defeats_lazy_decode() {
        let mut config = SessionConfig::default();
        config.lazy_decode = true;
        config.show_window = true;
        assert!(!config.effective_lazy_decode());
        config.show_window = false;
        assert!(config.effective_lazy_decode());
    }
}
