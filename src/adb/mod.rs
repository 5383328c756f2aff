/// ADB driver: device discovery, server deployment, tunnels, TCP/IP mode
pub mod driver;
pub mod executor;

pub use driver::AdbDriver;
pub use executor::AdbExecutor;

use thiserror::Error;

/// ADB errors
#[derive(Error, Debug)]
pub enum AdbError {
    #[error(
        "adb executable not found; install Android platform-tools or set the ADB environment variable"
    )]
    ExecutableNotFound,

    #[error("adb command failed: {cmd} (exit code {code}): {stderr}")]
    CommandFailed {
        cmd: String,
        code: i32,
        stderr: String,
    },

    #[error("adb command timed out after {seconds}s: {cmd}")]
    Timeout { cmd: String, seconds: u64 },

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device unauthorized: {0}; accept the debugging prompt on the device")]
    DeviceUnauthorized(String),

    #[error("failed to parse adb output: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AdbError>;

/// How a device is attached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Usb,
    Tcpip,
    Emulator,
}

impl DeviceKind {
    /// Derived from the serial shape: `ip:port` means TCP/IP, an
    /// `emulator-` prefix means emulator, anything else is USB.
    pub fn from_serial(serial: &str) -> Self {
        if serial.starts_with("emulator-") {
            DeviceKind::Emulator
        } else if serial.contains(':') {
            DeviceKind::Tcpip
        } else {
            DeviceKind::Usb
        }
    }
}

/// Connection state as reported by `adb devices`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceState {
    Device,
    Offline,
    Unauthorized,
    Unknown(String),
}

impl From<&str> for DeviceState {
    fn from(s: &str) -> Self {
        match s.trim() {
            "device" => DeviceState::Device,
            "offline" => DeviceState::Offline,
            "unauthorized" => DeviceState::Unauthorized,
            other => DeviceState::Unknown(other.to_string()),
        }
    }
}

/// One entry of `adb devices -l`
#[derive(Debug, Clone)]
pub struct Device {
    pub serial: String,
    pub state: DeviceState,
    pub kind: DeviceKind,
    pub model: Option<String>,
}

impl Device {
    pub fn is_ready(&self) -> bool {
        self.state == DeviceState::Device
    }
}

/// An established ADB tunnel
#[derive(Debug, Clone)]
pub struct Tunnel {
    pub enabled: bool,
    /// true = `adb forward` (client connects in), false = `adb reverse`
    pub forward: bool,
    pub local_port: u16,
    pub socket_name: String,
}

/// Installed application, from the server's app listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub name: String,
    pub package: String,
    pub system: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_kind_from_serial() {
        assert_eq!(DeviceKind::from_serial("R5CT102ABCD"), DeviceKind::Usb);
        assert_eq!(
            DeviceKind::from_serial("192.168.1.23:5555"),
            DeviceKind::Tcpip
        );
        assert_eq!(DeviceKind::from_serial("emulator-5554"), DeviceKind::Emulator);
    }

    #[test]
    fn test_device_state_parsing() {
        assert_eq!(DeviceState::from("device"), DeviceState::Device);
        assert_eq!(DeviceState::from("unauthorized"), DeviceState::Unauthorized);
        assert!(matches!(
            DeviceState::from("recovery"),
            DeviceState::Unknown(_)
        ));
    }
}
