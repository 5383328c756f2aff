use super::{Result, SessionError, SessionMetadata};
use crate::adb::driver::{CLIENT_VERSION, DEFAULT_PORT_RANGE};
use crate::adb::{AdbDriver, Device, DeviceKind, Tunnel};
use crate::config::SessionConfig;
use crate::demux::recv_exact;
use crate::protocol::{DEVICE_NAME_FIELD_LENGTH, VideoCodecId};
use rand::Rng;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Child;
use tracing::{debug, info, warn};

/// Forward-mode connect retry schedule (the server needs a moment to
/// reach accept())
const CONNECT_RETRIES: u32 = 100;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// TCP/IP state recorded during setup
#[derive(Debug, Clone, Default)]
pub struct TcpipState {
    pub connected: bool,
    pub ip: Option<String>,
    pub port: u16,
}

/// An established session: connected sockets in video/audio/control order
/// plus everything needed for teardown.
pub struct Session {
    pub metadata: SessionMetadata,
    pub video_socket: TcpStream,
    pub audio_socket: Option<TcpStream>,
    pub control_socket: Option<TcpStream>,
    pub tunnel: Tunnel,
    pub serial: String,
    pub scid: u32,
    pub server_process: Option<Child>,
    pub tcpip: TcpipState,
}

impl Session {
    pub fn forward_mode(&self) -> bool {
        self.tunnel.forward
    }

    /// Remove tunnels and kill the server process. Sockets close when
    /// their owners drop them.
    pub async fn teardown(serial: &str, tunnel: &Tunnel, server_process: &mut Option<Child>, adb: &AdbDriver) {
        if let Some(child) = server_process.as_mut() {
            if let Err(e) = child.start_kill() {
                debug!("Server process already gone: {}", e);
            }
        }

        if let Err(e) = adb.remove_tunnel(serial, tunnel).await {
            debug!("Tunnel removal failed: {}", e);
        }
        if !tunnel.forward {
            for suffix in ["_audio", "_control"] {
                let name = format!("{}{}", tunnel.socket_name, suffix);
                if let Err(e) = adb.remove_reverse(serial, &name).await {
                    debug!("Reverse entry removal failed ({}): {}", name, e);
                }
            }
        }
    }
}

/// Establishes sessions following the scrcpy connection sequence. Any
/// failure along the way tears down everything already set up.
pub struct SessionBuilder<'a> {
    config: &'a SessionConfig,
    adb: &'a AdbDriver,
}

/// Reverse-mode listeners, bound before the server starts
struct ReverseListeners {
    video: TcpListener,
    audio: Option<TcpListener>,
    control: Option<TcpListener>,
}

/// Resources acquired so far, released on failure
#[derive(Default)]
struct Partial {
    serial: Option<String>,
    tunnel: Option<Tunnel>,
    server_process: Option<Child>,
    video_socket: Option<TcpStream>,
    audio_socket: Option<TcpStream>,
    control_socket: Option<TcpStream>,
    tcpip: TcpipState,
}

impl<'a> SessionBuilder<'a> {
    pub fn new(config: &'a SessionConfig, adb: &'a AdbDriver) -> Self {
        Self { config, adb }
    }

    pub async fn connect(self) -> Result<Session> {
        let mut partial = Partial::default();

        match self.establish(&mut partial).await {
            Ok(session) => Ok(session),
            Err(e) => {
                warn!("Session setup failed, cleaning up: {}", e);
                self.cleanup(&mut partial).await;
                Err(e)
            }
        }
    }

    async fn cleanup(&self, partial: &mut Partial) {
        // Sockets close on drop
        partial.video_socket.take();
        partial.audio_socket.take();
        partial.control_socket.take();

        if let (Some(serial), Some(tunnel)) = (partial.serial.as_deref(), partial.tunnel.as_ref()) {
            Session::teardown(serial, tunnel, &mut partial.server_process, self.adb).await;
        } else if let Some(child) = partial.server_process.as_mut() {
            let _ = child.start_kill();
        }
    }

    async fn establish(&self, partial: &mut Partial) -> Result<Session> {
        // 1. Device selection, with optional parallel TCP/IP enablement
        let device = self.select_device().await?;
        let serial = self.setup_tcpip(&device, &mut partial.tcpip).await;
        info!("Using device {} for all operations", serial);
        partial.serial = Some(serial.clone());

        // 2. Push the server blob
        self.adb
            .push_server(&serial, &self.config.connection.server_path)
            .await?;

        // 3. SCID and abstract socket name
        let scid: u32 = rand::thread_rng().gen_range(0..0x8000_0000u32);
        let socket_name = format!("scrcpy_{:08x}", scid);
        debug!("SCID: {:08x}", scid);

        // 4. Tunnel; reverse preferred unless the host is known to be
        // unreliable for it
        let tunnel = self
            .adb
            .create_tunnel(
                &serial,
                &socket_name,
                DEFAULT_PORT_RANGE,
                self.config.connection.force_forward,
            )
            .await?;
        let forward = tunnel.forward;
        partial.tunnel = Some(tunnel.clone());

        // 5 + 6. Server start and socket establishment, strictly
        // video -> audio -> control. In reverse mode the listeners and
        // per-stream reverse entries must exist before the server starts:
        // it dials out as soon as it is up.
        let params = build_server_params(self.config, scid, forward);
        info!("Starting server: {}", params);

        if forward {
            partial.server_process = self
                .adb
                .start_server(&serial, CLIENT_VERSION, &params, true)
                .await?;
            self.connect_forward(&tunnel, partial).await?;
        } else {
            let listeners = self.prepare_reverse(&serial, &tunnel).await?;
            partial.server_process = self
                .adb
                .start_server(&serial, CLIENT_VERSION, &params, true)
                .await?;
            self.accept_reverse(listeners, partial).await?;
        }

        // 7. Metadata (exact reads, bounded by the socket timeout)
        let metadata = self
            .read_metadata(partial.video_socket.as_mut().unwrap())
            .await?;
        info!(
            "Connected to {} ({}x{}, {:?})",
            metadata.device_name,
            metadata.device_size.0,
            metadata.device_size.1,
            metadata.codec_id
        );

        Ok(Session {
            metadata,
            video_socket: partial.video_socket.take().unwrap(),
            audio_socket: partial.audio_socket.take(),
            control_socket: partial.control_socket.take(),
            tunnel,
            serial,
            scid,
            server_process: partial.server_process.take(),
            tcpip: partial.tcpip.clone(),
        })
    }

    /// Prefer the configured serial, then USB, then an existing TCP/IP
    /// device.
    async fn select_device(&self) -> Result<Device> {
        let devices = self.adb.list_devices().await?;
        info!("ADB found {} device(s)", devices.len());

        if let Some(wanted) = &self.config.connection.device_serial {
            let device = devices
                .into_iter()
                .find(|d| &d.serial == wanted)
                .ok_or(SessionError::DeviceNotFound)?;
            if device.state == crate::adb::DeviceState::Unauthorized {
                return Err(SessionError::DeviceUnauthorized(device.serial));
            }
            if !device.is_ready() {
                return Err(SessionError::DeviceNotFound);
            }
            return Ok(device);
        }

        let ready: Vec<Device> = devices.into_iter().filter(Device::is_ready).collect();
        let usb = ready.iter().find(|d| d.kind == DeviceKind::Usb);
        let tcpip = ready.iter().find(|d| d.kind == DeviceKind::Tcpip);

        usb.or(tcpip)
            .or(ready.first())
            .cloned()
            .ok_or(SessionError::DeviceNotFound)
    }

    /// Seamless wireless: keep the USB route live and add a TCP/IP route
    /// in parallel. ADB migrates transparently when USB is unplugged.
    /// Failures degrade to USB-only and are never fatal. Returns the
    /// serial all subsequent commands should target (exactly one serial,
    /// avoiding "more than one device" ambiguity).
    async fn setup_tcpip(&self, device: &Device, state: &mut TcpipState) -> String {
        if device.kind == DeviceKind::Tcpip {
            let (ip, port) = split_tcpip_serial(&device.serial, self.config.tcpip.port);
            state.connected = true;
            state.ip = Some(ip);
            state.port = port;
            info!("Device already connected via TCP/IP: {}", device.serial);
            return device.serial.clone();
        }

        if !self.config.tcpip.enabled || device.kind != DeviceKind::Usb {
            return device.serial.clone();
        }

        info!("Setting up seamless TCP/IP (USB stays active)...");
        let port = self.config.tcpip.port;

        let ip = match &self.config.tcpip.ip {
            Some(ip) => Some(ip.clone()),
            None => self.adb.get_device_ip(&device.serial).await.ok().flatten(),
        };
        let Some(ip) = ip else {
            warn!("Could not detect device IP, continuing on USB only");
            return device.serial.clone();
        };

        // Enable TCP/IP mode unless adbd already listens on the port
        let port = match self.adb.get_adb_tcp_port(&device.serial).await.ok().flatten() {
            Some(current) => {
                info!("TCP/IP already enabled on port {}", current);
                current
            }
            None => match self.adb.enable_tcpip(&device.serial, port).await {
                Ok(true) => port,
                _ => {
                    warn!("Could not enable TCP/IP mode, continuing on USB only");
                    return device.serial.clone();
                }
            },
        };

        match self.adb.connect_tcpip(&ip, port).await {
            Ok(true) => {
                state.connected = true;
                state.ip = Some(ip.clone());
                state.port = port;
                info!(
                    "TCP/IP route added: {}:{}, USB can now be unplugged",
                    ip, port
                );
                format!("{}:{}", ip, port)
            }
            _ => {
                warn!("Could not connect to {}:{}, continuing on USB only", ip, port);
                device.serial.clone()
            }
        }
    }

    /// Forward mode: the server listens behind `adb forward`; connect to
    /// it with retries. The first socket carries one dummy byte proving
    /// the server really accepted (a zero-byte read means it refused).
    async fn connect_forward(&self, tunnel: &Tunnel, partial: &mut Partial) -> Result<()> {
        let addr = format!("{}:{}", self.config.connection.host, tunnel.local_port);

        let mut video = None;
        for attempt in 1..=CONNECT_RETRIES {
            match TcpStream::connect(&addr).await {
                Ok(mut stream) => {
                    let dummy_read = tokio::time::timeout(
                        self.config.connection.socket_timeout,
                        recv_exact(&mut stream, 1),
                    )
                    .await;
                    match dummy_read {
                        Ok(Ok(dummy)) => {
                            debug!("Dummy byte received: 0x{:02x}", dummy[0]);
                            video = Some(stream);
                            break;
                        }
                        Ok(Err(_)) => {
                            // Connection accepted by adb but refused by the
                            // server; retry
                            debug!("Server refused connection (attempt {})", attempt);
                        }
                        Err(_) => {
                            return Err(SessionError::Timeout(
                                "waiting for server dummy byte".to_string(),
                            ));
                        }
                    }
                }
                Err(e) => debug!("Connect attempt {} failed: {}", attempt, e),
            }
            tokio::time::sleep(CONNECT_RETRY_DELAY).await;
        }

        let video = video.ok_or_else(|| {
            SessionError::Timeout(format!("server not reachable at {} after retries", addr))
        })?;
        info!("Video socket connected (1/3)");
        partial.video_socket = Some(video);

        if self.config.audio.enabled {
            let audio = TcpStream::connect(&addr).await?;
            audio.set_nodelay(true)?;
            info!("Audio socket connected (2/3)");
            partial.audio_socket = Some(audio);
        }

        if self.config.control.enabled {
            let control = TcpStream::connect(&addr).await?;
            control.set_nodelay(true)?;
            info!("Control socket connected (3/3)");
            partial.control_socket = Some(control);
        }

        Ok(())
    }

    /// Reverse mode, phase 1: one reverse entry and one listener per
    /// stream. Video uses the tunnel's base name and port; audio and
    /// control get `_audio`/`_control` suffixes on the following ports.
    async fn prepare_reverse(&self, serial: &str, tunnel: &Tunnel) -> Result<ReverseListeners> {
        let base_port = tunnel.local_port;

        let video = TcpListener::bind(("127.0.0.1", base_port)).await?;

        let audio = if self.config.audio.enabled {
            let port = base_port + 1;
            self.adb
                .add_reverse(serial, &format!("{}_audio", tunnel.socket_name), port)
                .await?;
            Some(TcpListener::bind(("127.0.0.1", port)).await?)
        } else {
            None
        };

        let control = if self.config.control.enabled {
            let port = base_port + 2;
            self.adb
                .add_reverse(serial, &format!("{}_control", tunnel.socket_name), port)
                .await?;
            Some(TcpListener::bind(("127.0.0.1", port)).await?)
        } else {
            None
        };

        Ok(ReverseListeners {
            video,
            audio,
            control,
        })
    }

    /// Reverse mode, phase 2: the server connects out to us in
    /// video/audio/control order.
    async fn accept_reverse(
        &self,
        listeners: ReverseListeners,
        partial: &mut Partial,
    ) -> Result<()> {
        let timeout = self.config.connection.connection_timeout;

        let accept = |listener: TcpListener, label: &'static str| async move {
            let (stream, peer) = tokio::time::timeout(timeout, listener.accept())
                .await
                .map_err(|_| SessionError::Timeout(format!("waiting for {} connection", label)))??;
            debug!("{} socket connected from {}", label, peer);
            Ok::<TcpStream, SessionError>(stream)
        };

        partial.video_socket = Some(accept(listeners.video, "video").await?);
        info!("Video socket accepted (1/3)");

        if let Some(listener) = listeners.audio {
            let audio = accept(listener, "audio").await?;
            audio.set_nodelay(true)?;
            info!("Audio socket accepted (2/3)");
            partial.audio_socket = Some(audio);
        }

        if let Some(listener) = listeners.control {
            let control = accept(listener, "control").await?;
            control.set_nodelay(true)?;
            info!("Control socket accepted (3/3)");
            partial.control_socket = Some(control);
        }

        Ok(())
    }

    /// Device name (64 NUL-padded bytes), codec id, width, height
    async fn read_metadata(&self, video: &mut TcpStream) -> Result<SessionMetadata> {
        let timeout = self.config.connection.socket_timeout;

        let name_bytes = tokio::time::timeout(
            timeout,
            recv_exact(video, DEVICE_NAME_FIELD_LENGTH),
        )
        .await
        .map_err(|_| SessionError::Timeout("reading device name".to_string()))?
        .map_err(|e| SessionError::Protocol(e.to_string()))?;

        let end = name_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(name_bytes.len());
        let device_name = String::from_utf8_lossy(&name_bytes[..end]).into_owned();

        let rest = tokio::time::timeout(timeout, recv_exact(video, 12))
            .await
            .map_err(|_| SessionError::Timeout("reading video metadata".to_string()))?
            .map_err(|e| SessionError::Protocol(e.to_string()))?;

        let raw_codec = u32::from_be_bytes(rest[0..4].try_into().unwrap());
        let codec_id = VideoCodecId::from_raw(raw_codec)
            .map_err(|e| SessionError::Protocol(e.to_string()))?;
        let width = u32::from_be_bytes(rest[4..8].try_into().unwrap());
        let height = u32::from_be_bytes(rest[8..12].try_into().unwrap());

        Ok(SessionMetadata {
            device_name,
            codec_id,
            device_size: (width, height),
        })
    }
}

/// Space-joined `k=v` server parameters
pub fn build_server_params(config: &SessionConfig, scid: u32, forward: bool) -> String {
    let mut params = vec![
        format!("scid={:08x}", scid),
        format!("tunnel_forward={}", forward),
        format!("audio={}", config.audio.enabled),
        "control=true".to_string(),
        format!(
            "clipboard_autosync={}",
            config.control.clipboard_autosync
        ),
        "log_level=info".to_string(),
        format!("video_bit_rate={}", config.video.bitrate),
        format!("max_fps={}", config.video.max_fps),
    ];
    if config.control.stay_awake {
        params.push("stay_awake=true".to_string());
    }
    params.join(" ")
}

fn split_tcpip_serial(serial: &str, default_port: u16) -> (String, u16) {
    match serial.split_once(':') {
        Some((ip, port)) => (
            ip.to_string(),
            port.parse().unwrap_or(default_port),
        ),
        None => (serial.to_string(), default_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adb::executor::AdbExecutor;
    use crate::config::SessionConfig;
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn offline_adb() -> AdbDriver {
        AdbDriver::with_executor(AdbExecutor::with_path(PathBuf::from("adb")))
    }

    fn metadata_bytes(name: &str, codec: &[u8; 4], width: u32, height: u32) -> Vec<u8> {
        let mut buf = vec![0u8; DEVICE_NAME_FIELD_LENGTH];
        buf[..name.len()].copy_from_slice(name.as_bytes());
        buf.extend_from_slice(codec);
        buf.extend_from_slice(&width.to_be_bytes());
        buf.extend_from_slice(&height.to_be_bytes());
        buf
    }

    #[tokio::test]
    async fn test_forward_connect_order_dummy_byte_and_metadata() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Mock server: accepts video, audio, control in order. Only the
        // first accepted socket gets the dummy byte; the audio socket gets
        // a canary the client must not consume.
        let server = tokio::spawn(async move {
            let (mut video, _) = listener.accept().await.unwrap();
            video.write_all(&[0x00]).await.unwrap();

            let (mut audio, _) = listener.accept().await.unwrap();
            audio.write_all(b"A").await.unwrap();

            let (control, _) = listener.accept().await.unwrap();

            video
                .write_all(&metadata_bytes("Pixel 7", b"h264", 1080, 2400))
                .await
                .unwrap();

            // Keep sockets open until the client is done with them
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop((video, audio, control));
        });

        let mut config = SessionConfig::default();
        config.audio.enabled = true;
        let adb = offline_adb();
        let builder = SessionBuilder::new(&config, &adb);
        let tunnel = Tunnel {
            enabled: true,
            forward: true,
            local_port: port,
            socket_name: "scrcpy_00000000".to_string(),
        };

        let mut partial = Partial::default();
        builder.connect_forward(&tunnel, &mut partial).await.unwrap();

        assert!(partial.video_socket.is_some());
        assert!(partial.audio_socket.is_some());
        assert!(partial.control_socket.is_some());

        // Metadata follows the dummy byte on the video socket; a correct
        // parse proves exactly one dummy byte was consumed there
        let metadata = builder
            .read_metadata(partial.video_socket.as_mut().unwrap())
            .await
            .unwrap();
        assert_eq!(metadata.device_name, "Pixel 7");
        assert_eq!(metadata.codec_id, VideoCodecId::H264);
        assert_eq!(metadata.device_size, (1080, 2400));

        // Nothing was read off the audio socket: the canary is still first
        let mut canary = [0u8; 1];
        partial
            .audio_socket
            .as_mut()
            .unwrap()
            .read_exact(&mut canary)
            .await
            .unwrap();
        assert_eq!(&canary, b"A");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_reverse_accept_and_metadata() {
        // Video-only reverse session: the server dials in, no dummy byte
        let mut config = SessionConfig::default();
        config.audio.enabled = false;
        config.control.enabled = false;
        config.connection.connection_timeout = Duration::from_secs(2);

        let adb = offline_adb();
        let builder = SessionBuilder::new(&config, &adb);

        // Pick a free port by binding and releasing
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let tunnel = Tunnel {
            enabled: true,
            forward: false,
            local_port: port,
            socket_name: "scrcpy_00000000".to_string(),
        };

        let listeners = builder.prepare_reverse("serial", &tunnel).await.unwrap();

        let server = tokio::spawn(async move {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            stream
                .write_all(&metadata_bytes("Tablet", b"h265", 1600, 2560))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(stream);
        });

        let mut partial = Partial::default();
        builder.accept_reverse(listeners, &mut partial).await.unwrap();
        assert!(partial.video_socket.is_some());
        assert!(partial.audio_socket.is_none());
        assert!(partial.control_socket.is_none());

        let metadata = builder
            .read_metadata(partial.video_socket.as_mut().unwrap())
            .await
            .unwrap();
        assert_eq!(metadata.device_name, "Tablet");
        assert_eq!(metadata.codec_id, VideoCodecId::H265);
        assert_eq!(metadata.device_size, (1600, 2560));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_metadata_rejects_unknown_codec() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream
                .write_all(&metadata_bytes("Phone", b"zzzz", 1080, 1920))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            drop(stream);
        });

        let config = SessionConfig::default();
        let adb = offline_adb();
        let builder = SessionBuilder::new(&config, &adb);
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        assert!(matches!(
            builder.read_metadata(&mut stream).await,
            Err(SessionError::Protocol(_))
        ));
        server.await.unwrap();
    }

    #[test]
    fn test_server_params_assembly() {
        let mut config = SessionConfig::default();
        config.audio.enabled = true;
        config.video.bitrate = 4_000_000;
        config.video.max_fps = 30;

        let params = build_server_params(&config, 0x0012_abcd, true);
        assert_eq!(
            params,
            "scid=0012abcd tunnel_forward=true audio=true control=true \
             clipboard_autosync=false log_level=info video_bit_rate=4000000 max_fps=30"
        );
    }

    #[test]
    fn test_server_params_stay_awake() {
        let mut config = SessionConfig::default();
        config.control.stay_awake = true;
        let params = build_server_params(&config, 1, false);
        assert!(params.ends_with("stay_awake=true"));
        assert!(params.contains("tunnel_forward=false"));
    }

    #[test]
    fn test_socket_name_format() {
        let scid = 0x0abc_1234u32;
        assert_eq!(format!("scrcpy_{:08x}", scid), "scrcpy_0abc1234");
    }

    #[test]
    fn test_split_tcpip_serial() {
        assert_eq!(
            split_tcpip_serial("192.168.1.5:5555", 5555),
            ("192.168.1.5".to_string(), 5555)
        );
        assert_eq!(
            split_tcpip_serial("192.168.1.5", 4444),
            ("192.168.1.5".to_string(), 4444)
        );
    }
}
