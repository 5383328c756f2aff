use anyhow::Result;
use clap::Parser;
use scrcpy_client::config::{AudioCodec, SessionConfig, VideoCodec};
use scrcpy_client::{ClientError, ScrcpyClient};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

/// Headless scrcpy client
#[derive(Parser, Debug, Clone)]
#[command(name = "scrcpy-client")]
#[command(about = "Mirror and control Android devices over ADB", long_about = None)]
struct Args {
    /// Device serial (default: auto-select, USB preferred)
    #[arg(short, long)]
    serial: Option<String>,

    /// Path to the scrcpy-server blob pushed to the device
    #[arg(long, default_value = "scrcpy-server")]
    server: PathBuf,

    /// Video codec: h264, h265 or av1
    #[arg(long, value_enum, default_value = "h264")]
    codec: VideoCodecArg,

    /// Video bitrate in bits per second
    #[arg(short, long, default_value_t = 8_000_000)]
    bitrate: u32,

    /// Frame rate cap
    #[arg(long, default_value_t = 60)]
    max_fps: u32,

    /// Enable device audio
    #[arg(long, default_value_t = false)]
    audio: bool,

    /// Disable the control stream (no input injection)
    #[arg(long, default_value_t = false)]
    no_control: bool,

    /// Keep the device awake while connected
    #[arg(long, default_value_t = false)]
    stay_awake: bool,

    /// Keep host and device clipboards in sync
    #[arg(long, default_value_t = false)]
    clipboard_autosync: bool,

    /// Enable TCP/IP in parallel with USB (seamless wireless)
    #[arg(long, default_value_t = false)]
    tcpip: bool,

    /// Device IP for TCP/IP mode (default: auto-detect)
    #[arg(long)]
    tcpip_ip: Option<String>,

    /// Drop the TCP/IP route on exit
    #[arg(long, default_value_t = false)]
    tcpip_auto_disconnect: bool,

    /// Force forward tunnels (skip adb reverse)
    #[arg(long, default_value_t = cfg!(target_os = "windows"))]
    force_forward: bool,

    /// Disable lazy decode (decode continuously even with no consumer)
    #[arg(long, default_value_t = false)]
    no_lazy_decode: bool,

    /// Take one screenshot into FILE and exit
    #[arg(long, value_name = "FILE")]
    screenshot: Option<PathBuf>,

    /// Record audio into FILE (wav/opus/mp3 by extension) and exit after
    /// --duration seconds
    #[arg(long, value_name = "FILE")]
    record_audio: Option<PathBuf>,

    /// Duration in seconds for --record-audio
    #[arg(long, default_value_t = 10)]
    duration: u64,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum VideoCodecArg {
    H264,
    H265,
    Av1,
}

impl From<VideoCodecArg> for VideoCodec {
    fn from(codec: VideoCodecArg) -> Self {
        match codec {
            VideoCodecArg::H264 => VideoCodec::H264,
            VideoCodecArg::H265 => VideoCodec::H265,
            VideoCodecArg::Av1 => VideoCodec::Av1,
        }
    }
}

fn build_config(args: &Args) -> SessionConfig {
    let mut config = SessionConfig::default();
    config.connection.device_serial = args.serial.clone();
    config.connection.server_path = args.server.clone();
    config.connection.force_forward = args.force_forward;
    config.video.codec = args.codec.into();
    config.video.bitrate = args.bitrate;
    config.video.max_fps = args.max_fps;
    config.audio.enabled = args.audio || args.record_audio.is_some();
    config.audio.codec = AudioCodec::Opus;
    config.control.enabled = !args.no_control;
    config.control.stay_awake = args.stay_awake;
    config.control.clipboard_autosync = args.clipboard_autosync;
    config.tcpip.enabled = args.tcpip;
    config.tcpip.ip = args.tcpip_ip.clone();
    config.tcpip.auto_disconnect = args.tcpip_auto_disconnect;
    config.lazy_decode = !args.no_lazy_decode;
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = build_config(&args);

    // One-shot screenshot needs no persistent session
    if let Some(path) = &args.screenshot {
        info!("Taking screenshot to {}", path.display());
        match ScrcpyClient::screenshot_standalone(&config, Some(path.as_path()), Duration::from_secs(10))
            .await
        {
            Ok(Some(frame)) => {
                info!("Screenshot saved ({}x{})", frame.width, frame.height);
                return Ok(());
            }
            Ok(None) => anyhow::bail!("no frame arrived in time"),
            Err(e) => return Err(e.into()),
        }
    }

    let mut client = ScrcpyClient::new(config);
    client.connect().await.map_err(|e| {
        if matches!(e, ClientError::AdbExecutableNotFound) {
            error!("adb not found; install platform-tools or set the ADB environment variable");
        }
        anyhow::anyhow!(e)
    })?;

    info!(
        "Mirroring {} ({}x{})",
        client.device_name(),
        client.device_size().0,
        client.device_size().1
    );

    if let Some(path) = args.record_audio.clone() {
        let duration = Duration::from_secs(args.duration);
        info!(
            "Recording audio for {}s to {}",
            args.duration,
            path.display()
        );
        match client.record_audio(path, duration).await {
            Ok(saved) => info!("Recording saved: {}", saved.display()),
            Err(e) => warn!("Recording failed: {}", e),
        }
        client.disconnect().await?;
        return Ok(());
    }

    // Mirror until interrupted or the session dies
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                if !client.is_running() {
                    warn!("Session ended");
                    break;
                }
            }
        }
    }

    client.disconnect().await?;
    Ok(())
}
