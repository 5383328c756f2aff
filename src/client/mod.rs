/// Public client façade: connect/disconnect, input injection, screenshot,
/// audio recording, clipboard sync, app listing
pub mod input;

use crate::adb::{AdbDriver, AdbError, AppInfo, Device, DeviceKind, Tunnel};
use crate::audio::decoder::AudioStreamInfo;
use crate::audio::recorder::{ConvertFormat, RecorderHandle, TeeSink, WavRecorder};
use crate::audio::{AudioDecoder, AudioPlayer, AudioSink, SinkSlot, new_sink_slot};
use crate::config::{RecordFormat, SessionConfig};
use crate::control::device_msg::DeviceMessageCallbacks;
use crate::control::{ControlMessage, ControlQueue, ControlWriter, CopyKey, DeviceMessageReceiver};
use crate::demux::{AudioDemuxer, DemuxStats, DemuxStatsSnapshot, PACKET_QUEUE_DEPTH, VideoDemuxer};
use crate::session::builder::TcpipState;
use crate::session::{Session, SessionBuilder, SessionError, SessionState};
use crate::video::{DelayBuffer, VideoDecoder, VideoFrame};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Child;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Minimum spacing between screenshots (~3 Hz)
const SCREENSHOT_MIN_INTERVAL: Duration = Duration::from_millis(333);

/// Grace period after transiently resuming a paused decoder, letting the
/// stream stabilize before a capture
const LAZY_RESUME_GRACE: Duration = Duration::from_millis(300);

/// Per-task join timeout during disconnect
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Client errors surfaced at the API boundary
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("adb executable not found")]
    AdbExecutableNotFound,

    #[error("adb command failed: {cmd} (exit code {code}): {stderr}")]
    AdbCommandFailed {
        cmd: String,
        code: i32,
        stderr: String,
    },

    #[error("adb command timed out after {seconds}s: {cmd}")]
    AdbTimeout { cmd: String, seconds: u64 },

    #[error("no usable device found")]
    DeviceNotFound,

    #[error("device unauthorized: {0}")]
    DeviceUnauthorized(String),

    #[error("connection timed out: {0}")]
    ConnectionTimeout(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("incomplete read: expected {expected} bytes, got {got}")]
    IncompleteRead { expected: usize, got: usize },

    #[error("codec not supported: {0}")]
    CodecNotSupported(String),

    #[error("decoder initialization failed: {0}")]
    DecoderInitFailed(String),

    #[error("decode failed: {0}")]
    DecodeFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad argument: {0}")]
    BadArgument(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl From<AdbError> for ClientError {
    fn from(e: AdbError) -> Self {
        match e {
            AdbError::ExecutableNotFound => ClientError::AdbExecutableNotFound,
            AdbError::CommandFailed { cmd, code, stderr } => {
                ClientError::AdbCommandFailed { cmd, code, stderr }
            }
            AdbError::Timeout { cmd, seconds } => ClientError::AdbTimeout { cmd, seconds },
            AdbError::DeviceNotFound(_) => ClientError::DeviceNotFound,
            AdbError::DeviceUnauthorized(serial) => ClientError::DeviceUnauthorized(serial),
            AdbError::Parse(reason) => ClientError::ProtocolError(reason),
            AdbError::Io(e) => ClientError::Io(e),
        }
    }
}

impl From<SessionError> for ClientError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::DeviceNotFound => ClientError::DeviceNotFound,
            SessionError::DeviceUnauthorized(serial) => ClientError::DeviceUnauthorized(serial),
            SessionError::Timeout(what) => ClientError::ConnectionTimeout(what),
            SessionError::Protocol(reason) => ClientError::ProtocolError(reason),
            SessionError::Adb(e) => e.into(),
            SessionError::Io(e) => ClientError::Io(e),
        }
    }
}

/// Everything owned for the lifetime of one connection
struct SessionRuntime {
    adb: Arc<AdbDriver>,
    serial: String,
    tunnel: Tunnel,
    tcpip: TcpipState,
    server_process: Option<Child>,

    shutdown_tx: Arc<watch::Sender<bool>>,
    video_pause_tx: watch::Sender<bool>,
    audio_pause_tx: watch::Sender<bool>,

    control_queue: Arc<ControlQueue>,
    frame_buffer: Arc<DelayBuffer>,
    audio_sink: SinkSlot,
    audio_info: Arc<AudioStreamInfo>,
    player: Option<AudioPlayer>,
    callbacks: Arc<DeviceMessageCallbacks>,
    has_receiver: bool,

    video_stats: Arc<DemuxStats>,
    audio_stats: Arc<DemuxStats>,

    recorder: Mutex<Option<RecorderHandle>>,
    audio_resumed_for_recording: AtomicBool,
    app_list_waiter: Arc<Mutex<Option<oneshot::Sender<Vec<AppInfo>>>>>,

    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

/// The scrcpy client. One instance drives at most one session at a time.
pub struct ScrcpyClient {
    config: SessionConfig,
    state: Arc<RwLock<SessionState>>,
    runtime: Option<SessionRuntime>,
    clipboard_sequence: AtomicU64,
    screenshot_last: Mutex<Option<Instant>>,
}

impl ScrcpyClient {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(SessionState::default())),
            runtime: None,
            clipboard_sequence: AtomicU64::new(0),
            screenshot_last: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Consistent snapshot of the session state
    pub fn state(&self) -> SessionState {
        self.state.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().connected
    }

    /// True while the session's tasks are alive. Turns false when a fatal
    /// stream error flips the internal stop flag, even before
    /// `disconnect` is called.
    pub fn is_running(&self) -> bool {
        match &self.runtime {
            Some(runtime) => self.state.read().running && !*runtime.shutdown_tx.borrow(),
            None => false,
        }
    }

    pub fn device_name(&self) -> String {
        self.state.read().device_name.clone()
    }

    pub fn device_size(&self) -> (u32, u32) {
        self.state.read().device_size
    }

    /// Frame handoff for external renderers. Latest-wins; consume frames
    /// via `DelayBuffer::consume`.
    pub fn frame_buffer(&self) -> Option<Arc<DelayBuffer>> {
        self.runtime.as_ref().map(|r| r.frame_buffer.clone())
    }

    pub fn video_stats(&self) -> Option<DemuxStatsSnapshot> {
        self.runtime.as_ref().map(|r| r.video_stats.snapshot())
    }

    pub fn audio_stats(&self) -> Option<DemuxStatsSnapshot> {
        self.runtime.as_ref().map(|r| r.audio_stats.snapshot())
    }

    pub fn control_dropped_count(&self) -> u64 {
        self.runtime
            .as_ref()
            .map_or(0, |r| r.control_queue.dropped_count())
    }

    // ===== Connection lifecycle =====

    /// Establish the session and spawn the per-socket tasks
    pub async fn connect(&mut self) -> Result<()> {
        if self.runtime.is_some() {
            return Err(ClientError::AlreadyConnected);
        }

        let adb = Arc::new(AdbDriver::new()?);
        let session = SessionBuilder::new(&self.config, &adb).connect().await?;
        let runtime = self.spawn_runtime(adb, session)?;

        {
            let mut state = self.state.write();
            state.connected = true;
            state.running = true;
            state.device_serial = runtime.serial.clone();
            state.forward_mode = runtime.tunnel.forward;
            state.tcpip_connected = runtime.tcpip.connected;
            state.tcpip_ip = runtime.tcpip.ip.clone();
            state.tcpip_port = runtime.tcpip.port;
        }

        self.runtime = Some(runtime);

        // Lazy decode: everything pauses until a capture needs it
        if self.config.effective_lazy_decode() {
            info!("Lazy decode: decoders paused until needed");
            self.set_video_enabled(false);
            self.set_audio_enabled(false);
        }

        // Session recording configured up front
        if let Some(record_file) = self.config.record.file.clone() {
            let convert = match self.config.record.format {
                RecordFormat::Wav => None,
                RecordFormat::Opus => Some(ConvertFormat::Opus),
                RecordFormat::Mp3 => Some(ConvertFormat::Mp3),
            };
            if let Err(e) = self.start_audio_recording(record_file, None, true, convert) {
                warn!("Session recording not started: {}", e);
            }
        }

        info!("Client fully initialized and connected");
        Ok(())
    }

    fn spawn_runtime(&self, adb: Arc<AdbDriver>, session: Session) -> Result<SessionRuntime> {
        let Session {
            metadata,
            video_socket,
            audio_socket,
            control_socket,
            tunnel,
            serial,
            scid: _,
            server_process,
            tcpip,
        } = session;

        {
            let mut state = self.state.write();
            state.device_name = metadata.device_name.clone();
            state.device_size = metadata.device_size;
            state.codec_id = Some(metadata.codec_id);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);
        // An undecoded video stream is kept permanently paused: the
        // demuxer then just drains the socket
        let (video_pause_tx, video_pause_rx) = watch::channel(!self.config.video.enabled);
        let (audio_pause_tx, audio_pause_rx) = watch::channel(false);

        let control_queue = Arc::new(ControlQueue::new());
        let frame_buffer = Arc::new(DelayBuffer::new());
        let audio_sink = new_sink_slot();
        let audio_info = Arc::new(AudioStreamInfo::default());
        let callbacks = Arc::new(DeviceMessageCallbacks::default());
        let video_stats = Arc::new(DemuxStats::default());
        let audio_stats = Arc::new(DemuxStats::default());
        let app_list_waiter: Arc<Mutex<Option<oneshot::Sender<Vec<AppInfo>>>>> =
            Arc::new(Mutex::new(None));

        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        // ---- Video pipeline: demuxer -> bounded queue -> decoder -> delay buffer
        let (video_read, video_write) = video_socket.into_split();
        let (video_tx, video_rx) = tokio::sync::mpsc::channel(PACKET_QUEUE_DEPTH);

        let demuxer = VideoDemuxer::new(
            video_read,
            metadata.codec_id,
            video_tx,
            video_pause_rx.clone(),
            shutdown_rx.clone(),
            video_stats.clone(),
        );
        tasks.push((
            "video-demuxer",
            spawn_fatal(demuxer.run(), shutdown_tx.clone()),
        ));

        if self.config.video.enabled {
            let decoder = VideoDecoder::new(
                metadata.codec_id,
                video_rx,
                frame_buffer.clone(),
                video_pause_rx,
                shutdown_rx.clone(),
            );
            tasks.push(("video-decoder", spawn_fatal(decoder.run(), shutdown_tx.clone())));
        } else {
            drop(video_rx);
        }

        // ---- Audio pipeline
        let mut player = None;
        if let Some(audio_socket) = audio_socket {
            let (audio_read, _audio_write) = audio_socket.into_split();
            let (codec_tx, codec_rx) = oneshot::channel();
            let (audio_tx, audio_rx) = tokio::sync::mpsc::channel(PACKET_QUEUE_DEPTH);

            let demuxer = AudioDemuxer::new(
                audio_read,
                codec_tx,
                audio_tx,
                audio_pause_rx.clone(),
                shutdown_rx.clone(),
                audio_stats.clone(),
            );
            tasks.push((
                "audio-demuxer",
                spawn_fatal(demuxer.run(), shutdown_tx.clone()),
            ));

            match AudioPlayer::new() {
                Ok(p) => {
                    *audio_sink.lock() = Some(Box::new(p.clone()) as Box<dyn AudioSink>);
                    player = Some(p);
                }
                Err(e) => warn!("Audio playback disabled: {}", e),
            }

            let decoder = AudioDecoder::new(
                codec_rx,
                audio_rx,
                audio_sink.clone(),
                audio_info.clone(),
                audio_pause_rx,
                shutdown_rx.clone(),
            );
            tasks.push(("audio-decoder", spawn_fatal(decoder.run(), shutdown_tx.clone())));
        }

        // ---- Control writer and device-message receiver
        let mut has_receiver = false;
        match control_socket {
            Some(control_socket) => {
                let (control_read, control_write) = control_socket.into_split();

                let writer =
                    ControlWriter::new(control_write, control_queue.clone(), shutdown_rx.clone());
                tasks.push(("control-writer", spawn_fatal(writer.run(), shutdown_tx.clone())));

                self.install_callbacks(&callbacks, &app_list_waiter);
                let receiver =
                    DeviceMessageReceiver::new(control_read, callbacks.clone(), shutdown_rx.clone());
                tasks.push((
                    "device-receiver",
                    spawn_logged(receiver.run(), "device receiver"),
                ));
                has_receiver = true;
            }
            None if self.config.control.enabled => {
                // Video-only peer: best-effort control over the video socket
                let writer =
                    ControlWriter::new(video_write, control_queue.clone(), shutdown_rx.clone());
                tasks.push(("control-writer", spawn_fatal(writer.run(), shutdown_tx.clone())));
            }
            None => drop(video_write),
        }

        // ---- Host clipboard monitor (host -> device autosync)
        if self.config.control.clipboard_autosync {
            let queue = control_queue.clone();
            let mut shutdown = shutdown_rx.clone();
            tasks.push((
                "clipboard-monitor",
                tokio::spawn(async move {
                    let mut last = String::new();
                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                        let current = tokio::task::spawn_blocking(read_host_clipboard)
                            .await
                            .unwrap_or(None);
                        if let Some(text) = current {
                            if !text.is_empty() && text != last {
                                debug!("Host clipboard changed, syncing to device");
                                queue.push(ControlMessage::SetClipboard {
                                    sequence: 0,
                                    paste: false,
                                    text: text.clone(),
                                });
                                last = text;
                            }
                        }
                    }
                }),
            ));
        }

        Ok(SessionRuntime {
            adb,
            serial,
            tunnel,
            tcpip,
            server_process,
            shutdown_tx,
            video_pause_tx,
            audio_pause_tx,
            control_queue,
            frame_buffer,
            audio_sink,
            audio_info,
            player,
            callbacks,
            has_receiver,
            video_stats,
            audio_stats,
            recorder: Mutex::new(None),
            audio_resumed_for_recording: AtomicBool::new(false),
            app_list_waiter,
            tasks,
        })
    }

    /// Wire the receiver callbacks: device clipboard lands on the host
    /// clipboard when autosync is on, and app-list replies wake the
    /// current `list_apps` waiter.
    fn install_callbacks(
        &self,
        callbacks: &Arc<DeviceMessageCallbacks>,
        app_list_waiter: &Arc<Mutex<Option<oneshot::Sender<Vec<AppInfo>>>>>,
    ) {
        if self.config.control.clipboard_autosync {
            callbacks.set_on_clipboard(|(text, _sequence)| {
                if let Err(e) = write_host_clipboard(&text) {
                    warn!("Could not update host clipboard: {}", e);
                }
            });
        }

        let waiter = app_list_waiter.clone();
        callbacks.set_on_app_list(move |apps| {
            if let Some(tx) = waiter.lock().take() {
                let _ = tx.send(apps);
            }
        });
    }

    /// Stop everything and release the session. Idempotent: calling it
    /// again (or while never connected) is a no-op.
    pub async fn disconnect(&mut self) -> Result<()> {
        let Some(mut runtime) = self.runtime.take() else {
            return Ok(());
        };

        info!("Disconnecting...");
        {
            let mut state = self.state.write();
            state.connected = false;
            state.running = false;
        }

        // Finish an in-flight recording before the pipeline stops
        if let Some(handle) = runtime.recorder.lock().take() {
            let _ = tokio::task::spawn_blocking(move || handle.finalize()).await;
        }

        // Unblock every task: stop flag plus pause releases
        let _ = runtime.shutdown_tx.send(true);
        let _ = runtime.video_pause_tx.send(false);
        let _ = runtime.audio_pause_tx.send(false);

        for (name, mut handle) in runtime.tasks.drain(..) {
            match tokio::time::timeout(TASK_JOIN_TIMEOUT, &mut handle).await {
                Ok(_) => debug!("{} stopped", name),
                Err(_) => {
                    warn!("{} did not stop in time, aborting", name);
                    handle.abort();
                }
            }
        }

        // Close the player output
        if let Some(sink) = runtime.audio_sink.lock().as_mut() {
            sink.close();
        }
        *runtime.audio_sink.lock() = None;

        Session::teardown(
            &runtime.serial,
            &runtime.tunnel,
            &mut runtime.server_process,
            &runtime.adb,
        )
        .await;

        // The TCP/IP route is kept for the next session unless configured
        // otherwise
        if runtime.tcpip.connected && self.config.tcpip.auto_disconnect {
            if let Some(ip) = &runtime.tcpip.ip {
                info!("Auto-disconnecting TCP/IP route {}:{}", ip, runtime.tcpip.port);
                let _ = runtime.adb.disconnect_tcpip(ip, runtime.tcpip.port).await;
            }
        }

        runtime.frame_buffer.clear();
        info!("Disconnected");
        Ok(())
    }

    // ===== Pause / resume (lazy decode plumbing) =====

    pub fn set_video_enabled(&self, enabled: bool) {
        if !self.config.video.enabled {
            return; // permanently paused drain mode
        }
        if let Some(runtime) = &self.runtime {
            let _ = runtime.video_pause_tx.send(!enabled);
        }
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        if let Some(runtime) = &self.runtime {
            let _ = runtime.audio_pause_tx.send(!enabled);
        }
    }

    fn video_paused(&self) -> bool {
        self.runtime
            .as_ref()
            .map_or(false, |r| *r.video_pause_tx.borrow())
    }

    fn audio_paused(&self) -> bool {
        self.runtime
            .as_ref()
            .map_or(false, |r| *r.audio_pause_tx.borrow())
    }

    // ===== Clipboard =====

    /// Ask the device for its clipboard; the reply arrives through the
    /// receiver's clipboard callback
    pub fn get_clipboard(&self, copy_key: CopyKey) -> Result<()> {
        self.queue_message(ControlMessage::GetClipboard { copy_key })
    }

    /// Set the device clipboard, optionally pasting it into the focused
    /// editor. Sequence numbers increase per call.
    pub fn set_clipboard(&self, text: impl Into<String>, paste: bool) -> Result<u64> {
        let sequence = self.clipboard_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.queue_message(ControlMessage::SetClipboard {
            sequence,
            paste,
            text: text.into(),
        })?;
        Ok(sequence)
    }

    /// Copy the host clipboard to the device. Returns false when the host
    /// clipboard is empty.
    pub async fn sync_clipboard_to_device(&self, paste: bool) -> Result<bool> {
        if self.runtime.is_none() {
            return Err(ClientError::NotConnected);
        }

        let text = tokio::task::spawn_blocking(read_host_clipboard)
            .await
            .unwrap_or(None);
        match text {
            Some(text) if !text.is_empty() => {
                info!("Syncing host clipboard to device ({} chars)", text.len());
                self.set_clipboard(text, paste)?;
                Ok(true)
            }
            _ => {
                warn!("Host clipboard is empty, nothing to sync");
                Ok(false)
            }
        }
    }

    // ===== App listing =====

    /// List installed applications. Connected sessions ask the running
    /// server in-band (no file push, works over wireless ADB); otherwise
    /// fall back to a one-shot server run via adb.
    pub async fn list_apps(&self, timeout: Duration) -> Result<Vec<AppInfo>> {
        if let Some(runtime) = self.runtime.as_ref().filter(|r| r.has_receiver) {
            let (tx, rx) = oneshot::channel();
            *runtime.app_list_waiter.lock() = Some(tx);

            self.queue_message(ControlMessage::GetAppList)?;
            info!("Requested app list from server");

            return match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(apps)) => Ok(apps),
                Ok(Err(_)) => Err(ClientError::ProtocolError(
                    "receiver closed before app list arrived".to_string(),
                )),
                Err(_) => {
                    runtime.app_list_waiter.lock().take();
                    Err(ClientError::ConnectionTimeout("app list reply".to_string()))
                }
            };
        }

        // Out-of-band fallback
        let adb = match &self.runtime {
            Some(runtime) => runtime.adb.clone(),
            None => Arc::new(AdbDriver::new()?),
        };
        let serial = match &self.runtime {
            Some(runtime) => runtime.serial.clone(),
            None => pick_fallback_device(&adb).await?.serial,
        };
        Ok(adb
            .list_apps(&serial, &self.config.connection.server_path)
            .await?)
    }

    // ===== Screenshot =====

    /// Grab the most recent decoded frame without blocking. Under lazy
    /// decode the video pipeline is transiently resumed, given a grace
    /// period, then re-paused. Rate limited to ~3 Hz.
    pub async fn screenshot(&self, filename: Option<&Path>) -> Result<Option<VideoFrame>> {
        let runtime = self.runtime.as_ref().ok_or(ClientError::NotConnected)?;
        if !self.config.video.enabled {
            return Err(ClientError::BadArgument(
                "video is disabled in this session".to_string(),
            ));
        }

        // Rate limit: hand out the current frame but skip the capture work
        {
            let mut last = self.screenshot_last.lock();
            if let Some(previous) = *last {
                if previous.elapsed() < SCREENSHOT_MIN_INTERVAL {
                    debug!("Screenshot rate limited");
                    return Ok(runtime.frame_buffer.peek());
                }
            }
            *last = Some(Instant::now());
        }

        let lazily_paused = self.config.effective_lazy_decode() && self.video_paused();
        if lazily_paused {
            debug!("Screenshot: transiently resuming video");
            self.set_video_enabled(true);
            tokio::time::sleep(LAZY_RESUME_GRACE).await;
        }

        let frame = runtime.frame_buffer.peek();

        if lazily_paused {
            debug!("Screenshot: re-pausing video");
            self.set_video_enabled(false);
        }

        if let (Some(frame), Some(path)) = (&frame, filename) {
            save_frame(frame.clone(), path.to_path_buf()).await?;
        }

        Ok(frame)
    }

    /// Screenshot without an existing session: spin up a throw-away
    /// video-only session, grab the first frame, tear everything down.
    pub async fn screenshot_standalone(
        config: &SessionConfig,
        filename: Option<&Path>,
        timeout: Duration,
    ) -> Result<Option<VideoFrame>> {
        let mut config = config.clone();
        config.video.enabled = true;
        config.audio.enabled = false;
        config.lazy_decode = false;
        config.record.file = None;

        let mut client = ScrcpyClient::new(config);
        client.connect().await?;

        let deadline = Instant::now() + timeout;
        let mut frame = None;
        while Instant::now() < deadline {
            if let Some(current) = client
                .runtime
                .as_ref()
                .and_then(|r| r.frame_buffer.peek())
            {
                frame = Some(current);
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        client.disconnect().await?;

        if let (Some(frame), Some(path)) = (&frame, filename) {
            save_frame(frame.clone(), path.to_path_buf()).await?;
        }
        Ok(frame)
    }

    // ===== Audio recording =====

    /// Start recording decoded audio. The recorder taps the stream the
    /// playback path already decodes, so the capture itself is free.
    pub fn start_audio_recording(
        &self,
        filename: PathBuf,
        max_duration: Option<Duration>,
        play_while_recording: bool,
        auto_convert_to: Option<ConvertFormat>,
    ) -> Result<()> {
        let runtime = self.runtime.as_ref().ok_or(ClientError::NotConnected)?;
        if !self.config.audio.enabled {
            return Err(ClientError::BadArgument(
                "audio is disabled in this session".to_string(),
            ));
        }

        let mut recorder_slot = runtime.recorder.lock();
        if recorder_slot.as_ref().is_some_and(RecorderHandle::is_recording) {
            return Err(ClientError::BadArgument(
                "audio recording already in progress".to_string(),
            ));
        }

        // Lazy decode: wake the audio pipeline for the recording
        if self.config.effective_lazy_decode() && self.audio_paused() {
            info!("Audio recording: resuming audio pipeline");
            self.set_audio_enabled(true);
            runtime
                .audio_resumed_for_recording
                .store(true, Ordering::SeqCst);
        }

        let (recorder, handle) = WavRecorder::create(filename, max_duration, auto_convert_to);

        let sink: Box<dyn AudioSink> = match (&runtime.player, play_while_recording) {
            (Some(player), true) => Box::new(TeeSink::new(
                Box::new(player.clone()),
                Box::new(recorder),
            )),
            _ => Box::new(recorder),
        };
        *runtime.audio_sink.lock() = Some(sink);
        *recorder_slot = Some(handle);

        info!("Audio recording started");
        Ok(())
    }

    /// Stop the recording, finalize the file (and the optional
    /// transcode), restore live playback. Returns the output path.
    pub async fn stop_audio_recording(&self) -> Result<Option<PathBuf>> {
        let runtime = self.runtime.as_ref().ok_or(ClientError::NotConnected)?;

        let Some(handle) = runtime.recorder.lock().take() else {
            warn!("No audio recording in progress");
            return Ok(None);
        };

        // Put the plain player back before finalizing
        *runtime.audio_sink.lock() = runtime
            .player
            .clone()
            .map(|p| Box::new(p) as Box<dyn AudioSink>);

        let path = tokio::task::spawn_blocking(move || handle.finalize())
            .await
            .map_err(|e| ClientError::DecodeFailed(e.to_string()))?
            .map_err(|e| ClientError::Io(std::io::Error::other(e.to_string())))?;

        if runtime
            .audio_resumed_for_recording
            .swap(false, Ordering::SeqCst)
            && self.config.effective_lazy_decode()
        {
            info!("Audio recording: re-pausing audio pipeline");
            self.set_audio_enabled(false);
        }

        info!("Audio recording stopped: {}", path.display());
        Ok(Some(path))
    }

    /// Record for a fixed duration, then stop
    pub async fn record_audio(&self, filename: PathBuf, duration: Duration) -> Result<PathBuf> {
        self.start_audio_recording(filename, Some(duration), true, None)?;
        tokio::time::sleep(duration).await;
        self.stop_audio_recording()
            .await?
            .ok_or_else(|| ClientError::BadArgument("recording vanished".to_string()))
    }

    pub fn is_recording_audio(&self) -> bool {
        self.runtime.as_ref().is_some_and(|r| {
            r.recorder
                .lock()
                .as_ref()
                .is_some_and(RecorderHandle::is_recording)
        })
    }

    pub fn recording_duration(&self) -> Duration {
        self.runtime
            .as_ref()
            .and_then(|r| r.recorder.lock().as_ref().map(RecorderHandle::duration))
            .unwrap_or(Duration::ZERO)
    }

    /// Detected audio stream parameters (defaults until the first frame)
    pub fn audio_stream_info(&self) -> Option<(u32, u16)> {
        self.runtime
            .as_ref()
            .map(|r| (r.audio_info.sample_rate(), r.audio_info.channels()))
    }

    // ===== Internal =====

    /// Enqueue a control message. Helpers are best-effort: an evicted
    /// droppable message is not an error.
    pub(crate) fn queue_message(&self, msg: ControlMessage) -> Result<()> {
        let runtime = self.runtime.as_ref().ok_or(ClientError::NotConnected)?;
        if !runtime.control_queue.push(msg) {
            warn!("Control message rejected: queue full of non-droppable messages");
        }
        Ok(())
    }
}

/// Spawn a task whose failure kills the whole session
fn spawn_fatal<E: std::fmt::Display + Send + 'static>(
    future: impl std::future::Future<Output = std::result::Result<(), E>> + Send + 'static,
    shutdown_tx: Arc<watch::Sender<bool>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = future.await {
            error!("Session task failed: {}", e);
            let _ = shutdown_tx.send(true);
        }
    })
}

/// Spawn a task whose failure is logged but tolerated
fn spawn_logged<E: std::fmt::Display + Send + 'static>(
    future: impl std::future::Future<Output = std::result::Result<(), E>> + Send + 'static,
    label: &'static str,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = future.await {
            warn!("{} ended with error: {}", label, e);
        }
    })
}

async fn pick_fallback_device(adb: &AdbDriver) -> Result<Device> {
    let devices = adb.list_devices().await?;
    let ready: Vec<Device> = devices.into_iter().filter(Device::is_ready).collect();
    ready
        .iter()
        .find(|d| d.kind == DeviceKind::Usb)
        .or_else(|| ready.iter().find(|d| d.kind == DeviceKind::Tcpip))
        .or_else(|| ready.first())
        .cloned()
        .ok_or(ClientError::DeviceNotFound)
}

fn read_host_clipboard() -> Option<String> {
    match arboard::Clipboard::new().and_then(|mut c| c.get_text()) {
        Ok(text) => Some(text),
        Err(e) => {
            debug!("Host clipboard read failed: {}", e);
            None
        }
    }
}

fn write_host_clipboard(text: &str) -> std::result::Result<(), arboard::Error> {
    arboard::Clipboard::new()?.set_text(text.to_string())
}

/// Encode and write a frame off the async path; the extension picks the
/// image format (PNG, JPEG, ...)
async fn save_frame(frame: VideoFrame, path: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        let image = image::RgbImage::from_raw(frame.width, frame.height, frame.data)
            .ok_or_else(|| ClientError::DecodeFailed("frame buffer size mismatch".to_string()))?;
        image
            .save(&path)
            .map_err(|e| ClientError::Io(std::io::Error::other(e.to_string())))?;
        info!("Screenshot saved: {}", path.display());
        Ok(())
    })
    .await
    .map_err(|e| ClientError::DecodeFailed(e.to_string()))?
}
