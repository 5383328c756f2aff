use super::delay_buffer::{DelayBuffer, VideoFrame};
use crate::demux::VideoPacket;
use crate::protocol::VideoCodecId;
use anyhow::{Context as AnyhowContext, Result};
use ffmpeg::codec::Context;
use ffmpeg::codec::decoder::Video as FfmpegVideoDecoder;
use ffmpeg::codec::parameters::Parameters;
use ffmpeg::format::Pixel;
use ffmpeg::software::scaling::{context::Context as ScalingContext, flag::Flags};
use ffmpeg::util::frame::video::Video as FfmpegFrame;
use ffmpeg_next as ffmpeg;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Video decoder task. Consumes the video packet queue and pushes RGB24
/// frames into the delay buffer. Decode errors skip the offending packet;
/// they never terminate the session.
pub struct VideoDecoder {
    codec_id: VideoCodecId,
    packet_rx: mpsc::Receiver<VideoPacket>,
    frame_buffer: Arc<DelayBuffer>,
    paused: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
}

impl VideoDecoder {
    pub fn new(
        codec_id: VideoCodecId,
        packet_rx: mpsc::Receiver<VideoPacket>,
        frame_buffer: Arc<DelayBuffer>,
        paused: watch::Receiver<bool>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            codec_id,
            packet_rx,
            frame_buffer,
            paused,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut inner = DecoderInner::new(self.codec_id)?;
        info!("Video decoder started ({})", self.codec_id.ffmpeg_name());

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            // Pausing blocks here until resume or shutdown
            if *self.paused.borrow() {
                tokio::select! {
                    _ = self.shutdown.changed() => break,
                    _ = self.paused.changed() => continue,
                }
            }

            let packet = tokio::select! {
                _ = self.shutdown.changed() => break,
                _ = self.paused.changed() => continue,
                packet = self.packet_rx.recv() => match packet {
                    Some(packet) => packet,
                    None => break, // demuxer gone
                },
            };

            if packet.header.is_config {
                inner.apply_extradata(&packet.data);
                continue;
            }

            match inner.decode(&packet) {
                Ok(frames) => {
                    for frame in frames {
                        if self.frame_buffer.push(frame) {
                            debug!("Previous frame skipped (renderer too slow)");
                        }
                    }
                }
                Err(e) => warn!("Video decode error, skipping packet: {}", e),
            }
        }

        info!("Video decoder stopped");
        Ok(())
    }
}

/// The ffmpeg codec state and RGB24 conversion. The decoder is opened on
/// the first media packet so that config extradata, which libavcodec only
/// reads at open time, can be applied beforehand.
struct DecoderInner {
    codec_id: VideoCodecId,
    decoder: Option<FfmpegVideoDecoder>,
    extradata: Option<Vec<u8>>,
    scaler: Option<Scaler>,
}

struct Scaler {
    context: ScalingContext,
    src: (Pixel, u32, u32),
}

// ffmpeg-next marks its other FFI context wrappers (codec::Context,
// software::resampling::Context, filter::Graph) Send; ScalingContext is
// the same kind of exclusively-owned FFI handle but lacks the impl.
unsafe impl Send for Scaler {}

impl DecoderInner {
    fn new(codec_id: VideoCodecId) -> Result<Self> {
        ffmpeg::init().context("Failed to initialize FFmpeg")?;

        // Fail fast if the codec is missing; the decoder itself is opened
        // lazily once extradata is known
        ffmpeg::codec::decoder::find_by_name(codec_id.ffmpeg_name())
            .with_context(|| format!("Video decoder '{}' not found", codec_id.ffmpeg_name()))?;

        Ok(Self {
            codec_id,
            decoder: None,
            extradata: None,
            scaler: None,
        })
    }

    /// Remember a config packet's payload (SPS/PPS) as codec extradata.
    /// Only the first one is kept; later parameter changes arrive merged
    /// in-band ahead of the next key frame.
    fn apply_extradata(&mut self, data: &[u8]) {
        if self.extradata.is_some() || data.is_empty() {
            return;
        }
        info!("Codec extradata captured: {} bytes", data.len());
        self.extradata = Some(data.to_vec());
    }

    fn ensure_open(&mut self) -> Result<&mut FfmpegVideoDecoder> {
        if self.decoder.is_none() {
            let codec = ffmpeg::codec::decoder::find_by_name(self.codec_id.ffmpeg_name())
                .with_context(|| {
                    format!("Video decoder '{}' not found", self.codec_id.ffmpeg_name())
                })?;

            let mut context = Context::from_parameters({
                let mut params = Parameters::new();
                unsafe {
                    (*params.as_mut_ptr()).codec_id = codec.id().into();
                }
                params
            })?;

            // Low-latency decoding: single thread, LOW_DELAY, FAST.
            // Multi-thread decoding buffers a frame per thread.
            unsafe {
                let ptr = context.as_mut_ptr();
                (*ptr).flags |= ffmpeg::ffi::AV_CODEC_FLAG_LOW_DELAY as i32;
                (*ptr).flags2 |= ffmpeg::ffi::AV_CODEC_FLAG2_FAST as i32;
                (*ptr).thread_count = 1;

                if let Some(extradata) = &self.extradata {
                    let padded =
                        extradata.len() + ffmpeg::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
                    let buf = ffmpeg::ffi::av_mallocz(padded) as *mut u8;
                    if !buf.is_null() {
                        std::ptr::copy_nonoverlapping(extradata.as_ptr(), buf, extradata.len());
                        (*ptr).extradata = buf;
                        (*ptr).extradata_size = extradata.len() as i32;
                    }
                }
            }

            let decoder = context
                .decoder()
                .video()
                .context("Failed to open video decoder")?;
            info!(
                "Video decoder opened ({}, extradata: {} bytes)",
                self.codec_id.ffmpeg_name(),
                self.extradata.as_ref().map_or(0, Vec::len)
            );
            self.decoder = Some(decoder);
        }

        Ok(self.decoder.as_mut().unwrap())
    }

    fn decode(&mut self, packet: &VideoPacket) -> Result<Vec<VideoFrame>> {
        let pts = packet.header.pts;

        let mut pkt = ffmpeg::codec::packet::Packet::copy(&packet.data);
        pkt.set_pts(Some(pts as i64));

        let decoder = self.ensure_open()?;
        decoder
            .send_packet(&pkt)
            .context("Failed to send packet to decoder")?;

        let mut raw_frames = Vec::new();
        loop {
            let mut decoded = FfmpegFrame::empty();
            match decoder.receive_frame(&mut decoded) {
                Ok(()) => raw_frames.push(decoded),
                Err(ffmpeg::Error::Other { errno: 11 }) => break, // EAGAIN
                Err(ffmpeg::Error::Eof) => break,
                Err(e) => return Err(anyhow::anyhow!("Decoder error: {:?}", e)),
            }
        }

        raw_frames
            .iter()
            .map(|frame| self.convert_frame(frame, pts))
            .collect()
    }

    /// Convert to tightly packed RGB24. Dimensions come from the frame
    /// itself, not the session metadata: they shrink and swap under device
    /// rotation, and the scaler is rebuilt when they change.
    fn convert_frame(&mut self, frame: &FfmpegFrame, pts: u64) -> Result<VideoFrame> {
        let width = frame.width();
        let height = frame.height();
        let src_format = frame.format();

        let needs_rebuild = match &self.scaler {
            Some(scaler) => scaler.src != (src_format, width, height),
            None => true,
        };
        if needs_rebuild {
            debug!(
                "Building scaler: {:?} {}x{} -> RGB24",
                src_format, width, height
            );
            self.scaler = Some(Scaler {
                context: ScalingContext::get(
                    src_format,
                    width,
                    height,
                    Pixel::RGB24,
                    width,
                    height,
                    Flags::BILINEAR,
                )
                .context("Failed to create scaling context")?,
                src: (src_format, width, height),
            });
        }

        let mut rgb = FfmpegFrame::empty();
        self.scaler
            .as_mut()
            .unwrap()
            .context
            .run(frame, &mut rgb)
            .context("Failed to convert frame")?;

        // Deep-copy row by row; the frame's stride may exceed width * 3
        let stride = rgb.stride(0);
        let row_len = width as usize * 3;
        let plane = rgb.data(0);
        let mut data = Vec::with_capacity(row_len * height as usize);
        for y in 0..height as usize {
            let start = y * stride;
            data.extend_from_slice(&plane[start..start + row_len]);
        }

        Ok(VideoFrame {
            width,
            height,
            pts,
            data,
        })
    }
}
