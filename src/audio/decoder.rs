use super::{PcmChunk, SinkSlot};
use crate::demux::AudioPacket;
use crate::protocol::AudioCodecId;
use anyhow::{Context as AnyhowContext, Result};
use ffmpeg::codec::Context;
use ffmpeg::codec::decoder::Audio as FfmpegAudioDecoder;
use ffmpeg::codec::parameters::Parameters;
use ffmpeg::util::frame::audio::Audio as FfmpegFrame;
use ffmpeg_next as ffmpeg;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

/// Sample rate and channel count detected from the stream. The 48 kHz
/// stereo values are placeholders until the first frame decodes.
#[derive(Debug)]
pub struct AudioStreamInfo {
    sample_rate: AtomicU32,
    channels: AtomicU32,
}

impl Default for AudioStreamInfo {
    fn default() -> Self {
        Self {
            sample_rate: AtomicU32::new(0),
            channels: AtomicU32::new(0),
        }
    }
}

impl AudioStreamInfo {
    pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
    pub const DEFAULT_CHANNELS: u16 = 2;

    pub fn record(&self, sample_rate: u32, channels: u16) {
        self.sample_rate.store(sample_rate, Ordering::Relaxed);
        self.channels.store(channels as u32, Ordering::Relaxed);
    }

    pub fn sample_rate(&self) -> u32 {
        match self.sample_rate.load(Ordering::Relaxed) {
            0 => Self::DEFAULT_SAMPLE_RATE,
            rate => rate,
        }
    }

    pub fn channels(&self) -> u16 {
        match self.channels.load(Ordering::Relaxed) {
            0 => Self::DEFAULT_CHANNELS,
            channels => channels as u16,
        }
    }

    pub fn is_detected(&self) -> bool {
        self.sample_rate.load(Ordering::Relaxed) != 0
    }
}

/// Audio decoder task. Waits for the demuxer to report the stream's codec
/// tag, then decodes packets into interleaved f32 PCM for the sink.
/// Decode errors skip the packet silently.
pub struct AudioDecoder {
    codec_rx: oneshot::Receiver<AudioCodecId>,
    packet_rx: mpsc::Receiver<AudioPacket>,
    sink: SinkSlot,
    stream_info: Arc<AudioStreamInfo>,
    paused: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
}

impl AudioDecoder {
    pub fn new(
        codec_rx: oneshot::Receiver<AudioCodecId>,
        packet_rx: mpsc::Receiver<AudioPacket>,
        sink: SinkSlot,
        stream_info: Arc<AudioStreamInfo>,
        paused: watch::Receiver<bool>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            codec_rx,
            packet_rx,
            sink,
            stream_info,
            paused,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let codec = tokio::select! {
            _ = self.shutdown.changed() => return Ok(()),
            codec = &mut self.codec_rx => match codec {
                Ok(codec) => codec,
                Err(_) => return Ok(()), // demuxer never got a tag
            },
        };

        let mut inner = DecoderInner::new(codec)?;
        info!("Audio decoder started ({})", codec.ffmpeg_name());

        loop {
            if *self.shutdown.borrow() {
                break;
            }

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
                    None => break,
                },
            };

            if packet.is_config {
                inner.apply_extradata(&packet.data);
                continue;
            }

            match inner.decode(&packet) {
                Ok(chunks) => {
                    for chunk in chunks {
                        if !self.stream_info.is_detected() {
                            info!(
                                "Audio stream: {} Hz, {} channel(s)",
                                chunk.sample_rate, chunk.channels
                            );
                        }
                        self.stream_info.record(chunk.sample_rate, chunk.channels);
                        if let Some(sink) = self.sink.lock().as_mut() {
                            sink.push(&chunk);
                        }
                    }
                }
                Err(e) => debug!("Audio decode error, skipping packet: {}", e),
            }
        }

        info!("Audio decoder stopped");
        Ok(())
    }
}

enum DecoderInner {
    /// Raw PCM needs no codec: s16le interleaved at the default rate
    Raw,
    Ffmpeg {
        codec: AudioCodecId,
        decoder: Option<FfmpegAudioDecoder>,
        extradata: Option<Vec<u8>>,
    },
}

impl DecoderInner {
    fn new(codec: AudioCodecId) -> Result<Self> {
        if codec == AudioCodecId::Raw {
            return Ok(DecoderInner::Raw);
        }

        ffmpeg::init().context("Failed to initialize FFmpeg")?;
        ffmpeg::codec::decoder::find_by_name(codec.ffmpeg_name())
            .with_context(|| format!("Audio decoder '{}' not found", codec.ffmpeg_name()))?;

        Ok(DecoderInner::Ffmpeg {
            codec,
            decoder: None,
            extradata: None,
        })
    }

    fn apply_extradata(&mut self, data: &[u8]) {
        if let DecoderInner::Ffmpeg { extradata, .. } = self {
            if extradata.is_none() && !data.is_empty() {
                info!("Audio codec extradata captured: {} bytes", data.len());
                *extradata = Some(data.to_vec());
            }
        }
    }

    fn decode(&mut self, packet: &AudioPacket) -> Result<Vec<PcmChunk>> {
        match self {
            DecoderInner::Raw => Ok(vec![decode_raw(packet)]),
            DecoderInner::Ffmpeg {
                codec,
                decoder,
                extradata,
            } => {
                if decoder.is_none() {
                    *decoder = Some(open_decoder(*codec, extradata.as_deref())?);
                }
                decode_ffmpeg(decoder.as_mut().unwrap(), packet)
            }
        }
    }
}

/// Raw stream: s16le stereo at the default sample rate
fn decode_raw(packet: &AudioPacket) -> PcmChunk {
    let samples = packet
        .data
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect();

    PcmChunk {
        pts: packet.pts,
        samples,
        sample_rate: AudioStreamInfo::DEFAULT_SAMPLE_RATE,
        channels: AudioStreamInfo::DEFAULT_CHANNELS,
    }
}

fn open_decoder(codec: AudioCodecId, extradata: Option<&[u8]>) -> Result<FfmpegAudioDecoder> {
    let ffmpeg_codec = ffmpeg::codec::decoder::find_by_name(codec.ffmpeg_name())
        .with_context(|| format!("Audio decoder '{}' not found", codec.ffmpeg_name()))?;

    let mut context = Context::from_parameters({
        let mut params = Parameters::new();
        unsafe {
            (*params.as_mut_ptr()).codec_id = ffmpeg_codec.id().into();
        }
        params
    })?;

    unsafe {
        let ptr = context.as_mut_ptr();
        if let Some(extradata) = extradata {
            let padded = extradata.len() + ffmpeg::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
            let buf = ffmpeg::ffi::av_mallocz(padded) as *mut u8;
            if !buf.is_null() {
                std::ptr::copy_nonoverlapping(extradata.as_ptr(), buf, extradata.len());
                (*ptr).extradata = buf;
                (*ptr).extradata_size = extradata.len() as i32;
            }
        }
    }

    let opened = context
        .decoder()
        .audio()
        .context("Failed to open audio decoder")?;
    info!(
        "Audio decoder opened ({}, extradata: {} bytes)",
        codec.ffmpeg_name(),
        extradata.map_or(0, <[u8]>::len)
    );
    Ok(opened)
}

fn decode_ffmpeg(decoder: &mut FfmpegAudioDecoder, packet: &AudioPacket) -> Result<Vec<PcmChunk>> {
    let mut pkt = ffmpeg::codec::packet::Packet::copy(&packet.data);
    pkt.set_pts(Some(packet.pts as i64));

    decoder
        .send_packet(&pkt)
        .context("Failed to send packet to audio decoder")?;

    let mut chunks = Vec::new();
    loop {
        let mut frame = FfmpegFrame::empty();
        match decoder.receive_frame(&mut frame) {
            Ok(()) => chunks.push(convert_frame(&frame, packet.pts)?),
            Err(ffmpeg::Error::Other { errno: 11 }) => break, // EAGAIN
            Err(ffmpeg::Error::Eof) => break,
            Err(e) => return Err(anyhow::anyhow!("Audio decoder error: {:?}", e)),
        }
    }

    Ok(chunks)
}

/// Interleave a decoded frame into f32 samples
fn convert_frame(frame: &FfmpegFrame, pts: u64) -> Result<PcmChunk> {
    use ffmpeg::format::Sample;
    use ffmpeg::format::sample::Type;

    let sample_count = frame.samples();
    let channels = frame.channels() as usize;
    let total = sample_count * channels;
    let mut samples = Vec::with_capacity(total);

    match frame.format() {
        Sample::F32(Type::Packed) => {
            let data = frame.data(0);
            for i in 0..total {
                let offset = i * 4;
                samples.push(f32::from_ne_bytes(
                    data[offset..offset + 4].try_into().unwrap(),
                ));
            }
        }
        Sample::F32(Type::Planar) => {
            let planes: Vec<&[u8]> = (0..channels).map(|c| frame.data(c)).collect();
            for i in 0..sample_count {
                for plane in &planes {
                    let offset = i * 4;
                    samples.push(f32::from_ne_bytes(
                        plane[offset..offset + 4].try_into().unwrap(),
                    ));
                }
            }
        }
        Sample::I16(Type::Packed) => {
            let data = frame.data(0);
            for i in 0..total {
                let offset = i * 2;
                let value = i16::from_ne_bytes(data[offset..offset + 2].try_into().unwrap());
                samples.push(value as f32 / 32768.0);
            }
        }
        Sample::I16(Type::Planar) => {
            let planes: Vec<&[u8]> = (0..channels).map(|c| frame.data(c)).collect();
            for i in 0..sample_count {
                for plane in &planes {
                    let offset = i * 2;
                    let value = i16::from_ne_bytes(plane[offset..offset + 2].try_into().unwrap());
                    samples.push(value as f32 / 32768.0);
                }
            }
        }
        other => {
            return Err(anyhow::anyhow!("Unsupported audio format: {:?}", other));
        }
    }

    Ok(PcmChunk {
        pts,
        samples,
        sample_rate: frame.rate(),
        channels: channels as u16,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_raw_pcm_conversion() {
        let mut data = Vec::new();
        data.extend_from_slice(&0i16.to_le_bytes());
        data.extend_from_slice(&16384i16.to_le_bytes());
        data.extend_from_slice(&(-32768i16).to_le_bytes());
        data.extend_from_slice(&32767i16.to_le_bytes());

        let chunk = decode_raw(&AudioPacket {
            pts: 42,
            is_config: false,
            data: Bytes::from(data),
        });

        assert_eq!(chunk.pts, 42);
        assert_eq!(chunk.sample_rate, 48_000);
        assert_eq!(chunk.channels, 2);
        assert_eq!(chunk.samples.len(), 4);
        assert!((chunk.samples[0] - 0.0).abs() < f32::EPSILON);
        assert!((chunk.samples[1] - 0.5).abs() < 1e-4);
        assert!((chunk.samples[2] + 1.0).abs() < f32::EPSILON);
        assert!(chunk.samples[3] < 1.0);
    }

    #[test]
    fn test_stream_info_defaults_until_detected() {
        let info = AudioStreamInfo::default();
        assert!(!info.is_detected());
        assert_eq!(info.sample_rate(), 48_000);
        assert_eq!(info.channels(), 2);

        info.record(44_100, 1);
        assert!(info.is_detected());
        assert_eq!(info.sample_rate(), 44_100);
        assert_eq!(info.channels(), 1);
    }
}
