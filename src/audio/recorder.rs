use super::{AudioSink, PcmChunk};
use anyhow::{Context as AnyhowContext, Result};
use ffmpeg_next as ffmpeg;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Formats the finished WAV can be transcoded into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertFormat {
    Opus,
    Mp3,
}

impl ConvertFormat {
    /// Derive from an explicit request or the target file extension
    pub fn for_target(requested: Option<ConvertFormat>, path: &Path) -> Option<ConvertFormat> {
        requested.or_else(|| {
            match path
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_ascii_lowercase)
                .as_deref()
            {
                Some("opus") => Some(ConvertFormat::Opus),
                Some("mp3") => Some(ConvertFormat::Mp3),
                _ => None,
            }
        })
    }
}

struct RecorderState {
    writer: Option<hound::WavWriter<std::io::BufWriter<std::fs::File>>>,
    wav_path: PathBuf,
    final_path: PathBuf,
    convert_to: Option<ConvertFormat>,
    max_duration: Option<Duration>,
    started: Option<Instant>,
    finished: bool,
}

impl RecorderState {
    /// The WAV header is written on the first chunk, once the stream's
    /// real sample rate and channel count are known
    fn ensure_open(&mut self, chunk: &PcmChunk) -> Result<()> {
        if self.writer.is_some() {
            return Ok(());
        }

        if let Some(parent) = self.wav_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let spec = hound::WavSpec {
            channels: chunk.channels,
            sample_rate: chunk.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        info!(
            "Recording audio to {} ({} Hz, {} ch, float32)",
            self.wav_path.display(),
            spec.sample_rate,
            spec.channels
        );

        self.writer = Some(hound::WavWriter::create(&self.wav_path, spec)?);
        self.started = Some(Instant::now());
        Ok(())
    }

    fn write(&mut self, chunk: &PcmChunk) -> Result<()> {
        if self.finished {
            return Ok(());
        }

        if let (Some(max), Some(started)) = (self.max_duration, self.started) {
            if started.elapsed() >= max {
                info!("Max recording duration reached, closing recorder");
                self.finish()?;
                return Ok(());
            }
        }

        self.ensure_open(chunk)?;
        let writer = self.writer.as_mut().unwrap();
        for sample in &chunk.samples {
            writer.write_sample(*sample)?;
        }
        Ok(())
    }

    /// Finalize the WAV (hound patches the RIFF and data sizes) and run
    /// the optional transcode
    fn finish(&mut self) -> Result<PathBuf> {
        if self.finished {
            return Ok(self.final_path.clone());
        }
        self.finished = true;

        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
        } else {
            warn!("Recorder closed before any audio arrived");
            return Ok(self.final_path.clone());
        }

        if let Some(format) = self.convert_to {
            transcode_wav(&self.wav_path, &self.final_path, format)?;
            if let Err(e) = std::fs::remove_file(&self.wav_path) {
                debug!("Could not remove temp WAV: {}", e);
            }
        }

        info!("Recording saved: {}", self.final_path.display());
        Ok(self.final_path.clone())
    }

    fn duration(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or(Duration::ZERO)
    }
}

/// WAV recorder sink. The actual state is shared with a `RecorderHandle`
/// so the session can stop the recording while the sink sits inside the
/// decoder's tee.
pub struct WavRecorder {
    state: Arc<Mutex<RecorderState>>,
}

/// Control handle for an in-flight recording
#[derive(Clone)]
pub struct RecorderHandle {
    state: Arc<Mutex<RecorderState>>,
}

impl WavRecorder {
    /// Create a recorder targeting `path`. When `convert_to` resolves to a
    /// compressed format the samples go to a temp `.tmp.wav` next to the
    /// target, transcoded on finish.
    pub fn create(
        path: PathBuf,
        max_duration: Option<Duration>,
        convert_to: Option<ConvertFormat>,
    ) -> (Self, RecorderHandle) {
        let convert_to = ConvertFormat::for_target(convert_to, &path);
        let wav_path = if convert_to.is_some() {
            path.with_extension("tmp.wav")
        } else {
            path.clone()
        };

        let state = Arc::new(Mutex::new(RecorderState {
            writer: None,
            wav_path,
            final_path: path,
            convert_to,
            max_duration,
            started: None,
            finished: false,
        }));

        (
            Self {
                state: state.clone(),
            },
            RecorderHandle { state },
        )
    }
}

impl AudioSink for WavRecorder {
    fn push(&mut self, chunk: &PcmChunk) {
        if let Err(e) = self.state.lock().write(chunk) {
            warn!("Audio recorder write failed: {}", e);
        }
    }

    fn close(&mut self) {
        if let Err(e) = self.state.lock().finish() {
            warn!("Audio recorder finalize failed: {}", e);
        }
    }
}

impl RecorderHandle {
    pub fn is_recording(&self) -> bool {
        !self.state.lock().finished
    }

    pub fn duration(&self) -> Duration {
        self.state.lock().duration()
    }

    /// Stop the recording and return the final file path. Runs the
    /// WAV to Opus/MP3 transcode when configured, so call it off the hot
    /// path.
    pub fn finalize(&self) -> Result<PathBuf> {
        self.state.lock().finish()
    }
}

/// Duplicates decoded audio to two sinks. The live player comes first:
/// playback is latency-sensitive, the recorder is not.
pub struct TeeSink {
    primary: Box<dyn AudioSink>,
    secondary: Box<dyn AudioSink>,
}

impl TeeSink {
    pub fn new(primary: Box<dyn AudioSink>, secondary: Box<dyn AudioSink>) -> Self {
        Self { primary, secondary }
    }
}

impl AudioSink for TeeSink {
    fn push(&mut self, chunk: &PcmChunk) {
        self.primary.push(chunk);
        self.secondary.push(chunk);
    }

    fn close(&mut self) {
        self.primary.close();
        self.secondary.close();
    }
}

fn find_encoder(format: ConvertFormat) -> Result<ffmpeg::Codec> {
    let names: &[&str] = match format {
        ConvertFormat::Opus => &["libopus", "opus"],
        ConvertFormat::Mp3 => &["libmp3lame", "libshine"],
    };
    names
        .iter()
        .find_map(|name| ffmpeg::encoder::find_by_name(name))
        .with_context(|| format!("No encoder available for {:?}", format))
}

/// Pick a sample format the encoder supports, preferring packed f32 so the
/// WAV samples need the least massaging
fn pick_sample_format(codec: &ffmpeg::Codec) -> ffmpeg::format::Sample {
    use ffmpeg::format::Sample;
    use ffmpeg::format::sample::Type;

    let supported: Vec<Sample> = codec
        .audio()
        .ok()
        .and_then(|audio| audio.formats().map(|f| f.collect()))
        .unwrap_or_default();

    for preferred in [
        Sample::F32(Type::Packed),
        Sample::F32(Type::Planar),
        Sample::I16(Type::Packed),
        Sample::I16(Type::Planar),
    ] {
        if supported.contains(&preferred) {
            return preferred;
        }
    }
    supported
        .first()
        .copied()
        .unwrap_or(Sample::F32(Type::Packed))
}

fn fill_frame(
    frame: &mut ffmpeg::frame::Audio,
    block: &[f32],
    channels: usize,
    format: ffmpeg::format::Sample,
) {
    use ffmpeg::format::Sample;
    use ffmpeg::format::sample::Type;

    let samples = block.len() / channels;
    match format {
        Sample::F32(Type::Packed) => {
            let data = frame.data_mut(0);
            for (i, value) in block.iter().enumerate() {
                data[i * 4..i * 4 + 4].copy_from_slice(&value.to_ne_bytes());
            }
        }
        Sample::F32(Type::Planar) => {
            for ch in 0..channels {
                let data = frame.data_mut(ch);
                for i in 0..samples {
                    let value = block[i * channels + ch];
                    data[i * 4..i * 4 + 4].copy_from_slice(&value.to_ne_bytes());
                }
            }
        }
        Sample::I16(Type::Packed) => {
            let data = frame.data_mut(0);
            for (i, value) in block.iter().enumerate() {
                let value = (value.clamp(-1.0, 1.0) * 32767.0) as i16;
                data[i * 2..i * 2 + 2].copy_from_slice(&value.to_ne_bytes());
            }
        }
        Sample::I16(Type::Planar) => {
            for ch in 0..channels {
                let data = frame.data_mut(ch);
                for i in 0..samples {
                    let value = (block[i * channels + ch].clamp(-1.0, 1.0) * 32767.0) as i16;
                    data[i * 2..i * 2 + 2].copy_from_slice(&value.to_ne_bytes());
                }
            }
        }
        _ => {}
    }
}

/// Transcode the finished float32 WAV into Opus or MP3. The WAV is our own
/// output, so it is read back with hound and fed straight to the encoder.
pub fn transcode_wav(input: &Path, output: &Path, format: ConvertFormat) -> Result<()> {
    info!(
        "Converting {} -> {} ({:?})",
        input.display(),
        output.display(),
        format
    );
    ffmpeg::init().context("Failed to initialize FFmpeg")?;

    let mut reader = hound::WavReader::open(input).context("Failed to open recorded WAV")?;
    let spec = reader.spec();
    let samples: Vec<f32> = reader
        .samples::<f32>()
        .collect::<std::result::Result<_, _>>()
        .context("Failed to read recorded WAV")?;

    let codec = find_encoder(format)?;
    let sample_format = pick_sample_format(&codec);
    let channel_layout = ffmpeg::ChannelLayout::default(spec.channels as i32);

    let mut octx = ffmpeg::format::output(&output).context("Failed to create output file")?;
    let global_header = octx
        .format()
        .flags()
        .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

    let mut encoder = {
        let ost = octx.add_stream(codec)?;
        let context = ffmpeg::codec::Context::from_parameters(ost.parameters())?;
        let mut encoder = context.encoder().audio()?;
        encoder.set_rate(spec.sample_rate as i32);
        encoder.set_channel_layout(channel_layout);
        encoder.set_format(sample_format);
        encoder.set_bit_rate(128_000);
        encoder.set_time_base(ffmpeg::Rational(1, spec.sample_rate as i32));
        if global_header {
            encoder.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }
        encoder.open_as(codec)?
    };
    octx.stream_mut(0).unwrap().set_parameters(&encoder);
    octx.write_header()?;
    let ost_time_base = octx.stream(0).unwrap().time_base();
    let enc_time_base = ffmpeg::Rational(1, spec.sample_rate as i32);

    let frame_size = match encoder.frame_size() {
        0 => 1024usize,
        n => n as usize,
    };
    let channels = spec.channels as usize;

    let mut pts = 0i64;
    for block in samples.chunks(frame_size * channels) {
        let nb_samples = block.len() / channels;
        if nb_samples == 0 {
            break;
        }
        let mut frame = ffmpeg::frame::Audio::new(sample_format, nb_samples, channel_layout);
        frame.set_rate(spec.sample_rate);
        frame.set_pts(Some(pts));
        fill_frame(&mut frame, block, channels, sample_format);
        pts += nb_samples as i64;

        encoder.send_frame(&frame)?;
        drain_encoder(&mut encoder, &mut octx, enc_time_base, ost_time_base)?;
    }

    encoder.send_eof()?;
    drain_encoder(&mut encoder, &mut octx, enc_time_base, ost_time_base)?;
    octx.write_trailer()?;

    Ok(())
}

fn drain_encoder(
    encoder: &mut ffmpeg::codec::encoder::audio::Encoder,
    octx: &mut ffmpeg::format::context::Output,
    enc_time_base: ffmpeg::Rational,
    ost_time_base: ffmpeg::Rational,
) -> Result<()> {
    let mut packet = ffmpeg::Packet::empty();
    while encoder.receive_packet(&mut packet).is_ok() {
        packet.set_stream(0);
        packet.rescale_ts(enc_time_base, ost_time_base);
        packet.write_interleaved(octx)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(samples: Vec<f32>) -> PcmChunk {
        PcmChunk {
            pts: 0,
            samples,
            sample_rate: 48_000,
            channels: 2,
        }
    }

    #[test]
    fn test_wav_header_is_ieee_float() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.wav");

        let (mut sink, handle) = WavRecorder::create(path.clone(), None, None);
        sink.push(&chunk(vec![0.0, 0.25, -0.25, 1.0]));
        let finished = handle.finalize().unwrap();
        assert_eq!(finished, path);

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[0..4], b"RIFF");
        assert_eq!(&raw[8..12], b"WAVE");
        // fmt chunk: size 16, format code 3 (IEEE float), 2 channels
        assert_eq!(&raw[12..16], b"fmt ");
        assert_eq!(u32::from_le_bytes(raw[16..20].try_into().unwrap()), 16);
        assert_eq!(u16::from_le_bytes(raw[20..22].try_into().unwrap()), 3);
        assert_eq!(u16::from_le_bytes(raw[22..24].try_into().unwrap()), 2);
        assert_eq!(u32::from_le_bytes(raw[24..28].try_into().unwrap()), 48_000);
        // RIFF size patched on finalize
        let riff_size = u32::from_le_bytes(raw[4..8].try_into().unwrap()) as usize;
        assert_eq!(riff_size + 8, raw.len());
    }

    #[test]
    fn test_recorded_samples_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roundtrip.wav");

        let (mut sink, handle) = WavRecorder::create(path.clone(), None, None);
        let samples = vec![0.0f32, 0.5, -0.5, 0.125];
        sink.push(&chunk(samples.clone()));
        handle.finalize().unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        let read: Vec<f32> = reader.samples::<f32>().map(|s| s.unwrap()).collect();
        assert_eq!(read, samples);
    }

    #[test]
    fn test_pushes_after_finalize_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("closed.wav");

        let (mut sink, handle) = WavRecorder::create(path.clone(), None, None);
        sink.push(&chunk(vec![0.1, 0.2]));
        handle.finalize().unwrap();
        assert!(!handle.is_recording());

        sink.push(&chunk(vec![0.3, 0.4]));

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.samples::<f32>().count(), 2);
    }

    #[test]
    fn test_convert_format_from_extension() {
        assert_eq!(
            ConvertFormat::for_target(None, Path::new("out.opus")),
            Some(ConvertFormat::Opus)
        );
        assert_eq!(
            ConvertFormat::for_target(None, Path::new("out.MP3")),
            Some(ConvertFormat::Mp3)
        );
        assert_eq!(ConvertFormat::for_target(None, Path::new("out.wav")), None);
        assert_eq!(
            ConvertFormat::for_target(Some(ConvertFormat::Opus), Path::new("out.wav")),
            Some(ConvertFormat::Opus)
        );
    }

    struct CountingSink(Arc<Mutex<Vec<&'static str>>>, &'static str);

    impl AudioSink for CountingSink {
        fn push(&mut self, _chunk: &PcmChunk) {
            self.0.lock().push(self.1);
        }
    }

    #[test]
    fn test_tee_pushes_player_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tee = TeeSink::new(
            Box::new(CountingSink(order.clone(), "player")),
            Box::new(CountingSink(order.clone(), "recorder")),
        );

        tee.push(&chunk(vec![0.0]));
        tee.push(&chunk(vec![0.0]));

        assert_eq!(*order.lock(), vec!["player", "recorder", "player", "recorder"]);
    }

    #[test]
    fn test_tee_forwards_push_and_close_to_both_sinks() {
        use crate::audio::MockAudioSink;

        let mut player = MockAudioSink::new();
        player.expect_push().times(2).returning(|_| ());
        player.expect_close().times(1).returning(|| ());

        let mut recorder = MockAudioSink::new();
        recorder.expect_push().times(2).returning(|_| ());
        recorder.expect_close().times(1).returning(|| ());

        let mut tee = TeeSink::new(Box::new(player), Box::new(recorder));
        tee.push(&chunk(vec![0.0]));
        tee.push(&chunk(vec![0.5]));
        tee.close();
    }
}
