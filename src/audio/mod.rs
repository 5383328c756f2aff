/// Audio decoding, playback and recording
pub mod decoder;
pub mod player;
pub mod recorder;

pub use decoder::{AudioDecoder, AudioStreamInfo};
pub use player::AudioPlayer;
pub use recorder::{TeeSink, WavRecorder};

use parking_lot::Mutex;
use std::sync::Arc;

/// One decoded PCM chunk: f32 samples interleaved by channel count
#[derive(Debug, Clone)]
pub struct PcmChunk {
    pub pts: u64,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Consumer of decoded audio. Implemented by the live player, the WAV
/// recorder, and the tee that feeds both.
#[cfg_attr(test, mockall::automock)]
pub trait AudioSink: Send {
    fn push(&mut self, chunk: &PcmChunk);

    /// Flush and release resources; further pushes are ignored
    fn close(&mut self) {}
}

/// The decoder's current sink, swappable at runtime (recording wraps the
/// player in a tee and restores it afterwards)
pub type SinkSlot = Arc<Mutex<Option<Box<dyn AudioSink>>>>;

pub fn new_sink_slot() -> SinkSlot {
    Arc::new(Mutex::new(None))
}
