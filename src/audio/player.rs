use super::{AudioSink, PcmChunk};
use anyhow::{Context, Result};
use cpal::{
    SampleRate, StreamConfig,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, mpsc};
use tracing::{debug, error, info, warn};

/// Playback buffer cap; latest-wins beyond this to bound latency
const BUFFER_LIMIT_MS: usize = 250;

struct SampleBuffer {
    deque: VecDeque<f32>,
    max_samples: usize,
}

impl SampleBuffer {
    fn push(&mut self, samples: &[f32]) {
        self.deque.extend(samples);
        while self.deque.len() > self.max_samples {
            self.deque.pop_front();
        }
    }

    fn pop_into(&mut self, out: &mut [f32]) {
        for slot in out.iter_mut() {
            *slot = self.deque.pop_front().unwrap_or(0.0);
        }
    }
}

enum PlayerCommand {
    Configure { sample_rate: u32, channels: u16 },
    Shutdown,
}

/// Live audio playback through the default output device.
///
/// cpal streams are not `Send`, so the stream lives on a dedicated thread;
/// this handle only feeds the shared sample buffer. Cloning yields another
/// handle onto the same output, which is how the recording tee keeps
/// playback alive.
pub struct AudioPlayer {
    buffer: Arc<Mutex<SampleBuffer>>,
    control_tx: mpsc::Sender<PlayerCommand>,
    configured: Option<(u32, u16)>,
    volume: f32,
}

impl Clone for AudioPlayer {
    fn clone(&self) -> Self {
        Self {
            buffer: self.buffer.clone(),
            control_tx: self.control_tx.clone(),
            configured: self.configured,
            volume: self.volume,
        }
    }
}

impl AudioPlayer {
    pub fn new() -> Result<Self> {
        let buffer = Arc::new(Mutex::new(SampleBuffer {
            deque: VecDeque::new(),
            max_samples: 48_000 / 2, // placeholder until configured
        }));
        let (control_tx, control_rx) = mpsc::channel();

        {
            let buffer = buffer.clone();
            std::thread::Builder::new()
                .name("audio-player".to_string())
                .spawn(move || Self::stream_thread(buffer, control_rx))
                .context("Failed to spawn audio player thread")?;
        }

        Ok(Self {
            buffer,
            control_tx,
            configured: None,
            volume: 1.0,
        })
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    /// Owns the cpal device and stream; rebuilds on configuration changes
    fn stream_thread(buffer: Arc<Mutex<SampleBuffer>>, control_rx: mpsc::Receiver<PlayerCommand>) {
        let mut stream = None;

        while let Ok(command) = control_rx.recv() {
            match command {
                PlayerCommand::Configure {
                    sample_rate,
                    channels,
                } => {
                    drop(stream.take());
                    match Self::build_stream(&buffer, sample_rate, channels) {
                        Ok(new_stream) => stream = Some(new_stream),
                        Err(e) => warn!("Audio output unavailable: {}", e),
                    }
                }
                PlayerCommand::Shutdown => break,
            }
        }

        drop(stream);
        debug!("Audio player thread ended");
    }

    fn build_stream(
        buffer: &Arc<Mutex<SampleBuffer>>,
        sample_rate: u32,
        channels: u16,
    ) -> Result<cpal::Stream> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .context("No audio output device available")?;
        info!(
            "Using audio device: {} ({} Hz, {} ch)",
            device.name().unwrap_or_else(|_| "Unknown".to_string()),
            sample_rate,
            channels
        );

        {
            let mut locked = buffer.lock().unwrap();
            locked.max_samples =
                sample_rate as usize * channels as usize * BUFFER_LIMIT_MS / 1000;
        }

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let callback_buffer = buffer.clone();
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    callback_buffer.lock().unwrap().pop_into(data);
                },
                |err| error!("Audio stream error: {}", err),
                None,
            )
            .context("Failed to build audio output stream")?;

        stream.play().context("Failed to start audio stream")?;
        Ok(stream)
    }
}

impl AudioSink for AudioPlayer {
    fn push(&mut self, chunk: &PcmChunk) {
        let params = (chunk.sample_rate, chunk.channels);
        if self.configured != Some(params) {
            self.configured = Some(params);
            let _ = self.control_tx.send(PlayerCommand::Configure {
                sample_rate: chunk.sample_rate,
                channels: chunk.channels,
            });
        }

        let mut buffer = self.buffer.lock().unwrap();
        if self.volume == 1.0 {
            buffer.push(&chunk.samples);
        } else {
            let scaled: Vec<f32> = chunk.samples.iter().map(|s| s * self.volume).collect();
            buffer.push(&scaled);
        }
    }

    fn close(&mut self) {
        let _ = self.control_tx.send(PlayerCommand::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_buffer_latest_wins() {
        let mut buffer = SampleBuffer {
            deque: VecDeque::new(),
            max_samples: 4,
        };
        buffer.push(&[1.0, 2.0, 3.0]);
        buffer.push(&[4.0, 5.0, 6.0]);
        // Oldest samples were evicted
        assert_eq!(buffer.deque.len(), 4);
        assert_eq!(buffer.deque[0], 3.0);
    }

    #[test]
    fn test_sample_buffer_pads_silence() {
        let mut buffer = SampleBuffer {
            deque: VecDeque::from(vec![1.0]),
            max_samples: 16,
        };
        let mut out = [9.0f32; 4];
        buffer.pop_into(&mut out);
        assert_eq!(out, [1.0, 0.0, 0.0, 0.0]);
    }
}
