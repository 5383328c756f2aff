use super::{DemuxError, DemuxStats, Result, QUEUE_PUT_TIMEOUT, recv_exact};
use crate::protocol::{AudioCodecId, PacketHeader, PACKET_HEADER_SIZE};
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// A framed audio payload. Audio shares the 12-byte header layout with
/// video; the config flag marks codec extradata (e.g. the OpusHead) and
/// the key-frame bit is meaningless for audio.
#[derive(Debug, Clone)]
pub struct AudioPacket {
    pub pts: u64,
    pub is_config: bool,
    pub data: Bytes,
}

/// Audio demuxer task. Exclusive read-owner of the audio socket.
///
/// The stream opens with a 4-byte codec tag sent exactly once; it is
/// forwarded to the decoder through a oneshot before any packet flows.
pub struct AudioDemuxer<R> {
    reader: R,
    codec_tx: Option<oneshot::Sender<AudioCodecId>>,
    packet_tx: mpsc::Sender<AudioPacket>,
    paused: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
    stats: Arc<DemuxStats>,
}

impl<R: AsyncRead + Unpin> AudioDemuxer<R> {
    pub fn new(
        reader: R,
        codec_tx: oneshot::Sender<AudioCodecId>,
        packet_tx: mpsc::Sender<AudioPacket>,
        paused: watch::Receiver<bool>,
        shutdown: watch::Receiver<bool>,
        stats: Arc<DemuxStats>,
    ) -> Self {
        Self {
            reader,
            codec_tx: Some(codec_tx),
            packet_tx,
            paused,
            shutdown,
            stats,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        info!("Audio demuxer started");

        // The codec tag comes first, once per stream
        let tag = tokio::select! {
            _ = self.shutdown.changed() => return Ok(()),
            result = Self::recv_codec_tag(&mut self.reader, &self.stats) => result?,
        };
        info!("Audio codec: {:?}", tag);
        if let Some(tx) = self.codec_tx.take() {
            let _ = tx.send(tag);
        }

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let packet = tokio::select! {
                _ = self.shutdown.changed() => break,
                result = Self::recv_packet(&mut self.reader, &self.stats) => {
                    match result {
                        Ok(packet) => packet,
                        Err(e @ DemuxError::IncompleteRead { .. }) => {
                            self.stats.add(&self.stats.incomplete_reads, 1);
                            warn!("Audio stream truncated: {}", e);
                            return Err(e);
                        }
                        Err(e) => {
                            self.stats.add(&self.stats.parse_errors, 1);
                            warn!("Audio demuxer error: {}", e);
                            return Err(e);
                        }
                    }
                }
            };

            if *self.paused.borrow() {
                self.stats.add(
                    &self.stats.bytes_dropped,
                    packet.data.len() as u64 + PACKET_HEADER_SIZE as u64,
                );
                continue;
            }

            let dropped_len = packet.data.len() as u64;
            match tokio::time::timeout(QUEUE_PUT_TIMEOUT, self.packet_tx.send(packet)).await {
                Ok(Ok(())) => {
                    self.stats.add(&self.stats.packets_parsed, 1);
                }
                Ok(Err(_)) => {
                    debug!("Audio packet queue closed, stopping demuxer");
                    break;
                }
                Err(_) => {
                    warn!("Audio packet queue full, dropping packet");
                    self.stats.add(&self.stats.bytes_dropped, dropped_len);
                }
            }
        }

        info!("Audio demuxer stopped");
        Ok(())
    }

    async fn recv_codec_tag(reader: &mut R, stats: &DemuxStats) -> Result<AudioCodecId> {
        let raw = recv_exact(reader, 4).await?;
        stats.add(&stats.bytes_received, 4);
        let tag = u32::from_be_bytes(raw.as_slice().try_into().unwrap());
        Ok(AudioCodecId::from_raw(tag)?)
    }

    async fn recv_packet(reader: &mut R, stats: &DemuxStats) -> Result<AudioPacket> {
        let header_bytes = recv_exact(reader, PACKET_HEADER_SIZE).await?;
        stats.add(&stats.bytes_received, PACKET_HEADER_SIZE as u64);

        let header = PacketHeader::parse(header_bytes.as_slice().try_into().unwrap())?;

        let payload = recv_exact(reader, header.size as usize).await?;
        stats.add(&stats.bytes_received, header.size as u64);

        Ok(AudioPacket {
            pts: header.pts,
            is_config: header.is_config,
            data: Bytes::from(payload),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn wire_packet(pts: u64, payload: &[u8]) -> Vec<u8> {
        let header = PacketHeader {
            pts,
            is_config: false,
            is_key_frame: false,
            size: payload.len() as u32,
        };
        let mut out = header.to_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn test_codec_tag_read_once_then_packets() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let (codec_tx, codec_rx) = oneshot::channel();
        let (packet_tx, mut packet_rx) = mpsc::channel(16);
        let (_pause_tx, pause_rx) = watch::channel(false);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(DemuxStats::default());

        let demuxer = AudioDemuxer::new(rx, codec_tx, packet_tx, pause_rx, shutdown_rx, stats);
        let handle = tokio::spawn(demuxer.run());

        tx.write_all(b"opus").await.unwrap();
        tx.write_all(&wire_packet(100, b"AAA")).await.unwrap();
        tx.write_all(&wire_packet(200, b"BBBB")).await.unwrap();
        drop(tx);

        assert_eq!(codec_rx.await.unwrap(), AudioCodecId::Opus);

        let first = packet_rx.recv().await.unwrap();
        assert_eq!(first.pts, 100);
        assert_eq!(&first.data[..], b"AAA");

        let second = packet_rx.recv().await.unwrap();
        assert_eq!(second.pts, 200);
        assert_eq!(&second.data[..], b"BBBB");

        let _ = handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_codec_tag_is_fatal() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let (codec_tx, _codec_rx) = oneshot::channel();
        let (packet_tx, _packet_rx) = mpsc::channel(16);
        let (_pause_tx, pause_rx) = watch::channel(false);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(DemuxStats::default());

        let demuxer = AudioDemuxer::new(rx, codec_tx, packet_tx, pause_rx, shutdown_rx, stats);
        let handle = tokio::spawn(demuxer.run());

        tx.write_all(b"zzzz").await.unwrap();
        drop(tx);

        assert!(handle.await.unwrap().is_err());
    }
}
