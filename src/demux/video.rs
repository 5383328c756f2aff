use super::{DemuxError, DemuxStats, Result, QUEUE_PUT_TIMEOUT, recv_exact};
use crate::protocol::{PacketHeader, VideoCodecId, PACKET_HEADER_SIZE};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// A framed video packet, possibly carrying merged codec config
#[derive(Debug, Clone)]
pub struct VideoPacket {
    pub header: PacketHeader,
    pub data: Bytes,
    pub codec: VideoCodecId,
}

/// Merges config packets (SPS/PPS for H.264, VPS/SPS/PPS for H.265) into
/// the following media packet. The config packet itself is still emitted;
/// the next non-config packet comes out as `config ∥ media`. AV1 bypasses
/// merging entirely.
#[derive(Debug, Default)]
pub struct ConfigMerger {
    pending: Option<Bytes>,
}

impl ConfigMerger {
    pub fn merge(&mut self, packet: VideoPacket) -> VideoPacket {
        if !packet.codec.needs_config_merge() {
            return packet;
        }

        if packet.header.is_config {
            self.pending = Some(packet.data.clone());
            return packet;
        }

        if let Some(config) = self.pending.take() {
            let mut merged = BytesMut::with_capacity(config.len() + packet.data.len());
            merged.extend_from_slice(&config);
            merged.extend_from_slice(&packet.data);
            return VideoPacket {
                header: packet.header,
                data: merged.freeze(),
                codec: packet.codec,
            };
        }

        packet
    }

    pub fn clear(&mut self) {
        self.pending = None;
    }

    pub fn has_pending_config(&self) -> bool {
        self.pending.is_some()
    }
}

/// Video demuxer task. Exclusive read-owner of the video socket.
pub struct VideoDemuxer<R> {
    reader: R,
    codec: VideoCodecId,
    packet_tx: mpsc::Sender<VideoPacket>,
    paused: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
    stats: Arc<DemuxStats>,
    merger: ConfigMerger,
}

impl<R: AsyncRead + Unpin> VideoDemuxer<R> {
    pub fn new(
        reader: R,
        codec: VideoCodecId,
        packet_tx: mpsc::Sender<VideoPacket>,
        paused: watch::Receiver<bool>,
        shutdown: watch::Receiver<bool>,
        stats: Arc<DemuxStats>,
    ) -> Self {
        Self {
            reader,
            codec,
            packet_tx,
            paused,
            shutdown,
            stats,
            merger: ConfigMerger::default(),
        }
    }

    /// Run until shutdown or a fatal stream error. While paused, the
    /// socket keeps being drained (the on-device encoder would stall on
    /// TCP back-pressure otherwise) but packets are discarded.
    pub async fn run(mut self) -> Result<()> {
        info!("Video demuxer started ({:?})", self.codec);

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let packet = tokio::select! {
                _ = self.shutdown.changed() => break,
                result = Self::recv_packet(&mut self.reader, self.codec, &self.stats) => {
                    match result {
                        Ok(packet) => packet,
                        Err(e @ DemuxError::IncompleteRead { .. }) => {
                            self.stats.add(&self.stats.incomplete_reads, 1);
                            warn!("Video stream truncated: {}", e);
                            return Err(e);
                        }
                        Err(e) => {
                            self.stats.add(&self.stats.parse_errors, 1);
                            warn!("Video demuxer error: {}", e);
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

            let packet = self.merger.merge(packet);

            if packet.header.is_config {
                info!("Config packet received: {} bytes", packet.data.len());
            } else if packet.header.is_key_frame {
                debug!(
                    "Key frame: pts={}, size={} bytes",
                    packet.header.pts,
                    packet.data.len()
                );
            }

            let dropped_len = packet.data.len() as u64;
            match tokio::time::timeout(QUEUE_PUT_TIMEOUT, self.packet_tx.send(packet)).await {
                Ok(Ok(())) => {
                    self.stats.add(&self.stats.packets_parsed, 1);
                }
                Ok(Err(_)) => {
                    debug!("Video packet queue closed, stopping demuxer");
                    break;
                }
                Err(_) => {
                    warn!("Video packet queue full, dropping packet");
                    self.stats.add(&self.stats.bytes_dropped, dropped_len);
                }
            }
        }

        info!("Video demuxer stopped");
        Ok(())
    }

    async fn recv_packet(
        reader: &mut R,
        codec: VideoCodecId,
        stats: &DemuxStats,
    ) -> Result<VideoPacket> {
        let header_bytes = recv_exact(reader, PACKET_HEADER_SIZE).await?;
        stats.add(&stats.bytes_received, PACKET_HEADER_SIZE as u64);

        let header = PacketHeader::parse(header_bytes.as_slice().try_into().unwrap())?;

        let payload = recv_exact(reader, header.size as usize).await?;
        stats.add(&stats.bytes_received, header.size as u64);

        Ok(VideoPacket {
            header,
            data: Bytes::from(payload),
            codec,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn media_packet(codec: VideoCodecId, data: &[u8], is_config: bool) -> VideoPacket {
        VideoPacket {
            header: PacketHeader {
                pts: 0,
                is_config,
                is_key_frame: false,
                size: data.len() as u32,
            },
            data: Bytes::copy_from_slice(data),
            codec,
        }
    }

    #[test]
    fn test_config_merge_sequence() {
        // C, M1, M2 must come out as [C, C || M1, M2]
        let mut merger = ConfigMerger::default();

        let config = merger.merge(media_packet(VideoCodecId::H264, b"CFG", true));
        assert_eq!(&config.data[..], b"CFG");
        assert!(merger.has_pending_config());

        let first = merger.merge(media_packet(VideoCodecId::H264, b"M1", false));
        assert_eq!(&first.data[..], b"CFGM1");
        assert!(!merger.has_pending_config());

        let second = merger.merge(media_packet(VideoCodecId::H264, b"M2", false));
        assert_eq!(&second.data[..], b"M2");
    }

    #[test]
    fn test_config_merge_bypassed_for_av1() {
        let mut merger = ConfigMerger::default();
        merger.merge(media_packet(VideoCodecId::Av1, b"CFG", true));
        assert!(!merger.has_pending_config());

        let media = merger.merge(media_packet(VideoCodecId::Av1, b"M1", false));
        assert_eq!(&media.data[..], b"M1");
    }

    fn wire_packet(pts: u64, is_config: bool, payload: &[u8]) -> Vec<u8> {
        let header = PacketHeader {
            pts,
            is_config,
            is_key_frame: false,
            size: payload.len() as u32,
        };
        let mut out = header.to_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    async fn run_demuxer_over(
        wire: Vec<u8>,
        chunk_size: usize,
    ) -> (Vec<VideoPacket>, Arc<DemuxStats>) {
        let (mut tx, rx) = tokio::io::duplex(64);
        let (packet_tx, mut packet_rx) = mpsc::channel(16);
        let (_pause_tx, pause_rx) = watch::channel(false);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(DemuxStats::default());

        let demuxer = VideoDemuxer::new(
            rx,
            VideoCodecId::H264,
            packet_tx,
            pause_rx,
            shutdown_rx,
            stats.clone(),
        );
        let handle = tokio::spawn(demuxer.run());

        for chunk in wire.chunks(chunk_size) {
            tx.write_all(chunk).await.unwrap();
            tx.flush().await.unwrap();
        }
        drop(tx);

        let mut packets = Vec::new();
        while let Some(packet) = packet_rx.recv().await {
            packets.push(packet);
        }
        let _ = handle.await.unwrap();
        (packets, stats)
    }

    #[tokio::test]
    async fn test_fragmented_delivery_matches_whole_packets() {
        // Same byte stream, delivered in 1-byte chunks vs all at once,
        // must produce identical packets.
        let mut wire = wire_packet(0, true, b"\x00\x00\x00\x01CFG");
        wire.extend(wire_packet(1000, false, b"\x00\x00\x00\x01FRAME"));

        let (whole, _) = run_demuxer_over(wire.clone(), wire.len()).await;
        let (fragmented, stats) = run_demuxer_over(wire, 1).await;

        assert_eq!(whole.len(), fragmented.len());
        for (a, b) in whole.iter().zip(fragmented.iter()) {
            assert_eq!(a.header, b.header);
            assert_eq!(a.data, b.data);
        }
        // Second media packet got the config prepended
        assert_eq!(&fragmented[1].data[..8], b"\x00\x00\x00\x01CFG\x00");
        assert_eq!(stats.snapshot().packets_parsed, 2);
    }

    #[tokio::test]
    async fn test_truncated_stream_counts_incomplete_read() {
        let mut wire = wire_packet(0, false, b"FULL");
        wire.extend_from_slice(&[0u8; 5]); // half a header, then EOF

        let (packets, stats) = run_demuxer_over(wire, 64).await;
        assert_eq!(packets.len(), 1);
        assert_eq!(stats.snapshot().incomplete_reads, 1);
    }

    #[tokio::test]
    async fn test_paused_demuxer_drains_but_drops() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let (packet_tx, mut packet_rx) = mpsc::channel(16);
        let (pause_tx, pause_rx) = watch::channel(true);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(DemuxStats::default());

        let demuxer = VideoDemuxer::new(
            rx,
            VideoCodecId::H264,
            packet_tx,
            pause_rx,
            shutdown_rx,
            stats.clone(),
        );
        let handle = tokio::spawn(demuxer.run());

        tx.write_all(&wire_packet(0, false, b"DISCARDED")).await.unwrap();
        tx.flush().await.unwrap();

        // The paused demuxer keeps reading; the packet never reaches the queue
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(packet_rx.try_recv().is_err());
        assert!(stats.snapshot().bytes_dropped > 0);

        // Resume and verify parsing picks back up
        pause_tx.send(false).unwrap();
        tx.write_all(&wire_packet(1, false, b"KEPT")).await.unwrap();
        drop(tx);

        let packet = packet_rx.recv().await.expect("packet after resume");
        assert_eq!(&packet.data[..], b"KEPT");
        let _ = handle.await.unwrap();
    }
}
