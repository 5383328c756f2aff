/// Streaming demuxers for the media sockets.
///
/// Both demuxers use a header-first strategy: read exactly 12 bytes, parse
/// the payload size, read exactly that many bytes. No fixed receive buffer
/// is pre-allocated; each payload is read into its own allocation.
pub mod audio;
pub mod video;

pub use audio::{AudioDemuxer, AudioPacket};
pub use video::{ConfigMerger, VideoDemuxer, VideoPacket};

use crate::protocol::ProtocolError;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Depth of the packet queues between demuxer and decoder. Small on
/// purpose: live latency beats completeness.
pub const PACKET_QUEUE_DEPTH: usize = 3;

/// How long a producer blocks on a full packet queue before dropping
pub const QUEUE_PUT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

/// Demuxer errors
#[derive(Error, Debug)]
pub enum DemuxError {
    #[error("incomplete read: expected {expected} bytes, got {actual}")]
    IncompleteRead { expected: usize, actual: usize },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DemuxError>;

/// Receive exactly `size` bytes, looping on short reads. A clean close
/// mid-frame surfaces `IncompleteRead` with the byte counts.
pub async fn recv_exact<R: AsyncRead + Unpin>(reader: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;

    while filled < size {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(DemuxError::IncompleteRead {
                expected: size,
                actual: filled,
            });
        }
        filled += n;
    }

    Ok(buf)
}

/// Shared demuxer counters, updated from the demuxer task and read from
/// anywhere
#[derive(Debug, Default)]
pub struct DemuxStats {
    pub bytes_received: AtomicU64,
    pub packets_parsed: AtomicU64,
    pub parse_errors: AtomicU64,
    pub incomplete_reads: AtomicU64,
    pub bytes_dropped: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemuxStatsSnapshot {
    pub bytes_received: u64,
    pub packets_parsed: u64,
    pub parse_errors: u64,
    pub incomplete_reads: u64,
    pub bytes_dropped: u64,
}

impl DemuxStats {
    pub fn snapshot(&self) -> DemuxStatsSnapshot {
        DemuxStatsSnapshot {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_parsed: self.packets_parsed.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            incomplete_reads: self.incomplete_reads.load(Ordering::Relaxed),
            bytes_dropped: self.bytes_dropped.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn add(&self, counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_recv_exact_reassembles_fragmented_stream() {
        let (mut tx, mut rx) = tokio::io::duplex(16);
        let payload: Vec<u8> = (0u8..200).collect();

        let writer = tokio::spawn(async move {
            // Deliver one byte at a time to force short reads
            for byte in payload {
                tx.write_all(&[byte]).await.unwrap();
                tx.flush().await.unwrap();
            }
        });

        let received = recv_exact(&mut rx, 200).await.unwrap();
        assert_eq!(received, (0u8..200).collect::<Vec<u8>>());
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_recv_exact_reports_truncation() {
        let (mut tx, mut rx) = tokio::io::duplex(16);
        tx.write_all(&[1, 2, 3]).await.unwrap();
        drop(tx);

        match recv_exact(&mut rx, 10).await {
            Err(DemuxError::IncompleteRead { expected, actual }) => {
                assert_eq!(expected, 10);
                assert_eq!(actual, 3);
            }
            other => panic!("expected IncompleteRead, got {:?}", other),
        }
    }
}
