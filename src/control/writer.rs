use super::queue::ControlQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Dequeue timeout; bounds how long shutdown can go unnoticed
const DEQUEUE_POLL: Duration = Duration::from_millis(100);

/// Single writer task draining the control queue onto the control socket.
/// When the peer has no control socket, the session builder hands this the
/// video socket's write half instead (best-effort fallback).
pub struct ControlWriter<W> {
    writer: W,
    queue: Arc<ControlQueue>,
    shutdown: watch::Receiver<bool>,
}

impl<W: AsyncWrite + Unpin> ControlWriter<W> {
    pub fn new(writer: W, queue: Arc<ControlQueue>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            writer,
            queue,
            shutdown,
        }
    }

    /// Run until shutdown. A write error is fatal for the session; the
    /// caller observes it through the returned error.
    pub async fn run(mut self) -> std::io::Result<()> {
        info!("Control writer started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let Some(msg) = self.queue.pop(Some(DEQUEUE_POLL)).await else {
                continue;
            };

            let data = msg.serialize();
            debug!(
                "Sending control message {:?} ({} bytes)",
                msg.message_type(),
                data.len()
            );

            if let Err(e) = self.writer.write_all(&data).await {
                error!("Control write failed: {}", e);
                return Err(e);
            }
            if let Err(e) = self.writer.flush().await {
                error!("Control flush failed: {}", e);
                return Err(e);
            }
        }

        info!("Control writer stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::msg::ControlMessage;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_writer_serializes_in_fifo_order() {
        let (tx, mut rx) = tokio::io::duplex(1024);
        let queue = Arc::new(ControlQueue::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        queue.push(ControlMessage::RotateDevice);
        queue.push(ControlMessage::BackOrScreenOn { action: 0 });

        let writer = ControlWriter::new(tx, queue.clone(), shutdown_rx);
        let handle = tokio::spawn(writer.run());

        let mut buf = [0u8; 3];
        rx.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [11, 4, 0]); // ROTATE_DEVICE, then BACK_OR_SCREEN_ON + action

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_writer_error_is_fatal() {
        let (tx, rx) = tokio::io::duplex(1024);
        drop(rx); // writes will fail

        let queue = Arc::new(ControlQueue::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        queue.push(ControlMessage::RotateDevice);

        let writer = ControlWriter::new(tx, queue, shutdown_rx);
        assert!(writer.run().await.is_err());
    }
}
