use super::msg::ControlMessage;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Soft limit for droppable messages
pub const MAX_DROPPABLE: usize = 60;

/// Slots reserved beyond the soft limit for non-droppable messages
pub const RESERVED_NON_DROPPABLE: usize = 4;

/// Total nominal capacity
pub const QUEUE_CAPACITY: usize = MAX_DROPPABLE + RESERVED_NON_DROPPABLE;

#[derive(Default)]
struct Inner {
    deque: VecDeque<ControlMessage>,
    dropped: u64,
}

/// Bounded priority queue for outgoing control messages.
///
/// Droppable messages are limited to 60 slots; when full, the oldest
/// droppable message is evicted in FIFO order. Non-droppable messages
/// (UHID create/destroy) are always enqueued and may briefly expand the
/// queue past the soft limit.
pub struct ControlQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Default for ControlQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    /// Enqueue a message. Returns false only when a droppable message
    /// cannot be placed because the whole droppable region is occupied by
    /// non-droppable messages (pathological; cannot happen with 4 reserved
    /// slots).
    pub fn push(&self, msg: ControlMessage) -> bool {
        {
            let mut inner = self.inner.lock();

            if msg.is_droppable() {
                while inner.deque.len() >= MAX_DROPPABLE {
                    match inner.deque.iter().position(ControlMessage::is_droppable) {
                        Some(idx) => {
                            inner.deque.remove(idx);
                            inner.dropped += 1;
                            debug!(
                                "Dropped oldest droppable control message (total dropped: {})",
                                inner.dropped
                            );
                        }
                        None => {
                            warn!("Control queue full of non-droppable messages");
                            return false;
                        }
                    }
                }
            }

            inner.deque.push_back(msg);
        }

        self.notify.notify_one();
        true
    }

    /// Remove and return the first message without waiting
    pub fn try_pop(&self) -> Option<ControlMessage> {
        self.inner.lock().deque.pop_front()
    }

    /// Single-consumer dequeue. With a timeout, returns None once it
    /// elapses (the writer uses this to poll for shutdown); without one,
    /// waits until a message arrives.
    pub async fn pop(&self, timeout: Option<Duration>) -> Option<ControlMessage> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            // Register for notification before checking, so a push between
            // the check and the wait is not lost
            let notified = self.notify.notified();

            if let Some(msg) = self.try_pop() {
                return Some(msg);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.try_pop();
                    }
                }
                None => notified.await,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().deque.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().deque.is_empty()
    }

    /// Messages evicted under back-pressure since creation
    pub fn dropped_count(&self) -> u64 {
        self.inner.lock().dropped
    }

    pub fn clear(&self) {
        self.inner.lock().deque.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn droppable(tag: u32) -> ControlMessage {
        ControlMessage::InjectKeycode {
            action: 0,
            keycode: tag,
            repeat: 0,
            metastate: 0,
        }
    }

    fn non_droppable(id: u16) -> ControlMessage {
        ControlMessage::UhidDestroy { id }
    }

    #[test]
    fn test_droppable_overflow_evicts_oldest() {
        let queue = ControlQueue::new();
        for i in 0..MAX_DROPPABLE as u32 {
            assert!(queue.push(droppable(i)));
        }
        assert_eq!(queue.len(), MAX_DROPPABLE);

        // One more: the eldest droppable is gone, the new one is present
        assert!(queue.push(droppable(9999)));
        assert_eq!(queue.len(), MAX_DROPPABLE);
        assert_eq!(queue.dropped_count(), 1);

        match queue.try_pop().unwrap() {
            ControlMessage::InjectKeycode { keycode, .. } => assert_eq!(keycode, 1),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_non_droppable_expands_past_soft_limit() {
        let queue = ControlQueue::new();
        for i in 0..MAX_DROPPABLE as u32 {
            queue.push(droppable(i));
        }

        assert!(queue.push(non_droppable(1)));
        assert_eq!(queue.len(), MAX_DROPPABLE + 1);
        assert_eq!(queue.dropped_count(), 0);
    }

    #[test]
    fn test_droppable_eviction_skips_non_droppables() {
        let queue = ControlQueue::new();
        queue.push(non_droppable(1));
        for i in 0..(MAX_DROPPABLE as u32 - 1) {
            queue.push(droppable(i));
        }
        assert_eq!(queue.len(), MAX_DROPPABLE);

        // The non-droppable head survives; the oldest droppable goes
        assert!(queue.push(droppable(7777)));
        assert!(matches!(
            queue.try_pop().unwrap(),
            ControlMessage::UhidDestroy { id: 1 }
        ));
        match queue.try_pop().unwrap() {
            ControlMessage::InjectKeycode { keycode, .. } => assert_eq!(keycode, 1),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_fifo_order_among_non_dropped() {
        let queue = ControlQueue::new();
        queue.push(droppable(1));
        queue.push(non_droppable(2));
        queue.push(droppable(3));

        assert!(matches!(
            queue.try_pop().unwrap(),
            ControlMessage::InjectKeycode { keycode: 1, .. }
        ));
        assert!(matches!(
            queue.try_pop().unwrap(),
            ControlMessage::UhidDestroy { id: 2 }
        ));
        assert!(matches!(
            queue.try_pop().unwrap(),
            ControlMessage::InjectKeycode { keycode: 3, .. }
        ));
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn test_pop_timeout_returns_none_when_idle() {
        let queue = ControlQueue::new();
        let popped = queue.pop(Some(Duration::from_millis(20))).await;
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = std::sync::Arc::new(ControlQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop(Some(Duration::from_secs(5))).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(droppable(42));

        let msg = waiter.await.unwrap();
        assert!(matches!(
            msg,
            Some(ControlMessage::InjectKeycode { keycode: 42, .. })
        ));
    }
}
