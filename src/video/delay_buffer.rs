use parking_lot::Mutex;

/// A decoded frame: tightly packed RGB24
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub pts: u64,
    pub data: Vec<u8>,
}

struct Slot {
    pending: Option<VideoFrame>,
    consumed: bool,
}

/// Single-slot frame holder with drop-old policy.
///
/// The renderer-facing pipeline holds at most one frame: a push replaces
/// whatever is pending ("latest wins"), and consume hands out a deep copy
/// so the decoder can never overwrite a frame mid-upload.
pub struct DelayBuffer {
    slot: Mutex<Slot>,
}

impl Default for DelayBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayBuffer {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                pending: None,
                consumed: true,
            }),
        }
    }

    /// Replace the pending frame. Returns true when the previous frame was
    /// never consumed, i.e. it has been skipped.
    pub fn push(&self, frame: VideoFrame) -> bool {
        let mut slot = self.slot.lock();
        let previous_skipped = !slot.consumed;
        slot.pending = Some(frame);
        slot.consumed = false;
        previous_skipped
    }

    /// Take a deep copy of the pending frame and mark it consumed.
    /// Returns None when the frame has already been consumed.
    pub fn consume(&self) -> Option<VideoFrame> {
        let mut slot = self.slot.lock();
        if slot.consumed {
            return None;
        }
        slot.consumed = true;
        slot.pending.clone()
    }

    /// Copy the pending frame without consuming it (screenshot path)
    pub fn peek(&self) -> Option<VideoFrame> {
        self.slot.lock().pending.clone()
    }

    pub fn clear(&self) {
        let mut slot = self.slot.lock();
        slot.pending = None;
        slot.consumed = true;
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().pending.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8) -> VideoFrame {
        VideoFrame {
            width: 2,
            height: 2,
            pts: tag as u64,
            data: vec![tag; 12],
        }
    }

    #[test]
    fn test_skip_flag_and_deep_copy() {
        let buffer = DelayBuffer::new();

        // First push: nothing to skip
        assert!(!buffer.push(frame(1)));
        // Second push without a consume: the first frame was skipped
        assert!(buffer.push(frame(2)));

        let consumed = buffer.consume().expect("frame available");
        assert_eq!(consumed, frame(2));

        // Already consumed
        assert!(buffer.consume().is_none());

        // Consumed in time: next push reports no skip
        assert!(!buffer.push(frame(3)));
    }

    #[test]
    fn test_consume_returns_independent_copy() {
        let buffer = DelayBuffer::new();
        buffer.push(frame(7));

        let mut copy = buffer.consume().unwrap();
        copy.data[0] = 0xFF;

        // The pending slot is untouched by mutations of the copy
        assert_eq!(buffer.peek().unwrap().data[0], 7);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let buffer = DelayBuffer::new();
        buffer.push(frame(4));
        assert!(buffer.peek().is_some());
        assert!(buffer.consume().is_some());
    }

    #[test]
    fn test_clear() {
        let buffer = DelayBuffer::new();
        buffer.push(frame(1));
        buffer.clear();
        assert!(buffer.is_empty());
        assert!(buffer.consume().is_none());
    }
}
