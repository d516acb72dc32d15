use crate::sample::Frame;
use std::sync::Mutex;
use thiserror::Error;

/// A circular buffer with one element of separation between the
/// producer and consumer cursors.
const RING_SLOTS: usize = 3;

/// Raw frame ring failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// The producer caught up with the consumer: the compute thread has
    /// fallen at least a full lap behind a fixed-rate producer. This is
    /// a logic error, not a load condition; the process must abort
    /// rather than overwrite a frame the consumer may be reading.
    #[error("frame ring separation violated: consumer is a full lap behind")]
    SeparationViolated,
    /// No completed frame is waiting.
    #[error("frame ring empty")]
    Empty,
}

struct RingInner {
    slots: [Option<Frame>; RING_SLOTS],
    produce: usize,
    consume: usize,
}

/// The tiny single-producer/single-consumer hand-off between the
/// sampling thread and the compute thread. Holds at most two completed
/// frames; the cursors advance strictly sequentially with wraparound
/// and must never collide.
pub struct FrameRing {
    inner: Mutex<RingInner>,
}

impl Default for FrameRing {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameRing {
    /// An empty ring.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RingInner {
                slots: [None, None, None],
                produce: 0,
                consume: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RingInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hands one completed frame to the consumer side.
    ///
    /// Fails with [`RingError::SeparationViolated`] if advancing the
    /// producer cursor would land on the consumer cursor; callers treat
    /// that as fatal.
    pub fn push(&self, frame: Frame) -> Result<(), RingError> {
        let mut ring = self.lock();
        let next = (ring.produce + 1) % RING_SLOTS;
        if next == ring.consume {
            return Err(RingError::SeparationViolated);
        }
        ring.slots[next] = Some(frame);
        ring.produce = next;
        Ok(())
    }

    /// Takes the next completed frame, if any.
    pub fn pop(&self) -> Result<Frame, RingError> {
        let mut ring = self.lock();
        if ring.consume == ring.produce {
            return Err(RingError::Empty);
        }
        let next = (ring.consume + 1) % RING_SLOTS;
        let frame = ring.slots[next].take().ok_or(RingError::Empty)?;
        ring.consume = next;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::{FrameRing, RingError};
    use crate::sample::Frame;

    fn frame(tag: &str) -> Frame {
        Frame::begin(tag.to_string(), 1000)
    }

    #[test]
    fn hands_frames_through_in_order() {
        let ring = FrameRing::new();
        assert_eq!(ring.pop().err(), Some(RingError::Empty));
        ring.push(frame("a")).unwrap();
        ring.push(frame("b")).unwrap();
        assert_eq!(ring.pop().unwrap().iface, "a");
        assert_eq!(ring.pop().unwrap().iface, "b");
        assert_eq!(ring.pop().err(), Some(RingError::Empty));
    }

    #[test]
    fn separation_violation_is_reported_not_overwritten() {
        let ring = FrameRing::new();
        ring.push(frame("a")).unwrap();
        ring.push(frame("b")).unwrap();
        // Third push would collide with the consumer cursor.
        assert_eq!(ring.push(frame("c")).err(), Some(RingError::SeparationViolated));
        // The waiting frames are intact.
        assert_eq!(ring.pop().unwrap().iface, "a");
        // Space freed; the producer may continue.
        ring.push(frame("c")).unwrap();
        assert_eq!(ring.pop().unwrap().iface, "b");
        assert_eq!(ring.pop().unwrap().iface, "c");
    }

    #[test]
    fn wraps_around_indefinitely() {
        let ring = FrameRing::new();
        for i in 0..100 {
            let tag = format!("f{i}");
            ring.push(Frame::begin(tag.clone(), 1000)).unwrap();
            assert_eq!(ring.pop().unwrap().iface, tag);
        }
    }
}
