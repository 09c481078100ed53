//! Fixed-capacity frame ring with overwrite-oldest semantics.

use std::sync::RwLock;

use crate::frame::SharedFrame;

struct RingState {
    slots: Vec<Option<SharedFrame>>,
    /// Next write position.
    head: usize,
    /// Number of valid frames.
    count: usize,
}

/// Per-camera FIFO of the most recent `capacity` frames.
///
/// One writer (the capture thread), many readers. Writers take the lock
/// exclusively so readers always observe a consistent pre- or post-push
/// state. Evicted handles drop here, which recycles their buffers back to
/// the pool unless a reader still holds a snapshot.
pub struct FrameRing {
    capacity: usize,
    state: RwLock<RingState>,
}

impl FrameRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be positive");
        Self {
            capacity,
            state: RwLock::new(RingState {
                slots: (0..capacity).map(|_| None).collect(),
                head: 0,
                count: 0,
            }),
        }
    }

    /// Push a frame, overwriting the oldest slot when full.
    pub fn push(&self, frame: SharedFrame) {
        let mut state = self.state.write().expect("frame ring poisoned");
        let head = state.head;
        state.slots[head] = Some(frame);
        state.head = (head + 1) % self.capacity;
        if state.count < self.capacity {
            state.count += 1;
        }
    }

    /// Most recently pushed frame, or `None` when empty.
    pub fn latest(&self) -> Option<SharedFrame> {
        let state = self.state.read().expect("frame ring poisoned");
        if state.count == 0 {
            return None;
        }
        let idx = (state.head + self.capacity - 1) % self.capacity;
        state.slots[idx].clone()
    }

    /// Point-in-time copy of all buffered frames, oldest first.
    ///
    /// Handles are reference-counted; the copy shares pixel storage with the
    /// ring. Holding the result pins those pool buffers, so long-lived
    /// consumers should deep-copy and release promptly.
    pub fn snapshot(&self) -> Vec<SharedFrame> {
        let state = self.state.read().expect("frame ring poisoned");
        let start = (state.head + self.capacity - state.count) % self.capacity;
        (0..state.count)
            .filter_map(|i| state.slots[(start + i) % self.capacity].clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().expect("frame ring poisoned").count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every buffered frame, recycling their buffers.
    pub fn clear(&self) {
        let mut state = self.state.write().expect("frame ring poisoned");
        for slot in state.slots.iter_mut() {
            *slot = None;
        }
        state.head = 0;
        state.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::frame::FramePool;

    fn make_frame(pool: &FramePool, number: u64) -> SharedFrame {
        let mut frame = pool.acquire().expect("pool exhausted in test");
        frame.resize(4, 4);
        frame.frame_number = number;
        Arc::new(frame)
    }

    #[test]
    fn push_and_len() {
        let pool = FramePool::new(8);
        let ring = FrameRing::new(5);
        assert_eq!(ring.len(), 0);
        assert_eq!(ring.capacity(), 5);

        ring.push(make_frame(&pool, 1));
        assert_eq!(ring.len(), 1);
        ring.push(make_frame(&pool, 2));
        ring.push(make_frame(&pool, 3));
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn overflow_evicts_oldest_and_recycles() {
        let pool = FramePool::new(8);
        let ring = FrameRing::new(3);

        for n in 1..=3 {
            ring.push(make_frame(&pool, n));
        }
        assert_eq!(pool.available(), 5);

        // Overflow evicts frame 1; its buffer returns to the pool.
        ring.push(make_frame(&pool, 4));
        assert_eq!(ring.len(), 3);
        assert_eq!(pool.available(), 5);

        assert_eq!(ring.latest().unwrap().frame_number, 4);
        let all = ring.snapshot();
        let numbers: Vec<u64> = all.iter().map(|f| f.frame_number).collect();
        assert_eq!(numbers, vec![2, 3, 4]);
    }

    #[test]
    fn snapshot_is_ordered_after_many_wraps() {
        let pool = FramePool::new(16);
        let ring = FrameRing::new(4);
        for n in 1..=11 {
            ring.push(make_frame(&pool, n));
        }
        let numbers: Vec<u64> = ring.snapshot().iter().map(|f| f.frame_number).collect();
        assert_eq!(numbers, vec![8, 9, 10, 11]);
        assert_eq!(pool.available(), 16 - 4);
    }

    #[test]
    fn latest_on_empty_is_none() {
        let ring = FrameRing::new(2);
        assert!(ring.latest().is_none());
        assert!(ring.snapshot().is_empty());
    }

    #[test]
    fn clear_recycles_everything() {
        let pool = FramePool::new(4);
        let ring = FrameRing::new(4);
        for n in 1..=4 {
            ring.push(make_frame(&pool, n));
        }
        assert_eq!(pool.available(), 0);
        ring.clear();
        assert_eq!(ring.len(), 0);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn reader_snapshot_pins_evicted_frame() {
        let pool = FramePool::new(4);
        let ring = FrameRing::new(2);
        ring.push(make_frame(&pool, 1));
        ring.push(make_frame(&pool, 2));

        let held = ring.snapshot();
        ring.push(make_frame(&pool, 3)); // evicts frame 1
        // The snapshot still holds frame 1, so its buffer is not yet free.
        assert_eq!(pool.available(), 4 - 3);
        drop(held);
        assert_eq!(pool.available(), 4 - 2);
    }
}
