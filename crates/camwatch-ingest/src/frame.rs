//! Decoded frames and the recycling pool that owns their pixel storage.

use std::{
    collections::VecDeque,
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex},
    time::Instant,
};

/// A decoded picture in packed BGR24 layout (`stride = width * 3`).
///
/// Frames are mutated only by the capture thread while it holds the sole
/// [`PooledFrame`] handle; once published into a ring buffer they are
/// shared immutably.
pub struct FrameData {
    /// Interleaved BGR bytes, `stride * height` long.
    pub pixels: Vec<u8>,
    pub width: i32,
    pub height: i32,
    /// Bytes per row.
    pub stride: i32,
    /// Monotonic clock reading taken at decode time.
    pub timestamp: Instant,
    /// Strictly increasing per-camera sequence; 0 means "recycled, unwritten".
    pub frame_number: u64,
}

impl FrameData {
    fn empty() -> Self {
        Self {
            pixels: Vec::new(),
            width: 0,
            height: 0,
            stride: 0,
            timestamp: Instant::now(),
            frame_number: 0,
        }
    }

    /// Reallocate pixel storage for the given dimensions.
    pub fn resize(&mut self, width: i32, height: i32) {
        self.width = width;
        self.height = height;
        self.stride = width * 3;
        self.pixels
            .resize(self.stride as usize * height as usize, 0);
    }

    /// Owned copy of this frame, detached from any pool.
    pub fn deep_copy(&self) -> FrameData {
        FrameData {
            pixels: self.pixels.clone(),
            width: self.width,
            height: self.height,
            stride: self.stride,
            timestamp: self.timestamp,
            frame_number: self.frame_number,
        }
    }
}

struct PoolInner {
    capacity: usize,
    free_list: Mutex<VecDeque<Box<FrameData>>>,
}

/// Pre-allocated, recycling store of frame buffers.
///
/// `acquire` lends a buffer as a [`PooledFrame`]; dropping the handle (from
/// any thread) returns the buffer to the free list with its `frame_number`
/// reset. Exhaustion is non-fatal: the caller is expected to drop the
/// incoming picture rather than block the decode loop.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        let mut free_list = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            free_list.push_back(Box::new(FrameData::empty()));
        }
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                free_list: Mutex::new(free_list),
            }),
        }
    }

    /// Lend a buffer, or `None` when every buffer is currently out.
    pub fn acquire(&self) -> Option<PooledFrame> {
        let frame = {
            let mut free = self.inner.free_list.lock().expect("frame pool poisoned");
            free.pop_front()?
        };
        Some(PooledFrame {
            frame: Some(frame),
            pool: Arc::clone(&self.inner),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn available(&self) -> usize {
        self.inner.free_list.lock().expect("frame pool poisoned").len()
    }

    pub fn in_use(&self) -> usize {
        self.capacity() - self.available()
    }
}

/// Exclusive handle to a pooled buffer. Returns the buffer on drop.
pub struct PooledFrame {
    frame: Option<Box<FrameData>>,
    pool: Arc<PoolInner>,
}

/// Published, reference-counted form of a frame. Readers never mutate.
pub type SharedFrame = Arc<PooledFrame>;

impl Deref for PooledFrame {
    type Target = FrameData;

    fn deref(&self) -> &FrameData {
        self.frame.as_ref().expect("pooled frame already recycled")
    }
}

impl DerefMut for PooledFrame {
    fn deref_mut(&mut self) -> &mut FrameData {
        self.frame.as_mut().expect("pooled frame already recycled")
    }
}

impl Drop for PooledFrame {
    fn drop(&mut self) {
        if let Some(mut frame) = self.frame.take() {
            frame.frame_number = 0;
            let mut free = match self.pool.free_list.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            free.push_back(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_basic_allocation() {
        let pool = FramePool::new(5);
        assert_eq!(pool.capacity(), 5);
        assert_eq!(pool.available(), 5);
        assert_eq!(pool.in_use(), 0);

        let _f1 = pool.acquire().unwrap();
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.in_use(), 1);

        let _f2 = pool.acquire().unwrap();
        let _f3 = pool.acquire().unwrap();
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.in_use(), 3);
        assert_eq!(pool.available() + pool.in_use(), pool.capacity());
    }

    #[test]
    fn pool_exhaustion_returns_none() {
        let pool = FramePool::new(3);
        let held: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(pool.available(), 0);
        assert!(pool.acquire().is_none());
        drop(held);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn pool_recycles_on_drop() {
        let pool = FramePool::new(2);
        let f1 = pool.acquire().unwrap();
        let _f2 = pool.acquire().unwrap();
        assert_eq!(pool.available(), 0);

        drop(f1);
        assert_eq!(pool.available(), 1);
        let f3 = pool.acquire();
        assert!(f3.is_some());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn pool_resets_frame_number_on_recycle() {
        let pool = FramePool::new(1);
        {
            let mut frame = pool.acquire().unwrap();
            frame.frame_number = 42;
        }
        let frame = pool.acquire().unwrap();
        assert_eq!(frame.frame_number, 0);
    }

    #[test]
    fn pool_recycle_works_across_threads() {
        let pool = FramePool::new(4);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let frame = pool.acquire().unwrap();
            handles.push(std::thread::spawn(move || drop(frame)));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn resize_sets_stride_and_length() {
        let pool = FramePool::new(1);
        let mut frame = pool.acquire().unwrap();
        frame.resize(8, 4);
        assert_eq!(frame.stride, 24);
        assert_eq!(frame.pixels.len(), 24 * 4);
    }
}
