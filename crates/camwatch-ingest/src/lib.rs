//! Camera ingest layer: pooled frame buffers, per-camera ring buffers, and
//! the RTSP capture pipeline that feeds them.
//!
//! Capture runs one thread per camera. Decoded BGR24 pictures are written
//! into buffers lent out by a [`FramePool`] and published into a
//! [`FrameRing`], where the HTTP handlers, detection workers, and the event
//! pipeline read them concurrently. Dropping the last handle to a published
//! frame recycles its buffer back into the pool.

pub mod capture;
pub mod frame;
pub mod ring;

pub use capture::{CaptureError, CaptureStats, CaptureStatsSnapshot, RtspCapture};
pub use frame::{FrameData, FramePool, PooledFrame, SharedFrame};
pub use ring::FrameRing;
