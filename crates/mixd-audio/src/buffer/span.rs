//! Per-span metadata shared between a buffer's writer and reader.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, AtomicU8, Ordering};

use mixd_core::SpanStatus;

/// Fixed-point unity gain (1.0 in Q16).
pub const UNITY_VOLUME: i32 = 1 << VOLUME_SHIFT;

/// Fractional bits of the Q16 span volume.
pub const VOLUME_SHIFT: u32 = 16;

/// Descriptor of one span window.
///
/// Only the writer moves a span to `Writing`/`WriteDone` and only the reader
/// moves it to `Reading`/`ReadDone`; the status byte is the sole signal
/// between them, so no lock guards the span data.
#[derive(Debug)]
pub struct SpanInfo {
    status: AtomicU8,
    offset_in_frame: AtomicU64,
    write_start_time: AtomicI64,
    write_done_time: AtomicI64,
    read_start_time: AtomicI64,
    read_done_time: AtomicI64,
    volume_start: AtomicI32,
    volume_end: AtomicI32,
    is_mute: AtomicBool,
}

impl Default for SpanInfo {
    fn default() -> Self {
        Self {
            status: AtomicU8::new(SpanStatus::ReadDone as u8),
            offset_in_frame: AtomicU64::new(0),
            write_start_time: AtomicI64::new(0),
            write_done_time: AtomicI64::new(0),
            read_start_time: AtomicI64::new(0),
            read_done_time: AtomicI64::new(0),
            volume_start: AtomicI32::new(UNITY_VOLUME),
            volume_end: AtomicI32::new(UNITY_VOLUME),
            is_mute: AtomicBool::new(false),
        }
    }
}

impl SpanInfo {
    pub fn status(&self) -> SpanStatus {
        SpanStatus::from_u8(self.status.load(Ordering::Acquire)).unwrap_or_default()
    }

    /// Move the span from `from` to `to` if it is currently `from`.
    ///
    /// Only the single legal successor is accepted; any other target returns
    /// false without touching the span.
    pub(crate) fn try_transition(&self, from: SpanStatus, to: SpanStatus) -> bool {
        if !from.can_transition_to(to) {
            return false;
        }
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Put the span back into its initial state: free for the writer, unity
    /// gain, no timestamps.
    pub(crate) fn reset(&self) {
        self.offset_in_frame.store(0, Ordering::Relaxed);
        self.write_start_time.store(0, Ordering::Relaxed);
        self.write_done_time.store(0, Ordering::Relaxed);
        self.read_start_time.store(0, Ordering::Relaxed);
        self.read_done_time.store(0, Ordering::Relaxed);
        self.volume_start.store(UNITY_VOLUME, Ordering::Relaxed);
        self.volume_end.store(UNITY_VOLUME, Ordering::Relaxed);
        self.is_mute.store(false, Ordering::Relaxed);
        self.status.store(SpanStatus::ReadDone as u8, Ordering::Release);
    }

    pub fn offset_in_frame(&self) -> u64 {
        self.offset_in_frame.load(Ordering::Relaxed)
    }

    pub fn set_offset_in_frame(&self, frame: u64) {
        self.offset_in_frame.store(frame, Ordering::Relaxed);
    }

    pub fn write_start_time(&self) -> i64 {
        self.write_start_time.load(Ordering::Relaxed)
    }

    pub fn set_write_start_time(&self, nanos: i64) {
        self.write_start_time.store(nanos, Ordering::Relaxed);
    }

    pub fn write_done_time(&self) -> i64 {
        self.write_done_time.load(Ordering::Relaxed)
    }

    pub fn set_write_done_time(&self, nanos: i64) {
        self.write_done_time.store(nanos, Ordering::Relaxed);
    }

    pub fn read_start_time(&self) -> i64 {
        self.read_start_time.load(Ordering::Relaxed)
    }

    pub fn set_read_start_time(&self, nanos: i64) {
        self.read_start_time.store(nanos, Ordering::Relaxed);
    }

    pub fn read_done_time(&self) -> i64 {
        self.read_done_time.load(Ordering::Relaxed)
    }

    pub fn set_read_done_time(&self, nanos: i64) {
        self.read_done_time.store(nanos, Ordering::Relaxed);
    }

    /// Q16 gain at the first frame and the last frame of the span.
    pub fn volume(&self) -> (i32, i32) {
        (
            self.volume_start.load(Ordering::Relaxed),
            self.volume_end.load(Ordering::Relaxed),
        )
    }

    pub fn set_volume(&self, start: i32, end: i32) {
        self.volume_start.store(start.max(0), Ordering::Relaxed);
        self.volume_end.store(end.max(0), Ordering::Relaxed);
    }

    pub fn is_mute(&self) -> bool {
        self.is_mute.load(Ordering::Relaxed)
    }

    pub fn set_mute(&self, mute: bool) {
        self.is_mute.store(mute, Ordering::Relaxed);
    }
}
