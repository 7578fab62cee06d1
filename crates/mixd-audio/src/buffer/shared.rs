//! Span-based ring buffer shared between one writer and one reader.
//!
//! The data region is split into equal spans. The writer fills the span at
//! its cursor, publishes it by moving the span status to `WriteDone`, and
//! advances its cursor by one span. The reader does the mirror image. Both
//! cursors only ever grow, so a position maps to a span by `pos % total`.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use mixd_core::{Error, Result, SpanStatus, StreamStatus};

use super::span::SpanInfo;
use crate::clock;

/// Which side created a buffer and therefore owns its teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferHolder {
    /// Created by the server, mapped by one client.
    ServerShared,
    /// Created and used only inside the server, e.g. a device buffer.
    ServerOnly,
    /// Created by the client and handed to the server.
    ClientLocal,
}

/// Geometry of a shared buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferSizeParams {
    pub total_frames: u32,
    pub span_frames: u32,
    pub bytes_per_frame: u32,
}

impl BufferSizeParams {
    pub const fn new(total_frames: u32, span_frames: u32, bytes_per_frame: u32) -> Self {
        Self {
            total_frames,
            span_frames,
            bytes_per_frame,
        }
    }

    /// Reject zero sizes and totals that are not a whole number of spans.
    pub fn validate(&self) -> Result<()> {
        if self.total_frames == 0 || self.span_frames == 0 || self.bytes_per_frame == 0 {
            return Err(Error::invalid_param(format!(
                "zero buffer size: total {} span {} bytes/frame {}",
                self.total_frames, self.span_frames, self.bytes_per_frame
            )));
        }
        if self.total_frames % self.span_frames != 0 {
            return Err(Error::invalid_param(format!(
                "total frames {} not a multiple of span {}",
                self.total_frames, self.span_frames
            )));
        }
        Ok(())
    }

    pub const fn span_count(&self) -> u32 {
        self.total_frames / self.span_frames
    }

    pub const fn span_bytes(&self) -> usize {
        self.span_frames as usize * self.bytes_per_frame as usize
    }

    /// Size of the data region in bytes.
    pub fn data_size(&self) -> Result<usize> {
        (self.total_frames as usize)
            .checked_mul(self.bytes_per_frame as usize)
            .ok_or_else(|| {
                Error::invalid_param(format!(
                    "{} frames of {} bytes overflows",
                    self.total_frames, self.bytes_per_frame
                ))
            })
    }
}

/// Last handled frame position and the time it was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleInfo {
    pub frame: u64,
    pub time_ns: i64,
}

/// The memory behind a buffer. Every mapping of the same buffer points here.
struct Region {
    data: Box<[UnsafeCell<u8>]>,
    spans: Box<[SpanInfo]>,
    write_frame: AtomicU64,
    read_frame: AtomicU64,
    // Sequence lock over the handle-info pair; odd while a write is in flight.
    handle_seq: AtomicU64,
    handle_frame: AtomicU64,
    handle_time: AtomicI64,
    stream_status: AtomicU8,
}

impl Region {
    fn allocate(params: &BufferSizeParams) -> Result<Self> {
        let size = params.data_size()?;
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|e| Error::NoMemory(format!("{size} byte audio buffer: {e}")))?;
        data.resize_with(size, || UnsafeCell::new(0u8));

        let spans = (0..params.span_count()).map(|_| SpanInfo::default()).collect();

        Ok(Self {
            data: data.into_boxed_slice(),
            spans,
            write_frame: AtomicU64::new(0),
            read_frame: AtomicU64::new(0),
            handle_seq: AtomicU64::new(0),
            handle_frame: AtomicU64::new(0),
            handle_time: AtomicI64::new(0),
            stream_status: AtomicU8::new(StreamStatus::Invalid as u8),
        })
    }
}

// SAFETY: Region is shared between exactly one writer and one reader.
// Cursors, span status and handle info are atomics. The byte region is only
// touched through span windows, and the span-status handshake guarantees the
// writer and the reader never hold the same span at the same time.
#[allow(unsafe_code)]
unsafe impl Send for Region {}
#[allow(unsafe_code)]
unsafe impl Sync for Region {}

/// A memory handle plus the geometry needed to map it.
///
/// The creating side keeps ownership of teardown. A receiver maps it with
/// [`SharedAudioBuffer::create_from_descriptor`] and never frees it.
#[derive(Clone)]
pub struct SharedBufferDescriptor {
    region: Arc<Region>,
    params: BufferSizeParams,
}

impl SharedBufferDescriptor {
    pub const fn params(&self) -> BufferSizeParams {
        self.params
    }
}

impl std::fmt::Debug for SharedBufferDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBufferDescriptor")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// One mapping of a span ring buffer.
pub struct SharedAudioBuffer {
    region: Arc<Region>,
    params: BufferSizeParams,
    holder: BufferHolder,
}

/// Thread-safe reference to a shared audio buffer.
pub type SharedBuffer = Arc<SharedAudioBuffer>;

impl SharedAudioBuffer {
    /// Allocate a zero-filled buffer owned by `holder`.
    pub fn create_local(
        total_frames: u32,
        span_frames: u32,
        bytes_per_frame: u32,
        holder: BufferHolder,
    ) -> Result<SharedBuffer> {
        let params = BufferSizeParams::new(total_frames, span_frames, bytes_per_frame);
        params.validate()?;
        let region = Region::allocate(&params)?;
        Ok(Arc::new(Self {
            region: Arc::new(region),
            params,
            holder,
        }))
    }

    /// Map a buffer some other party created.
    pub fn create_from_descriptor(
        descriptor: &SharedBufferDescriptor,
        holder: BufferHolder,
    ) -> Result<SharedBuffer> {
        let params = descriptor.params;
        params.validate()?;
        if descriptor.region.data.len() != params.data_size()? {
            return Err(Error::invalid_param(format!(
                "descriptor geometry {params:?} does not match its {} byte region",
                descriptor.region.data.len()
            )));
        }
        Ok(Arc::new(Self {
            region: Arc::clone(&descriptor.region),
            params,
            holder,
        }))
    }

    pub fn descriptor(&self) -> SharedBufferDescriptor {
        SharedBufferDescriptor {
            region: Arc::clone(&self.region),
            params: self.params,
        }
    }

    /// True if both mappings share the same memory.
    pub fn same_region(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.region, &other.region)
    }

    pub const fn holder(&self) -> BufferHolder {
        self.holder
    }

    pub const fn size_params(&self) -> BufferSizeParams {
        self.params
    }

    pub const fn total_frames(&self) -> u32 {
        self.params.total_frames
    }

    pub const fn span_frames(&self) -> u32 {
        self.params.span_frames
    }

    pub const fn bytes_per_frame(&self) -> u32 {
        self.params.bytes_per_frame
    }

    pub const fn span_count(&self) -> u32 {
        self.params.span_count()
    }

    pub fn data_size(&self) -> usize {
        self.region.data.len()
    }

    pub fn write_frame(&self) -> u64 {
        self.region.write_frame.load(Ordering::Acquire)
    }

    pub fn read_frame(&self) -> u64 {
        self.region.read_frame.load(Ordering::Acquire)
    }

    /// Frames written but not yet read.
    pub fn available_frames(&self) -> u64 {
        self.write_frame().saturating_sub(self.read_frame())
    }

    /// Advance the write cursor by whole spans.
    pub fn set_cur_write_frame(&self, frame: u64) -> Result<()> {
        let write = self.write_frame();
        let read = self.read_frame();
        let total = u64::from(self.params.total_frames);

        if frame < write {
            return Err(Error::invalid_param(format!(
                "write cursor cannot move back from {write} to {frame}"
            )));
        }
        if (frame - write) % u64::from(self.params.span_frames) != 0 {
            return Err(Error::invalid_param(format!(
                "write cursor step {} is not whole spans",
                frame - write
            )));
        }
        if frame > read + total {
            return Err(Error::invalid_param(format!(
                "write cursor {frame} overruns reader at {read}"
            )));
        }
        self.region.write_frame.store(frame, Ordering::Release);
        Ok(())
    }

    /// Advance the read cursor by whole spans.
    pub fn set_cur_read_frame(&self, frame: u64) -> Result<()> {
        let write = self.write_frame();
        let read = self.read_frame();

        if frame < read {
            return Err(Error::invalid_param(format!(
                "read cursor cannot move back from {read} to {frame}"
            )));
        }
        if (frame - read) % u64::from(self.params.span_frames) != 0 {
            return Err(Error::invalid_param(format!(
                "read cursor step {} is not whole spans",
                frame - read
            )));
        }
        if frame > write {
            return Err(Error::invalid_param(format!(
                "read cursor {frame} passes writer at {write}"
            )));
        }
        self.region.read_frame.store(frame, Ordering::Release);
        Ok(())
    }

    /// Jump both cursors, e.g. after a device resync.
    pub fn reset_cursors(&self, read: u64, write: u64) -> Result<()> {
        if read > write {
            return Err(Error::invalid_param(format!(
                "read {read} is ahead of write {write}"
            )));
        }
        let distance = write - read;
        if distance > u64::from(self.params.total_frames)
            || distance % u64::from(self.params.span_frames) != 0
        {
            return Err(Error::invalid_param(format!(
                "cursor distance {distance} is not whole spans within the buffer"
            )));
        }
        self.region.read_frame.store(read, Ordering::Release);
        self.region.write_frame.store(write, Ordering::Release);
        Ok(())
    }

    fn span_index(&self, pos: u64) -> usize {
        let offset = pos % u64::from(self.params.total_frames);
        (offset / u64::from(self.params.span_frames)) as usize
    }

    /// Span covering `pos`, if `pos` lies within one buffer length of the reader.
    pub fn span_info(&self, pos: u64) -> Option<&SpanInfo> {
        let read = self.read_frame();
        if pos < read || pos >= read + u64::from(self.params.total_frames) {
            return None;
        }
        self.region.spans.get(self.span_index(pos))
    }

    pub fn span_info_by_index(&self, index: usize) -> Option<&SpanInfo> {
        self.region.spans.get(index)
    }

    /// Return every span to `ReadDone` with unity gain.
    ///
    /// Drops any claim in flight, so no span may be held while this runs.
    pub(crate) fn init_span_status(&self) {
        for span in self.region.spans.iter() {
            span.reset();
        }
    }

    #[allow(unsafe_code)]
    fn with_span_bytes<R>(&self, index: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let len = self.params.span_bytes();
        let start = index * len;
        assert!(start + len <= self.region.data.len(), "span {index} out of range");

        let base = UnsafeCell::raw_get(self.region.data.as_ptr());
        // SAFETY: the range is in bounds (checked above). Every caller has
        // moved the span into `Writing` or `Reading` with a successful CAS,
        // and only the thread that won the CAS reaches this point for it.
        let bytes = unsafe { std::slice::from_raw_parts_mut(base.add(start), len) };
        f(bytes)
    }

    /// Claim the span at `pos` for writing and run `f` on it.
    ///
    /// `pos` must be inside the writer's window `[write, read + total)`. The
    /// span moves `ReadDone -> Writing` before `f` sees its bytes and is left
    /// in `Writing` for the caller to publish. `Ok(None)` means the span is
    /// still held by someone else.
    pub(crate) fn with_write_span<R>(
        &self,
        pos: u64,
        f: impl FnOnce(&SpanInfo, &mut [u8]) -> R,
    ) -> Result<Option<R>> {
        let write = self.write_frame();
        let read = self.read_frame();
        if pos < write || pos >= read + u64::from(self.params.total_frames) {
            return Err(Error::illegal_state(format!(
                "write span at {pos} outside [{write}, {})",
                read + u64::from(self.params.total_frames)
            )));
        }
        let index = self.span_index(pos);
        let span = &self.region.spans[index];
        if !span.try_transition(SpanStatus::ReadDone, SpanStatus::Writing) {
            return Ok(None);
        }
        Ok(Some(self.with_span_bytes(index, |bytes| f(span, bytes))))
    }

    /// Claim the span at `pos` for reading and run `f` on it.
    ///
    /// `pos` must be inside the reader's window `[read, write)`. The span
    /// moves `WriteDone -> Reading` first and is left in `Reading` until
    /// `release_read_span`. `Ok(None)` means it was not published yet.
    pub(crate) fn with_read_span<R>(
        &self,
        pos: u64,
        f: impl FnOnce(&SpanInfo, &[u8]) -> R,
    ) -> Result<Option<R>> {
        let write = self.write_frame();
        let read = self.read_frame();
        if pos < read || pos >= write {
            return Err(Error::illegal_state(format!(
                "read span at {pos} outside [{read}, {write})"
            )));
        }
        let index = self.span_index(pos);
        let span = &self.region.spans[index];
        if !span.try_transition(SpanStatus::WriteDone, SpanStatus::Reading) {
            return Ok(None);
        }
        Ok(Some(self.with_span_bytes(index, |bytes| f(span, &*bytes))))
    }

    /// Zero a span claimed by `with_read_span` and hand it back to writers.
    ///
    /// Fails with `IllegalState` unless the span at `pos` is `Reading`. The
    /// read cursor is left alone.
    pub(crate) fn release_read_span(&self, pos: u64) -> Result<()> {
        let span = self.span_info(pos).ok_or_else(|| {
            Error::illegal_state(format!(
                "span at {pos} outside the buffer window at {}",
                self.read_frame()
            ))
        })?;
        if span.status() != SpanStatus::Reading {
            return Err(Error::illegal_state(format!(
                "release of span at {pos} in {:?}",
                span.status()
            )));
        }
        self.with_span_bytes(self.span_index(pos), |bytes| bytes.fill(0));
        span.set_read_done_time(clock::now_ns());
        span.try_transition(SpanStatus::Reading, SpanStatus::ReadDone);
        Ok(())
    }

    /// Publish `data` as the span at the write cursor and advance the cursor.
    ///
    /// Returns `Ok(false)` if the reader still holds that span. Bytes past the
    /// end of `data` are zeroed.
    pub fn write_span(&self, data: &[u8]) -> Result<bool> {
        let pos = self.write_frame();
        if pos >= self.read_frame() + u64::from(self.params.total_frames) {
            return Ok(false);
        }
        let claimed = self.with_write_span(pos, |span, bytes| {
            span.set_write_start_time(clock::now_ns());
            span.set_offset_in_frame(pos);
            let len = bytes.len().min(data.len());
            bytes[..len].copy_from_slice(&data[..len]);
            bytes[len..].fill(0);
            span.set_write_done_time(clock::now_ns());
        })?;
        if claimed.is_none() {
            return Ok(false);
        }
        self.region.spans[self.span_index(pos)]
            .try_transition(SpanStatus::Writing, SpanStatus::WriteDone);
        self.set_cur_write_frame(pos + u64::from(self.params.span_frames))?;
        Ok(true)
    }

    /// Copy the span at the read cursor into `out`, release it and advance.
    ///
    /// Returns `Ok(false)` if the writer has not published that span yet.
    pub fn read_span(&self, out: &mut [u8]) -> Result<bool> {
        let pos = self.read_frame();
        if pos >= self.write_frame() {
            return Ok(false);
        }
        let claimed = self.with_read_span(pos, |span, bytes| {
            span.set_read_start_time(clock::now_ns());
            let len = bytes.len().min(out.len());
            out[..len].copy_from_slice(&bytes[..len]);
        })?;
        if claimed.is_none() {
            return Ok(false);
        }
        let span = &self.region.spans[self.span_index(pos)];
        span.set_read_done_time(clock::now_ns());
        span.try_transition(SpanStatus::Reading, SpanStatus::ReadDone);
        self.set_cur_read_frame(pos + u64::from(self.params.span_frames))?;
        Ok(true)
    }

    /// Zero every span nobody holds. Held spans are skipped.
    pub fn clear(&self) {
        for (index, span) in self.region.spans.iter().enumerate() {
            if span.try_transition(SpanStatus::ReadDone, SpanStatus::Writing) {
                self.with_span_bytes(index, |bytes| bytes.fill(0));
                span.reset();
            }
        }
    }

    /// Record the latest handled position. Last writer wins.
    pub fn set_handle_info(&self, frame: u64, time_ns: i64) {
        let seq = &self.region.handle_seq;
        let mut current = seq.load(Ordering::Relaxed);
        loop {
            if current % 2 == 1 {
                std::hint::spin_loop();
                current = seq.load(Ordering::Relaxed);
                continue;
            }
            match seq.compare_exchange_weak(current, current + 1, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => break,
                Err(seen) => current = seen,
            }
        }
        fence(Ordering::Release);
        self.region.handle_frame.store(frame, Ordering::Relaxed);
        self.region.handle_time.store(time_ns, Ordering::Relaxed);
        seq.store(current + 2, Ordering::Release);
    }

    /// Latest handled position, or `None` if nothing was recorded yet.
    pub fn handle_info(&self) -> Option<HandleInfo> {
        let seq = &self.region.handle_seq;
        loop {
            let before = seq.load(Ordering::Acquire);
            if before == 0 {
                return None;
            }
            if before % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let frame = self.region.handle_frame.load(Ordering::Relaxed);
            let time_ns = self.region.handle_time.load(Ordering::Relaxed);
            fence(Ordering::Acquire);
            if seq.load(Ordering::Relaxed) == before {
                return Some(HandleInfo { frame, time_ns });
            }
        }
    }

    pub fn stream_status(&self) -> StreamStatus {
        StreamStatus::from_u8(self.region.stream_status.load(Ordering::Acquire)).unwrap_or_default()
    }

    pub fn set_stream_status(&self, status: StreamStatus) {
        self.region.stream_status.store(status as u8, Ordering::Release);
    }

    /// Move the stream status from `from` to `to`; false if it was not `from`.
    pub fn compare_set_stream_status(&self, from: StreamStatus, to: StreamStatus) -> bool {
        self.region
            .stream_status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl std::fmt::Debug for SharedAudioBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedAudioBuffer")
            .field("params", &self.params)
            .field("holder", &self.holder)
            .field("read", &self.read_frame())
            .field("write", &self.write_frame())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn buffer() -> SharedBuffer {
        SharedAudioBuffer::create_local(1000, 100, 4, BufferHolder::ServerShared).unwrap()
    }

    #[test]
    fn test_create_validates_geometry() {
        let bad = [(999, 100, 4), (0, 100, 4), (1000, 0, 4), (1000, 100, 0)];
        for (total, span, bpf) in bad {
            let err = SharedAudioBuffer::create_local(total, span, bpf, BufferHolder::ServerOnly)
                .unwrap_err();
            assert!(err.is_invalid_param(), "{total}/{span}/{bpf}");
        }
    }

    #[test]
    fn test_geometry_queries() {
        let buf = buffer();
        assert_eq!(buf.span_count(), 10);
        assert_eq!(buf.data_size(), 4000);
        assert_eq!(buf.holder(), BufferHolder::ServerShared);
        assert_eq!(buf.available_frames(), 0);
        assert_eq!(buf.stream_status(), StreamStatus::Invalid);
    }

    #[test]
    fn test_cursors_only_move_forward() {
        let buf = buffer();
        buf.set_cur_write_frame(300).unwrap();
        assert!(buf.set_cur_write_frame(200).unwrap_err().is_invalid_param());
        // Partial span steps are rejected.
        assert!(buf.set_cur_write_frame(350).is_err());

        buf.set_cur_read_frame(100).unwrap();
        buf.set_cur_read_frame(100).unwrap();
        assert!(buf.set_cur_read_frame(0).is_err());
        // Reader cannot pass the writer.
        assert!(buf.set_cur_read_frame(400).is_err());
        assert_eq!(buf.available_frames(), 200);
    }

    #[test]
    fn test_writer_cannot_lap_reader() {
        let buf = buffer();
        buf.set_cur_write_frame(1000).unwrap();
        assert!(buf.set_cur_write_frame(1100).is_err());
        buf.set_cur_read_frame(100).unwrap();
        buf.set_cur_write_frame(1100).unwrap();
    }

    #[test]
    fn test_reset_cursors() {
        let buf = buffer();
        buf.reset_cursors(2000, 2300).unwrap();
        assert_eq!((buf.read_frame(), buf.write_frame()), (2000, 2300));

        assert!(buf.reset_cursors(500, 400).is_err());
        assert!(buf.reset_cursors(0, 1100).is_err());
        assert!(buf.reset_cursors(0, 150).is_err());
    }

    #[test]
    fn test_span_windows() {
        let buf = buffer();
        buf.reset_cursors(1000, 1000).unwrap();

        // Nothing readable yet.
        assert!(buf.with_read_span(1000, |_, _| ()).unwrap_err().is_illegal_state());
        // Writer may fill anything within one lap of the reader.
        assert!(buf.with_write_span(1000, |_, bytes| bytes.fill(7)).unwrap().is_some());
        assert!(buf.with_write_span(1900, |_, _| ()).unwrap().is_some());
        assert!(buf.with_write_span(2000, |_, _| ()).is_err());
        assert!(buf.with_write_span(900, |_, _| ()).is_err());

        let span = buf.span_info(1000).unwrap();
        assert_eq!(span.status(), SpanStatus::Writing);
        assert!(span.try_transition(SpanStatus::Writing, SpanStatus::WriteDone));
        buf.set_cur_write_frame(1100).unwrap();
        let sum = buf
            .with_read_span(1050, |_, bytes| bytes.iter().map(|&b| u32::from(b)).sum::<u32>())
            .unwrap();
        assert_eq!(sum, Some(7 * 400));
        assert_eq!(span.status(), SpanStatus::Reading);
    }

    #[test]
    fn test_span_claim_is_exclusive() {
        let buf = buffer();
        let nested = buf
            .with_write_span(0, |_, bytes| {
                bytes.fill(1);
                buf.with_write_span(0, |_, inner| inner.fill(2)).unwrap()
            })
            .unwrap();
        assert_eq!(nested, Some(None));
        // Still claimed, so the client path backs off as well.
        assert!(!buf.write_span(&[3u8; 400]).unwrap());

        let span = buf.span_info(0).unwrap();
        assert!(span.try_transition(SpanStatus::Writing, SpanStatus::WriteDone));
        buf.set_cur_write_frame(100).unwrap();

        let nested = buf
            .with_read_span(0, |_, bytes| {
                let inner = buf.with_read_span(0, |_, _| ()).unwrap();
                (bytes.iter().all(|&b| b == 1), inner)
            })
            .unwrap();
        assert_eq!(nested, Some((true, None)));
        let mut out = [0u8; 400];
        assert!(!buf.read_span(&mut out).unwrap());
    }

    #[test]
    fn test_span_lookup() {
        let buf = buffer();
        buf.reset_cursors(1000, 1000).unwrap();
        assert!(buf.span_info(1000).is_some());
        assert!(buf.span_info(1999).is_some());
        assert!(buf.span_info(4000).is_none());
        assert!(buf.span_info(999).is_none());
        assert!(buf.span_info_by_index(9).is_some());
        assert!(buf.span_info_by_index(10).is_none());
    }

    #[test]
    fn test_release_read_span() {
        let buf = buffer();
        assert!(buf.write_span(&[0xAB; 400]).unwrap());
        // Published but not claimed by a reader.
        assert!(buf.release_read_span(0).unwrap_err().is_illegal_state());

        assert_eq!(buf.with_read_span(0, |_, bytes| bytes[0]).unwrap(), Some(0xAB));
        buf.release_read_span(0).unwrap();
        let span = buf.span_info(0).unwrap();
        assert_eq!(span.status(), SpanStatus::ReadDone);
        assert!(buf.release_read_span(0).unwrap_err().is_illegal_state());

        // The next lap over the same memory starts from silence.
        buf.set_cur_read_frame(100).unwrap();
        let zeroed = buf
            .with_write_span(1000, |_, bytes| bytes.iter().all(|&b| b == 0))
            .unwrap();
        assert_eq!(zeroed, Some(true));
    }

    #[test]
    fn test_clear_skips_held_spans() {
        let buf = buffer();
        assert!(buf.write_span(&[5u8; 400]).unwrap());
        assert!(buf.write_span(&[6u8; 400]).unwrap());
        assert!(buf.with_read_span(0, |_, _| ()).unwrap().is_some());

        buf.clear();
        // Span 0 is claimed and span 1 still waits for its reader.
        assert_eq!(buf.span_info(0).unwrap().status(), SpanStatus::Reading);
        assert_eq!(buf.span_info(100).unwrap().status(), SpanStatus::WriteDone);
        let mut out = [0u8; 400];
        buf.release_read_span(0).unwrap();
        buf.set_cur_read_frame(100).unwrap();
        assert!(buf.read_span(&mut out).unwrap());
        assert_eq!(out, [6u8; 400]);
    }

    #[test]
    fn test_write_then_read_span() {
        let buf = SharedAudioBuffer::create_local(20, 10, 2, BufferHolder::ServerShared).unwrap();
        let span = buf.span_info_by_index(0).unwrap();

        assert!(buf.write_span(&[1u8; 20]).unwrap());
        assert_eq!(span.status(), SpanStatus::WriteDone);
        assert!(buf.write_span(&[2u8; 5]).unwrap());
        // Both spans are waiting for the reader.
        assert!(!buf.write_span(&[3u8; 20]).unwrap());
        assert_eq!(buf.available_frames(), 20);

        let mut out = [0u8; 20];
        assert!(buf.read_span(&mut out).unwrap());
        assert_eq!(out, [1u8; 20]);
        assert_eq!(span.status(), SpanStatus::ReadDone);

        assert!(buf.read_span(&mut out).unwrap());
        assert_eq!(&out[..5], &[2u8; 5]);
        assert_eq!(&out[5..], &[0u8; 15]);
        assert!(!buf.read_span(&mut out).unwrap());
    }

    #[test]
    fn test_handle_info() {
        let buf = buffer();
        assert_eq!(buf.handle_info(), None);
        buf.set_handle_info(960, 20_000_000);
        buf.set_handle_info(1920, 40_000_000);
        assert_eq!(
            buf.handle_info(),
            Some(HandleInfo {
                frame: 1920,
                time_ns: 40_000_000
            })
        );
    }

    #[test]
    fn test_descriptor_maps_same_memory() {
        let owner = buffer();
        let desc = owner.descriptor();
        let mapped = SharedAudioBuffer::create_from_descriptor(&desc, BufferHolder::ClientLocal).unwrap();

        assert!(mapped.same_region(&owner));
        assert_eq!(mapped.size_params(), owner.size_params());

        // Cursors and status are in the shared region, not per mapping.
        owner.set_cur_write_frame(200).unwrap();
        owner.set_stream_status(StreamStatus::Running);
        assert_eq!(mapped.write_frame(), 200);
        assert_eq!(mapped.stream_status(), StreamStatus::Running);

        let other = buffer();
        assert!(!mapped.same_region(&other));
    }

    #[test]
    fn test_init_span_status() {
        let buf = buffer();
        let span = buf.span_info_by_index(3).unwrap();
        assert!(span.try_transition(SpanStatus::ReadDone, SpanStatus::Writing));
        buf.init_span_status();
        assert_eq!(span.status(), SpanStatus::ReadDone);
    }

    #[test]
    fn test_concurrent_span_handoff() {
        use std::thread;

        let buf = SharedAudioBuffer::create_local(64, 16, 2, BufferHolder::ServerShared).unwrap();
        let writer_buf = Arc::clone(&buf);
        let spans = 200u64;

        let writer = thread::spawn(move || {
            for n in 0..spans {
                let pos = n * 16;
                loop {
                    let claimed = writer_buf
                        .with_write_span(pos, |_, bytes| bytes.fill((n % 251) as u8))
                        .unwrap_or(None);
                    if claimed.is_some() {
                        let span = writer_buf.span_info(pos).unwrap();
                        assert!(span.try_transition(SpanStatus::Writing, SpanStatus::WriteDone));
                        writer_buf.set_cur_write_frame(pos + 16).unwrap();
                        break;
                    }
                    thread::yield_now();
                }
            }
        });

        for n in 0..spans {
            let pos = n * 16;
            loop {
                let got = buf
                    .with_read_span(pos, |_, bytes| {
                        let value = bytes[0];
                        assert!(bytes.iter().all(|&b| b == value));
                        value
                    })
                    .ok()
                    .flatten();
                if let Some(value) = got {
                    assert_eq!(value, (n % 251) as u8);
                    buf.release_read_span(pos).unwrap();
                    buf.set_cur_read_frame(pos + 16).unwrap();
                    break;
                }
                thread::yield_now();
            }
        }

        writer.join().unwrap();
        assert_eq!(buf.available_frames(), 0);
    }

    proptest! {
        #[test]
        fn prop_valid_geometry_is_zero_filled(
            span in 1u32..256,
            spans in 1u32..16,
            bpf in 1u32..16,
        ) {
            let buf = SharedAudioBuffer::create_local(span * spans, span, bpf, BufferHolder::ServerOnly)
                .unwrap();
            prop_assert_eq!(buf.data_size(), (span * spans * bpf) as usize);
            for n in 0..spans {
                let zero = buf
                    .with_write_span(u64::from(n * span), |_, bytes| bytes.iter().all(|&b| b == 0))
                    .unwrap();
                prop_assert_eq!(zero, Some(true));
            }
        }
    }
}
