//! Endpoint: one hardware device, its mmap buffer and the real-time work loop.
//!
//! The loop wakes a margin ahead of the predicted hardware deadline for the
//! next device span, collects every running stream's ready span, mixes them
//! into the device span and hands it to the driver. Capture endpoints run the
//! same loop in the other direction and fan each captured span out to their
//! streams.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, trace, warn};

use mixd_core::{
    DeviceInfo, DeviceRole, EndpointStatus, EndpointType, EngineConfig, Error, Result, SpanStatus,
    StreamStatus,
};

use crate::buffer::{
    BufferHolder, BufferSizeParams, SharedAudioBuffer, SharedBuffer, SharedBufferDescriptor,
};
use crate::clock;
use crate::device::{DeviceAttr, HardwareDevice};
use crate::mix::{self, MixSource};
use crate::process::{ProcessStatusListener, ProcessStream, StreamEvent};
use crate::time_model::LinearPosTimeModel;

/// Counters for dumps and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    pub loops: u64,
    pub resyncs: u64,
    pub late_wakeups: u64,
    pub underruns: u64,
    pub overflows: u64,
}

#[derive(Debug, Default)]
struct Counters {
    loops: AtomicU64,
    resyncs: AtomicU64,
    late_wakeups: AtomicU64,
    underruns: AtomicU64,
    overflows: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EndpointStats {
        EndpointStats {
            loops: self.loops.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            late_wakeups: self.late_wakeups.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
        }
    }
}

struct LinkedStream {
    stream: Arc<ProcessStream>,
    buffer: SharedBuffer,
}

/// State owned by the work-loop thread.
struct LoopState {
    model: LinearPosTimeModel,
    /// Device frame handled by the current iteration.
    cur_frame: u64,
    spans_since_resync: u64,
    /// Per-stream copies of the spans being mixed.
    scratch: Vec<Vec<u8>>,
    volumes: Vec<(i32, i32, bool)>,
    silence: Vec<u8>,
    /// Client spans read this iteration, handed back by `release_consumed`.
    consumed: Vec<(SharedBuffer, u64)>,
}

impl LoopState {
    fn scratch_slot(&mut self, index: usize, len: usize) -> &mut Vec<u8> {
        if self.scratch.len() <= index {
            self.scratch.resize_with(index + 1, Vec::new);
        }
        let slot = &mut self.scratch[index];
        slot.resize(len, 0);
        slot
    }
}

struct EndpointInner {
    key: String,
    endpoint_type: EndpointType,
    device_info: DeviceInfo,
    config: EngineConfig,
    device: Arc<dyn HardwareDevice>,
    dst: SharedBuffer,
    span_frames: u32,
    span_duration_ns: i64,
    ahead_ns: i64,
    status: AtomicU8,
    links: Mutex<Vec<LinkedStream>>,
    loop_lock: Mutex<()>,
    loop_cv: Condvar,
    thread_end: AtomicBool,
    need_resync: AtomicBool,
    need_clear: AtomicBool,
    device_started: AtomicBool,
    released: AtomicBool,
    last_handle_time: AtomicI64,
    counters: Counters,
}

/// Owns one hardware device and mixes (or fans out) its linked streams.
pub struct AudioEndpoint {
    inner: Arc<EndpointInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AudioEndpoint {
    /// Init the device, map its mmap buffer and start the work-loop thread.
    pub fn create(
        endpoint_type: EndpointType,
        key: impl Into<String>,
        device_info: DeviceInfo,
        device: Arc<dyn HardwareDevice>,
        config: EngineConfig,
    ) -> Result<Arc<Self>> {
        let key = key.into();
        let info = device_info.stream_info;
        info.validate()?;

        device.init(&DeviceAttr::from(&device_info))?;
        if !device.is_inited() {
            return Err(Error::operation_failed(format!("device {key} did not init")));
        }
        let descriptor = device.mmap_buffer_info()?;
        let dst = SharedAudioBuffer::create_from_descriptor(&descriptor, BufferHolder::ServerOnly)?;
        if dst.bytes_per_frame() != info.bytes_per_frame() {
            return Err(Error::invalid_param(format!(
                "device buffer has {} bytes/frame, {info} needs {}",
                dst.bytes_per_frame(),
                info.bytes_per_frame()
            )));
        }

        let span_frames = dst.span_frames();
        let span_duration_ns = info.frames_to_nanos(u64::from(span_frames));
        if span_duration_ns <= 0 || span_duration_ns >= config.max_span_duration_ns {
            return Err(Error::invalid_param(format!(
                "span of {span_frames} frames lasts {span_duration_ns}ns"
            )));
        }
        let ahead_ns = config.ahead_margin_ns(span_duration_ns);

        let mut model = LinearPosTimeModel::new();
        model.configure_rate(info.sample_rate)?;

        dst.init_span_status();
        dst.reset_cursors(0, 0)?;

        info!(
            "Endpoint {key} ({endpoint_type:?}) on {info}: span {span_frames} frames ({}us), wake {}us ahead",
            span_duration_ns / 1000,
            ahead_ns / 1000
        );

        let inner = Arc::new(EndpointInner {
            key,
            endpoint_type,
            device_info,
            config,
            device,
            dst,
            span_frames,
            span_duration_ns,
            ahead_ns,
            status: AtomicU8::new(EndpointStatus::Unlinked as u8),
            links: Mutex::new(Vec::new()),
            loop_lock: Mutex::new(()),
            loop_cv: Condvar::new(),
            thread_end: AtomicBool::new(false),
            need_resync: AtomicBool::new(false),
            need_clear: AtomicBool::new(false),
            device_started: AtomicBool::new(false),
            released: AtomicBool::new(false),
            last_handle_time: AtomicI64::new(0),
            counters: Counters::default(),
        });

        let worker_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name(format!("mixd-ep-{}", inner.device_info.name))
            .spawn(move || worker_inner.work_loop(model))?;

        Ok(Arc::new(Self {
            inner,
            worker: Mutex::new(Some(handle)),
        }))
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn endpoint_type(&self) -> EndpointType {
        self.inner.endpoint_type
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.inner.device_info
    }

    pub fn status(&self) -> EndpointStatus {
        self.inner.status()
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    pub fn linked_count(&self) -> usize {
        self.inner.links.lock().len()
    }

    pub fn stats(&self) -> EndpointStats {
        self.inner.counters.snapshot()
    }

    pub fn span_duration_ns(&self) -> i64 {
        self.inner.span_duration_ns
    }

    /// Geometry process buffers on this endpoint should use.
    pub fn prefer_buffer_info(&self) -> BufferSizeParams {
        self.inner.dst.size_params()
    }

    /// Descriptor of the device buffer, for streams that write it directly.
    pub fn device_buffer_descriptor(&self) -> SharedBufferDescriptor {
        self.inner.dst.descriptor()
    }

    fn listener_handle(&self) -> Weak<dyn ProcessStatusListener> {
        let weak: Weak<dyn ProcessStatusListener> = Arc::downgrade(&self.inner) as _;
        weak
    }

    /// Attach a configured stream and move the endpoint toward running.
    pub fn link_stream(&self, stream: &Arc<ProcessStream>) -> Result<()> {
        self.inner.link_stream(stream)?;
        stream.add_listener(self.listener_handle());
        Ok(())
    }

    /// Detach a stream. The device keeps running until the orchestrator calls
    /// `stop_unlinked` or `release`.
    pub fn unlink_stream(&self, stream: &Arc<ProcessStream>) -> Result<()> {
        stream.remove_listener(&self.listener_handle());
        self.inner.unlink_stream(stream)
    }

    /// Start the device. Only valid while `Idle`.
    pub fn start_device(&self) -> Result<()> {
        let mut guard = self.inner.loop_lock.lock();
        self.inner.start_device_locked(&mut guard)
    }

    pub fn stop_device(&self) -> Result<()> {
        let mut guard = self.inner.loop_lock.lock();
        self.inner.stop_device_locked(&mut guard)
    }

    /// Stop the device of an endpoint with no linked stream and leave it
    /// `Unlinked`, ready for the next link. Returns false and changes nothing
    /// while a stream is still linked.
    pub fn stop_unlinked(&self) -> Result<bool> {
        let inner = &self.inner;
        let mut guard = inner.loop_lock.lock();
        while inner.status() == EndpointStatus::Starting {
            inner.loop_cv.wait(&mut guard);
        }
        if inner.released.load(Ordering::Acquire) || !inner.links.lock().is_empty() {
            return Ok(false);
        }
        let stopped = inner.stop_device_locked(&mut guard);
        inner.set_status(EndpointStatus::Unlinked);
        stopped.map(|()| true)
    }

    /// Stop the work loop and the device. Repeated calls are no-ops.
    pub fn release(&self) {
        let inner = &self.inner;
        if inner.released.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Endpoint {} releasing", inner.key);

        inner.thread_end.store(true, Ordering::Release);
        {
            let _guard = inner.loop_lock.lock();
            inner.loop_cv.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("Endpoint {} work loop panicked", inner.key);
            }
        }

        {
            let mut guard = inner.loop_lock.lock();
            if let Err(e) = inner.stop_device_locked(&mut guard) {
                warn!("Endpoint {} stop on release failed: {e}", inner.key);
            }
        }
        // The loop is gone, so nothing else touches the device buffer.
        if inner.endpoint_type == EndpointType::Shared {
            inner.dst.clear();
        }

        let links = std::mem::take(&mut *inner.links.lock());
        let listener = self.listener_handle();
        for link in links {
            link.stream.remove_listener(&listener);
            link.stream.emit(StreamEvent::EndpointLost);
        }

        inner.device.deinit();
        inner.set_status(EndpointStatus::Invalid);
        info!("Endpoint {} released", inner.key);
    }

    /// Human-readable state for diagnostics.
    pub fn dump(&self) -> String {
        let inner = &self.inner;
        let info = inner.device_info.stream_info;
        let stats = inner.counters.snapshot();
        let mut out = String::new();

        let _ = writeln!(out, "Endpoint {} ({:?})", inner.key, inner.endpoint_type);
        let _ = writeln!(
            out,
            "  stream: {}Hz {}ch {}",
            info.sample_rate, info.channels, info.format
        );
        let _ = writeln!(out, "  status: {}", inner.status());
        let _ = writeln!(
            out,
            "  device read/write: {} / {}",
            inner.dst.read_frame(),
            inner.dst.write_frame()
        );
        let _ = writeln!(
            out,
            "  loops {} resyncs {} late {} underruns {} overflows {}",
            stats.loops, stats.resyncs, stats.late_wakeups, stats.underruns, stats.overflows
        );

        let links = inner.links.lock();
        let _ = writeln!(out, "  {} linked stream(s):", links.len());
        for link in links.iter() {
            let _ = writeln!(
                out,
                "    session {} {} read {} write {}",
                link.stream.session_id(),
                link.buffer.stream_status(),
                link.buffer.read_frame(),
                link.buffer.write_frame()
            );
        }
        out
    }
}

impl Drop for AudioEndpoint {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for AudioEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioEndpoint")
            .field("key", &self.inner.key)
            .field("status", &self.inner.status())
            .finish_non_exhaustive()
    }
}

impl EndpointInner {
    fn status(&self) -> EndpointStatus {
        EndpointStatus::from_u8(self.status.load(Ordering::Acquire)).unwrap_or_default()
    }

    fn set_status(&self, status: EndpointStatus) {
        let old = self.status.swap(status as u8, Ordering::AcqRel);
        if old != status as u8 {
            info!(
                "Endpoint {} status: {} -> {}",
                self.key,
                EndpointStatus::from_u8(old).unwrap_or_default(),
                status
            );
        }
    }

    fn any_running(&self) -> bool {
        self.links
            .lock()
            .iter()
            .any(|link| link.buffer.stream_status() == StreamStatus::Running)
    }

    fn link_stream(&self, stream: &Arc<ProcessStream>) -> Result<()> {
        let buffer = stream.resolve_buffer().map_err(|_| {
            Error::invalid_param(format!("stream {} has no buffer", stream.session_id()))
        })?;
        let config = stream.config();
        if config.stream_info != self.device_info.stream_info {
            return Err(Error::invalid_param(format!(
                "stream {} is {}, endpoint {} runs {}",
                stream.session_id(),
                config.stream_info,
                self.key,
                self.device_info.stream_info
            )));
        }
        if config.direction.device_role() != self.device_info.role {
            return Err(Error::invalid_param(format!(
                "{:?} stream cannot link to {:?} endpoint {}",
                config.direction, self.device_info.role, self.key
            )));
        }
        if buffer.span_frames() != self.span_frames {
            return Err(Error::invalid_param(format!(
                "stream {} uses {}-frame spans, endpoint {} needs {}",
                stream.session_id(),
                buffer.span_frames(),
                self.key,
                self.span_frames
            )));
        }
        if self.endpoint_type == EndpointType::Independent && !buffer.same_region(&self.dst) {
            return Err(Error::invalid_param(format!(
                "independent endpoint {} needs the stream to use its device buffer",
                self.key
            )));
        }
        let need_running = buffer.stream_status() == StreamStatus::Running;

        let mut guard = self.loop_lock.lock();
        while self.status() == EndpointStatus::Starting {
            debug!("Link on {} waits for device start", self.key);
            self.loop_cv.wait(&mut guard);
        }
        if self.released.load(Ordering::Acquire) {
            return Err(Error::illegal_state(format!("endpoint {} released", self.key)));
        }

        {
            let mut links = self.links.lock();
            if links.iter().any(|l| Arc::ptr_eq(&l.stream, stream)) {
                return Ok(());
            }
            let limit = match self.endpoint_type {
                EndpointType::Shared => self.config.max_linked_streams,
                EndpointType::Independent => 1,
            };
            if links.len() >= limit {
                return Err(Error::LinkLimitReached(limit));
            }
            links.push(LinkedStream {
                stream: Arc::clone(stream),
                buffer,
            });
        }

        if let Err(e) = self.settle_after_link(&mut guard, need_running) {
            self.links.lock().retain(|l| !Arc::ptr_eq(&l.stream, stream));
            return Err(e);
        }
        info!(
            "Stream {} linked to {} in {}",
            stream.session_id(),
            self.key,
            self.status()
        );
        Ok(())
    }

    fn settle_after_link(&self, guard: &mut MutexGuard<'_, ()>, need_running: bool) -> Result<()> {
        if matches!(
            self.status(),
            EndpointStatus::Unlinked | EndpointStatus::Stopped
        ) {
            self.set_status(EndpointStatus::Idle);
            if self.config.device_running_in_idle {
                self.start_device_locked(guard)?;
            }
        }

        if self.status() == EndpointStatus::Idle && need_running {
            if !self.device_started.load(Ordering::Acquire) {
                self.start_device_locked(guard)?;
            } else if self.any_running() {
                self.set_status(EndpointStatus::Running);
            }
        }
        Ok(())
    }

    fn unlink_stream(&self, stream: &Arc<ProcessStream>) -> Result<()> {
        let removed = {
            let mut links = self.links.lock();
            let before = links.len();
            links.retain(|l| !Arc::ptr_eq(&l.stream, stream));
            before != links.len()
        };
        if !removed {
            return Err(Error::invalid_param(format!(
                "stream {} is not linked to {}",
                stream.session_id(),
                self.key
            )));
        }

        let _guard = self.loop_lock.lock();
        if self.status() == EndpointStatus::Running && !self.any_running() {
            self.set_status(EndpointStatus::Idle);
        }
        info!("Stream {} unlinked from {}", stream.session_id(), self.key);
        Ok(())
    }

    fn start_device_locked(&self, guard: &mut MutexGuard<'_, ()>) -> Result<()> {
        let status = self.status();
        if status != EndpointStatus::Idle {
            return Err(Error::illegal_state(format!(
                "start device of {} in {status}",
                self.key
            )));
        }
        self.set_status(EndpointStatus::Starting);

        let result = MutexGuard::unlocked(guard, || {
            if !self.device.is_inited() {
                self.device.init(&DeviceAttr::from(&self.device_info))?;
            }
            self.device.start()
        });

        match &result {
            Ok(()) => {
                self.device_started.store(true, Ordering::Release);
                self.need_resync.store(true, Ordering::Release);
                let next = if self.any_running() {
                    EndpointStatus::Running
                } else {
                    EndpointStatus::Idle
                };
                self.set_status(next);
            }
            Err(e) => {
                error!("Endpoint {} device start failed: {e}", self.key);
                self.set_status(EndpointStatus::Stopped);
            }
        }
        self.loop_cv.notify_all();
        result
    }

    fn stop_device_locked(&self, _guard: &mut MutexGuard<'_, ()>) -> Result<()> {
        let status = self.status();
        if !matches!(
            status,
            EndpointStatus::Idle | EndpointStatus::Running | EndpointStatus::Starting
        ) {
            debug!("Endpoint {} stop skipped in {status}", self.key);
            return Ok(());
        }
        self.set_status(EndpointStatus::Stopping);
        if self.endpoint_type == EndpointType::Shared {
            self.need_clear.store(true, Ordering::Release);
        }
        self.device_started.store(false, Ordering::Release);
        let result = self.device.stop();
        if let Err(e) = &result {
            error!("Endpoint {} device stop failed: {e}", self.key);
        }
        self.set_status(EndpointStatus::Stopped);
        self.loop_cv.notify_all();
        result
    }

    fn on_device_failure(&self, err: &Error) {
        if !matches!(
            self.status(),
            EndpointStatus::Running | EndpointStatus::Idle
        ) {
            debug!("Endpoint {} ignoring failure while stopping: {err}", self.key);
            return;
        }
        error!("Endpoint {} device failure: {err}", self.key);
        {
            let mut guard = self.loop_lock.lock();
            let _ = self.stop_device_locked(&mut guard);
        }
        for link in self.links.lock().iter() {
            link.stream.emit(StreamEvent::EndpointLost);
        }
    }

    /// True if the loop should do an iteration now; otherwise waits a while.
    fn keep_running(&self) -> bool {
        let started = self.device_started.load(Ordering::Acquire);
        match self.status() {
            EndpointStatus::Running if started => return true,
            EndpointStatus::Idle if started && self.config.device_running_in_idle => return true,
            _ => {}
        }

        if self.need_clear.swap(false, Ordering::AcqRel) {
            self.dst.clear();
        }

        let mut guard = self.loop_lock.lock();
        if self.thread_end.load(Ordering::Acquire) {
            return false;
        }
        let status = self.status();
        if status == EndpointStatus::Running && self.device_started.load(Ordering::Acquire) {
            return false;
        }
        debug!("Endpoint {} is {status}, work loop waiting", self.key);
        self.loop_cv.wait_for(&mut guard, self.config.idle_wait());
        false
    }

    fn work_loop(self: Arc<Self>, model: LinearPosTimeModel) {
        let span_bytes = self.dst.size_params().span_bytes();
        let mut state = LoopState {
            model,
            cur_frame: 0,
            spans_since_resync: 0,
            scratch: Vec::new(),
            volumes: Vec::new(),
            silence: vec![mix::silence_byte(self.device_info.stream_info.format); span_bytes],
            consumed: Vec::new(),
        };
        let mut wake_up = clock::now_ns();
        info!("Endpoint {} work loop start", self.key);

        while !self.thread_end.load(Ordering::Acquire) {
            if !self.keep_running() {
                continue;
            }
            let cur_time = clock::now_ns();

            if self.need_resync.swap(false, Ordering::AcqRel) {
                if let Err(e) = self.resync_position(&mut state) {
                    self.on_device_failure(&e);
                }
                wake_up = cur_time;
                continue;
            }
            if cur_time - wake_up > self.config.late_wakeup_tolerance_ns {
                Counters::bump(&self.counters.late_wakeups);
                warn!(
                    "Endpoint {} woke up {}us late",
                    self.key,
                    (cur_time - wake_up) / 1000
                );
            }

            let cur_frame = state.cur_frame;
            self.check_all_ready(wake_up, cur_frame, &state);

            let handled = match (self.device_info.role, self.endpoint_type) {
                (DeviceRole::Output, EndpointType::Shared) => {
                    self.mix_to_device(cur_frame, &mut state)
                }
                (DeviceRole::Output, EndpointType::Independent) => {
                    self.pass_through_to_device(&mut state)
                }
                (DeviceRole::Input, EndpointType::Shared) => {
                    self.capture_to_streams(cur_frame)
                }
                (DeviceRole::Input, EndpointType::Independent) => {
                    self.capture_to_device_buffer(&mut state)
                }
            };

            match handled {
                Ok(()) => {
                    wake_up = self.prepare_next_loop(cur_frame, &mut state);
                    clock::sleep_until_ns(wake_up);
                }
                Err(e) => {
                    self.release_consumed(&mut state);
                    self.on_device_failure(&e);
                }
            }
        }
        info!("Endpoint {} work loop end", self.key);
    }

    /// Re-anchor the time model on the hardware position after a start or a gap.
    fn resync_position(&self, state: &mut LoopState) -> Result<()> {
        let pos = self.device.mmap_handle_position()?;
        let read_time = pos.time_ns();
        let query_cost = clock::now_ns() - read_time;
        if query_cost > self.span_duration_ns {
            warn!("Endpoint {} position query took {}us", self.key, query_cost / 1000);
        }

        state.model.reset_anchor(pos.frames, read_time);
        let span = u64::from(self.span_frames);
        let next = (pos.frames / span + 1) * span;
        if self.endpoint_type == EndpointType::Shared {
            self.dst.init_span_status();
            self.dst.reset_cursors(next, next)?;
        }
        state.cur_frame = next;
        state.spans_since_resync = 0;
        Counters::bump(&self.counters.resyncs);
        debug!(
            "Endpoint {} resynced at hw frame {}, next span {next}",
            self.key, pos.frames
        );
        Ok(())
    }

    fn span_ready(buffer: &SharedAudioBuffer) -> bool {
        let read = buffer.read_frame();
        read < buffer.write_frame()
            && buffer
                .span_info(read)
                .is_some_and(|span| span.status() == SpanStatus::WriteDone)
    }

    /// Record handle info for every stream; if a running one is late, sleep
    /// until just before the hardware needs the span.
    fn check_all_ready(&self, check_time: i64, cur_frame: u64, state: &LoopState) {
        let mut all_ready = true;
        {
            let links = self.links.lock();
            self.last_handle_time.store(check_time, Ordering::Release);
            for link in links.iter() {
                link.buffer
                    .set_handle_info(link.buffer.read_frame(), check_time);
                if self.device_info.role == DeviceRole::Input
                    || link.buffer.stream_status() != StreamStatus::Running
                {
                    continue;
                }
                if !Self::span_ready(&link.buffer) {
                    trace!(
                        "Endpoint {} stream {} not ready",
                        self.key,
                        link.stream.session_id()
                    );
                    all_ready = false;
                }
            }
        }
        if all_ready {
            return;
        }

        let wait_ahead = self.config.unready_wait_ahead_ns;
        let now = clock::now_ns();
        match state.model.predict_time(cur_frame) {
            Ok(deadline) if deadline - wait_ahead - now >= wait_ahead => {
                clock::sleep_until_ns(deadline - wait_ahead);
            }
            _ => clock::relative_sleep_ns(wait_ahead),
        }
    }

    fn mix_to_device(&self, cur_frame: u64, state: &mut LoopState) -> Result<()> {
        state.volumes.clear();
        let span_bytes = self.dst.size_params().span_bytes();
        {
            let links = self.links.lock();
            for link in links.iter() {
                if link.buffer.stream_status() != StreamStatus::Running {
                    continue;
                }
                let read = link.buffer.read_frame();
                let slot_index = state.volumes.len();
                let slot = state.scratch_slot(slot_index, span_bytes);
                let taken = link.buffer.with_read_span(read, |span, bytes| {
                    span.set_read_start_time(clock::now_ns());
                    let len = slot.len().min(bytes.len());
                    slot[..len].copy_from_slice(&bytes[..len]);
                    slot[len..].fill(0);
                    let (start, end) = span.volume();
                    (start, end, span.is_mute())
                });
                match taken {
                    Ok(Some(volume)) => {
                        state.volumes.push(volume);
                        state.consumed.push((Arc::clone(&link.buffer), read));
                    }
                    Ok(None) | Err(_) => {
                        Counters::bump(&self.counters.underruns);
                        link.stream.record_underrun();
                    }
                }
            }
        }

        let info = self.device_info.stream_info;
        let sources = state.volumes.iter().zip(&state.scratch).map(
            |(&(volume_start, volume_end, muted), data)| MixSource {
                data,
                volume_start,
                volume_end,
                muted,
            },
        );
        let mixed = self.dst.with_write_span(cur_frame, |span, bytes| {
            span.set_offset_in_frame(cur_frame);
            span.set_write_start_time(clock::now_ns());
            let result = mix::mix_into(bytes, sources, info.format, info.channels);
            span.set_write_done_time(clock::now_ns());
            result
        })?;
        self.publish_device_span(cur_frame, mixed)?;

        let rendered = self
            .dst
            .with_read_span(cur_frame, |span, bytes| {
                span.set_read_start_time(clock::now_ns());
                self.device.render_frame(bytes)
            })?
            .ok_or_else(|| Error::illegal_state(format!("device span {cur_frame} not published")))?;
        self.finish_device_span(cur_frame)?;
        let written = rendered?;
        if written < span_bytes {
            debug!("Endpoint {} short render: {written}/{span_bytes}", self.key);
        }
        Ok(())
    }

    /// Settle a device span the loop itself claimed for writing: publish it,
    /// or hand it straight back if filling it failed.
    fn publish_device_span(&self, pos: u64, written: Option<Result<()>>) -> Result<()> {
        let Some(result) = written else {
            return Err(Error::illegal_state(format!(
                "device span {pos} is held elsewhere"
            )));
        };
        let span = self
            .dst
            .span_info(pos)
            .ok_or_else(|| Error::illegal_state(format!("device span {pos} left the window")))?;
        if let Err(e) = result {
            span.reset();
            return Err(e);
        }
        span.try_transition(SpanStatus::Writing, SpanStatus::WriteDone);
        self.dst.set_cur_write_frame(pos + u64::from(self.span_frames))
    }

    /// Release a device span the loop read itself and move past it.
    fn finish_device_span(&self, pos: u64) -> Result<()> {
        self.dst.release_read_span(pos)?;
        self.dst.set_cur_read_frame(pos + u64::from(self.span_frames))
    }

    /// The single stream writes the device buffer itself; hand its span on.
    fn pass_through_to_device(&self, state: &mut LoopState) -> Result<()> {
        let running = self
            .links
            .lock()
            .first()
            .map(|link| (Arc::clone(&link.stream), link.buffer.stream_status()));
        let read = self.dst.read_frame();

        let rendered = self.dst.with_read_span(read, |span, bytes| {
            span.set_read_start_time(clock::now_ns());
            self.device.render_frame(bytes).map(|_| ())
        });

        match rendered {
            Ok(Some(result)) => {
                state.consumed.push((Arc::clone(&self.dst), read));
                result
            }
            Ok(None) | Err(_) => {
                if let Some((stream, StreamStatus::Running)) = running {
                    Counters::bump(&self.counters.underruns);
                    stream.record_underrun();
                }
                self.device.render_frame(&state.silence).map(|_| ())
            }
        }
    }

    fn capture_to_streams(&self, cur_frame: u64) -> Result<()> {
        let captured = self.dst.with_write_span(cur_frame, |span, bytes| {
            span.set_offset_in_frame(cur_frame);
            span.set_write_start_time(clock::now_ns());
            let result = self.device.capture_frame(bytes).map(|_| ());
            span.set_write_done_time(clock::now_ns());
            result
        })?;
        self.publish_device_span(cur_frame, captured)?;

        self.dst
            .with_read_span(cur_frame, |span, bytes| {
                span.set_read_start_time(clock::now_ns());
                self.fan_out(bytes);
            })?
            .ok_or_else(|| Error::illegal_state(format!("device span {cur_frame} not published")))?;
        self.finish_device_span(cur_frame)
    }

    /// Copy one captured span into the next free span of every running stream.
    fn fan_out(&self, captured: &[u8]) {
        for link in self.links.lock().iter() {
            if link.buffer.stream_status() != StreamStatus::Running {
                continue;
            }
            let pos = link.buffer.write_frame();
            let delivered = link.buffer.with_write_span(pos, |span, bytes| {
                span.set_offset_in_frame(pos);
                span.set_write_start_time(clock::now_ns());
                let len = bytes.len().min(captured.len());
                bytes[..len].copy_from_slice(&captured[..len]);
                bytes[len..].fill(0);
                span.set_write_done_time(clock::now_ns());
            });

            match delivered {
                Ok(Some(())) => {
                    if let Some(span) = link.buffer.span_info(pos) {
                        span.try_transition(SpanStatus::Writing, SpanStatus::WriteDone);
                    }
                    let next = pos + u64::from(link.buffer.span_frames());
                    if let Err(e) = link.buffer.set_cur_write_frame(next) {
                        warn!("Stream {} write cursor: {e}", link.stream.session_id());
                    }
                }
                Ok(None) | Err(_) => {
                    Counters::bump(&self.counters.overflows);
                    debug!(
                        "Endpoint {} stream {} overflow at {pos}",
                        self.key,
                        link.stream.session_id()
                    );
                }
            }
        }
    }

    /// The single stream reads the device buffer itself; fill its next span.
    fn capture_to_device_buffer(&self, state: &mut LoopState) -> Result<()> {
        let pos = self.dst.write_frame();
        let captured = self.dst.with_write_span(pos, |span, bytes| {
            span.set_offset_in_frame(pos);
            span.set_write_start_time(clock::now_ns());
            let result = self.device.capture_frame(bytes).map(|_| ());
            span.set_write_done_time(clock::now_ns());
            result
        });

        match captured {
            Ok(Some(result)) => self.publish_device_span(pos, Some(result)),
            Ok(None) | Err(_) => {
                Counters::bump(&self.counters.overflows);
                // Keep the hardware drained even though nobody takes the data.
                let discard = state.scratch_slot(0, self.dst.size_params().span_bytes());
                self.device.capture_frame(discard).map(|_| ())
            }
        }
    }

    /// Release consumed client spans and work out when to wake for the next
    /// span.
    fn prepare_next_loop(&self, cur_frame: u64, state: &mut LoopState) -> i64 {
        let next = cur_frame + u64::from(self.span_frames);
        state.cur_frame = next;
        state.spans_since_resync += 1;

        if self.config.should_resync(state.spans_since_resync) {
            match self.device.mmap_handle_position() {
                Ok(pos) => {
                    if let Some(drift) = state.model.update_anchor(pos.frames, pos.time_ns()) {
                        trace!("Endpoint {} model drift {drift}ns", self.key);
                    }
                }
                Err(e) => warn!("Endpoint {} position query failed: {e}", self.key),
            }
        }

        let wake_up = match state.model.predict_time(next) {
            Ok(hw_time) => hw_time - self.ahead_ns,
            Err(e) => {
                warn!("Endpoint {} lost track of the device clock: {e}", self.key);
                self.need_resync.store(true, Ordering::Release);
                clock::now_ns()
            }
        };

        self.release_consumed(state);
        Counters::bump(&self.counters.loops);
        wake_up
    }

    /// Hand every client span read this iteration back to its writer.
    fn release_consumed(&self, state: &mut LoopState) {
        for (buffer, pos) in state.consumed.drain(..) {
            if let Err(e) = buffer.release_read_span(pos) {
                warn!("Endpoint {} release span {pos}: {e}", self.key);
                continue;
            }
            if let Err(e) = buffer.set_cur_read_frame(pos + u64::from(buffer.span_frames())) {
                warn!("Endpoint {} read cursor: {e}", self.key);
            }
        }
    }

    fn find_link_buffer(&self, stream: &ProcessStream) -> Option<SharedBuffer> {
        self.links
            .lock()
            .iter()
            .find(|link| std::ptr::eq(Arc::as_ptr(&link.stream), stream))
            .map(|link| Arc::clone(&link.buffer))
    }
}

impl ProcessStatusListener for EndpointInner {
    fn on_start(&self, stream: &ProcessStream) -> Result<()> {
        let mut guard = self.loop_lock.lock();
        while self.status() == EndpointStatus::Starting {
            self.loop_cv.wait(&mut guard);
        }
        match self.status() {
            EndpointStatus::Running => Ok(()),
            EndpointStatus::Idle => {
                if !self.device_started.load(Ordering::Acquire) {
                    self.start_device_locked(&mut guard)?;
                }
                self.set_status(EndpointStatus::Running);
                Ok(())
            }
            status => Err(Error::illegal_state(format!(
                "stream {} started on endpoint {} in {status}",
                stream.session_id(),
                self.key
            ))),
        }
    }

    fn on_pause(&self, stream: &ProcessStream) -> Result<()> {
        let _guard = self.loop_lock.lock();
        if self.status() == EndpointStatus::Running && !self.any_running() {
            self.set_status(EndpointStatus::Idle);
        }
        if self.status() == EndpointStatus::Idle && !self.config.device_running_in_idle {
            debug!(
                "Endpoint {} idle after stream {} paused, device left started",
                self.key,
                stream.session_id()
            );
        }
        Ok(())
    }

    fn on_update_handle_info(&self, stream: &ProcessStream) -> Result<()> {
        let buffer = self.find_link_buffer(stream).ok_or_else(|| {
            Error::operation_failed(format!(
                "stream {} not linked to {}",
                stream.session_id(),
                self.key
            ))
        })?;
        let time = self.last_handle_time.load(Ordering::Acquire);
        buffer.set_handle_info(buffer.read_frame(), time);
        Ok(())
    }
}
