//! Server-side handle for one client stream.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use mixd_core::{Error, ProcessConfig, Result, StreamStatus};

use crate::buffer::{
    BufferHolder, BufferSizeParams, HandleInfo, SharedAudioBuffer, SharedBuffer,
    SharedBufferDescriptor,
};

/// Pending client events kept before the oldest are dropped.
const EVENT_QUEUE_DEPTH: usize = 64;

/// Events delivered to the client that owns a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    Started,
    Paused,
    Stopped,
    Released,
    /// The endpoint needed a span the client had not written.
    Underrun,
    /// The endpoint serving this stream stopped on a device failure.
    EndpointLost,
}

/// Reacts to status changes of a linked stream. Held weakly by the stream.
pub trait ProcessStatusListener: Send + Sync {
    fn on_start(&self, stream: &ProcessStream) -> Result<()>;
    fn on_pause(&self, stream: &ProcessStream) -> Result<()>;
    fn on_update_handle_info(&self, stream: &ProcessStream) -> Result<()>;
}

/// Told once when a stream is released, whatever triggered it.
pub trait ProcessReleaseCallback: Send + Sync {
    fn on_process_release(&self, stream: &ProcessStream);
}

pub struct ProcessStream {
    session_id: u32,
    config: ProcessConfig,
    buffer: OnceCell<SharedBuffer>,
    released: AtomicBool,
    listeners: Mutex<Vec<Weak<dyn ProcessStatusListener>>>,
    release_callback: Mutex<Option<Weak<dyn ProcessReleaseCallback>>>,
    event_tx: Sender<StreamEvent>,
    event_rx: Receiver<StreamEvent>,
    underruns: AtomicU64,
}

impl ProcessStream {
    pub fn new(session_id: u32, config: ProcessConfig) -> Arc<Self> {
        let (event_tx, event_rx) = bounded(EVENT_QUEUE_DEPTH);
        Arc::new(Self {
            session_id,
            config,
            buffer: OnceCell::new(),
            released: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            release_callback: Mutex::new(None),
            event_tx,
            event_rx,
            underruns: AtomicU64::new(0),
        })
    }

    pub const fn session_id(&self) -> u32 {
        self.session_id
    }

    pub const fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Configured and not yet released.
    pub fn is_inited(&self) -> bool {
        self.buffer.get().is_some() && !self.is_released()
    }

    /// Set up the stream's buffer. Later calls return the first buffer.
    ///
    /// With `external` the given buffer is mapped as-is and the sizes are
    /// ignored; otherwise a new zero-filled buffer is allocated.
    pub fn configure_buffer(
        &self,
        total_frames: u32,
        span_frames: u32,
        external: Option<&SharedBufferDescriptor>,
    ) -> Result<SharedBuffer> {
        if self.is_released() {
            return Err(Error::illegal_state(format!(
                "stream {} already released",
                self.session_id
            )));
        }
        let bytes_per_frame = self.config.stream_info.bytes_per_frame();

        let buffer = self.buffer.get_or_try_init(|| {
            let buffer = match external {
                Some(descriptor) => {
                    if descriptor.params().bytes_per_frame != bytes_per_frame {
                        return Err(Error::invalid_param(format!(
                            "external buffer has {} bytes/frame, stream needs {bytes_per_frame}",
                            descriptor.params().bytes_per_frame
                        )));
                    }
                    SharedAudioBuffer::create_from_descriptor(descriptor, BufferHolder::ServerOnly)?
                }
                None => {
                    BufferSizeParams::new(total_frames, span_frames, bytes_per_frame).validate()?;
                    SharedAudioBuffer::create_local(
                        total_frames,
                        span_frames,
                        bytes_per_frame,
                        BufferHolder::ServerShared,
                    )?
                }
            };
            buffer.init_span_status();
            buffer.set_stream_status(StreamStatus::Idle);
            info!(
                "Stream {} configured {:?} buffer {:?}",
                self.session_id,
                buffer.holder(),
                buffer.size_params()
            );
            Ok(buffer)
        })?;
        Ok(Arc::clone(buffer))
    }

    /// The stream's buffer, if configured.
    pub fn buffer(&self) -> Option<&SharedBuffer> {
        self.buffer.get()
    }

    pub fn resolve_buffer(&self) -> Result<SharedBuffer> {
        self.buffer
            .get()
            .cloned()
            .ok_or_else(|| Error::illegal_state(format!("stream {} has no buffer", self.session_id)))
    }

    /// Descriptor the client maps its side of the buffer from.
    pub fn buffer_descriptor(&self) -> Result<SharedBufferDescriptor> {
        Ok(self.resolve_buffer()?.descriptor())
    }

    pub fn status(&self) -> StreamStatus {
        self.buffer
            .get()
            .map_or(StreamStatus::Invalid, |buffer| buffer.stream_status())
    }

    fn inited_buffer(&self) -> Result<&SharedBuffer> {
        if self.is_released() {
            return Err(Error::illegal_state(format!(
                "stream {} already released",
                self.session_id
            )));
        }
        self.buffer
            .get()
            .ok_or_else(|| Error::illegal_state(format!("stream {} not configured", self.session_id)))
    }

    /// Client side of a start: flag the shared status as `Starting`.
    pub fn request_start(&self) -> Result<()> {
        let buffer = self.inited_buffer()?;
        for from in [StreamStatus::Idle, StreamStatus::Paused, StreamStatus::Stopped] {
            if buffer.compare_set_stream_status(from, StreamStatus::Starting) {
                return Ok(());
            }
        }
        Err(Error::illegal_state(format!(
            "stream {} cannot start from {}",
            self.session_id,
            buffer.stream_status()
        )))
    }

    /// Complete a start the client requested. The status must be `Starting`.
    pub fn start(&self) -> Result<()> {
        let buffer = self.inited_buffer()?;
        if buffer.stream_status() != StreamStatus::Starting {
            return Err(Error::illegal_state(format!(
                "start of stream {} in {}",
                self.session_id,
                buffer.stream_status()
            )));
        }

        for listener in self.live_listeners() {
            if let Err(e) = listener.on_start(self) {
                warn!("Stream {} start listener failed: {e}", self.session_id);
            }
        }

        buffer.set_stream_status(StreamStatus::Running);
        self.emit(StreamEvent::Started);
        info!("Stream {} started", self.session_id);
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        let buffer = self.inited_buffer()?;
        if !buffer.compare_set_stream_status(StreamStatus::Running, StreamStatus::Paused) {
            return Err(Error::illegal_state(format!(
                "pause of stream {} in {}",
                self.session_id,
                buffer.stream_status()
            )));
        }
        self.notify_pause();
        self.emit(StreamEvent::Paused);
        info!("Stream {} paused", self.session_id);
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let buffer = self.inited_buffer()?;
        if !buffer.compare_set_stream_status(StreamStatus::Paused, StreamStatus::Starting) {
            return Err(Error::illegal_state(format!(
                "resume of stream {} in {}",
                self.session_id,
                buffer.stream_status()
            )));
        }
        self.start()
    }

    pub fn stop(&self) -> Result<()> {
        let buffer = self.inited_buffer()?;
        let stoppable = [
            StreamStatus::Running,
            StreamStatus::Paused,
            StreamStatus::Starting,
            StreamStatus::Idle,
        ];
        if !stoppable
            .into_iter()
            .any(|from| buffer.compare_set_stream_status(from, StreamStatus::Stopping))
        {
            return Err(Error::illegal_state(format!(
                "stop of stream {} in {}",
                self.session_id,
                buffer.stream_status()
            )));
        }
        self.notify_pause();
        buffer.set_stream_status(StreamStatus::Stopped);
        self.emit(StreamEvent::Stopped);
        info!("Stream {} stopped", self.session_id);
        Ok(())
    }

    /// Tear the stream down. Repeated calls are no-ops.
    pub fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            debug!("Stream {} already released", self.session_id);
            return Ok(());
        }
        if let Some(buffer) = self.buffer.get() {
            buffer.set_stream_status(StreamStatus::Released);
        }

        let callback = self.release_callback.lock().take();
        if let Some(callback) = callback.and_then(|weak| weak.upgrade()) {
            callback.on_process_release(self);
        }
        self.listeners.lock().clear();
        self.emit(StreamEvent::Released);
        info!("Stream {} released", self.session_id);
        Ok(())
    }

    /// The client process went away; same as an explicit release.
    pub fn notify_client_died(&self) {
        warn!(
            "Client {} of stream {} died",
            self.config.client_pid, self.session_id
        );
        if let Err(e) = self.release() {
            warn!("Release after client death failed: {e}");
        }
    }

    /// Ask the listeners to refresh the handle info, then read it back.
    pub fn request_handle_info(&self) -> Result<Option<HandleInfo>> {
        let buffer = self.inited_buffer()?;
        for listener in self.live_listeners() {
            listener.on_update_handle_info(self)?;
        }
        Ok(buffer.handle_info())
    }

    pub fn add_listener(&self, listener: Weak<dyn ProcessStatusListener>) {
        let mut listeners = self.listeners.lock();
        listeners.retain(|l| l.strong_count() > 0);
        if !listeners.iter().any(|l| l.ptr_eq(&listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove_listener(&self, listener: &Weak<dyn ProcessStatusListener>) {
        self.listeners
            .lock()
            .retain(|l| !l.ptr_eq(listener) && l.strong_count() > 0);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .iter()
            .filter(|l| l.strong_count() > 0)
            .count()
    }

    pub fn set_release_callback(&self, callback: Weak<dyn ProcessReleaseCallback>) {
        *self.release_callback.lock() = Some(callback);
    }

    /// Receiver of this stream's client events.
    pub fn events(&self) -> Receiver<StreamEvent> {
        self.event_rx.clone()
    }

    pub fn underrun_count(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub(crate) fn record_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
        self.emit(StreamEvent::Underrun);
    }

    pub(crate) fn emit(&self, event: StreamEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => trace!("Stream {} event queue full", self.session_id),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    // Snapshot so no lock is held while listeners run.
    fn live_listeners(&self) -> Vec<Arc<dyn ProcessStatusListener>> {
        self.listeners.lock().iter().filter_map(Weak::upgrade).collect()
    }

    fn notify_pause(&self) {
        for listener in self.live_listeners() {
            if let Err(e) = listener.on_pause(self) {
                warn!("Stream {} pause listener failed: {e}", self.session_id);
            }
        }
    }
}

impl std::fmt::Debug for ProcessStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessStream")
            .field("session_id", &self.session_id)
            .field("status", &self.status())
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}
