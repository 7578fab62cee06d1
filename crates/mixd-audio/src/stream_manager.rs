//! Capability for ordinary (non-mmap) renderers and capturers.
//!
//! Streams that do not need the low-latency path are handed to a stream
//! manager instead of an endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info};

use mixd_core::{Error, ProcessConfig, Result, StreamDirection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NormalStreamKind {
    Renderer,
    Capturer,
}

impl From<StreamDirection> for NormalStreamKind {
    fn from(direction: StreamDirection) -> Self {
        match direction {
            StreamDirection::Playback => Self::Renderer,
            StreamDirection::Capture => Self::Capturer,
        }
    }
}

/// A stream owned by a stream manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalStreamHandle {
    pub id: u32,
    pub kind: NormalStreamKind,
    pub config: ProcessConfig,
}

pub trait StreamManager: Send + Sync {
    fn create_renderer(&self, config: &ProcessConfig) -> Result<NormalStreamHandle>;
    fn create_capturer(&self, config: &ProcessConfig) -> Result<NormalStreamHandle>;
    fn release(&self, handle: &NormalStreamHandle) -> Result<()>;
}

/// Keeps handles in a map; stands in for a real manager in the daemon and tests.
#[derive(Debug, Default)]
pub struct InMemoryStreamManager {
    next_id: AtomicU32,
    streams: Mutex<HashMap<u32, NormalStreamHandle>>,
}

impl InMemoryStreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_count(&self) -> usize {
        self.streams.lock().len()
    }

    fn create(&self, config: &ProcessConfig, kind: NormalStreamKind) -> Result<NormalStreamHandle> {
        config.stream_info.validate()?;
        if NormalStreamKind::from(config.direction) != kind {
            return Err(Error::invalid_param(format!(
                "{:?} config cannot create a {kind:?}",
                config.direction
            )));
        }
        let handle = NormalStreamHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            kind,
            config: config.clone(),
        };
        self.streams.lock().insert(handle.id, handle.clone());
        info!("Created {kind:?} {} ({})", handle.id, config.stream_info);
        Ok(handle)
    }
}

impl StreamManager for InMemoryStreamManager {
    fn create_renderer(&self, config: &ProcessConfig) -> Result<NormalStreamHandle> {
        self.create(config, NormalStreamKind::Renderer)
    }

    fn create_capturer(&self, config: &ProcessConfig) -> Result<NormalStreamHandle> {
        self.create(config, NormalStreamKind::Capturer)
    }

    fn release(&self, handle: &NormalStreamHandle) -> Result<()> {
        match self.streams.lock().remove(&handle.id) {
            Some(_) => {
                debug!("Released {:?} {}", handle.kind, handle.id);
                Ok(())
            }
            None => Err(Error::invalid_param(format!(
                "unknown normal stream {}",
                handle.id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

    use super::*;
    use mixd_core::StreamInfo;

    #[test]
    fn test_create_and_release() {
        let manager = InMemoryStreamManager::new();
        let renderer = manager
            .create_renderer(&ProcessConfig::playback(StreamInfo::default()))
            .unwrap();
        let capturer = manager
            .create_capturer(&ProcessConfig::capture(StreamInfo::default()))
            .unwrap();
        assert_ne!(renderer.id, capturer.id);
        assert_eq!(capturer.kind, NormalStreamKind::Capturer);
        assert_eq!(manager.active_count(), 2);

        manager.release(&renderer).unwrap();
        assert!(manager.release(&renderer).unwrap_err().is_invalid_param());
        assert_eq!(manager.active_count(), 1);
    }

    #[test]
    fn test_direction_mismatch() {
        let manager = InMemoryStreamManager::new();
        let err = manager
            .create_capturer(&ProcessConfig::playback(StreamInfo::default()))
            .unwrap_err();
        assert!(err.is_invalid_param());
    }
}
