//! Boundary to hardware sink and source drivers.
//!
//! Drivers own their mmap buffer and hand the endpoint a descriptor for it.
//! All methods take `&self`: a driver is shared between the orchestrator and
//! the endpoint work loop, so it keeps its own state behind a lock.

use std::sync::Arc;

use mixd_core::types::format::NANOS_PER_SECOND;
use mixd_core::{DeviceInfo, DeviceRole, Result, StreamInfo};

use crate::buffer::SharedBufferDescriptor;

/// Attributes a driver is initialized with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAttr {
    pub name: String,
    pub role: DeviceRole,
    pub stream_info: StreamInfo,
}

impl From<&DeviceInfo> for DeviceAttr {
    fn from(info: &DeviceInfo) -> Self {
        Self {
            name: info.name.clone(),
            role: info.role,
            stream_info: info.stream_info,
        }
    }
}

/// Frame position reported by the hardware and the time it was sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlePosition {
    pub frames: u64,
    pub sec: i64,
    pub nsec: i64,
}

impl HandlePosition {
    pub const fn time_ns(&self) -> i64 {
        self.sec * NANOS_PER_SECOND + self.nsec
    }
}

/// A hardware sink (output) or source (input) with an mmap buffer.
pub trait HardwareDevice: Send + Sync {
    fn init(&self, attr: &DeviceAttr) -> Result<()>;
    fn is_inited(&self) -> bool;
    fn deinit(&self);

    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn pause(&self) -> Result<()>;
    fn resume(&self) -> Result<()>;
    fn flush(&self) -> Result<()>;
    fn reset(&self) -> Result<()>;

    /// Hand one rendered span to the sink; returns bytes accepted.
    fn render_frame(&self, data: &[u8]) -> Result<usize>;
    /// Fill `data` with one captured span; returns bytes produced.
    fn capture_frame(&self, data: &mut [u8]) -> Result<usize>;

    fn latency_us(&self) -> Result<u64>;
    fn mmap_buffer_info(&self) -> Result<SharedBufferDescriptor>;
    fn mmap_handle_position(&self) -> Result<HandlePosition>;
}

/// Opens drivers for the devices the orchestrator routes to.
pub trait DeviceFactory: Send + Sync {
    fn open(&self, info: &DeviceInfo) -> Result<Arc<dyn HardwareDevice>>;
}
