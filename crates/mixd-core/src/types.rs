//! Core domain types for mixd.

pub mod device;
pub mod format;
pub mod process;
pub mod status;

pub use device::{DeviceInfo, DeviceRole, DeviceType, EndpointType, LOCAL_NETWORK_ID};
pub use format::{SampleFormat, StreamInfo};
pub use process::{ProcessConfig, StreamDirection, StreamUsage};
pub use status::{EndpointStatus, SpanStatus, StreamStatus};
