//! # mixd-audio
//!
//! Low-latency endpoint engine for mixd.
//!
//! Features:
//! - Span-based shared ring buffers with a lock-free status handshake
//! - One real-time work loop per hardware device, woken ahead of the
//!   predicted hardware deadline
//! - Saturating multi-stream mixing for every supported sample format
//! - Orchestrator with endpoint reuse and delayed release

pub mod buffer;
pub mod clock;
pub mod device;
pub mod endpoint;
pub mod mix;
pub mod mock;
pub mod process;
pub mod service;
pub mod stream_manager;
pub mod time_model;

pub use buffer::{BufferHolder, BufferSizeParams, HandleInfo, SharedAudioBuffer, SharedBuffer};
pub use device::{DeviceFactory, HardwareDevice};
pub use endpoint::{AudioEndpoint, EndpointStats};
pub use process::{ProcessStream, StreamEvent};
pub use service::AudioService;
pub use stream_manager::{InMemoryStreamManager, StreamManager};
pub use time_model::LinearPosTimeModel;
