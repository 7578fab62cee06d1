//! Lock-free span buffers shared between a stream and its endpoint.

pub mod shared;
pub mod span;

pub use shared::{
    BufferHolder, BufferSizeParams, HandleInfo, SharedAudioBuffer, SharedBuffer,
    SharedBufferDescriptor,
};
pub use span::{SpanInfo, UNITY_VOLUME, VOLUME_SHIFT};
