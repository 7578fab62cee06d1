//! Status enums shared between the engine and its clients.
//!
//! Every enum here is stored in an atomic byte at runtime, so each carries a
//! stable `u8` encoding.

use serde::{Deserialize, Serialize};

/// Status of one span inside a shared ring buffer.
///
/// A playback buffer cycles `ReadDone -> Writing -> WriteDone -> Reading ->
/// ReadDone`. Capture buffers walk the same cycle with the roles swapped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum SpanStatus {
    #[default]
    ReadDone = 0,
    Writing = 1,
    WriteDone = 2,
    Reading = 3,
}

impl SpanStatus {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::ReadDone),
            1 => Some(Self::Writing),
            2 => Some(Self::WriteDone),
            3 => Some(Self::Reading),
            _ => None,
        }
    }

    /// The only status this one may move to.
    pub const fn successor(self) -> Self {
        match self {
            Self::ReadDone => Self::Writing,
            Self::Writing => Self::WriteDone,
            Self::WriteDone => Self::Reading,
            Self::Reading => Self::ReadDone,
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        self.successor() == next
    }
}

/// Lifecycle of a client stream, shared with the client through its buffer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum StreamStatus {
    #[default]
    Invalid = 0,
    Idle = 1,
    Starting = 2,
    Running = 3,
    Paused = 4,
    Stopping = 5,
    Stopped = 6,
    Released = 7,
}

impl StreamStatus {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Invalid),
            1 => Some(Self::Idle),
            2 => Some(Self::Starting),
            3 => Some(Self::Running),
            4 => Some(Self::Paused),
            5 => Some(Self::Stopping),
            6 => Some(Self::Stopped),
            7 => Some(Self::Released),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Invalid => "INVALID",
            Self::Idle => "IDLE",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Released => "RELEASED",
        }
    }
}

/// Lifecycle of an endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum EndpointStatus {
    #[default]
    Invalid = 0,
    Unlinked = 1,
    Idle = 2,
    Starting = 3,
    Running = 4,
    Stopping = 5,
    Stopped = 6,
}

impl EndpointStatus {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Invalid),
            1 => Some(Self::Unlinked),
            2 => Some(Self::Idle),
            3 => Some(Self::Starting),
            4 => Some(Self::Running),
            5 => Some(Self::Stopping),
            6 => Some(Self::Stopped),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Invalid => "INVALID",
            Self::Unlinked => "UNLINKED",
            Self::Idle => "IDLE",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
        }
    }
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
