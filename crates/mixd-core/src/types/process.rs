//! Client stream configuration.

use serde::{Deserialize, Serialize};

use super::{DeviceRole, StreamInfo};

/// Data direction of a client stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamDirection {
    #[default]
    Playback,
    Capture,
}

impl StreamDirection {
    /// Device role a stream of this direction is routed to.
    pub const fn device_role(self) -> DeviceRole {
        match self {
            Self::Playback => DeviceRole::Output,
            Self::Capture => DeviceRole::Input,
        }
    }
}

/// What the client uses the stream for. Routing policy keys off this.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum StreamUsage {
    #[default]
    Media,
    Game,
    VoiceCommunication,
    Alarm,
    Notification,
}

/// Configuration a client submits when it asks for a low-latency stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessConfig {
    pub stream_info: StreamInfo,
    pub direction: StreamDirection,
    pub usage: StreamUsage,
    /// Pid of the requesting client, for dumps and death tracking.
    pub client_pid: u32,
}

impl ProcessConfig {
    pub fn playback(stream_info: StreamInfo) -> Self {
        Self {
            stream_info,
            direction: StreamDirection::Playback,
            usage: StreamUsage::Media,
            client_pid: std::process::id(),
        }
    }

    pub fn capture(stream_info: StreamInfo) -> Self {
        Self {
            direction: StreamDirection::Capture,
            usage: StreamUsage::VoiceCommunication,
            ..Self::playback(stream_info)
        }
    }
}
