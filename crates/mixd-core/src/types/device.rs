//! Physical device descriptors.

use serde::{Deserialize, Serialize};

use super::StreamInfo;

/// Network id of devices attached to this host.
pub const LOCAL_NETWORK_ID: &str = "LocalDevice";

/// Whether a device renders or captures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    #[default]
    Output,
    Input,
}

/// Kind of physical device behind an endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    #[default]
    Speaker,
    WiredHeadset,
    BluetoothSco,
    Microphone,
    Remote,
}

/// How many streams an endpoint may serve.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    /// One endpoint mixes every stream routed to the device.
    #[default]
    Shared,
    /// One endpoint per stream; the stream writes the device buffer directly.
    Independent,
}

/// Everything the orchestrator needs to pick or build an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: i32,
    pub device_type: DeviceType,
    pub role: DeviceRole,
    pub network_id: String,
    pub name: String,
    /// Geometry the device runs at.
    pub stream_info: StreamInfo,
    /// Device can hand one mmap buffer to a single stream.
    #[serde(default)]
    pub independent_capable: bool,
}

impl DeviceInfo {
    /// A local device with default flags.
    pub fn local(
        device_id: i32,
        device_type: DeviceType,
        role: DeviceRole,
        name: impl Into<String>,
        stream_info: StreamInfo,
    ) -> Self {
        Self {
            device_id,
            device_type,
            role,
            network_id: LOCAL_NETWORK_ID.to_string(),
            name: name.into(),
            stream_info,
            independent_capable: false,
        }
    }

    pub fn is_local(&self) -> bool {
        self.network_id == LOCAL_NETWORK_ID
    }

    /// Registry key shared by every stream routed to this device.
    pub fn key(&self) -> String {
        let role = match self.role {
            DeviceRole::Output => "out",
            DeviceRole::Input => "in",
        };
        format!("{}_{}_{}_{}", self.network_id, self.device_id, role, self.name)
    }

    /// Remote devices are always mixed; local ones only get a private endpoint
    /// when they advertise it.
    pub fn preferred_endpoint_type(&self) -> EndpointType {
        if self.is_local() && self.independent_capable {
            EndpointType::Independent
        } else {
            EndpointType::Shared
        }
    }
}
