//! Device identity and the connected-device record.
//!
//! # Record lifecycle
//!
//! ```text
//! transport "connected"      ──►  ConnectedDevice { secure: false }
//! secure channel established ──►  replaced by { secure: true, name resolved }
//! association completed      ──►  removed, then re-added with active-user flag
//! transport "disconnected"   ──►  dropped
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a companion device as reported by the transport.
///
/// Phones advertise a stable identifier string (usually a UUID rendered as
/// text); the core treats it as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Snapshot of a device that currently has a link-layer connection.
///
/// Fields are private and there are no setters: a state change produces a
/// new record via [`ConnectedDevice::with_secure_channel`] and the registry
/// swaps it in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedDevice {
    device_id: DeviceId,
    device_name: Option<String>,
    belongs_to_active_user: bool,
    has_secure_channel: bool,
}

impl ConnectedDevice {
    pub fn new(
        device_id: DeviceId,
        device_name: Option<String>,
        belongs_to_active_user: bool,
        has_secure_channel: bool,
    ) -> Self {
        Self {
            device_id,
            device_name,
            belongs_to_active_user,
            has_secure_channel,
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }

    pub fn belongs_to_active_user(&self) -> bool {
        self.belongs_to_active_user
    }

    pub fn has_secure_channel(&self) -> bool {
        self.has_secure_channel
    }

    /// Returns the record that replaces `self` once a secure channel exists.
    pub fn with_secure_channel(&self, device_name: Option<String>) -> Self {
        Self {
            device_id: self.device_id.clone(),
            device_name,
            belongs_to_active_user: self.belongs_to_active_user,
            has_secure_channel: true,
        }
    }
}

/// A device associated with a user, as reported by storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociatedDevice {
    pub device_id: DeviceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// `false` when the user switched off automatic connection for this device.
    #[serde(default = "default_true")]
    pub connection_enabled: bool,
}

fn default_true() -> bool {
    true
}
