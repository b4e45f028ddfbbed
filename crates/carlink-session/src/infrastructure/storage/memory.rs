//! In-memory device association table.

use std::collections::{BTreeMap, HashSet};

use carlink_core::{AssociatedDevice, DeviceId};
use parking_lot::RwLock;
use tracing::debug;

use super::config::SessionConfig;
use super::{DeviceStorage, UserId};

#[derive(Default)]
struct Associations {
    active_user: UserId,
    by_user: BTreeMap<UserId, Vec<AssociatedDevice>>,
}

/// A [`DeviceStorage`] backed by process memory.
///
/// Associations are kept per user in insertion order; the first entry is the
/// one the connection guard will try to reconnect.
#[derive(Default)]
pub struct InMemoryStorage {
    state: RwLock<Associations>,
}

impl InMemoryStorage {
    pub fn new(active_user: UserId) -> Self {
        Self {
            state: RwLock::new(Associations {
                active_user,
                by_user: BTreeMap::new(),
            }),
        }
    }

    /// Builds a storage seeded with the `[[devices]]` entries of `config`.
    pub fn from_config(config: &SessionConfig) -> Self {
        let storage = Self::new(config.storage.active_user);
        for entry in &config.devices {
            storage.associate(
                entry.user,
                AssociatedDevice {
                    device_id: entry.device_id.clone(),
                    device_name: entry.name.clone(),
                    connection_enabled: entry.connection_enabled,
                },
            );
        }
        storage
    }

    pub fn active_user(&self) -> UserId {
        self.state.read().active_user
    }

    pub fn set_active_user(&self, user: UserId) {
        debug!("storage: active user is now {user}");
        self.state.write().active_user = user;
    }

    /// Associates `device` with `user`, replacing an existing entry with the
    /// same id for that user.
    pub fn associate(&self, user: UserId, device: AssociatedDevice) {
        let mut state = self.state.write();
        let devices = state.by_user.entry(user).or_default();
        match devices.iter_mut().find(|d| d.device_id == device.device_id) {
            Some(existing) => *existing = device,
            None => devices.push(device),
        }
    }

    /// Removes the association for `device_id` from every user.
    pub fn disassociate(&self, device_id: &DeviceId) {
        let mut state = self.state.write();
        for devices in state.by_user.values_mut() {
            devices.retain(|d| &d.device_id != device_id);
        }
    }

    /// Returns `false` if no association for `device_id` exists.
    pub fn set_connection_enabled(&self, device_id: &DeviceId, enabled: bool) -> bool {
        let mut state = self.state.write();
        let mut found = false;
        for device in state
            .by_user
            .values_mut()
            .flat_map(|devices| devices.iter_mut())
            .filter(|d| &d.device_id == device_id)
        {
            device.connection_enabled = enabled;
            found = true;
        }
        found
    }
}

impl DeviceStorage for InMemoryStorage {
    fn active_user_associated_device_ids(&self) -> HashSet<DeviceId> {
        self.active_user_associated_devices()
            .into_iter()
            .map(|d| d.device_id)
            .collect()
    }

    fn active_user_associated_devices(&self) -> Vec<AssociatedDevice> {
        let state = self.state.read();
        state
            .by_user
            .get(&state.active_user)
            .cloned()
            .unwrap_or_default()
    }

    fn associated_device(&self, device_id: &DeviceId) -> Option<AssociatedDevice> {
        self.state
            .read()
            .by_user
            .values()
            .flat_map(|devices| devices.iter())
            .find(|d| &d.device_id == device_id)
            .cloned()
    }
}
