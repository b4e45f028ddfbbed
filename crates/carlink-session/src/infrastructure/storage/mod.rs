//! Storage collaborator: durable device-identity data.
//!
//! The real store (user ↔ device associations, per-device secrets) lives
//! outside this crate.  The core only *queries* it, through [`DeviceStorage`].
//!
//! # Sub-modules
//!
//! - **`memory`** – [`memory::InMemoryStorage`], a thread-safe association
//!   table used by tests and by the headless binary.
//! - **`config`** – The TOML configuration file, including the seed list of
//!   associated devices.

use std::collections::HashSet;

use carlink_core::{AssociatedDevice, DeviceId};

pub mod config;
pub mod memory;

/// Numeric OS user identifier on the head unit.
pub type UserId = u32;

/// Read-only queries the core issues against device-identity storage.
pub trait DeviceStorage: Send + Sync {
    /// Ids of every device associated with the foreground user.
    fn active_user_associated_device_ids(&self) -> HashSet<DeviceId>;

    /// Devices associated with the foreground user, in association order.
    fn active_user_associated_devices(&self) -> Vec<AssociatedDevice>;

    /// Looks up an associated device for any user.
    fn associated_device(&self, device_id: &DeviceId) -> Option<AssociatedDevice>;
}
