//! Contracts implemented by in-vehicle features.
//!
//! All callbacks are invoked on the [`crate::Executor`] supplied at
//! registration time, never on the transport thread that produced the event.

use super::device::ConnectedDevice;
use super::error::DeviceError;
use super::message::DeviceMessage;

/// Which connection events a [`ConnectionCallback`] observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Audience {
    /// Only devices associated with the foreground user.
    ActiveUser,
    /// Every device, regardless of owner.
    AllUsers,
}

/// Observer of link-layer connect and disconnect events.
pub trait ConnectionCallback: Send + Sync {
    fn on_device_connected(&self, device: &ConnectedDevice);

    fn on_device_disconnected(&self, device: &ConnectedDevice);
}

/// A feature's subscription to one recipient identifier on one device.
pub trait DeviceCallback: Send + Sync {
    /// The device's secure channel is ready; `device` is the new record.
    fn on_secure_channel_established(&self, device: &ConnectedDevice);

    fn on_message_received(&self, device: &ConnectedDevice, message: &DeviceMessage);

    fn on_device_error(&self, device: &ConnectedDevice, error: DeviceError);
}

/// Optional gate consulted once per inbound message before routing.
pub trait DeliveryDelegate: Send + Sync {
    /// Returns `false` to drop messages from `device`.
    fn should_deliver(&self, device: &ConnectedDevice) -> bool;
}
