//! Transport collaborator contract.
//!
//! The physical link (BLE GATT, RFCOMM/SPP framing, a socket-proxy emulator)
//! lives outside this crate.  It talks to the core in two directions:
//!
//! ```text
//! Transport ──TransportEvent──► DeviceRegistry::handle_transport_event
//! DeviceRegistry ──Transport trait──► connect / disconnect / send
//! ```
//!
//! Events arrive on transport-owned threads.  Implementations of [`Transport`]
//! must not call back into the registry synchronously from these methods;
//! report outcomes as [`TransportEvent`]s instead.

use carlink_core::{DeviceId, DeviceMessage};
use thiserror::Error;

pub mod loopback;
pub mod mock;

/// Error type for transport requests.
///
/// The registry absorbs these with a log line; they never reach feature code.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device {0} is not connected")]
    NotConnected(DeviceId),
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport event channel closed")]
    Closed,
}

/// Something the transport observed on a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected(DeviceId),
    Disconnected(DeviceId),
    SecureChannelEstablished(DeviceId),
    MessageReceived(DeviceId, DeviceMessage),
    /// The secure-channel handshake failed.
    SecureChannelError(DeviceId),
}

/// Requests the core issues to the transport.
pub trait Transport: Send + Sync {
    /// Starts connecting to `device_id`.  Success is reported later as
    /// [`TransportEvent::Connected`].
    fn connect_to_device(&self, device_id: &DeviceId) -> Result<(), TransportError>;

    fn disconnect_device(&self, device_id: &DeviceId) -> Result<(), TransportError>;

    fn send_message(&self, device_id: &DeviceId, message: &DeviceMessage)
        -> Result<(), TransportError>;
}
