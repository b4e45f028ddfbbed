//! Loopback transport that emulates a phone inside the process.
//!
//! Connecting "links" the device instantly and reports both `Connected` and
//! `SecureChannelEstablished`.  Every message sent to a linked device is echoed
//! back as `MessageReceived`, which is enough to drive the whole session core
//! from the headless binary without any radio hardware.
//!
//! Events are published on an unbounded Tokio channel so they can be produced
//! from any thread and consumed by an async event pump.

use carlink_core::{DeviceId, DeviceMessage};
use dashmap::DashSet;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Transport, TransportError, TransportEvent};

/// An in-process [`Transport`] whose "phones" echo every message.
pub struct LoopbackTransport {
    linked: DashSet<DeviceId>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl LoopbackTransport {
    /// Creates a new loopback transport and returns it together with the
    /// event receiver.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            linked: DashSet::new(),
            event_tx: tx,
        };
        (transport, rx)
    }

    /// Simulates the phone dropping the link on its own.
    pub fn drop_link(&self, device_id: &DeviceId) -> Result<(), TransportError> {
        self.disconnect_device(device_id)
    }

    fn publish(&self, event: TransportEvent) -> Result<(), TransportError> {
        self.event_tx.send(event).map_err(|_| TransportError::Closed)
    }
}

impl Transport for LoopbackTransport {
    fn connect_to_device(&self, device_id: &DeviceId) -> Result<(), TransportError> {
        if !self.linked.insert(device_id.clone()) {
            debug!("loopback: {device_id} already linked");
            return Ok(());
        }
        debug!("loopback: linking {device_id}");
        self.publish(TransportEvent::Connected(device_id.clone()))?;
        self.publish(TransportEvent::SecureChannelEstablished(device_id.clone()))
    }

    fn disconnect_device(&self, device_id: &DeviceId) -> Result<(), TransportError> {
        if self.linked.remove(device_id).is_none() {
            return Err(TransportError::NotConnected(device_id.clone()));
        }
        debug!("loopback: unlinking {device_id}");
        self.publish(TransportEvent::Disconnected(device_id.clone()))
    }

    fn send_message(
        &self,
        device_id: &DeviceId,
        message: &DeviceMessage,
    ) -> Result<(), TransportError> {
        if !self.linked.contains(device_id) {
            return Err(TransportError::NotConnected(device_id.clone()));
        }
        self.publish(TransportEvent::MessageReceived(
            device_id.clone(),
            message.clone(),
        ))
    }
}
