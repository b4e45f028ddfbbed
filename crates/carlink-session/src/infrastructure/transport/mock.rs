//! Recording transport for unit and integration testing.
//!
//! Records every request the registry issues so tests can assert on them
//! without a radio.  Sends can be made to fail to exercise the registry's
//! error absorption.

use std::sync::atomic::{AtomicBool, Ordering};

use carlink_core::{DeviceId, DeviceMessage};
use parking_lot::Mutex;

use super::{Transport, TransportError};

/// A single request observed by [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect(DeviceId),
    Disconnect(DeviceId),
    Send(DeviceId, DeviceMessage),
}

/// A [`Transport`] that records calls instead of touching a link.
#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<TransportCall>>,
    fail_requests: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// When `true`, every subsequent request returns an I/O error (it is
    /// still recorded).
    pub fn set_failing(&self, failing: bool) {
        self.fail_requests.store(failing, Ordering::SeqCst);
    }

    /// Returns every request in the order it was issued.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    /// Returns the devices passed to `connect_to_device`, in order.
    pub fn connect_requests(&self) -> Vec<DeviceId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                TransportCall::Connect(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Returns the devices passed to `disconnect_device`, in order.
    pub fn disconnect_requests(&self) -> Vec<DeviceId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                TransportCall::Disconnect(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Returns every `(device, message)` pair passed to `send_message`.
    pub fn sent_messages(&self) -> Vec<(DeviceId, DeviceMessage)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                TransportCall::Send(id, message) => Some((id.clone(), message.clone())),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: TransportCall) -> Result<(), TransportError> {
        self.calls.lock().push(call);
        if self.fail_requests.load(Ordering::SeqCst) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated link failure",
            )));
        }
        Ok(())
    }
}

impl Transport for RecordingTransport {
    fn connect_to_device(&self, device_id: &DeviceId) -> Result<(), TransportError> {
        self.record(TransportCall::Connect(device_id.clone()))
    }

    fn disconnect_device(&self, device_id: &DeviceId) -> Result<(), TransportError> {
        self.record(TransportCall::Disconnect(device_id.clone()))
    }

    fn send_message(
        &self,
        device_id: &DeviceId,
        message: &DeviceMessage,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::Send(device_id.clone(), message.clone()))
    }
}
