//! ConnectionAttemptGuard: single-flight "connect the active user's device".
//!
//! Reconnect requests come from several threads (disconnect events, user
//! switches, start-up).  Only one request may be outstanding at a time; the
//! guard is a single atomic flag acquired with compare-and-swap.
//!
//! # Lifecycle
//!
//! ```text
//! idle ──try_acquire──► held ──(nothing to do)──► idle
//!                        │
//!                        └──connect issued──► held until release()
//!                                              (device disconnect or
//!                                               explicit connection-disable)
//! ```
//!
//! A successful connect does *not* release the guard.  Success surfaces later
//! as a new connected device, after which the "already connected" check makes
//! re-entry harmless.  There is no timeout: a transport that never answers
//! leaves the guard held until the next disconnect or disable.
//!
//! Only the first associated device is considered; one fast-reconnect target
//! per user.

use std::sync::atomic::{AtomicBool, Ordering};

use carlink_core::DeviceId;
use tracing::{debug, info, warn};

use crate::infrastructure::storage::DeviceStorage;
use crate::infrastructure::transport::Transport;

/// What [`ConnectionAttemptGuard::try_connect_active_user_device`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Another request is outstanding; nothing was done.
    AlreadyInFlight,
    /// The active user has no associated device.
    NoAssociatedDevice,
    /// The user disabled automatic connection for the device.
    ConnectionDisabled(DeviceId),
    /// The device is already in the connected table.
    AlreadyConnected(DeviceId),
    /// A connect request was issued; the guard stays held.
    Requested(DeviceId),
    /// The transport refused the request synchronously.
    TransportFailed(DeviceId),
}

/// Atomic single-flight flag for reconnect requests.
#[derive(Debug, Default)]
pub struct ConnectionAttemptGuard {
    in_flight: AtomicBool,
}

impl ConnectionAttemptGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the guard.  Returns `false` if it was already held.
    pub fn try_acquire(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    pub fn is_held(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Issues a connect for the active user's first associated device unless
    /// a request is already outstanding or there is nothing to do.
    pub fn try_connect_active_user_device(
        &self,
        storage: &dyn DeviceStorage,
        transport: &dyn Transport,
        is_connected: impl Fn(&DeviceId) -> bool,
    ) -> ConnectOutcome {
        if !self.try_acquire() {
            debug!("connection attempt already in flight");
            return ConnectOutcome::AlreadyInFlight;
        }

        let Some(device) = storage.active_user_associated_devices().into_iter().next() else {
            debug!("active user has no associated device");
            self.release();
            return ConnectOutcome::NoAssociatedDevice;
        };
        let device_id = device.device_id;

        if !device.connection_enabled {
            debug!("connection disabled for {device_id}");
            self.release();
            return ConnectOutcome::ConnectionDisabled(device_id);
        }

        if is_connected(&device_id) {
            debug!("{device_id} already connected");
            self.release();
            return ConnectOutcome::AlreadyConnected(device_id);
        }

        match transport.connect_to_device(&device_id) {
            Ok(()) => {
                info!("requested connection to active user device {device_id}");
                ConnectOutcome::Requested(device_id)
            }
            Err(e) => {
                warn!("transport rejected connection to {device_id}: {e}");
                self.release();
                ConnectOutcome::TransportFailed(device_id)
            }
        }
    }
}
