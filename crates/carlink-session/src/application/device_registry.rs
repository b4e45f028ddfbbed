//! DeviceRegistry: the table of connected companion devices.
//!
//! The registry is the single entry point for both sides of the session core:
//!
//! - **Transports** report link events (`add_connected_device`,
//!   `remove_connected_device`, `on_secure_channel_established`,
//!   `on_message_received`, `device_error_occurred`) from their own threads,
//!   either directly or through [`DeviceRegistry::handle_transport_event`].
//! - **Features** register connection callbacks and recipient channels, send
//!   messages, and read snapshots of the connected devices.
//!
//! # Device lifecycle
//!
//! ```text
//! Connected(D) ──► record { secure: false } ──► connection callbacks
//! SecureChannelEstablished(D) ──► record replaced { secure: true }
//!                                 ──► every channel on D notified
//! Disconnected(D) ──► record dropped, channels on D dropped
//!                 ──► disconnect callbacks
//!                 ──► reconnect if D was the active user's or table is empty
//! ```
//!
//! Records are immutable values; every change swaps in a new record, so
//! snapshots already handed out stay consistent.  The registry never blocks
//! on I/O and never runs feature code on the calling thread.

use std::sync::Arc;

use carlink_core::{
    Audience, ConnectedDevice, ConnectionCallback, DeliveryDelegate, DeviceCallback, DeviceError,
    DeviceId, DeviceMessage, Executor, RecipientId, ThreadSafeCallbacks,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::connection_guard::{ConnectOutcome, ConnectionAttemptGuard};
use super::recipient_channels::{RecipientChannelRegistry, RegistrationOutcome};
use crate::infrastructure::storage::DeviceStorage;
use crate::infrastructure::transport::{Transport, TransportEvent};

/// Synchronous failures returned to callers.
///
/// Everything else (unknown devices, transport failures) is logged and
/// absorbed; this error exists to surface caller bugs immediately.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("device {device_id} has no secure channel; refusing to send an encrypted message")]
    SecureChannelRequired { device_id: DeviceId },
}

/// The per-vehicle session manager.
pub struct DeviceRegistry {
    storage: Arc<dyn DeviceStorage>,
    transport: Arc<dyn Transport>,
    devices: DashMap<DeviceId, ConnectedDevice>,
    active_user_callbacks: ThreadSafeCallbacks<dyn ConnectionCallback>,
    all_users_callbacks: ThreadSafeCallbacks<dyn ConnectionCallback>,
    channels: RecipientChannelRegistry,
    connection_guard: ConnectionAttemptGuard,
    delivery_delegate: RwLock<Option<Arc<dyn DeliveryDelegate>>>,
}

impl DeviceRegistry {
    pub fn new(storage: Arc<dyn DeviceStorage>, transport: Arc<dyn Transport>) -> Self {
        Self {
            storage,
            transport,
            devices: DashMap::new(),
            active_user_callbacks: ThreadSafeCallbacks::new(),
            all_users_callbacks: ThreadSafeCallbacks::new(),
            channels: RecipientChannelRegistry::new(),
            connection_guard: ConnectionAttemptGuard::new(),
            delivery_delegate: RwLock::new(None),
        }
    }

    // ── Transport events ──────────────────────────────────────────────────────

    /// Dispatches a transport event to the matching operation.
    pub fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(id) => self.add_connected_device(&id),
            TransportEvent::Disconnected(id) => self.remove_connected_device(&id),
            TransportEvent::SecureChannelEstablished(id) => self.on_secure_channel_established(&id),
            TransportEvent::MessageReceived(id, message) => self.on_message_received(&id, message),
            TransportEvent::SecureChannelError(id) => self.device_error_occurred(&id),
        }
    }

    /// Records a new link-layer connection.  Idempotent.
    pub fn add_connected_device(&self, device_id: &DeviceId) {
        if self.devices.contains_key(device_id) {
            debug!("{device_id} already connected; ignoring");
            return;
        }

        let belongs_to_active_user = self
            .storage
            .active_user_associated_device_ids()
            .contains(device_id);
        let record = ConnectedDevice::new(device_id.clone(), None, belongs_to_active_user, false);

        match self.devices.entry(device_id.clone()) {
            Entry::Occupied(_) => {
                debug!("{device_id} connected concurrently; ignoring");
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
            }
        }

        info!("device {device_id} connected (active user: {belongs_to_active_user})");
        self.notify_connected(record);
    }

    /// Drops the record for a link that went away and decides whether to
    /// reconnect.
    pub fn remove_connected_device(&self, device_id: &DeviceId) {
        self.connection_guard.release();

        let removed = self.take_record(device_id);
        if let Some(record) = &removed {
            let dropped = self.channels.remove_device(device_id);
            info!("device {device_id} disconnected; {dropped} channel(s) closed");
            self.notify_disconnected(record.clone());
        } else {
            debug!("disconnect for unknown device {device_id}");
        }

        let was_active_user_device = removed
            .as_ref()
            .is_some_and(ConnectedDevice::belongs_to_active_user);
        if was_active_user_device || self.devices.is_empty() {
            self.connect_to_active_user_device();
        }
    }

    /// Marks `device_id` as having a secure channel and tells its channels.
    pub fn on_secure_channel_established(&self, device_id: &DeviceId) {
        let Some(current) = self.connected_device(device_id) else {
            warn!("secure channel established for unknown device {device_id}");
            return;
        };

        let stored_name = if current.device_name().is_none() {
            self.storage
                .associated_device(device_id)
                .and_then(|d| d.device_name)
        } else {
            None
        };

        let secured = {
            let Some(mut slot) = self.devices.get_mut(device_id) else {
                debug!("{device_id} disconnected before its secure channel was recorded");
                return;
            };
            let name = slot.device_name().map(str::to_string).or(stored_name);
            let secured = slot.with_secure_channel(name);
            *slot = secured.clone();
            secured
        };

        info!("secure channel established with {device_id}");
        self.channels
            .notify_device(device_id, move |cb| cb.on_secure_channel_established(&secured));
    }

    /// Routes an inbound message to its recipient channel.
    pub fn on_message_received(&self, device_id: &DeviceId, message: DeviceMessage) {
        let Some(device) = self.connected_device(device_id) else {
            warn!("message from unknown device {device_id} dropped");
            return;
        };

        let delegate = self.delivery_delegate.read().clone();
        if let Some(delegate) = delegate {
            if !delegate.should_deliver(&device) {
                debug!("delivery delegate rejected message from {device_id}");
                return;
            }
        }

        self.channels.deliver_or_buffer(&device, message);
    }

    /// Reports a failed secure-channel handshake to every channel on the device.
    pub fn device_error_occurred(&self, device_id: &DeviceId) {
        let Some(device) = self.connected_device(device_id) else {
            warn!("error reported for unknown device {device_id}");
            return;
        };

        warn!("secure channel error on {device_id}");
        self.channels.notify_device(device_id, move |cb| {
            cb.on_device_error(&device, DeviceError::InvalidSecurityKey)
        });
    }

    /// Re-evaluates the active-user flag after `device_id` was associated.
    ///
    /// Subscribers see a disconnect followed by a connect carrying the
    /// corrected record.  The link itself never dropped, so recipient channels
    /// survive and no reconnect is attempted.
    pub fn on_association_completed(&self, device_id: &DeviceId) {
        let Some(current) = self.connected_device(device_id) else {
            debug!("association completed for {device_id}, which is not connected");
            return;
        };
        if current.belongs_to_active_user() {
            return;
        }

        info!("{device_id} now belongs to the active user; refreshing its record");
        if let Some(record) = self.take_record(device_id) {
            self.notify_disconnected(record);
        }
        self.add_connected_device(device_id);
    }

    // ── Feature-facing API ────────────────────────────────────────────────────

    /// Sends `message` to `device`.
    ///
    /// The secure-channel requirement is checked against both the caller's
    /// record and the live one, so a record kept from an earlier link cannot
    /// authorise an encrypted send.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::SecureChannelRequired`] if the message is
    /// encrypted and either record lacks a secure channel.  The message never
    /// reaches the transport in that case.
    pub fn send_message(
        &self,
        device: &ConnectedDevice,
        message: DeviceMessage,
    ) -> Result<(), SessionError> {
        let device_id = device.device_id();
        let secure_channel_required = || SessionError::SecureChannelRequired {
            device_id: device_id.clone(),
        };
        if message.is_encrypted() && !device.has_secure_channel() {
            return Err(secure_channel_required());
        }

        let Some(live) = self.connected_device(device_id) else {
            warn!("send to {device_id} skipped: device is not connected");
            return Ok(());
        };
        if message.is_encrypted() && !live.has_secure_channel() {
            warn!("encrypted send to {device_id} refused: live link is not secure");
            return Err(secure_channel_required());
        }

        if let Err(e) = self.transport.send_message(device_id, &message) {
            warn!("failed to send message to {device_id}: {e}");
        }
        Ok(())
    }

    /// Subscribes `callback` to messages for `recipient_id` from `device`.
    pub fn register_device_callback(
        &self,
        device: &ConnectedDevice,
        recipient_id: RecipientId,
        callback: Arc<dyn DeviceCallback>,
        executor: Arc<dyn Executor>,
    ) -> RegistrationOutcome {
        self.channels.register(device, recipient_id, callback, executor)
    }

    /// Removes the subscription if `callback` still holds it.
    pub fn unregister_device_callback(
        &self,
        device: &ConnectedDevice,
        recipient_id: RecipientId,
        callback: &Arc<dyn DeviceCallback>,
    ) -> bool {
        self.channels
            .unregister(device.device_id(), recipient_id, callback)
    }

    pub fn register_connection_callback(
        &self,
        audience: Audience,
        callback: Arc<dyn ConnectionCallback>,
        executor: Arc<dyn Executor>,
    ) {
        match audience {
            Audience::ActiveUser => self.active_user_callbacks.add(callback, executor),
            Audience::AllUsers => self.all_users_callbacks.add(callback, executor),
        }
    }

    /// Removes `callback` from whichever audience it was registered with.
    pub fn unregister_connection_callback(&self, callback: &Arc<dyn ConnectionCallback>) {
        let removed_active = self.active_user_callbacks.remove(callback);
        let removed_all = self.all_users_callbacks.remove(callback);
        if !removed_active && !removed_all {
            debug!("unregister for a connection callback that was never registered");
        }
    }

    /// Installs the delivery delegate, replacing any previous one.
    pub fn set_delivery_delegate(&self, delegate: Arc<dyn DeliveryDelegate>) {
        *self.delivery_delegate.write() = Some(delegate);
    }

    pub fn clear_delivery_delegate(&self) {
        *self.delivery_delegate.write() = None;
    }

    pub fn get_active_user_connected_devices(&self) -> Vec<ConnectedDevice> {
        self.devices
            .iter()
            .filter(|entry| entry.value().belongs_to_active_user())
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn get_all_connected_devices(&self) -> Vec<ConnectedDevice> {
        self.devices
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn connected_device(&self, device_id: &DeviceId) -> Option<ConnectedDevice> {
        self.devices.get(device_id).map(|entry| entry.value().clone())
    }

    pub fn channels(&self) -> &RecipientChannelRegistry {
        &self.channels
    }

    // ── Connection management ─────────────────────────────────────────────────

    /// Tries to link the active user's device unless a request is in flight.
    pub fn connect_to_active_user_device(&self) -> ConnectOutcome {
        self.connection_guard.try_connect_active_user_device(
            self.storage.as_ref(),
            self.transport.as_ref(),
            |device_id| self.devices.contains_key(device_id),
        )
    }

    pub fn is_connection_attempt_in_flight(&self) -> bool {
        self.connection_guard.is_held()
    }

    /// Asks the transport to drop the link.  The table changes only when the
    /// transport reports the disconnect.
    pub fn disconnect_device(&self, device_id: &DeviceId) {
        if let Err(e) = self.transport.disconnect_device(device_id) {
            warn!("failed to disconnect {device_id}: {e}");
        }
    }

    /// The user switched off connections for `device_id`.
    ///
    /// Nothing is recorded here.  The caller must clear the device's
    /// `connection_enabled` flag in storage first; otherwise the disconnect
    /// this triggers re-dials the active user's device.
    pub fn disable_connection(&self, device_id: &DeviceId) {
        self.connection_guard.release();
        if self.devices.contains_key(device_id) {
            info!("connection disabled for {device_id}; disconnecting");
            self.disconnect_device(device_id);
        }
    }

    /// Disconnects and forgets every device.
    ///
    /// The deny-list and missed messages are process-lifetime state and
    /// survive a reset.
    pub fn reset(&self) {
        self.connection_guard.release();
        let ids: Vec<DeviceId> = self.devices.iter().map(|e| e.key().clone()).collect();
        for device_id in ids {
            self.disconnect_device(&device_id);
            if let Some(record) = self.take_record(&device_id) {
                self.channels.remove_device(&device_id);
                self.notify_disconnected(record);
            }
        }
        info!("session reset");
    }

    /// Drops the previous user's session and links the new user's device.
    pub fn on_active_user_changed(&self) -> ConnectOutcome {
        info!("active user changed");
        self.reset();
        self.connect_to_active_user_device()
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn take_record(&self, device_id: &DeviceId) -> Option<ConnectedDevice> {
        self.devices.remove(device_id).map(|(_, record)| record)
    }

    fn notify_connected(&self, record: ConnectedDevice) {
        if record.belongs_to_active_user() {
            let active = record.clone();
            self.active_user_callbacks
                .invoke(move |cb| cb.on_device_connected(&active));
        }
        self.all_users_callbacks
            .invoke(move |cb| cb.on_device_connected(&record));
    }

    fn notify_disconnected(&self, record: ConnectedDevice) {
        if record.belongs_to_active_user() {
            let active = record.clone();
            self.active_user_callbacks
                .invoke(move |cb| cb.on_device_disconnected(&active));
        }
        self.all_users_callbacks
            .invoke(move |cb| cb.on_device_disconnected(&record));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::memory::InMemoryStorage;
    use crate::infrastructure::transport::mock::{RecordingTransport, TransportCall};
    use carlink_core::{AssociatedDevice, SerialExecutor};
    use std::sync::mpsc;
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    enum Link {
        Up(ConnectedDevice),
        Down(ConnectedDevice),
    }

    struct LinkRecorder(mpsc::Sender<Link>);

    impl ConnectionCallback for LinkRecorder {
        fn on_device_connected(&self, device: &ConnectedDevice) {
            self.0.send(Link::Up(device.clone())).ok();
        }

        fn on_device_disconnected(&self, device: &ConnectedDevice) {
            self.0.send(Link::Down(device.clone())).ok();
        }
    }

    #[derive(Debug, PartialEq)]
    enum Seen {
        Secure(ConnectedDevice),
        Message(Vec<u8>),
        Error(DeviceError),
    }

    struct ChannelRecorder(mpsc::Sender<Seen>);

    impl DeviceCallback for ChannelRecorder {
        fn on_secure_channel_established(&self, device: &ConnectedDevice) {
            self.0.send(Seen::Secure(device.clone())).ok();
        }

        fn on_message_received(&self, _device: &ConnectedDevice, message: &DeviceMessage) {
            self.0.send(Seen::Message(message.payload().to_vec())).ok();
        }

        fn on_device_error(&self, _device: &ConnectedDevice, error: DeviceError) {
            self.0.send(Seen::Error(error)).ok();
        }
    }

    struct Fixture {
        registry: DeviceRegistry,
        storage: Arc<InMemoryStorage>,
        transport: Arc<RecordingTransport>,
    }

    /// Storage: active user 10 owns "D1" (named "Driver phone"); user 11 owns "D2".
    fn fixture() -> Fixture {
        let storage = Arc::new(InMemoryStorage::new(10));
        storage.associate(
            10,
            AssociatedDevice {
                device_id: DeviceId::new("D1"),
                device_name: Some("Driver phone".to_string()),
                connection_enabled: true,
            },
        );
        storage.associate(
            11,
            AssociatedDevice {
                device_id: DeviceId::new("D2"),
                device_name: None,
                connection_enabled: true,
            },
        );
        let transport = Arc::new(RecordingTransport::new());
        let registry = DeviceRegistry::new(
            Arc::clone(&storage) as Arc<dyn DeviceStorage>,
            Arc::clone(&transport) as Arc<dyn Transport>,
        );
        Fixture {
            registry,
            storage,
            transport,
        }
    }

    fn executor() -> Arc<dyn Executor> {
        Arc::new(SerialExecutor::spawn_thread("registry-test").unwrap())
    }

    fn d(id: &str) -> DeviceId {
        DeviceId::new(id)
    }

    fn recv<T>(rx: &mpsc::Receiver<T>) -> T {
        rx.recv_timeout(Duration::from_secs(2)).expect("callback not invoked")
    }

    fn assert_quiet<T: std::fmt::Debug>(rx: &mpsc::Receiver<T>) {
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_add_connected_device_marks_active_user_ownership() {
        let f = fixture();

        f.registry.add_connected_device(&d("D1"));
        f.registry.add_connected_device(&d("D2"));

        let d1 = f.registry.connected_device(&d("D1")).unwrap();
        let d2 = f.registry.connected_device(&d("D2")).unwrap();
        assert!(d1.belongs_to_active_user());
        assert!(!d1.has_secure_channel());
        assert!(!d2.belongs_to_active_user());
        assert_eq!(f.registry.get_all_connected_devices().len(), 2);
        assert_eq!(
            f.registry.get_active_user_connected_devices(),
            vec![d1]
        );
    }

    #[test]
    fn test_add_connected_device_is_idempotent() {
        // Arrange
        let f = fixture();
        let (tx, rx) = mpsc::channel();
        f.registry.register_connection_callback(
            Audience::AllUsers,
            Arc::new(LinkRecorder(tx)),
            executor(),
        );

        // Act
        f.registry.add_connected_device(&d("D1"));
        f.registry.add_connected_device(&d("D1"));

        // Assert
        assert!(matches!(recv(&rx), Link::Up(_)));
        assert_quiet(&rx);
        assert_eq!(f.registry.get_all_connected_devices().len(), 1);
    }

    #[test]
    fn test_active_user_audience_only_sees_active_user_devices() {
        // Arrange
        let f = fixture();
        let (active_tx, active_rx) = mpsc::channel();
        let (all_tx, all_rx) = mpsc::channel();
        f.registry.register_connection_callback(
            Audience::ActiveUser,
            Arc::new(LinkRecorder(active_tx)),
            executor(),
        );
        f.registry.register_connection_callback(
            Audience::AllUsers,
            Arc::new(LinkRecorder(all_tx)),
            executor(),
        );

        // Act
        f.registry.add_connected_device(&d("D2"));

        // Assert
        match recv(&all_rx) {
            Link::Up(device) => assert_eq!(device.device_id(), &d("D2")),
            other => panic!("unexpected {other:?}"),
        }
        assert_quiet(&active_rx);
    }

    #[test]
    fn test_unregistered_connection_callback_is_silent() {
        let f = fixture();
        let (tx, rx) = mpsc::channel();
        let cb: Arc<dyn ConnectionCallback> = Arc::new(LinkRecorder(tx));
        f.registry
            .register_connection_callback(Audience::ActiveUser, Arc::clone(&cb), executor());

        f.registry.unregister_connection_callback(&cb);
        f.registry.add_connected_device(&d("D1"));

        assert_quiet(&rx);
    }

    #[test]
    fn test_secure_channel_replaces_record_and_resolves_stored_name() {
        // Arrange
        let f = fixture();
        f.registry.add_connected_device(&d("D1"));
        let before = f.registry.connected_device(&d("D1")).unwrap();
        let (tx, rx) = mpsc::channel();
        f.registry.register_device_callback(
            &before,
            RecipientId::random(),
            Arc::new(ChannelRecorder(tx)),
            executor(),
        );

        // Act
        f.registry.on_secure_channel_established(&d("D1"));

        // Assert
        let after = f.registry.connected_device(&d("D1")).unwrap();
        assert!(after.has_secure_channel());
        assert_eq!(after.device_name(), Some("Driver phone"));
        assert!(!before.has_secure_channel(), "old snapshot must not change");
        assert_eq!(recv(&rx), Seen::Secure(after));
    }

    #[test]
    fn test_events_for_unknown_device_are_ignored() {
        let f = fixture();

        f.registry.on_secure_channel_established(&d("ghost"));
        f.registry.device_error_occurred(&d("ghost"));
        f.registry.on_association_completed(&d("ghost"));
        f.registry.on_message_received(
            &d("ghost"),
            DeviceMessage::client_message(RecipientId::random(), false, vec![1]),
        );

        assert!(f.registry.get_all_connected_devices().is_empty());
        assert_eq!(f.registry.channels().channel_count(), 0);
    }

    #[test]
    fn test_device_error_notifies_channels_with_invalid_security_key() {
        let f = fixture();
        f.registry.add_connected_device(&d("D1"));
        let device = f.registry.connected_device(&d("D1")).unwrap();
        let (tx, rx) = mpsc::channel();
        f.registry.register_device_callback(
            &device,
            RecipientId::random(),
            Arc::new(ChannelRecorder(tx)),
            executor(),
        );

        f.registry.device_error_occurred(&d("D1"));

        assert_eq!(recv(&rx), Seen::Error(DeviceError::InvalidSecurityKey));
    }

    #[test]
    fn test_delivery_delegate_can_drop_messages() {
        // Arrange
        struct RejectAll;
        impl DeliveryDelegate for RejectAll {
            fn should_deliver(&self, _device: &ConnectedDevice) -> bool {
                false
            }
        }

        let f = fixture();
        f.registry.add_connected_device(&d("D1"));
        let device = f.registry.connected_device(&d("D1")).unwrap();
        let r1 = RecipientId::random();
        let (tx, rx) = mpsc::channel();
        f.registry
            .register_device_callback(&device, r1, Arc::new(ChannelRecorder(tx)), executor());
        f.registry.set_delivery_delegate(Arc::new(RejectAll));

        // Act
        f.registry
            .on_message_received(&d("D1"), DeviceMessage::client_message(r1, false, vec![1]));

        // Assert: dropped, and not buffered either.
        assert_quiet(&rx);
        assert_eq!(f.registry.channels().pending_message_count(&d("D1"), r1), 0);

        f.registry.clear_delivery_delegate();
        f.registry
            .on_message_received(&d("D1"), DeviceMessage::client_message(r1, false, vec![2]));
        assert_eq!(recv(&rx), Seen::Message(vec![2]));
    }

    #[test]
    fn test_association_completed_reissues_record_for_active_user() {
        // Arrange: D3 connects before it is associated.
        let f = fixture();
        let (tx, rx) = mpsc::channel();
        f.registry.register_connection_callback(
            Audience::AllUsers,
            Arc::new(LinkRecorder(tx)),
            executor(),
        );
        f.registry.add_connected_device(&d("D3"));
        assert!(matches!(recv(&rx), Link::Up(ref dev) if !dev.belongs_to_active_user()));
        f.storage.associate(
            10,
            AssociatedDevice {
                device_id: d("D3"),
                device_name: None,
                connection_enabled: true,
            },
        );

        // Act
        f.registry.on_association_completed(&d("D3"));

        // Assert
        assert!(matches!(recv(&rx), Link::Down(ref dev) if !dev.belongs_to_active_user()));
        assert!(matches!(recv(&rx), Link::Up(ref dev) if dev.belongs_to_active_user()));
        assert!(f
            .registry
            .connected_device(&d("D3"))
            .unwrap()
            .belongs_to_active_user());
        assert!(f.transport.connect_requests().is_empty());
    }

    #[test]
    fn test_association_completed_is_noop_for_active_user_device() {
        let f = fixture();
        let (tx, rx) = mpsc::channel();
        f.registry.add_connected_device(&d("D1"));
        f.registry.register_connection_callback(
            Audience::AllUsers,
            Arc::new(LinkRecorder(tx)),
            executor(),
        );

        f.registry.on_association_completed(&d("D1"));

        assert_quiet(&rx);
    }

    #[test]
    fn test_send_encrypted_without_secure_channel_fails_before_transport() {
        let f = fixture();
        f.registry.add_connected_device(&d("D1"));
        let device = f.registry.connected_device(&d("D1")).unwrap();

        let result = f.registry.send_message(
            &device,
            DeviceMessage::client_message(RecipientId::random(), true, vec![1]),
        );

        assert_eq!(
            result,
            Err(SessionError::SecureChannelRequired {
                device_id: d("D1")
            })
        );
        assert!(f.transport.calls().is_empty());
    }

    #[test]
    fn test_send_reaches_transport_when_allowed() {
        let f = fixture();
        f.registry.add_connected_device(&d("D1"));
        f.registry.on_secure_channel_established(&d("D1"));
        let device = f.registry.connected_device(&d("D1")).unwrap();
        let message = DeviceMessage::client_message(RecipientId::random(), true, vec![4, 2]);

        f.registry.send_message(&device, message.clone()).unwrap();

        assert_eq!(f.transport.sent_messages(), vec![(d("D1"), message)]);
    }

    #[test]
    fn test_send_encrypted_with_record_from_previous_link_is_refused() {
        // Arrange: secure D1, keep its record, then reconnect without security.
        let f = fixture();
        f.registry.add_connected_device(&d("D1"));
        f.registry.on_secure_channel_established(&d("D1"));
        let earlier = f.registry.connected_device(&d("D1")).unwrap();
        f.registry.remove_connected_device(&d("D1"));
        f.registry.add_connected_device(&d("D1"));
        assert!(!f.registry.connected_device(&d("D1")).unwrap().has_secure_channel());

        // Act
        let result = f.registry.send_message(
            &earlier,
            DeviceMessage::client_message(RecipientId::random(), true, vec![1]),
        );

        // Assert
        assert_eq!(
            result,
            Err(SessionError::SecureChannelRequired {
                device_id: d("D1")
            })
        );
        assert!(f.transport.sent_messages().is_empty());
    }

    #[test]
    fn test_send_encrypted_with_forged_secure_record_is_refused() {
        let f = fixture();
        f.registry.add_connected_device(&d("D1"));
        let forged = ConnectedDevice::new(d("D1"), None, true, true);

        let result = f.registry.send_message(
            &forged,
            DeviceMessage::client_message(RecipientId::random(), true, vec![1]),
        );

        assert!(result.is_err());
        assert!(f.transport.sent_messages().is_empty());
    }

    #[test]
    fn test_send_to_disconnected_device_is_silent_noop() {
        let f = fixture();
        let stale = ConnectedDevice::new(d("D1"), None, true, true);

        let result = f.registry.send_message(
            &stale,
            DeviceMessage::client_message(RecipientId::random(), true, vec![1]),
        );

        assert!(result.is_ok());
        assert!(f.transport.calls().is_empty());
    }

    #[test]
    fn test_transport_send_failure_is_absorbed() {
        let f = fixture();
        f.registry.add_connected_device(&d("D1"));
        let device = f.registry.connected_device(&d("D1")).unwrap();
        f.transport.set_failing(true);

        let result = f.registry.send_message(
            &device,
            DeviceMessage::client_message(RecipientId::random(), false, vec![1]),
        );

        assert!(result.is_ok());
    }

    #[test]
    fn test_remove_active_user_device_requests_reconnect() {
        // Arrange
        let f = fixture();
        f.registry.add_connected_device(&d("D1"));
        f.registry.add_connected_device(&d("D2"));

        // Act
        f.registry.remove_connected_device(&d("D1"));

        // Assert
        assert_eq!(f.transport.connect_requests(), vec![d("D1")]);
        assert!(f.registry.is_connection_attempt_in_flight());
    }

    #[test]
    fn test_remove_other_user_device_with_devices_left_does_not_reconnect() {
        let f = fixture();
        f.registry.add_connected_device(&d("D1"));
        f.registry.add_connected_device(&d("D2"));

        f.registry.remove_connected_device(&d("D2"));

        assert!(f.transport.connect_requests().is_empty());
    }

    #[test]
    fn test_remove_last_device_requests_reconnect_even_for_other_user() {
        let f = fixture();
        f.registry.add_connected_device(&d("D2"));

        f.registry.remove_connected_device(&d("D2"));

        assert_eq!(f.transport.connect_requests(), vec![d("D1")]);
    }

    #[test]
    fn test_remove_closes_channels_on_device() {
        let f = fixture();
        f.registry.add_connected_device(&d("D1"));
        f.registry.add_connected_device(&d("D2"));
        let device = f.registry.connected_device(&d("D2")).unwrap();
        let (tx, rx) = mpsc::channel();
        let r1 = RecipientId::random();
        f.registry
            .register_device_callback(&device, r1, Arc::new(ChannelRecorder(tx)), executor());

        f.registry.remove_connected_device(&d("D2"));
        f.registry.add_connected_device(&d("D2"));
        f.registry
            .on_message_received(&d("D2"), DeviceMessage::client_message(r1, false, vec![1]));

        assert_quiet(&rx);
        assert_eq!(f.registry.channels().channel_count(), 0);
        assert_eq!(f.registry.channels().pending_message_count(&d("D2"), r1), 1);
    }

    #[test]
    fn test_disable_connection_releases_guard_and_disconnects() {
        // Arrange: a reconnect is in flight and D2 is connected.
        let f = fixture();
        f.registry.add_connected_device(&d("D2"));
        f.registry.connect_to_active_user_device();
        assert!(f.registry.is_connection_attempt_in_flight());

        // Act
        f.registry.disable_connection(&d("D2"));

        // Assert
        assert!(!f.registry.is_connection_attempt_in_flight());
        assert_eq!(f.transport.disconnect_requests(), vec![d("D2")]);
    }

    #[test]
    fn test_disable_after_clearing_storage_flag_does_not_redial() {
        // Arrange: the driver's phone is linked; the user turns it off.
        let f = fixture();
        f.registry.add_connected_device(&d("D1"));
        assert!(f.storage.set_connection_enabled(&d("D1"), false));

        // Act: disable, then the transport reports the link going down.
        f.registry.disable_connection(&d("D1"));
        f.registry.remove_connected_device(&d("D1"));

        // Assert
        assert_eq!(f.transport.disconnect_requests(), vec![d("D1")]);
        assert!(f.transport.connect_requests().is_empty());
        assert!(!f.registry.is_connection_attempt_in_flight());
    }

    #[test]
    fn test_disable_without_clearing_storage_flag_redials() {
        let f = fixture();
        f.registry.add_connected_device(&d("D1"));

        f.registry.disable_connection(&d("D1"));
        f.registry.remove_connected_device(&d("D1"));

        assert_eq!(f.transport.connect_requests(), vec![d("D1")]);
    }

    #[test]
    fn test_reset_disconnects_everything_without_reconnecting() {
        let f = fixture();
        let (tx, rx) = mpsc::channel();
        f.registry.add_connected_device(&d("D1"));
        f.registry.register_connection_callback(
            Audience::AllUsers,
            Arc::new(LinkRecorder(tx)),
            executor(),
        );

        f.registry.reset();

        assert!(f.registry.get_all_connected_devices().is_empty());
        assert!(matches!(recv(&rx), Link::Down(_)));
        assert_eq!(
            f.transport.calls(),
            vec![TransportCall::Disconnect(d("D1"))]
        );
        assert!(!f.registry.is_connection_attempt_in_flight());
    }

    #[test]
    fn test_active_user_change_links_new_users_device() {
        let f = fixture();
        f.registry.add_connected_device(&d("D1"));
        f.storage.set_active_user(11);

        let outcome = f.registry.on_active_user_changed();

        assert_eq!(outcome, ConnectOutcome::Requested(d("D2")));
        assert_eq!(
            f.transport.calls(),
            vec![
                TransportCall::Disconnect(d("D1")),
                TransportCall::Connect(d("D2")),
            ]
        );
    }

    #[test]
    fn test_handle_transport_event_dispatches_lifecycle() {
        let f = fixture();

        f.registry
            .handle_transport_event(TransportEvent::Connected(d("D1")));
        f.registry
            .handle_transport_event(TransportEvent::SecureChannelEstablished(d("D1")));
        assert!(f
            .registry
            .connected_device(&d("D1"))
            .unwrap()
            .has_secure_channel());

        f.registry
            .handle_transport_event(TransportEvent::Disconnected(d("D1")));
        assert!(f.registry.connected_device(&d("D1")).is_none());
    }
}
