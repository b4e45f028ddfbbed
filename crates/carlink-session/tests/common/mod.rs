//! Shared helpers for the session integration tests.

#![allow(dead_code)]

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use carlink_core::{
    AssociatedDevice, ConnectedDevice, DeviceCallback, DeviceError, DeviceId, DeviceMessage,
    Executor, SerialExecutor,
};
use carlink_session::application::device_registry::DeviceRegistry;
use carlink_session::infrastructure::storage::memory::InMemoryStorage;
use carlink_session::infrastructure::storage::DeviceStorage;
use carlink_session::infrastructure::transport::mock::RecordingTransport;
use carlink_session::infrastructure::transport::Transport;

pub const ACTIVE_USER: u32 = 10;

/// What a feature's device callback observed.
#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    Secure(ConnectedDevice),
    Message(Vec<u8>),
    Error(DeviceError),
}

pub struct RecordingCallback(mpsc::Sender<Seen>);

impl DeviceCallback for RecordingCallback {
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

/// Returns a device callback and the receiver for what it observes.
pub fn recording_callback() -> (Arc<dyn DeviceCallback>, mpsc::Receiver<Seen>) {
    let (tx, rx) = mpsc::channel();
    (Arc::new(RecordingCallback(tx)), rx)
}

pub fn executor(name: &str) -> Arc<dyn Executor> {
    Arc::new(SerialExecutor::spawn_thread(name).expect("spawn executor"))
}

pub fn next(rx: &mpsc::Receiver<Seen>) -> Seen {
    rx.recv_timeout(Duration::from_secs(2))
        .expect("expected a callback invocation")
}

pub fn assert_no_more(rx: &mpsc::Receiver<Seen>) {
    let extra = rx.recv_timeout(Duration::from_millis(150));
    assert!(extra.is_err(), "unexpected extra callback: {extra:?}");
}

pub fn associated(id: &str) -> AssociatedDevice {
    AssociatedDevice {
        device_id: DeviceId::new(id),
        device_name: None,
        connection_enabled: true,
    }
}

pub struct Session {
    pub registry: DeviceRegistry,
    pub storage: Arc<InMemoryStorage>,
    pub transport: Arc<RecordingTransport>,
}

/// Builds a registry whose active user owns exactly `active_user_devices`.
pub fn session(active_user_devices: &[&str]) -> Session {
    let storage = Arc::new(InMemoryStorage::new(ACTIVE_USER));
    for id in active_user_devices {
        storage.associate(ACTIVE_USER, associated(id));
    }
    let transport = Arc::new(RecordingTransport::new());
    let registry = DeviceRegistry::new(
        Arc::clone(&storage) as Arc<dyn DeviceStorage>,
        Arc::clone(&transport) as Arc<dyn Transport>,
    );
    Session {
        registry,
        storage,
        transport,
    }
}
