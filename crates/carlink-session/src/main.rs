//! Headless companion-link session manager.
//!
//! Wires the session core to the in-process collaborators and runs until
//! Ctrl-C:
//!
//! ```text
//! main()
//!  └─ load SessionConfig          -- argv[1], or the platform config file
//!                                    (written with defaults on first start)
//!  └─ InMemoryStorage::from_config
//!  └─ LoopbackTransport           -- emulated phones, events on a channel
//!  └─ DeviceRegistry
//!       ├─ transport event pump   (Tokio task)
//!       └─ connection log         (SerialExecutor on the runtime)
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use carlink_core::{Audience, ConnectedDevice, ConnectionCallback, Executor, SerialExecutor};
use carlink_session::application::device_registry::DeviceRegistry;
use carlink_session::infrastructure::storage::config::{
    load_config_from, load_or_create_config, SessionConfig,
};
use carlink_session::infrastructure::storage::memory::InMemoryStorage;
use carlink_session::infrastructure::transport::loopback::LoopbackTransport;

/// Logs every connect and disconnect, for any user.
struct ConnectionLog;

impl ConnectionCallback for ConnectionLog {
    fn on_device_connected(&self, device: &ConnectedDevice) {
        info!(
            "connected: {} (active user: {})",
            device.device_id(),
            device.belongs_to_active_user()
        );
    }

    fn on_device_disconnected(&self, device: &ConnectedDevice) {
        info!("disconnected: {}", device.device_id());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, platform_config_error) = match std::env::args().nth(1) {
        Some(path) => (load_config_from(&PathBuf::from(path))?, None),
        None => match load_or_create_config() {
            Ok(config) => (config, None),
            Err(e) => (SessionConfig::default(), Some(e)),
        },
    };

    // Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.session.log_level)),
        )
        .init();

    if let Some(e) = platform_config_error {
        warn!("using default configuration: {e}");
    }

    info!(
        "carlink session starting ({} associated device(s))",
        config.devices.len()
    );

    let storage = Arc::new(InMemoryStorage::from_config(&config));
    let (transport, mut events) = LoopbackTransport::new();
    let registry = Arc::new(DeviceRegistry::new(storage, Arc::new(transport)));

    let log_executor: Arc<dyn Executor> =
        Arc::new(SerialExecutor::on_runtime("connection-log", &Handle::current()));
    registry.register_connection_callback(Audience::AllUsers, Arc::new(ConnectionLog), log_executor);

    // ── Transport event pump ──────────────────────────────────────────────────
    let pump_registry = Arc::clone(&registry);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            pump_registry.handle_transport_event(event);
        }
        warn!("transport event channel closed");
    });

    if config.session.reconnect_on_start {
        let outcome = registry.connect_to_active_user_device();
        info!("start-up connection attempt: {outcome:?}");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    registry.reset();
    info!("carlink session stopped");
    Ok(())
}
