//! # carlink-core
//!
//! Shared library for the head-unit companion link containing the domain
//! entities (connected device records, device messages, error taxonomy), the
//! subscriber contracts that in-vehicle features implement, and the callback
//! fan-out primitive used to notify those subscribers.
//!
//! This crate has zero dependencies on transports, storage back-ends, or UI.
//!
//! # Architecture overview
//!
//! A vehicle head unit keeps short-range links (BLE or RFCOMM) to the phones
//! of its users.  In-vehicle features exchange messages with those phones,
//! each feature scoping its traffic with a *recipient identifier*.
//!
//! - **`domain`** – Plain values: [`DeviceId`], [`ConnectedDevice`],
//!   [`DeviceMessage`], [`RecipientId`], and the [`DeviceError`] taxonomy,
//!   plus the callback traits features implement.
//!
//! - **`dispatch`** – *Where* callbacks run.  Every subscriber is registered
//!   together with an [`Executor`]; [`ThreadSafeCallbacks`] snapshots its
//!   subscribers and hands each one its own job on its own executor.

pub mod dispatch;
pub mod domain;

pub use dispatch::callbacks::{same_callback, Subscription, ThreadSafeCallbacks};
pub use dispatch::executor::{Executor, Job, SerialExecutor};
pub use domain::device::{AssociatedDevice, ConnectedDevice, DeviceId};
pub use domain::error::DeviceError;
pub use domain::message::{DeviceMessage, OperationKind, RecipientId};
pub use domain::subscriber::{Audience, ConnectionCallback, DeliveryDelegate, DeviceCallback};
