//! Application layer: the session core of the head unit.
//!
//! Use cases here depend on the `Transport` and `DeviceStorage` traits, never
//! on a concrete link or database, so every rule is testable in-process.
//!
//! # Sub-modules
//!
//! - **`recipient_channels`** – Maps (device, recipient) to one exclusive
//!   subscriber, deny-lists colliding identifiers, and buffers messages that
//!   arrive before their subscriber registers.
//!
//! - **`connection_guard`**   – Single-flight gate for "connect the active
//!   user's device" requests.
//!
//! - **`device_registry`**    – The table of link-layer-connected devices.
//!   Drives connect → secure → disconnect, routes inbound messages, validates
//!   outbound ones, and decides when to reconnect.  This is the public
//!   contract transports and features talk to.

pub mod connection_guard;
pub mod device_registry;
pub mod recipient_channels;
