//! Infrastructure layer for the session manager.
//!
//! Contains the collaborator contracts the core talks to (the short-range
//! transport and device-identity storage) together with the adapters shipped
//! in this crate: a recording transport for tests, a loopback transport that
//! emulates a phone, an in-memory storage, and the TOML configuration file.

pub mod storage;
pub mod transport;
