//! Domain entities for the companion link.
//!
//! Everything in this module is an immutable value or a trait.  A change in
//! device state never mutates a record in place: a new [`device::ConnectedDevice`]
//! replaces the old one, so snapshots already handed to subscribers stay valid.

pub mod device;
pub mod error;
pub mod message;
pub mod subscriber;
