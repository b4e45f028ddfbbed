//! Errors delivered to device callbacks.
//!
//! These are never returned from a function call: the registry hands them to
//! the affected subscribers through [`super::subscriber::DeviceCallback::on_device_error`].

use thiserror::Error;

/// Failure reported asynchronously to a feature's device callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum DeviceError {
    /// The recipient identifier collided with another registration or is
    /// deny-listed.  The identifier can never be registered again.
    #[error("insecure recipient identifier detected")]
    InsecureRecipientDetected,

    /// Secure channel establishment failed for the device.
    #[error("invalid security key for device")]
    InvalidSecurityKey,
}
