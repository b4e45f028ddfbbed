//! Application messages exchanged with a companion device.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier a feature chooses to scope the messages it receives from a device.
///
/// Recipient identifiers are unauthenticated at this layer; see
/// `RecipientChannelRegistry` for how collisions are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipientId(Uuid);

impl RecipientId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Generates a fresh random identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for RecipientId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// The kind of operation a [`DeviceMessage`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Free-form feature payload.
    ClientMessage,
    /// A request expecting a [`OperationKind::QueryResponse`].
    Query,
    /// The answer to an earlier [`OperationKind::Query`].
    QueryResponse,
    /// Transport-level acknowledgement.
    Acknowledgement,
}

/// An immutable message addressed to one recipient on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMessage {
    recipient_id: RecipientId,
    encrypted: bool,
    operation: OperationKind,
    payload: Vec<u8>,
}

impl DeviceMessage {
    pub fn new(
        recipient_id: RecipientId,
        encrypted: bool,
        operation: OperationKind,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            recipient_id,
            encrypted,
            operation,
            payload,
        }
    }

    /// Shorthand for an [`OperationKind::ClientMessage`].
    pub fn client_message(recipient_id: RecipientId, encrypted: bool, payload: Vec<u8>) -> Self {
        Self::new(recipient_id, encrypted, OperationKind::ClientMessage, payload)
    }

    pub fn recipient_id(&self) -> RecipientId {
        self.recipient_id
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn operation(&self) -> OperationKind {
        self.operation
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}
