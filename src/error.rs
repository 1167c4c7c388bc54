use crate::model::CardStatus;
use crate::types::{CardId, RoomId};
use thiserror::Error;

/// Store-layer error type.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by this crate.
///
/// Access denials are not errors; they are reported through
/// [`Decision`](crate::Decision).
#[derive(Debug, Error)]
pub enum Error {
    /// Store error wrapper.
    #[error("store error: {0}")]
    Store(#[source] StoreError),
    /// Invalid identifier input.
    #[error("invalid id: {0}")]
    InvalidId(String),
    /// Invalid permission input.
    #[error("invalid permission: {0}")]
    InvalidPermission(String),
    /// The room named in an access check does not exist.
    #[error("room {0} not found")]
    RoomNotFound(RoomId),
    /// The card named in a lifecycle operation does not exist.
    #[error("card {0} not found")]
    CardNotFound(CardId),
    /// Lifecycle transition not allowed from the card's current status.
    #[error("card {card} cannot move from {from} to {to}")]
    InvalidCardTransition {
        card: CardId,
        from: CardStatus,
        to: CardStatus,
    },
    /// Event payload could not be encoded for the wire.
    #[error("event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<StoreError> for Error {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}
