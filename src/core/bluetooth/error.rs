//! Error taxonomy of the cart link.
//!
//! Every variant is scoped to the current session and recoverable by
//! rescanning or reconnecting.

use thiserror::Error;

use crate::core::bluetooth::codec::DecodeError;
use crate::core::bluetooth::types::LinkState;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("location permission has not been granted")]
    PermissionDenied,

    #[error("scan failed: {0}")]
    ScanError(String),

    #[error("connection to {peripheral_id} failed: {reason}")]
    ConnectionFailed { peripheral_id: String, reason: String },

    #[error("no service matching '{0}' found")]
    ServiceNotFound(String),

    #[error("no characteristic matching '{0}' found")]
    CharacteristicNotFound(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("write failed: {0}")]
    WriteError(String),

    #[error("item {0} is not in the catalogue")]
    UnknownItem(String),

    #[error("failed to fetch item {item_id}: {reason}")]
    LookupFailed { item_id: String, reason: String },

    #[error("no more stock of {0}")]
    StockExhausted(String),

    #[error("no cart is connected")]
    NotConnected,

    #[error("cart {0} disconnected unexpectedly")]
    UnsolicitedDisconnect(String),

    #[error("a connection is already in progress ({0:?})")]
    SessionBusy(LinkState),
}

impl LinkError {
    pub(crate) fn connection_failed(peripheral_id: &str, reason: impl ToString) -> Self {
        Self::ConnectionFailed {
            peripheral_id: peripheral_id.to_string(),
            reason: reason.to_string(),
        }
    }
}
