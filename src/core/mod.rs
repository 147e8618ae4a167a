//! Core functionality for the smart cart link
//! This module contains the Bluetooth link, the cart ledger it feeds and the
//! collaborators it consults.

pub mod bill;
pub mod bluetooth;
pub mod cart;
pub mod services;

// Re-export commonly used types
pub use bluetooth::LinkSession;
pub use cart::{AddOutcome, Ceiling, SharedLedger};
