//! Smart cart link library
//! Bluetooth link between the shopper's device and the smart cart, plus the
//! cart ledger, billing and console commands built on it.

// Module declarations
pub mod commands;
pub mod config;
pub mod core;
pub mod logging;
pub mod state;
pub mod utils;
