//! Bluetooth link to the smart cart
//! This module handles scanning for carts, connecting, decoding tag scan
//! notifications and writing commands and telemetry back.

mod codec;
mod commands;
mod connection;
mod constants;
mod error;
mod notification;
mod notifier;
mod recovery;
mod scanner;
mod session;
mod telemetry;
mod transport;
mod types;

// Re-export types that should be publicly accessible
pub use codec::{
    DecodeError, TagEvent, classify, decode_notification, encode_command, encode_telemetry, frame,
    telemetry_text, unframe,
};
pub use commands::{CartCommand, CommandChannel};
pub use connection::{CartEndpoints, ConnectionManager, resolve_endpoints};
pub use constants::*; // Re-export all constants
pub use error::LinkError;
pub use notification::{FrameOutcome, NotificationHandler};
pub use notifier::Notifier;
pub use recovery::RecoveryGuard;
pub use scanner::CartScanner;
pub use session::LinkSession;
pub use telemetry::{TelemetryFilter, TelemetryWatcher, haversine_m};
pub use transport::{BluestTransport, Transport, receiver_stream};
pub use types::{
    GpsSample, LinkEvent, LinkHandle, LinkState, PeripheralRef, PermissionState, ServiceInfo,
};
