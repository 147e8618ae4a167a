//! Constants used throughout the link stack
//! This module contains the GATT fragments, timeouts and protocol literals
//! shared by the codec, the session and the transport.

/// Fragment of the smart cart service UUID (matched case-insensitively)
pub const CART_SERVICE_FRAGMENT: &str = "fff0";

/// Fragment of the characteristic the cart notifies tag scans on
pub const CART_INBOUND_CHAR_FRAGMENT: &str = "fff2";

/// Fragment of the characteristic the cart accepts commands on
pub const CART_OUTBOUND_CHAR_FRAGMENT: &str = "fff1";

/// Prefix of a tag scan notification
pub const TAG_SCAN_PREFIX: &str = "RFID:";

/// Timeout for establishing the connection in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Timeout for service and characteristic discovery in milliseconds
pub const DEFAULT_RESOLVE_TIMEOUT_MS: u64 = 10_000;

/// Timeout for a single acknowledged write in milliseconds
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5_000;

/// Number of outbound writes that may wait behind the one in flight
pub const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 32;

/// Buffer size of the forwarding channels between the platform stack and the session
pub const TRANSPORT_CHANNEL_CAPACITY: usize = 64;

/// Buffer size of the UI event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 128;
