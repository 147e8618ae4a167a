//! Wire codec for the cart link
//!
//! Every payload that crosses the link is base64 framed. Outbound payloads are
//! ASCII command tokens or `lat,lon` telemetry strings; inbound payloads are
//! free text of which only the `RFID:<id>` form is meaningful.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

use crate::core::bluetooth::constants::TAG_SCAN_PREFIX;

/// The frame could not be unwrapped from its base64 transport encoding
#[derive(Debug, Error)]
#[error("malformed notification frame: {0}")]
pub struct DecodeError(#[from] base64::DecodeError);

/// Decoded inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagEvent {
    /// A tag was read by the cart hardware
    TagScan { item_id: String },
    /// Anything else; ignored by the event channel
    Unrecognized { raw: String },
}

/// Wraps raw bytes into a transport frame.
pub fn frame(raw: &[u8]) -> Vec<u8> {
    STANDARD.encode(raw).into_bytes()
}

/// Unwraps a transport frame into the raw bytes it carries.
pub fn unframe(frame: &[u8]) -> Result<Vec<u8>, DecodeError> {
    Ok(STANDARD.decode(frame)?)
}

/// Encodes a command token. Any token is accepted verbatim.
pub fn encode_command(token: &str) -> Vec<u8> {
    frame(token.as_bytes())
}

/// Formats a position as `<lat>,<lon>` with six decimals and frames it.
pub fn encode_telemetry(lat: f64, lon: f64) -> Vec<u8> {
    frame(telemetry_text(lat, lon).as_bytes())
}

pub fn telemetry_text(lat: f64, lon: f64) -> String {
    format!("{:.6},{:.6}", lat, lon)
}

/// Unwraps a notification frame into text.
///
/// Only broken framing is an error. Content that is not valid UTF-8 is
/// decoded lossily and left for [`classify`] to ignore.
pub fn decode_notification(frame: &[u8]) -> Result<String, DecodeError> {
    let raw = unframe(frame)?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Classifies decoded notification text.
pub fn classify(text: &str) -> TagEvent {
    match text.strip_prefix(TAG_SCAN_PREFIX) {
        Some(item_id) => TagEvent::TagScan {
            item_id: item_id.to_string(),
        },
        None => TagEvent::Unrecognized {
            raw: text.to_string(),
        },
    }
}
