//! Defines shared data structures for the Bluetooth module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A peripheral seen while scanning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeripheralRef {
    /// Platform identifier, stable per physical device
    pub id: String,
    /// The advertised name, if any
    pub name: Option<String>,
    /// MAC address when the platform identifier carries one
    pub address: Option<String>,
    /// The signal strength (RSSI) at discovery
    pub rssi: Option<i16>,
    /// When the advertisement was first seen
    pub discovered_at: DateTime<Utc>,
}

impl PeripheralRef {
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
            address: None,
            rssi: None,
            discovered_at: Utc::now(),
        }
    }

    /// Name for user-facing notices
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Device")
    }

    /// True if `query` is this peripheral's identifier or (case-insensitive) name
    pub fn matches(&self, query: &str) -> bool {
        self.id == query
            || self
                .name
                .as_ref()
                .map(|name| name.eq_ignore_ascii_case(query))
                .unwrap_or(false)
    }
}

/// A service found during resolution, with its characteristic UUIDs
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// The live session object, held only while connected.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    pub peripheral: PeripheralRef,
    pub service: Uuid,
    /// Notification source
    pub inbound: Uuid,
    /// Command sink
    pub outbound: Uuid,
}

/// Link session states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkState {
    Idle,
    Scanning,
    Connecting,
    Resolving,
    Connected,
    Disconnecting,
}

impl LinkState {
    /// States from which a new connection may be requested
    pub fn accepts_connect(self) -> bool {
        matches!(self, Self::Idle | Self::Scanning)
    }
}

/// Location permission as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionState {
    #[default]
    Unknown,
    Granted,
    Denied,
}

/// A position fix
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsSample {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsSample {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Events pushed to the UI
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum LinkEvent {
    StateChanged(LinkState),
    PermissionChanged(PermissionState),
    ScanStarted,
    PeripheralFound(PeripheralRef),
    ConnectionFailed {
        peripheral_id: String,
        reason: String,
    },
    Connected(PeripheralRef),
    Disconnected {
        peripheral_id: String,
        unsolicited: bool,
    },
    /// The connected cart went away without being asked to
    PeripheralLost {
        peripheral_id: String,
        name: String,
    },
    CartUpdated {
        item_id: String,
        quantity: u32,
    },
    UnknownItem {
        item_id: String,
    },
    /// The catalogue could not be read; the scan was not applied
    LookupFailed {
        item_id: String,
        reason: String,
    },
    StockExhausted {
        item_id: String,
        name: String,
    },
    WriteFailed {
        reason: String,
    },
}
