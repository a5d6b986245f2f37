//! Read-only view of the sensor for pollers (GUI, session logger).

use std::fmt;

use serde::{Serialize, Serializer};

use crate::page::BatteryState;

/// Connection status as seen by consumers.
///
/// `bpm` in a [`DataSnapshot`] is only meaningful while the status is
/// [`ConnectionStatus::Active`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Initializing,
    /// Supervisor is opening the device.
    Searching,
    /// Supervisor is waiting to retry after a busy device.
    Retrying { attempt: u32, max: u32 },
    Active,
    /// No page for longer than the staleness threshold.
    SignalLost,
    Error(String),
    Stopped,
}

impl ConnectionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionStatus::Active)
    }

    pub fn is_signal_lost(&self) -> bool {
        matches!(self, ConnectionStatus::SignalLost)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ConnectionStatus::Error(_))
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Initializing => f.write_str("Initializing"),
            ConnectionStatus::Searching => f.write_str("Searching"),
            ConnectionStatus::Retrying { attempt, max } => {
                write!(f, "Retrying ({attempt}/{max})")
            }
            ConnectionStatus::Active => f.write_str("Active"),
            ConnectionStatus::SignalLost => f.write_str("Signal Lost"),
            ConnectionStatus::Error(reason) => write!(f, "Error: {reason}"),
            ConnectionStatus::Stopped => f.write_str("Stopped"),
        }
    }
}

impl Serialize for ConnectionStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Device information gathered from the interleaved metadata pages.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct DeviceMetadata {
    pub manufacturer_id: Option<u8>,
    pub serial: Option<u16>,
    pub hw_version: Option<u8>,
    pub sw_version: Option<u8>,
    pub model_number: Option<u8>,
    pub battery_volts: Option<f64>,
    pub battery_state: BatteryState,
    pub operating_seconds: Option<u32>,
}

/// Instantaneous copy of the derived sensor state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataSnapshot {
    pub bpm: u8,
    pub rmssd_ms: f64,
    pub rr_ms: u32,
    pub raw_rr_ms: u32,
    pub status: ConnectionStatus,
    pub manufacturer: String,
    pub manufacturer_id: Option<u8>,
    pub serial: Option<u16>,
    pub hw_version: Option<u8>,
    pub sw_version: Option<u8>,
    pub model_number: Option<u8>,
    pub battery_volts: Option<f64>,
    pub battery_state: String,
    pub uptime_hours: Option<f64>,
    pub raw_packet_hex: String,
    /// Accepted intervals currently in the RMSSD window.
    pub rr_count: usize,
    pub consecutive_rejections: u32,
    pub malformed_packets: u64,
}

impl DataSnapshot {
    /// Whether `bpm` can be shown as a live value.
    pub fn has_live_heart_rate(&self) -> bool {
        self.status.is_active() && self.bpm > 0
    }
}
