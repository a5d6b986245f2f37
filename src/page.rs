//! ANT+ heart-rate monitor page decoding.
//!
//! Every broadcast from the strap is an 8-byte page. Bytes 4-7 always carry
//! the live heart-rate fields; bytes 1-3 depend on the page number in byte 0
//! and are used by the strap to interleave slow-changing metadata (battery,
//! manufacturer, versions) with the beat stream.
//!
//! ```text
//! byte 0   : page number (bits 0-6) | page-change toggle (bit 7)
//! byte 1-3 : page specific
//! byte 4-5 : heart beat event time, 1/1024 s, little endian
//! byte 6   : heart beat count (wraps at 256)
//! byte 7   : computed heart rate (bpm)
//! ```

use std::fmt;

use serde::Serialize;

use crate::errors::{DriverError, Result};

/// Minimum length of a heart-rate page.
pub const PAGE_LEN: usize = 8;

/// Seconds per beat-time tick.
pub const TICKS_PER_SECOND: f64 = 1024.0;

const PAGE_OPERATING_TIME: u8 = 1;
const PAGE_MANUFACTURER: u8 = 2;
const PAGE_VERSION: u8 = 3;
const PAGE_BATTERY: u8 = 7;

/// Battery state reported in page 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum BatteryState {
    New,
    Good,
    Ok,
    Low,
    Critical,
    #[default]
    Unknown,
}

impl BatteryState {
    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => BatteryState::New,
            2 => BatteryState::Good,
            3 => BatteryState::Ok,
            4 => BatteryState::Low,
            5 => BatteryState::Critical,
            _ => BatteryState::Unknown,
        }
    }
}

impl fmt::Display for BatteryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatteryState::New => "New",
            BatteryState::Good => "Good",
            BatteryState::Ok => "Ok",
            BatteryState::Low => "Low",
            BatteryState::Critical => "Critical",
            BatteryState::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Page-specific content of bytes 1-3.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PageData {
    /// Cumulative operating time in seconds (2 s resolution).
    OperatingTime { seconds: u32 },
    Manufacturer { id: u8, serial: u16 },
    Version { hardware: u8, software: u8, model: u8 },
    Battery { volts: f64, state: BatteryState },
    /// Default data page or a page we do not decode; bytes 1-3 are ignored.
    HeartRateOnly,
}

/// One decoded heart-rate page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartRatePage {
    pub page: u8,
    pub data: PageData,
    /// Last beat event time in 1/1024 s ticks (wraps every 64 s).
    pub beat_ticks: u16,
    pub beat_count: u8,
    pub heart_rate: u8,
}

impl HeartRatePage {
    /// Beat event time in seconds within the 64 s tick window.
    pub fn beat_time(&self) -> f64 {
        self.beat_ticks as f64 / TICKS_PER_SECOND
    }
}

/// Decode one raw page.
///
/// Short frames are rejected with [`DriverError::ShortPacket`]; unknown page
/// numbers are not an error, only their metadata is skipped.
pub fn parse_page(data: &[u8]) -> Result<HeartRatePage> {
    if data.len() < PAGE_LEN {
        return Err(DriverError::ShortPacket { len: data.len() });
    }

    let page = data[0] & 0x7F;
    let page_data = match page {
        PAGE_OPERATING_TIME => {
            let units = u32::from_le_bytes([data[1], data[2], data[3], 0]);
            PageData::OperatingTime { seconds: units * 2 }
        }
        PAGE_MANUFACTURER => PageData::Manufacturer {
            id: data[1],
            serial: u16::from_le_bytes([data[2], data[3]]),
        },
        PAGE_VERSION => PageData::Version {
            hardware: data[1],
            software: data[2],
            model: data[3],
        },
        PAGE_BATTERY => {
            let coarse = (data[3] & 0x0F) as f64;
            let fractional = data[2] as f64 / 256.0;
            PageData::Battery {
                volts: ((coarse + fractional) * 100.0).round() / 100.0,
                state: BatteryState::from_bits((data[3] >> 4) & 0x07),
            }
        }
        _ => PageData::HeartRateOnly,
    };

    Ok(HeartRatePage {
        page,
        data: page_data,
        beat_ticks: u16::from_le_bytes([data[4], data[5]]),
        beat_count: data[6],
        heart_rate: data[7],
    })
}

/// Display name for an ANT+ manufacturer id.
pub fn manufacturer_name(id: Option<u8>) -> String {
    match id {
        Some(1) => "Garmin".to_string(),
        Some(33) => "Wahoo".to_string(),
        Some(123) => "Polar".to_string(),
        Some(other) => format!("ID {other}"),
        None => "Unknown".to_string(),
    }
}
