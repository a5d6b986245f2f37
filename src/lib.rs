//! ANT+ heart-rate strap driver with HRV.
//!
//! Turns the strap's 4 Hz broadcast pages into a live heart rate, filtered RR
//! intervals and RMSSD, and keeps the device connected through dropouts and
//! "device busy" failures.
//!
//! # Layers
//!
//! 1. [`page`] decodes one 8-byte page.
//! 2. [`beat`] turns beat timestamps into RR intervals and rejects artifacts.
//! 3. [`hrv`] computes RMSSD over the accepted intervals.
//! 4. [`HrvSensor`] runs a worker thread per device and serves snapshots.
//! 5. [`Supervisor`] retries busy devices and restarts dead workers.
//!
//! Pages arrive through a [`Transport`]: [`SerialTransport`] for an ANT USB
//! stick, [`ReplayTransport`] for recordings.
//!
//! # Timing
//!
//! The strap timestamps each beat in 1/1024 s ticks that wrap every 64 s.
//! RR intervals come from those timestamps, never from host arrival times, so
//! radio latency does not leak into HRV.

pub mod beat;
pub mod config;
mod errors;
pub mod hrv;
pub mod logging;
pub mod page;
pub mod replay;
pub mod sensor;
pub mod serial;
pub mod snapshot;
pub mod supervisor;
pub mod transport;

#[cfg(feature = "python")]
mod python;

pub use beat::{BeatExtractor, BeatOutcome, Rejection};
pub use config::{MonitorConfig, SensorConfig, SerialConfig, SupervisorConfig};
pub use errors::*;
pub use page::{parse_page, BatteryState, HeartRatePage, PageData};
pub use replay::{ReplayConnector, ReplayTransport};
pub use sensor::{HrvSensor, SensorState};
pub use serial::{SerialConnector, SerialTransport};
pub use snapshot::{ConnectionStatus, DataSnapshot, DeviceMetadata};
pub use supervisor::{LinkState, Supervisor};
pub use transport::{Connector, Transport};
