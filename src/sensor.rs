//! Connection manager for one heart-rate strap.
//!
//! # Threading
//!
//! One worker thread per started sensor owns the transport and is the only
//! writer of [`SensorState`]. Pollers take a [`DataSnapshot`] under the same
//! mutex, so a snapshot never mixes fields from two different pages. The
//! worker handle lives behind a second mutex; `snapshot()` never waits for a
//! `start()` or `stop()` in progress.
//!
//! # Lifecycle
//!
//! - `start()` spawns the worker, which opens the transport and then blocks in
//!   its receive loop. `start()` waits (bounded) until the open either
//!   succeeded or failed and returns that result.
//! - `stop()` raises the stop flag and waits at most `stop_timeout` for the
//!   worker to close the transport. All buffers are discarded afterwards.
//! - A worker that missed the stop deadline is remembered; `start()` refuses
//!   with [`DriverError::Busy`] until it has released the device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::beat::{BeatExtractor, BeatOutcome};
use crate::config::SensorConfig;
use crate::errors::{DriverError, Result};
use crate::page::{self, PageData};
use crate::snapshot::{ConnectionStatus, DataSnapshot, DeviceMetadata};
use crate::transport::Connector;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Page pipeline
// ============================================================================

/// Everything derived from the page stream of one session.
///
/// This is plain data with no I/O; the worker feeds it pages and pollers copy
/// it into snapshots.
#[derive(Debug, Clone)]
pub struct SensorState {
    beats: BeatExtractor,
    metadata: DeviceMetadata,
    bpm: u8,
    status: ConnectionStatus,
    last_packet_hex: String,
    last_packet_at: Option<Instant>,
    malformed_packets: u64,
    stale_after: Duration,
}

impl SensorState {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            beats: BeatExtractor::new(),
            metadata: DeviceMetadata::default(),
            bpm: 0,
            status: ConnectionStatus::Initializing,
            last_packet_hex: String::new(),
            last_packet_at: None,
            malformed_packets: 0,
            stale_after,
        }
    }

    /// Channel is open; staleness is measured from here until the first page.
    pub fn mark_open(&mut self, now: Instant) {
        self.status = ConnectionStatus::Initializing;
        self.last_packet_at = Some(now);
    }

    pub fn set_status(&mut self, status: ConnectionStatus) {
        self.status = status;
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    pub fn beats(&self) -> &BeatExtractor {
        &self.beats
    }

    pub fn metadata(&self) -> &DeviceMetadata {
        &self.metadata
    }

    /// Apply one raw page. Malformed pages are counted and otherwise ignored.
    pub fn ingest(&mut self, raw: &[u8], now: Instant) -> Option<BeatOutcome> {
        let page = match page::parse_page(raw) {
            Ok(page) => page,
            Err(e) => {
                self.malformed_packets += 1;
                debug!("skipping malformed page: {e}, raw={:02X?}", raw);
                return None;
            }
        };

        self.last_packet_at = Some(now);
        self.last_packet_hex = hex::encode(raw);
        self.apply_metadata(&page.data);
        self.bpm = page.heart_rate;

        let outcome = self.beats.process(&page);
        if let BeatOutcome::Accepted { .. } = outcome {
            self.status = ConnectionStatus::Active;
        }
        Some(outcome)
    }

    /// Pure form of [`ingest`](Self::ingest): previous state and one page in,
    /// next state and its snapshot out.
    pub fn step(mut self, raw: &[u8], now: Instant) -> (Self, DataSnapshot) {
        self.ingest(raw, now);
        let snapshot = self.snapshot(now);
        (self, snapshot)
    }

    fn apply_metadata(&mut self, data: &PageData) {
        let meta = &mut self.metadata;
        match *data {
            PageData::OperatingTime { seconds } => meta.operating_seconds = Some(seconds),
            PageData::Manufacturer { id, serial } => {
                meta.manufacturer_id = Some(id);
                meta.serial = Some(serial);
            }
            PageData::Version {
                hardware,
                software,
                model,
            } => {
                meta.hw_version = Some(hardware);
                meta.sw_version = Some(software);
                meta.model_number = Some(model);
            }
            PageData::Battery { volts, state } => {
                meta.battery_volts = Some(volts);
                meta.battery_state = state;
            }
            PageData::HeartRateOnly => {}
        }
    }

    /// Copy of the state as seen at `now`, with staleness applied.
    pub fn snapshot(&self, now: Instant) -> DataSnapshot {
        let stale = self.status.is_active()
            && self
                .last_packet_at
                .map_or(true, |t| now.saturating_duration_since(t) > self.stale_after);

        let (status, bpm) = if stale {
            (ConnectionStatus::SignalLost, 0)
        } else {
            (self.status.clone(), self.bpm)
        };

        let meta = &self.metadata;
        DataSnapshot {
            bpm,
            rmssd_ms: self.beats.rmssd_ms(),
            rr_ms: self.beats.rr_ms(),
            raw_rr_ms: self.beats.raw_rr_ms(),
            status,
            manufacturer: page::manufacturer_name(meta.manufacturer_id),
            manufacturer_id: meta.manufacturer_id,
            serial: meta.serial,
            hw_version: meta.hw_version,
            sw_version: meta.sw_version,
            model_number: meta.model_number,
            battery_volts: meta.battery_volts,
            battery_state: meta.battery_state.to_string(),
            uptime_hours: meta
                .operating_seconds
                .map(|s| (s as f64 / 360.0).round() / 10.0),
            raw_packet_hex: self.last_packet_hex.clone(),
            rr_count: self.beats.rr_history().len(),
            consecutive_rejections: self.beats.consecutive_rejections(),
            malformed_packets: self.malformed_packets,
        }
    }
}

// ============================================================================
// Connection manager
// ============================================================================

struct Worker {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
    exited: mpsc::Receiver<()>,
}

#[derive(Default)]
struct Lifecycle {
    worker: Option<Worker>,
    /// Worker that missed the stop deadline and may still hold the device.
    lingering: Option<JoinHandle<()>>,
}

/// Heart-rate strap driver.
///
/// # Example
/// ```ignore
/// let sensor = HrvSensor::new(SensorConfig::default(), SerialConnector::new(serial_config));
/// sensor.start()?;
/// let data = sensor.snapshot();
/// println!("{} bpm, rmssd {:.1} ms ({})", data.bpm, data.rmssd_ms, data.status);
/// sensor.stop();
/// ```
pub struct HrvSensor {
    connector: Arc<dyn Connector>,
    config: SensorConfig,
    state: Arc<Mutex<SensorState>>,
    alive: Arc<AtomicBool>,
    lifecycle: Mutex<Lifecycle>,
}

impl HrvSensor {
    pub fn new(config: SensorConfig, connector: impl Connector + 'static) -> Self {
        Self::with_connector(config, Arc::new(connector))
    }

    pub fn with_connector(config: SensorConfig, connector: Arc<dyn Connector>) -> Self {
        let state = SensorState::new(config.stale_after());
        Self {
            connector,
            config,
            state: Arc::new(Mutex::new(state)),
            alive: Arc::new(AtomicBool::new(false)),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    /// Open the device and start receiving pages.
    ///
    /// Does nothing if the worker is already running.
    pub fn start(&self) -> Result<()> {
        let mut life = lock(&self.lifecycle);

        if let Some(worker) = &life.worker {
            if !worker.handle.is_finished() {
                debug!("start ignored: sensor worker already running");
                return Ok(());
            }
        }
        if let Some(finished) = life.worker.take() {
            join_worker(finished.handle);
        }
        if let Some(previous) = life.lingering.take() {
            if !previous.is_finished() {
                life.lingering = Some(previous);
                return Err(DriverError::Busy(
                    "previous sensor worker has not released the device".into(),
                ));
            }
            join_worker(previous);
        }

        *lock(&self.state) = SensorState::new(self.config.stale_after());

        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();
        let (exit_tx, exit_rx) = mpsc::channel();
        let context = WorkerContext {
            connector: Arc::clone(&self.connector),
            state: Arc::clone(&self.state),
            stop: Arc::clone(&stop),
            alive: Arc::clone(&self.alive),
        };

        self.alive.store(true, Ordering::Release);
        let handle = thread::Builder::new()
            .name("ant-hrm-worker".into())
            .spawn(move || {
                context.run(ready_tx);
                let _ = exit_tx.send(());
            })
            .map_err(|e| {
                self.alive.store(false, Ordering::Release);
                DriverError::WorkerSpawn(e.to_string())
            })?;

        let worker = Worker {
            handle,
            stop,
            exited: exit_rx,
        };

        match ready_rx.recv_timeout(self.config.open_timeout()) {
            Ok(Ok(())) => {
                info!("sensor started");
                life.worker = Some(worker);
                Ok(())
            }
            Ok(Err(e)) => {
                self.reap(&mut life, worker);
                Err(e)
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "device did not open within {:?}, abandoning start",
                    self.config.open_timeout()
                );
                self.reap(&mut life, worker);
                let reason = "device open timed out".to_string();
                lock(&self.state).set_status(ConnectionStatus::Error(reason.clone()));
                Err(DriverError::Timeout(reason))
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.reap(&mut life, worker);
                let reason = "sensor worker exited during open".to_string();
                lock(&self.state).set_status(ConnectionStatus::Error(reason.clone()));
                Err(DriverError::NotReady(reason))
            }
        }
    }

    /// Stop receiving and release the device.
    ///
    /// Safe to call repeatedly and on a sensor that was never started. Waits
    /// at most `stop_timeout` for the worker.
    pub fn stop(&self) {
        let mut life = lock(&self.lifecycle);
        let Some(worker) = life.worker.take() else {
            debug!("stop: sensor not running");
            return;
        };

        info!("stopping sensor");
        if self.reap(&mut life, worker) {
            debug!("sensor worker joined");
        }

        let mut state = SensorState::new(self.config.stale_after());
        state.set_status(ConnectionStatus::Stopped);
        *lock(&self.state) = state;
    }

    /// Whether a worker currently holds the device.
    pub fn is_running(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Current derived state. Never blocks on device I/O.
    pub fn snapshot(&self) -> DataSnapshot {
        lock(&self.state).snapshot(Instant::now())
    }

    /// Signal the worker and wait for it; returns false if it missed the deadline.
    fn reap(&self, life: &mut Lifecycle, worker: Worker) -> bool {
        worker.stop.store(true, Ordering::Release);
        match worker.exited.recv_timeout(self.config.stop_timeout()) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                join_worker(worker.handle);
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "sensor worker did not exit within {:?}; device may still be held",
                    self.config.stop_timeout()
                );
                life.lingering = Some(worker.handle);
                false
            }
        }
    }
}

impl Drop for HrvSensor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_worker(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        warn!("sensor worker panicked");
    }
}

struct WorkerContext {
    connector: Arc<dyn Connector>,
    state: Arc<Mutex<SensorState>>,
    stop: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
}

impl WorkerContext {
    fn run(self, ready: mpsc::Sender<Result<()>>) {
        self.acquire_and_receive(ready);
        self.alive.store(false, Ordering::Release);
        debug!("sensor worker exited");
    }

    fn acquire_and_receive(&self, ready: mpsc::Sender<Result<()>>) {
        let mut transport = match self.connector.connect() {
            Ok(transport) => transport,
            Err(e) => {
                self.record_failure(&e);
                let _ = ready.send(Err(e));
                return;
            }
        };

        match transport.open() {
            Ok(()) if self.stop.load(Ordering::Acquire) => {
                // start() already gave up on this open and reported it
                debug!("channel opened after start was abandoned, releasing");
            }
            Ok(()) => {
                lock(&self.state).mark_open(Instant::now());
                let _ = ready.send(Ok(()));
                debug!("channel open, receiving pages");

                let state = &self.state;
                let stop = &self.stop;
                let mut on_page = |raw: &[u8]| {
                    if stop.load(Ordering::Acquire) {
                        return;
                    }
                    lock(state).ingest(raw, Instant::now());
                };

                match transport.run(&self.stop, &mut on_page) {
                    Ok(()) if self.stop.load(Ordering::Acquire) => {
                        debug!("receive loop stopped on request")
                    }
                    Ok(()) => {
                        warn!("receive loop ended without a stop request");
                        lock(&self.state).set_status(ConnectionStatus::Stopped);
                    }
                    Err(e) => self.record_failure(&e),
                }
            }
            Err(e) => {
                self.record_failure(&e);
                let _ = ready.send(Err(e));
            }
        }

        // Teardown runs whatever happened above.
        if let Err(e) = transport.close() {
            warn!("closing transport failed (ignored): {e}");
        }
        drop(transport);
    }

    fn record_failure(&self, e: &DriverError) {
        if self.stop.load(Ordering::Acquire) {
            debug!("ignoring failure after stop request: {e}");
            return;
        }
        warn!("sensor failure: {e}");
        lock(&self.state).set_status(ConnectionStatus::Error(e.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hr_page(page: u8, b1: u8, b2: u8, b3: u8, secs: f64, count: u8, bpm: u8) -> [u8; 8] {
        let ticks = ((secs * 1024.0).round() as u32 % 65536) as u16;
        let [lo, hi] = ticks.to_le_bytes();
        [page, b1, b2, b3, lo, hi, count, bpm]
    }

    #[test]
    fn accepted_beat_makes_status_active() {
        let t0 = Instant::now();
        let mut state = SensorState::new(Duration::from_secs(4));
        state.ingest(&hr_page(4, 0, 0, 0, 1.0, 0, 75), t0);
        assert_eq!(state.status(), &ConnectionStatus::Initializing);
        state.ingest(&hr_page(4, 0, 0, 0, 1.8, 1, 75), t0);
        let snap = state.snapshot(t0);
        assert_eq!(snap.status, ConnectionStatus::Active);
        assert_eq!(snap.bpm, 75);
        assert_eq!(snap.rr_ms, 800);
        assert_eq!(snap.raw_packet_hex, "040000003307014b");
    }

    #[test]
    fn step_is_pure_state_transition() {
        let t0 = Instant::now();
        let state = SensorState::new(Duration::from_secs(4));
        let (state, first) = state.step(&hr_page(4, 0, 0, 0, 1.0, 0, 60), t0);
        assert_eq!(first.rr_count, 0);
        let (state, second) = state.step(&hr_page(4, 0, 0, 0, 2.0, 1, 60), t0);
        assert_eq!(second.rr_count, 1);
        assert_eq!(second.rr_ms, 1000);
        assert_eq!(state.beats().rr_history().len(), 1);
    }

    #[test]
    fn metadata_pages_fill_snapshot() {
        let t0 = Instant::now();
        let mut state = SensorState::new(Duration::from_secs(4));
        state.ingest(&hr_page(0x82, 1, 0x39, 0x30, 1.0, 0, 70), t0);
        state.ingest(&hr_page(0x07, 0, 128, 0x33, 1.0, 0, 70), t0);
        state.ingest(&hr_page(0x83, 2, 5, 9, 1.0, 0, 70), t0);
        state.ingest(&hr_page(0x01, 0x10, 0x0E, 0, 1.0, 0, 70), t0);

        let snap = state.snapshot(t0);
        assert_eq!(snap.manufacturer, "Garmin");
        assert_eq!(snap.serial, Some(12345));
        assert_eq!(snap.battery_volts, Some(3.5));
        assert_eq!(snap.battery_state, "Ok");
        assert_eq!(snap.hw_version, Some(2));
        assert_eq!(snap.sw_version, Some(5));
        assert_eq!(snap.model_number, Some(9));
        assert_eq!(snap.uptime_hours, Some(2.0));
    }

    #[test]
    fn unknown_manufacturer_shows_id() {
        let t0 = Instant::now();
        let mut state = SensorState::new(Duration::from_secs(4));
        state.ingest(&hr_page(0x02, 250, 0, 0, 1.0, 0, 70), t0);
        assert_eq!(state.snapshot(t0).manufacturer, "ID 250");
    }

    #[test]
    fn malformed_page_is_counted_not_applied() {
        let t0 = Instant::now();
        let mut state = SensorState::new(Duration::from_secs(4));
        assert!(state.ingest(&[0x04, 0x00], t0).is_none());
        let snap = state.snapshot(t0);
        assert_eq!(snap.malformed_packets, 1);
        assert_eq!(snap.raw_packet_hex, "");
        assert_eq!(snap.bpm, 0);
    }

    #[test]
    fn silence_while_active_reports_signal_lost() {
        let t0 = Instant::now();
        let mut state = SensorState::new(Duration::from_secs(4));
        state.ingest(&hr_page(4, 0, 0, 0, 1.0, 0, 72), t0);
        state.ingest(&hr_page(4, 0, 0, 0, 1.8, 1, 72), t0);

        let fresh = state.snapshot(t0 + Duration::from_millis(3_900));
        assert_eq!(fresh.status, ConnectionStatus::Active);
        assert_eq!(fresh.bpm, 72);

        let stale = state.snapshot(t0 + Duration::from_millis(4_100));
        assert_eq!(stale.status, ConnectionStatus::SignalLost);
        assert_eq!(stale.bpm, 0);
        // history survives a soft loss
        assert_eq!(stale.rr_count, 1);
        assert_eq!(state.beats().rr_history().len(), 1);
    }

    #[test]
    fn silence_before_first_beat_is_not_signal_lost() {
        let t0 = Instant::now();
        let mut state = SensorState::new(Duration::from_secs(4));
        state.mark_open(t0);
        let snap = state.snapshot(t0 + Duration::from_secs(10));
        assert_eq!(snap.status, ConnectionStatus::Initializing);
    }

    #[test]
    fn stop_on_never_started_sensor_is_a_no_op() {
        let connector = || -> Result<Box<dyn crate::transport::Transport>> {
            Err(DriverError::NotReady("unused".into()))
        };
        let sensor = HrvSensor::new(SensorConfig::default(), connector);
        sensor.stop();
        sensor.stop();
        assert!(!sensor.is_running());
        assert_eq!(sensor.snapshot().status, ConnectionStatus::Initializing);
    }
}
