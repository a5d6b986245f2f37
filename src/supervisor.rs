//! Reconnect supervision above the connection manager.
//!
//! The supervisor is an explicit state machine:
//!
//! ```text
//! Idle ──connect()──▶ Connecting{n} ──ok──▶ Active ──dropout──▶ Connecting{1}
//!                        │  ▲
//!                  busy  │  │ retry_delay
//!                        ▼  │
//!                     Backoff{n} ──n == max──▶ Error(reason)
//!
//! reset(): any ──▶ Backoff{0} ──debounce──▶ Connecting{1}
//! shutdown(): any ──▶ Stopped
//! ```
//!
//! All waiting happens on timers of a small tokio runtime owned by the
//! supervisor, so `connect()`, `reset()` and `snapshot()` return immediately.
//! Opening the device itself is blocking and runs on the runtime's blocking
//! pool.
//!
//! `reconnecting` is the non-reentrant guard: while an attempt sequence is in
//! flight, further `connect()` calls are refused. `generation` is bumped by
//! `reset()`/`shutdown()`; timer tasks from an older generation do nothing
//! when they fire.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::SupervisorConfig;
use crate::errors::{DriverError, Result};
use crate::sensor::{lock, HrvSensor};
use crate::snapshot::{ConnectionStatus, DataSnapshot};

/// Supervisor state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    /// Attempt `attempt` is opening the device.
    Connecting { attempt: u32 },
    /// Waiting `delay` before the next attempt. `attempt` is the last one
    /// that failed, 0 after a manual reset.
    Backoff { attempt: u32, delay: Duration },
    Active,
    /// Gave up; only `connect()` or `reset()` leave this state.
    Error(String),
    Stopped,
}

struct Machine {
    state: LinkState,
    reconnecting: bool,
    attempt: u32,
    generation: u64,
    pending: Option<JoinHandle<()>>,
    last_auto_reconnect: Option<Instant>,
}

impl Machine {
    fn cancel_pending(&mut self) {
        if let Some(task) = self.pending.take() {
            task.abort();
        }
    }
}

struct Shared {
    config: SupervisorConfig,
    sensor: HrvSensor,
    machine: Mutex<Machine>,
    handle: Handle,
}

/// Keeps one [`HrvSensor`] connected.
pub struct Supervisor {
    shared: Arc<Shared>,
    watchdog: Option<JoinHandle<()>>,
    runtime: Option<Runtime>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, sensor: HrvSensor) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("ant-hrm-supervisor")
            .enable_time()
            .build()
            .map_err(DriverError::Io)?;

        let interval = config.watchdog_interval().max(Duration::from_millis(1));
        let shared = Arc::new(Shared {
            config,
            sensor,
            machine: Mutex::new(Machine {
                state: LinkState::Idle,
                reconnecting: false,
                attempt: 0,
                generation: 0,
                pending: None,
                last_auto_reconnect: None,
            }),
            handle: runtime.handle().clone(),
        });

        let watchdog = {
            let shared = Arc::clone(&shared);
            runtime.spawn(async move {
                let mut tick = tokio::time::interval(interval);
                tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tick.tick().await;
                    shared.watchdog_tick();
                }
            })
        };

        Ok(Self {
            shared,
            watchdog: Some(watchdog),
            runtime: Some(runtime),
        })
    }

    /// Start an attempt sequence.
    ///
    /// Returns false, and does nothing, if one is already running or the
    /// link is active with a live worker.
    pub fn connect(&self) -> bool {
        self.shared.connect()
    }

    /// Close the device, cancel pending retries and try again after the
    /// reset debounce.
    pub fn reset(&self) {
        self.shared.reset();
    }

    /// Cancel everything and release the device.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    pub fn state(&self) -> LinkState {
        lock(&self.shared.machine).state.clone()
    }

    /// Whether an attempt sequence is in flight.
    pub fn is_reconnecting(&self) -> bool {
        lock(&self.shared.machine).reconnecting
    }

    pub fn sensor(&self) -> &HrvSensor {
        &self.shared.sensor
    }

    /// Sensor snapshot with the supervisor's interim states applied.
    pub fn snapshot(&self) -> DataSnapshot {
        let link = self.state();
        let max = self.shared.config.max_attempts;
        let mut snapshot = self.shared.sensor.snapshot();

        match link {
            LinkState::Connecting { attempt } if attempt <= 1 => {
                snapshot.status = ConnectionStatus::Searching;
            }
            LinkState::Connecting { attempt } => {
                snapshot.status = ConnectionStatus::Retrying { attempt, max };
            }
            LinkState::Backoff { attempt: 0, .. } => {
                snapshot.status = ConnectionStatus::Searching;
            }
            LinkState::Backoff { attempt, .. } => {
                snapshot.status = ConnectionStatus::Retrying {
                    attempt: attempt + 1,
                    max,
                };
            }
            LinkState::Error(reason) if !snapshot.status.is_error() => {
                snapshot.status = ConnectionStatus::Error(reason);
            }
            _ => {}
        }
        snapshot
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shared.shutdown();
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl Shared {
    fn connect(self: &Arc<Self>) -> bool {
        let mut machine = lock(&self.machine);
        if machine.reconnecting {
            info!("connect ignored: reconnect already in progress");
            return false;
        }
        if machine.state == LinkState::Active && self.sensor.is_running() {
            debug!("connect ignored: link already active");
            return false;
        }
        self.begin_attempts(&mut machine);
        true
    }

    /// Schedule attempt 1 regardless of the current state.
    fn begin_attempts(self: &Arc<Self>, machine: &mut Machine) {
        machine.cancel_pending();
        machine.reconnecting = true;
        machine.attempt = 1;
        machine.state = LinkState::Connecting { attempt: 1 };
        let generation = machine.generation;
        machine.pending = Some(self.schedule_attempt(generation, 1, Duration::ZERO));
    }

    fn reset(self: &Arc<Self>) {
        let debounce = self.config.reset_debounce();
        let mut machine = lock(&self.machine);
        machine.generation += 1;
        machine.cancel_pending();
        machine.reconnecting = false;
        machine.attempt = 0;
        machine.state = LinkState::Backoff {
            attempt: 0,
            delay: debounce,
        };
        let generation = machine.generation;
        info!("manual reset: reopening device in {:?}", debounce);

        let shared = Arc::clone(self);
        machine.pending = Some(self.handle.spawn(async move {
            let closing = Arc::clone(&shared);
            if tokio::task::spawn_blocking(move || closing.sensor.stop())
                .await
                .is_err()
            {
                warn!("closing the device during reset failed");
            }
            tokio::time::sleep(debounce).await;

            {
                let mut machine = lock(&shared.machine);
                if machine.generation != generation {
                    return;
                }
                machine.pending = None;
            }
            shared.connect();
        }));
    }

    fn shutdown(&self) {
        {
            let mut machine = lock(&self.machine);
            machine.generation += 1;
            machine.cancel_pending();
            machine.reconnecting = false;
            machine.attempt = 0;
            machine.state = LinkState::Stopped;
        }
        self.sensor.stop();
    }

    fn generation(&self) -> u64 {
        lock(&self.machine).generation
    }

    fn schedule_attempt(
        self: &Arc<Self>,
        generation: u64,
        attempt: u32,
        delay: Duration,
    ) -> JoinHandle<()> {
        let shared = Arc::clone(self);
        self.handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            {
                let mut machine = lock(&shared.machine);
                if machine.generation != generation {
                    return;
                }
                machine.attempt = attempt;
                machine.state = LinkState::Connecting { attempt };
            }

            let opening = Arc::clone(&shared);
            let result = tokio::task::spawn_blocking(move || {
                if opening.generation() != generation {
                    return Err(DriverError::NotReady("attempt cancelled".into()));
                }
                // never start a new worker while an old one holds the device
                opening.sensor.stop();
                let started = opening.sensor.start();
                if started.is_ok() && opening.generation() != generation {
                    debug!("attempt {attempt} was cancelled while opening, releasing device");
                    opening.sensor.stop();
                }
                started
            })
            .await
            .unwrap_or_else(|e| Err(DriverError::NotReady(format!("connect task failed: {e}"))));

            shared.finish_attempt(generation, attempt, result);
        })
    }

    fn finish_attempt(self: &Arc<Self>, generation: u64, attempt: u32, result: Result<()>) {
        let mut machine = lock(&self.machine);
        if machine.generation != generation {
            debug!("discarding result of cancelled attempt {attempt}");
            return;
        }

        let max = self.config.max_attempts;
        match result {
            Ok(()) => {
                info!("sensor connected: attempt={attempt}");
                machine.state = LinkState::Active;
                machine.reconnecting = false;
                machine.attempt = 0;
                machine.pending = None;
            }
            Err(e) if e.is_transient() && attempt < max => {
                let delay = self.config.retry_delay();
                warn!(
                    "device busy, retrying in {:?}: attempt={}/{}, error={}",
                    delay, attempt, max, e
                );
                machine.state = LinkState::Backoff { attempt, delay };
                machine.pending = Some(self.schedule_attempt(generation, attempt + 1, delay));
            }
            Err(e) => {
                warn!("sensor connect failed: attempt={}/{}, error={}", attempt, max, e);
                machine.state = LinkState::Error(e.to_string());
                machine.reconnecting = false;
                machine.attempt = 0;
                machine.pending = None;
            }
        }
    }

    /// Restart the sensor if its worker died while the link was up.
    fn watchdog_tick(self: &Arc<Self>) {
        if !self.config.auto_reconnect {
            return;
        }

        let mut machine = lock(&self.machine);
        if machine.reconnecting || machine.state != LinkState::Active {
            return;
        }
        let sensor_down = !self.sensor.is_running() || self.sensor.snapshot().status.is_error();
        if !sensor_down {
            return;
        }

        let now = Instant::now();
        if let Some(last) = machine.last_auto_reconnect {
            if now.duration_since(last) < self.config.reconnect_cooldown() {
                return;
            }
        }
        machine.last_auto_reconnect = Some(now);

        warn!("sensor dropout detected, reconnecting");
        self.begin_attempts(&mut machine);
    }
}
