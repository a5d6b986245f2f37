#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ant_hrm::{Connector, DriverError, Result, Transport};

/// What the next `connect()` + `open()` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Open {
    Ok,
    Busy,
    Fatal,
}

/// How the receive loop ends once the pages are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterPages {
    /// Keep the channel open until stopped.
    Hold,
    /// Return as if the stick went away quietly.
    End,
    /// Fail with an I/O error.
    Fail,
    /// Sleep this long without looking at the stop flag.
    IgnoreStop(Duration),
}

pub struct ScriptedConnector {
    outcomes: Mutex<VecDeque<Open>>,
    fallback: Open,
    pages: Vec<Vec<u8>>,
    after_pages: AfterPages,
    open_delay: Duration,
    failing_close: bool,
    connects: AtomicUsize,
    closes: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub fn new(fallback: Open) -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            fallback,
            pages: Vec::new(),
            after_pages: AfterPages::Hold,
            open_delay: Duration::ZERO,
            failing_close: false,
            connects: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Outcomes used before falling back.
    pub fn script(self, outcomes: impl IntoIterator<Item = Open>) -> Self {
        *self.outcomes.lock().unwrap() = outcomes.into_iter().collect();
        self
    }

    pub fn pages(mut self, pages: Vec<Vec<u8>>) -> Self {
        self.pages = pages;
        self
    }

    pub fn after_pages(mut self, after: AfterPages) -> Self {
        self.after_pages = after;
        self
    }

    /// Block in `open()` for this long before succeeding or failing.
    pub fn open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Make `close()` report an error after counting the close.
    pub fn failing_close(mut self) -> Self {
        self.failing_close = true;
        self
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self) -> Result<Box<dyn Transport>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        Ok(Box::new(ScriptedTransport {
            outcome,
            pages: self.pages.clone(),
            after_pages: self.after_pages,
            open_delay: self.open_delay,
            failing_close: self.failing_close,
            closes: Arc::clone(&self.closes),
        }))
    }
}

struct ScriptedTransport {
    outcome: Open,
    pages: Vec<Vec<u8>>,
    after_pages: AfterPages,
    open_delay: Duration,
    failing_close: bool,
    closes: Arc<AtomicUsize>,
}

impl Transport for ScriptedTransport {
    fn open(&mut self) -> Result<()> {
        if !self.open_delay.is_zero() {
            thread::sleep(self.open_delay);
        }
        match self.outcome {
            Open::Ok => Ok(()),
            Open::Busy => Err(DriverError::Io(io::Error::from_raw_os_error(libc::EBUSY))),
            Open::Fatal => Err(DriverError::Protocol("stick rejected channel".into())),
        }
    }

    fn run(&mut self, stop: &AtomicBool, on_page: &mut dyn FnMut(&[u8])) -> Result<()> {
        for page in &self.pages {
            if stop.load(Ordering::Acquire) {
                return Ok(());
            }
            on_page(page);
            thread::sleep(Duration::from_millis(2));
        }
        match self.after_pages {
            AfterPages::Hold => {
                while !stop.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(())
            }
            AfterPages::End => Ok(()),
            AfterPages::Fail => Err(DriverError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stick unplugged",
            ))),
            AfterPages::IgnoreStop(hang) => {
                thread::sleep(hang);
                Ok(())
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.failing_close {
            return Err(DriverError::Io(io::Error::new(
                io::ErrorKind::Other,
                "stick did not acknowledge channel close",
            )));
        }
        Ok(())
    }
}

/// Heart-rate page with the beat time given in seconds.
pub fn hr_page(beat_secs: f64, count: u8, bpm: u8) -> Vec<u8> {
    let ticks = ((beat_secs * 1024.0).round() as u32 % 65_536) as u16;
    let [lo, hi] = ticks.to_le_bytes();
    vec![0x04, 0, 0, 0, lo, hi, count, bpm]
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
