//! Recorded page streams.
//!
//! A recording is a text file with one page per line in the same hex form as
//! `DataSnapshot::raw_packet_hex`. Blank lines and lines starting with `#`
//! are ignored.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::errors::{DriverError, Result};
use crate::transport::{Connector, Transport};

/// Strap broadcast period (8070/32768 s).
pub const DEFAULT_INTERVAL: Duration = Duration::from_micros(246_277);

/// Longest uninterrupted sleep, so a stop request is seen quickly.
const STOP_POLL: Duration = Duration::from_millis(20);

/// Parse a recording.
pub fn parse_recording(text: &str) -> Result<Vec<Vec<u8>>> {
    text.lines()
        .enumerate()
        .map(|(n, line)| (n + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(n, line)| {
            hex::decode(line).map_err(|e| DriverError::Protocol(format!("recording line {n}: {e}")))
        })
        .collect()
}

/// Plays a recording as if it came from a strap.
pub struct ReplayTransport {
    pages: Arc<Vec<Vec<u8>>>,
    interval: Duration,
    looping: bool,
}

impl ReplayTransport {
    pub fn new(pages: Vec<Vec<u8>>, interval: Duration) -> Self {
        Self {
            pages: Arc::new(pages),
            interval,
            looping: false,
        }
    }

    /// Start over from the first page instead of ending the session.
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }
}

impl Transport for ReplayTransport {
    fn open(&mut self) -> Result<()> {
        if self.pages.is_empty() {
            return Err(DriverError::NotReady("recording has no pages".into()));
        }
        debug!("replaying {} pages every {:?}", self.pages.len(), self.interval);
        Ok(())
    }

    fn run(&mut self, stop: &AtomicBool, on_page: &mut dyn FnMut(&[u8])) -> Result<()> {
        loop {
            for page in self.pages.iter() {
                if stop.load(Ordering::Acquire) {
                    return Ok(());
                }
                on_page(page);
                if !pause(self.interval, stop) {
                    return Ok(());
                }
            }
            if !self.looping {
                info!("recording finished");
                return Ok(());
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Sleep for `total` unless stopped first. Returns false on stop.
fn pause(total: Duration, stop: &AtomicBool) -> bool {
    let mut left = total;
    while !left.is_zero() {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let step = left.min(STOP_POLL);
        std::thread::sleep(step);
        left -= step;
    }
    !stop.load(Ordering::Acquire)
}

/// Hands out a fresh [`ReplayTransport`] over the same recording.
#[derive(Debug, Clone)]
pub struct ReplayConnector {
    pages: Arc<Vec<Vec<u8>>>,
    interval: Duration,
    looping: bool,
}

impl ReplayConnector {
    pub fn new(pages: Vec<Vec<u8>>, interval: Duration, looping: bool) -> Self {
        Self {
            pages: Arc::new(pages),
            interval,
            looping,
        }
    }

    pub fn load(path: impl AsRef<Path>, interval: Duration, looping: bool) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(Self::new(parse_recording(&text)?, interval, looping))
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

impl Connector for ReplayConnector {
    fn connect(&self) -> Result<Box<dyn Transport>> {
        Ok(Box::new(ReplayTransport {
            pages: Arc::clone(&self.pages),
            interval: self.interval,
            looping: self.looping,
        }))
    }
}
