//! ANT USB stick on a serial port.
//!
//! The stick speaks the ANT serial protocol: every message is framed as
//! `[0xA4, len, id, data..., checksum]` where the checksum is the XOR of all
//! preceding bytes. Opening configures channel 0 as a wildcard receive
//! channel on the public ANT+ network with the heart-rate profile parameters.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::SerialConfig;
use crate::errors::{DriverError, Result};
use crate::transport::{Connector, Transport};

// ============================================================================
// Constants
// ============================================================================

const SYNC: u8 = 0xA4;
/// Longest payload we accept before treating the length byte as noise.
const MAX_PAYLOAD: usize = 32;

const MSG_CHANNEL_EVENT: u8 = 0x40;
const MSG_ASSIGN_CHANNEL: u8 = 0x42;
const MSG_CHANNEL_PERIOD: u8 = 0x43;
const MSG_RF_FREQUENCY: u8 = 0x45;
const MSG_NETWORK_KEY: u8 = 0x46;
const MSG_SYSTEM_RESET: u8 = 0x4A;
const MSG_OPEN_CHANNEL: u8 = 0x4B;
const MSG_CLOSE_CHANNEL: u8 = 0x4C;
const MSG_BROADCAST_DATA: u8 = 0x4E;
const MSG_ACKNOWLEDGED_DATA: u8 = 0x4F;
const MSG_BURST_DATA: u8 = 0x50;
const MSG_CHANNEL_ID: u8 = 0x51;
const MSG_STARTUP: u8 = 0x6F;

const RESPONSE_NO_ERROR: u8 = 0x00;
const EVENT_CHANNEL_CLOSED: u8 = 0x07;

const CHANNEL: u8 = 0;
const NETWORK: u8 = 0;
/// Bidirectional receive (slave) channel.
const CHANNEL_TYPE_RECEIVE: u8 = 0x00;
const DEVICE_TYPE_HRM: u8 = 120;
const RF_FREQUENCY: u8 = 57;
const CHANNEL_PERIOD: u16 = 8070;
const ANT_PLUS_NETWORK_KEY: [u8; 8] = [0xB9, 0xA5, 0x21, 0xFB, 0xBD, 0x72, 0xC3, 0x45];

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);
/// Not every stick announces itself after a reset.
const RESET_DELAY: Duration = Duration::from_millis(500);

// ============================================================================
// Framing
// ============================================================================

/// One deframed ANT message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AntMessage {
    pub id: u8,
    pub data: Vec<u8>,
}

impl AntMessage {
    /// The 8-byte page of a data message, if this is one.
    pub fn page(&self) -> Option<&[u8]> {
        match self.id {
            MSG_BROADCAST_DATA | MSG_ACKNOWLEDGED_DATA | MSG_BURST_DATA => {
                // byte 0 is the channel (burst: sequence + channel)
                self.data.get(1..9)
            }
            _ => None,
        }
    }
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Frame `data` as message `id`.
pub fn encode_message(id: u8, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(data.len() + 4);
    frame.push(SYNC);
    frame.push(data.len() as u8);
    frame.push(id);
    frame.extend_from_slice(data);
    frame.push(checksum(&frame));
    frame
}

/// Reassembles messages from an arbitrary split of the byte stream.
#[derive(Debug, Default)]
pub struct Deframer {
    buf: Vec<u8>,
    bad_checksums: u64,
}

impl Deframer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn bad_checksums(&self) -> u64 {
        self.bad_checksums
    }

    pub fn next_message(&mut self) -> Option<AntMessage> {
        loop {
            match self.buf.iter().position(|&b| b == SYNC) {
                Some(0) => {}
                Some(start) => {
                    self.buf.drain(..start);
                }
                None => {
                    self.buf.clear();
                    return None;
                }
            }

            if self.buf.len() < 2 {
                return None;
            }
            let len = self.buf[1] as usize;
            if len > MAX_PAYLOAD {
                self.buf.remove(0);
                continue;
            }

            let total = len + 4;
            if self.buf.len() < total {
                return None;
            }

            if checksum(&self.buf[..total - 1]) != self.buf[total - 1] {
                self.bad_checksums += 1;
                debug!("bad ANT checksum, resyncing: frame={:02X?}", &self.buf[..total]);
                self.buf.remove(0);
                continue;
            }

            let message = AntMessage {
                id: self.buf[2],
                data: self.buf[3..total - 1].to_vec(),
            };
            self.buf.drain(..total);
            return Some(message);
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Byte stream to the stick.
pub trait Port: Read + Write + Send {}
impl<T: Read + Write + Send> Port for T {}

/// Receive-only ANT+ heart-rate channel.
pub struct SerialTransport {
    config: SerialConfig,
    port: Option<Box<dyn Port>>,
    deframer: Deframer,
}

impl SerialTransport {
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            port: None,
            deframer: Deframer::default(),
        }
    }

    /// Use an already opened stream instead of `config.path`.
    pub fn from_stream(stream: impl Port + 'static) -> Self {
        Self {
            config: SerialConfig::default(),
            port: Some(Box::new(stream)),
            deframer: Deframer::default(),
        }
    }

    /// Frames dropped for a bad checksum so far.
    pub fn bad_checksums(&self) -> u64 {
        self.deframer.bad_checksums()
    }

    fn open_port(&self) -> Result<Box<dyn Port>> {
        let path = self
            .config
            .path
            .as_deref()
            .ok_or_else(|| DriverError::Config("no serial port configured".into()))?;

        let port = serialport::new(path, self.config.baud_rate)
            .timeout(self.config.read_timeout())
            .open()
            .map_err(|e| {
                let err = DriverError::Serial(e);
                if err.is_transient() {
                    DriverError::Busy(format!("{path}: {err}"))
                } else {
                    err
                }
            })?;

        info!("opened ANT stick: path={}, baud={}", path, self.config.baud_rate);
        Ok(Box::new(port))
    }

    fn port(&mut self) -> Result<&mut Box<dyn Port>> {
        self.port
            .as_mut()
            .ok_or_else(|| DriverError::NotReady("serial port is not open".into()))
    }

    fn send(&mut self, id: u8, data: &[u8]) -> Result<()> {
        let frame = encode_message(id, data);
        let port = self.port()?;
        port.write_all(&frame)?;
        port.flush()?;
        Ok(())
    }

    /// Read whatever is available into the deframer. Timeouts are not errors.
    fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; 64];
        let read = self.port()?.read(&mut chunk);
        match read {
            Ok(n) => self.deframer.push(&chunk[..n]),
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn wait_for(
        &mut self,
        timeout: Duration,
        mut matches: impl FnMut(&AntMessage) -> bool,
    ) -> Result<Option<AntMessage>> {
        let deadline = Instant::now() + timeout;
        loop {
            while let Some(message) = self.deframer.next_message() {
                if matches(&message) {
                    return Ok(Some(message));
                }
                debug!("ignoring ANT message 0x{:02X} while configuring", message.id);
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            self.fill()?;
        }
    }

    /// Send a configuration message and require a RESPONSE_NO_ERROR for it.
    fn command(&mut self, id: u8, data: &[u8]) -> Result<()> {
        self.send(id, data)?;
        let response = self.wait_for(RESPONSE_TIMEOUT, |m| {
            m.id == MSG_CHANNEL_EVENT && m.data.len() >= 3 && m.data[1] == id
        })?;

        match response {
            Some(m) if m.data[2] == RESPONSE_NO_ERROR => Ok(()),
            Some(m) => Err(DriverError::Protocol(format!(
                "stick rejected message 0x{id:02X}: code=0x{:02X}",
                m.data[2]
            ))),
            None => Err(DriverError::Timeout(format!(
                "no response to message 0x{id:02X}"
            ))),
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.send(MSG_SYSTEM_RESET, &[0x00])?;
        if self.wait_for(RESET_DELAY, |m| m.id == MSG_STARTUP)?.is_none() {
            debug!("no startup message after reset");
        }
        self.deframer.clear();
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> Result<()> {
        if self.port.is_none() {
            self.port = Some(self.open_port()?);
        }

        self.reset()?;
        let mut key = vec![NETWORK];
        key.extend_from_slice(&ANT_PLUS_NETWORK_KEY);
        self.command(MSG_NETWORK_KEY, &key)?;
        self.command(MSG_ASSIGN_CHANNEL, &[CHANNEL, CHANNEL_TYPE_RECEIVE, NETWORK])?;
        // device number 0 and transmission type 0 match any strap
        self.command(MSG_CHANNEL_ID, &[CHANNEL, 0, 0, DEVICE_TYPE_HRM, 0])?;
        self.command(MSG_RF_FREQUENCY, &[CHANNEL, RF_FREQUENCY])?;
        let [lo, hi] = CHANNEL_PERIOD.to_le_bytes();
        self.command(MSG_CHANNEL_PERIOD, &[CHANNEL, lo, hi])?;
        self.command(MSG_OPEN_CHANNEL, &[CHANNEL])?;

        info!("ANT+ HRM channel open: freq={RF_FREQUENCY}, period={CHANNEL_PERIOD}");
        Ok(())
    }

    fn run(&mut self, stop: &AtomicBool, on_page: &mut dyn FnMut(&[u8])) -> Result<()> {
        while !stop.load(Ordering::Acquire) {
            self.fill()?;
            while let Some(message) = self.deframer.next_message() {
                if let Some(page) = message.page() {
                    on_page(page);
                    continue;
                }
                if message.id == MSG_CHANNEL_EVENT
                    && message.data.get(1) == Some(&0x01)
                    && message.data.get(2) == Some(&EVENT_CHANNEL_CLOSED)
                {
                    return Err(DriverError::Protocol("channel closed by the stick".into()));
                }
                debug!("unhandled ANT message: id=0x{:02X}, data={:02X?}", message.id, message.data);
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.port.is_none() {
            return Ok(());
        }

        let closed = self
            .command(MSG_CLOSE_CHANNEL, &[CHANNEL])
            .and_then(|()| self.send(MSG_SYSTEM_RESET, &[0x00]));
        self.port = None;
        self.deframer.clear();

        if let Err(e) = &closed {
            warn!("ANT stick did not close cleanly: {e}");
        } else {
            debug!("ANT channel closed");
        }
        closed
    }
}

/// Opens a fresh [`SerialTransport`] for every sensor start.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    config: SerialConfig,
}

impl SerialConnector {
    pub fn new(config: SerialConfig) -> Self {
        Self { config }
    }
}

impl Connector for SerialConnector {
    fn connect(&self) -> Result<Box<dyn Transport>> {
        Ok(Box::new(SerialTransport::new(self.config.clone())))
    }
}
