use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("device busy: {0}")]
    Busy(String),
    #[error("packet too short: {len} bytes")]
    ShortPacket { len: usize },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("device not ready: {0}")]
    NotReady(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to spawn sensor worker: {0}")]
    WorkerSpawn(String),
}

impl DriverError {
    /// Whether an acquisition failure looks like the handle is still held by
    /// someone else (previous worker, another process, the OS releasing USB).
    pub fn is_transient(&self) -> bool {
        match self {
            DriverError::Busy(_) => true,
            DriverError::Io(e) => io_is_busy(e),
            DriverError::Serial(e) => message_is_busy(&e.description),
            DriverError::NotReady(msg) => message_is_busy(msg),
            _ => false,
        }
    }
}

fn io_is_busy(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EBUSY) || message_is_busy(&e.to_string())
}

/// Busy signatures reported by libusb and serial drivers ("Resource busy", errno 16).
fn message_is_busy(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    msg.contains("busy") || msg.contains("in use") || msg.contains("errno 16")
}

pub type Result<T> = std::result::Result<T, DriverError>;
