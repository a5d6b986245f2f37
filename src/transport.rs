//! Seam between the driver and whatever delivers ANT pages.

use std::sync::atomic::AtomicBool;

use crate::errors::Result;

/// A source of raw heart-rate pages.
///
/// A transport is opened once, runs one receive loop and is closed once. The
/// connection manager calls these from its worker thread only.
pub trait Transport: Send {
    /// Acquire the hardware handle and open the receive channel.
    fn open(&mut self) -> Result<()>;

    /// Deliver pages to `on_page` until `stop` is set or the link fails.
    ///
    /// Implementations must notice `stop` within one read timeout.
    fn run(&mut self, stop: &AtomicBool, on_page: &mut dyn FnMut(&[u8])) -> Result<()>;

    /// Close the channel and release the handle.
    fn close(&mut self) -> Result<()>;
}

/// Creates a fresh transport for every start of the connection manager.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Transport>>;
}

impl<F> Connector for F
where
    F: Fn() -> Result<Box<dyn Transport>> + Send + Sync,
{
    fn connect(&self) -> Result<Box<dyn Transport>> {
        self()
    }
}
