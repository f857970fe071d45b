//! Platform abstraction for the update engine.
//!
//! The engine is strictly event-driven: it never blocks on I/O itself.
//! Everything with a side effect — serial transport, the single timer,
//! device enumeration, reset lines, file access, process shutdown — sits
//! behind the [`Platform`] trait, so the engine runs unchanged against the
//! native serial implementation and against scripted test platforms.

#[cfg(feature = "native")]
pub mod native;

use crate::device::Device;
use crate::error::Result;

/// Side-effect interface consumed by the engine.
///
/// Implementations deliver events back to the engine in arrival order:
/// a fired timer becomes `Event::Timeout`, received bytes go through
/// `Engine::receive`, and a vanished or closed port is followed by
/// `Event::Disconnected`.
pub trait Platform {
    /// Open the serial transport on `path`.
    fn connect(&mut self, path: &str) -> Result<()>;

    /// Close the serial transport. A `Disconnected` event follows.
    fn disconnect(&mut self);

    /// Write raw bytes to the transport. Transport failures surface later
    /// as a disconnect, not as a return value.
    fn write(&mut self, data: &[u8]);

    /// Arm the single timer; replaces any pending timeout.
    fn set_timeout(&mut self, ms: u64);

    /// Disarm the timer.
    fn clear_timeout(&mut self);

    /// Synchronous delay.
    fn msleep(&mut self, ms: u64);

    /// Monotonic clock in milliseconds.
    fn time_ms(&self) -> u64;

    /// Enumerate attached candidate devices.
    fn list_devices(&mut self) -> Vec<Device>;

    /// Pulse the FTDI bitbang reset line (ConBee).
    fn reset_ftdi(&mut self) -> Result<()>;

    /// Pulse the GPIO reset line (RaspBee).
    fn reset_raspbee(&mut self) -> Result<()>;

    /// Read a firmware file.
    fn read_file(&mut self, path: &str) -> Result<Vec<u8>>;

    /// Terminate the event loop with an exit code.
    fn shut_down(&mut self, code: i32);
}

#[cfg(feature = "native")]
pub use native::{NativePlatform, run};
