//! Byte-stream and time abstractions the drivers run against.
//!
//! The drivers never touch a serial port directly; they speak to a
//! [`ByteLink`] and pace themselves through a [`Clock`], so the same state
//! machines run against real hardware, the deterministic device simulators,
//! and scripted test links.

pub mod serial;
pub mod sim;

pub use serial::SerialLink;

use std::{
    io,
    time::{Duration, Instant},
};

/// Line rate shared by both controller families.
pub const BAUD_RATE: u32 = 19_200;

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        pub const DEFAULT_PORT: &str = "COM1";
    } else {
        pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("couldn't open serial port {port}: {source}")]
    Open {
        port: String,
        source: serialport::Error,
    },
    #[error("serial port configuration: {0}")]
    Config(#[from] serialport::Error),
    #[error("serial I/O: {0}")]
    Io(#[from] io::Error),
}

/// A half-duplex byte stream with bounded reads.
///
/// Reads return whatever arrived within the timeout, possibly nothing; an
/// `Err` always means a transport fault, never "no data yet".
pub trait ByteLink {
    fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError>;
    fn flush(&mut self) -> Result<(), LinkError>;

    /// Reads until `terminator` is seen (it is included in the result),
    /// `max_bytes` have been collected, or `timeout` elapses.
    fn read_until(
        &mut self,
        terminator: u8,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, LinkError>;

    /// Reads up to `max_bytes` bytes, returning early only when the timeout
    /// elapses.
    fn read_exact(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>, LinkError>;

    /// Number of bytes ready to read without blocking.
    fn input_available(&mut self) -> Result<usize, LinkError>;

    /// Discards all pending input.
    fn drain_input(&mut self) -> Result<(), LinkError>;
}

/// Monotonic time source and sleep, factored out so tests don't spend wall
/// time on the protocols' pacing delays.
pub trait Clock {
    fn now(&mut self) -> Instant;
    fn sleep(&mut self, duration: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&mut self) -> Instant {
        Instant::now()
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
