//! Port abstraction for serial communication.
//!
//! The protocol layer only talks to a [`Port`]; opening, re-opening at a new
//! baud rate and closing the underlying device is left to the implementation.
//!
//! ```text
//! +------------------+
//! |  Session / Flasher |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! |   Port Trait     |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! | Native SerialPort|
//! |   (serialport)   |
//! +------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use frflash::port::Port;
//! use frflash::protocol::ByteLink;
//!
//! fn ping<P: Port>(port: &mut P) -> frflash::Result<bool> {
//!     port.send_byte(b'V')?;
//!     Ok(port.recv_byte()? == b'F')
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod mock;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Serial port configuration.
///
/// Ports are always opened 8N1 without flow control; the boot ROMs of both
/// supported families expect exactly that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read timeout. `None` blocks until data arrives.
    pub timeout: Option<Duration>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 9600,
            timeout: Some(Duration::from_millis(100)),
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Unified port trait for serial communication.
pub trait Port: Read + Write + Send {
    /// Set the read timeout. `None` blocks indefinitely.
    fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Option<Duration>;

    /// Set the baud rate on the open port.
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Close and open the port again at `baud_rate`.
    ///
    /// Any buffered input is discarded; the link must be treated as freshly
    /// established afterwards.
    fn reopen(&mut self, baud_rate: u32, timeout: Option<Duration>) -> Result<()>;

    /// Clear input/output buffers.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;
}

#[cfg(feature = "native")]
pub use native::NativePort;
