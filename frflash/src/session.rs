//! Session context shared by the flashers.
//!
//! A [`Session`] owns the transport for its whole lifetime and tracks how far
//! the link has progressed. The state only moves forward, until
//! [`Session::restart`] records that the target itself was reset.

use crate::error::{Error, Result};
use crate::port::Port;
use crate::unlock::UnlockKey;
use log::debug;
use std::fmt;
use std::thread;
use std::time::Duration;

/// How far the link to the device has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LinkState {
    /// Port open, nothing heard from the device yet.
    #[default]
    Uninitialized,
    /// The ROM bootloader answered the handshake.
    BootromActive,
    /// The uploaded second-stage loader has been started.
    SecondStageActive,
    /// The loader command set is reachable at its operating baud rate.
    LoaderActive,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::BootromActive => "bootrom active",
            Self::SecondStageActive => "second stage active",
            Self::LoaderActive => "loader active",
        };
        f.write_str(name)
    }
}

/// Exclusive owner of the transport plus per-session state.
pub struct Session<P: Port> {
    port: P,
    state: LinkState,
    key: Option<UnlockKey>,
}

impl<P: Port> Session<P> {
    /// Start a session on an opened port.
    pub fn new(port: P) -> Self {
        Self {
            port,
            state: LinkState::Uninitialized,
            key: None,
        }
    }

    /// Current link state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Move the link forward to `next`.
    pub fn advance(&mut self, next: LinkState) -> Result<()> {
        if next <= self.state {
            return Err(Error::LinkState {
                from: self.state,
                to: next,
            });
        }
        debug!("Link state: {} -> {next}", self.state);
        self.state = next;
        Ok(())
    }

    /// Return to `Uninitialized` after the target was reset.
    ///
    /// The key cache survives, so an embedder that keeps the session across
    /// board resets can unlock again without a key search.
    pub fn restart(&mut self) {
        debug!(
            "Link state: {} -> {} (target reset)",
            self.state,
            LinkState::Uninitialized
        );
        self.state = LinkState::Uninitialized;
    }

    /// Wait `settle`, then re-open the port at `baud_rate`.
    pub fn reopen(
        &mut self,
        baud_rate: u32,
        timeout: Option<Duration>,
        settle: Duration,
    ) -> Result<()> {
        if !settle.is_zero() {
            thread::sleep(settle);
        }
        self.port.reopen(baud_rate, timeout)
    }

    /// Key that unlocked the device earlier in this session.
    pub fn cached_key(&self) -> Option<UnlockKey> {
        self.key
    }

    /// Remember the key that unlocked the device.
    pub fn cache_key(&mut self, key: UnlockKey) {
        self.key = Some(key);
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get a mutable reference to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// End the session and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Close the transport.
    pub fn close(&mut self) -> Result<()> {
        self.port.close()
    }
}
