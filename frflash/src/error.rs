//! Error types for frflash.

use crate::session::LinkState;
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for frflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Step of a flashing session, used to name where a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Waiting for the ROM to answer the handshake.
    Handshake,
    /// Baud-rate escalation.
    BaudSet,
    /// Second-stage loader upload.
    Upload,
    /// Chip erase.
    Erase,
    /// Key unlock on locked parts.
    Unlock,
    /// Page programming.
    Program,
    /// Final status read and read-back.
    Verify,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Handshake => "handshake",
            Self::BaudSet => "baud-set",
            Self::Upload => "upload",
            Self::Erase => "erase",
            Self::Unlock => "unlock",
            Self::Program => "program",
            Self::Verify => "verify",
        };
        f.write_str(name)
    }
}

/// Error type for frflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Firmware image could not be read.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// No byte arrived before the transport timeout elapsed.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The device answered with an unexpected acknowledgment byte.
    ///
    /// The link can no longer be trusted to be aligned on command framing.
    #[error("Protocol desync in {command}: expected {expected:#04x}, got {actual:#04x}")]
    Desync {
        /// Command being executed.
        command: &'static str,
        /// Acknowledgment byte the protocol requires.
        expected: u8,
        /// Byte actually received.
        actual: u8,
    },

    /// Status registers reported an impossible key-bit combination.
    #[error("Invalid device status: SRD1={srd1:#04x} SRD2={srd2:#04x} (key bits 01)")]
    InvalidStatus {
        /// First status byte.
        srd1: u8,
        /// Second status byte.
        srd2: u8,
    },

    /// Every key candidate was rejected by the device.
    #[error(
        "No valid key found after {attempts} attempts; power-cycle the board or provide the correct key"
    )]
    UnlockExhausted {
        /// Number of keys sent.
        attempts: usize,
    },

    /// Link state moved backwards or was re-entered.
    #[error("Invalid link state transition: {from:?} -> {to:?}")]
    LinkState {
        /// Current state.
        from: LinkState,
        /// Requested state.
        to: LinkState,
    },

    /// The device reported a failed erase or program operation.
    #[error("Device error: {0}")]
    Device(String),

    /// Unsupported chip or operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The embedding application requested cancellation.
    #[error("Operation interrupted")]
    Interrupted,

    /// A session step failed.
    #[error("{stage} failed: {source}")]
    Stage {
        /// Step that failed.
        stage: Stage,
        /// Underlying error.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Whether this error is (or wraps) a transport timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Stage { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// The session step this error was raised in, if known.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Attach the failing session step to an error.
pub trait StageExt<T> {
    /// Wrap the error (if any) with `stage`.
    fn during(self, stage: Stage) -> Result<T>;
}

impl<T> StageExt<T> for Result<T> {
    fn during(self, stage: Stage) -> Result<T> {
        self.map_err(|e| match e {
            // Keep the innermost step.
            Error::Stage { .. } => e,
            other => Error::Stage {
                stage,
                source: Box::new(other),
            },
        })
    }
}
