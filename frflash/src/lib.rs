//! # frflash
//!
//! A library for flashing FR and R32C microcontrollers over their serial
//! boot ROMs.
//!
//! This crate provides:
//!
//! - S-record firmware image parsing (`S2`/`S3` data records)
//! - page-aligned write buffering
//! - the FR boot ROM and second-stage loader command sets
//! - the R32C serial-programming command set, including the ID key search
//!   for locked parts
//!
//! ## Supported Chips
//!
//! - FR series (boot ROM at 9600/38400 baud, loader at 115200)
//! - R32C series
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via the `serialport` crate
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use frflash::{ChipConfig, ChipFamily, Image};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let loader = Image::from_file("pkernel/pkernel.mhx")?;
//!     let image = Image::from_file("firmware.mhx")?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let chip = ChipFamily::Fr;
//!         let mut flasher =
//!             chip.create_flasher("/dev/ttyUSB0", ChipConfig::new(chip), Some(loader))?;
//!         flasher.connect()?;
//!
//!         let report = flasher.flash_image(&image, &mut |done, total| {
//!             println!("{done}/{total} pages");
//!         })?;
//!         println!("took {:?}", report.elapsed);
//!
//!         // Start the new firmware
//!         flasher.reset()?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod error;
pub mod image;
pub mod port;
pub mod protocol;
pub mod session;
pub mod target;
pub mod unlock;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). Loops only stop
/// between commands, never in the middle of one.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    error::{Error, Result, Stage},
    image::{FlashRecord, Image, Page, PageBuffer, ParseWarning, paginate},
    port::{Port, SerialConfig},
    protocol::ByteLink,
    session::{LinkState, Session},
    target::{ChipConfig, ChipFamily, FlashReport, Flasher},
    unlock::{KeyState, KeyUnlocker, UnlockKey, UnlockOutcome},
};
