//! Chip/target abstraction for the supported MCU families.
//!
//! Both families share the image model, page buffer and session handling;
//! they differ in how the boot ROM is entered and which command set writes
//! the flash.

use crate::error::{Error, Result};
use crate::image::{DEFAULT_PAGE_SIZE, Image};
use crate::port::Port;
use crate::session::LinkState;
use crate::unlock::{UnlockKey, UnlockOutcome};
use std::fmt;
use std::time::Duration;

/// Supported chip families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChipFamily {
    /// Fujitsu FR series: boot ROM plus uploaded second-stage loader.
    #[default]
    Fr,
    /// Renesas R32C series: ROM serial-programming mode with ID check.
    R32c,
}

impl ChipFamily {
    /// Baud rate the boot ROM listens on after reset.
    #[must_use]
    pub fn init_baud(&self) -> u32 {
        9600
    }

    /// Baud rate used for the boot ROM session.
    #[must_use]
    pub fn bootrom_baud(&self) -> u32 {
        match self {
            Self::Fr => 38_400,
            Self::R32c => 9600,
        }
    }

    /// Baud rate the flash-writing command set runs at.
    #[must_use]
    pub fn loader_baud(&self) -> u32 {
        match self {
            Self::Fr => 115_200,
            Self::R32c => self.bootrom_baud(),
        }
    }

    /// Whether the family gates flash access behind an ID key.
    pub fn has_key_lock(&self) -> bool {
        matches!(self, Self::R32c)
    }

    /// Whether flashing needs an uploaded second-stage loader.
    pub fn needs_loader(&self) -> bool {
        matches!(self, Self::Fr)
    }

    /// Get the chip family from a string name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "fr" | "fr60" | "mb91" => Some(Self::Fr),
            "r32c" | "r32c/100" | "m16c" => Some(Self::R32c),
            _ => None,
        }
    }
}

impl fmt::Display for ChipFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fr => write!(f, "FR"),
            Self::R32c => write!(f, "R32C"),
        }
    }
}

/// Chip configuration parameters.
#[derive(Debug, Clone)]
pub struct ChipConfig {
    /// Chip family.
    pub family: ChipFamily,
    /// Baud rate for the initial handshake.
    pub init_baud: u32,
    /// Baud rate for the boot ROM session.
    pub bootrom_baud: u32,
    /// Baud rate of the flash-writing command set.
    pub loader_baud: u32,
    /// Per-byte read timeout while talking to the boot ROM.
    pub io_timeout: Duration,
    /// Give up the handshake after this many polls; `None` waits forever.
    pub handshake_attempts: Option<usize>,
    /// Delay between a baud or CALL request and re-opening the port.
    pub settle_delay: Duration,
    /// Loader records above this address are not uploaded.
    pub upload_ceiling: u32,
    /// Entry point of the uploaded loader.
    pub loader_entry: u32,
    /// Flash page size.
    pub page_size: usize,
    /// Number of sync bytes sent after reset.
    pub sync_count: usize,
    /// Spacing of the sync bytes.
    pub sync_interval: Duration,
    /// Wait after the user released reset.
    pub reset_delay: Duration,
    /// Page read back once programming finished.
    pub diagnostic_page: u32,
    /// Key to try before the key search.
    pub key: Option<UnlockKey>,
    /// Read uploaded loader records back and compare.
    pub verify_upload: bool,
}

impl ChipConfig {
    /// Create a new chip configuration for the given family.
    pub fn new(family: ChipFamily) -> Self {
        Self {
            family,
            init_baud: family.init_baud(),
            bootrom_baud: family.bootrom_baud(),
            loader_baud: family.loader_baud(),
            io_timeout: Duration::from_millis(100),
            handshake_attempts: None,
            settle_delay: Duration::from_millis(100),
            upload_ceiling: 0x4_0000,
            loader_entry: 0x3_0000,
            page_size: DEFAULT_PAGE_SIZE,
            sync_count: 16,
            sync_interval: Duration::from_millis(21),
            reset_delay: Duration::from_millis(3),
            diagnostic_page: 0xFFFF_0000,
            key: None,
            verify_upload: false,
        }
    }

    /// Set the boot ROM session baud rate.
    #[must_use]
    pub fn with_baud(mut self, baud: u32) -> Self {
        self.bootrom_baud = baud;
        if self.family == ChipFamily::R32c {
            self.loader_baud = baud;
        }
        self
    }

    /// Provide a key to try first on locked parts.
    #[must_use]
    pub fn with_key(mut self, key: Option<UnlockKey>) -> Self {
        self.key = key;
        self
    }

    /// Enable read-back verification of the uploaded loader.
    #[must_use]
    pub fn with_verify_upload(mut self, verify: bool) -> Self {
        self.verify_upload = verify;
        self
    }

    /// Shrink every delay to zero. Used with simulated devices.
    #[must_use]
    pub fn without_delays(mut self) -> Self {
        self.settle_delay = Duration::ZERO;
        self.sync_interval = Duration::ZERO;
        self.reset_delay = Duration::ZERO;
        self
    }
}

impl Default for ChipConfig {
    fn default() -> Self {
        Self::new(ChipFamily::default())
    }
}

/// Summary of a completed flash run.
#[derive(Debug, Clone, Default)]
pub struct FlashReport {
    /// Pages sent to the device.
    pub pages_written: usize,
    /// All-erased pages that were skipped.
    pub pages_elided: usize,
    /// Payload bytes covered by the image records.
    pub image_bytes: usize,
    /// Time from the start of programming to completion.
    pub elapsed: Duration,
    /// Chip version string, if the family reports one.
    pub chip_version: Option<String>,
    /// Key search result on locked parts.
    pub unlock: Option<UnlockOutcome>,
    /// Contents of the diagnostic page read after programming.
    pub diagnostic: Option<Vec<u8>>,
}

/// Progress callback: `(pages done, pages total)`.
pub type Progress<'a> = &'a mut dyn FnMut(usize, usize);

/// Trait for flashing operations across all chip families.
pub trait Flasher {
    /// Bring the link up to the flash-writing command set.
    fn connect(&mut self) -> Result<()>;

    /// Erase the chip and program `image`.
    fn flash_image(&mut self, image: &Image, progress: Progress<'_>) -> Result<FlashReport>;

    /// Erase the entire flash.
    fn erase_all(&mut self) -> Result<()>;

    /// Start the programmed firmware, where the family supports it.
    fn reset(&mut self) -> Result<()>;

    /// How far the link has progressed.
    fn link_state(&self) -> LinkState;

    /// Close the flasher and release the port.
    ///
    /// Safe to call more than once.
    fn close(&mut self);
}

impl ChipFamily {
    /// Create a flasher by opening `port_name` at the initial baud rate.
    ///
    /// `loader` is the second-stage loader image; FR targets need one.
    #[cfg(feature = "native")]
    pub fn create_flasher(
        &self,
        port_name: &str,
        config: ChipConfig,
        loader: Option<Image>,
    ) -> Result<Box<dyn Flasher>> {
        use crate::port::{NativePort, SerialConfig};

        let serial = SerialConfig::new(port_name, config.init_baud)
            .with_timeout(Some(config.io_timeout));
        let port = NativePort::open(&serial)?;
        self.create_flasher_with_port(port, config, loader)
    }

    /// Create a flasher on an already opened port.
    pub fn create_flasher_with_port<P: Port + 'static>(
        &self,
        port: P,
        config: ChipConfig,
        loader: Option<Image>,
    ) -> Result<Box<dyn Flasher>> {
        if config.family != *self {
            return Err(Error::Config(format!(
                "configuration is for {}, not {self}",
                config.family
            )));
        }
        match self {
            Self::Fr => {
                let loader = loader.ok_or_else(|| {
                    Error::Config("FR targets need a second-stage loader image".into())
                })?;
                Ok(Box::new(super::fr::FrFlasher::new(port, config, loader)))
            },
            Self::R32c => Ok(Box::new(super::r32c::R32cFlasher::new(port, config))),
        }
    }
}
