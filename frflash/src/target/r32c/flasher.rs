//! R32C flasher implementation.

use crate::error::{Error, Result, Stage, StageExt};
use crate::image::{Image, paginate};
use crate::port::Port;
use crate::protocol::ByteLink;
use crate::session::{LinkState, Session};
use crate::target::chip::{ChipConfig, FlashReport, Flasher, Progress};
use crate::target::r32c::protocol::{PAGE_SIZE, SYNC_BYTE, SerialProgrammer};
use crate::unlock::{KeyUnlocker, UnlockOutcome};
use log::{debug, info, trace, warn};
use std::thread;
use std::time::{Duration, Instant};

/// How long a full erase may keep the ROM busy.
const ERASE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a page program may keep the ROM busy.
const PROGRAM_TIMEOUT: Duration = Duration::from_secs(1);

/// R32C flasher.
pub struct R32cFlasher<P: Port> {
    session: Session<P>,
    config: ChipConfig,
    version: Option<String>,
    unlock: Option<UnlockOutcome>,
}

impl<P: Port> R32cFlasher<P> {
    /// Create a flasher on a port opened at the initial baud rate.
    pub fn new(port: P, config: ChipConfig) -> Self {
        Self {
            session: Session::new(port),
            config,
            version: None,
            unlock: None,
        }
    }

    /// The session this flasher drives.
    pub fn session(&self) -> &Session<P> {
        &self.session
    }

    /// Chip version read during connect.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Result of the key search.
    pub fn unlock_outcome(&self) -> Option<UnlockOutcome> {
        self.unlock
    }

    /// Synchronize with the ROM, set the baud rate and unlock the flash.
    ///
    /// The board must have been reset into serial-programming mode right
    /// before this is called.
    pub fn connect(&mut self) -> Result<()> {
        self.sync().during(Stage::Handshake)?;
        self.set_baud().during(Stage::BaudSet)?;
        self.read_version().during(Stage::Handshake)?;
        self.unlock().during(Stage::Unlock)?;
        self.session.advance(LinkState::LoaderActive)
    }

    /// Connect again after the board was reset back into serial mode.
    ///
    /// The key that unlocked the device earlier in this session is tried
    /// before any other.
    pub fn reconnect(&mut self) -> Result<()> {
        self.session.restart();
        let init_baud = self.config.init_baud;
        if self.session.port().baud_rate() != init_baud {
            self.session
                .reopen(init_baud, Some(self.config.io_timeout), Duration::ZERO)?;
        }
        self.connect()
    }

    fn sync(&mut self) -> Result<()> {
        let count = self.config.sync_count;
        let interval = self.config.sync_interval;
        thread::sleep(self.config.reset_delay);

        debug!("Sending {count} sync bytes");
        let port = self.session.port_mut();
        for _ in 0..count {
            if crate::is_interrupted_requested() {
                return Err(Error::Interrupted);
            }
            port.send_bytes(&[SYNC_BYTE])?;
            if !interval.is_zero() {
                thread::sleep(interval);
            }
        }
        self.session.advance(LinkState::BootromActive)
    }

    fn set_baud(&mut self) -> Result<()> {
        let baud = self.config.bootrom_baud;
        info!("Setting baud rate to {baud}");

        let port = self.session.port_mut();
        let first = SerialProgrammer::new(port).set_baud(baud);
        match first {
            Err(e) if e.is_timeout() => {
                warn!("Baud rate request timed out, trying again");
                port.clear_buffers()?;
                SerialProgrammer::new(port).set_baud(baud)?;
            },
            other => other?,
        }

        if self.session.port().baud_rate() != baud {
            self.session.reopen(
                baud,
                Some(self.config.io_timeout),
                self.config.settle_delay,
            )?;
        }
        Ok(())
    }

    fn read_version(&mut self) -> Result<()> {
        let version = SerialProgrammer::new(self.session.port_mut()).version()?;
        info!("Chip version: {version}");
        self.version = Some(version);
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        let mut unlocker = KeyUnlocker::new()
            .with_cached(self.session.cached_key())
            .with_supplied(self.config.key);
        let outcome = unlocker.run(&mut SerialProgrammer::new(self.session.port_mut()))?;
        if let Some(key) = outcome.key {
            self.session.cache_key(key);
        }
        self.unlock = Some(outcome);
        Ok(())
    }

    fn ensure_unlocked(&self) -> Result<()> {
        if self.session.state() == LinkState::LoaderActive {
            Ok(())
        } else {
            Err(Error::Device(format!(
                "device is not unlocked (link {}), connect first",
                self.session.state()
            )))
        }
    }

    /// Erase the chip and program every page of `image`.
    pub fn flash_image<F>(&mut self, image: &Image, mut progress: F) -> Result<FlashReport>
    where
        F: FnMut(usize, usize),
    {
        self.ensure_unlocked()?;
        let page_size = self.config.page_size;
        if page_size != PAGE_SIZE {
            return Err(Error::Config(format!(
                "R32C pages are {PAGE_SIZE} bytes, not {page_size}"
            )));
        }
        let start = Instant::now();

        self.erase_all()?;

        let paginated = paginate(image.records(), page_size).during(Stage::Program)?;
        let total = paginated.pages.len();
        info!(
            "Flashing {total} pages ({} bytes of image data)",
            image.total_bytes()
        );

        progress(0, total);
        for (i, page) in paginated.pages.iter().enumerate() {
            if crate::is_interrupted_requested() {
                return Err(Error::Interrupted).during(Stage::Program);
            }
            self.program_page(page.base_address, &page.bytes)
                .during(Stage::Program)?;
            progress(i + 1, total);
        }

        let diagnostic = self.verify().during(Stage::Verify)?;
        let elapsed = start.elapsed();
        info!("Procedure complete, took {:.2} seconds", elapsed.as_secs_f64());

        Ok(FlashReport {
            pages_written: total,
            pages_elided: paginated.elided,
            image_bytes: image.total_bytes(),
            elapsed,
            chip_version: self.version.clone(),
            unlock: self.unlock,
            diagnostic: Some(diagnostic),
        })
    }

    fn program_page(&mut self, address: u32, data: &[u8]) -> Result<()> {
        trace!("Programming page 0x{address:08X}");
        let mut rom = SerialProgrammer::new(self.session.port_mut());
        rom.program_page(address, data)?;
        let status = rom.wait_ready(PROGRAM_TIMEOUT)?;
        if status.program_failed {
            rom.clear_status()?;
            return Err(Error::Device(format!(
                "programming page 0x{address:08X} failed"
            )));
        }
        Ok(())
    }

    fn verify(&mut self) -> Result<Vec<u8>> {
        let address = self.config.diagnostic_page;
        let mut rom = SerialProgrammer::new(self.session.port_mut());
        let status = rom.status()?;
        debug!("Final status: {status:?}");
        let page = rom.read_page(address)?;
        for (i, chunk) in page.chunks(16).enumerate() {
            debug!("{:08X}: {chunk:02X?}", address as usize + i * 16);
        }
        Ok(page)
    }

    /// Erase every unlocked block.
    pub fn erase_all(&mut self) -> Result<()> {
        self.ensure_unlocked().during(Stage::Erase)?;
        info!("Performing chip erase...");
        let mut rom = SerialProgrammer::new(self.session.port_mut());
        let result = rom
            .erase_all_unlocked()
            .and_then(|()| rom.wait_ready(ERASE_TIMEOUT))
            .and_then(|status| {
                if status.erase_failed {
                    Err(Error::Device("chip erase failed".into()))
                } else {
                    Ok(())
                }
            });
        result.during(Stage::Erase)
    }

    /// Consume the flasher and return the underlying port.
    pub fn into_port(self) -> P {
        self.session.into_port()
    }
}

impl<P: Port> Flasher for R32cFlasher<P> {
    fn connect(&mut self) -> Result<()> {
        self.connect()
    }

    fn flash_image(&mut self, image: &Image, progress: Progress<'_>) -> Result<FlashReport> {
        self.flash_image(image, |current, total| progress(current, total))
    }

    fn erase_all(&mut self) -> Result<()> {
        self.erase_all()
    }

    fn reset(&mut self) -> Result<()> {
        info!("Reset the board to start the programmed firmware");
        Ok(())
    }

    fn link_state(&self) -> LinkState {
        self.session.state()
    }

    fn close(&mut self) {
        if let Err(e) = self.session.close() {
            debug!("Error closing port: {e}");
        }
    }
}
