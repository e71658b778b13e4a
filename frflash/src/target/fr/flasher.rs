//! FR flasher implementation.
//!
//! The flash sequence:
//!
//! 1. poll the boot ROM with `'V'` at 9600 baud until it answers `'F'`
//!    (the user resets the board meanwhile);
//! 2. raise the boot ROM to 38400 baud, re-open the port;
//! 3. upload the second-stage loader below the upload ceiling and CALL it;
//! 4. re-open at 115200 and drive the loader: chip erase, one WRITE per page;
//! 5. send EXIT to start the new firmware.

use crate::error::{Error, Result, Stage, StageExt};
use crate::image::{Image, paginate};
use crate::port::Port;
use crate::protocol::ByteLink;
use crate::session::{LinkState, Session};
use crate::target::chip::{ChipConfig, FlashReport, Flasher, Progress};
use crate::target::fr::protocol::{BootRom, HANDSHAKE_READY, HANDSHAKE_REQUEST, Loader};
use log::{debug, info, trace, warn};
use std::time::Instant;

/// FR flasher.
///
/// Generic over the port type `P`, which must implement the `Port` trait.
pub struct FrFlasher<P: Port> {
    session: Session<P>,
    config: ChipConfig,
    loader: Image,
    last_checksum: Option<u16>,
}

impl<P: Port> FrFlasher<P> {
    /// Create a flasher on an opened port.
    ///
    /// `loader` is the second-stage loader image uploaded during
    /// [`connect`](Self::connect).
    pub fn new(port: P, config: ChipConfig, loader: Image) -> Self {
        Self {
            session: Session::new(port),
            config,
            loader,
            last_checksum: None,
        }
    }

    /// The session this flasher drives.
    pub fn session(&self) -> &Session<P> {
        &self.session
    }

    /// Checksum the boot ROM reported for the last uploaded loader record.
    pub fn last_checksum(&self) -> Option<u16> {
        self.last_checksum
    }

    /// Consume the flasher and return the underlying port.
    pub fn into_port(self) -> P {
        self.session.into_port()
    }

    /// Bring the loader up.
    pub fn connect(&mut self) -> Result<()> {
        self.handshake().during(Stage::Handshake)?;
        self.escalate_baud().during(Stage::BaudSet)?;
        self.upload_loader().during(Stage::Upload)?;
        self.start_loader().during(Stage::Upload)
    }

    fn handshake(&mut self) -> Result<()> {
        let max_attempts = self.config.handshake_attempts;
        let port = self.session.port_mut();
        info!("Waiting for the boot ROM on {}...", port.name());
        info!("Please press RESET on your board.");

        let mut attempts = 0usize;
        loop {
            if crate::is_interrupted_requested() {
                return Err(Error::Interrupted);
            }
            if max_attempts.is_some_and(|max| attempts >= max) {
                return Err(Error::Timeout(format!(
                    "boot ROM did not answer after {attempts} attempts"
                )));
            }
            attempts += 1;

            port.send_bytes(&[HANDSHAKE_REQUEST])?;
            match port.recv_byte() {
                Ok(HANDSHAKE_READY) => break,
                Ok(other) => trace!("Ignoring 0x{other:02X} while waiting for the boot ROM"),
                Err(e) if e.is_timeout() => {},
                Err(e) => return Err(e),
            }
        }

        info!("Boot ROM answered");
        debug!("Handshake took {attempts} attempts");
        self.session.advance(LinkState::BootromActive)
    }

    fn escalate_baud(&mut self) -> Result<()> {
        let baud = self.config.bootrom_baud;
        info!("Setting boot ROM baud rate to {baud}");

        let port = self.session.port_mut();
        let first = BootRom::new(port).set_baud_rate(baud);
        match first {
            Err(e) if e.is_timeout() => {
                warn!("Baud rate request timed out, trying again");
                port.clear_buffers()?;
                BootRom::new(port).set_baud_rate(baud)?;
            },
            other => other?,
        }

        self.session.reopen(
            baud,
            Some(self.config.io_timeout),
            self.config.settle_delay,
        )
    }

    fn upload_loader(&mut self) -> Result<()> {
        let ceiling = self.config.upload_ceiling;
        let total = self.loader.records().len();
        let uploadable = self.loader.records_below(ceiling).count();
        if uploadable == 0 {
            return Err(Error::InvalidImage(format!(
                "loader has no records at or below 0x{ceiling:08X}"
            )));
        }
        if uploadable < total {
            debug!(
                "Skipping {} loader records above 0x{ceiling:08X}",
                total - uploadable
            );
        }
        info!("Transferring loader to RAM ({uploadable} records)");

        let verify = self.config.verify_upload;
        let mut rom = BootRom::new(self.session.port_mut());
        for record in self.loader.records_below(ceiling) {
            rom.write(record.address(), record.data())?;
            if verify {
                let len = u16::try_from(record.len()).map_err(|_| {
                    Error::InvalidImage(format!(
                        "loader record at 0x{:08X} is too long",
                        record.address()
                    ))
                })?;
                let back = rom.read(record.address(), len)?;
                if back != record.data() {
                    return Err(Error::Device(format!(
                        "loader read-back mismatch at 0x{:08X}",
                        record.address()
                    )));
                }
            }
        }
        self.last_checksum = rom.last_checksum();
        if let Some(checksum) = self.last_checksum {
            debug!("Last boot ROM checksum: 0x{checksum:04X}");
        }
        Ok(())
    }

    fn start_loader(&mut self) -> Result<()> {
        let entry = self.config.loader_entry;
        info!("Starting loader at 0x{entry:08X}");
        BootRom::new(self.session.port_mut()).call(entry)?;
        self.session.advance(LinkState::SecondStageActive)?;

        // The loader runs with blocking reads: erases take seconds.
        self.session
            .reopen(self.config.loader_baud, None, self.config.settle_delay)?;
        self.session.advance(LinkState::LoaderActive)
    }

    fn ensure_loader(&self) -> Result<()> {
        if self.session.state() == LinkState::LoaderActive {
            Ok(())
        } else {
            Err(Error::Device(format!(
                "loader is not running (link {}), connect first",
                self.session.state()
            )))
        }
    }

    /// Erase the chip and program every page of `image`.
    pub fn flash_image<F>(&mut self, image: &Image, mut progress: F) -> Result<FlashReport>
    where
        F: FnMut(usize, usize),
    {
        self.ensure_loader()?;
        let start = Instant::now();

        self.erase_all()?;

        let paginated = paginate(image.records(), self.config.page_size).during(Stage::Program)?;
        let total = paginated.pages.len();
        info!(
            "Flashing {total} pages ({} bytes of image data)",
            image.total_bytes()
        );
        if paginated.elided > 0 {
            debug!("{} erased pages skipped", paginated.elided);
        }

        progress(0, total);
        for (i, page) in paginated.pages.iter().enumerate() {
            if crate::is_interrupted_requested() {
                return Err(Error::Interrupted).during(Stage::Program);
            }
            trace!("Writing page 0x{:08X}", page.base_address);
            Loader::new(self.session.port_mut())
                .write(page.base_address, &page.bytes)
                .during(Stage::Program)?;
            progress(i + 1, total);
        }

        let elapsed = start.elapsed();
        info!("Procedure complete, took {:.2} seconds", elapsed.as_secs_f64());
        Ok(FlashReport {
            pages_written: total,
            pages_elided: paginated.elided,
            image_bytes: image.total_bytes(),
            elapsed,
            ..FlashReport::default()
        })
    }

    /// Erase the entire flash.
    pub fn erase_all(&mut self) -> Result<()> {
        self.ensure_loader().during(Stage::Erase)?;
        info!("Performing chip erase...");
        Loader::new(self.session.port_mut())
            .chip_erase()
            .during(Stage::Erase)
    }

    /// Leave the loader; the target starts the programmed firmware.
    pub fn reset(&mut self) -> Result<()> {
        self.ensure_loader()?;
        Loader::new(self.session.port_mut()).exit()?;
        info!("Program was started");
        Ok(())
    }
}

impl<P: Port> Flasher for FrFlasher<P> {
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
        self.reset()
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::FlashRecord;
    use crate::port::mock::MockPort;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Byte-level model of an FR board: boot ROM first, loader after CALL.
    #[derive(Default)]
    struct FrDevice {
        pending: Vec<u8>,
        in_loader: bool,
        /// Handshake polls left unanswered before `'F'`.
        boot_after: usize,
        /// Swallow the next boot ROM opcode without an ack.
        mute_next_opcode: bool,
        /// Stop acking boot ROM opcodes once the handshake is done.
        mute_all_opcodes: bool,
        /// Flip the first byte of every READ reply.
        corrupt_reads: bool,
        bauds: Vec<u32>,
        ram: Vec<(u32, Vec<u8>)>,
        calls: Vec<u32>,
        chip_erases: usize,
        pages: Vec<(u32, Vec<u8>)>,
        exited: bool,
    }

    fn dword(bytes: &[u8]) -> u32 {
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn word(bytes: &[u8]) -> usize {
        usize::from(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    impl FrDevice {
        fn on_byte(&mut self, byte: u8, rx: &mut VecDeque<u8>) {
            self.pending.push(byte);
            if self.in_loader {
                self.loader_byte(rx);
            } else {
                self.rom_byte(rx);
            }
        }

        fn rom_byte(&mut self, rx: &mut VecDeque<u8>) {
            let p = self.pending.clone();
            match (p[0], p.len()) {
                (b'V', _) => {
                    if self.boot_after == 0 {
                        rx.push_back(b'F');
                    } else {
                        self.boot_after -= 1;
                    }
                    self.pending.clear();
                },
                (0x01, 1) => {
                    if self.mute_all_opcodes {
                        self.pending.clear();
                    } else if self.mute_next_opcode {
                        self.mute_next_opcode = false;
                        self.pending.clear();
                    } else {
                        rx.push_back(0xF1);
                    }
                },
                (0x01, 2) => {
                    rx.push_back(0x80 | p[1]);
                    if p[1] == 0x05 {
                        rx.extend([0x00, 0x00]);
                        self.pending.clear();
                    }
                },
                (0x01, n) => match p[1] {
                    0x02 if n == 8 => {
                        let addr = dword(&p[2..6]);
                        let size = word(&p[6..8]);
                        let mut data = self
                            .ram
                            .iter()
                            .rev()
                            .find(|(a, _)| *a == addr)
                            .map_or_else(|| vec![0; size], |(_, d)| d.clone());
                        if self.corrupt_reads {
                            data[0] ^= 0xFF;
                        }
                        rx.extend(&data[..size]);
                        rx.extend([0x5A, 0xA5]);
                        self.pending.clear();
                    },
                    0x03 if n >= 8 && n == 8 + word(&p[6..8]) => {
                        self.ram.push((dword(&p[2..6]), p[8..].to_vec()));
                        rx.extend([0x34, 0x12]);
                        self.pending.clear();
                    },
                    0x04 if n == 6 => {
                        self.calls.push(dword(&p[2..6]));
                        self.in_loader = true;
                        self.pending.clear();
                    },
                    0x06 if n == 6 => {
                        self.bauds.push(dword(&p[2..6]));
                        self.pending.clear();
                    },
                    _ => {},
                },
                _ => self.pending.clear(),
            }
        }

        fn loader_byte(&mut self, rx: &mut VecDeque<u8>) {
            let p = self.pending.clone();
            match (p[0], p.len()) {
                (0x15, _) => {
                    self.chip_erases += 1;
                    rx.extend([0x45, 0x23]);
                    self.pending.clear();
                },
                (0x12, 1) => rx.push_back(0x11),
                (0x12, 7) => {
                    rx.push_back(0x18);
                    self.pending.clear();
                },
                (0x13, 1) => rx.push_back(0x37),
                (0x13, n) if n >= 7 && n == 7 + word(&p[5..7]) => {
                    self.pages.push((dword(&p[1..5]), p[7..].to_vec()));
                    rx.push_back(0x28);
                    self.pending.clear();
                },
                (0x97, _) => {
                    self.exited = true;
                    self.pending.clear();
                },
                (0x12 | 0x13, _) => {},
                _ => self.pending.clear(),
            }
        }
    }

    fn setup(device: FrDevice) -> (Arc<Mutex<FrDevice>>, MockPort) {
        let device = Arc::new(Mutex::new(device));
        let sim = Arc::clone(&device);
        let port = MockPort::with_responder(move |byte, rx| {
            sim.lock().unwrap().on_byte(byte, rx);
        });
        (device, port)
    }

    fn config() -> ChipConfig {
        let mut config = ChipConfig::new(crate::target::ChipFamily::Fr).without_delays();
        config.handshake_attempts = Some(20);
        config
    }

    fn loader() -> Image {
        [
            FlashRecord::new(0x0003_0000, vec![0x9F, 0x80, 0x00, 0x00]).unwrap(),
            FlashRecord::new(0x0003_0004, vec![0x97, 0x20]).unwrap(),
            FlashRecord::new(0x0008_0000, vec![0xFF; 4]).unwrap(),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_full_sequence() {
        let (device, port) = setup(FrDevice {
            boot_after: 3,
            ..FrDevice::default()
        });
        let mut flasher = FrFlasher::new(port, config(), loader());

        flasher.connect().unwrap();
        assert_eq!(flasher.session().state(), LinkState::LoaderActive);
        assert_eq!(flasher.session().port().reopened, [38_400, 115_200]);
        assert_eq!(flasher.session().port().timeout(), None);
        assert_eq!(flasher.last_checksum(), Some(0x1234));

        let image: Image = [
            FlashRecord::new(0x0010_0000, vec![1, 2, 3]).unwrap(),
            FlashRecord::new(0x0010_0200, vec![0xFF; 256]).unwrap(),
            FlashRecord::new(0x0010_0300, vec![4]).unwrap(),
        ]
        .into_iter()
        .collect();

        let mut seen = Vec::new();
        let report = flasher
            .flash_image(&image, |current, total| seen.push((current, total)))
            .unwrap();
        assert_eq!(report.pages_written, 2);
        assert_eq!(report.pages_elided, 1);
        assert_eq!(seen, [(0, 2), (1, 2), (2, 2)]);

        flasher.reset().unwrap();

        let device = device.lock().unwrap();
        assert_eq!(device.bauds, [38_400]);
        // the record above the ceiling stays behind
        let uploaded: Vec<u32> = device.ram.iter().map(|(a, _)| *a).collect();
        assert_eq!(uploaded, [0x0003_0000, 0x0003_0004]);
        assert_eq!(device.calls, [0x0003_0000]);
        assert_eq!(device.chip_erases, 1);
        let bases: Vec<u32> = device.pages.iter().map(|(a, _)| *a).collect();
        assert_eq!(bases, [0x0010_0000, 0x0010_0300]);
        assert!(device.pages.iter().all(|(_, d)| d.len() == 256));
        assert_eq!(&device.pages[0].1[..4], &[1, 2, 3, 0]);
        assert!(device.exited);
        drop(device);

        flasher.close();
        assert!(flasher.session().port().closed);
    }

    #[test]
    fn test_baud_request_retried_once_after_timeout() {
        let (device, port) = setup(FrDevice {
            mute_next_opcode: true,
            ..FrDevice::default()
        });
        let mut flasher = FrFlasher::new(port, config(), loader());
        flasher.connect().unwrap();
        assert_eq!(device.lock().unwrap().bauds, [38_400]);
    }

    #[test]
    fn test_baud_request_fails_after_second_timeout() {
        let (device, port) = setup(FrDevice {
            mute_all_opcodes: true,
            ..FrDevice::default()
        });
        let mut flasher = FrFlasher::new(port, config(), loader());
        let err = flasher.connect().unwrap_err();
        assert_eq!(err.stage(), Some(Stage::BaudSet));
        assert!(err.is_timeout());

        let opcodes = flasher
            .session()
            .port()
            .written
            .iter()
            .filter(|&&b| b == 0x01)
            .count();
        assert_eq!(opcodes, 2);
        assert!(device.lock().unwrap().bauds.is_empty());
        assert!(flasher.session().port().reopened.is_empty());
        assert_eq!(flasher.session().state(), LinkState::BootromActive);
    }

    #[test]
    fn test_handshake_gives_up_when_bounded() {
        let (_device, port) = setup(FrDevice {
            boot_after: usize::MAX,
            ..FrDevice::default()
        });
        let mut flasher = FrFlasher::new(port, config(), loader());
        let err = flasher.connect().unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Handshake));
        assert!(err.is_timeout());
        assert_eq!(flasher.session().state(), LinkState::Uninitialized);
    }

    #[test]
    fn test_desync_names_the_upload_step() {
        // a device that acks the opcode with garbage
        let port = MockPort::with_responder(|byte, rx| match byte {
            b'V' => rx.push_back(b'F'),
            0x01 => rx.push_back(0xF1),
            0x06 => rx.push_back(0x86),
            0x03 => rx.push_back(0x00),
            _ => {},
        });
        let mut flasher = FrFlasher::new(port, config(), loader());
        let err = flasher.connect().unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Upload));
        assert!(err.to_string().starts_with("upload failed"));
    }

    #[test]
    fn test_verify_upload_reads_back() {
        let (device, port) = setup(FrDevice::default());
        let mut flasher = FrFlasher::new(port, config().with_verify_upload(true), loader());
        flasher.connect().unwrap();
        assert_eq!(device.lock().unwrap().ram.len(), 2);
    }

    #[test]
    fn test_verify_upload_detects_mismatch() {
        let (device, port) = setup(FrDevice {
            corrupt_reads: true,
            ..FrDevice::default()
        });
        let mut flasher = FrFlasher::new(port, config().with_verify_upload(true), loader());
        let err = flasher.connect().unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Upload));
        assert!(err.to_string().contains("read-back mismatch at 0x00030000"));
        // stops at the first bad record, before CALL
        let device = device.lock().unwrap();
        assert_eq!(device.ram.len(), 1);
        assert!(device.calls.is_empty());
    }

    #[test]
    fn test_loader_without_uploadable_records() {
        let (_device, port) = setup(FrDevice::default());
        let loader: Image = [FlashRecord::new(0x0008_0000, vec![1]).unwrap()]
            .into_iter()
            .collect();
        let mut flasher = FrFlasher::new(port, config(), loader);
        let err = flasher.connect().unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Upload));
    }

    #[test]
    fn test_flash_requires_connect() {
        let (_device, port) = setup(FrDevice::default());
        let mut flasher = FrFlasher::new(port, config(), loader());
        let err = flasher.flash_image(&Image::default(), |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::Device(_)));
    }
}
