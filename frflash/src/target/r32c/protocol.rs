//! R32C serial-programming command set.
//!
//! Commands are single bytes without an acknowledgment; results are read
//! back through the two status registers (SRD1, SRD2). Flash is addressed
//! in 256-byte pages selected with
//!
//! ```text
//! 0x48  addr[31:24]  <sub>  addr[15:8]  addr[23:16]
//! ```
//!
//! Key slots use the same prefix with sub-command `0xF5` and three address
//! bytes (`addr[7:0]`, `addr[15:8]`, `addr[23:16]`), followed by `0x07` and
//! the seven key bytes.

use crate::error::{Error, Result};
use crate::protocol::ByteLink;
use crate::unlock::{KeyProbe, KeyState, UnlockKey};
use log::{debug, trace};
use std::thread;
use std::time::{Duration, Instant};

/// Byte sent repeatedly after reset to lock the ROM onto the bit rate.
pub const SYNC_BYTE: u8 = 0x00;

/// Bytes per flash page.
pub const PAGE_SIZE: usize = 256;

/// Length of the version string.
pub const VERSION_LEN: usize = 8;

/// Delay between two status polls.
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Command bytes.
pub mod opcode {
    /// Read SRD1/SRD2.
    pub const GET_STATUS: u8 = 0x70;
    /// Clear the status registers.
    pub const CLEAR_STATUS: u8 = 0x50;
    /// Select a page or key-slot address.
    pub const SELECT_ADDRESS: u8 = 0x48;
    /// Key bytes follow.
    pub const SEND_KEY: u8 = 0x07;
    /// Read the 8-byte version string.
    pub const GET_VERSION: u8 = 0xFB;
    /// Erase every unlocked block.
    pub const ERASE_ALL_UNLOCKED: u8 = 0xA7;
    /// Confirmation byte for [`ERASE_ALL_UNLOCKED`].
    pub const ERASE_CONFIRM: u8 = 0xD0;
    /// Sub-command: key slot.
    pub const SUB_KEY: u8 = 0xF5;
    /// Sub-command: page read.
    pub const SUB_PAGE_READ: u8 = 0xFF;
    /// Sub-command: page program.
    pub const SUB_PAGE_PROGRAM: u8 = 0x41;
}

/// Baud-rate command for `baud`, if the ROM supports that rate.
pub fn baud_command(baud: u32) -> Option<u8> {
    match baud {
        9600 => Some(0xB0),
        19_200 => Some(0xB1),
        38_400 => Some(0xB2),
        57_600 => Some(0xB3),
        115_200 => Some(0xB4),
        _ => None,
    }
}

fn bit(byte: u8, pos: u8) -> bool {
    byte & (1 << pos) != 0
}

/// Decoded status registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    /// The ROM can accept the next command.
    pub loader_ready: bool,
    /// The last erase failed.
    pub erase_failed: bool,
    /// The last program operation failed.
    pub program_failed: bool,
    /// ID check result.
    pub key_state: KeyState,
}

impl DeviceStatus {
    /// Decode SRD1/SRD2.
    ///
    /// Key bits `key1 = SRD2 bit 2`, `key2 = SRD2 bit 3`; the combination
    /// `key1 = 0, key2 = 1` is reported as [`Error::InvalidStatus`].
    pub fn decode(srd1: u8, srd2: u8) -> Result<Self> {
        let key_state = KeyState::from_bits(bit(srd2, 2), bit(srd2, 3))
            .ok_or(Error::InvalidStatus { srd1, srd2 })?;
        Ok(Self {
            loader_ready: bit(srd1, 7),
            erase_failed: bit(srd1, 5),
            program_failed: bit(srd1, 4),
            key_state,
        })
    }
}

/// R32C command set over a byte link.
pub struct SerialProgrammer<'a, L: ByteLink + ?Sized> {
    link: &'a mut L,
}

impl<'a, L: ByteLink + ?Sized> SerialProgrammer<'a, L> {
    /// Talk to the ROM over `link`.
    pub fn new(link: &'a mut L) -> Self {
        Self { link }
    }

    /// Read and decode the status registers.
    pub fn status(&mut self) -> Result<DeviceStatus> {
        self.link.send_bytes(&[opcode::GET_STATUS])?;
        let srd1 = self.link.recv_byte()?;
        let srd2 = self.link.recv_byte()?;
        trace!("SRD1={srd1:02X} SRD2={srd2:02X}");
        DeviceStatus::decode(srd1, srd2)
    }

    /// Clear the status registers.
    pub fn clear_status(&mut self) -> Result<()> {
        self.link.send_bytes(&[opcode::CLEAR_STATUS])
    }

    /// Poll the status until the ROM is ready, for at most `timeout`.
    pub fn wait_ready(&mut self, timeout: Duration) -> Result<DeviceStatus> {
        let start = Instant::now();
        loop {
            let status = self.status()?;
            if status.loader_ready {
                return Ok(status);
            }
            if start.elapsed() >= timeout {
                return Err(Error::Timeout(format!(
                    "device busy for more than {} ms",
                    timeout.as_millis()
                )));
            }
            thread::sleep(STATUS_POLL_INTERVAL);
        }
    }

    fn select_page(&mut self, address: u32, sub: u8) -> Result<()> {
        let [b0, b1, b2, b3] = address.to_le_bytes();
        if b0 != 0 {
            return Err(Error::Unsupported(format!(
                "page address 0x{address:08X} is not page aligned"
            )));
        }
        self.link
            .send_bytes(&[opcode::SELECT_ADDRESS, b3, sub, b1, b2])
    }

    /// Present `key` for its key slot.
    pub fn send_key(&mut self, key: &UnlockKey) -> Result<()> {
        let [b0, b1, b2, b3] = key.address.to_le_bytes();
        let mut frame = vec![opcode::SELECT_ADDRESS, b3, opcode::SUB_KEY, b0, b1, b2, opcode::SEND_KEY];
        frame.extend_from_slice(&key.bytes());
        self.link.send_bytes(&frame)
    }

    /// Ask the ROM to switch to `baud`; the ROM echoes the command byte.
    ///
    /// The caller must re-open the transport when the rate changed.
    pub fn set_baud(&mut self, baud: u32) -> Result<()> {
        let command = baud_command(baud)
            .ok_or_else(|| Error::Unsupported(format!("baud rate {baud} not supported")))?;
        debug!("Requesting baud rate {baud} (0x{command:02X})");
        self.link.send_bytes(&[command])?;
        self.link.expect_ack("set-baud", command)
    }

    /// Read the chip version string.
    pub fn version(&mut self) -> Result<String> {
        self.link.send_bytes(&[opcode::GET_VERSION])?;
        let mut raw = [0u8; VERSION_LEN];
        self.link.recv_bytes(&mut raw)?;
        Ok(String::from_utf8_lossy(&raw)
            .trim_end_matches(['\0', ' '])
            .to_string())
    }

    /// Read one page.
    pub fn read_page(&mut self, address: u32) -> Result<Vec<u8>> {
        self.select_page(address, opcode::SUB_PAGE_READ)?;
        let mut page = vec![0u8; PAGE_SIZE];
        self.link.recv_bytes(&mut page)?;
        Ok(page)
    }

    /// Program one page. Completion is reported through the status.
    pub fn program_page(&mut self, address: u32, data: &[u8]) -> Result<()> {
        if data.len() != PAGE_SIZE {
            return Err(Error::Unsupported(format!(
                "page program needs {PAGE_SIZE} bytes, got {}",
                data.len()
            )));
        }
        self.select_page(address, opcode::SUB_PAGE_PROGRAM)?;
        self.link.send_bytes(data)
    }

    /// Erase every unlocked block. Completion is reported through the status.
    pub fn erase_all_unlocked(&mut self) -> Result<()> {
        self.link
            .send_bytes(&[opcode::ERASE_ALL_UNLOCKED, opcode::ERASE_CONFIRM])
    }
}

impl<L: ByteLink + ?Sized> KeyProbe for SerialProgrammer<'_, L> {
    fn clear_status(&mut self) -> Result<()> {
        SerialProgrammer::clear_status(self)
    }

    fn key_state(&mut self) -> Result<KeyState> {
        Ok(self.status()?.key_state)
    }

    fn send_key(&mut self, key: &UnlockKey) -> Result<()> {
        SerialProgrammer::send_key(self, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockPort;

    #[test]
    fn test_decode_status() {
        let status = DeviceStatus::decode(0x80, 0x0C).unwrap();
        assert!(status.loader_ready);
        assert!(!status.erase_failed);
        assert!(!status.program_failed);
        assert_eq!(status.key_state, KeyState::CorrectKey);

        let status = DeviceStatus::decode(0xB0, 0x04).unwrap();
        assert!(status.erase_failed);
        assert!(status.program_failed);
        assert_eq!(status.key_state, KeyState::WrongKey);

        let status = DeviceStatus::decode(0x00, 0x00).unwrap();
        assert!(!status.loader_ready);
        assert_eq!(status.key_state, KeyState::NoKey);
    }

    #[test]
    fn test_decode_invalid_key_bits() {
        let err = DeviceStatus::decode(0x80, 0x08).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidStatus {
                srd1: 0x80,
                srd2: 0x08
            }
        ));
    }

    #[test]
    fn test_send_key_frame() {
        let mut port = MockPort::scripted(&[]);
        let key = UnlockKey::new(0xFFFF_FFEA, 0x0011_2233_4455_6677);
        SerialProgrammer::new(&mut port).send_key(&key).unwrap();
        assert_eq!(
            port.written,
            [
                0x48, 0xFF, 0xF5, 0xEA, 0xFF, 0xFF, 0x07, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22,
                0x11
            ]
        );
    }

    #[test]
    fn test_read_page_frame() {
        let reply: Vec<u8> = (0..=255u8).collect();
        let mut port = MockPort::scripted(&reply);
        let page = SerialProgrammer::new(&mut port)
            .read_page(0xFFFF_0000)
            .unwrap();
        assert_eq!(page.len(), PAGE_SIZE);
        assert_eq!(page[255], 255);
        assert_eq!(port.written, [0x48, 0xFF, 0xFF, 0x00, 0xFF]);
    }

    #[test]
    fn test_program_page_frame() {
        let mut port = MockPort::scripted(&[]);
        let data = vec![0xA5; PAGE_SIZE];
        SerialProgrammer::new(&mut port)
            .program_page(0x00FE_1200, &data)
            .unwrap();
        assert_eq!(&port.written[..5], &[0x48, 0x00, 0x41, 0x12, 0xFE]);
        assert_eq!(port.written.len(), 5 + PAGE_SIZE);
    }

    #[test]
    fn test_program_rejects_partial_page() {
        let mut port = MockPort::scripted(&[]);
        let err = SerialProgrammer::new(&mut port)
            .program_page(0, &[1, 2, 3])
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        assert!(port.written.is_empty());
    }

    #[test]
    fn test_unaligned_page_address() {
        let mut port = MockPort::scripted(&[]);
        assert!(
            SerialProgrammer::new(&mut port)
                .read_page(0x0000_0010)
                .is_err()
        );
    }

    #[test]
    fn test_set_baud_echo() {
        let mut port = MockPort::scripted(&[0xB4]);
        SerialProgrammer::new(&mut port).set_baud(115_200).unwrap();
        assert_eq!(port.written, [0xB4]);

        let mut port = MockPort::scripted(&[0x00]);
        let err = SerialProgrammer::new(&mut port).set_baud(9600).unwrap_err();
        assert!(matches!(err, Error::Desync { expected: 0xB0, .. }));

        let mut port = MockPort::scripted(&[]);
        assert!(SerialProgrammer::new(&mut port).set_baud(1200).is_err());
    }

    #[test]
    fn test_version() {
        let mut port = MockPort::scripted(b"VER.1.00");
        assert_eq!(
            SerialProgrammer::new(&mut port).version().unwrap(),
            "VER.1.00"
        );
        assert_eq!(port.written, [0xFB]);
    }

    #[test]
    fn test_wait_ready_polls() {
        let mut port = MockPort::scripted(&[0x00, 0x00, 0x00, 0x00, 0x80, 0x00]);
        let status = SerialProgrammer::new(&mut port)
            .wait_ready(Duration::from_secs(1))
            .unwrap();
        assert!(status.loader_ready);
        assert_eq!(port.written, [0x70, 0x70, 0x70]);
    }

    #[test]
    fn test_erase_all_unlocked() {
        let mut port = MockPort::scripted(&[]);
        SerialProgrammer::new(&mut port).erase_all_unlocked().unwrap();
        assert_eq!(port.written, [0xA7, 0xD0]);
    }
}
