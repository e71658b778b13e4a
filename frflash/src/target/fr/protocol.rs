//! FR boot ROM and second-stage loader command sets.
//!
//! ## Boot ROM
//!
//! Every command is opened with a two-byte handshake:
//!
//! ```text
//! host: 0x01        device: 0xF1
//! host: <sub>       device: 0x80 | <sub>
//! ```
//!
//! followed by the command parameters. Addresses are 4 bytes, sizes 2 bytes,
//! both little-endian. READ and WRITE end with a 2-byte checksum from the
//! device.
//!
//! | sub  | command      | parameters             | reply               |
//! |------|--------------|------------------------|---------------------|
//! | 0x02 | READ         | addr, size             | data, checksum      |
//! | 0x03 | WRITE        | addr, size, data       | checksum            |
//! | 0x04 | CALL         | addr                   | none                |
//! | 0x05 | CHECKSUM     |                        | checksum            |
//! | 0x06 | SET-BAUDRATE | baud (4 bytes)         | none                |
//!
//! ## Loader
//!
//! The uploaded loader acknowledges each command once and reports completion
//! with a second, command-specific byte.

use crate::error::{Error, Result};
use crate::protocol::ByteLink;
use log::debug;

/// Byte the host sends while waiting for the boot ROM.
pub const HANDSHAKE_REQUEST: u8 = b'V';

/// Byte the boot ROM answers once it is listening.
pub const HANDSHAKE_READY: u8 = b'F';

/// Opcode that opens every boot ROM command.
pub const BOOTROM_OPCODE: u8 = 0x01;

/// Acknowledgment of [`BOOTROM_OPCODE`].
pub const BOOTROM_ACK: u8 = 0xF1;

/// Boot ROM sub-commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BootRomCommand {
    /// Read memory.
    Read = 0x02,
    /// Write memory.
    Write = 0x03,
    /// Jump to an address.
    Call = 0x04,
    /// Report the running checksum.
    Checksum = 0x05,
    /// Change the UART baud rate.
    SetBaudRate = 0x06,
}

impl BootRomCommand {
    /// Sub-opcode byte.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Acknowledgment of the sub-opcode.
    pub fn ack(self) -> u8 {
        0x80 | self.code()
    }

    fn name(self) -> &'static str {
        match self {
            Self::Read => "bootrom read",
            Self::Write => "bootrom write",
            Self::Call => "bootrom call",
            Self::Checksum => "bootrom checksum",
            Self::SetBaudRate => "bootrom set-baudrate",
        }
    }
}

/// Loader commands with their acknowledgment and completion bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoaderCommand {
    /// Erase everything.
    ChipErase = 0x15,
    /// Erase a range.
    Erase = 0x12,
    /// Program a block.
    Write = 0x13,
    /// Leave the loader and start the programmed firmware. No reply.
    Exit = 0x97,
}

impl LoaderCommand {
    /// Command byte.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// `(ack, completion)` bytes, if the command is answered.
    pub fn replies(self) -> Option<(u8, u8)> {
        match self {
            Self::ChipErase => Some((0x45, 0x23)),
            Self::Erase => Some((0x11, 0x18)),
            Self::Write => Some((0x37, 0x28)),
            Self::Exit => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::ChipErase => "loader chip-erase",
            Self::Erase => "loader erase",
            Self::Write => "loader write",
            Self::Exit => "loader exit",
        }
    }
}

fn transfer_size(len: usize) -> Result<u16> {
    u16::try_from(len)
        .map_err(|_| Error::Unsupported(format!("transfer of {len} bytes exceeds 65535")))
}

/// Boot ROM command set over a byte link.
pub struct BootRom<'a, L: ByteLink + ?Sized> {
    link: &'a mut L,
    last_checksum: Option<u16>,
}

impl<'a, L: ByteLink + ?Sized> BootRom<'a, L> {
    /// Talk to the boot ROM over `link`.
    pub fn new(link: &'a mut L) -> Self {
        Self {
            link,
            last_checksum: None,
        }
    }

    /// Checksum returned by the most recent READ, WRITE or CHECKSUM.
    pub fn last_checksum(&self) -> Option<u16> {
        self.last_checksum
    }

    fn begin(&mut self, command: BootRomCommand) -> Result<()> {
        self.link.send_byte(BOOTROM_OPCODE)?;
        self.link.expect_ack(command.name(), BOOTROM_ACK)?;
        self.link.send_byte(command.code())?;
        self.link.expect_ack(command.name(), command.ack())
    }

    fn recv_checksum(&mut self) -> Result<u16> {
        let checksum = self.link.recv_word()?;
        self.last_checksum = Some(checksum);
        Ok(checksum)
    }

    /// Read `size` bytes at `address`.
    pub fn read(&mut self, address: u32, size: u16) -> Result<Vec<u8>> {
        self.begin(BootRomCommand::Read)?;
        self.link.send_dword(address)?;
        self.link.send_word(size)?;
        let mut data = vec![0u8; usize::from(size)];
        self.link.recv_bytes(&mut data)?;
        self.recv_checksum()?;
        Ok(data)
    }

    /// Write `data` to `address`; returns the device checksum.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<u16> {
        let size = transfer_size(data.len())?;
        self.begin(BootRomCommand::Write)?;
        self.link.send_dword(address)?;
        self.link.send_word(size)?;
        self.link.send_bytes(data)?;
        self.recv_checksum()
    }

    /// Jump to `address`. The target takes over the link, nothing is read back.
    pub fn call(&mut self, address: u32) -> Result<()> {
        self.begin(BootRomCommand::Call)?;
        self.link.send_dword(address)
    }

    /// Query the running checksum.
    pub fn checksum(&mut self) -> Result<u16> {
        self.begin(BootRomCommand::Checksum)?;
        self.recv_checksum()
    }

    /// Ask the boot ROM to switch to `baud`.
    ///
    /// The caller must re-open the transport at the new rate.
    pub fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        debug!("Requesting boot ROM baud rate {baud}");
        self.begin(BootRomCommand::SetBaudRate)?;
        self.link.send_dword(baud)
    }
}

/// Second-stage loader command set over a byte link.
pub struct Loader<'a, L: ByteLink + ?Sized> {
    link: &'a mut L,
}

impl<'a, L: ByteLink + ?Sized> Loader<'a, L> {
    /// Talk to the loader over `link`.
    pub fn new(link: &'a mut L) -> Self {
        Self { link }
    }

    fn ack(&mut self, command: LoaderCommand) -> Result<()> {
        if let Some((ack, _)) = command.replies() {
            self.link.expect_ack(command.name(), ack)?;
        }
        Ok(())
    }

    fn complete(&mut self, command: LoaderCommand) -> Result<()> {
        if let Some((_, done)) = command.replies() {
            self.link.expect_ack(command.name(), done)?;
        }
        Ok(())
    }

    /// Erase the whole flash; returns once the loader reports completion.
    pub fn chip_erase(&mut self) -> Result<()> {
        let command = LoaderCommand::ChipErase;
        self.link.send_byte(command.code())?;
        self.ack(command)?;
        self.complete(command)
    }

    /// Erase `size` bytes starting at `address`.
    pub fn erase(&mut self, address: u32, size: u16) -> Result<()> {
        let command = LoaderCommand::Erase;
        self.link.send_byte(command.code())?;
        self.ack(command)?;
        self.link.send_dword(address)?;
        self.link.send_word(size)?;
        self.complete(command)
    }

    /// Program `data` at `address`.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let size = transfer_size(data.len())?;
        let command = LoaderCommand::Write;
        self.link.send_byte(command.code())?;
        self.ack(command)?;
        self.link.send_dword(address)?;
        self.link.send_word(size)?;
        self.link.send_bytes(data)?;
        self.complete(command)
    }

    /// Leave the loader and restart the target.
    pub fn exit(&mut self) -> Result<()> {
        self.link.send_bytes(&[LoaderCommand::Exit.code()])
    }
}
