//! Byte-level framing shared by every command set.
//!
//! All multi-byte values travel little-endian. Acknowledgments are single
//! bytes; a mismatch means the link is desynchronized and is reported as
//! [`Error::Desync`] instead of being retried.

use crate::error::{Error, Result};
use crate::port::Port;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::trace;
use std::io;

fn map_read_error(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::UnexpectedEof => {
            Error::Timeout("no response from device".into())
        },
        _ => Error::Io(e),
    }
}

/// Byte-oriented send/receive helpers on top of a [`Port`].
pub trait ByteLink {
    /// Send a single byte.
    fn send_byte(&mut self, byte: u8) -> Result<()>;

    /// Send a 16-bit word, little-endian.
    fn send_word(&mut self, word: u16) -> Result<()>;

    /// Send a 32-bit double word, little-endian.
    fn send_dword(&mut self, dword: u32) -> Result<()>;

    /// Send a byte run as-is.
    fn send_bytes(&mut self, data: &[u8]) -> Result<()>;

    /// Receive a single byte, failing with [`Error::Timeout`] if none arrives.
    fn recv_byte(&mut self) -> Result<u8>;

    /// Receive a 16-bit word, little-endian.
    fn recv_word(&mut self) -> Result<u16>;

    /// Fill `buf` from the link.
    fn recv_bytes(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Receive one byte and require it to be `expected`.
    fn expect_ack(&mut self, command: &'static str, expected: u8) -> Result<()> {
        let actual = self.recv_byte()?;
        if actual == expected {
            Ok(())
        } else {
            Err(Error::Desync {
                command,
                expected,
                actual,
            })
        }
    }
}

impl<P: Port + ?Sized> ByteLink for P {
    fn send_byte(&mut self, byte: u8) -> Result<()> {
        trace!("TX {byte:02X}");
        self.write_u8(byte)?;
        Ok(())
    }

    fn send_word(&mut self, word: u16) -> Result<()> {
        trace!("TX word {word:04X}");
        self.write_u16::<LittleEndian>(word)?;
        Ok(())
    }

    fn send_dword(&mut self, dword: u32) -> Result<()> {
        trace!("TX dword {dword:08X}");
        self.write_u32::<LittleEndian>(dword)?;
        Ok(())
    }

    fn send_bytes(&mut self, data: &[u8]) -> Result<()> {
        trace!("TX {} bytes", data.len());
        self.write_all(data)?;
        self.flush()?;
        Ok(())
    }

    fn recv_byte(&mut self) -> Result<u8> {
        let byte = self.read_u8().map_err(map_read_error)?;
        trace!("RX {byte:02X}");
        Ok(byte)
    }

    fn recv_word(&mut self) -> Result<u16> {
        self.read_u16::<LittleEndian>().map_err(map_read_error)
    }

    fn recv_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        self.read_exact(buf).map_err(map_read_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockPort;

    #[test]
    fn test_little_endian_encoding() {
        let mut port = MockPort::scripted(&[]);
        port.send_dword(0x0003_0000).unwrap();
        port.send_word(0x0102).unwrap();
        assert_eq!(port.written, [0x00, 0x00, 0x03, 0x00, 0x02, 0x01]);
    }

    #[test]
    fn test_recv_word_little_endian() {
        let mut port = MockPort::scripted(&[0x34, 0x12]);
        assert_eq!(port.recv_word().unwrap(), 0x1234);
    }

    #[test]
    fn test_recv_timeout() {
        let mut port = MockPort::scripted(&[]);
        assert!(port.recv_byte().unwrap_err().is_timeout());
    }

    #[test]
    fn test_expect_ack_mismatch_is_desync() {
        let mut port = MockPort::scripted(&[0x00]);
        let err = port.expect_ack("test", 0xF1).unwrap_err();
        assert!(matches!(
            err,
            Error::Desync {
                expected: 0xF1,
                actual: 0x00,
                ..
            }
        ));
    }
}
