//! Motorola S-record firmware images (`.mhx`).
//!
//! Only data records carry something to flash:
//!
//! ```text
//! S2 cc aaaaaa dd..dd ss     3 address bytes
//! S3 cc aaaaaaaa dd..dd ss   4 address bytes
//! ```
//!
//! `cc` counts the bytes after itself (address, data and checksum), so a line
//! is well formed when `len(line) - 4 == cc * 2`. The checksum byte is not
//! validated. Malformed lines are skipped with a [`ParseWarning`]; they never
//! abort the parse.

use crate::error::{Error, Result};
use log::{debug, warn};
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::Path;

/// Length of the `Sx` tag plus the byte-count field.
const HEADER_WIDTH: usize = 4;

/// A run of bytes to be written at `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlashRecord {
    address: u32,
    data: Vec<u8>,
}

impl FlashRecord {
    /// Create a record.
    ///
    /// Fails if `data` is empty or runs past the end of the 32-bit address space.
    pub fn new(address: u32, data: Vec<u8>) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::InvalidImage(format!(
                "empty record at 0x{address:08X}"
            )));
        }
        let last = u64::from(address) + data.len() as u64 - 1;
        if last > u64::from(u32::MAX) {
            return Err(Error::InvalidImage(format!(
                "record at 0x{address:08X} ({} bytes) exceeds the address space",
                data.len()
            )));
        }
        Ok(Self { address, data })
    }

    /// Start address.
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of payload bytes.
    #[allow(clippy::len_without_is_empty)] // never empty
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// One past the last address, as `u64` so a record ending at `u32::MAX` fits.
    pub fn end(&self) -> u64 {
        u64::from(self.address) + self.data.len() as u64
    }
}

/// Data record layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// `S2`: 24-bit address.
    S2,
    /// `S3`: 32-bit address.
    S3,
}

impl RecordKind {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "S2" => Some(Self::S2),
            "S3" => Some(Self::S3),
            _ => None,
        }
    }

    /// Address width in bytes.
    pub fn address_bytes(self) -> usize {
        match self {
            Self::S2 => 3,
            Self::S3 => 4,
        }
    }
}

/// Why a line was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarningKind {
    /// `len(line) - 4` disagrees with the byte-count field.
    ByteCountMismatch {
        /// Value of the byte-count field.
        declared: usize,
        /// Bytes actually present after the header.
        actual: usize,
    },
    /// A field contained something other than hex digits.
    InvalidHex,
    /// The byte count leaves no room for data.
    NoData,
    /// The record runs past the 32-bit address space.
    AddressOverflow,
    /// The line is not an S-record at all.
    UnrecognizedLine,
}

/// A skipped line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseWarning {
    /// 1-based line number.
    pub line: usize,
    /// Reason the line was skipped.
    pub kind: WarningKind,
}

impl fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            WarningKind::ByteCountMismatch { declared, actual } => write!(
                f,
                "line {}: invalid byte count field ({declared} declared, {actual} present)",
                self.line
            ),
            WarningKind::InvalidHex => write!(f, "line {}: invalid hex digits", self.line),
            WarningKind::NoData => write!(f, "line {}: record carries no data", self.line),
            WarningKind::AddressOverflow => {
                write!(f, "line {}: record exceeds the address space", self.line)
            },
            WarningKind::UnrecognizedLine => write!(f, "line {}: not an S-record", self.line),
        }
    }
}

/// A parsed firmware image: data records in file order plus skipped lines.
#[derive(Debug, Clone, Default)]
pub struct Image {
    records: Vec<FlashRecord>,
    warnings: Vec<ParseWarning>,
}

impl Image {
    /// Parse an image from text. Malformed lines become warnings.
    pub fn parse(text: &str) -> Self {
        let mut image = Self::default();

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            match parse_line(line) {
                Ok(Some(record)) => image.records.push(record),
                Ok(None) => debug!("line {line_no}: skipping non-data record"),
                Err(kind) => {
                    let warning = ParseWarning {
                        line: line_no,
                        kind,
                    };
                    warn!("{warning}, skipping line");
                    image.warnings.push(warning);
                },
            }
        }

        debug!(
            "Parsed {} records ({} bytes), {} warnings",
            image.records.len(),
            image.total_bytes(),
            image.warnings.len()
        );
        image
    }

    /// Read and parse an image file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = fs::read(path.as_ref())?;
        Self::from_bytes(&bytes)
    }

    /// Read and parse an image from any reader.
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Self::from_bytes(&bytes)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| Error::InvalidImage(format!("not a text file: {e}")))?;
        Ok(Self::parse(text))
    }

    /// Data records in file order.
    pub fn records(&self) -> &[FlashRecord] {
        &self.records
    }

    /// Lines that were skipped.
    pub fn warnings(&self) -> &[ParseWarning] {
        &self.warnings
    }

    /// Whether the image holds no data records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sum of all record lengths.
    pub fn total_bytes(&self) -> usize {
        self.records.iter().map(FlashRecord::len).sum()
    }

    /// Records whose start address is at most `ceiling`.
    pub fn records_below(&self, ceiling: u32) -> impl Iterator<Item = &FlashRecord> {
        self.records
            .iter()
            .filter(move |r| r.address() <= ceiling)
    }
}

impl FromIterator<FlashRecord> for Image {
    fn from_iter<I: IntoIterator<Item = FlashRecord>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
            warnings: Vec::new(),
        }
    }
}

/// Parse one trimmed, non-empty line.
///
/// `Ok(None)` is a valid S-record that carries nothing to flash.
fn parse_line(line: &str) -> std::result::Result<Option<FlashRecord>, WarningKind> {
    let Some(tag) = line.get(..2) else {
        return Err(WarningKind::UnrecognizedLine);
    };
    let Some(kind) = RecordKind::from_tag(tag) else {
        let is_srec = tag.as_bytes()[0] == b'S' && tag.as_bytes()[1].is_ascii_digit();
        return if is_srec {
            Ok(None)
        } else {
            Err(WarningKind::UnrecognizedLine)
        };
    };

    let count = line
        .get(2..HEADER_WIDTH)
        .and_then(|s| u8::from_str_radix(s, 16).ok())
        .ok_or(WarningKind::InvalidHex)? as usize;
    let actual = line.len() - HEADER_WIDTH;
    if actual != count * 2 {
        return Err(WarningKind::ByteCountMismatch {
            declared: count,
            actual: actual / 2,
        });
    }

    let bytes = decode_hex(&line[HEADER_WIDTH..]).ok_or(WarningKind::InvalidHex)?;
    let addr_len = kind.address_bytes();
    // address + at least one data byte + checksum
    if bytes.len() < addr_len + 2 {
        return Err(WarningKind::NoData);
    }

    let address = bytes[..addr_len]
        .iter()
        .fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
    let data = bytes[addr_len..bytes.len() - 1].to_vec();

    FlashRecord::new(address, data)
        .map(Some)
        .map_err(|_| WarningKind::AddressOverflow)
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 || !s.is_ascii() {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
