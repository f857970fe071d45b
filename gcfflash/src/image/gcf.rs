//! GCF firmware image container.
//!
//! A GCF file is a raw firmware payload behind a fixed 14-byte header:
//!
//! ```text
//! +--------+------+-------------+--------------+-------+------------+
//! | magic  | type | target addr | payload size | CRC-8 |  payload   |
//! +--------+------+-------------+--------------+-------+------------+
//! | 4 (LE) |  1   |   4 (LE)    |    4 (LE)    |   1   |  N bytes   |
//! +--------+------+-------------+--------------+-------+------------+
//! ```
//!
//! The firmware version is not stored in the file; it is encoded in the
//! file name as a `0x`-prefixed hex substring, e.g.
//! `deCONZ_ConBeeII_0x26720700.bin.GCF`.

use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use log::debug;

/// GCF header magic.
pub const GCF_MAGIC: u32 = 0xCAFE_FEED;

/// Size of the fixed GCF header in bytes.
pub const GCF_HEADER_SIZE: usize = 14;

/// Largest accepted GCF file.
pub const MAX_FILE_SIZE: usize = 512 * 1024;

/// Mask selecting the platform byte of a firmware version.
pub const FW_VERSION_PLATFORM_MASK: u32 = 0x0000_FF00;

/// Platform byte of AVR based firmware (ConBee-1, RaspBee-1).
pub const FW_VERSION_PLATFORM_AVR: u32 = 0x0000_0500;

/// Platform byte of R21 based firmware (ConBee-2, RaspBee-2).
pub const FW_VERSION_PLATFORM_R21: u32 = 0x0000_0700;

/// A parsed GCF firmware image. Immutable after parse.
#[derive(Debug, Clone)]
pub struct GcfFile {
    /// File name the image was loaded from.
    pub file_name: String,
    /// Firmware version parsed from the file name.
    pub fw_version: u32,
    /// File type from the header.
    pub file_type: u8,
    /// Flash target address from the header.
    pub target_address: u32,
    /// Payload size from the header; equals `payload.len()`.
    pub payload_size: u32,
    /// Dallas CRC-8 from the header.
    pub crc8: u8,
    /// Firmware payload (file content after the header).
    pub payload: Vec<u8>,
}

impl GcfFile {
    /// Parse a GCF image from raw file bytes and its file name.
    pub fn parse(file_name: &str, content: &[u8]) -> Result<Self> {
        if content.len() < GCF_HEADER_SIZE {
            return Err(Error::GcfTooSmall(content.len()));
        }

        if content.len() > MAX_FILE_SIZE {
            return Err(Error::GcfBadHeader(format!(
                "file too large ({} bytes)",
                content.len()
            )));
        }

        let fw_version = fw_version_from_name(file_name).ok_or_else(|| {
            Error::GcfBadHeader(format!("no 0x firmware version in file name {file_name}"))
        })?;

        let mut rd = &content[..];
        let magic = rd.read_u32::<LittleEndian>()?;
        let file_type = rd.read_u8()?;
        let target_address = rd.read_u32::<LittleEndian>()?;
        let payload_size = rd.read_u32::<LittleEndian>()?;
        let crc8 = rd.read_u8()?;

        if magic != GCF_MAGIC {
            return Err(Error::GcfBadHeader(format!("bad magic 0x{magic:08X}")));
        }

        let actual = content.len() - GCF_HEADER_SIZE;
        if payload_size as usize != actual {
            return Err(Error::GcfSizeMismatch {
                header: payload_size,
                actual,
            });
        }

        debug!(
            "GCF {file_name}: version 0x{fw_version:08X}, type {file_type}, \
             target 0x{target_address:08X}, {payload_size} payload bytes"
        );

        Ok(Self {
            file_name: file_name.to_string(),
            fw_version,
            file_type,
            target_address,
            payload_size,
            crc8,
            payload: content[GCF_HEADER_SIZE..].to_vec(),
        })
    }

    /// Platform byte of the firmware version (`0x05` AVR, `0x07` R21).
    pub fn platform(&self) -> u32 {
        self.fw_version & FW_VERSION_PLATFORM_MASK
    }

    /// Whether this image targets the R21 platform (ConBee-2, RaspBee-2).
    pub fn is_r21(&self) -> bool {
        self.platform() == FW_VERSION_PLATFORM_R21
    }

    /// Payload slice for a V1 bootloader page pull: up to 256 bytes
    /// starting at `page * 256`. `None` when the page lies past the end.
    pub fn v1_page(&self, page: u32) -> Option<&[u8]> {
        let start = page as usize * 256;
        if start >= self.payload.len() {
            return None;
        }
        let end = (start + 256).min(self.payload.len());
        Some(&self.payload[start..end])
    }
}

/// Parse the firmware version from the first `0x` hex substring of a file
/// name. At most eight hex digits are consumed.
fn fw_version_from_name(name: &str) -> Option<u32> {
    let pos = name.find("0x")?;
    let digits: String = name[pos + 2..]
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .take(8)
        .collect();

    if digits.is_empty() {
        return None;
    }

    u32::from_str_radix(&digits, 16).ok()
}
