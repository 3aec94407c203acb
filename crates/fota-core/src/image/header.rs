//! Fixed-layout image header.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use super::ImageError;

/// Image format magic, b"FOTA" read as a little-endian u32.
pub const IMAGE_MAGIC: u32 = 0x4154_4F46;

/// Offset one past the chip-compatibility fields.
///
/// Magic plus chip id and revision range fit in the first ten bytes, so an
/// incompatible image can be rejected before the rest of the header arrives.
pub const CHIP_FIELDS_LEN: usize = 10;

/// Identity of the hardware the engine is running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct TargetInfo {
    pub chip_id: u16,
    pub chip_rev: u16,
}

/// Image header (24 bytes).
///
/// Precedes the application descriptor at the start of every image.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageHeader {
    pub chip_id: u16,
    pub chip_rev_min: u16,
    pub chip_rev_max: u16,
    pub header_version: u16,
    /// Length of the payload following the descriptor block.
    pub payload_len: u32,
    pub flags: u32,
    pub reserved: u32,
}

impl ImageHeader {
    pub const SIZE: usize = 24;

    /// Parse a header from the first [`Self::SIZE`] bytes of an image.
    pub fn parse(data: &[u8]) -> Result<Self, ImageError> {
        if data.len() < Self::SIZE {
            return Err(ImageError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != IMAGE_MAGIC {
            return Err(ImageError::InvalidMagic { actual: magic });
        }
        Ok(Self {
            chip_id: cursor.read_u16::<LittleEndian>()?,
            chip_rev_min: cursor.read_u16::<LittleEndian>()?,
            chip_rev_max: cursor.read_u16::<LittleEndian>()?,
            header_version: cursor.read_u16::<LittleEndian>()?,
            payload_len: cursor.read_u32::<LittleEndian>()?,
            flags: cursor.read_u32::<LittleEndian>()?,
            reserved: cursor.read_u32::<LittleEndian>()?,
        })
    }

    /// Serialize to wire layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_u32::<LittleEndian>(IMAGE_MAGIC).unwrap();
        buf.write_u16::<LittleEndian>(self.chip_id).unwrap();
        buf.write_u16::<LittleEndian>(self.chip_rev_min).unwrap();
        buf.write_u16::<LittleEndian>(self.chip_rev_max).unwrap();
        buf.write_u16::<LittleEndian>(self.header_version).unwrap();
        buf.write_u32::<LittleEndian>(self.payload_len).unwrap();
        buf.write_u32::<LittleEndian>(self.flags).unwrap();
        buf.write_u32::<LittleEndian>(self.reserved).unwrap();
        buf
    }

    /// Check that this image may run on `target`.
    pub fn check_compat(&self, target: &TargetInfo) -> Result<(), ImageError> {
        let rev_ok =
            target.chip_rev >= self.chip_rev_min && target.chip_rev <= self.chip_rev_max;
        if self.chip_id != target.chip_id || !rev_ok {
            return Err(ImageError::ChipMismatch {
                chip_id: self.chip_id,
                rev_min: self.chip_rev_min,
                rev_max: self.chip_rev_max,
                running_id: target.chip_id,
                running_rev: target.chip_rev,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = ImageHeader {
            chip_id: 2,
            chip_rev_min: 0,
            chip_rev_max: 99,
            header_version: 1,
            payload_len: 0x12345,
            flags: 0,
            reserved: 0,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), ImageHeader::SIZE);

        let parsed = ImageHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.chip_id, 2);
        assert_eq!(parsed.chip_rev_max, 99);
        assert_eq!(parsed.payload_len, 0x12345);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = ImageHeader::default().to_bytes();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            ImageHeader::parse(&bytes),
            Err(ImageError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_chip_compat() {
        let header = ImageHeader {
            chip_id: 7,
            chip_rev_min: 1,
            chip_rev_max: 3,
            ..Default::default()
        };
        let ok = TargetInfo {
            chip_id: 7,
            chip_rev: 2,
        };
        assert!(header.check_compat(&ok).is_ok());

        let wrong_id = TargetInfo {
            chip_id: 8,
            chip_rev: 2,
        };
        assert!(header.check_compat(&wrong_id).is_err());

        let rev_too_new = TargetInfo {
            chip_id: 7,
            chip_rev: 4,
        };
        assert!(header.check_compat(&rev_too_new).is_err());
    }
}
