//! Image format: header, application descriptor, incremental parser.
//!
//! An image on the wire is `header || descriptor || payload`. The parser
//! accumulates the leading bytes of the stream and validates them as soon as
//! each region becomes decidable: the magic after 4 bytes, chip
//! compatibility after [`CHIP_FIELDS_LEN`] bytes, the full descriptor after
//! [`HEADER_REGION_LEN`] bytes.

mod descriptor;
mod header;

pub use descriptor::ApplicationDescriptor;
pub use header::{CHIP_FIELDS_LEN, IMAGE_MAGIC, ImageHeader, TargetInfo};

use byteorder::{ByteOrder, LittleEndian};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Bytes occupied by header plus descriptor; payload starts here.
pub const HEADER_REGION_LEN: usize = ImageHeader::SIZE + ApplicationDescriptor::SIZE;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("invalid image magic 0x{actual:08X}")]
    InvalidMagic { actual: u32 },
    #[error("stream ended inside the header region after {got} bytes")]
    TruncatedHeader { got: usize },
    #[error(
        "unsupported chip: image targets id {chip_id} rev {rev_min}..={rev_max}, \
         running id {running_id} rev {running_rev}"
    )]
    ChipMismatch {
        chip_id: u16,
        rev_min: u16,
        rev_max: u16,
        running_id: u16,
        running_rev: u16,
    },
    #[error("payload length mismatch: header declares {declared}, partition holds {actual}")]
    LengthMismatch { declared: u64, actual: u64 },
    #[error("payload digest mismatch")]
    DigestMismatch,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Incremental parser for the leading bytes of an image stream.
#[derive(Debug, Default)]
pub struct ImageParser {
    buf: Vec<u8>,
}

impl ImageParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed plaintext stream bytes.
    ///
    /// Returns how many bytes were consumed into the header region; the
    /// remainder belongs to the payload. Rejects a bad magic as soon as four
    /// bytes are buffered.
    pub fn push(&mut self, data: &[u8]) -> Result<usize, ImageError> {
        let need = HEADER_REGION_LEN - self.buf.len();
        let take = need.min(data.len());
        let had_magic = self.buf.len() >= 4;
        self.buf.extend_from_slice(&data[..take]);
        if !had_magic && self.buf.len() >= 4 {
            let magic = LittleEndian::read_u32(&self.buf[..4]);
            if magic != IMAGE_MAGIC {
                return Err(ImageError::InvalidMagic { actual: magic });
            }
        }
        Ok(take)
    }

    /// Check if the full header region has been buffered.
    pub fn is_complete(&self) -> bool {
        self.buf.len() >= HEADER_REGION_LEN
    }

    /// Check if the chip-compatibility fields are already decidable.
    pub fn has_chip_fields(&self) -> bool {
        self.buf.len() >= CHIP_FIELDS_LEN
    }

    /// Raw bytes buffered so far (at most the header region).
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Verify chip compatibility from the buffered prefix.
    ///
    /// Decidable from [`CHIP_FIELDS_LEN`] bytes, before the descriptor is
    /// complete.
    pub fn verify_chip(&self, target: &TargetInfo) -> Result<(), ImageError> {
        if !self.has_chip_fields() {
            return Err(ImageError::TruncatedHeader {
                got: self.buf.len(),
            });
        }
        let chip_id = LittleEndian::read_u16(&self.buf[4..6]);
        let rev_min = LittleEndian::read_u16(&self.buf[6..8]);
        let rev_max = LittleEndian::read_u16(&self.buf[8..10]);
        let rev_ok = target.chip_rev >= rev_min && target.chip_rev <= rev_max;
        if chip_id != target.chip_id || !rev_ok {
            return Err(ImageError::ChipMismatch {
                chip_id,
                rev_min,
                rev_max,
                running_id: target.chip_id,
                running_rev: target.chip_rev,
            });
        }
        Ok(())
    }

    /// Parse the completed header region.
    pub fn finish(&self) -> Result<(ImageHeader, ApplicationDescriptor), ImageError> {
        if !self.is_complete() {
            return Err(ImageError::TruncatedHeader {
                got: self.buf.len(),
            });
        }
        let header = ImageHeader::parse(&self.buf[..ImageHeader::SIZE])?;
        let descriptor = ApplicationDescriptor::parse(&self.buf[ImageHeader::SIZE..])?;
        Ok((header, descriptor))
    }
}

/// Builder assembling a complete, valid image from a payload.
///
/// Used by the packer CLI and by tests; computes the payload digest and the
/// declared payload length.
#[derive(Debug, Clone, Default)]
pub struct ImageBuilder {
    pub chip_id: u16,
    pub chip_rev_min: u16,
    pub chip_rev_max: u16,
    pub version: String,
    pub project_name: String,
    pub build_date: String,
    pub build_time: String,
}

impl ImageBuilder {
    pub fn new(chip_id: u16) -> Self {
        Self {
            chip_id,
            ..Default::default()
        }
    }

    pub fn build(&self, payload: &[u8]) -> Vec<u8> {
        let header = ImageHeader {
            chip_id: self.chip_id,
            chip_rev_min: self.chip_rev_min,
            chip_rev_max: self.chip_rev_max,
            header_version: 1,
            payload_len: payload.len() as u32,
            flags: 0,
            reserved: 0,
        };
        let descriptor = ApplicationDescriptor {
            version: self.version.clone(),
            project_name: self.project_name.clone(),
            build_date: self.build_date.clone(),
            build_time: self.build_time.clone(),
            payload_sha256: Sha256::digest(payload).into(),
        };
        let mut image = Vec::with_capacity(HEADER_REGION_LEN + payload.len());
        image.extend_from_slice(&header.to_bytes());
        image.extend_from_slice(&descriptor.to_bytes());
        image.extend_from_slice(payload);
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_image(payload: &[u8]) -> Vec<u8> {
        let mut builder = ImageBuilder::new(3);
        builder.chip_rev_max = 10;
        builder.version = "0.9.0".into();
        builder.project_name = "sensor-node".into();
        builder.build(payload)
    }

    #[test]
    fn test_incremental_parse() {
        let image = sample_image(b"payload-bytes");
        let mut parser = ImageParser::new();

        // Byte-at-a-time feeding completes at exactly the region boundary.
        let mut fed = 0;
        for b in &image {
            if parser.is_complete() {
                break;
            }
            assert_eq!(parser.push(std::slice::from_ref(b)).unwrap(), 1);
            fed += 1;
        }
        assert_eq!(fed, HEADER_REGION_LEN);

        let (header, descriptor) = parser.finish().unwrap();
        assert_eq!(header.chip_id, 3);
        assert_eq!(header.payload_len, 13);
        assert_eq!(descriptor.version, "0.9.0");
        assert_eq!(descriptor.project_name, "sensor-node");
    }

    #[test]
    fn test_push_returns_surplus() {
        let image = sample_image(b"abcdef");
        let mut parser = ImageParser::new();
        let consumed = parser.push(&image).unwrap();
        assert_eq!(consumed, HEADER_REGION_LEN);
        assert!(parser.is_complete());
    }

    #[test]
    fn test_bad_magic_detected_early() {
        let mut parser = ImageParser::new();
        assert!(matches!(
            parser.push(b"NOPE"),
            Err(ImageError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_chip_check_from_prefix() {
        let image = sample_image(b"x");
        let mut parser = ImageParser::new();
        parser.push(&image[..CHIP_FIELDS_LEN]).unwrap();
        assert!(!parser.is_complete());

        let good = TargetInfo {
            chip_id: 3,
            chip_rev: 5,
        };
        assert!(parser.verify_chip(&good).is_ok());

        let bad = TargetInfo {
            chip_id: 4,
            chip_rev: 5,
        };
        assert!(matches!(
            parser.verify_chip(&bad),
            Err(ImageError::ChipMismatch { .. })
        ));
    }

    #[test]
    fn test_chip_check_needs_ten_bytes() {
        let image = sample_image(b"x");
        let mut parser = ImageParser::new();
        parser.push(&image[..8]).unwrap();
        let target = TargetInfo {
            chip_id: 3,
            chip_rev: 0,
        };
        assert!(matches!(
            parser.verify_chip(&target),
            Err(ImageError::TruncatedHeader { got: 8 })
        ));
    }

    #[test]
    fn test_built_digest_matches_payload() {
        let payload = b"firmware body".to_vec();
        let image = sample_image(&payload);
        let desc = ApplicationDescriptor::parse(
            &image[ImageHeader::SIZE..HEADER_REGION_LEN],
        )
        .unwrap();
        let expected: [u8; 32] = Sha256::digest(&payload).into();
        assert_eq!(desc.payload_sha256, expected);
    }
}
