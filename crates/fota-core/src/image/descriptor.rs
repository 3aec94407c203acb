//! Application descriptor block.

use super::ImageError;

/// Metadata block following the image header (128 bytes).
///
/// Strings are NUL-padded fixed-width fields. Read-only after parsing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApplicationDescriptor {
    /// Firmware version string.
    pub version: String,
    /// Project name.
    pub project_name: String,
    /// Build date, `YYYY-MM-DD`.
    pub build_date: String,
    /// Build time, `HH:MM:SS`.
    pub build_time: String,
    /// SHA-256 digest of the image payload.
    pub payload_sha256: [u8; 32],
}

const VERSION_LEN: usize = 32;
const PROJECT_LEN: usize = 32;
const DATE_LEN: usize = 16;
const TIME_LEN: usize = 16;
const SHA_LEN: usize = 32;

impl ApplicationDescriptor {
    pub const SIZE: usize = VERSION_LEN + PROJECT_LEN + DATE_LEN + TIME_LEN + SHA_LEN;

    /// Parse a descriptor from the [`Self::SIZE`] bytes after the header.
    pub fn parse(data: &[u8]) -> Result<Self, ImageError> {
        if data.len() < Self::SIZE {
            return Err(ImageError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let version = read_str(&data[..VERSION_LEN]);
        let mut offset = VERSION_LEN;
        let project_name = read_str(&data[offset..offset + PROJECT_LEN]);
        offset += PROJECT_LEN;
        let build_date = read_str(&data[offset..offset + DATE_LEN]);
        offset += DATE_LEN;
        let build_time = read_str(&data[offset..offset + TIME_LEN]);
        offset += TIME_LEN;
        let mut payload_sha256 = [0u8; SHA_LEN];
        payload_sha256.copy_from_slice(&data[offset..offset + SHA_LEN]);
        Ok(Self {
            version,
            project_name,
            build_date,
            build_time,
            payload_sha256,
        })
    }

    /// Serialize to wire layout. Oversized strings are truncated to their
    /// field width.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        put_str(&mut buf, &self.version, VERSION_LEN);
        put_str(&mut buf, &self.project_name, PROJECT_LEN);
        put_str(&mut buf, &self.build_date, DATE_LEN);
        put_str(&mut buf, &self.build_time, TIME_LEN);
        buf.extend_from_slice(&self.payload_sha256);
        buf
    }
}

fn read_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn put_str(buf: &mut Vec<u8>, s: &str, len: usize) {
    let bytes = s.as_bytes();
    let take = bytes.len().min(len);
    buf.extend_from_slice(&bytes[..take]);
    buf.resize(buf.len() + (len - take), 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_roundtrip() {
        let desc = ApplicationDescriptor {
            version: "1.2.3".into(),
            project_name: "blinky".into(),
            build_date: "2025-11-02".into(),
            build_time: "12:30:00".into(),
            payload_sha256: [0xAB; 32],
        };
        let bytes = desc.to_bytes();
        assert_eq!(bytes.len(), ApplicationDescriptor::SIZE);

        let parsed = ApplicationDescriptor::parse(&bytes).unwrap();
        assert_eq!(parsed, desc);
    }

    #[test]
    fn test_oversized_field_truncated() {
        let desc = ApplicationDescriptor {
            version: "v".repeat(64),
            ..Default::default()
        };
        let bytes = desc.to_bytes();
        assert_eq!(bytes.len(), ApplicationDescriptor::SIZE);
        let parsed = ApplicationDescriptor::parse(&bytes).unwrap();
        assert_eq!(parsed.version.len(), 32);
    }

    #[test]
    fn test_short_buffer_rejected() {
        assert!(matches!(
            ApplicationDescriptor::parse(&[0u8; 10]),
            Err(ImageError::BufferTooSmall { .. })
        ));
    }
}
