//! Sequential, append-only partition writer.

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::boot::Partition;
use crate::error::OtaError;
use crate::flash::{FlashError, FlashStorage};
use crate::image::{ApplicationDescriptor, HEADER_REGION_LEN, ImageError, ImageHeader};

/// Owns the target partition for the lifetime of one session.
///
/// Invariant: no sector is programmed before it was erased at least once in
/// this session. With bulk erase disabled, erase happens lazily per sector
/// immediately before that sector's first write, which bounds the worst-case
/// stall of a single `perform` call.
pub struct PartitionWriter {
    flash: Box<dyn FlashStorage>,
    partition: Partition,
    cursor: u64,
    erased: Vec<bool>,
}

impl PartitionWriter {
    pub fn new(flash: Box<dyn FlashStorage>, partition: Partition) -> Result<Self, OtaError> {
        if partition.size > flash.capacity() {
            return Err(OtaError::InvalidArgument(
                "partition larger than its storage device",
            ));
        }
        let sectors = partition.size.div_ceil(flash.sector_size() as u64) as usize;
        Ok(Self {
            flash,
            partition,
            cursor: 0,
            erased: vec![false; sectors],
        })
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Bytes appended so far; doubles as the write cursor.
    pub fn bytes_written(&self) -> u64 {
        self.cursor
    }

    /// Erase the whole partition up front.
    pub fn bulk_erase(&mut self) -> Result<(), FlashError> {
        debug!(partition = %self.partition.label, sectors = self.erased.len(), "Bulk erase");
        for sector in 0..self.erased.len() {
            self.erase_if_needed(sector)?;
        }
        Ok(())
    }

    fn erase_if_needed(&mut self, sector: usize) -> Result<(), FlashError> {
        if !self.erased[sector] {
            self.flash.erase_sector(sector as u32)?;
            self.erased[sector] = true;
        }
        Ok(())
    }

    /// Append one chunk at the cursor, erasing covered sectors on demand.
    pub fn write(&mut self, data: &[u8]) -> Result<(), FlashError> {
        if data.is_empty() {
            return Ok(());
        }
        if self.cursor + data.len() as u64 > self.partition.size {
            return Err(FlashError::OutOfBounds {
                offset: self.cursor,
                len: data.len(),
                capacity: self.partition.size,
            });
        }
        let sector_size = self.flash.sector_size() as u64;
        let first = (self.cursor / sector_size) as usize;
        let last = ((self.cursor + data.len() as u64 - 1) / sector_size) as usize;
        for sector in first..=last {
            self.erase_if_needed(sector)?;
        }
        self.flash.write(self.cursor, data)?;
        self.cursor += data.len() as u64;
        Ok(())
    }

    /// Re-verify the completed image independently of per-chunk work.
    ///
    /// Checks the written length against the header's declared payload
    /// length, then recomputes the payload digest from flash and compares it
    /// with the descriptor.
    pub fn validate(
        &self,
        header: &ImageHeader,
        descriptor: &ApplicationDescriptor,
    ) -> Result<(), OtaError> {
        let expected = HEADER_REGION_LEN as u64 + header.payload_len as u64;
        if self.cursor != expected {
            return Err(ImageError::LengthMismatch {
                declared: expected,
                actual: self.cursor,
            }
            .into());
        }

        let mut hasher = Sha256::new();
        let mut offset = HEADER_REGION_LEN as u64;
        let mut buf = [0u8; 4096];
        while offset < self.cursor {
            let n = ((self.cursor - offset) as usize).min(buf.len());
            self.flash
                .read(offset, &mut buf[..n])
                .map_err(OtaError::from)?;
            hasher.update(&buf[..n]);
            offset += n as u64;
        }
        let digest: [u8; 32] = hasher.finalize().into();
        if digest != descriptor.payload_sha256 {
            return Err(ImageError::DigestMismatch.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::{MemoryFlash, SECTOR_SIZE};
    use crate::image::ImageBuilder;

    fn writer_over(flash: &MemoryFlash, size: u64) -> PartitionWriter {
        PartitionWriter::new(
            Box::new(flash.clone()),
            Partition {
                label: "ota_1".into(),
                size,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_lazy_erase_per_sector() {
        let flash = MemoryFlash::new(4 * SECTOR_SIZE);
        let mut writer = writer_over(&flash, 4 * SECTOR_SIZE as u64);

        writer.write(&[1u8; 100]).unwrap();
        assert_eq!(flash.erase_count(), 1);

        // Stays inside sector 0, no further erase.
        writer.write(&[2u8; 100]).unwrap();
        assert_eq!(flash.erase_count(), 1);

        // Crossing into sector 1 erases exactly one more.
        writer.write(&[3u8; SECTOR_SIZE]).unwrap();
        assert_eq!(flash.erase_count(), 2);
    }

    #[test]
    fn test_bulk_erase_once() {
        let flash = MemoryFlash::new(4 * SECTOR_SIZE);
        let mut writer = writer_over(&flash, 4 * SECTOR_SIZE as u64);
        writer.bulk_erase().unwrap();
        assert_eq!(flash.erase_count(), 4);

        writer.write(&[9u8; 2 * SECTOR_SIZE]).unwrap();
        assert_eq!(flash.erase_count(), 4);
    }

    #[test]
    fn test_capacity_enforced() {
        let flash = MemoryFlash::new(SECTOR_SIZE);
        let mut writer = writer_over(&flash, SECTOR_SIZE as u64);
        writer.write(&[0u8; SECTOR_SIZE]).unwrap();
        assert!(matches!(
            writer.write(&[0u8; 1]),
            Err(FlashError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_validate_roundtrip() {
        let payload = vec![0x5A; 9000];
        let image = ImageBuilder::new(1).build(&payload);
        let (header, descriptor) = {
            let mut parser = crate::image::ImageParser::new();
            parser.push(&image).unwrap();
            parser.finish().unwrap()
        };

        let flash = MemoryFlash::new(4 * SECTOR_SIZE);
        let mut writer = writer_over(&flash, 4 * SECTOR_SIZE as u64);
        writer.write(&image).unwrap();
        writer.validate(&header, &descriptor).unwrap();
    }

    #[test]
    fn test_validate_rejects_short_image() {
        let payload = vec![0x5A; 4000];
        let image = ImageBuilder::new(1).build(&payload);
        let (header, descriptor) = {
            let mut parser = crate::image::ImageParser::new();
            parser.push(&image).unwrap();
            parser.finish().unwrap()
        };

        let flash = MemoryFlash::new(2 * SECTOR_SIZE);
        let mut writer = writer_over(&flash, 2 * SECTOR_SIZE as u64);
        writer.write(&image[..image.len() - 10]).unwrap();
        assert!(matches!(
            writer.validate(&header, &descriptor),
            Err(OtaError::ImageValidationFailed(_))
        ));
    }

    #[test]
    fn test_validate_rejects_corrupt_payload() {
        let payload = vec![0x11; 5000];
        let mut image = ImageBuilder::new(1).build(&payload);
        let (header, descriptor) = {
            let mut parser = crate::image::ImageParser::new();
            parser.push(&image).unwrap();
            parser.finish().unwrap()
        };

        let len = image.len();
        image[len - 1] ^= 0xFF;

        let flash = MemoryFlash::new(2 * SECTOR_SIZE);
        let mut writer = writer_over(&flash, 2 * SECTOR_SIZE as u64);
        writer.write(&image).unwrap();
        assert!(matches!(
            writer.validate(&header, &descriptor),
            Err(OtaError::ImageValidationFailed(_))
        ));
    }
}
