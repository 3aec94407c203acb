//! File-backed flash for the host-side CLI harness.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::traits::{FlashError, FlashStorage, SECTOR_SIZE};

/// Partition image stored in a regular file.
///
/// Erase state is tracked in memory only; a fresh `FileFlash` starts with
/// every sector un-erased, matching a new update session.
pub struct FileFlash {
    file: File,
    capacity: u64,
    erased: Vec<bool>,
}

impl FileFlash {
    /// Create (or truncate) a partition image of `capacity` bytes, rounded
    /// up to a whole sector.
    pub fn create<P: AsRef<Path>>(path: P, capacity: u64) -> Result<Self, FlashError> {
        let sectors = capacity.div_ceil(SECTOR_SIZE as u64).max(1);
        let capacity = sectors * SECTOR_SIZE as u64;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(capacity)?;
        Ok(Self {
            file,
            capacity,
            erased: vec![false; sectors as usize],
        })
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<(), FlashError> {
        if offset + len as u64 > self.capacity {
            return Err(FlashError::OutOfBounds {
                offset,
                len,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

impl FlashStorage for FileFlash {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn erase_sector(&mut self, sector: u32) -> Result<(), FlashError> {
        let offset = sector as u64 * SECTOR_SIZE as u64;
        self.check_bounds(offset, SECTOR_SIZE)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&[0xFF; SECTOR_SIZE])?;
        self.erased[sector as usize] = true;
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), FlashError> {
        self.check_bounds(offset, data.len())?;
        let first = offset / SECTOR_SIZE as u64;
        let last = (offset + data.len().max(1) as u64 - 1) / SECTOR_SIZE as u64;
        for sector in first..=last {
            if !self.erased[sector as usize] {
                return Err(FlashError::NotErased {
                    sector: sector as u32,
                });
            }
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), FlashError> {
        self.check_bounds(offset, buf.len())?;
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_flash_roundtrip() {
        let dir = std::env::temp_dir().join("fota-fileflash-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("part.bin");

        let mut flash = FileFlash::create(&path, 8192).unwrap();
        assert_eq!(flash.capacity(), 8192);

        assert!(matches!(
            flash.write(0, b"data"),
            Err(FlashError::NotErased { sector: 0 })
        ));

        flash.erase_sector(0).unwrap();
        flash.write(16, b"data").unwrap();

        let mut buf = [0u8; 4];
        flash.read(16, &mut buf).unwrap();
        assert_eq!(&buf, b"data");

        std::fs::remove_file(&path).unwrap();
    }
}
