//! In-memory flash for testing.

use std::sync::{Arc, Mutex};

use super::traits::{FlashError, FlashStorage, SECTOR_SIZE};

#[derive(Debug, Clone, Copy)]
enum Fault {
    Fail,
    Timeout,
}

struct Inner {
    data: Vec<u8>,
    erased: Vec<bool>,
    erase_count: usize,
    writes_left: Option<usize>,
    fault: Fault,
}

/// Memory-backed flash that enforces the erase-before-write contract.
///
/// Clones share the same backing store, so a test can keep a handle while the
/// session owns a boxed clone. Supports write-failure injection.
#[derive(Clone)]
pub struct MemoryFlash {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryFlash {
    /// Create a device of `capacity` bytes, rounded up to a whole sector.
    pub fn new(capacity: usize) -> Self {
        let sectors = capacity.div_ceil(SECTOR_SIZE).max(1);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                data: vec![0u8; sectors * SECTOR_SIZE],
                erased: vec![false; sectors],
                erase_count: 0,
                writes_left: None,
                fault: Fault::Fail,
            })),
        }
    }

    /// Make the `n+1`-th write (and all later ones) fail.
    pub fn fail_writes_after(&self, n: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.writes_left = Some(n);
        inner.fault = Fault::Fail;
    }

    /// Make the `n+1`-th write (and all later ones) time out.
    pub fn timeout_writes_after(&self, n: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.writes_left = Some(n);
        inner.fault = Fault::Timeout;
    }

    /// Number of sector erases performed so far.
    pub fn erase_count(&self) -> usize {
        self.inner.lock().unwrap().erase_count
    }

    /// Snapshot of the first `len` bytes of the device.
    pub fn contents(&self, len: usize) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        inner.data[..len.min(inner.data.len())].to_vec()
    }
}

impl FlashStorage for MemoryFlash {
    fn capacity(&self) -> u64 {
        self.inner.lock().unwrap().data.len() as u64
    }

    fn erase_sector(&mut self, sector: u32) -> Result<(), FlashError> {
        let mut inner = self.inner.lock().unwrap();
        let start = sector as usize * SECTOR_SIZE;
        if start >= inner.data.len() {
            return Err(FlashError::OutOfBounds {
                offset: start as u64,
                len: SECTOR_SIZE,
                capacity: inner.data.len() as u64,
            });
        }
        inner.data[start..start + SECTOR_SIZE].fill(0xFF);
        inner.erased[sector as usize] = true;
        inner.erase_count += 1;
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), FlashError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(left) = inner.writes_left {
            if left == 0 {
                return Err(match inner.fault {
                    Fault::Fail => FlashError::OpFailed("injected write failure".into()),
                    Fault::Timeout => FlashError::Timeout { timeout_ms: 3000 },
                });
            }
            inner.writes_left = Some(left - 1);
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > inner.data.len() {
            return Err(FlashError::OutOfBounds {
                offset,
                len: data.len(),
                capacity: inner.data.len() as u64,
            });
        }
        let first = start / SECTOR_SIZE;
        let last = (end.max(start + 1) - 1) / SECTOR_SIZE;
        for sector in first..=last {
            if !inner.erased[sector] {
                return Err(FlashError::NotErased {
                    sector: sector as u32,
                });
            }
        }
        inner.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), FlashError> {
        let inner = self.inner.lock().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if end > inner.data.len() {
            return Err(FlashError::OutOfBounds {
                offset,
                len: buf.len(),
                capacity: inner.data.len() as u64,
            });
        }
        buf.copy_from_slice(&inner.data[start..end]);
        Ok(())
    }
}
