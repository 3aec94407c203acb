//! Flash storage layer: driver trait plus host-side implementations.

mod file;
mod mock;
mod traits;

pub use file::FileFlash;
pub use mock::MemoryFlash;
pub use traits::{FlashError, FlashStorage, SECTOR_SIZE};
