//! FOTA-Core: firmware-over-HTTPS update engine.
//!
//! This crate streams a firmware image over HTTP(S), validates it, writes it
//! incrementally into an inactive storage partition and atomically switches
//! the boot target so the next restart runs the new image.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Transport**: HTTP(S) byte-stream abstraction (reqwest, mock)
//! - **Image**: header/descriptor format and incremental parser
//! - **Flash**: partition storage abstraction (memory, file)
//! - **Writer**: sequential erase-before-write partition writer
//! - **Boot**: boot-layout resolution and next-boot selection
//! - **Events**: observer pattern for UI decoupling
//! - **Session**: the life-cycle state machine driving it all
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use fota_core::boot::StaticBootLayout;
//! use fota_core::flash::FileFlash;
//! use fota_core::session::{OtaConfig, OtaProgress, UpdateSession};
//! use fota_core::transport::HttpClientTransport;
//!
//! let config = OtaConfig::default();
//! let transport =
//!     HttpClientTransport::new("https://updates.example/fw.bin", Duration::from_secs(30))
//!         .expect("transport");
//! let flash = FileFlash::create("ota_1.bin", 512 * 1024).expect("flash");
//! let boot = StaticBootLayout::two_slot(512 * 1024);
//!
//! let mut session =
//!     UpdateSession::begin(config, transport, Box::new(flash), Box::new(boot)).expect("begin");
//! while session.perform().expect("perform") == OtaProgress::Continue {
//!     // interleave other duties here
//! }
//! session.finish().expect("finish");
//! ```

pub mod boot;
pub mod decrypt;
pub mod error;
pub mod events;
pub mod flash;
pub mod image;
pub mod phase;
pub mod session;
pub mod transport;
pub mod writer;

// Re-exports for convenience
pub use boot::{BootError, BootSelector, Partition, StaticBootLayout};
pub use decrypt::{DecryptError, DecryptStage};
pub use error::OtaError;
pub use events::{NullObserver, OtaEvent, OtaObserver, TracingObserver};
pub use flash::{FileFlash, FlashError, FlashStorage, MemoryFlash, SECTOR_SIZE};
pub use image::{
    ApplicationDescriptor, HEADER_REGION_LEN, ImageBuilder, ImageError, ImageHeader, ImageParser,
    TargetInfo,
};
pub use phase::Phase;
pub use session::{HttpSettings, OtaConfig, OtaProgress, PostConnectHook, UpdateSession};
pub use transport::{HttpClientTransport, HttpTransport, MockTransport, TransportError};
