//! Event system for UI decoupling.
//!
//! The engine publishes life-cycle events as values; subscribers never hand
//! state into the engine. Emission is best-effort: a missing or slow
//! subscriber cannot affect the update outcome.

use crate::image::ApplicationDescriptor;

/// Events emitted over the course of an update session.
#[derive(Debug, Clone)]
pub enum OtaEvent {
    /// Update session started.
    Started,
    /// HTTP(S) session established.
    Connected,
    /// Image header and application descriptor parsed.
    HeaderRead {
        /// Metadata of the incoming image.
        descriptor: ApplicationDescriptor,
    },
    /// Image chip id/revision verified against the running hardware.
    ChipVerified { chip_id: u16, chip_rev: u16 },
    /// Decrypt stage transformed one chunk.
    DecryptApplied {
        cipher_len: usize,
        plain_len: usize,
    },
    /// One chunk written to the target partition.
    FlashWrite { offset: u64, len: usize },
    /// Transfer progress update.
    Progress {
        bytes_read: u64,
        /// Declared image size; `None` for chunked transfers.
        total: Option<u64>,
    },
    /// The boot selector marked the target partition as next-boot.
    BootPartitionUpdated { label: String },
    /// Update completed, session released.
    Finished,
    /// Session released without switching the boot target.
    Aborted,
    /// Session failed.
    Error { message: String },
}

/// Observer trait for receiving update events.
///
/// Implement this in the UI or telemetry layer.
pub trait OtaObserver: Send + Sync {
    /// Called once per event, in emission order.
    fn on_event(&self, event: &OtaEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl OtaObserver for NullObserver {
    fn on_event(&self, _event: &OtaEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl OtaObserver for TracingObserver {
    fn on_event(&self, event: &OtaEvent) {
        match event {
            OtaEvent::Started => {
                tracing::info!("Update started");
            }
            OtaEvent::Connected => {
                tracing::info!("Connected to server");
            }
            OtaEvent::HeaderRead { descriptor } => {
                tracing::info!(
                    version = %descriptor.version,
                    project = %descriptor.project_name,
                    "Image header read"
                );
            }
            OtaEvent::ChipVerified { chip_id, chip_rev } => {
                tracing::info!(chip_id = chip_id, chip_rev = chip_rev, "Chip id verified");
            }
            OtaEvent::DecryptApplied {
                cipher_len,
                plain_len,
            } => {
                tracing::trace!(
                    cipher_len = cipher_len,
                    plain_len = plain_len,
                    "Decrypt stage applied"
                );
            }
            OtaEvent::FlashWrite { offset, len } => {
                tracing::trace!(offset = offset, len = len, "Flash write");
            }
            OtaEvent::Progress { bytes_read, total } => {
                let pct = total
                    .filter(|t| *t > 0)
                    .map(|t| (*bytes_read * 100) / t);
                match pct {
                    Some(pct) => {
                        tracing::debug!(bytes_read = bytes_read, progress = %format!("{pct}%"), "Progress")
                    }
                    None => tracing::debug!(bytes_read = bytes_read, "Progress"),
                }
            }
            OtaEvent::BootPartitionUpdated { label } => {
                tracing::info!(partition = %label, "Boot partition updated");
            }
            OtaEvent::Finished => {
                tracing::info!("Update finished");
            }
            OtaEvent::Aborted => {
                tracing::warn!("Update aborted");
            }
            OtaEvent::Error { message } => {
                tracing::error!("Update error: {}", message);
            }
        }
    }
}
