//! Update session - orchestrator of the firmware download pipeline.
//!
//! A session owns the transport, the target partition and the boot selector
//! for its whole lifetime. The caller drives it cooperatively: `begin`, then
//! `perform` in a loop until [`OtaProgress::Done`], then `finish`. Any
//! failure during `begin` or `perform` tears the session down completely;
//! the boot target is only ever touched by a successful `finish`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::boot::{BootSelector, Partition};
use crate::decrypt::DecryptStage;
use crate::error::OtaError;
use crate::events::{OtaEvent, OtaObserver, TracingObserver};
use crate::flash::FlashStorage;
use crate::image::{
    ApplicationDescriptor, HEADER_REGION_LEN, ImageError, ImageHeader, ImageParser, TargetInfo,
};
use crate::phase::Phase;
use crate::transport::{HttpTransport, TransportError};
use crate::writer::PartitionWriter;

/// Outcome of one `perform` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaProgress {
    /// More image bytes remain; call `perform` again.
    Continue,
    /// All image data received and written.
    Done,
}

/// Hook invoked once after the transport connected, before any read.
pub type PostConnectHook =
    Box<dyn FnMut(&mut dyn HttpTransport) -> Result<(), TransportError> + Send>;

/// Transport-facing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Per-operation timeout handed to the transport implementation.
    pub timeout_ms: u64,
    /// The engine is strictly synchronous; `true` is rejected by `begin`.
    pub nonblocking: bool,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            nonblocking: false,
        }
    }
}

/// Configuration for an update session.
#[derive(Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    /// Transport settings.
    pub http: HttpSettings,
    /// Identity of the running hardware, checked against the image header.
    pub target: TargetInfo,
    /// Explicit target partition; resolved from the boot layout when absent.
    pub update_partition: Option<Partition>,
    /// Erase the whole partition during `begin` instead of lazily per sector.
    pub bulk_flash_erase: bool,
    /// Download the image over successive ranged requests.
    pub partial_http_download: bool,
    /// Window cap for partial download, in bytes.
    pub max_http_request_size: u32,
    /// Chunk buffer size; bounds the work done by one `perform` call.
    pub buffer_size: usize,
    /// Optional external decryption layer.
    #[serde(skip)]
    pub decrypt: Option<Box<dyn DecryptStage>>,
    /// Optional customization hook run once after transport setup.
    #[serde(skip)]
    pub post_connect: Option<PostConnectHook>,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            http: HttpSettings::default(),
            target: TargetInfo::default(),
            update_partition: None,
            bulk_flash_erase: false,
            partial_http_download: false,
            max_http_request_size: 16 * 1024,
            buffer_size: 4096,
            decrypt: None,
            post_connect: None,
        }
    }
}

impl fmt::Debug for OtaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtaConfig")
            .field("http", &self.http)
            .field("target", &self.target)
            .field("update_partition", &self.update_partition)
            .field("bulk_flash_erase", &self.bulk_flash_erase)
            .field("partial_http_download", &self.partial_http_download)
            .field("max_http_request_size", &self.max_http_request_size)
            .field("buffer_size", &self.buffer_size)
            .field("decrypt", &self.decrypt.is_some())
            .field("post_connect", &self.post_connect.is_some())
            .finish()
    }
}

impl OtaConfig {
    /// Load configuration from a TOML file. Hooks cannot be persisted and
    /// start out unset.
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, OtaError> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| OtaError::InvalidArgument("config file not readable"))?;
        toml::from_str(&content).map_err(|_| OtaError::InvalidArgument("malformed config file"))
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), OtaError> {
        let content = toml::to_string_pretty(self)
            .map_err(|_| OtaError::InvalidArgument("config not serializable"))?;
        std::fs::write(path, content)
            .map_err(|_| OtaError::InvalidArgument("config file not writable"))
    }

    fn validate(&self) -> Result<(), OtaError> {
        if self.http.nonblocking {
            return Err(OtaError::InvalidArgument(
                "transport must be synchronous/blocking",
            ));
        }
        if self.buffer_size == 0 {
            return Err(OtaError::InvalidArgument("buffer_size must be non-zero"));
        }
        if self.partial_http_download && (self.max_http_request_size as usize) < HEADER_REGION_LEN {
            return Err(OtaError::InvalidArgument(
                "max_http_request_size smaller than the image header region",
            ));
        }
        Ok(())
    }
}

/// One firmware update in flight.
///
/// Exclusively owned by the driving thread; none of the methods may be
/// invoked concurrently on the same session.
pub struct UpdateSession<T: HttpTransport, O: OtaObserver = TracingObserver> {
    config: OtaConfig,
    phase: Phase,
    transport: Option<T>,
    writer: PartitionWriter,
    boot: Box<dyn BootSelector>,
    observer: Arc<O>,
    parser: ImageParser,
    header: Option<ImageHeader>,
    descriptor: Option<ApplicationDescriptor>,
    decrypt: Option<Box<dyn DecryptStage>>,
    /// Chunk buffer, reused across `perform` calls.
    buf: Vec<u8>,
    /// Cumulative raw bytes consumed from the transport.
    bytes_read: u64,
    /// Declared image size; `None` for chunked transfers.
    total_size: Option<u64>,
    eof_seen: bool,
    chip_verified: bool,
    header_flushed: bool,
    /// Surplus plaintext read past the header region during `begin`.
    pending_body: Vec<u8>,
    /// Exclusive end of the current partial-download window.
    window_end: u64,
    window_retry_used: bool,
}

impl<T: HttpTransport> UpdateSession<T, TracingObserver> {
    /// Start an update session with the default tracing observer.
    pub fn begin(
        config: OtaConfig,
        transport: T,
        flash: Box<dyn FlashStorage>,
        boot: Box<dyn BootSelector>,
    ) -> Result<Self, OtaError> {
        Self::begin_with_observer(config, transport, flash, boot, Arc::new(TracingObserver))
    }
}

impl<T: HttpTransport, O: OtaObserver> UpdateSession<T, O> {
    /// Start an update session with a custom observer.
    ///
    /// Validates the configuration, resolves the target partition, connects
    /// the transport and buffers the image header region. On any failure the
    /// session is fully torn down and nothing is returned.
    #[instrument(skip_all)]
    pub fn begin_with_observer(
        mut config: OtaConfig,
        transport: T,
        flash: Box<dyn FlashStorage>,
        boot: Box<dyn BootSelector>,
        observer: Arc<O>,
    ) -> Result<Self, OtaError> {
        config.validate()?;

        let partition = match config.update_partition.clone() {
            Some(partition) => partition,
            None => boot.next_update_partition()?,
        };
        info!(partition = %partition.label, size = partition.size, "Update partition selected");
        let writer = PartitionWriter::new(flash, partition)?;

        let mut buf = Vec::new();
        buf.try_reserve_exact(config.buffer_size)
            .map_err(|_| OtaError::NoMemory)?;
        buf.resize(config.buffer_size, 0);

        let decrypt = config.decrypt.take();
        let mut post_connect = config.post_connect.take();

        let mut session = Self {
            config,
            phase: Phase::Init,
            transport: Some(transport),
            writer,
            boot,
            observer,
            parser: ImageParser::new(),
            header: None,
            descriptor: None,
            decrypt,
            buf,
            bytes_read: 0,
            total_size: None,
            eof_seen: false,
            chip_verified: false,
            header_flushed: false,
            pending_body: Vec::new(),
            window_end: 0,
            window_retry_used: false,
        };
        session.emit(OtaEvent::Started);

        match session.connect_and_read_header(post_connect.as_mut()) {
            Ok(()) => Ok(session),
            Err(err) => {
                session.teardown(&err);
                Err(err)
            }
        }
    }

    /// Pull one bounded chunk through the pipeline.
    ///
    /// The first call verifies chip compatibility (exactly once, before any
    /// flash work in lazy-erase mode) and flushes the buffered header region
    /// to the partition. Subsequent calls append one body chunk each.
    /// Returns [`OtaProgress::Continue`] while bytes remain.
    pub fn perform(&mut self) -> Result<OtaProgress, OtaError> {
        if !self.phase.can_read() {
            return Err(OtaError::InvalidState { phase: self.phase });
        }
        match self.perform_step() {
            Ok(progress) => Ok(progress),
            Err(err) => {
                self.teardown(&err);
                Err(err)
            }
        }
    }

    /// Parsed image metadata. `InvalidState` before the header was read.
    pub fn image_descriptor(&self) -> Result<&ApplicationDescriptor, OtaError> {
        if self.phase.is_terminal() {
            return Err(OtaError::InvalidState { phase: self.phase });
        }
        self.descriptor
            .as_ref()
            .ok_or(OtaError::InvalidState { phase: self.phase })
    }

    /// Check if the full image was received.
    ///
    /// For unknown-length (chunked) transfers this is true only once
    /// end-of-stream was observed.
    pub fn is_complete(&self) -> bool {
        match self.total_size {
            Some(total) => self.bytes_read >= total,
            None => self.eof_seen,
        }
    }

    /// Raw image bytes consumed from the transport so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Declared image size; `None` for chunked transfers.
    pub fn image_size(&self) -> Option<u64> {
        self.total_size
    }

    /// Current life-cycle phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Validate the completed image and switch the boot target.
    ///
    /// Validation recomputes the payload digest over the written partition
    /// range, independently of per-chunk work. Only when it passes is the
    /// boot selector invoked; on failure the previously active partition
    /// stays bootable and the session is released without commit.
    pub fn finish(&mut self) -> Result<(), OtaError> {
        if self.phase.is_terminal() || self.phase == Phase::Init {
            return Err(OtaError::InvalidState { phase: self.phase });
        }
        match self.finish_step() {
            Ok(()) => Ok(()),
            Err(err) => {
                self.teardown(&err);
                Err(err)
            }
        }
    }

    /// Release the transport and the session without touching the boot
    /// target. Legal from any non-terminal phase.
    pub fn abort(&mut self) -> Result<(), OtaError> {
        if self.phase.is_terminal() {
            return Err(OtaError::InvalidState { phase: self.phase });
        }
        self.close_transport();
        self.goto_phase(Phase::Aborted);
        self.emit(OtaEvent::Aborted);
        Ok(())
    }

    /// Drive the whole update in one call: `perform` until done, then
    /// `finish`.
    #[instrument(skip_all)]
    pub fn run(mut self) -> Result<(), OtaError> {
        while self.perform()? == OtaProgress::Continue {}
        self.finish()
    }

    fn emit(&self, event: OtaEvent) {
        self.observer.on_event(&event);
    }

    fn goto_phase(&mut self, next: Phase) {
        debug!(from = %self.phase, to = %next, "Phase transition");
        self.phase = next;
    }

    fn close_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
    }

    fn teardown(&mut self, err: &OtaError) {
        warn!(error = %err, phase = %self.phase, "Session torn down");
        self.emit(OtaEvent::Error {
            message: err.to_string(),
        });
        self.close_transport();
        self.goto_phase(Phase::Aborted);
    }

    fn connect_and_read_header(
        &mut self,
        post_connect: Option<&mut PostConnectHook>,
    ) -> Result<(), OtaError> {
        let partial = self.config.partial_http_download;
        let initial_range = if partial {
            Some((0u64, self.config.max_http_request_size as u64))
        } else {
            None
        };
        if let Some(transport) = self.transport.as_mut() {
            transport.connect(initial_range)?;
        }
        if let Some(hook) = post_connect {
            if let Some(transport) = self.transport.as_mut() {
                hook(transport)?;
            }
        }
        self.goto_phase(Phase::Connected);
        self.emit(OtaEvent::Connected);

        self.total_size = self.transport.as_ref().and_then(|t| t.total_len());
        if partial {
            let requested = self.config.max_http_request_size as u64;
            self.window_end = match self.total_size {
                Some(total) => requested.min(total),
                None => requested,
            };
        }

        // Buffer the header region. A stream that ends early but still
        // carries the chip-compatibility fields is left for `perform` to
        // judge, so the chip check stays the first validation failure.
        while !self.parser.is_complete() {
            let n = self.read_chunk()?;
            if n == 0 {
                self.eof_seen = true;
                break;
            }
            self.consume_into_header(n)?;
        }

        if self.parser.is_complete() {
            let (header, descriptor) = self.parser.finish()?;
            self.header = Some(header);
            self.descriptor = Some(descriptor.clone());
            self.goto_phase(Phase::HeaderRead);
            self.emit(OtaEvent::HeaderRead { descriptor });
        } else if self.parser.has_chip_fields() {
            warn!(
                got = self.parser.buffered().len(),
                "Stream ended inside the header region"
            );
        } else {
            return Err(ImageError::TruncatedHeader {
                got: self.parser.buffered().len(),
            }
            .into());
        }

        if self.config.bulk_flash_erase {
            self.writer.bulk_erase()?;
        }
        Ok(())
    }

    /// Decrypt one raw chunk (if configured) and feed it to the parser;
    /// surplus plaintext past the header region is kept for the first body
    /// write.
    fn consume_into_header(&mut self, n: usize) -> Result<(), OtaError> {
        match self.decrypt.as_mut() {
            Some(stage) => {
                let plain = stage.decrypt(&self.buf[..n])?;
                self.emit(OtaEvent::DecryptApplied {
                    cipher_len: n,
                    plain_len: plain.len(),
                });
                let consumed = self.parser.push(&plain)?;
                self.pending_body.extend_from_slice(&plain[consumed..]);
            }
            None => {
                let consumed = self.parser.push(&self.buf[..n])?;
                self.pending_body.extend_from_slice(&self.buf[consumed..n]);
            }
        }
        Ok(())
    }

    fn perform_step(&mut self) -> Result<OtaProgress, OtaError> {
        if !self.chip_verified {
            let target = self.config.target;
            self.parser.verify_chip(&target)?;
            self.chip_verified = true;
            self.emit(OtaEvent::ChipVerified {
                chip_id: target.chip_id,
                chip_rev: target.chip_rev,
            });
        }

        // `begin` only leaves the session in `Connected` when the stream
        // ended inside the header region.
        if self.phase == Phase::Connected {
            return Err(ImageError::TruncatedHeader {
                got: self.parser.buffered().len(),
            }
            .into());
        }

        if !self.header_flushed {
            let header_bytes = self.parser.buffered().to_vec();
            self.writer.write(&header_bytes)?;
            self.emit(OtaEvent::FlashWrite {
                offset: 0,
                len: header_bytes.len(),
            });
            let surplus = std::mem::take(&mut self.pending_body);
            if !surplus.is_empty() {
                let offset = self.writer.bytes_written();
                self.writer.write(&surplus)?;
                self.emit(OtaEvent::FlashWrite {
                    offset,
                    len: surplus.len(),
                });
            }
            self.header_flushed = true;
            self.goto_phase(Phase::Reading);
            self.emit(OtaEvent::Progress {
                bytes_read: self.bytes_read,
                total: self.total_size,
            });
            return self.completion_check();
        }

        let n = self.read_chunk()?;
        if n == 0 {
            self.eof_seen = true;
            if let Some(total) = self.total_size {
                if self.bytes_read < total {
                    return Err(OtaError::ConnectionFailed(format!(
                        "stream ended at {} of {} bytes",
                        self.bytes_read, total
                    )));
                }
            }
            self.goto_phase(Phase::DataComplete);
            return Ok(OtaProgress::Done);
        }

        let offset = self.writer.bytes_written();
        let written;
        match self.decrypt.as_mut() {
            Some(stage) => {
                let plain = stage.decrypt(&self.buf[..n])?;
                self.emit(OtaEvent::DecryptApplied {
                    cipher_len: n,
                    plain_len: plain.len(),
                });
                self.writer.write(&plain)?;
                written = plain.len();
            }
            None => {
                self.writer.write(&self.buf[..n])?;
                written = n;
            }
        }
        self.emit(OtaEvent::FlashWrite {
            offset,
            len: written,
        });
        self.emit(OtaEvent::Progress {
            bytes_read: self.bytes_read,
            total: self.total_size,
        });
        self.completion_check()
    }

    fn completion_check(&mut self) -> Result<OtaProgress, OtaError> {
        if let Some(total) = self.total_size {
            if self.bytes_read >= total {
                self.goto_phase(Phase::DataComplete);
                return Ok(OtaProgress::Done);
            }
        }
        Ok(OtaProgress::Continue)
    }

    /// Read one raw chunk, advancing the partial-download window as needed.
    ///
    /// A dropped connection is retried once per window by re-issuing the
    /// current range from the last confirmed byte; committed bytes are never
    /// re-requested.
    fn read_chunk(&mut self) -> Result<usize, OtaError> {
        let partial = self.config.partial_http_download;
        if partial && self.bytes_read == self.window_end {
            if let Some(total) = self.total_size {
                if self.bytes_read >= total {
                    return Ok(0);
                }
            }
            let len = match self.total_size {
                Some(total) => {
                    (total - self.bytes_read).min(self.config.max_http_request_size as u64)
                }
                None => self.config.max_http_request_size as u64,
            };
            let Some(transport) = self.transport.as_mut() else {
                return Err(OtaError::InvalidState { phase: self.phase });
            };
            transport.request_range(self.bytes_read, len)?;
            self.window_end = self.bytes_read + len;
            self.window_retry_used = false;
        }

        let cap = if partial {
            self.buf.len().min((self.window_end - self.bytes_read) as usize)
        } else {
            self.buf.len()
        };

        loop {
            let Some(transport) = self.transport.as_mut() else {
                return Err(OtaError::InvalidState { phase: self.phase });
            };
            match transport.read(&mut self.buf[..cap]) {
                Ok(n) => {
                    self.bytes_read += n as u64;
                    return Ok(n);
                }
                Err(err) => {
                    if partial && !self.window_retry_used {
                        self.window_retry_used = true;
                        warn!(
                            error = %err,
                            offset = self.bytes_read,
                            "Stream dropped, re-issuing current range"
                        );
                        let len = self.window_end - self.bytes_read;
                        transport.request_range(self.bytes_read, len)?;
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }
    }

    fn finish_step(&mut self) -> Result<(), OtaError> {
        let (header, descriptor) = match (self.header, self.descriptor.clone()) {
            (Some(header), Some(descriptor)) => (header, descriptor),
            _ => {
                return Err(ImageError::TruncatedHeader {
                    got: self.parser.buffered().len(),
                }
                .into());
            }
        };
        self.writer.validate(&header, &descriptor)?;

        let partition = self.writer.partition().clone();
        self.boot.set_next_boot(&partition)?;
        self.emit(OtaEvent::BootPartitionUpdated {
            label: partition.label.clone(),
        });
        info!(partition = %partition.label, version = %descriptor.version, "Boot target switched");

        self.close_transport();
        self.goto_phase(Phase::Finished);
        self.emit(OtaEvent::Finished);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::StaticBootLayout;
    use crate::decrypt::DecryptError;
    use crate::events::NullObserver;
    use crate::flash::{MemoryFlash, SECTOR_SIZE};
    use crate::image::ImageBuilder;
    use crate::transport::MockTransport;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    const CHIP: u16 = 5;
    const SLOT: u64 = 512 * 1024;

    fn test_image(payload_len: usize) -> Vec<u8> {
        image_for_chip(CHIP, payload_len)
    }

    fn image_for_chip(chip_id: u16, payload_len: usize) -> Vec<u8> {
        let payload: Vec<u8> = (0..payload_len).map(|i| (i % 251) as u8).collect();
        let mut builder = ImageBuilder::new(chip_id);
        builder.chip_rev_max = 10;
        builder.version = "2.0.1".into();
        builder.project_name = "relay-fw".into();
        builder.build(&payload)
    }

    fn test_config() -> OtaConfig {
        OtaConfig {
            target: TargetInfo {
                chip_id: CHIP,
                chip_rev: 1,
            },
            ..Default::default()
        }
    }

    struct Rig {
        transport: MockTransport,
        flash: MemoryFlash,
        boot: StaticBootLayout,
    }

    fn rig(image: Vec<u8>) -> Rig {
        Rig {
            transport: MockTransport::new(image),
            flash: MemoryFlash::new(SLOT as usize),
            boot: StaticBootLayout::two_slot(SLOT),
        }
    }

    fn begin(
        config: OtaConfig,
        rig: &Rig,
    ) -> Result<UpdateSession<MockTransport, NullObserver>, OtaError> {
        UpdateSession::begin_with_observer(
            config,
            rig.transport.clone(),
            Box::new(rig.flash.clone()),
            Box::new(rig.boot.clone()),
            Arc::new(NullObserver),
        )
    }

    fn drive<O: OtaObserver>(session: &mut UpdateSession<MockTransport, O>) {
        for _ in 0..100_000 {
            if session.perform().unwrap() == OtaProgress::Done {
                return;
            }
        }
        panic!("perform loop did not terminate");
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<&'static str>>,
    }

    impl RecordingObserver {
        fn names(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().clone()
        }
    }

    impl OtaObserver for RecordingObserver {
        fn on_event(&self, event: &OtaEvent) {
            let name = match event {
                OtaEvent::Started => "started",
                OtaEvent::Connected => "connected",
                OtaEvent::HeaderRead { .. } => "header-read",
                OtaEvent::ChipVerified { .. } => "chip-verified",
                OtaEvent::DecryptApplied { .. } => "decrypt",
                OtaEvent::FlashWrite { .. } => "flash-write",
                OtaEvent::Progress { .. } => "progress",
                OtaEvent::BootPartitionUpdated { .. } => "boot-updated",
                OtaEvent::Finished => "finished",
                OtaEvent::Aborted => "aborted",
                OtaEvent::Error { .. } => "error",
            };
            self.events.lock().unwrap().push(name);
        }
    }

    #[test]
    fn test_full_update_switches_boot() {
        let image = test_image(40_000);
        let rig = rig(image.clone());
        let mut session = begin(test_config(), &rig).unwrap();

        assert_eq!(session.phase(), Phase::HeaderRead);
        assert_eq!(session.image_descriptor().unwrap().version, "2.0.1");
        assert_eq!(session.image_size(), Some(image.len() as u64));
        assert_eq!(rig.boot.next_boot(), None);

        drive(&mut session);
        assert!(session.is_complete());
        assert_eq!(session.bytes_read(), image.len() as u64);

        session.finish().unwrap();
        assert_eq!(session.phase(), Phase::Finished);
        assert_eq!(rig.boot.next_boot().as_deref(), Some("ota_1"));
        assert_eq!(rig.flash.contents(image.len()), image);
    }

    #[test]
    fn test_event_lifecycle_order() {
        let image = test_image(10_000);
        let rig = rig(image);
        let observer = Arc::new(RecordingObserver::default());
        let mut session = UpdateSession::begin_with_observer(
            test_config(),
            rig.transport.clone(),
            Box::new(rig.flash.clone()),
            Box::new(rig.boot.clone()),
            observer.clone(),
        )
        .unwrap();
        drive(&mut session);
        session.finish().unwrap();

        let events = observer.names();
        assert_eq!(
            events[..4],
            ["started", "connected", "header-read", "chip-verified"]
        );
        assert_eq!(events[4], "flash-write");
        assert_eq!(events[events.len() - 2..], ["boot-updated", "finished"]);
        assert!(!events.contains(&"error"));
    }

    #[test]
    fn test_chip_mismatch_rejected_before_any_erase() {
        // Ten bytes: valid magic plus chip fields for an unsupported chip.
        let image = image_for_chip(0x7777, 64)[..10].to_vec();
        let rig = rig(image);
        let mut session = begin(test_config(), &rig).unwrap();
        assert_eq!(session.phase(), Phase::Connected);

        let err = session.perform().unwrap_err();
        assert!(matches!(err, OtaError::ImageValidationFailed(_)));
        assert_eq!(rig.flash.erase_count(), 0);

        // Session is torn down; everything else is illegal now.
        assert!(matches!(
            session.perform(),
            Err(OtaError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_truncated_header_with_matching_chip() {
        let image = test_image(64)[..80].to_vec();
        let rig = rig(image);
        let mut session = begin(test_config(), &rig).unwrap();

        let err = session.perform().unwrap_err();
        assert!(matches!(err, OtaError::ImageValidationFailed(_)));
    }

    #[test]
    fn test_stream_shorter_than_chip_fields_fails_begin() {
        let image = test_image(64)[..6].to_vec();
        let rig = rig(image);
        assert!(matches!(
            begin(test_config(), &rig),
            Err(OtaError::ImageValidationFailed(_))
        ));
    }

    #[test]
    fn test_bad_magic_fails_begin() {
        let mut image = test_image(64);
        image[0] ^= 0xFF;
        let rig = rig(image);
        assert!(matches!(
            begin(test_config(), &rig),
            Err(OtaError::ImageValidationFailed(_))
        ));
    }

    #[test]
    fn test_perform_after_done_is_invalid_state() {
        let rig = rig(test_image(5000));
        let mut session = begin(test_config(), &rig).unwrap();
        drive(&mut session);
        assert!(matches!(
            session.perform(),
            Err(OtaError::InvalidState {
                phase: Phase::DataComplete
            })
        ));
    }

    #[test]
    fn test_api_after_finish_is_invalid_state() {
        let rig = rig(test_image(5000));
        let mut session = begin(test_config(), &rig).unwrap();
        drive(&mut session);
        session.finish().unwrap();

        assert!(matches!(
            session.finish(),
            Err(OtaError::InvalidState { .. })
        ));
        assert!(matches!(
            session.abort(),
            Err(OtaError::InvalidState { .. })
        ));
        assert!(matches!(
            session.image_descriptor(),
            Err(OtaError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_abort_is_terminal_not_repeatable() {
        let rig = rig(test_image(5000));
        let mut session = begin(test_config(), &rig).unwrap();
        session.perform().unwrap();

        session.abort().unwrap();
        assert_eq!(session.phase(), Phase::Aborted);
        assert_eq!(rig.boot.next_boot(), None);

        assert!(matches!(
            session.abort(),
            Err(OtaError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_is_complete_tracks_declared_total() {
        let image = test_image(20_000);
        let total = image.len() as u64;
        let rig = rig(image);
        let mut session = begin(test_config(), &rig).unwrap();

        loop {
            let progress = session.perform().unwrap();
            if progress == OtaProgress::Continue {
                assert!(session.bytes_read() < total);
                assert!(!session.is_complete());
            } else {
                assert_eq!(session.bytes_read(), total);
                assert!(session.is_complete());
                break;
            }
        }
    }

    #[test]
    fn test_unknown_length_stream_completes_at_eof() {
        let image = test_image(20_000);
        let len = image.len() as u64;
        let rig = Rig {
            transport: MockTransport::new(image.clone()).chunked(),
            flash: MemoryFlash::new(SLOT as usize),
            boot: StaticBootLayout::two_slot(SLOT),
        };
        let mut session = begin(test_config(), &rig).unwrap();
        assert_eq!(session.image_size(), None);

        loop {
            match session.perform().unwrap() {
                OtaProgress::Continue => {
                    // Even with every byte consumed, completion requires the
                    // end-of-stream observation.
                    assert!(!session.is_complete());
                }
                OtaProgress::Done => break,
            }
        }
        assert!(session.is_complete());
        assert_eq!(session.bytes_read(), len);
        session.finish().unwrap();
        assert_eq!(rig.boot.next_boot().as_deref(), Some("ota_1"));
    }

    #[test]
    fn test_partial_download_issues_expected_ranges() {
        // 256000 image bytes at a 16384-byte window cap: ceil = 16 ranges.
        let image = test_image(256_000 - HEADER_REGION_LEN);
        assert_eq!(image.len(), 256_000);
        let rig = rig(image.clone());

        let config = OtaConfig {
            partial_http_download: true,
            max_http_request_size: 16_384,
            ..test_config()
        };
        let mut session = begin(config, &rig).unwrap();
        drive(&mut session);
        session.finish().unwrap();

        let ranges = rig.transport.range_requests();
        assert_eq!(ranges.len(), 16);
        assert_eq!(ranges[0], (0, 16_384));
        assert_eq!(ranges[15], (245_760, 10_240));
        assert!(ranges.iter().all(|&(_, len)| len <= 16_384));
        assert_eq!(session.bytes_read(), 256_000);
        assert_eq!(rig.flash.contents(image.len()), image);
    }

    #[test]
    fn test_partial_download_resumes_from_write_cursor_after_drop() {
        let image = test_image(60_000 - HEADER_REGION_LEN);
        let rig = rig(image.clone());
        rig.transport.drop_connection_at(30_000, 1);

        let config = OtaConfig {
            partial_http_download: true,
            max_http_request_size: 16_384,
            ..test_config()
        };
        let mut session = begin(config, &rig).unwrap();
        drive(&mut session);
        session.finish().unwrap();

        // Four regular windows plus one re-issued mid-transfer.
        let ranges = rig.transport.range_requests();
        assert_eq!(ranges.len(), 5);
        assert!(ranges.iter().any(|&(offset, _)| offset == 32_768));
        assert_eq!(rig.flash.contents(image.len()), image);
    }

    #[test]
    fn test_partial_download_persistent_drop_fails() {
        let image = test_image(60_000);
        let rig = rig(image);
        rig.transport.drop_connection_at(20_000, 100);

        let config = OtaConfig {
            partial_http_download: true,
            max_http_request_size: 16_384,
            ..test_config()
        };
        let mut session = begin(config, &rig).unwrap();
        let mut result = Ok(OtaProgress::Continue);
        for _ in 0..100_000 {
            result = session.perform();
            if !matches!(result, Ok(OtaProgress::Continue)) {
                break;
            }
        }
        assert!(matches!(result, Err(OtaError::ConnectionFailed(_))));
        assert_eq!(session.phase(), Phase::Aborted);
    }

    struct XorStage(u8);

    impl DecryptStage for XorStage {
        fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptError> {
            Ok(ciphertext.iter().map(|b| b ^ self.0).collect())
        }
    }

    #[test]
    fn test_decrypt_roundtrip() {
        let plain_image = test_image(30_000);
        let cipher_image: Vec<u8> = plain_image.iter().map(|b| b ^ 0x5A).collect();
        let rig = rig(cipher_image);

        let config = OtaConfig {
            decrypt: Some(Box::new(XorStage(0x5A))),
            ..test_config()
        };
        let mut session = begin(config, &rig).unwrap();
        assert_eq!(session.image_descriptor().unwrap().project_name, "relay-fw");
        drive(&mut session);
        session.finish().unwrap();

        // Partition holds the plaintext produced by the decrypt stage.
        assert_eq!(rig.flash.contents(plain_image.len()), plain_image);
    }

    #[test]
    fn test_corrupt_payload_fails_finish_without_commit() {
        let mut image = test_image(10_000);
        let last = image.len() - 1;
        image[last] ^= 0xFF;
        let rig = rig(image);

        let mut session = begin(test_config(), &rig).unwrap();
        drive(&mut session);

        let err = session.finish().unwrap_err();
        assert!(matches!(err, OtaError::ImageValidationFailed(_)));
        assert_eq!(rig.boot.next_boot(), None);
        assert_eq!(session.phase(), Phase::Aborted);
    }

    #[test]
    fn test_premature_finish_rejected() {
        let rig = rig(test_image(50_000));
        let mut session = begin(test_config(), &rig).unwrap();
        session.perform().unwrap();

        let err = session.finish().unwrap_err();
        assert!(matches!(err, OtaError::ImageValidationFailed(_)));
        assert_eq!(rig.boot.next_boot(), None);
    }

    #[test]
    fn test_flash_write_failure_tears_down() {
        let rig = rig(test_image(50_000));
        rig.flash.fail_writes_after(0);
        let mut session = begin(test_config(), &rig).unwrap();

        let err = session.perform().unwrap_err();
        assert!(matches!(err, OtaError::FlashOpFailed(_)));
        assert!(matches!(
            session.perform(),
            Err(OtaError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_flash_timeout_surfaces() {
        let rig = rig(test_image(50_000));
        rig.flash.timeout_writes_after(0);
        let mut session = begin(test_config(), &rig).unwrap();
        assert!(matches!(
            session.perform(),
            Err(OtaError::FlashTimeout { .. })
        ));
    }

    #[test]
    fn test_nonblocking_transport_rejected() {
        let rig = rig(test_image(1000));
        let config = OtaConfig {
            http: HttpSettings {
                nonblocking: true,
                ..Default::default()
            },
            ..test_config()
        };
        assert!(matches!(
            begin(config, &rig),
            Err(OtaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_undersized_request_window_rejected() {
        let rig = rig(test_image(1000));
        let config = OtaConfig {
            partial_http_download: true,
            max_http_request_size: 64,
            ..test_config()
        };
        assert!(matches!(
            begin(config, &rig),
            Err(OtaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_oversized_buffer_reports_no_memory() {
        let rig = rig(test_image(1000));
        let config = OtaConfig {
            buffer_size: usize::MAX,
            ..test_config()
        };
        assert!(matches!(begin(config, &rig), Err(OtaError::NoMemory)));
    }

    #[test]
    fn test_connect_failure_fails_begin() {
        let rig = Rig {
            transport: MockTransport::new(test_image(1000)).refusing_connect(),
            flash: MemoryFlash::new(SLOT as usize),
            boot: StaticBootLayout::two_slot(SLOT),
        };
        assert!(matches!(
            begin(test_config(), &rig),
            Err(OtaError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn test_bulk_erase_runs_during_begin() {
        let rig = rig(test_image(5000));
        let config = OtaConfig {
            bulk_flash_erase: true,
            ..test_config()
        };
        let _session = begin(config, &rig).unwrap();
        assert_eq!(rig.flash.erase_count(), SLOT as usize / SECTOR_SIZE);
    }

    #[test]
    fn test_explicit_partition_overrides_resolution() {
        let rig = rig(test_image(5000));
        let config = OtaConfig {
            update_partition: Some(Partition {
                label: "ota_0".into(),
                size: SLOT,
            }),
            ..test_config()
        };
        let mut session = begin(config, &rig).unwrap();
        drive(&mut session);
        session.finish().unwrap();
        assert_eq!(rig.boot.next_boot().as_deref(), Some("ota_0"));
    }

    #[test]
    fn test_post_connect_hook_runs_once() {
        static HOOK_RAN: AtomicBool = AtomicBool::new(false);
        HOOK_RAN.store(false, Ordering::SeqCst);

        let rig = rig(test_image(5000));
        let config = OtaConfig {
            post_connect: Some(Box::new(|_transport| {
                HOOK_RAN.store(true, Ordering::SeqCst);
                Ok(())
            })),
            ..test_config()
        };
        let _session = begin(config, &rig).unwrap();
        assert!(HOOK_RAN.load(Ordering::SeqCst));
    }

    #[test]
    fn test_run_drives_to_completion() {
        let image = test_image(12_000);
        let rig = rig(image.clone());
        let session = begin(test_config(), &rig).unwrap();
        session.run().unwrap();
        assert_eq!(rig.boot.next_boot().as_deref(), Some("ota_1"));
        assert_eq!(rig.flash.contents(image.len()), image);
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = OtaConfig {
            partial_http_download: true,
            max_http_request_size: 8192,
            ..test_config()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: OtaConfig = toml::from_str(&text).unwrap();
        assert!(parsed.partial_http_download);
        assert_eq!(parsed.max_http_request_size, 8192);
        assert_eq!(parsed.target.chip_id, CHIP);
        assert!(parsed.decrypt.is_none());
    }
}
