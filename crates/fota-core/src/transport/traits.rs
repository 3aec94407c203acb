//! HTTP transport abstraction.
//!
//! Defines the `HttpTransport` trait the engine drives, allowing different
//! implementations (reqwest, mock). Redirect handling, TLS and connection
//! reuse are the implementation's concern.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("unexpected HTTP status {status}")]
    InvalidResponse { status: u16 },

    #[error("server does not support ranged requests")]
    RangeNotSupported,

    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("connection dropped")]
    Disconnected,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract HTTP(S) byte-stream source.
///
/// All operations block the calling thread until their bounded unit of work
/// completes.
pub trait HttpTransport: Send {
    /// Establish the HTTP(S) session and issue the initial GET.
    ///
    /// When `initial_range` is given the request asks for
    /// `offset..offset+len` (partial download); the server must answer with
    /// a partial-content response.
    fn connect(&mut self, initial_range: Option<(u64, u64)>) -> Result<(), TransportError>;

    /// Total entity size, once known. `None` for chunked transfers.
    fn total_len(&self) -> Option<u64>;

    /// Read the next bytes of the current response body into `buf`.
    ///
    /// Returns the number of bytes read; 0 means end of stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Re-point the stream at `offset..offset+len` with a ranged request.
    fn request_range(&mut self, offset: u64, len: u64) -> Result<(), TransportError>;

    /// Release the connection.
    fn close(&mut self) {}
}
