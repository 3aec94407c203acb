//! Mock HTTP transport for testing.

use std::sync::{Arc, Mutex};

use super::traits::{HttpTransport, TransportError};

struct Inner {
    image: Vec<u8>,
    cursor: u64,
    /// Exclusive end of the currently served range, `None` when the whole
    /// entity was requested.
    window_end: Option<u64>,
    advertise_len: bool,
    connected: bool,
    refuse_connect: bool,
    range_log: Vec<(u64, u64)>,
    /// Fail reads at `drop_at` this many times before recovering.
    drop_at: Option<u64>,
    drops_left: usize,
}

/// Scripted transport serving a fixed byte image.
///
/// Clones share state, so a test can inspect the ranged-request log after
/// the session consumed its handle. Supports mid-stream disconnect
/// injection.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<Inner>>,
}

impl MockTransport {
    pub fn new(image: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                image,
                cursor: 0,
                window_end: None,
                advertise_len: true,
                connected: false,
                refuse_connect: false,
                range_log: Vec::new(),
                drop_at: None,
                drops_left: 0,
            })),
        }
    }

    /// Serve the image with chunked encoding: no advertised length.
    pub fn chunked(self) -> Self {
        self.inner.lock().unwrap().advertise_len = false;
        self
    }

    /// Refuse the initial connection attempt.
    pub fn refusing_connect(self) -> Self {
        self.inner.lock().unwrap().refuse_connect = true;
        self
    }

    /// Drop the connection `times` times when the stream reaches `offset`.
    pub fn drop_connection_at(&self, offset: u64, times: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.drop_at = Some(offset);
        inner.drops_left = times;
    }

    /// All ranged requests issued so far, `(offset, len)` pairs. The initial
    /// connect counts when it carried a range.
    pub fn range_requests(&self) -> Vec<(u64, u64)> {
        self.inner.lock().unwrap().range_log.clone()
    }
}

impl HttpTransport for MockTransport {
    fn connect(&mut self, initial_range: Option<(u64, u64)>) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.refuse_connect {
            return Err(TransportError::ConnectFailed("connection refused".into()));
        }
        inner.connected = true;
        if let Some((offset, len)) = initial_range {
            inner.range_log.push((offset, len));
            inner.cursor = offset;
            inner.window_end = Some(offset + len);
        } else {
            inner.cursor = 0;
            inner.window_end = None;
        }
        Ok(())
    }

    fn total_len(&self) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        inner.advertise_len.then(|| inner.image.len() as u64)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.connected {
            return Err(TransportError::Disconnected);
        }
        if let Some(at) = inner.drop_at {
            if inner.drops_left > 0 && inner.cursor >= at {
                inner.drops_left -= 1;
                inner.connected = false;
                return Err(TransportError::Disconnected);
            }
        }
        let end = inner
            .window_end
            .unwrap_or(inner.image.len() as u64)
            .min(inner.image.len() as u64);
        let remaining = end.saturating_sub(inner.cursor) as usize;
        let n = remaining.min(buf.len());
        let start = inner.cursor as usize;
        buf[..n].copy_from_slice(&inner.image[start..start + n]);
        inner.cursor += n as u64;
        Ok(n)
    }

    fn request_range(&mut self, offset: u64, len: u64) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.range_log.push((offset, len));
        inner.cursor = offset;
        inner.window_end = Some(offset + len);
        inner.connected = true;
        Ok(())
    }

    fn close(&mut self) {
        self.inner.lock().unwrap().connected = false;
    }
}
