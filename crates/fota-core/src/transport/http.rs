//! Production transport backed by `reqwest::blocking`.

use std::io::Read;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::{CONTENT_RANGE, RANGE};
use tracing::debug;

use super::traits::{HttpTransport, TransportError};

/// Blocking HTTP(S) transport.
///
/// Redirects are followed by the client; certificate configuration rides on
/// the default TLS backend.
pub struct HttpClientTransport {
    client: Client,
    url: String,
    response: Option<Response>,
    total: Option<u64>,
}

impl HttpClientTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            response: None,
            total: None,
        })
    }

    fn send(&mut self, range: Option<(u64, u64)>) -> Result<(), TransportError> {
        let mut request = self.client.get(&self.url);
        if let Some((offset, len)) = range {
            let header = format!("bytes={}-{}", offset, offset + len - 1);
            debug!(range = %header, "Issuing ranged request");
            request = request.header(RANGE, header);
        }
        let response = request
            .send()
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        match response.status() {
            StatusCode::OK if range.is_some() => {
                // Server ignored the Range header and is streaming the full
                // entity; the engine's window bookkeeping would desync.
                return Err(TransportError::RangeNotSupported);
            }
            StatusCode::OK => {
                self.total = response.content_length();
            }
            StatusCode::PARTIAL_CONTENT => {
                self.total = parse_content_range_total(&response).or(self.total);
            }
            status => {
                return Err(TransportError::InvalidResponse {
                    status: status.as_u16(),
                });
            }
        }
        self.response = Some(response);
        Ok(())
    }
}

/// Extract the complete entity length from a `Content-Range` header,
/// e.g. `bytes 0-16383/256000`.
fn parse_content_range_total(response: &Response) -> Option<u64> {
    let value = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
    let total = value.rsplit('/').next()?;
    total.parse().ok()
}

impl HttpTransport for HttpClientTransport {
    fn connect(&mut self, initial_range: Option<(u64, u64)>) -> Result<(), TransportError> {
        self.send(initial_range)
    }

    fn total_len(&self) -> Option<u64> {
        self.total
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let response = self
            .response
            .as_mut()
            .ok_or(TransportError::Disconnected)?;
        response
            .read(buf)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))
    }

    fn request_range(&mut self, offset: u64, len: u64) -> Result<(), TransportError> {
        self.send(Some((offset, len)))
    }

    fn close(&mut self) {
        self.response = None;
    }
}
