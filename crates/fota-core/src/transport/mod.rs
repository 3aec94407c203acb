//! Transport layer: HTTP abstraction plus implementations.

mod http;
mod mock;
mod traits;

pub use http::HttpClientTransport;
pub use mock::MockTransport;
pub use traits::{HttpTransport, TransportError};
