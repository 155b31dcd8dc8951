use std::future::Future;

use crate::errors::TransportError;

mod http;
pub use http::HttpTransport;

pub mod mock;

/// Raw answer of a node to one posted JSON-RPC body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    /// Value of the `RateLimit` header, if any.
    pub ratelimit: Option<String>,
    /// Value of the `Retry-After` header, if any.
    pub retry_after: Option<String>,
    pub body: String,
}

impl TransportResponse {
    pub fn ok<S: Into<String>>(body: S) -> Self {
        Self {
            status: 200,
            ratelimit: None,
            retry_after: None,
            body: body.into(),
        }
    }
}

/// Delivery of JSON-RPC request bodies to one node.
///
/// Implementations own the per-attempt timeout; the endpoint client on top of it owns retries,
/// statistics and JSON-RPC semantics.
pub trait Transport: Send + Sync + 'static {
    fn post(
        &self,
        body: String,
    ) -> impl Future<Output = Result<TransportResponse, TransportError>> + Send;
}
