use serde_json::Value;

/// Failures of a single request attempt below the JSON-RPC layer.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("http error: {0}")]
    Http(String),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("request timed out")]
    Timeout,
}

/// Terminal outcome of [`retried_request`](crate::endpoint::EndpointClient::retried_request).
#[derive(thiserror::Error, Debug, Clone)]
pub enum RequestError {
    /// The node answered with a well-formed JSON-RPC error object. Never retried.
    #[error("JSON-RPC error from {node}: {error}")]
    Rpc { node: String, error: Value },
    /// The retry budget ran out (or the client was aborted) without a usable answer.
    #[error("no valid JSON-RPC response from {node} after {attempts} attempt(s)")]
    NoResponse {
        node: String,
        attempts: u32,
        failures: Vec<String>,
    },
}
