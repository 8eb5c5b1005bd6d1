use thiserror::Error;

/// Failure taxonomy for the relay. Only `Upstream` is ever surfaced to the
/// client (as a 502, and only when no response bytes have been written yet);
/// the rest are handled internally.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Upstream unreachable or persistently failing after retries.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The client closed its connection; in-flight work is diverted to
    /// aggregation/caching, never reported back as an error.
    #[error("client cancelled the request")]
    ClientCancelled,

    /// A single SSE line failed to parse. Logged and skipped, never fatal
    /// to the stream.
    #[error("malformed upstream chunk: {0}")]
    MalformedChunk(String),

    /// Required configuration missing at startup. Fatal before binding.
    #[error("configuration error: {0}")]
    Config(String),
}
