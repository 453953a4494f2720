use thiserror::Error;

/// Errors talking to an upstream service.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("unsupported relay url: {0}")]
    UnsupportedUrl(String),

    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },

    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] http::Error),

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type RelayResult<T> = Result<T, RelayError>;
