use std::io;

/// Failure taxonomy shared by the fetch, verify and apply steps.
///
/// Transport-level failures are converted into these variants at the point
/// they occur; nothing above the fetcher or downloader sees a raw
/// `reqwest::Error`.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("network error: {0}")]
    Network(String),

    #[error("range response truncated: expected {expected} bytes, received {received}")]
    Truncated { expected: u64, received: u64 },

    #[error("response body is empty")]
    Empty,

    #[error("malformed data: {0}")]
    Malformed(String),

    #[error("payload metadata rejected by update engine")]
    VerificationFailed,

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("update engine error: {0}")]
    Engine(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl UpdateError {
    pub fn network(context: &str, err: impl std::fmt::Display) -> Self {
        UpdateError::Network(format!("{context}: {err}"))
    }
}
