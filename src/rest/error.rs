//! Worker REST client errors.

use std::fmt::{self, Display, Formatter};

/// Errors that can occur while talking to a worker node's REST API.
#[derive(Debug)]
pub enum Error {
    /// The underlying HTTP transport failed (connection refused, DNS, TLS,
    /// timeout, ...). Retried per policy before being surfaced.
    Transport(reqwest::Error),
    /// The response body failed to decode as the expected JSON shape.
    Decode(reqwest::Error),
    /// The resource does not exist (HTTP 404). Terminal; never retried.
    NotFound,
    /// The node rejected our credentials (HTTP 401/403). Terminal.
    Unauthorized,
    /// The node returned a server error (5xx) after exhausting retries.
    ServerError(u16),
    /// The node is rate-limiting us and kept returning 429 past the
    /// rate-limit retry cap.
    RateLimited,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Error::Transport(err) => write!(f, "transport error: {}", err),
            Error::Decode(err) => write!(f, "failed to decode response: {}", err),
            Error::NotFound => f.write_str("resource not found"),
            Error::Unauthorized => f.write_str("node rejected credentials"),
            Error::ServerError(code) => write!(f, "node returned server error {}", code),
            Error::RateLimited => f.write_str("rate limited past retry cap"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(err) => Some(err),
            Error::Decode(err) => Some(err),
            _ => None,
        }
    }
}
