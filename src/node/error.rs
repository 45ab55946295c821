//! Node session errors.

use std::fmt::{self, Display, Formatter};

/// Errors that can occur while maintaining a worker node's websocket
/// session.
#[derive(Debug)]
pub enum Error {
    Ws(tungstenite::Error),
    Io(std::io::Error),
    Rest(crate::rest::Error),
    /// The pool has no connected node to satisfy a selection request.
    NoNodeAvailable,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Error::Ws(err) => write!(f, "websocket error: {}", err),
            Error::Io(err) => write!(f, "io error: {}", err),
            Error::Rest(err) => write!(f, "rest error: {}", err),
            Error::NoNodeAvailable => f.write_str("no connected node available"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Ws(err) => Some(err),
            Error::Io(err) => Some(err),
            Error::Rest(err) => Some(err),
            Error::NoNodeAvailable => None,
        }
    }
}

impl From<tungstenite::Error> for Error {
    fn from(err: tungstenite::Error) -> Error {
        Error::Ws(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Io(err)
    }
}

impl From<crate::rest::Error> for Error {
    fn from(err: crate::rest::Error) -> Error {
        Error::Rest(err)
    }
}
