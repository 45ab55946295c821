//! Errors surfaced by the orchestrator façade.

use std::fmt::{self, Display, Formatter};

#[derive(Debug)]
pub enum OrchestratorError {
    /// No connected node was available to run a `loadTracks`/`getInfo` call.
    Node(crate::node::Error),
    /// The node's REST API rejected or failed a request.
    Rest(crate::rest::Error),
    /// A player operation failed (destroyed, not connected, etc).
    Player(crate::player::PlayerError),
    /// The persistence backend failed a read/write.
    Storage(crate::persistence::StorageError),
    /// `loadTracks` itself reported a load failure.
    LoadFailed(String),
    /// Resolution produced no playable tracks at all.
    NoTracksFound,
}

impl Display for OrchestratorError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            OrchestratorError::Node(err) => write!(f, "{}", err),
            OrchestratorError::Rest(err) => write!(f, "{}", err),
            OrchestratorError::Player(err) => write!(f, "{}", err),
            OrchestratorError::Storage(err) => write!(f, "{}", err),
            OrchestratorError::LoadFailed(message) => write!(f, "load failed: {}", message),
            OrchestratorError::NoTracksFound => f.write_str("no tracks found for query"),
        }
    }
}

impl std::error::Error for OrchestratorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OrchestratorError::Node(err) => Some(err),
            OrchestratorError::Rest(err) => Some(err),
            OrchestratorError::Player(err) => Some(err),
            OrchestratorError::Storage(err) => Some(err),
            _ => None,
        }
    }
}

impl From<crate::node::Error> for OrchestratorError {
    fn from(err: crate::node::Error) -> OrchestratorError {
        OrchestratorError::Node(err)
    }
}

impl From<crate::rest::Error> for OrchestratorError {
    fn from(err: crate::rest::Error) -> OrchestratorError {
        OrchestratorError::Rest(err)
    }
}

impl From<crate::player::PlayerError> for OrchestratorError {
    fn from(err: crate::player::PlayerError) -> OrchestratorError {
        OrchestratorError::Player(err)
    }
}

impl From<crate::persistence::StorageError> for OrchestratorError {
    fn from(err: crate::persistence::StorageError) -> OrchestratorError {
        OrchestratorError::Storage(err)
    }
}
