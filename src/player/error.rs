//! Errors a [`Player`](super::Player) handle can return to its caller.

use std::fmt::{self, Display, Formatter};

use crate::track::QueueError;

/// Errors surfaced by a player's public operations.
///
/// Per the error propagation policy, these are exactly the *caller* errors —
/// invalid arguments, an unready connection, a destroyed player. Node and
/// playback failures (load failed, exception, stuck) are recovered inside
/// the state machine and surfaced as events instead; they never take this
/// path.
#[derive(Debug)]
pub enum PlayerError {
    /// The player's task has already shut down (explicit destroy, or idle
    /// timeout fired). No further commands are accepted.
    Destroyed,
    /// An operation that requires a bound node was attempted before one was
    /// picked, or after its session id was lost.
    NotConnected,
    /// The voice handshake did not complete within the bounded wait.
    CredentialTimeout,
    /// `play(None, _)` was called with nothing queued.
    QueueEmpty,
    /// The track handed to `play` has no `encoded` blob and cannot be sent
    /// to a node as-is.
    TrackNotPlayable,
    /// No node in the pool is connected and reachable.
    NoNodeAvailable,
    /// A queue operation (index out of range, etc) was rejected.
    Queue(QueueError),
    /// The bound node's REST API rejected or failed the request.
    Rest(crate::rest::Error),
}

impl Display for PlayerError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            PlayerError::Destroyed => f.write_str("player has been destroyed"),
            PlayerError::NotConnected => f.write_str("player is not connected to a node"),
            PlayerError::CredentialTimeout => {
                f.write_str("voice credential did not arrive in time")
            }
            PlayerError::QueueEmpty => f.write_str("queue is empty"),
            PlayerError::TrackNotPlayable => {
                f.write_str("track has no encoded blob and cannot be played")
            }
            PlayerError::NoNodeAvailable => f.write_str("no connected node available"),
            PlayerError::Queue(err) => write!(f, "{}", err),
            PlayerError::Rest(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for PlayerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PlayerError::Queue(err) => Some(err),
            PlayerError::Rest(err) => Some(err),
            _ => None,
        }
    }
}

impl From<QueueError> for PlayerError {
    fn from(err: QueueError) -> PlayerError {
        PlayerError::Queue(err)
    }
}

impl From<crate::rest::Error> for PlayerError {
    fn from(err: crate::rest::Error) -> PlayerError {
        PlayerError::Rest(err)
    }
}
