//! Immutable track descriptors and the queue that orders them.

pub mod queue;

pub use queue::{Queue, QueueError};

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// A locally-generated, process-unique track identifier.
///
/// Worker nodes hand back an opaque `encoded` blob, not a stable id we can
/// key off of, so the orchestrator mints its own.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackId(u64);

static NEXT_TRACK_ID: AtomicU64 = AtomicU64::new(1);

impl TrackId {
    fn next() -> TrackId {
        TrackId(NEXT_TRACK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Opaque requester record attached to a track at enqueue time.
///
/// The core never inspects this beyond cloning and comparing it (for
/// `removeByRequester`); its shape is entirely up to the adapter layer.
pub type Requester = Option<serde_json::Value>;

/// An immutable track descriptor.
///
/// Constructed once (via [`Track::new`] or [`Track::placeholder`]) and never
/// mutated afterward; operations that "change" a track (e.g. attaching a
/// requester) return a new value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub encoded: Option<String>,
    pub title: String,
    pub author: String,
    pub uri: Option<String>,
    pub identifier: String,
    pub duration_ms: u64,
    pub is_seekable: bool,
    pub is_stream: bool,
    pub source: String,
    pub isrc: Option<String>,
    pub artwork_uri: Option<String>,
    pub requester: Requester,
    pub added_at_ms: u64,
}

impl Track {
    /// Creates a fully-resolved track, ready for playback.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        encoded: String,
        title: String,
        author: String,
        uri: Option<String>,
        identifier: String,
        duration_ms: u64,
        is_seekable: bool,
        is_stream: bool,
        source: String,
        added_at_ms: u64,
    ) -> Track {
        Track {
            id: TrackId::next(),
            encoded: Some(encoded),
            title,
            author,
            uri,
            identifier,
            duration_ms,
            is_seekable,
            is_stream,
            source,
            isrc: None,
            artwork_uri: None,
            requester: None,
            added_at_ms,
        }
    }

    /// Whether this track can be handed to `updatePlayer` as-is.
    ///
    /// A track without `encoded` is a pre-resolution placeholder (for
    /// example, a search result the orchestrator hasn't resolved against the
    /// playback engine yet) and must be rejected by the player.
    pub fn is_playable(&self) -> bool {
        self.encoded.is_some()
    }

    /// Returns a clone of this track with a requester attached.
    pub fn with_requester(mut self, requester: Requester) -> Track {
        self.requester = requester;
        self
    }

    /// Returns a clone of this track with an ISRC attached.
    pub fn with_isrc(mut self, isrc: Option<String>) -> Track {
        self.isrc = isrc;
        self
    }

    /// Returns a clone of this track with artwork attached.
    pub fn with_artwork(mut self, artwork_uri: Option<String>) -> Track {
        self.artwork_uri = artwork_uri;
        self
    }
}

/// Metadata about a playlist a [`LoadResult::Playlist`] was drawn from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlaylistInfo {
    pub name: String,
    pub selected_track: Option<usize>,
}

/// The normalized result of a `loadTracks` call.
///
/// The worker protocol's response is duck-typed in the systems this crate is
/// patterned after: sometimes a bare track, sometimes a list, sometimes a
/// playlist envelope. Every REST client call site normalizes into this sum
/// type at the boundary so downstream code never has to guess the shape.
#[derive(Clone, Debug)]
pub enum LoadResult {
    Track(Box<Track>),
    Search(Vec<Track>),
    Playlist {
        info: PlaylistInfo,
        tracks: Vec<Track>,
    },
    Empty,
    Error {
        message: String,
        severity: String,
    },
}

impl LoadResult {
    /// Flattens this result into a vec of tracks, discarding playlist
    /// metadata. `Empty`/`Error` become an empty vec.
    pub fn into_tracks(self) -> Vec<Track> {
        match self {
            LoadResult::Track(t) => vec![*t],
            LoadResult::Search(tracks) => tracks,
            LoadResult::Playlist { tracks, .. } => tracks,
            LoadResult::Empty | LoadResult::Error { .. } => Vec::new(),
        }
    }
}

/// The loop mode a [`Queue`] is operating under.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum LoopMode {
    Off,
    Track,
    Queue,
}
