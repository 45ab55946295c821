//! The closed set of events the core emits.
//!
//! The distilled systems this crate is patterned after tend to reach for a
//! stringly-typed `emit(name, ...)` call for everything that happens. That
//! maps poorly to Rust: unknown event names become a runtime surprise
//! instead of a compile error. Here every event the core can produce is one
//! variant of [`Event`], fanned out to subscribers with a
//! `tokio::sync::broadcast` channel the way `music::QueueServer` fans
//! gateway events out to its per-guild queues, just inverted (one producer,
//! many subscribers instead of one subscriber per guild).

use crate::node::NodeId;
use crate::player::PlayerState;
use crate::track::{PlaylistInfo, Track};

use twilight_model::id::{
    marker::{ChannelMarker, GuildMarker},
    Id,
};

/// A single observable event.
///
/// Every event callers can observe is represented here as a variant;
/// nothing else can be emitted.
#[derive(Clone, Debug)]
pub enum Event {
    Ready,

    NodeConnect(NodeId),
    NodeDisconnect(NodeId),
    NodeReady(NodeId),
    NodeError(NodeId, String),
    NodeStats(NodeId),

    PlayerCreate(Id<GuildMarker>),
    PlayerDestroy(Id<GuildMarker>),
    PlayerJoin(Id<GuildMarker>, Id<ChannelMarker>),
    PlayerLeave(Id<GuildMarker>),
    PlayerMoved {
        guild_id: Id<GuildMarker>,
        from: NodeId,
        to: NodeId,
    },

    TrackStart(Id<GuildMarker>, Track),
    TrackEnd {
        guild_id: Id<GuildMarker>,
        track: Track,
        reason: TrackEndReason,
    },
    TrackError {
        guild_id: Id<GuildMarker>,
        track: Track,
        message: String,
    },
    TrackStuck {
        guild_id: Id<GuildMarker>,
        track: Track,
        threshold_ms: u64,
    },
    QueueEnd(Id<GuildMarker>),

    TrackAdd(Id<GuildMarker>, Track),
    TracksAdd(Id<GuildMarker>, usize),
    TrackAddPlaylist(Id<GuildMarker>, PlaylistInfo, usize),
    TrackRemove(Id<GuildMarker>, Track),
    PlaylistProgress {
        guild_id: Id<GuildMarker>,
        loaded: usize,
        total: usize,
    },

    Pause(Id<GuildMarker>),
    Resume(Id<GuildMarker>),
    Stop(Id<GuildMarker>),
    Seek(Id<GuildMarker>, u64),
    VolumeChange(Id<GuildMarker>, u32),
    LoopChange(Id<GuildMarker>, crate::track::LoopMode),

    VoiceStateUpdate(Id<GuildMarker>),
    VoiceServerUpdate(Id<GuildMarker>),
    VoiceDisconnect(Id<GuildMarker>),

    StateChange(Id<GuildMarker>, PlayerState),

    Debug(String),
    Warn(String),
    Error(String),
    Destroy(Id<GuildMarker>),
}

/// Why a track stopped playing, mirroring the worker's `event` payload
/// reasons.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl TrackEndReason {
    /// Whether this reason should trigger an automatic `_playNext`.
    pub fn advances_queue(self) -> bool {
        matches!(self, TrackEndReason::Finished | TrackEndReason::LoadFailed)
    }
}

/// Sink for events, fanned out to any number of subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> EventBus {
        let (tx, _rx) = tokio::sync::broadcast::channel(256);
        EventBus { tx }
    }

    /// Subscribes to the bus; lagging subscribers silently miss events
    /// rather than blocking emitters, per the broadcast channel's contract.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Emits an event to all current subscribers. Never blocks; a channel
    /// with no subscribers simply drops the event.
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> EventBus {
        EventBus::new()
    }
}
