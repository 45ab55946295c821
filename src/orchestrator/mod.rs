//! The top-level façade: owns the node pool, the player pool, the event bus,
//! and persistence, and exposes the search-then-play pipeline callers
//! actually want instead of the lower-level per-component APIs.

pub mod error;
pub mod search;

pub use error::OrchestratorError;

use crate::config::{NodeConfig, PlayerOptions};
use crate::events::{Event, EventBus};
use crate::node::{Node, NodePool};
use crate::persistence::{Snapshot, Storage};
use crate::player::{self, Player, PlayerError, PlayerState, PlayerPool};
use crate::track::{LoadResult, Requester, Track};

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use twilight_gateway::MessageSender;
use twilight_model::id::{
    marker::{ChannelMarker, GuildMarker, UserMarker},
    Id,
};

/// Extra parameters for [`Orchestrator::search`].
#[derive(Clone, Debug, Default)]
pub struct SearchOpts {
    /// Overrides [`PlayerOptions::search_engine`] for identification.
    pub source: Option<String>,
    /// Overrides [`PlayerOptions::playback_engine`] for resolution.
    pub engine: Option<String>,
    pub requester: Requester,
}

/// What [`Orchestrator::play`] should resolve into tracks.
pub enum PlayQuery {
    Track(Track),
    Tracks(Vec<Track>),
    Query(String),
}

/// Result of a successful [`Orchestrator::play`] call.
#[derive(Debug)]
pub struct PlayOutcome {
    pub tracks_added: usize,
    pub started: bool,
}

/// The façade composing every other component.
pub struct Orchestrator {
    node_pool: Arc<NodePool>,
    player_pool: Arc<PlayerPool>,
    events: EventBus,
    storage: Arc<dyn Storage>,
    options: PlayerOptions,
    user_id: Id<UserMarker>,
    dispatch_tx: mpsc::Sender<crate::node::session::GuildFrame>,
}

impl Orchestrator {
    /// Builds a new orchestrator and starts its node-frame router. No nodes
    /// are registered yet; call [`Orchestrator::add_node`] for each
    /// configured worker.
    pub fn new(
        options: PlayerOptions,
        user_id: Id<UserMarker>,
        gateway: MessageSender,
        storage: Arc<dyn Storage>,
    ) -> Arc<Orchestrator> {
        let node_pool = Arc::new(NodePool::new());
        let events = EventBus::new();
        let player_pool = PlayerPool::new(
            node_pool.clone(),
            events.clone(),
            options.clone(),
            user_id,
            gateway,
            storage.clone(),
        );

        let (dispatch_tx, dispatch_rx) = mpsc::channel(256);
        tokio::spawn(player_pool.clone().run_frame_router(dispatch_rx));

        Arc::new(Orchestrator {
            node_pool,
            player_pool,
            events,
            storage,
            options,
            user_id,
            dispatch_tx,
        })
    }

    /// Subscribes to every event the core emits.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn node_pool(&self) -> &Arc<NodePool> {
        &self.node_pool
    }

    pub fn player_pool(&self) -> &Arc<PlayerPool> {
        &self.player_pool
    }

    /// Wires an adapter-supplied check for `leaveOnEmpty`: given a voice
    /// channel id, reports whether it currently has zero non-bot members.
    /// Without this, `leaveOnEmpty` is a no-op regardless of configuration.
    pub fn set_channel_empty_check(
        &self,
        check: impl Fn(Id<ChannelMarker>) -> bool + Send + Sync + 'static,
    ) {
        self.player_pool.set_channel_empty_check(check);
    }

    /// Registers a worker node and spawns its websocket session.
    pub async fn add_node(&self, config: NodeConfig) -> Arc<Node> {
        let node = Arc::new(Node::new(config));
        self.node_pool.add(node.clone()).await;

        tokio::spawn(crate::node::session::run(
            node.clone(),
            self.user_id.to_string(),
            self.events.clone(),
            self.dispatch_tx.clone(),
        ));

        node
    }

    pub async fn join(
        &self,
        guild_id: Id<GuildMarker>,
        channel_id: Id<ChannelMarker>,
        region: Option<String>,
    ) -> Result<Player, PlayerError> {
        let player = self.player_pool.create(guild_id, region).await;
        player.connect(channel_id).await?;
        Ok(player)
    }

    pub async fn leave(&self, guild_id: Id<GuildMarker>) -> Result<(), PlayerError> {
        if let Some(player) = self.player_pool.get(guild_id).await {
            player.disconnect().await?;
        }
        Ok(())
    }

    pub async fn get_player(&self, guild_id: Id<GuildMarker>) -> Option<Player> {
        self.player_pool.get(guild_id).await
    }

    pub async fn destroy_player(&self, guild_id: Id<GuildMarker>) {
        self.player_pool.destroy(guild_id).await;
    }

    /// Search-then-play's search half. See the module documentation for the
    /// two-phase identification/resolution pipeline this runs.
    pub async fn search(
        &self,
        query: &str,
        opts: SearchOpts,
    ) -> Result<LoadResult, OrchestratorError> {
        if is_url(query) {
            let node = self.node_pool.pick_least_loaded().await?;
            return Ok(node.rest.load_tracks(query).await?);
        }

        let search_engine = opts
            .source
            .as_deref()
            .unwrap_or(&self.options.search_engine)
            .to_string();
        let playback_engine = opts
            .engine
            .as_deref()
            .unwrap_or(&self.options.playback_engine)
            .to_string();

        let identification = self.identify(query, &search_engine).await;

        let resolve_identifier = match &identification {
            Some(id) if id.isrc.is_some() => format!(
                "{}:{}",
                prefix_for(&playback_engine),
                id.isrc.as_deref().unwrap()
            ),
            Some(id) => format!(
                "{}:{} {}",
                prefix_for(&playback_engine),
                id.title,
                id.author
            ),
            None => format!("{}:{}", prefix_for(&playback_engine), query),
        };

        let node = self.node_pool.pick_least_loaded().await?;
        let resolved = node.rest.load_tracks(&resolve_identifier).await?;

        let result = match (identification.and_then(|id| id.playlist), resolved) {
            (Some(playlist), LoadResult::Search(_)) => playlist,
            (_, LoadResult::Search(tracks)) => LoadResult::Search(search::rank(query, tracks)),
            (_, other) => other,
        };

        Ok(result)
    }

    /// Phase 1: identifies a candidate on the search engine and gates it by
    /// character similarity to the original query.
    async fn identify(&self, query: &str, search_engine: &str) -> Option<Identification> {
        let node = self.node_pool.pick_least_loaded().await.ok()?;
        let identifier = format!("{}:{}", prefix_for(search_engine), query);
        let result = node.rest.load_tracks(&identifier).await.ok()?;

        let (first, playlist) = match &result {
            LoadResult::Track(track) => (Some((**track).clone()), None),
            LoadResult::Search(tracks) => (tracks.first().cloned(), None),
            LoadResult::Playlist { tracks, .. } => {
                (tracks.first().cloned(), Some(result.clone()))
            }
            LoadResult::Empty | LoadResult::Error { .. } => (None, None),
        };

        let track = first?;
        if search::char_similarity(query, &track.title) < 0.3 {
            return None;
        }

        Some(Identification {
            title: track.title,
            author: track.author,
            isrc: track.isrc,
            playlist,
        })
    }

    /// `autocomplete(query)`: same ranking as `search`, capped to 25 results
    /// of at most 100 characters each.
    pub async fn autocomplete(
        &self,
        query: &str,
    ) -> Result<Vec<(String, String)>, OrchestratorError> {
        let identifier = format!("{}:{}", prefix_for(&self.options.playback_engine), query);
        let node = self.node_pool.pick_least_loaded().await?;
        let result = node.rest.load_tracks(&identifier).await?;

        let ranked = search::rank(query, result.into_tracks());

        Ok(ranked
            .into_iter()
            .take(25)
            .map(|track| {
                let mut name = format!("{} - {}", track.title, track.author);
                if name.chars().count() > 100 {
                    name = name.chars().take(100).collect();
                }
                let value = track.encoded.clone().unwrap_or(track.identifier.clone());
                (name, value)
            })
            .collect())
    }

    /// Resolves `query` into tracks, attaches `requester`, gets-or-creates
    /// the guild's player, joins voice, enqueues, and starts playback if the
    /// player was idle.
    pub async fn play(
        &self,
        guild_id: Id<GuildMarker>,
        channel_id: Id<ChannelMarker>,
        query: PlayQuery,
        requester: Requester,
        region: Option<String>,
    ) -> Result<PlayOutcome, OrchestratorError> {
        let player = self.player_pool.create(guild_id, region).await;

        // Captured before `connect()`, which advances `Idle`/`Connecting` to
        // `Connected` on a successful handshake — reading it afterwards
        // would make this check never true.
        let already_active = matches!(
            player.get_stats().await?.state,
            PlayerState::Playing | PlayerState::Paused
        );

        player.connect(channel_id).await?;

        let mut playlist_info = None;
        let tracks = match query {
            PlayQuery::Track(track) => vec![track.with_requester(requester)],
            PlayQuery::Tracks(tracks) => tracks
                .into_iter()
                .map(|track| track.with_requester(requester.clone()))
                .collect(),
            PlayQuery::Query(query) => {
                let result = self
                    .search(
                        &query,
                        SearchOpts {
                            requester: requester.clone(),
                            ..Default::default()
                        },
                    )
                    .await?;

                match result {
                    LoadResult::Track(track) => vec![track.with_requester(requester)],
                    LoadResult::Search(tracks) => tracks
                        .into_iter()
                        .take(1)
                        .map(|track| track.with_requester(requester.clone()))
                        .collect(),
                    LoadResult::Playlist { info, tracks } => {
                        playlist_info = Some(info);
                        tracks
                            .into_iter()
                            .map(|track| track.with_requester(requester.clone()))
                            .collect()
                    }
                    LoadResult::Empty => Vec::new(),
                    LoadResult::Error { message, .. } => {
                        return Err(OrchestratorError::LoadFailed(message))
                    }
                }
            }
        };

        if tracks.is_empty() {
            return Err(OrchestratorError::NoTracksFound);
        }

        let tracks_added = if playlist_info.is_some() {
            tracks.len().min(self.options.max_playlist_size)
        } else {
            tracks.len()
        };

        match playlist_info {
            Some(info) => player.add_playlist(tracks, info).await?,
            None => player.add_tracks(tracks).await?,
        }

        // `add_tracks`/`add_playlist` already issue the `play()` call
        // themselves once the track lands in the queue (see
        // `PlayerTask::is_playing_or_paused`), so nothing further is
        // needed here beyond reporting whether this call was the one that
        // triggered it.
        Ok(PlayOutcome {
            tracks_added,
            started: !already_active,
        })
    }

    /// Restores every persisted player whose guild and voice channel the
    /// caller confirms still exist. The orchestrator has no gateway cache of
    /// its own, so existence is delegated to the adapter layer.
    pub async fn restore_players(
        &self,
        guild_exists: impl Fn(Id<GuildMarker>, Option<Id<ChannelMarker>>) -> bool,
    ) -> Result<usize, OrchestratorError> {
        let entries = self.storage.all(&self.options.persistence_prefix).await?;
        let mut restored = 0;

        for (key, value) in entries {
            let snapshot: Snapshot = match serde_json::from_value(value) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    self.events
                        .emit(Event::Warn(format!("skipping unreadable snapshot {key}: {err}")));
                    continue;
                }
            };

            let Ok(guild_numeric) = snapshot.guild_id.parse::<u64>() else {
                continue;
            };
            let guild_id = Id::<GuildMarker>::new(guild_numeric);

            let channel_id = snapshot
                .voice_channel_id
                .as_deref()
                .and_then(|s| s.parse::<u64>().ok())
                .map(Id::<ChannelMarker>::new);

            if !guild_exists(guild_id, channel_id) {
                continue;
            }
            let Some(channel_id) = channel_id else {
                continue;
            };

            let player = self.player_pool.create(guild_id, None).await;
            if player.connect(channel_id).await.is_err() {
                continue;
            }

            let _ = player.set_volume(snapshot.volume).await;
            let _ = player.set_loop(snapshot.loop_mode).await;

            if !snapshot.queue.is_empty() {
                let _ = player.add_tracks(snapshot.queue.clone()).await;
            }

            if let serde_json::Value::Object(blocks) = &snapshot.filters {
                for (name, block) in blocks {
                    let _ = player.apply_filter(name.clone(), block.clone()).await;
                }
            }

            if let Some(current) = snapshot.current.clone() {
                let opts = player::PlayOpts {
                    start_time_ms: Some(snapshot.position_ms),
                    no_replace: false,
                };
                if player.play(Some(current), opts).await.is_ok() && snapshot.paused {
                    let _ = player.pause().await;
                }
            }

            restored += 1;
        }

        Ok(restored)
    }
}

struct Identification {
    title: String,
    author: String,
    isrc: Option<String>,
    playlist: Option<LoadResult>,
}

fn is_url(query: &str) -> bool {
    query.starts_with("http://") || query.starts_with("https://")
}

/// Maps an engine tag to its worker search-identifier prefix.
fn prefix_for(engine: &str) -> &'static str {
    match engine {
        "spotify" => "spsearch",
        "youtubemusic" => "ytmsearch",
        "youtube" => "ytsearch",
        "soundcloud" => "scsearch",
        "deezer" => "dzsearch",
        "applemusic" => "amsearch",
        _ => "ytsearch",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_queries_are_detected() {
        assert!(is_url("https://example.com/track"));
        assert!(is_url("http://example.com/track"));
        assert!(!is_url("never gonna give you up"));
    }

    #[test]
    fn prefix_for_known_engines() {
        assert_eq!(prefix_for("spotify"), "spsearch");
        assert_eq!(prefix_for("youtubemusic"), "ytmsearch");
        assert_eq!(prefix_for("unknown"), "ytsearch");
    }
}
