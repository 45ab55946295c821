//! Registry of live players and persistence-save coalescing.
//!
//! One `RwLock<HashMap<GuildId, Player>>` registry, plus a background task
//! that debounces persistence writes and a frame router that demultiplexes
//! node-originated frames back to the owning player.

use super::{Player, PlayerContext, PlayerState};
use crate::config::PlayerOptions;
use crate::events::{Event, EventBus};
use crate::node::session::GuildFrame;
use crate::node::{NodeId, NodePool};
use crate::persistence::Storage;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use twilight_gateway::MessageSender;
use twilight_model::id::{
    marker::{GuildMarker, UserMarker},
    Id,
};

/// Coalescing window for persistence saves.
const SAVE_DEBOUNCE: Duration = Duration::from_millis(200);

/// Aggregate counts across every player currently registered.
#[derive(Clone, Copy, Debug, Default)]
pub struct PoolStats {
    pub total: usize,
    pub playing: usize,
    pub idle: usize,
}

/// The registry of per-guild players.
pub struct PlayerPool {
    players: RwLock<HashMap<Id<GuildMarker>, Player>>,
    node_pool: Arc<NodePool>,
    events: EventBus,
    options: PlayerOptions,
    user_id: Id<UserMarker>,
    gateway: MessageSender,
    storage: Arc<dyn Storage>,
    pending_saves: Mutex<HashMap<Id<GuildMarker>, JoinHandle<()>>>,
    channel_empty_check: std::sync::RwLock<
        Option<Arc<dyn Fn(twilight_model::id::Id<twilight_model::id::marker::ChannelMarker>) -> bool + Send + Sync>>,
    >,
}

impl PlayerPool {
    pub fn new(
        node_pool: Arc<NodePool>,
        events: EventBus,
        options: PlayerOptions,
        user_id: Id<UserMarker>,
        gateway: MessageSender,
        storage: Arc<dyn Storage>,
    ) -> Arc<PlayerPool> {
        let pool = Arc::new(PlayerPool {
            players: RwLock::new(HashMap::new()),
            node_pool,
            events,
            options,
            user_id,
            gateway,
            storage,
            pending_saves: Mutex::new(HashMap::new()),
            channel_empty_check: std::sync::RwLock::new(None),
        });

        tokio::spawn(run_save_listener(pool.clone()));
        tokio::spawn(run_migration_listener(pool.clone()));

        pool
    }

    /// Wires an adapter-supplied check for `leaveOnEmpty`: given a voice
    /// channel id, reports whether it currently has zero non-bot members.
    /// Every player spawned after this call picks it up.
    pub fn set_channel_empty_check(
        &self,
        check: impl Fn(twilight_model::id::Id<twilight_model::id::marker::ChannelMarker>) -> bool
            + Send
            + Sync
            + 'static,
    ) {
        *self.channel_empty_check.write().unwrap() = Some(Arc::new(check));
    }

    /// Returns the existing player for `guild_id`, or spawns one on the
    /// best-placed node.
    pub async fn create(&self, guild_id: Id<GuildMarker>, region: Option<String>) -> Player {
        if let Some(player) = self.get(guild_id).await {
            return player;
        }

        let ctx = PlayerContext {
            guild_id,
            user_id: self.user_id,
            gateway: self.gateway.clone(),
            node_pool: self.node_pool.clone(),
            events: self.events.clone(),
            options: self.options.clone(),
            region,
            channel_empty_check: self.channel_empty_check.read().unwrap().clone(),
        };

        let player = Player::spawn(ctx);
        self.players.write().await.insert(guild_id, player.clone());
        self.events.emit(Event::PlayerCreate(guild_id));

        player
    }

    /// Gets a live player, pruning it from the registry if its task has
    /// already shut down.
    pub async fn get(&self, guild_id: Id<GuildMarker>) -> Option<Player> {
        let existing = self.players.read().await.get(&guild_id).cloned();
        match existing {
            Some(player) if player.is_closed() => {
                self.players.write().await.remove(&guild_id);
                None
            }
            other => other,
        }
    }

    pub async fn has(&self, guild_id: Id<GuildMarker>) -> bool {
        self.get(guild_id).await.is_some()
    }

    pub async fn all(&self) -> Vec<Player> {
        self.players.read().await.values().cloned().collect()
    }

    /// Destroys and removes the player for `guild_id`, if one exists.
    pub async fn destroy(&self, guild_id: Id<GuildMarker>) {
        let player = self.players.write().await.remove(&guild_id);
        if let Some(player) = player {
            let _ = player.destroy().await;
        }
        if let Ok(mut pending) = self.pending_saves.try_lock() {
            if let Some(handle) = pending.remove(&guild_id) {
                handle.abort();
            }
        }
        let _ = self
            .storage
            .delete(&format!("{}{}", self.options.persistence_prefix, guild_id))
            .await;
    }

    /// Destroys every registered player, e.g. on process shutdown.
    pub async fn destroy_all(&self) {
        let guild_ids: Vec<_> = self.players.read().await.keys().copied().collect();
        for guild_id in guild_ids {
            self.destroy(guild_id).await;
        }
    }

    /// Players currently in [`PlayerState::Playing`].
    pub async fn playing(&self) -> Vec<Player> {
        let mut out = Vec::new();
        for player in self.all().await {
            if let Ok(stats) = player.get_stats().await {
                if stats.state == PlayerState::Playing {
                    out.push(player);
                }
            }
        }
        out
    }

    /// Players that are neither playing nor paused.
    pub async fn idle(&self) -> Vec<Player> {
        let mut out = Vec::new();
        for player in self.all().await {
            if let Ok(stats) = player.get_stats().await {
                if !matches!(stats.state, PlayerState::Playing | PlayerState::Paused) {
                    out.push(player);
                }
            }
        }
        out
    }

    /// Aggregate counts across the registry, for health/metrics endpoints.
    pub async fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            total: 0,
            playing: 0,
            idle: 0,
        };

        for player in self.all().await {
            stats.total += 1;
            if let Ok(s) = player.get_stats().await {
                match s.state {
                    PlayerState::Playing => stats.playing += 1,
                    PlayerState::Paused => {}
                    _ => stats.idle += 1,
                }
            }
        }

        stats
    }

    /// Routes one inbound node frame to the player that owns its guild, if
    /// that player is still registered. Malformed guild ids are dropped.
    pub async fn route_frame(&self, frame: GuildFrame) {
        let Ok(numeric) = frame.guild_id.parse::<u64>() else {
            return;
        };
        let guild_id = Id::<GuildMarker>::new(numeric);

        if let Some(player) = self.get(guild_id).await {
            player.node_frame(frame.payload);
        }
    }

    /// Runs the node-frame dispatch loop for the lifetime of the pool.
    /// Intended to be spawned once per process, fed by every node session's
    /// shared dispatch sender.
    pub async fn run_frame_router(self: Arc<Self>, mut rx: mpsc::Receiver<GuildFrame>) {
        while let Some(frame) = rx.recv().await {
            self.route_frame(frame).await;
        }
    }

    /// The central failure-migration guarantee: on a node's `disconnect`
    /// event, move every player still bound to it onto the best remaining
    /// node. If none is healthy, the players are left as-is (not destroyed)
    /// so a later node reconnection can still host them.
    async fn migrate_off_node(&self, dead: &NodeId) {
        for player in self.all().await {
            let Ok(stats) = player.get_stats().await else {
                continue;
            };
            if stats.node_id.as_deref() != Some(dead.0.as_str()) {
                continue;
            }

            match self.node_pool.pick_for_new_player(None).await {
                Ok(target) => {
                    let _ = player.move_to_node(target).await;
                }
                Err(_) => {
                    self.events.emit(Event::Error(format!(
                        "guild {}: no healthy node available to migrate off {}",
                        player.guild_id(),
                        dead
                    )));
                }
            }
        }
    }

    /// Schedules a debounced save for `guild_id`, replacing any save already
    /// pending for it. Never awaited by the caller — the save itself is
    /// best-effort and must not block playback.
    async fn schedule_save(self: &Arc<Self>, guild_id: Id<GuildMarker>) {
        let Some(player) = self.get(guild_id).await else {
            return;
        };

        let pool = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(SAVE_DEBOUNCE).await;

            let Ok(snapshot) = player.snapshot().await else {
                return;
            };

            let key = format!("{}{}", pool.options.persistence_prefix, guild_id);
            let value = match serde_json::to_value(&snapshot) {
                Ok(v) => v,
                Err(err) => {
                    pool.events
                        .emit(Event::Warn(format!("failed to serialize snapshot: {err}")));
                    return;
                }
            };

            if let Err(err) = pool.storage.set(&key, value).await {
                pool.events
                    .emit(Event::Warn(format!("failed to persist snapshot: {err}")));
            }
        });

        let mut pending = self.pending_saves.lock().await;
        if let Some(previous) = pending.insert(guild_id, handle) {
            previous.abort();
        }
    }
}

/// Listens for save-triggering events and coalesces a debounced snapshot
/// write per guild.
async fn run_save_listener(pool: Arc<PlayerPool>) {
    let mut rx = pool.events.subscribe();

    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        };

        if let Some(guild_id) = save_trigger_guild(&event) {
            pool.schedule_save(guild_id).await;
        }
    }
}

/// Listens for a node's `disconnect` event and triggers failure migration
/// for every player still bound to it (§4.4's central guarantee).
async fn run_migration_listener(pool: Arc<PlayerPool>) {
    let mut rx = pool.events.subscribe();

    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        };

        if let Event::NodeDisconnect(node_id) = event {
            pool.migrate_off_node(&node_id).await;
        }
    }
}

fn save_trigger_guild(event: &Event) -> Option<Id<GuildMarker>> {
    match event {
        Event::TrackStart(guild_id, _)
        | Event::TrackAdd(guild_id, _)
        | Event::TracksAdd(guild_id, _)
        | Event::TrackRemove(guild_id, _)
        | Event::VolumeChange(guild_id, _)
        | Event::LoopChange(guild_id, _)
        | Event::Pause(guild_id)
        | Event::Resume(guild_id)
        | Event::StateChange(guild_id, _) => Some(*guild_id),
        _ => None,
    }
}
