//! The per-guild playback state machine.
//!
//! One task owns a [`Queue`], the bound [`Node`], and the voice handshake
//! for exactly one guild: a `tokio::select!` over a command channel, a
//! gateway-event channel, and a node-event channel, `biased;` so explicit
//! commands drain ahead of background events. [`Player`] is the cheap,
//! cloneable handle callers hold; the task itself never leaves this module.

pub mod error;
pub mod filters;
pub mod pool;

pub use error::PlayerError;
pub use pool::PlayerPool;

use crate::config::PlayerOptions;
use crate::events::{Event, EventBus, TrackEndReason};
use crate::handshake::{Credential, HandshakeEvent, VoiceHandshake};
use crate::node::session::{GuildFrame, GuildPayload};
use crate::node::payload::NodeEvent;
use crate::node::{Node, NodePool};
use crate::rest::payload::{UpdatePlayerPatch, VoiceStatePatch};
use crate::track::{LoopMode, Queue, Track};

use filters::FilterController;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use twilight_model::id::{
    marker::{ChannelMarker, GuildMarker},
    Id,
};
use tracing::{instrument, warn};

/// The player's externally-visible state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PlayerState {
    Idle,
    Connecting,
    /// Voice credential assembled and a node bound, but no `updatePlayer`
    /// has (yet) been issued for a track.
    Connected,
    Playing,
    Paused,
    /// The current track just ended; transient until `_playNext` resolves
    /// it to `Playing` (next track) or `Idle` (queue exhausted).
    Ended,
    Stuck,
    Errored,
    Destroyed,
}

/// Options accepted by [`Player::play`].
#[derive(Clone, Debug, Default)]
pub struct PlayOpts {
    pub start_time_ms: Option<u64>,
    pub no_replace: bool,
}

/// A point-in-time readout of a player's stats, for `getStats`.
#[derive(Clone, Debug)]
pub struct PlayerStats {
    pub state: PlayerState,
    pub position_ms: u64,
    pub volume: u32,
    pub queue_len: usize,
    pub loop_mode: LoopMode,
    pub node_id: Option<String>,
}

/// A cheap, cloneable handle to a running player task.
#[derive(Clone)]
pub struct Player {
    guild_id: Id<GuildMarker>,
    cmd_tx: mpsc::Sender<Command>,
}

macro_rules! call {
    ($self:ident, $variant:ident $(, $arg:expr)*) => {{
        let (tx, rx) = oneshot::channel();
        $self
            .cmd_tx
            .send(Command::$variant($($arg,)* tx))
            .await
            .map_err(|_| PlayerError::Destroyed)?;
        rx.await.map_err(|_| PlayerError::Destroyed)?
    }};
}

impl Player {
    pub fn guild_id(&self) -> Id<GuildMarker> {
        self.guild_id
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    pub async fn connect(&self, channel_id: Id<ChannelMarker>) -> Result<(), PlayerError> {
        call!(self, Connect, channel_id)
    }

    pub async fn disconnect(&self) -> Result<(), PlayerError> {
        call!(self, Disconnect)
    }

    pub async fn play(&self, track: Option<Track>, opts: PlayOpts) -> Result<(), PlayerError> {
        call!(self, Play, track, opts)
    }

    pub async fn pause(&self) -> Result<(), PlayerError> {
        call!(self, Pause)
    }

    pub async fn resume(&self) -> Result<(), PlayerError> {
        call!(self, Resume)
    }

    pub async fn stop(&self) -> Result<(), PlayerError> {
        call!(self, Stop)
    }

    pub async fn skip(&self, n: usize) -> Result<(), PlayerError> {
        call!(self, Skip, n)
    }

    pub async fn seek(&self, position_ms: u64) -> Result<(), PlayerError> {
        call!(self, Seek, position_ms)
    }

    pub async fn seek_forward(&self, delta_ms: u64) -> Result<(), PlayerError> {
        call!(self, SeekForward, delta_ms)
    }

    pub async fn seek_backward(&self, delta_ms: u64) -> Result<(), PlayerError> {
        call!(self, SeekBackward, delta_ms)
    }

    pub async fn set_volume(&self, volume: u32) -> Result<(), PlayerError> {
        call!(self, SetVolume, volume)
    }

    pub async fn set_loop(&self, mode: LoopMode) -> Result<(), PlayerError> {
        call!(self, SetLoop, mode)
    }

    /// Replaces the named filter block wholesale and flushes the full
    /// accumulated filter payload to the bound node.
    pub async fn apply_filter(&self, name: String, block: serde_json::Value) -> Result<(), PlayerError> {
        call!(self, ApplyFilter, name, block)
    }

    pub async fn remove_filter(&self, name: String) -> Result<(), PlayerError> {
        call!(self, RemoveFilter, name)
    }

    pub async fn clear_filters(&self) -> Result<(), PlayerError> {
        call!(self, ClearFilters)
    }

    pub async fn replay(&self) -> Result<(), PlayerError> {
        call!(self, Replay)
    }

    pub async fn restart(&self) -> Result<(), PlayerError> {
        self.replay().await
    }

    pub async fn back(&self) -> Result<(), PlayerError> {
        call!(self, Back)
    }

    pub async fn jump_to(&self, index: usize) -> Result<(), PlayerError> {
        call!(self, JumpTo, index)
    }

    pub async fn shuffle_queue(&self) -> Result<(), PlayerError> {
        call!(self, ShuffleQueue)
    }

    pub async fn move_track(&self, from: usize, to: usize) -> Result<(), PlayerError> {
        call!(self, MoveTrack, from, to)
    }

    pub async fn remove_track(&self, index: usize) -> Result<Track, PlayerError> {
        call!(self, RemoveTrack, index)
    }

    pub async fn clear_queue(&self) -> Result<(), PlayerError> {
        call!(self, ClearQueue)
    }

    pub async fn add_tracks(&self, tracks: Vec<Track>) -> Result<(), PlayerError> {
        call!(self, AddTracks, tracks)
    }

    /// Enqueues every track of a resolved playlist as one unit, capped at
    /// `maxPlaylistSize` and emitting a single `trackAddPlaylist` event
    /// rather than per-track `trackAdd`s.
    pub async fn add_playlist(
        &self,
        tracks: Vec<Track>,
        info: crate::track::PlaylistInfo,
    ) -> Result<(), PlayerError> {
        call!(self, AddPlaylist, tracks, info)
    }

    pub async fn remove_duplicates(&self) -> Result<usize, PlayerError> {
        call!(self, RemoveDuplicates)
    }

    pub async fn remove_by_requester(
        &self,
        requester: crate::track::Requester,
    ) -> Result<usize, PlayerError> {
        call!(self, RemoveByRequester, requester)
    }

    pub async fn get_history(&self) -> Result<Vec<Track>, PlayerError> {
        call!(self, GetHistory)
    }

    pub async fn clear_history(&self) -> Result<(), PlayerError> {
        call!(self, ClearHistory)
    }

    pub async fn set_autoplay(&self, enabled: bool) -> Result<(), PlayerError> {
        call!(self, SetAutoplay, enabled)
    }

    pub async fn get_stats(&self) -> Result<PlayerStats, PlayerError> {
        call!(self, GetStats)
    }

    pub async fn health_check(&self) -> Result<bool, PlayerError> {
        call!(self, HealthCheck)
    }

    pub async fn snapshot(&self) -> Result<crate::persistence::Snapshot, PlayerError> {
        call!(self, TakeSnapshot)
    }

    pub async fn destroy(&self) -> Result<(), PlayerError> {
        call!(self, Destroy)
    }

    pub async fn move_to_node(&self, target: Arc<Node>) -> Result<(), PlayerError> {
        call!(self, MoveToNode, target)
    }

    /// Feeds a `VOICE_STATE_UPDATE` concerning this bot's own user.
    pub fn voice_state_update(&self, session_id: String, channel_id: Option<Id<ChannelMarker>>) {
        let _ = self
            .cmd_tx
            .try_send(Command::VoiceState(session_id, channel_id));
    }

    /// Feeds a `VOICE_SERVER_UPDATE`.
    pub fn voice_server_update(&self, token: String, endpoint: Option<String>) {
        let _ = self.cmd_tx.try_send(Command::VoiceServer(token, endpoint));
    }

    /// Routes a frame from the bound node's websocket session to this
    /// player's task.
    pub fn node_frame(&self, payload: GuildPayload) {
        let _ = self.cmd_tx.try_send(Command::NodeFrame(payload));
    }
}

type Reply<T> = oneshot::Sender<Result<T, PlayerError>>;

enum Command {
    Connect(Id<ChannelMarker>, Reply<()>),
    Disconnect(Reply<()>),
    Play(Option<Track>, PlayOpts, Reply<()>),
    Pause(Reply<()>),
    Resume(Reply<()>),
    Stop(Reply<()>),
    Skip(usize, Reply<()>),
    Seek(u64, Reply<()>),
    SeekForward(u64, Reply<()>),
    SeekBackward(u64, Reply<()>),
    SetVolume(u32, Reply<()>),
    SetLoop(LoopMode, Reply<()>),
    ApplyFilter(String, serde_json::Value, Reply<()>),
    RemoveFilter(String, Reply<()>),
    ClearFilters(Reply<()>),
    Replay(Reply<()>),
    Back(Reply<()>),
    JumpTo(usize, Reply<()>),
    ShuffleQueue(Reply<()>),
    MoveTrack(usize, usize, Reply<()>),
    RemoveTrack(usize, Reply<Track>),
    ClearQueue(Reply<()>),
    AddTracks(Vec<Track>, Reply<()>),
    AddPlaylist(Vec<Track>, crate::track::PlaylistInfo, Reply<()>),
    RemoveDuplicates(Reply<usize>),
    RemoveByRequester(crate::track::Requester, Reply<usize>),
    GetHistory(Reply<Vec<Track>>),
    ClearHistory(Reply<()>),
    SetAutoplay(bool, Reply<()>),
    GetStats(Reply<PlayerStats>),
    HealthCheck(Reply<bool>),
    TakeSnapshot(Reply<crate::persistence::Snapshot>),
    MoveToNode(Arc<Node>, Reply<()>),
    Destroy(Reply<()>),
    VoiceState(String, Option<Id<ChannelMarker>>),
    VoiceServer(String, Option<String>),
    NodeFrame(GuildPayload),
}

/// Context a player task needs from the rest of the system but does not
/// own: the guild it serves, the options to apply, and the shared
/// facilities (node pool, event bus, and optionally persistence).
pub struct PlayerContext {
    pub guild_id: Id<GuildMarker>,
    pub user_id: twilight_model::id::Id<twilight_model::id::marker::UserMarker>,
    pub gateway: twilight_gateway::MessageSender,
    pub node_pool: Arc<NodePool>,
    pub events: EventBus,
    pub options: PlayerOptions,
    pub region: Option<String>,
    /// Reports whether a voice channel has zero non-bot members, for
    /// `leaveOnEmpty`. The core keeps no gateway cache of its own; the
    /// adapter layer supplies this the same way it supplies
    /// `restore_players`'s `guild_exists` check. `None` (no adapter wired
    /// in) is treated as "never empty", so `leaveOnEmpty` becomes a no-op
    /// rather than leaving prematurely.
    pub channel_empty_check: Option<Arc<dyn Fn(Id<ChannelMarker>) -> bool + Send + Sync>>,
}

impl Player {
    /// Spawns a new player task for `ctx.guild_id` and returns its handle.
    pub fn spawn(ctx: PlayerContext) -> Player {
        let (cmd_tx, cmd_rx) = mpsc::channel(ctx.options.command_queue_size);
        let (node_frame_tx, node_frame_rx) = mpsc::channel(ctx.options.command_queue_size);

        let guild_id = ctx.guild_id;
        let task = PlayerTask {
            ctx,
            cmd_rx,
            node_frame_tx,
            node_frame_rx,
            state: PlayerState::Idle,
            queue: Queue::new(0),
            current_node: None,
            handshake: VoiceHandshake::new(),
            volume: 0,
            position_ms: 0,
            last_position_update: Instant::now(),
            last_health_position_ms: 0,
            last_health_checked_at: None,
            idle_deadline: None,
            pending_destroy_at: None,
            stuck_retries: 0,
            autoplay: false,
            migration_in_flight: false,
            filters: FilterController::new(),
            created_at_ms: now_ms(),
        };

        tokio::spawn(task.run());

        Player { guild_id, cmd_tx }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct PlayerTask {
    ctx: PlayerContext,
    cmd_rx: mpsc::Receiver<Command>,
    node_frame_tx: mpsc::Sender<GuildFrame>,
    node_frame_rx: mpsc::Receiver<GuildFrame>,

    state: PlayerState,
    queue: Queue,
    current_node: Option<Arc<Node>>,
    handshake: VoiceHandshake,

    volume: u32,
    position_ms: u64,
    last_position_update: Instant,

    /// `position_ms` and wall-clock time as of the last [`Self::health_tick`]
    /// while playing; `None` whenever the player isn't playing (paused,
    /// just (re)started, stuck, …), so a gap never counts as a stall.
    last_health_position_ms: u64,
    last_health_checked_at: Option<Instant>,

    idle_deadline: Option<Instant>,
    pending_destroy_at: Option<Instant>,
    stuck_retries: u32,
    autoplay: bool,
    migration_in_flight: bool,
    filters: FilterController,
    created_at_ms: u64,
}

impl PlayerTask {
    /// Allows a node session to route frames for this guild here. The
    /// caller (player pool) must have already matched the frame's
    /// `guild_id` to this player.
    pub fn node_frame_sender(&self) -> mpsc::Sender<GuildFrame> {
        self.node_frame_tx.clone()
    }

    #[instrument(skip(self), fields(guild = %self.ctx.guild_id))]
    async fn run(mut self) {
        self.volume = self.ctx.options.default_volume;
        self.queue = Queue::new(self.ctx.options.history_size);

        let mut health_timer = tokio::time::interval(
            self.ctx
                .options
                .health_monitor_interval
                .max(Duration::from_secs(1)),
        );
        health_timer.tick().await;

        loop {
            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if self.handle_command(cmd).await {
                                return;
                            }
                        }
                        None => return,
                    }
                }

                Some(frame) = self.node_frame_rx.recv() => {
                    self.handle_node_frame(frame).await;
                }

                _ = sleep_until_opt(self.idle_deadline) => {
                    self.on_idle_fire().await;
                }

                _ = health_timer.tick(), if self.ctx.options.enable_health_monitor => {
                    self.health_tick().await;
                }
            }
        }
    }

    /// Returns `true` if the task should stop running (destroyed).
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Connect(channel_id, reply) => {
                let _ = reply.send(self.connect(channel_id).await);
            }
            Command::Disconnect(reply) => {
                self.leave_voice();
                self.state = PlayerState::Idle;
                let _ = reply.send(Ok(()));
            }
            Command::Play(track, opts, reply) => {
                let result = self.play(track, opts).await;
                let _ = reply.send(result);
            }
            Command::Pause(reply) => {
                let result = self.set_paused(true).await;
                let _ = reply.send(result);
            }
            Command::Resume(reply) => {
                let result = self.set_paused(false).await;
                let _ = reply.send(result);
            }
            Command::Stop(reply) => {
                let result = self.stop().await;
                let _ = reply.send(result);
            }
            Command::Skip(n, reply) => {
                let result = self.skip(n).await;
                let _ = reply.send(result);
            }
            Command::Seek(ms, reply) => {
                let result = self.seek(ms).await;
                let _ = reply.send(result);
            }
            Command::SeekForward(delta, reply) => {
                let target = self.current_position_ms().saturating_add(delta);
                let result = self.seek(target).await;
                let _ = reply.send(result);
            }
            Command::SeekBackward(delta, reply) => {
                let target = self.current_position_ms().saturating_sub(delta);
                let result = self.seek(target).await;
                let _ = reply.send(result);
            }
            Command::SetVolume(volume, reply) => {
                let result = self.set_volume(volume).await;
                let _ = reply.send(result);
            }
            Command::SetLoop(mode, reply) => {
                self.queue.set_loop(mode);
                self.ctx.events.emit(Event::LoopChange(self.ctx.guild_id, mode));
                self.save_async();
                let _ = reply.send(Ok(()));
            }
            Command::ApplyFilter(name, block, reply) => {
                let payload = self.filters.apply(name, block);
                let result = self.flush_filters(payload).await;
                let _ = reply.send(result);
            }
            Command::RemoveFilter(name, reply) => {
                let payload = self.filters.remove(&name);
                let result = self.flush_filters(payload).await;
                let _ = reply.send(result);
            }
            Command::ClearFilters(reply) => {
                let payload = self.filters.clear();
                let result = self.flush_filters(payload).await;
                let _ = reply.send(result);
            }
            Command::Replay(reply) => {
                let result = self.replay().await;
                let _ = reply.send(result);
            }
            Command::Back(reply) => {
                let result = self.back().await;
                let _ = reply.send(result);
            }
            Command::JumpTo(index, reply) => {
                let result = self.jump_to(index).await;
                let _ = reply.send(result);
            }
            Command::ShuffleQueue(reply) => {
                self.queue.shuffle();
                self.save_async();
                let _ = reply.send(Ok(()));
            }
            Command::MoveTrack(from, to, reply) => {
                let result = self
                    .queue
                    .move_from_to(from, to)
                    .map_err(PlayerError::Queue);
                if result.is_ok() {
                    self.save_async();
                }
                let _ = reply.send(result);
            }
            Command::RemoveTrack(index, reply) => {
                let result = self.queue.remove_at(index).map_err(PlayerError::Queue);
                if let Ok(track) = &result {
                    self.ctx
                        .events
                        .emit(Event::TrackRemove(self.ctx.guild_id, track.clone()));
                    self.save_async();
                }
                let _ = reply.send(result);
            }
            Command::ClearQueue(reply) => {
                self.queue.clear();
                self.evaluate_idle();
                self.save_async();
                let _ = reply.send(Ok(()));
            }
            Command::AddTracks(tracks, reply) => {
                let result = self.add_tracks(tracks).await;
                let _ = reply.send(result);
            }
            Command::AddPlaylist(tracks, info, reply) => {
                let result = self.add_playlist(tracks, info).await;
                let _ = reply.send(result);
            }
            Command::RemoveDuplicates(reply) => {
                let removed = self.queue.remove_duplicates();
                self.save_async();
                let _ = reply.send(Ok(removed));
            }
            Command::RemoveByRequester(requester, reply) => {
                let removed = self.queue.remove_by_requester(&requester);
                self.save_async();
                let _ = reply.send(Ok(removed));
            }
            Command::GetHistory(reply) => {
                let _ = reply.send(Ok(self.queue.history().cloned().collect()));
            }
            Command::ClearHistory(reply) => {
                self.queue.clear_history();
                let _ = reply.send(Ok(()));
            }
            Command::SetAutoplay(enabled, reply) => {
                self.autoplay = enabled;
                let _ = reply.send(Ok(()));
            }
            Command::GetStats(reply) => {
                let _ = reply.send(Ok(self.stats()));
            }
            Command::HealthCheck(reply) => {
                let healthy = match &self.current_node {
                    Some(node) => node.state.read().await.healthy,
                    None => false,
                };
                let _ = reply.send(Ok(healthy));
            }
            Command::TakeSnapshot(reply) => {
                let snapshot = self.snapshot();
                let _ = reply.send(Ok(snapshot));
            }
            Command::MoveToNode(target, reply) => {
                let result = self.move_to_node(target).await;
                let _ = reply.send(result);
            }
            Command::Destroy(reply) => {
                self.destroy().await;
                let _ = reply.send(Ok(()));
                return true;
            }
            Command::VoiceState(session_id, channel_id) => {
                self.on_voice_state(session_id, channel_id).await;
            }
            Command::VoiceServer(token, endpoint) => {
                self.on_voice_server(token, endpoint).await;
            }
            Command::NodeFrame(payload) => {
                self.handle_guild_payload(payload).await;
            }
        }

        false
    }

    async fn connect(&mut self, channel_id: Id<ChannelMarker>) -> Result<(), PlayerError> {
        // Already joined to this channel with a live credential and a track
        // in flight: re-entrant connect (e.g. a second `play()` call) must
        // not interrupt it by re-running the handshake.
        if self.handshake.channel_id() == Some(channel_id)
            && self.handshake.credential().is_ready()
            && matches!(self.state, PlayerState::Playing | PlayerState::Paused)
        {
            return Ok(());
        }

        if self.current_node.is_none() {
            let node = self
                .ctx
                .node_pool
                .pick_for_new_player(self.ctx.region.as_deref())
                .await
                .map_err(|_| PlayerError::NoNodeAvailable)?;
            node.record_call();
            self.current_node = Some(node);
        }

        self.state = PlayerState::Connecting;
        crate::handshake::send_voice_state(
            &self.ctx.gateway,
            self.ctx.guild_id,
            Some(channel_id),
            false,
            false,
        )
        .map_err(|_| PlayerError::NotConnected)?;

        self.ctx
            .events
            .emit(Event::PlayerJoin(self.ctx.guild_id, channel_id));

        self.wait_for_credential().await?;

        // `play()` will advance this to `Playing` once `updatePlayer`
        // succeeds; until then the player is bound but idle.
        self.state = PlayerState::Connected;
        Ok(())
    }

    fn leave_voice(&mut self) {
        let _ = crate::handshake::send_voice_state(
            &self.ctx.gateway,
            self.ctx.guild_id,
            None,
            false,
            false,
        );
        self.ctx.events.emit(Event::PlayerLeave(self.ctx.guild_id));
    }

    /// Waits up to 2s for the voice handshake to complete.
    async fn wait_for_credential(&mut self) -> Result<(), PlayerError> {
        if self.handshake.credential().is_ready() {
            return Ok(());
        }

        let deadline = Instant::now() + Duration::from_millis(2_000);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PlayerError::CredentialTimeout);
            }

            match tokio::time::timeout(remaining, self.cmd_rx.recv()).await {
                Ok(Some(cmd)) => {
                    self.handle_command(cmd).await;
                    if self.handshake.credential().is_ready() {
                        return Ok(());
                    }
                }
                Ok(None) => return Err(PlayerError::Destroyed),
                Err(_) => return Err(PlayerError::CredentialTimeout),
            }
        }
    }

    async fn on_voice_state(&mut self, session_id: String, channel_id: Option<Id<ChannelMarker>>) {
        match self.handshake.on_voice_state(session_id, channel_id) {
            HandshakeEvent::Disconnected => {
                self.ctx.events.emit(Event::VoiceDisconnect(self.ctx.guild_id));
            }
            HandshakeEvent::CredentialReady => {
                self.ctx.events.emit(Event::VoiceStateUpdate(self.ctx.guild_id));
            }
            HandshakeEvent::Pending => {}
        }
    }

    async fn on_voice_server(&mut self, token: String, endpoint: Option<String>) {
        if let HandshakeEvent::CredentialReady = self.handshake.on_voice_server(token, endpoint) {
            self.ctx.events.emit(Event::VoiceServerUpdate(self.ctx.guild_id));
        }
    }

    fn voice_patch(&self) -> Option<VoiceStatePatch> {
        let credential = self.handshake.credential();
        match credential {
            Credential {
                session_id: Some(session_id),
                token: Some(token),
                endpoint: Some(endpoint),
            } => Some(VoiceStatePatch {
                token: token.clone(),
                endpoint: endpoint.clone(),
                session_id: session_id.clone(),
            }),
            _ => None,
        }
    }

    /// The play pipeline: pick a track, ensure connected, patch the node.
    async fn play(&mut self, track: Option<Track>, opts: PlayOpts) -> Result<(), PlayerError> {
        let track = match track {
            Some(track) => track,
            None => self.queue.shift().ok_or(PlayerError::QueueEmpty)?,
        };

        if !track.is_playable() {
            return Err(PlayerError::TrackNotPlayable);
        }

        if self.handshake.channel_id().is_some() && !self.handshake.credential().is_ready() {
            self.wait_for_credential().await?;
        }

        let node = self.current_node.clone().ok_or(PlayerError::NotConnected)?;
        let session_id = node
            .state
            .read()
            .await
            .session_id
            .clone()
            .ok_or(PlayerError::NotConnected)?;

        let patch = UpdatePlayerPatch {
            voice: self.voice_patch(),
            encoded_track: Some(track.encoded.clone()),
            position_ms: opts.start_time_ms.or(Some(0)),
            volume: Some(self.volume),
            filters: if self.filters.is_empty() {
                None
            } else {
                Some(self.filters.payload())
            },
            ..Default::default()
        };

        let guild_numeric: u64 = self.ctx.guild_id.get();

        match node
            .rest
            .update_player(&session_id, guild_numeric, &patch, opts.no_replace)
            .await
        {
            Ok(()) => {
                self.queue.set_current(Some(track.clone()));
                self.state = PlayerState::Playing;
                self.position_ms = opts.start_time_ms.unwrap_or(0);
                self.last_position_update = Instant::now();
                self.last_health_checked_at = None;
                self.stuck_retries = 0;
                self.idle_deadline = None;
                self.ctx.events.emit(Event::TrackStart(self.ctx.guild_id, track));
                self.save_async();
                Ok(())
            }
            Err(err) => {
                self.state = PlayerState::Errored;
                self.ctx
                    .events
                    .emit(Event::TrackError {
                        guild_id: self.ctx.guild_id,
                        track,
                        message: err.to_string(),
                    });
                Err(PlayerError::Rest(err))
            }
        }
    }

    async fn set_paused(&mut self, paused: bool) -> Result<(), PlayerError> {
        let node = self.current_node.clone().ok_or(PlayerError::NotConnected)?;
        let session_id = node
            .state
            .read()
            .await
            .session_id
            .clone()
            .ok_or(PlayerError::NotConnected)?;

        let patch = UpdatePlayerPatch {
            paused: Some(paused),
            ..Default::default()
        };

        node.rest
            .update_player(&session_id, self.ctx.guild_id.get(), &patch, false)
            .await
            .map_err(PlayerError::Rest)?;

        self.sync_position();
        self.state = if paused {
            PlayerState::Paused
        } else {
            PlayerState::Playing
        };

        if paused {
            self.ctx.events.emit(Event::Pause(self.ctx.guild_id));
        } else {
            self.ctx.events.emit(Event::Resume(self.ctx.guild_id));
        }
        self.save_async();

        Ok(())
    }

    async fn stop(&mut self) -> Result<(), PlayerError> {
        let node = self.current_node.clone().ok_or(PlayerError::NotConnected)?;
        let session_id = node
            .state
            .read()
            .await
            .session_id
            .clone()
            .ok_or(PlayerError::NotConnected)?;

        let patch = UpdatePlayerPatch {
            encoded_track: Some(None),
            ..Default::default()
        };

        node.rest
            .update_player(&session_id, self.ctx.guild_id.get(), &patch, false)
            .await
            .map_err(PlayerError::Rest)?;

        self.queue.set_current(None);
        self.state = PlayerState::Idle;
        self.ctx.events.emit(Event::Stop(self.ctx.guild_id));
        self.evaluate_idle();
        self.save_async();

        Ok(())
    }

    async fn skip(&mut self, n: usize) -> Result<(), PlayerError> {
        for _ in 0..n.saturating_sub(1) {
            self.queue.shift();
        }
        self.play_next(TrackEndReason::Stopped).await
    }

    async fn seek(&mut self, position_ms: u64) -> Result<(), PlayerError> {
        let node = self.current_node.clone().ok_or(PlayerError::NotConnected)?;
        let session_id = node
            .state
            .read()
            .await
            .session_id
            .clone()
            .ok_or(PlayerError::NotConnected)?;

        let patch = UpdatePlayerPatch {
            position_ms: Some(position_ms),
            ..Default::default()
        };

        node.rest
            .update_player(&session_id, self.ctx.guild_id.get(), &patch, false)
            .await
            .map_err(PlayerError::Rest)?;

        self.position_ms = position_ms;
        self.last_position_update = Instant::now();
        // A seek is a deliberate jump, not playback progress (or its
        // absence) — don't let it read as a stall (or mask one) on the
        // next health tick.
        self.last_health_checked_at = None;
        self.ctx.events.emit(Event::Seek(self.ctx.guild_id, position_ms));
        self.save_async();

        Ok(())
    }

    async fn set_volume(&mut self, volume: u32) -> Result<(), PlayerError> {
        let volume = volume.min(1000);
        if let Some(node) = self.current_node.clone() {
            let session_id = node.state.read().await.session_id.clone();
            if let Some(session_id) = session_id {
                let patch = UpdatePlayerPatch {
                    volume: Some(volume),
                    ..Default::default()
                };
                node.rest
                    .update_player(&session_id, self.ctx.guild_id.get(), &patch, false)
                    .await
                    .map_err(PlayerError::Rest)?;
            }
        }

        self.volume = volume;
        self.ctx.events.emit(Event::VolumeChange(self.ctx.guild_id, volume));
        self.save_async();

        Ok(())
    }

    /// Flushes the full accumulated filter payload to the bound node, if
    /// one is attached. A player not yet connected simply holds the filter
    /// state locally until `play` binds it to a node.
    async fn flush_filters(&mut self, payload: serde_json::Value) -> Result<(), PlayerError> {
        if let Some(node) = self.current_node.clone() {
            let session_id = node.state.read().await.session_id.clone();
            if let Some(session_id) = session_id {
                let patch = UpdatePlayerPatch {
                    filters: Some(payload),
                    ..Default::default()
                };
                node.rest
                    .update_player(&session_id, self.ctx.guild_id.get(), &patch, false)
                    .await
                    .map_err(PlayerError::Rest)?;
            }
        }

        self.save_async();
        Ok(())
    }

    async fn replay(&mut self) -> Result<(), PlayerError> {
        let current = self.queue.current().cloned().ok_or(PlayerError::QueueEmpty)?;
        self.play(Some(current), PlayOpts::default()).await
    }

    async fn back(&mut self) -> Result<(), PlayerError> {
        let track = self.queue.back_one().ok_or(PlayerError::QueueEmpty)?;
        self.play(Some(track), PlayOpts::default()).await
    }

    async fn jump_to(&mut self, index: usize) -> Result<(), PlayerError> {
        let track = self.queue.remove_at(index).map_err(PlayerError::Queue)?;
        self.play(Some(track), PlayOpts::default()).await
    }

    async fn add_tracks(&mut self, tracks: Vec<Track>) -> Result<(), PlayerError> {
        const CHUNK: usize = 50;

        let mut added = 0;
        for chunk in tracks.chunks(CHUNK) {
            for track in chunk {
                if self.queue.len() >= self.ctx.options.max_queue_size {
                    break;
                }
                if !self.push_track_checked(track.clone()) {
                    continue;
                }
                added += 1;
                self.ctx
                    .events
                    .emit(Event::TrackAdd(self.ctx.guild_id, track.clone()));
            }
            // yield the scheduler between chunks so a large playlist import
            // doesn't starve other guilds' commands on this runtime.
            tokio::task::yield_now().await;
        }

        self.ctx
            .events
            .emit(Event::TracksAdd(self.ctx.guild_id, added));

        if !self.is_playing_or_paused() && self.queue.current().is_none() {
            self.idle_deadline = None;
            let _ = self.play(None, PlayOpts::default()).await;
        }

        self.save_async();
        Ok(())
    }

    /// Enqueues a resolved playlist as one unit: capped at
    /// `maxPlaylistSize` (and the overall `maxQueueSize`), deduplicated per
    /// `allowDuplicates` like any other enqueue, and reported as a single
    /// `trackAddPlaylist` event rather than per-track ones.
    async fn add_playlist(
        &mut self,
        tracks: Vec<Track>,
        info: crate::track::PlaylistInfo,
    ) -> Result<(), PlayerError> {
        let capped = tracks
            .into_iter()
            .take(self.ctx.options.max_playlist_size);

        let mut added = 0;
        for track in capped {
            if self.queue.len() >= self.ctx.options.max_queue_size {
                break;
            }
            if self.push_track_checked(track) {
                added += 1;
            }
        }

        self.ctx
            .events
            .emit(Event::TrackAddPlaylist(self.ctx.guild_id, info, added));

        if !self.is_playing_or_paused() && self.queue.current().is_none() {
            self.idle_deadline = None;
            let _ = self.play(None, PlayOpts::default()).await;
        }

        self.save_async();
        Ok(())
    }

    /// Adds `track` to the queue unless `allowDuplicates` is disabled and a
    /// case-folded `(title, author)` match is already queued or current.
    /// Returns whether the track was actually added.
    fn push_track_checked(&mut self, track: Track) -> bool {
        if !self.ctx.options.allow_duplicates && self.queue.is_duplicate(&track) {
            return false;
        }
        self.queue.add(track);
        true
    }

    /// Advances the queue after a track ends, honoring loop mode and
    /// autoplay, or declares the queue ended.
    async fn play_next(&mut self, reason: TrackEndReason) -> Result<(), PlayerError> {
        if let Some(finished) = self.queue.current().cloned() {
            self.ctx.events.emit(Event::TrackEnd {
                guild_id: self.ctx.guild_id,
                track: finished,
                reason,
            });
        }

        match self.play(None, PlayOpts::default()).await {
            Ok(()) => Ok(()),
            Err(PlayerError::QueueEmpty) => {
                if self.autoplay {
                    if self.try_autoplay().await {
                        return self.play(None, PlayOpts::default()).await;
                    }
                }
                self.queue.set_current(None);
                self.state = PlayerState::Idle;
                self.ctx.events.emit(Event::QueueEnd(self.ctx.guild_id));
                self.evaluate_idle();
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Searches for one related track from the last-played track's
    /// title/author and enqueues it if it isn't already in history.
    async fn try_autoplay(&mut self) -> bool {
        let Some(node) = self.current_node.clone() else {
            return false;
        };
        let Some(seed) = self.queue.history().last().cloned() else {
            return false;
        };

        let query = format!(
            "{}:{} {}",
            self.ctx.options.search_engine, seed.title, seed.author
        );

        let result = match node.rest.load_tracks(&query).await {
            Ok(result) => result,
            Err(err) => {
                warn!(%err, "autoplay search failed");
                return false;
            }
        };

        for candidate in result.into_tracks() {
            let already_seen = self.queue.has(candidate.id)
                || self
                    .queue
                    .history()
                    .iter()
                    .any(|t| t.identifier == candidate.identifier);
            if !already_seen {
                self.queue.add(candidate);
                return true;
            }
        }

        false
    }

    /// The position the player would report right now: stored position plus
    /// elapsed wall clock while playing, clamped to track duration, with a
    /// small fixed offset to compensate for buffering lag.
    fn current_position_ms(&self) -> u64 {
        const OPTIMISTIC_OFFSET_MS: u64 = 200;

        let mut position = self.position_ms;
        if self.state == PlayerState::Playing {
            position = position
                .saturating_add(self.last_position_update.elapsed().as_millis() as u64)
                .saturating_add(OPTIMISTIC_OFFSET_MS);
        }

        if let Some(current) = self.queue.current() {
            if current.duration_ms > 0 {
                position = position.min(current.duration_ms);
            }
        }

        position
    }

    fn sync_position(&mut self) {
        self.position_ms = self.current_position_ms();
        self.last_position_update = Instant::now();
    }

    /// Whether a track is currently in flight (playing or paused on it).
    /// The start-gating call sites use this instead of `state == Idle`
    /// since a freshly-connected, stuck, or just-ended player is also a
    /// valid point to kick off playback.
    fn is_playing_or_paused(&self) -> bool {
        matches!(self.state, PlayerState::Playing | PlayerState::Paused)
    }

    fn stats(&self) -> PlayerStats {
        PlayerStats {
            state: self.state,
            position_ms: self.current_position_ms(),
            volume: self.volume,
            queue_len: self.queue.len(),
            loop_mode: self.queue.loop_mode(),
            node_id: self.current_node.as_ref().map(|n| n.id.to_string()),
        }
    }

    fn snapshot(&self) -> crate::persistence::Snapshot {
        crate::persistence::Snapshot {
            guild_id: self.ctx.guild_id.to_string(),
            voice_channel_id: self.handshake.channel_id().map(|c| c.to_string()),
            text_channel_id: None,
            state: self.state,
            playing: self.state == PlayerState::Playing,
            paused: self.state == PlayerState::Paused,
            volume: self.volume,
            position_ms: self.current_position_ms(),
            loop_mode: self.queue.loop_mode(),
            current: self.queue.current().cloned(),
            queue: self.queue.upcoming().cloned().collect(),
            history: self.queue.history().cloned().collect(),
            filters: self.filters.payload(),
            node_id: self.current_node.as_ref().map(|n| n.id.to_string()),
            created_at_ms: self.created_at_ms,
        }
    }

    /// Fires the save off into a background task rather than awaiting it
    /// inline, per the save policy: persistence must never block playback.
    fn save_async(&self) {
        // Persistence wiring (storage handle, coalescing) lives in the
        // player pool, which owns the `Storage` instance; this task only
        // needs to ask for a save whenever a save-triggering mutation
        // happens. The pool debounces repeated requests within its 200ms
        // coalescing window.
        self.ctx.events.emit(Event::StateChange(self.ctx.guild_id, self.state));
    }

    async fn handle_node_frame(&mut self, frame: GuildFrame) {
        self.handle_guild_payload(frame.payload).await;
    }

    async fn handle_guild_payload(&mut self, payload: GuildPayload) {
        match payload {
            GuildPayload::Update(update) => {
                if let Some(position) = update.state.position {
                    self.position_ms = position;
                    self.last_position_update = Instant::now();
                }
            }
            GuildPayload::Event(event) => self.handle_node_event(event).await,
        }
    }

    async fn handle_node_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::TrackStart { .. } => {}
            NodeEvent::TrackEnd { reason, .. } => {
                self.state = PlayerState::Ended;
                let reason = map_end_reason(&reason);
                if reason.advances_queue() {
                    // `play_next` resolves `Ended` to `Playing` (next track)
                    // or `Idle` (queue exhausted) per the state diagram.
                    let _ = self.play_next(reason).await;
                } else {
                    self.queue.set_current(None);
                    self.state = PlayerState::Idle;
                    self.evaluate_idle();
                }
            }
            NodeEvent::TrackException { message, .. } => {
                self.state = PlayerState::Errored;
                if let Some(track) = self.queue.current().cloned() {
                    self.ctx.events.emit(Event::TrackError {
                        guild_id: self.ctx.guild_id,
                        track,
                        message,
                    });
                }
                let _ = self.play_next(TrackEndReason::LoadFailed).await;
            }
            NodeEvent::TrackStuck { threshold_ms, .. } => {
                self.state = PlayerState::Stuck;
                if let Some(track) = self.queue.current().cloned() {
                    self.ctx.events.emit(Event::TrackStuck {
                        guild_id: self.ctx.guild_id,
                        track,
                        threshold_ms,
                    });
                }
                self.recover_from_stuck().await;
            }
            NodeEvent::WebSocketClosed { .. } => {
                if !self.migration_in_flight {
                    self.try_migrate().await;
                }
            }
        }
    }

    /// Stuck recovery: try seeking to the current position, then a full
    /// replay, each attempt 2s apart, up to `maxStuckRetries`.
    async fn recover_from_stuck(&mut self) {
        if !self.ctx.options.retry_on_stuck || self.stuck_retries >= self.ctx.options.max_stuck_retries
        {
            self.stuck_retries = 0;
            let _ = self.play_next(TrackEndReason::Stopped).await;
            return;
        }

        self.stuck_retries += 1;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let position = self.current_position_ms();
        if self.seek(position).await.is_ok() {
            self.state = PlayerState::Playing;
            return;
        }

        if self.replay().await.is_ok() {
            self.stuck_retries = 0;
            return;
        }

        let _ = self.play_next(TrackEndReason::Stopped).await;
    }

    /// Periodic health monitor: detects stalled playback and dead nodes.
    ///
    /// Stall detection compares the *node-reported* position (`position_ms`,
    /// only ever advanced by an incoming `playerUpdate` frame or a deliberate
    /// action that resets the baseline — see `last_health_checked_at`)
    /// against wall-clock time elapsed since the previous tick, not the
    /// locally-extrapolated `current_position_ms()`: that extrapolation is
    /// derived from the same baseline it would be compared against, so it
    /// can never show less progress than expected and would never catch a
    /// node that has stopped advancing position at all.
    async fn health_tick(&mut self) {
        if self.state == PlayerState::Playing {
            if let Some(last_checked) = self.last_health_checked_at {
                let elapsed_ms = Instant::now().saturating_duration_since(last_checked).as_millis() as u64;
                if elapsed_ms > 0 {
                    let actual_progress_ms = self.position_ms.saturating_sub(self.last_health_position_ms);
                    let progress_ratio = actual_progress_ms as f64 / elapsed_ms as f64;
                    if progress_ratio < 0.9 {
                        warn!(progress_ratio, "playback appears stalled, attempting correction");
                        let reported = self.current_position_ms();
                        if self.seek(reported.saturating_add(1000)).await.is_err()
                            && self.replay().await.is_err()
                        {
                            let _ = self.play_next(TrackEndReason::Stopped).await;
                        }
                    }
                }
            }

            self.last_health_position_ms = self.position_ms;
            self.last_health_checked_at = Some(Instant::now());
        } else {
            self.last_health_checked_at = None;
        }

        let disconnected = match &self.current_node {
            Some(node) => !node.state.read().await.connected,
            None => false,
        };
        if disconnected && !self.migration_in_flight {
            self.try_migrate().await;
        }
    }

    async fn try_migrate(&mut self) {
        let target = match self.ctx.node_pool.pick_for_new_player(self.ctx.region.as_deref()).await {
            Ok(node) => node,
            Err(_) => {
                self.ctx.events.emit(Event::Error(format!(
                    "guild {}: no healthy node available for migration",
                    self.ctx.guild_id
                )));
                return;
            }
        };

        let _ = self.move_to_node(target).await;
    }

    /// Moves this player to a different node, re-issuing the current track
    /// at its last known position.
    async fn move_to_node(&mut self, target: Arc<Node>) -> Result<(), PlayerError> {
        self.migration_in_flight = true;

        let was_playing = self.state == PlayerState::Playing;
        let position = self.current_position_ms();
        let from = self.current_node.clone();

        if let Some(old) = &from {
            if let Some(session_id) = old.state.read().await.session_id.clone() {
                let patch = UpdatePlayerPatch {
                    paused: Some(true),
                    ..Default::default()
                };
                let _ = old
                    .rest
                    .update_player(&session_id, self.ctx.guild_id.get(), &patch, false)
                    .await;
            }
        }

        let from_id = from.as_ref().map(|n| n.id.clone());
        target.record_call();
        self.current_node = Some(target.clone());

        if was_playing {
            if let Some(current) = self.queue.current().cloned() {
                let opts = PlayOpts {
                    start_time_ms: Some(position),
                    no_replace: false,
                };
                self.play(Some(current), opts).await?;
            }
        }

        if let Some(from_id) = from_id {
            self.ctx.events.emit(Event::PlayerMoved {
                guild_id: self.ctx.guild_id,
                from: from_id,
                to: target.id.clone(),
            });
        }

        self.migration_in_flight = false;
        Ok(())
    }

    /// Centralized idle handling: re-evaluated whenever the player stops
    /// playing. Exactly one of leaveOnEnd / leaveOnEmpty / autoLeave /
    /// idleTimeout applies, checked in that priority order.
    fn evaluate_idle(&mut self) {
        self.idle_deadline = None;
        self.pending_destroy_at = None;

        if self.state == PlayerState::Playing || self.state == PlayerState::Paused {
            return;
        }

        let opts = &self.ctx.options;

        if opts.leave_on_end && self.queue.is_empty() {
            self.leave_voice();
            self.state = PlayerState::Idle;
        } else if opts.leave_on_empty && self.channel_is_empty() {
            self.idle_deadline = Some(Instant::now() + opts.leave_on_empty_delay);
        } else if opts.auto_leave && self.queue.is_empty() {
            self.idle_deadline = Some(Instant::now() + opts.auto_leave_delay);
        } else if !opts.idle_timeout.is_zero() && self.queue.is_empty() {
            self.pending_destroy_at = Some(Instant::now() + opts.idle_timeout);
            self.idle_deadline = self.pending_destroy_at;
        }
    }

    /// Whether the player's voice channel currently has zero non-bot
    /// members, per the adapter-supplied `channel_empty_check`. With no
    /// adapter wired in, `leaveOnEmpty` never fires.
    fn channel_is_empty(&self) -> bool {
        let Some(check) = &self.ctx.channel_empty_check else {
            return false;
        };
        let Some(channel_id) = self.handshake.channel_id() else {
            return false;
        };
        check(channel_id)
    }

    /// Fires when an idle/empty/leave timer expires. Re-checks preconditions
    /// against live state rather than acting on whatever was true when the
    /// timer was scheduled.
    async fn on_idle_fire(&mut self) {
        self.idle_deadline = None;

        if self.pending_destroy_at.take().is_some() {
            if self.queue.is_empty() {
                self.destroy().await;
            }
            return;
        }

        if self.ctx.options.leave_on_empty {
            if !self.channel_is_empty() {
                return; // someone (re)joined before the timer fired
            }
        } else if !self.queue.is_empty() {
            // a track was queued since this timer was scheduled
            return;
        }

        self.leave_voice();
        self.state = PlayerState::Idle;
    }

    async fn destroy(&mut self) {
        if let Some(node) = self.current_node.take() {
            if let Some(session_id) = node.state.read().await.session_id.clone() {
                let _ = node
                    .rest
                    .destroy_player(&session_id, self.ctx.guild_id.get())
                    .await;
            }
        }

        self.leave_voice();
        self.state = PlayerState::Destroyed;
        self.ctx.events.emit(Event::PlayerDestroy(self.ctx.guild_id));
        self.ctx.events.emit(Event::Destroy(self.ctx.guild_id));
    }
}

fn map_end_reason(reason: &str) -> TrackEndReason {
    match reason {
        "LOAD_FAILED" | "loadFailed" => TrackEndReason::LoadFailed,
        "STOPPED" | "stopped" => TrackEndReason::Stopped,
        "REPLACED" | "replaced" => TrackEndReason::Replaced,
        "CLEANUP" | "cleanup" => TrackEndReason::Cleanup,
        _ => TrackEndReason::Finished,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
