//! A serializable point-in-time capture of one player, for save/restore.

use crate::player::PlayerState;
use crate::track::{LoopMode, Track};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub guild_id: String,
    pub voice_channel_id: Option<String>,
    pub text_channel_id: Option<String>,
    pub state: PlayerState,
    pub playing: bool,
    pub paused: bool,
    pub volume: u32,
    pub position_ms: u64,
    pub loop_mode: LoopMode,
    pub current: Option<Track>,
    pub queue: Vec<Track>,
    pub history: Vec<Track>,
    pub filters: serde_json::Value,
    pub node_id: Option<String>,
    pub created_at_ms: u64,
}
