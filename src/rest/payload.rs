//! Wire types for the worker's REST API (`/v4/...`).

use crate::track::{LoadResult, PlaylistInfo, Track};

use serde::{Deserialize, Serialize};

/// Raw `GET /v4/loadtracks` response envelope.
#[derive(Debug, Deserialize)]
pub struct RawLoadResult {
    #[serde(rename = "loadType")]
    pub load_type: String,
    pub data: serde_json::Value,
}

impl RawLoadResult {
    /// Normalizes the duck-typed `data` field into a [`LoadResult`],
    /// dispatching on `loadType` rather than guessing from `data`'s shape.
    pub fn normalize(self) -> LoadResult {
        match self.load_type.as_str() {
            "track" => match serde_json::from_value::<RawTrack>(self.data) {
                Ok(t) => LoadResult::Track(Box::new(t.into_track())),
                Err(_) => LoadResult::Empty,
            },
            "search" => match serde_json::from_value::<Vec<RawTrack>>(self.data) {
                Ok(tracks) => LoadResult::Search(tracks.into_iter().map(RawTrack::into_track).collect()),
                Err(_) => LoadResult::Empty,
            },
            "playlist" => match serde_json::from_value::<RawPlaylist>(self.data) {
                Ok(p) => LoadResult::Playlist {
                    info: PlaylistInfo {
                        name: p.info.name,
                        selected_track: p.info.selected_track.and_then(|i| {
                            if i < 0 {
                                None
                            } else {
                                Some(i as usize)
                            }
                        }),
                    },
                    tracks: p.tracks.into_iter().map(RawTrack::into_track).collect(),
                },
                Err(_) => LoadResult::Empty,
            },
            "error" => {
                let message = self
                    .data
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown error")
                    .to_string();
                let severity = self
                    .data
                    .get("severity")
                    .and_then(|v| v.as_str())
                    .unwrap_or("common")
                    .to_string();
                LoadResult::Error { message, severity }
            }
            _ => LoadResult::Empty,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawPlaylist {
    info: RawPlaylistInfo,
    tracks: Vec<RawTrack>,
}

#[derive(Debug, Deserialize)]
struct RawPlaylistInfo {
    name: String,
    #[serde(rename = "selectedTrack")]
    selected_track: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RawTrack {
    pub encoded: String,
    pub info: RawTrackInfo,
}

#[derive(Debug, Deserialize)]
pub struct RawTrackInfo {
    pub identifier: String,
    #[serde(rename = "isSeekable")]
    pub is_seekable: bool,
    pub author: String,
    pub length: u64,
    #[serde(rename = "isStream")]
    pub is_stream: bool,
    pub title: String,
    pub uri: Option<String>,
    #[serde(rename = "artworkUrl")]
    pub artwork_url: Option<String>,
    pub isrc: Option<String>,
    #[serde(rename = "sourceName")]
    pub source_name: String,
}

impl RawTrack {
    pub fn into_track(self) -> Track {
        Track::new(
            self.encoded,
            self.info.title,
            self.info.author,
            self.info.uri,
            self.info.identifier,
            self.info.length,
            self.info.is_seekable,
            self.info.is_stream,
            self.info.source_name,
            0,
        )
        .with_isrc(self.info.isrc)
        .with_artwork(self.info.artwork_url)
    }
}

/// `PATCH /v4/sessions/{session}/players/{guild}` request body.
#[derive(Debug, Default, Serialize)]
pub struct UpdatePlayerPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceStatePatch>,
    #[serde(rename = "encodedTrack", skip_serializing_if = "Option::is_none")]
    pub encoded_track: Option<Option<String>>,
    #[serde(rename = "position", skip_serializing_if = "Option::is_none")]
    pub position_ms: Option<u64>,
    #[serde(rename = "endTime", skip_serializing_if = "Option::is_none")]
    pub end_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct VoiceStatePatch {
    pub token: String,
    pub endpoint: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

/// `GET /v4/info` response (trimmed to the fields the core uses).
#[derive(Debug, Deserialize)]
pub struct NodeInfo {
    pub version: InfoVersion,
}

#[derive(Debug, Deserialize)]
pub struct InfoVersion {
    pub semver: String,
}

/// `GET /v4/stats` response and the `stats` websocket payload share this
/// shape.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct StatsSnapshot {
    pub players: u32,
    #[serde(rename = "playingPlayers")]
    pub playing_players: u32,
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    #[serde(rename = "frameStats")]
    pub frame_stats: Option<FrameStats>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CpuStats {
    #[serde(rename = "systemLoad")]
    pub system_load: f64,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct MemoryStats {
    pub used: u64,
    pub reservable: u64,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct FrameStats {
    pub deficit: u64,
    pub nulled: u64,
}

impl MemoryStats {
    pub fn used_fraction(&self) -> f64 {
        if self.reservable == 0 {
            0.0
        } else {
            self.used as f64 / self.reservable as f64
        }
    }
}
