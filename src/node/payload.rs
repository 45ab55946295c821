//! Inbound worker node websocket payloads.
//!
//! The wire format tags each frame with an `op` field the way
//! `voice::ws::payload::GatewayEventDeserializer` sniffs Discord's opcode
//! field, generalized here from a numeric opcode to a string tag. We sniff
//! `op` (and, for `event` frames, the nested `type`) out of a
//! [`serde_json::Value`] rather than writing a custom `DeserializeSeed`,
//! since the tag set is small and flat.

use crate::rest::payload::StatsSnapshot;

use serde::Deserialize;

/// One parsed frame from a node's websocket stream.
#[derive(Debug)]
pub enum NodePayload {
    Ready(ReadyPayload),
    Stats(StatsSnapshot),
    PlayerUpdate(PlayerUpdatePayload),
    Event(NodeEvent),
    /// A frame whose `op` (or, for `event` frames, `type`) we don't
    /// recognize. Logged and dropped by the session loop.
    Unknown(String),
}

#[derive(Debug, Deserialize)]
pub struct ReadyPayload {
    pub resumed: bool,
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PlayerUpdatePayload {
    #[serde(rename = "guildId")]
    pub guild_id: String,
    pub state: PlayerState,
}

#[derive(Debug, Deserialize)]
pub struct PlayerState {
    pub time: i64,
    pub position: Option<u64>,
    pub connected: bool,
    pub ping: i64,
}

/// Per-guild track lifecycle and transport events.
#[derive(Debug)]
pub enum NodeEvent {
    TrackStart {
        guild_id: String,
        encoded_track: String,
    },
    TrackEnd {
        guild_id: String,
        encoded_track: String,
        reason: String,
    },
    TrackException {
        guild_id: String,
        encoded_track: String,
        message: String,
        severity: String,
    },
    TrackStuck {
        guild_id: String,
        encoded_track: String,
        threshold_ms: u64,
    },
    WebSocketClosed {
        guild_id: String,
        code: u16,
        reason: String,
        by_remote: bool,
    },
}

/// Parses one websocket text frame into a [`NodePayload`].
///
/// Returns `NodePayload::Unknown` rather than an error for anything we don't
/// recognize: a forward-compatible frame from a newer worker build should
/// never bring a session down.
pub fn parse(text: &str) -> Result<NodePayload, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(text)?;

    let op = match value.get("op").and_then(|v| v.as_str()) {
        Some(op) => op,
        None => return Ok(NodePayload::Unknown(String::from("<missing op>"))),
    };

    match op {
        "ready" => Ok(NodePayload::Ready(serde_json::from_value(value)?)),
        "stats" => Ok(NodePayload::Stats(serde_json::from_value(value)?)),
        "playerUpdate" => Ok(NodePayload::PlayerUpdate(serde_json::from_value(value)?)),
        "event" => Ok(parse_event(value)?.map_or_else(
            || NodePayload::Unknown(String::from("event")),
            NodePayload::Event,
        )),
        other => Ok(NodePayload::Unknown(other.to_string())),
    }
}

fn parse_event(value: serde_json::Value) -> Result<Option<NodeEvent>, serde_json::Error> {
    let guild_id = value
        .get("guildId")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let event_type = match value.get("type").and_then(|v| v.as_str()) {
        Some(t) => t,
        None => return Ok(None),
    };

    let encoded_track = value
        .get("encodedTrack")
        .or_else(|| value.get("track"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let event = match event_type {
        "TrackStartEvent" => NodeEvent::TrackStart {
            guild_id,
            encoded_track,
        },
        "TrackEndEvent" => NodeEvent::TrackEnd {
            guild_id,
            encoded_track,
            reason: value
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or("finished")
                .to_string(),
        },
        "TrackExceptionEvent" => NodeEvent::TrackException {
            guild_id,
            encoded_track,
            message: value
                .pointer("/exception/message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error")
                .to_string(),
            severity: value
                .pointer("/exception/severity")
                .and_then(|v| v.as_str())
                .unwrap_or("common")
                .to_string(),
        },
        "TrackStuckEvent" => NodeEvent::TrackStuck {
            guild_id,
            encoded_track,
            threshold_ms: value
                .get("thresholdMs")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
        },
        "WebSocketClosedEvent" => NodeEvent::WebSocketClosed {
            guild_id,
            code: value.get("code").and_then(|v| v.as_u64()).unwrap_or(0) as u16,
            reason: value
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            by_remote: value
                .get("byRemote")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        },
        _ => return Ok(None),
    };

    Ok(Some(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ready_frame() {
        let frame = r#"{"op":"ready","resumed":false,"sessionId":"abc123"}"#;
        match parse(frame).unwrap() {
            NodePayload::Ready(r) => assert_eq!(r.session_id, "abc123"),
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn parses_track_end_event() {
        let frame = r#"{"op":"event","type":"TrackEndEvent","guildId":"1","encodedTrack":"xyz","reason":"finished"}"#;
        match parse(frame).unwrap() {
            NodePayload::Event(NodeEvent::TrackEnd { reason, .. }) => {
                assert_eq!(reason, "finished")
            }
            other => panic!("expected TrackEnd, got {other:?}"),
        }
    }

    #[test]
    fn unknown_op_does_not_error() {
        match parse(r#"{"op":"somethingNew"}"#).unwrap() {
            NodePayload::Unknown(op) => assert_eq!(op, "somethingNew"),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }
}
