//! Per-guild voice credential assembly.
//!
//! Discord hands voice credentials over two independent gateway event
//! streams (`VOICE_STATE_UPDATE`, `VOICE_SERVER_UPDATE`) that can arrive in
//! either order, or be redelivered. This module splices the two into one
//! `Credential`, waiting once (with a 5-second timeout) for both halves to
//! show up, as a long-lived, re-enterable piece of per-guild state so
//! reconnects and node moves can redo the splice without tearing the player
//! down.

use twilight_gateway::MessageSender;
use twilight_model::gateway::payload::incoming::{VoiceServerUpdate, VoiceStateUpdate};
use twilight_model::gateway::payload::outgoing::UpdateVoiceState;
use twilight_model::id::{
    marker::{ChannelMarker, GuildMarker},
    Id,
};

/// The three pieces of a voice connection, gathered from two event streams.
#[derive(Clone, Debug, Default)]
pub struct Credential {
    pub session_id: Option<String>,
    pub token: Option<String>,
    pub endpoint: Option<String>,
}

impl Credential {
    /// Whether all three fields are present and an `updatePlayer` voice
    /// block can be built.
    pub fn is_ready(&self) -> bool {
        self.session_id.is_some() && self.token.is_some() && self.endpoint.is_some()
    }
}

/// Per-guild voice handshake state.
///
/// Feeding the same event twice (Discord occasionally redelivers) or out of
/// order must not corrupt the credential; every handler only ever
/// overwrites the fields it owns.
#[derive(Clone, Debug, Default)]
pub struct VoiceHandshake {
    credential: Credential,
    channel_id: Option<Id<ChannelMarker>>,
}

/// What changed as a result of feeding an event into the handshake.
#[derive(Debug, Eq, PartialEq)]
pub enum HandshakeEvent {
    /// Nothing actionable yet; still waiting on more fields.
    Pending,
    /// All three credential fields are now present.
    CredentialReady,
    /// The bot's own voice state reported `channel_id: null`: a disconnect.
    Disconnected,
}

impl VoiceHandshake {
    pub fn new() -> VoiceHandshake {
        VoiceHandshake::default()
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn channel_id(&self) -> Option<Id<ChannelMarker>> {
        self.channel_id
    }

    /// Feeds a `VOICE_STATE_UPDATE` for the bot's own user.
    pub fn on_voice_state(&mut self, session_id: String, channel_id: Option<Id<ChannelMarker>>) -> HandshakeEvent {
        self.channel_id = channel_id;

        if channel_id.is_none() {
            self.credential = Credential::default();
            return HandshakeEvent::Disconnected;
        }

        self.credential.session_id = Some(session_id);
        self.check_ready()
    }

    /// Feeds a `VOICE_SERVER_UPDATE`.
    pub fn on_voice_server(&mut self, token: String, endpoint: Option<String>) -> HandshakeEvent {
        self.credential.token = Some(token);
        self.credential.endpoint = endpoint;
        self.check_ready()
    }

    fn check_ready(&self) -> HandshakeEvent {
        if self.credential.is_ready() {
            HandshakeEvent::CredentialReady
        } else {
            HandshakeEvent::Pending
        }
    }
}

/// Extracts the session id and channel id from a gateway voice state
/// update, if it concerns the bot's own user.
pub fn extract_voice_state(ev: &VoiceStateUpdate, bot_user_id: twilight_model::id::Id<twilight_model::id::marker::UserMarker>) -> Option<(String, Option<Id<ChannelMarker>>)> {
    if ev.0.user_id != bot_user_id {
        return None;
    }

    Some((ev.0.session_id.clone(), ev.0.channel_id))
}

/// Extracts the token and endpoint from a gateway voice server update.
pub fn extract_voice_server(ev: &VoiceServerUpdate) -> (String, Option<String>) {
    (ev.token.clone(), ev.endpoint.clone())
}

/// Sends Discord an opcode-4 `Update Voice State` frame to join (or, with
/// `channel_id: None`, leave) a voice channel.
///
/// Mirrors `player::manager::Manager::join`'s use of
/// `UpdateVoiceState::new`, generalized to also cover leaving.
pub fn send_voice_state(
    sender: &MessageSender,
    guild_id: Id<GuildMarker>,
    channel_id: Option<Id<ChannelMarker>>,
    self_mute: bool,
    self_deaf: bool,
) -> Result<(), twilight_gateway::error::ChannelError> {
    sender.command(&UpdateVoiceState::new(
        guild_id, channel_id, self_deaf, self_mute,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_only_after_all_three_fields_present() {
        let mut hs = VoiceHandshake::new();
        assert_eq!(
            hs.on_voice_state(String::from("sess"), Some(Id::new(1))),
            HandshakeEvent::Pending
        );
        assert_eq!(
            hs.on_voice_server(String::from("tok"), Some(String::from("ep"))),
            HandshakeEvent::CredentialReady
        );
        assert!(hs.credential().is_ready());
    }

    #[test]
    fn duplicate_voice_state_is_idempotent() {
        let mut hs = VoiceHandshake::new();
        hs.on_voice_state(String::from("sess"), Some(Id::new(1)));
        hs.on_voice_server(String::from("tok"), Some(String::from("ep")));
        let ev = hs.on_voice_state(String::from("sess"), Some(Id::new(1)));
        assert_eq!(ev, HandshakeEvent::CredentialReady);
    }

    #[test]
    fn null_channel_clears_credential_and_reports_disconnect() {
        let mut hs = VoiceHandshake::new();
        hs.on_voice_state(String::from("sess"), Some(Id::new(1)));
        hs.on_voice_server(String::from("tok"), Some(String::from("ep")));
        let ev = hs.on_voice_state(String::from("sess"), None);
        assert_eq!(ev, HandshakeEvent::Disconnected);
        assert!(!hs.credential().is_ready());
    }

    #[test]
    fn order_independent_state_then_server_or_server_then_state() {
        let mut a = VoiceHandshake::new();
        a.on_voice_state(String::from("sess"), Some(Id::new(1)));
        let ev_a = a.on_voice_server(String::from("tok"), Some(String::from("ep")));

        let mut b = VoiceHandshake::new();
        b.on_voice_server(String::from("tok"), Some(String::from("ep")));
        let ev_b = b.on_voice_state(String::from("sess"), Some(Id::new(1)));

        assert_eq!(ev_a, HandshakeEvent::CredentialReady);
        assert_eq!(ev_b, HandshakeEvent::CredentialReady);
    }
}
