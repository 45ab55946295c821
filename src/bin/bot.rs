//! Minimal chat-platform adapter wiring one shard to an [`Orchestrator`].
//!
//! Purely illustrative: it owns no core logic, just enough gateway plumbing
//! to prove the crate's pieces compose into a runnable process.

use std::collections::{HashMap, HashSet};
use std::env;
use std::sync::{Arc, Mutex};

use flotilla::config::{env_or, NodeConfig, PlayerOptions};
use flotilla::orchestrator::Orchestrator;
use flotilla::persistence::{InMemoryStorage, JsonFileStorage, Storage};

use twilight_cache_inmemory::InMemoryCache;
use twilight_gateway::{Event, Intents, Shard, ShardId};
use twilight_model::gateway::payload::incoming::{VoiceServerUpdate, VoiceStateUpdate};
use twilight_model::id::marker::{ChannelMarker, UserMarker};
use twilight_model::id::Id;

/// Voice-channel membership, tracked from raw `VOICE_STATE_UPDATE` traffic
/// rather than a cache index, since `twilight-cache-inmemory` has no
/// per-channel query: every update drops the user from whichever channel it
/// previously occupied and re-inserts it into the new one (or nowhere, on
/// disconnect).
type ChannelMembers = Arc<Mutex<HashMap<Id<ChannelMarker>, HashSet<Id<UserMarker>>>>>;

fn track_voice_state(tracker: &ChannelMembers, update: &VoiceStateUpdate) {
    let mut channels = tracker.lock().unwrap();
    for members in channels.values_mut() {
        members.remove(&update.0.user_id);
    }
    channels.retain(|_, members| !members.is_empty());

    if let Some(channel_id) = update.0.channel_id {
        channels.entry(channel_id).or_default().insert(update.0.user_id);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let token = env::var("DISCORD_TOKEN")?;
    let intents = Intents::GUILDS | Intents::GUILD_VOICE_STATES;
    let mut shard = Shard::new(ShardId::ONE, token.clone(), intents);

    let cache = Arc::new(InMemoryCache::builder().message_cache_size(0).build());
    let channel_members: ChannelMembers = Arc::new(Mutex::new(HashMap::new()));

    let storage: Arc<dyn Storage> = match env::var("PERSISTENCE_FILE") {
        Ok(path) => Arc::new(JsonFileStorage::open(path).await?),
        Err(_) => Arc::new(InMemoryStorage::new()),
    };

    let options = PlayerOptions::default();

    // Wait for the first Ready to learn the bot's own user id before the
    // orchestrator can be constructed (it needs it for node auth headers
    // and voice-state filtering).
    let orchestrator = loop {
        let event = shard.next_event().await?;
        cache.update(&event);

        if let Event::VoiceStateUpdate(ref update) = event {
            track_voice_state(&channel_members, update);
        }

        if let Event::Ready(ready) = event {
            tracing::info!(user_id = %ready.user.id, "gateway ready");

            let orchestrator = Orchestrator::new(
                options.clone(),
                ready.user.id,
                shard.sender(),
                storage.clone(),
            );

            for node in configured_nodes() {
                orchestrator.add_node(node).await;
            }

            let bot_user_id = ready.user.id;
            let cache_for_empty_check = cache.clone();
            let channel_members_for_empty_check = channel_members.clone();
            orchestrator.set_channel_empty_check(move |channel_id| {
                let members = channel_members_for_empty_check
                    .lock()
                    .unwrap()
                    .get(&channel_id)
                    .cloned()
                    .unwrap_or_default();

                members.iter().all(|user_id| {
                    *user_id == bot_user_id
                        || cache_for_empty_check
                            .user(*user_id)
                            .map(|user| user.bot())
                            .unwrap_or(false)
                })
            });

            break orchestrator;
        }
    };

    let restored = orchestrator
        .restore_players(|guild_id, channel_id| {
            let Some(channel_id) = channel_id else {
                return false;
            };
            cache.guild(guild_id).is_some() && cache.channel(channel_id).is_some()
        })
        .await
        .unwrap_or(0);
    tracing::info!(restored, "restored persisted players");

    loop {
        let event = match shard.next_event().await {
            Ok(event) => event,
            Err(source) => {
                tracing::warn!(error = %source, "error receiving gateway event");
                if source.is_fatal() {
                    break;
                }
                continue;
            }
        };

        cache.update(&event);

        match event {
            Event::VoiceStateUpdate(update) => {
                track_voice_state(&channel_members, &update);
                handle_voice_state(&orchestrator, &update).await;
            }
            Event::VoiceServerUpdate(update) => {
                handle_voice_server(&orchestrator, &update).await;
            }
            _ => {}
        }
    }

    Ok(())
}

async fn handle_voice_state(orchestrator: &Arc<Orchestrator>, update: &VoiceStateUpdate) {
    let Some(guild_id) = update.0.guild_id else {
        return;
    };
    let Some(player) = orchestrator.get_player(guild_id).await else {
        return;
    };

    if let Some((session_id, channel_id)) =
        flotilla::handshake::extract_voice_state(update, update.0.user_id)
    {
        player.voice_state_update(session_id, channel_id);
    }
}

async fn handle_voice_server(orchestrator: &Arc<Orchestrator>, update: &VoiceServerUpdate) {
    let Some(player) = orchestrator.get_player(update.guild_id).await else {
        return;
    };

    let (token, endpoint) = flotilla::handshake::extract_voice_server(update);
    player.voice_server_update(token, endpoint);
}

/// Reads `NODE_1_HOST`/`NODE_1_PORT`/`NODE_1_PASSWORD` (and `_2`, `_3`, ...)
/// until one is missing. A real deployment would read these from a config
/// file instead; this is illustrative plumbing only.
fn configured_nodes() -> Vec<NodeConfig> {
    let mut nodes = Vec::new();

    for index in 1.. {
        let host = match env::var(format!("NODE_{index}_HOST")) {
            Ok(host) => host,
            Err(_) => break,
        };
        let port: u16 = env_or(&format!("NODE_{index}_PORT"), 2333);
        let password =
            env::var(format!("NODE_{index}_PASSWORD")).unwrap_or_else(|_| "youshallnotpass".into());

        nodes.push(NodeConfig::new(host, port, password));
    }

    nodes
}
