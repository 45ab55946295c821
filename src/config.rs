//! Crate-wide configuration and its defaults.
//!
//! Nothing here reaches for a config-file crate: the option set is small and
//! every field has a sensible default, so a plain [`Default`] impl plus
//! optional `env::var` overrides is all that's needed.

use std::time::Duration;

/// Search/playback engine tag, e.g. `"spotify"` or `"youtubemusic"`.
pub type Engine = String;

/// Options shared by every player created through an [`Orchestrator`].
///
/// [`Orchestrator`]: crate::orchestrator::Orchestrator
#[derive(Clone, Debug)]
pub struct PlayerOptions {
    pub default_volume: u32,
    pub search_engine: Engine,
    pub playback_engine: Engine,
    pub auto_play: bool,
    pub auto_leave: bool,
    pub auto_leave_delay: Duration,
    pub leave_on_empty: bool,
    pub leave_on_empty_delay: Duration,
    pub leave_on_end: bool,
    pub idle_timeout: Duration,
    pub history_size: usize,
    pub max_queue_size: usize,
    pub max_playlist_size: usize,
    pub allow_duplicates: bool,
    pub retry_on_stuck: bool,
    pub max_stuck_retries: u32,
    pub stuck_threshold: Duration,
    pub enable_health_monitor: bool,
    pub health_monitor_interval: Duration,
    pub persistence_prefix: String,
    pub command_queue_size: usize,
}

impl Default for PlayerOptions {
    fn default() -> PlayerOptions {
        PlayerOptions {
            default_volume: 80,
            search_engine: String::from("spotify"),
            playback_engine: String::from("youtubemusic"),
            auto_play: false,
            auto_leave: true,
            auto_leave_delay: Duration::from_millis(300_000),
            leave_on_empty: false,
            leave_on_empty_delay: Duration::from_millis(60_000),
            leave_on_end: false,
            idle_timeout: Duration::from_millis(300_000),
            history_size: 50,
            max_queue_size: 1000,
            max_playlist_size: 500,
            allow_duplicates: true,
            retry_on_stuck: true,
            max_stuck_retries: 3,
            stuck_threshold: Duration::from_millis(10_000),
            enable_health_monitor: true,
            health_monitor_interval: Duration::from_millis(15_000),
            persistence_prefix: String::from("product:player:"),
            command_queue_size: 64,
        }
    }
}

/// Configuration for a single worker node, read from process configuration at
/// startup.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Unique identifier; defaults to `"host:port"` if not given explicitly.
    pub identifier: String,
    pub host: String,
    pub port: u16,
    pub password: String,
    pub secure: bool,
    pub region: Option<String>,
    pub reconnect_delay: Duration,
    pub reconnect_attempts: u32,
}

impl NodeConfig {
    /// Creates a node configuration, deriving `identifier` from `host:port`.
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> NodeConfig {
        let host = host.into();
        let identifier = format!("{}:{}", host, port);

        NodeConfig {
            identifier,
            host,
            port,
            password: password.into(),
            secure: false,
            region: None,
            reconnect_delay: Duration::from_millis(5_000),
            reconnect_attempts: 5,
        }
    }

    pub fn rest_base(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn ws_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}/v4/websocket", scheme, self.host, self.port)
    }
}

/// Reads an environment variable, falling back to `default` if unset or
/// unparsable. Mirrors the `env::var(...)` pattern used throughout the
/// adapter layer.
pub fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
