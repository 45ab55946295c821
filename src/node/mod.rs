//! A single worker node: its REST client, websocket session, and the live
//! state the pool and player consult to pick and track it.

pub mod error;
pub mod payload;
pub mod pool;
pub mod session;

pub use error::Error;
pub use pool::NodePool;

use crate::config::NodeConfig;
use crate::rest::payload::StatsSnapshot;
use crate::rest::RestClient;

use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio::time::Instant;

/// A node's identifier, taken verbatim from its [`NodeConfig::identifier`].
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct NodeId(pub String);

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mutable, frequently-updated state for one node. Guarded by a single
/// `RwLock` since reads (pool selection) vastly outnumber writes (one
/// session's own updates).
#[derive(Debug, Default)]
pub struct NodeState {
    pub connected: bool,
    pub session_id: Option<String>,
    pub stats: Option<StatsSnapshot>,
    pub ping_ms: Option<u64>,
    pub last_ping_success: Option<Instant>,
    pub reconnect_attempts: u32,
    pub healthy: bool,
}

/// A worker node: static configuration plus the live state the session loop
/// maintains and the pool reads.
pub struct Node {
    pub id: NodeId,
    pub config: NodeConfig,
    pub rest: RestClient,
    pub state: RwLock<NodeState>,
    calls: AtomicU64,
}

impl Node {
    pub fn new(config: NodeConfig) -> Node {
        let id = NodeId(config.identifier.clone());
        let rest = RestClient::new(config.rest_base(), config.password.clone());

        Node {
            id,
            config,
            rest,
            state: RwLock::new(NodeState::default()),
            calls: AtomicU64::new(0),
        }
    }

    /// Records that a player was just placed on this node. Used as the
    /// load-score tie-break.
    pub fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// The load score used by [`NodePool`] selection; lower is better.
    /// Nodes without a stats snapshot are ordered by `calls` alone, since
    /// there's nothing else to go on yet.
    pub async fn load_score(&self) -> f64 {
        let state = self.state.read().await;

        match &state.stats {
            Some(stats) => {
                let frame_penalty = stats
                    .frame_stats
                    .as_ref()
                    .map(|f| (f.deficit + f.nulled) as f64)
                    .unwrap_or(0.0);

                stats.playing_players as f64 * 2.0
                    + stats.players as f64 * 0.5
                    + stats.cpu.system_load * 100.0 * 1.5
                    + stats.memory.used_fraction() * 100.0 * 0.5
                    + frame_penalty * 10.0
                    + self.calls() as f64 / 1000.0
            }
            None => self.calls() as f64,
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Node").field("id", &self.id).finish()
    }
}
