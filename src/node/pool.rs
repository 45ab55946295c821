//! Registry of worker nodes and the selection policy used to place players.

use super::{Error, Node, NodeId};

use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// The set of configured worker nodes, keyed by [`NodeId`].
#[derive(Default)]
pub struct NodePool {
    nodes: RwLock<HashMap<NodeId, Arc<Node>>>,
}

/// Per-node health as reported by an on-demand probe.
#[derive(Debug)]
pub struct NodeHealth {
    pub id: NodeId,
    pub healthy: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

/// Aggregate result of [`NodePool::health_check`].
#[derive(Debug)]
pub struct HealthReport {
    pub total: usize,
    pub connected: usize,
    pub disconnected: usize,
    pub nodes: Vec<NodeHealth>,
}

impl NodePool {
    pub fn new() -> NodePool {
        NodePool::default()
    }

    pub async fn add(&self, node: Arc<Node>) {
        self.nodes.write().await.insert(node.id.clone(), node);
    }

    pub async fn remove(&self, id: &NodeId) -> Option<Arc<Node>> {
        self.nodes.write().await.remove(id)
    }

    pub async fn get(&self, id: &NodeId) -> Option<Arc<Node>> {
        self.nodes.read().await.get(id).cloned()
    }

    pub async fn has(&self, id: &NodeId) -> bool {
        self.nodes.read().await.contains_key(id)
    }

    pub async fn all(&self) -> Vec<Arc<Node>> {
        self.nodes.read().await.values().cloned().collect()
    }

    pub async fn connected(&self) -> Vec<Arc<Node>> {
        let mut out = Vec::new();
        for node in self.nodes.read().await.values() {
            if node.state.read().await.connected {
                out.push(node.clone());
            }
        }
        out
    }

    pub async fn size(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn connected_count(&self) -> usize {
        self.connected().await.len()
    }

    /// Picks the connected node with the lowest [`Node::load_score`].
    pub async fn pick_least_loaded(&self) -> Result<Arc<Node>, Error> {
        let candidates = self.connected().await;
        if candidates.is_empty() {
            return Err(Error::NoNodeAvailable);
        }

        let mut best: Option<(Arc<Node>, f64)> = None;
        for node in candidates {
            let score = node.load_score().await;
            if best.as_ref().map(|(_, b)| score < *b).unwrap_or(true) {
                best = Some((node, score));
            }
        }

        Ok(best.expect("candidates is non-empty").0)
    }

    pub async fn pick_random(&self) -> Result<Arc<Node>, Error> {
        let candidates = self.connected().await;
        candidates
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(Error::NoNodeAvailable)
    }

    /// Exact match on a node's configured region; falls back to
    /// [`NodePool::pick_least_loaded`] if no connected node serves it.
    pub async fn pick_by_region(&self, region: &str) -> Result<Arc<Node>, Error> {
        let candidates = self.connected().await;
        let in_region = candidates
            .iter()
            .find(|n| n.config.region.as_deref() == Some(region));

        if let Some(node) = in_region {
            return Ok(node.clone());
        }

        self.pick_least_loaded().await
    }

    /// Placement policy for a new player: region match, then least-loaded,
    /// then random; `NoNodeAvailable` if nothing is connected.
    pub async fn pick_for_new_player(&self, region: Option<&str>) -> Result<Arc<Node>, Error> {
        if let Some(region) = region {
            if let Ok(node) = self.pick_by_region(region).await {
                return Ok(node);
            }
        }

        if let Ok(node) = self.pick_least_loaded().await {
            return Ok(node);
        }

        self.pick_random().await
    }

    /// Probes every registered node with `getInfo` and reports per-node
    /// health. Unlike the session's own background ping, this runs on
    /// demand and does not mutate [`Node::state`].
    pub async fn health_check(&self) -> HealthReport {
        let nodes = self.all().await;
        let mut report = HealthReport {
            total: nodes.len(),
            connected: 0,
            disconnected: 0,
            nodes: Vec::with_capacity(nodes.len()),
        };

        for node in nodes {
            let start = tokio::time::Instant::now();
            let (healthy, latency_ms, error) = match node.rest.get_info().await {
                Ok(_) => (true, Some(start.elapsed().as_millis() as u64), None),
                Err(err) => (false, None, Some(err.to_string())),
            };

            if healthy {
                report.connected += 1;
            } else {
                report.disconnected += 1;
            }

            report.nodes.push(NodeHealth {
                id: node.id.clone(),
                healthy,
                latency_ms,
                error,
            });
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::rest::payload::{CpuStats, FrameStats, MemoryStats, StatsSnapshot};

    fn make_node(identifier: &str, region: Option<&str>) -> Arc<Node> {
        let mut config = NodeConfig::new("localhost", 2333, "youshallnotpass");
        config.identifier = identifier.to_string();
        config.region = region.map(|r| r.to_string());
        Arc::new(Node::new(config))
    }

    async fn connect(node: &Node) {
        node.state.write().await.connected = true;
    }

    fn stats(playing: u32, players: u32, load: f64, used_frac: f64) -> StatsSnapshot {
        StatsSnapshot {
            players,
            playing_players: playing,
            cpu: CpuStats { system_load: load },
            memory: MemoryStats {
                used: (used_frac * 1000.0) as u64,
                reservable: 1000,
            },
            frame_stats: Some(FrameStats {
                deficit: 0,
                nulled: 0,
            }),
        }
    }

    #[tokio::test]
    async fn load_score_matches_formula() {
        let node = make_node("a:1", None);
        node.state.write().await.stats = Some(stats(2, 10, 0.5, 0.25));
        node.record_call();
        node.record_call();

        // 2*2 + 10*0.5 + 0.5*100*1.5 + 0.25*100*0.5 + 0 + 2/1000
        let expected = 4.0 + 5.0 + 75.0 + 12.5 + 0.002;
        assert!((node.load_score().await - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn load_score_without_stats_falls_back_to_calls() {
        let node = make_node("a:1", None);
        node.record_call();
        node.record_call();
        node.record_call();
        assert_eq!(node.load_score().await, 3.0);
    }

    #[tokio::test]
    async fn pick_least_loaded_prefers_lower_score() {
        let pool = NodePool::new();
        let busy = make_node("busy:1", None);
        connect(&busy).await;
        busy.state.write().await.stats = Some(stats(10, 50, 0.9, 0.9));

        let idle = make_node("idle:1", None);
        connect(&idle).await;
        idle.state.write().await.stats = Some(stats(0, 1, 0.05, 0.1));

        pool.add(busy).await;
        pool.add(idle.clone()).await;

        let picked = pool.pick_least_loaded().await.expect("a node is connected");
        assert_eq!(picked.id, idle.id);
    }

    #[tokio::test]
    async fn pick_least_loaded_ignores_disconnected_nodes() {
        let pool = NodePool::new();
        let disconnected = make_node("down:1", None);
        pool.add(disconnected).await;

        let err = pool.pick_least_loaded().await.unwrap_err();
        assert!(matches!(err, Error::NoNodeAvailable));
    }

    #[tokio::test]
    async fn pick_by_region_exact_match_wins_over_load() {
        let pool = NodePool::new();
        let best_overall = make_node("us:1", Some("us"));
        connect(&best_overall).await;
        best_overall.state.write().await.stats = Some(stats(0, 0, 0.0, 0.0));

        let in_region = make_node("eu:1", Some("eu"));
        connect(&in_region).await;
        in_region.state.write().await.stats = Some(stats(20, 100, 0.95, 0.95));

        pool.add(best_overall).await;
        pool.add(in_region.clone()).await;

        let picked = pool.pick_by_region("eu").await.expect("a node is connected");
        assert_eq!(picked.id, in_region.id);
    }

    #[tokio::test]
    async fn pick_by_region_falls_back_when_no_match() {
        let pool = NodePool::new();
        let node = make_node("us:1", Some("us"));
        connect(&node).await;
        pool.add(node.clone()).await;

        let picked = pool.pick_by_region("eu").await.expect("falls back to least-loaded");
        assert_eq!(picked.id, node.id);
    }

    #[tokio::test]
    async fn pick_for_new_player_errors_with_no_nodes() {
        let pool = NodePool::new();
        let err = pool.pick_for_new_player(None).await.unwrap_err();
        assert!(matches!(err, Error::NoNodeAvailable));
    }
}
