//! Node registry, selection and fail-over.
//!
//! The pool owns every [`Node`] by strong reference, picks the best node
//! for new players, and heals disconnects: when a node drops, its players
//! migrate to the best surviving node (preferring the same region), or
//! wait in a parking list until any node comes back. With connect-back
//! enabled, migrated players remember their origin and return once it
//! recovers.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::{NodeConfig, PoolConfig};
use crate::error::{MaestroError, MaestroResult};
use crate::events::{Event, EventDispatcher, EventHook};
use crate::player::PlayerPool;
use crate::track::TrackCache;

use super::{socket, spawn_health_check, Node};

/// Owner of all nodes and the top-level entry point of the library.
pub struct NodePool {
    config: PoolConfig,
    nodes: DashMap<String, Arc<Node>>,
    players: Arc<PlayerPool>,
    hooks: Arc<EventDispatcher>,
    cache: TrackCache,
    /// Guilds whose player lost its node with no replacement available,
    /// re-assigned as soon as any node connects.
    queued_players: Mutex<Vec<u64>>,
    ready: Notify,
}

impl NodePool {
    /// Creates an empty pool. Register nodes with [`NodePool::add_node`].
    #[must_use]
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let hooks = Arc::new(EventDispatcher::new());
        let players = PlayerPool::new(hooks.clone());
        let pool = Arc::new(Self {
            cache: TrackCache::new(
                config.cache_capacity,
                Duration::from_secs(config.cache_ttl_secs),
            ),
            config,
            nodes: DashMap::new(),
            players,
            hooks,
            queued_players: Mutex::new(Vec::new()),
            ready: Notify::new(),
        });
        pool.players.attach_nodes(Arc::downgrade(&pool));
        pool
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The per-guild player registry.
    pub fn players(&self) -> &Arc<PlayerPool> {
        &self.players
    }

    /// The pool-wide track load cache.
    pub fn cache(&self) -> &TrackCache {
        &self.cache
    }

    pub(crate) fn hooks(&self) -> &EventDispatcher {
        &self.hooks
    }

    /// Registers a hook for all domain events.
    pub fn register_hook(&self, hook: Arc<dyn EventHook>) {
        self.hooks.register(hook);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registry
    // ─────────────────────────────────────────────────────────────────────────

    /// Registers a node and starts its connection and health-check tasks.
    pub fn add_node(self: &Arc<Self>, config: NodeConfig) -> MaestroResult<Arc<Node>> {
        let identifier = config.identifier();
        if self.nodes.contains_key(&identifier) {
            return Err(MaestroError::InvalidConfig(format!(
                "duplicate node identifier: {identifier}"
            )));
        }
        let node = Node::new(config, &self.config, Arc::downgrade(self))?;
        socket::spawn(&node);
        spawn_health_check(&node, self.config.health_check_interval());
        self.nodes.insert(identifier.clone(), node.clone());
        log::info!("[POOL] registered node {identifier}");
        Ok(node)
    }

    /// Unregisters a node and closes its socket. Its players migrate
    /// through the normal disconnect path.
    pub fn remove_node(&self, identifier: &str) -> MaestroResult<()> {
        let (_, node) = self
            .nodes
            .remove(identifier)
            .ok_or_else(|| MaestroError::NodeNotFound(identifier.to_string()))?;
        node.close();
        log::info!("[POOL] removed node {identifier}");
        Ok(())
    }

    pub fn get_node(&self, identifier: &str) -> Option<Arc<Node>> {
        self.nodes.get(identifier).map(|n| n.clone())
    }

    /// Snapshot of every registered node.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.iter().map(|n| n.clone()).collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Suspends until at least one node is available.
    pub async fn wait_until_ready(&self, timeout: Duration) -> MaestroResult<()> {
        let wait = async {
            loop {
                let notified = self.ready.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.nodes.iter().any(|n| n.is_available()) {
                    return;
                }
                notified.as_mut().await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| MaestroError::Timeout("pool ready"))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Selection
    // ─────────────────────────────────────────────────────────────────────────

    /// Picks the best node for a new player.
    ///
    /// Filters to available, non-search-only nodes advertising `feature`
    /// when given; region filters narrow further but fall back to the
    /// unfiltered set when they would leave nothing - a working node beats
    /// a regionally ideal unavailable one. Selection is the minimum by
    /// (player count, penalty), with the identifier as a final tie-break
    /// so equal nodes resolve deterministically.
    pub fn find_best_node(
        &self,
        region: Option<&str>,
        not_region: Option<&str>,
        feature: Option<&str>,
    ) -> MaestroResult<Arc<Node>> {
        let available: Vec<Arc<Node>> = self
            .nodes
            .iter()
            .map(|n| n.clone())
            .filter(|n| n.is_available())
            .filter(|n| !n.config().search_only)
            .filter(|n| feature.is_none_or(|f| n.has_feature(f)))
            .collect();

        let mut candidates: Vec<Arc<Node>> = available
            .iter()
            .filter(|n| {
                region.is_none_or(|r| {
                    n.region().is_some_and(|own| own.eq_ignore_ascii_case(r))
                })
            })
            .filter(|n| {
                not_region.is_none_or(|r| {
                    !n.region().is_some_and(|own| own.eq_ignore_ascii_case(r))
                })
            })
            .cloned()
            .collect();
        if candidates.is_empty() {
            candidates = available;
        }

        candidates
            .into_iter()
            .map(|node| {
                let players = self.players.on_node(node.identifier()).len();
                let penalty = node.penalty_with_region(region);
                (players, penalty, node)
            })
            .min_by(|(ap, apen, a), (bp, bpen, b)| {
                ap.cmp(bp)
                    .then_with(|| apen.partial_cmp(bpen).unwrap_or(std::cmp::Ordering::Equal))
                    .then_with(|| a.identifier().cmp(b.identifier()))
            })
            .map(|(_, _, node)| node)
            .ok_or(MaestroError::NoNodeAvailable)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Connection Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Runs when a node completes its handshake.
    ///
    /// Refreshes the node's capability set, adopts parked players, and
    /// pulls back any player whose connect-back origin just recovered.
    pub(crate) async fn node_connect(self: &Arc<Self>, node: &Arc<Node>, resumed: bool) {
        node.refresh_features().await;
        self.hooks.dispatch(Event::NodeConnected {
            node: node.identifier().to_string(),
            resumed,
        });
        self.ready.notify_waiters();

        let parked: Vec<u64> = std::mem::take(&mut *self.queued_players.lock());
        for guild_id in parked {
            if let Some(player) = self.players.get(guild_id) {
                log::info!("[POOL] re-assigning parked player {guild_id} to {}", node.identifier());
                player.change_node(node.clone());
            }
        }

        if self.config.connect_back {
            for player in self.players.players() {
                let came_from_here = player.origin().as_deref() == Some(node.identifier());
                if came_from_here && player.node().identifier() != node.identifier() {
                    log::info!(
                        "[POOL] moving player {} back to recovered node {}",
                        player.guild_id(),
                        node.identifier()
                    );
                    player.change_node(node.clone());
                    player.clear_origin();
                }
            }
        }
    }

    /// Runs when a node's socket closes, regardless of cause.
    ///
    /// Migrates every affected player to the best surviving node
    /// (preferring the dead node's region), or parks the guilds until a
    /// node comes back.
    pub(crate) async fn node_disconnect(
        self: &Arc<Self>,
        node: &Arc<Node>,
        code: Option<u16>,
        reason: &str,
    ) {
        self.hooks.dispatch(Event::NodeDisconnected {
            node: node.identifier().to_string(),
            code,
            reason: reason.to_string(),
        });

        let affected = self.players.on_node(node.identifier());
        if affected.is_empty() {
            return;
        }

        match self.find_best_node(node.region(), None, None) {
            Ok(replacement) => {
                log::info!(
                    "[POOL] moving {} player(s) from {} to {}",
                    affected.len(),
                    node.identifier(),
                    replacement.identifier()
                );
                for player in affected {
                    if self.config.connect_back {
                        player.set_origin(node.identifier().to_string());
                    }
                    player.change_node(replacement.clone());
                }
            }
            Err(_) => {
                log::warn!(
                    "[POOL] no replacement for {}, parking {} player(s)",
                    node.identifier(),
                    affected.len()
                );
                let mut parked = self.queued_players.lock();
                for player in affected {
                    if self.config.connect_back {
                        player.set_origin(node.identifier().to_string());
                    }
                    parked.push(player.guild_id());
                }
            }
        }
    }

    #[cfg(test)]
    fn insert_node_for_tests(self: &Arc<Self>, config: NodeConfig) -> Arc<Node> {
        let node = Node::new(config, &self.config, Arc::downgrade(self)).unwrap();
        self.nodes.insert(node.identifier().to_string(), node.clone());
        node
    }
}

impl std::fmt::Debug for NodePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodePool")
            .field("nodes", &self.nodes.len())
            .field("players", &self.players.len())
            .finish()
    }
}
