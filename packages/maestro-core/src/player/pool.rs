//! Guild → player registry.
//!
//! The pool owns every [`Player`] by strong reference and is the only
//! place players are created or removed. It refers back to the node pool
//! through a weak handle used purely for node selection.

use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;

use crate::error::{MaestroError, MaestroResult};
use crate::events::{Event, EventDispatcher};
use crate::node::NodePool;

use super::{Player, SavedPlayer};

/// Owner of all per-guild players.
pub struct PlayerPool {
    players: DashMap<u64, Arc<Player>>,
    /// Back-reference to the owning node pool, set once during wiring.
    nodes: OnceLock<Weak<NodePool>>,
    hooks: Arc<EventDispatcher>,
}

impl PlayerPool {
    pub(crate) fn new(hooks: Arc<EventDispatcher>) -> Arc<Self> {
        Arc::new(Self {
            players: DashMap::new(),
            nodes: OnceLock::new(),
            hooks,
        })
    }

    pub(crate) fn attach_nodes(&self, nodes: Weak<NodePool>) {
        // Wiring happens exactly once, from NodePool::new.
        let _ = self.nodes.set(nodes);
    }

    fn node_pool(&self) -> Option<Arc<NodePool>> {
        self.nodes.get().and_then(Weak::upgrade)
    }

    /// The player for a guild, if one exists.
    pub fn get(&self, guild_id: u64) -> Option<Arc<Player>> {
        self.players.get(&guild_id).map(|p| p.clone())
    }

    /// Creates a player for a guild on the best available node, preferring
    /// the given voice region. Returns the existing player when one is
    /// already registered.
    pub fn create(&self, guild_id: u64, region: Option<&str>) -> MaestroResult<Arc<Player>> {
        if let Some(existing) = self.get(guild_id) {
            return Ok(existing);
        }
        let pool = self.node_pool().ok_or(MaestroError::NoNodeAvailable)?;
        let node = pool.find_best_node(region, None, None)?;
        let player = Player::new(guild_id, node, self.hooks.clone());
        self.players.insert(guild_id, player.clone());
        log::debug!(
            "[PLAYERS] created player for guild {guild_id} on {}",
            player.node().identifier()
        );
        Ok(player)
    }

    /// Removes a guild's player and destroys its server-side state.
    pub fn destroy(&self, guild_id: u64) -> MaestroResult<()> {
        let (_, player) = self
            .players
            .remove(&guild_id)
            .ok_or(MaestroError::PlayerNotFound(guild_id))?;
        player.destroy_remote();
        self.hooks.dispatch(Event::PlayerDisconnected { guild_id });
        log::debug!("[PLAYERS] destroyed player for guild {guild_id}");
        Ok(())
    }

    /// Rebuilds a player from a crash-recovery snapshot.
    ///
    /// The restored player is not playing; the host replays the front of
    /// the queue once voice is re-established.
    pub fn restore(&self, saved: SavedPlayer) -> MaestroResult<Arc<Player>> {
        let player = self.create(saved.guild_id, None)?;
        player.load_saved_state(saved);
        Ok(player)
    }

    /// Snapshot of every registered player.
    ///
    /// Iteration over mutation-prone shared state always goes through a
    /// snapshot like this one.
    pub fn players(&self) -> Vec<Arc<Player>> {
        self.players.iter().map(|p| p.clone()).collect()
    }

    /// Snapshot of the players currently assigned to a node.
    pub fn on_node(&self, identifier: &str) -> Vec<Arc<Player>> {
        self.players
            .iter()
            .filter(|p| p.node().identifier() == identifier)
            .map(|p| p.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn insert_for_tests(&self, player: Arc<Player>) {
        self.players.insert(player.guild_id(), player);
    }
}

impl std::fmt::Debug for PlayerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerPool")
            .field("players", &self.players.len())
            .finish()
    }
}
