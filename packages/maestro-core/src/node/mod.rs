//! A single remote audio-processing node.
//!
//! A [`Node`] bundles the REST client and the WebSocket state machine for
//! one server, plus everything the pool needs to rank it: a stats snapshot,
//! a capability set, a down-vote table, and the penalty score computed from
//! them. A periodic health check tears the socket down when the node stops
//! responding or its own players vote it unhealthy.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::config::{NodeConfig, PoolConfig};
use crate::error::MaestroResult;
use crate::events::Event;
use crate::protocol::{IncomingEvent, LoadResult, LoadType, NodeStats, OutgoingMessage, TrackData, TrackInfo};
use crate::region::{haversine_km, region_coordinates};
use crate::track::{Query, Track};

pub mod pool;
pub(crate) mod rest;
pub(crate) mod socket;

pub use pool::NodePool;

use rest::RestClient;
use socket::NodeSocket;

/// How long a down-vote counts against a node before lapsing.
const DOWN_VOTE_TTL: Duration = Duration::from_secs(600);

/// Capabilities every stock server ships with, assumed when the node does
/// not expose a sources endpoint.
const STANDARD_SOURCES: &[&str] = &[
    "youtube",
    "soundcloud",
    "bandcamp",
    "twitch",
    "vimeo",
    "http",
    "local",
];

/// One remote audio-processing server.
pub struct Node {
    config: NodeConfig,
    identifier: String,
    rest: RestClient,
    socket: NodeSocket,
    stats: RwLock<Option<NodeStats>>,
    features: RwLock<HashSet<String>>,
    /// Guild id → when that guild's player voted this node unhealthy.
    down_votes: Mutex<HashMap<u64, Instant>>,
    coordinates: Option<(f64, f64)>,
    pool: Weak<NodePool>,
}

impl Node {
    pub(crate) fn new(
        config: NodeConfig,
        pool_config: &PoolConfig,
        pool: Weak<NodePool>,
    ) -> MaestroResult<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            identifier: config.identifier(),
            rest: RestClient::new(&config),
            socket: NodeSocket::new(&config, pool_config),
            stats: RwLock::new(None),
            features: RwLock::new(HashSet::new()),
            down_votes: Mutex::new(HashMap::new()),
            coordinates: config.resolved_coordinates(),
            config,
            pool,
        }))
    }

    /// Stable name for logs and lookups: the configured name, or host:port.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Voice region this node is tagged with, if any.
    pub fn region(&self) -> Option<&str> {
        self.config.region.as_deref()
    }

    /// Whether the node can take commands right now: socket up and handshake
    /// complete.
    pub fn is_available(&self) -> bool {
        self.socket.is_ready() && !self.socket.is_shut_down()
    }

    /// Server-assigned session id from the current connection.
    pub fn session_id(&self) -> Option<String> {
        self.socket.session_id()
    }

    /// Latest stats snapshot reported over the socket.
    pub fn stats(&self) -> Option<NodeStats> {
        self.stats.read().clone()
    }

    /// Suspends until the node completes its handshake.
    pub async fn wait_until_ready(&self, timeout: Duration) -> MaestroResult<()> {
        self.socket.wait_until_ready(timeout).await
    }

    /// Closes the socket terminally. The node will not reconnect.
    pub fn close(&self) {
        self.socket.manual_closure();
    }

    pub(crate) fn socket(&self) -> &NodeSocket {
        &self.socket
    }

    pub(crate) fn pool(&self) -> Option<Arc<NodePool>> {
        self.pool.upgrade()
    }

    /// Sends (or queues) one command on the node socket.
    pub(crate) fn send(&self, message: &OutgoingMessage) {
        self.socket.send(message);
    }

    pub(crate) fn update_stats(&self, stats: NodeStats) {
        *self.stats.write() = Some(stats);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Capabilities
    // ─────────────────────────────────────────────────────────────────────────

    /// Whether this node advertises a capability (source or plugin name).
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.read().contains(feature)
    }

    /// Snapshot of the advertised capability set.
    pub fn features(&self) -> HashSet<String> {
        self.features.read().clone()
    }

    /// Rebuilds the capability set from the node's REST surface.
    ///
    /// Nodes without a sources endpoint fall back to the stock source set.
    /// `local` only counts on managed nodes, where the library shares a
    /// filesystem with the server.
    pub(crate) async fn refresh_features(&self) {
        let mut features: HashSet<String> = match self.rest.sources().await {
            Ok(Some(sources)) => sources.into_iter().map(|s| s.to_lowercase()).collect(),
            Ok(None) => STANDARD_SOURCES.iter().map(|s| (*s).to_string()).collect(),
            Err(e) => {
                log::warn!("[NODE] {}: failed to fetch sources: {e}", self.identifier);
                STANDARD_SOURCES.iter().map(|s| (*s).to_string()).collect()
            }
        };
        for disabled in &self.config.disabled_sources {
            features.remove(&disabled.to_lowercase());
        }
        if !self.config.managed {
            features.remove("local");
        }
        match self.rest.plugins().await {
            Ok(Some(plugins)) => {
                for plugin in plugins {
                    features.insert(plugin.name.to_lowercase());
                }
            }
            Ok(None) => {}
            Err(e) => {
                log::debug!("[NODE] {}: failed to fetch plugins: {e}", self.identifier);
            }
        }
        log::debug!("[NODE] {}: capabilities: {features:?}", self.identifier);
        *self.features.write() = features;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Track Lookup
    // ─────────────────────────────────────────────────────────────────────────

    /// Resolves a query against this node, consulting the pool-wide cache
    /// unless `bypass_cache` is set.
    pub async fn get_tracks(&self, query: &Query, bypass_cache: bool) -> MaestroResult<LoadResult> {
        let identifier = query.load_identifier();
        if !bypass_cache {
            if let Some(pool) = self.pool() {
                if let Some(cached) = pool.cache().get(&identifier) {
                    log::debug!("[NODE] {}: cache hit for {identifier}", self.identifier);
                    return Ok(cached);
                }
            }
        }
        let result = self.rest.load_tracks(&identifier).await?;
        if result.load_type != LoadType::LoadFailed && result.load_type != LoadType::NoMatches {
            if let Some(pool) = self.pool() {
                pool.cache().insert(identifier, result.clone());
            }
        }
        Ok(result)
    }

    /// Resolves a query to its first matching track, if any.
    pub async fn get_track(&self, query: &Query) -> MaestroResult<Option<Track>> {
        let result = self.get_tracks(query, false).await?;
        Ok(result
            .tracks
            .into_iter()
            .next()
            .map(|data| Track::from_data(data).with_query(query.clone())))
    }

    /// Translates one encoded track string into metadata.
    pub async fn decode_track(&self, encoded: &str) -> MaestroResult<Option<TrackInfo>> {
        Ok(self.rest.decode_track(encoded).await?)
    }

    /// Translates a batch of encoded track strings into metadata.
    pub async fn decode_tracks(&self, encoded: &[String]) -> MaestroResult<Vec<TrackData>> {
        Ok(self.rest.decode_tracks(encoded).await?)
    }

    /// Current state of the node's outbound-IP rotation subsystem.
    pub async fn routeplanner_status(&self) -> MaestroResult<Option<serde_json::Value>> {
        Ok(self.rest.routeplanner_status().await?)
    }

    /// Unmarks one failing outbound address on the route planner.
    pub async fn routeplanner_free_address(&self, address: &str) -> MaestroResult<()> {
        Ok(self.rest.routeplanner_free_address(address).await?)
    }

    /// Unmarks every failing outbound address on the route planner.
    pub async fn routeplanner_free_all(&self) -> MaestroResult<()> {
        Ok(self.rest.routeplanner_free_all().await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Penalty Scoring
    // ─────────────────────────────────────────────────────────────────────────

    /// Scalar load score; lower is better, infinite when unavailable.
    ///
    /// This is the sole ranking input for node selection (after the
    /// player-count tie-break) - there is no separate health score.
    pub fn penalty(&self) -> f64 {
        self.penalty_with_region(None)
    }

    /// Penalty including the distance component toward a target voice
    /// region, when both sides have known coordinates.
    pub fn penalty_with_region(&self, region: Option<&str>) -> f64 {
        if !self.is_available() {
            return f64::INFINITY;
        }
        let stats = self.stats.read();
        let Some(stats) = stats.as_ref() else {
            return f64::INFINITY;
        };
        let mut penalty = base_penalty(stats, self.down_vote_count());
        if let (Some(target), Some(own)) = (region.and_then(region_coordinates), self.coordinates) {
            penalty += distance_penalty(haversine_km(own, target));
        }
        penalty
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Down-votes
    // ─────────────────────────────────────────────────────────────────────────

    /// Records a guild's vote that this node is misbehaving.
    pub fn down_vote(&self, guild_id: u64) {
        self.down_votes.lock().insert(guild_id, Instant::now());
    }

    /// Withdraws a guild's down-vote.
    pub fn down_unvote(&self, guild_id: u64) {
        self.down_votes.lock().remove(&guild_id);
    }

    /// Whether a guild currently has a live down-vote against this node.
    pub fn has_voted(&self, guild_id: u64) -> bool {
        self.prune_votes();
        self.down_votes.lock().contains_key(&guild_id)
    }

    /// Number of live down-votes from guilds whose player is actively
    /// playing. Lapsed votes are pruned on read, and a vote from an idle
    /// or departed player carries no weight.
    pub fn down_vote_count(&self) -> usize {
        self.prune_votes();
        let Some(pool) = self.pool() else { return 0 };
        let guilds: Vec<u64> = self.down_votes.lock().keys().copied().collect();
        guilds
            .into_iter()
            .filter(|guild| {
                pool.players()
                    .get(*guild)
                    .is_some_and(|player| player.is_playing())
            })
            .count()
    }

    fn prune_votes(&self) {
        self.down_votes
            .lock()
            .retain(|_, at| at.elapsed() < DOWN_VOTE_TTL);
    }

    #[cfg(test)]
    fn insert_vote_at(&self, guild_id: u64, at: Instant) {
        self.down_votes.lock().insert(guild_id, at);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Event Routing
    // ─────────────────────────────────────────────────────────────────────────

    /// Routes one inbound lifecycle event to the owning player.
    pub(crate) async fn handle_event(self: &Arc<Self>, event: IncomingEvent) {
        let Some(guild_id) = event.guild_id() else {
            log::debug!(
                "[NODE] {}: event with unparseable guild id, dropping",
                self.identifier
            );
            return;
        };
        let Some(pool) = self.pool() else { return };
        let Some(player) = pool.players().get(guild_id) else {
            log::debug!(
                "[NODE] {}: event for unknown player {guild_id}, dropping",
                self.identifier
            );
            return;
        };
        player.handle_event(event).await;
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("identifier", &self.identifier)
            .field("available", &self.is_available())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Penalty Curves
// ─────────────────────────────────────────────────────────────────────────────

/// Load score from one stats snapshot. Monotone in every input.
fn base_penalty(stats: &NodeStats, down_votes: usize) -> f64 {
    let mut penalty = f64::from(stats.playing_players);
    penalty += 1.05f64.powf(100.0 * stats.cpu.system_load) * 10.0 - 10.0;
    if let Some(frames) = &stats.frame_stats {
        let deficit = frames.deficit.max(0) as f64;
        let nulled = frames.nulled.max(0) as f64;
        penalty += 1.03f64.powf(500.0 * (deficit / 3000.0)) * 600.0 - 600.0;
        // Nulled frames are silence already sent to listeners, twice as bad
        // as frames that were merely late.
        penalty += (1.03f64.powf(500.0 * (nulled / 3000.0)) * 600.0 - 600.0) * 2.0;
    }
    penalty + 100.0 * down_votes as f64
}

/// Distance component of the penalty, scaled so a cross-continent hop
/// weighs about as much as a node near full CPU load.
fn distance_penalty(km: f64) -> f64 {
    1.05f64.powf(km / 10.0) * 5.0 - 5.0
}

// ─────────────────────────────────────────────────────────────────────────────
// Health Check
// ─────────────────────────────────────────────────────────────────────────────

/// Spawns the periodic liveness check for a node.
///
/// A node fails the check when the transport stops answering pings, or when
/// at least half of its playing players have voted it down. Remediation is
/// a forced socket reconnect; `managed` nodes additionally get a
/// `NodeUnhealthy` event so an external supervisor can restart the process.
pub(crate) fn spawn_health_check(node: &Arc<Node>, interval: Duration) {
    let weak = Arc::downgrade(node);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(node) = weak.upgrade() else { return };
            if node.socket.is_shut_down() {
                return;
            }
            if !node.socket.is_connected() {
                // The reconnect loop is already on it.
                continue;
            }

            node.socket.ping();
            let unresponsive = !node.socket.is_responsive();

            let voted_down = node.pool().is_some_and(|pool| {
                let playing = pool
                    .players()
                    .on_node(node.identifier())
                    .iter()
                    .filter(|p| p.is_playing())
                    .count();
                playing > 0 && node.down_vote_count() * 2 >= playing
            });

            if unresponsive || voted_down {
                log::warn!(
                    "[NODE] {}: unhealthy (unresponsive: {unresponsive}, voted down: {voted_down})",
                    node.identifier()
                );
                if let Some(pool) = node.pool() {
                    pool.hooks().dispatch(Event::NodeUnhealthy {
                        node: node.identifier().to_string(),
                        managed: node.config.managed,
                    });
                }
                node.down_votes.lock().clear();
                node.socket.force_reconnect();
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CpuStats, FrameStats, MemoryStats};

    fn stats(playing: u32, load: f64, nulled: i64, deficit: i64) -> NodeStats {
        NodeStats {
            players: playing,
            playing_players: playing,
            uptime: 60_000,
            memory: MemoryStats::default(),
            cpu: CpuStats {
                cores: 4,
                system_load: load,
                lavalink_load: load,
            },
            frame_stats: Some(FrameStats {
                sent: 3000,
                nulled,
                deficit,
            }),
        }
    }

    fn test_node() -> Arc<Node> {
        Node::new(
            NodeConfig::new("127.0.0.1", 2333, "secret"),
            &PoolConfig::new(1),
            Weak::new(),
        )
        .unwrap()
    }

    #[test]
    fn penalty_is_monotone_in_every_input() {
        let base = base_penalty(&stats(2, 0.2, 0, 0), 0);
        assert!(base_penalty(&stats(3, 0.2, 0, 0), 0) > base);
        assert!(base_penalty(&stats(2, 0.4, 0, 0), 0) > base);
        assert!(base_penalty(&stats(2, 0.2, 10, 0), 0) > base);
        assert!(base_penalty(&stats(2, 0.2, 0, 10), 0) > base);
        assert!(base_penalty(&stats(2, 0.2, 0, 0), 1) > base);
    }

    #[test]
    fn idle_node_has_zero_penalty() {
        let p = base_penalty(&stats(0, 0.0, 0, 0), 0);
        assert!(p.abs() < 1e-9, "idle penalty should be 0, was {p}");
    }

    #[test]
    fn nulled_frames_cost_double() {
        let nulled = base_penalty(&stats(0, 0.0, 60, 0), 0);
        let deficit = base_penalty(&stats(0, 0.0, 0, 60), 0);
        assert!((nulled - deficit * 2.0).abs() < 1e-6);
    }

    #[test]
    fn distance_penalty_grows_with_distance() {
        assert!(distance_penalty(0.0).abs() < 1e-9);
        assert!(distance_penalty(500.0) > distance_penalty(100.0));
        assert!(distance_penalty(5000.0) > distance_penalty(500.0));
    }

    #[test]
    fn unavailable_node_penalty_is_infinite() {
        let node = test_node();
        node.update_stats(stats(0, 0.0, 0, 0));
        // Socket never connected, so the node is unavailable.
        assert_eq!(node.penalty(), f64::INFINITY);
    }

    #[test]
    fn down_votes_lapse_after_ttl() {
        let node = test_node();
        node.down_vote(1);
        let Some(expired) = Instant::now().checked_sub(DOWN_VOTE_TTL + Duration::from_secs(1))
        else {
            return;
        };
        node.insert_vote_at(2, expired);
        assert!(node.has_voted(1));
        assert!(!node.has_voted(2));
        node.down_unvote(1);
        assert!(!node.has_voted(1));
    }
}
