//! Wire protocol types for the Lavalink node connection.
//!
//! JSON over WebSocket, discriminated by the `op` field. Inbound `event`
//! frames carry a second `type` discriminator. REST payloads (`loadtracks`,
//! `decodetrack`) share the track shapes defined here.
//!
//! All unions are closed: unknown `op`/`type` tags fail deserialization and
//! are logged and dropped by the socket receive loop.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Close code used for a deliberate, terminal shutdown of a node socket.
///
/// Distinct from protocol-level close codes so the receive loop can tell
/// "closing for a deliberate reason" apart from "closing and reconnecting".
pub const CLOSE_CODE_MANUAL: u16 = 4014;

// ─────────────────────────────────────────────────────────────────────────────
// Outbound Ops
// ─────────────────────────────────────────────────────────────────────────────

/// Commands sent to a node, discriminated by the `op` field.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum OutgoingMessage {
    /// Start playback of an encoded track.
    Play {
        guild_id: String,
        track: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        start_time: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        end_time: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        no_replace: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        skip_segments: Option<Vec<String>>,
    },
    /// Stop playback and discard the current track.
    Stop { guild_id: String },
    /// Pause or resume playback.
    Pause { guild_id: String, pause: bool },
    /// Seek to a position in the current track (milliseconds).
    Seek { guild_id: String, position: u64 },
    /// Set the player volume (0-1000, 100 = 100%).
    Volume { guild_id: String, volume: u16 },
    /// Apply the audio filter chain. Only changed filters are present.
    Filters {
        guild_id: String,
        #[serde(flatten)]
        payload: serde_json::Map<String, Value>,
    },
    /// Forward a Discord voice-gateway session update to the node.
    VoiceUpdate {
        guild_id: String,
        session_id: String,
        event: Value,
    },
    /// Destroy the server-side player for a guild.
    Destroy { guild_id: String },
    /// Ask the node to retain session state across a brief reconnect.
    ConfigureResuming { key: String, timeout: u64 },
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound Ops
// ─────────────────────────────────────────────────────────────────────────────

/// Messages received from a node, discriminated by the `op` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum IncomingMessage {
    /// Handshake completion carrying the server-assigned session id.
    Ready { session_id: String, resumed: bool },
    /// Node-wide load snapshot, refreshed periodically by the server.
    Stats {
        #[serde(flatten)]
        stats: NodeStats,
    },
    /// Periodic position/connection snapshot for one guild's player.
    PlayerUpdate {
        guild_id: String,
        state: PlayerState,
    },
    /// Track/segment/session lifecycle event, discriminated by `type`.
    Event {
        #[serde(flatten)]
        event: IncomingEvent,
    },
}

/// Per-guild playback state snapshot from a `playerUpdate` frame.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    /// Unix timestamp of the snapshot in milliseconds.
    pub time: u64,
    /// Playback position in milliseconds.
    #[serde(default)]
    pub position: u64,
    /// Whether the node is connected to the Discord voice gateway.
    pub connected: bool,
    /// Voice gateway ping in milliseconds (-1 when unknown).
    #[serde(default)]
    pub ping: Option<i64>,
}

/// Node-wide load statistics reported by the server.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    /// Total players on the node.
    pub players: u32,
    /// Players currently playing a track.
    pub playing_players: u32,
    /// Node uptime in milliseconds.
    pub uptime: u64,
    /// Memory usage snapshot.
    pub memory: MemoryStats,
    /// CPU usage snapshot.
    pub cpu: CpuStats,
    /// Audio frame counters; absent when no players are active.
    #[serde(default)]
    pub frame_stats: Option<FrameStats>,
}

/// Memory usage snapshot, all values in bytes.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

/// CPU usage snapshot.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub cores: u32,
    /// System-wide load, 0.0 - 1.0.
    pub system_load: f64,
    /// Load attributable to the node process, 0.0 - 1.0.
    pub lavalink_load: f64,
}

/// Audio frame counters over the last minute.
///
/// Nulled and deficit frames are server-side underrun indicators and feed
/// the load-balancing penalty.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound Events
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle events embedded in `event` frames, discriminated by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum IncomingEvent {
    /// A track started playing.
    TrackStartEvent { guild_id: String, track: String },
    /// A track stopped playing.
    TrackEndEvent {
        guild_id: String,
        track: String,
        reason: TrackEndReason,
    },
    /// The node hit an exception while playing a track.
    TrackExceptionEvent {
        guild_id: String,
        track: String,
        #[serde(default)]
        exception: Option<TrackException>,
        #[serde(default)]
        error: Option<String>,
    },
    /// The node stopped receiving audio frames for a track.
    TrackStuckEvent {
        guild_id: String,
        track: String,
        threshold_ms: u64,
    },
    /// The node's Discord voice connection was closed.
    WebSocketClosedEvent {
        guild_id: String,
        code: u16,
        reason: String,
        by_remote: bool,
    },
    /// Sponsor segments were loaded for the current track.
    SegmentsLoaded {
        guild_id: String,
        segments: Vec<Segment>,
    },
    /// A sponsor segment was skipped.
    SegmentSkipped { guild_id: String, segment: Segment },
}

impl IncomingEvent {
    /// The guild this event belongs to, parsed from the wire string.
    #[must_use]
    pub fn guild_id(&self) -> Option<u64> {
        let raw = match self {
            Self::TrackStartEvent { guild_id, .. }
            | Self::TrackEndEvent { guild_id, .. }
            | Self::TrackExceptionEvent { guild_id, .. }
            | Self::TrackStuckEvent { guild_id, .. }
            | Self::WebSocketClosedEvent { guild_id, .. }
            | Self::SegmentsLoaded { guild_id, .. }
            | Self::SegmentSkipped { guild_id, .. } => guild_id,
        };
        raw.parse().ok()
    }
}

/// Why a track stopped playing.
///
/// Only `Finished` (and the stuck/exception events) trigger auto-advance;
/// the other reasons represent an intentional or already-handled transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl TrackEndReason {
    /// Whether the player should automatically advance to the next track.
    #[must_use]
    pub fn should_advance(self) -> bool {
        matches!(self, Self::Finished)
    }
}

/// Exception details attached to a `TrackExceptionEvent` or failed load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackException {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub cause: Option<String>,
}

/// A sponsor segment within a track (milliseconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub category: String,
    pub start: u64,
    pub end: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// REST Payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Result of a `loadtracks` REST call, discriminated by `loadType`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadResult {
    pub load_type: LoadType,
    #[serde(default)]
    pub playlist_info: Option<PlaylistInfo>,
    #[serde(default)]
    pub tracks: Vec<TrackData>,
    #[serde(default)]
    pub exception: Option<TrackException>,
}

impl LoadResult {
    /// An empty `NO_MATCHES`-shaped result, used for non-2xx REST responses.
    #[must_use]
    pub fn no_matches() -> Self {
        Self {
            load_type: LoadType::NoMatches,
            playlist_info: None,
            tracks: Vec::new(),
            exception: None,
        }
    }
}

/// Discriminator for `loadtracks` results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadType {
    TrackLoaded,
    PlaylistLoaded,
    SearchResult,
    NoMatches,
    LoadFailed,
}

/// Playlist metadata attached to a `PLAYLIST_LOADED` result.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub selected_track: Option<i64>,
}

/// One track as returned by the node: encoded string plus metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackData {
    /// Opaque server-encoded track string.
    pub track: String,
    /// Resolved track metadata.
    pub info: TrackInfo,
}

/// Resolved track metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    pub title: String,
    pub author: String,
    /// Track length in milliseconds.
    pub length: u64,
    pub is_seekable: bool,
    pub is_stream: bool,
    #[serde(default)]
    pub position: u64,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub source_name: Option<String>,
    #[serde(default)]
    pub isrc: Option<String>,
    #[serde(default)]
    pub artwork_url: Option<String>,
}

/// Plugin descriptor from the node's `GET /plugins` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outgoing_play_uses_camel_case_op_and_fields() {
        let msg = OutgoingMessage::Play {
            guild_id: "123".into(),
            track: "abc".into(),
            start_time: Some(5000),
            end_time: None,
            no_replace: Some(false),
            skip_segments: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["op"], "play");
        assert_eq!(value["guildId"], "123");
        assert_eq!(value["startTime"], 5000);
        assert!(value.get("endTime").is_none());
        assert_eq!(value["noReplace"], false);
    }

    #[test]
    fn incoming_ready_frame_parses() {
        let raw = r#"{"op":"ready","sessionId":"s1","resumed":false}"#;
        let msg: IncomingMessage = serde_json::from_str(raw).unwrap();
        match msg {
            IncomingMessage::Ready {
                session_id,
                resumed,
            } => {
                assert_eq!(session_id, "s1");
                assert!(!resumed);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn incoming_stats_frame_parses_with_frame_stats() {
        let raw = r#"{
            "op":"stats","players":3,"playingPlayers":2,"uptime":1000,
            "memory":{"free":1,"used":2,"allocated":3,"reservable":4},
            "cpu":{"cores":8,"systemLoad":0.25,"lavalinkLoad":0.1},
            "frameStats":{"sent":3000,"nulled":5,"deficit":0}
        }"#;
        let msg: IncomingMessage = serde_json::from_str(raw).unwrap();
        match msg {
            IncomingMessage::Stats { stats } => {
                assert_eq!(stats.playing_players, 2);
                assert_eq!(stats.frame_stats.unwrap().nulled, 5);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn track_end_event_parses_reason() {
        let raw = r#"{"op":"event","type":"TrackEndEvent","guildId":"42","track":"xyz","reason":"FINISHED"}"#;
        let msg: IncomingMessage = serde_json::from_str(raw).unwrap();
        match msg {
            IncomingMessage::Event {
                event:
                    IncomingEvent::TrackEndEvent {
                        guild_id, reason, ..
                    },
            } => {
                assert_eq!(guild_id, "42");
                assert_eq!(reason, TrackEndReason::Finished);
                assert!(reason.should_advance());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_type_is_a_parse_error() {
        let raw = r#"{"op":"event","type":"SomethingNew","guildId":"42"}"#;
        assert!(serde_json::from_str::<IncomingMessage>(raw).is_err());
    }

    #[test]
    fn stopped_and_replaced_do_not_advance() {
        assert!(!TrackEndReason::Stopped.should_advance());
        assert!(!TrackEndReason::Replaced.should_advance());
        assert!(!TrackEndReason::Cleanup.should_advance());
        assert!(!TrackEndReason::LoadFailed.should_advance());
    }
}
