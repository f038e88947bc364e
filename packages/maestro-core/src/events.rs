//! Domain events and hook dispatch.
//!
//! The library reports everything observable - node lifecycle, track
//! lifecycle, user actions - as values of one closed [`Event`] union,
//! fanned out to host-registered [`EventHook`]s. Dispatch is isolated from
//! hook failures: one panicking hook never prevents delivery to the others.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::protocol::{Segment, TrackEndReason};
use crate::track::{Source, Track};

// ─────────────────────────────────────────────────────────────────────────────
// Event Union
// ─────────────────────────────────────────────────────────────────────────────

/// Every domain event the library produces.
#[derive(Debug, Clone)]
pub enum Event {
    /// A node's websocket completed its handshake.
    NodeConnected { node: String, resumed: bool },
    /// A node's websocket closed.
    NodeDisconnected {
        node: String,
        code: Option<u16>,
        reason: String,
    },
    /// A node failed its health check and is being remediated.
    NodeUnhealthy { node: String, managed: bool },
    /// A player migrated from one node to another.
    NodeChanged {
        guild_id: u64,
        old_node: String,
        new_node: String,
    },

    /// A track started playing. The source tag discriminates per-source
    /// handling; `Event::name` reflects it.
    TrackStart {
        guild_id: u64,
        track: Track,
        source: Source,
    },
    /// A track stopped playing.
    TrackEnd {
        guild_id: u64,
        track: Option<Track>,
        reason: TrackEndReason,
    },
    /// The node reported an exception for the current track.
    TrackException {
        guild_id: u64,
        track: Option<Track>,
        message: String,
    },
    /// The node stopped receiving frames for the current track.
    TrackStuck { guild_id: u64, threshold_ms: u64 },
    /// Playback finished and the queue is empty.
    QueueEnd { guild_id: u64 },
    /// Periodic position snapshot for a player.
    PlayerUpdate {
        guild_id: u64,
        position: u64,
        timestamp: u64,
        connected: bool,
    },
    /// The node's Discord voice connection closed.
    WebSocketClosed {
        guild_id: u64,
        code: u16,
        reason: String,
        by_remote: bool,
    },
    /// Sponsor segments were loaded for the current track.
    SegmentsLoaded {
        guild_id: u64,
        segments: Vec<Segment>,
    },
    /// A sponsor segment was skipped.
    SegmentSkipped { guild_id: u64, segment: Segment },

    /// A player joined a voice channel.
    PlayerConnected { guild_id: u64, channel_id: u64 },
    /// A player left its voice channel and was destroyed.
    PlayerDisconnected { guild_id: u64 },
    /// A player moved to a different voice channel.
    PlayerMoved { guild_id: u64, channel_id: u64 },
    /// Playback was paused by a user action.
    PlayerPaused { guild_id: u64 },
    /// Playback was resumed by a user action.
    PlayerResumed { guild_id: u64 },
    /// Playback was stopped by a user action.
    PlayerStopped { guild_id: u64 },
    /// The current track was skipped by a user action.
    TrackSkipped { guild_id: u64, track: Option<Track> },
    /// A seek was issued by a user action.
    PlayerSeeked { guild_id: u64, position: u64 },
    /// The player volume changed.
    VolumeChanged { guild_id: u64, volume: u16 },
    /// Queue shuffle was toggled.
    ShuffleToggled { guild_id: u64, shuffle: bool },
    /// Repeat mode changed.
    RepeatChanged {
        guild_id: u64,
        repeat_current: bool,
        repeat_queue: bool,
    },
    /// A filter change was applied to the node.
    FiltersApplied { guild_id: u64 },
}

impl Event {
    /// Stable snake_case event name, derived from the variant (and, for
    /// track starts, the source tag). Hosts key their handler tables on
    /// these strings.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::NodeConnected { .. } => "node_connected",
            Self::NodeDisconnected { .. } => "node_disconnected",
            Self::NodeUnhealthy { .. } => "node_unhealthy",
            Self::NodeChanged { .. } => "node_changed",
            Self::TrackStart { source, .. } => match source {
                Source::YouTube => "youtube_track_start",
                Source::YouTubeMusic => "youtube_music_track_start",
                Source::Spotify => "spotify_track_start",
                Source::SoundCloud => "soundcloud_track_start",
                Source::AppleMusic => "apple_music_track_start",
                Source::Deezer => "deezer_track_start",
                Source::Bandcamp => "bandcamp_track_start",
                Source::Twitch => "twitch_track_start",
                Source::Vimeo => "vimeo_track_start",
                Source::Http => "http_track_start",
                Source::Local => "local_track_start",
                Source::Unknown => "track_start",
            },
            Self::TrackEnd { .. } => "track_end",
            Self::TrackException { .. } => "track_exception",
            Self::TrackStuck { .. } => "track_stuck",
            Self::QueueEnd { .. } => "queue_end",
            Self::PlayerUpdate { .. } => "player_update",
            Self::WebSocketClosed { .. } => "websocket_closed",
            Self::SegmentsLoaded { .. } => "segments_loaded",
            Self::SegmentSkipped { .. } => "segment_skipped",
            Self::PlayerConnected { .. } => "player_connected",
            Self::PlayerDisconnected { .. } => "player_disconnected",
            Self::PlayerMoved { .. } => "player_moved",
            Self::PlayerPaused { .. } => "player_paused",
            Self::PlayerResumed { .. } => "player_resumed",
            Self::PlayerStopped { .. } => "player_stopped",
            Self::TrackSkipped { .. } => "track_skipped",
            Self::PlayerSeeked { .. } => "player_seeked",
            Self::VolumeChanged { .. } => "volume_changed",
            Self::ShuffleToggled { .. } => "shuffle_toggled",
            Self::RepeatChanged { .. } => "repeat_changed",
            Self::FiltersApplied { .. } => "filters_applied",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Hook Dispatch
// ─────────────────────────────────────────────────────────────────────────────

/// Host-registered event sink.
///
/// Hooks must be fast and non-blocking; spawn a task for anything heavy.
pub trait EventHook: Send + Sync {
    /// Called for every domain event, in dispatch order.
    fn on_event(&self, event: &Event);
}

// Closures work as hooks without a wrapper type.
impl<F: Fn(&Event) + Send + Sync> EventHook for F {
    fn on_event(&self, event: &Event) {
        self(event);
    }
}

/// Fan-out of domain events to registered hooks.
///
/// Each hook is invoked behind a panic guard so one failing hook never
/// prevents delivery to the others nor destabilizes the dispatcher.
#[derive(Default)]
pub struct EventDispatcher {
    hooks: RwLock<Vec<Arc<dyn EventHook>>>,
}

impl EventDispatcher {
    /// Creates a dispatcher with no hooks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hook for all future events.
    pub fn register(&self, hook: Arc<dyn EventHook>) {
        self.hooks.write().push(hook);
    }

    /// Number of registered hooks.
    #[must_use]
    pub fn hook_count(&self) -> usize {
        self.hooks.read().len()
    }

    /// Delivers an event to every registered hook.
    pub fn dispatch(&self, event: Event) {
        let hooks = self.hooks.read().clone();
        tracing::debug!(event = event.name(), hooks = hooks.len(), "dispatch");
        for hook in hooks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| hook.on_event(&event))) {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".to_string());
                log::error!(
                    "[Events] hook panicked while handling {}: {}",
                    event.name(),
                    detail
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHook {
        seen: AtomicUsize,
    }

    impl EventHook for CountingHook {
        fn on_event(&self, _event: &Event) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingHook;

    impl EventHook for PanickingHook {
        fn on_event(&self, _event: &Event) {
            panic!("hook exploded");
        }
    }

    #[test]
    fn events_reach_every_hook() {
        let dispatcher = EventDispatcher::new();
        let counter = Arc::new(CountingHook {
            seen: AtomicUsize::new(0),
        });
        dispatcher.register(counter.clone());
        dispatcher.register(counter.clone());

        dispatcher.dispatch(Event::QueueEnd { guild_id: 1 });
        assert_eq!(counter.seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_hook_does_not_block_others() {
        let dispatcher = EventDispatcher::new();
        let counter = Arc::new(CountingHook {
            seen: AtomicUsize::new(0),
        });
        dispatcher.register(Arc::new(PanickingHook));
        dispatcher.register(counter.clone());

        dispatcher.dispatch(Event::PlayerStopped { guild_id: 1 });
        assert_eq!(counter.seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn track_start_name_is_source_specific() {
        let track = crate::track::Track::partial(crate::track::Query::search(
            Source::Spotify,
            "something",
        ));
        let event = Event::TrackStart {
            guild_id: 1,
            track,
            source: Source::Spotify,
        };
        assert_eq!(event.name(), "spotify_track_start");
        assert_eq!(Event::QueueEnd { guild_id: 1 }.name(), "queue_end");
    }
}
