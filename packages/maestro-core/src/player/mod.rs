//! Per-guild player: a local mirror of remote playback state.
//!
//! A [`Player`] owns the queue, history, filter chain and repeat/shuffle
//! flags for one guild, and forwards playback commands to whichever node it
//! is currently assigned to. The remote side is authoritative for position;
//! [`Player::position`] interpolates between `playerUpdate` snapshots with
//! wall-clock time so the host never needs a network round trip to answer
//! "where are we in the track".
//!
//! Fail-over rides on [`Player::change_node`]: destroy on the old node,
//! replay the voice session, resume the track at the last known position,
//! reapply pause/volume/filters.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MaestroError, MaestroResult};
use crate::events::{Event, EventDispatcher};
use crate::filters::FilterSet;
use crate::node::Node;
use crate::protocol::{IncomingEvent, OutgoingMessage, PlayerState, TrackEndReason};
use crate::track::Track;

pub mod pool;
pub mod queue;

pub use pool::PlayerPool;
pub use queue::{History, Queue};

/// How long a player tolerates a disconnected-looking `playerUpdate` stream
/// before re-sending its voice session to the node.
const STALE_AFTER: Duration = Duration::from_secs(15 * 60);

/// Position tracking between `playerUpdate` frames.
#[derive(Debug, Default)]
struct PositionState {
    /// Last position reported by (or sent to) the node, in milliseconds.
    last_position_ms: u64,
    /// When that position was observed; `None` before the first update.
    last_update: Option<Instant>,
    /// Set while the update stream looks disconnected.
    stale_since: Option<Instant>,
}

/// Voice-gateway session data replayed on node changes.
#[derive(Debug, Clone)]
struct VoiceSession {
    session_id: String,
    event: Value,
}

/// Arguments to [`Player::play`].
#[derive(Debug, Clone, Default)]
pub struct PlayOptions {
    /// Track to play; `None` advances the queue.
    pub track: Option<Track>,
    /// Start offset in milliseconds.
    pub start_time: Option<u64>,
    /// Stop playback at this position, in milliseconds.
    pub end_time: Option<u64>,
    /// Ask the node to ignore the command if something is already playing.
    pub no_replace: bool,
    /// Sponsor segment categories to skip; falls back to the track's own.
    pub skip_segments: Vec<String>,
}

impl PlayOptions {
    /// Options that just play a given track from the start.
    #[must_use]
    pub fn track(track: Track) -> Self {
        Self {
            track: Some(track),
            ..Self::default()
        }
    }
}

/// Serializable snapshot of a player, for crash recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedPlayer {
    pub guild_id: u64,
    pub channel_id: Option<u64>,
    pub current: Option<Track>,
    /// Position within `current` at snapshot time, in milliseconds.
    pub position: u64,
    pub queue: Vec<Track>,
    pub paused: bool,
    pub volume: u16,
    pub repeat_current: bool,
    pub repeat_queue: bool,
    pub shuffle: bool,
    #[serde(default)]
    pub filters: FilterSet,
}

/// Per-guild mirror of remote playback state.
pub struct Player {
    guild_id: u64,
    node: RwLock<Arc<Node>>,
    /// Node this player sat on before a fail-over, for connect-back.
    origin_node: Mutex<Option<String>>,
    channel_id: Mutex<Option<u64>>,
    current: RwLock<Option<Track>>,
    queue: Mutex<Queue>,
    history: Mutex<History>,
    paused: AtomicBool,
    repeat_current: AtomicBool,
    repeat_queue: AtomicBool,
    shuffle: AtomicBool,
    volume: AtomicU16,
    filters: Mutex<FilterSet>,
    position: Mutex<PositionState>,
    voice: Mutex<Option<VoiceSession>>,
    hooks: Arc<EventDispatcher>,
}

impl Player {
    pub(crate) fn new(guild_id: u64, node: Arc<Node>, hooks: Arc<EventDispatcher>) -> Arc<Self> {
        Arc::new(Self {
            guild_id,
            node: RwLock::new(node),
            origin_node: Mutex::new(None),
            channel_id: Mutex::new(None),
            current: RwLock::new(None),
            queue: Mutex::new(Queue::new()),
            history: Mutex::new(History::new()),
            paused: AtomicBool::new(false),
            repeat_current: AtomicBool::new(false),
            repeat_queue: AtomicBool::new(false),
            shuffle: AtomicBool::new(false),
            volume: AtomicU16::new(100),
            filters: Mutex::new(FilterSet::default()),
            position: Mutex::new(PositionState::default()),
            voice: Mutex::new(None),
            hooks,
        })
    }

    pub fn guild_id(&self) -> u64 {
        self.guild_id
    }

    /// The node currently serving this player.
    pub fn node(&self) -> Arc<Node> {
        self.node.read().clone()
    }

    /// The voice channel the player reported joining, if any.
    pub fn channel_id(&self) -> Option<u64> {
        *self.channel_id.lock()
    }

    /// The track currently playing, if any.
    pub fn current(&self) -> Option<Track> {
        self.current.read().clone()
    }

    /// Whether a track is loaded and not paused.
    pub fn is_playing(&self) -> bool {
        self.current.read().is_some() && !self.is_paused()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn volume(&self) -> u16 {
        self.volume.load(Ordering::SeqCst)
    }

    pub fn is_shuffled(&self) -> bool {
        self.shuffle.load(Ordering::SeqCst)
    }

    pub fn repeats_current(&self) -> bool {
        self.repeat_current.load(Ordering::SeqCst)
    }

    pub fn repeats_queue(&self) -> bool {
        self.repeat_queue.load(Ordering::SeqCst)
    }

    /// The pending-track queue. Hold the guard briefly.
    pub fn queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock()
    }

    /// Recently finished tracks, newest last. Hold the guard briefly.
    pub fn history(&self) -> MutexGuard<'_, History> {
        self.history.lock()
    }

    /// Estimated playback position in milliseconds.
    ///
    /// Interpolates from the last `playerUpdate` using elapsed wall-clock
    /// time while playing; frozen while paused or before the first update.
    pub fn position(&self) -> u64 {
        let state = self.position.lock();
        match state.last_update {
            Some(at) if self.is_playing() => {
                let interpolated = state.last_position_ms + at.elapsed().as_millis() as u64;
                match self.current.read().as_ref().map(Track::length) {
                    Some(length) if length > 0 => interpolated.min(length),
                    _ => interpolated,
                }
            }
            _ => state.last_position_ms,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Voice Session
    // ─────────────────────────────────────────────────────────────────────────

    /// Forwards a Discord voice-gateway session update to the node, and
    /// keeps it for replay on node changes.
    pub fn voice_update(&self, session_id: impl Into<String>, event: Value) {
        let session = VoiceSession {
            session_id: session_id.into(),
            event,
        };
        self.send_voice(&session);
        *self.voice.lock() = Some(session);
    }

    fn send_voice(&self, session: &VoiceSession) {
        self.node().send(&OutgoingMessage::VoiceUpdate {
            guild_id: self.guild_id.to_string(),
            session_id: session.session_id.clone(),
            event: session.event.clone(),
        });
    }

    /// Records the channel the player joined or moved to.
    pub fn set_channel(&self, channel_id: u64) {
        let previous = self.channel_id.lock().replace(channel_id);
        let event = match previous {
            None => Event::PlayerConnected {
                guild_id: self.guild_id,
                channel_id,
            },
            Some(old) if old != channel_id => Event::PlayerMoved {
                guild_id: self.guild_id,
                channel_id,
            },
            Some(_) => return,
        };
        self.hooks.dispatch(event);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Playback Commands
    // ─────────────────────────────────────────────────────────────────────────

    /// Starts the given track, or advances the queue.
    ///
    /// With no explicit track: a repeated current track replays; a
    /// repeat-queue current is re-enqueued at the back before the next
    /// track is taken. Partial tracks are resolved against the node just
    /// before playback; a dequeued track that fails to resolve is skipped
    /// in favor of the next one. With nothing playable the player stops
    /// and emits a queue-end event - calling it again on an empty player
    /// is harmless.
    pub async fn play(&self, options: PlayOptions) -> MaestroResult<()> {
        let explicit = options.track.is_some();
        let mut candidate = match options.track {
            Some(track) => Some(track),
            None => self.next_from_queue(),
        };

        let resolved = loop {
            let Some(track) = candidate else { break None };
            if !track.is_partial() {
                break Some(track);
            }
            match self.resolve(&track).await {
                Ok(Some(track)) => break Some(track),
                Ok(None) | Err(_) if !explicit => {
                    log::warn!(
                        "[PLAYER] {}: could not resolve {:?}, skipping",
                        self.guild_id,
                        track.title()
                    );
                    candidate = self.next_from_queue();
                }
                Ok(None) => {
                    return Err(MaestroError::TrackNotFound(track.title().to_string()))
                }
                Err(e) => return Err(e),
            }
        };

        let Some(track) = resolved else {
            // Nothing playable: stop and report queue end. Safe to repeat.
            if self.current.write().take().is_some() {
                self.node()
                    .send(&OutgoingMessage::Stop {
                        guild_id: self.guild_id.to_string(),
                    });
            }
            self.hooks.dispatch(Event::QueueEnd {
                guild_id: self.guild_id,
            });
            return Ok(());
        };

        let length = track.length();
        if length > 0 {
            for (field, value) in [
                ("start_time", options.start_time),
                ("end_time", options.end_time),
            ] {
                if let Some(value) = value {
                    if value > length {
                        return Err(MaestroError::InvalidRange {
                            field,
                            value,
                            length,
                        });
                    }
                }
            }
        }

        let encoded = track
            .encoded
            .clone()
            .ok_or_else(|| MaestroError::TrackNotFound(track.title().to_string()))?;

        let skip_segments = if options.skip_segments.is_empty() {
            track.skip_segments.clone()
        } else {
            options.skip_segments
        };

        let replaying = self.repeats_current() && !explicit;
        let previous = self.current.write().replace(track);
        if let Some(previous) = previous {
            // Replaying the same repeated track over and over should not
            // flood the history.
            if !replaying {
                self.history.lock().push(previous);
            }
        }

        {
            let mut position = self.position.lock();
            position.last_position_ms = options.start_time.unwrap_or(0);
            position.last_update = Some(Instant::now());
            position.stale_since = None;
        }

        self.node().send(&OutgoingMessage::Play {
            guild_id: self.guild_id.to_string(),
            track: encoded,
            start_time: options.start_time,
            end_time: options.end_time,
            no_replace: options.no_replace.then_some(true),
            skip_segments: (!skip_segments.is_empty()).then_some(skip_segments),
        });
        Ok(())
    }

    /// Next track respecting repeat and shuffle flags.
    fn next_from_queue(&self) -> Option<Track> {
        let current = self.current.read().clone();
        if let Some(current) = current {
            if self.repeats_current() {
                return Some(current);
            }
            if self.repeats_queue() {
                self.queue.lock().push(current);
            }
        }
        let mut queue = self.queue.lock();
        if self.is_shuffled() {
            queue.pop_random()
        } else {
            queue.pop()
        }
    }

    async fn resolve(&self, track: &Track) -> MaestroResult<Option<Track>> {
        let Some(query) = &track.query else {
            return Ok(None);
        };
        let node = self.node();
        Ok(node.get_track(query).await?.map(|mut resolved| {
            resolved.requester = track.requester;
            resolved.skip_segments = track.skip_segments.clone();
            resolved
        }))
    }

    /// Stops playback and discards the current track. Queue and history
    /// are untouched.
    pub fn stop(&self) {
        self.node().send(&OutgoingMessage::Stop {
            guild_id: self.guild_id.to_string(),
        });
        *self.current.write() = None;
        self.hooks.dispatch(Event::PlayerStopped {
            guild_id: self.guild_id,
        });
    }

    /// Skips the current track and advances the queue, bypassing
    /// repeat-current.
    pub async fn skip(&self) -> MaestroResult<()> {
        let skipped = self.current.write().take();
        if let Some(track) = &skipped {
            self.history.lock().push(track.clone());
        }
        self.hooks.dispatch(Event::TrackSkipped {
            guild_id: self.guild_id,
            track: skipped,
        });
        self.play(PlayOptions::default()).await
    }

    /// Replays the most recently finished track, if the history has one.
    pub async fn previous(&self) -> MaestroResult<bool> {
        let Some(track) = self.history.lock().pop() else {
            return Ok(false);
        };
        self.play(PlayOptions::track(track)).await?;
        Ok(true)
    }

    /// Pauses or resumes playback.
    pub fn set_pause(&self, pause: bool) {
        if self.is_paused() == pause {
            return;
        }
        // Freeze the interpolated position before flipping the flag.
        let frozen = self.position();
        {
            let mut position = self.position.lock();
            position.last_position_ms = frozen;
            position.last_update = Some(Instant::now());
        }
        self.paused.store(pause, Ordering::SeqCst);
        self.node().send(&OutgoingMessage::Pause {
            guild_id: self.guild_id.to_string(),
            pause,
        });
        self.hooks.dispatch(if pause {
            Event::PlayerPaused {
                guild_id: self.guild_id,
            }
        } else {
            Event::PlayerResumed {
                guild_id: self.guild_id,
            }
        });
    }

    /// Seeks within the current track.
    ///
    /// Out-of-range positions clamp to `[0, length]`. A no-op when nothing
    /// is playing or the track is not seekable.
    pub fn seek(&self, position_ms: i64) {
        let Some(track) = self.current.read().clone() else {
            return;
        };
        if !track.is_seekable() {
            log::debug!("[PLAYER] {}: current track is not seekable", self.guild_id);
            return;
        }
        let clamped = position_ms.max(0) as u64;
        let clamped = match track.length() {
            0 => clamped,
            length => clamped.min(length),
        };
        {
            let mut position = self.position.lock();
            position.last_position_ms = clamped;
            position.last_update = Some(Instant::now());
        }
        self.node().send(&OutgoingMessage::Seek {
            guild_id: self.guild_id.to_string(),
            position: clamped,
        });
        self.hooks.dispatch(Event::PlayerSeeked {
            guild_id: self.guild_id,
            position: clamped,
        });
    }

    /// Sets the player volume; values clamp to 0-1000 (100 = 100%).
    pub fn set_volume(&self, volume: u16) {
        let volume = volume.min(1000);
        self.volume.store(volume, Ordering::SeqCst);
        self.node().send(&OutgoingMessage::Volume {
            guild_id: self.guild_id.to_string(),
            volume,
        });
        self.hooks.dispatch(Event::VolumeChanged {
            guild_id: self.guild_id,
            volume,
        });
    }

    /// Sets repeat flags for the current track and the whole queue.
    pub fn set_repeat(&self, repeat_current: bool, repeat_queue: bool) {
        self.repeat_current.store(repeat_current, Ordering::SeqCst);
        self.repeat_queue.store(repeat_queue, Ordering::SeqCst);
        self.hooks.dispatch(Event::RepeatChanged {
            guild_id: self.guild_id,
            repeat_current,
            repeat_queue,
        });
    }

    /// Toggles shuffled dequeueing.
    pub fn set_shuffle(&self, shuffle: bool) {
        self.shuffle.store(shuffle, Ordering::SeqCst);
        self.hooks.dispatch(Event::ShuffleToggled {
            guild_id: self.guild_id,
            shuffle,
        });
    }

    /// Mutates the filter chain and pushes the changed filters to the node.
    ///
    /// With `reset_not_set` the chain is first reset to defaults, so only
    /// what `apply` sets survives - a clean slate for exclusive presets.
    /// The current position is re-sent afterward; some servers glitch
    /// audibly on a filter change without a fresh seek.
    pub fn update_filters(&self, reset_not_set: bool, apply: impl FnOnce(&mut FilterSet)) {
        let payload = {
            let mut filters = self.filters.lock();
            if reset_not_set {
                filters.reset_all();
            }
            apply(&mut filters);
            filters.to_wire()
        };
        self.node().send(&OutgoingMessage::Filters {
            guild_id: self.guild_id.to_string(),
            payload,
        });
        self.hooks.dispatch(Event::FiltersApplied {
            guild_id: self.guild_id,
        });
        if self.current.read().as_ref().is_some_and(Track::is_seekable) {
            self.seek(self.position() as i64);
        }
    }

    /// Runs a closure against the filter chain without sending anything.
    pub fn with_filters<R>(&self, f: impl FnOnce(&FilterSet) -> R) -> R {
        f(&self.filters.lock())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Node Migration
    // ─────────────────────────────────────────────────────────────────────────

    /// Moves this player to another node.
    ///
    /// Destroys the server-side player on the old node when reachable (a
    /// no-op destroy is tolerated on a node that never saw the original
    /// play), replays the voice session, resumes the current track at the
    /// last known position and reapplies pause, volume and filters.
    pub fn change_node(&self, new_node: Arc<Node>) {
        let old_node = {
            let mut node = self.node.write();
            std::mem::replace(&mut *node, new_node.clone())
        };
        let old_name = old_node.identifier().to_string();
        if old_node.is_available() {
            old_node.send(&OutgoingMessage::Destroy {
                guild_id: self.guild_id.to_string(),
            });
        }

        if let Some(session) = self.voice.lock().clone() {
            self.send_voice(&session);
        }

        let current = self.current.read().clone();
        if let Some(track) = current {
            if let Some(encoded) = track.encoded {
                new_node.send(&OutgoingMessage::Play {
                    guild_id: self.guild_id.to_string(),
                    track: encoded,
                    start_time: Some(self.position()),
                    end_time: None,
                    no_replace: None,
                    skip_segments: (!track.skip_segments.is_empty())
                        .then(|| track.skip_segments.clone()),
                });
                if self.is_paused() {
                    new_node.send(&OutgoingMessage::Pause {
                        guild_id: self.guild_id.to_string(),
                        pause: true,
                    });
                }
            }
        }

        let volume = self.volume();
        if volume != 100 {
            new_node.send(&OutgoingMessage::Volume {
                guild_id: self.guild_id.to_string(),
                volume,
            });
        }
        {
            let filters = self.filters.lock();
            if filters.any_changed() {
                new_node.send(&OutgoingMessage::Filters {
                    guild_id: self.guild_id.to_string(),
                    payload: filters.to_wire(),
                });
            }
        }

        log::info!(
            "[PLAYER] {}: moved from {} to {}",
            self.guild_id,
            old_name,
            new_node.identifier()
        );
        self.hooks.dispatch(Event::NodeChanged {
            guild_id: self.guild_id,
            old_node: old_name,
            new_node: new_node.identifier().to_string(),
        });
    }

    /// Node this player should return to once it recovers, if any.
    pub fn origin(&self) -> Option<String> {
        self.origin_node.lock().clone()
    }

    pub(crate) fn set_origin(&self, node: String) {
        *self.origin_node.lock() = Some(node);
    }

    /// Forgets the connect-back origin. Call after a deliberate
    /// `change_node` to stop the pool from moving the player back.
    pub fn clear_origin(&self) {
        *self.origin_node.lock() = None;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inbound State
    // ─────────────────────────────────────────────────────────────────────────

    #[cfg(test)]
    fn backdate_staleness(&self) -> bool {
        match Instant::now().checked_sub(STALE_AFTER + Duration::from_secs(1)) {
            Some(past) => {
                self.position.lock().stale_since = Some(past);
                true
            }
            None => false,
        }
    }

    /// Applies a `playerUpdate` snapshot from the node.
    pub(crate) fn update_state(&self, state: &PlayerState) {
        let playing = self.is_playing();
        let resend_voice = {
            let mut position = self.position.lock();
            position.last_position_ms = state.position;
            position.last_update = Some(Instant::now());
            if state.connected || !playing {
                // Staleness only matters while this player believes it is
                // playing; an idle player has nothing to heal.
                position.stale_since = None;
                false
            } else {
                let since = *position.stale_since.get_or_insert_with(Instant::now);
                if since.elapsed() > STALE_AFTER {
                    position.stale_since = Some(Instant::now());
                    true
                } else {
                    false
                }
            }
        };

        // A long-dead voice connection sometimes heals when the session is
        // replayed to the node.
        if resend_voice {
            if let Some(session) = self.voice.lock().clone() {
                log::warn!(
                    "[PLAYER] {}: update stream stale, replaying voice session",
                    self.guild_id
                );
                self.send_voice(&session);
            }
        }

        self.hooks.dispatch(Event::PlayerUpdate {
            guild_id: self.guild_id,
            position: state.position,
            timestamp: state.time,
            connected: state.connected,
        });
    }

    /// Applies one lifecycle event from the node.
    ///
    /// Track end with reason `FINISHED`, exceptions and stuck tracks
    /// advance the queue; the other end reasons represent an intentional
    /// or already-handled transition.
    pub(crate) async fn handle_event(&self, event: IncomingEvent) {
        match event {
            IncomingEvent::TrackStartEvent { .. } => {
                let Some(track) = self.current() else { return };
                self.hooks.dispatch(Event::TrackStart {
                    guild_id: self.guild_id,
                    source: track.source(),
                    track,
                });
            }
            IncomingEvent::TrackEndEvent { reason, .. } => {
                self.hooks.dispatch(Event::TrackEnd {
                    guild_id: self.guild_id,
                    track: self.current(),
                    reason,
                });
                match reason {
                    TrackEndReason::Finished => {
                        if let Err(e) = self.play(PlayOptions::default()).await {
                            log::warn!("[PLAYER] {}: auto-advance failed: {e}", self.guild_id);
                        }
                    }
                    TrackEndReason::LoadFailed | TrackEndReason::Cleanup => {
                        if let Some(track) = self.current.write().take() {
                            self.history.lock().push(track);
                        }
                    }
                    TrackEndReason::Stopped | TrackEndReason::Replaced => {}
                }
            }
            IncomingEvent::TrackExceptionEvent {
                exception, error, ..
            } => {
                let message = exception
                    .and_then(|e| e.message)
                    .or(error)
                    .unwrap_or_else(|| "unknown error".to_string());
                log::warn!("[PLAYER] {}: track exception: {message}", self.guild_id);
                self.hooks.dispatch(Event::TrackException {
                    guild_id: self.guild_id,
                    track: self.current(),
                    message,
                });
                if let Err(e) = self.play(PlayOptions::default()).await {
                    log::warn!("[PLAYER] {}: advance after exception failed: {e}", self.guild_id);
                }
            }
            IncomingEvent::TrackStuckEvent { threshold_ms, .. } => {
                log::warn!(
                    "[PLAYER] {}: track stuck past {threshold_ms}ms",
                    self.guild_id
                );
                self.hooks.dispatch(Event::TrackStuck {
                    guild_id: self.guild_id,
                    threshold_ms,
                });
                if let Err(e) = self.play(PlayOptions::default()).await {
                    log::warn!("[PLAYER] {}: advance after stall failed: {e}", self.guild_id);
                }
            }
            IncomingEvent::WebSocketClosedEvent {
                code,
                reason,
                by_remote,
                ..
            } => {
                self.hooks.dispatch(Event::WebSocketClosed {
                    guild_id: self.guild_id,
                    code,
                    reason,
                    by_remote,
                });
            }
            IncomingEvent::SegmentsLoaded { segments, .. } => {
                self.hooks.dispatch(Event::SegmentsLoaded {
                    guild_id: self.guild_id,
                    segments,
                });
            }
            IncomingEvent::SegmentSkipped { segment, .. } => {
                self.hooks.dispatch(Event::SegmentSkipped {
                    guild_id: self.guild_id,
                    segment,
                });
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────────

    /// Snapshot for crash recovery; restore with
    /// [`PlayerPool::restore`](pool::PlayerPool::restore).
    pub fn to_saved_state(&self) -> SavedPlayer {
        SavedPlayer {
            guild_id: self.guild_id,
            channel_id: self.channel_id(),
            current: self.current(),
            position: self.position(),
            queue: self.queue.lock().snapshot(),
            paused: self.is_paused(),
            volume: self.volume(),
            repeat_current: self.repeats_current(),
            repeat_queue: self.repeats_queue(),
            shuffle: self.is_shuffled(),
            filters: self.filters.lock().clone(),
        }
    }

    pub(crate) fn load_saved_state(&self, saved: SavedPlayer) {
        *self.channel_id.lock() = saved.channel_id;
        // The saved current goes to the front; the host replays it with a
        // play call once voice is re-established.
        let mut tracks = Vec::with_capacity(saved.queue.len() + 1);
        tracks.extend(saved.current);
        tracks.extend(saved.queue);
        self.queue.lock().replace(tracks);
        self.paused.store(saved.paused, Ordering::SeqCst);
        self.volume.store(saved.volume, Ordering::SeqCst);
        self.repeat_current
            .store(saved.repeat_current, Ordering::SeqCst);
        self.repeat_queue.store(saved.repeat_queue, Ordering::SeqCst);
        self.shuffle.store(saved.shuffle, Ordering::SeqCst);
        *self.filters.lock() = saved.filters;
        self.position.lock().last_position_ms = saved.position;
    }

    /// Tears down the server-side player. Called by the pool on destroy.
    pub(crate) fn destroy_remote(&self) {
        let node = self.node();
        if node.is_available() {
            node.send(&OutgoingMessage::Destroy {
                guild_id: self.guild_id.to_string(),
            });
        }
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("guild_id", &self.guild_id)
            .field("node", &self.node().identifier().to_string())
            .field("playing", &self.is_playing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;

    use crate::config::{NodeConfig, PoolConfig};
    use crate::protocol::TrackInfo;

    fn test_node(name: &str) -> Arc<Node> {
        let mut config = NodeConfig::new("127.0.0.1", 2333, "secret");
        config.name = Some(name.to_string());
        Node::new(config, &PoolConfig::new(1), Weak::new()).unwrap()
    }

    fn resolved_track(title: &str, length: u64, seekable: bool) -> Track {
        Track {
            encoded: Some(format!("enc:{title}")),
            info: Some(TrackInfo {
                identifier: title.to_string(),
                title: title.to_string(),
                author: "author".to_string(),
                length,
                is_seekable: seekable,
                is_stream: false,
                position: 0,
                uri: None,
                source_name: Some("youtube".to_string()),
                isrc: None,
                artwork_url: None,
            }),
            query: None,
            requester: None,
            skip_segments: Vec::new(),
        }
    }

    struct Capture {
        events: Mutex<Vec<String>>,
    }

    impl crate::events::EventHook for Capture {
        fn on_event(&self, event: &Event) {
            self.events.lock().push(event.name().to_string());
        }
    }

    fn capturing_player(node: Arc<Node>) -> (Arc<Player>, Arc<Capture>) {
        let hooks = Arc::new(EventDispatcher::new());
        let capture = Arc::new(Capture {
            events: Mutex::new(Vec::new()),
        });
        hooks.register(capture.clone());
        (Player::new(42, node, hooks), capture)
    }

    #[tokio::test]
    async fn fresh_play_sets_current_and_leaves_history_alone() {
        let (player, _capture) = capturing_player(test_node("a"));
        player
            .play(PlayOptions::track(resolved_track("t", 10_000, true)))
            .await
            .unwrap();
        assert_eq!(player.current().unwrap().title(), "t");
        assert!(player.history().is_empty());
        assert!(player.is_playing());
        // The play op is queued on the disconnected socket.
        assert_eq!(player.node().socket().queued_len(), 1);
    }

    #[tokio::test]
    async fn out_of_range_start_time_is_an_error() {
        let (player, _capture) = capturing_player(test_node("a"));
        let err = player
            .play(PlayOptions {
                start_time: Some(20_000),
                ..PlayOptions::track(resolved_track("t", 10_000, true))
            })
            .await
            .expect_err("start beyond track length");
        assert!(matches!(err, MaestroError::InvalidRange { field: "start_time", .. }));
        assert!(player.current().is_none());
    }

    #[tokio::test]
    async fn empty_play_emits_queue_end_and_is_repeat_safe() {
        let (player, capture) = capturing_player(test_node("a"));
        player.play(PlayOptions::default()).await.unwrap();
        player.play(PlayOptions::default()).await.unwrap();
        assert!(player.current().is_none());
        let events = capture.events.lock();
        assert_eq!(
            events.iter().filter(|e| *e == "queue_end").count(),
            2
        );
    }

    #[tokio::test]
    async fn finished_track_advances_and_lands_in_history() {
        let (player, capture) = capturing_player(test_node("a"));
        player
            .play(PlayOptions::track(resolved_track("first", 10_000, true)))
            .await
            .unwrap();
        player.queue().push(resolved_track("second", 10_000, true));

        player
            .handle_event(IncomingEvent::TrackEndEvent {
                guild_id: "42".to_string(),
                track: "enc:first".to_string(),
                reason: TrackEndReason::Finished,
            })
            .await;

        assert_eq!(player.current().unwrap().title(), "second");
        assert_eq!(player.history().peek().unwrap().title(), "first");
        assert!(capture.events.lock().iter().any(|e| e == "track_end"));
    }

    #[tokio::test]
    async fn stopped_reason_does_not_advance() {
        let (player, _capture) = capturing_player(test_node("a"));
        player
            .play(PlayOptions::track(resolved_track("first", 10_000, true)))
            .await
            .unwrap();
        player.queue().push(resolved_track("second", 10_000, true));
        player.stop();

        player
            .handle_event(IncomingEvent::TrackEndEvent {
                guild_id: "42".to_string(),
                track: "enc:first".to_string(),
                reason: TrackEndReason::Stopped,
            })
            .await;

        assert!(player.current().is_none());
        assert_eq!(player.queue().len(), 1);
    }

    #[tokio::test]
    async fn repeat_current_replays_without_flooding_history() {
        let (player, _capture) = capturing_player(test_node("a"));
        player.set_repeat(true, false);
        player
            .play(PlayOptions::track(resolved_track("loop", 10_000, true)))
            .await
            .unwrap();
        for _ in 0..3 {
            player.play(PlayOptions::default()).await.unwrap();
        }
        assert_eq!(player.current().unwrap().title(), "loop");
        assert!(player.history().is_empty());
    }

    #[tokio::test]
    async fn track_start_event_carries_source_name() {
        let (player, capture) = capturing_player(test_node("a"));
        player
            .play(PlayOptions::track(resolved_track("t", 10_000, true)))
            .await
            .unwrap();
        player
            .handle_event(IncomingEvent::TrackStartEvent {
                guild_id: "42".to_string(),
                track: "enc:t".to_string(),
            })
            .await;
        assert!(capture
            .events
            .lock()
            .iter()
            .any(|e| e == "youtube_track_start"));
    }

    #[tokio::test]
    async fn seek_clamps_and_ignores_unseekable_tracks() {
        let (player, _capture) = capturing_player(test_node("a"));
        player
            .play(PlayOptions::track(resolved_track("t", 10_000, true)))
            .await
            .unwrap();
        let before = player.node().socket().queued_len();
        player.seek(-5);
        assert_eq!(player.node().socket().queued_len(), before + 1);
        assert!(player.position() < 100);

        player
            .play(PlayOptions::track(resolved_track("stream", 0, false)))
            .await
            .unwrap();
        let before = player.node().socket().queued_len();
        player.seek(5_000);
        // Not seekable: no command sent.
        assert_eq!(player.node().socket().queued_len(), before);
    }

    #[tokio::test]
    async fn change_node_repoints_and_replays_state() {
        let (player, capture) = capturing_player(test_node("a"));
        player
            .play(PlayOptions::track(resolved_track("t", 10_000, true)))
            .await
            .unwrap();
        player.set_volume(80);

        let replacement = test_node("b");
        player.change_node(replacement.clone());

        assert_eq!(player.node().identifier(), "b");
        // Play + volume land on the replacement's queue.
        assert!(replacement.socket().queued_len() >= 2);
        assert!(capture.events.lock().iter().any(|e| e == "node_changed"));
    }

    #[tokio::test]
    async fn stale_update_stream_replays_voice_only_while_playing() {
        let (player, _capture) = capturing_player(test_node("a"));
        player.voice_update("sess", serde_json::json!({"endpoint": "eu-west"}));
        let disconnected = PlayerState {
            time: 1,
            position: 0,
            connected: false,
            ping: None,
        };

        // Idle player: a long-disconnected update stream has nothing to heal.
        let before = player.node().socket().queued_len();
        if !player.backdate_staleness() {
            return;
        }
        player.update_state(&disconnected);
        assert_eq!(player.node().socket().queued_len(), before);

        player
            .play(PlayOptions::track(resolved_track("t", 10_000, true)))
            .await
            .unwrap();
        let before = player.node().socket().queued_len();
        assert!(player.backdate_staleness());
        player.update_state(&disconnected);
        // Playing through a stale stream: the voice session is replayed.
        assert_eq!(player.node().socket().queued_len(), before + 1);
    }

    #[tokio::test]
    async fn position_freezes_while_paused() {
        let (player, _capture) = capturing_player(test_node("a"));
        player
            .play(PlayOptions::track(resolved_track("t", 100_000, true)))
            .await
            .unwrap();
        player.update_state(&PlayerState {
            time: 1,
            position: 5_000,
            connected: true,
            ping: Some(10),
        });
        player.set_pause(true);
        let frozen = player.position();
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(player.position(), frozen);
    }

    #[test]
    fn saved_state_round_trips() {
        let node = test_node("a");
        let hooks = Arc::new(EventDispatcher::new());
        let player = Player::new(42, node.clone(), hooks.clone());
        player.queue().push(resolved_track("q1", 1_000, true));
        player.set_volume(60);
        player.set_repeat(false, true);

        let saved = player.to_saved_state();
        let raw = serde_json::to_string(&saved).unwrap();
        let saved: SavedPlayer = serde_json::from_str(&raw).unwrap();

        let restored = Player::new(saved.guild_id, node, hooks);
        restored.load_saved_state(saved);
        assert_eq!(restored.volume(), 60);
        assert!(restored.repeats_queue());
        assert_eq!(restored.queue().len(), 1);
    }
}
