//! Track and query value objects plus the load-result cache.
//!
//! A [`Track`] mirrors the node's encoded-track representation: an opaque
//! encoded string plus lazily resolved metadata. A track known only by its
//! [`Query`] is *partial* and gets resolved through a node search just
//! before playback.
//!
//! [`TrackCache`] is an explicitly constructed, explicitly owned LRU+TTL
//! cache for load results - never ambient global state.

use std::fmt;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::protocol::{LoadResult, TrackData, TrackInfo};

// ─────────────────────────────────────────────────────────────────────────────
// Query
// ─────────────────────────────────────────────────────────────────────────────

/// Audio source a query or track belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    YouTube,
    YouTubeMusic,
    Spotify,
    SoundCloud,
    AppleMusic,
    Deezer,
    Bandcamp,
    Twitch,
    Vimeo,
    Http,
    Local,
    Unknown,
}

impl Source {
    /// The capability name a node advertises for this source.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::YouTube => "youtube",
            Self::YouTubeMusic => "youtubemusic",
            Self::Spotify => "spotify",
            Self::SoundCloud => "soundcloud",
            Self::AppleMusic => "applemusic",
            Self::Deezer => "deezer",
            Self::Bandcamp => "bandcamp",
            Self::Twitch => "twitch",
            Self::Vimeo => "vimeo",
            Self::Http => "http",
            Self::Local => "local",
            Self::Unknown => "unknown",
        }
    }

    /// Maps the node-reported `sourceName` to a source tag.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "youtube" => Self::YouTube,
            "youtubemusic" | "youtube music" => Self::YouTubeMusic,
            "spotify" => Self::Spotify,
            "soundcloud" => Self::SoundCloud,
            "applemusic" | "apple music" => Self::AppleMusic,
            "deezer" => Self::Deezer,
            "bandcamp" => Self::Bandcamp,
            "twitch" => Self::Twitch,
            "vimeo" => Self::Vimeo,
            "http" => Self::Http,
            "local" => Self::Local,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pre-parsed lookup request: source tag plus resolved identifier.
///
/// Query parsing / URL classification is an external collaborator; this
/// library consumes queries as opaque, pre-built inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Source the identifier belongs to.
    pub source: Source,
    /// Resolved identifier, URL, or search string.
    pub identifier: String,
    /// Whether this is a free-text search rather than a direct link.
    #[serde(default)]
    pub is_search: bool,
    /// Whether the identifier points at a playlist.
    #[serde(default)]
    pub is_playlist: bool,
    /// Whether the identifier points at an album.
    #[serde(default)]
    pub is_album: bool,
    /// Whether the identifier is a local filesystem path.
    #[serde(default)]
    pub is_local: bool,
}

impl Query {
    /// Creates a direct (non-search) query.
    #[must_use]
    pub fn new(source: Source, identifier: impl Into<String>) -> Self {
        Self {
            source,
            identifier: identifier.into(),
            is_search: false,
            is_playlist: false,
            is_album: false,
            is_local: source == Source::Local,
        }
    }

    /// Creates a free-text search query.
    #[must_use]
    pub fn search(source: Source, terms: impl Into<String>) -> Self {
        Self {
            is_search: true,
            ..Self::new(source, terms)
        }
    }

    /// The identifier string sent to the node's `loadtracks` endpoint.
    ///
    /// Search queries get the source's search prefix; direct identifiers
    /// pass through unchanged.
    #[must_use]
    pub fn load_identifier(&self) -> String {
        if !self.is_search {
            return self.identifier.clone();
        }
        let prefix = match self.source {
            Source::YouTubeMusic => "ytmsearch:",
            Source::SoundCloud => "scsearch:",
            Source::Spotify => "spsearch:",
            Source::AppleMusic => "amsearch:",
            Source::Deezer => "dzsearch:",
            _ => "ytsearch:",
        };
        format!("{prefix}{}", self.identifier)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Track
// ─────────────────────────────────────────────────────────────────────────────

/// A playable track: encoded string plus lazily resolved metadata.
///
/// A track with no encoded string is *partial* - known only by its query -
/// and is resolved via a node search just before playback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    /// Opaque server-encoded track string; `None` for partial tracks.
    pub encoded: Option<String>,
    /// Resolved metadata; `None` until decoded or loaded.
    pub info: Option<TrackInfo>,
    /// The query this track came from, kept for lazy resolution.
    pub query: Option<Query>,
    /// The user that requested this track, if the host tracks that.
    #[serde(default)]
    pub requester: Option<u64>,
    /// Sponsor segment categories to skip during playback.
    #[serde(default)]
    pub skip_segments: Vec<String>,
}

impl Track {
    /// Builds a fully resolved track from a node load result entry.
    #[must_use]
    pub fn from_data(data: TrackData) -> Self {
        Self {
            encoded: Some(data.track),
            info: Some(data.info),
            query: None,
            requester: None,
            skip_segments: Vec::new(),
        }
    }

    /// Builds a partial track pending a lazy search.
    #[must_use]
    pub fn partial(query: Query) -> Self {
        Self {
            encoded: None,
            info: None,
            query: Some(query),
            requester: None,
            skip_segments: Vec::new(),
        }
    }

    /// Attaches the originating query, keeping it for later re-resolution.
    #[must_use]
    pub fn with_query(mut self, query: Query) -> Self {
        self.query = Some(query);
        self
    }

    /// Attaches the requesting user's id.
    #[must_use]
    pub fn with_requester(mut self, requester: u64) -> Self {
        self.requester = Some(requester);
        self
    }

    /// Whether this track still needs resolution before it can play.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.encoded.is_none()
    }

    /// Track title, or the raw query for partial tracks.
    #[must_use]
    pub fn title(&self) -> &str {
        match (&self.info, &self.query) {
            (Some(info), _) => &info.title,
            (None, Some(query)) => &query.identifier,
            (None, None) => "unknown",
        }
    }

    /// Track length in milliseconds; 0 while unresolved.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.info.as_ref().map_or(0, |i| i.length)
    }

    /// Whether the node reports the track as seekable.
    #[must_use]
    pub fn is_seekable(&self) -> bool {
        self.info.as_ref().is_some_and(|i| i.is_seekable)
    }

    /// The track's source tag, from metadata or the originating query.
    #[must_use]
    pub fn source(&self) -> Source {
        if let Some(info) = &self.info {
            if let Some(name) = &info.source_name {
                return Source::from_name(name);
            }
        }
        self.query.as_ref().map_or(Source::Unknown, |q| q.source)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Track Cache
// ─────────────────────────────────────────────────────────────────────────────

/// Default number of cached load results.
const DEFAULT_CACHE_CAPACITY: usize = 512;

/// Default time-to-live for a cached load result.
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(600);

struct CacheEntry {
    result: LoadResult,
    inserted: Instant,
}

/// Bounded LRU cache for `loadtracks` results with per-entry TTL.
///
/// Owned by the node pool and passed into lookups; expiry is enforced
/// lazily on read so no background task is needed.
pub struct TrackCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
}

impl TrackCache {
    /// Creates a cache with the given capacity and entry TTL.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity clamped to >= 1");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Returns the cached result for an identifier, if present and fresh.
    #[must_use]
    pub fn get(&self, identifier: &str) -> Option<LoadResult> {
        let mut entries = self.entries.lock();
        match entries.get(identifier) {
            Some(entry) if entry.inserted.elapsed() < self.ttl => Some(entry.result.clone()),
            Some(_) => {
                entries.pop(identifier);
                None
            }
            None => None,
        }
    }

    /// Stores a load result under its identifier.
    pub fn insert(&self, identifier: impl Into<String>, result: LoadResult) {
        self.entries.lock().put(
            identifier.into(),
            CacheEntry {
                result,
                inserted: Instant::now(),
            },
        );
    }

    /// Number of live entries (expired entries may still be counted).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TrackCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LoadType;

    fn sample_result() -> LoadResult {
        LoadResult {
            load_type: LoadType::SearchResult,
            playlist_info: None,
            tracks: Vec::new(),
            exception: None,
        }
    }

    #[test]
    fn search_query_gets_source_prefix() {
        let q = Query::search(Source::SoundCloud, "lofi beats");
        assert_eq!(q.load_identifier(), "scsearch:lofi beats");

        let q = Query::search(Source::YouTube, "lofi beats");
        assert_eq!(q.load_identifier(), "ytsearch:lofi beats");
    }

    #[test]
    fn direct_query_passes_identifier_through() {
        let q = Query::new(Source::Http, "https://example.com/a.mp3");
        assert_eq!(q.load_identifier(), "https://example.com/a.mp3");
    }

    #[test]
    fn partial_track_resolves_source_from_query() {
        let track = Track::partial(Query::search(Source::Spotify, "song"));
        assert!(track.is_partial());
        assert_eq!(track.source(), Source::Spotify);
        assert_eq!(track.title(), "song");
    }

    #[test]
    fn cache_returns_fresh_entries() {
        let cache = TrackCache::new(4, Duration::from_secs(60));
        cache.insert("id", sample_result());
        assert!(cache.get("id").is_some());
        assert!(cache.get("other").is_none());
    }

    #[test]
    fn cache_expires_entries_after_ttl() {
        let cache = TrackCache::new(4, Duration::ZERO);
        cache.insert("id", sample_result());
        assert!(cache.get("id").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let cache = TrackCache::new(2, Duration::from_secs(60));
        cache.insert("a", sample_result());
        cache.insert("b", sample_result());
        cache.insert("c", sample_result());
        assert!(cache.get("a").is_none());
        assert!(cache.get("c").is_some());
    }
}
