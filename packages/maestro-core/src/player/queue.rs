//! FIFO track queue and bounded playback history.

use std::collections::VecDeque;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{MaestroError, MaestroResult};
use crate::track::Track;

/// How many finished tracks the history retains before evicting the oldest.
const HISTORY_CAPACITY: usize = 100;

/// Pending tracks for one player, in play order.
#[derive(Debug, Default)]
pub struct Queue {
    tracks: VecDeque<Track>,
}

impl Queue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Appends a track at the back of the queue.
    pub fn push(&mut self, track: Track) {
        self.tracks.push_back(track);
    }

    /// Puts a track at the front, to play next.
    pub fn push_front(&mut self, track: Track) {
        self.tracks.push_front(track);
    }

    /// Inserts at `index`, shifting later tracks back.
    pub fn insert(&mut self, index: usize, track: Track) -> MaestroResult<()> {
        if index > self.tracks.len() {
            return Err(self.out_of_range("index", index));
        }
        self.tracks.insert(index, track);
        Ok(())
    }

    /// Takes the next track to play.
    pub fn pop(&mut self) -> Option<Track> {
        self.tracks.pop_front()
    }

    /// Takes a uniformly random track, for shuffle playback.
    pub fn pop_random(&mut self) -> Option<Track> {
        if self.tracks.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..self.tracks.len());
        self.tracks.remove(index)
    }

    /// Next track to play, without removing it.
    pub fn peek(&self) -> Option<&Track> {
        self.tracks.front()
    }

    /// Removes and returns the track at `index`.
    pub fn remove(&mut self, index: usize) -> MaestroResult<Track> {
        self.tracks
            .remove(index)
            .ok_or_else(|| self.out_of_range("index", index))
    }

    /// Moves the track at `from` so it sits at `to`.
    pub fn move_track(&mut self, from: usize, to: usize) -> MaestroResult<()> {
        if to >= self.tracks.len() {
            return Err(self.out_of_range("to", to));
        }
        let track = self
            .tracks
            .remove(from)
            .ok_or_else(|| self.out_of_range("from", from))?;
        self.tracks.insert(to, track);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }

    /// Randomizes the queue order in place.
    pub fn shuffle(&mut self) {
        self.tracks
            .make_contiguous()
            .shuffle(&mut rand::thread_rng());
    }

    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter()
    }

    /// Replaces the whole queue, used when restoring a saved player.
    pub(crate) fn replace(&mut self, tracks: Vec<Track>) {
        self.tracks = tracks.into();
    }

    pub(crate) fn snapshot(&self) -> Vec<Track> {
        self.tracks.iter().cloned().collect()
    }

    fn out_of_range(&self, field: &'static str, value: usize) -> MaestroError {
        MaestroError::InvalidRange {
            field,
            value: value as u64,
            length: self.tracks.len() as u64,
        }
    }
}

/// Recently finished tracks, newest last, bounded at
/// [`HISTORY_CAPACITY`].
#[derive(Debug, Default)]
pub struct History {
    tracks: VecDeque<Track>,
}

impl History {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Records a finished track, evicting the oldest entry when full.
    pub fn push(&mut self, track: Track) {
        if self.tracks.len() == HISTORY_CAPACITY {
            self.tracks.pop_front();
        }
        self.tracks.push_back(track);
    }

    /// Takes the most recently finished track, for "play previous".
    pub fn pop(&mut self) -> Option<Track> {
        self.tracks.pop_back()
    }

    /// Most recently finished track, without removing it.
    pub fn peek(&self) -> Option<&Track> {
        self.tracks.back()
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::{Query, Source};

    fn track(name: &str) -> Track {
        Track::partial(Query::new(Source::Http, name))
    }

    fn titles(queue: &Queue) -> Vec<String> {
        queue.iter().map(|t| t.title().to_string()).collect()
    }

    #[test]
    fn queue_is_fifo() {
        let mut queue = Queue::new();
        queue.push(track("a"));
        queue.push(track("b"));
        queue.push_front(track("c"));
        assert_eq!(titles(&queue), ["c", "a", "b"]);
        assert_eq!(queue.pop().unwrap().title(), "c");
        assert_eq!(queue.pop().unwrap().title(), "a");
    }

    #[test]
    fn remove_and_insert_validate_range() {
        let mut queue = Queue::new();
        queue.push(track("a"));
        assert!(matches!(
            queue.remove(5),
            Err(MaestroError::InvalidRange { field: "index", value: 5, length: 1 })
        ));
        assert!(queue.insert(2, track("b")).is_err());
        assert!(queue.insert(1, track("b")).is_ok());
        assert_eq!(queue.remove(1).unwrap().title(), "b");
    }

    #[test]
    fn move_track_reorders() {
        let mut queue = Queue::new();
        for name in ["a", "b", "c", "d"] {
            queue.push(track(name));
        }
        queue.move_track(3, 0).unwrap();
        assert_eq!(titles(&queue), ["d", "a", "b", "c"]);
        assert!(queue.move_track(0, 9).is_err());
        assert!(queue.move_track(9, 0).is_err());
    }

    #[test]
    fn shuffle_preserves_contents() {
        let mut queue = Queue::new();
        for i in 0..20 {
            queue.push(track(&format!("t{i}")));
        }
        queue.shuffle();
        assert_eq!(queue.len(), 20);
        let mut names = titles(&queue);
        names.sort();
        let mut expected: Vec<String> = (0..20).map(|i| format!("t{i}")).collect();
        expected.sort();
        assert_eq!(names, expected);
    }

    #[test]
    fn pop_random_drains_everything() {
        let mut queue = Queue::new();
        for name in ["a", "b", "c"] {
            queue.push(track(name));
        }
        let mut seen = Vec::new();
        while let Some(t) = queue.pop_random() {
            seen.push(t.title().to_string());
        }
        seen.sort();
        assert_eq!(seen, ["a", "b", "c"]);
    }

    #[test]
    fn history_is_bounded_and_lifo() {
        let mut history = History::new();
        for i in 0..(HISTORY_CAPACITY + 10) {
            history.push(track(&format!("t{i}")));
        }
        assert_eq!(history.len(), HISTORY_CAPACITY);
        // Oldest entries were evicted; the most recent comes back first.
        assert_eq!(history.pop().unwrap().title(), "t109");
        assert_eq!(history.peek().unwrap().title(), "t108");
    }
}
