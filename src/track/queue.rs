//! The per-player track queue.
//!
//! Owned by exactly one [`Player`](crate::player::Player); never shared
//! between guilds. [`Queue::shift`] is the only operation with non-trivial
//! semantics (see its doc comment); everything else is a straightforward
//! `Vec`/`VecDeque` manipulation.

use super::{LoopMode, Track, TrackId};

use std::collections::VecDeque;
use std::fmt::{self, Display, Formatter};

use rand::seq::SliceRandom;
use rand::thread_rng;

/// A player's track queue: upcoming tracks, the currently playing track (if
/// any), and a bounded history of what already played.
#[derive(Debug)]
pub struct Queue {
    upcoming: VecDeque<Track>,
    current: Option<Track>,
    history: VecDeque<Track>,
    history_size: usize,
    loop_mode: LoopMode,
}

/// A queue operation rejected because of an invalid argument.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct QueueError;

impl Display for QueueError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str("invalid queue operation argument")
    }
}

impl std::error::Error for QueueError {}

/// The sort key for [`Queue::sort_by`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SortKey {
    Title,
    Author,
    Duration,
    AddedAt,
}

/// A duration range used by [`Queue::filter_by_duration`], both bounds
/// inclusive.
#[derive(Clone, Copy, Debug)]
pub struct DurationRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Queue {
    /// Creates an empty queue with the given history capacity.
    pub fn new(history_size: usize) -> Queue {
        Queue {
            upcoming: VecDeque::new(),
            current: None,
            history: VecDeque::new(),
            history_size,
            loop_mode: LoopMode::Off,
        }
    }

    // -- basic accessors --------------------------------------------------

    pub fn current(&self) -> Option<&Track> {
        self.current.as_ref()
    }

    pub fn upcoming(&self) -> impl Iterator<Item = &Track> {
        self.upcoming.iter()
    }

    pub fn history(&self) -> impl Iterator<Item = &Track> {
        self.history.iter()
    }

    pub fn len(&self) -> usize {
        self.upcoming.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upcoming.is_empty()
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn set_loop(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
    }

    pub fn history_size(&self) -> usize {
        self.history_size
    }

    /// Directly sets the current track, without touching history. Used by
    /// the player when restoring a snapshot or starting an explicit track.
    pub fn set_current(&mut self, track: Option<Track>) {
        self.current = track;
    }

    // -- mutation -----------------------------------------------------------

    /// Appends a track to the back of the queue.
    pub fn add(&mut self, track: Track) {
        self.upcoming.push_back(track);
    }

    /// Appends many tracks, preserving order.
    pub fn add_many(&mut self, tracks: impl IntoIterator<Item = Track>) {
        self.upcoming.extend(tracks);
    }

    /// Removes and returns the track at `index`, if in range.
    pub fn remove_at(&mut self, index: usize) -> Result<Track, QueueError> {
        self.upcoming.remove(index).ok_or(QueueError)
    }

    /// Returns a reference to the track at `index`, if in range.
    pub fn get(&self, index: usize) -> Option<&Track> {
        self.upcoming.get(index)
    }

    /// Clears all upcoming tracks. Does not touch `current` or `history`.
    pub fn clear(&mut self) {
        self.upcoming.clear();
    }

    /// Shuffles the upcoming queue in place with a Fisher-Yates shuffle.
    pub fn shuffle(&mut self) {
        let mut vec: Vec<Track> = self.upcoming.drain(..).collect();
        vec.shuffle(&mut thread_rng());
        self.upcoming = vec.into();
    }

    /// Moves the track at `from` to position `to`.
    pub fn move_from_to(&mut self, from: usize, to: usize) -> Result<(), QueueError> {
        if from >= self.upcoming.len() || to >= self.upcoming.len() {
            return Err(QueueError);
        }

        let track = self.upcoming.remove(from).ok_or(QueueError)?;
        self.upcoming.insert(to, track);
        Ok(())
    }

    /// Returns the track at the head of the queue without consuming it.
    pub fn peek(&self) -> Option<&Track> {
        self.upcoming.front()
    }

    /// Advances the queue according to the loop mode.
    ///
    /// - `loop=track`: if a track is currently playing, returns it again
    ///   without consuming `upcoming` or touching `history`.
    /// - `loop=queue`: if a track is currently playing, it is pushed to the
    ///   tail of `upcoming` *before* the head is taken, so the queue cycles.
    /// - `loop=off`: the current track (if any) moves into `history`
    ///   (evicting the oldest entry if at capacity), then the head of
    ///   `upcoming` becomes the new current track.
    ///
    /// Returns the new current track, or `None` if the queue is exhausted.
    pub fn shift(&mut self) -> Option<Track> {
        match self.loop_mode {
            LoopMode::Track if self.current.is_some() => {
                return self.current.clone();
            }
            LoopMode::Queue if self.current.is_some() => {
                let current = self.current.take().unwrap();
                self.upcoming.push_back(current);
            }
            _ => {
                if let Some(current) = self.current.take() {
                    self.push_history(current);
                }
            }
        }

        self.current = self.upcoming.pop_front();
        self.current.clone()
    }

    /// Moves one track backward: the current track is unshifted back onto
    /// the head of `upcoming`, and the most recent history entry becomes the
    /// new current track. Returns `None` (and does nothing) if history is
    /// empty.
    pub fn back_one(&mut self) -> Option<Track> {
        let previous = self.history.pop_back()?;

        if let Some(current) = self.current.take() {
            self.upcoming.push_front(current);
        }

        self.current = Some(previous.clone());
        Some(previous)
    }

    fn push_history(&mut self, track: Track) {
        if self.history.len() >= self.history_size {
            self.history.pop_front();
        }
        self.history.push_back(track);
    }

    /// Clears the history buffer.
    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Whether `track` case-foldedly matches `(title, author)` of an
    /// already-queued or currently-playing track. Used to reject enqueues
    /// when `allowDuplicates` is disabled.
    pub fn is_duplicate(&self, track: &Track) -> bool {
        let key = (track.title.to_lowercase(), track.author.to_lowercase());
        let matches = |t: &Track| (t.title.to_lowercase(), t.author.to_lowercase()) == key;

        self.current.as_ref().map(matches).unwrap_or(false)
            || self.upcoming.iter().any(matches)
    }

    /// Removes duplicate tracks (case-folded `(title, author)` match),
    /// keeping the first occurrence of each.
    pub fn remove_duplicates(&mut self) -> usize {
        let mut seen = std::collections::HashSet::new();
        let before = self.upcoming.len();

        self.upcoming.retain(|track| {
            let key = (track.title.to_lowercase(), track.author.to_lowercase());
            seen.insert(key)
        });

        before - self.upcoming.len()
    }

    /// Removes every upcoming track matching `predicate`, returning how many
    /// were removed.
    pub fn remove_where(&mut self, mut predicate: impl FnMut(&Track) -> bool) -> usize {
        let before = self.upcoming.len();
        self.upcoming.retain(|t| !predicate(t));
        before - self.upcoming.len()
    }

    /// Removes every upcoming track added by `requester`.
    pub fn remove_by_requester(&mut self, requester: &super::Requester) -> usize {
        self.remove_where(|t| &t.requester == requester)
    }

    /// Returns tracks from a given source tag.
    pub fn filter_by_source<'a>(&'a self, source: &'a str) -> impl Iterator<Item = &'a Track> {
        self.upcoming.iter().filter(move |t| t.source == source)
    }

    /// Returns tracks whose duration falls within `range`, inclusive.
    pub fn filter_by_duration(&self, range: DurationRange) -> Vec<&Track> {
        self.upcoming
            .iter()
            .filter(|t| t.duration_ms >= range.min_ms && t.duration_ms <= range.max_ms)
            .collect()
    }

    /// Substring search (case-insensitive) over title and author.
    pub fn search_by_text(&self, query: &str) -> Vec<&Track> {
        let query = query.to_lowercase();
        self.upcoming
            .iter()
            .filter(|t| {
                t.title.to_lowercase().contains(&query) || t.author.to_lowercase().contains(&query)
            })
            .collect()
    }

    /// Picks a random upcoming track without removing it.
    pub fn random_pick(&self) -> Option<&Track> {
        self.upcoming.iter().collect::<Vec<_>>().choose(&mut thread_rng()).copied()
    }

    pub fn first(&self, n: usize) -> impl Iterator<Item = &Track> {
        self.upcoming.iter().take(n)
    }

    pub fn last(&self, n: usize) -> Vec<&Track> {
        let len = self.upcoming.len();
        let skip = len.saturating_sub(n);
        self.upcoming.iter().skip(skip).collect()
    }

    pub fn has(&self, id: TrackId) -> bool {
        self.upcoming.iter().any(|t| t.id == id) || self.current.as_ref().map(|t| t.id) == Some(id)
    }

    pub fn index_of(&self, id: TrackId) -> Option<usize> {
        self.upcoming.iter().position(|t| t.id == id)
    }

    /// Swaps two upcoming tracks by index.
    pub fn swap(&mut self, a: usize, b: usize) -> Result<(), QueueError> {
        if a >= self.upcoming.len() || b >= self.upcoming.len() {
            return Err(QueueError);
        }
        self.upcoming.swap(a, b);
        Ok(())
    }

    /// Sorts the upcoming queue by `key`, ascending unless `descending`.
    pub fn sort_by(&mut self, key: SortKey, descending: bool) {
        let mut vec: Vec<Track> = self.upcoming.drain(..).collect();

        vec.sort_by(|a, b| {
            let ord = match key {
                SortKey::Title => a.title.to_lowercase().cmp(&b.title.to_lowercase()),
                SortKey::Author => a.author.to_lowercase().cmp(&b.author.to_lowercase()),
                SortKey::Duration => a.duration_ms.cmp(&b.duration_ms),
                SortKey::AddedAt => a.added_at_ms.cmp(&b.added_at_ms),
            };
            if descending {
                ord.reverse()
            } else {
                ord
            }
        });

        self.upcoming = vec.into();
    }

    /// Sum of `duration_ms` across all upcoming tracks (current excluded).
    pub fn total_duration_ms(&self) -> u64 {
        self.upcoming.iter().map(|t| t.duration_ms).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(title: &str) -> Track {
        Track::new(
            format!("encoded-{title}"),
            title.to_string(),
            String::from("author"),
            None,
            title.to_string(),
            1000,
            true,
            false,
            String::from("test"),
            0,
        )
    }

    #[test]
    fn shift_off_moves_current_to_history() {
        let mut q = Queue::new(50);
        q.add(track("a"));
        q.add(track("b"));

        assert_eq!(q.shift().unwrap().title, "a");
        assert_eq!(q.shift().unwrap().title, "b");
        assert_eq!(q.history().count(), 1);
        assert_eq!(q.history().next().unwrap().title, "a");
        assert!(q.shift().is_none());
    }

    #[test]
    fn shift_loop_track_repeats_current_without_consuming() {
        let mut q = Queue::new(50);
        q.add(track("a"));
        q.add(track("b"));
        q.set_loop(LoopMode::Track);

        assert_eq!(q.shift().unwrap().title, "a");
        assert_eq!(q.shift().unwrap().title, "a");
        assert_eq!(q.shift().unwrap().title, "a");
        assert_eq!(q.len(), 1, "upcoming must be untouched by loop=track");
        assert_eq!(q.history().count(), 0);
    }

    #[test]
    fn shift_loop_queue_cycles_all_tracks_exactly_once_per_round() {
        let mut q = Queue::new(50);
        for t in ["a", "b", "c"] {
            q.add(track(t));
        }
        q.set_loop(LoopMode::Queue);

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(q.shift().unwrap().title);
        }
        assert_eq!(seen, vec!["a", "b", "c"]);

        // after one full round the queue must be a rotation of the original
        let mut seen2 = Vec::new();
        for _ in 0..3 {
            seen2.push(q.shift().unwrap().title);
        }
        assert_eq!(seen2, vec!["a", "b", "c"]);
    }

    #[test]
    fn history_is_bounded() {
        let mut q = Queue::new(2);
        for t in ["a", "b", "c", "d"] {
            q.add(track(t));
        }

        for _ in 0..4 {
            q.shift();
        }

        assert!(q.history().count() <= 2);
        let titles: Vec<_> = q.history().map(|t| t.title.clone()).collect();
        assert_eq!(titles, vec!["b", "c"]);
    }

    #[test]
    fn back_one_restores_previous_and_requeues_current() {
        let mut q = Queue::new(50);
        q.add(track("a"));
        q.add(track("b"));

        q.shift(); // current = a
        q.shift(); // current = b, history = [a]

        let back = q.back_one().unwrap();
        assert_eq!(back.title, "a");
        assert_eq!(q.current().unwrap().title, "a");
        assert_eq!(q.peek().unwrap().title, "b");
        assert!(q.back_one().is_none());
    }

    #[test]
    fn remove_duplicates_is_case_insensitive_on_title_and_author() {
        let mut q = Queue::new(50);
        q.add(track("Song"));
        let mut dup = track("song");
        dup.author = "author".to_string();
        q.add(dup);
        q.add(track("Other"));

        let removed = q.remove_duplicates();
        assert_eq!(removed, 1);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn remove_at_out_of_range_is_invalid_argument() {
        let mut q = Queue::new(50);
        q.add(track("a"));
        assert!(q.remove_at(5).is_err());
    }

    #[test]
    fn shuffle_is_a_permutation() {
        let mut q = Queue::new(50);
        for t in ["a", "b", "c", "d", "e"] {
            q.add(track(t));
        }

        let mut before: Vec<_> = q.upcoming().map(|t| t.title.clone()).collect();
        q.shuffle();
        let mut after: Vec<_> = q.upcoming().map(|t| t.title.clone()).collect();

        before.sort();
        after.sort();
        assert_eq!(before, after);
    }

    #[test]
    fn add_then_drain_in_order_with_loop_off() {
        let mut q = Queue::new(50);
        let titles = ["a", "b", "c"];
        for t in titles {
            q.add(track(t));
        }

        let mut drained = Vec::new();
        while let Some(t) = q.shift() {
            drained.push(t.title);
        }

        assert_eq!(drained, titles);
    }
}
