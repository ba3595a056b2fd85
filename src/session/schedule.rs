//! Gap-free playback scheduling.
//!
//! Each inbound chunk starts where the previous one ends, or right now if
//! playback has fallen behind the audio clock.

use std::collections::HashSet;

use crate::audio::SourceId;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackSchedule {
    next_start_time: f64,
}

impl PlaybackSchedule {
    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// Drop any backlog: the next chunk starts at `now`.
    pub fn reset(&mut self, now: f64) {
        self.next_start_time = now;
    }

    /// Start time for a chunk arriving at clock time `now`.
    pub fn start_time(&self, now: f64) -> f64 {
        now.max(self.next_start_time)
    }

    /// Record that a chunk of `duration` seconds was scheduled at `start`.
    pub fn advance(&mut self, start: f64, duration: f64) {
        self.next_start_time = start + duration;
    }
}

/// Playback sources scheduled and not yet finished.
#[derive(Debug, Default)]
pub struct ActiveSourceSet {
    sources: HashSet<SourceId>,
}

impl ActiveSourceSet {
    pub fn insert(&mut self, id: SourceId) {
        self.sources.insert(id);
    }

    /// Returns false when the source was not active (already stopped).
    pub fn remove(&mut self, id: &SourceId) -> bool {
        self.sources.remove(id)
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Empty the set, yielding every member.
    pub fn drain(&mut self) -> Vec<SourceId> {
        self.sources.drain().collect()
    }
}
