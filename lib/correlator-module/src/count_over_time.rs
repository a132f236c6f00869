//! A sliding-window per-identifier timestamp counter, used by modules that
//! need to rate-limit by host/user (e.g. SSHD failed-login lockouts).

use std::collections::{HashMap, VecDeque};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CountOverTime {
    window_seconds: i64,
    entries: HashMap<String, VecDeque<NaiveDateTime>>,
}

impl CountOverTime {
    pub fn new(window_seconds: i64) -> Self {
        CountOverTime {
            window_seconds,
            entries: HashMap::new(),
        }
    }

    /// Records an occurrence for `id` at `now`, prunes anything older than
    /// the window, and returns the count still within the window
    /// (including the occurrence just recorded).
    pub fn record(&mut self, id: &str, now: NaiveDateTime) -> usize {
        let entry = self.entries.entry(id.to_string()).or_default();
        entry.push_back(now);
        Self::prune_queue(entry, self.window_seconds, now);
        entry.len()
    }

    /// Returns the current in-window count for `id` without recording a new
    /// occurrence.
    pub fn count(&self, id: &str) -> usize {
        self.entries.get(id).map(VecDeque::len).unwrap_or(0)
    }

    /// Drops every recorded occurrence for `id`, as when an address that had
    /// been accumulating failures successfully authenticates.
    pub fn clear(&mut self, id: &str) {
        self.entries.remove(id);
    }

    /// Drops any identifier whose every occurrence has aged out as of
    /// `now`. Intended to run from a maintenance timer, not the hot path.
    pub fn expire(&mut self, now: NaiveDateTime) -> usize {
        let window_seconds = self.window_seconds;
        let mut expired = 0;
        self.entries.retain(|_, entry| {
            Self::prune_queue(entry, window_seconds, now);
            let keep = !entry.is_empty();
            if !keep {
                expired += 1;
            }
            keep
        });
        expired
    }

    fn prune_queue(entry: &mut VecDeque<NaiveDateTime>, window_seconds: i64, now: NaiveDateTime) {
        while let Some(&front) = entry.front() {
            if now.signed_duration_since(front).num_seconds() > window_seconds {
                entry.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(seconds: i64) -> NaiveDateTime {
        NaiveDateTime::parse_from_str("2024-01-01 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap()
            + chrono::Duration::seconds(seconds)
    }

    #[test]
    fn counts_within_window_and_drops_stale_entries() {
        let mut cot = CountOverTime::new(300);
        for t in 0..5 {
            assert_eq!(cot.record("10.0.0.2", at(t * 2)), (t + 1) as usize);
        }
        assert_eq!(cot.count("10.0.0.2"), 5);
        // sixth attempt, still inside the 300s window
        assert_eq!(cot.record("10.0.0.2", at(8)), 6);
    }

    #[test]
    fn prunes_entries_older_than_window() {
        let mut cot = CountOverTime::new(60);
        cot.record("host", at(0));
        cot.record("host", at(30));
        assert_eq!(cot.count("host"), 2);
        cot.record("host", at(200));
        assert_eq!(cot.count("host"), 1);
    }

    #[test]
    fn clear_drops_all_occurrences_for_an_identifier() {
        let mut cot = CountOverTime::new(300);
        cot.record("10.0.0.2", at(0));
        cot.record("10.0.0.2", at(1));
        cot.clear("10.0.0.2");
        assert_eq!(cot.count("10.0.0.2"), 0);
    }

    #[test]
    fn expire_removes_identifiers_with_no_remaining_occurrences() {
        let mut cot = CountOverTime::new(60);
        cot.record("host-a", at(0));
        cot.record("host-b", at(1000));
        let expired = cot.expire(at(1000));
        assert_eq!(expired, 1);
        assert_eq!(cot.count("host-a"), 0);
        assert_eq!(cot.count("host-b"), 1);
    }
}
