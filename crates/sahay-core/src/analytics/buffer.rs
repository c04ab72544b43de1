//! In-memory aggregation buffer.
//!
//! Events collapse into counts keyed by
//! `event_type|category|time_bucket|geo_cell|age_bucket|gender`. The buffer
//! is the only shared mutable in-memory state in the system and is always
//! accessed under its mutex; a flush drains entries under the lock and
//! performs the database upserts after releasing it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// Flush once the buffer holds this many distinct keys.
pub const FLUSH_THRESHOLD: usize = 100;

/// The aggregation key: six de-identified dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggKey {
    pub event_type: String,
    pub category: String,
    /// 15-minute bucket in canonical RFC 3339 form.
    pub time_bucket: String,
    pub geo_cell: String,
    pub age_bucket: String,
    pub gender: String,
}

impl std::fmt::Display for AggKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}|{}",
            self.event_type,
            self.category,
            self.time_bucket,
            self.geo_cell,
            self.age_bucket,
            self.gender
        )
    }
}

/// Accumulated state for one key.
#[derive(Debug, Clone, Copy)]
pub struct BufferedEntry {
    /// Events collapsed into this key since the last flush.
    pub count: i64,
    /// First time the key was seen since the last flush.
    pub first_seen: DateTime<Utc>,
}

/// The buffer itself. Callers hold the surrounding mutex.
#[derive(Debug, Default)]
pub struct AggregationBuffer {
    entries: HashMap<AggKey, BufferedEntry>,
}

impl AggregationBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one event; returns the number of distinct keys now held.
    pub fn add(&mut self, key: AggKey, count: i64, now: DateTime<Utc>) -> usize {
        let entry = self.entries.entry(key).or_insert(BufferedEntry {
            count: 0,
            first_seen: now,
        });
        entry.count += count;
        self.entries.len()
    }

    /// Number of distinct keys held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Takes every entry, leaving the buffer empty.
    pub fn drain(&mut self) -> Vec<(AggKey, BufferedEntry)> {
        self.entries.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(event_type: &str, geo: &str) -> AggKey {
        AggKey {
            event_type: event_type.into(),
            category: "phc".into(),
            time_bucket: "2026-01-28T10:00:00.000000Z".into(),
            geo_cell: geo.into(),
            age_bucket: "19-35".into(),
            gender: "F".into(),
        }
    }

    #[test]
    fn same_key_collapses() {
        let mut buffer = AggregationBuffer::new();
        let now = Utc::now();
        assert_eq!(buffer.add(key("triage_completed", "pincode_110xxx"), 1, now), 1);
        assert_eq!(buffer.add(key("triage_completed", "pincode_110xxx"), 1, now), 1);
        assert_eq!(buffer.add(key("triage_completed", "pincode_226xxx"), 1, now), 2);

        let drained = buffer.drain();
        assert!(buffer.is_empty());
        let total: i64 = drained.iter().map(|(_, e)| e.count).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn first_seen_sticks_to_first_add() {
        let mut buffer = AggregationBuffer::new();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::minutes(5);
        buffer.add(key("triage_completed", "g"), 1, t0);
        buffer.add(key("triage_completed", "g"), 1, t1);
        let drained = buffer.drain();
        assert_eq!(drained[0].1.first_seen, t0);
    }

    #[test]
    fn display_uses_pipe_separated_dimensions() {
        let k = key("triage_completed", "pincode_110xxx");
        assert_eq!(
            k.to_string(),
            "triage_completed|phc|2026-01-28T10:00:00.000000Z|pincode_110xxx|19-35|F"
        );
    }
}
