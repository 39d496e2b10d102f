//! Per-endpoint request statistics.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default cap on tracked endpoints. Past it, the least-recently-accessed
/// record is evicted; the extension outlives any single page session and
/// the map must not grow for its whole lifetime.
pub const DEFAULT_MAX_TRACKED_ENDPOINTS: usize = 512;

/// Aggregate record for one request URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointRecord {
    pub count: u64,
    pub last_accessed: DateTime<Utc>,
    /// Per-target hit counts, keyed by target URL.
    pub targets: HashMap<String, u64>,
}

/// URL-keyed statistics map, bounded by LRU eviction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestStats {
    entries: HashMap<String, EndpointRecord>,
    #[serde(skip, default = "default_capacity")]
    capacity: usize,
}

fn default_capacity() -> usize {
    DEFAULT_MAX_TRACKED_ENDPOINTS
}

impl RequestStats {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Rebuild from a persisted snapshot, trimming to capacity if the
    /// stored map was written under a larger bound.
    pub fn from_entries(entries: HashMap<String, EndpointRecord>, capacity: usize) -> Self {
        let mut stats = Self {
            entries,
            capacity: capacity.max(1),
        };
        while stats.entries.len() > stats.capacity {
            stats.evict_oldest();
        }
        stats
    }

    /// Record one intercepted request from `url` routed to `target_url`.
    pub fn record(&mut self, url: &str, target_url: &str, now: DateTime<Utc>) {
        if !self.entries.contains_key(url) && self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        let record = self.entries.entry(url.to_string()).or_insert_with(|| EndpointRecord {
            count: 0,
            last_accessed: now,
            targets: HashMap::new(),
        });
        record.count += 1;
        record.last_accessed = now;
        *record.targets.entry(target_url.to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, url: &str) -> Option<&EndpointRecord> {
        self.entries.get(url)
    }

    pub fn entries(&self) -> &HashMap<String, EndpointRecord> {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, record)| record.last_accessed)
            .map(|(url, _)| url.clone());
        if let Some(url) = oldest {
            self.entries.remove(&url);
        }
    }
}

impl Default for RequestStats {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TRACKED_ENDPOINTS)
    }
}
