// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use hashbrown::HashMap;
use std::time::{Duration, SystemTime};

use crate::metrics::stats::{MetricKey, MetricStats};

/// Keyed accumulator of metric statistics.
///
/// Recording the same key twice merges into the existing entry. A hash is
/// owned by one transaction while it runs and is folded into the
/// [`StatsEngine`](crate::metrics::StatsEngine) when the transaction stops.
#[derive(Debug, Clone)]
pub struct StatsHash {
    stats: HashMap<MetricKey, MetricStats>,
    started_at: SystemTime,
}

impl Default for StatsHash {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsHash {
    pub fn new() -> Self {
        Self {
            stats: HashMap::new(),
            started_at: SystemTime::now(),
        }
    }

    /// Time at which this hash started accumulating, i.e. the beginning of the
    /// harvest window it covers.
    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn record(&mut self, key: MetricKey, duration: Duration) {
        self.stats.entry(key).or_default().record(duration);
    }

    pub fn record_with_exclusive(&mut self, key: MetricKey, total: Duration, exclusive: Duration) {
        self.stats
            .entry(key)
            .or_default()
            .record_with_exclusive(total, exclusive);
    }

    pub fn increment_count(&mut self, key: MetricKey) {
        self.stats.entry(key).or_default().increment_count(1);
    }

    /// Applies an arbitrary update to the stats stored under `key`.
    pub fn record_with<F>(&mut self, key: MetricKey, update: F)
    where
        F: FnOnce(&mut MetricStats),
    {
        update(self.stats.entry(key).or_default());
    }

    pub fn get(&self, key: &MetricKey) -> Option<&MetricStats> {
        self.stats.get(key)
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MetricKey, &MetricStats)> {
        self.stats.iter()
    }

    /// Merges every entry of `other` into this hash. `other` is left intact.
    pub fn merge(&mut self, other: &StatsHash) {
        for (key, stats) in &other.stats {
            self.stats.entry(*key).or_default().merge(stats);
        }
        if other.started_at < self.started_at {
            self.started_at = other.started_at;
        }
    }

    /// Rewrites every metric recorded under the transaction scope placeholder
    /// so it is scoped to `scope` instead.
    pub fn resolve_scopes(&mut self, scope: &str) {
        if !self.stats.keys().any(MetricKey::has_placeholder_scope) {
            return;
        }
        let placeholders: Vec<MetricKey> = self
            .stats
            .keys()
            .filter(|key| key.has_placeholder_scope())
            .copied()
            .collect();
        for key in placeholders {
            if let Some(stats) = self.stats.remove(&key) {
                self.stats
                    .entry(MetricKey::scoped(&key.name, scope))
                    .or_default()
                    .merge(&stats);
            }
        }
    }
}

impl<'a> IntoIterator for &'a StatsHash {
    type Item = (&'a MetricKey, &'a MetricStats);
    type IntoIter = hashbrown::hash_map::Iter<'a, MetricKey, MetricStats>;

    fn into_iter(self) -> Self::IntoIter {
        self.stats.iter()
    }
}
