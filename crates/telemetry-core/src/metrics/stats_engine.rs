// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::metrics::stats::{MetricKey, MetricStats};
use crate::metrics::stats_hash::StatsHash;

/// Process-wide merge target for metric statistics.
///
/// Every mutation takes the lock for the duration of a single record or
/// merge, so a harvest observes either all of a transaction's metrics or none
/// of them. `harvest_and_reset` swaps the live hash for an empty one while
/// holding the same lock.
#[derive(Debug, Default)]
pub struct StatsEngine {
    live: Mutex<StatsHash>,
}

impl StatsEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self) -> MutexGuard<'_, StatsHash> {
        // Poisoning only means another recorder panicked; the hash is still usable.
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, key: MetricKey, duration: Duration) {
        self.live().record(key, duration);
    }

    pub fn increment_count(&self, key: MetricKey) {
        self.live().increment_count(key);
    }

    /// Adds `count` calls to an unscoped metric, used by supportability
    /// counters.
    pub fn increment_by(&self, name: &str, count: u64) {
        if count == 0 {
            return;
        }
        self.live()
            .record_with(MetricKey::unscoped(name), |stats| stats.increment_count(count));
    }

    pub fn record_with<F>(&self, key: MetricKey, update: F)
    where
        F: FnOnce(&mut MetricStats),
    {
        self.live().record_with(key, update);
    }

    /// Folds a finished transaction's hash into the live hash in one step.
    pub fn merge(&self, stats: &StatsHash) {
        if stats.is_empty() {
            return;
        }
        self.live().merge(stats);
    }

    /// Returns everything recorded since the previous harvest and starts a
    /// fresh window.
    pub fn harvest_and_reset(&self) -> StatsHash {
        let harvested = std::mem::take(&mut *self.live());
        debug!("Harvested {} metrics", harvested.len());
        harvested
    }

    pub fn reset(&self) {
        let _ = self.harvest_and_reset();
    }

    /// Snapshot of the stats currently stored under `key`.
    pub fn get(&self, key: &MetricKey) -> Option<MetricStats> {
        self.live().get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_harvest_resets_live_hash() {
        let engine = StatsEngine::new();
        let key = MetricKey::unscoped("WebTransaction");
        engine.record(key, Duration::from_millis(20));

        let first = engine.harvest_and_reset();
        assert_eq!(first.get(&key).map(|s| s.call_count), Some(1));
        assert!(engine.is_empty());

        let second = engine.harvest_and_reset();
        assert!(second.is_empty());
    }

    #[test]
    fn test_merge_folds_transaction_hash() {
        let engine = StatsEngine::new();
        let key = MetricKey::unscoped("Datastore/all");
        engine.record(key, Duration::from_millis(1));

        let mut txn_hash = StatsHash::new();
        txn_hash.record(key, Duration::from_millis(2));
        txn_hash.record(MetricKey::unscoped("External/all"), Duration::from_millis(3));
        engine.merge(&txn_hash);

        assert_eq!(engine.get(&key).map(|s| s.call_count), Some(2));
        assert_eq!(engine.len(), 2);
    }

    #[test]
    fn test_increment_by_zero_is_noop() {
        let engine = StatsEngine::new();
        engine.increment_by("Supportability/Test", 0);
        assert!(engine.is_empty());
        engine.increment_by("Supportability/Test", 3);
        assert_eq!(
            engine
                .get(&MetricKey::unscoped("Supportability/Test"))
                .map(|s| s.call_count),
            Some(3)
        );
    }

    #[test]
    fn test_concurrent_records_land_in_exactly_one_harvest() {
        let engine = Arc::new(StatsEngine::new());
        let key = MetricKey::unscoped("Custom/concurrent");
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    for _ in 0..250 {
                        let mut txn = StatsHash::new();
                        txn.record(key, Duration::from_micros(10));
                        engine.merge(&txn);
                    }
                })
            })
            .collect();

        let harvester = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let mut total = 0;
                for _ in 0..20 {
                    let harvested = engine.harvest_and_reset();
                    total += harvested.get(&key).map_or(0, |s| s.call_count);
                    thread::yield_now();
                }
                total
            })
        };

        for writer in writers {
            writer.join().expect("writer thread panicked");
        }
        let harvested = harvester.join().expect("harvester thread panicked");
        let remainder = engine
            .harvest_and_reset()
            .get(&key)
            .map_or(0, |s| s.call_count);

        assert_eq!(harvested + remainder, 1000);
    }
}
