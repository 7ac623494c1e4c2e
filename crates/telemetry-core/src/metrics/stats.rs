// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::time::Duration;
use ustr::{ustr, Ustr};

use crate::transaction::ApdexZone;

/// Scope assigned to segment metrics while the owning transaction is still
/// running. Replaced by the frozen transaction name when the hash is merged.
pub const SCOPE_PLACEHOLDER: &str = "__transaction_scope__";

/// Identifies a metric by name and scope. An empty scope marks an unscoped
/// (rollup) metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetricKey {
    pub name: Ustr,
    pub scope: Ustr,
}

impl MetricKey {
    pub fn unscoped(name: &str) -> Self {
        Self {
            name: ustr(name),
            scope: ustr(""),
        }
    }

    pub fn scoped(name: &str, scope: &str) -> Self {
        Self {
            name: ustr(name),
            scope: ustr(scope),
        }
    }

    pub fn is_scoped(&self) -> bool {
        !self.scope.is_empty()
    }

    pub(crate) fn has_placeholder_scope(&self) -> bool {
        self.scope.as_str() == SCOPE_PLACEHOLDER
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_scoped() {
            write!(f, "{} ({})", self.name, self.scope)
        } else {
            write!(f, "{}", self.name)
        }
    }
}

/// Accumulated timing statistics for a single metric.
///
/// Times are stored as seconds. Apdex metrics reuse the same slots:
/// `call_count` counts satisfying observations, `total_time` tolerating and
/// `exclusive_time` frustrating ones, with the threshold in `min_time` and
/// `max_time`.
#[derive(Debug, Clone, Copy, PartialEq, Default, serde::Serialize)]
pub struct MetricStats {
    pub call_count: u64,
    pub total_time: f64,
    pub exclusive_time: f64,
    pub min_time: f64,
    pub max_time: f64,
    pub sum_of_squares: f64,
}

impl MetricStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one observation where the exclusive time equals the total.
    pub fn record(&mut self, duration: Duration) {
        self.record_with_exclusive(duration, duration);
    }

    pub fn record_with_exclusive(&mut self, total: Duration, exclusive: Duration) {
        let total = total.as_secs_f64();
        let exclusive = exclusive.as_secs_f64();
        if self.call_count == 0 {
            self.min_time = total;
            self.max_time = total;
        } else {
            self.min_time = self.min_time.min(total);
            self.max_time = self.max_time.max(total);
        }
        self.call_count += 1;
        self.total_time += total;
        self.exclusive_time += exclusive;
        self.sum_of_squares += total * total;
    }

    /// Bumps the call count without contributing any time.
    pub fn increment_count(&mut self, count: u64) {
        self.call_count += count;
    }

    pub fn record_apdex(&mut self, zone: ApdexZone, apdex_t: Duration) {
        match zone {
            ApdexZone::Satisfying => self.call_count += 1,
            ApdexZone::Tolerating => self.total_time += 1.0,
            ApdexZone::Frustrating => self.exclusive_time += 1.0,
        }
        self.min_time = apdex_t.as_secs_f64();
        self.max_time = apdex_t.as_secs_f64();
    }

    pub fn is_empty(&self) -> bool {
        self.call_count == 0 && self.total_time == 0.0 && self.exclusive_time == 0.0
    }

    /// Folds `other` into `self`. Counts and times are summed, min/max are
    /// taken across both sides. Empty stats never contribute a min of zero.
    pub fn merge(&mut self, other: &MetricStats) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = *other;
            return;
        }
        self.min_time = self.min_time.min(other.min_time);
        self.max_time = self.max_time.max(other.max_time);
        self.call_count += other.call_count;
        self.total_time += other.total_time;
        self.exclusive_time += other.exclusive_time;
        self.sum_of_squares += other.sum_of_squares;
    }
}
