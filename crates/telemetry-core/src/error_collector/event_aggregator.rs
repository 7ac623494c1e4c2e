// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error_collector::noticed_error::{ErrorEvent, NoticedError};

pub const DEFAULT_MAX_ERROR_EVENTS: usize = 100;

/// Describes the reservoir a harvested batch came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ReservoirMetadata {
    pub reservoir_size: usize,
    pub events_seen: usize,
}

#[derive(Debug, Default)]
struct Reservoir {
    events: Vec<ErrorEvent>,
    seen: usize,
}

impl Reservoir {
    /// Algorithm R: once full, the n-th event replaces a uniformly chosen slot
    /// with probability `capacity / n`.
    fn append(&mut self, event: ErrorEvent, capacity: usize) {
        self.seen += 1;
        if self.events.len() < capacity {
            self.events.push(event);
            return;
        }
        let slot = fastrand::usize(0..self.seen);
        if slot < capacity {
            self.events[slot] = event;
        }
    }
}

/// Uniform reservoir of error events awaiting harvest.
#[derive(Debug)]
pub struct ErrorEventAggregator {
    reservoir: Mutex<Reservoir>,
    capacity: usize,
    enabled: AtomicBool,
}

impl Default for ErrorEventAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ERROR_EVENTS, true)
    }
}

impl ErrorEventAggregator {
    pub fn new(capacity: usize, enabled: bool) -> Self {
        Self {
            reservoir: Mutex::new(Reservoir::default()),
            capacity,
            enabled: AtomicBool::new(enabled),
        }
    }

    fn reservoir(&self) -> MutexGuard<'_, Reservoir> {
        self.reservoir.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn record(&self, error: &NoticedError) {
        if !self.enabled() || self.capacity == 0 {
            return;
        }
        let event = error.to_event();
        self.reservoir().append(event, self.capacity);
    }

    /// Drains the reservoir, returning its metadata alongside the sampled
    /// events.
    pub fn harvest(&self) -> (ReservoirMetadata, Vec<ErrorEvent>) {
        let drained = std::mem::take(&mut *self.reservoir());
        (
            ReservoirMetadata {
                reservoir_size: self.capacity,
                events_seen: drained.seen,
            },
            drained.events,
        )
    }

    pub fn reset(&self) {
        let _ = self.harvest();
    }

    pub fn len(&self) -> usize {
        self.reservoir().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
