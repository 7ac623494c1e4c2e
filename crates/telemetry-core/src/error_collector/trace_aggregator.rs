// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::error_collector::noticed_error::NoticedError;

pub const DEFAULT_MAX_ERROR_TRACES: usize = 20;

#[derive(Debug, Default)]
struct TraceBuffer {
    errors: Vec<NoticedError>,
    dropped: usize,
}

/// Bounded buffer of error traces awaiting harvest.
///
/// Errors are kept in arrival order. Once the buffer is full, further errors
/// are dropped until the next harvest.
#[derive(Debug)]
pub struct ErrorTraceAggregator {
    buffer: Mutex<TraceBuffer>,
    capacity: usize,
}

impl Default for ErrorTraceAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ERROR_TRACES)
    }
}

impl ErrorTraceAggregator {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(TraceBuffer::default()),
            capacity,
        }
    }

    fn buffer(&self) -> MutexGuard<'_, TraceBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues an error trace. Returns `false` when the buffer is full.
    pub fn add(&self, error: NoticedError) -> bool {
        let mut buffer = self.buffer();
        if buffer.errors.len() >= self.capacity {
            if buffer.dropped == 0 {
                warn!(
                    "Error trace buffer is full ({} traces), dropping errors until next harvest",
                    self.capacity
                );
            }
            buffer.dropped += 1;
            return false;
        }
        buffer.errors.push(error);
        true
    }

    /// Drains the buffer. No error is ever returned by two harvests.
    pub fn harvest(&self) -> Vec<NoticedError> {
        let mut buffer = self.buffer();
        if buffer.dropped > 0 {
            debug!("Dropped {} error traces since last harvest", buffer.dropped);
        }
        let harvested = std::mem::take(&mut *buffer);
        harvested.errors
    }

    /// Re-queues traces from a failed transmission, up to capacity.
    pub fn merge(&self, errors: Vec<NoticedError>) {
        let mut buffer = self.buffer();
        let room = self.capacity.saturating_sub(buffer.errors.len());
        let overflow = errors.len().saturating_sub(room);
        buffer.errors.extend(errors.into_iter().take(room));
        buffer.dropped += overflow;
    }

    pub fn reset(&self) {
        let _ = self.harvest();
    }

    pub fn len(&self) -> usize {
        self.buffer().errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
