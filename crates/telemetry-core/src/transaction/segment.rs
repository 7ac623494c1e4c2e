// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, SystemTime};

use crate::error_collector::NoticedError;
use crate::streaming::span::generate_span_id;

/// A segment that is still open on a transaction's segment stack.
#[derive(Debug, Clone)]
pub struct SegmentFrame {
    name: String,
    start_time: SystemTime,
    span_id: String,
    parent_span_id: String,
    children_time: Duration,
    noticed_error: Option<NoticedError>,
}

impl SegmentFrame {
    pub fn new(name: impl Into<String>, start_time: SystemTime, parent_span_id: String) -> Self {
        Self {
            name: name.into(),
            start_time,
            span_id: generate_span_id(),
            parent_span_id,
            children_time: Duration::ZERO,
            noticed_error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    /// Attaches an error to the segment. A later error replaces an earlier
    /// one; a segment carries at most one.
    pub fn set_noticed_error(&mut self, error: NoticedError) {
        self.noticed_error = Some(error);
    }

    pub fn noticed_error_mut(&mut self) -> Option<&mut NoticedError> {
        self.noticed_error.as_mut()
    }

    /// Charges a finished child's duration against this segment's exclusive
    /// time.
    pub(crate) fn add_child_time(&mut self, duration: Duration) {
        self.children_time += duration;
    }

    /// Closes the segment. Offsets are relative to `transaction_start`.
    pub(crate) fn finish(self, end_time: SystemTime, transaction_start: SystemTime) -> Segment {
        let duration = end_time
            .duration_since(self.start_time)
            .unwrap_or_default();
        let start_offset = self
            .start_time
            .duration_since(transaction_start)
            .unwrap_or_default();
        Segment {
            metric_name: self.name,
            span_id: self.span_id,
            parent_span_id: self.parent_span_id,
            start_time: self.start_time,
            start_offset,
            duration,
            exclusive_duration: duration.saturating_sub(self.children_time),
            noticed_error: self.noticed_error,
        }
    }
}

/// A finished segment.
#[derive(Debug, Clone)]
pub struct Segment {
    pub metric_name: String,
    pub span_id: String,
    pub parent_span_id: String,
    pub start_time: SystemTime,
    pub start_offset: Duration,
    pub duration: Duration,
    /// Duration not covered by nested segments.
    pub exclusive_duration: Duration,
    pub noticed_error: Option<NoticedError>,
}
