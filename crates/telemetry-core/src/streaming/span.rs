// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::transaction::segment::Segment;
use crate::Attributes;

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";
const SPAN_ID_LENGTH: usize = 16;
const TRACE_ID_LENGTH: usize = 32;

pub(crate) fn random_hex(len: usize) -> String {
    (0..len)
        .map(|_| char::from(HEX_DIGITS[fastrand::usize(..HEX_DIGITS.len())]))
        .collect()
}

/// Random 64-bit identifier rendered as 16 hex characters.
pub fn generate_span_id() -> String {
    random_hex(SPAN_ID_LENGTH)
}

pub fn generate_trace_id() -> String {
    random_hex(TRACE_ID_LENGTH)
}

fn epoch_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// Identifiers shared by every span of one transaction.
#[derive(Debug, Clone, Copy)]
pub struct SpanContext<'a> {
    pub trace_id: &'a str,
    pub transaction_id: &'a str,
    pub transaction_name: &'a str,
}

/// One span as streamed to the remote collector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanRecord {
    pub trace_id: String,
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub transaction_id: String,
    pub name: String,
    /// Start in milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Duration in seconds.
    pub duration: f64,
    pub attributes: Attributes,
    #[serde(skip_serializing_if = "Attributes::is_empty")]
    pub custom_attributes: Attributes,
}

impl SpanRecord {
    fn new(
        context: SpanContext<'_>,
        span_id: String,
        parent_id: Option<String>,
        name: String,
        start: SystemTime,
        duration: Duration,
    ) -> Self {
        let mut attributes = Attributes::new();
        attributes.insert(
            "transaction.name".to_string(),
            Value::from(context.transaction_name),
        );
        Self {
            trace_id: context.trace_id.to_string(),
            span_id,
            parent_id,
            transaction_id: context.transaction_id.to_string(),
            name,
            timestamp: epoch_millis(start),
            duration: duration.as_secs_f64(),
            attributes,
            custom_attributes: Attributes::new(),
        }
    }

    /// Builds the span for a finished segment. Error attributes of the
    /// segment's noticed error are materialised here, at export time.
    pub fn from_segment(segment: &mut Segment, context: SpanContext<'_>) -> Self {
        let mut record = Self::new(
            context,
            segment.span_id.clone(),
            Some(segment.parent_span_id.clone()),
            segment.metric_name.clone(),
            segment.start_time,
            segment.duration,
        );
        record
            .attributes
            .insert("category".to_string(), Value::from("generic"));
        if let Some(error) = segment.noticed_error.as_mut() {
            error.build_error_attributes();
            record.attributes.extend(
                error
                    .attributes_from_notice_error()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
        }
        record
    }

    /// Builds the entry span representing a whole transaction.
    pub fn for_transaction(
        context: SpanContext<'_>,
        span_id: String,
        parent_id: Option<String>,
        start: SystemTime,
        duration: Duration,
        custom_attributes: &Attributes,
    ) -> Self {
        let mut record = Self::new(
            context,
            span_id,
            parent_id,
            context.transaction_name.to_string(),
            start,
            duration,
        );
        record
            .attributes
            .insert("nr.entryPoint".to_string(), Value::Bool(true));
        record.custom_attributes = custom_attributes.clone();
        record
    }
}

/// Unit of transmission on the span stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SpanBatch {
    pub spans: Vec<SpanRecord>,
}

impl SpanBatch {
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}
