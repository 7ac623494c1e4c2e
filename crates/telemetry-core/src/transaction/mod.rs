// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transactions: one logical unit of work (a request or a background job)
//! and the stack of segments nested inside it.
//!
//! There is no ambient "current transaction". Each execution context owns a
//! [`TransactionState`] and passes it to the instrumentation hooks. Stopping a
//! transaction returns a [`FinishedTransaction`] handle that callers may keep
//! around to attribute errors raised after the transaction ended.

pub mod request;
pub mod segment;

use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, warn};

use crate::error_collector::{CapturedError, ErrorCollector, NoticeOptions};
use crate::errors::StackError;
use crate::metrics::{names, MetricKey, StatsEngine, StatsHash, SCOPE_PLACEHOLDER};
use crate::streaming::span::{generate_span_id, generate_trace_id, random_hex, SpanContext, SpanRecord};
use crate::streaming::SpanStreamerSlot;
use crate::Attributes;

use request::{referer_from_request, uri_from_request, RequestInfo};
use segment::{Segment, SegmentFrame};

const GUID_LENGTH: usize = 16;

/// Finished segments kept per transaction for span export. Segments beyond
/// this still contribute metrics.
const MAX_SPAN_SEGMENTS: usize = 3_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum TransactionType {
    #[display("web")]
    Web,
    #[display("background")]
    Background,
}

/// Apdex satisfaction bucket of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum ApdexZone {
    #[display("S")]
    Satisfying,
    #[display("T")]
    Tolerating,
    #[display("F")]
    Frustrating,
}

pub fn apdex_bucket(duration: Duration, failed: bool, apdex_t: Duration) -> ApdexZone {
    if failed {
        ApdexZone::Frustrating
    } else if duration <= apdex_t {
        ApdexZone::Satisfying
    } else if duration <= apdex_t.saturating_mul(4) {
        ApdexZone::Tolerating
    } else {
        ApdexZone::Frustrating
    }
}

/// Per-transaction apdex metric: the transaction name with its first
/// segment replaced by `Apdex`. A name without a `/` is prefixed instead,
/// so the apdex stats never share a key with the transaction's own timing.
fn apdex_metric_name(transaction_name: &str) -> String {
    match transaction_name.split_once('/') {
        Some((_, rest)) => format!("{}/{rest}", names::APDEX),
        None => format!("{}/{transaction_name}", names::APDEX),
    }
}

/// Renames a transaction when its name is frozen. Returning `None` ignores
/// the transaction.
pub type NamingRule = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Shared destinations for everything a finished transaction produces.
#[derive(Clone)]
pub struct TransactionSinks {
    pub stats: Arc<StatsEngine>,
    pub errors: Arc<ErrorCollector>,
    pub spans: Option<Arc<SpanStreamerSlot>>,
    pub events: Option<mpsc::Sender<TransactionFinished>>,
    pub apdex_t: Duration,
    pub naming_rule: Option<NamingRule>,
}

impl std::fmt::Debug for TransactionSinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionSinks")
            .field("apdex_t", &self.apdex_t)
            .field("spans", &self.spans.is_some())
            .field("events", &self.events.is_some())
            .field("naming_rule", &self.naming_rule.is_some())
            .finish_non_exhaustive()
    }
}

impl TransactionSinks {
    pub fn new(stats: Arc<StatsEngine>, errors: Arc<ErrorCollector>, apdex_t: Duration) -> Self {
        Self {
            stats,
            errors,
            spans: None,
            events: None,
            apdex_t,
            naming_rule: None,
        }
    }

    #[must_use]
    pub fn with_spans(mut self, spans: Arc<SpanStreamerSlot>) -> Self {
        self.spans = Some(spans);
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: mpsc::Sender<TransactionFinished>) -> Self {
        self.events = Some(events);
        self
    }

    #[must_use]
    pub fn with_naming_rule<F>(mut self, rule: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.naming_rule = Some(Arc::new(rule));
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub name: Option<String>,
    pub start_time: Option<SystemTime>,
    /// When the request entered the system, if earlier than `start_time`
    /// (e.g. queue time at a front-end proxy).
    pub apdex_start: Option<SystemTime>,
    pub uri: Option<String>,
    pub referer: Option<String>,
    pub filtered_params: Attributes,
}

impl StartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn start_time(mut self, start_time: SystemTime) -> Self {
        self.start_time = Some(start_time);
        self
    }

    #[must_use]
    pub fn apdex_start(mut self, apdex_start: SystemTime) -> Self {
        self.apdex_start = Some(apdex_start);
        self
    }

    #[must_use]
    pub fn request(mut self, request: &dyn RequestInfo) -> Self {
        self.uri = uri_from_request(request);
        self.referer = referer_from_request(request);
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StopOptions {
    pub exception_encountered: bool,
    pub ignore_apdex: bool,
}

/// Emitted once per finished root transaction.
#[derive(Debug, Clone)]
pub struct TransactionFinished {
    pub name: String,
    pub transaction_type: TransactionType,
    pub guid: String,
    pub start_timestamp: SystemTime,
    pub duration: Duration,
    pub metrics: StatsHash,
    pub custom_attributes: Attributes,
}

/// Short-lived handle to a transaction that has already stopped.
#[derive(Debug, Clone)]
pub struct FinishedTransaction {
    pub name: String,
    pub transaction_type: TransactionType,
    pub guid: String,
    pub duration: Duration,
    pub custom_attributes: Attributes,
    pub ignored: bool,
}

#[derive(Debug)]
pub struct Transaction {
    name: String,
    transaction_type: TransactionType,
    start_time: SystemTime,
    apdex_start: SystemTime,
    guid: String,
    trace_id: String,
    root_span_id: String,
    parent_span_id: Option<String>,
    uri: Option<String>,
    referer: Option<String>,
    filtered_params: Attributes,
    segments: Vec<SegmentFrame>,
    finished_segments: Vec<Segment>,
    children_time: Duration,
    stats: StatsHash,
    exceptions: Vec<(CapturedError, NoticeOptions)>,
    custom_attributes: Attributes,
    name_frozen: bool,
    ignored: bool,
}

impl Transaction {
    fn new(
        transaction_type: TransactionType,
        options: StartOptions,
        trace_id: String,
        parent_span_id: Option<String>,
    ) -> Self {
        let start_time = options.start_time.unwrap_or_else(SystemTime::now);
        Self {
            name: options.name.unwrap_or_else(|| names::UNKNOWN.to_string()),
            transaction_type,
            start_time,
            apdex_start: options.apdex_start.unwrap_or(start_time),
            guid: random_hex(GUID_LENGTH),
            trace_id,
            root_span_id: generate_span_id(),
            parent_span_id,
            uri: options.uri,
            referer: options.referer,
            filtered_params: options.filtered_params,
            segments: Vec::new(),
            finished_segments: Vec::new(),
            children_time: Duration::ZERO,
            stats: StatsHash::new(),
            exceptions: Vec::new(),
            custom_attributes: Attributes::new(),
            name_frozen: false,
            ignored: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transaction_type(&self) -> TransactionType {
        self.transaction_type
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn referer(&self) -> Option<&str> {
        self.referer.as_deref()
    }

    pub fn name_frozen(&self) -> bool {
        self.name_frozen
    }

    pub fn ignored(&self) -> bool {
        self.ignored
    }

    /// Renames the transaction. Returns `false`, leaving the name untouched,
    /// once the name has been frozen.
    pub fn set_name(&mut self, name: impl Into<String>) -> bool {
        let name = name.into();
        if self.name_frozen {
            warn!(
                "Attempted to rename transaction to '{}' after transaction name was already frozen as '{}'",
                name, self.name
            );
            return false;
        }
        self.name = name;
        true
    }

    /// Freezes the name, applying the naming rule on the first call only.
    pub fn freeze_name(&mut self, rule: Option<&NamingRule>) {
        if self.name_frozen {
            return;
        }
        self.name_frozen = true;
        let Some(rule) = rule else {
            return;
        };
        match rule(&self.name) {
            Some(name) => self.name = name,
            None => {
                debug!("Transaction {} ignored by naming rule", self.name);
                self.ignored = true;
            }
        }
    }

    pub fn custom_attributes(&self) -> &Attributes {
        &self.custom_attributes
    }

    pub fn add_custom_attributes<I, K>(&mut self, attributes: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.custom_attributes
            .extend(attributes.into_iter().map(|(k, v)| (k.into(), v)));
    }

    /// Records a custom metric against this transaction.
    pub fn record_metric(&mut self, name: &str, duration: Duration) {
        self.stats.record(MetricKey::unscoped(name), duration);
    }

    pub fn stats(&self) -> &StatsHash {
        &self.stats
    }

    pub fn segment_depth(&self) -> usize {
        self.segments.len()
    }

    pub fn current_segment_mut(&mut self) -> Option<&mut SegmentFrame> {
        self.segments.last_mut()
    }

    pub fn finished_segments(&self) -> &[Segment] {
        &self.finished_segments
    }

    fn current_span_id(&self) -> &str {
        self.segments
            .last()
            .map_or(self.root_span_id.as_str(), SegmentFrame::span_id)
    }

    /// Queues an error to be reported when the transaction stops, capturing
    /// request details and custom attributes as they are now. The
    /// transaction's request details replace any given in `options`. Returns `false`
    /// if this error instance was already noticed.
    pub fn notice_error(&mut self, error: &CapturedError, mut options: NoticeOptions) -> bool {
        if self.exceptions.iter().any(|(seen, _)| seen.id() == error.id()) {
            return false;
        }
        options.uri.clone_from(&self.uri);
        options.referer.clone_from(&self.referer);
        options.request_params.clone_from(&self.filtered_params);
        for (key, value) in &self.custom_attributes {
            options
                .custom_params
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self.exceptions.push((error.clone(), options));
        true
    }

    pub fn push_segment(&mut self, name: impl Into<String>, start_time: SystemTime) {
        let parent = self.current_span_id().to_string();
        self.segments
            .push(SegmentFrame::new(name, start_time, parent));
    }

    pub fn pop_segment(&mut self, end_time: SystemTime) -> Result<(), StackError> {
        let Some(frame) = self.segments.pop() else {
            return Err(StackError::SegmentUnderflow(self.name.clone()));
        };
        let segment = frame.finish(end_time, self.start_time);
        match self.segments.last_mut() {
            Some(parent) => parent.add_child_time(segment.duration),
            None => self.children_time += segment.duration,
        }

        let (total, exclusive) = (segment.duration, segment.exclusive_duration);
        self.stats.record_with_exclusive(
            MetricKey::unscoped(&segment.metric_name),
            total,
            exclusive,
        );
        self.stats.record_with_exclusive(
            MetricKey::scoped(&segment.metric_name, SCOPE_PLACEHOLDER),
            total,
            exclusive,
        );
        if self.finished_segments.len() < MAX_SPAN_SEGMENTS {
            self.finished_segments.push(segment);
        }
        Ok(())
    }

    fn record_transaction_metrics(
        &mut self,
        end_time: SystemTime,
        is_root: bool,
        options: StopOptions,
        recorded_unexpected_error: bool,
        apdex_t: Duration,
    ) -> Duration {
        let duration = end_time.duration_since(self.start_time).unwrap_or_default();
        let exclusive = duration.saturating_sub(self.children_time);
        self.stats
            .record_with_exclusive(MetricKey::unscoped(&self.name), duration, exclusive);
        self.stats.record_with_exclusive(
            MetricKey::scoped(&self.name, SCOPE_PLACEHOLDER),
            duration,
            exclusive,
        );
        if !is_root {
            return duration;
        }

        let summary: &[&str] = match self.transaction_type {
            TransactionType::Web => &[names::HTTP_DISPATCHER, names::WEB_TRANSACTION],
            TransactionType::Background => {
                &[names::OTHER_TRANSACTION_ALL, names::OTHER_TRANSACTION]
            }
        };
        for name in summary {
            self.stats.record(MetricKey::unscoped(name), duration);
        }
        if let Ok(queue_time) = self.start_time.duration_since(self.apdex_start) {
            if !queue_time.is_zero() {
                self.stats
                    .record(MetricKey::unscoped(names::QUEUE_TIME), queue_time);
            }
        }

        if self.transaction_type == TransactionType::Web && !options.ignore_apdex {
            let failed = options.exception_encountered || recorded_unexpected_error;
            let total = end_time.duration_since(self.apdex_start).unwrap_or_default();
            let global_zone = apdex_bucket(total, failed, apdex_t);
            let transaction_zone = apdex_bucket(duration, failed, apdex_t);
            self.stats.record_with(MetricKey::unscoped(names::APDEX), |stats| {
                stats.record_apdex(global_zone, apdex_t);
            });
            self.stats
                .record_with(MetricKey::unscoped(&apdex_metric_name(&self.name)), |stats| {
                    stats.record_apdex(transaction_zone, apdex_t);
                });
        }
        duration
    }

    fn finished(&self, duration: Duration) -> FinishedTransaction {
        FinishedTransaction {
            name: self.name.clone(),
            transaction_type: self.transaction_type,
            guid: self.guid.clone(),
            duration,
            custom_attributes: self.custom_attributes.clone(),
            ignored: self.ignored,
        }
    }

    fn span_records(&mut self, duration: Duration) -> Vec<SpanRecord> {
        let mut segments = std::mem::take(&mut self.finished_segments);
        let context = SpanContext {
            trace_id: &self.trace_id,
            transaction_id: &self.guid,
            transaction_name: &self.name,
        };
        let mut records = Vec::with_capacity(segments.len() + 1);
        records.push(SpanRecord::for_transaction(
            context,
            self.root_span_id.clone(),
            self.parent_span_id.clone(),
            self.start_time,
            duration,
            &self.custom_attributes,
        ));
        records.extend(
            segments
                .iter_mut()
                .map(|segment| SpanRecord::from_segment(segment, context)),
        );
        records
    }
}

/// The transaction stack of one execution context.
#[derive(Debug)]
pub struct TransactionState {
    sinks: TransactionSinks,
    stack: Vec<Transaction>,
}

impl TransactionState {
    pub fn new(sinks: TransactionSinks) -> Self {
        Self {
            sinks,
            stack: Vec::new(),
        }
    }

    pub fn sinks(&self) -> &TransactionSinks {
        &self.sinks
    }

    pub fn current(&self) -> Option<&Transaction> {
        self.stack.last()
    }

    pub fn current_mut(&mut self) -> Option<&mut Transaction> {
        self.stack.last_mut()
    }

    pub fn in_transaction(&self) -> bool {
        !self.stack.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Starts a transaction on top of this context's stack. A nested
    /// transaction joins the trace of the one enclosing it.
    pub fn start(&mut self, transaction_type: TransactionType, options: StartOptions) -> &mut Transaction {
        let (trace_id, parent_span_id) = match self.stack.last() {
            Some(parent) => (
                parent.trace_id.clone(),
                Some(parent.current_span_id().to_string()),
            ),
            None => (generate_trace_id(), None),
        };
        let transaction = Transaction::new(transaction_type, options, trace_id, parent_span_id);
        debug!(
            guid = transaction.guid.as_str(),
            "Started {} transaction {}", transaction.transaction_type, transaction.name
        );
        self.stack.push(transaction);
        let last = self.stack.len() - 1;
        &mut self.stack[last]
    }

    pub fn push_segment(&mut self, name: impl Into<String>, start_time: SystemTime) -> Result<(), StackError> {
        let Some(transaction) = self.stack.last_mut() else {
            return Err(StackError::NoTransaction);
        };
        transaction.push_segment(name, start_time);
        Ok(())
    }

    /// Closes the innermost open segment. Popping past the bottom of the
    /// segment stack is logged and reported as an underflow.
    pub fn pop_segment(&mut self, end_time: SystemTime) -> Result<(), StackError> {
        let Some(transaction) = self.stack.last_mut() else {
            error!("Segment finished outside of any transaction");
            return Err(StackError::NoTransaction);
        };
        transaction.pop_segment(end_time).inspect_err(|err| {
            error!("{err}");
        })
    }

    pub fn add_custom_attributes<I, K>(&mut self, attributes: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        if let Some(transaction) = self.stack.last_mut() {
            transaction.add_custom_attributes(attributes);
        }
    }

    /// Reports an error. Inside a transaction the error is deferred until the
    /// transaction stops and is also attached to the current segment.
    /// Outside one it goes straight to the collector, blamed on `recent` if
    /// given.
    pub fn notice_error(
        &mut self,
        error: &CapturedError,
        options: NoticeOptions,
        recent: Option<&FinishedTransaction>,
    ) {
        let Some(transaction) = self.stack.last_mut() else {
            let mut options = options;
            if let Some(finished) = recent {
                for (key, value) in &finished.custom_attributes {
                    options
                        .custom_params
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
                options.metric = Some(finished.name.clone());
            }
            self.sinks.errors.notice_error(Some(error), options);
            return;
        };

        if !transaction.notice_error(error, options.clone()) {
            return;
        }
        if let Some(segment) = transaction.segments.last_mut() {
            self.sinks.errors.notice_segment_error(segment, error, options);
        }
    }

    /// Stops the innermost transaction and reports everything it recorded.
    ///
    /// Segments still open are closed at `end_time` and the transaction is
    /// logged as malformed. Only the root transaction records summary and
    /// apdex metrics and emits a [`TransactionFinished`] event.
    pub fn stop(&mut self, end_time: SystemTime, options: StopOptions) -> Result<FinishedTransaction, StackError> {
        let Some(mut transaction) = self.stack.pop() else {
            error!("Underflow in transaction stack");
            return Err(StackError::TransactionUnderflow);
        };
        let is_root = self.stack.is_empty();

        transaction.freeze_name(self.sinks.naming_rule.as_ref());
        if !transaction.segments.is_empty() {
            warn!(
                "Transaction {} stopped with {} open segments",
                transaction.name,
                transaction.segments.len()
            );
            while transaction.pop_segment(end_time).is_ok() {}
        }

        if transaction.ignored {
            let duration = end_time
                .duration_since(transaction.start_time)
                .unwrap_or_default();
            return Ok(transaction.finished(duration));
        }

        let recorded_unexpected_error = self.record_exceptions(&mut transaction);
        let duration = transaction.record_transaction_metrics(
            end_time,
            is_root,
            options,
            recorded_unexpected_error,
            self.sinks.apdex_t,
        );

        let name = transaction.name.clone();
        transaction.stats.resolve_scopes(&name);
        self.sinks.stats.merge(&transaction.stats);

        if let Some(spans) = &self.sinks.spans {
            for record in transaction.span_records(duration) {
                spans.enqueue(record);
            }
        }

        let finished = transaction.finished(duration);
        if is_root {
            self.send_transaction_finished_event(transaction, duration);
        }
        Ok(finished)
    }

    /// Hands deferred errors to the collector. Returns whether any
    /// unexpected error was actually recorded.
    fn record_exceptions(&self, transaction: &mut Transaction) -> bool {
        let mut recorded_unexpected = false;
        for (error, mut options) in transaction.exceptions.drain(..) {
            options.metric = Some(transaction.name.clone());
            let expected = options.expected;
            let options = options
                .in_transaction(transaction.transaction_type)
                .intrinsic("guid", transaction.guid.as_str())
                .intrinsic("traceId", transaction.trace_id.as_str());
            if self.sinks.errors.notice_error(Some(&error), options) && !expected {
                recorded_unexpected = true;
            }
        }
        recorded_unexpected
    }

    fn send_transaction_finished_event(&self, transaction: Transaction, duration: Duration) {
        let Some(events) = &self.sinks.events else {
            return;
        };
        let event = TransactionFinished {
            name: transaction.name,
            transaction_type: transaction.transaction_type,
            guid: transaction.guid,
            start_timestamp: transaction.start_time,
            duration,
            metrics: transaction.stats,
            custom_attributes: transaction.custom_attributes,
        };
        match events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                debug!("Dropping finished event for transaction {}, receiver is full", event.name);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}
