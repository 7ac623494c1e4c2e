// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error collection: filtering, classification, counting and the two bounded
//! stores (traces and events) drained at harvest time.
//!
//! Every captured error runs through the same pipeline; the first matching
//! rule wins:
//!
//! 1. collector disabled
//! 2. no error given
//! 3. error class or status code ignored by configuration
//! 4. error instance already recorded
//! 5. registered filter vetoes it (a failing filter lets the error through)
//! 6. registered error-group callback labels it (a failing callback leaves it
//!    unlabelled)

pub mod event_aggregator;
pub mod ignore;
pub mod noticed_error;
pub mod trace_aggregator;

use hashbrown::HashSet;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, error, warn};

use crate::config::ErrorCollectorConfig;
use crate::errors::CallbackError;
use crate::metrics::{names, MetricKey, StatsEngine, StatsHash};
use crate::transaction::segment::SegmentFrame;
use crate::transaction::TransactionType;
use crate::Attributes;

pub use event_aggregator::{ErrorEventAggregator, ReservoirMetadata};
pub use ignore::{IgnoreRules, StatusCodeSet};
pub use noticed_error::{CapturedError, ErrorEvent, ErrorId, NoticeOptions, NoticedError};
pub use trace_aggregator::ErrorTraceAggregator;

/// Vetoes or replaces errors before they are recorded. Returning `Ok(None)`
/// drops the error.
pub type ErrorFilter =
    Arc<dyn Fn(&CapturedError) -> Result<Option<CapturedError>, CallbackError> + Send + Sync>;

/// Labels errors with an application-defined error group.
pub type ErrorGroupCallback =
    Arc<dyn Fn(&ErrorGroupInput<'_>) -> Result<Option<String>, CallbackError> + Send + Sync>;

/// Number of recorded error identities remembered to suppress duplicates.
const SEEN_ERRORS_CAPACITY: usize = 10_000;

/// Everything the error-group callback gets to look at.
#[derive(Debug)]
pub struct ErrorGroupInput<'a> {
    pub error: &'a CapturedError,
    pub custom_attributes: &'a Attributes,
    pub request_uri: Option<&'a str>,
    pub agent_attributes: &'a Attributes,
    pub intrinsic_attributes: &'a Attributes,
    pub expected: bool,
    pub options: &'a NoticeOptions,
}

#[derive(Debug, Default)]
struct SeenErrors {
    ids: HashSet<ErrorId>,
    order: VecDeque<ErrorId>,
}

impl SeenErrors {
    fn contains(&self, id: ErrorId) -> bool {
        self.ids.contains(&id)
    }

    /// Returns `false` if `id` was already present.
    fn insert(&mut self, id: ErrorId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > SEEN_ERRORS_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    fn remove(&mut self, id: ErrorId) {
        if self.ids.remove(&id) {
            self.order.retain(|seen| *seen != id);
        }
    }
}

/// Bounds a stack trace to `keep` frames, keeping the first `ceil(keep / 2)`
/// and last `floor(keep / 2)` frames around a marker for the elided ones.
/// `None` keeps every frame.
pub fn truncate_trace(frames: Vec<String>, keep: Option<usize>) -> Vec<String> {
    let Some(keep) = keep else {
        return frames;
    };
    if frames.len() <= keep {
        return frames;
    }
    let head = keep.div_ceil(2);
    let tail = keep / 2;
    let elided = frames.len() - head - tail;

    let mut truncated = Vec::with_capacity(keep + 1);
    truncated.extend_from_slice(&frames[..head]);
    truncated.push(format!("<truncated {elided} additional frames>"));
    truncated.extend_from_slice(&frames[frames.len() - tail..]);
    truncated
}

/// Collects application errors into the trace and event stores and keeps the
/// `Errors/*` counters.
pub struct ErrorCollector {
    enabled: AtomicBool,
    ignore: RwLock<IgnoreRules>,
    max_backtrace_frames: Option<usize>,
    filter: Option<ErrorFilter>,
    error_group_callback: Option<ErrorGroupCallback>,
    seen: Mutex<SeenErrors>,
    stats: Arc<StatsEngine>,
    error_trace_aggregator: ErrorTraceAggregator,
    error_event_aggregator: ErrorEventAggregator,
}

impl std::fmt::Debug for ErrorCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorCollector")
            .field("enabled", &self.enabled())
            .field("max_backtrace_frames", &self.max_backtrace_frames)
            .field("has_filter", &self.filter.is_some())
            .field("has_error_group_callback", &self.error_group_callback.is_some())
            .finish_non_exhaustive()
    }
}

impl ErrorCollector {
    pub fn new(config: ErrorCollectorConfig, stats: Arc<StatsEngine>) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            ignore: RwLock::new(IgnoreRules {
                classes: config.ignore_classes,
                status_codes: config.ignore_status_codes,
            }),
            max_backtrace_frames: config.max_backtrace_frames,
            filter: config.callbacks.filter,
            error_group_callback: config.callbacks.error_group,
            seen: Mutex::new(SeenErrors::default()),
            stats,
            error_trace_aggregator: ErrorTraceAggregator::new(config.max_error_traces),
            error_event_aggregator: ErrorEventAggregator::new(
                config.max_error_events,
                config.capture_events,
            ),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn error_trace_aggregator(&self) -> &ErrorTraceAggregator {
        &self.error_trace_aggregator
    }

    pub fn error_event_aggregator(&self) -> &ErrorEventAggregator {
        &self.error_event_aggregator
    }

    /// Adds error classes to the ignore list. Applies to errors noticed from
    /// now on.
    pub fn ignore<I, S>(&self, classes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut rules = self.ignore.write().unwrap_or_else(PoisonError::into_inner);
        rules.classes.extend(classes.into_iter().map(Into::into));
    }

    pub fn set_ignore_status_codes(&self, codes: StatusCodeSet) {
        let mut rules = self.ignore.write().unwrap_or_else(PoisonError::into_inner);
        rules.status_codes = codes;
    }

    pub fn is_ignored(&self, error: &CapturedError) -> bool {
        self.ignore
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_ignored(error.class_name(), error.status_code())
    }

    /// Marks an error instance as already recorded. Returns `false` if it
    /// was tagged before.
    pub fn tag_exception(&self, error: &CapturedError) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(error.id())
    }

    fn untag_exception(&self, error: &CapturedError) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(error.id());
    }

    pub fn exception_tagged(&self, error: &CapturedError) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(error.id())
    }

    /// Policy checks that drop an error without any further processing.
    pub fn skip_notice_error(&self, error: Option<&CapturedError>) -> bool {
        if !self.enabled() {
            return true;
        }
        let Some(error) = error else {
            return true;
        };
        self.is_ignored(error) || self.exception_tagged(error)
    }

    /// Runs the registered filter. `None` means the filter vetoed the error.
    /// A failing filter lets the original error through.
    pub fn filtered_by_error_filter(&self, error: &CapturedError) -> Option<CapturedError> {
        let Some(filter) = &self.filter else {
            return Some(error.clone());
        };
        match invoke_callback(|| filter(error)) {
            Ok(replacement) => replacement,
            Err(reason) => {
                warn!(
                    error_class = error.class_name(),
                    "Ignoring error filter failure, recording error anyway: {reason}"
                );
                Some(error.clone())
            }
        }
    }

    /// Records an error for the trace and event stores and bumps the error
    /// counters, unless one of the pipeline rules drops it. Returns whether
    /// the error was recorded.
    ///
    /// The instance is claimed before the filter runs, so concurrent notices
    /// of the same error record it once. A vetoed error is released again
    /// and may be noticed later.
    pub fn notice_error(&self, error: Option<&CapturedError>, options: NoticeOptions) -> bool {
        let Some(error) = error else {
            return false;
        };
        if !self.enabled() || self.is_ignored(error) || !self.tag_exception(error) {
            return false;
        }
        let Some(accepted) = self.filtered_by_error_filter(error) else {
            self.untag_exception(error);
            return false;
        };
        self.tag_exception(&accepted);

        let transaction_type = options.transaction_type();
        let noticed = self.create_noticed_error(&accepted, options);
        self.increment_error_count(&noticed, transaction_type);

        self.error_event_aggregator.record(&noticed);
        self.error_trace_aggregator.add(noticed);
        true
    }

    /// Attaches an error to a segment for span export. Segment errors are not
    /// counted and never reach the trace or event stores.
    pub fn notice_segment_error(
        &self,
        segment: &mut SegmentFrame,
        error: &CapturedError,
        options: NoticeOptions,
    ) {
        if self.skip_notice_error(Some(error)) {
            return;
        }
        let Some(accepted) = self.filtered_by_error_filter(error) else {
            return;
        };
        let noticed = self.create_noticed_error(&accepted, options);
        segment.set_noticed_error(noticed);
    }

    pub fn create_noticed_error(&self, error: &CapturedError, options: NoticeOptions) -> NoticedError {
        let stack_trace = match error.backtrace() {
            Some(frames) => self.truncate_trace(frames.to_vec()),
            None => vec![noticed_error::NO_STACK_TRACE.to_string()],
        };
        let mut noticed = NoticedError::new(error, &options, stack_trace);
        self.update_error_group_name(&mut noticed, error, &options);
        noticed
    }

    pub fn truncate_trace(&self, frames: Vec<String>) -> Vec<String> {
        truncate_trace(frames, self.max_backtrace_frames)
    }

    fn update_error_group_name(
        &self,
        noticed: &mut NoticedError,
        error: &CapturedError,
        options: &NoticeOptions,
    ) {
        let Some(callback) = &self.error_group_callback else {
            return;
        };
        let input = ErrorGroupInput {
            error,
            custom_attributes: noticed.custom_attributes(),
            request_uri: noticed.request_uri.as_deref(),
            agent_attributes: noticed.agent_attributes(),
            intrinsic_attributes: noticed.intrinsic_attributes(),
            expected: noticed.expected,
            options,
        };
        match invoke_callback(|| callback(&input)) {
            Ok(Some(group)) => noticed.set_error_group(group),
            Ok(None) => {}
            Err(reason) => {
                error!("Failed to obtain error group from registered callback: {reason}");
            }
        }
    }

    fn increment_error_count(
        &self,
        noticed: &NoticedError,
        transaction_type: Option<TransactionType>,
    ) {
        let mut counts = StatsHash::new();
        if noticed.expected {
            counts.increment_count(MetricKey::unscoped(names::ERRORS_EXPECTED_ALL));
        } else {
            counts.increment_count(MetricKey::unscoped(names::ERRORS_ALL));
            match transaction_type {
                Some(TransactionType::Web) => {
                    counts.increment_count(MetricKey::unscoped(names::ERRORS_ALL_WEB));
                }
                Some(TransactionType::Background) => {
                    counts.increment_count(MetricKey::unscoped(names::ERRORS_ALL_OTHER));
                }
                None => {}
            }
            if noticed.metric_name != names::UNKNOWN {
                counts.increment_count(MetricKey::unscoped(&format!(
                    "{}{}",
                    names::ERRORS_PREFIX,
                    noticed.metric_name
                )));
            }
        }
        self.stats.merge(&counts);
        debug!(
            error_class = noticed.class_name.as_str(),
            expected = noticed.expected,
            "Noticed error for {}",
            noticed.metric_name
        );
    }
}

/// Runs a user callback, converting both returned errors and panics into a
/// description of the failure.
fn invoke_callback<T, F>(callback: F) -> Result<T, String>
where
    F: FnOnce() -> Result<T, CallbackError>,
{
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.to_string()),
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "callback panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ErrorCallbacks;
    use proptest::prelude::*;
    use std::time::SystemTime;
    use tracing_test::traced_test;

    fn collector_with(config: ErrorCollectorConfig) -> (ErrorCollector, Arc<StatsEngine>) {
        let stats = Arc::new(StatsEngine::new());
        (ErrorCollector::new(config, Arc::clone(&stats)), stats)
    }

    fn collector() -> (ErrorCollector, Arc<StatsEngine>) {
        collector_with(ErrorCollectorConfig::default())
    }

    fn count(stats: &StatsEngine, name: &str) -> u64 {
        stats
            .get(&MetricKey::unscoped(name))
            .map_or(0, |s| s.call_count)
    }

    fn frames(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    fn io_filter(
    ) -> impl Fn(&CapturedError) -> Result<Option<CapturedError>, CallbackError> + Send + Sync + 'static
    {
        |error: &CapturedError| {
            if error.class_name() == "IOError" {
                Ok(None)
            } else {
                Ok(Some(error.clone()))
            }
        }
    }

    fn segment() -> SegmentFrame {
        SegmentFrame::new("Custom/work", SystemTime::now(), "parent".to_string())
    }

    #[test]
    fn test_nil_error_records_nothing() {
        let (collector, stats) = collector();
        collector.notice_error(None, NoticeOptions::new().metric("path"));

        assert!(collector.error_trace_aggregator().harvest().is_empty());
        assert!(collector.error_event_aggregator().harvest().1.is_empty());
        assert!(stats.is_empty());
    }

    #[test]
    fn test_records_trace_and_event() {
        let (collector, stats) = collector();
        collector.notice_error(
            Some(&CapturedError::new("StandardError", "boom")),
            NoticeOptions::new(),
        );

        assert_eq!(collector.error_trace_aggregator().harvest().len(), 1);
        assert_eq!(collector.error_event_aggregator().harvest().1.len(), 1);
        assert_eq!(count(&stats, names::ERRORS_ALL), 1);
    }

    #[test]
    fn test_disabled_collector_skips_everything() {
        let (collector, stats) = collector_with(ErrorCollectorConfig {
            enabled: false,
            ..Default::default()
        });
        let error = CapturedError::new("StandardError", "boom");
        assert!(collector.skip_notice_error(Some(&error)));

        collector.notice_error(Some(&error), NoticeOptions::new());
        assert!(collector.error_trace_aggregator().is_empty());
        assert!(stats.is_empty());
    }

    #[test]
    fn test_ignored_class_is_not_counted() {
        let (collector, stats) = collector();
        collector.ignore(["IOError"]);
        collector.notice_error(
            Some(&CapturedError::new("IOError", "message")),
            NoticeOptions::new().metric("path"),
        );

        assert!(collector.error_trace_aggregator().harvest().is_empty());
        assert!(collector.error_event_aggregator().harvest().1.is_empty());
        assert!(stats.is_empty());
    }

    #[test]
    fn test_ignore_applies_to_later_errors_only() {
        let (collector, _) = collector();
        collector.notice_error(Some(&CapturedError::new("IOError", "first")), NoticeOptions::new());
        collector.ignore(["IOError"]);
        collector.notice_error(Some(&CapturedError::new("IOError", "second")), NoticeOptions::new());

        let traces = collector.error_trace_aggregator().harvest();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].message, "first");
    }

    #[test]
    fn test_ignored_status_code() {
        let (collector, _) = collector_with(ErrorCollectorConfig {
            ignore_status_codes: "400-408".parse().expect("valid codes"),
            ..Default::default()
        });
        let not_found = CapturedError::new("AnError", "missing").with_status_code(404);
        let server = CapturedError::new("AnError", "broken").with_status_code(500);
        assert!(collector.is_ignored(&not_found));
        assert!(!collector.is_ignored(&server));
    }

    #[test]
    fn test_ignored_and_expected_error_is_ignored() {
        let (collector, stats) = collector_with(ErrorCollectorConfig {
            ignore_classes: HashSet::from(["AnError".to_string()]),
            ..Default::default()
        });
        collector.notice_error(
            Some(&CapturedError::new("AnError", "x")),
            NoticeOptions::new().expected(true),
        );
        assert!(collector.error_event_aggregator().harvest().1.is_empty());
        assert!(stats.is_empty());
    }

    #[test]
    fn test_filter_vetoes_errors() {
        let (collector, _) = collector_with(ErrorCollectorConfig {
            callbacks: ErrorCallbacks::default().with_filter(io_filter()),
            ..Default::default()
        });
        collector.notice_error(Some(&CapturedError::new("IOError", "a")), NoticeOptions::new());
        collector.notice_error(
            Some(&CapturedError::new("StandardError", "b")),
            NoticeOptions::new(),
        );

        assert_eq!(collector.error_trace_aggregator().harvest().len(), 1);
        assert_eq!(collector.error_event_aggregator().harvest().1.len(), 1);
    }

    #[test]
    fn test_filter_may_replace_error() {
        let (collector, _) = collector_with(ErrorCollectorConfig {
            callbacks: ErrorCallbacks::default().with_filter(|error: &CapturedError| {
                Ok(Some(CapturedError::new(error.class_name(), "[redacted]")))
            }),
            ..Default::default()
        });
        collector.notice_error(
            Some(&CapturedError::new("StandardError", "password=hunter2")),
            NoticeOptions::new(),
        );
        let traces = collector.error_trace_aggregator().harvest();
        assert_eq!(traces[0].message, "[redacted]");
    }

    #[test]
    #[traced_test]
    fn test_failing_filter_fails_open() {
        let (collector, stats) = collector_with(ErrorCollectorConfig {
            callbacks: ErrorCallbacks::default().with_filter(|_: &CapturedError| {
                Err("error in the filter for ignoring errors".into())
            }),
            ..Default::default()
        });
        collector.notice_error(
            Some(&CapturedError::new("StandardError", "message")),
            NoticeOptions::new(),
        );

        assert_eq!(collector.error_trace_aggregator().harvest().len(), 1);
        assert_eq!(collector.error_event_aggregator().harvest().1.len(), 1);
        assert_eq!(count(&stats, names::ERRORS_ALL), 1);
        assert!(logs_contain("Ignoring error filter failure"));
        logs_assert(|lines: &[&str]| {
            match lines
                .iter()
                .filter(|line| line.contains("Ignoring error filter failure"))
                .count()
            {
                1 => Ok(()),
                n => Err(format!("expected one warning, got {n}")),
            }
        });
    }

    #[test]
    fn test_panicking_filter_fails_open() {
        let (collector, _) = collector_with(ErrorCollectorConfig {
            callbacks: ErrorCallbacks::default()
                .with_filter(|_: &CapturedError| panic!("filter exploded")),
            ..Default::default()
        });
        collector.notice_error(
            Some(&CapturedError::new("StandardError", "message")),
            NoticeOptions::new(),
        );
        assert_eq!(collector.error_trace_aggregator().harvest().len(), 1);
    }

    #[test]
    fn test_increments_count_on_errors() {
        let (collector, stats) = collector();
        collector.notice_error(Some(&CapturedError::new("StandardError", "Boo")), NoticeOptions::new());
        assert_eq!(count(&stats, names::ERRORS_ALL), 1);
        collector.notice_error(Some(&CapturedError::new("StandardError", "Boo")), NoticeOptions::new());
        assert_eq!(count(&stats, names::ERRORS_ALL), 2);
    }

    #[test]
    fn test_web_and_other_rollups() {
        let (collector, stats) = collector();
        collector.notice_error(
            Some(&CapturedError::new("StandardError", "web")),
            NoticeOptions::new()
                .metric("Controller/class/method")
                .in_transaction(TransactionType::Web),
        );
        collector.notice_error(
            Some(&CapturedError::new("StandardError", "job")),
            NoticeOptions::new()
                .metric("OtherTransaction/AnotherFramework/Job/perform")
                .in_transaction(TransactionType::Background),
        );

        assert_eq!(count(&stats, names::ERRORS_ALL), 2);
        assert_eq!(count(&stats, names::ERRORS_ALL_WEB), 1);
        assert_eq!(count(&stats, names::ERRORS_ALL_OTHER), 1);
        assert_eq!(count(&stats, "Errors/Controller/class/method"), 1);
        assert_eq!(
            count(&stats, "Errors/OtherTransaction/AnotherFramework/Job/perform"),
            1
        );
    }

    #[test]
    fn test_outside_transaction_only_counts_summary() {
        let (collector, stats) = collector();
        collector.notice_error(Some(&CapturedError::new("StandardError", "x")), NoticeOptions::new());

        assert_eq!(count(&stats, names::ERRORS_ALL), 1);
        assert_eq!(count(&stats, names::ERRORS_ALL_WEB), 0);
        assert_eq!(count(&stats, names::ERRORS_ALL_OTHER), 0);
        assert_eq!(stats.len(), 1);
    }

    #[test]
    fn test_unknown_metric_is_not_counted_by_name() {
        let (collector, stats) = collector();
        collector.notice_error(
            Some(&CapturedError::new("StandardError", "x")),
            NoticeOptions::new().metric(names::UNKNOWN),
        );
        assert_eq!(count(&stats, "Errors/(unknown)"), 0);
    }

    #[test]
    fn test_blamed_metric_from_options() {
        let (collector, stats) = collector();
        collector.notice_error(
            Some(&CapturedError::new("StandardError", "wut")),
            NoticeOptions::new().metric("boo"),
        );
        assert_eq!(count(&stats, "Errors/boo"), 1);
    }

    #[test]
    fn test_doesnt_double_count_same_exception() {
        let (collector, stats) = collector();
        let error = CapturedError::new("StandardError", "wat");
        collector.notice_error(Some(&error), NoticeOptions::new());
        collector.notice_error(Some(&error.clone()), NoticeOptions::new());

        assert_eq!(collector.error_trace_aggregator().harvest().len(), 1);
        assert_eq!(count(&stats, names::ERRORS_ALL), 1);
    }

    #[test]
    fn test_doesnt_count_seen_exceptions() {
        let (collector, stats) = collector();
        let error = CapturedError::new("StandardError", "wat");
        collector.tag_exception(&error);
        collector.notice_error(Some(&error), NoticeOptions::new());

        assert!(collector.error_trace_aggregator().harvest().is_empty());
        assert_eq!(count(&stats, names::ERRORS_ALL), 0);
    }

    #[test]
    fn test_concurrent_notices_of_same_error_record_once() {
        let (collector, stats) = collector_with(ErrorCollectorConfig {
            callbacks: ErrorCallbacks::default().with_filter(|error: &CapturedError| {
                std::thread::sleep(std::time::Duration::from_millis(50));
                Ok(Some(error.clone()))
            }),
            ..Default::default()
        });
        let collector = Arc::new(collector);
        let error = CapturedError::new("StandardError", "raced");

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let collector = Arc::clone(&collector);
                let error = error.clone();
                std::thread::spawn(move || collector.notice_error(Some(&error), NoticeOptions::new()))
            })
            .collect();
        let recorded = handles
            .into_iter()
            .map(|handle| handle.join().expect("notice thread"))
            .filter(|recorded| *recorded)
            .count();

        assert_eq!(recorded, 1);
        assert_eq!(collector.error_trace_aggregator().harvest().len(), 1);
        assert_eq!(count(&stats, names::ERRORS_ALL), 1);
    }

    #[test]
    fn test_vetoed_error_can_be_noticed_again() {
        let vetoes = Arc::new(std::sync::atomic::AtomicUsize::new(1));
        let remaining = Arc::clone(&vetoes);
        let (collector, _) = collector_with(ErrorCollectorConfig {
            callbacks: ErrorCallbacks::default().with_filter(move |error: &CapturedError| {
                let veto = remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                Ok((!veto).then(|| error.clone()))
            }),
            ..Default::default()
        });
        let error = CapturedError::new("StandardError", "retry");

        assert!(!collector.notice_error(Some(&error), NoticeOptions::new()));
        assert!(!collector.exception_tagged(&error));
        assert!(collector.notice_error(Some(&error), NoticeOptions::new()));
        assert!(collector.exception_tagged(&error));
        assert_eq!(collector.error_trace_aggregator().harvest().len(), 1);
    }

    #[test]
    fn test_captures_attributes_on_notice_error() {
        let (collector, _) = collector();
        let mut attributes = Attributes::new();
        attributes.insert("http.statusCode".to_string(), 503.into());
        collector.notice_error(
            Some(&CapturedError::new("StandardError", "wat")),
            NoticeOptions::new().attributes(attributes),
        );
        let traces = collector.error_trace_aggregator().harvest();
        assert_eq!(traces[0].agent_attributes()["http.statusCode"], 503);
    }

    #[test]
    fn test_expected_error_counts_separately() {
        let (collector, stats) = collector();
        collector.notice_error(
            Some(&CapturedError::new("StandardError", "x")),
            NoticeOptions::new()
                .expected(true)
                .in_transaction(TransactionType::Web)
                .metric("Controller/a"),
        );

        let traces = collector.error_trace_aggregator().harvest();
        let (_, events) = collector.error_event_aggregator().harvest();
        assert_eq!(traces.len(), 1);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].intrinsics[noticed_error::ATTR_ERROR_EXPECTED], true);
        assert!(!events[0].custom_attributes.contains_key("expected"));
        assert_eq!(count(&stats, names::ERRORS_EXPECTED_ALL), 1);
        assert_eq!(count(&stats, names::ERRORS_ALL), 0);
        assert_eq!(count(&stats, names::ERRORS_ALL_WEB), 0);
        assert_eq!(count(&stats, "Errors/Controller/a"), 0);
    }

    #[test]
    fn test_missing_backtrace_placeholder() {
        let (collector, _) = collector();
        let noticed =
            collector.create_noticed_error(&CapturedError::new("E", "m"), NoticeOptions::new());
        assert_eq!(noticed.stack_trace, vec![noticed_error::NO_STACK_TRACE.to_string()]);
    }

    #[test]
    fn test_backtrace_truncated_with_config() {
        let (collector, _) = collector_with(ErrorCollectorConfig {
            max_backtrace_frames: Some(2),
            ..Default::default()
        });
        let error = CapturedError::new("E", "m")
            .with_backtrace(frames(&["error1", "error2", "error3", "error4"]));
        let noticed = collector.create_noticed_error(&error, NoticeOptions::new());
        assert_eq!(
            noticed.stack_trace,
            frames(&["error1", "<truncated 2 additional frames>", "error4"])
        );
    }

    #[test]
    fn test_truncate_trace_cases() {
        assert_eq!(
            truncate_trace(frames(&["a", "b", "c", "d"]), Some(2)),
            frames(&["a", "<truncated 2 additional frames>", "d"])
        );
        assert_eq!(
            truncate_trace(frames(&["error1", "error2", "error3", "error4"]), Some(3)),
            frames(&["error1", "error2", "<truncated 1 additional frames>", "error4"])
        );
        assert!(truncate_trace(Vec::new(), Some(7)).is_empty());
        assert_eq!(truncate_trace(frames(&["e", "e", "e"]), Some(6)).len(), 3);
        assert_eq!(
            truncate_trace(frames(&["error1", "error2", "error3", "error4"]), None).len(),
            4
        );
    }

    #[test]
    fn test_segment_error_attached_but_not_harvested() {
        let (collector, stats) = collector();
        let mut frame = segment();
        collector.notice_segment_error(
            &mut frame,
            &CapturedError::new("StandardError", "Oops!"),
            NoticeOptions::new().expected(true),
        );

        let noticed = frame.noticed_error_mut().expect("segment error attached");
        assert!(noticed.attributes_from_notice_error().is_empty());
        noticed.build_error_attributes();
        let attrs = noticed.attributes_from_notice_error();
        assert_eq!(attrs["error.message"], "Oops!");
        assert_eq!(attrs["error.class"], "StandardError");
        assert_eq!(attrs["error.expected"], true);

        assert!(collector.error_trace_aggregator().harvest().is_empty());
        assert!(collector.error_event_aggregator().harvest().1.is_empty());
        assert!(stats.is_empty());
    }

    #[test]
    fn test_segment_error_filtered() {
        let (collector, _) = collector_with(ErrorCollectorConfig {
            ignore_classes: HashSet::from(["StandardError".to_string()]),
            ..Default::default()
        });
        let mut frame = segment();
        collector.notice_segment_error(
            &mut frame,
            &CapturedError::new("StandardError", "Oops!"),
            NoticeOptions::new(),
        );
        assert!(frame.noticed_error_mut().is_none());
    }

    #[test]
    fn test_segment_error_exclude_filter() {
        let (collector, _) = collector_with(ErrorCollectorConfig {
            callbacks: ErrorCallbacks::default().with_filter(io_filter()),
            ..Default::default()
        });
        let mut frame = segment();
        collector.notice_segment_error(
            &mut frame,
            &CapturedError::new("IOError", "message"),
            NoticeOptions::new(),
        );
        assert!(frame.noticed_error_mut().is_none());
        assert!(collector.error_trace_aggregator().harvest().is_empty());
    }

    #[test]
    fn test_error_group_callback_labels_error() {
        let (collector, _) = collector_with(ErrorCollectorConfig {
            callbacks: ErrorCallbacks::default().with_error_group(|input: &ErrorGroupInput<'_>| {
                Ok((input.error.class_name() == "ArgumentError").then(|| "lucky tiger".to_string()))
            }),
            ..Default::default()
        });
        let noticed = collector
            .create_noticed_error(&CapturedError::new("ArgumentError", "x"), NoticeOptions::new());
        assert_eq!(noticed.error_group.as_deref(), Some("lucky tiger"));
        assert_eq!(
            noticed.agent_attributes()[noticed_error::ATTR_ERROR_GROUP],
            "lucky tiger"
        );

        let other = collector
            .create_noticed_error(&CapturedError::new("RuntimeError", "x"), NoticeOptions::new());
        assert!(other.error_group.is_none());
    }

    #[test]
    fn test_error_group_callback_sees_notice_details() {
        let (collector, _) = collector_with(ErrorCollectorConfig {
            callbacks: ErrorCallbacks::default().with_error_group(|input: &ErrorGroupInput<'_>| {
                assert_eq!(input.request_uri, Some("/checkout"));
                assert!(input.expected);
                assert_eq!(input.custom_attributes["cart"], "big");
                Ok(Some("checkout".to_string()))
            }),
            ..Default::default()
        });
        let mut options = NoticeOptions::new().expected(true).custom_param("cart", "big");
        options.uri = Some("/checkout".to_string());
        let noticed =
            collector.create_noticed_error(&CapturedError::new("RuntimeError", "x"), options);
        assert_eq!(noticed.error_group.as_deref(), Some("checkout"));
    }

    #[test]
    #[traced_test]
    fn test_failing_error_group_callback_is_logged() {
        let (collector, _) = collector_with(ErrorCollectorConfig {
            callbacks: ErrorCallbacks::default()
                .with_error_group(|_: &ErrorGroupInput<'_>| Err("kaboom".into())),
            ..Default::default()
        });
        collector.notice_error(
            Some(&CapturedError::new("RuntimeError", "x")),
            NoticeOptions::new(),
        );

        let traces = collector.error_trace_aggregator().harvest();
        assert_eq!(traces.len(), 1);
        assert!(traces[0].error_group.is_none());
        assert!(logs_contain("Failed to obtain error group"));
    }

    #[test]
    fn test_seen_errors_bounded() {
        let mut seen = SeenErrors::default();
        let first = CapturedError::new("E", "first").id();
        seen.insert(first);
        for i in 0..SEEN_ERRORS_CAPACITY {
            seen.insert(CapturedError::new("E", i.to_string()).id());
        }
        assert!(!seen.contains(first));
        assert_eq!(seen.order.len(), SEEN_ERRORS_CAPACITY);
    }

    proptest! {
        #[test]
        fn prop_truncate_trace_bounds(len in 0usize..64, keep in 0usize..32) {
            let trace: Vec<String> = (0..len).map(|i| format!("frame{i}")).collect();
            let truncated = truncate_trace(trace.clone(), Some(keep));
            if len <= keep {
                prop_assert_eq!(truncated, trace);
            } else {
                prop_assert_eq!(truncated.len(), keep + 1);
                prop_assert_eq!(&truncated[..keep.div_ceil(2)], &trace[..keep.div_ceil(2)]);
                let marker = format!("<truncated {} additional frames>", len - keep);
                prop_assert_eq!(&truncated[keep.div_ceil(2)], &marker);
                prop_assert_eq!(&truncated[keep.div_ceil(2) + 1..], &trace[len - keep / 2..]);
            }
        }
    }
}
