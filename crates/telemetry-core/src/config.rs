// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use hashbrown::HashSet;
use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error_collector::event_aggregator::DEFAULT_MAX_ERROR_EVENTS;
use crate::error_collector::trace_aggregator::DEFAULT_MAX_ERROR_TRACES;
use crate::error_collector::{
    CapturedError, ErrorFilter, ErrorGroupCallback, ErrorGroupInput, StatusCodeSet,
};
use crate::errors::{CallbackError, ConfigError};

const DEFAULT_MAX_BACKTRACE_FRAMES: usize = 50;
const DEFAULT_APDEX_T: Duration = Duration::from_millis(500);
const DEFAULT_HARVEST_INTERVAL: Duration = Duration::from_secs(60);

/// Smallest retry period the span streamer accepts between reconnects.
pub const MIN_RETRY_PERIOD: Duration = Duration::from_secs(1);
const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(15);
const DEFAULT_SPAN_BUFFER_CAPACITY: usize = 10_000;
const DEFAULT_SPAN_BATCH_SIZE: usize = 100;
const DEFAULT_BATCH_LINGER: Duration = Duration::from_millis(5);
const DEFAULT_STOP_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Filter and error-group callbacks registered by the application.
#[derive(Clone, Default)]
pub struct ErrorCallbacks {
    pub filter: Option<ErrorFilter>,
    pub error_group: Option<ErrorGroupCallback>,
}

impl fmt::Debug for ErrorCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorCallbacks")
            .field("filter", &self.filter.is_some())
            .field("error_group", &self.error_group.is_some())
            .finish()
    }
}

impl ErrorCallbacks {
    #[must_use]
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&CapturedError) -> Result<Option<CapturedError>, CallbackError>
            + Send
            + Sync
            + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    #[must_use]
    pub fn with_error_group<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ErrorGroupInput<'_>) -> Result<Option<String>, CallbackError>
            + Send
            + Sync
            + 'static,
    {
        self.error_group = Some(Arc::new(callback));
        self
    }
}

/// `error_collector.*` settings
#[derive(Debug, Clone)]
pub struct ErrorCollectorConfig {
    /// Gates all error capture
    pub enabled: bool,
    /// Whether error events are kept alongside error traces
    pub capture_events: bool,
    pub ignore_classes: HashSet<String>,
    pub ignore_status_codes: StatusCodeSet,
    /// `None` keeps every frame
    pub max_backtrace_frames: Option<usize>,
    pub max_error_traces: usize,
    pub max_error_events: usize,
    pub callbacks: ErrorCallbacks,
}

impl Default for ErrorCollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capture_events: true,
            ignore_classes: HashSet::new(),
            ignore_status_codes: StatusCodeSet::new(),
            max_backtrace_frames: Some(DEFAULT_MAX_BACKTRACE_FRAMES),
            max_error_traces: DEFAULT_MAX_ERROR_TRACES,
            max_error_events: DEFAULT_MAX_ERROR_EVENTS,
            callbacks: ErrorCallbacks::default(),
        }
    }
}

/// `infinite_tracing.*` settings for the span streamer
#[derive(Debug, Clone, PartialEq)]
pub struct InfiniteTracingConfig {
    /// Remote span endpoint; streaming is off when unset
    pub endpoint: Option<String>,
    /// Coalesce spans into batches instead of sending them one at a time
    pub batching: bool,
    /// Wait between a stream failure and the next connection attempt
    pub retry_period: Duration,
    pub buffer_capacity: usize,
    pub batch_size: usize,
    /// How long a partial batch waits for more spans
    pub batch_linger: Duration,
    /// Best-effort flush budget when the streamer stops
    pub stop_flush_timeout: Duration,
}

impl Default for InfiniteTracingConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            batching: true,
            retry_period: DEFAULT_RETRY_PERIOD,
            buffer_capacity: DEFAULT_SPAN_BUFFER_CAPACITY,
            batch_size: DEFAULT_SPAN_BATCH_SIZE,
            batch_linger: DEFAULT_BATCH_LINGER,
            stop_flush_timeout: DEFAULT_STOP_FLUSH_TIMEOUT,
        }
    }
}

/// Configuration for the telemetry core
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub error_collector: ErrorCollectorConfig,
    pub infinite_tracing: InfiniteTracingConfig,
    /// Apdex threshold T
    pub apdex_t: Duration,
    pub harvest_interval: Duration,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            error_collector: ErrorCollectorConfig::default(),
            infinite_tracing: InfiniteTracingConfig::default(),
            apdex_t: DEFAULT_APDEX_T,
            harvest_interval: DEFAULT_HARVEST_INTERVAL,
            log_level: "info".to_string(),
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|val| matches!(val.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{name} has invalid value '{val}'"))),
        Err(_) => Ok(None),
    }
}

fn env_millis(name: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(name)?.map(Duration::from_millis))
}

impl TelemetryConfig {
    /// Create configuration from `TELEMETRY_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let errors = &mut config.error_collector;
        if let Some(enabled) = env_bool("TELEMETRY_ERROR_COLLECTOR_ENABLED") {
            errors.enabled = enabled;
        }
        if let Some(capture) = env_bool("TELEMETRY_ERROR_COLLECTOR_CAPTURE_EVENTS") {
            errors.capture_events = capture;
        }
        if let Ok(classes) = env::var("TELEMETRY_ERROR_COLLECTOR_IGNORE_CLASSES") {
            errors.ignore_classes = classes
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(codes) = env::var("TELEMETRY_ERROR_COLLECTOR_IGNORE_STATUS_CODES") {
            errors.ignore_status_codes = codes.parse()?;
        }
        if let Ok(frames) = env::var("TELEMETRY_ERROR_COLLECTOR_MAX_BACKTRACE_FRAMES") {
            errors.max_backtrace_frames = match frames.trim() {
                "" | "none" | "unlimited" => None,
                value => Some(value.parse().map_err(|_| {
                    ConfigError::Invalid(format!("invalid max backtrace frames '{value}'"))
                })?),
            };
        }

        let tracing = &mut config.infinite_tracing;
        tracing.endpoint = env::var("TELEMETRY_INFINITE_TRACING_ENDPOINT")
            .ok()
            .filter(|e| !e.trim().is_empty());
        if let Some(batching) = env_bool("TELEMETRY_INFINITE_TRACING_BATCHING") {
            tracing.batching = batching;
        }
        if let Some(retry) = env_millis("TELEMETRY_INFINITE_TRACING_RETRY_PERIOD_MS")? {
            tracing.retry_period = retry;
        }
        if let Some(capacity) = env_parse("TELEMETRY_INFINITE_TRACING_BUFFER_CAPACITY")? {
            tracing.buffer_capacity = capacity;
        }

        if let Some(apdex_t) = env_millis("TELEMETRY_APDEX_T_MS")? {
            config.apdex_t = apdex_t;
        }
        if let Some(interval) = env_millis("TELEMETRY_HARVEST_INTERVAL_MS")? {
            config.harvest_interval = interval;
        }
        if let Ok(level) = env::var("TELEMETRY_LOG_LEVEL") {
            config.log_level = level.to_lowercase();
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let tracing = &self.infinite_tracing;
        if tracing.retry_period < MIN_RETRY_PERIOD {
            return Err(ConfigError::Invalid(format!(
                "infinite_tracing retry period {:?} is below the {:?} floor",
                tracing.retry_period, MIN_RETRY_PERIOD
            )));
        }
        if tracing.buffer_capacity == 0 {
            return Err(ConfigError::Invalid(
                "infinite_tracing buffer capacity must be greater than 0".to_string(),
            ));
        }
        if tracing.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "infinite_tracing batch size must be greater than 0".to_string(),
            ));
        }
        if self.harvest_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "harvest interval must be greater than 0".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }
}
