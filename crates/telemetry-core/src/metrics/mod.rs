// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metric statistics: the per-transaction [`StatsHash`] and the process-wide
//! [`StatsEngine`] that finished transactions merge into.

pub mod stats;
pub mod stats_engine;
pub mod stats_hash;

pub use stats::{MetricKey, MetricStats, SCOPE_PLACEHOLDER};
pub use stats_engine::StatsEngine;
pub use stats_hash::StatsHash;

/// Metric names shared between the transaction, error and streaming pipelines.
pub mod names {
    pub const ERRORS_ALL: &str = "Errors/all";
    pub const ERRORS_ALL_WEB: &str = "Errors/allWeb";
    pub const ERRORS_ALL_OTHER: &str = "Errors/allOther";
    pub const ERRORS_EXPECTED_ALL: &str = "ErrorsExpected/all";
    pub const ERRORS_PREFIX: &str = "Errors/";

    pub const APDEX: &str = "Apdex";
    pub const HTTP_DISPATCHER: &str = "HttpDispatcher";
    pub const WEB_TRANSACTION: &str = "WebTransaction";
    pub const OTHER_TRANSACTION: &str = "OtherTransaction";
    pub const OTHER_TRANSACTION_ALL: &str = "OtherTransaction/all";
    pub const QUEUE_TIME: &str = "WebFrontend/QueueTime";

    pub const SPAN_SEEN: &str = "Supportability/InfiniteTracing/Span/Seen";
    pub const SPAN_SENT: &str = "Supportability/InfiniteTracing/Span/Sent";
    pub const SPAN_QUEUE_DUMPED: &str = "Supportability/InfiniteTracing/Span/AgentQueueDumped";
    pub const SPAN_RESPONSE_ERROR: &str = "Supportability/InfiniteTracing/Span/Response/Error";

    /// Name given to transactions that were never explicitly named.
    pub const UNKNOWN: &str = "(unknown)";
}
