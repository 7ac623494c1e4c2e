// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Telemetry Core
//!
//! In-process telemetry for an instrumented application.
//!
//! - [`metrics`]: timing statistics keyed by metric name and scope, held in a
//!   shared [`metrics::StatsEngine`] until harvest
//! - [`transaction`]: per-context transaction and segment stacks, and the
//!   metrics, apdex and spans a finished transaction produces
//! - [`error_collector`]: filtering, grouping and storage of noticed errors
//! - [`streaming`]: live span export over a reconnecting stream
//! - [`harvest`]: the periodic loop that drains everything to a sink
//!
//! Configuration lives in [`config`]; [`logger`] provides the log format.

#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod config;
pub mod error_collector;
pub mod errors;
pub mod harvest;
pub mod logger;
pub mod metrics;
pub mod streaming;
pub mod transaction;

/// Attribute map attached to errors, events and spans.
pub type Attributes = serde_json::Map<String, serde_json::Value>;
