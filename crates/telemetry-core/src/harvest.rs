// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic harvest of the shared aggregators.
//!
//! Each cycle drains the [`StatsEngine`] and both error stores and hands the
//! payloads to a [`HarvestSink`]. Metrics and error traces that fail to
//! transmit are merged back and retried on the next cycle; sampled error
//! events are not.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error_collector::{ErrorCollector, ErrorEvent, NoticedError, ReservoirMetadata};
use crate::errors::HarvestError;
use crate::metrics::{StatsEngine, StatsHash};
use crate::streaming::SpanStreamerSlot;

/// Transport for harvested payloads.
#[async_trait]
pub trait HarvestSink: Send + Sync {
    async fn send_metrics(&self, metrics: &StatsHash) -> Result<(), HarvestError>;

    async fn send_error_traces(&self, traces: &[NoticedError]) -> Result<(), HarvestError>;

    async fn send_error_events(
        &self,
        metadata: ReservoirMetadata,
        events: &[ErrorEvent],
    ) -> Result<(), HarvestError>;
}

/// Counts of what one harvest cycle transmitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HarvestReport {
    pub metrics: usize,
    pub error_traces: usize,
    pub error_events: usize,
    pub failures: usize,
}

pub struct HarvestCoordinator {
    stats: Arc<StatsEngine>,
    errors: Arc<ErrorCollector>,
    spans: Option<Arc<SpanStreamerSlot>>,
    sink: Arc<dyn HarvestSink>,
    interval: Duration,
}

impl HarvestCoordinator {
    pub fn new(
        stats: Arc<StatsEngine>,
        errors: Arc<ErrorCollector>,
        sink: Arc<dyn HarvestSink>,
        interval: Duration,
    ) -> Self {
        Self {
            stats,
            errors,
            spans: None,
            sink,
            interval,
        }
    }

    /// Stops this streamer slot when the harvest loop shuts down.
    #[must_use]
    pub fn with_span_streamer(mut self, spans: Arc<SpanStreamerSlot>) -> Self {
        self.spans = Some(spans);
        self
    }

    pub async fn harvest_once(&self) -> HarvestReport {
        let mut report = HarvestReport::default();

        let metrics = self.stats.harvest_and_reset();
        if !metrics.is_empty() {
            match self.sink.send_metrics(&metrics).await {
                Ok(()) => report.metrics = metrics.len(),
                Err(err) => {
                    warn!("{err}, retrying with next harvest");
                    self.stats.merge(&metrics);
                    report.failures += 1;
                }
            }
        }

        let traces = self.errors.error_trace_aggregator().harvest();
        if !traces.is_empty() {
            match self.sink.send_error_traces(&traces).await {
                Ok(()) => report.error_traces = traces.len(),
                Err(err) => {
                    warn!("{err}, retrying with next harvest");
                    self.errors.error_trace_aggregator().merge(traces);
                    report.failures += 1;
                }
            }
        }

        let (metadata, events) = self.errors.error_event_aggregator().harvest();
        if !events.is_empty() {
            match self.sink.send_error_events(metadata, &events).await {
                Ok(()) => report.error_events = events.len(),
                Err(err) => {
                    warn!("{err}, dropping {} error events", events.len());
                    report.failures += 1;
                }
            }
        }

        debug!(
            metrics = report.metrics,
            error_traces = report.error_traces,
            error_events = report.error_events,
            "Harvest complete"
        );
        report
    }

    /// Harvests every interval until `cancel` fires, then stops the span
    /// streamer and runs a final harvest.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await; // discard first tick

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.harvest_once().await;
                }
                () = cancel.cancelled() => {
                    debug!("Harvest loop shutting down, performing final harvest");
                    if let Some(spans) = &self.spans {
                        spans.stop().await;
                    }
                    self.harvest_once().await;
                    break;
                }
            }
        }
    }
}
