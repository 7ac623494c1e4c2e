// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{InfiniteTracingConfig, MIN_RETRY_PERIOD};
use crate::errors::StreamError;
use crate::metrics::{names, StatsEngine};
use crate::streaming::connection::{SpanStream, SpanStreamConnector, StreamSignal};
use crate::streaming::span::{SpanBatch, SpanRecord};

/// Upper bound on waiting for a connection to close politely.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a [`SpanStreamer`]. `Stopped` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum StreamerState {
    Disconnected,
    Connecting,
    Streaming,
    Backoff,
    Stopping,
    Stopped,
}

/// Moves to `next` unless a stop is already under way. Only
/// [`SpanStreamer::stop`] moves past `Stopping`.
fn transition(state: &watch::Sender<StreamerState>, next: StreamerState) {
    state.send_if_modified(|current| {
        let allowed = match *current {
            StreamerState::Stopped => false,
            StreamerState::Stopping => next == StreamerState::Stopped,
            _ => true,
        };
        if allowed && *current != next {
            *current = next;
            return true;
        }
        false
    });
}

/// Ships span records to a remote endpoint from a background task.
///
/// Producers call [`enqueue`](Self::enqueue), which never waits: when the
/// buffer is full the record is dropped. The background task owns the
/// connection, reconnecting after `retry_period` whenever the stream fails,
/// and withholds sends while the endpoint has paused the stream.
pub struct SpanStreamer {
    sender: mpsc::Sender<SpanRecord>,
    state: Arc<watch::Sender<StreamerState>>,
    /// Records accepted by `enqueue` that have been neither sent nor dropped.
    pending: Arc<watch::Sender<usize>>,
    cancel: CancellationToken,
    task: TokioMutex<Option<JoinHandle<()>>>,
    stats: Arc<StatsEngine>,
    stop_flush_timeout: Duration,
}

impl std::fmt::Debug for SpanStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanStreamer")
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl SpanStreamer {
    /// Spawns the background task. Must be called from within a Tokio
    /// runtime.
    pub fn start(
        connector: Arc<dyn SpanStreamConnector>,
        config: &InfiniteTracingConfig,
        stats: Arc<StatsEngine>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.buffer_capacity.max(1));
        let state = Arc::new(watch::Sender::new(StreamerState::Disconnected));
        let pending = Arc::new(watch::Sender::new(0));
        let cancel = CancellationToken::new();

        let worker = Worker {
            connector,
            receiver,
            unsent: VecDeque::new(),
            batching: config.batching,
            batch_size: config.batch_size.max(1),
            batch_linger: config.batch_linger,
            retry_period: config.retry_period.max(MIN_RETRY_PERIOD),
            state: Arc::clone(&state),
            pending: Arc::clone(&pending),
            stats: Arc::clone(&stats),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(worker.run());

        Self {
            sender,
            state,
            pending,
            cancel,
            task: TokioMutex::new(Some(task)),
            stats,
            stop_flush_timeout: config.stop_flush_timeout,
        }
    }

    pub fn state(&self) -> StreamerState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<StreamerState> {
        self.state.subscribe()
    }

    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Queues a record without waiting. Returns `false` if the record was
    /// dropped, either because the buffer is full or the streamer is
    /// stopping.
    pub fn enqueue(&self, record: SpanRecord) -> bool {
        if matches!(self.state(), StreamerState::Stopping | StreamerState::Stopped) {
            return false;
        }
        self.stats.increment_by(names::SPAN_SEEN, 1);
        self.pending.send_modify(|pending| *pending += 1);
        match self.sender.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.release(1);
                self.stats.increment_by(names::SPAN_QUEUE_DUMPED, 1);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.release(1);
                false
            }
        }
    }

    fn release(&self, count: usize) {
        self.pending
            .send_modify(|pending| *pending = pending.saturating_sub(count));
    }

    /// Waits until every queued record has been sent or `timeout` elapses.
    /// Returns whether the buffer drained.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.subscribe();
        tokio::time::timeout(timeout, pending.wait_for(|count| *count == 0))
            .await
            .is_ok_and(|drained| drained.is_ok())
    }

    /// Stops the streamer: new records are rejected, queued ones get a
    /// bounded chance to drain, then the connection is closed and the
    /// background task joined. Repeated calls are no-ops.
    pub async fn stop(&self) {
        let mut task = self.task.lock().await;
        let Some(handle) = task.take() else {
            return;
        };
        transition(&self.state, StreamerState::Stopping);

        if !self.flush(self.stop_flush_timeout).await {
            debug!(
                "Span streamer stopping with {} spans unsent",
                self.pending()
            );
        }
        self.cancel.cancel();
        if let Err(err) = handle.await {
            warn!("Span streamer task failed: {err}");
        }
        transition(&self.state, StreamerState::Stopped);
        debug!("Span streamer stopped");
    }
}

impl Drop for SpanStreamer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum SessionEvent {
    Cancelled,
    Signal(Option<Result<StreamSignal, StreamError>>),
    Record(Option<SpanRecord>),
}

struct Worker {
    connector: Arc<dyn SpanStreamConnector>,
    receiver: mpsc::Receiver<SpanRecord>,
    /// Records taken off the channel whose send has not succeeded yet.
    unsent: VecDeque<SpanRecord>,
    batching: bool,
    batch_size: usize,
    batch_linger: Duration,
    retry_period: Duration,
    state: Arc<watch::Sender<StreamerState>>,
    pending: Arc<watch::Sender<usize>>,
    stats: Arc<StatsEngine>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        while !self.cancel.is_cancelled() {
            transition(&self.state, StreamerState::Connecting);
            let connected = tokio::select! {
                result = self.connector.connect() => result,
                () = self.cancel.cancelled() => break,
            };

            match connected {
                Ok(mut stream) => {
                    transition(&self.state, StreamerState::Streaming);
                    let outcome = self.stream(stream.as_mut()).await;
                    if tokio::time::timeout(CLOSE_TIMEOUT, stream.close()).await.is_err() {
                        debug!("Timed out closing span stream");
                    }
                    match outcome {
                        Ok(()) => break,
                        Err(err) => {
                            warn!("Span stream failed, reconnecting: {err}");
                            self.stats.increment_by(names::SPAN_RESPONSE_ERROR, 1);
                        }
                    }
                }
                Err(err) => warn!("Unable to connect span stream: {err}"),
            }

            transition(&self.state, StreamerState::Backoff);
            if !self.backoff().await {
                break;
            }
        }

        transition(&self.state, StreamerState::Disconnected);
        self.receiver.close();
        let mut dropped = self.unsent.len();
        while self.receiver.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!("Dropping {dropped} spans on shutdown");
        }
        self.pending.send_replace(0);
    }

    /// Waits out the retry period plus up to 10% jitter. Returns `false` if
    /// cancelled meanwhile.
    async fn backoff(&mut self) -> bool {
        let jitter = self.retry_period.mul_f64(fastrand::f64() * 0.1);
        tokio::select! {
            () = tokio::time::sleep(self.retry_period + jitter) => true,
            () = self.cancel.cancelled() => false,
        }
    }

    /// Drives one connected session. `Ok` means the streamer is shutting down;
    /// `Err` means the session failed and should be retried.
    async fn stream(&mut self, stream: &mut dyn SpanStream) -> Result<(), StreamError> {
        let mut paused = false;
        loop {
            if !paused && !self.unsent.is_empty() {
                if !self.send_batch(stream).await? {
                    return Ok(());
                }
                continue;
            }

            let event = tokio::select! {
                biased;
                () = self.cancel.cancelled() => SessionEvent::Cancelled,
                signal = stream.next_signal() => SessionEvent::Signal(signal),
                record = self.receiver.recv(), if !paused => SessionEvent::Record(record),
            };

            match event {
                SessionEvent::Cancelled => return Ok(()),
                SessionEvent::Signal(Some(Ok(StreamSignal::Pause))) => {
                    debug!("Span endpoint paused the stream");
                    paused = true;
                }
                SessionEvent::Signal(Some(Ok(StreamSignal::Resume))) => {
                    debug!("Span endpoint resumed the stream");
                    paused = false;
                }
                SessionEvent::Signal(Some(Ok(StreamSignal::Ack { messages_seen }))) => {
                    debug!("Span endpoint acknowledged {messages_seen} spans");
                }
                SessionEvent::Signal(Some(Err(err))) => return Err(err),
                SessionEvent::Signal(None) => return Err(StreamError::Closed),
                SessionEvent::Record(Some(record)) => {
                    self.unsent.push_back(record);
                    self.fill_batch().await;
                }
                SessionEvent::Record(None) => return Ok(()),
            }
        }
    }

    /// Tops up the current batch with records arriving within the linger
    /// window.
    async fn fill_batch(&mut self) {
        if !self.batching {
            return;
        }
        let deadline = Instant::now() + self.batch_linger;
        while self.unsent.len() < self.batch_size {
            match self.receiver.try_recv() {
                Ok(record) => self.unsent.push_back(record),
                Err(TryRecvError::Disconnected) => return,
                Err(TryRecvError::Empty) => {
                    match tokio::time::timeout_at(deadline, self.receiver.recv()).await {
                        Ok(Some(record)) => self.unsent.push_back(record),
                        Ok(None) | Err(_) => return,
                    }
                }
            }
        }
    }

    /// Sends the oldest unsent records as one batch. Returns `Ok(false)` if
    /// cancelled mid-send. Failed batches go back to the front of the queue.
    async fn send_batch(&mut self, stream: &mut dyn SpanStream) -> Result<bool, StreamError> {
        let size = if self.batching {
            self.batch_size.min(self.unsent.len())
        } else {
            1
        };
        let batch = SpanBatch {
            spans: self.unsent.drain(..size).collect(),
        };

        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            result = stream.send(&batch) => Some(result),
        };

        match result {
            Some(Ok(())) => {
                let sent = batch.len();
                self.stats
                    .increment_by(names::SPAN_SENT, u64::try_from(sent).unwrap_or(u64::MAX));
                self.pending
                    .send_modify(|pending| *pending = pending.saturating_sub(sent));
                Ok(true)
            }
            Some(Err(err)) => {
                self.requeue(batch);
                Err(err)
            }
            None => {
                self.requeue(batch);
                Ok(false)
            }
        }
    }

    fn requeue(&mut self, batch: SpanBatch) {
        for record in batch.spans.into_iter().rev() {
            self.unsent.push_front(record);
        }
    }
}

/// Holds the process's single active [`SpanStreamer`].
///
/// Restarting always stops the previous streamer before the next one is
/// created, so two streamers never deliver to the same endpoint at once.
#[derive(Debug, Default)]
pub struct SpanStreamerSlot {
    current: RwLock<Option<Arc<SpanStreamer>>>,
    restart: TokioMutex<()>,
}

impl SpanStreamerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<SpanStreamer>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Queues a record on the active streamer. Records are dropped while no
    /// streamer is running.
    pub fn enqueue(&self, record: SpanRecord) -> bool {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|streamer| streamer.enqueue(record))
    }

    pub async fn flush(&self, timeout: Duration) -> bool {
        match self.current() {
            Some(streamer) => streamer.flush(timeout).await,
            None => true,
        }
    }

    /// Stops the active streamer, then installs the one built by `start`.
    pub async fn restart<F>(&self, start: F)
    where
        F: FnOnce() -> SpanStreamer,
    {
        let _guard = self.restart.lock().await;
        let previous = self.take();
        if let Some(previous) = previous {
            previous.stop().await;
        }
        let streamer = Arc::new(start());
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(streamer);
    }

    pub async fn stop(&self) {
        let _guard = self.restart.lock().await;
        if let Some(previous) = self.take() {
            previous.stop().await;
        }
    }

    fn take(&self) -> Option<Arc<SpanStreamer>> {
        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
