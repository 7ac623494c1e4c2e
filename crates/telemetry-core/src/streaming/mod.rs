// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Live span streaming to a remote collector.

pub mod connection;
pub mod span;
pub mod streamer;

pub use connection::{SpanStream, SpanStreamConnector, StreamSignal, WebSocketConnector};
pub use span::{SpanBatch, SpanContext, SpanRecord};
pub use streamer::{SpanStreamer, SpanStreamerSlot, StreamerState};
