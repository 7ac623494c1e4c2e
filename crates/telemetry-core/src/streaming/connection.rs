// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transport seam of the span streamer.
//!
//! A [`SpanStreamConnector`] opens bidirectional [`SpanStream`]s. The
//! streamer sends [`SpanBatch`]es down the stream and reads
//! [`StreamSignal`]s coming back, which is how the endpoint applies flow
//! control.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::errors::StreamError;
use crate::streaming::span::SpanBatch;

/// Message received from the span endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSignal {
    /// Stop sending until [`StreamSignal::Resume`] arrives.
    Pause,
    Resume,
    /// Periodic acknowledgement of the spans the endpoint has received.
    Ack { messages_seen: u64 },
}

#[async_trait]
pub trait SpanStream: Send {
    async fn send(&mut self, batch: &SpanBatch) -> Result<(), StreamError>;

    /// Waits for the next message from the endpoint. Returns `None` once the
    /// stream has been closed. Dropping the returned future before it
    /// completes must not lose a message.
    async fn next_signal(&mut self) -> Option<Result<StreamSignal, StreamError>>;

    async fn close(&mut self);
}

#[async_trait]
pub trait SpanStreamConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn SpanStream>, StreamError>;
}

#[derive(Deserialize)]
struct AckMessage {
    messages_seen: u64,
}

fn parse_signal(text: &str) -> Result<StreamSignal, StreamError> {
    match text.trim() {
        "pause" => Ok(StreamSignal::Pause),
        "resume" => Ok(StreamSignal::Resume),
        other => serde_json::from_str::<AckMessage>(other)
            .map(|ack| StreamSignal::Ack {
                messages_seen: ack.messages_seen,
            })
            .map_err(|_| StreamError::Protocol(other.to_string())),
    }
}

/// Connects to a span endpoint over WebSocket. Batches travel as JSON text
/// frames; the endpoint answers with `pause`, `resume` or
/// `{"messages_seen": n}` text frames.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    endpoint: String,
}

impl WebSocketConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl SpanStreamConnector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn SpanStream>, StreamError> {
        let (socket, _) = connect_async(self.endpoint.as_str())
            .await
            .map_err(|err| StreamError::Connect(err.to_string()))?;
        debug!("Connected to span endpoint {}", self.endpoint);
        Ok(Box::new(WebSocketSpanStream { socket }))
    }
}

struct WebSocketSpanStream {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl SpanStream for WebSocketSpanStream {
    async fn send(&mut self, batch: &SpanBatch) -> Result<(), StreamError> {
        let payload = serde_json::to_string(batch)?;
        self.socket
            .send(WsMessage::Text(payload))
            .await
            .map_err(|err| StreamError::Send(err.to_string()))
    }

    async fn next_signal(&mut self) -> Option<Result<StreamSignal, StreamError>> {
        loop {
            match self.socket.next().await? {
                Ok(WsMessage::Text(text)) => return Some(parse_signal(&text)),
                // Pings are answered by the protocol layer on the next write.
                Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Binary(_) | WsMessage::Frame(_)) => {}
                Ok(WsMessage::Close(_)) => return None,
                Err(err) => return Some(Err(StreamError::Protocol(err.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.socket.close(None).await {
            debug!("Error closing span stream: {err}");
        }
    }
}
