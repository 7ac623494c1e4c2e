// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Boxed error returned by user-registered callbacks.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid status code or range '{0}'")]
    StatusCode(String),
}

/// Errors surfaced by span stream connections
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Failed to connect to span endpoint: {0}")]
    Connect(String),

    #[error("Failed to send span batch: {0}")]
    Send(String),

    #[error("Span stream closed by remote endpoint")]
    Closed,

    #[error("Unexpected message on span stream: {0}")]
    Protocol(String),

    #[error("Failed to serialize span batch: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Structural misuse of the per-context transaction and segment stacks
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StackError {
    #[error("Underflow in transaction stack")]
    TransactionUnderflow,

    #[error("Underflow in segment stack of transaction '{0}'")]
    SegmentUnderflow(String),

    #[error("No transaction is running in this context")]
    NoTransaction,
}

/// Failure to hand a harvested payload to the transport
#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    #[error("Failed to transmit {payload}: {reason}")]
    Transport { payload: &'static str, reason: String },
}
