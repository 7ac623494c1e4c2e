// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::metrics::names::UNKNOWN;
use crate::transaction::request::{referer_from_request, uri_from_request, RequestInfo};
use crate::transaction::TransactionType;
use crate::Attributes;

pub const NO_STACK_TRACE: &str = "<no stack trace>";

pub const ATTR_ERROR_CLASS: &str = "error.class";
pub const ATTR_ERROR_MESSAGE: &str = "error.message";
pub const ATTR_ERROR_EXPECTED: &str = "error.expected";
pub const ATTR_ERROR_GROUP: &str = "error.group.name";
pub const ATTR_REQUEST_URI: &str = "request.uri";
pub const ATTR_REQUEST_REFERER: &str = "request.headers.referer";

static NEXT_ERROR_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a captured error. Clones of a
/// [`CapturedError`] share the same id and count as the same instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ErrorId(u64);

/// An application error as handed to the collector by instrumentation.
#[derive(Debug, Clone)]
pub struct CapturedError {
    id: ErrorId,
    class_name: String,
    message: String,
    backtrace: Option<Vec<String>>,
    status_code: Option<u16>,
}

impl CapturedError {
    pub fn new(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: ErrorId(NEXT_ERROR_ID.fetch_add(1, Ordering::Relaxed)),
            class_name: class_name.into(),
            message: message.into(),
            backtrace: None,
            status_code: None,
        }
    }

    /// Captures a Rust error, using its type name as the error class.
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + 'static,
    {
        Self::new(std::any::type_name::<E>(), err.to_string())
    }

    #[must_use]
    pub fn with_backtrace(mut self, frames: Vec<String>) -> Self {
        self.backtrace = Some(frames);
        self
    }

    #[must_use]
    pub fn with_status_code(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    pub fn id(&self) -> ErrorId {
        self.id
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn backtrace(&self) -> Option<&[String]> {
        self.backtrace.as_deref()
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }
}

/// Options accompanying a noticed error.
#[derive(Debug, Clone, Default)]
pub struct NoticeOptions {
    /// Blamed metric, normally the transaction name.
    pub metric: Option<String>,
    pub uri: Option<String>,
    pub referer: Option<String>,
    pub request_params: Attributes,
    pub custom_params: Attributes,
    pub expected: bool,
    /// Extra agent attributes attached to the error.
    pub attributes: Option<Attributes>,
    pub(crate) transaction_type: Option<TransactionType>,
    /// Identity of the owning transaction, copied into the error's intrinsic
    /// attributes.
    pub(crate) intrinsics: Attributes,
}

impl NoticeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn metric(mut self, metric: impl Into<String>) -> Self {
        self.metric = Some(metric.into());
        self
    }

    #[must_use]
    pub fn expected(mut self, expected: bool) -> Self {
        self.expected = expected;
        self
    }

    #[must_use]
    pub fn custom_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.custom_params.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = Some(attributes);
        self
    }

    /// Extracts the URI and referer from a request adapter.
    #[must_use]
    pub fn request(mut self, request: &dyn RequestInfo) -> Self {
        self.uri = uri_from_request(request);
        self.referer = referer_from_request(request);
        self
    }

    pub(crate) fn in_transaction(mut self, transaction_type: TransactionType) -> Self {
        self.transaction_type = Some(transaction_type);
        self
    }

    pub(crate) fn intrinsic(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.intrinsics.insert(key.to_string(), value.into());
        self
    }

    pub(crate) fn transaction_type(&self) -> Option<TransactionType> {
        self.transaction_type
    }
}

/// Intrinsic and custom attributes of one error event.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ErrorEvent {
    pub intrinsics: Attributes,
    pub custom_attributes: Attributes,
    pub agent_attributes: Attributes,
}

/// An error that passed every filter and is ready to be reported.
#[derive(Debug, Clone)]
pub struct NoticedError {
    pub metric_name: String,
    pub class_name: String,
    pub message: String,
    pub timestamp: SystemTime,
    pub expected: bool,
    pub request_uri: Option<String>,
    pub stack_trace: Vec<String>,
    pub error_group: Option<String>,
    pub(crate) exception_id: ErrorId,
    custom_attributes: Attributes,
    agent_attributes: Attributes,
    intrinsic_attributes: Attributes,
    attributes_from_notice_error: Attributes,
}

impl NoticedError {
    pub(crate) fn new(error: &CapturedError, options: &NoticeOptions, stack_trace: Vec<String>) -> Self {
        let mut agent_attributes = options.attributes.clone().unwrap_or_default();
        if let Some(uri) = &options.uri {
            agent_attributes.insert(ATTR_REQUEST_URI.to_string(), Value::from(uri.as_str()));
        }
        if let Some(referer) = &options.referer {
            agent_attributes.insert(
                ATTR_REQUEST_REFERER.to_string(),
                Value::from(referer.as_str()),
            );
        }
        for (key, value) in &options.request_params {
            agent_attributes.insert(format!("request.parameters.{key}"), value.clone());
        }

        Self {
            metric_name: options.metric.clone().unwrap_or_else(|| UNKNOWN.to_string()),
            class_name: error.class_name().to_string(),
            message: error.message().to_string(),
            timestamp: SystemTime::now(),
            expected: options.expected,
            request_uri: options.uri.clone(),
            stack_trace,
            error_group: None,
            exception_id: error.id(),
            custom_attributes: options.custom_params.clone(),
            agent_attributes,
            intrinsic_attributes: options.intrinsics.clone(),
            attributes_from_notice_error: Attributes::new(),
        }
    }

    pub fn custom_attributes(&self) -> &Attributes {
        &self.custom_attributes
    }

    pub fn agent_attributes(&self) -> &Attributes {
        &self.agent_attributes
    }

    pub fn intrinsic_attributes(&self) -> &Attributes {
        &self.intrinsic_attributes
    }

    pub(crate) fn set_error_group(&mut self, group: String) {
        self.agent_attributes
            .insert(ATTR_ERROR_GROUP.to_string(), Value::from(group.as_str()));
        self.error_group = Some(group);
    }

    /// Error attributes destined for span records. Empty until
    /// [`build_error_attributes`](Self::build_error_attributes) runs.
    pub fn attributes_from_notice_error(&self) -> &Attributes {
        &self.attributes_from_notice_error
    }

    pub fn build_error_attributes(&mut self) {
        if !self.attributes_from_notice_error.is_empty() {
            return;
        }
        let attrs = &mut self.attributes_from_notice_error;
        attrs.insert(ATTR_ERROR_CLASS.to_string(), Value::from(self.class_name.as_str()));
        attrs.insert(ATTR_ERROR_MESSAGE.to_string(), Value::from(self.message.as_str()));
        if self.expected {
            attrs.insert(ATTR_ERROR_EXPECTED.to_string(), Value::Bool(true));
        }
    }

    fn timestamp_secs(&self) -> f64 {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default()
    }

    pub(crate) fn build_intrinsics(&self) -> Attributes {
        let mut intrinsics = self.intrinsic_attributes.clone();
        intrinsics.insert("type".to_string(), Value::from("TransactionError"));
        intrinsics.insert(ATTR_ERROR_CLASS.to_string(), Value::from(self.class_name.as_str()));
        intrinsics.insert(ATTR_ERROR_MESSAGE.to_string(), Value::from(self.message.as_str()));
        intrinsics.insert(ATTR_ERROR_EXPECTED.to_string(), Value::Bool(self.expected));
        intrinsics.insert("timestamp".to_string(), json!(self.timestamp_secs()));
        intrinsics.insert(
            "transactionName".to_string(),
            Value::from(self.metric_name.as_str()),
        );
        intrinsics
    }

    pub fn to_event(&self) -> ErrorEvent {
        ErrorEvent {
            intrinsics: self.build_intrinsics(),
            custom_attributes: self.custom_attributes.clone(),
            agent_attributes: self.agent_attributes.clone(),
        }
    }

    /// Error trace in the collector's array layout:
    /// `[timestamp_ms, path, message, class, params]`.
    pub fn to_collector_array(&self) -> Value {
        let mut intrinsics = self.intrinsic_attributes.clone();
        intrinsics.insert(ATTR_ERROR_EXPECTED.to_string(), Value::Bool(self.expected));
        json!([
            (self.timestamp_secs() * 1000.0).round(),
            self.metric_name,
            self.message,
            self.class_name,
            {
                "stack_trace": self.stack_trace,
                "agentAttributes": self.agent_attributes,
                "userAttributes": self.custom_attributes,
                "intrinsics": intrinsics,
            }
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Boom;

    impl std::fmt::Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "boom")
        }
    }

    impl std::error::Error for Boom {}

    #[test]
    fn test_captured_error_identity() {
        let a = CapturedError::new("RuntimeError", "bad");
        let b = CapturedError::new("RuntimeError", "bad");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), a.clone().id());
    }

    #[test]
    fn test_from_error_uses_type_name() {
        let captured = CapturedError::from_error(&Boom);
        assert!(captured.class_name().ends_with("Boom"));
        assert_eq!(captured.message(), "boom");
    }

    #[test]
    fn test_error_attributes_are_deferred() {
        let error = CapturedError::new("StandardError", "Oops!");
        let mut noticed = NoticedError::new(&error, &NoticeOptions::new(), Vec::new());
        assert!(noticed.attributes_from_notice_error().is_empty());

        noticed.build_error_attributes();

        let attrs = noticed.attributes_from_notice_error();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[ATTR_ERROR_CLASS], "StandardError");
        assert_eq!(attrs[ATTR_ERROR_MESSAGE], "Oops!");
    }

    #[test]
    fn test_expected_flag_in_all_exports() {
        let error = CapturedError::new("StandardError", "Oops!");
        let mut noticed =
            NoticedError::new(&error, &NoticeOptions::new().expected(true), Vec::new());
        noticed.build_error_attributes();

        assert_eq!(noticed.attributes_from_notice_error()[ATTR_ERROR_EXPECTED], true);
        assert_eq!(noticed.to_event().intrinsics[ATTR_ERROR_EXPECTED], true);
        assert_eq!(
            noticed.to_collector_array()[4]["intrinsics"][ATTR_ERROR_EXPECTED],
            true
        );
        assert!(!noticed.custom_attributes().contains_key("expected"));
    }

    #[test]
    fn test_unexpected_flag_is_false_not_missing() {
        let error = CapturedError::new("StandardError", "Oops!");
        let noticed = NoticedError::new(&error, &NoticeOptions::new(), Vec::new());
        assert_eq!(noticed.to_event().intrinsics[ATTR_ERROR_EXPECTED], false);
    }

    #[test]
    fn test_request_details_become_agent_attributes() {
        let error = CapturedError::new("StandardError", "Oops!");
        let mut options = NoticeOptions::new().metric("Controller/users/show");
        options.uri = Some("/users/1".to_string());
        options
            .request_params
            .insert("id".to_string(), Value::from("1"));
        let noticed = NoticedError::new(&error, &options, Vec::new());

        assert_eq!(noticed.metric_name, "Controller/users/show");
        assert_eq!(noticed.agent_attributes()[ATTR_REQUEST_URI], "/users/1");
        assert_eq!(noticed.agent_attributes()["request.parameters.id"], "1");
        assert_eq!(noticed.to_event().intrinsics["transactionName"], "Controller/users/show");
    }
}
