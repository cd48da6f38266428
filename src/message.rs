//! Inbound message model and the per-delivery dispatch context.

use lapin::types::{AMQPValue, ShortString};
use lapin::BasicProperties;
use std::collections::BTreeMap;

/// Header carrying the identifier that correlates redeliveries of one logical message.
pub const MESSAGE_ID_HEADER: &str = "x-message-id";
/// Header added to dead-lettered messages with the accumulated failure description.
pub const ERROR_DETAILS_HEADER: &str = "x-error-details";
/// Header naming the queue a dead-lettered or audited message was consumed from.
pub const SOURCE_QUEUE_HEADER: &str = "x-source-queue";
/// RFC 3339 time at which the message was dead-lettered.
pub const DEAD_LETTER_TIME_HEADER: &str = "x-dead-letter-time";
/// RFC 3339 time at which an audited message was handled.
pub const AUDIT_HANDLED_TIME_HEADER: &str = "x-audit-handled-time";
/// Queue an audited message was handled from.
pub const AUDIT_SOURCE_QUEUE_HEADER: &str = "x-audit-source-queue";

/// Name of the context flag set during a second-level delivery attempt.
pub const DISPATCH_AS_FAILED_KEY: &str = "dispatch-as-failed-message";

/// A message as received from the transport. Body and headers are opaque to
/// the retry logic except for the message identifier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportMessage {
    /// Scalar headers rendered as text.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    /// AMQP properties as delivered, including headers of every type.
    pub properties: BasicProperties,
}

impl TransportMessage {
    pub fn new(headers: BTreeMap<String, String>, body: Vec<u8>) -> Self {
        Self {
            headers,
            body,
            properties: BasicProperties::default(),
        }
    }

    /// Builds a message with only the identifier header set.
    pub fn with_id(message_id: impl Into<String>, body: Vec<u8>) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(MESSAGE_ID_HEADER.to_string(), message_id.into());
        Self::new(headers, body)
    }

    pub fn with_properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Returns the message identifier, or `None` when it is absent or blank.
    pub fn message_id(&self) -> Option<&str> {
        self.headers
            .get(MESSAGE_ID_HEADER)
            .map(String::as_str)
            .filter(|id| !id.trim().is_empty())
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Properties for republishing this message elsewhere.
    ///
    /// The delivered header table is kept as is, text headers missing from it
    /// are added, and `extra` headers are set last.
    pub fn outgoing_properties(&self, extra: &[(&str, String)]) -> BasicProperties {
        let mut table = self.properties.headers().clone().unwrap_or_default();
        for (key, value) in &self.headers {
            let key = ShortString::from(key.as_str());
            if !table.inner().contains_key(&key) {
                table.insert(key, AMQPValue::LongString(value.clone().into()));
            }
        }
        for (key, value) in extra {
            table.insert((*key).into(), AMQPValue::LongString(value.clone().into()));
        }
        self.properties.clone().with_headers(table)
    }
}

/// Context handed to the business dispatch for one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchContext {
    pub message_id: String,
    /// Set when the message exhausted its first-level attempts and is being
    /// dispatched through the failure path.
    pub dispatch_as_failed: bool,
}

impl DispatchContext {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            dispatch_as_failed: false,
        }
    }

    pub fn as_failed(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            dispatch_as_failed: true,
        }
    }
}
