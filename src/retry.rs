//! Retry configuration for message processing.

use crate::error::ConsumerError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Suffix appended to a message identifier to track its second-level attempts.
pub const SECOND_LEVEL_SUFFIX: &str = "-2nd-level";

/// Settings for the delivery-attempt retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryStrategySettings {
    /// Failed attempts after which a message is considered to have failed too many times.
    pub max_delivery_attempts: u32,
    /// Whether an exhausted message gets another round of attempts on the failure path
    /// before it is dead-lettered.
    pub second_level_retries_enabled: bool,
    /// Queue that dead-lettered messages are moved to.
    pub error_queue_name: String,
    /// Keep consuming without writing each dispatch failure to the log.
    pub continue_without_error_log: bool,
    /// Tracked failures older than this are forgotten.
    pub error_tracking_max_age: Duration,
}

impl RetryStrategySettings {
    /// Default number of attempts before a message goes to the error queue.
    pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 5;
    pub const DEFAULT_ERROR_QUEUE_NAME: &'static str = "error";

    pub fn new(max_delivery_attempts: u32) -> Self {
        Self {
            max_delivery_attempts,
            ..Self::default()
        }
    }

    pub fn with_second_level_retries(mut self, enabled: bool) -> Self {
        self.second_level_retries_enabled = enabled;
        self
    }

    pub fn with_error_queue_name(mut self, name: impl Into<String>) -> Self {
        self.error_queue_name = name.into();
        self
    }

    pub fn with_continue_without_error_log(mut self, enabled: bool) -> Self {
        self.continue_without_error_log = enabled;
        self
    }

    pub fn with_error_tracking_max_age(mut self, max_age: Duration) -> Self {
        self.error_tracking_max_age = max_age;
        self
    }

    /// Rejects settings the coordinator cannot work with.
    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.max_delivery_attempts == 0 {
            return Err("max_delivery_attempts must be at least 1".into());
        }
        if self.error_queue_name.trim().is_empty() {
            return Err("error_queue_name must not be empty".into());
        }
        Ok(())
    }
}

impl Default for RetryStrategySettings {
    fn default() -> Self {
        Self {
            max_delivery_attempts: Self::DEFAULT_MAX_DELIVERY_ATTEMPTS,
            second_level_retries_enabled: false,
            error_queue_name: Self::DEFAULT_ERROR_QUEUE_NAME.to_string(),
            continue_without_error_log: false,
            error_tracking_max_age: Duration::from_secs(10 * 60),
        }
    }
}

/// Derives the identifier used to track second-level attempts of `message_id`.
pub fn second_level_id(message_id: &str) -> String {
    format!("{}{}", message_id, SECOND_LEVEL_SUFFIX)
}
