//! Per-message failure tracking.

use crate::error::ConsumerError;
use crate::retry::{RetryStrategySettings, SECOND_LEVEL_SUFFIX};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One recorded delivery failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedError {
    pub error: String,
    pub time: DateTime<Utc>,
}

impl TrackedError {
    pub fn new(error: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            error: error.into(),
            time,
        }
    }
}

/// Stores failure history keyed by tracking identifier.
///
/// Redelivered copies of the same message may be handled by different workers
/// at the same time, so implementations must make every call atomic per identifier.
pub trait ErrorTracker: Send + Sync {
    /// Appends a failure to the record of `message_id`, creating the record if needed.
    fn register_error(&self, message_id: &str, error: &ConsumerError);

    /// True once the record of `message_id` holds the configured number of failures.
    fn has_failed_too_many_times(&self, message_id: &str) -> bool;

    /// One-line summary, empty when there is no record.
    fn short_error_description(&self, message_id: &str) -> String;

    /// Summary plus every recorded failure, empty when there is no record.
    fn full_error_description(&self, message_id: &str) -> String;

    fn exceptions(&self, message_id: &str) -> Vec<TrackedError>;

    /// Discards the record of `message_id`. No-op when absent.
    fn clean_up(&self, message_id: &str);
}

/// Process-local tracker backed by a mutex-guarded map.
pub struct InMemoryErrorTracker {
    max_delivery_attempts: usize,
    max_age: chrono::Duration,
    errors: Mutex<HashMap<String, Vec<TrackedError>>>,
}

impl InMemoryErrorTracker {
    pub fn new(settings: &RetryStrategySettings) -> Self {
        let max_age = chrono::Duration::from_std(settings.error_tracking_max_age)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        Self {
            max_delivery_attempts: settings.max_delivery_attempts as usize,
            max_age,
            errors: Mutex::new(HashMap::new()),
        }
    }

    /// Number of identifiers with a live record.
    pub fn tracked_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<TrackedError>>> {
        self.errors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register_error_at(&self, message_id: &str, error: &ConsumerError, now: DateTime<Utc>) {
        let mut errors = self.lock();
        Self::expire_stale(&mut errors, primary_id(message_id), now - self.max_age);
        errors
            .entry(message_id.to_string())
            .or_default()
            .push(TrackedError::new(error.to_string(), now));
    }

    /// Drops records whose message saw no failure since `cutoff`. A primary
    /// identifier and its second-level partner expire together, aged by the
    /// newer of the two. The group of `keep` is being refreshed and stays.
    fn expire_stale(
        errors: &mut HashMap<String, Vec<TrackedError>>,
        keep: &str,
        cutoff: DateTime<Utc>,
    ) {
        let mut newest: HashMap<&str, DateTime<Utc>> = HashMap::new();
        for (id, record) in errors.iter() {
            if let Some(last) = record.last() {
                let entry = newest.entry(primary_id(id)).or_insert(last.time);
                if last.time > *entry {
                    *entry = last.time;
                }
            }
        }
        let stale: HashSet<String> = newest
            .into_iter()
            .filter(|(id, time)| *id != keep && *time < cutoff)
            .map(|(id, _)| id.to_string())
            .collect();

        if !stale.is_empty() {
            errors.retain(|id, _| !stale.contains(primary_id(id)));
        }
    }
}

/// The first-level identifier a tracking identifier belongs to.
fn primary_id(tracking_id: &str) -> &str {
    tracking_id.strip_suffix(SECOND_LEVEL_SUFFIX).unwrap_or(tracking_id)
}

impl ErrorTracker for InMemoryErrorTracker {
    fn register_error(&self, message_id: &str, error: &ConsumerError) {
        self.register_error_at(message_id, error, Utc::now());
    }

    fn has_failed_too_many_times(&self, message_id: &str) -> bool {
        self.lock()
            .get(message_id)
            .is_some_and(|record| record.len() >= self.max_delivery_attempts)
    }

    fn short_error_description(&self, message_id: &str) -> String {
        match self.lock().get(message_id) {
            Some(record) => format!("{} unhandled exceptions", record.len()),
            None => String::new(),
        }
    }

    fn full_error_description(&self, message_id: &str) -> String {
        let errors = self.lock();
        let Some(record) = errors.get(message_id) else {
            return String::new();
        };

        let mut description = format!("{} unhandled exceptions", record.len());
        for failure in record {
            description.push('\n');
            description.push_str(&format!("{}: {}", failure.time.to_rfc3339(), failure.error));
        }
        description
    }

    fn exceptions(&self, message_id: &str) -> Vec<TrackedError> {
        self.lock().get(message_id).cloned().unwrap_or_default()
    }

    fn clean_up(&self, message_id: &str) {
        self.lock().remove(message_id);
    }
}

/// Tracker that records nothing. With it the coordinator never dead-letters
/// by attempt count, so poison messages are only stopped by a redelivery
/// limit enforced by the broker.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopErrorTracker;

impl ErrorTracker for NoopErrorTracker {
    fn register_error(&self, _message_id: &str, _error: &ConsumerError) {}

    fn has_failed_too_many_times(&self, _message_id: &str) -> bool {
        false
    }

    fn short_error_description(&self, _message_id: &str) -> String {
        String::new()
    }

    fn full_error_description(&self, _message_id: &str) -> String {
        String::new()
    }

    fn exceptions(&self, _message_id: &str) -> Vec<TrackedError> {
        Vec::new()
    }

    fn clean_up(&self, _message_id: &str) {}
}

/// Picks the tracker for a consumer: failures are tracked only while message
/// auditing is enabled.
pub fn tracker_for(
    message_auditing_enabled: bool,
    settings: &RetryStrategySettings,
) -> Arc<dyn ErrorTracker> {
    if message_auditing_enabled {
        Arc::new(InMemoryErrorTracker::new(settings))
    } else {
        log::warn!(
            "Message auditing is disabled: delivery failures are not tracked and messages will \
             not be dead-lettered after {} attempts. Configure a delivery limit on the broker to \
             stop poison messages from being redelivered forever.",
            settings.max_delivery_attempts
        );
        Arc::new(NoopErrorTracker)
    }
}
