//! Retry coordinator: decides per delivery whether to dispatch normally,
//! dispatch on the failure path, or dead-letter the message.

use crate::dlq::{DeadLetterSink, FailureReport};
use crate::error::ConsumerError;
use crate::message::{DispatchContext, TransportMessage, MESSAGE_ID_HEADER};
use crate::retry::{second_level_id, RetryStrategySettings};
use crate::tracker::{ErrorTracker, TrackedError};
use crate::unit_of_work::UnitOfWork;
use futures_util::FutureExt;
use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

/// Result of handling one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Dispatch succeeded and the unit of work was committed.
    Committed,
    /// Dispatch failed; the failure was recorded and the unit of work aborted
    /// so the transport redelivers the message.
    Failed,
    /// The message was handed to the dead-letter sink.
    DeadLettered,
}

/// Wraps every delivery in failure tracking and moves poison messages to the
/// dead-letter sink once they have failed too many times.
#[derive(Clone)]
pub struct RetryCoordinator {
    settings: RetryStrategySettings,
    tracker: Arc<dyn ErrorTracker>,
    dead_letter: Arc<dyn DeadLetterSink>,
    dead_lettering: Arc<Mutex<HashSet<String>>>,
}

/// Marks a message identifier as being dead-lettered until dropped.
struct DeadLetterClaim {
    claims: Arc<Mutex<HashSet<String>>>,
    message_id: String,
}

impl DeadLetterClaim {
    fn acquire(claims: &Arc<Mutex<HashSet<String>>>, message_id: &str) -> Option<Self> {
        let inserted = claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message_id.to_string());
        inserted.then(|| Self {
            claims: Arc::clone(claims),
            message_id: message_id.to_string(),
        })
    }
}

impl Drop for DeadLetterClaim {
    fn drop(&mut self) {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.message_id);
    }
}

impl RetryCoordinator {
    pub fn new(
        settings: RetryStrategySettings,
        tracker: Arc<dyn ErrorTracker>,
        dead_letter: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            settings,
            tracker,
            dead_letter,
            dead_lettering: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn settings(&self) -> &RetryStrategySettings {
        &self.settings
    }

    pub fn tracker(&self) -> &Arc<dyn ErrorTracker> {
        &self.tracker
    }

    /// Runs one delivery attempt of `message` through the retry policy.
    ///
    /// `deliver` performs the business dispatch. Its errors and panics are
    /// recorded, never returned; the only error surfaced to the caller is a
    /// failure of the dead-letter sink.
    pub async fn handle_delivery<F, Fut>(
        &self,
        message: &TransportMessage,
        unit_of_work: &mut dyn UnitOfWork,
        deliver: F,
    ) -> Result<DeliveryOutcome, ConsumerError>
    where
        F: FnOnce(DispatchContext) -> Fut,
        Fut: Future<Output = Result<(), ConsumerError>>,
    {
        let Some(message_id) = message.message_id() else {
            let description = format!(
                "Received message with empty or absent '{}' header! All messages must be supplied \
                 with an ID. Without one the message cannot be tracked between delivery attempts.",
                MESSAGE_ID_HEADER
            );
            log::error!("{}", description);
            self.move_to_dead_letter(message, unit_of_work, FailureReport::from_description(description))
                .await?;
            return Ok(DeliveryOutcome::DeadLettered);
        };

        if !self.tracker.has_failed_too_many_times(message_id) {
            let context = DispatchContext::new(message_id);
            return Ok(self
                .dispatch(deliver, context, unit_of_work, message_id, &[message_id])
                .await);
        }

        let second_level = second_level_id(message_id);
        let exhausted = !self.settings.second_level_retries_enabled
            || self.tracker.has_failed_too_many_times(&second_level);

        if exhausted {
            // Another copy of this message is already on its way to the error queue.
            let Some(_claim) = DeadLetterClaim::acquire(&self.dead_lettering, message_id) else {
                log::info!("Message {} is already being dead-lettered, returning this copy", message_id);
                unit_of_work.abort().await;
                return Ok(DeliveryOutcome::Failed);
            };
            return self
                .dead_letter_exhausted(message, unit_of_work, message_id, &second_level)
                .await;
        }

        log::info!("Dispatching message {} as failed (second-level retry)", message_id);
        let context = DispatchContext::as_failed(message_id);
        Ok(self
            .dispatch(
                deliver,
                context,
                unit_of_work,
                &second_level,
                &[message_id, second_level.as_str()],
            )
            .await)
    }

    /// Dead-letters a message whose attempts are used up and clears its records.
    async fn dead_letter_exhausted(
        &self,
        message: &TransportMessage,
        unit_of_work: &mut dyn UnitOfWork,
        message_id: &str,
        second_level: &str,
    ) -> Result<DeliveryOutcome, ConsumerError> {
        let report = self.failure_report_for(message_id);
        if self.settings.second_level_retries_enabled {
            log::error!(
                "Moving message {} to the error queue after second-level retries: {}",
                message_id,
                report.description
            );
        } else {
            log::error!("Moving message {} to the error queue: {}", message_id, report.description);
        }
        self.move_to_dead_letter(message, unit_of_work, report).await?;
        self.tracker.clean_up(message_id);
        if self.settings.second_level_retries_enabled {
            self.tracker.clean_up(second_level);
        }
        Ok(DeliveryOutcome::DeadLettered)
    }

    /// Newline-joined failure descriptions of `message_id` and, when it has a
    /// record, its second-level identifier.
    pub fn error_description_for(&self, message_id: &str, brief: bool) -> String {
        let second_level = second_level_id(message_id);
        let (first, second) = if brief {
            (
                self.tracker.short_error_description(message_id),
                self.tracker.short_error_description(&second_level),
            )
        } else {
            (
                self.tracker.full_error_description(message_id),
                self.tracker.full_error_description(&second_level),
            )
        };

        if second.is_empty() {
            first
        } else {
            format!("{}\n{}", first, second)
        }
    }

    /// Failures of `message_id` followed by those of its second-level identifier.
    pub fn exceptions_for(&self, message_id: &str) -> Vec<TrackedError> {
        let mut errors = self.tracker.exceptions(message_id);
        errors.extend(self.tracker.exceptions(&second_level_id(message_id)));
        errors
    }

    fn failure_report_for(&self, message_id: &str) -> FailureReport {
        FailureReport::new(
            self.error_description_for(message_id, false),
            self.exceptions_for(message_id),
        )
    }

    async fn dispatch<F, Fut>(
        &self,
        deliver: F,
        context: DispatchContext,
        unit_of_work: &mut dyn UnitOfWork,
        track_by: &str,
        clear_on_success: &[&str],
    ) -> DeliveryOutcome
    where
        F: FnOnce(DispatchContext) -> Fut,
        Fut: Future<Output = Result<(), ConsumerError>>,
    {
        let dispatched = AssertUnwindSafe(async move { deliver(context).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ConsumerError::HandlerPanicked(panic_message(panic.as_ref()))));

        let result = match dispatched {
            Ok(()) => unit_of_work.commit().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                for id in clear_on_success {
                    self.tracker.clean_up(id);
                }
                DeliveryOutcome::Committed
            }
            Err(e) => {
                if self.settings.continue_without_error_log {
                    log::debug!("Delivery of {} failed: {}", track_by, e);
                } else {
                    log::warn!("Delivery of {} failed: {}", track_by, e);
                }
                self.tracker.register_error(track_by, &e);
                unit_of_work.abort().await;
                DeliveryOutcome::Failed
            }
        }
    }

    async fn move_to_dead_letter(
        &self,
        message: &TransportMessage,
        unit_of_work: &mut dyn UnitOfWork,
        report: FailureReport,
    ) -> Result<(), ConsumerError> {
        self.dead_letter
            .move_to_dead_letter(message, unit_of_work, &report)
            .await
            .map_err(|e| {
                log::error!("Failed to move message to the error queue: {}", e);
                match e {
                    ConsumerError::DlqError(_) => e,
                    other => ConsumerError::DlqError(other.to_string()),
                }
            })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::InMemoryDeadLetterSink;
    use crate::tracker::{InMemoryErrorTracker, NoopErrorTracker};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct RecordingUnitOfWork {
        commits: usize,
        aborts: usize,
        fail_commit: bool,
    }

    #[async_trait]
    impl UnitOfWork for RecordingUnitOfWork {
        async fn commit(&mut self) -> Result<(), ConsumerError> {
            if self.fail_commit {
                return Err(ConsumerError::CommitFailed("channel closed".to_string()));
            }
            self.commits += 1;
            Ok(())
        }

        async fn abort(&mut self) {
            self.aborts += 1;
        }

        fn is_completed(&self) -> bool {
            self.commits + self.aborts > 0
        }
    }

    /// Counts register_error calls per identifier on top of the in-memory tracker.
    struct CountingTracker {
        inner: InMemoryErrorTracker,
        registrations: Mutex<Vec<String>>,
    }

    impl CountingTracker {
        fn new(settings: &RetryStrategySettings) -> Self {
            Self {
                inner: InMemoryErrorTracker::new(settings),
                registrations: Mutex::new(Vec::new()),
            }
        }

        fn registrations(&self) -> Vec<String> {
            self.registrations.lock().unwrap().clone()
        }
    }

    impl ErrorTracker for CountingTracker {
        fn register_error(&self, message_id: &str, error: &ConsumerError) {
            self.registrations.lock().unwrap().push(message_id.to_string());
            self.inner.register_error(message_id, error);
        }

        fn has_failed_too_many_times(&self, message_id: &str) -> bool {
            self.inner.has_failed_too_many_times(message_id)
        }

        fn short_error_description(&self, message_id: &str) -> String {
            self.inner.short_error_description(message_id)
        }

        fn full_error_description(&self, message_id: &str) -> String {
            self.inner.full_error_description(message_id)
        }

        fn exceptions(&self, message_id: &str) -> Vec<TrackedError> {
            self.inner.exceptions(message_id)
        }

        fn clean_up(&self, message_id: &str) {
            self.inner.clean_up(message_id)
        }
    }

    struct FailingSink;

    #[async_trait]
    impl DeadLetterSink for FailingSink {
        async fn move_to_dead_letter(
            &self,
            _message: &TransportMessage,
            _unit_of_work: &mut dyn UnitOfWork,
            _report: &FailureReport,
        ) -> Result<(), ConsumerError> {
            Err(ConsumerError::DlqError("error queue unavailable".to_string()))
        }
    }

    /// Holds every dead-letter call until released, then delegates.
    struct GatedSink {
        gate: Arc<Notify>,
        inner: InMemoryDeadLetterSink,
    }

    #[async_trait]
    impl DeadLetterSink for GatedSink {
        async fn move_to_dead_letter(
            &self,
            message: &TransportMessage,
            unit_of_work: &mut dyn UnitOfWork,
            report: &FailureReport,
        ) -> Result<(), ConsumerError> {
            self.gate.notified().await;
            self.inner.move_to_dead_letter(message, unit_of_work, report).await
        }
    }

    struct Fixture {
        coordinator: RetryCoordinator,
        tracker: Arc<CountingTracker>,
        sink: Arc<InMemoryDeadLetterSink>,
    }

    fn fixture(settings: RetryStrategySettings) -> Fixture {
        let tracker = Arc::new(CountingTracker::new(&settings));
        let sink = Arc::new(InMemoryDeadLetterSink::new());
        let coordinator = RetryCoordinator::new(settings, tracker.clone(), sink.clone());
        Fixture {
            coordinator,
            tracker,
            sink,
        }
    }

    async fn failing(_context: DispatchContext) -> Result<(), ConsumerError> {
        Err(ConsumerError::from("database unavailable"))
    }

    async fn succeeding(_context: DispatchContext) -> Result<(), ConsumerError> {
        Ok(())
    }

    async fn deliver_failing(coordinator: &RetryCoordinator, message: &TransportMessage) -> DeliveryOutcome {
        let mut uow = RecordingUnitOfWork::default();
        coordinator.handle_delivery(message, &mut uow, failing).await.unwrap()
    }

    #[tokio::test]
    async fn missing_identifier_is_dead_lettered_without_dispatch() {
        let f = fixture(RetryStrategySettings::new(3));

        for message in [
            TransportMessage::default(),
            TransportMessage::with_id("", b"x".to_vec()),
            TransportMessage::with_id("   ", b"x".to_vec()),
        ] {
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = calls.clone();
            let mut uow = RecordingUnitOfWork::default();

            let outcome = f
                .coordinator
                .handle_delivery(&message, &mut uow, move |_ctx| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<(), ConsumerError>(()) }
                })
                .await
                .unwrap();

            assert_eq!(outcome, DeliveryOutcome::DeadLettered);
            assert_eq!(calls.load(Ordering::SeqCst), 0);
            assert_eq!(uow.commits, 1, "sink commits the unit of work");
        }

        let dead = f.sink.dead_letters().await;
        assert_eq!(dead.len(), 3);
        assert!(dead[0].report.description.contains(MESSAGE_ID_HEADER));
        assert!(f.tracker.registrations().is_empty());
    }

    #[tokio::test]
    async fn failure_below_threshold_registers_once_and_aborts() {
        let f = fixture(RetryStrategySettings::new(3));
        let message = TransportMessage::with_id("M", b"{}".to_vec());
        let mut uow = RecordingUnitOfWork::default();

        let outcome = f.coordinator.handle_delivery(&message, &mut uow, failing).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Failed);
        assert_eq!(f.tracker.registrations(), vec!["M".to_string()]);
        assert_eq!(uow.aborts, 1);
        assert_eq!(uow.commits, 0);
        assert!(f.sink.is_empty().await);
    }

    #[tokio::test]
    async fn exhausted_message_is_dead_lettered_without_second_level() {
        let f = fixture(RetryStrategySettings::new(3));
        let message = TransportMessage::with_id("M", b"{}".to_vec());

        for _ in 0..3 {
            assert_eq!(deliver_failing(&f.coordinator, &message).await, DeliveryOutcome::Failed);
        }
        assert!(f.tracker.has_failed_too_many_times("M"));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut uow = RecordingUnitOfWork::default();
        let outcome = f
            .coordinator
            .handle_delivery(&message, &mut uow, move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), ConsumerError>(()) }
            })
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::DeadLettered);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!f.tracker.has_failed_too_many_times("M"));
        assert!(f.tracker.exceptions("M").is_empty());

        let dead = f.sink.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert!(dead[0].report.description.starts_with("3 unhandled exceptions"));
        assert!(dead[0].report.description.contains("database unavailable"));
        assert_eq!(dead[0].report.errors.len(), 3);
    }

    #[tokio::test]
    async fn second_level_retries_dispatch_as_failed_then_dead_letter() {
        let f = fixture(RetryStrategySettings::new(2).with_second_level_retries(true));
        let message = TransportMessage::with_id("M", b"{}".to_vec());
        let flags = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..4 {
            let flags = flags.clone();
            let mut uow = RecordingUnitOfWork::default();
            let outcome = f
                .coordinator
                .handle_delivery(&message, &mut uow, move |ctx| {
                    flags.lock().unwrap().push(ctx.dispatch_as_failed);
                    async { Err::<(), ConsumerError>(ConsumerError::from("still broken")) }
                })
                .await
                .unwrap();
            assert_eq!(outcome, DeliveryOutcome::Failed);
            assert_eq!(uow.aborts, 1);
        }

        assert_eq!(*flags.lock().unwrap(), vec![false, false, true, true]);
        assert_eq!(
            f.tracker.registrations(),
            vec!["M", "M", "M-2nd-level", "M-2nd-level"]
        );
        assert!(f.tracker.has_failed_too_many_times("M-2nd-level"));

        let outcome = f
            .coordinator
            .handle_delivery(&message, &mut RecordingUnitOfWork::default(), succeeding)
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::DeadLettered);

        let dead = f.sink.dead_letters().await;
        assert_eq!(dead.len(), 1);
        let lines: Vec<&str> = dead[0].report.description.lines().collect();
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0], "2 unhandled exceptions");
        assert_eq!(lines[3], "2 unhandled exceptions");
        assert_eq!(dead[0].report.errors.len(), 4);

        assert!(!f.tracker.has_failed_too_many_times("M"));
        assert!(!f.tracker.has_failed_too_many_times("M-2nd-level"));
        assert!(f.tracker.exceptions("M-2nd-level").is_empty());
    }

    #[tokio::test]
    async fn success_on_second_level_clears_both_identifiers() {
        let f = fixture(RetryStrategySettings::new(2).with_second_level_retries(true));
        let message = TransportMessage::with_id("M", b"{}".to_vec());

        for _ in 0..3 {
            deliver_failing(&f.coordinator, &message).await;
        }
        assert_eq!(f.tracker.exceptions("M-2nd-level").len(), 1);

        let mut uow = RecordingUnitOfWork::default();
        let outcome = f.coordinator.handle_delivery(&message, &mut uow, succeeding).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Committed);
        assert_eq!(uow.commits, 1);
        assert!(f.tracker.exceptions("M").is_empty());
        assert!(f.tracker.exceptions("M-2nd-level").is_empty());
        assert!(f.sink.is_empty().await);
    }

    #[tokio::test]
    async fn success_on_first_level_clears_only_primary_identifier() {
        let f = fixture(RetryStrategySettings::new(3));
        let message = TransportMessage::with_id("M", b"{}".to_vec());
        f.tracker.register_error("M-2nd-level", &ConsumerError::from("stale"));

        deliver_failing(&f.coordinator, &message).await;
        let mut uow = RecordingUnitOfWork::default();
        let outcome = f.coordinator.handle_delivery(&message, &mut uow, succeeding).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Committed);
        assert!(f.tracker.exceptions("M").is_empty());
        assert_eq!(f.tracker.exceptions("M-2nd-level").len(), 1);
    }

    #[tokio::test]
    async fn failed_commit_keeps_tracker_state() {
        let f = fixture(RetryStrategySettings::new(3));
        let message = TransportMessage::with_id("M", b"{}".to_vec());
        deliver_failing(&f.coordinator, &message).await;

        let mut uow = RecordingUnitOfWork {
            fail_commit: true,
            ..Default::default()
        };
        let outcome = f.coordinator.handle_delivery(&message, &mut uow, succeeding).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Failed);
        assert_eq!(uow.aborts, 1);
        let errors = f.tracker.exceptions("M");
        assert_eq!(errors.len(), 2);
        assert!(errors[1].error.contains("channel closed"));
    }

    #[tokio::test]
    async fn panicking_dispatch_is_recorded_as_failure() {
        let f = fixture(RetryStrategySettings::new(3));
        let message = TransportMessage::with_id("M", b"{}".to_vec());
        let mut uow = RecordingUnitOfWork::default();

        let outcome = f
            .coordinator
            .handle_delivery(&message, &mut uow, |_ctx| async {
                if true {
                    panic!("handler exploded");
                }
                Ok::<(), ConsumerError>(())
            })
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Failed);
        assert_eq!(uow.aborts, 1);
        assert!(f.tracker.exceptions("M")[0].error.contains("handler exploded"));
    }

    #[tokio::test]
    async fn dead_letter_failure_is_returned_and_record_kept() {
        let settings = RetryStrategySettings::new(1);
        let tracker = Arc::new(InMemoryErrorTracker::new(&settings));
        let coordinator = RetryCoordinator::new(settings, tracker.clone(), Arc::new(FailingSink));
        let message = TransportMessage::with_id("M", b"{}".to_vec());

        deliver_failing(&coordinator, &message).await;
        let result = coordinator
            .handle_delivery(&message, &mut RecordingUnitOfWork::default(), succeeding)
            .await;

        assert!(matches!(result, Err(ConsumerError::DlqError(_))));
        assert!(tracker.has_failed_too_many_times("M"));
    }

    #[tokio::test]
    async fn noop_tracker_never_dead_letters_by_count() {
        let sink = Arc::new(InMemoryDeadLetterSink::new());
        let coordinator = RetryCoordinator::new(
            RetryStrategySettings::new(1).with_continue_without_error_log(true),
            Arc::new(NoopErrorTracker),
            sink.clone(),
        );
        let message = TransportMessage::with_id("M", b"{}".to_vec());

        for _ in 0..10 {
            assert_eq!(deliver_failing(&coordinator, &message).await, DeliveryOutcome::Failed);
        }
        assert!(sink.is_empty().await);
    }

    #[tokio::test]
    async fn brief_description_joins_both_levels() {
        let f = fixture(RetryStrategySettings::new(1).with_second_level_retries(true));
        f.tracker.register_error("M", &ConsumerError::from("a"));
        assert_eq!(f.coordinator.error_description_for("M", true), "1 unhandled exceptions");

        f.tracker.register_error("M-2nd-level", &ConsumerError::from("b"));
        assert_eq!(
            f.coordinator.error_description_for("M", true),
            "1 unhandled exceptions\n1 unhandled exceptions"
        );
        assert_eq!(f.coordinator.exceptions_for("M").len(), 2);
    }

    #[tokio::test]
    async fn stale_first_level_record_survives_second_level_failures() {
        let f = fixture(
            RetryStrategySettings::new(2)
                .with_second_level_retries(true)
                .with_error_tracking_max_age(Duration::from_secs(60)),
        );
        let message = TransportMessage::with_id("M", b"{}".to_vec());
        let long_ago = Utc::now() - chrono::Duration::seconds(120);
        for _ in 0..2 {
            f.tracker.inner.register_error_at("M", &ConsumerError::from("old"), long_ago);
        }

        let flags = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let flags = flags.clone();
            let outcome = f
                .coordinator
                .handle_delivery(&message, &mut RecordingUnitOfWork::default(), move |ctx| {
                    flags.lock().unwrap().push(ctx.dispatch_as_failed);
                    async { Err::<(), ConsumerError>(ConsumerError::from("still broken")) }
                })
                .await
                .unwrap();
            assert_eq!(outcome, DeliveryOutcome::Failed);
        }
        assert_eq!(*flags.lock().unwrap(), vec![true, true]);

        let outcome = f
            .coordinator
            .handle_delivery(&message, &mut RecordingUnitOfWork::default(), succeeding)
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::DeadLettered);

        let dead = f.sink.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].report.errors.len(), 4);
    }

    #[tokio::test]
    async fn concurrent_copies_are_dead_lettered_once() {
        let settings = RetryStrategySettings::new(1);
        let tracker = Arc::new(InMemoryErrorTracker::new(&settings));
        let gate = Arc::new(Notify::new());
        let sink = Arc::new(GatedSink {
            gate: gate.clone(),
            inner: InMemoryDeadLetterSink::new(),
        });
        let coordinator = RetryCoordinator::new(settings, tracker.clone(), sink.clone());
        let message = TransportMessage::with_id("M", b"{}".to_vec());
        deliver_failing(&coordinator, &message).await;

        let mut first_uow = RecordingUnitOfWork::default();
        let mut second_uow = RecordingUnitOfWork::default();
        let (first, second, ()) = tokio::join!(
            coordinator.handle_delivery(&message, &mut first_uow, succeeding),
            coordinator.handle_delivery(&message, &mut second_uow, succeeding),
            async {
                tokio::task::yield_now().await;
                gate.notify_one();
            }
        );

        let mut outcomes = vec![first.unwrap(), second.unwrap()];
        outcomes.sort_by_key(|o| *o == DeliveryOutcome::Failed);
        assert_eq!(outcomes, vec![DeliveryOutcome::DeadLettered, DeliveryOutcome::Failed]);
        assert_eq!(first_uow.aborts + second_uow.aborts, 1);
        assert_eq!(sink.inner.len().await, 1);
        assert!(tracker.exceptions("M").is_empty());

        // The claim is released once the copy has been dead-lettered.
        deliver_failing(&coordinator, &message).await;
        gate.notify_one();
        let outcome = coordinator
            .handle_delivery(&message, &mut RecordingUnitOfWork::default(), succeeding)
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::DeadLettered);
    }
}
