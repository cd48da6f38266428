//! Dead-letter routing for messages that cannot be processed.

use crate::error::ConsumerError;
use crate::message::{
    TransportMessage, DEAD_LETTER_TIME_HEADER, ERROR_DETAILS_HEADER, SOURCE_QUEUE_HEADER,
};
use crate::tracker::TrackedError;
use crate::unit_of_work::UnitOfWork;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lapin::{
    options::{BasicPublishOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel,
};
use serde::Serialize;
use tokio::sync::Mutex;

/// Why a message is being dead-lettered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    /// Human-readable reason.
    pub description: String,
    /// Causes accumulated across every tracking identifier of the message.
    pub errors: Vec<TrackedError>,
}

impl FailureReport {
    pub fn new(description: impl Into<String>, errors: Vec<TrackedError>) -> Self {
        Self {
            description: description.into(),
            errors,
        }
    }

    pub fn from_description(description: impl Into<String>) -> Self {
        Self::new(description, Vec::new())
    }
}

/// Final disposition of poison messages.
///
/// Implementations take over the message: after a successful call it must no
/// longer be in the input queue. The unit of work may still be open when this
/// is called.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn move_to_dead_letter(
        &self,
        message: &TransportMessage,
        unit_of_work: &mut dyn UnitOfWork,
        report: &FailureReport,
    ) -> Result<(), ConsumerError>;
}

/// Publishes poison messages to an error queue on the broker.
#[derive(Clone)]
pub struct RabbitMqDeadLetterSink {
    channel: Channel,
    error_queue: String,
    source_queue: String,
}

impl RabbitMqDeadLetterSink {
    /// Creates the sink and declares the error queue.
    pub async fn new(
        channel: Channel,
        error_queue: &str,
        source_queue: &str,
    ) -> Result<Self, ConsumerError> {
        let sink = Self {
            channel,
            error_queue: error_queue.to_string(),
            source_queue: source_queue.to_string(),
        };

        sink.setup_infrastructure().await?;
        Ok(sink)
    }

    async fn setup_infrastructure(&self) -> Result<(), ConsumerError> {
        self.channel
            .queue_declare(
                &self.error_queue,
                QueueDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;

        log::info!("Error queue '{}' declared for source queue '{}'", self.error_queue, self.source_queue);
        Ok(())
    }

}

/// The delivered properties plus the failure details, marked persistent.
fn dead_letter_properties(message: &TransportMessage, report: &FailureReport, source_queue: &str) -> BasicProperties {
    message
        .outgoing_properties(&[
            (ERROR_DETAILS_HEADER, report.description.clone()),
            (SOURCE_QUEUE_HEADER, source_queue.to_string()),
            (DEAD_LETTER_TIME_HEADER, Utc::now().to_rfc3339()),
        ])
        .with_delivery_mode(2)
}

#[async_trait]
impl DeadLetterSink for RabbitMqDeadLetterSink {
    async fn move_to_dead_letter(
        &self,
        message: &TransportMessage,
        unit_of_work: &mut dyn UnitOfWork,
        report: &FailureReport,
    ) -> Result<(), ConsumerError> {
        let properties = dead_letter_properties(message, report, &self.source_queue);

        self.channel
            .basic_publish(
                "",
                &self.error_queue,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| ConsumerError::DlqError(format!("publish to '{}' failed: {}", self.error_queue, e)))?;

        unit_of_work
            .commit()
            .await
            .map_err(|e| ConsumerError::DlqError(e.to_string()))
    }
}

/// A message accepted by [`InMemoryDeadLetterSink`].
#[derive(Debug, Clone)]
pub struct DeadLetteredMessage {
    pub message: TransportMessage,
    pub report: FailureReport,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Keeps poison messages in memory.
#[derive(Default)]
pub struct InMemoryDeadLetterSink {
    messages: Mutex<Vec<DeadLetteredMessage>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetteredMessage> {
        self.messages.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.lock().await.is_empty()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn move_to_dead_letter(
        &self,
        message: &TransportMessage,
        unit_of_work: &mut dyn UnitOfWork,
        report: &FailureReport,
    ) -> Result<(), ConsumerError> {
        self.messages.lock().await.push(DeadLetteredMessage {
            message: message.clone(),
            report: report.clone(),
            dead_lettered_at: Utc::now(),
        });
        unit_of_work
            .commit()
            .await
            .map_err(|e| ConsumerError::DlqError(e.to_string()))
    }
}
