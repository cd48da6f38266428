//! Copies of successfully handled messages for the audit queue.

use crate::error::ConsumerError;
use crate::handler::{dispatch_to_handler, MessageHandler};
use crate::message::{
    DispatchContext, TransportMessage, AUDIT_HANDLED_TIME_HEADER, AUDIT_SOURCE_QUEUE_HEADER,
};
use async_trait::async_trait;
use chrono::Utc;
use lapin::{
    options::{BasicPublishOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel,
};

/// Receives a copy of every message the handler accepted.
///
/// An error fails the delivery attempt, so the message is redelivered and
/// audited again on the next success.
#[async_trait]
pub trait MessageAuditor: Send + Sync {
    async fn audit(&self, message: &TransportMessage) -> Result<(), ConsumerError>;
}

/// Publishes audit copies to a queue on the broker.
#[derive(Clone)]
pub struct RabbitMqAuditor {
    channel: Channel,
    audit_queue: String,
    source_queue: String,
}

impl RabbitMqAuditor {
    /// Creates the auditor and declares the audit queue.
    pub async fn new(channel: Channel, audit_queue: &str, source_queue: &str) -> Result<Self, ConsumerError> {
        channel
            .queue_declare(
                audit_queue,
                QueueDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
        log::info!("Message auditing enabled, copying handled messages to '{}'.", audit_queue);

        Ok(Self {
            channel,
            audit_queue: audit_queue.to_string(),
            source_queue: source_queue.to_string(),
        })
    }
}

#[async_trait]
impl MessageAuditor for RabbitMqAuditor {
    async fn audit(&self, message: &TransportMessage) -> Result<(), ConsumerError> {
        self.channel
            .basic_publish(
                "",
                &self.audit_queue,
                BasicPublishOptions::default(),
                &message.body,
                audit_properties(message, &self.source_queue),
            )
            .await?;
        Ok(())
    }
}

fn audit_properties(message: &TransportMessage, source_queue: &str) -> BasicProperties {
    message.outgoing_properties(&[
        (AUDIT_HANDLED_TIME_HEADER, Utc::now().to_rfc3339()),
        (AUDIT_SOURCE_QUEUE_HEADER, source_queue.to_string()),
    ])
}

/// Hands the message to `handler` and, once it succeeds, to `auditor`.
pub async fn handle_and_audit<H: MessageHandler + ?Sized>(
    handler: &H,
    message: &TransportMessage,
    context: &DispatchContext,
    auditor: Option<&dyn MessageAuditor>,
) -> Result<(), ConsumerError> {
    dispatch_to_handler(handler, &message.body, context).await?;
    if let Some(auditor) = auditor {
        auditor.audit(message).await?;
    }
    Ok(())
}
