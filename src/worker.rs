//! The generic RabbitMQ worker and its configuration.

use crate::audit::{handle_and_audit, MessageAuditor, RabbitMqAuditor};
use crate::coordinator::{DeliveryOutcome, RetryCoordinator};
use crate::dlq::RabbitMqDeadLetterSink;
use crate::error::ConsumerError;
use crate::handler::MessageHandler;
use crate::message::{TransportMessage, MESSAGE_ID_HEADER};
use crate::retry::RetryStrategySettings;
use crate::tracker::tracker_for;
use crate::unit_of_work::DeliveryUnitOfWork;
use futures_util::TryStreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicConsumeOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

/// Configuration for a `GenericRabbitMQWorker`.
///
/// Use the `WorkerConfig::builder()` method to construct this struct.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// The name of the queue to consume messages from.
    pub queue_name: String,
    /// The name of the exchange to bind the queue to.
    pub exchange_name: String,
    /// Routing keys the queue is subscribed to on the exchange.
    pub routing_keys: Vec<String>,
    /// A unique identifier for the consumer on this queue.
    pub consumer_tag: String,
    /// The AMQP URL for connecting to the RabbitMQ broker.
    pub rabbitmq_url: String,
    /// Messages fetched from the broker ahead of processing (QoS prefetch count).
    pub max_parallelism: u16,
    /// Deliveries dispatched concurrently.
    pub number_of_workers: usize,
    /// Track failures and copy handled messages to the audit queue.
    pub message_auditing_enabled: bool,
    pub audit_queue_name: String,
    pub retry_settings: RetryStrategySettings,
}

impl WorkerConfig {
    /// Creates a new `WorkerConfigBuilder` to start building the worker configuration.
    ///
    /// # Arguments
    /// * `queue_name` - The name of the queue to consume from.
    /// * `rabbitmq_url` - The connection URL for the RabbitMQ broker.
    pub fn builder(queue_name: String, rabbitmq_url: String) -> WorkerConfigBuilder {
        WorkerConfigBuilder::new(queue_name, rabbitmq_url)
    }

    /// Loads a configuration from JSON. Omitted fields get the builder defaults.
    pub fn from_json(json: &str) -> Result<Self, ConsumerError> {
        let file: WorkerConfigFile = serde_json::from_str(json)?;
        let mut builder = Self::builder(file.queue_name, file.rabbitmq_url);
        builder.exchange_name = file.exchange_name;
        builder.routing_keys = file.routing_keys;
        builder.consumer_tag = file.consumer_tag;
        builder.max_parallelism = file.max_parallelism;
        builder.number_of_workers = file.number_of_workers;
        builder.message_auditing_enabled = file.message_auditing_enabled;
        builder.audit_queue_name = file.audit_queue_name;
        builder.retry_settings = file.retry_settings;

        let config = builder.build();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.queue_name.trim().is_empty() {
            return Err("queue_name must not be empty".into());
        }
        if self.routing_keys.is_empty() {
            return Err("at least one routing key is required".into());
        }
        if self.max_parallelism == 0 {
            return Err("max_parallelism must be at least 1".into());
        }
        if self.number_of_workers == 0 {
            return Err("number_of_workers must be at least 1".into());
        }
        if self.message_auditing_enabled && self.audit_queue_name.trim().is_empty() {
            return Err("audit_queue_name must not be empty when auditing is enabled".into());
        }
        self.retry_settings.validate()
    }

    /// Retry settings as applied at runtime. Without auditing no failures are
    /// tracked, so dispatch failures are logged at debug only.
    pub fn effective_retry_settings(&self) -> RetryStrategySettings {
        let settings = self.retry_settings.clone();
        if self.message_auditing_enabled {
            settings
        } else {
            settings.with_continue_without_error_log(true)
        }
    }
}

#[derive(Deserialize)]
struct WorkerConfigFile {
    queue_name: String,
    rabbitmq_url: String,
    exchange_name: Option<String>,
    routing_keys: Option<Vec<String>>,
    consumer_tag: Option<String>,
    max_parallelism: Option<u16>,
    number_of_workers: Option<usize>,
    message_auditing_enabled: Option<bool>,
    audit_queue_name: Option<String>,
    retry_settings: Option<RetryStrategySettings>,
}

/// A builder for creating `WorkerConfig` instances.
pub struct WorkerConfigBuilder {
    queue_name: String,
    rabbitmq_url: String,
    exchange_name: Option<String>,
    routing_keys: Option<Vec<String>>,
    consumer_tag: Option<String>,
    max_parallelism: Option<u16>,
    number_of_workers: Option<usize>,
    message_auditing_enabled: Option<bool>,
    audit_queue_name: Option<String>,
    retry_settings: Option<RetryStrategySettings>,
}

impl WorkerConfigBuilder {
    /// Creates a new builder with the required fields.
    fn new(queue_name: String, rabbitmq_url: String) -> Self {
        Self {
            queue_name,
            rabbitmq_url,
            exchange_name: None,
            routing_keys: None,
            consumer_tag: None,
            max_parallelism: None,
            number_of_workers: None,
            message_auditing_enabled: None,
            audit_queue_name: None,
            retry_settings: None,
        }
    }

    /// Sets a custom exchange name.
    /// Defaults to `{queue_name}_exchange` if not set.
    pub fn exchange_name(mut self, exchange_name: String) -> Self {
        self.exchange_name = Some(exchange_name);
        self
    }

    /// Subscribes the queue to an additional routing key.
    /// Defaults to `{queue_name}.process` if none is added.
    pub fn routing_key(mut self, routing_key: String) -> Self {
        self.routing_keys.get_or_insert_with(Vec::new).push(routing_key);
        self
    }

    /// Sets a custom consumer tag.
    /// Defaults to `{queue_name}_consumer` if not set.
    pub fn consumer_tag(mut self, consumer_tag: String) -> Self {
        self.consumer_tag = Some(consumer_tag);
        self
    }

    /// Sets the prefetch count (QoS). Defaults to 1.
    pub fn max_parallelism(mut self, count: u16) -> Self {
        self.max_parallelism = Some(count);
        self
    }

    /// Sets how many deliveries are dispatched at once. Defaults to 1.
    ///
    /// **Warning:** values greater than 1 mean your `MessageHandler` is called
    /// concurrently. Ensure your handler is thread-safe.
    pub fn number_of_workers(mut self, count: usize) -> Self {
        self.number_of_workers = Some(count);
        self
    }

    /// Enables failure tracking and copies every handled message to `audit_queue_name`.
    pub fn message_auditing(mut self, audit_queue_name: String) -> Self {
        self.message_auditing_enabled = Some(true);
        self.audit_queue_name = Some(audit_queue_name);
        self
    }

    /// Sets custom retry settings.
    /// Defaults to `RetryStrategySettings::default()`.
    pub fn retry_settings(mut self, retry_settings: RetryStrategySettings) -> Self {
        self.retry_settings = Some(retry_settings);
        self
    }

    /// Builds the final `WorkerConfig`, applying defaults for any unset options.
    pub fn build(self) -> WorkerConfig {
        let queue_name = self.queue_name;
        WorkerConfig {
            exchange_name: self.exchange_name.unwrap_or_else(|| format!("{}_exchange", queue_name)),
            routing_keys: self
                .routing_keys
                .unwrap_or_else(|| vec![format!("{}.process", queue_name)]),
            consumer_tag: self.consumer_tag.unwrap_or_else(|| format!("{}_consumer", queue_name)),
            max_parallelism: self.max_parallelism.unwrap_or(1),
            number_of_workers: self.number_of_workers.unwrap_or(1),
            message_auditing_enabled: self.message_auditing_enabled.unwrap_or(false),
            audit_queue_name: self.audit_queue_name.unwrap_or_else(|| "audit".to_string()),
            retry_settings: self.retry_settings.unwrap_or_default(),
            queue_name,
            rabbitmq_url: self.rabbitmq_url,
        }
    }
}

/// A generic, reusable RabbitMQ worker that processes messages from a queue.
pub struct GenericRabbitMQWorker<H: MessageHandler> {
    handler: Arc<H>,
    config: WorkerConfig,
}

impl<H: MessageHandler + 'static> GenericRabbitMQWorker<H> {
    /// Creates a new worker.
    pub fn new(handler: Arc<H>, config: WorkerConfig) -> Self {
        Self { handler, config }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Connects to RabbitMQ, sets up the consumer, and runs the message processing loop.
    ///
    /// Runs until the connection is lost or the consumer is cancelled.
    /// The application is responsible for handling reconnection.
    pub async fn run(&self) -> Result<(), ConsumerError> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Like [`run`](Self::run), but stops once `shutdown` completes, including
    /// while still connecting. The connection is closed on every exit path.
    pub async fn run_until<S>(&self, shutdown: S) -> Result<(), ConsumerError>
    where
        S: Future<Output = ()>,
    {
        self.config.validate()?;
        log::info!(
            "Connecting to RabbitMQ and setting up worker '{}' for queue '{}'...",
            self.handler.handler_name(),
            self.config.queue_name
        );

        tokio::pin!(shutdown);
        let connection = tokio::select! {
            biased;
            _ = &mut shutdown => {
                log::info!("Shutdown requested for queue '{}' while connecting.", self.config.queue_name);
                return Ok(());
            }
            connection = Connection::connect(&self.config.rabbitmq_url, ConnectionProperties::default()) => connection?,
        };

        let result = match connection.create_channel().await {
            Ok(channel) => {
                tokio::select! {
                    _ = &mut shutdown => {
                        log::info!("Shutdown requested for queue '{}'.", self.config.queue_name);
                        Ok(())
                    }
                    result = self.consume(channel) => result,
                }
            }
            Err(e) => Err(e.into()),
        };

        if let Err(e) = connection.close(200, "consumer shutting down").await {
            log::warn!("Failed to close RabbitMQ connection cleanly: {}", e);
        }
        result
    }

    async fn consume(&self, channel: Channel) -> Result<(), ConsumerError> {
        self.setup_infrastructure(&channel).await?;

        let settings = self.config.effective_retry_settings();
        let dead_letter = RabbitMqDeadLetterSink::new(
            channel.clone(),
            &settings.error_queue_name,
            &self.config.queue_name,
        )
        .await?;
        let tracker = tracker_for(self.config.message_auditing_enabled, &settings);
        let coordinator = RetryCoordinator::new(settings, tracker, Arc::new(dead_letter));
        let auditor = if self.config.message_auditing_enabled {
            Some(RabbitMqAuditor::new(channel.clone(), &self.config.audit_queue_name, &self.config.queue_name).await?)
        } else {
            None
        };

        channel.basic_qos(self.config.max_parallelism, BasicQosOptions::default()).await?;
        log::info!("QoS prefetch count set to {}", self.config.max_parallelism);

        let consumer = channel
            .basic_consume(
                &self.config.queue_name,
                &self.config.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        log::info!(
            "Consumer started with tag '{}' and {} workers. Waiting for messages...",
            consumer.tag().as_str(),
            self.config.number_of_workers
        );

        let coordinator = &coordinator;
        let auditor = auditor.as_ref().map(|a| a as &dyn MessageAuditor);
        consumer
            .map_err(ConsumerError::from)
            .try_for_each_concurrent(self.config.number_of_workers, |delivery| async move {
                self.process_message(delivery, coordinator, auditor).await
            })
            .await
    }

    /// Declares the primary exchange and queue, and binds every routing key.
    async fn setup_infrastructure(&self, channel: &Channel) -> Result<(), ConsumerError> {
        channel
            .exchange_declare(
                &self.config.exchange_name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;

        channel
            .queue_declare(
                &self.config.queue_name,
                QueueDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;

        for routing_key in &self.config.routing_keys {
            channel
                .queue_bind(
                    &self.config.queue_name,
                    &self.config.exchange_name,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            log::info!("Queue '{}' subscribed to '{}'.", self.config.queue_name, routing_key);
        }

        Ok(())
    }

    /// Runs one delivery through the retry coordinator. Only a dead-letter
    /// failure is returned, and it stops the consumer.
    async fn process_message(
        &self,
        delivery: Delivery,
        coordinator: &RetryCoordinator,
        auditor: Option<&dyn MessageAuditor>,
    ) -> Result<(), ConsumerError> {
        let delivery_tag = delivery.delivery_tag;
        let message = transport_message_from(&delivery.properties, &delivery.data);
        let mut unit_of_work = DeliveryUnitOfWork::new(delivery.acker.clone(), delivery_tag);

        let handler = self.handler.as_ref();
        let message_ref = &message;
        let outcome = coordinator
            .handle_delivery(&message, &mut unit_of_work, |context| async move {
                handle_and_audit(handler, message_ref, &context, auditor).await
            })
            .await?;

        match outcome {
            DeliveryOutcome::Committed => log::info!("Message processed successfully. Tag: {}", delivery_tag),
            DeliveryOutcome::Failed => log::info!("Message returned for redelivery. Tag: {}", delivery_tag),
            DeliveryOutcome::DeadLettered => log::info!("Message moved to the error queue. Tag: {}", delivery_tag),
        }
        Ok(())
    }
}

/// Builds the transport-neutral message from AMQP properties and body. The
/// `message_id` property wins over an `x-message-id` header.
fn transport_message_from(properties: &BasicProperties, body: &[u8]) -> TransportMessage {
    let mut headers = BTreeMap::new();
    if let Some(table) = properties.headers().as_ref() {
        for (key, value) in table.inner() {
            if let Some(value) = amqp_value_to_string(value) {
                headers.insert(key.as_str().to_string(), value);
            }
        }
    }

    if let Some(message_id) = properties.message_id().as_ref() {
        if !message_id.as_str().trim().is_empty() {
            headers.insert(MESSAGE_ID_HEADER.to_string(), message_id.as_str().to_string());
        }
    }

    TransportMessage::new(headers, body.to_vec()).with_properties(properties.clone())
}

fn amqp_value_to_string(value: &AMQPValue) -> Option<String> {
    let text = match value {
        AMQPValue::LongString(s) => s.to_string(),
        AMQPValue::ShortString(s) => s.as_str().to_string(),
        AMQPValue::Boolean(b) => b.to_string(),
        AMQPValue::ShortShortInt(n) => n.to_string(),
        AMQPValue::ShortShortUInt(n) => n.to_string(),
        AMQPValue::ShortInt(n) => n.to_string(),
        AMQPValue::ShortUInt(n) => n.to_string(),
        AMQPValue::LongInt(n) => n.to_string(),
        AMQPValue::LongUInt(n) => n.to_string(),
        AMQPValue::LongLongInt(n) => n.to_string(),
        AMQPValue::Timestamp(t) => t.to_string(),
        _ => return None,
    };
    Some(text)
}
