//! # RabbitMQ Consumer
//! A RabbitMQ consumer library with tracked delivery attempts, second-level
//! retries and poison-message routing to an error queue.
//!
//! The [`RetryCoordinator`] is transport-agnostic: it needs an [`ErrorTracker`],
//! a [`DeadLetterSink`] and a [`UnitOfWork`] per delivery. [`GenericRabbitMQWorker`]
//! wires it to a `lapin` consumer.

pub mod audit;
pub mod coordinator;
pub mod dlq;
pub mod error;
pub mod handler;
pub mod message;
pub mod retry;
pub mod tracker;
pub mod unit_of_work;
pub mod worker;

// Re-export key components for easy access
pub use audit::{MessageAuditor, RabbitMqAuditor};
pub use coordinator::{DeliveryOutcome, RetryCoordinator};
pub use dlq::{DeadLetterSink, FailureReport, InMemoryDeadLetterSink, RabbitMqDeadLetterSink};
pub use error::ConsumerError;
pub use handler::MessageHandler;
pub use message::{DispatchContext, TransportMessage};
pub use retry::{second_level_id, RetryStrategySettings};
pub use tracker::{ErrorTracker, InMemoryErrorTracker, NoopErrorTracker, TrackedError};
pub use unit_of_work::{DeliveryUnitOfWork, UnitOfWork};
pub use worker::{GenericRabbitMQWorker, WorkerConfig};
