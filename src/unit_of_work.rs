//! Transactional boundary around one delivery attempt.

use crate::error::ConsumerError;
use async_trait::async_trait;
use lapin::{
    acker::Acker,
    options::{BasicAckOptions, BasicNackOptions},
};

/// Commit or abort of one delivery attempt's side effects.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Makes the attempt's outcome final (for a broker delivery: acknowledges it).
    async fn commit(&mut self) -> Result<(), ConsumerError>;

    /// Rolls the attempt back so the transport redelivers the message.
    async fn abort(&mut self);

    /// True once either `commit` succeeded or `abort` ran.
    fn is_completed(&self) -> bool;
}

/// Unit of work over a single AMQP delivery: commit acks, abort nacks with requeue.
pub struct DeliveryUnitOfWork {
    acker: Acker,
    delivery_tag: u64,
    completed: bool,
}

impl DeliveryUnitOfWork {
    pub fn new(acker: Acker, delivery_tag: u64) -> Self {
        Self {
            acker,
            delivery_tag,
            completed: false,
        }
    }
}

#[async_trait]
impl UnitOfWork for DeliveryUnitOfWork {
    async fn commit(&mut self) -> Result<(), ConsumerError> {
        if self.completed {
            return Ok(());
        }
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| ConsumerError::CommitFailed(format!("ack of tag {} failed: {}", self.delivery_tag, e)))?;
        self.completed = true;
        Ok(())
    }

    async fn abort(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        if let Err(e) = self
            .acker
            .nack(BasicNackOptions { requeue: true, ..Default::default() })
            .await
        {
            log::error!("Failed to nack message. Tag: {}, Error: {}", self.delivery_tag, e);
        }
    }

    fn is_completed(&self) -> bool {
        self.completed
    }
}
