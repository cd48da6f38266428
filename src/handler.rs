//! Defines the core trait for message handling logic.

use crate::error::ConsumerError;
use crate::message::DispatchContext;
use async_trait::async_trait;
use serde::Deserialize;

/// A trait for processing messages from a RabbitMQ queue.
///
/// Implement this trait for your specific message type and business logic.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// The type of the message that this handler can process.
    /// Must be deserializable from JSON.
    type MessageType: for<'de> Deserialize<'de> + Send + Sync;

    /// Processes a single deserialized message.
    async fn handle_message(
        &self,
        message: Self::MessageType,
        context: &DispatchContext,
    ) -> Result<(), ConsumerError>;

    /// Processes a message that already failed its first-level attempts.
    ///
    /// Override to take a degraded path (compensate, notify, park the work).
    /// Defaults to [`MessageHandler::handle_message`].
    async fn handle_failed_message(
        &self,
        message: Self::MessageType,
        context: &DispatchContext,
    ) -> Result<(), ConsumerError> {
        self.handle_message(message, context).await
    }

    /// A name for the handler, used for logging and identification.
    fn handler_name(&self) -> &str;
}

/// Deserializes `body` and routes it to the handler method matching the context.
pub async fn dispatch_to_handler<H: MessageHandler + ?Sized>(
    handler: &H,
    body: &[u8],
    context: &DispatchContext,
) -> Result<(), ConsumerError> {
    let message: H::MessageType = serde_json::from_slice(body)?;
    if context.dispatch_as_failed {
        handler.handle_failed_message(message, context).await
    } else {
        handler.handle_message(message, context).await
    }
}
