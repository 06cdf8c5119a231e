//! Message handlers.

use crate::error::ProcessingError;
use crate::message::Message;
use async_trait::async_trait;
use std::future::Future;

/// Handles one message at a time.
///
/// The worker acks on `Ok`, naks on a transient error and terminates the
/// delivery on a permanent error. Deliveries can repeat (a lost ack, an
/// expired `ack_wait`), so implementations must be idempotent.
///
/// # Example
///
/// ```rust,ignore
/// struct Printer;
///
/// #[async_trait]
/// impl Handler for Printer {
///     async fn handle(&self, message: &Message) -> Result<(), ProcessingError> {
///         println!("{}", String::from_utf8_lossy(&message.payload));
///         Ok(())
///     }
///
///     fn name(&self) -> &'static str {
///         "printer"
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Process a message.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Message handled, it is acknowledged
    /// * `Err(ProcessingError)` - Redelivered or terminated based on the variant
    async fn handle(&self, message: &Message) -> Result<(), ProcessingError>;

    /// Used for logging and metrics labels.
    fn name(&self) -> &'static str;

    /// Called when a transient failure happened on the last allowed
    /// delivery; the broker will not offer the message again. Override to
    /// park the payload somewhere.
    async fn on_exhausted(&self, message: &Message, error: &ProcessingError) {
        let _ = (message, error);
    }
}

/// Handler built from an async closure.
pub struct FnHandler<F> {
    name: &'static str,
    f: F,
}

/// Wrap `f` as a [`Handler`].
///
/// ```rust,ignore
/// let handler = handler_fn("echo", |message: Message| async move {
///     tracing::info!(sequence = message.sequence, "got message");
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(name: &'static str, f: F) -> FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ProcessingError>> + Send + 'static,
{
    FnHandler { name, f }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ProcessingError>> + Send + 'static,
{
    async fn handle(&self, message: &Message) -> Result<(), ProcessingError> {
        (self.f)(message.clone()).await
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
