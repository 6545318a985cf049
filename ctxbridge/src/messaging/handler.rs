use super::envelope::BridgeMessage;
use super::remote_error::RemoteError;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;

/// What a handler returns: the reply payload or an error for the sender.
pub type HandlerResult = Result<Value, RemoteError>;

/// Handles requests for one topic.
///
/// Closures of the form `|message| async move { ... }` implement this trait.
#[async_trait(?Send)]
pub trait MessageHandler {
    /// Handle one request. The result becomes the reply.
    async fn handle(&self, message: BridgeMessage) -> HandlerResult;
}

#[async_trait(?Send)]
impl<F, Fut> MessageHandler for F
where
    F: Fn(BridgeMessage) -> Fut + 'static,
    Fut: Future<Output = HandlerResult> + 'static,
{
    async fn handle(&self, message: BridgeMessage) -> HandlerResult {
        (self)(message).await
    }
}
