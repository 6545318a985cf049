//! Per-context endpoint runtime.
//!
//! # Routing
//!
//! ```text
//! handle_message(envelope)
//!   ├─ hops contains our hop id  → dropped
//!   ├─ destination is us         → local
//!   │    ├─ reply   → settle transaction
//!   │    └─ message → spawn handler, reply to origin
//!   └─ otherwise                 → push hop id, forwarder(envelope)
//! ```
//!
//! "Us" means a destination of `None` or exactly `{context, no tab, no frame}`.
//! The relay clears tab and frame before the final hop, so a resolved
//! `content-script@5` arrives at that content script as `content-script`.

use super::envelope::{BridgeMessage, Envelope, MessageType};
use super::handler::{HandlerResult, MessageHandler};
use super::remote_error::RemoteError;
use super::transaction::{TransactionResult, TransactionTable};
use crate::endpoint::{Destination, Endpoint, RuntimeContext};
use crate::error::{BridgeError, BridgeResult};
use crate::providers::{Providers, RandomProvider, TaskProvider, TimeProvider};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;
use tokio::sync::oneshot;

/// Hands a non-local envelope to the context's transport.
pub type Forwarder = Box<dyn Fn(Envelope) -> BridgeResult<()>>;

/// Observes every envelope consumed locally.
pub type LocalDeliveryHook = Box<dyn Fn(&Envelope)>;

type ErrorHook = Rc<dyn Fn(&RemoteError)>;

/// One context's messaging state: open transactions and topic handlers.
///
/// Cloning yields another handle to the same runtime.
pub struct EndpointRuntime<P: Providers> {
    inner: Rc<RuntimeInner<P>>,
}

impl<P: Providers> Clone for EndpointRuntime<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct RuntimeInner<P: Providers> {
    context: RuntimeContext,
    hop_id: String,
    providers: P,
    transactions: RefCell<TransactionTable>,
    handlers: RefCell<HashMap<String, Rc<dyn MessageHandler>>>,
    forwarder: RefCell<Option<Forwarder>>,
    local_hook: RefCell<Option<LocalDeliveryHook>>,
    error_hooks: RefCell<Vec<ErrorHook>>,
}

impl<P: Providers> EndpointRuntime<P> {
    /// Create a runtime for `context`. Until a forwarder is set, only local
    /// traffic works.
    pub fn new(context: RuntimeContext, providers: P) -> Self {
        let hop_id = format!("{}::{}", context, providers.random().random_id(12));
        tracing::debug!(context = %context, hop = %hop_id, "endpoint runtime created");
        Self {
            inner: Rc::new(RuntimeInner {
                context,
                hop_id,
                providers,
                transactions: RefCell::new(TransactionTable::new()),
                handlers: RefCell::new(HashMap::new()),
                forwarder: RefCell::new(None),
                local_hook: RefCell::new(None),
                error_hooks: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Set the callback receiving non-local envelopes.
    pub fn set_forwarder(&self, forwarder: impl Fn(Envelope) -> BridgeResult<()> + 'static) {
        *self.inner.forwarder.borrow_mut() = Some(Box::new(forwarder));
    }

    /// Set the hook observing locally consumed envelopes.
    pub fn set_local_delivery_hook(&self, hook: impl Fn(&Envelope) + 'static) {
        *self.inner.local_hook.borrow_mut() = Some(Box::new(hook));
    }

    /// The context this runtime serves.
    pub fn context(&self) -> RuntimeContext {
        self.inner.context
    }

    /// Marker this runtime appends to `hops` when forwarding.
    pub fn hop_id(&self) -> &str {
        &self.inner.hop_id
    }

    /// The provider bundle.
    pub fn providers(&self) -> &P {
        &self.inner.providers
    }

    /// Number of requests awaiting a reply.
    pub fn pending_transactions(&self) -> usize {
        self.inner.transactions.borrow().len()
    }

    /// Register the handler for `topic`, replacing any previous one.
    ///
    /// Returns `true` when a previous handler was replaced.
    pub fn on_message<F, Fut>(&self, topic: impl Into<String>, handler: F) -> bool
    where
        F: Fn(BridgeMessage) -> Fut + 'static,
        Fut: Future<Output = HandlerResult> + 'static,
    {
        self.register_handler(topic, Rc::new(handler))
    }

    /// Register a shared handler for `topic`, replacing any previous one.
    pub fn register_handler(
        &self,
        topic: impl Into<String>,
        handler: Rc<dyn MessageHandler>,
    ) -> bool {
        let topic = topic.into();
        let replaced = self
            .inner
            .handlers
            .borrow_mut()
            .insert(topic.clone(), handler)
            .is_some();
        if replaced {
            tracing::debug!(context = %self.inner.context, topic = %topic, "message handler replaced");
        }
        replaced
    }

    /// Remove the handler for `topic`.
    pub fn remove_handler(&self, topic: &str) -> bool {
        self.inner.handlers.borrow_mut().remove(topic).is_some()
    }

    /// Whether a handler is registered for `topic`.
    pub fn has_handler(&self, topic: &str) -> bool {
        self.inner.handlers.borrow().contains_key(topic)
    }

    /// Observe handler failures raised in this context.
    ///
    /// The failure has already been sent back to the requester when hooks run.
    pub fn on_handler_error(&self, hook: impl Fn(&RemoteError) + 'static) {
        self.inner.error_hooks.borrow_mut().push(Rc::new(hook));
    }

    /// Send a request and wait for its reply.
    ///
    /// The envelope leaves when this method is called, not when the returned
    /// future is first polled. Usage errors (an invalid destination, a
    /// transport refusing the envelope) come back from the future without
    /// leaving a transaction behind.
    pub fn send_message(
        &self,
        topic: &str,
        data: Value,
        destination: impl Into<Destination>,
    ) -> impl Future<Output = BridgeResult<Value>> + 'static {
        let dispatched = self.dispatch_request(topic, data, destination.into());
        async move {
            let (transaction_id, receiver) = dispatched?;
            match receiver.await {
                Ok(result) => result,
                Err(_) => Err(BridgeError::ReplyDropped { transaction_id }),
            }
        }
    }

    fn dispatch_request(
        &self,
        topic: &str,
        data: Value,
        destination: Destination,
    ) -> BridgeResult<(String, oneshot::Receiver<TransactionResult>)> {
        let destination = destination.resolve()?;
        let time = self.inner.providers.time();
        let transaction_id = self.inner.providers.random().random_id(21);

        let envelope = Envelope {
            origin: Endpoint::new(self.inner.context),
            destination: Some(destination),
            transaction_id: transaction_id.clone(),
            hops: Vec::new(),
            message_id: topic.to_string(),
            message_type: MessageType::Message,
            data,
            err: None,
            timestamp: time.unix_millis(),
        };

        let receiver = self.inner.transactions.borrow_mut().register(
            transaction_id.clone(),
            topic.to_string(),
            time.now(),
        );

        if let Err(err) = self.handle_message(envelope) {
            self.inner.transactions.borrow_mut().take(&transaction_id);
            return Err(err);
        }
        Ok((transaction_id, receiver))
    }

    /// Reject a pending request with [`BridgeError::TransactionEnded`].
    ///
    /// Returns `false` when the transaction was not open.
    pub fn end_transaction(&self, transaction_id: &str) -> bool {
        let transaction = self.inner.transactions.borrow_mut().take(transaction_id);
        match transaction {
            Some(transaction) => {
                tracing::debug!(
                    context = %self.inner.context,
                    transaction_id = %transaction_id,
                    topic = %transaction.topic(),
                    "ending transaction"
                );
                transaction.complete(Err(BridgeError::TransactionEnded {
                    transaction_id: transaction_id.to_string(),
                }));
                true
            }
            None => false,
        }
    }

    /// Sole inbound entry point, for transports and for this runtime itself.
    ///
    /// An error means the forwarder refused the envelope.
    pub fn handle_message(&self, mut envelope: Envelope) -> BridgeResult<()> {
        let inner = &self.inner;

        if envelope.hops.iter().any(|hop| *hop == inner.hop_id) {
            tracing::debug!(
                hop = %inner.hop_id,
                transaction_id = %envelope.transaction_id,
                "dropping envelope that already visited this runtime"
            );
            return Ok(());
        }

        let is_local = envelope
            .destination
            .as_ref()
            .is_none_or(|destination| destination.is_bare(inner.context));

        if !is_local {
            envelope.hops.push(inner.hop_id.clone());
            let forwarder = inner.forwarder.borrow();
            return match forwarder.as_ref() {
                Some(forward) => forward(envelope),
                None => Err(BridgeError::PortClosed),
            };
        }

        if let Some(hook) = inner.local_hook.borrow().as_ref() {
            hook(&envelope);
        }

        match envelope.message_type {
            MessageType::Reply => self.settle(envelope),
            MessageType::Message => self.dispatch(envelope),
        }
        Ok(())
    }

    fn settle(&self, envelope: Envelope) {
        let transaction = self
            .inner
            .transactions
            .borrow_mut()
            .take(&envelope.transaction_id);
        let Some(transaction) = transaction else {
            tracing::debug!(
                transaction_id = %envelope.transaction_id,
                "ignoring reply for unknown transaction"
            );
            return;
        };
        let result = match envelope.err {
            Some(err) => Err(BridgeError::Remote(err.into())),
            None => Ok(envelope.data),
        };
        transaction.complete(result);
    }

    fn dispatch(&self, envelope: Envelope) {
        let handler = self
            .inner
            .handlers
            .borrow()
            .get(&envelope.message_id)
            .cloned();
        let runtime = self.clone();

        self.inner
            .providers
            .task()
            .spawn_task("handle_message", async move {
                let context = runtime.inner.context;
                let (result, raise) = match handler {
                    Some(handler) => {
                        let result = handler
                            .handle(BridgeMessage {
                                sender: envelope.origin.clone(),
                                id: envelope.message_id.clone(),
                                data: envelope.data,
                                timestamp: envelope.timestamp,
                            })
                            .await;
                        let raise = result.is_err();
                        (result, raise)
                    }
                    None => (
                        Err(RemoteError::error(format!(
                            "[ctxbridge] No handler registered in '{}' to accept messages with id '{}'",
                            context, envelope.message_id
                        ))),
                        false,
                    ),
                };

                let (data, err) = match &result {
                    Ok(data) => (data.clone(), None),
                    Err(err) => (Value::Null, Some(err.to_serialized())),
                };
                let reply = Envelope {
                    origin: Endpoint::new(context),
                    destination: Some(envelope.origin),
                    transaction_id: envelope.transaction_id,
                    hops: Vec::new(),
                    message_id: envelope.message_id,
                    message_type: MessageType::Reply,
                    data,
                    err,
                    timestamp: runtime.inner.providers.time().unix_millis(),
                };
                let topic = reply.message_id.clone();
                if let Err(error) = runtime.handle_message(reply) {
                    tracing::warn!(context = %context, topic = %topic, error = %error, "failed to send reply");
                }

                if raise {
                    if let Err(err) = &result {
                        runtime.raise_handler_error(&topic, err);
                    }
                }
            });
    }

    fn raise_handler_error(&self, topic: &str, err: &RemoteError) {
        tracing::error!(
            context = %self.inner.context,
            topic = %topic,
            error = %err,
            "message handler failed"
        );
        let hooks: Vec<ErrorHook> = self.inner.error_hooks.borrow().clone();
        for hook in hooks {
            hook(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::TokioProviders;
    use serde_json::json;
    use std::cell::Cell;
    use tokio::task::LocalSet;

    fn runtime(context: RuntimeContext) -> EndpointRuntime<TokioProviders> {
        EndpointRuntime::new(context, TokioProviders::new())
    }

    fn request(to: Endpoint, hops: Vec<String>) -> Envelope {
        Envelope {
            origin: Endpoint::in_tab(RuntimeContext::ContentScript, 1),
            destination: Some(to),
            transaction_id: "t1".to_string(),
            hops,
            message_id: "ping".to_string(),
            message_type: MessageType::Message,
            data: json!(null),
            err: None,
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn test_seeded_providers_replay_ids() {
        fn first_ids(seed: u64) -> (String, String) {
            let popup = EndpointRuntime::new(RuntimeContext::Popup, TokioProviders::seeded(seed));
            let sent = Rc::new(RefCell::new(None));
            let sink = sent.clone();
            popup.set_forwarder(move |envelope: Envelope| {
                *sink.borrow_mut() = Some(envelope.transaction_id);
                Ok(())
            });
            drop(popup.send_message("ping", json!(null), "background"));
            let transaction_id = sent.borrow_mut().take().unwrap_or_default();
            (popup.hop_id().to_string(), transaction_id)
        }

        let (hop, transaction) = first_ids(3);
        assert!(hop.starts_with("popup::"));
        assert_eq!(transaction.len(), 21);
        assert_eq!(first_ids(3), (hop, transaction));
    }

    #[tokio::test]
    async fn test_local_round_trip() {
        LocalSet::new()
            .run_until(async {
                let popup = runtime(RuntimeContext::Popup);
                popup.on_message("double", |message: BridgeMessage| async move {
                    let n = message.data.as_i64().unwrap_or_default();
                    Ok(json!(n * 2))
                });

                let reply = popup
                    .send_message("double", json!(21), RuntimeContext::Popup)
                    .await
                    .expect("reply");
                assert_eq!(reply, json!(42));
                assert_eq!(popup.pending_transactions(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_later_registration_replaces_handler() {
        LocalSet::new()
            .run_until(async {
                let options = runtime(RuntimeContext::Options);
                assert!(!options.on_message("who", |_m: BridgeMessage| async { Ok(json!("first")) }));
                assert!(options.on_message("who", |_m: BridgeMessage| async { Ok(json!("second")) }));

                let reply = options
                    .send_message("who", json!(null), "options")
                    .await
                    .expect("reply");
                assert_eq!(reply, json!("second"));
            })
            .await;
    }

    #[tokio::test]
    async fn test_invalid_destination_leaves_no_transaction() {
        let popup = runtime(RuntimeContext::Popup);
        let err = popup
            .send_message("x", json!(null), "somewhere")
            .await
            .expect_err("usage error");
        assert_eq!(
            err,
            BridgeError::InvalidDestination {
                destination: "somewhere".to_string()
            }
        );
        assert_eq!(popup.pending_transactions(), 0);
    }

    #[tokio::test]
    async fn test_forwarder_error_removes_transaction() {
        let popup = runtime(RuntimeContext::Popup);
        popup.set_forwarder(|_envelope| Err(BridgeError::PortClosed));

        let err = popup
            .send_message("x", json!(null), "background")
            .await
            .expect_err("forward failure");
        assert_eq!(err, BridgeError::PortClosed);
        assert_eq!(popup.pending_transactions(), 0);
    }

    #[tokio::test]
    async fn test_forwarded_envelope_carries_hop() {
        let popup = runtime(RuntimeContext::Popup);
        let forwarded = Rc::new(RefCell::new(Vec::new()));
        let sink = forwarded.clone();
        popup.set_forwarder(move |envelope| {
            sink.borrow_mut().push(envelope);
            Ok(())
        });

        let _pending = popup.send_message("x", json!(1), "content-script@3");
        let forwarded = forwarded.borrow();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].hops, vec![popup.hop_id().to_string()]);
        assert_eq!(
            forwarded[0].destination,
            Some(Endpoint::in_tab(RuntimeContext::ContentScript, 3))
        );
        assert_eq!(popup.pending_transactions(), 1);
    }

    #[tokio::test]
    async fn test_envelope_with_own_hop_is_dropped() {
        LocalSet::new()
            .run_until(async {
                let background = runtime(RuntimeContext::Background);
                let forwarded = Rc::new(Cell::new(0));
                let count = forwarded.clone();
                background.set_forwarder(move |_envelope| {
                    count.set(count.get() + 1);
                    Ok(())
                });
                let handled = Rc::new(Cell::new(0));
                let calls = handled.clone();
                background.on_message("ping", move |_m: BridgeMessage| {
                    calls.set(calls.get() + 1);
                    async { Ok(json!(null)) }
                });

                let own_hop = vec![background.hop_id().to_string()];
                background
                    .handle_message(request(Endpoint::new(RuntimeContext::Background), own_hop.clone()))
                    .expect("dropped quietly");
                background
                    .handle_message(request(Endpoint::new(RuntimeContext::Popup), own_hop))
                    .expect("dropped quietly");
                tokio::task::yield_now().await;

                assert_eq!(handled.get(), 0);
                assert_eq!(forwarded.get(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_no_handler_replies_with_error_naming_topic() {
        LocalSet::new()
            .run_until(async {
                let devtools = runtime(RuntimeContext::Devtools);
                let raised = Rc::new(Cell::new(false));
                let flag = raised.clone();
                devtools.on_handler_error(move |_err| flag.set(true));

                let err = devtools
                    .send_message("missing-topic", json!(null), "devtools")
                    .await
                    .expect_err("no handler");
                let BridgeError::Remote(remote) = err else {
                    panic!("expected remote error, got {err:?}");
                };
                assert!(remote.message().contains("'missing-topic'"));
                assert!(remote.message().contains("'devtools'"));
                assert!(!raised.get());
            })
            .await;
    }

    #[tokio::test]
    async fn test_handler_error_is_replied_then_raised() {
        LocalSet::new()
            .run_until(async {
                let popup = runtime(RuntimeContext::Popup);
                let raised = Rc::new(RefCell::new(None));
                let sink = raised.clone();
                popup.on_handler_error(move |err| *sink.borrow_mut() = Some(err.name().to_string()));
                popup.on_message("fail", |_m: BridgeMessage| async {
                    Err(RemoteError::range_error("x"))
                });

                let err = popup
                    .send_message("fail", json!(null), "popup")
                    .await
                    .expect_err("handler error");
                let BridgeError::Remote(remote) = err else {
                    panic!("expected remote error, got {err:?}");
                };
                assert_eq!(remote.name(), "RangeError");
                assert_eq!(remote.message(), "x");

                tokio::task::yield_now().await;
                assert_eq!(raised.borrow().as_deref(), Some("RangeError"));
            })
            .await;
    }

    #[tokio::test]
    async fn test_end_transaction_rejects_and_late_reply_is_ignored() {
        let popup = runtime(RuntimeContext::Popup);
        let forwarded = Rc::new(RefCell::new(Vec::new()));
        let sink = forwarded.clone();
        popup.set_forwarder(move |envelope| {
            sink.borrow_mut().push(envelope);
            Ok(())
        });

        let pending = popup.send_message("slow", json!(null), "background");
        let transaction_id = forwarded.borrow()[0].transaction_id.clone();
        assert!(popup.end_transaction(&transaction_id));
        assert!(!popup.end_transaction(&transaction_id));

        assert_eq!(
            pending.await,
            Err(BridgeError::TransactionEnded {
                transaction_id: transaction_id.clone()
            })
        );

        let late = Envelope {
            origin: Endpoint::new(RuntimeContext::Background),
            destination: Some(Endpoint::new(RuntimeContext::Popup)),
            transaction_id,
            hops: Vec::new(),
            message_id: "slow".to_string(),
            message_type: MessageType::Reply,
            data: json!("late"),
            err: None,
            timestamp: 0,
        };
        popup.handle_message(late).expect("ignored");
        assert_eq!(popup.pending_transactions(), 0);
    }
}
