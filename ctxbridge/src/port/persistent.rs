//! Spoke-side connection to the relay that survives coordinator teardown.
//!
//! # Session lifecycle
//!
//! ```text
//! open_session:
//!   mint fingerprint → connect(name = {endpointName, fingerprint})
//!   → post sync {pendingResponses, pendingDeliveries} → spawn reader
//!
//! reader sees None (relay gone)   → open_session again
//! handle_page_restored()          → drop session, open_session again
//! ```
//!
//! A fresh fingerprint per session lets the relay tell a late disconnect of
//! the previous session apart from the current one.
//!
//! # Status handling
//!
//! | status          | effect                                                   |
//! |-----------------|----------------------------------------------------------|
//! | `undeliverable` | queue the request under its destination                  |
//! | `deliverable`   | replay the queued requests for that destination, once    |
//! | `delivered`     | keep the receipt of a request until its reply            |
//! | `incoming`      | drop the receipt if it is a reply, notify listeners      |
//! | `terminated`    | fail every request whose recipient had that fingerprint  |

use super::host::{HostConnector, HostPort, PortWriter};
use super::ledger::DeliveryLedger;
use super::protocol::{ConnectionArgs, QueuedMessage, RequestMessage, StatusMessage};
use crate::config::BridgeConfig;
use crate::endpoint::Fingerprint;
use crate::error::{BridgeError, BridgeResult};
use crate::messaging::{Envelope, MessageType};
use crate::providers::{Providers, TaskProvider};
use serde_json::Value;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tokio::task::JoinHandle;

type EnvelopeListener = Rc<dyn Fn(Envelope)>;

/// A spoke's logical connection to the relay.
pub struct PersistentPort<P: Providers> {
    inner: Rc<PortInner<P>>,
}

impl<P: Providers> Clone for PersistentPort<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct PortInner<P: Providers> {
    endpoint_name: String,
    connector: Rc<dyn HostConnector>,
    providers: P,
    config: BridgeConfig,
    state: RefCell<PortState>,
    message_listeners: RefCell<Vec<EnvelopeListener>>,
    failure_listeners: RefCell<Vec<EnvelopeListener>>,
}

#[derive(Default)]
struct PortState {
    session: Option<Session>,
    generation: u64,
    closed: bool,
    undelivered: Vec<QueuedMessage>,
    pending_responses: DeliveryLedger,
}

struct Session {
    fingerprint: Fingerprint,
    writer: PortWriter,
    reader_task: JoinHandle<()>,
}

impl<P: Providers> PersistentPort<P> {
    /// Connect to the relay as `endpoint_name`.
    ///
    /// Must be called from within a `LocalSet`.
    pub fn connect(
        endpoint_name: impl Into<String>,
        connector: Rc<dyn HostConnector>,
        providers: P,
        config: BridgeConfig,
    ) -> BridgeResult<Self> {
        let inner = Rc::new(PortInner {
            endpoint_name: endpoint_name.into(),
            connector,
            providers,
            config,
            state: RefCell::new(PortState::default()),
            message_listeners: RefCell::new(Vec::new()),
            failure_listeners: RefCell::new(Vec::new()),
        });
        inner.open_session()?;
        Ok(Self { inner })
    }

    /// Route an envelope through the relay.
    ///
    /// If the current connection turns out to be gone, the port reconnects and
    /// posts once more on the new session.
    pub fn post_message(&self, envelope: Envelope) -> BridgeResult<()> {
        self.inner.post_message(envelope)
    }

    /// Listen for envelopes addressed to this spoke.
    pub fn on_message(&self, listener: impl Fn(Envelope) + 'static) {
        self.inner
            .message_listeners
            .borrow_mut()
            .push(Rc::new(listener));
    }

    /// Listen for requests that will get no reply: their recipient's session
    /// ended first, or they were evicted from the full undelivered queue.
    pub fn on_failure(&self, listener: impl Fn(Envelope) + 'static) {
        self.inner
            .failure_listeners
            .borrow_mut()
            .push(Rc::new(listener));
    }

    /// Reconnect eagerly. Call when the host restored the page from a
    /// suspended state, since the relay may not have noticed the old
    /// connection died.
    pub fn handle_page_restored(&self) -> BridgeResult<()> {
        if self.inner.state.borrow().closed {
            return Ok(());
        }
        tracing::debug!(endpoint = %self.inner.endpoint_name, "page restored, reconnecting");
        self.inner.drop_session();
        self.inner.open_session()
    }

    /// Close the connection for good. No reconnect follows.
    pub fn close(&self) {
        self.inner.state.borrow_mut().closed = true;
        self.inner.drop_session();
    }

    /// Fingerprint of the current session.
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.inner
            .state
            .borrow()
            .session
            .as_ref()
            .map(|session| session.fingerprint.clone())
    }

    /// The context name announced in the handshake.
    pub fn endpoint_name(&self) -> &str {
        &self.inner.endpoint_name
    }

    /// Requests delivered but not yet answered.
    pub fn pending_responses(&self) -> usize {
        self.inner.state.borrow().pending_responses.len()
    }

    /// Requests waiting for their destination to connect.
    pub fn undelivered_len(&self) -> usize {
        self.inner.state.borrow().undelivered.len()
    }
}

impl<P: Providers> PortInner<P> {
    fn open_session(self: &Rc<Self>) -> BridgeResult<()> {
        let fingerprint = Fingerprint::mint(self.providers.random());
        let name = ConnectionArgs {
            endpoint_name: self.endpoint_name.clone(),
            fingerprint: fingerprint.clone(),
        }
        .encode()?;
        let HostPort {
            writer, mut reader, ..
        } = self.connector.connect(&name)?;

        let sync = {
            let state = self.state.borrow();
            let mut pending_deliveries: Vec<String> = Vec::new();
            for queued in &state.undelivered {
                if !pending_deliveries.contains(&queued.resolved_destination) {
                    pending_deliveries.push(queued.resolved_destination.clone());
                }
            }
            RequestMessage::Sync {
                pending_responses: state.pending_responses.entries().to_vec(),
                pending_deliveries,
            }
        };
        writer.post(&sync)?;

        let generation = {
            let mut state = self.state.borrow_mut();
            state.generation += 1;
            state.generation
        };

        let port: Weak<Self> = Rc::downgrade(self);
        let reader_task = self
            .providers
            .task()
            .spawn_task("persistent_port_reader", async move {
                while let Some(value) = reader.recv().await {
                    let Some(port) = port.upgrade() else {
                        return;
                    };
                    port.handle_status(value);
                }
                if let Some(port) = port.upgrade() {
                    port.handle_disconnect(generation);
                }
            });

        tracing::debug!(
            endpoint = %self.endpoint_name,
            fingerprint = %fingerprint,
            "persistent port connected"
        );
        self.state.borrow_mut().session = Some(Session {
            fingerprint,
            writer,
            reader_task,
        });
        Ok(())
    }

    fn drop_session(&self) {
        let session = self.state.borrow_mut().session.take();
        if let Some(session) = session {
            session.reader_task.abort();
        }
    }

    fn handle_disconnect(self: &Rc<Self>, generation: u64) {
        {
            let state = self.state.borrow();
            if state.closed || state.generation != generation {
                return;
            }
        }
        tracing::debug!(endpoint = %self.endpoint_name, "relay connection lost, reconnecting");
        self.state.borrow_mut().session = None;
        if let Err(err) = self.open_session() {
            tracing::warn!(endpoint = %self.endpoint_name, error = %err, "reconnect failed");
        }
    }

    fn post_message(self: &Rc<Self>, envelope: Envelope) -> BridgeResult<()> {
        let request = RequestMessage::Deliver { message: envelope };
        match self.post_request(&request) {
            Err(BridgeError::PortClosed) if !self.state.borrow().closed => {
                tracing::debug!(endpoint = %self.endpoint_name, "posting on a dead connection, reconnecting");
                self.drop_session();
                self.open_session()?;
                self.post_request(&request)
            }
            result => result,
        }
    }

    fn post_request(&self, request: &RequestMessage) -> BridgeResult<()> {
        let state = self.state.borrow();
        match state.session.as_ref() {
            Some(session) => session.writer.post(request),
            None => Err(BridgeError::PortClosed),
        }
    }

    fn handle_status(self: &Rc<Self>, value: Value) {
        let status = match serde_json::from_value::<StatusMessage>(value) {
            Ok(status) => status,
            Err(err) => {
                tracing::debug!(endpoint = %self.endpoint_name, error = %err, "dropping malformed status");
                return;
            }
        };

        match status {
            StatusMessage::Undeliverable {
                resolved_destination,
                message,
            } => self.queue_undelivered(resolved_destination, message),
            StatusMessage::Deliverable { deliverable_to } => {
                let replay: Vec<Envelope> = {
                    let mut state = self.state.borrow_mut();
                    let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.undelivered)
                        .into_iter()
                        .partition(|queued| queued.resolved_destination == deliverable_to);
                    state.undelivered = waiting;
                    ready.into_iter().map(|queued| queued.message).collect()
                };
                tracing::debug!(
                    endpoint = %self.endpoint_name,
                    destination = %deliverable_to,
                    count = replay.len(),
                    "replaying queued messages"
                );
                for message in replay {
                    if let Err(err) = self.post_message(message) {
                        tracing::warn!(endpoint = %self.endpoint_name, error = %err, "replay failed");
                    }
                }
            }
            StatusMessage::Delivered { receipt } => {
                if receipt.message.is_request() {
                    self.state.borrow_mut().pending_responses.add(receipt);
                }
            }
            StatusMessage::Incoming { message } => {
                if message.message_type == MessageType::Reply {
                    self.state
                        .borrow_mut()
                        .pending_responses
                        .remove_transaction(&message.transaction_id);
                }
                let listeners = self.message_listeners.borrow().clone();
                for listener in listeners {
                    listener(message.clone());
                }
            }
            StatusMessage::Terminated { fingerprint } => {
                let orphaned = self
                    .state
                    .borrow_mut()
                    .pending_responses
                    .take_addressed_to(&fingerprint);
                if orphaned.is_empty() {
                    return;
                }
                tracing::debug!(
                    endpoint = %self.endpoint_name,
                    fingerprint = %fingerprint,
                    count = orphaned.len(),
                    "recipient session terminated"
                );
                let listeners = self.failure_listeners.borrow().clone();
                for receipt in orphaned {
                    for listener in &listeners {
                        listener(receipt.message.clone());
                    }
                }
            }
        }
    }

    fn queue_undelivered(&self, resolved_destination: String, message: Envelope) {
        let evicted = self.enqueue_undelivered(resolved_destination, message);
        if let Some(evicted) = evicted {
            // The sender must still hear about it.
            let listeners = self.failure_listeners.borrow().clone();
            for listener in &listeners {
                listener(evicted.message.clone());
            }
        }
    }

    fn enqueue_undelivered(
        &self,
        resolved_destination: String,
        message: Envelope,
    ) -> Option<QueuedMessage> {
        let mut state = self.state.borrow_mut();
        if state
            .undelivered
            .iter()
            .any(|queued| queued.message.transaction_id == message.transaction_id)
        {
            return None;
        }
        let mut evicted = None;
        if state.undelivered.len() >= self.config.undelivered_queue_limit {
            let dropped = state.undelivered.remove(0);
            tracing::warn!(
                endpoint = %self.endpoint_name,
                transaction_id = %dropped.message.transaction_id,
                limit = self.config.undelivered_queue_limit,
                "undelivered queue full, failing oldest message"
            );
            evicted = Some(dropped);
        }
        tracing::debug!(
            endpoint = %self.endpoint_name,
            destination = %resolved_destination,
            transaction_id = %message.transaction_id,
            "queueing undeliverable message"
        );
        state.undelivered.push(QueuedMessage {
            resolved_destination,
            message,
        });
        evicted
    }
}

impl<P: Providers> Drop for PortInner<P> {
    fn drop(&mut self) {
        if let Some(session) = self.state.get_mut().session.take() {
            session.reader_task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Endpoint, RuntimeContext};
    use crate::port::{DeliveryReceipt, IncomingPort, MemoryHost, PortSender, ReceiptSender};
    use crate::providers::TokioProviders;
    use serde_json::json;
    use std::cell::RefCell;
    use tokio::sync::mpsc;
    use tokio::task::LocalSet;

    fn envelope(transaction_id: &str, message_type: MessageType) -> Envelope {
        Envelope {
            origin: Endpoint::new(RuntimeContext::Popup),
            destination: Some(Endpoint::in_tab(RuntimeContext::ContentScript, 3)),
            transaction_id: transaction_id.to_string(),
            hops: Vec::new(),
            message_id: "topic".to_string(),
            message_type,
            data: json!(null),
            err: None,
            timestamp: 0,
        }
    }

    fn connect(host: &MemoryHost) -> PersistentPort<TokioProviders> {
        PersistentPort::connect(
            "popup",
            Rc::new(host.connector(PortSender::extension_page())),
            TokioProviders::new(),
            BridgeConfig::testing(),
        )
        .expect("connect")
    }

    async fn accept(listener: &mut mpsc::UnboundedReceiver<IncomingPort>) -> (IncomingPort, Value) {
        let mut incoming = listener.recv().await.expect("incoming port");
        let sync = incoming.reader.recv().await.expect("sync");
        (incoming, sync)
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_connect_sends_handshake_and_sync() {
        LocalSet::new()
            .run_until(async {
                let host = MemoryHost::new();
                let mut listener = host.listen();
                let port = connect(&host);

                let (incoming, sync) = accept(&mut listener).await;
                let args = ConnectionArgs::decode(&incoming.name).expect("handshake");
                assert_eq!(args.endpoint_name, "popup");
                assert_eq!(Some(args.fingerprint), port.fingerprint());
                assert_eq!(
                    sync,
                    json!({"type": "sync", "pendingResponses": [], "pendingDeliveries": []})
                );
            })
            .await;
    }

    #[tokio::test]
    async fn test_deliverable_replays_only_matching_destination() {
        LocalSet::new()
            .run_until(async {
                let host = MemoryHost::new();
                let mut listener = host.listen();
                let port = connect(&host);
                let (mut incoming, _) = accept(&mut listener).await;

                for (tid, destination) in [("t1", "content-script@3"), ("t2", "options")] {
                    incoming
                        .writer
                        .post(&StatusMessage::Undeliverable {
                            resolved_destination: destination.to_string(),
                            message: envelope(tid, MessageType::Message),
                        })
                        .expect("post");
                }
                // A duplicate notice must not queue the message twice.
                incoming
                    .writer
                    .post(&StatusMessage::Undeliverable {
                        resolved_destination: "content-script@3".to_string(),
                        message: envelope("t1", MessageType::Message),
                    })
                    .expect("post");
                settle().await;
                assert_eq!(port.undelivered_len(), 2);

                incoming
                    .writer
                    .post(&StatusMessage::Deliverable {
                        deliverable_to: "content-script@3".to_string(),
                    })
                    .expect("post");
                settle().await;

                let replayed: RequestMessage =
                    serde_json::from_value(incoming.reader.recv().await.expect("replay"))
                        .expect("decode");
                let RequestMessage::Deliver { message } = replayed else {
                    panic!("expected deliver");
                };
                assert_eq!(message.transaction_id, "t1");
                assert!(incoming.reader.try_recv().is_err());
                assert_eq!(port.undelivered_len(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn test_terminated_fails_pending_requests() {
        LocalSet::new()
            .run_until(async {
                let host = MemoryHost::new();
                let mut listener = host.listen();
                let port = connect(&host);
                let failed = Rc::new(RefCell::new(Vec::new()));
                let sink = failed.clone();
                port.on_failure(move |envelope| sink.borrow_mut().push(envelope.transaction_id));
                let (incoming, _) = accept(&mut listener).await;

                for (tid, to) in [("t1", "uid::gone000"), ("t2", "uid::alive00")] {
                    incoming
                        .writer
                        .post(&StatusMessage::Delivered {
                            receipt: DeliveryReceipt {
                                message: envelope(tid, MessageType::Message),
                                to: Fingerprint::from_token(to),
                                from: ReceiptSender {
                                    endpoint_id: "popup".to_string(),
                                    fingerprint: port.fingerprint(),
                                },
                            },
                        })
                        .expect("post");
                }
                settle().await;
                assert_eq!(port.pending_responses(), 2);

                incoming
                    .writer
                    .post(&StatusMessage::Terminated {
                        fingerprint: Fingerprint::from_token("uid::gone000"),
                    })
                    .expect("post");
                settle().await;

                assert_eq!(*failed.borrow(), vec!["t1".to_string()]);
                assert_eq!(port.pending_responses(), 1);

                let mut reply = envelope("t2", MessageType::Reply);
                reply.destination = None;
                incoming
                    .writer
                    .post(&StatusMessage::Incoming { message: reply })
                    .expect("post");
                settle().await;
                assert_eq!(port.pending_responses(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_relay_loss_reconnects_with_fresh_fingerprint_and_snapshot() {
        LocalSet::new()
            .run_until(async {
                let host = MemoryHost::new();
                let mut listener = host.listen();
                let port = connect(&host);
                let (incoming, _) = accept(&mut listener).await;
                let first = port.fingerprint().expect("session");

                incoming
                    .writer
                    .post(&StatusMessage::Delivered {
                        receipt: DeliveryReceipt {
                            message: envelope("t1", MessageType::Message),
                            to: Fingerprint::from_token("uid::cs00000"),
                            from: ReceiptSender {
                                endpoint_id: "popup".to_string(),
                                fingerprint: Some(first.clone()),
                            },
                        },
                    })
                    .expect("post");
                incoming
                    .writer
                    .post(&StatusMessage::Undeliverable {
                        resolved_destination: "options".to_string(),
                        message: envelope("t2", MessageType::Message),
                    })
                    .expect("post");
                settle().await;

                drop(incoming);
                let (_incoming, sync) = accept(&mut listener).await;
                let second = port.fingerprint().expect("new session");
                assert_ne!(first, second);

                let RequestMessage::Sync {
                    pending_responses,
                    pending_deliveries,
                } = serde_json::from_value(sync).expect("decode")
                else {
                    panic!("expected sync");
                };
                assert_eq!(pending_responses.len(), 1);
                assert_eq!(pending_responses[0].message.transaction_id, "t1");
                assert_eq!(pending_deliveries, vec!["options".to_string()]);
            })
            .await;
    }

    #[tokio::test]
    async fn test_page_restored_and_close() {
        LocalSet::new()
            .run_until(async {
                let host = MemoryHost::new();
                let mut listener = host.listen();
                let port = connect(&host);
                let (mut first, _) = accept(&mut listener).await;
                let before = port.fingerprint();

                port.handle_page_restored().expect("reconnect");
                let (mut second, _) = accept(&mut listener).await;
                assert_ne!(port.fingerprint(), before);
                assert_eq!(first.reader.recv().await, None);

                port.close();
                assert_eq!(second.reader.recv().await, None);
                assert_eq!(port.fingerprint(), None);
                assert_eq!(
                    port.post_message(envelope("t9", MessageType::Message)),
                    Err(BridgeError::PortClosed)
                );
            })
            .await;
    }
}
