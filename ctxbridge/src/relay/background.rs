//! # Routing
//!
//! ```text
//! spoke ──deliver──▶ origin tab/frame := connection identity
//!                    └─▶ background runtime ──non-local──▶ route()
//!
//! route(envelope):
//!   destination connected   → incoming to destination, receipt kept (request)
//!                             or dropped (reply), delivered to sender
//!   not connected, request:
//!     from background       → deferred until destination connects
//!     from a spoke          → undeliverable to sender + deliverable later
//! ```
//!
//! # Sessions
//!
//! A connection is one session, identified by the fingerprint the spoke
//! minted for it. A newer session for the same endpoint id supersedes the
//! entry; the superseded session keeps running until its own disconnect,
//! which then must not evict the newer one. When any session ends, receipts
//! addressed to it are swept: the requester is told the recipient terminated
//! (or, for the background itself, the transaction is ended).

use crate::endpoint::{Endpoint, Fingerprint, RuntimeContext};
use crate::error::{BridgeError, BridgeResult};
use crate::messaging::{EndpointRuntime, Envelope, MessageType, RemoteError};
use crate::port::{
    ConnectionArgs, DeliveryLedger, DeliveryReceipt, IncomingPort, PortWriter, ReceiptSender,
    RequestMessage, StatusMessage,
};
use crate::providers::{Providers, TaskProvider, TimeProvider};
use crate::waiters::{WaiterId, WaiterSet};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The switchboard between spokes.
pub struct BackgroundRelay<P: Providers> {
    inner: Rc<RelayInner<P>>,
}

impl<P: Providers> Clone for BackgroundRelay<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct RelayInner<P: Providers> {
    runtime: EndpointRuntime<P>,
    fingerprint: Fingerprint,
    state: RefCell<RelayState>,
    accept_task: RefCell<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct RelayState {
    connections: HashMap<String, Connection>,
    superseded: HashMap<Fingerprint, Connection>,
    ledger: DeliveryLedger,
    reachable: WaiterSet<String, ReachableWaiter>,
    session_end: WaiterSet<Fingerprint, SessionEndWaiter>,
}

struct Connection {
    fingerprint: Fingerprint,
    endpoint: Endpoint,
    writer: PortWriter,
    reader_task: JoinHandle<()>,
}

/// Runs when an endpoint id gets a connection.
enum ReachableWaiter {
    /// A background request held until its destination connects.
    Deliver { message: Envelope, sender_id: String },
    /// A spoke waiting to hear the destination is reachable.
    NotifyDeliverable {
        origin_id: String,
        origin_fingerprint: Fingerprint,
    },
}

/// Runs when a session ends.
enum SessionEndWaiter {
    SweepReceipts,
    CancelReachable { target: String, waiter: WaiterId },
}

impl<P: Providers> BackgroundRelay<P> {
    /// Start relaying for the background `runtime`, accepting connections
    /// from `listener`.
    ///
    /// Installs the runtime's forwarder and local-delivery hook. Must be
    /// called from within a `LocalSet`.
    pub fn start(
        runtime: EndpointRuntime<P>,
        mut listener: mpsc::UnboundedReceiver<IncomingPort>,
    ) -> Self {
        let inner = Rc::new(RelayInner {
            runtime: runtime.clone(),
            fingerprint: Fingerprint::mint(runtime.providers().random()),
            state: RefCell::new(RelayState::default()),
            accept_task: RefCell::new(None),
        });

        let relay = Rc::downgrade(&inner);
        runtime.set_forwarder(move |envelope| match relay.upgrade() {
            Some(relay) => relay.route(envelope),
            None => Err(BridgeError::PortClosed),
        });

        let relay = Rc::downgrade(&inner);
        runtime.set_local_delivery_hook(move |envelope| {
            if let Some(relay) = relay.upgrade() {
                relay.acknowledge_local(envelope);
            }
        });

        let relay = Rc::downgrade(&inner);
        let accept_task = runtime
            .providers()
            .task()
            .spawn_task("relay_accept", async move {
                while let Some(port) = listener.recv().await {
                    let Some(relay) = relay.upgrade() else {
                        return;
                    };
                    relay.accept(port);
                }
            });
        *inner.accept_task.borrow_mut() = Some(accept_task);

        tracing::debug!(fingerprint = %inner.fingerprint, "relay started");
        Self { inner }
    }

    /// Session fingerprint of the relay itself.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.inner.fingerprint
    }

    /// Whether `endpoint_id` has a live connection.
    pub fn is_connected(&self, endpoint_id: &str) -> bool {
        self.inner.state.borrow().connections.contains_key(endpoint_id)
    }

    /// Fingerprint of the current session for `endpoint_id`.
    pub fn connection_fingerprint(&self, endpoint_id: &str) -> Option<Fingerprint> {
        self.inner
            .state
            .borrow()
            .connections
            .get(endpoint_id)
            .map(|connection| connection.fingerprint.clone())
    }

    /// Ids of all current connections.
    pub fn connected_endpoints(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .state
            .borrow()
            .connections
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Requests delivered and awaiting replies.
    pub fn pending_receipts(&self) -> usize {
        self.inner.state.borrow().ledger.len()
    }

    /// Background requests waiting for their destination to connect.
    ///
    /// Spokes queue their own undeliverable requests; the relay only keeps a
    /// notice for them, which is not counted here.
    pub fn deferred_deliveries(&self) -> usize {
        self.inner
            .state
            .borrow()
            .reachable
            .iter()
            .filter(|waiter| matches!(waiter, ReachableWaiter::Deliver { .. }))
            .count()
    }

    /// Drop every connection and stop accepting new ones, as when the host
    /// evicts the coordinator.
    pub fn shutdown(&self) {
        if let Some(task) = self.inner.accept_task.borrow_mut().take() {
            task.abort();
        }
        let (connections, superseded) = {
            let mut state = self.inner.state.borrow_mut();
            (
                std::mem::take(&mut state.connections),
                std::mem::take(&mut state.superseded),
            )
        };
        for connection in connections.into_values().chain(superseded.into_values()) {
            connection.reader_task.abort();
        }
        tracing::debug!(fingerprint = %self.inner.fingerprint, "relay shut down");
    }
}

impl<P: Providers> RelayInner<P> {
    fn accept(self: &Rc<Self>, port: IncomingPort) {
        let IncomingPort {
            name,
            sender,
            writer,
            mut reader,
        } = port;

        let Some(args) = ConnectionArgs::decode(&name) else {
            tracing::debug!(name = %name, "dropping connection with malformed handshake");
            return;
        };
        let context = match RuntimeContext::from_name(&args.endpoint_name) {
            Some(RuntimeContext::Background) | Some(RuntimeContext::Window) | None => {
                tracing::debug!(endpoint = %args.endpoint_name, "dropping connection from unroutable context");
                return;
            }
            Some(context) => context,
        };
        let endpoint = if context.is_per_tab() {
            let Some(tab_id) = sender.tab_id else {
                tracing::debug!(endpoint = %args.endpoint_name, "dropping per-tab connection without a tab");
                return;
            };
            Endpoint {
                context,
                tab_id: Some(tab_id),
                frame_id: sender.frame_id,
            }
        } else {
            Endpoint::new(context)
        };
        let endpoint_id = endpoint.connection_id();
        let fingerprint = args.fingerprint;

        let relay: Weak<Self> = Rc::downgrade(self);
        let (session_id, session_fingerprint) = (endpoint_id.clone(), fingerprint.clone());
        let reader_task = self
            .runtime
            .providers()
            .task()
            .spawn_task("relay_connection", async move {
                while let Some(value) = reader.recv().await {
                    let Some(relay) = relay.upgrade() else {
                        return;
                    };
                    relay.handle_request(&session_id, &session_fingerprint, value);
                }
                if let Some(relay) = relay.upgrade() {
                    relay.handle_disconnect(&session_id, &session_fingerprint);
                }
            });

        let connection = Connection {
            fingerprint: fingerprint.clone(),
            endpoint,
            writer,
            reader_task,
        };
        let waiters = {
            let mut state = self.state.borrow_mut();
            match state.connections.remove(&endpoint_id) {
                Some(previous) if previous.fingerprint == fingerprint => {
                    // Same session on a new channel; the old channel's
                    // disconnect must not end the session.
                    previous.reader_task.abort();
                }
                Some(previous) => {
                    tracing::debug!(
                        endpoint = %endpoint_id,
                        previous = %previous.fingerprint,
                        current = %fingerprint,
                        "session superseded"
                    );
                    state
                        .superseded
                        .insert(previous.fingerprint.clone(), previous);
                }
                None => {}
            }
            state.connections.insert(endpoint_id.clone(), connection);
            state
                .session_end
                .add(fingerprint.clone(), SessionEndWaiter::SweepReceipts);
            state.reachable.drain(&endpoint_id)
        };

        tracing::debug!(endpoint = %endpoint_id, fingerprint = %fingerprint, "connection registered");

        for waiter in waiters {
            match waiter {
                ReachableWaiter::Deliver { message, sender_id } => {
                    if let Err(message) = self.deliver(message, &sender_id, &endpoint_id) {
                        self.state.borrow_mut().reachable.add(
                            endpoint_id.clone(),
                            ReachableWaiter::Deliver { message, sender_id },
                        );
                    }
                }
                ReachableWaiter::NotifyDeliverable {
                    origin_id,
                    origin_fingerprint,
                } => self.notify_deliverable(&origin_id, &origin_fingerprint, &endpoint_id),
            }
        }
    }

    fn handle_disconnect(&self, endpoint_id: &str, fingerprint: &Fingerprint) {
        let waiters = {
            let mut state = self.state.borrow_mut();
            let is_current = state
                .connections
                .get(endpoint_id)
                .is_some_and(|connection| connection.fingerprint == *fingerprint);
            if is_current {
                state.connections.remove(endpoint_id);
                tracing::debug!(endpoint = %endpoint_id, fingerprint = %fingerprint, "connection removed");
            } else {
                state.superseded.remove(fingerprint);
                tracing::debug!(endpoint = %endpoint_id, fingerprint = %fingerprint, "superseded session ended");
            }
            state.session_end.drain(fingerprint)
        };

        for waiter in waiters {
            match waiter {
                SessionEndWaiter::SweepReceipts => self.sweep_receipts(fingerprint),
                SessionEndWaiter::CancelReachable { target, waiter } => {
                    self.state.borrow_mut().reachable.cancel(&target, waiter);
                }
            }
        }
    }

    fn sweep_receipts(&self, ended: &Fingerprint) {
        let orphaned = self.state.borrow_mut().ledger.take_addressed_to(ended);
        for receipt in orphaned {
            let transaction_id = &receipt.message.transaction_id;
            if receipt.from.endpoint_id == RuntimeContext::Background.name() {
                self.runtime.end_transaction(transaction_id);
            } else {
                tracing::debug!(
                    sender = %receipt.from.endpoint_id,
                    transaction_id = %transaction_id,
                    "recipient session ended before replying"
                );
                self.post_to(
                    &receipt.from.endpoint_id,
                    &StatusMessage::Terminated {
                        fingerprint: ended.clone(),
                    },
                );
            }
        }
    }

    fn handle_request(&self, endpoint_id: &str, fingerprint: &Fingerprint, value: Value) {
        let request = match serde_json::from_value::<RequestMessage>(value) {
            Ok(request) => request,
            Err(err) => {
                tracing::debug!(endpoint = %endpoint_id, error = %err, "dropping malformed request");
                return;
            }
        };
        match request {
            RequestMessage::Sync {
                pending_responses,
                pending_deliveries,
            } => self.resync(endpoint_id, fingerprint, pending_responses, pending_deliveries),
            RequestMessage::Deliver { message } => {
                self.accept_envelope(endpoint_id, fingerprint, message)
            }
        }
    }

    fn accept_envelope(&self, endpoint_id: &str, fingerprint: &Fingerprint, mut message: Envelope) {
        let linked = {
            let state = self.state.borrow();
            state
                .connections
                .get(endpoint_id)
                .filter(|connection| connection.fingerprint == *fingerprint)
                .or_else(|| state.superseded.get(fingerprint))
                .map(|connection| connection.endpoint.clone())
        };
        let Some(linked) = linked else {
            return;
        };

        // Identity comes from the host, never from the envelope.
        message.origin.tab_id = linked.tab_id;
        message.origin.frame_id = linked.frame_id;

        let request = message.is_request().then(|| message.clone());
        if let Err(err) = self.runtime.handle_message(message) {
            if let Some(request) = request {
                self.reject(request, err);
            }
        }
    }

    /// Answer a spoke request the relay cannot route.
    fn reject(&self, request: Envelope, err: BridgeError) {
        tracing::debug!(
            transaction_id = %request.transaction_id,
            error = %err,
            "rejecting unroutable request"
        );
        let reply = Envelope {
            origin: Endpoint::new(RuntimeContext::Background),
            destination: Some(request.origin),
            transaction_id: request.transaction_id,
            hops: Vec::new(),
            message_id: request.message_id,
            message_type: MessageType::Reply,
            data: Value::Null,
            err: Some(RemoteError::type_error(err.to_string()).to_serialized()),
            timestamp: self.runtime.providers().time().unix_millis(),
        };
        if let Err(err) = self.runtime.handle_message(reply) {
            tracing::warn!(error = %err, "failed to send rejection");
        }
    }

    fn resync(
        &self,
        endpoint_id: &str,
        fingerprint: &Fingerprint,
        pending_responses: Vec<DeliveryReceipt>,
        pending_deliveries: Vec<String>,
    ) {
        let mut terminated: Vec<Fingerprint> = Vec::new();
        {
            let mut state = self.state.borrow_mut();
            let live: HashSet<Fingerprint> = state
                .connections
                .values()
                .chain(state.superseded.values())
                .map(|connection| connection.fingerprint.clone())
                .chain(std::iter::once(self.fingerprint.clone()))
                .collect();

            for mut receipt in pending_responses {
                if live.contains(&receipt.to) {
                    receipt.from = ReceiptSender {
                        endpoint_id: endpoint_id.to_string(),
                        fingerprint: Some(fingerprint.clone()),
                    };
                    state.ledger.add(receipt);
                } else if !terminated.contains(&receipt.to) {
                    terminated.push(receipt.to);
                }
            }
        }

        tracing::debug!(
            endpoint = %endpoint_id,
            terminated = terminated.len(),
            waiting = pending_deliveries.len(),
            "resync"
        );
        for ended in terminated {
            self.post_to(endpoint_id, &StatusMessage::Terminated { fingerprint: ended });
        }
        for destination in pending_deliveries {
            self.notify_when_deliverable(endpoint_id, fingerprint, &destination);
        }
    }

    fn route(&self, mut message: Envelope) -> BridgeResult<()> {
        let Some(destination) = message.destination.clone() else {
            return Ok(());
        };
        let tab_id = destination.tab_id.or(message.origin.tab_id);
        if destination.context.is_per_tab() && tab_id.is_none() {
            return Err(BridgeError::MissingTabId {
                destination: destination.to_string(),
            });
        }

        let sender_id = message.origin.connection_id();
        let destination_id = Endpoint {
            tab_id,
            ..destination
        }
        .connection_id();

        if let Some(destination) = message.destination.as_mut() {
            destination.tab_id = None;
            destination.frame_id = None;
        }

        let message = match self.deliver(message, &sender_id, &destination_id) {
            Ok(()) => return Ok(()),
            Err(message) => message,
        };

        if !message.is_request() {
            tracing::debug!(
                destination = %destination_id,
                transaction_id = %message.transaction_id,
                "dropping reply for unreachable destination"
            );
            return Ok(());
        }

        if message.origin.context == RuntimeContext::Background {
            tracing::debug!(destination = %destination_id, "deferring delivery until destination connects");
            self.state.borrow_mut().reachable.add(
                destination_id,
                ReachableWaiter::Deliver { message, sender_id },
            );
            return Ok(());
        }

        let Some(sender_fingerprint) = self.current_fingerprint(&sender_id) else {
            tracing::debug!(sender = %sender_id, "sender disconnected, dropping request");
            return Ok(());
        };
        // The sender replays this envelope once the destination connects, so
        // it goes back the way the sender posted it.
        let mut message = message;
        message.destination = Some(destination);
        message.hops.retain(|hop| hop != self.runtime.hop_id());
        tracing::debug!(
            sender = %sender_id,
            destination = %destination_id,
            transaction_id = %message.transaction_id,
            "destination unreachable"
        );
        self.post_to(
            &sender_id,
            &StatusMessage::Undeliverable {
                resolved_destination: destination_id.clone(),
                message,
            },
        );
        self.notify_when_deliverable(&sender_id, &sender_fingerprint, &destination_id);
        Ok(())
    }

    /// Hand `message` to `destination_id`, or give it back when there is no
    /// working connection.
    fn deliver(
        &self,
        message: Envelope,
        sender_id: &str,
        destination_id: &str,
    ) -> Result<(), Envelope> {
        let receipt = {
            let mut state = self.state.borrow_mut();
            let Some(connection) = state.connections.get(destination_id) else {
                return Err(message);
            };
            let to = connection.fingerprint.clone();
            let incoming = StatusMessage::Incoming {
                message: message.clone(),
            };
            if let Err(err) = connection.writer.post(&incoming) {
                tracing::debug!(destination = %destination_id, error = %err, "delivery failed");
                return Err(message);
            }

            let receipt = DeliveryReceipt {
                message,
                to,
                from: ReceiptSender {
                    endpoint_id: sender_id.to_string(),
                    fingerprint: state
                        .connections
                        .get(sender_id)
                        .map(|connection| connection.fingerprint.clone()),
                },
            };
            match receipt.message.message_type {
                MessageType::Message => state.ledger.add(receipt.clone()),
                MessageType::Reply => {
                    state
                        .ledger
                        .remove_transaction(&receipt.message.transaction_id);
                }
            }
            receipt
        };

        tracing::debug!(
            sender = %sender_id,
            destination = %destination_id,
            transaction_id = %receipt.message.transaction_id,
            "delivered"
        );
        if receipt.from.fingerprint.is_some() {
            self.post_to(sender_id, &StatusMessage::Delivered { receipt });
        }
        Ok(())
    }

    /// Receipts for envelopes the background consumed itself.
    fn acknowledge_local(&self, envelope: &Envelope) {
        match envelope.message_type {
            MessageType::Reply => {
                self.state
                    .borrow_mut()
                    .ledger
                    .remove_transaction(&envelope.transaction_id);
            }
            MessageType::Message => {
                let sender_id = envelope.origin.connection_id();
                let Some(sender_fingerprint) = self.current_fingerprint(&sender_id) else {
                    return;
                };
                let receipt = DeliveryReceipt {
                    message: envelope.clone(),
                    to: self.fingerprint.clone(),
                    from: ReceiptSender {
                        endpoint_id: sender_id.clone(),
                        fingerprint: Some(sender_fingerprint),
                    },
                };
                self.post_to(&sender_id, &StatusMessage::Delivered { receipt });
            }
        }
    }

    fn notify_when_deliverable(&self, origin_id: &str, origin_fingerprint: &Fingerprint, target: &str) {
        if self.current_fingerprint(target).is_some() {
            self.notify_deliverable(origin_id, origin_fingerprint, target);
            return;
        }
        let mut state = self.state.borrow_mut();
        let waiter = state.reachable.add(
            target.to_string(),
            ReachableWaiter::NotifyDeliverable {
                origin_id: origin_id.to_string(),
                origin_fingerprint: origin_fingerprint.clone(),
            },
        );
        state.session_end.add(
            origin_fingerprint.clone(),
            SessionEndWaiter::CancelReachable {
                target: target.to_string(),
                waiter,
            },
        );
    }

    fn notify_deliverable(&self, origin_id: &str, origin_fingerprint: &Fingerprint, target: &str) {
        if self.current_fingerprint(origin_id).as_ref() != Some(origin_fingerprint) {
            return;
        }
        self.post_to(
            origin_id,
            &StatusMessage::Deliverable {
                deliverable_to: target.to_string(),
            },
        );
    }

    fn current_fingerprint(&self, endpoint_id: &str) -> Option<Fingerprint> {
        self.state
            .borrow()
            .connections
            .get(endpoint_id)
            .map(|connection| connection.fingerprint.clone())
    }

    fn post_to(&self, endpoint_id: &str, status: &StatusMessage) {
        let state = self.state.borrow();
        let Some(connection) = state.connections.get(endpoint_id) else {
            return;
        };
        if let Err(err) = connection.writer.post(status) {
            tracing::debug!(endpoint = %endpoint_id, error = %err, "failed to notify spoke");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{HostConnector, HostPort, MemoryHost, PortSender};
    use crate::providers::TokioProviders;
    use serde_json::json;
    use tokio::task::LocalSet;

    fn start(host: &MemoryHost) -> BackgroundRelay<TokioProviders> {
        let runtime = EndpointRuntime::new(RuntimeContext::Background, TokioProviders::new());
        BackgroundRelay::start(runtime, host.listen())
    }

    fn raw_spoke(host: &MemoryHost, sender: PortSender, name: &str, token: &str) -> HostPort {
        let args = ConnectionArgs {
            endpoint_name: name.to_string(),
            fingerprint: Fingerprint::from_token(token),
        };
        host.connector(sender)
            .connect(&args.encode().expect("encode"))
            .expect("connect")
    }

    fn request(from: RuntimeContext, to: &str, transaction_id: &str) -> Envelope {
        Envelope {
            origin: Endpoint::new(from),
            destination: Some(Endpoint::parse(to).into_endpoint().expect("endpoint")),
            transaction_id: transaction_id.to_string(),
            hops: vec![format!("{from}::spoke")],
            message_id: "topic".to_string(),
            message_type: MessageType::Message,
            data: json!(null),
            err: None,
            timestamp: 0,
        }
    }

    fn deliver(port: &HostPort, envelope: Envelope) {
        port.writer
            .post(&RequestMessage::Deliver { message: envelope })
            .expect("post");
    }

    async fn next_status(port: &mut HostPort) -> StatusMessage {
        let value = port.reader.recv().await.expect("status");
        serde_json::from_value(value).expect("decode status")
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_malformed_and_unroutable_handshakes_are_dropped() {
        LocalSet::new()
            .run_until(async {
                let host = MemoryHost::new();
                let relay = start(&host);

                let _junk = host
                    .connector(PortSender::tab(1))
                    .connect("content-script")
                    .expect("connect");
                let _window = raw_spoke(&host, PortSender::tab(1), "window", "uid::w000000");
                let _tabless = raw_spoke(&host, PortSender::extension_page(), "devtools", "uid::d000000");
                settle().await;

                assert!(relay.connected_endpoints().is_empty());
            })
            .await;
    }

    #[tokio::test]
    async fn test_identity_comes_from_host() {
        LocalSet::new()
            .run_until(async {
                let host = MemoryHost::new();
                let relay = start(&host);

                let _cs = raw_spoke(&host, PortSender::frame(7, 2), "content-script", "uid::c000000");
                let _top = raw_spoke(&host, PortSender::tab(7), "content-script", "uid::c000001");
                let _popup = raw_spoke(&host, PortSender::tab(3), "popup", "uid::p000000");
                settle().await;

                assert_eq!(
                    relay.connected_endpoints(),
                    vec!["content-script@7", "content-script@7.2", "popup"]
                );
            })
            .await;
    }

    #[tokio::test]
    async fn test_stale_disconnect_keeps_current_session() {
        LocalSet::new()
            .run_until(async {
                let host = MemoryHost::new();
                let relay = start(&host);

                let stale = raw_spoke(&host, PortSender::tab(4), "content-script", "uid::old0000");
                settle().await;
                let _current = raw_spoke(&host, PortSender::tab(4), "content-script", "uid::new0000");
                settle().await;
                assert_eq!(
                    relay.connection_fingerprint("content-script@4"),
                    Some(Fingerprint::from_token("uid::new0000"))
                );

                drop(stale);
                settle().await;
                assert_eq!(
                    relay.connection_fingerprint("content-script@4"),
                    Some(Fingerprint::from_token("uid::new0000"))
                );
            })
            .await;
    }

    #[tokio::test]
    async fn test_undeliverable_then_deliverable() {
        LocalSet::new()
            .run_until(async {
                let host = MemoryHost::new();
                let relay = start(&host);

                let mut popup = raw_spoke(&host, PortSender::extension_page(), "popup", "uid::p000000");
                settle().await;
                deliver(&popup, request(RuntimeContext::Popup, "options", "t1"));

                let StatusMessage::Undeliverable {
                    resolved_destination,
                    message,
                } = next_status(&mut popup).await
                else {
                    panic!("expected undeliverable");
                };
                assert_eq!(resolved_destination, "options");
                assert_eq!(message.transaction_id, "t1");
                assert_eq!(message.destination, Some(Endpoint::new(RuntimeContext::Options)));
                assert_eq!(message.hops, vec!["popup::spoke".to_string()]);
                assert_eq!(relay.deferred_deliveries(), 0);

                let _options = raw_spoke(&host, PortSender::extension_page(), "options", "uid::o000000");
                assert_eq!(
                    next_status(&mut popup).await,
                    StatusMessage::Deliverable {
                        deliverable_to: "options".to_string()
                    }
                );
                assert!(relay.is_connected("options"));
            })
            .await;
    }

    #[tokio::test]
    async fn test_delivery_receipt_and_termination() {
        LocalSet::new()
            .run_until(async {
                let host = MemoryHost::new();
                let relay = start(&host);

                let mut popup = raw_spoke(&host, PortSender::extension_page(), "popup", "uid::p000000");
                let mut cs = raw_spoke(&host, PortSender::tab(9), "content-script", "uid::c000000");
                settle().await;

                deliver(&popup, request(RuntimeContext::Popup, "content-script@9", "t1"));
                let StatusMessage::Incoming { message } = next_status(&mut cs).await else {
                    panic!("expected incoming");
                };
                assert_eq!(message.destination, Some(Endpoint::new(RuntimeContext::ContentScript)));

                let StatusMessage::Delivered { receipt } = next_status(&mut popup).await else {
                    panic!("expected delivered");
                };
                assert_eq!(receipt.to, Fingerprint::from_token("uid::c000000"));
                assert_eq!(relay.pending_receipts(), 1);

                drop(cs);
                assert_eq!(
                    next_status(&mut popup).await,
                    StatusMessage::Terminated {
                        fingerprint: Fingerprint::from_token("uid::c000000")
                    }
                );
                assert_eq!(relay.pending_receipts(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_tabless_per_tab_destination_is_rejected() {
        LocalSet::new()
            .run_until(async {
                let host = MemoryHost::new();
                let relay = start(&host);
                let mut popup = raw_spoke(&host, PortSender::extension_page(), "popup", "uid::p000000");
                settle().await;

                deliver(&popup, request(RuntimeContext::Popup, "content-script", "t1"));
                let StatusMessage::Incoming { message } = next_status(&mut popup).await else {
                    panic!("expected rejection reply");
                };
                assert_eq!(message.message_type, MessageType::Reply);
                assert_eq!(message.err.expect("error").name, "TypeError");
                assert_eq!(relay.deferred_deliveries(), 0);
            })
            .await;
    }
}
