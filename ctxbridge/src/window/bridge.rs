//! Namespaced rendezvous between the page and its content script.
//!
//! # Handshake
//!
//! ```text
//! both sides:  subscribe to the page broadcast
//! page side:   yield one tick first
//! loop:
//!   foreign offer in our namespace pending? → ack "port-accepted" on it, done
//!   broadcast {cmd: "webext-port-offer", scope, context} + fresh port
//!   wait for: ack on our port            → done, ours won
//!             foreign offer              → ack it, ours abandoned
//!             port_offer_retry elapsed   → offer again
//! ```
//!
//! Only offers travel over the broadcast channel. Envelopes posted while the
//! handshake runs are buffered and flushed in order once linked.

use super::page::{message_channel, MessagePort, PageWindow, WindowEvent};
use crate::config::BridgeConfig;
use crate::endpoint::RuntimeContext;
use crate::error::{BridgeError, BridgeResult};
use crate::messaging::Envelope;
use crate::providers::{Providers, TaskProvider, TimeProvider};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tokio::task::JoinHandle;

const PORT_OFFER: &str = "webext-port-offer";
const PORT_ACCEPTED: &str = "port-accepted";

#[derive(Debug, Serialize, Deserialize)]
struct PortOffer {
    cmd: String,
    scope: String,
    context: RuntimeContext,
}

type EnvelopeListener = Rc<dyn Fn(Envelope)>;

/// The page↔content-script transport.
pub struct WindowBridge<P: Providers> {
    inner: Rc<BridgeInner<P>>,
}

impl<P: Providers> Clone for WindowBridge<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct BridgeInner<P: Providers> {
    context: RuntimeContext,
    window: PageWindow,
    providers: P,
    config: BridgeConfig,
    namespace: RefCell<Option<String>>,
    enabled: Cell<bool>,
    link: RefCell<Link>,
    listeners: RefCell<Vec<EnvelopeListener>>,
}

enum Link {
    Idle,
    Connecting {
        outbox: Vec<Envelope>,
        task: JoinHandle<()>,
    },
    Linked {
        port: MessagePort,
        reader_task: JoinHandle<()>,
    },
}

impl<P: Providers> WindowBridge<P> {
    /// Create the bridge for the page (`window`) or `content-script` side.
    pub fn new(
        context: RuntimeContext,
        window: PageWindow,
        providers: P,
        config: BridgeConfig,
    ) -> BridgeResult<Self> {
        if !matches!(
            context,
            RuntimeContext::Window | RuntimeContext::ContentScript
        ) {
            return Err(BridgeError::UnsupportedContext {
                operation: "window bridge",
                context: context.to_string(),
            });
        }
        Ok(Self {
            inner: Rc::new(BridgeInner {
                context,
                window,
                providers,
                config,
                namespace: RefCell::new(None),
                enabled: Cell::new(false),
                link: RefCell::new(Link::Idle),
                listeners: RefCell::new(Vec::new()),
            }),
        })
    }

    /// Set the namespace isolating this bridge from other instances on the
    /// page. Can be set once.
    pub fn set_namespace(&self, namespace: impl Into<String>) -> BridgeResult<()> {
        {
            let mut current = self.inner.namespace.borrow_mut();
            if current.is_some() {
                return Err(BridgeError::NamespaceAlreadySet);
            }
            *current = Some(namespace.into());
        }
        self.inner.link_eagerly();
        Ok(())
    }

    /// Allow messaging across the bridge.
    pub fn enable(&self) {
        self.inner.enabled.set(true);
        self.inner.link_eagerly();
    }

    /// The namespace, once set.
    pub fn namespace(&self) -> Option<String> {
        self.inner.namespace.borrow().clone()
    }

    /// Whether the private channel is established.
    pub fn is_linked(&self) -> bool {
        matches!(*self.inner.link.borrow(), Link::Linked { .. })
    }

    /// Listen for envelopes from the other side.
    pub fn on_message(&self, listener: impl Fn(Envelope) + 'static) {
        self.inner.listeners.borrow_mut().push(Rc::new(listener));
    }

    /// Send an envelope to the other side, buffering it until linked.
    pub fn post_message(&self, envelope: Envelope) -> BridgeResult<()> {
        if !self.inner.enabled.get() {
            return Err(BridgeError::WindowMessagingNotAllowed);
        }
        if self.inner.namespace.borrow().is_none() {
            return Err(BridgeError::NamespaceNotSet);
        }
        self.inner.post(envelope)
    }
}

impl<P: Providers> BridgeInner<P> {
    fn post(self: &Rc<Self>, envelope: Envelope) -> BridgeResult<()> {
        let mut link = self.link.borrow_mut();
        match &mut *link {
            Link::Linked { port, reader_task } => {
                let value = serde_json::to_value(&envelope)?;
                if port.post_message(value).is_ok() {
                    return Ok(());
                }
                tracing::debug!(context = %self.context, "window link lost, re-establishing");
                reader_task.abort();
                *link = Link::Idle;
                drop(link);
                self.connect(vec![envelope]);
                Ok(())
            }
            Link::Connecting { outbox, .. } => {
                outbox.push(envelope);
                Ok(())
            }
            Link::Idle => {
                drop(link);
                self.connect(vec![envelope]);
                Ok(())
            }
        }
    }

    fn link_eagerly(self: &Rc<Self>) {
        let ready = self.enabled.get() && self.namespace.borrow().is_some();
        if ready && matches!(*self.link.borrow(), Link::Idle) {
            self.connect(Vec::new());
        }
    }

    fn connect(self: &Rc<Self>, outbox: Vec<Envelope>) {
        let bridge = self.clone();
        let task = self
            .providers
            .task()
            .spawn_task("window_bridge_rendezvous", async move {
                if let Some(port) = bridge.rendezvous().await {
                    bridge.linked(port);
                }
            });
        *self.link.borrow_mut() = Link::Connecting { outbox, task };
    }

    async fn rendezvous(&self) -> Option<MessagePort> {
        let namespace = self.namespace.borrow().clone()?;
        let mut events = self.window.subscribe();

        if self.context == RuntimeContext::Window {
            tokio::task::yield_now().await;
        }

        loop {
            while let Ok(event) = events.try_recv() {
                if let Some(port) = self.accept_offer(&namespace, event) {
                    return Some(port);
                }
            }

            let (local, remote) = message_channel();
            let mut acks = local.take_receiver()?;
            let offer = PortOffer {
                cmd: PORT_OFFER.to_string(),
                scope: namespace.clone(),
                context: self.context,
            };
            let offer = match serde_json::to_value(&offer) {
                Ok(offer) => offer,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to encode port offer");
                    return None;
                }
            };
            tracing::debug!(context = %self.context, namespace = %namespace, "offering port");
            self.window.post_message(offer, vec![remote]);

            let mut retry = self.providers.time().sleep(self.config.port_offer_retry);
            let mut acks_open = true;
            loop {
                // An acknowledged offer of ours wins over any foreign offer
                // seen in the same tick, so both sides pick the same channel.
                tokio::select! {
                    biased;
                    ack = acks.recv(), if acks_open => match ack {
                        Some(Value::String(ack)) if ack == PORT_ACCEPTED => {
                            local.restore_receiver(acks);
                            tracing::debug!(context = %self.context, "port offer accepted");
                            return Some(local);
                        }
                        Some(_) => {}
                        None => acks_open = false,
                    },
                    Some(event) = events.recv() => {
                        if let Ok(Value::String(ack)) = acks.try_recv() {
                            if ack == PORT_ACCEPTED {
                                local.restore_receiver(acks);
                                return Some(local);
                            }
                        }
                        if let Some(port) = self.accept_offer(&namespace, event) {
                            return Some(port);
                        }
                    }
                    _ = &mut retry => break,
                }
            }
        }
    }

    fn accept_offer(&self, namespace: &str, event: WindowEvent) -> Option<MessagePort> {
        let offer: PortOffer = serde_json::from_value(event.data).ok()?;
        if offer.cmd != PORT_OFFER || offer.scope != namespace || offer.context == self.context {
            return None;
        }
        let port = event.ports.into_iter().next()?;
        port.post_message(Value::String(PORT_ACCEPTED.to_string()))
            .ok()?;
        tracing::debug!(context = %self.context, from = %offer.context, "accepted port offer");
        Some(port)
    }

    fn linked(self: &Rc<Self>, port: MessagePort) {
        let Some(mut reader) = port.take_receiver() else {
            tracing::warn!(context = %self.context, "port receiver already taken");
            *self.link.borrow_mut() = Link::Idle;
            return;
        };

        let bridge = Rc::downgrade(self);
        let reader_task = self
            .providers
            .task()
            .spawn_task("window_bridge_reader", async move {
                while let Some(value) = reader.recv().await {
                    let Some(bridge) = bridge.upgrade() else {
                        return;
                    };
                    bridge.receive(value);
                }
                if let Some(bridge) = bridge.upgrade() {
                    tracing::debug!(context = %bridge.context, "window link closed");
                    *bridge.link.borrow_mut() = Link::Idle;
                }
            });

        let previous = std::mem::replace(
            &mut *self.link.borrow_mut(),
            Link::Linked {
                port: port.clone(),
                reader_task,
            },
        );
        let outbox = match previous {
            Link::Connecting { outbox, .. } => outbox,
            _ => Vec::new(),
        };
        let mut outbox = outbox.into_iter();
        while let Some(envelope) = outbox.next() {
            let value = match serde_json::to_value(&envelope) {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(context = %self.context, error = %err, "failed to encode buffered envelope");
                    continue;
                }
            };
            if port.post_message(value).is_err() {
                tracing::debug!(context = %self.context, "window link lost while flushing, re-establishing");
                let previous = std::mem::replace(&mut *self.link.borrow_mut(), Link::Idle);
                if let Link::Linked { reader_task, .. } = previous {
                    reader_task.abort();
                }
                let mut requeued = vec![envelope];
                requeued.extend(outbox);
                self.connect(requeued);
                return;
            }
        }
    }

    fn receive(&self, value: Value) {
        if value.as_str() == Some(PORT_ACCEPTED) {
            return;
        }
        let envelope = match Envelope::from_value(value) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::debug!(context = %self.context, error = %err, "dropping malformed window message");
                return;
            }
        };
        let listeners = self.listeners.borrow().clone();
        for listener in listeners {
            listener(envelope.clone());
        }
    }
}

impl<P: Providers> Drop for BridgeInner<P> {
    fn drop(&mut self) {
        match std::mem::replace(self.link.get_mut(), Link::Idle) {
            Link::Connecting { task, .. } => task.abort(),
            Link::Linked { reader_task, .. } => reader_task.abort(),
            Link::Idle => {}
        }
    }
}
