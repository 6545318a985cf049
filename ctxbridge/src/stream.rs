//! Long-lived bidirectional streams.
//!
//! Streams ride on two private topics:
//! - `__crx_bridge_stream_open__` `{streamId, channel}`: answered once the
//!   receiving side has claimed the channel
//! - `__crx_bridge_stream_transfer__` `{streamId, action, streamTransfer}`:
//!   `action` is `transfer` or `close`
//!
//! An open request for a channel nobody has claimed yet waits until
//! [`StreamWirings::on_open_stream_channel`] claims it.

use crate::endpoint::{Destination, Endpoint};
use crate::error::{BridgeError, BridgeResult};
use crate::messaging::{BridgeMessage, EndpointRuntime, RemoteError};
use crate::providers::{Providers, RandomProvider, TaskProvider};
use crate::waiters::WaiterSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::rc::{Rc, Weak};
use tokio::sync::oneshot;

/// Topic opening a stream.
pub const STREAM_OPEN_TOPIC: &str = "__crx_bridge_stream_open__";
/// Topic carrying stream traffic.
pub const STREAM_TRANSFER_TOPIC: &str = "__crx_bridge_stream_transfer__";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenRequest {
    stream_id: String,
    channel: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TransferAction {
    Transfer,
    Close,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferRequest {
    stream_id: String,
    action: TransferAction,
    #[serde(default)]
    stream_transfer: Value,
}

type StreamCallback<P> = Rc<dyn Fn(Stream<P>)>;
type ValueListener = Rc<dyn Fn(Value)>;
type CloseListener = Rc<dyn Fn()>;

/// Identifies a listener added to a [`Stream`], for [`Stream::remove_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Stream registry and channel claims for one runtime.
pub struct StreamWirings<P: Providers> {
    inner: Rc<WiringsInner<P>>,
}

impl<P: Providers> Clone for StreamWirings<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct WiringsInner<P: Providers> {
    runtime: EndpointRuntime<P>,
    streams: RefCell<HashMap<String, Stream<P>>>,
    opened_channels: RefCell<HashMap<String, String>>,
    claims: RefCell<HashMap<String, StreamCallback<P>>>,
    claim_waiters: RefCell<WaiterSet<String, oneshot::Sender<()>>>,
}

impl<P: Providers> StreamWirings<P> {
    /// Register the stream topics on `runtime`.
    pub fn new(runtime: EndpointRuntime<P>) -> Self {
        let inner = Rc::new(WiringsInner {
            runtime: runtime.clone(),
            streams: RefCell::new(HashMap::new()),
            opened_channels: RefCell::new(HashMap::new()),
            claims: RefCell::new(HashMap::new()),
            claim_waiters: RefCell::new(WaiterSet::new()),
        });

        let wirings = Rc::downgrade(&inner);
        runtime.on_message(STREAM_OPEN_TOPIC, move |message: BridgeMessage| {
            let wirings = wirings.clone();
            async move {
                let request: OpenRequest = serde_json::from_value(message.data)
                    .map_err(|err| RemoteError::type_error(err.to_string()))?;
                let wirings = wirings
                    .upgrade()
                    .ok_or_else(|| RemoteError::error("stream wirings dropped"))?;
                wirings.accept(request, message.sender).await?;
                Ok(Value::Bool(true))
            }
        });

        let wirings = Rc::downgrade(&inner);
        runtime.on_message(STREAM_TRANSFER_TOPIC, move |message: BridgeMessage| {
            let wirings = wirings.clone();
            async move {
                let request: TransferRequest = serde_json::from_value(message.data)
                    .map_err(|err| RemoteError::type_error(err.to_string()))?;
                let stream = wirings.upgrade().and_then(|wirings| {
                    let stream = wirings.streams.borrow().get(&request.stream_id).cloned();
                    stream
                });
                match stream {
                    Some(stream) if !stream.is_closed() => match request.action {
                        TransferAction::Transfer => stream.emit(request.stream_transfer),
                        TransferAction::Close => stream.handle_close(),
                    },
                    _ => tracing::debug!(stream_id = %request.stream_id, "transfer for unknown stream"),
                }
                Ok(Value::Null)
            }
        });

        Self { inner }
    }

    /// Open a stream on `channel` with `destination`.
    ///
    /// Resolves once the destination has claimed the channel.
    pub fn open_stream(
        &self,
        channel: &str,
        destination: impl Into<Destination>,
    ) -> impl Future<Output = BridgeResult<Stream<P>>> + 'static {
        let opened = self.begin_open(channel, destination.into());
        async move {
            let (stream, reply) = opened?;
            match reply.await {
                Ok(_) => Ok(stream),
                Err(err) => {
                    stream.handle_close();
                    Err(err)
                }
            }
        }
    }

    fn begin_open(
        &self,
        channel: &str,
        destination: Destination,
    ) -> BridgeResult<(Stream<P>, impl Future<Output = BridgeResult<Value>> + 'static)> {
        if self.inner.opened_channels.borrow().contains_key(channel) {
            return Err(BridgeError::StreamAlreadyOpen {
                channel: channel.to_string(),
            });
        }
        let endpoint = destination.resolve()?;
        let stream_id = self.inner.runtime.providers().random().random_id(21);
        let stream = Stream::new(
            &self.inner,
            stream_id.clone(),
            channel.to_string(),
            endpoint.clone(),
        );
        self.inner
            .opened_channels
            .borrow_mut()
            .insert(channel.to_string(), stream_id.clone());

        let request = serde_json::to_value(OpenRequest {
            stream_id,
            channel: channel.to_string(),
        })?;
        let reply = self
            .inner
            .runtime
            .send_message(STREAM_OPEN_TOPIC, request, endpoint);
        Ok((stream, reply))
    }

    /// Claim `channel`: `callback` receives every stream opened on it.
    ///
    /// A channel can be claimed once.
    pub fn on_open_stream_channel(
        &self,
        channel: &str,
        callback: impl Fn(Stream<P>) + 'static,
    ) -> BridgeResult<()> {
        {
            let mut claims = self.inner.claims.borrow_mut();
            if claims.contains_key(channel) {
                return Err(BridgeError::ChannelAlreadyClaimed {
                    channel: channel.to_string(),
                });
            }
            claims.insert(channel.to_string(), Rc::new(callback));
        }
        let waiters = self
            .inner
            .claim_waiters
            .borrow_mut()
            .drain(&channel.to_string());
        for waiter in waiters {
            let _ = waiter.send(());
        }
        Ok(())
    }

    /// Number of open streams.
    pub fn open_streams(&self) -> usize {
        self.inner.streams.borrow().len()
    }
}

impl<P: Providers> WiringsInner<P> {
    async fn accept(self: &Rc<Self>, request: OpenRequest, sender: Endpoint) -> Result<(), RemoteError> {
        let callback = loop {
            if let Some(callback) = self.claims.borrow().get(&request.channel).cloned() {
                break callback;
            }
            let (tx, rx) = oneshot::channel();
            self.claim_waiters
                .borrow_mut()
                .add(request.channel.clone(), tx);
            tracing::debug!(channel = %request.channel, "waiting for channel claim");
            if rx.await.is_err() {
                return Err(RemoteError::error("stream wirings dropped"));
            }
        };

        let stream = Stream::new(self, request.stream_id, request.channel, sender);
        callback(stream);
        Ok(())
    }
}

/// Identity of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// Unique stream id shared by both ends.
    pub stream_id: String,
    /// Channel the stream was opened on.
    pub channel: String,
    /// The other end.
    pub endpoint: Endpoint,
}

/// One end of a stream.
pub struct Stream<P: Providers> {
    inner: Rc<StreamInner<P>>,
}

impl<P: Providers> Clone for Stream<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct StreamInner<P: Providers> {
    info: StreamInfo,
    runtime: EndpointRuntime<P>,
    wirings: Weak<WiringsInner<P>>,
    closed: Cell<bool>,
    next_listener: Cell<u64>,
    message_listeners: RefCell<Vec<(ListenerId, ValueListener)>>,
    close_listeners: RefCell<Vec<(ListenerId, CloseListener)>>,
}

impl<P: Providers> Stream<P> {
    fn new(wirings: &Rc<WiringsInner<P>>, stream_id: String, channel: String, endpoint: Endpoint) -> Self {
        let stream = Self {
            inner: Rc::new(StreamInner {
                info: StreamInfo {
                    stream_id: stream_id.clone(),
                    channel,
                    endpoint,
                },
                runtime: wirings.runtime.clone(),
                wirings: Rc::downgrade(wirings),
                closed: Cell::new(false),
                next_listener: Cell::new(0),
                message_listeners: RefCell::new(Vec::new()),
                close_listeners: RefCell::new(Vec::new()),
            }),
        };
        wirings
            .streams
            .borrow_mut()
            .insert(stream_id, stream.clone());
        stream
    }

    /// Stream identity.
    pub fn info(&self) -> &StreamInfo {
        &self.inner.info
    }

    /// Whether the stream was closed by either end.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Send a value to the other end.
    pub fn send(&self, value: Value) -> BridgeResult<()> {
        self.transfer(TransferAction::Transfer, value)
    }

    /// Close the stream, optionally sending a last value first.
    pub fn close(&self, last: Option<Value>) -> BridgeResult<()> {
        if let Some(last) = last {
            self.send(last)?;
        }
        if self.is_closed() {
            return Ok(());
        }
        self.handle_close();
        self.post(TransferAction::Close, Value::Null)
    }

    /// Listen for values from the other end.
    pub fn on_message(&self, listener: impl Fn(Value) + 'static) -> ListenerId {
        let id = self.listener_id();
        self.inner
            .message_listeners
            .borrow_mut()
            .push((id, Rc::new(listener)));
        id
    }

    /// Listen for the stream closing.
    pub fn on_close(&self, listener: impl Fn() + 'static) -> ListenerId {
        let id = self.listener_id();
        self.inner
            .close_listeners
            .borrow_mut()
            .push((id, Rc::new(listener)));
        id
    }

    /// Stop calling a listener added with [`Stream::on_message`] or
    /// [`Stream::on_close`]. Returns false if it was already gone.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut messages = self.inner.message_listeners.borrow_mut();
        let before = messages.len();
        messages.retain(|(listener_id, _)| *listener_id != id);
        if messages.len() != before {
            return true;
        }
        let mut closes = self.inner.close_listeners.borrow_mut();
        let before = closes.len();
        closes.retain(|(listener_id, _)| *listener_id != id);
        closes.len() != before
    }

    fn listener_id(&self) -> ListenerId {
        let next = self.inner.next_listener.get() + 1;
        self.inner.next_listener.set(next);
        ListenerId(next)
    }

    fn transfer(&self, action: TransferAction, value: Value) -> BridgeResult<()> {
        if self.is_closed() {
            return Err(BridgeError::StreamClosed {
                stream_id: self.inner.info.stream_id.clone(),
            });
        }
        self.post(action, value)
    }

    fn post(&self, action: TransferAction, value: Value) -> BridgeResult<()> {
        let request = serde_json::to_value(TransferRequest {
            stream_id: self.inner.info.stream_id.clone(),
            action,
            stream_transfer: value,
        })?;
        let reply = self.inner.runtime.send_message(
            STREAM_TRANSFER_TOPIC,
            request,
            self.inner.info.endpoint.clone(),
        );
        let stream_id = self.inner.info.stream_id.clone();
        self.inner
            .runtime
            .providers()
            .task()
            .spawn_task("stream_transfer", async move {
                if let Err(err) = reply.await {
                    tracing::debug!(stream_id = %stream_id, error = %err, "stream transfer failed");
                }
            });
        Ok(())
    }

    fn emit(&self, value: Value) {
        let listeners: Vec<ValueListener> = self
            .inner
            .message_listeners
            .borrow()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(value.clone());
        }
    }

    fn handle_close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        if let Some(wirings) = self.inner.wirings.upgrade() {
            wirings.streams.borrow_mut().remove(&self.inner.info.stream_id);
            let mut opened = wirings.opened_channels.borrow_mut();
            if opened.get(&self.inner.info.channel) == Some(&self.inner.info.stream_id) {
                opened.remove(&self.inner.info.channel);
            }
        }
        let listeners = std::mem::take(&mut *self.inner.close_listeners.borrow_mut());
        self.inner.message_listeners.borrow_mut().clear();
        for (_, listener) in listeners {
            listener();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::RuntimeContext;
    use crate::providers::TokioProviders;
    use serde_json::json;

    fn popup_wirings() -> StreamWirings<TokioProviders> {
        let runtime = EndpointRuntime::new(RuntimeContext::Popup, TokioProviders::new());
        // Swallow everything: open requests stay pending.
        runtime.set_forwarder(|_envelope| Ok(()));
        StreamWirings::new(runtime)
    }

    #[tokio::test]
    async fn test_channel_claimed_once() {
        let wirings = popup_wirings();
        wirings
            .on_open_stream_channel("logs", |_stream| {})
            .expect("first claim");
        assert_eq!(
            wirings.on_open_stream_channel("logs", |_stream| {}),
            Err(BridgeError::ChannelAlreadyClaimed {
                channel: "logs".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_channel_opened_once() {
        let wirings = popup_wirings();
        let _pending = wirings.open_stream("logs", "background");
        assert_eq!(wirings.open_streams(), 1);

        let second = wirings.open_stream("logs", "background").await;
        assert!(matches!(second, Err(BridgeError::StreamAlreadyOpen { .. })));
    }

    #[tokio::test]
    async fn test_invalid_destination() {
        let wirings = popup_wirings();
        let result = wirings.open_stream("logs", "nowhere").await;
        assert!(matches!(result, Err(BridgeError::InvalidDestination { .. })));
        assert_eq!(wirings.open_streams(), 0);
    }

    #[test]
    fn test_transfer_wire_shape() {
        let request = TransferRequest {
            stream_id: "s1".to_string(),
            action: TransferAction::Close,
            stream_transfer: Value::Null,
        };
        assert_eq!(
            serde_json::to_value(request).expect("serialize"),
            json!({"streamId": "s1", "action": "close", "streamTransfer": null})
        );
    }
}
