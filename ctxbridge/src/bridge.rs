//! Ready-made wiring for each context kind.
//!
//! | Context                                       | Transport                       |
//! |-----------------------------------------------|---------------------------------|
//! | `background`                                  | [`BackgroundRelay`]             |
//! | `devtools`, `popup`, `options`, `offscreen`, `sidepanel` | [`PersistentPort`]   |
//! | `content-script`                              | [`PersistentPort`] + [`WindowBridge`] |
//! | `window`                                      | [`WindowBridge`]                |

use crate::config::BridgeConfig;
use crate::endpoint::{Destination, Endpoint, RuntimeContext};
use crate::error::{BridgeError, BridgeResult};
use crate::messaging::{
    BridgeMessage, EndpointRuntime, Envelope, HandlerResult, MessageType, RemoteError,
};
use crate::port::{HostConnector, IncomingPort, PersistentPort};
use crate::providers::{Providers, TimeProvider};
use crate::relay::BackgroundRelay;
use crate::stream::{Stream, StreamWirings};
use crate::window::{PageWindow, WindowBridge};
use serde_json::Value;
use std::future::Future;
use std::rc::Rc;
use tokio::sync::mpsc;

enum Transport<P: Providers> {
    Relay(BackgroundRelay<P>),
    Port(PersistentPort<P>),
    ContentScript {
        port: PersistentPort<P>,
        window: WindowBridge<P>,
    },
    Page(WindowBridge<P>),
}

/// Messaging surface of one context.
///
/// Constructors must be called from within a `LocalSet`.
pub struct Bridge<P: Providers> {
    runtime: EndpointRuntime<P>,
    streams: StreamWirings<P>,
    transport: Transport<P>,
}

impl<P: Providers> Bridge<P> {
    /// Wire the background coordinator, accepting spoke connections from
    /// `listener`.
    ///
    /// The relay has no tunables; spokes carry the [`BridgeConfig`].
    pub fn background(providers: P, listener: mpsc::UnboundedReceiver<IncomingPort>) -> Self {
        let runtime = EndpointRuntime::new(RuntimeContext::Background, providers);
        let relay = BackgroundRelay::start(runtime.clone(), listener);
        Self::assemble(runtime, Transport::Relay(relay))
    }

    /// Wire an extension page: `devtools`, `popup`, `options`, `offscreen`
    /// or `sidepanel`.
    pub fn extension_page(
        context: RuntimeContext,
        providers: P,
        config: BridgeConfig,
        connector: Rc<dyn HostConnector>,
    ) -> BridgeResult<Self> {
        if !matches!(
            context,
            RuntimeContext::Devtools
                | RuntimeContext::Popup
                | RuntimeContext::Options
                | RuntimeContext::Offscreen
                | RuntimeContext::SidePanel
        ) {
            return Err(BridgeError::UnsupportedContext {
                operation: "extension page bridge",
                context: context.to_string(),
            });
        }

        let runtime = EndpointRuntime::new(context, providers.clone());
        let port = PersistentPort::connect(context.name(), connector, providers, config)?;

        let outbound = port.clone();
        runtime.set_forwarder(move |envelope| outbound.post_message(envelope));
        wire_port_inbound(&runtime, &port);

        let failures = runtime.clone();
        port.on_failure(move |request| {
            failures.end_transaction(&request.transaction_id);
        });

        Ok(Self::assemble(runtime, Transport::Port(port)))
    }

    /// Wire a content script. Window messaging stays off until
    /// [`allow_window_messaging`](Self::allow_window_messaging).
    pub fn content_script(
        providers: P,
        config: BridgeConfig,
        connector: Rc<dyn HostConnector>,
        window: PageWindow,
    ) -> BridgeResult<Self> {
        let context = RuntimeContext::ContentScript;
        let runtime = EndpointRuntime::new(context, providers.clone());
        let bridge = WindowBridge::new(context, window, providers.clone(), config.clone())?;
        let port = PersistentPort::connect(context.name(), connector, providers, config)?;

        let (to_page, to_relay) = (bridge.clone(), port.clone());
        runtime.set_forwarder(move |envelope| {
            let to_window = envelope
                .destination
                .as_ref()
                .is_some_and(|destination| destination.context == RuntimeContext::Window);
            if to_window {
                to_page.post_message(envelope)
            } else {
                to_relay.post_message(envelope)
            }
        });

        wire_port_inbound(&runtime, &port);

        let inbound = runtime.clone();
        bridge.on_message(move |mut envelope| {
            // Whatever the page claims, it speaks as `window`.
            envelope.origin = Endpoint::new(RuntimeContext::Window);
            if let Err(err) = inbound.handle_message(envelope) {
                tracing::debug!(error = %err, "could not route window envelope");
            }
        });

        let failures = runtime.clone();
        port.on_failure(move |request| {
            if request.origin.context == RuntimeContext::Window {
                fail_window_request(&failures, request);
            } else {
                failures.end_transaction(&request.transaction_id);
            }
        });

        Ok(Self::assemble(
            runtime,
            Transport::ContentScript {
                port,
                window: bridge,
            },
        ))
    }

    /// Wire the page (`window`) side. Messaging starts with
    /// [`set_namespace`](Self::set_namespace).
    pub fn page(providers: P, config: BridgeConfig, window: PageWindow) -> BridgeResult<Self> {
        let context = RuntimeContext::Window;
        let runtime = EndpointRuntime::new(context, providers.clone());
        let bridge = WindowBridge::new(context, window, providers, config)?;

        let outbound = bridge.clone();
        runtime.set_forwarder(move |envelope| outbound.post_message(envelope));

        let inbound = runtime.clone();
        bridge.on_message(move |envelope| {
            if let Err(err) = inbound.handle_message(envelope) {
                tracing::debug!(error = %err, "could not route envelope from content script");
            }
        });

        Ok(Self::assemble(runtime, Transport::Page(bridge)))
    }

    fn assemble(runtime: EndpointRuntime<P>, transport: Transport<P>) -> Self {
        let streams = StreamWirings::new(runtime.clone());
        tracing::debug!(context = %runtime.context(), "bridge ready");
        Self {
            runtime,
            streams,
            transport,
        }
    }

    /// The context this bridge serves.
    pub fn context(&self) -> RuntimeContext {
        self.runtime.context()
    }

    /// The underlying runtime.
    pub fn runtime(&self) -> &EndpointRuntime<P> {
        &self.runtime
    }

    /// The relay, on the background coordinator.
    pub fn relay(&self) -> Option<&BackgroundRelay<P>> {
        match &self.transport {
            Transport::Relay(relay) => Some(relay),
            _ => None,
        }
    }

    /// The persistent port, on spokes.
    pub fn port(&self) -> Option<&PersistentPort<P>> {
        match &self.transport {
            Transport::Port(port) | Transport::ContentScript { port, .. } => Some(port),
            _ => None,
        }
    }

    /// Send `data` on `topic` to `destination` and wait for the reply.
    pub fn send_message(
        &self,
        topic: &str,
        data: Value,
        destination: impl Into<Destination>,
    ) -> impl Future<Output = BridgeResult<Value>> + 'static {
        self.runtime.send_message(topic, data, destination)
    }

    /// Handle requests on `topic`, replacing any previous handler.
    pub fn on_message<F, Fut>(&self, topic: impl Into<String>, handler: F) -> bool
    where
        F: Fn(BridgeMessage) -> Fut + 'static,
        Fut: Future<Output = HandlerResult> + 'static,
    {
        self.runtime.on_message(topic, handler)
    }

    /// Stop handling `topic`. Returns false if no handler was registered.
    ///
    /// Requests arriving afterwards fail with a missing-handler error.
    pub fn remove_handler(&self, topic: &str) -> bool {
        self.runtime.remove_handler(topic)
    }

    /// Observe handler failures raised in this context.
    pub fn on_handler_error(&self, hook: impl Fn(&RemoteError) + 'static) {
        self.runtime.on_handler_error(hook);
    }

    /// Open a stream on `channel` with `destination`.
    pub fn open_stream(
        &self,
        channel: &str,
        destination: impl Into<Destination>,
    ) -> impl Future<Output = BridgeResult<Stream<P>>> + 'static {
        self.streams.open_stream(channel, destination)
    }

    /// Accept streams opened on `channel`.
    pub fn on_open_stream_channel(
        &self,
        channel: &str,
        callback: impl Fn(Stream<P>) + 'static,
    ) -> BridgeResult<()> {
        self.streams.on_open_stream_channel(channel, callback)
    }

    /// Set the page namespace and start the rendezvous. Page only.
    pub fn set_namespace(&self, namespace: impl Into<String>) -> BridgeResult<()> {
        match &self.transport {
            Transport::Page(window) => enable_window(window, namespace),
            _ => Err(self.unsupported("set_namespace")),
        }
    }

    /// Allow the page in `namespace` to message through this content
    /// script. Content script only.
    pub fn allow_window_messaging(&self, namespace: impl Into<String>) -> BridgeResult<()> {
        match &self.transport {
            Transport::ContentScript { window, .. } => enable_window(window, namespace),
            _ => Err(self.unsupported("allow_window_messaging")),
        }
    }

    /// Reconnect after the host restored the page from a suspended state.
    pub fn handle_page_restored(&self) -> BridgeResult<()> {
        match self.port() {
            Some(port) => port.handle_page_restored(),
            None => Err(self.unsupported("handle_page_restored")),
        }
    }

    /// Tear the context down: the relay stops accepting and drops its
    /// connections, a spoke closes its port for good.
    pub fn close(&self) {
        match &self.transport {
            Transport::Relay(relay) => relay.shutdown(),
            Transport::Port(port) | Transport::ContentScript { port, .. } => port.close(),
            Transport::Page(_) => {}
        }
    }

    fn unsupported(&self, operation: &'static str) -> BridgeError {
        BridgeError::UnsupportedContext {
            operation,
            context: self.context().to_string(),
        }
    }
}

fn enable_window<P: Providers>(
    window: &WindowBridge<P>,
    namespace: impl Into<String>,
) -> BridgeResult<()> {
    window.set_namespace(namespace)?;
    window.enable();
    Ok(())
}

fn wire_port_inbound<P: Providers>(runtime: &EndpointRuntime<P>, port: &PersistentPort<P>) {
    let inbound = runtime.clone();
    port.on_message(move |envelope| {
        if let Err(err) = inbound.handle_message(envelope) {
            tracing::debug!(error = %err, "could not route envelope from relay");
        }
    });
}

/// Answer a page request whose recipient went away with an error reply.
fn fail_window_request<P: Providers>(runtime: &EndpointRuntime<P>, request: Envelope) {
    let error = RemoteError::error(format!(
        "transaction {} was ended before it could complete",
        request.transaction_id
    ));
    let reply = Envelope {
        origin: Endpoint::new(RuntimeContext::ContentScript),
        destination: Some(Endpoint::new(RuntimeContext::Window)),
        transaction_id: request.transaction_id,
        hops: Vec::new(),
        message_id: request.message_id,
        message_type: MessageType::Reply,
        data: Value::Null,
        err: Some(error.to_serialized()),
        timestamp: runtime.providers().time().unix_millis(),
    };
    if let Err(err) = runtime.handle_message(reply) {
        tracing::warn!(error = %err, "could not fail window request");
    }
}
