//! # ctxbridge
//!
//! Cross-context message bus for browser extension runtimes.
//!
//! Isolated execution contexts (the background coordinator, per-tab content
//! scripts, devtools panels, popups, options pages, offscreen documents, side
//! panels and the untrusted page `window`) exchange request/reply messages and
//! long-lived streams through a hub-and-spoke topology:
//!
//! - **Endpoint model**: `{context, tabId, frameId}` addressing and its string form
//! - **EndpointRuntime**: per-context transaction table and handler registry
//! - **PersistentPort**: spoke connection surviving coordinator teardown
//! - **BackgroundRelay**: the coordinator-resident switchboard
//! - **WindowBridge**: namespaced rendezvous with the page context
//! - **Bridge**: one ready-made wiring per context kind
//!
//! Everything runs on a single thread inside a tokio `LocalSet`.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Error types for bridge operations.
pub mod error;

/// Tunables for ports and the window rendezvous.
pub mod config;

/// Time and task providers.
pub mod providers;

/// Endpoint addressing and session fingerprints.
pub mod endpoint;

/// Envelopes, transactions and the per-context runtime.
pub mod messaging;

/// Host connections and the spoke-side persistent port.
pub mod port;

/// The coordinator-resident relay.
pub mod relay;

/// Page broadcast primitives and the window bridge.
pub mod window;

/// Waiter sets keyed by the awaited event.
pub mod waiters;

/// Streams layered on request/reply messaging.
pub mod stream;

/// Per-context entry points.
pub mod bridge;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use endpoint::{Destination, Endpoint, Fingerprint, ParsedEndpoint, RuntimeContext};
pub use error::{BridgeError, BridgeResult};
pub use messaging::{
    BridgeMessage, EndpointRuntime, Envelope, ErrorKind, HandlerResult, MessageHandler,
    MessageType, RemoteError, SerializedError,
};
pub use port::{
    HostConnector, HostPort, IncomingPort, MemoryConnector, MemoryHost, PersistentPort,
    PortSender, PortWriter,
};
pub use providers::{
    Providers, RandomProvider, TaskProvider, TimeProvider, TokioProviders, TokioRandomProvider,
    TokioTaskProvider, TokioTimeProvider,
};
pub use relay::BackgroundRelay;
pub use stream::{ListenerId, Stream, StreamInfo, StreamWirings};
pub use window::{message_channel, MessagePort, PageWindow, WindowBridge, WindowEvent};
