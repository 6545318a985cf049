//! The host's named duplex connection primitive.
//!
//! Payloads are JSON values. A connection is gone once its reader yields
//! `None`; there is no other disconnect signal.

use crate::error::{BridgeError, BridgeResult};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// Identity of a connecting spoke, assigned by the host.
///
/// The relay trusts only this, never what the spoke reports about itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PortSender {
    /// Tab the spoke lives in (for devtools, the inspected tab).
    pub tab_id: Option<u32>,
    /// Frame within the tab.
    pub frame_id: Option<u32>,
}

impl PortSender {
    /// A spoke not bound to any tab (popup, options, ...).
    pub fn extension_page() -> Self {
        Self::default()
    }

    /// A spoke in the top frame of a tab.
    pub fn tab(tab_id: u32) -> Self {
        Self {
            tab_id: Some(tab_id),
            frame_id: Some(0),
        }
    }

    /// A spoke in a given frame of a tab.
    pub fn frame(tab_id: u32, frame_id: u32) -> Self {
        Self {
            tab_id: Some(tab_id),
            frame_id: Some(frame_id),
        }
    }
}

/// Writing half of a connection.
#[derive(Debug, Clone)]
pub struct PortWriter {
    tx: mpsc::UnboundedSender<Value>,
}

impl PortWriter {
    /// Wrap a channel sender.
    pub fn new(tx: mpsc::UnboundedSender<Value>) -> Self {
        Self { tx }
    }

    /// Serialize and send a message.
    pub fn post<T: Serialize>(&self, message: &T) -> BridgeResult<()> {
        let value = serde_json::to_value(message)?;
        self.tx.send(value).map_err(|_| BridgeError::PortClosed)
    }

    /// Whether the other side is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spoke side of a new connection.
#[derive(Debug)]
pub struct HostPort {
    /// Connection name, carrying the handshake.
    pub name: String,
    /// Messages to the relay.
    pub writer: PortWriter,
    /// Messages from the relay.
    pub reader: mpsc::UnboundedReceiver<Value>,
}

/// Relay side of a new connection.
#[derive(Debug)]
pub struct IncomingPort {
    /// Connection name, carrying the handshake.
    pub name: String,
    /// Host-assigned identity of the spoke.
    pub sender: PortSender,
    /// Messages to the spoke.
    pub writer: PortWriter,
    /// Messages from the spoke.
    pub reader: mpsc::UnboundedReceiver<Value>,
}

/// Opens connections from a spoke to the relay.
pub trait HostConnector {
    /// Open a connection named `name`.
    fn connect(&self, name: &str) -> BridgeResult<HostPort>;
}
