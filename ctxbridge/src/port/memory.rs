//! In-process host.
//!
//! [`MemoryHost`] plays the browser's part: spokes connect through a
//! [`MemoryConnector`] carrying their host-assigned identity, and the relay
//! accepts the other ends from [`MemoryHost::listen`]. Connections made while
//! no relay listens wait in a backlog, the way a host wakes an evicted
//! coordinator on the next connect.

use super::host::{HostConnector, HostPort, IncomingPort, PortSender, PortWriter};
use crate::error::BridgeResult;
use std::cell::RefCell;
use std::rc::Rc;
use tokio::sync::mpsc;

/// Shared in-process host.
#[derive(Debug, Clone, Default)]
pub struct MemoryHost {
    state: Rc<RefCell<HostState>>,
}

#[derive(Debug, Default)]
struct HostState {
    listener: Option<mpsc::UnboundedSender<IncomingPort>>,
    backlog: Vec<IncomingPort>,
}

impl MemoryHost {
    /// Create a host with no listener.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting connections. Replaces any previous listener and hands
    /// it the backlog first.
    pub fn listen(&self) -> mpsc::UnboundedReceiver<IncomingPort> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.borrow_mut();
        for port in state.backlog.drain(..) {
            // rx is alive, so the send cannot fail.
            let _ = tx.send(port);
        }
        state.listener = Some(tx);
        rx
    }

    /// A connector for a spoke with the given identity.
    pub fn connector(&self, sender: PortSender) -> MemoryConnector {
        MemoryConnector {
            host: self.clone(),
            sender,
        }
    }

    /// Connections waiting for a listener.
    pub fn backlog_len(&self) -> usize {
        self.state.borrow().backlog.len()
    }

    fn accept(&self, port: IncomingPort) {
        let mut state = self.state.borrow_mut();
        let port = match state.listener.as_ref() {
            Some(listener) => match listener.send(port) {
                Ok(()) => return,
                Err(mpsc::error::SendError(port)) => port,
            },
            None => port,
        };
        tracing::debug!(name = %port.name, "no listener, connection queued");
        state.listener = None;
        state.backlog.push(port);
    }
}

/// Spoke-side handle onto a [`MemoryHost`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    host: MemoryHost,
    sender: PortSender,
}

impl MemoryConnector {
    /// The identity the host assigns to this spoke.
    pub fn sender(&self) -> PortSender {
        self.sender
    }
}

impl HostConnector for MemoryConnector {
    fn connect(&self, name: &str) -> BridgeResult<HostPort> {
        let (to_relay, from_spoke) = mpsc::unbounded_channel();
        let (to_spoke, from_relay) = mpsc::unbounded_channel();

        self.host.accept(IncomingPort {
            name: name.to_string(),
            sender: self.sender,
            writer: PortWriter::new(to_spoke),
            reader: from_spoke,
        });

        Ok(HostPort {
            name: name.to_string(),
            writer: PortWriter::new(to_relay),
            reader: from_relay,
        })
    }
}
