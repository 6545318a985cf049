//! In-process page broadcast and private channels.

use crate::error::{BridgeError, BridgeResult};
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;
use tokio::sync::mpsc;

/// One end of a private two-way channel.
///
/// Clones share the same end, like a transferred port seen by several
/// listeners. The receiving half can be taken once.
#[derive(Debug, Clone)]
pub struct MessagePort {
    end: Rc<PortEnd>,
}

#[derive(Debug)]
struct PortEnd {
    tx: mpsc::UnboundedSender<Value>,
    rx: RefCell<Option<mpsc::UnboundedReceiver<Value>>>,
}

/// Create an entangled pair of ports.
pub fn message_channel() -> (MessagePort, MessagePort) {
    let (to_second, from_first) = mpsc::unbounded_channel();
    let (to_first, from_second) = mpsc::unbounded_channel();
    let first = MessagePort {
        end: Rc::new(PortEnd {
            tx: to_second,
            rx: RefCell::new(Some(from_second)),
        }),
    };
    let second = MessagePort {
        end: Rc::new(PortEnd {
            tx: to_first,
            rx: RefCell::new(Some(from_first)),
        }),
    };
    (first, second)
}

impl MessagePort {
    /// Send to the other end.
    pub fn post_message(&self, data: Value) -> BridgeResult<()> {
        self.end.tx.send(data).map_err(|_| BridgeError::PortClosed)
    }

    /// Take the receiving half. `None` once taken.
    pub fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<Value>> {
        self.end.rx.borrow_mut().take()
    }

    /// Put a receiving half back.
    pub fn restore_receiver(&self, rx: mpsc::UnboundedReceiver<Value>) {
        *self.end.rx.borrow_mut() = Some(rx);
    }
}

/// A message seen by page listeners.
#[derive(Debug, Clone)]
pub struct WindowEvent {
    /// The posted data.
    pub data: Value,
    /// Ports transferred with the message.
    pub ports: Vec<MessagePort>,
}

/// The page's broadcast channel: every listener sees every message.
#[derive(Debug, Clone, Default)]
pub struct PageWindow {
    listeners: Rc<RefCell<Vec<mpsc::UnboundedSender<WindowEvent>>>>,
}

impl PageWindow {
    /// Create a page with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start listening. Dropping the receiver stops listening.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<WindowEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.borrow_mut().push(tx);
        rx
    }

    /// Broadcast `data` with transferable `ports`.
    pub fn post_message(&self, data: Value, ports: Vec<MessagePort>) {
        let event = WindowEvent { data, ports };
        self.listeners
            .borrow_mut()
            .retain(|listener| listener.send(event.clone()).is_ok());
    }

    /// Number of live listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .borrow()
            .iter()
            .filter(|listener| !listener.is_closed())
            .count()
    }
}
