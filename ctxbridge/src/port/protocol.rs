//! Messages private to the relay↔spoke channel.
//!
//! Spokes send [`RequestMessage`]s (tagged by `type`), the relay answers with
//! [`StatusMessage`]s (tagged by `status`). Both are validated with serde at
//! the boundary; anything that does not decode is dropped.

use crate::endpoint::Fingerprint;
use crate::error::BridgeResult;
use crate::messaging::Envelope;
use serde::{Deserialize, Serialize};

/// Handshake carried in the connection name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionArgs {
    /// Context kind the spoke claims to be. Tab and frame come from the host.
    pub endpoint_name: String,
    /// Session fingerprint of this connection.
    pub fingerprint: Fingerprint,
}

impl ConnectionArgs {
    /// Encode as a connection name.
    pub fn encode(&self) -> BridgeResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a connection name. Malformed names yield `None`.
    pub fn decode(name: &str) -> Option<Self> {
        serde_json::from_str(name).ok()
    }
}

/// Who sent a request tracked by a receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptSender {
    /// Connection id of the sender.
    pub endpoint_id: String,
    /// Session fingerprint of the sender. `None` for the coordinator itself.
    #[serde(default)]
    pub fingerprint: Option<Fingerprint>,
}

/// A request that reached its recipient and awaits a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// The delivered request.
    pub message: Envelope,
    /// Session fingerprint of the recipient.
    pub to: Fingerprint,
    /// The requester.
    pub from: ReceiptSender,
}

/// A request a spoke holds until its destination becomes reachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    /// Connection id of the destination.
    pub resolved_destination: String,
    /// The queued envelope.
    pub message: Envelope,
}

/// Relay → spoke notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StatusMessage {
    /// An envelope for this spoke.
    Incoming {
        /// The envelope.
        message: Envelope,
    },
    /// A request from this spoke reached its recipient.
    Delivered {
        /// Receipt to keep until the reply arrives.
        receipt: DeliveryReceipt,
    },
    /// A request from this spoke has no live destination.
    Undeliverable {
        /// Connection id of the missing destination.
        #[serde(rename = "resolvedDestination")]
        resolved_destination: String,
        /// The request to queue.
        message: Envelope,
    },
    /// A destination this spoke waits for connected.
    Deliverable {
        /// Connection id of the destination.
        #[serde(rename = "deliverableTo")]
        deliverable_to: String,
    },
    /// The session with this fingerprint ended.
    Terminated {
        /// Fingerprint of the ended session.
        fingerprint: Fingerprint,
    },
}

/// Spoke → relay requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RequestMessage {
    /// Resync snapshot sent on every (re)connect.
    Sync {
        /// Receipts of requests still awaiting replies.
        #[serde(rename = "pendingResponses")]
        pending_responses: Vec<DeliveryReceipt>,
        /// Destinations the spoke still waits to reach.
        #[serde(rename = "pendingDeliveries")]
        pending_deliveries: Vec<String>,
    },
    /// An envelope to route.
    Deliver {
        /// The envelope.
        message: Envelope,
    },
}
