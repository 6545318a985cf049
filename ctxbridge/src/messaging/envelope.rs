//! The routed message unit.

use super::remote_error::SerializedError;
use crate::endpoint::Endpoint;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Whether an envelope is a request or the reply to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// A request expecting exactly one reply.
    Message,
    /// The reply to a request, correlated by transaction id.
    Reply,
}

/// An envelope as it travels between contexts.
///
/// `hops` lists the runtimes that forwarded the envelope and never contains
/// duplicates. The last forwarding hop clears the destination's tab and frame
/// so the final recipient recognizes itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Where the envelope was sent from.
    pub origin: Endpoint,
    /// Where the envelope is going. `None` means the current context.
    pub destination: Option<Endpoint>,
    /// Correlates a request with its reply.
    pub transaction_id: String,
    /// Hop markers of the runtimes that forwarded this envelope.
    #[serde(default)]
    pub hops: Vec<String>,
    /// Topic of the message.
    #[serde(rename = "messageID")]
    pub message_id: String,
    /// Request or reply.
    pub message_type: MessageType,
    /// Payload.
    #[serde(default)]
    pub data: Value,
    /// Serialized handler failure, on replies only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<SerializedError>,
    /// Milliseconds since the Unix epoch when the envelope was built.
    pub timestamp: u64,
}

impl Envelope {
    /// Whether this envelope is a request.
    pub fn is_request(&self) -> bool {
        self.message_type == MessageType::Message
    }

    /// Decode and validate an envelope received from a transport.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// What a handler receives for an incoming request.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeMessage {
    /// The requesting endpoint, with tab and frame as resolved by the relay.
    pub sender: Endpoint,
    /// Topic of the message.
    pub id: String,
    /// Payload.
    pub data: Value,
    /// Milliseconds since the Unix epoch when the request was built.
    pub timestamp: u64,
}
