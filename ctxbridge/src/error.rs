//! Error types for the bridge.
//!
//! Three families share one enum:
//! - usage errors, returned before anything leaves the caller's context
//! - delivery errors, carried back from the destination as [`RemoteError`]
//! - session errors, raised when the destination's session ends mid-request

use crate::messaging::RemoteError;

/// Errors surfaced by bridge operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    /// The destination string does not name a known context.
    #[error("invalid destination '{destination}': expected kind, kind@tabId or kind@tabId.frameId")]
    InvalidDestination {
        /// The rejected destination.
        destination: String,
    },

    /// A per-tab destination was used where no tab can be inferred.
    #[error("destination '{destination}' needs a tab id, use '{destination}@<tabId>'")]
    MissingTabId {
        /// The tab-less destination.
        destination: String,
    },

    /// The window namespace was already set.
    #[error("namespace once set cannot be changed")]
    NamespaceAlreadySet,

    /// Window messaging was attempted before a namespace was set.
    #[error("namespace is required before messaging the window")]
    NamespaceNotSet,

    /// Window messaging was attempted before it was enabled.
    #[error("window messaging is not allowed, call allow_window_messaging first")]
    WindowMessagingNotAllowed,

    /// The operation does not exist in this context.
    #[error("{operation} is not available in context '{context}'")]
    UnsupportedContext {
        /// The attempted operation.
        operation: &'static str,
        /// The context it was attempted in.
        context: String,
    },

    /// A stream channel was claimed twice.
    #[error("stream channel '{channel}' already has a handler")]
    ChannelAlreadyClaimed {
        /// The channel name.
        channel: String,
    },

    /// A stream is already open on the channel.
    #[error("a stream is already open on channel '{channel}'")]
    StreamAlreadyOpen {
        /// The channel name.
        channel: String,
    },

    /// The stream was closed.
    #[error("stream '{stream_id}' is closed")]
    StreamClosed {
        /// The stream identifier.
        stream_id: String,
    },

    /// The underlying channel is gone.
    #[error("port closed")]
    PortClosed,

    /// The destination answered with an error.
    #[error("{0}")]
    Remote(RemoteError),

    /// The transaction was ended before a reply arrived.
    #[error("transaction {transaction_id} was ended before it could complete")]
    TransactionEnded {
        /// The ended transaction.
        transaction_id: String,
    },

    /// The runtime dropped the transaction without settling it.
    #[error("transaction {transaction_id} was dropped without a reply")]
    ReplyDropped {
        /// The dropped transaction.
        transaction_id: String,
    },

    /// Encoding or decoding a payload failed.
    #[error("serialization failed: {message}")]
    Serialization {
        /// Details about the failure.
        message: String,
    },
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<RemoteError> for BridgeError {
    fn from(err: RemoteError) -> Self {
        BridgeError::Remote(err)
    }
}

/// Result alias for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_error_display() {
        assert_eq!(
            BridgeError::NamespaceAlreadySet.to_string(),
            "namespace once set cannot be changed"
        );
        assert_eq!(
            BridgeError::MissingTabId {
                destination: "content-script".to_string()
            }
            .to_string(),
            "destination 'content-script' needs a tab id, use 'content-script@<tabId>'"
        );
    }

    #[test]
    fn test_remote_error_displays_as_is() {
        let err: BridgeError = RemoteError::range_error("x").into();
        assert_eq!(err.to_string(), "RangeError: x");
    }

    #[test]
    fn test_json_error_maps_to_serialization() {
        let err = serde_json::from_str::<u32>("nope").expect_err("invalid json");
        let err: BridgeError = err.into();
        assert!(matches!(err, BridgeError::Serialization { .. }));
    }
}
