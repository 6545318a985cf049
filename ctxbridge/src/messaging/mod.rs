//! Request/reply messaging within and across contexts.
//!
//! Every context owns one [`EndpointRuntime`]. It builds envelopes for
//! outgoing requests, consumes envelopes addressed to itself and hands
//! everything else to the transport it was wired to.

mod envelope;
mod handler;
mod remote_error;
mod runtime;
mod transaction;

pub use envelope::{BridgeMessage, Envelope, MessageType};
pub use handler::{HandlerResult, MessageHandler};
pub use remote_error::{ErrorKind, RemoteError, SerializedError};
pub use runtime::{EndpointRuntime, Forwarder, LocalDeliveryHook};
pub use transaction::{Transaction, TransactionResult, TransactionTable};
