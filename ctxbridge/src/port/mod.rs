//! Host connections between spokes and the relay.
//!
//! - [`host`]: the injected connection primitive ([`HostConnector`], [`IncomingPort`])
//! - [`memory`]: an in-process host wiring spokes to a relay over tokio channels
//! - [`protocol`]: the private relay↔spoke messages
//! - [`ledger`]: delivery receipts of requests awaiting replies
//! - [`persistent`]: the spoke-side connection surviving coordinator teardown

pub mod host;
pub mod ledger;
pub mod memory;
pub mod persistent;
pub mod protocol;

pub use host::{HostConnector, HostPort, IncomingPort, PortSender, PortWriter};
pub use ledger::DeliveryLedger;
pub use memory::{MemoryConnector, MemoryHost};
pub use persistent::PersistentPort;
pub use protocol::{
    ConnectionArgs, DeliveryReceipt, QueuedMessage, ReceiptSender, RequestMessage, StatusMessage,
};
