//! Endpoint addressing.
//!
//! An endpoint is `{context, tabId, frameId}` with the canonical string form
//! `kind`, `kind@tabId` or `kind@tabId.frameId`.

mod address;
mod context;
mod fingerprint;

pub use address::{Destination, Endpoint, ParsedEndpoint};
pub use context::RuntimeContext;
pub use fingerprint::Fingerprint;

