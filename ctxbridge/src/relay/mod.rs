//! The coordinator-resident relay.
//!
//! Spokes connect to the relay with a [`crate::port::PersistentPort`]; the
//! relay keys each connection by its resolved endpoint id and routes
//! envelopes between them. The background context's own
//! [`crate::messaging::EndpointRuntime`] forwards every non-local envelope
//! here.

mod background;

pub use background::BackgroundRelay;
