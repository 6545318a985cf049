//! Reaching the untrusted page context.
//!
//! The page and its content script share only the page's broadcast channel.
//! [`WindowBridge`] uses it once, to rendezvous on a private
//! [`MessagePort`] pair; all envelopes travel over that pair afterwards.

mod bridge;
mod page;

pub use bridge::WindowBridge;
pub use page::{message_channel, MessagePort, PageWindow, WindowEvent};
