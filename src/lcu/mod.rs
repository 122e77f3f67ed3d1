//! League client (LCU) WebSocket and HTTPS API client

mod client;
mod events;
mod tls;

pub use client::*;
pub use events::{EventHandler, HandlerId};
