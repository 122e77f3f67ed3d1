//! OBS WebSocket client

mod client;

pub use client::*;
