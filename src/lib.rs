//! riftcast agent
//!
//! Watches the local League of Legends client and drives OBS Studio over
//! obs-websocket to record each match automatically. The crate exposes
//! four cooperating components:
//!
//! - [`credentials::CredentialMonitor`] discovers the client's auth token
//!   and port from the process table and tracks client presence.
//! - [`lcu::LcuClient`] maintains the WebSocket connection to the client's
//!   event bus and serves request/response reads over HTTPS.
//! - [`obs::ObsClient`] maintains the obs-websocket session and exposes
//!   callback-completed recording, profile, and scene commands.
//! - [`tracker::GameTracker`] maps gameflow events onto the match phase
//!   machine and drives recording start/stop from phase transitions.
//!
//! A presentation layer consumes the connection-state and game-update
//! callbacks these components publish; none of them depend on one.

pub mod callbacks;
pub mod config;
pub mod credentials;
pub mod lcu;
pub mod obs;
pub mod tracker;
