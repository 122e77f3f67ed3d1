//! LCU client implementation
//!
//! One WebSocket connection to the locally discovered League client for the
//! event bus, plus plain HTTPS request/response calls against the same API.
//! The connection task waits for credentials, connects, subscribes, and
//! pumps events; on any failure it retries on a fixed 5 second interval
//! (no backoff), so consumers observe reconnection at a stable cadence.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::callbacks::{CallbackId, CallbackRegistry};
use crate::credentials::{Credentials, SharedCredentials};

use super::events::{
    dispatch, parse_event_frame, subscribe_frame, EventHandler, HandlerId, Subscriptions,
};
use super::tls::insecure_tls_config;

/// Fixed delay between reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Poll cadence while waiting for credentials to appear.
const CREDENTIAL_POLL: Duration = Duration::from_secs(1);
/// How long `stop` waits for the connection task before aborting it.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why a request produced no payload. Internal taxonomy only; the public
/// request methods flatten every failure to an empty object.
#[derive(Debug, Error)]
enum RequestError {
    #[error("League client credentials are not available")]
    NoCredentials,
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("request returned status {0}")]
    Status(reqwest::StatusCode),
}

/// Client for the League client's local WebSocket event bus and HTTPS API.
#[derive(Clone)]
pub struct LcuClient {
    creds: SharedCredentials,
    subs: Arc<Mutex<Subscriptions>>,
    running: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    conn_listeners: Arc<CallbackRegistry<bool>>,
    resubscribe: Arc<Notify>,
    shutdown: Arc<Notify>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
    http: reqwest::Client,
}

impl LcuClient {
    /// Create a client over the monitor's shared credential slot. Does not
    /// connect until [`start`](Self::start) is called.
    pub fn new(creds: SharedCredentials) -> Result<Self> {
        // The client presents a self-signed certificate on loopback, so
        // verification is disabled for the HTTPS side as well.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .context("Failed to build HTTPS client")?;

        Ok(Self {
            creds,
            subs: Arc::new(Mutex::new(Subscriptions::default())),
            running: Arc::new(AtomicBool::new(false)),
            connected: Arc::new(AtomicBool::new(false)),
            conn_listeners: Arc::new(CallbackRegistry::new(false)),
            resubscribe: Arc::new(Notify::new()),
            shutdown: Arc::new(Notify::new()),
            task: Arc::new(Mutex::new(None)),
            http,
        })
    }

    /// Whether the WebSocket is currently connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Register a connection-state callback with an immediate replay of the
    /// current state.
    pub fn add_connection_callback(
        &self,
        callback: Arc<dyn Fn(bool) + Send + Sync>,
    ) -> CallbackId {
        self.conn_listeners.add_with_replay(callback)
    }

    pub fn remove_connection_callback(&self, id: CallbackId) {
        self.conn_listeners.remove(id);
    }

    /// Register a handler for an event path.
    ///
    /// Dispatch is prefix-matched, so a handler registered here also sees
    /// every nested sub-event of `path`. Subscribing while connected
    /// triggers an out-of-band resubscription of all registered paths.
    pub fn subscribe(&self, path: &str, handler: EventHandler) -> HandlerId {
        let id = self.subs.lock().unwrap().add(path, handler);
        debug!(path, "Added event handler");
        if self.is_connected() {
            self.resubscribe.notify_one();
        }
        id
    }

    /// Remove one handler, or every handler for the path when `id` is `None`.
    pub fn unsubscribe(&self, path: &str, id: Option<HandlerId>) {
        self.subs.lock().unwrap().remove(path, id);
        debug!(path, "Removed event handler(s)");
    }

    /// Start the connection task. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("LCU client is already running");
            return;
        }
        info!("Starting LCU client");
        let client = self.clone();
        let handle = tokio::spawn(async move { client.run().await });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Stop the connection task with a bounded join, then abort it if it is
    /// still alive.
    pub async fn stop(&self) {
        info!("Stopping LCU client...");
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();

        let handle = self.task.lock().unwrap().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
                warn!("LCU connection task did not stop in time, aborting");
                handle.abort();
            }
        }

        self.set_connected(false);
        info!("LCU client stopped");
    }

    async fn run(&self) {
        debug!("LCU connection task started");
        while self.running.load(Ordering::SeqCst) {
            let Some(creds) = self.wait_for_credentials().await else {
                break;
            };

            match self.connect_and_listen(&creds).await {
                Ok(()) => {}
                Err(e) => error!("LCU WebSocket error: {e:#}"),
            }
            self.set_connected(false);

            if self.running.load(Ordering::SeqCst) {
                info!(
                    "Reconnecting to the League client in {}s...",
                    RECONNECT_DELAY.as_secs()
                );
                tokio::select! {
                    _ = self.shutdown.notified() => {}
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
        debug!("LCU connection task ending");
    }

    /// Block until credentials exist, polling the shared slot. Returns
    /// `None` when the client is stopped while waiting.
    async fn wait_for_credentials(&self) -> Option<Credentials> {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(creds) = self.creds.read().unwrap().clone() {
                return Some(creds);
            }
            debug!("Waiting for the League client to start...");
            tokio::select! {
                _ = self.shutdown.notified() => return None,
                _ = tokio::time::sleep(CREDENTIAL_POLL) => {}
            }
        }
    }

    async fn connect_and_listen(&self, creds: &Credentials) -> Result<()> {
        let url = format!("wss://127.0.0.1:{}", creds.port);
        let mut request = url
            .as_str()
            .into_client_request()
            .context("Invalid LCU WebSocket URL")?;
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&creds.basic_auth()).context("Invalid auth header")?,
        );
        request
            .headers_mut()
            .insert(ACCEPT, HeaderValue::from_static("application/json"));

        let connector = Connector::Rustls(insecure_tls_config());
        let (mut ws, _) = connect_async_tls_with_config(request, None, false, Some(connector))
            .await
            .context("Failed to connect to the LCU WebSocket")?;

        info!("Connected to LCU WebSocket");
        self.set_connected(true);
        self.send_subscriptions(&mut ws).await?;

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    let _ = ws.close(None).await;
                    return Ok(());
                }
                _ = self.resubscribe.notified() => {
                    self.send_subscriptions(&mut ws).await?;
                }
                msg = ws.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                    Some(Ok(Message::Close(_))) | None => {
                        anyhow::bail!("WebSocket connection closed");
                    }
                    Some(Ok(_)) => {} // ping/pong/binary, nothing to do
                    Some(Err(e)) => {
                        return Err(e).context("Error reading from the LCU WebSocket");
                    }
                }
            }
            if !self.running.load(Ordering::SeqCst) {
                let _ = ws.close(None).await;
                return Ok(());
            }
        }
    }

    /// Send one subscribe frame per distinct registered path.
    async fn send_subscriptions(&self, ws: &mut WsStream) -> Result<()> {
        let paths = self.subs.lock().unwrap().paths();
        if paths.is_empty() {
            debug!("No event paths to subscribe to");
            return Ok(());
        }
        for path in &paths {
            let frame = subscribe_frame(path).to_string();
            ws.send(Message::Text(frame))
                .await
                .with_context(|| format!("Failed to subscribe to {path}"))?;
            debug!(path, "Subscribed to event path");
        }
        info!("Subscribed to {} LCU event path(s)", paths.len());
        Ok(())
    }

    /// Parse and dispatch one inbound frame. Events are delivered to
    /// handlers in receive order; malformed frames are logged and skipped.
    fn handle_frame(&self, text: &str) {
        match parse_event_frame(text) {
            Ok(Some((path, payload))) => {
                let handlers = self.subs.lock().unwrap().matching(&path);
                dispatch(&handlers, &path, &payload);
            }
            Ok(None) => {}
            Err(e) => warn!("Received invalid JSON frame: {e}"),
        }
    }

    fn set_connected(&self, connected: bool) {
        if self.connected.swap(connected, Ordering::SeqCst) != connected {
            self.conn_listeners.notify(connected);
        }
    }

    /// GET against the local HTTPS API. Returns `{}` on any failure;
    /// callers must treat an empty object as "unknown", not as data.
    pub async fn request_get(&self, endpoint: &str) -> Value {
        match self.request(reqwest::Method::GET, endpoint, None).await {
            Ok(value) => value,
            Err(e) => {
                warn!(endpoint, "GET request failed: {e}");
                Value::Object(Default::default())
            }
        }
    }

    /// POST against the local HTTPS API. Same empty-object contract as
    /// [`request_get`](Self::request_get).
    pub async fn request_post(&self, endpoint: &str, body: Option<&Value>) -> Value {
        match self.request(reqwest::Method::POST, endpoint, body).await {
            Ok(value) => value,
            Err(e) => {
                warn!(endpoint, "POST request failed: {e}");
                Value::Object(Default::default())
            }
        }
    }

    async fn request(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Value, RequestError> {
        // Short-circuit before any network activity when undiscovered.
        let creds = self
            .creds
            .read()
            .unwrap()
            .clone()
            .ok_or(RequestError::NoCredentials)?;

        let url = format!("https://127.0.0.1:{}/{}", creds.port, endpoint);
        let mut request = self
            .http
            .request(method, &url)
            .header(AUTHORIZATION, creds.basic_auth())
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RequestError::Status(response.status()));
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        // A non-JSON body is treated as an empty payload, not an error.
        Ok(serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::Object(Default::default())))
    }

    /// Current gameflow session state.
    pub async fn get_current_gameflow(&self) -> Value {
        self.request_get("lol-gameflow/v1/session").await
    }

    /// Current champion select session.
    pub async fn get_champ_select(&self) -> Value {
        self.request_get("lol-champ-select/v1/session").await
    }

    /// Current summoner information.
    pub async fn get_current_summoner(&self) -> Value {
        self.request_get("lol-summoner/v1/current-summoner").await
    }

    /// Live game data, when in game.
    pub async fn get_game_data(&self) -> Value {
        self.request_get("liveclientdata/allgamedata").await
    }
}
