//! OBS WebSocket client implementation
//!
//! Wraps an `obws` session behind fire-and-forget command methods that
//! deliver their result through a one-shot callback on a worker task, so a
//! caller is never blocked on the RPC round-trip. Commands serialize
//! against each other under a single operation lock; connect/disconnect own
//! a separate connection-phase lock so teardown cannot race a command
//! mid-flight.

use futures::StreamExt;
use obws::events::Event;
use obws::Client;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex as TokioMutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::callbacks::{CallbackId, CallbackRegistry};
use crate::config::ObsConfig;

/// Interval between keepalive probes on an open session.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
/// Bounded wait for the keepalive task during disconnect.
const KEEPALIVE_STOP_TIMEOUT: Duration = Duration::from_secs(1);
/// Event name for confirmed recording-state changes.
pub const RECORD_STATE_CHANGED: &str = "RecordStateChanged";

/// One-shot completion callback reporting request success.
pub type BoolCallback = Box<dyn FnOnce(bool) + Send + 'static>;
/// One-shot completion callback carrying a list of names.
pub type ListCallback = Box<dyn FnOnce(Vec<String>) + Send + 'static>;
/// One-shot completion callback carrying a single name.
pub type StringCallback = Box<dyn FnOnce(String) + Send + 'static>;

type EventCallback = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Clone)]
struct ObsSettings {
    host: String,
    port: u16,
    password: Option<String>,
}

/// Client for the OBS WebSocket server.
#[derive(Clone)]
pub struct ObsClient {
    settings: Arc<StdMutex<ObsSettings>>,
    /// Live session slot; the write half doubles as the connection-phase lock.
    session: Arc<RwLock<Option<Arc<Client>>>>,
    /// Serializes RPC calls so only one in-flight command at a time.
    op_lock: Arc<TokioMutex<()>>,
    connected: Arc<AtomicBool>,
    /// Cache of remote truth; flipped only by `RecordStateChanged` events.
    recording: Arc<AtomicBool>,
    profiles: Arc<StdMutex<Vec<String>>>,
    conn_callbacks: Arc<CallbackRegistry<bool>>,
    conn_handlers: Arc<CallbackRegistry<bool>>,
    event_handlers: Arc<StdMutex<HashMap<String, Vec<EventCallback>>>>,
    keepalive: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl ObsClient {
    pub fn new(config: &ObsConfig) -> Self {
        Self {
            settings: Arc::new(StdMutex::new(ObsSettings {
                host: config.host.clone(),
                port: config.port,
                password: config.password.clone(),
            })),
            session: Arc::new(RwLock::new(None)),
            op_lock: Arc::new(TokioMutex::new(())),
            connected: Arc::new(AtomicBool::new(false)),
            recording: Arc::new(AtomicBool::new(false)),
            profiles: Arc::new(StdMutex::new(Vec::new())),
            conn_callbacks: Arc::new(CallbackRegistry::new(false)),
            conn_handlers: Arc::new(CallbackRegistry::new(false)),
            event_handlers: Arc::new(StdMutex::new(HashMap::new())),
            keepalive: Arc::new(StdMutex::new(None)),
        }
    }

    /// Current connection state.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Current recording state, as last confirmed by OBS itself.
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    /// Last fetched profile list.
    pub fn profiles(&self) -> Vec<String> {
        self.profiles.lock().unwrap().clone()
    }

    /// Register a connection callback (no replay at registration).
    pub fn add_connection_callback(&self, callback: EventCallback) -> CallbackId {
        self.conn_callbacks.add(callback)
    }

    /// Register a connection handler; it is immediately invoked once with
    /// the current state so late subscribers start in sync.
    pub fn add_connection_handler(&self, handler: EventCallback) -> CallbackId {
        self.conn_handlers.add_with_replay(handler)
    }

    /// Register a handler for a named OBS event. Only `RecordStateChanged`
    /// is currently fanned out.
    pub fn register_event_handler(&self, event_type: &str, handler: EventCallback) {
        self.event_handlers
            .lock()
            .unwrap()
            .entry(event_type.to_string())
            .or_default()
            .push(handler);
    }

    /// Adopt new endpoint settings; when connected, drop the session and
    /// re-establish it against the new endpoint.
    pub fn update_settings(&self, host: String, port: u16, password: Option<String>) {
        *self.settings.lock().unwrap() = ObsSettings {
            host,
            port,
            password,
        };
        if self.is_connected() {
            info!("OBS settings changed, reconnecting");
            let client = self.clone();
            tokio::spawn(async move {
                client.do_disconnect().await;
                client.do_connect().await;
            });
        }
    }

    /// Connect to OBS. No-op success when already connected; otherwise the
    /// attempt runs on a worker and the callback receives the outcome.
    pub fn connect(&self, callback: Option<BoolCallback>) -> bool {
        if self.is_connected() {
            if let Some(cb) = callback {
                cb(true);
            }
            return true;
        }
        let client = self.clone();
        tokio::spawn(async move {
            let ok = client.do_connect().await;
            if let Some(cb) = callback {
                cb(ok);
            }
        });
        true
    }

    /// Disconnect from OBS. No-op success when already disconnected.
    pub fn disconnect(&self, callback: Option<BoolCallback>) -> bool {
        if !self.is_connected() {
            if let Some(cb) = callback {
                cb(true);
            }
            return true;
        }
        let client = self.clone();
        tokio::spawn(async move {
            let ok = client.do_disconnect().await;
            if let Some(cb) = callback {
                cb(ok);
            }
        });
        true
    }

    async fn do_connect(&self) -> bool {
        let mut slot = self.session.write().await;
        if slot.is_some() && self.is_connected() {
            return true;
        }

        let settings = self.settings.lock().unwrap().clone();
        info!(
            "Connecting to OBS WebSocket at {}:{}...",
            settings.host, settings.port
        );

        let client =
            match Client::connect(settings.host, settings.port, settings.password).await {
                Ok(client) => client,
                Err(e) => {
                    error!("OBS connection failed: {e}");
                    return false;
                }
            };

        // Version handshake verifies the session is actually live.
        let version = match client.general().version().await {
            Ok(version) => version,
            Err(e) => {
                error!("OBS version handshake failed: {e}");
                return false;
            }
        };
        info!(
            "Connected to OBS {} (obs-websocket {})",
            version.obs_version, version.obs_web_socket_version
        );

        let client = Arc::new(client);

        match client.events() {
            Ok(events) => self.spawn_event_listener(events),
            Err(e) => warn!("Failed to subscribe to OBS events: {e}"),
        }

        // The profile list is refreshed as part of every successful connect.
        match client.profiles().list().await {
            Ok(list) => {
                debug!("Retrieved OBS profiles: {:?}", list.profiles);
                *self.profiles.lock().unwrap() = list.profiles;
            }
            Err(e) => {
                warn!("Failed to fetch OBS profiles: {e}");
                self.profiles.lock().unwrap().clear();
            }
        }

        *slot = Some(client);
        drop(slot);

        self.connected.store(true, Ordering::SeqCst);
        self.spawn_keepalive();
        self.notify_connection_state(true);
        true
    }

    async fn do_disconnect(&self) -> bool {
        info!("Disconnecting from OBS...");
        self.connected.store(false, Ordering::SeqCst);

        // The keepalive loop observes the flag; give it a bounded window,
        // then abort it.
        let handle = self.keepalive.lock().unwrap().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(KEEPALIVE_STOP_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }

        let mut slot = self.session.write().await;
        let op = self.op_lock.lock().await; // wait out any in-flight command
        if let Some(client) = slot.take() {
            if let Ok(mut client) = Arc::try_unwrap(client) {
                let _ = client.disconnect().await;
            }
        }
        drop(op);
        drop(slot);

        self.profiles.lock().unwrap().clear();
        self.recording.store(false, Ordering::SeqCst);
        self.notify_connection_state(false);
        info!("Disconnected from OBS");
        true
    }

    /// Switch the current profile. Validated locally against the cached
    /// list; unknown names fail without an RPC round-trip.
    pub fn set_profile(&self, profile: &str, callback: Option<BoolCallback>) -> bool {
        if !self.is_connected() {
            error!("Not connected to OBS");
            if let Some(cb) = callback {
                cb(false);
            }
            return false;
        }
        let client = self.clone();
        let profile = profile.to_string();
        tokio::spawn(async move {
            let ok = client.run_set_profile(&profile).await;
            if let Some(cb) = callback {
                cb(ok);
            }
        });
        true
    }

    async fn run_set_profile(&self, profile: &str) -> bool {
        if !self.profiles.lock().unwrap().iter().any(|p| p == profile) {
            error!(profile, "Profile not found");
            return false;
        }
        let Some(client) = self.client().await else {
            return false;
        };
        let _op = self.op_lock.lock().await;
        match client.profiles().set_current(profile).await {
            Ok(()) => {
                info!(profile, "Changed OBS profile");
                true
            }
            Err(e) => {
                error!("Failed to set profile: {e}");
                false
            }
        }
    }

    /// Start recording. The callback reports request success only; the
    /// recording flag is updated by the `RecordStateChanged` event.
    pub fn start_recording(&self, callback: Option<BoolCallback>) -> bool {
        if !self.is_connected() {
            error!("Not connected to OBS");
            if let Some(cb) = callback {
                cb(false);
            }
            return false;
        }
        let client = self.clone();
        tokio::spawn(async move {
            let ok = client.run_start_recording().await;
            if let Some(cb) = callback {
                cb(ok);
            }
        });
        true
    }

    async fn run_start_recording(&self) -> bool {
        let Some(client) = self.client().await else {
            return false;
        };
        let _op = self.op_lock.lock().await;
        match client.recording().start().await {
            Ok(_) => {
                info!("Requested recording start");
                true
            }
            Err(e) => {
                error!("Failed to start recording: {e}");
                false
            }
        }
    }

    /// Stop recording. Same contract as [`start_recording`](Self::start_recording).
    pub fn stop_recording(&self, callback: Option<BoolCallback>) -> bool {
        if !self.is_connected() {
            error!("Not connected to OBS");
            if let Some(cb) = callback {
                cb(false);
            }
            return false;
        }
        let client = self.clone();
        tokio::spawn(async move {
            let ok = client.run_stop_recording().await;
            if let Some(cb) = callback {
                cb(ok);
            }
        });
        true
    }

    async fn run_stop_recording(&self) -> bool {
        let Some(client) = self.client().await else {
            return false;
        };
        let _op = self.op_lock.lock().await;
        match client.recording().stop().await {
            Ok(_) => {
                info!("Requested recording stop");
                true
            }
            Err(e) => {
                error!("Failed to stop recording: {e}");
                false
            }
        }
    }

    /// Fetch the profile list and refresh the local cache.
    pub fn get_profiles(&self, callback: Option<ListCallback>) -> bool {
        if !self.is_connected() {
            error!("Not connected to OBS");
            if let Some(cb) = callback {
                cb(Vec::new());
            }
            return false;
        }
        let client = self.clone();
        tokio::spawn(async move {
            let profiles = client.run_get_profiles().await;
            if let Some(cb) = callback {
                cb(profiles);
            }
        });
        true
    }

    async fn run_get_profiles(&self) -> Vec<String> {
        let Some(client) = self.client().await else {
            return Vec::new();
        };
        let _op = self.op_lock.lock().await;
        match client.profiles().list().await {
            Ok(list) => {
                debug!("Retrieved OBS profiles: {:?}", list.profiles);
                *self.profiles.lock().unwrap() = list.profiles.clone();
                list.profiles
            }
            Err(e) => {
                error!("Failed to get profiles: {e}");
                Vec::new()
            }
        }
    }

    /// Fetch the scene name list.
    pub fn get_scene_list(&self, callback: Option<ListCallback>) -> bool {
        if !self.is_connected() {
            error!("Not connected to OBS");
            if let Some(cb) = callback {
                cb(Vec::new());
            }
            return false;
        }
        let client = self.clone();
        tokio::spawn(async move {
            let scenes = client.run_get_scene_list().await;
            if let Some(cb) = callback {
                cb(scenes);
            }
        });
        true
    }

    async fn run_get_scene_list(&self) -> Vec<String> {
        let Some(client) = self.client().await else {
            return Vec::new();
        };
        let _op = self.op_lock.lock().await;
        match client.scenes().list().await {
            Ok(list) => {
                let scenes: Vec<String> =
                    list.scenes.into_iter().map(|scene| scene.id.name).collect();
                debug!("Retrieved OBS scenes: {scenes:?}");
                scenes
            }
            Err(e) => {
                error!("Failed to get scenes: {e}");
                Vec::new()
            }
        }
    }

    /// Switch the current program scene.
    pub fn set_current_scene(&self, scene: &str, callback: Option<BoolCallback>) -> bool {
        if !self.is_connected() {
            error!("Not connected to OBS");
            if let Some(cb) = callback {
                cb(false);
            }
            return false;
        }
        let client = self.clone();
        let scene = scene.to_string();
        tokio::spawn(async move {
            let ok = client.run_set_current_scene(&scene).await;
            if let Some(cb) = callback {
                cb(ok);
            }
        });
        true
    }

    async fn run_set_current_scene(&self, scene: &str) -> bool {
        let Some(client) = self.client().await else {
            return false;
        };
        let _op = self.op_lock.lock().await;
        match client.scenes().set_current_program_scene(scene).await {
            Ok(()) => {
                info!(scene, "Changed OBS scene");
                true
            }
            Err(e) => {
                error!("Failed to set scene: {e}");
                false
            }
        }
    }

    /// Fetch the current program scene name. The callback receives an empty
    /// string on failure.
    pub fn get_current_scene(&self, callback: Option<StringCallback>) -> bool {
        if !self.is_connected() {
            error!("Not connected to OBS");
            if let Some(cb) = callback {
                cb(String::new());
            }
            return false;
        }
        let client = self.clone();
        tokio::spawn(async move {
            let scene = client.run_get_current_scene().await;
            if let Some(cb) = callback {
                cb(scene);
            }
        });
        true
    }

    async fn run_get_current_scene(&self) -> String {
        let Some(client) = self.client().await else {
            return String::new();
        };
        let _op = self.op_lock.lock().await;
        match client.scenes().current_program_scene().await {
            Ok(scene) => {
                debug!("Current OBS scene: {}", scene.id.name);
                scene.id.name
            }
            Err(e) => {
                error!("Failed to get current scene: {e}");
                String::new()
            }
        }
    }

    async fn client(&self) -> Option<Arc<Client>> {
        self.session.read().await.clone()
    }

    fn spawn_event_listener(&self, events: impl futures::Stream<Item = Event> + Send + 'static) {
        let client = self.clone();
        tokio::spawn(async move {
            tokio::pin!(events);
            while let Some(event) = events.next().await {
                if let Event::RecordStateChanged { active, .. } = event {
                    client.apply_record_state(active);
                }
            }
            debug!("OBS event stream ended");
        });
    }

    /// Apply a confirmed recording state. This is the only writer of the
    /// recording flag.
    fn apply_record_state(&self, active: bool) {
        self.recording.store(active, Ordering::SeqCst);
        debug!(active, "Recording state changed");
        let handlers = self
            .event_handlers
            .lock()
            .unwrap()
            .get(RECORD_STATE_CHANGED)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(active))).is_err() {
                error!("Panic in recording state handler (ignored)");
            }
        }
    }

    fn spawn_keepalive(&self) {
        let client = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(KEEPALIVE_INTERVAL).await;
                if !client.connected.load(Ordering::SeqCst) {
                    break;
                }
                let Some(session) = client.client().await else {
                    break;
                };
                let _op = client.op_lock.lock().await;
                if let Err(e) = session.general().version().await {
                    warn!("OBS keepalive failed: {e}");
                    // No reconnect from here; the next explicit connect
                    // re-establishes the session.
                    client.connected.store(false, Ordering::SeqCst);
                    break;
                }
            }
            debug!("OBS keepalive task ending");
        });
        *self.keepalive.lock().unwrap() = Some(handle);
    }

    fn notify_connection_state(&self, connected: bool) {
        debug!(connected, "Notifying OBS connection handlers");
        self.conn_callbacks.notify(connected);
        self.conn_handlers.notify(connected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn test_client() -> ObsClient {
        ObsClient::new(&ObsConfig::default())
    }

    #[tokio::test]
    async fn commands_fail_locally_while_disconnected() {
        let client = test_client();

        let (tx, rx) = oneshot::channel();
        let started = client.start_recording(Some(Box::new(move |ok| {
            tx.send(ok).unwrap();
        })));
        assert!(!started);
        assert!(!rx.await.unwrap());

        let (tx, rx) = oneshot::channel();
        assert!(!client.get_profiles(Some(Box::new(move |profiles| {
            tx.send(profiles).unwrap();
        }))));
        assert!(rx.await.unwrap().is_empty());

        let (tx, rx) = oneshot::channel();
        assert!(!client.get_current_scene(Some(Box::new(move |scene| {
            tx.send(scene).unwrap();
        }))));
        assert_eq!(rx.await.unwrap(), "");
    }

    #[tokio::test]
    async fn set_profile_rejects_unknown_name_without_rpc() {
        let client = test_client();
        // Simulate an established session state with a cached profile list
        // but no live RPC session: an unknown name must fail on the local
        // validation step, before any client lookup.
        client.connected.store(true, Ordering::SeqCst);
        *client.profiles.lock().unwrap() = vec!["League of Legends".to_string()];

        let (tx, rx) = oneshot::channel();
        let initiated = client.set_profile(
            "Unknown",
            Some(Box::new(move |ok| {
                tx.send(ok).unwrap();
            })),
        );
        assert!(initiated);
        assert!(!rx.await.unwrap());
    }

    #[tokio::test]
    async fn connect_is_a_noop_when_already_connected() {
        let client = test_client();
        client.connected.store(true, Ordering::SeqCst);

        let (tx, rx) = oneshot::channel();
        assert!(client.connect(Some(Box::new(move |ok| {
            tx.send(ok).unwrap();
        }))));
        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn disconnect_is_a_noop_when_already_disconnected() {
        let client = test_client();
        let (tx, rx) = oneshot::channel();
        assert!(client.disconnect(Some(Box::new(move |ok| {
            tx.send(ok).unwrap();
        }))));
        assert!(rx.await.unwrap());
    }

    #[test]
    fn recording_flag_follows_only_confirmed_events() {
        let client = test_client();
        assert!(!client.is_recording());

        // A command success callback firing does not touch the flag; only
        // the event application path does.
        client.apply_record_state(true);
        assert!(client.is_recording());
        client.apply_record_state(false);
        assert!(!client.is_recording());
    }

    #[test]
    fn record_state_handlers_are_fanned_out() {
        let client = test_client();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        client.register_event_handler(
            RECORD_STATE_CHANGED,
            Arc::new(move |active| seen2.lock().unwrap().push(active)),
        );

        client.apply_record_state(true);
        client.apply_record_state(false);
        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn late_connection_handler_is_replayed_current_state() {
        let client = test_client();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        client.add_connection_handler(Arc::new(move |connected| {
            seen2.lock().unwrap().push(connected)
        }));
        assert_eq!(*seen.lock().unwrap(), vec![false]);

        // The legacy callback list stays silent until the next transition.
        let count = Arc::new(StdMutex::new(0));
        let count2 = count.clone();
        client.add_connection_callback(Arc::new(move |_| *count2.lock().unwrap() += 1));
        assert_eq!(*count.lock().unwrap(), 0);

        client.notify_connection_state(true);
        assert_eq!(*seen.lock().unwrap(), vec![false, true]);
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
