//! Game tracker implementation
//!
//! Consumes gameflow and champion-select events from the LCU client, maps
//! them onto the phase enumeration, and drives recording through a
//! [`RecordingControl`]. The local recording flag is a cache of OBS's own
//! truth: it changes only when a confirmed record-state event arrives,
//! never as a direct effect of issuing a command.

use serde_json::{json, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::lcu::LcuClient;
use crate::obs::{BoolCallback, ObsClient, RECORD_STATE_CHANGED};

use super::phase::GamePhase;

/// Gameflow event path on the LCU bus.
const GAMEFLOW_PATH: &str = "lol-gameflow_v1_session";
/// Champion select event path on the LCU bus.
const CHAMP_SELECT_PATH: &str = "lol-champ-select_v1_session";

/// Callback receiving consolidated game-state updates:
/// `(event_type, payload)` with `event_type` one of `"gameflow"` or
/// `"champselect"`.
pub type GameUpdateCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// The recording-side seam the tracker drives. Implemented by
/// [`ObsClient`]; test doubles stand in for it.
pub trait RecordingControl: Send + Sync {
    fn is_connected(&self) -> bool;
    fn start_recording(&self, callback: Option<BoolCallback>) -> bool;
    fn stop_recording(&self, callback: Option<BoolCallback>) -> bool;
    fn set_profile(&self, profile: &str, callback: Option<BoolCallback>) -> bool;
    /// Register for confirmed recording-state changes.
    fn on_record_state_changed(&self, handler: Arc<dyn Fn(bool) + Send + Sync>);
}

impl RecordingControl for ObsClient {
    fn is_connected(&self) -> bool {
        ObsClient::is_connected(self)
    }

    fn start_recording(&self, callback: Option<BoolCallback>) -> bool {
        ObsClient::start_recording(self, callback)
    }

    fn stop_recording(&self, callback: Option<BoolCallback>) -> bool {
        ObsClient::stop_recording(self, callback)
    }

    fn set_profile(&self, profile: &str, callback: Option<BoolCallback>) -> bool {
        ObsClient::set_profile(self, profile, callback)
    }

    fn on_record_state_changed(&self, handler: Arc<dyn Fn(bool) + Send + Sync>) {
        self.register_event_handler(RECORD_STATE_CHANGED, handler);
    }
}

struct TrackerState {
    phase: GamePhase,
    recording: bool,
}

/// Tracks the match lifecycle and manages recording.
#[derive(Clone)]
pub struct GameTracker {
    lcu: LcuClient,
    recorder: Arc<dyn RecordingControl>,
    profile: String,
    state: Arc<Mutex<TrackerState>>,
    update_callback: Arc<Mutex<Option<GameUpdateCallback>>>,
}

impl GameTracker {
    pub fn new(lcu: LcuClient, recorder: Arc<dyn RecordingControl>, profile: &str) -> Self {
        Self {
            lcu,
            recorder,
            profile: profile.to_string(),
            state: Arc::new(Mutex::new(TrackerState {
                phase: GamePhase::None,
                recording: false,
            })),
            update_callback: Arc::new(Mutex::new(None)),
        }
    }

    /// Register the downstream game-update callback.
    pub fn register_game_update_callback(&self, callback: GameUpdateCallback) {
        *self.update_callback.lock().unwrap() = Some(callback);
        info!("Game update callback registered");
    }

    /// Current phase, read-only.
    pub fn current_phase(&self) -> GamePhase {
        self.state.lock().unwrap().phase
    }

    /// Recording state as last confirmed by the recorder.
    pub fn is_recording(&self) -> bool {
        self.state.lock().unwrap().recording
    }

    /// Subscribe to LCU events, seed the current phase, and wire the
    /// recording-state feedback.
    pub async fn start(&self) {
        info!("Starting game tracker...");

        let tracker = self.clone();
        self.lcu.subscribe(
            GAMEFLOW_PATH,
            Arc::new(move |payload| tracker.handle_gameflow_event(payload)),
        );
        let tracker = self.clone();
        self.lcu.subscribe(
            CHAMP_SELECT_PATH,
            Arc::new(move |payload| tracker.handle_champselect_event(payload)),
        );

        // Seed the phase from one direct read. The seed never starts
        // recording: restarting mid-match must not begin a partial
        // recording.
        let gameflow = self.lcu.get_current_gameflow().await;
        if let Some(raw) = gameflow.get("phase").and_then(Value::as_str) {
            let phase = GamePhase::from_raw(raw);
            self.state.lock().unwrap().phase = phase;
            info!(?phase, "Seeded game phase");
            if phase == GamePhase::InGame {
                warn!("Game already in progress - not starting recording");
            }
        }

        if self.recorder.is_connected() {
            self.apply_recording_profile();
        }

        let tracker = self.clone();
        self.recorder
            .on_record_state_changed(Arc::new(move |active| {
                tracker.handle_recording_state(active)
            }));
    }

    /// Stop tracking; requests a recording stop when one is believed
    /// active.
    pub fn stop(&self) {
        info!("Stopping game tracker...");
        if self.is_recording() {
            self.request_stop_recording();
        }
    }

    /// Gameflow session update from the LCU bus.
    fn handle_gameflow_event(&self, payload: &Value) {
        let session = payload.get("data").cloned().unwrap_or(Value::Null);
        let raw = session.get("phase").and_then(Value::as_str).unwrap_or("None");
        let queue = session
            .pointer("/gameData/queue/description")
            .and_then(Value::as_str)
            .unwrap_or("Unknown Queue")
            .to_string();

        let new_phase = GamePhase::from_raw(raw);
        if self.state.lock().unwrap().phase == new_phase {
            return;
        }

        info!(phase = raw, queue = %queue, "Game phase changed");
        self.notify_game_update("gameflow", &json!({ "phase": raw, "queue": queue }));
        self.apply_phase_policy(new_phase);
        self.state.lock().unwrap().phase = new_phase;
    }

    /// Champion select update from the LCU bus. A session that ends
    /// without data while we are in champion select is a dodge.
    fn handle_champselect_event(&self, payload: &Value) {
        if !is_empty_payload(payload.get("data")) {
            return;
        }
        let dodged = self.state.lock().unwrap().phase == GamePhase::ChampionSelect;
        if dodged {
            info!("Champion select ended without game data - dodge");
            self.handle_dodge();
        }
    }

    fn handle_dodge(&self) {
        // Force the stop regardless of the cached flag; a dodge must never
        // leave a recording running.
        self.recorder.stop_recording(Some(Box::new(|ok| {
            if ok {
                info!("Recording stop requested after dodge");
            } else {
                error!("Failed to stop recording after dodge");
            }
        })));
        // Reset directly, bypassing the normal transition notification.
        self.state.lock().unwrap().phase = GamePhase::None;
    }

    fn apply_phase_policy(&self, new_phase: GamePhase) {
        match new_phase {
            GamePhase::ChampionSelect => self.request_start_recording(),
            GamePhase::InGame => {
                if !self.is_recording() {
                    self.request_start_recording();
                }
            }
            GamePhase::None | GamePhase::Lobby | GamePhase::PostGame => {
                if self.is_recording() {
                    self.request_stop_recording();
                }
            }
            GamePhase::Matchmaking | GamePhase::GameStart => {}
        }
    }

    /// Confirmed recording state from the recorder. The only writer of the
    /// local flag.
    fn handle_recording_state(&self, active: bool) {
        self.state.lock().unwrap().recording = active;
        info!(
            "Recording {}",
            if active { "started" } else { "stopped" }
        );
    }

    fn request_start_recording(&self) {
        if self.is_recording() || !self.recorder.is_connected() {
            return;
        }
        self.recorder.start_recording(Some(Box::new(|ok| {
            if ok {
                info!("Recording start requested");
            } else {
                error!("Failed to start recording");
            }
        })));
    }

    fn request_stop_recording(&self) {
        if !self.is_recording() || !self.recorder.is_connected() {
            return;
        }
        self.recorder.stop_recording(Some(Box::new(|ok| {
            if ok {
                info!("Recording stop requested");
            } else {
                error!("Failed to stop recording");
            }
        })));
    }

    fn apply_recording_profile(&self) {
        let profile = self.profile.clone();
        self.recorder.set_profile(
            &self.profile,
            Some(Box::new(move |ok| {
                if ok {
                    info!(profile = %profile, "Set recording profile");
                } else {
                    error!(profile = %profile, "Failed to set recording profile");
                }
            })),
        );
    }

    fn notify_game_update(&self, event_type: &str, payload: &Value) {
        let callback = self.update_callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(|| callback(event_type, payload))).is_err() {
                error!("Panic in game update callback (ignored)");
            }
        } else {
            debug!(event_type, "No game update callback registered");
        }
    }
}

/// Mirrors the "session ended" shape: a missing, null, or empty `data`
/// member means champion select is over.
fn is_empty_payload(data: Option<&Value>) -> bool {
    match data {
        None | Some(Value::Null) => true,
        Some(Value::Object(map)) => map.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Bool(b)) => !b,
        Some(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::RwLock;

    /// Recorder double. With `confirm` set it behaves like real OBS: every
    /// accepted start/stop request is followed by a confirmed state event.
    /// Without it, requests succeed but no event ever arrives.
    struct MockRecorder {
        connected: AtomicBool,
        confirm: bool,
        starts: AtomicUsize,
        stops: AtomicUsize,
        profile_calls: Mutex<Vec<String>>,
        handler: Mutex<Option<Arc<dyn Fn(bool) + Send + Sync>>>,
    }

    impl MockRecorder {
        fn new(confirm: bool) -> Arc<Self> {
            Arc::new(Self {
                connected: AtomicBool::new(true),
                confirm,
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                profile_calls: Mutex::new(Vec::new()),
                handler: Mutex::new(None),
            })
        }

        fn fire_state_event(&self, active: bool) {
            if let Some(handler) = self.handler.lock().unwrap().clone() {
                handler(active);
            }
        }
    }

    impl RecordingControl for MockRecorder {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn start_recording(&self, callback: Option<BoolCallback>) -> bool {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.confirm {
                self.fire_state_event(true);
            }
            if let Some(cb) = callback {
                cb(true);
            }
            true
        }

        fn stop_recording(&self, callback: Option<BoolCallback>) -> bool {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.confirm {
                self.fire_state_event(false);
            }
            if let Some(cb) = callback {
                cb(true);
            }
            true
        }

        fn set_profile(&self, profile: &str, callback: Option<BoolCallback>) -> bool {
            self.profile_calls.lock().unwrap().push(profile.to_string());
            if let Some(cb) = callback {
                cb(true);
            }
            true
        }

        fn on_record_state_changed(&self, handler: Arc<dyn Fn(bool) + Send + Sync>) {
            *self.handler.lock().unwrap() = Some(handler);
        }
    }

    fn inert_lcu() -> LcuClient {
        LcuClient::new(Arc::new(RwLock::new(None))).unwrap()
    }

    async fn tracker_with(recorder: Arc<MockRecorder>) -> GameTracker {
        let tracker = GameTracker::new(inert_lcu(), recorder, "League of Legends");
        tracker.start().await;
        tracker
    }

    fn gameflow_event(raw: &str) -> Value {
        json!({
            "uri": "/lol-gameflow/v1/session",
            "data": {
                "phase": raw,
                "gameData": { "queue": { "description": "Ranked Solo/Duo" } }
            }
        })
    }

    fn collect_phases(tracker: &GameTracker) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        tracker.register_game_update_callback(Arc::new(move |event_type, payload| {
            assert_eq!(event_type, "gameflow");
            seen2
                .lock()
                .unwrap()
                .push(payload["phase"].as_str().unwrap().to_string());
        }));
        seen
    }

    #[tokio::test]
    async fn full_match_lifecycle_records_exactly_once() {
        let recorder = MockRecorder::new(true);
        let tracker = tracker_with(recorder.clone()).await;
        let seen = collect_phases(&tracker);

        for raw in [
            "HomeScreen",
            "Lobby",
            "ChampSelect",
            "InProgress",
            "WaitingForStats",
        ] {
            tracker.handle_gameflow_event(&gameflow_event(raw));
        }

        assert_eq!(recorder.starts.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.stops.load(Ordering::SeqCst), 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["Lobby", "ChampSelect", "InProgress", "WaitingForStats"]
        );
        assert_eq!(tracker.current_phase(), GamePhase::PostGame);
        assert!(!tracker.is_recording());
    }

    #[tokio::test]
    async fn duplicate_events_produce_no_duplicate_effects() {
        let recorder = MockRecorder::new(true);
        let tracker = tracker_with(recorder.clone()).await;
        let seen = collect_phases(&tracker);

        tracker.handle_gameflow_event(&gameflow_event("ChampSelect"));
        tracker.handle_gameflow_event(&gameflow_event("ChampSelect"));

        assert_eq!(recorder.starts.load(Ordering::SeqCst), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn neutral_phases_trigger_no_recording_action() {
        let recorder = MockRecorder::new(true);
        let tracker = tracker_with(recorder.clone()).await;
        let seen = collect_phases(&tracker);

        tracker.handle_gameflow_event(&gameflow_event("Lobby"));
        tracker.handle_gameflow_event(&gameflow_event("Matchmaking"));
        tracker.handle_gameflow_event(&gameflow_event("GameStart"));

        assert_eq!(recorder.starts.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.stops.load(Ordering::SeqCst), 0);
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn dodge_stops_recording_and_resets_silently() {
        // No confirmations: the cached flag stays false, yet the dodge
        // must still issue exactly one stop request.
        let recorder = MockRecorder::new(false);
        let tracker = tracker_with(recorder.clone()).await;
        let seen = collect_phases(&tracker);

        tracker.handle_gameflow_event(&gameflow_event("ChampSelect"));
        tracker.handle_champselect_event(&json!({ "uri": "/lol-champ-select/v1/session", "data": null }));

        assert_eq!(recorder.stops.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.current_phase(), GamePhase::None);
        // Only the ChampSelect transition was notified; the reset is silent.
        assert_eq!(*seen.lock().unwrap(), vec!["ChampSelect"]);
    }

    #[tokio::test]
    async fn champselect_update_with_data_is_not_a_dodge() {
        let recorder = MockRecorder::new(false);
        let tracker = tracker_with(recorder.clone()).await;

        tracker.handle_gameflow_event(&gameflow_event("ChampSelect"));
        tracker.handle_champselect_event(
            &json!({ "uri": "/lol-champ-select/v1/session", "data": { "timer": {} } }),
        );

        assert_eq!(recorder.stops.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.current_phase(), GamePhase::ChampionSelect);
    }

    #[tokio::test]
    async fn recording_flag_only_follows_confirmed_events() {
        // Command callbacks report success, but without a confirmed state
        // event the flag must stay unchanged.
        let recorder = MockRecorder::new(false);
        let tracker = tracker_with(recorder.clone()).await;

        tracker.handle_gameflow_event(&gameflow_event("ChampSelect"));
        assert_eq!(recorder.starts.load(Ordering::SeqCst), 1);
        assert!(!tracker.is_recording());

        // The confirmation arrives later; only then does the flag flip.
        recorder.fire_state_event(true);
        assert!(tracker.is_recording());
    }

    #[tokio::test]
    async fn in_game_without_prior_start_begins_recording() {
        let recorder = MockRecorder::new(true);
        let tracker = tracker_with(recorder.clone()).await;

        // Straight into a game (e.g. events missed during reconnect).
        tracker.handle_gameflow_event(&gameflow_event("InProgress"));
        assert_eq!(recorder.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_requests_a_recording_stop_when_active() {
        let recorder = MockRecorder::new(true);
        let tracker = tracker_with(recorder.clone()).await;

        tracker.handle_gameflow_event(&gameflow_event("ChampSelect"));
        assert!(tracker.is_recording());

        tracker.stop();
        assert_eq!(recorder.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_applies_the_recording_profile_when_connected() {
        let recorder = MockRecorder::new(true);
        let tracker = tracker_with(recorder.clone()).await;
        assert_eq!(
            *recorder.profile_calls.lock().unwrap(),
            vec!["League of Legends"]
        );
        let _ = tracker;
    }

    #[test]
    fn empty_payload_shapes() {
        assert!(is_empty_payload(None));
        assert!(is_empty_payload(Some(&Value::Null)));
        assert!(is_empty_payload(Some(&json!({}))));
        assert!(!is_empty_payload(Some(&json!({ "timer": 1 }))));
    }
}
