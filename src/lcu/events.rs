//! LCU event frames and subscription dispatch
//!
//! The client's WebSocket speaks a small WAMP-like framing: subscriptions go
//! out as `[5, "OnJsonApiEvent_<path>", {}]` and events come back as
//! `[8, "OnJsonApiEvent_<path>", {uri, ...}]`. Dispatch is prefix-matched,
//! as a contract: a handler registered for a path receives every event
//! whose path starts with it, so a consumer can subscribe to a coarse path
//! and see all nested sub-events.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// Subscribe opcode.
const OP_SUBSCRIBE: u64 = 5;
/// Event opcode.
const OP_EVENT: u64 = 8;
/// Prefix the client prepends to every JSON API event name.
const EVENT_PREFIX: &str = "OnJsonApiEvent_";

/// Handler invoked with the event payload (the frame's third element).
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle identifying one registered handler on one path.
pub type HandlerId = u64;

/// Build the subscribe frame for an event path.
pub fn subscribe_frame(path: &str) -> Value {
    json!([OP_SUBSCRIBE, format!("{EVENT_PREFIX}{path}"), {}])
}

/// Parse an inbound text frame.
///
/// `Ok(Some((path, payload)))` for a well-formed event frame with the prefix
/// already stripped, `Ok(None)` for valid JSON that is not an event frame
/// (ignored), `Err` for malformed JSON.
pub fn parse_event_frame(text: &str) -> Result<Option<(String, Value)>, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;

    let Some(items) = value.as_array() else {
        return Ok(None);
    };
    if items.len() != 3 || items[0].as_u64() != Some(OP_EVENT) {
        return Ok(None);
    }
    let Some(name) = items[1].as_str() else {
        return Ok(None);
    };
    let Some(path) = name.strip_prefix(EVENT_PREFIX) else {
        return Ok(None);
    };
    if !items[2].is_object() {
        return Ok(None);
    }

    Ok(Some((path.to_string(), items[2].clone())))
}

/// Registered handlers, keyed by event path.
#[derive(Default)]
pub struct Subscriptions {
    next_id: HandlerId,
    handlers: HashMap<String, Vec<(HandlerId, EventHandler)>>,
}

impl Subscriptions {
    pub fn add(&mut self, path: &str, handler: EventHandler) -> HandlerId {
        let id = self.next_id;
        self.next_id += 1;
        self.handlers
            .entry(path.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove one handler, or all handlers for the path when `id` is `None`.
    pub fn remove(&mut self, path: &str, id: Option<HandlerId>) {
        if let Some(entries) = self.handlers.get_mut(path) {
            match id {
                Some(id) => entries.retain(|(i, _)| *i != id),
                None => entries.clear(),
            }
            if entries.is_empty() {
                self.handlers.remove(path);
            }
        }
    }

    /// Distinct registered paths, for (re)subscription.
    pub fn paths(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Handlers whose registered path is a prefix of `event_path`, in
    /// registration order within each path.
    pub fn matching(&self, event_path: &str) -> Vec<EventHandler> {
        let mut matched = Vec::new();
        for (registered, entries) in &self.handlers {
            if event_path.starts_with(registered.as_str()) {
                matched.extend(entries.iter().map(|(_, h)| h.clone()));
            }
        }
        matched
    }
}

/// Invoke every matching handler for an event, isolating panics so one bad
/// handler cannot starve the rest or kill the receive loop.
pub fn dispatch(handlers: &[EventHandler], path: &str, payload: &Value) {
    for handler in handlers {
        if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
            error!(path, "Panic in event handler (ignored)");
        }
    }
}
