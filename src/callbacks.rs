//! Connection-state callback registries
//!
//! Every connection-bearing component fans its connected/disconnected flag
//! out to an arbitrary set of consumer callbacks. The registry keeps the
//! last published value so late subscribers can be replayed the current
//! state at registration time, and isolates a panicking callback so the
//! remaining callbacks still get notified.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tracing::error;

/// Handle returned by [`CallbackRegistry::add`], used to remove a callback.
pub type CallbackId = u64;

type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

struct Inner<T> {
    next_id: CallbackId,
    entries: Vec<(CallbackId, Callback<T>)>,
    last: T,
}

/// An ordered set of callbacks sharing one payload type.
pub struct CallbackRegistry<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Clone> CallbackRegistry<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 0,
                entries: Vec::new(),
                last: initial,
            }),
        }
    }

    /// Register a callback without replaying the current value.
    pub fn add(&self, callback: Callback<T>) -> CallbackId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push((id, callback));
        id
    }

    /// Register a callback and immediately invoke it once with the last
    /// published value, so a late subscriber is never out of sync.
    pub fn add_with_replay(&self, callback: Callback<T>) -> CallbackId {
        let (id, last) = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.entries.push((id, callback.clone()));
            (id, inner.last.clone())
        };
        invoke(&callback, last);
        id
    }

    /// Remove a previously registered callback. Unknown ids are ignored.
    pub fn remove(&self, id: CallbackId) {
        self.inner.lock().unwrap().entries.retain(|(i, _)| *i != id);
    }

    /// Publish a new value to every registered callback, in registration
    /// order. Invocation happens outside the registry lock, so a callback
    /// may register or remove callbacks without deadlocking.
    pub fn notify(&self, value: T) {
        let entries: Vec<Callback<T>> = {
            let mut inner = self.inner.lock().unwrap();
            inner.last = value.clone();
            inner.entries.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for callback in entries {
            invoke(&callback, value.clone());
        }
    }

    /// The last published value.
    pub fn current(&self) -> T {
        self.inner.lock().unwrap().last.clone()
    }
}

fn invoke<T>(callback: &Callback<T>, value: T) {
    if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
        error!("Panic in connection callback (ignored)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn late_subscriber_sees_current_state() {
        let registry = CallbackRegistry::new(false);
        registry.notify(true);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        registry.add_with_replay(Arc::new(move |v| seen2.lock().unwrap().push(v)));

        // Exactly one synchronous replay of the current value.
        assert_eq!(*seen.lock().unwrap(), vec![true]);
    }

    #[test]
    fn add_without_replay_stays_silent() {
        let registry = CallbackRegistry::new(true);
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        registry.add(Arc::new(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        registry.notify(false);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_callback_does_not_block_others() {
        let registry = CallbackRegistry::new(false);
        registry.add(Arc::new(|_| panic!("boom")));

        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        registry.add(Arc::new(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));

        registry.notify(true);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(registry.current());
    }

    #[test]
    fn removed_callback_is_not_invoked() {
        let registry = CallbackRegistry::new(0u32);
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let id = registry.add(Arc::new(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));
        registry.remove(id);
        registry.notify(1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
