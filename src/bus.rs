//! In-process event bus
//!
//! Synchronous publish/subscribe between the detection segments and the
//! signal sinks (threat manager, batcher, forwarders). Listeners are invoked
//! in subscription order while the bus lock is held; a failing listener is
//! logged and never prevents later listeners or later emits.
//!
//! Listeners must not emit on the same bus from inside their callback -
//! re-entrant emits are detected and rejected instead of deadlocking.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use tracing::warn;

use crate::types::{Category, Signal};

/// Maximum signals retained in bus history (oldest dropped first).
pub const MAX_HISTORY: usize = 1000;

/// Event type every detection signal is emitted under.
pub const DETECTION_EVENT: &str = "detection";

/// Callback registered with [`EventBus::subscribe`].
pub type Listener = Box<dyn Fn(&Signal) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("emit called from inside a listener on the same bus")]
    ReentrantEmit,
}

struct BusInner {
    listeners: HashMap<String, Vec<Listener>>,
    history: VecDeque<Signal>,
}

/// Event bus with bounded history.
///
/// All operations take a single critical section; `emit` never blocks on I/O
/// while holding the lock (forwarders only copy the signal into their own
/// buffers from their callbacks).
pub struct EventBus {
    inner: Mutex<BusInner>,
    /// Thread currently running listeners, for re-entrancy detection.
    emitting: Mutex<Option<ThreadId>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BusInner {
                listeners: HashMap::new(),
                history: VecDeque::with_capacity(MAX_HISTORY),
            }),
            emitting: Mutex::new(None),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, BusInner> {
        // A poisoned lock only means a listener panicked mid-emit; the bus
        // state itself stays valid.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_emitting(&self) -> MutexGuard<'_, Option<ThreadId>> {
        self.emitting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a listener for an event type. Multiple listeners per type are
    /// invoked in subscription order.
    pub fn subscribe<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&Signal) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut inner = self.lock_inner();
        inner
            .listeners
            .entry(event_type.to_string())
            .or_default()
            .push(Box::new(listener));
    }

    /// Append the signal to history and invoke all listeners for the event
    /// type synchronously. Listener errors are logged and isolated.
    pub fn emit(&self, event_type: &str, signal: Signal) -> Result<(), BusError> {
        let current = thread::current().id();
        if *self.lock_emitting() == Some(current) {
            return Err(BusError::ReentrantEmit);
        }

        let inner = self.lock_inner();
        *self.lock_emitting() = Some(current);

        let result = self.dispatch(inner, event_type, signal);

        *self.lock_emitting() = None;
        result
    }

    fn dispatch(
        &self,
        mut inner: MutexGuard<'_, BusInner>,
        event_type: &str,
        signal: Signal,
    ) -> Result<(), BusError> {
        if inner.history.len() >= MAX_HISTORY {
            inner.history.pop_front();
        }
        inner.history.push_back(signal.clone());

        if let Some(listeners) = inner.listeners.get(event_type) {
            for listener in listeners {
                if let Err(e) = listener(&signal) {
                    warn!(
                        event_type,
                        signal = %signal.name,
                        error = %e,
                        "Listener error (continuing with remaining listeners)"
                    );
                }
            }
        }
        Ok(())
    }

    /// Last `limit` signals, optionally filtered by category.
    pub fn history(&self, category: Option<Category>, limit: usize) -> Vec<Signal> {
        let inner = self.lock_inner();
        let start = inner.history.len().saturating_sub(limit);
        inner
            .history
            .iter()
            .skip(start)
            .filter(|s| category.map_or(true, |c| s.category == c))
            .cloned()
            .collect()
    }

    /// Number of signals currently held in history.
    pub fn history_len(&self) -> usize {
        self.lock_inner().history.len()
    }

    /// Number of listeners registered for an event type.
    pub fn listener_count(&self, event_type: &str) -> usize {
        self.lock_inner()
            .listeners
            .get(event_type)
            .map_or(0, Vec::len)
    }

    /// Clear listeners and history.
    pub fn cleanup(&self) {
        let mut inner = self.lock_inner();
        inner.listeners.clear();
        inner.history.clear();
    }
}
