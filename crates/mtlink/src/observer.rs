//! Observation hooks for the dispatch loop.
//!
//! A [`Manager`](crate::Manager) is handed one observer at construction. The
//! loop reports every event it pulls and its own exit; there is no global
//! switch to turn diagnostics on or off.

use tracing::debug;

use crate::manager::EventKind;

pub trait EventObserver: Send + Sync {
    /// Called by the loop before it handles an event.
    fn on_event(&self, manager_id: &str, kind: EventKind);

    /// Called once, after the loop stops pulling events.
    fn on_stopped(&self, _manager_id: &str) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl EventObserver for NoopObserver {
    fn on_event(&self, _manager_id: &str, _kind: EventKind) {}
}

/// Observer that forwards events to `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl EventObserver for TracingObserver {
    fn on_event(&self, manager_id: &str, kind: EventKind) {
        debug!(manager_id, event = %kind, request = kind.is_request(), "Event");
    }

    fn on_stopped(&self, manager_id: &str) {
        debug!(manager_id, "Dispatch loop stopped");
    }
}
