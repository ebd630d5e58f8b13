//! Per-type debounce for the time-sorted view rebuild.
//!
//! Bursts of writes to one type collapse into at most one sort pass per
//! window. A write that lands inside the window gets a trailing pass
//! scheduled for the end of it; if another write arrives meanwhile, the
//! newer one takes over the trailing pass. The last write therefore
//! always gets a pass that runs after it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Sort immediately.
    Now,
    /// Sleep for `delay`, then [`SortDebouncer::claim`] with `ticket`.
    Later { delay: Duration, ticket: u64 },
}

#[derive(Default)]
struct SortState {
    last_run: Option<Instant>,
    ticket: u64,
}

pub struct SortDebouncer {
    window: Duration,
    state: Mutex<HashMap<String, SortState>>,
}

impl SortDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn admit(&self, type_name: &str, now: Instant) -> Admission {
        let mut state = self.state.lock();
        let entry = state.entry(type_name.to_string()).or_default();
        entry.ticket += 1;

        match entry.last_run {
            Some(last) if now.saturating_duration_since(last) < self.window => Admission::Later {
                delay: self.window - now.saturating_duration_since(last),
                ticket: entry.ticket,
            },
            _ => {
                entry.last_run = Some(now);
                Admission::Now
            }
        }
    }

    /// Whether a deferred pass should still run: `false` when a newer
    /// write has taken over.
    pub fn claim(&self, type_name: &str, ticket: u64, now: Instant) -> bool {
        let mut state = self.state.lock();
        match state.get_mut(type_name) {
            Some(entry) if entry.ticket == ticket => {
                entry.last_run = Some(now);
                true
            }
            _ => false,
        }
    }
}
