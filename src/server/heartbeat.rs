//! Connection-independent timeout sweep
//!
//! Every live connection registers its [`TimeoutControl`] here. A single
//! periodic task ticks all of them; a tick only signals aborts, the
//! connection tasks react on their own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::http::cancel::AbortReason;
use crate::http::timeout::TimeoutControl;

/// Default sweep period
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Registry {
    controls: Mutex<HashMap<u64, TimeoutControl>>,
    next_id: AtomicU64,
}

/// Shared handle to the sweep registry
#[derive(Clone, Default)]
pub struct Heartbeat {
    registry: Arc<Registry>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `control` to the sweep until the returned guard is dropped.
    pub fn register(&self, control: TimeoutControl) -> HeartbeatRegistration {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, control);
        HeartbeatRegistration {
            registry: Arc::clone(&self.registry),
            id,
        }
    }

    /// Number of registered connections
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ticks every registered control. Returns how many timed out.
    pub fn tick(&self, now: Instant) -> usize {
        let controls: Vec<TimeoutControl> = self.lock().values().cloned().collect();
        let fired = controls
            .iter()
            .filter(|control| control.tick(now).is_some())
            .count();
        if fired > 0 {
            tracing::debug!(fired, "heartbeat aborted timed out connections");
        }
        fired
    }

    /// Aborts every registered connection with `reason`. Returns how many
    /// had not been aborted already.
    pub fn abort_all(&self, reason: AbortReason) -> usize {
        let controls: Vec<TimeoutControl> = self.lock().values().cloned().collect();
        controls
            .iter()
            .filter(|control| control.abort(reason.clone()))
            .count()
    }

    /// Runs the sweep every `period` on the current runtime.
    pub fn spawn(&self, period: Duration) -> JoinHandle<()> {
        let heartbeat = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                let now = interval.tick().await;
                heartbeat.tick(now);
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, TimeoutControl>> {
        self.registry
            .controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes its connection from the sweep when dropped
pub struct HeartbeatRegistration {
    registry: Arc<Registry>,
    id: u64,
}

impl Drop for HeartbeatRegistration {
    fn drop(&mut self) {
        self.registry
            .controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}
