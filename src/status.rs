//! Pre-warm status pub/sub.
//!
//! Any number of observers can subscribe; each receives every published status
//! exactly once, in publish order. There is no replay: late subscribers call
//! [`StatusBroadcaster::current`] instead.
//!
//! A callback may publish. The nested status is queued and delivered once the
//! outer status has reached every subscriber.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PreWarmPhase {
    Idle,
    Booting,
    Installing,
    Ready,
    Error,
}

impl PreWarmPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            PreWarmPhase::Idle => "idle",
            PreWarmPhase::Booting => "booting",
            PreWarmPhase::Installing => "installing",
            PreWarmPhase::Ready => "ready",
            PreWarmPhase::Error => "error",
        }
    }
}

impl std::fmt::Display for PreWarmPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreWarmStatus {
    pub phase: PreWarmPhase,
    pub message: String,
    /// 0..=100
    pub progress: u8,
    pub updated_at: DateTime<Utc>,
}

impl PreWarmStatus {
    pub fn new(phase: PreWarmPhase, message: impl Into<String>, progress: u8) -> Self {
        Self {
            phase,
            message: message.into(),
            progress: progress.min(100),
            updated_at: Utc::now(),
        }
    }

    pub fn idle() -> Self {
        Self::new(PreWarmPhase::Idle, "", 0)
    }
}

type Callback = Arc<dyn Fn(&PreWarmStatus) + Send + Sync>;

struct Shared {
    subscribers: Mutex<Vec<(u64, Callback)>>,
    current: Mutex<PreWarmStatus>,
    next_id: AtomicU64,
    // Reentrant so a callback may publish without deadlocking.
    delivery: ReentrantMutex<RefCell<Delivery>>,
}

#[derive(Default)]
struct Delivery {
    draining: bool,
    pending: VecDeque<PreWarmStatus>,
}

/// Ends a drain even if a callback panics, so later publishes still deliver.
struct DrainGuard<'a>(&'a RefCell<Delivery>);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        let mut delivery = self.0.borrow_mut();
        delivery.draining = false;
        delivery.pending.clear();
    }
}

impl Shared {
    fn remove(&self, id: u64) {
        self.subscribers.lock().retain(|(sid, _)| *sid != id);
    }
}

#[derive(Clone)]
pub struct StatusBroadcaster {
    shared: Arc<Shared>,
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                subscribers: Mutex::new(Vec::new()),
                current: Mutex::new(PreWarmStatus::idle()),
                next_id: AtomicU64::new(1),
                delivery: ReentrantMutex::new(RefCell::new(Delivery::default())),
            }),
        }
    }

    /// Register `callback`. Delivery stops when the returned handle is
    /// dropped or [`Subscription::unsubscribe`] is called.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PreWarmStatus) + Send + Sync + 'static,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .subscribers
            .lock()
            .push((id, Arc::new(callback)));
        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Record `status` as current and deliver it to every subscriber
    /// registered when its delivery starts.
    pub fn publish(&self, status: PreWarmStatus) {
        let delivery = self.shared.delivery.lock();
        tracing::debug!(
            phase = %status.phase,
            progress = status.progress,
            "{}",
            status.message
        );
        *self.shared.current.lock() = status.clone();

        {
            let mut state = delivery.borrow_mut();
            state.pending.push_back(status);
            if state.draining {
                // Published from a callback; the outer call delivers it next.
                return;
            }
            state.draining = true;
        }

        let _drain = DrainGuard(&delivery);
        loop {
            let next = delivery.borrow_mut().pending.pop_front();
            let Some(status) = next else {
                break;
            };
            let snapshot: Vec<Callback> = self
                .shared
                .subscribers
                .lock()
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect();
            for callback in snapshot {
                callback(&status);
            }
        }
    }

    /// Convenience for `publish(PreWarmStatus::new(..))`.
    pub fn set(&self, phase: PreWarmPhase, message: impl Into<String>, progress: u8) {
        self.publish(PreWarmStatus::new(phase, message, progress));
    }

    pub fn current(&self) -> PreWarmStatus {
        self.shared.current.lock().clone()
    }
}

/// Handle returned by [`StatusBroadcaster::subscribe`].
pub struct Subscription {
    id: u64,
    shared: Weak<Shared>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
