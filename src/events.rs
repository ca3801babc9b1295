//! Retry notifications.
//!
//! [`RetryBus`] is the owned observer set that the retrying caller publishes
//! to whenever a quota failure is scheduled for another attempt. Observers are
//! plain callbacks; [`RetryBus::subscribe`] hands back a [`RetrySubscription`]
//! that removes the observer when dropped.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// One scheduled retry of a remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryNotice {
    /// Observability id of the call, e.g. `"video-3"`.
    pub call_id: String,
    /// How long the caller will wait before the next attempt.
    pub wait: Duration,
    /// 1-based number of the attempt that just failed.
    pub attempt: u32,
}

impl RetryNotice {
    pub fn wait_ms(&self) -> u64 {
        self.wait.as_millis() as u64
    }
}

pub type RetryCallback = Arc<dyn Fn(&RetryNotice) + Send + Sync + 'static>;

struct Observer {
    id: u64,
    active: AtomicBool,
    callback: RetryCallback,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    observers: Vec<Arc<Observer>>,
}

/// Fan-out hub for [`RetryNotice`]s.
///
/// Cloning yields another handle onto the same observer set.
#[derive(Clone, Default)]
pub struct RetryBus {
    registry: Arc<Mutex<Registry>>,
}

impl RetryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for every future notice.
    ///
    /// The observer stays registered until the returned subscription is
    /// dropped or [`RetrySubscription::unsubscribe`] is called.
    pub fn subscribe<F>(&self, callback: F) -> RetrySubscription
    where
        F: Fn(&RetryNotice) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.next_id += 1;
        let observer = Arc::new(Observer {
            id: registry.next_id,
            active: AtomicBool::new(true),
            callback: Arc::new(callback),
        });
        registry.observers.push(Arc::clone(&observer));

        RetrySubscription {
            registry: Arc::downgrade(&self.registry),
            observer,
        }
    }

    /// Delivers `notice` to every active observer and returns how many ran.
    ///
    /// A panicking observer is logged and skipped; it never reaches the
    /// publisher.
    pub fn publish(&self, notice: &RetryNotice) -> usize {
        let observers: Vec<Arc<Observer>> = self
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .observers
            .clone();

        let mut delivered = 0;
        for observer in observers {
            if !observer.active.load(Ordering::SeqCst) {
                continue;
            }
            let callback = Arc::clone(&observer.callback);
            match catch_unwind(AssertUnwindSafe(|| callback(notice))) {
                Ok(()) => delivered += 1,
                Err(_) => tracing::warn!(
                    call_id = %notice.call_id,
                    observer = observer.id,
                    "retry observer panicked",
                ),
            }
        }
        delivered
    }

    pub fn observer_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .observers
            .len()
    }
}

/// Disposer for a [`RetryBus`] observer.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct RetrySubscription {
    registry: Weak<Mutex<Registry>>,
    observer: Arc<Observer>,
}

impl RetrySubscription {
    /// Stops delivery to this observer. Safe to call more than once.
    pub fn unsubscribe(&self) {
        if !self.observer.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.observers.retain(|o| o.id != self.observer.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.observer.active.load(Ordering::SeqCst)
    }
}

impl Drop for RetrySubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Per-call backoff deadlines, for live countdowns in a front end.
#[derive(Clone, Default)]
pub struct RetryBoard {
    deadlines: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl RetryBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes the board to `bus`; the board is fed while the returned
    /// subscription lives.
    pub fn attach(&self, bus: &RetryBus) -> RetrySubscription {
        let board = self.clone();
        bus.subscribe(move |notice| board.record(notice, Utc::now()))
    }

    pub fn record(&self, notice: &RetryNotice, now: DateTime<Utc>) {
        let wait = TimeDelta::from_std(notice.wait).unwrap_or_else(|_| TimeDelta::days(1));
        let deadline = now.checked_add_signed(wait).unwrap_or(now);
        self.deadlines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(notice.call_id.clone(), deadline);
    }

    /// Time left before `call_id` retries, or `None` when it is not backing off.
    pub fn remaining(&self, call_id: &str, now: DateTime<Utc>) -> Option<Duration> {
        let mut deadlines = self.deadlines.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = *deadlines.get(call_id)?;
        match (deadline - now).to_std() {
            Ok(left) if !left.is_zero() => Some(left),
            _ => {
                deadlines.remove(call_id);
                None
            }
        }
    }

    /// All calls still backing off at `now`, soonest first. Expired entries
    /// are dropped.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<(String, Duration)> {
        let mut deadlines = self.deadlines.lock().unwrap_or_else(|e| e.into_inner());
        deadlines.retain(|_, deadline| *deadline > now);

        let mut out: Vec<(String, Duration)> = deadlines
            .iter()
            .filter_map(|(id, deadline)| {
                (*deadline - now).to_std().ok().map(|left| (id.clone(), left))
            })
            .collect();
        out.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        out
    }
}
