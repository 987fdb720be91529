//! Counting admission gate with FIFO wakeups.
//!
//! # Responsibilities
//! - Bound in-flight bytes or messages against a ceiling
//! - Block callers in arrival order when the ceiling is reached
//! - Allow the ceiling to change at runtime (config reload)
//!
//! # Design Decisions
//! - Each waiter owns a private `Notify` slot; `put` wakes only the head,
//!   so a later arrival can never steal an earlier waiter's admission
//! - A cost larger than the whole ceiling is admitted alone once nothing
//!   else is in use, otherwise it could never be admitted
//! - A ceiling of 0 disables blocking; usage is still counted
//! - Cancelled waiters remove their slot and pass the wakeup on

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::observability::metrics;

#[derive(Debug)]
struct ThrottleState {
    max: u64,
    current: u64,
    waiters: VecDeque<Arc<Notify>>,
    waits: u64,
}

impl ThrottleState {
    fn should_wait(&self, cost: u64) -> bool {
        let max = self.max;
        if max == 0 {
            return false;
        }
        (cost <= max && self.current + cost > max) || (cost > max && self.current > 0)
    }

    fn wake_head(&self) {
        if let Some(head) = self.waiters.front() {
            head.notify_one();
        }
    }

    fn is_head(&self, slot: &Arc<Notify>) -> bool {
        self.waiters.front().is_some_and(|h| Arc::ptr_eq(h, slot))
    }
}

/// A named counting throttle.
#[derive(Debug)]
pub struct Throttle {
    name: String,
    state: Mutex<ThrottleState>,
}

impl Throttle {
    pub fn new(name: impl Into<String>, max: u64) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(ThrottleState {
                max,
                current: 0,
                waiters: VecDeque::new(),
                waits: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current(&self) -> u64 {
        self.lock().current
    }

    pub fn max(&self) -> u64 {
        self.lock().max
    }

    /// Number of callers currently blocked in `get`.
    pub fn waiting(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Calls to `get` that had to block, since creation. Mirrors
    /// `msgr_throttle_waits_total`, which is recorded only here.
    pub fn total_waits(&self) -> u64 {
        self.lock().waits
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ThrottleState> {
        self.state.lock().expect("throttle mutex poisoned")
    }

    /// Take `cost` units, waiting behind earlier callers if necessary.
    ///
    /// `new_max`, when given, replaces the ceiling first. Returns whether the
    /// caller had to wait.
    pub async fn get(&self, cost: u64, new_max: Option<u64>) -> bool {
        let slot = {
            let mut st = self.lock();
            if let Some(max) = new_max {
                if max != st.max {
                    st.max = max;
                    st.wake_head();
                }
            }
            if st.waiters.is_empty() && !st.should_wait(cost) {
                st.current += cost;
                return false;
            }
            let slot = Arc::new(Notify::new());
            st.waiters.push_back(Arc::clone(&slot));
            st.waits += 1;
            slot
        };

        metrics::record_throttle_wait(&self.name);
        tracing::trace!(throttle = %self.name, cost, "waiting for budget");

        let mut guard = WaitSlot {
            throttle: self,
            slot: Arc::clone(&slot),
            admitted: false,
        };
        loop {
            slot.notified().await;
            let mut st = self.lock();
            if st.is_head(&slot) && !st.should_wait(cost) {
                st.waiters.pop_front();
                st.current += cost;
                // Let the next waiter re-check; it may fit as well.
                st.wake_head();
                guard.admitted = true;
                return true;
            }
        }
    }

    /// Take `cost` units only if `get` would not have waited.
    pub fn get_or_fail(&self, cost: u64) -> bool {
        let mut st = self.lock();
        if !st.waiters.is_empty() || st.should_wait(cost) {
            return false;
        }
        st.current += cost;
        true
    }

    /// Account `cost` units without blocking. Returns the new usage.
    pub fn take(&self, cost: u64) -> u64 {
        let mut st = self.lock();
        st.current += cost;
        st.current
    }

    /// Release `cost` units and wake the head waiter. Returns the new usage.
    pub fn put(&self, cost: u64) -> u64 {
        let mut st = self.lock();
        st.current = st.current.saturating_sub(cost);
        st.wake_head();
        st.current
    }

    /// Replace the ceiling and signal the head waiter.
    pub fn reset_max(&self, max: u64) {
        let mut st = self.lock();
        if st.max != max {
            tracing::debug!(throttle = %self.name, old = st.max, new = max, "throttle ceiling changed");
        }
        st.max = max;
        st.wake_head();
    }

    /// `get` wrapped in a permit that releases its cost on drop.
    pub async fn acquire(self: &Arc<Self>, cost: u64) -> ThrottlePermit {
        self.get(cost, None).await;
        ThrottlePermit {
            throttle: Arc::clone(self),
            cost,
        }
    }

    /// Non-blocking variant of [`Throttle::acquire`].
    pub fn try_acquire(self: &Arc<Self>, cost: u64) -> Option<ThrottlePermit> {
        self.get_or_fail(cost).then(|| ThrottlePermit {
            throttle: Arc::clone(self),
            cost,
        })
    }
}

/// Removes an abandoned wait slot when a `get` future is dropped early.
struct WaitSlot<'a> {
    throttle: &'a Throttle,
    slot: Arc<Notify>,
    admitted: bool,
}

impl Drop for WaitSlot<'_> {
    fn drop(&mut self) {
        if self.admitted {
            return;
        }
        let mut st = self.throttle.lock();
        let was_head = st.is_head(&self.slot);
        st.waiters.retain(|w| !Arc::ptr_eq(w, &self.slot));
        if was_head {
            st.wake_head();
        }
    }
}

/// Budget held against a [`Throttle`]; released when dropped.
#[derive(Debug)]
pub struct ThrottlePermit {
    throttle: Arc<Throttle>,
    cost: u64,
}

impl ThrottlePermit {
    pub fn cost(&self) -> u64 {
        self.cost
    }
}

impl Drop for ThrottlePermit {
    fn drop(&mut self) {
        if self.cost > 0 {
            self.throttle.put(self.cost);
        }
    }
}
