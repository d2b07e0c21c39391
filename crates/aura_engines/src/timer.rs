#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use aura_kernel_contracts::MonotonicTimeNs;
use thiserror::Error;
use tracing::debug;

pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;
pub type CancelHook = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimerError {
    #[error("timer delay must be > 0")]
    NonPositiveDelay,
    #[error("timer driver is closed")]
    DriverClosed,
}

pub trait TimerDriver: Send + Sync {
    fn now(&self) -> MonotonicTimeNs;

    fn call_later(
        &self,
        delay: Duration,
        callback: TimerCallback,
    ) -> Result<TimerHandle, TimerError>;
}

/// Zero delays would fire immediately and break p50/p95 guarantees.
pub fn check_delay(delay: Duration) -> Result<(), TimerError> {
    if delay.is_zero() {
        return Err(TimerError::NonPositiveDelay);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub u64);

const PENDING: u8 = 0;
const CANCELLED: u8 = 1;
const FIRED: u8 = 2;

/// A handle moves from pending to either cancelled or fired exactly once, so a
/// cancel that races a firing is decided by whoever claims the handle first.
#[derive(Clone)]
pub struct TimerHandle {
    id: TimerId,
    due: MonotonicTimeNs,
    state: Arc<AtomicU8>,
    on_cancel: Option<CancelHook>,
}

impl TimerHandle {
    pub fn new(id: TimerId, due: MonotonicTimeNs) -> Self {
        Self {
            id,
            due,
            state: Arc::new(AtomicU8::new(PENDING)),
            on_cancel: None,
        }
    }

    /// Runs `hook` once, from the call that cancels the timer. Attach before
    /// cloning the handle; clones share the hook.
    pub fn with_cancel_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_cancel = Some(Arc::new(hook));
        self
    }

    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn due(&self) -> MonotonicTimeNs {
        self.due
    }

    /// Cancels a pending timer. Safe to call any number of times, including
    /// after the timer fired; returns true only for the call that cancelled.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled {
            debug!(timer_id = self.id.0, "timer cancelled");
            if let Some(hook) = &self.on_cancel {
                hook();
            }
        }
        cancelled
    }

    /// Claims the handle for firing. Returns false if it was cancelled (or
    /// already fired), in which case the callback must be dropped unrun.
    pub fn try_begin_fire(&self) -> bool {
        self.state
            .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    pub fn has_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("id", &self.id)
            .field("due", &self.due)
            .field("state", &self.state.load(Ordering::Acquire))
            .finish()
    }
}

struct Scheduled {
    handle: TimerHandle,
    callback: TimerCallback,
}

struct SimInner {
    now: MonotonicTimeNs,
    next_id: u64,
    queue: BTreeMap<(MonotonicTimeNs, TimerId), Scheduled>,
}

/// Deterministic driver: time only moves when the caller advances it.
///
/// Due timers fire in `(due, arm order)` order and `now()` reads the firing
/// timer's due time inside its callback. Callbacks run without the driver
/// lock held, so they may arm or cancel further timers.
pub struct SimulatedTimerDriver {
    inner: Mutex<SimInner>,
}

impl SimulatedTimerDriver {
    pub fn new() -> Self {
        Self::starting_at(MonotonicTimeNs(0))
    }

    pub fn starting_at(now: MonotonicTimeNs) -> Self {
        Self {
            inner: Mutex::new(SimInner {
                now,
                next_id: 1,
                queue: BTreeMap::new(),
            }),
        }
    }

    /// Advances the clock by `by`, firing everything that comes due.
    /// Returns the number of callbacks run.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.now().saturating_add(by);
        self.advance_to(target)
    }

    pub fn advance_to(&self, target: MonotonicTimeNs) -> usize {
        let mut fired = 0;
        loop {
            let next = {
                let mut inner = self.lock();
                let due_now = matches!(
                    inner.queue.first_key_value(),
                    Some((&(due, _), _)) if due <= target
                );
                if !due_now {
                    if inner.now < target {
                        inner.now = target;
                    }
                    break;
                }
                let Some(((due, _), scheduled)) = inner.queue.pop_first() else {
                    break;
                };
                if due > inner.now {
                    inner.now = due;
                }
                scheduled
            };
            if next.handle.try_begin_fire() {
                debug!(timer_id = next.handle.id().0, "timer fired");
                (next.callback)();
                fired += 1;
            }
        }
        fired
    }

    /// Timers armed and neither fired nor cancelled.
    pub fn pending_count(&self) -> usize {
        self.lock()
            .queue
            .values()
            .filter(|s| s.handle.is_pending())
            .count()
    }

    pub fn next_due(&self) -> Option<MonotonicTimeNs> {
        self.lock()
            .queue
            .values()
            .filter(|s| s.handle.is_pending())
            .map(|s| s.handle.due())
            .min()
    }

    fn lock(&self) -> MutexGuard<'_, SimInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SimulatedTimerDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerDriver for SimulatedTimerDriver {
    fn now(&self) -> MonotonicTimeNs {
        self.lock().now
    }

    fn call_later(
        &self,
        delay: Duration,
        callback: TimerCallback,
    ) -> Result<TimerHandle, TimerError> {
        check_delay(delay)?;
        let mut inner = self.lock();
        let id = TimerId(inner.next_id);
        inner.next_id = inner.next_id.saturating_add(1);
        let due = inner.now.saturating_add(delay);
        let handle = TimerHandle::new(id, due);
        inner.queue.insert(
            (due, id),
            Scheduled {
                handle: handle.clone(),
                callback,
            },
        );
        debug!(timer_id = id.0, due_ns = due.0, "timer armed");
        Ok(handle)
    }
}
