//! Deadline scheduler used by sessions, client identities and subscriptions
//! to reclaim themselves after a period of inactivity.
//!
//! Deadlines live in a min-heap keyed by instant. Callbacks are stored
//! separately by handle id, so cancelling is a map removal and stale heap
//! entries are skipped when they surface. A callback is taken out of the map
//! under the lock before it runs, which makes firing and cancellation
//! mutually exclusive: each callback runs at most once.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type Callback = Box<dyn FnOnce(Instant) + Send>;

/// Token returned by [`TimeoutScheduler::schedule`], used to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutHandle(u64);

/// An entity that expires after `timeout_period` without use.
pub trait Expirable: Send + Sync {
    /// Zero disables expiry.
    fn timeout_period(&self) -> Duration;
    fn last_use(&self) -> Instant;
    /// Called once the entity has been idle for a full period.
    fn timeout(&self);
    /// Store the handle of the currently armed timer so it can be cancelled.
    fn set_timeout_handle(&self, handle: Option<TimeoutHandle>);
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    callbacks: HashMap<u64, Callback>,
    next_id: u64,
}

pub struct TimeoutScheduler {
    state: Mutex<State>,
    wakeup: Notify,
}

impl TimeoutScheduler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            wakeup: Notify::new(),
        }
    }

    /// Run `callback` once `after` has elapsed, unless cancelled first.
    pub fn schedule<F>(&self, after: Duration, callback: F) -> TimeoutHandle
    where
        F: FnOnce(Instant) + Send + 'static,
    {
        self.schedule_at(Instant::now() + after, callback)
    }

    pub fn schedule_at<F>(&self, deadline: Instant, callback: F) -> TimeoutHandle
    where
        F: FnOnce(Instant) + Send + 'static,
    {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        let is_earliest = state
            .heap
            .peek()
            .map_or(true, |Reverse((at, _))| deadline < *at);
        state.heap.push(Reverse((deadline, id)));
        state.callbacks.insert(id, Box::new(callback));
        drop(state);

        if is_earliest {
            self.wakeup.notify_one();
        }
        TimeoutHandle(id)
    }

    /// Cancel a pending callback. Returns `false` if it already ran or was cancelled.
    pub fn cancel(&self, handle: TimeoutHandle) -> bool {
        self.state.lock().callbacks.remove(&handle.0).is_some()
    }

    /// Number of callbacks still waiting to fire.
    pub fn pending(&self) -> usize {
        self.state.lock().callbacks.len()
    }

    /// Earliest deadline that still has a live callback.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut state = self.state.lock();
        while let Some(Reverse((at, id))) = state.heap.peek().copied() {
            if state.callbacks.contains_key(&id) {
                return Some(at);
            }
            state.heap.pop();
        }
        None
    }

    /// Fire every callback whose deadline is at or before `now`.
    ///
    /// Callbacks run on the calling thread, outside the scheduler lock, so they
    /// may schedule or cancel further timers. Returns how many ran.
    pub fn run_due(&self, now: Instant) -> usize {
        let mut due = Vec::new();
        {
            let mut state = self.state.lock();
            while let Some(Reverse((at, id))) = state.heap.peek().copied() {
                if at > now {
                    break;
                }
                state.heap.pop();
                if let Some(cb) = state.callbacks.remove(&id) {
                    due.push(cb);
                }
            }
        }
        let fired = due.len();
        for cb in due {
            cb(now);
        }
        fired
    }

    /// Arm an idle timer for `target`. When it fires and the target was used
    /// during the period, it is rearmed for the remainder instead.
    pub fn watch(self: &Arc<Self>, target: Weak<dyn Expirable>) -> Option<TimeoutHandle> {
        let period = target.upgrade()?.timeout_period();
        if period.is_zero() {
            return None;
        }
        let handle = self.arm(target.clone(), period);
        if let Some(t) = target.upgrade() {
            t.set_timeout_handle(Some(handle));
        }
        Some(handle)
    }

    fn arm(self: &Arc<Self>, target: Weak<dyn Expirable>, delay: Duration) -> TimeoutHandle {
        let scheduler = Arc::downgrade(self);
        self.schedule(delay, move |now| {
            let Some(entity) = target.upgrade() else {
                return;
            };
            let period = entity.timeout_period();
            if period.is_zero() {
                entity.set_timeout_handle(None);
                return;
            }
            let idle = now.saturating_duration_since(entity.last_use());
            if idle >= period {
                entity.set_timeout_handle(None);
                entity.timeout();
                return;
            }
            if let Some(scheduler) = scheduler.upgrade() {
                let handle = scheduler.arm(target, period - idle);
                entity.set_timeout_handle(Some(handle));
            }
        })
    }

    /// Drive the scheduler on the tokio runtime until `shutdown` is cancelled.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let sleep = match scheduler.next_deadline() {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)),
                    // Nothing pending; park until something is scheduled.
                    None => tokio::time::sleep(Duration::from_secs(3600)),
                };
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = scheduler.wakeup.notified() => continue,
                    _ = sleep => {
                        let fired = scheduler.run_due(Instant::now());
                        if fired > 0 {
                            tracing::trace!(fired, "timeouts fired");
                        }
                    }
                }
            }
            tracing::debug!("timeout scheduler stopped");
        })
    }
}

impl Default for TimeoutScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[test]
    fn fires_in_deadline_order() {
        let scheduler = TimeoutScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let base = Instant::now();
        for (label, ms) in [("b", 20), ("a", 10), ("c", 30)] {
            let order = order.clone();
            scheduler.schedule_at(base + Duration::from_millis(ms), move |_| order.lock().push(label));
        }

        assert_eq!(scheduler.run_due(base + Duration::from_millis(15)), 1);
        assert_eq!(scheduler.run_due(base + Duration::from_millis(40)), 2);
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn cancelled_callback_never_fires() {
        let scheduler = TimeoutScheduler::new();
        let fired = counter();
        let f = fired.clone();
        let handle = scheduler.schedule(Duration::ZERO, move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert!(scheduler.cancel(handle));
        assert!(!scheduler.cancel(handle));
        assert_eq!(scheduler.run_due(Instant::now() + Duration::from_secs(1)), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(scheduler.next_deadline().is_none());
    }

    #[test]
    fn fires_exactly_once() {
        let scheduler = TimeoutScheduler::new();
        let fired = counter();
        let f = fired.clone();
        let handle = scheduler.schedule(Duration::ZERO, move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let later = Instant::now() + Duration::from_secs(1);
        scheduler.run_due(later);
        scheduler.run_due(later);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.cancel(handle));
    }

    struct Idle {
        period: Duration,
        last_use: Mutex<Instant>,
        timeouts: AtomicUsize,
        handle: Mutex<Option<TimeoutHandle>>,
    }

    impl Expirable for Idle {
        fn timeout_period(&self) -> Duration {
            self.period
        }
        fn last_use(&self) -> Instant {
            *self.last_use.lock()
        }
        fn timeout(&self) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }
        fn set_timeout_handle(&self, handle: Option<TimeoutHandle>) {
            *self.handle.lock() = handle;
        }
    }

    #[test]
    fn watch_rearms_when_used_during_period() {
        let scheduler = Arc::new(TimeoutScheduler::new());
        let start = Instant::now();
        let idle = Arc::new(Idle {
            period: Duration::from_secs(10),
            last_use: Mutex::new(start),
            timeouts: AtomicUsize::new(0),
            handle: Mutex::new(None),
        });
        let target: Arc<dyn Expirable> = idle.clone();
        scheduler.watch(Arc::downgrade(&target)).unwrap();

        // Used 5s in: the first deadline must rearm rather than expire.
        *idle.last_use.lock() = start + Duration::from_secs(5);
        scheduler.run_due(start + Duration::from_secs(11));
        assert_eq!(idle.timeouts.load(Ordering::SeqCst), 0);
        assert!(idle.handle.lock().is_some());

        scheduler.run_due(start + Duration::from_secs(16));
        assert_eq!(idle.timeouts.load(Ordering::SeqCst), 1);
        assert!(idle.handle.lock().is_none());
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn driver_fires_scheduled_callbacks() {
        let scheduler = Arc::new(TimeoutScheduler::new());
        let shutdown = CancellationToken::new();
        let task = scheduler.spawn(shutdown.clone());

        let (tx, rx) = tokio::sync::oneshot::channel();
        scheduler.schedule(Duration::from_millis(10), move |_| {
            let _ = tx.send(());
        });
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("timer did not fire")
            .unwrap();

        shutdown.cancel();
        task.await.unwrap();
    }
}
