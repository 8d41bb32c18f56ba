//! Deadline-ordered timers.
//!
//! A [`TimerList`] keeps timers ordered by `(absolute deadline ms, id)`; the
//! id tie-break makes the order total. Periodic timers are re-armed to
//! `now + period` when collected. A *condition* timer holds a [`Weak`]
//! reference and silently disarms once the referent is dropped.
//!
//! The owner of the list (the i/o manager) polls [`TimerList::next_timer`]
//! for its wait timeout and drains due callbacks with
//! [`TimerList::collect_expired`]. Insertions that become the new earliest
//! deadline are reported so a blocked `epoll_wait` can be interrupted; the
//! `tickled` latch keeps that report from repeating until the next
//! `next_timer` call.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::clock;

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

struct TimerState {
    id: u64,
    /// Current absolute deadline; also the map key half. Only written under
    /// the list write lock.
    deadline: AtomicU64,
    period: AtomicU64,
    recurring: bool,
    /// Cleared on cancel and on one-shot expiry.
    callback: Mutex<Option<TimerCallback>>,
}

struct ListInner {
    timers: BTreeMap<(u64, u64), Arc<TimerState>>,
    /// Last `now` sample, for the backwards-clock guard.
    previous: u64,
}

struct ListShared {
    inner: RwLock<ListInner>,
    tickled: AtomicBool,
}

/// The timer multiset. Cheap to share; handles keep a weak reference back.
pub struct TimerList {
    shared: Arc<ListShared>,
    next_id: AtomicU64,
}

/// Handle to one inserted timer.
pub struct TimerHandle {
    state: Arc<TimerState>,
    owner: Weak<ListShared>,
}

impl TimerList {
    pub fn new() -> TimerList {
        TimerList {
            shared: Arc::new(ListShared {
                inner: RwLock::new(ListInner {
                    timers: BTreeMap::new(),
                    previous: clock::monotonic_ms(),
                }),
                tickled: AtomicBool::new(false),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Inserts a timer due in `period_ms`. Returns the handle and whether the
    /// insertion became the new earliest deadline (and the owner has not been
    /// notified of a front insertion since the last `next_timer`).
    pub fn add<F>(&self, period_ms: u64, callback: F, recurring: bool) -> (TimerHandle, bool)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_arc(period_ms, Arc::new(callback), recurring)
    }

    /// Like [`add`](Self::add), but the callback only fires while `cond` can
    /// still be upgraded.
    pub fn add_condition<F>(
        &self,
        period_ms: u64,
        callback: F,
        cond: Weak<dyn Any + Send + Sync>,
        recurring: bool,
    ) -> (TimerHandle, bool)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let gated: TimerCallback = Arc::new(move || {
            if cond.upgrade().is_some() {
                callback();
            }
        });
        self.add_arc(period_ms, gated, recurring)
    }

    fn add_arc(&self, period_ms: u64, callback: TimerCallback, recurring: bool) -> (TimerHandle, bool) {
        let deadline = clock::monotonic_ms() + period_ms;
        let state = Arc::new(TimerState {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            deadline: AtomicU64::new(deadline),
            period: AtomicU64::new(period_ms),
            recurring,
            callback: Mutex::new(Some(callback)),
        });
        let key = (deadline, state.id);
        let mut inner = self.shared.inner.write().expect("timer lock poisoned");
        inner.timers.insert(key, state.clone());
        let at_front = inner.timers.keys().next() == Some(&key);
        let notify = at_front && !self.shared.tickled.swap(true, Ordering::AcqRel);
        drop(inner);
        (
            TimerHandle {
                state,
                owner: Arc::downgrade(&self.shared),
            },
            notify,
        )
    }

    /// Milliseconds until the earliest deadline: `Some(0)` when overdue,
    /// `None` when no timer is queued. Also rearms the front-insertion
    /// notification latch.
    pub fn next_timer(&self) -> Option<u64> {
        let inner = self.shared.inner.read().expect("timer lock poisoned");
        self.shared.tickled.store(false, Ordering::Release);
        let (&(deadline, _), _) = inner.timers.iter().next()?;
        Some(deadline.saturating_sub(clock::monotonic_ms()))
    }

    /// Appends the callbacks of every timer due at `now` to `out`, re-arming
    /// periodic ones. A backwards wall-clock jump of more than one hour
    /// expires everything currently queued.
    pub fn collect_expired(&self, out: &mut Vec<TimerCallback>) {
        self.collect_expired_at(clock::monotonic_ms(), out)
    }

    pub(crate) fn collect_expired_at(&self, now_ms: u64, out: &mut Vec<TimerCallback>) {
        {
            let inner = self.shared.inner.read().expect("timer lock poisoned");
            if inner.timers.is_empty() {
                return;
            }
        }
        let mut inner = self.shared.inner.write().expect("timer lock poisoned");
        if inner.timers.is_empty() {
            return;
        }
        let rollover = now_ms < inner.previous && inner.previous - now_ms > 60 * 60 * 1_000;
        inner.previous = now_ms;
        if !rollover {
            match inner.timers.keys().next() {
                Some(&(deadline, _)) if deadline <= now_ms => {}
                _ => return,
            }
        }

        let expired: Vec<(u64, u64)> = if rollover {
            inner.timers.keys().copied().collect()
        } else {
            inner
                .timers
                .range(..=(now_ms, u64::MAX))
                .map(|(k, _)| *k)
                .collect()
        };
        out.reserve(expired.len());
        for key in expired {
            let state = match inner.timers.remove(&key) {
                Some(s) => s,
                None => continue,
            };
            let callback = state.callback.lock().expect("timer lock poisoned").clone();
            let callback = match callback {
                Some(cb) => cb,
                None => continue,
            };
            out.push(callback);
            if state.recurring {
                let deadline = now_ms + state.period.load(Ordering::Relaxed);
                state.deadline.store(deadline, Ordering::Relaxed);
                inner.timers.insert((deadline, state.id), state);
            } else {
                *state.callback.lock().expect("timer lock poisoned") = None;
            }
        }
    }

    pub fn has_timer(&self) -> bool {
        !self
            .shared
            .inner
            .read()
            .expect("timer lock poisoned")
            .timers
            .is_empty()
    }

    #[cfg(test)]
    fn set_previous(&self, previous: u64) {
        self.shared.inner.write().unwrap().previous = previous;
    }
}

impl Default for TimerList {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerHandle {
    /// Removes the timer without firing it. `false` if it already fired (and
    /// was one-shot), was cancelled, or outlived its list.
    pub fn cancel(&self) -> bool {
        let shared = match self.owner.upgrade() {
            Some(s) => s,
            None => return false,
        };
        let mut inner = shared.inner.write().expect("timer lock poisoned");
        let mut callback = self.state.callback.lock().expect("timer lock poisoned");
        if callback.is_none() {
            return false;
        }
        *callback = None;
        let key = (self.state.deadline.load(Ordering::Relaxed), self.state.id);
        inner.timers.remove(&key).is_some()
    }

    /// Reschedules to `now + period`, keeping the period.
    pub fn refresh(&self) -> bool {
        let period = self.state.period.load(Ordering::Relaxed);
        self.reschedule(period, true)
    }

    /// Changes the period; `from_now` restarts the countdown at the current
    /// time, otherwise the new period is applied from the old start point.
    pub fn reset(&self, period_ms: u64, from_now: bool) -> bool {
        if period_ms == self.state.period.load(Ordering::Relaxed) && !from_now {
            return true;
        }
        self.reschedule(period_ms, from_now)
    }

    fn reschedule(&self, period_ms: u64, from_now: bool) -> bool {
        let shared = match self.owner.upgrade() {
            Some(s) => s,
            None => return false,
        };
        let mut inner = shared.inner.write().expect("timer lock poisoned");
        if self.state.callback.lock().expect("timer lock poisoned").is_none() {
            return false;
        }
        let old_deadline = self.state.deadline.load(Ordering::Relaxed);
        let key = (old_deadline, self.state.id);
        let state = match inner.timers.remove(&key) {
            Some(s) => s,
            None => return false,
        };
        let old_period = self.state.period.load(Ordering::Relaxed);
        let start = if from_now {
            clock::monotonic_ms()
        } else {
            old_deadline.saturating_sub(old_period)
        };
        let deadline = start + period_ms;
        self.state.period.store(period_ms, Ordering::Relaxed);
        self.state.deadline.store(deadline, Ordering::Relaxed);
        inner.timers.insert((deadline, self.state.id), state);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let n = Arc::new(AtomicUsize::new(0));
        let n2 = n.clone();
        (n, move || {
            n2.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn fires_in_deadline_order() {
        let list = TimerList::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (ms, tag) in [(30u64, "c"), (10, "a"), (20, "b")] {
            let order = order.clone();
            list.add(ms, move || order.lock().unwrap().push(tag), false);
        }
        let mut cbs = Vec::new();
        list.collect_expired_at(clock::monotonic_ms() + 100, &mut cbs);
        for cb in &cbs {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn not_before_deadline() {
        let list = TimerList::new();
        let (n, cb) = counter();
        list.add(50, cb, false);
        let mut cbs = Vec::new();
        list.collect_expired_at(clock::monotonic_ms() + 10, &mut cbs);
        assert!(cbs.is_empty());
        assert_eq!(n.load(Ordering::SeqCst), 0);
        assert!(list.has_timer());
    }

    #[test]
    fn periodic_rearm() {
        let list = TimerList::new();
        let (n, cb) = counter();
        list.add(10, cb, true);
        let now = clock::monotonic_ms();
        for round in 1..=3 {
            let mut cbs = Vec::new();
            list.collect_expired_at(now + round * 15, &mut cbs);
            assert_eq!(cbs.len(), 1);
            for cb in &cbs {
                cb();
            }
        }
        assert_eq!(n.load(Ordering::SeqCst), 3);
        assert!(list.has_timer());
    }

    #[test]
    fn cancel_prevents_firing() {
        let list = TimerList::new();
        let (n, cb) = counter();
        let (handle, _) = list.add(10, cb, false);
        assert!(handle.cancel());
        assert!(!handle.cancel());
        let mut cbs = Vec::new();
        list.collect_expired_at(clock::monotonic_ms() + 100, &mut cbs);
        assert!(cbs.is_empty());
        assert_eq!(n.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn condition_timer_disarms_with_its_referent() {
        let list = TimerList::new();
        let (n, cb) = counter();
        let cond = Arc::new(());
        list.add_condition(
            10,
            cb,
            Arc::downgrade(&cond) as Weak<dyn Any + Send + Sync>,
            false,
        );
        drop(cond);
        let mut cbs = Vec::new();
        list.collect_expired_at(clock::monotonic_ms() + 100, &mut cbs);
        // The callback is collected but gated off.
        for cb in &cbs {
            cb();
        }
        assert_eq!(n.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn backwards_clock_expires_everything() {
        let list = TimerList::new();
        let (n, cb) = counter();
        list.add(10_000, cb, false);
        list.set_previous(20 * 3_600_000);
        let mut cbs = Vec::new();
        // Two hours before the previous sample: treat the queue as expired.
        list.collect_expired_at(18 * 3_600_000, &mut cbs);
        assert_eq!(cbs.len(), 1);
        for cb in &cbs {
            cb();
        }
        assert_eq!(n.load(Ordering::SeqCst), 1);
        assert!(!list.has_timer());
    }

    #[test]
    fn small_backwards_jump_is_not_a_rollover() {
        let list = TimerList::new();
        let (n, cb) = counter();
        list.add(10_000, cb, false);
        // One minute backwards: below the one-hour guard, and the timer's
        // deadline is still ahead of "now", so nothing may fire.
        let now = clock::monotonic_ms() + 5_000;
        list.set_previous(now + 60_000);
        let mut cbs = Vec::new();
        list.collect_expired_at(now, &mut cbs);
        assert!(cbs.is_empty());
        assert_eq!(n.load(Ordering::SeqCst), 0);
        assert!(list.has_timer());
    }

    #[test]
    fn front_insertion_reports_once() {
        let list = TimerList::new();
        let (_, cb1) = counter();
        let (_, cb2) = counter();
        let (_, cb3) = counter();
        let (_h1, front1) = list.add(1_000, cb1, false);
        assert!(front1);
        // Earlier than the head, but the latch is still set.
        let (_h2, front2) = list.add(500, cb2, false);
        assert!(!front2);
        // next_timer rearms the latch.
        assert!(list.next_timer().is_some());
        let (_h3, front3) = list.add(100, cb3, false);
        assert!(front3);
    }

    #[test]
    fn refresh_and_reset_move_the_deadline() {
        let list = TimerList::new();
        let (_, cb) = counter();
        let (handle, _) = list.add(1_000, cb, false);
        assert!(handle.refresh());
        assert!(handle.reset(50, true));
        let mut cbs = Vec::new();
        list.collect_expired_at(clock::monotonic_ms() + 100, &mut cbs);
        assert_eq!(cbs.len(), 1);
    }
}
