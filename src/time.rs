//! Monotonic timestamps and the per-loop timer set (C1).
//!
//! Every [`crate::event_manager::EventManager`] owns one [`TimerSet`]. Tasks
//! are ordered by deadline in a `BTreeMap` keyed on `(TimePoint, sequence)`
//! so that two tasks scheduled for the same microsecond keep FIFO order
//! instead of colliding.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Microseconds since an arbitrary monotonic epoch (the process start, via
/// [`Instant`]). Signed so that arithmetic on deadlines in the past during
/// catch-up never wraps.
pub type TimePoint = i64;

/// A closure run when its deadline expires. Boxed because the timer set
/// holds tasks of unrelated origin (one-shot retries, periodic heartbeats,
/// cross-thread posts).
pub type Task = Box<dyn FnMut() + Send>;

/// Returns `true` to re-arm a periodic task, `false` to let it lapse.
pub type Predicate = Box<dyn FnMut() -> bool + Send>;

static START: once_epoch::Epoch = once_epoch::Epoch::new();

mod once_epoch {
    use super::*;
    use std::sync::OnceLock;

    pub struct Epoch(OnceLock<Instant>);

    impl Epoch {
        pub const fn new() -> Self {
            Epoch(OnceLock::new())
        }

        pub fn get(&self) -> Instant {
            *self.0.get_or_init(Instant::now)
        }
    }
}

/// Current monotonic time in microseconds since this process's epoch.
pub fn now() -> TimePoint {
    START.get().elapsed().as_micros() as TimePoint
}

/// Wall-clock time formatted as `YYYY-MM-DD HH:MM:SS`, used by the logger.
/// Not monotonic; only ever compared for "did the second change".
pub fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A single scheduled task: its deadline, an optional period for re-arming,
/// and an optional continuation predicate gating re-arm.
struct Entry {
    task: Task,
    period_us: i64,
    predicate: Option<Predicate>,
}

/// Ordered multimap `deadline -> task` plus its lock, as specified in
/// section 4.1. `add`, `drain_expired` and `min_delay` are the only public
/// operations; everything else (re-arming periodics) is handled by the
/// owning [`crate::event_manager::EventManager`] using the values
/// `drain_expired` hands back.
pub struct TimerSet {
    entries: Mutex<BTreeMap<(TimePoint, u64), Entry>>,
    seq: AtomicU64,
}

impl Default for TimerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerSet {
    pub fn new() -> Self {
        TimerSet {
            entries: Mutex::new(BTreeMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Inserts a one-shot task at `deadline`.
    pub fn add(&self, deadline: TimePoint, task: Task) {
        let key = (deadline, self.next_seq());
        self.entries.lock().unwrap().insert(
            key,
            Entry {
                task,
                period_us: 0,
                predicate: None,
            },
        );
    }

    /// Inserts a periodic task: fires at `deadline`, and upon firing is
    /// re-added at `deadline + period` as long as `predicate` returns
    /// `true` (or always, if `predicate` is `None`).
    pub fn add_periodic(
        &self,
        deadline: TimePoint,
        period: Duration,
        task: Task,
        predicate: Option<Predicate>,
    ) {
        let key = (deadline, self.next_seq());
        self.entries.lock().unwrap().insert(
            key,
            Entry {
                task,
                period_us: period.as_micros() as i64,
                predicate,
            },
        );
    }

    /// Milliseconds to block in `poll` before the earliest deadline elapses,
    /// or `0` if a deadline has already passed (meaning: don't block) or the
    /// set is empty (meaning: the caller supplies its own cap, e.g. `None`).
    pub fn min_delay_ms(&self, now: TimePoint) -> Option<u64> {
        let entries = self.entries.lock().unwrap();
        entries.keys().next().map(|(deadline, _)| {
            let remaining_us = deadline - now;
            if remaining_us <= 0 {
                0
            } else {
                // Round up: a timer must never fire early because of
                // integer truncation.
                ((remaining_us + 999) / 1000) as u64
            }
        })
    }

    /// Removes and returns all entries with `deadline <= now`, in
    /// non-decreasing deadline order (guaranteed by `BTreeMap` iteration
    /// order over the `(deadline, seq)` key).
    pub fn drain_expired(&self, now: TimePoint) -> Vec<(TimePoint, Task, i64, Option<Predicate>)> {
        let mut entries = self.entries.lock().unwrap();
        let split_key = (now + 1, 0);
        let mut ready = entries.split_off(&split_key);
        // `split_off` keeps keys >= split_key in `ready` and leaves keys <
        // split_key in `entries`; swap so `entries` retains the future ones.
        std::mem::swap(&mut *entries, &mut ready);
        ready
            .into_iter()
            .map(|(k, v)| (k.0, v.task, v.period_us, v.predicate))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn drain_expired_is_ordered_and_exclusive() {
        let set = TimerSet::new();
        let fired = Arc::new(Mutex::new(Vec::new()));

        for d in [30, 10, 20] {
            let fired = Arc::clone(&fired);
            set.add(
                d,
                Box::new(move || fired.lock().unwrap().push(d)),
            );
        }

        let mut drained = set.drain_expired(20);
        assert_eq!(drained.len(), 2);
        drained.sort_by_key(|(d, ..)| *d);
        assert_eq!(drained[0].0, 10);
        assert_eq!(drained[1].0, 20);

        let rest = set.drain_expired(30);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].0, 30);
        assert!(set.is_empty());
    }

    #[test]
    fn min_delay_rounds_up_and_never_negative() {
        let set = TimerSet::new();
        assert_eq!(set.min_delay_ms(0), None);
        set.add(1_500, Box::new(|| {}));
        assert_eq!(set.min_delay_ms(0), Some(2));
        assert_eq!(set.min_delay_ms(2_000), Some(0));
    }

    #[test]
    fn periodic_rearm_respects_predicate() {
        let set = TimerSet::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        set.add_periodic(
            0,
            Duration::from_millis(10),
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            Some(Box::new({
                let count = Arc::clone(&count);
                move || count.load(Ordering::SeqCst) < 3
            })),
        );

        let mut now = 0i64;
        for _ in 0..5 {
            let mut expired = set.drain_expired(now);
            if let Some((deadline, mut task, period, mut predicate)) = expired.pop() {
                task();
                let should_rearm = predicate.as_mut().map(|p| p()).unwrap_or(true);
                if should_rearm && period > 0 {
                    set.add_periodic(deadline + period, Duration::from_micros(period as u64), task, predicate);
                }
            }
            now += 10_000;
        }

        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(set.is_empty());
    }
}
