//! Balancer (C11): picks which worker manager a freshly accepted
//! connection is handed to. Index 0 is reserved for the accept loop's own
//! manager; dispatch only ever picks among `1..N` unless there's just the
//! one manager.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::event_manager::Handle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    LeastLoaded,
}

/// Distributes accepted connections across a fixed set of worker manager
/// [`Handle`]s. Only the accept thread ever calls [`Balancer::pick`], so
/// the round-robin cursor needs no synchronization beyond `Relaxed` ---
/// nothing else writes it.
pub struct Balancer {
    workers: Vec<Handle>,
    strategy: Strategy,
    next: AtomicUsize,
}

impl Balancer {
    /// `managers` is the full C8 array including index 0 (the accept
    /// manager); `managers[0]` is never returned by `pick` unless it's the
    /// only entry.
    pub fn new(managers: Vec<Handle>, strategy: Strategy) -> Self {
        Balancer {
            workers: managers,
            strategy,
            next: AtomicUsize::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Returns the manager handle a new connection should be placed on.
    pub fn pick(&self) -> &Handle {
        if self.workers.len() == 1 {
            return &self.workers[0];
        }
        match self.strategy {
            Strategy::RoundRobin => self.pick_round_robin(),
            Strategy::LeastLoaded => self.pick_least_loaded(),
        }
    }

    fn pick_round_robin(&self) -> &Handle {
        let span = self.workers.len() - 1;
        let idx = 1 + (self.next.fetch_add(1, Ordering::Relaxed) % span);
        &self.workers[idx]
    }

    fn pick_least_loaded(&self) -> &Handle {
        self.workers[1..]
            .iter()
            .min_by_key(|h| h.connection_count())
            .expect("len() == 1 case already returned above")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PollerConfig;
    use crate::event_manager::EventManager;

    fn handles(n: usize) -> Vec<(EventManager, Handle)> {
        (0..n)
            .filter_map(|_| {
                EventManager::new(PollerConfig {
                    entries_default: 8,
                    entries_min: 1,
                    ..PollerConfig::default()
                })
                .ok()
            })
            .map(|mgr| {
                let h = mgr.handle();
                (mgr, h)
            })
            .collect()
    }

    #[test]
    fn round_robin_wraps_and_skips_index_zero() {
        let pairs = handles(4);
        if pairs.len() < 4 {
            return; // no io_uring support in this sandbox
        }
        let hs: Vec<Handle> = pairs.iter().map(|(_, h)| h.clone()).collect();
        let balancer = Balancer::new(hs, Strategy::RoundRobin);

        let zero = &balancer.workers[0] as *const Handle;
        let mut seen = Vec::new();
        for _ in 0..9 {
            let picked = balancer.pick() as *const Handle;
            assert_ne!(picked, zero, "index 0 is reserved for the accept loop");
            seen.push(picked);
        }
        // Span is N-1 == 3, so the cycle repeats every 3 picks.
        assert_eq!(seen[0], seen[3]);
        assert_eq!(seen[3], seen[6]);
        assert_ne!(seen[0], seen[1]);
    }

    #[test]
    fn single_manager_always_returned() {
        let pairs = handles(1);
        if pairs.is_empty() {
            return;
        }
        let hs: Vec<Handle> = pairs.iter().map(|(_, h)| h.clone()).collect();
        let balancer = Balancer::new(hs, Strategy::RoundRobin);
        let first = balancer.pick() as *const Handle;
        let second = balancer.pick() as *const Handle;
        assert_eq!(first, second);
    }
}
