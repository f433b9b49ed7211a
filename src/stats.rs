use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::ThreadId;

pub(crate) static GLOBAL_GARBAGE_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Retires are batched locally and published every this many records.
pub(crate) const GARBAGE_FLUSH_INTERVAL: usize = 32;

pub(crate) fn incr_garb(count: usize) {
    GLOBAL_GARBAGE_COUNT.fetch_add(count, Ordering::Relaxed);
}

pub(crate) fn decr_garb(count: usize) {
    GLOBAL_GARBAGE_COUNT.fetch_sub(count, Ordering::Relaxed);
}

/// Get current count of unreclaimed pointers, across all record managers.
///
/// Each thread publishes its retires in batches, so this may lag behind by
/// up to 31 records per thread. Use [`ThreadStatus`] for exact numbers.
pub fn count_garbages() -> usize {
    GLOBAL_GARBAGE_COUNT.load(Ordering::Relaxed)
}

/// Per-thread counters. Written by the owner only, readable by anyone.
#[derive(Default)]
pub(crate) struct ThreadCounters {
    retired: AtomicUsize,
    reclaimed: AtomicUsize,
    signal_rounds: AtomicUsize,
    hi_reclaims: AtomicUsize,
    lo_reclaims: AtomicUsize,
}

#[inline]
fn bump(counter: &AtomicUsize, count: usize) {
    // Single writer; a load-store pair is enough.
    counter.store(counter.load(Ordering::Relaxed) + count, Ordering::Relaxed);
}

impl ThreadCounters {
    #[inline]
    pub fn on_retire(&self) {
        bump(&self.retired, 1);
    }

    #[inline]
    pub fn on_reclaim(&self, count: usize) {
        bump(&self.reclaimed, count);
    }

    #[inline]
    pub fn on_signal_round(&self) {
        bump(&self.signal_rounds, 1);
    }

    #[inline]
    pub fn on_hi_reclaim(&self) {
        bump(&self.hi_reclaims, 1);
    }

    #[inline]
    pub fn on_lo_reclaim(&self) {
        bump(&self.lo_reclaims, 1);
    }

    pub fn retired(&self) -> usize {
        self.retired.load(Ordering::Relaxed)
    }

    pub fn reclaimed(&self) -> usize {
        self.reclaimed.load(Ordering::Relaxed)
    }

    pub fn signal_rounds(&self) -> usize {
        self.signal_rounds.load(Ordering::Relaxed)
    }

    pub fn hi_reclaims(&self) -> usize {
        self.hi_reclaims.load(Ordering::Relaxed)
    }

    pub fn lo_reclaims(&self) -> usize {
        self.lo_reclaims.load(Ordering::Relaxed)
    }
}

/// A snapshot of one thread's reclamation state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadStatus {
    pub tid: usize,
    pub reclaimer: &'static str,
    /// Records retired but not yet handed back to the pool.
    pub unreclaimed: usize,
    pub high_watermark: usize,
    /// Records currently published for a write phase.
    pub published: usize,
    pub announced_ts: usize,
    pub retired: usize,
    pub reclaimed: usize,
    /// Neutralization rounds this thread started.
    pub signal_rounds: usize,
    pub hi_reclaims: usize,
    pub lo_reclaims: usize,
    /// Neutralization signals this thread received.
    pub signalled: usize,
    /// Search phases of this thread that were restarted.
    pub restarts: usize,
}

impl ThreadStatus {
    pub(crate) fn from_counters(
        tid: ThreadId,
        reclaimer: &'static str,
        counters: &ThreadCounters,
    ) -> Self {
        let retired = counters.retired();
        let reclaimed = counters.reclaimed();
        Self {
            tid: tid.index(),
            reclaimer,
            unreclaimed: retired.saturating_sub(reclaimed),
            retired,
            reclaimed,
            signal_rounds: counters.signal_rounds(),
            hi_reclaims: counters.hi_reclaims(),
            lo_reclaims: counters.lo_reclaims(),
            ..Default::default()
        }
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] tid={} unreclaimed={}/{} published={} ts={} retired={} reclaimed={} \
             rounds={} hi={} lo={} signalled={} restarts={}",
            self.reclaimer,
            self.tid,
            self.unreclaimed,
            self.high_watermark,
            self.published,
            self.announced_ts,
            self.retired,
            self.reclaimed,
            self.signal_rounds,
            self.hi_reclaims,
            self.lo_reclaims,
            self.signalled,
            self.restarts,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_from_counters() {
        let counters = ThreadCounters::default();
        for _ in 0..10 {
            counters.on_retire();
        }
        counters.on_reclaim(7);
        counters.on_signal_round();
        counters.on_hi_reclaim();

        let status = ThreadStatus::from_counters(ThreadId::new(2), "nbr", &counters);
        assert_eq!(status.tid, 2);
        assert_eq!(status.unreclaimed, 3);
        assert_eq!(status.signal_rounds, 1);
        assert_eq!(status.lo_reclaims, 0);
        assert!(status.to_string().starts_with("[nbr] tid=2 unreclaimed=3"));
    }
}
