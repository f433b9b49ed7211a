use std::ptr::NonNull;

use rand::Rng;

use super::{high_watermark, Reclaimer, ThreadTable};
use crate::config::{Config, ThreadId};
use crate::pool::Pool;
use crate::recovery::RecoveryManager;
use crate::stats::ThreadStatus;

/// NBR with the low-watermark optimization (NBR+).
///
/// Past half of its high watermark, a thread bookmarks its bag and
/// snapshots the announcement timestamps of all threads. As soon as some
/// other thread is seen to have completed a whole signal round since then,
/// everything below the bookmark has been passed by a neutralization, and
/// the unprotected part of it is reclaimed without sending any signal.
pub struct NbrPlus<T> {
    table: ThreadTable<T>,
}

/// How many retires to wait between two low-watermark attempts:
/// 1% or one of 5%, 10%, ..., 50% of the bag capacity.
fn random_lo_watermark_cadence(capacity: usize) -> usize {
    let cadence = match rand::thread_rng().gen_range(0..=10) {
        0 => capacity / 100,
        step => capacity * step * 5 / 100,
    };
    cadence.max(1)
}

fn lo_watermark_cadence(config: &Config) -> usize {
    if config.randomize_thresholds {
        random_lo_watermark_cadence(config.bag_capacity_pow2)
    } else {
        config.lo_watermark_cadence
    }
}

impl<T> Reclaimer<T> for NbrPlus<T> {
    const NAME: &'static str = "nbrplus";
    const NEEDS_SET_JMP: bool = true;

    fn new(config: &Config) -> Self {
        Self {
            table: ThreadTable::new(config),
        }
    }

    fn init_thread(&self, tid: ThreadId) {
        let config = self.table.config();
        self.table.init_thread(tid, high_watermark(config));
        // Half of the capacity until the first low-watermark entry.
        unsafe { self.table.local(tid) }.lo.cadence = (config.bag_capacity_pow2 / 2).max(1);
    }

    unsafe fn deinit_thread<P: Pool<T>>(&self, tid: ThreadId, pool: &P) {
        self.table.deinit_thread(tid, pool);
    }

    #[inline]
    fn start_op<P: Pool<T>>(&self, tid: ThreadId, recovery: &RecoveryManager, _: &P) -> bool {
        self.table.start_op(tid, recovery);
        false
    }

    #[inline]
    fn save_for_write_phase(&self, tid: ThreadId, record: *mut T) {
        self.table.save_for_write_phase(tid, record);
    }

    #[inline]
    fn upgrade_to_write_phase(&self, tid: ThreadId, recovery: &RecoveryManager) {
        self.table.upgrade_to_write_phase(tid, recovery);
    }

    #[inline]
    fn end_op(&self, tid: ThreadId, recovery: &RecoveryManager) {
        self.table.end_op(tid, recovery);
    }

    unsafe fn retire<P: Pool<T>>(
        &self,
        tid: ThreadId,
        record: NonNull<T>,
        recovery: &RecoveryManager,
        pool: &P,
    ) {
        debug_assert!(!recovery.is_restartable(tid), "{tid} retires in its search phase");
        let local = self.table.local(tid);
        let len = local.bag.len();

        if len > local.high_watermark {
            self.table.reclaim_hi(tid, local, recovery, pool);
            local.lo.reset();
        } else if len > local.high_watermark / 2
            && local.lo.retires_since % local.lo.cadence == 0
        {
            if local.lo.is_first_entry() {
                let bookmark = local.bag.position();
                self.table.enter_lo_watermark(local, bookmark);
                local.lo.cadence = lo_watermark_cadence(self.table.config());
            }
            if self.table.try_reclaim_lo(tid, local, pool).is_some() {
                local.lo.reset();
            }
        }

        if !local.lo.is_first_entry() {
            local.lo.retires_since += 1;
        }
        self.table.push_retired(tid, local, record);
    }

    fn is_protected(&self, _: ThreadId, record: *mut T) -> bool {
        self.table.is_published(record)
    }

    fn is_quiescent(&self, tid: ThreadId) -> bool {
        self.table.is_quiescent(tid)
    }

    fn status(&self, tid: ThreadId) -> ThreadStatus {
        self.table.status(tid, Self::NAME)
    }

    unsafe fn release_all<P: Pool<T>>(&mut self, pool: &P) {
        self.table.release_all(pool);
    }
}
