use std::ptr::NonNull;

use super::{Reclaimer, ThreadTable};
use crate::block_bag::BLOCK_SIZE;
use crate::config::{Config, ThreadId};
use crate::pool::Pool;
use crate::recovery::RecoveryManager;
use crate::stats::ThreadStatus;

/// The first formulation of NBR+.
///
/// Thresholds are counted in blocks of the retired bag: a thread signals
/// once it holds more than `bag_capacity_pow2 / BLOCK_SIZE` blocks, and
/// tries the low-watermark path every `lo_watermark_cadence` retires past
/// 1/2, 1/3 or 1/4 of that (depending on its tid). The bookmark is the
/// start of the head block, so records of that block wait for the next
/// round.
pub struct NbrOrig<T> {
    table: ThreadTable<T>,
    patience: usize,
}

impl<T> NbrOrig<T> {
    #[inline]
    fn is_past_lo_watermark(&self, tid: ThreadId, size_in_blocks: usize) -> bool {
        size_in_blocks * (tid.index() % 3 + 2) > self.patience
    }
}

impl<T> Reclaimer<T> for NbrOrig<T> {
    const NAME: &'static str = "nbr_orig";
    const NEEDS_SET_JMP: bool = true;

    fn new(config: &Config) -> Self {
        Self {
            table: ThreadTable::new(config),
            patience: (config.bag_capacity_pow2 / BLOCK_SIZE).max(1),
        }
    }

    fn init_thread(&self, tid: ThreadId) {
        self.table.init_thread(tid, self.patience * BLOCK_SIZE);
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
        let size_in_blocks = local.bag.size_in_blocks();

        if size_in_blocks > self.patience {
            self.table.reclaim_hi(tid, local, recovery, pool);
            local.lo.reset();
        } else if self.is_past_lo_watermark(tid, size_in_blocks)
            && local.lo.retires_since % local.lo.cadence == 0
        {
            if local.lo.is_first_entry() {
                let bookmark = local.bag.block_start_position();
                self.table.enter_lo_watermark(local, bookmark);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lo_watermark_depends_on_tid() {
        let reclaimer =
            <NbrOrig<u64> as Reclaimer<u64>>::new(&Config::new(3).with_bag_capacity(BLOCK_SIZE * 64));
        assert_eq!(reclaimer.patience, 64);
        // 1/2, 1/3 and 1/4 of the patience.
        assert!(!reclaimer.is_past_lo_watermark(ThreadId::new(0), 32));
        assert!(reclaimer.is_past_lo_watermark(ThreadId::new(0), 33));
        assert!(reclaimer.is_past_lo_watermark(ThreadId::new(1), 22));
        assert!(!reclaimer.is_past_lo_watermark(ThreadId::new(2), 16));
        assert!(reclaimer.is_past_lo_watermark(ThreadId::new(2), 17));
    }
}
