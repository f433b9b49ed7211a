use std::ptr::NonNull;

use super::{Reclaimer, ThreadTable};
use crate::config::{Config, ThreadId};
use crate::pool::Pool;
use crate::recovery::RecoveryManager;
use crate::stats::ThreadStatus;

/// A reclaimer that never reclaims while threads run.
///
/// Retired records are only counted and kept in the bag until the thread
/// deinitializes. With `Config::allocator_bottleneck_test`, `start_op`
/// instead drains the whole bag to the pool once it holds
/// `bag_capacity_pow2` records, to measure the allocator in isolation.
pub struct NoReclaim<T> {
    table: ThreadTable<T>,
    bottleneck_test: bool,
}

impl<T> Reclaimer<T> for NoReclaim<T> {
    const NAME: &'static str = "none";
    const NEEDS_SET_JMP: bool = false;
    const QUIESCENCE_IS_PER_RECORD_TYPE: bool = false;

    fn new(config: &Config) -> Self {
        Self {
            table: ThreadTable::new(config),
            bottleneck_test: config.allocator_bottleneck_test,
        }
    }

    fn init_thread(&self, tid: ThreadId) {
        let capacity = self.table.config().bag_capacity_pow2;
        self.table.init_thread(tid, capacity);
    }

    unsafe fn deinit_thread<P: Pool<T>>(&self, tid: ThreadId, pool: &P) {
        self.table.deinit_thread(tid, pool);
    }

    fn start_op<P: Pool<T>>(&self, tid: ThreadId, _: &RecoveryManager, pool: &P) -> bool {
        if !self.bottleneck_test {
            return false;
        }
        let local = unsafe { self.table.local(tid) };
        if local.bag.len() < local.high_watermark {
            return false;
        }
        // Readers are not tracked in this mode; it is for allocator benchmarks only.
        unsafe { self.table.drain(tid, pool) };
        true
    }

    #[inline]
    fn save_for_write_phase(&self, _: ThreadId, _: *mut T) {}

    #[inline]
    fn upgrade_to_write_phase(&self, _: ThreadId, _: &RecoveryManager) {}

    #[inline]
    fn end_op(&self, _: ThreadId, _: &RecoveryManager) {}

    unsafe fn retire<P: Pool<T>>(&self, tid: ThreadId, record: NonNull<T>, _: &RecoveryManager, _: &P) {
        let local = self.table.local(tid);
        self.table.push_retired(tid, local, record);
    }

    fn is_protected(&self, _: ThreadId, _: *mut T) -> bool {
        true
    }

    fn is_quiescent(&self, _: ThreadId) -> bool {
        true
    }

    fn status(&self, tid: ThreadId) -> ThreadStatus {
        self.table.status(tid, Self::NAME)
    }

    unsafe fn release_all<P: Pool<T>>(&mut self, pool: &P) {
        self.table.release_all(pool);
    }
}
