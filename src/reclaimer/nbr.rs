use std::ptr::NonNull;

use super::{high_watermark, Reclaimer, ThreadTable};
use crate::config::{Config, ThreadId};
use crate::pool::Pool;
use crate::recovery::RecoveryManager;
use crate::stats::ThreadStatus;

/// Neutralization based reclamation.
///
/// Once a thread's bag grows past its high watermark, it neutralizes
/// every other thread and frees everything not published for a write
/// phase. There is no low-watermark path.
pub struct Nbr<T> {
    table: ThreadTable<T>,
}

impl<T> Reclaimer<T> for Nbr<T> {
    const NAME: &'static str = "nbr";
    const NEEDS_SET_JMP: bool = true;

    fn new(config: &Config) -> Self {
        Self {
            table: ThreadTable::new(config),
        }
    }

    fn init_thread(&self, tid: ThreadId) {
        self.table
            .init_thread(tid, high_watermark(self.table.config()));
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
        if local.bag.len() > local.high_watermark {
            self.table.reclaim_hi(tid, local, recovery, pool);
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
