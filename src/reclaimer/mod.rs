//! Reclamation algorithms behind one interface.
//!
//! The NBR family shares the per-thread table below: a retired bag and a
//! scratch set owned by each thread, plus the published hazard pointers
//! and announcement timestamp that every thread may read.
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use rand::Rng;
use rustc_hash::FxHashSet;

use crate::block_bag::{BagPosition, BlockBag};
use crate::config::{Config, ThreadId, SINGLE_THREAD_CAPACITY};
use crate::error::fatal;
use crate::hazard::HazardSlots;
use crate::pool::Pool;
use crate::recovery::{HandlerKind, RecoveryManager};
use crate::stats::{self, ThreadCounters, ThreadStatus, GARBAGE_FLUSH_INTERVAL};

mod nbr;
mod nbr_orig;
mod nbrplus;
mod none;

pub use nbr::Nbr;
pub use nbr_orig::NbrOrig;
pub use nbrplus::NbrPlus;
pub use none::NoReclaim;

/// A safe memory reclamation algorithm for records of type `T`.
///
/// Every data structure operation drives it with the same protocol:
/// `start_op` -> `save_for_write_phase`* -> `upgrade_to_write_phase` ->
/// `retire`* -> `end_op`. Variants differ in what `retire` does.
pub trait Reclaimer<T>: Sized + Send + Sync {
    /// Short name used in status reports.
    const NAME: &'static str;
    /// Whether search phases must be preceded by a `sigsetjmp` checkpoint.
    const NEEDS_SET_JMP: bool;
    const SUPPORTS_CRASH_RECOVERY: bool = false;
    const QUIESCENCE_IS_PER_RECORD_TYPE: bool = true;

    fn new(config: &Config) -> Self;

    /// The signal handler this reclaimer relies on, if any.
    fn handler_kind() -> Option<HandlerKind> {
        if Self::SUPPORTS_CRASH_RECOVERY {
            Some(HandlerKind::CrashRecovery)
        } else if Self::NEEDS_SET_JMP {
            Some(HandlerKind::Neutralize)
        } else {
            None
        }
    }

    fn init_thread(&self, tid: ThreadId);

    /// Hand every record retired by `tid` to `pool` and drop its state.
    ///
    /// # Safety
    ///
    /// Must be called by the owner of `tid`, and no other thread may still
    /// hold a reference to a record retired by `tid`.
    unsafe fn deinit_thread<P: Pool<T>>(&self, tid: ThreadId, pool: &P);

    /// Enter the search phase. Returns whether records were rotated into
    /// the pool as a side effect.
    fn start_op<P: Pool<T>>(&self, tid: ThreadId, recovery: &RecoveryManager, pool: &P) -> bool;

    /// Publish `record` for the upcoming write phase. Null is ignored.
    fn save_for_write_phase(&self, tid: ThreadId, record: *mut T);

    /// Leave the search phase. From now on `tid` is never neutralized.
    fn upgrade_to_write_phase(&self, tid: ThreadId, recovery: &RecoveryManager);

    /// Leave the operation. Calling it again is a no-op.
    fn end_op(&self, tid: ThreadId, recovery: &RecoveryManager);

    /// # Safety
    ///
    /// `record` must be unlinked from the data structure, retired once, and
    /// `tid` must not be in its search phase.
    unsafe fn retire<P: Pool<T>>(
        &self,
        tid: ThreadId,
        record: NonNull<T>,
        recovery: &RecoveryManager,
        pool: &P,
    );

    /// Whether `record` is currently safe from reclamation for `tid`.
    fn is_protected(&self, tid: ThreadId, record: *mut T) -> bool;

    /// Whether `tid` is outside of any operation.
    fn is_quiescent(&self, tid: ThreadId) -> bool;

    /// Whether operations should help each other.
    fn should_help(&self) -> bool {
        true
    }

    fn status(&self, tid: ThreadId) -> ThreadStatus;

    /// Hand the records of threads that never deinitialized to `pool`.
    ///
    /// # Safety
    ///
    /// No thread may still access any retired record.
    unsafe fn release_all<P: Pool<T>>(&mut self, pool: &P);
}

/// The high watermark (in records) of a thread.
///
/// Thresholds are spread over 1/8 (5%), 1/4 (15%), 1/2 (75%) and all (5%)
/// of the bag capacity, so that threads do not start signal rounds in lockstep.
pub(crate) fn high_watermark(config: &Config) -> usize {
    let capacity = config.bag_capacity_pow2;
    if config.num_threads == 1 {
        return SINGLE_THREAD_CAPACITY.min(capacity);
    }
    if !config.randomize_thresholds {
        return capacity;
    }
    let threshold = match rand::thread_rng().gen_range(0..100) {
        0..=4 => capacity / 8,
        5..=19 => capacity / 4,
        20..=94 => capacity / 2,
        _ => capacity,
    };
    threshold.max(1)
}

/// Values the owner publishes for other threads.
struct Shared<T> {
    hazptrs: HazardSlots<T>,
    // Incremented before signalling and after sweeping.
    announced_ts: AtomicUsize,
    in_op: AtomicBool,
    high_watermark: AtomicUsize,
    counters: ThreadCounters,
}

/// Bookkeeping of the low-watermark path.
pub(crate) struct LoWatermark<T> {
    /// Records at or below this position may be reclaimed once a peer
    /// completes a signal round.
    pub bookmark: Option<BagPosition<T>>,
    /// Announcement timestamps of every thread when `bookmark` was taken.
    pub saved_ts: Vec<usize>,
    pub retires_since: usize,
    pub cadence: usize,
}

impl<T> LoWatermark<T> {
    #[inline]
    pub fn is_first_entry(&self) -> bool {
        self.bookmark.is_none()
    }

    pub fn reset(&mut self) {
        self.bookmark = None;
        self.retires_since = 0;
    }
}

/// State only the owner thread touches.
pub(crate) struct Local<T> {
    pub bag: BlockBag<T>,
    pub high_watermark: usize,
    pub lo: LoWatermark<T>,
    // Union of all published hazard pointers during a sweep.
    scanned: FxHashSet<*mut T>,
    // Records to put back after a sweep.
    spare: Vec<NonNull<T>>,
    unflushed_garbage: usize,
}

impl<T> Local<T> {
    fn flush_garbage(&mut self) {
        if self.unflushed_garbage > 0 {
            stats::incr_garb(self.unflushed_garbage);
            self.unflushed_garbage = 0;
        }
    }
}

struct ThreadData<T> {
    shared: Shared<T>,
    local: UnsafeCell<Option<Local<T>>>,
}

// `local` is accessed only by the thread registered under its index.
unsafe impl<T> Sync for ThreadData<T> {}
unsafe impl<T> Send for ThreadData<T> {}

/// Per-thread state of all threads, allocated once and never resized.
pub(crate) struct ThreadTable<T> {
    config: Config,
    threads: Box<[CachePadded<ThreadData<T>>]>,
}

#[inline]
fn round_up_to_even(ts: usize) -> usize {
    ts + ts % 2
}

impl<T> ThreadTable<T> {
    pub fn new(config: &Config) -> Self {
        let threads = (0..config.num_threads)
            .map(|_| {
                CachePadded::new(ThreadData {
                    shared: Shared {
                        hazptrs: HazardSlots::new(config.max_hazptrs),
                        announced_ts: AtomicUsize::new(0),
                        in_op: AtomicBool::new(false),
                        high_watermark: AtomicUsize::new(0),
                        counters: ThreadCounters::default(),
                    },
                    local: UnsafeCell::new(None),
                })
            })
            .collect();
        Self {
            config: config.clone(),
            threads,
        }
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    fn shared(&self, tid: ThreadId) -> &Shared<T> {
        &self.threads[tid.index()].shared
    }

    /// # Safety
    ///
    /// Only the owner of `tid` may call it, and the returned reference must
    /// not outlive the current reclaimer call.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn local(&self, tid: ThreadId) -> &mut Local<T> {
        match &mut *self.threads[tid.index()].local.get() {
            Some(local) => local,
            None => panic!("{tid} is used before init_thread"),
        }
    }

    pub fn init_thread(&self, tid: ThreadId, high_watermark: usize) {
        self.config.check_tid(tid);
        let num_threads = self.config.num_threads;
        let local = Local {
            bag: BlockBag::new(),
            high_watermark,
            lo: LoWatermark {
                bookmark: None,
                saved_ts: vec![0; num_threads],
                retires_since: 0,
                cadence: self.config.lo_watermark_cadence,
            },
            scanned: FxHashSet::with_capacity_and_hasher(
                num_threads * self.config.max_hazptrs,
                Default::default(),
            ),
            spare: Vec::new(),
            unflushed_garbage: 0,
        };
        let shared = self.shared(tid);
        shared.hazptrs.clear();
        shared.in_op.store(false, Ordering::Relaxed);
        shared.high_watermark.store(high_watermark, Ordering::Relaxed);
        unsafe { *self.threads[tid.index()].local.get() = Some(local) };
    }

    /// # Safety
    ///
    /// See [`Reclaimer::deinit_thread`].
    pub unsafe fn deinit_thread<P: Pool<T>>(&self, tid: ThreadId, pool: &P) {
        let shared = self.shared(tid);
        shared.hazptrs.clear();
        shared.in_op.store(false, Ordering::Relaxed);
        if let Some(mut local) = (*self.threads[tid.index()].local.get()).take() {
            Self::flush_bag(tid, shared, &mut local, pool);
        }
    }

    /// See [`Reclaimer::release_all`].
    pub unsafe fn release_all<P: Pool<T>>(&mut self, pool: &P) {
        for (i, thread) in self.threads.iter_mut().enumerate() {
            if let Some(mut local) = thread.local.get_mut().take() {
                Self::flush_bag(ThreadId::new(i), &thread.shared, &mut local, pool);
            }
        }
    }

    /// Hand the whole bag of `tid` to `pool`, protected or not.
    ///
    /// # Safety
    ///
    /// Only the owner of `tid` may call it, and no thread may still access
    /// any record in the bag.
    pub unsafe fn drain<P: Pool<T>>(&self, tid: ThreadId, pool: &P) -> usize {
        let local = self.local(tid);
        let count = local.bag.len();
        Self::flush_bag(tid, self.shared(tid), local, pool);
        count
    }

    unsafe fn flush_bag<P: Pool<T>>(tid: ThreadId, shared: &Shared<T>, local: &mut Local<T>, pool: &P) {
        let count = local.bag.len();
        pool.add_move_all(tid, &mut local.bag);
        Self::on_reclaim(shared, local, count);
    }

    fn on_reclaim(shared: &Shared<T>, local: &mut Local<T>, count: usize) {
        if count == 0 {
            return;
        }
        shared.counters.on_reclaim(count);
        local.flush_garbage();
        stats::decr_garb(count);
    }

    pub fn start_op(&self, tid: ThreadId, recovery: &RecoveryManager) {
        let shared = self.shared(tid);
        shared.hazptrs.clear();
        shared.in_op.store(true, Ordering::Relaxed);
        recovery.enter_op(tid);
        let was_restartable = recovery.set_restartable(tid);
        debug_assert!(
            !was_restartable,
            "{tid} entered start_op while restartable; check the usage rules"
        );
    }

    #[inline]
    pub fn save_for_write_phase(&self, tid: ThreadId, record: *mut T) {
        self.shared(tid).hazptrs.push(record);
    }

    pub fn upgrade_to_write_phase(&self, tid: ThreadId, recovery: &RecoveryManager) {
        // Publications must be visible before we become non-restartable.
        fence(Ordering::SeqCst);
        let was_restartable = recovery.clear_restartable(tid);
        debug_assert!(
            was_restartable,
            "{tid} upgraded to its write phase without start_op"
        );
    }

    pub fn end_op(&self, tid: ThreadId, recovery: &RecoveryManager) {
        recovery.clear_restartable(tid);
        recovery.leave_op(tid);
        let shared = self.shared(tid);
        shared.hazptrs.clear();
        shared.in_op.store(false, Ordering::Relaxed);
    }

    /// Append `record` to the bag of `tid`.
    pub fn push_retired(&self, tid: ThreadId, local: &mut Local<T>, record: NonNull<T>) {
        local.bag.add(record);
        self.shared(tid).counters.on_retire();
        local.unflushed_garbage += 1;
        if local.unflushed_garbage == GARBAGE_FLUSH_INTERVAL {
            local.flush_garbage();
        }
    }

    /// Neutralize every other thread and reclaim every unprotected record.
    ///
    /// # Safety
    ///
    /// `local` must belong to `tid`, and `tid` must not be restartable.
    pub unsafe fn reclaim_hi<P: Pool<T>>(
        &self,
        tid: ThreadId,
        local: &mut Local<T>,
        recovery: &RecoveryManager,
        pool: &P,
    ) -> usize {
        let shared = self.shared(tid);
        // Tell other threads that I am starting signalling.
        shared.announced_ts.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = recovery.neutralize_all_except(tid) {
            fatal(err);
        }
        shared.counters.on_signal_round();

        self.collect_protected(local);
        let reclaimed = self.sweep(tid, local, pool, None);

        // Tell other threads that the round is over.
        shared.announced_ts.fetch_add(1, Ordering::SeqCst);
        shared.counters.on_hi_reclaim();
        reclaimed
    }

    /// Remember the current bag position and every announcement timestamp.
    ///
    /// The snapshot is rounded up to even, so a round which is in progress
    /// now does not count as completed later.
    pub fn enter_lo_watermark(&self, local: &mut Local<T>, bookmark: BagPosition<T>) {
        local.lo.bookmark = Some(bookmark);
        for (saved, thread) in local.lo.saved_ts.iter_mut().zip(self.threads.iter()) {
            *saved = round_up_to_even(thread.shared.announced_ts.load(Ordering::Acquire));
        }
    }

    /// Whether some other thread completed a whole signal round since the
    /// low-watermark snapshot.
    pub fn any_peer_completed_round(&self, tid: ThreadId, local: &Local<T>) -> bool {
        self.threads
            .iter()
            .zip(local.lo.saved_ts.iter())
            .enumerate()
            .any(|(i, (thread, &saved))| {
                i != tid.index() && thread.shared.announced_ts.load(Ordering::Acquire) >= saved + 2
            })
    }

    /// Reclaim the unprotected records older than the bookmark, if a peer
    /// completed a round since it was taken. Returns the number reclaimed.
    ///
    /// # Safety
    ///
    /// Same as `reclaim_hi`.
    pub unsafe fn try_reclaim_lo<P: Pool<T>>(
        &self,
        tid: ThreadId,
        local: &mut Local<T>,
        pool: &P,
    ) -> Option<usize> {
        let bookmark = local.lo.bookmark?;
        if !self.any_peer_completed_round(tid, local) {
            return None;
        }
        self.collect_protected(local);
        let reclaimed = self.sweep(tid, local, pool, Some(bookmark));
        self.shared(tid).counters.on_lo_reclaim();
        Some(reclaimed)
    }

    /// Gather every published hazard pointer, the caller's own included.
    fn collect_protected(&self, local: &mut Local<T>) {
        local.scanned.clear();
        fence(Ordering::SeqCst);
        for thread in self.threads.iter() {
            local.scanned.extend(thread.shared.hazptrs.iter());
        }
    }

    /// Move unprotected records to the pool; protected ones and ones newer
    /// than `bookmark` go back to the bag.
    unsafe fn sweep<P: Pool<T>>(
        &self,
        tid: ThreadId,
        local: &mut Local<T>,
        pool: &P,
        bookmark: Option<BagPosition<T>>,
    ) -> usize {
        let Local {
            bag, scanned, spare, ..
        } = &mut *local;
        spare.clear();
        if let Some(bookmark) = bookmark {
            while bag.is_newer_than(bookmark) {
                spare.push(bag.remove());
            }
        }
        let newer = spare.len();

        let mut reclaimed = 0;
        while !bag.is_empty() {
            let record = bag.remove();
            if scanned.contains(&record.as_ptr()) {
                spare.push(record);
            } else {
                pool.add(tid, record);
                reclaimed += 1;
            }
        }

        for &record in spare[newer..].iter().rev() {
            bag.add(record);
        }
        for &record in spare[..newer].iter().rev() {
            bag.add(record);
        }
        spare.clear();

        Self::on_reclaim(self.shared(tid), local, reclaimed);
        reclaimed
    }

    pub fn is_published(&self, record: *mut T) -> bool {
        self.threads
            .iter()
            .any(|thread| thread.shared.hazptrs.contains(record))
    }

    pub fn is_quiescent(&self, tid: ThreadId) -> bool {
        !self.shared(tid).in_op.load(Ordering::Relaxed)
    }

    pub fn status(&self, tid: ThreadId, name: &'static str) -> ThreadStatus {
        let shared = self.shared(tid);
        let mut status = ThreadStatus::from_counters(tid, name, &shared.counters);
        status.high_watermark = shared.high_watermark.load(Ordering::Relaxed);
        status.published = shared.hazptrs.len();
        status.announced_ts = shared.announced_ts.load(Ordering::Relaxed);
        status
    }
}
