use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{compiler_fence, Ordering};

use setjmp::sigjmp_buf;

use crate::config::{Config, ThreadId};
use crate::error::Result;
use crate::pool::{Pool, PoolNone};
use crate::reclaimer::{NbrPlus, Reclaimer};
use crate::recovery::RecoveryManager;
use crate::stats::ThreadStatus;

/// The facade data structures use: one pool, one reclaimer and the
/// recovery manager the reclaimer signals through.
///
/// Every operation of a data structure goes like this:
///
/// ``` ignore
/// loop {
///     checkpoint!(manager, tid);
///     manager.start_op(tid);
///     // search phase: reads only
///     manager.save_for_write_phase(tid, node);
///     manager.upgrade_to_write_phase(tid);
///     // write phase
///     unsafe { manager.retire(tid, unlinked) };
///     manager.end_op(tid);
/// }
/// ```
pub struct RecordManager<T, R = NbrPlus<T>, P = PoolNone>
where
    R: Reclaimer<T>,
    P: Pool<T>,
{
    config: Config,
    recovery: RecoveryManager,
    reclaimer: R,
    pool: P,
    _marker: PhantomData<T>,
}

impl<T, R, P> RecordManager<T, R, P>
where
    R: Reclaimer<T>,
    P: Pool<T> + Default,
{
    pub fn new(config: Config) -> Result<Self> {
        Self::with_pool(config, P::default())
    }
}

impl<T, R, P> RecordManager<T, R, P>
where
    R: Reclaimer<T>,
    P: Pool<T>,
{
    /// Validate `config`, install the signal handler the reclaimer needs,
    /// and allocate all per-thread state.
    pub fn with_pool(config: Config, pool: P) -> Result<Self> {
        config.validate()?;
        let recovery = RecoveryManager::new(&config, R::handler_kind())?;
        let reclaimer = R::new(&config);
        Ok(Self {
            config,
            recovery,
            reclaimer,
            pool,
            _marker: PhantomData,
        })
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn pool(&self) -> &P {
        &self.pool
    }

    #[inline]
    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    /// Register the calling OS thread under `tid`.
    ///
    /// Every thread must be registered before any thread can start a
    /// neutralization round.
    pub fn init_thread(&self, tid: ThreadId) {
        self.config.check_tid(tid);
        self.recovery.init_thread(tid);
        self.reclaimer.init_thread(tid);
    }

    /// Hand every record retired by `tid` to the pool and unregister the
    /// calling thread.
    ///
    /// # Safety
    ///
    /// No other thread may still be in an operation that could access a
    /// record retired by `tid`.
    pub unsafe fn deinit_thread(&self, tid: ThreadId) {
        self.config.check_tid(tid);
        self.reclaimer.deinit_thread(tid, &self.pool);
        self.recovery.deinit_thread(tid);
    }

    /// Enter the search phase. For reclaimers that need one, a checkpoint
    /// must have been made right before (see [`checkpoint!`](crate::checkpoint)).
    ///
    /// Returns whether records were rotated into the pool.
    #[inline]
    pub fn start_op(&self, tid: ThreadId) -> bool {
        self.reclaimer.start_op(tid, &self.recovery, &self.pool)
    }

    /// Publish `record` so that it survives until the end of the write
    /// phase. Null pointers are ignored.
    #[inline]
    pub fn save_for_write_phase(&self, tid: ThreadId, record: *mut T) {
        self.reclaimer.save_for_write_phase(tid, record);
    }

    #[inline]
    pub fn upgrade_to_write_phase(&self, tid: ThreadId) {
        self.reclaimer.upgrade_to_write_phase(tid, &self.recovery);
    }

    #[inline]
    pub fn end_op(&self, tid: ThreadId) {
        self.reclaimer.end_op(tid, &self.recovery);
    }

    /// Retire a record.
    /// It may trigger other threads to restart.
    ///
    /// # Safety
    /// * The given record is no longer modified.
    /// * It is no longer possible to reach the record from
    ///   the data structure.
    /// * The same record is not retired more than once.
    /// * `tid` is not in its search phase.
    pub unsafe fn retire(&self, tid: ThreadId, record: *mut T) {
        let record = match NonNull::new(record) {
            Some(record) => record,
            None => panic!("{tid} retired a null record"),
        };
        self.reclaimer.retire(tid, record, &self.recovery, &self.pool);
    }

    /// Allocate a record holding `value`.
    pub fn allocate(&self, tid: ThreadId, value: T) -> *mut T {
        let ptr = self.pool.get(tid).as_ptr();
        unsafe { ptr.write(value) };
        ptr
    }

    /// Give back a record that was never published.
    ///
    /// # Safety
    ///
    /// `record` must come from `allocate` and be unreachable by any other
    /// thread.
    pub unsafe fn deallocate(&self, tid: ThreadId, record: *mut T) {
        if let Some(record) = NonNull::new(record) {
            self.pool.add(tid, record);
        }
    }

    #[inline]
    pub fn is_protected(&self, tid: ThreadId, record: *mut T) -> bool {
        self.reclaimer.is_protected(tid, record)
    }

    #[inline]
    pub fn is_quiescent(&self, tid: ThreadId) -> bool {
        self.reclaimer.is_quiescent(tid)
    }

    #[inline]
    pub fn should_help(&self) -> bool {
        self.reclaimer.should_help()
    }

    #[inline]
    pub fn needs_set_jmp() -> bool {
        R::NEEDS_SET_JMP
    }

    #[inline]
    pub fn supports_crash_recovery() -> bool {
        R::SUPPORTS_CRASH_RECOVERY
    }

    #[inline]
    pub fn quiescence_is_per_record_type() -> bool {
        R::QUIESCENCE_IS_PER_RECORD_TYPE
    }

    /// Same as `needs_set_jmp`, callable on an instance from macros.
    #[inline(always)]
    pub fn needs_checkpoint(&self) -> bool {
        R::NEEDS_SET_JMP
    }

    #[inline(always)]
    pub fn jmp_buf(&self, tid: ThreadId) -> *mut sigjmp_buf {
        self.recovery.jmp_buf(tid)
    }

    #[inline]
    pub fn unblock_neutralize_signal(&self) {
        self.recovery.unblock_neutralize_signal();
    }

    pub fn status(&self, tid: ThreadId) -> ThreadStatus {
        let mut status = self.reclaimer.status(tid);
        status.signalled = self.recovery.signals_received(tid);
        status.restarts = self.recovery.restarts(tid);
        status
    }

    pub fn statuses(&self) -> Vec<ThreadStatus> {
        (0..self.config.num_threads)
            .map(|i| self.status(ThreadId::new(i)))
            .collect()
    }

    pub fn debug_print_status(&self, tid: ThreadId) {
        eprintln!("{}", self.status(tid));
    }

    /// Start a search phase. `f` is the body of this phase, and it must
    /// return a protectable `Cursor` to safely dereference on the out of
    /// this phase. `f` may run more than once, as a neutralization signal
    /// sends the thread back to the start of this function.
    ///
    /// In a search phase, programmers must be aware of the following
    /// restrictions.
    ///
    /// 1. Reading global variables is permitted and reading shared
    ///    records is permitted if pointers to them were obtained
    ///    during this phase.
    ///   - e.g., by traversing a sequence of shared objects by
    ///     following pointers starting from a global variable, i.e., a root
    ///
    /// 2. Writes/CASs to shared records, writes/CASs to shared globals,
    ///    and system calls, are **not permitted.**
    ///
    /// To understand the latter restriction, suppose an operation
    /// allocates a node during its search phase, and before it uses the
    /// node, the thread performing the operation is neutralized. This
    /// would cause **a memory leak.** Values owned by `f` are leaked the
    /// same way, since a restart skips their destructors.
    ///
    /// On return, the thread is in its write phase with every pointer of
    /// the cursor published. Finish it with `end_op`.
    #[inline(never)]
    pub fn read_phase<F, C>(&self, tid: ThreadId, f: F) -> C
    where
        F: Fn(&Phase<'_>) -> C,
        C: Cursor<T>,
    {
        // # HACK: "Why a dummy loop with `black_box` is used?"
        //
        // When address-sanitizing, the sanitizer often gives a false
        // positive by recognizing `longjmp` as stack buffer overflow.
        // Wrapped by a loop block, it recognizes `longjmp` as a normal
        // `continue` and is satisfied with it.
        loop {
            // `sigsetjmp` must be called first: if it is done later than
            // `start_op`, the restartable flag would never be cleared by the
            // handler and `start_op` would find it set.
            compiler_fence(Ordering::SeqCst);
            if R::NEEDS_SET_JMP {
                let buf = self.recovery.jmp_buf(tid);
                if unsafe { setjmp::sigsetjmp(buf, 0) } == 1 {
                    self.recovery.unblock_neutralize_signal();
                }
            }
            compiler_fence(Ordering::SeqCst);

            self.start_op(tid);
            let phase = Phase {
                recovery: &self.recovery,
                tid,
                checkpointed: R::NEEDS_SET_JMP,
            };
            let cursor = f(&phase);

            let save = |record: *mut T| self.save_for_write_phase(tid, record);
            cursor.protect_with(&mut Protector { save: &save });
            self.upgrade_to_write_phase(tid);

            if std::hint::black_box(true) {
                return cursor;
            }
        }
    }
}

/// Hands every record still in a bag to the pool.
///
/// Threads other than the dropping one must have called `deinit_thread`
/// first: their signal handlers would otherwise find a freed slot.
impl<T, R, P> Drop for RecordManager<T, R, P>
where
    R: Reclaimer<T>,
    P: Pool<T>,
{
    fn drop(&mut self) {
        unsafe { self.reclaimer.release_all(&self.pool) };
    }
}

/// A protectable `Cursor` trait which contains acquired pointers
/// while traversing through a data structure.
///
/// Thanks to the neutralization-based search phase, we don't have to
/// protect the pointer every time we load it. However, it is crucial to
/// protect all pointers to dereference right before exiting the phase.
pub trait Cursor<T> {
    /// Protect raw pointers in this cursor to dereference them
    /// after the phase.
    fn protect_with(&self, protector: &mut Protector<'_, T>);
}

impl<T> Cursor<T> for () {
    fn protect_with(&self, _: &mut Protector<'_, T>) {}
}

/// Provides a `protect` function so that programmers
/// can protect pointers from their cursor after the search phase.
pub struct Protector<'a, T> {
    save: &'a dyn Fn(*mut T),
}

impl<'a, T> Protector<'a, T> {
    /// Prevent other threads from reclaiming the record
    /// during the upcoming write phase.
    #[inline]
    pub fn protect(&mut self, ptr: *mut T) {
        (self.save)(ptr);
    }
}

/// A search phase controller.
pub struct Phase<'a> {
    recovery: &'a RecoveryManager,
    tid: ThreadId,
    checkpointed: bool,
}

impl<'a> Phase<'a> {
    #[inline]
    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    /// How many times this thread was sent back to a checkpoint so far.
    pub fn restarts(&self) -> usize {
        self.recovery.restarts(self.tid)
    }

    /// Restart this search phase by performing `siglongjmp`.
    ///
    /// # Panics
    ///
    /// Panics if the reclaimer does not make checkpoints.
    pub fn restart(&self) -> ! {
        assert!(self.checkpointed, "this search phase has no checkpoint");
        unsafe { self.recovery.restart(self.tid) }
    }
}
