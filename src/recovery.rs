//! Signal-based recovery of search phases.
//!
//! Every registered thread owns a [`Slot`] holding its `pthread_t`, its
//! checkpoint (`sigjmp_buf`), its in-operation bit and its restartable
//! flag. The process-wide handler finds the slot of the interrupted thread
//! through a thread-local pointer, so several record managers may live in
//! one process as long as each thread is registered with one of them at a
//! time. A manager must outlive the registrations of other threads.
use atomic::Atomic;
use crossbeam_utils::CachePadded;
use nix::libc::{c_void, siginfo_t};
use nix::sys::pthread::{pthread_kill, pthread_self, Pthread};
use nix::sys::signal::{
    pthread_sigmask, sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};
use setjmp::{sigjmp_buf, siglongjmp};
use static_assertions::const_assert;
use std::cell::{Cell, UnsafeCell};
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{compiler_fence, fence, AtomicBool, AtomicU8, AtomicUsize, Ordering};

use crate::config::{Config, ThreadId};
use crate::error::{fatal, Error, Result};

const_assert!(Atomic::<Pthread>::is_lock_free());

const UNREGISTERED: u8 = 0;
const ACTIVE: u8 = 1;
const DEPARTED: u8 = 2;

thread_local! {
    static CURRENT: Cell<*const Slot> = const { Cell::new(ptr::null()) };
}

/// Which handler runs on the neutralize signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Restart the search phase if the thread is restartable; otherwise the
    /// signal is ignored.
    Neutralize,
    /// Restart any thread inside an operation, in its search phase or in
    /// its write phase. Used by reclaimers that recover crashed-looking
    /// threads rather than neutralizing readers.
    CrashRecovery,
}

struct Slot {
    state: AtomicU8,
    owner: Atomic<Pthread>,
    kind: Option<HandlerKind>,
    in_op: AtomicBool,
    restartable: AtomicBool,
    jmp_buf: UnsafeCell<MaybeUninit<sigjmp_buf>>,
    signalled: AtomicUsize,
    restarts: AtomicUsize,
}

// `jmp_buf` is written by `sigsetjmp` of the owner thread only, and read by
// the signal handler running on that same thread.
unsafe impl Sync for Slot {}

impl Slot {
    fn new(kind: Option<HandlerKind>) -> Self {
        Self {
            state: AtomicU8::new(UNREGISTERED),
            owner: Atomic::new(0),
            kind,
            in_op: AtomicBool::new(false),
            restartable: AtomicBool::new(false),
            jmp_buf: UnsafeCell::new(MaybeUninit::zeroed()),
            signalled: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn jmp_buf(&self) -> *mut sigjmp_buf {
        self.jmp_buf.get().cast()
    }
}

/// Per-thread recovery state of a record manager: the `tid -> pthread_t`
/// table, checkpoints, restartable flags and signal delivery.
pub struct RecoveryManager {
    signal: Signal,
    handler: Option<HandlerKind>,
    slots: Box<[CachePadded<Slot>]>,
}

impl RecoveryManager {
    /// Create the per-thread table and, if `handler` is given, install the
    /// process-wide handler for the configured signal.
    ///
    /// Note that we don't have to call `sigaction` for every child thread.
    pub fn new(config: &Config, handler: Option<HandlerKind>) -> Result<Self> {
        if handler.is_some() {
            install(config.neutralize_signal)?;
        }
        let slots = (0..config.num_threads)
            .map(|_| CachePadded::new(Slot::new(handler)))
            .collect();
        Ok(Self {
            signal: config.neutralize_signal,
            handler,
            slots,
        })
    }

    #[inline]
    pub fn neutralize_signal(&self) -> Signal {
        self.signal
    }

    #[inline]
    pub fn handler(&self) -> Option<HandlerKind> {
        self.handler
    }

    #[inline]
    fn slot(&self, tid: ThreadId) -> &Slot {
        &self.slots[tid.index()]
    }

    /// Register the calling OS thread under `tid`.
    pub fn init_thread(&self, tid: ThreadId) {
        let slot = self.slot(tid);
        slot.in_op.store(false, Ordering::Relaxed);
        slot.restartable.store(false, Ordering::Relaxed);
        slot.owner.store(pthread_self(), Ordering::Relaxed);
        slot.state.store(ACTIVE, Ordering::Release);
        CURRENT.with(|current| current.set(slot as *const Slot));
    }

    /// Unregister the calling thread. Later rounds skip its slot.
    pub fn deinit_thread(&self, tid: ThreadId) {
        let slot = self.slot(tid);
        debug_assert_eq!(
            slot.owner.load(Ordering::Relaxed),
            pthread_self(),
            "{tid} is deinitialized by a thread other than its owner"
        );
        slot.in_op.store(false, Ordering::Relaxed);
        slot.restartable.store(false, Ordering::Relaxed);
        CURRENT.with(|current| {
            if current.get() == slot as *const Slot {
                current.set(ptr::null());
            }
        });
        slot.state.store(DEPARTED, Ordering::Release);
    }

    #[inline]
    pub fn is_registered(&self, tid: ThreadId) -> bool {
        self.slot(tid).state.load(Ordering::Acquire) == ACTIVE
    }

    /// The `pthread_t` registered under `tid`, if it was ever registered.
    pub fn pthread(&self, tid: ThreadId) -> Option<Pthread> {
        let slot = self.slot(tid);
        match slot.state.load(Ordering::Acquire) {
            UNREGISTERED => None,
            _ => Some(slot.owner.load(Ordering::Relaxed)),
        }
    }

    /// Send the neutralize signal to every registered thread except `tid`.
    ///
    /// Threads which already deinitialized are skipped. Returns the number
    /// of signals sent.
    pub fn neutralize_all_except(&self, tid: ThreadId) -> Result<usize> {
        let mut sent = 0;
        for (i, slot) in self.slots.iter().enumerate() {
            if i == tid.index() {
                continue;
            }
            let other = ThreadId::new(i);
            match slot.state.load(Ordering::Acquire) {
                ACTIVE => {}
                DEPARTED => continue,
                _ => return Err(Error::NotRegistered(other)),
            }
            let pthread = slot.owner.load(Ordering::Relaxed);
            if let Err(errno) = pthread_kill(pthread, self.signal) {
                return Err(Error::SignalDelivery {
                    tid: other,
                    signal: self.signal,
                    errno,
                });
            }
            sent += 1;
        }
        Ok(sent)
    }

    /// Re-enable the neutralize signal after landing on a checkpoint.
    ///
    /// The handler runs with every signal blocked, and the checkpoint does
    /// not save the signal mask, so the jump leaves the signal blocked.
    pub fn unblock_neutralize_signal(&self) {
        fence(Ordering::SeqCst);
        let mut set = SigSet::empty();
        set.add(self.signal);
        if let Err(errno) = pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&set), None) {
            fatal(Error::UnblockSignal {
                signal: self.signal,
                errno,
            });
        }
    }

    #[inline]
    pub fn jmp_buf(&self, tid: ThreadId) -> *mut sigjmp_buf {
        self.slot(tid).jmp_buf()
    }

    /// Mark `tid` as inside an operation.
    #[inline]
    pub fn enter_op(&self, tid: ThreadId) {
        self.slot(tid).in_op.store(true, Ordering::SeqCst);
    }

    /// Mark `tid` as quiescent.
    #[inline]
    pub fn leave_op(&self, tid: ThreadId) {
        self.slot(tid).in_op.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_in_op(&self, tid: ThreadId) -> bool {
        self.slot(tid).in_op.load(Ordering::Acquire)
    }

    /// Mark `tid` as restartable. Returns the previous value.
    #[inline]
    pub fn set_restartable(&self, tid: ThreadId) -> bool {
        let prev = self.slot(tid).restartable.swap(true, Ordering::SeqCst);
        compiler_fence(Ordering::SeqCst);
        prev
    }

    /// Mark `tid` as non-restartable. Returns the previous value.
    #[inline]
    pub fn clear_restartable(&self, tid: ThreadId) -> bool {
        compiler_fence(Ordering::SeqCst);
        self.slot(tid).restartable.swap(false, Ordering::SeqCst)
    }

    #[inline]
    pub fn is_restartable(&self, tid: ThreadId) -> bool {
        self.slot(tid).restartable.load(Ordering::Acquire)
    }

    /// Returns to the checkpoint of `tid` manually.
    ///
    /// # Safety
    ///
    /// Must be called on the thread registered under `tid`, inside a search
    /// phase whose checkpoint frame is still executing.
    pub unsafe fn restart(&self, tid: ThreadId) -> ! {
        let slot = self.slot(tid);
        slot.restartable.store(false, Ordering::SeqCst);
        slot.in_op.store(false, Ordering::SeqCst);
        slot.restarts.fetch_add(1, Ordering::Relaxed);
        compiler_fence(Ordering::SeqCst);
        siglongjmp(slot.jmp_buf(), 1);
        // `siglongjmp` never returns; setjmp 0.1.0 declares it without `-> !`.
        unreachable!()
    }

    /// The number of neutralize signals `tid` has received.
    pub fn signals_received(&self, tid: ThreadId) -> usize {
        self.slot(tid).signalled.load(Ordering::Relaxed)
    }

    /// The number of times `tid` was sent back to its checkpoint.
    pub fn restarts(&self, tid: ThreadId) -> usize {
        self.slot(tid).restarts.load(Ordering::Relaxed)
    }
}

impl Drop for RecoveryManager {
    fn drop(&mut self) {
        let me = pthread_self();
        for slot in self.slots.iter() {
            if slot.state.load(Ordering::Acquire) != ACTIVE {
                continue;
            }
            let slot: &Slot = slot;
            // Forget the slot on this thread; the handler then ignores signals.
            let _ = CURRENT.try_with(|current| {
                if current.get() == slot as *const Slot {
                    current.set(ptr::null());
                }
            });
            debug_assert!(
                std::thread::panicking() || slot.owner.load(Ordering::Relaxed) == me,
                "a recovery manager is dropped while another thread is registered"
            );
        }
    }
}

fn install(signal: Signal) -> Result<()> {
    let sig_action = SigAction::new(
        SigHandler::SigAction(handle_signal),
        // Restart any interrupted sys calls instead of silently failing
        SaFlags::SA_RESTART | SaFlags::SA_SIGINFO,
        // Block signals during handler
        SigSet::all(),
    );
    unsafe { sigaction(signal, &sig_action) }
        .map(|_| ())
        .map_err(|errno| Error::InstallSignal { signal, errno })
}

extern "C" fn handle_signal(_: i32, _: *mut siginfo_t, _: *mut c_void) {
    let slot = match CURRENT.try_with(|current| current.get()) {
        Ok(slot) if !slot.is_null() => unsafe { &*slot },
        _ => return,
    };
    slot.signalled.fetch_add(1, Ordering::Relaxed);

    match slot.kind {
        Some(HandlerKind::Neutralize) => {
            if !slot.restartable.load(Ordering::Relaxed) {
                return;
            }
            slot.restartable.store(false, Ordering::Relaxed);
        }
        Some(HandlerKind::CrashRecovery) => {
            fence(Ordering::SeqCst);
            // Abandon the whole operation, write phase included.
            if !slot.in_op.swap(false, Ordering::SeqCst) {
                return;
            }
            slot.restartable.store(false, Ordering::SeqCst);
        }
        None => return,
    }
    slot.restarts.fetch_add(1, Ordering::Relaxed);
    compiler_fence(Ordering::SeqCst);

    unsafe { siglongjmp(slot.jmp_buf(), 1) };
}
