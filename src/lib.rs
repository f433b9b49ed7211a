//! A record manager for lock-free data structures with pluggable
//! safe memory reclamation.
//!
//! A [`RecordManager`] composes a [`Pool`] (and the [`Allocator`] behind it)
//! with one [`Reclaimer`] variant:
//!
//! * [`Nbr`]: neutralization based reclamation. A thread whose retired bag
//!   is out of patience signals every other thread, restarting those that
//!   are still in their search phase, and frees everything that is not
//!   published for a write phase.
//! * [`NbrPlus`]: NBR with the low-watermark optimization. Past half of
//!   its capacity a thread piggybacks on signal rounds issued by others
//!   instead of sending its own.
//! * [`NbrOrig`]: the first NBR+ formulation, with block-granular
//!   thresholds and bookmarks.
//! * [`NoReclaim`]: never frees (or drains everything in bottleneck mode).
//!
//! Every data structure operation follows the same protocol:
//! `start_op` -> `save_for_write_phase`* -> `upgrade_to_write_phase` ->
//! `retire`* -> `end_op`. The search phase must be preceded by a checkpoint
//! (see [`checkpoint!`] or [`RecordManager::read_phase`]) so that a
//! neutralization signal can restart it.
#![feature(cfg_sanitize)]
mod block_bag;
mod config;
mod error;
mod hazard;
mod pool;
mod reclaimer;
mod record_manager;
pub mod recovery;
mod stats;

pub use block_bag::{BagIter, BagPosition, BlockBag, BLOCK_SIZE};
pub use config::{Config, ThreadId};
pub use error::{Error, Result};
pub use hazard::HazardSlots;
pub use pool::{Allocator, AllocatorNew, Pool, PoolNone};
pub use reclaimer::{Nbr, NbrOrig, NbrPlus, NoReclaim, Reclaimer};
pub use record_manager::{Cursor, Phase, Protector, RecordManager};
pub use recovery::{HandlerKind, RecoveryManager};
pub use stats::{count_garbages, ThreadStatus};

pub use nix::sys::signal;
pub use setjmp;

/// Make a checkpoint with `sigsetjmp` for restarting a search phase.
///
/// It must be expanded in the frame that runs the search phase, right
/// before `start_op`, because `siglongjmp` can only jump up the call stack
/// to functions that are still executing.
///
/// For reclaimers that do not need a checkpoint this expands to nothing.
///
/// # Usage
///
/// ``` ignore
/// loop {
///     nbr_recordmgr::checkpoint!(manager, tid);
///     manager.start_op(tid);
///     /* search phase: reads only */
///     manager.save_for_write_phase(tid, node);
///     manager.upgrade_to_write_phase(tid);
///     /* write phase */
///     manager.end_op(tid);
/// }
/// ```
#[macro_export]
macro_rules! checkpoint {
    ($manager:expr, $tid:expr) => {{
        std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
        if ($manager).needs_checkpoint() {
            let buf = ($manager).jmp_buf($tid);
            if unsafe { $crate::setjmp::sigsetjmp(buf, 0) } == 1 {
                // Landed here from the neutralization handler.
                ($manager).unblock_neutralize_signal();
            }
        }
        std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
    }};
}
