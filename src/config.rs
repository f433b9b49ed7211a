use std::fmt;

use nix::sys::signal::Signal;

use crate::error::{Error, Result};

cfg_if::cfg_if! {
    // When sanitizing, reclaim more aggressively.
    if #[cfg(sanitize = "address")] {
        pub(crate) const DEFAULT_BAG_CAPACITY_POW2: usize = 256;
    } else {
        pub(crate) const DEFAULT_BAG_CAPACITY_POW2: usize = 32768;
    }
}

/// 4 covers the delete of an (a,b)-tree with a violating node;
/// lists need 2 and external BSTs need 3.
pub(crate) const DEFAULT_MAX_HAZPTRS: usize = 4;

pub(crate) const DEFAULT_LO_WATERMARK_CADENCE: usize = 1024;

/// The high watermark (in records) of a thread running alone.
pub(crate) const SINGLE_THREAD_CAPACITY: usize = 32;

/// 0-indexed logical thread identifier.
///
/// Note that this is not the same with `pthread_t`. Every per-thread array
/// of the record manager is indexed by it, and an id must be used by
/// exactly one OS thread between its `init_thread` and `deinit_thread`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(usize);

impl ThreadId {
    #[inline]
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl From<usize> for ThreadId {
    fn from(id: usize) -> Self {
        Self(id)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid {}", self.0)
    }
}

/// Construction-time parameters of a `RecordManager`.
///
/// All per-thread arrays are sized by `num_threads` once and never resized.
#[derive(Debug, Clone)]
pub struct Config {
    /// The number of worker threads.
    pub num_threads: usize,
    /// Maximum number of records a thread may publish for its write phase.
    pub max_hazptrs: usize,
    /// Maximum retired bag capacity in records. Must be a power of two.
    pub bag_capacity_pow2: usize,
    /// Number of retires between two low-watermark reclamation attempts.
    /// `NbrPlus` uses it only when thresholds are not randomized.
    pub lo_watermark_cadence: usize,
    /// The signal used to neutralize other threads.
    pub neutralize_signal: Signal,
    /// Desynchronize the thresholds (and low-watermark cadences) of threads
    /// with random fractions.
    pub randomize_thresholds: bool,
    /// Make `NoReclaim` drain its whole bag to the pool once it holds
    /// `bag_capacity_pow2` records.
    pub allocator_bottleneck_test: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_threads: 1,
            max_hazptrs: DEFAULT_MAX_HAZPTRS,
            bag_capacity_pow2: DEFAULT_BAG_CAPACITY_POW2,
            lo_watermark_cadence: DEFAULT_LO_WATERMARK_CADENCE,
            neutralize_signal: Signal::SIGUSR1,
            randomize_thresholds: true,
            allocator_bottleneck_test: false,
        }
    }
}

impl Config {
    pub fn new(num_threads: usize) -> Self {
        Self {
            num_threads,
            ..Default::default()
        }
    }

    pub fn with_max_hazptrs(mut self, max_hazptrs: usize) -> Self {
        self.max_hazptrs = max_hazptrs;
        self
    }

    pub fn with_bag_capacity(mut self, bag_capacity_pow2: usize) -> Self {
        self.bag_capacity_pow2 = bag_capacity_pow2;
        self
    }

    pub fn with_lo_watermark_cadence(mut self, cadence: usize) -> Self {
        self.lo_watermark_cadence = cadence;
        self
    }

    /// Use another signal than SIGUSR1 for neutralization.
    pub fn with_neutralize_signal(mut self, signal: Signal) -> Self {
        self.neutralize_signal = signal;
        self
    }

    pub fn with_randomized_thresholds(mut self, randomize: bool) -> Self {
        self.randomize_thresholds = randomize;
        self
    }

    pub fn with_allocator_bottleneck_test(mut self, enabled: bool) -> Self {
        self.allocator_bottleneck_test = enabled;
        self
    }

    /// Check every parameter. An invalid configuration is a misuse of the
    /// record manager, never a runtime condition.
    pub fn validate(&self) -> Result<()> {
        if self.num_threads == 0 {
            return Err(Error::ZeroThreads);
        }
        if self.max_hazptrs == 0 {
            return Err(Error::ZeroHazardCapacity);
        }
        if self.bag_capacity_pow2 == 0 {
            return Err(Error::ZeroBagCapacity);
        }
        if !self.bag_capacity_pow2.is_power_of_two() {
            return Err(Error::BagCapacityNotPowerOfTwo(self.bag_capacity_pow2));
        }
        if self.lo_watermark_cadence == 0 {
            return Err(Error::ZeroLoWatermarkCadence);
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn check_tid(&self, tid: ThreadId) {
        assert!(
            tid.index() < self.num_threads,
            "{tid} exceeds the maximum number of threads ({})",
            self.num_threads
        );
    }
}
