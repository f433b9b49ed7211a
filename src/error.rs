use std::fmt;

use nix::errno::Errno;
use nix::sys::signal::Signal;

use crate::config::ThreadId;

/// Misuses of the record manager.
///
/// None of them is recoverable at runtime: a violated invariant can lead to
/// a use-after-free, so the runtime ones end the process through [`fatal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    ZeroThreads,
    ZeroHazardCapacity,
    ZeroBagCapacity,
    BagCapacityNotPowerOfTwo(usize),
    ZeroLoWatermarkCadence,
    /// `sigaction` failed for the neutralize signal.
    InstallSignal { signal: Signal, errno: Errno },
    /// `pthread_sigmask` failed to unblock the neutralize signal.
    UnblockSignal { signal: Signal, errno: Errno },
    /// A neutralization round reached a thread slot that was never registered.
    NotRegistered(ThreadId),
    /// `pthread_kill` failed for a registered thread.
    SignalDelivery {
        tid: ThreadId,
        signal: Signal,
        errno: Errno,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

fn errno_name(errno: Errno) -> &'static str {
    match errno {
        Errno::ESRCH => "ESRCH (no such thread)",
        Errno::EINVAL => "EINVAL (invalid signal)",
        other => other.desc(),
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ZeroThreads => write!(f, "the number of threads must be positive"),
            Error::ZeroHazardCapacity => {
                write!(f, "the per-thread hazard pointer capacity must be positive")
            }
            Error::ZeroBagCapacity => write!(f, "give a valid value for the retired bag capacity"),
            Error::BagCapacityNotPowerOfTwo(cap) => {
                write!(f, "retired bag capacity {cap} is not a power of two")
            }
            Error::ZeroLoWatermarkCadence => {
                write!(f, "the low-watermark retry cadence must be positive")
            }
            Error::InstallSignal { signal, errno } => write!(
                f,
                "could not register signal handler for {signal}: {}",
                errno_name(*errno)
            ),
            Error::UnblockSignal { signal, errno } => write!(
                f,
                "could not unblock {signal}: {}",
                errno_name(*errno)
            ),
            Error::NotRegistered(tid) => {
                write!(f, "{tid} was never registered; cannot neutralize it")
            }
            Error::SignalDelivery { tid, signal, errno } => write!(
                f,
                "error when trying to pthread_kill({tid}, {signal}): {}",
                errno_name(*errno)
            ),
        }
    }
}

impl std::error::Error for Error {}

/// Report a broken invariant and abort.
///
/// Continuing after a partially delivered neutralization round is unsafe,
/// so there is no unwinding here.
#[cold]
pub(crate) fn fatal(err: Error) -> ! {
    eprintln!("nbr-recordmgr: fatal: {err}");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_errors_name_the_errno() {
        let err = Error::SignalDelivery {
            tid: ThreadId::new(3),
            signal: Signal::SIGUSR1,
            errno: Errno::ESRCH,
        };
        let msg = err.to_string();
        assert!(msg.contains("tid 3"));
        assert!(msg.contains("ESRCH"));

        let err = Error::SignalDelivery {
            tid: ThreadId::new(0),
            signal: Signal::SIGUSR1,
            errno: Errno::EINVAL,
        };
        assert!(err.to_string().contains("EINVAL"));
    }
}
