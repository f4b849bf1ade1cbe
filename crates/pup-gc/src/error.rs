//! Error types and the fatal-abort path.

use std::fmt;
use std::io;

/// Recoverable errors reported by the heap's public operations.
///
/// Invariant violations inside the collector are not represented here: they
/// abort the process through [`fatal!`](crate::error::fatal).
#[derive(Debug, thiserror::Error)]
pub enum GcError {
    /// The operating system refused to map a heap region.
    #[error("failed to map a {size}-byte heap region")]
    RegionMap {
        /// Requested mapping size.
        size: usize,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Installing the safepoint signal handler failed.
    #[error("failed to install the handler for signal {signal}")]
    SignalInstall {
        /// Signal number.
        signal: i32,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The calling thread is already attached to a heap.
    #[error("thread is already attached to a heap")]
    AlreadyAttached,

    /// The calling thread is not attached to any heap.
    #[error("thread is not attached to a heap")]
    NotAttached,

    /// `collect()` was called by a mutator of the same heap, which would wait
    /// on its own safepoint forever.
    #[error("collect() called from a mutator attached to the same heap")]
    CollectFromMutator,

    /// The configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// The background collector thread could not be spawned.
    #[error("failed to spawn the collector thread")]
    CollectorSpawn(#[source] io::Error),
}

/// Logs `args` and aborts the process.
///
/// The message goes to `tracing` and to stderr, so it survives a missing
/// subscriber.
#[cold]
#[inline(never)]
pub(crate) fn abort_with(args: fmt::Arguments<'_>) -> ! {
    let message = args.to_string();
    ::tracing::error!(target: "pup_gc::fatal", "{message}");
    eprintln!("pup-gc fatal: {message}");
    std::process::abort()
}

/// Aborts on an unrecoverable invariant violation.
///
/// Never unwinds: a panic could cross the signal handler or leave a sweep half
/// done.
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::error::abort_with(format_args!($($arg)*))
    };
}

pub(crate) use fatal;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_region_map_error_keeps_source() {
        let err = GcError::RegionMap {
            size: 1 << 20,
            source: io::Error::from(io::ErrorKind::OutOfMemory),
        };
        assert_eq!(err.to_string(), "failed to map a 1048576-byte heap region");
        assert!(err.source().is_some());
    }

    #[test]
    fn test_invalid_config_message() {
        let err = GcError::InvalidConfig("zero collect interval");
        assert_eq!(
            err.to_string(),
            "invalid configuration: zero collect interval"
        );
    }
}
