//! Error handling for the SBMA runtime
//!
//! Every fallible operation returns [`Result`]. The taxonomy distinguishes
//! recoverable outcomes (admission denied, I/O failure, lock failure, bad
//! input) from unrecoverable ones, which escalate through [`fatal`] because
//! the process state can no longer be reverted.

use core::fmt;

use nix::errno::Errno;

/// Crate-wide result alias.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors surfaced by the SBMA runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The admission protocol could not satisfy the request: the charge
    /// exceeds what the node budget can ever provide.
    OutOfMemory,
    /// A system call on a mapping, backing file, or the shared region failed.
    Io(Errno),
    /// A lock could not be acquired or released for a reason other than a
    /// diagnostic timeout.
    Lock(Errno),
    /// Invalid options, an address outside every live allocation, or an
    /// out-of-range request.
    Invalid,
    /// The subsystem has not been initialized (or was initialized with the
    /// OS virtual-memory manager left in charge).
    Uninitialized,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory => write!(f, "node memory budget exhausted"),
            Error::Io(errno) => write!(f, "I/O error: {}", errno),
            Error::Lock(errno) => write!(f, "lock error: {}", errno),
            Error::Invalid => write!(f, "invalid argument"),
            Error::Uninitialized => write!(f, "sbma is not initialized"),
        }
    }
}

impl std::error::Error for Error {}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::Io(errno)
    }
}

impl Error {
    /// The current `errno` as an I/O error.
    pub fn last_os() -> Self {
        Error::Io(Errno::last())
    }
}

/// Print a diagnostic and abort the process.
///
/// Used when an unrecoverable inconsistency is detected: a failure in the
/// commit phase of `realloc`, or a cleanup step whose failure would leave
/// the process partially evicted. The runtime state cannot be reverted, so
/// continuing would violate the accounting invariants for every process on
/// the node.
pub fn fatal(what: &str, err: Error) -> ! {
    eprintln!(
        "[{:5}] sbma: unrecoverable error in {} ({}); the runtime state \
         cannot be reverted, aborting",
        std::process::id(),
        what,
        err
    );
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        assert_eq!(
            Error::OutOfMemory.to_string(),
            "node memory budget exhausted"
        );
        assert!(Error::Io(Errno::ENOENT).to_string().contains("ENOENT"));
        assert_eq!(Error::Invalid.to_string(), "invalid argument");
    }

    #[test]
    fn errno_conversion() {
        let err: Error = Errno::EAGAIN.into();
        assert_eq!(err, Error::Io(Errno::EAGAIN));
    }
}
