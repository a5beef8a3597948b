//! Error type for jail construction and entry.

use std::io;

use rustix::io::Errno;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A builder invariant was violated (chdir without chroot, uid 0, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Lookup or file I/O failed (user/group resolution, metadata file).
    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// A marshalled configuration segment is shorter than declared.
    #[error("truncated configuration stream")]
    TruncatedInput,

    /// A marshalled string has no NUL terminator inside the buffer.
    #[error("configuration string missing terminator")]
    NoTerminator,

    /// A filter program exceeds the kernel's instruction-count limit, or a
    /// marshalled configuration exceeds the framing sanity bound.
    #[error("payload too large")]
    TooLarge,

    /// The caller lacks the privilege an isolation mechanism needs.
    #[error("permission denied: {0}")]
    PermissionDenied(&'static str),

    /// The kernel refused a syscall during privilege transformation.
    /// Inside the jailed child this is always fatal.
    #[error("kernel refused {op}: {errno}")]
    Kernel { op: &'static str, errno: Errno },

    /// The target program cannot be executed.
    #[error("target not executable: {0}")]
    NotExecutable(String),

    /// A path cannot be mapped between jail and host views.
    #[error("path not representable: {0}")]
    NotRepresentable(String),
}

impl Error {
    pub(crate) fn kernel(op: &'static str, errno: Errno) -> Self {
        Error::Kernel { op, errno }
    }

    /// Wraps a syscall failure, promoting EPERM to the typed privilege error.
    pub(crate) fn syscall(op: &'static str, errno: Errno) -> Self {
        if errno == Errno::PERM {
            Error::PermissionDenied(op)
        } else {
            Error::Kernel { op, errno }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
