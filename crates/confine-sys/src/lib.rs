//! Low-level Linux syscall wrappers for process jailing.
//!
//! This crate provides thin wrappers around the Linux-specific security
//! syscalls the jail needs but that are not available in rustix or libc.
//! For standard syscalls, use rustix or libc directly.
//!
//! ## Modules
//!
//! - **seccomp** - Seccomp strict mode and BPF filter mode (via prctl)
//! - **caps** - POSIX capability sets, bounding set, securebits, keep-caps
//! - **proc** - Raw `clone(CLONE_NEWPID)` and the `SIGSYS` logging handler
//!
//! ## Seccomp
//!
//! The kernel offers two seccomp modes. Strict mode permits only `read`,
//! `write`, `exit` and `sigreturn` and is installed with
//! `prctl(PR_SET_SECCOMP, 1)`. Filter mode runs a caller-supplied BPF
//! program against every syscall and is installed with
//! `prctl(PR_SET_SECCOMP, 2, prog)`. Both are one-way: once installed a
//! filter cannot be removed.
//!
//! Unlike the `seccomp(2)` syscall, the prctl forms do **not** set
//! `no_new_privs` implicitly. The jail relies on that: whether
//! `no_new_privs` is set before or after the credential drop changes which
//! syscalls a filter policy must admit, so the two operations are exposed
//! separately here.
//!
//! # Safety
//!
//! This crate contains raw syscall wrappers. Casts between integer types
//! are unavoidable when interfacing with the kernel ABI.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod caps;
pub mod proc;
pub mod seccomp;

#[inline]
pub fn last_errno() -> rustix::io::Errno {
    // SAFETY: __errno_location always returns valid thread-local pointer.
    rustix::io::Errno::from_raw_os_error(unsafe { *libc::__errno_location() })
}
