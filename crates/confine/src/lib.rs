//! confine: a composable Linux process jail.
//!
//! Launches an untrusted child program under a caller-selected set of
//! isolation mechanisms:
//!
//! - **UID/GID drop** - run as an unprivileged identity, supplementary
//!   groups cleared or inherited from /etc/group
//! - **Capabilities** - shape effective/permitted/inheritable/bounding sets
//!   to a mask, securebits locked
//! - **Namespaces** - mount, PID and network namespaces
//! - **Chroot + bind mounts** - minimal filesystem view, read-only by
//!   default, optional tmpfs /tmp and read-only /proc
//! - **Seccomp** - strict mode or a compiled BPF filter, with optional
//!   `SIGSYS` reporting
//! - **Rlimits** - CPU time, address space, file size, stack
//! - **Metadata** - wall/CPU time, peak RSS and exit status collected by
//!   the PID-namespace init
//!
//! The hard part is ordering: capabilities that, once dropped, forbid later
//! steps; filters that, once installed, cut off the syscalls needed to drop
//! privileges. See [`Jail`] for the builder and the `run` entry points; the
//! pipeline itself is documented in the driver module.
//!
//! ## Quick start
//!
//! ```ignore
//! use confine::Jail;
//!
//! let mut jail = Jail::new();
//! jail.change_user("nobody")?;
//! jail.namespace_pids();
//! jail.namespace_net();
//! jail.no_new_privs();
//!
//! jail.run("/bin/true", &["/bin/true"])?;
//! assert_eq!(jail.wait()?, 0);
//! ```
//!
//! ## Requirements
//!
//! - Linux; most mechanisms need the caller to hold root or the matching
//!   capability (`CAP_SYS_ADMIN`, `CAP_SYS_CHROOT`, `CAP_SETUID`, ...)
//! - Single-threaded callers only when a PID namespace is requested (the
//!   raw clone bypasses libc's atfork locking)

pub mod error;
pub mod jail;

mod creds;
mod driver;
mod limits;
mod marshal;
mod mounts;
mod resolve;
mod seccomp;
mod supervisor;

pub use confine_sys::seccomp::{SockFilter, SockFprog};
pub use driver::{Spawned, FD_ENV, PRELOAD_PATH};
pub use error::{Error, Result};
pub use jail::{BindMount, Flags, Jail};

/// Exit status reported by [`Jail::wait`] when the target was killed by
/// `SIGSYS`, i.e. a syscall the seccomp filter forbids.
pub const ERR_JAIL: i32 = 253;

/// Exit status for failures in the jail scaffolding itself (setup, or the
/// PID-namespace init observing an abnormal end).
pub const ERR_INIT: i32 = 254;
