//! Raw process primitives: `clone(CLONE_NEWPID)` and the SIGSYS handler.

use rustix::io::Errno;

use crate::last_errno;

/// Forks into a new PID namespace via the raw clone syscall.
///
/// This deliberately bypasses libc's `fork()` wrapper. `fork()` runs
/// pthread-atfork handlers and takes every libc lock it can before cloning;
/// the child of a PID-namespace clone becomes that namespace's init and may
/// never get those locks back if another thread held them. The price is
/// that the child must restrict itself to syscalls and pre-allocated
/// buffers until `execve` (no allocator, no `setenv`, nothing that takes a
/// libc lock).
///
/// Returns the child PID in the parent and 0 in the child, like `fork`.
pub fn clone_newpid() -> Result<libc::pid_t, Errno> {
    // SAFETY: clone without CLONE_VM and with a null child stack behaves
    // like fork: the child gets a copy-on-write duplicate of our address
    // space and continues from here on its own copy of the stack.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_clone,
            libc::CLONE_NEWPID as libc::c_ulong | libc::SIGCHLD as libc::c_ulong,
            std::ptr::null_mut::<libc::c_void>(),
        )
    };
    if ret < 0 {
        return Err(last_errno());
    }
    Ok(ret as libc::pid_t)
}

// Written with write(2) from the signal handler; must be a plain byte string.
static SIGSYS_MSG: &[u8] = b"confine: syscall blocked by seccomp filter\n";

extern "C" fn sigsys_handler(sig: libc::c_int) {
    // SAFETY: write(2) and the re-raise path below are async-signal-safe.
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            SIGSYS_MSG.as_ptr().cast::<libc::c_void>(),
            SIGSYS_MSG.len(),
        );
        // Restore the default action and re-deliver so the process still
        // dies of SIGSYS and wait(2) classification is unchanged.
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

/// Installs a `SIGSYS` handler that reports the blocked syscall on stderr,
/// then re-raises so the process still terminates with `SIGSYS`.
///
/// Used when the caller asked for filter-failure logging together with a
/// trap-returning BPF policy.
pub fn install_sigsys_handler() -> Result<(), Errno> {
    // SAFETY: sigaction with a valid handler and an empty mask.
    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = sigsys_handler as usize;
        libc::sigemptyset(&mut act.sa_mask);
        if libc::sigaction(libc::SIGSYS, &act, std::ptr::null_mut()) != 0 {
            return Err(last_errno());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigsys_handler_installs() {
        install_sigsys_handler().expect("sigaction");

        // Restore the default disposition so later tests are unaffected.
        unsafe {
            libc::signal(libc::SIGSYS, libc::SIG_DFL);
        }
    }
}
