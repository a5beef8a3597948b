//! The seccomp stage of the entry pipeline.
//!
//! Order inside the stage is fixed: `no_new_privs` first (when requested),
//! then the `SIGSYS` reporter when filter failures are being logged, then
//! the BPF filter itself. Strict mode is separate; the driver installs it
//! as the very last pipeline step because it forbids nearly every syscall
//! that would come after it.

use confine_sys::proc::install_sigsys_handler;
use confine_sys::seccomp::{self, SockFprog};
use log::warn;

use crate::error::{Error, Result};
use crate::jail::Jail;

pub(crate) fn apply_filter_stage(jail: &Jail) -> Result<()> {
    if jail.flags.no_new_privs {
        seccomp::set_no_new_privs()
            .map_err(|e| Error::kernel("prctl(PR_SET_NO_NEW_PRIVS)", e))?;
    }

    if jail.flags.seccomp_filter && jail.flags.log_seccomp_filter {
        install_sigsys_handler().map_err(|e| Error::kernel("sigaction(SIGSYS)", e))?;
        warn!("logging seccomp filter failures");
    }

    if jail.flags.seccomp_filter {
        let Some(filter) = jail.filter.as_deref() else {
            return Err(Error::InvalidArgument(
                "seccomp filter requested but no program loaded",
            ));
        };
        let fprog = SockFprog::from_instructions(filter);
        // SAFETY: the program came from the policy compiler and outlives
        // the call; installation is the irreversible step we are here for.
        unsafe { seccomp::install_filter(&fprog) }
            .map_err(|e| Error::syscall("prctl(PR_SET_SECCOMP, filter)", e))?;
    }

    Ok(())
}

/// Strict mode. Nothing but read/write/exit/sigreturn works afterwards.
pub(crate) fn enter_strict() -> Result<()> {
    // SAFETY: the driver sequences this as the final pipeline step.
    unsafe { seccomp::enter_strict() }
        .map_err(|e| Error::syscall("prctl(PR_SET_SECCOMP, strict)", e))
}
