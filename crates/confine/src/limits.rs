//! Resource limits for the jailed target.
//!
//! Applied in the exec'd process image: inline in the static-target child,
//! or by the preload shim for dynamic targets. The CPU limit is enforced
//! twice: `RLIMIT_CPU` with second granularity as the kernel backstop, and
//! an interval timer at millisecond granularity as the finer-grained stop.

use confine_sys::last_errno;

use crate::error::{Error, Result};
use crate::jail::Jail;

pub(crate) fn apply(jail: &Jail) -> Result<()> {
    if jail.flags.memory_limit {
        set_rlimit(libc::RLIMIT_AS, jail.memory_limit, jail.memory_limit)?;
    }

    if jail.flags.output_limit {
        set_rlimit(libc::RLIMIT_FSIZE, jail.output_limit, jail.output_limit)?;
        // A truncated core dump would count against the output limit.
        set_rlimit(libc::RLIMIT_CORE, 0, 0)?;
    }

    if jail.flags.stack_limit {
        set_rlimit(libc::RLIMIT_STACK, jail.stack_limit, jail.stack_limit)?;
    }

    if jail.flags.time_limit {
        let soft = cpu_seconds(jail.time_limit_ms);
        set_rlimit(libc::RLIMIT_CPU, soft, soft + 1)?;

        // SAFETY: setitimer with a zero it_interval arms a one-shot timer,
        // equivalent to ualarm(usecs, 0) which is unavailable in this libc.
        let usecs = jail.time_limit_ms.saturating_mul(1000).min(u64::from(u32::MAX)) as i64;
        let timer = libc::itimerval {
            it_interval: libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
            it_value: libc::timeval {
                tv_sec: usecs / 1_000_000,
                tv_usec: usecs % 1_000_000,
            },
        };
        unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) };
    }

    Ok(())
}

/// RLIMIT_CPU only counts whole seconds; round the millisecond budget up.
fn cpu_seconds(ms: u64) -> u64 {
    (999 + ms) / 1000
}

#[inline]
fn set_rlimit(resource: libc::__rlimit_resource_t, cur: u64, max: u64) -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: cur,
        rlim_max: max,
    };
    // SAFETY: rlim is valid, resource is a valid constant.
    if unsafe { libc::setrlimit(resource, &rlim) } != 0 {
        return Err(Error::syscall("setrlimit", last_errno()));
    }
    Ok(())
}
