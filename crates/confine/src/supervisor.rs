//! PID-namespace init.
//!
//! The first process of a new PID namespace is the reaper for everything
//! inside it. `run` forks once after the namespace clone; the outer process
//! lands here, reaps descendants until none remain, enforces the wall-clock
//! timeout, and writes the execution metadata before exiting with the root
//! child's status.
//!
//! The signal handlers can only touch process-wide state, so the root PID,
//! its last wait status, and the timeout override live in three atomics.
//! They are stored before `alarm(2)` is armed and the handlers do nothing
//! but load, store and `kill`.

use std::io::Write as _;
use std::sync::atomic::{AtomicI32, Ordering};

use log::{info, warn};

use crate::jail::Jail;
use crate::ERR_INIT;

static ROOT_PID: AtomicI32 = AtomicI32::new(0);
static ROOT_STATUS: AtomicI32 = AtomicI32::new(0);
static OVERRIDE_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_alarm(_sig: libc::c_int) {
    // The CPU rlimit should have fired first; reaching this means the
    // child ignored SIGXCPU or burned wall time without CPU time. Report
    // it as a CPU-limit kill either way.
    OVERRIDE_SIGNAL.store(libc::SIGXCPU, Ordering::SeqCst);
    // SAFETY: kill(2) is async-signal-safe; negative PID targets the
    // root child's whole process group.
    unsafe {
        libc::kill(-ROOT_PID.load(Ordering::SeqCst), libc::SIGKILL);
    }
}

extern "C" fn on_term(_sig: libc::c_int) {
    // Asked to shut down: exit with whatever the root child reported so
    // far so the caller's wait sees the right status.
    // SAFETY: _exit(2) is async-signal-safe.
    unsafe {
        libc::_exit(ROOT_STATUS.load(Ordering::SeqCst));
    }
}

fn install_handler(sig: libc::c_int, handler: extern "C" fn(libc::c_int)) {
    // SAFETY: valid handler; SA_RESTART so wait3 resumes after SIGALRM has
    // done its group kill.
    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = handler as usize;
        act.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut act.sa_mask);
        libc::sigaction(sig, &act, std::ptr::null_mut());
    }
}

fn now_realtime() -> libc::timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: valid out-pointer.
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
    }
    ts
}

/// Wall time between two samples, in microseconds, with nanosecond borrow.
fn elapsed_usec(t0: &libc::timespec, t1: &libc::timespec) -> i64 {
    let mut sec = t1.tv_sec - t0.tv_sec;
    let nsec = if t1.tv_nsec < t0.tv_nsec {
        sec -= 1;
        1_000_000_000 + t1.tv_nsec - t0.tv_nsec
    } else {
        t1.tv_nsec - t0.tv_nsec
    };
    (1_000_000_000 * sec + nsec) / 1_000
}

/// Reap until the namespace is empty, then report and exit.
///
/// `rootpid` is the inner fork's child, the process that goes on to exec
/// the target. Statuses of other descendants are discarded; only the root
/// child's outcome is reported.
pub(crate) fn run_init(jail: &mut Jail, rootpid: libc::pid_t) -> ! {
    let t0 = jail.flags.meta_file.then(now_realtime);

    ROOT_STATUS.store(0, Ordering::SeqCst);
    OVERRIDE_SIGNAL.store(0, Ordering::SeqCst);

    if jail.flags.time_limit {
        // Backup for the CPU rlimit: one second beyond its ceiling.
        ROOT_PID.store(rootpid, Ordering::SeqCst);
        install_handler(libc::SIGALRM, on_alarm);
        // SAFETY: plain alarm.
        unsafe {
            libc::alarm(((jail.time_limit_ms + 1999) / 1000) as libc::c_uint);
        }
    }

    install_handler(libc::SIGTERM, on_term);

    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let mut root_usage: libc::rusage = unsafe { std::mem::zeroed() };
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: valid out-pointers. The loop only ends when there are no
        // processes left inside our namespace.
        let pid = unsafe { libc::wait4(-1, &mut status, 0, &mut usage) };
        if pid <= 0 {
            break;
        }
        if pid == rootpid {
            ROOT_STATUS.store(status, Ordering::SeqCst);
            root_usage = usage;
        }
    }

    let root_status = ROOT_STATUS.load(Ordering::SeqCst);
    let override_signal = OVERRIDE_SIGNAL.load(Ordering::SeqCst);

    let mut exit_signal = 0;
    let exit_status;
    if override_signal != 0 {
        exit_signal = override_signal;
        exit_status = ERR_INIT;
    } else if !libc::WIFEXITED(root_status) {
        exit_signal = -1;
        if libc::WIFSIGNALED(root_status) {
            exit_signal = libc::WTERMSIG(root_status);
        }
        exit_status = ERR_INIT;
    } else {
        exit_status = libc::WEXITSTATUS(root_status);
    }

    if let Some(mut meta) = jail.meta_file.take() {
        let t1 = now_realtime();
        let wall_usec = elapsed_usec(&t0.unwrap_or(t1), &t1);
        let user_usec =
            1_000_000 * root_usage.ru_utime.tv_sec as i64 + root_usage.ru_utime.tv_usec as i64;
        let _ = write!(
            meta,
            "time:{}\ntime-wall:{}\nmem:{}\n",
            user_usec,
            wall_usec,
            root_usage.ru_maxrss * 1024
        );
        let _ = if exit_signal != 0 {
            write!(meta, "signal:{}\n", exit_signal)
        } else {
            write!(meta, "status:{}\n", exit_status)
        };
        // Dropped here: the handle is owned by this init and closed on exit.
    }

    if exit_signal == libc::SIGSYS {
        warn!("illegal syscall");
    } else {
        info!("normal exit");
    }

    // SAFETY: sole exit point of the surrogate init.
    unsafe { libc::_exit(exit_status) }
}
