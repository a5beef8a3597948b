//! Process driver: the ordered privilege-dropping pipeline and the
//! fork/exec plumbing around it.
//!
//! ## Pipeline order
//!
//! Within one process the steps run strictly in this order:
//!
//! 1. `unshare(CLONE_NEWNS)`, then `unshare(CLONE_NEWNET)`
//! 2. bind mounts, `chroot`, `chdir`, tmpfs `/tmp`
//! 3. read-only `/proc` remount
//! 4. keep-caps + securebits (only when capabilities will be dropped)
//! 5. with `no_new_privs`: drop UID/GID, drop caps, install the filter.
//!    Without it: install the filter first, then drop UID/GID and caps,
//!    because the filter policy must admit the credential-change syscalls
//! 6. strict-mode seccomp, last of all, since it cuts off every other
//!    privilege-dropping syscall
//!
//! ## Who runs what
//!
//! For a dynamically linked target, `run` splits the work three ways: the
//! parent marshals the configuration into a pipe; the forked child sets up
//! the mount namespace and chroot and calls `execve`; the preload shim,
//! injected via the preload environment variable, unmarshals the
//! configuration from the pipe inside the new process image and repeats the
//! pipeline for everything `execve` does not preserve (credentials,
//! capabilities, seccomp, rlimits). With a PID namespace the child forks
//! once more and the outer process becomes the namespace's init
//! (see [`supervisor`](crate::supervisor)).
//!
//! ## Threads
//!
//! Not thread-safe with PID namespaces. The namespace requires the raw
//! clone syscall, which bypasses libc's atfork locking; a multithreaded
//! host can leave libc locks held forever in the child. Everything the
//! child needs (exec strings, mount paths, the last-cap probe) is prepared
//! in the parent before the clone, so the child path stays on raw syscalls
//! and preallocated buffers.

use std::ffi::{CStr, CString};
use std::io::{self, Write as _};
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStringExt;

use confine_sys::last_errno;
use log::{info, warn};
use nix::sched::{unshare, CloneFlags};

use crate::error::{Error, Result};
use crate::jail::Jail;
use crate::mounts::{self, MountPlan};
use crate::{creds, limits, seccomp, supervisor};
use crate::{ERR_INIT, ERR_JAIL};

/// Preload directive inherited by dynamically linked targets.
const PRELOAD_ENV: &str = "LD_PRELOAD";

/// The shim library injected into dynamic targets. It unmarshals the
/// configuration from the pipe named by [`FD_ENV`] and finishes the jail
/// inside the target.
pub const PRELOAD_PATH: &str = "/usr/lib/libconfine-preload.so";

/// Carries the config-pipe read end to the shim, as decimal text.
pub const FD_ENV: &str = "__CONFINE_FD";

/// A jailed child and the requested ends of its stdio pipes.
#[derive(Debug)]
pub struct Spawned {
    pub pid: libc::pid_t,
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

/// Everything the post-clone child needs, resolved in the parent.
pub(crate) struct EnterPlan {
    pub(crate) mounts: MountPlan,
    user: Option<CString>,
    last_cap: u32,
}

impl EnterPlan {
    pub(crate) fn new(jail: &Jail) -> Result<Self> {
        // Probe /proc here so drop_caps never has to read files.
        let last_cap = if jail.flags.caps {
            confine_sys::caps::last_cap()?
        } else {
            0
        };
        let user = jail
            .user
            .as_deref()
            .map(|u| CString::new(u).map_err(|_| Error::InvalidArgument("user name contains NUL")))
            .transpose()?;
        Ok(Self {
            mounts: MountPlan::new(jail)?,
            user,
            last_cap,
        })
    }
}

/// The ordered pipeline, minus strict mode (sequenced by the caller).
pub(crate) fn enter_pipeline(jail: &Jail, plan: &EnterPlan) -> Result<()> {
    if jail.flags.vfs {
        unshare(CloneFlags::CLONE_NEWNS).map_err(|e| nix_err("unshare(mount)", e))?;
    }
    if jail.flags.net {
        unshare(CloneFlags::CLONE_NEWNET).map_err(|e| nix_err("unshare(net)", e))?;
    }

    if jail.flags.chroot {
        plan.mounts.enter_chroot()?;
        if jail.flags.mount_tmp {
            mounts::mount_tmp()?;
        }
    }

    if jail.flags.readonly_proc {
        plan.mounts.remount_proc_readonly(jail.flags.chroot)?;
    }

    if jail.flags.ptrace {
        // SAFETY: plain prctl.
        if unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0, 0, 0, 0) } != 0 {
            return Err(Error::syscall("prctl(PR_SET_DUMPABLE)", last_errno()));
        }
    }

    if jail.flags.caps {
        // setuid would clear the permitted set before drop_caps can shape
        // it. Hang on to root caps across the UID change, then the
        // securebits locks keep them from ever coming back.
        creds::arm_keepcaps()?;
    }

    if jail.flags.no_new_privs {
        creds::drop_ugid(jail, plan.user.as_deref())?;
        if jail.flags.caps {
            creds::drop_caps(jail, plan.last_cap)?;
        }
        seccomp::apply_filter_stage(jail)?;
    } else {
        // Filter before credentials: the policy must admit setgroups,
        // setresgid, setresuid, capget, capset and prctl in this mode.
        seccomp::apply_filter_stage(jail)?;
        creds::drop_ugid(jail, plan.user.as_deref())?;
        if jail.flags.caps {
            creds::drop_caps(jail, plan.last_cap)?;
        }
    }

    Ok(())
}

fn nix_err(op: &'static str, e: nix::errno::Errno) -> Error {
    Error::syscall(op, rustix::io::Errno::from_raw_os_error(e as i32))
}

/// Exec material prepared in the parent so the child never allocates.
struct ExecContext {
    path: CString,
    _argv: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    _envp: Vec<CString>,
    envp_ptrs: Vec<*const libc::c_char>,
}

impl ExecContext {
    /// Snapshot argv and the current environment. Must be called after the
    /// preload and pipe-fd variables are in place, since the target
    /// inherits this snapshot.
    fn new(program: &str, argv: &[&str]) -> Result<Self> {
        let path =
            CString::new(program).map_err(|_| Error::InvalidArgument("program path contains NUL"))?;
        let argv: Vec<CString> = argv
            .iter()
            .map(|a| CString::new(*a).map_err(|_| Error::InvalidArgument("argument contains NUL")))
            .collect::<Result<_>>()?;
        let envp: Vec<CString> = std::env::vars_os()
            .filter_map(|(k, v)| {
                let mut kv = k.into_vec();
                kv.push(b'=');
                kv.extend_from_slice(&v.into_vec());
                CString::new(kv).ok()
            })
            .collect();

        let argv_ptrs = Self::ptr_array(&argv);
        let envp_ptrs = Self::ptr_array(&envp);
        Ok(Self {
            path,
            _argv: argv,
            argv_ptrs,
            _envp: envp,
            envp_ptrs,
        })
    }

    fn ptr_array(strings: &[CString]) -> Vec<*const libc::c_char> {
        strings
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect()
    }

    /// Returns only on failure.
    fn exec(&self) -> Error {
        // SAFETY: pointer arrays are NULL-terminated and point into CStrings
        // owned by self.
        unsafe { libc::execve(self.path.as_ptr(), self.argv_ptrs.as_ptr(), self.envp_ptrs.as_ptr()) };
        Error::syscall("execve", last_errno())
    }
}

fn check_executable(program: &CStr) -> Result<()> {
    // SAFETY: valid NUL-terminated path.
    if unsafe { libc::access(program.as_ptr(), libc::X_OK) } != 0 {
        return Err(Error::NotExecutable(
            program.to_string_lossy().into_owned(),
        ));
    }
    Ok(())
}

fn create_pipe() -> Result<[libc::c_int; 2]> {
    let mut fds = [0; 2];
    // SAFETY: valid out-array.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(fds)
}

fn fork() -> Result<libc::pid_t> {
    // SAFETY: plain fork; both sides continue in this function's caller.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(pid)
}

/// Keep index `keep` of a pipe pair for ourselves, close the peer end.
fn keep_end(fds: [libc::c_int; 2], keep: usize) -> OwnedFd {
    // SAFETY: we created both fds and close exactly one of each once.
    unsafe {
        libc::close(fds[1 - keep]);
        OwnedFd::from_raw_fd(fds[keep])
    }
}

/// Child side: close the peer end and dup2 ours onto a stdio fd.
fn dupe_end(fds: [libc::c_int; 2], keep: usize, stdio: libc::c_int) -> Result<()> {
    // SAFETY: valid fds from pipe(2).
    unsafe {
        libc::close(fds[1 - keep]);
        if libc::dup2(fds[keep], stdio) < 0 {
            return Err(Error::syscall("dup2", last_errno()));
        }
    }
    Ok(())
}

fn close_pipe(fds: Option<[libc::c_int; 2]>) {
    if let Some(fds) = fds {
        // SAFETY: both ends are ours on this path.
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}

fn setup_preload(old: Option<&std::ffi::OsString>) {
    let mut val = old.cloned().unwrap_or_default();
    // Only insert a separating space if there is something to separate.
    if !val.is_empty() {
        val.push(" ");
    }
    val.push(PRELOAD_PATH);
    std::env::set_var(PRELOAD_ENV, val);
}

fn restore_preload(old: Option<std::ffi::OsString>) {
    match old {
        Some(v) => std::env::set_var(PRELOAD_ENV, v),
        None => std::env::remove_var(PRELOAD_ENV),
    }
}

impl Jail {
    /// Applies the jail to the current process without forking.
    ///
    /// This is the non-forking entry: it must not be combined with a PID
    /// namespace, which needs the surrogate init that only the `run`
    /// variants fork. Once any step has run, a failure leaves the process
    /// half-transformed; callers that continue anyway do so at their own
    /// risk.
    pub fn enter(&self) -> Result<()> {
        if self.flags.pids {
            return Err(Error::InvalidArgument(
                "cannot enter a pid-namespaced jail in place; use run()",
            ));
        }
        if self.flags.usergroups && self.user.is_none() {
            return Err(Error::InvalidArgument(
                "usergroup inheritance without username",
            ));
        }
        let plan = EnterPlan::new(self)?;
        enter_pipeline(self, &plan)?;
        if self.flags.seccomp {
            seccomp::enter_strict()?;
        }
        Ok(())
    }

    /// Runs a dynamically linked target under the jail.
    ///
    /// `argv` is the complete argument vector including `argv[0]`. Returns
    /// the PID of the first forked child (the PID-namespace init when one
    /// was requested); collect it with [`wait`](Self::wait).
    pub fn run(&mut self, program: &str, argv: &[&str]) -> Result<libc::pid_t> {
        Ok(self
            .run_pid_pipes(program, argv, false, false, false)?
            .pid)
    }

    /// Like [`run`](Self::run), optionally wiring pipes onto the target's
    /// stdin, stdout and stderr. The parent-side ends are returned.
    pub fn run_pid_pipes(
        &mut self,
        program: &str,
        argv: &[&str],
        want_stdin: bool,
        want_stdout: bool,
        want_stderr: bool,
    ) -> Result<Spawned> {
        let program_c =
            CString::new(program).map_err(|_| Error::InvalidArgument("program path contains NUL"))?;
        check_executable(&program_c)?;

        // Remembered across preexec(), which strips these flags.
        let pid_namespace = self.flags.pids;
        let use_chroot = self.flags.chroot;
        let use_tmp = self.flags.mount_tmp;

        let old_preload = std::env::var_os(PRELOAD_ENV);
        setup_preload(old_preload.as_ref());

        let conf_pipe = create_pipe()?;
        std::env::set_var(FD_ENV, conf_pipe[0].to_string());

        // Environment is final now; snapshot it for execve, and resolve
        // everything else the child will need post-clone.
        let exec = ExecContext::new(program, argv)?;
        let plan = EnterPlan::new(self)?;

        let stdin_fds = if want_stdin { Some(create_pipe()?) } else { None };
        let stdout_fds = if want_stdout { Some(create_pipe()?) } else { None };
        let stderr_fds = if want_stderr { Some(create_pipe()?) } else { None };

        let child = if pid_namespace {
            // Raw clone; see the module doc for why fork() must be avoided.
            confine_sys::proc::clone_newpid().map_err(|e| Error::syscall("clone", e))?
        } else {
            fork()?
        };

        if child > 0 {
            restore_preload(old_preload);
            std::env::remove_var(FD_ENV);

            self.initpid = child;

            // Send the marshalled configuration.
            // SAFETY: we own both pipe ends.
            unsafe { libc::close(conf_pipe[0]) };
            let sent = self.to_fd(conf_pipe[1]);
            unsafe { libc::close(conf_pipe[1]) };
            if let Err(e) = sent {
                // A child without a configuration would hang on the pipe.
                unsafe { libc::kill(child, libc::SIGKILL) };
                close_pipe(stdin_fds);
                close_pipe(stdout_fds);
                close_pipe(stderr_fds);
                return Err(e);
            }

            return Ok(Spawned {
                pid: child,
                stdin: stdin_fds.map(|fds| keep_end(fds, 1)),
                stdout: stdout_fds.map(|fds| keep_end(fds, 0)),
                stderr: stderr_fds.map(|fds| keep_end(fds, 0)),
            });
        }

        // Child. Only returns on failure.
        let err = child_dynamic(
            self,
            &exec,
            &plan,
            pid_namespace,
            use_chroot,
            use_tmp,
            stdin_fds,
            stdout_fds,
            stderr_fds,
        );
        let _ = writeln!(io::stderr(), "confine: jail setup failed: {err}");
        // SAFETY: _exit is the only safe way out of a failed jail child.
        unsafe { libc::_exit(ERR_INIT) }
    }

    /// Runs a statically linked target under the jail.
    ///
    /// No preload shim is available without a dynamic loader, so the whole
    /// pipeline runs before `execve` and resource limits are applied
    /// inline. Capability restriction needs the shim and is rejected here.
    pub fn run_static(&mut self, program: &str, argv: &[&str]) -> Result<libc::pid_t> {
        if self.flags.caps {
            return Err(Error::InvalidArgument(
                "caps not supported with static targets",
            ));
        }
        let program_c =
            CString::new(program).map_err(|_| Error::InvalidArgument("program path contains NUL"))?;
        check_executable(&program_c)?;

        let exec = ExecContext::new(program, argv)?;
        let plan = EnterPlan::new(self)?;
        let pid_namespace = self.flags.pids;

        let child = if pid_namespace {
            confine_sys::proc::clone_newpid().map_err(|e| Error::syscall("clone", e))?
        } else {
            fork()?
        };

        if child > 0 {
            self.initpid = child;
            return Ok(child);
        }

        // The clone itself consumed the pid request.
        self.flags.pids = false;
        let err = child_static(self, &exec, &plan, pid_namespace);
        let _ = writeln!(io::stderr(), "confine: jail setup failed: {err}");
        // SAFETY: as above.
        unsafe { libc::_exit(ERR_INIT) }
    }

    /// Waits for the jailed process and classifies its end.
    ///
    /// A normal exit returns the target's own code. Death by signal `N`
    /// returns `128 + N`, except `SIGSYS` (a seccomp kill) which returns
    /// the distinguished [`ERR_JAIL`](crate::ERR_JAIL).
    pub fn wait(&mut self) -> Result<i32> {
        let pid = self.initpid;
        if pid <= 0 {
            return Err(Error::InvalidArgument("no jailed process to wait for"));
        }
        let mut status = 0;
        // SAFETY: valid out-pointer.
        if unsafe { libc::waitpid(pid, &mut status, 0) } < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        self.initpid = 0;
        Ok(classify_status(pid, status))
    }

    /// Sends `SIGTERM` to the jailed process and waits once.
    pub fn kill(&mut self) -> Result<i32> {
        if self.initpid <= 0 {
            return Err(Error::InvalidArgument("no jailed process to kill"));
        }
        // SAFETY: plain kill.
        if unsafe { libc::kill(self.initpid, libc::SIGTERM) } != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        self.wait()
    }
}

fn classify_status(pid: libc::pid_t, status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        let code = libc::WEXITSTATUS(status);
        if code != 0 {
            info!("child process {} exited with status {}", pid, code);
        }
        code
    } else if libc::WIFSIGNALED(status) {
        let signum = libc::WTERMSIG(status);
        warn!("child process {} received signal {}", pid, signum);
        if signum == libc::SIGSYS {
            ERR_JAIL
        } else {
            128 + signum
        }
    } else {
        status
    }
}

/// Child flow of the dynamic path. Returns only on failure.
///
/// ```text
/// calling process
/// -> pipeline child (mount namespace, /proc remount)
///    [-> pid-namespace init, when requested]
///       -> chroot + execve; the preload shim finishes inside the target
/// ```
#[allow(clippy::too_many_arguments)]
fn child_dynamic(
    jail: &mut Jail,
    exec: &ExecContext,
    plan: &EnterPlan,
    pid_namespace: bool,
    use_chroot: bool,
    use_tmp: bool,
    stdin_fds: Option<[libc::c_int; 2]>,
    stdout_fds: Option<[libc::c_int; 2]>,
    stderr_fds: Option<[libc::c_int; 2]>,
) -> Error {
    if let Some(fds) = stdin_fds {
        if let Err(e) = dupe_end(fds, 0, libc::STDIN_FILENO) {
            return e;
        }
    }
    if let Some(fds) = stdout_fds {
        if let Err(e) = dupe_end(fds, 1, libc::STDOUT_FILENO) {
            return e;
        }
    }
    if let Some(fds) = stderr_fds {
        if let Err(e) = dupe_end(fds, 1, libc::STDERR_FILENO) {
            return e;
        }
    }

    // Everything not kept here is the shim's job inside the target.
    jail.preexec();
    if let Err(e) = enter_pipeline(jail, plan) {
        return e;
    }

    if pid_namespace {
        // This process is init of the new namespace. Fork once more so the
        // target does not have to know how to be init, and stay behind to
        // reap it.
        // SAFETY: plain fork.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Error::syscall("fork", last_errno());
        }
        if pid > 0 {
            supervisor::run_init(jail, pid);
        }
    }

    // Own process group, so a group kill reaches the whole jail.
    // SAFETY: plain setsid.
    if unsafe { libc::setsid() } < 0 {
        return Error::syscall("setsid", last_errno());
    }

    if use_chroot {
        if let Err(e) = plan.mounts.enter_chroot() {
            return e;
        }
        if use_tmp {
            if let Err(e) = mounts::mount_tmp() {
                return e;
            }
        }
    }

    exec.exec()
}

/// Child flow of the static path. Returns only on failure.
fn child_static(
    jail: &mut Jail,
    exec: &ExecContext,
    plan: &EnterPlan,
    pid_namespace: bool,
) -> Error {
    if let Err(e) = enter_pipeline(jail, plan) {
        return e;
    }

    if pid_namespace {
        // SAFETY: plain fork.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Error::syscall("fork", last_errno());
        }
        if pid > 0 {
            supervisor::run_init(jail, pid);
        }
    }

    // Own process group, so the supervisor's group kill reaches the target
    // and everything it spawns.
    // SAFETY: plain setsid.
    if unsafe { libc::setsid() } < 0 {
        return Error::syscall("setsid", last_errno());
    }

    // No shim on this path: limits are applied inline, then strict mode
    // last so setrlimit is still permitted.
    if let Err(e) = limits::apply(jail) {
        return e;
    }
    if jail.flags.seccomp {
        if let Err(e) = seccomp::enter_strict() {
            return e;
        }
    }

    // The init supervisor holds its own copy of the metadata handle.
    jail.meta_file = None;

    exec.exec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_refuses_pid_namespace() {
        let mut j = Jail::new();
        j.namespace_pids();
        assert!(matches!(j.enter(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn enter_refuses_usergroups_without_name() {
        let mut j = Jail::new();
        j.flags.usergroups = true;
        assert!(matches!(j.enter(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn run_static_rejects_caps() {
        let mut j = Jail::new();
        j.use_caps(0);
        assert!(matches!(
            j.run_static("/bin/true", &["/bin/true"]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn run_rejects_missing_target() {
        let mut j = Jail::new();
        assert!(matches!(
            j.run("/nonexistent/confine-target", &["x"]),
            Err(Error::NotExecutable(_))
        ));
    }

    #[test]
    fn wait_without_child_is_an_error() {
        let mut j = Jail::new();
        assert!(j.wait().is_err());
        assert!(j.kill().is_err());
    }

    #[test]
    fn exit_statuses_classify() {
        // Synthesized wait statuses: exit code in bits 8..16, signal in 0..7.
        assert_eq!(classify_status(1, 42 << 8), 42);
        assert_eq!(classify_status(1, libc::SIGSEGV), 128 + libc::SIGSEGV);
        assert_eq!(classify_status(1, libc::SIGSYS), ERR_JAIL);
        assert_eq!(classify_status(1, 0), 0);
    }

    #[test]
    fn preload_env_round_trips() {
        const PROBE: &str = "__confine_test_preload";
        std::env::remove_var(PRELOAD_ENV);
        setup_preload(None);
        assert_eq!(
            std::env::var(PRELOAD_ENV).unwrap(),
            PRELOAD_PATH.to_string()
        );
        restore_preload(None);
        assert!(std::env::var_os(PRELOAD_ENV).is_none());

        std::env::set_var(PRELOAD_ENV, PROBE);
        let old = std::env::var_os(PRELOAD_ENV);
        setup_preload(old.as_ref());
        assert_eq!(
            std::env::var(PRELOAD_ENV).unwrap(),
            format!("{PROBE} {PRELOAD_PATH}")
        );
        restore_preload(old);
        assert_eq!(std::env::var(PRELOAD_ENV).unwrap(), PROBE);
        std::env::remove_var(PRELOAD_ENV);
    }
}
