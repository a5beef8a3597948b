//! Jail configuration and builder.
//!
//! A [`Jail`] accumulates isolation requests while the caller still holds
//! privileges, is frozen when one of the `run` entry points is called, and
//! is then transmitted once through a pipe so the preload shim can finish
//! the remaining steps inside the exec'd target.
//!
//! ## Example
//!
//! ```ignore
//! use confine::Jail;
//!
//! let mut jail = Jail::new();
//! jail.change_uid(1000)?;
//! jail.change_gid(1000)?;
//! jail.namespace_pids();
//! jail.enter_chroot("/srv/jail")?;
//! jail.bind("/lib", "/lib", false)?;
//! jail.time_limit(2_000);
//!
//! let pid = jail.run("/bin/true", &["/bin/true"])?;
//! let status = jail.wait()?;
//! ```

use std::fs::File;
use std::io;

use confine_sys::seccomp::SockFilter;
use log::info;

use crate::error::{Error, Result};

/// One bind-mount directive: host `src` onto `dest` inside the chroot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub src: String,
    pub dest: String,
    pub writable: bool,
}

/// Which isolation mechanisms have been requested.
///
/// Split parent/child with [`Jail::preenter`] and [`Jail::preexec`]: some
/// flags describe work that must happen before `execve`, others describe
/// work the preload shim repeats inside the new process image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub uid: bool,
    pub gid: bool,
    pub caps: bool,
    pub vfs: bool,
    pub pids: bool,
    pub net: bool,
    /// Strict-mode seccomp (read/write/exit/sigreturn only).
    pub seccomp: bool,
    pub readonly_proc: bool,
    pub usergroups: bool,
    pub ptrace: bool,
    pub no_new_privs: bool,
    pub seccomp_filter: bool,
    pub log_seccomp_filter: bool,
    pub chroot: bool,
    pub mount_tmp: bool,
    pub chdir: bool,
    pub stack_limit: bool,
    pub time_limit: bool,
    pub output_limit: bool,
    pub memory_limit: bool,
    pub meta_file: bool,
}

/// The jail configuration record.
#[derive(Debug, Default)]
pub struct Jail {
    pub(crate) flags: Flags,
    pub(crate) uid: libc::uid_t,
    pub(crate) gid: libc::gid_t,
    /// Primary GID of `user`, used as the base for initgroups.
    pub(crate) usergid: libc::gid_t,
    pub(crate) user: Option<String>,
    pub(crate) caps: u64,
    /// PID of the first forked child once a `run` variant has been called.
    pub(crate) initpid: libc::pid_t,
    pub(crate) chrootdir: Option<String>,
    pub(crate) chdir: Option<String>,
    /// Compiled seccomp-BPF program, produced by the policy compiler.
    pub(crate) filter: Option<Vec<SockFilter>>,
    /// Applied in insertion order; path resolution prefers the longest
    /// destination prefix.
    pub(crate) binds: Vec<BindMount>,
    pub(crate) stack_limit: u64,
    pub(crate) time_limit_ms: u64,
    pub(crate) memory_limit: u64,
    pub(crate) output_limit: u64,
    pub(crate) meta_file: Option<File>,
}

impl Jail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop to this UID before exec. Requesting root is rejected.
    pub fn change_uid(&mut self, uid: libc::uid_t) -> Result<()> {
        if uid == 0 {
            return Err(Error::InvalidArgument("useless change to uid 0"));
        }
        self.uid = uid;
        self.flags.uid = true;
        Ok(())
    }

    /// Drop to this GID before exec. Requesting root's group is rejected.
    pub fn change_gid(&mut self, gid: libc::gid_t) -> Result<()> {
        if gid == 0 {
            return Err(Error::InvalidArgument("useless change to gid 0"));
        }
        self.gid = gid;
        self.flags.gid = true;
        Ok(())
    }

    /// Resolve a user name and drop to its UID. The name is retained so
    /// [`inherit_usergroups`](Self::inherit_usergroups) can populate the
    /// supplementary set later, with the user's primary GID as the base.
    pub fn change_user(&mut self, name: &str) -> Result<()> {
        let user = nix::unistd::User::from_name(name)
            .map_err(|e| Error::Io(io::Error::from_raw_os_error(e as i32)))?
            .ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("unknown user {name}"),
                ))
            })?;
        self.change_uid(user.uid.as_raw())?;
        self.user = Some(name.to_string());
        self.usergid = user.gid.as_raw();
        Ok(())
    }

    /// Resolve a group name and drop to its GID.
    pub fn change_group(&mut self, name: &str) -> Result<()> {
        let group = nix::unistd::Group::from_name(name)
            .map_err(|e| Error::Io(io::Error::from_raw_os_error(e as i32)))?
            .ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("unknown group {name}"),
                ))
            })?;
        self.change_gid(group.gid.as_raw())
    }

    /// Request strict-mode seccomp. Installed last of all pipeline steps,
    /// since it cuts off every other privilege-dropping syscall.
    pub fn use_seccomp(&mut self) {
        self.flags.seccomp = true;
    }

    pub fn no_new_privs(&mut self) {
        self.flags.no_new_privs = true;
    }

    /// Request filter-mode seccomp. The program itself is supplied with
    /// [`set_seccomp_filter`](Self::set_seccomp_filter).
    pub fn use_seccomp_filter(&mut self) {
        self.flags.seccomp_filter = true;
    }

    /// Report filter kills on stderr via a `SIGSYS` handler. Only useful
    /// with a trap-returning policy.
    pub fn log_seccomp_filter_failures(&mut self) {
        self.flags.log_seccomp_filter = true;
    }

    /// Load a compiled seccomp-BPF program and request filter mode.
    ///
    /// The policy-file compiler that produces the program is an external
    /// collaborator; this takes its output.
    pub fn set_seccomp_filter(&mut self, program: Vec<SockFilter>) -> Result<()> {
        if program.len() > u16::MAX as usize {
            return Err(Error::TooLarge);
        }
        self.filter = Some(program);
        self.flags.seccomp_filter = true;
        Ok(())
    }

    /// Restrict capabilities to this mask. Bits above the running kernel's
    /// last supported capability are ignored at drop time.
    pub fn use_caps(&mut self, capmask: u64) {
        self.caps = capmask;
        self.flags.caps = true;
    }

    pub fn namespace_vfs(&mut self) {
        self.flags.vfs = true;
    }

    /// A PID namespace is useless with a shared /proc, so this also forces
    /// a mount namespace and the read-only /proc remount.
    pub fn namespace_pids(&mut self) {
        self.flags.vfs = true;
        self.flags.readonly_proc = true;
        self.flags.pids = true;
    }

    pub fn namespace_net(&mut self) {
        self.flags.net = true;
    }

    pub fn remount_readonly(&mut self) {
        self.flags.vfs = true;
        self.flags.readonly_proc = true;
    }

    /// Populate the supplementary group set from /etc/group for the user
    /// given to [`change_user`](Self::change_user). Requires that a user
    /// name has already been set.
    pub fn inherit_usergroups(&mut self) -> Result<()> {
        if self.user.is_none() {
            return Err(Error::InvalidArgument(
                "usergroup inheritance without username",
            ));
        }
        self.flags.usergroups = true;
        Ok(())
    }

    /// Clear the dumpable bit so the target cannot be ptraced or have its
    /// /proc entries read by its own UID.
    pub fn disable_ptrace(&mut self) {
        self.flags.ptrace = true;
    }

    /// Chroot into `dir` before exec. May only be requested once.
    pub fn enter_chroot(&mut self, dir: &str) -> Result<()> {
        if self.chrootdir.is_some() {
            return Err(Error::InvalidArgument("chroot directory already set"));
        }
        self.chrootdir = Some(dir.to_string());
        self.flags.chroot = true;
        Ok(())
    }

    /// Mount an ephemeral tmpfs at /tmp inside the chroot.
    pub fn mount_tmp(&mut self) {
        self.flags.mount_tmp = true;
    }

    /// Working directory after the chroot. Requires a prior
    /// [`enter_chroot`](Self::enter_chroot) and an absolute path.
    pub fn chroot_chdir(&mut self, dir: &str) -> Result<()> {
        if self.chrootdir.is_none() {
            return Err(Error::InvalidArgument("chdir requires a chroot"));
        }
        if self.chdir.is_some() {
            return Err(Error::InvalidArgument("chdir directory already set"));
        }
        if !dir.starts_with('/') {
            return Err(Error::InvalidArgument("chdir directory must be absolute"));
        }
        self.chdir = Some(dir.to_string());
        self.flags.chdir = true;
        Ok(())
    }

    /// Bind-mount host `src` onto `dest` inside the chroot, optionally
    /// writable. Forces a mount namespace so the mounts cannot leak into
    /// the containing namespace.
    pub fn bind(&mut self, src: &str, dest: &str, writable: bool) -> Result<()> {
        if !dest.starts_with('/') {
            return Err(Error::InvalidArgument("bind destination must be absolute"));
        }
        info!("bind {} -> {}", src, dest);
        self.namespace_vfs();
        self.binds.push(BindMount {
            src: src.to_string(),
            dest: dest.to_string(),
            writable,
        });
        Ok(())
    }

    pub fn stack_limit(&mut self, bytes: u64) {
        self.flags.stack_limit = true;
        self.stack_limit = bytes;
    }

    /// CPU time limit in milliseconds. Enforced twice: as `RLIMIT_CPU` with
    /// a one-second ceiling granularity, and as an interval timer with
    /// millisecond granularity.
    pub fn time_limit(&mut self, msec: u64) {
        self.flags.time_limit = true;
        self.time_limit_ms = msec;
    }

    /// Output limit in bytes (`RLIMIT_FSIZE`; also disables core dumps).
    pub fn output_limit(&mut self, bytes: u64) {
        self.flags.output_limit = true;
        self.output_limit = bytes;
    }

    /// Address-space limit in bytes.
    pub fn memory_limit(&mut self, bytes: u64) {
        self.flags.memory_limit = true;
        self.memory_limit = bytes;
    }

    /// Open `path` for the execution metadata lines the PID-namespace init
    /// writes (wall/CPU time, peak RSS, exit status or signal).
    pub fn meta_file(&mut self, path: &str) -> Result<()> {
        let file = File::create(path)?;
        self.flags.meta_file = true;
        self.meta_file = Some(file);
        Ok(())
    }

    /// Strip the flags meant for the parent of `execve`.
    ///
    /// Keeps what is not inherited across `execve` (capabilities, seccomp)
    /// or is easier to set afterwards: the preload shim re-enters with the
    /// remaining flags inside the target.
    pub fn preenter(&mut self) {
        self.flags.vfs = false;
        self.flags.readonly_proc = false;
        self.flags.pids = false;
        self.flags.chroot = false;
    }

    /// Strip the flags meant for the exec'd child.
    ///
    /// Keeps what must be done before `execve`: mount-namespace setup, the
    /// /proc remount, and the resource/metadata bookkeeping the PID-namespace
    /// init needs. `pids` has already been consumed by the clone itself.
    pub fn preexec(&mut self) {
        let keep = Flags {
            vfs: self.flags.vfs,
            readonly_proc: self.flags.readonly_proc,
            stack_limit: self.flags.stack_limit,
            time_limit: self.flags.time_limit,
            output_limit: self.flags.output_limit,
            memory_limit: self.flags.memory_limit,
            meta_file: self.flags.meta_file,
            ..Flags::default()
        };
        self.user = None;
        self.flags = keep;
    }

    /// Snapshot of the requested flags.
    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn chroot_dir(&self) -> Option<&str> {
        self.chrootdir.as_deref()
    }

    pub fn chdir_dir(&self) -> Option<&str> {
        self.chdir.as_deref()
    }

    pub fn user_name(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn binds(&self) -> &[BindMount] {
        &self.binds
    }

    pub fn filter(&self) -> Option<&[SockFilter]> {
        self.filter.as_deref()
    }

    /// PID of the first forked child, once a `run` variant has been called.
    pub fn pid(&self) -> Option<libc::pid_t> {
        (self.initpid > 0).then_some(self.initpid)
    }
}
