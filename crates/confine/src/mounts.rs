//! Bind mounts, chroot, tmpfs /tmp and the read-only /proc remount.
//!
//! Path strings are converted to C strings up front in [`MountPlan::new`],
//! in the parent. The apply methods themselves only issue syscalls, so they
//! are safe to call in the child of a raw `clone` where the allocator must
//! not be touched.
//!
//! Any failure here is fatal for the caller: the process is already
//! partway through privilege transformation and must not reach `execve`.

use std::ffi::{CStr, CString};

use confine_sys::last_errno;

use crate::error::{Error, Result};
use crate::jail::Jail;

struct PlannedBind {
    src: CString,
    /// Destination prefixed with the chroot directory, host-side view.
    target: CString,
    writable: bool,
}

/// Pre-resolved mount material for one jail entry.
pub(crate) struct MountPlan {
    binds: Vec<PlannedBind>,
    chroot: Option<CString>,
    chdir: CString,
    /// Host-side path of the jail's /proc before the chroot is entered.
    proc_outside: CString,
}

impl MountPlan {
    pub(crate) fn new(jail: &Jail) -> Result<Self> {
        let chrootdir = jail.chrootdir.as_deref().unwrap_or("");

        let mut binds = Vec::with_capacity(jail.binds.len());
        for b in &jail.binds {
            binds.push(PlannedBind {
                src: cstring(&b.src)?,
                // dest carries its leading '/'.
                target: cstring(&format!("{}{}", chrootdir, b.dest))?,
                writable: b.writable,
            });
        }

        Ok(Self {
            binds,
            chroot: jail
                .chrootdir
                .as_deref()
                .map(cstring)
                .transpose()?,
            chdir: cstring(jail.chdir.as_deref().unwrap_or("/"))?,
            proc_outside: cstring(&format!("{}/proc", chrootdir))?,
        })
    }

    /// Applies bind mounts in insertion order, then chroots and enters the
    /// configured working directory. The first mount failure aborts the
    /// sequence.
    pub(crate) fn enter_chroot(&self) -> Result<()> {
        for b in &self.binds {
            bind_mount(&b.src, &b.target, b.writable)?;
        }

        let Some(chroot) = &self.chroot else {
            return Err(Error::InvalidArgument("chroot requested without directory"));
        };
        // SAFETY: valid NUL-terminated path.
        if unsafe { libc::chroot(chroot.as_ptr()) } != 0 {
            return Err(Error::syscall("chroot", last_errno()));
        }
        // SAFETY: valid NUL-terminated path.
        if unsafe { libc::chdir(self.chdir.as_ptr()) } != 0 {
            return Err(Error::syscall("chdir", last_errno()));
        }
        Ok(())
    }

    /// Replaces the inherited /proc with a fresh read-only instance.
    ///
    /// We still hold a reference to the parent's mount of /proc in our
    /// namespace; `MS_REMOUNT` on it would mutate the parent's mount as
    /// well, even inside a fresh mount namespace. So the inherited mount is
    /// detached and a new one created. `chroot_entered` selects whether the
    /// target is addressed from the host side or from inside the chroot.
    pub(crate) fn remount_proc_readonly(&self, chroot_entered: bool) -> Result<()> {
        let target: &CStr = if chroot_entered {
            c"/proc"
        } else {
            &self.proc_outside
        };

        // Some distros have the JDK mount this; unmount without erroring.
        // SAFETY: constant path.
        unsafe { libc::umount(c"/proc/sys/fs/binfmt_misc".as_ptr()) };

        // SAFETY: constant path.
        if unsafe { libc::umount(c"/proc".as_ptr()) } != 0 {
            return Err(Error::syscall("umount /proc", last_errno()));
        }
        // SAFETY: valid paths, constant flags.
        let ret = unsafe {
            libc::mount(
                c"".as_ptr(),
                target.as_ptr(),
                c"proc".as_ptr(),
                libc::MS_NODEV | libc::MS_NOEXEC | libc::MS_NOSUID | libc::MS_RDONLY,
                c"".as_ptr().cast(),
            )
        };
        if ret != 0 {
            return Err(Error::syscall("mount proc", last_errno()));
        }
        Ok(())
    }
}

/// Mounts an ephemeral tmpfs at /tmp inside the chroot.
pub(crate) fn mount_tmp() -> Result<()> {
    // SAFETY: constant arguments.
    let ret = unsafe {
        libc::mount(
            c"none".as_ptr(),
            c"/tmp".as_ptr(),
            c"tmpfs".as_ptr(),
            0,
            c"size=128M,mode=777".as_ptr().cast(),
        )
    };
    if ret != 0 {
        return Err(Error::syscall("mount /tmp", last_errno()));
    }
    Ok(())
}

fn bind_mount(src: &CStr, target: &CStr, writable: bool) -> Result<()> {
    // SAFETY: valid NUL-terminated paths.
    let ret = unsafe {
        libc::mount(
            src.as_ptr(),
            target.as_ptr(),
            std::ptr::null(),
            libc::MS_BIND,
            std::ptr::null(),
        )
    };
    if ret != 0 {
        return Err(Error::syscall("bind mount", last_errno()));
    }

    if !writable {
        // A plain MS_BIND ignores MS_RDONLY; the read-only view needs a
        // second remount of the same target.
        // SAFETY: as above.
        let ret = unsafe {
            libc::mount(
                src.as_ptr(),
                target.as_ptr(),
                std::ptr::null(),
                libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY,
                std::ptr::null(),
            )
        };
        if ret != 0 {
            return Err(Error::syscall("bind remount readonly", last_errno()));
        }
    }
    Ok(())
}

fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::InvalidArgument("path contains NUL"))
}
