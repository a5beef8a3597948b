//! UID/GID and capability dropping.
//!
//! The capability drop is a two-commit dance. `CAP_SETPCAP` is kept through
//! the first commit because shrinking the bounding set requires it, and the
//! bounding set is shrunk *after* the first commit so a permissive bounding
//! set cannot be used to re-raise anything. Only then, if the caller did not
//! ask for `CAP_SETPCAP`, is it removed and the sets committed again.
//!
//! A failure anywhere leaves the process in a half-dropped state, which is
//! why every error here is treated as fatal by the driver. Silent partial
//! capability state is unacceptable.

use std::ffi::CStr;

use confine_sys::caps::{self, CapUserData, CAP_SETPCAP};
use confine_sys::last_errno;

use crate::error::{Error, Result};
use crate::jail::Jail;

/// Arms keep-caps and locks securebits.
///
/// Called before the UID change when capabilities will be dropped
/// afterwards: without keep-caps, `setresuid` away from root clears the
/// permitted set and the later [`drop_caps`] would have nothing to shape.
/// The securebits locks prevent the jail from ever re-acquiring
/// capabilities across further UID changes.
pub(crate) fn arm_keepcaps() -> Result<()> {
    caps::set_keep_caps().map_err(|e| Error::kernel("prctl(PR_SET_KEEPCAPS)", e))?;
    caps::lock_securebits().map_err(|e| Error::kernel("prctl(PR_SET_SECUREBITS)", e))
}

/// Drops group and user identity per the configuration.
///
/// `user` is the pre-converted C string of the configured user name, built
/// in the parent so this stays allocation-free after a raw clone.
pub(crate) fn drop_ugid(jail: &Jail, user: Option<&CStr>) -> Result<()> {
    if jail.flags.usergroups {
        let user = user.ok_or(Error::InvalidArgument(
            "usergroup inheritance without username",
        ))?;
        // SAFETY: valid NUL-terminated name.
        if unsafe { libc::initgroups(user.as_ptr(), jail.usergid) } != 0 {
            return Err(Error::syscall("initgroups", last_errno()));
        }
    } else if jail.flags.uid || jail.flags.gid {
        // Only clear supplemental groups when the identity actually changes.
        // SAFETY: size 0 with null list clears the set.
        if unsafe { libc::setgroups(0, std::ptr::null()) } != 0 {
            return Err(Error::syscall("setgroups", last_errno()));
        }
    }

    if jail.flags.gid {
        // SAFETY: plain syscall.
        if unsafe { libc::setresgid(jail.gid, jail.gid, jail.gid) } != 0 {
            return Err(Error::syscall("setresgid", last_errno()));
        }
    }

    if jail.flags.uid {
        // SAFETY: plain syscall.
        if unsafe { libc::setresuid(jail.uid, jail.uid, jail.uid) } != 0 {
            return Err(Error::syscall("setresuid", last_errno()));
        }
    }

    Ok(())
}

/// Builds the effective/permitted/inheritable words for a requested mask.
///
/// Bits above the running kernel's last capability are ignored rather than
/// attempted; `CAP_SETPCAP` is always included here and stripped later if
/// it was not requested.
fn cap_words(mask: u64, last_cap: u32) -> [CapUserData; 2] {
    let mut data = [CapUserData::default(); 2];
    for i in 0..=last_cap.min(63) {
        if i != CAP_SETPCAP && mask & (1 << i) == 0 {
            continue;
        }
        let bit = 1u32 << (i % 32);
        let word = &mut data[(i / 32) as usize];
        word.effective |= bit;
        word.permitted |= bit;
        word.inheritable |= bit;
    }
    data
}

/// Restricts every capability set to the configured mask.
pub(crate) fn drop_caps(jail: &Jail, last_cap: u32) -> Result<()> {
    let mut data = cap_words(jail.caps, last_cap);
    caps::capset(&data).map_err(|e| Error::kernel("capset", e))?;

    // Bounding set second: the first commit kept CAP_SETPCAP exactly so
    // these drops are permitted.
    for i in 0..=last_cap.min(63) {
        if jail.caps & (1 << i) != 0 {
            continue;
        }
        caps::drop_bounding_cap(i).map_err(|e| Error::kernel("prctl(PR_CAPBSET_DROP)", e))?;
    }

    if jail.caps & (1 << CAP_SETPCAP) == 0 {
        let bit = !(1u32 << (CAP_SETPCAP % 32));
        let word = &mut data[(CAP_SETPCAP / 32) as usize];
        word.effective &= bit;
        word.permitted &= bit;
        word.inheritable &= bit;
        caps::capset(&data).map_err(|e| Error::kernel("capset", e))?;
    }

    Ok(())
}
