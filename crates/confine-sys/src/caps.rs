//! POSIX capability plumbing: capget/capset, bounding set, securebits.
//!
//! The capability syscalls use a versioned ABI. Version 3 carries two
//! 32-bit words per set, covering capabilities 0..=63. libcap is not used;
//! the structs below are handed to `capget(2)`/`capset(2)` directly.

use std::fs;
use std::sync::OnceLock;

use rustix::io::Errno;

use crate::last_errno;

pub const LINUX_CAPABILITY_VERSION_3: u32 = 0x20080522;

/// Needed to shrink the bounding set; retained during the drop sequence.
pub const CAP_SETPCAP: u32 = 8;

// Fallback definitions for kernels whose headers predate linux/securebits.h.
pub const SECURE_ALL_BITS: libc::c_ulong = 0x15;
pub const SECURE_ALL_LOCKS: libc::c_ulong = SECURE_ALL_BITS << 1;

#[repr(C)]
pub struct CapUserHeader {
    pub version: u32,
    pub pid: libc::c_int,
}

/// One 32-capability word of the effective/permitted/inheritable sets.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapUserData {
    pub effective: u32,
    pub permitted: u32,
    pub inheritable: u32,
}

/// Reads the current thread's capability sets.
pub fn capget() -> Result<[CapUserData; 2], Errno> {
    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let mut data = [CapUserData::default(); 2];

    // SAFETY: valid version-3 header, pid 0 = current thread, data holds the
    // two words version 3 requires.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_capget,
            &header as *const CapUserHeader,
            data.as_mut_ptr(),
        )
    };
    if rc != 0 {
        return Err(last_errno());
    }
    Ok(data)
}

/// Commits capability sets for the current thread.
pub fn capset(data: &[CapUserData; 2]) -> Result<(), Errno> {
    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };

    // SAFETY: valid version-3 header and two initialized data words.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_capset,
            &header as *const CapUserHeader,
            data.as_ptr(),
        )
    };
    if rc != 0 {
        return Err(last_errno());
    }
    Ok(())
}

/// Removes one capability from the bounding set. Requires `CAP_SETPCAP`.
pub fn drop_bounding_cap(cap: u32) -> Result<(), Errno> {
    // SAFETY: prctl(PR_CAPBSET_DROP) with a valid cap index.
    let ret = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap as libc::c_ulong, 0, 0, 0) };
    if ret != 0 {
        return Err(last_errno());
    }
    Ok(())
}

/// Keeps permitted capabilities across a UID change.
pub fn set_keep_caps() -> Result<(), Errno> {
    // SAFETY: prctl(PR_SET_KEEPCAPS, 1) is safe.
    let ret = unsafe { libc::prctl(libc::PR_SET_KEEPCAPS, 1, 0, 0, 0) };
    if ret != 0 {
        return Err(last_errno());
    }
    Ok(())
}

/// Sets and locks every securebit so capabilities cannot be re-acquired
/// across UID changes. Locked bits can never be unset again.
pub fn lock_securebits() -> Result<(), Errno> {
    // SAFETY: prctl(PR_SET_SECUREBITS) with constant flags.
    let ret = unsafe { libc::prctl(libc::PR_SET_SECUREBITS, SECURE_ALL_BITS | SECURE_ALL_LOCKS) };
    if ret != 0 {
        return Err(last_errno());
    }
    Ok(())
}

/// Highest capability index the *running* kernel supports.
///
/// Compile-time `CAP_LAST_CAP` only reflects the kernel headers we were
/// built against, which may be older or newer than the kernel we run on.
/// The answer comes from /proc instead, read once and cached.
pub fn last_cap() -> std::io::Result<u32> {
    static LAST_CAP: OnceLock<std::io::Result<u32>> = OnceLock::new();

    LAST_CAP
        .get_or_init(|| {
            let text = fs::read_to_string("/proc/sys/kernel/cap_last_cap")?;
            text.trim().parse::<u32>().map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, e)
            })
        })
        .as_ref()
        .map(|cap| *cap)
        .map_err(|e| std::io::Error::new(e.kind(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_user_data_is_kernel_sized() {
        assert_eq!(std::mem::size_of::<CapUserData>(), 12);
        assert_eq!(std::mem::size_of::<CapUserHeader>(), 8);
    }

    #[test]
    fn capget_reports_current_sets() {
        // Reading our own sets needs no privilege.
        let data = capget().expect("capget");
        // An unprivileged test runner has empty or partial sets; a root
        // runner has bits set. Either way the call itself must succeed.
        let _ = data[0].effective;
    }

    #[test]
    fn last_cap_is_sane() {
        let cap = last_cap().expect("cap_last_cap");
        // CAP_SYS_ADMIN (21) has existed since 2.2; 64 is the ABI ceiling.
        assert!((21..64).contains(&cap));
    }

    #[test]
    fn last_cap_is_cached() {
        assert_eq!(last_cap().unwrap(), last_cap().unwrap());
    }
}
