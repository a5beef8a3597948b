//! Configuration codec for the fork/exec boundary.
//!
//! The parent serializes the jail into a pipe; the preload shim (or the
//! static-path child) deserializes it inside the new process image. The
//! stream is `[8-byte size][header][user?][chroot?][chdir?][filter?]
//! [bind src, dest, writable]*`.
//!
//! The header is written field by field from a fixed schema, never by
//! copying the struct: a bitset of the flag word, a presence byte standing
//! in for the owned-pointer fields, then the scalars. On unmarshal the
//! presence bits only decide which payload segments to consume; the owned
//! values are rebuilt from the payload. Strings are NUL-terminated; the
//! filter payload is `len` 8-byte BPF instructions.
//!
//! The stream is machine-local (native endianness, same-architecture
//! layout). It crosses one pipe between one parent and one child, never a
//! host boundary.

use std::os::fd::RawFd;

use confine_sys::seccomp::SockFilter;

use crate::error::{Error, Result};
use crate::jail::{Flags, Jail};

/// Framing sanity bound: a jail configuration never legitimately
/// approaches this.
const MAX_STREAM: u64 = u16::MAX as u64;

const PRESENT_USER: u8 = 1 << 0;
const PRESENT_CHROOT: u8 = 1 << 1;
const PRESENT_CHDIR: u8 = 1 << 2;
const PRESENT_FILTER: u8 = 1 << 3;

fn flag_bits(f: &Flags) -> u32 {
    let fields = [
        f.uid,
        f.gid,
        f.caps,
        f.vfs,
        f.pids,
        f.net,
        f.seccomp,
        f.readonly_proc,
        f.usergroups,
        f.ptrace,
        f.no_new_privs,
        f.seccomp_filter,
        f.log_seccomp_filter,
        f.chroot,
        f.mount_tmp,
        f.chdir,
        f.stack_limit,
        f.time_limit,
        f.output_limit,
        f.memory_limit,
        f.meta_file,
    ];
    fields
        .iter()
        .enumerate()
        .fold(0, |bits, (i, &set)| bits | (u32::from(set) << i))
}

fn flags_from_bits(bits: u32) -> Flags {
    let get = |i: usize| bits & (1 << i) != 0;
    Flags {
        uid: get(0),
        gid: get(1),
        caps: get(2),
        vfs: get(3),
        pids: get(4),
        net: get(5),
        seccomp: get(6),
        readonly_proc: get(7),
        usergroups: get(8),
        ptrace: get(9),
        no_new_privs: get(10),
        seccomp_filter: get(11),
        log_seccomp_filter: get(12),
        chroot: get(13),
        mount_tmp: get(14),
        chdir: get(15),
        stack_limit: get(16),
        time_limit: get(17),
        output_limit: get(18),
        memory_limit: get(19),
        meta_file: get(20),
    }
}

fn presence_bits(j: &Jail) -> u8 {
    let mut p = 0;
    if j.user.is_some() {
        p |= PRESENT_USER;
    }
    if j.chrootdir.is_some() {
        p |= PRESENT_CHROOT;
    }
    if j.chdir.is_some() {
        p |= PRESENT_CHDIR;
    }
    if j.flags.seccomp_filter && j.filter.is_some() {
        p |= PRESENT_FILTER;
    }
    p
}

// flags + presence + uid + gid + usergid + caps + initpid + filter_len
// + bind_count + four limits
const HEADER_LEN: usize = 4 + 1 + 4 + 4 + 4 + 8 + 4 + 4 + 4 + 8 * 4;

struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.buf.len() {
            return Err(Error::TruncatedInput);
        }
        let (head, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(head)
    }

    fn string(&mut self) -> Result<&'a str> {
        let nul = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or(Error::NoTerminator)?;
        let raw = self.bytes(nul + 1)?;
        std::str::from_utf8(&raw[..nul])
            .map_err(|_| Error::InvalidArgument("non-utf8 configuration string"))
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_ne_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_ne_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_ne_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_ne_bytes(self.bytes(8)?.try_into().unwrap()))
    }
}

fn push_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

impl Jail {
    /// Exact length in bytes of [`marshal`](Self::marshal)'s output.
    pub fn marshalled_size(&self) -> usize {
        let mut total = HEADER_LEN;
        for s in [&self.user, &self.chrootdir, &self.chdir].into_iter().flatten() {
            total += s.len() + 1;
        }
        if self.flags.seccomp_filter {
            if let Some(filter) = &self.filter {
                total += filter.len() * std::mem::size_of::<SockFilter>();
            }
        }
        for b in &self.binds {
            total += b.src.len() + 1 + b.dest.len() + 1 + 4;
        }
        total
    }

    /// Serialize the configuration. The metadata file handle is never
    /// transmitted; its presence flag is cleared again on unmarshal.
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.marshalled_size());

        out.extend_from_slice(&flag_bits(&self.flags).to_ne_bytes());
        out.push(presence_bits(self));
        out.extend_from_slice(&self.uid.to_ne_bytes());
        out.extend_from_slice(&self.gid.to_ne_bytes());
        out.extend_from_slice(&self.usergid.to_ne_bytes());
        out.extend_from_slice(&self.caps.to_ne_bytes());
        out.extend_from_slice(&self.initpid.to_ne_bytes());
        let filter_len = match (&self.filter, self.flags.seccomp_filter) {
            (Some(f), true) => f.len() as u32,
            _ => 0,
        };
        out.extend_from_slice(&filter_len.to_ne_bytes());
        out.extend_from_slice(&(self.binds.len() as u32).to_ne_bytes());
        out.extend_from_slice(&self.stack_limit.to_ne_bytes());
        out.extend_from_slice(&self.time_limit_ms.to_ne_bytes());
        out.extend_from_slice(&self.memory_limit.to_ne_bytes());
        out.extend_from_slice(&self.output_limit.to_ne_bytes());
        debug_assert_eq!(out.len(), HEADER_LEN);

        for s in [&self.user, &self.chrootdir, &self.chdir].into_iter().flatten() {
            push_str(&mut out, s);
        }
        if filter_len > 0 {
            for instr in self.filter.as_deref().unwrap_or(&[]) {
                out.extend_from_slice(&instr.code.to_ne_bytes());
                out.push(instr.jt);
                out.push(instr.jf);
                out.extend_from_slice(&instr.k.to_ne_bytes());
            }
        }
        for b in &self.binds {
            push_str(&mut out, &b.src);
            push_str(&mut out, &b.dest);
            out.extend_from_slice(&u32::from(b.writable).to_ne_bytes());
        }

        out
    }

    /// Rebuild a configuration from a marshalled stream.
    ///
    /// Either succeeds completely or fails with nothing allocated to the
    /// caller; a partial stream yields [`Error::TruncatedInput`] or
    /// [`Error::NoTerminator`].
    pub fn unmarshal(buf: &[u8]) -> Result<Jail> {
        let mut cur = Cursor { buf };

        let flags = flags_from_bits(cur.u32()?);
        let presence = cur.u8()?;

        let mut j = Jail {
            flags,
            ..Jail::default()
        };
        j.uid = cur.u32()?;
        j.gid = cur.u32()?;
        j.usergid = cur.u32()?;
        j.caps = cur.u64()?;
        j.initpid = cur.i32()?;
        let filter_len = cur.u32()?;
        let bind_count = cur.u32()?;
        j.stack_limit = cur.u64()?;
        j.time_limit_ms = cur.u64()?;
        j.memory_limit = cur.u64()?;
        j.output_limit = cur.u64()?;

        if presence & PRESENT_USER != 0 {
            j.user = Some(cur.string()?.to_string());
        }
        if presence & PRESENT_CHROOT != 0 {
            j.chrootdir = Some(cur.string()?.to_string());
        }
        if presence & PRESENT_CHDIR != 0 {
            j.chdir = Some(cur.string()?.to_string());
        }

        if presence & PRESENT_FILTER != 0 {
            if !j.flags.seccomp_filter || filter_len == 0 {
                return Err(Error::InvalidArgument("stray filter payload"));
            }
            if u64::from(filter_len) > u64::from(u16::MAX) {
                return Err(Error::TooLarge);
            }
            let byte_len = (filter_len as usize)
                .checked_mul(std::mem::size_of::<SockFilter>())
                .ok_or(Error::TooLarge)?;
            let mut raw = Cursor {
                buf: cur.bytes(byte_len)?,
            };
            let mut filter = Vec::with_capacity(filter_len as usize);
            for _ in 0..filter_len {
                filter.push(SockFilter {
                    code: raw.u16()?,
                    jt: raw.u8()?,
                    jf: raw.u8()?,
                    k: raw.u32()?,
                });
            }
            j.filter = Some(filter);
        }

        // The file handle never crosses the pipe.
        j.flags.meta_file = false;

        // Rebuild through bind() so its own invariants re-apply.
        j.binds = Vec::new();
        for _ in 0..bind_count {
            let src = cur.string()?.to_string();
            let dest = cur.string()?.to_string();
            let writable = cur.u32()? != 0;
            j.bind(&src, &dest, writable)?;
        }

        Ok(j)
    }

    /// Send `[8-byte size][marshalled configuration]` over a pipe.
    pub fn to_fd(&self, fd: RawFd) -> Result<()> {
        let buf = self.marshal();
        let size = buf.len() as u64;
        if size == 0 || size > MAX_STREAM {
            return Err(Error::TooLarge);
        }
        write_full(fd, &size.to_ne_bytes())?;
        write_full(fd, &buf)
    }

    /// Counterpart of [`to_fd`](Self::to_fd), used inside the new process
    /// image.
    pub fn from_fd(fd: RawFd) -> Result<Jail> {
        let mut size_buf = [0u8; 8];
        read_full(fd, &mut size_buf)?;
        let size = u64::from_ne_bytes(size_buf);
        if size > MAX_STREAM {
            return Err(Error::TooLarge);
        }
        let mut buf = vec![0u8; size as usize];
        read_full(fd, &mut buf)?;
        Jail::unmarshal(&buf)
    }
}

fn write_full(fd: RawFd, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        // SAFETY: buf is a live slice.
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Io(err));
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

fn read_full(fd: RawFd, buf: &mut [u8]) -> Result<()> {
    let mut off = 0;
    while off < buf.len() {
        // SAFETY: the target range is a live slice of buf.
        let n = unsafe { libc::read(fd, buf[off..].as_mut_ptr().cast(), buf.len() - off) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Io(err));
        }
        if n == 0 {
            return Err(Error::TruncatedInput);
        }
        off += n as usize;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_jail() -> Jail {
        let mut j = Jail::new();
        j.change_uid(1000).unwrap();
        j.change_gid(1000).unwrap();
        j.use_caps(0x5);
        j.namespace_pids();
        j.namespace_net();
        j.no_new_privs();
        j.enter_chroot("/srv/j").unwrap();
        j.chroot_chdir("/bin").unwrap();
        j.bind("/lib", "/lib", false).unwrap();
        j.bind("/var/tmp", "/tmp", true).unwrap();
        j.time_limit(1500);
        j.memory_limit(64 << 20);
        j.set_seccomp_filter(vec![
            SockFilter::stmt(0x20, 4),
            SockFilter::jump(0x15, 0xc000003e, 1, 0),
            SockFilter::stmt(0x06, 0x7fff0000),
        ])
        .unwrap();
        j
    }

    #[test]
    fn round_trip_preserves_semantics() {
        let j = sample_jail();
        let restored = Jail::unmarshal(&j.marshal()).unwrap();

        assert_eq!(restored.flags, j.flags);
        assert_eq!(restored.uid, 1000);
        assert_eq!(restored.gid, 1000);
        assert_eq!(restored.caps, 0x5);
        assert_eq!(restored.chroot_dir(), Some("/srv/j"));
        assert_eq!(restored.chdir_dir(), Some("/bin"));
        assert_eq!(restored.binds(), j.binds());
        assert_eq!(restored.filter(), j.filter());
        assert_eq!(restored.time_limit_ms, 1500);
        assert_eq!(restored.memory_limit, 64 << 20);
    }

    #[test]
    fn round_trip_minimal_config() {
        let j = Jail::new();
        let restored = Jail::unmarshal(&j.marshal()).unwrap();
        assert_eq!(restored.flags, Flags::default());
        assert!(restored.binds().is_empty());
        assert!(restored.filter().is_none());
    }

    #[test]
    fn chroot_and_single_bind_round_trip() {
        let mut j = Jail::new();
        j.enter_chroot("/srv/j").unwrap();
        j.chroot_chdir("/bin").unwrap();
        j.bind("/lib", "/lib", false).unwrap();

        let restored = Jail::unmarshal(&j.marshal()).unwrap();
        assert_eq!(restored.chroot_dir(), Some("/srv/j"));
        assert_eq!(restored.chdir_dir(), Some("/bin"));
        assert_eq!(
            restored.binds(),
            &[crate::jail::BindMount {
                src: "/lib".into(),
                dest: "/lib".into(),
                writable: false,
            }]
        );
    }

    #[test]
    fn marshal_writes_exactly_size_bytes() {
        for j in [Jail::new(), sample_jail()] {
            assert_eq!(j.marshal().len(), j.marshalled_size());
        }
    }

    #[test]
    fn every_proper_prefix_fails_cleanly() {
        let buf = sample_jail().marshal();
        for len in 0..buf.len() {
            let err = Jail::unmarshal(&buf[..len]).unwrap_err();
            assert!(
                matches!(err, Error::TruncatedInput | Error::NoTerminator),
                "prefix {len} gave {err:?}"
            );
        }
    }

    #[test]
    fn filter_bytes_survive_byte_identical() {
        let j = sample_jail();
        let restored = Jail::unmarshal(&j.marshal()).unwrap();
        let before = j.filter().unwrap();
        let after = restored.filter().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn meta_presence_cleared_on_unmarshal() {
        let mut j = sample_jail();
        let meta = tempfile::NamedTempFile::new().unwrap();
        j.meta_file(meta.path().to_str().unwrap()).unwrap();
        assert!(j.flags.meta_file);

        let restored = Jail::unmarshal(&j.marshal()).unwrap();
        assert!(!restored.flags.meta_file);
        assert!(restored.meta_file.is_none());
    }

    #[test]
    fn bind_order_is_preserved() {
        let mut j = Jail::new();
        for i in 0..8 {
            j.bind(&format!("/host/{i}"), &format!("/d{i}"), i % 2 == 0)
                .unwrap();
        }
        let restored = Jail::unmarshal(&j.marshal()).unwrap();
        let dests: Vec<_> = restored.binds().iter().map(|b| b.dest.as_str()).collect();
        assert_eq!(dests, ["/d0", "/d1", "/d2", "/d3", "/d4", "/d5", "/d6", "/d7"]);
    }

    #[test]
    fn fd_framing_round_trips() {
        let j = sample_jail();

        let mut fds = [0; 2];
        // SAFETY: valid out-array.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        j.to_fd(fds[1]).unwrap();
        // SAFETY: we own the fd.
        unsafe { libc::close(fds[1]) };

        let restored = Jail::from_fd(fds[0]).unwrap();
        unsafe { libc::close(fds[0]) };

        assert_eq!(restored.flags, {
            let mut f = j.flags;
            f.meta_file = false;
            f
        });
        assert_eq!(restored.binds(), j.binds());
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let huge = (MAX_STREAM + 1).to_ne_bytes();
        assert_eq!(
            unsafe { libc::write(fds[1], huge.as_ptr().cast(), huge.len()) },
            8
        );
        unsafe { libc::close(fds[1]) };

        assert!(matches!(Jail::from_fd(fds[0]), Err(Error::TooLarge)));
        unsafe { libc::close(fds[0]) };
    }
}
