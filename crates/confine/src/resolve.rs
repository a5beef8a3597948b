//! In-jail path to host path translation.
//!
//! Used by front-ends that must inspect the target binary before the jail
//! exists: given a path as the jailed process will see it, find the file on
//! the host by honoring the bind mounts and the chroot. Symlinks are
//! chased through the same translation, since their targets are jail-side
//! paths too.

use std::fs;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::jail::Jail;

/// Matches the kernel's ELOOP bound.
const MAX_SYMLINK_HOPS: usize = 40;

impl Jail {
    /// Translates `path`, as seen from inside the jail, to the host-side
    /// path it will actually resolve to.
    ///
    /// Relative paths are taken relative to the configured post-chroot
    /// working directory, or the chroot root, or the current directory,
    /// in that order of configuration. The bind mount with the longest
    /// destination prefix wins; ties go to the earliest insertion.
    ///
    /// Only regular files (possibly behind symlinks) are representable.
    pub fn get_path(&self, path: &str) -> Result<PathBuf> {
        let mut current = path.to_string();

        for _ in 0..MAX_SYMLINK_HOPS {
            let jail_path = self.absolutize(&current)?;
            let host_path = self.rewrite(&jail_path);

            let meta = fs::symlink_metadata(&host_path)?;
            if meta.file_type().is_file() {
                return Ok(PathBuf::from(host_path));
            }
            if !meta.file_type().is_symlink() {
                return Err(Error::NotRepresentable(host_path));
            }

            // The link target is a jail-side path again; go around.
            current = fs::read_link(&host_path)?
                .into_os_string()
                .into_string()
                .map_err(|p| Error::NotRepresentable(p.to_string_lossy().into_owned()))?;
        }

        Err(Error::NotRepresentable(format!(
            "too many levels of symbolic links: {path}"
        )))
    }

    fn absolutize(&self, path: &str) -> Result<String> {
        if path.starts_with('/') {
            return Ok(path.to_string());
        }
        let base = if self.flags.chdir {
            self.chdir.clone().unwrap_or_else(|| "/".into())
        } else if self.flags.chroot {
            "/".into()
        } else {
            std::env::current_dir()?
                .into_os_string()
                .into_string()
                .map_err(|p| Error::NotRepresentable(p.to_string_lossy().into_owned()))?
        };
        Ok(join(&base, path))
    }

    /// Swaps the longest matching bind destination for its host source, or
    /// falls back to the chroot directory.
    fn rewrite(&self, jail_path: &str) -> String {
        let mut best: Option<&crate::jail::BindMount> = None;
        let mut best_len = 0;
        for b in &self.binds {
            if jail_path.starts_with(&b.dest) && b.dest.len() > best_len {
                best_len = b.dest.len();
                best = Some(b);
            }
        }

        let (host_prefix, consumed) = match best {
            Some(b) => (b.src.as_str(), best_len),
            None if self.flags.chroot => {
                (self.chrootdir.as_deref().unwrap_or(""), 1)
            }
            None => ("/", 1),
        };

        join(host_prefix, &jail_path[consumed..])
    }
}

fn join(prefix: &str, rest: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let rest = rest.trim_start_matches('/');
    match (prefix.is_empty(), rest.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{rest}"),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{prefix}/{rest}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_destination_prefix_wins() {
        let mut j = Jail::new();
        j.bind("/host/a", "/x", false).unwrap();
        j.bind("/host/ab", "/xy", false).unwrap();

        assert_eq!(j.rewrite("/xy/z"), "/host/ab/z");
        assert_eq!(j.rewrite("/x/y"), "/host/a/y");
    }

    #[test]
    fn ties_go_to_earliest_insertion() {
        let mut j = Jail::new();
        j.bind("/first", "/same", false).unwrap();
        j.bind("/second", "/same", false).unwrap();

        assert_eq!(j.rewrite("/same/f"), "/first/f");
    }

    #[test]
    fn no_bind_falls_back_to_chroot() {
        let mut j = Jail::new();
        j.enter_chroot("/srv/jail").unwrap();
        assert_eq!(j.rewrite("/bin/sh"), "/srv/jail/bin/sh");
    }

    #[test]
    fn no_bind_no_chroot_is_identity() {
        let j = Jail::new();
        assert_eq!(j.rewrite("/bin/sh"), "/bin/sh");
    }

    #[test]
    fn bind_match_consumes_whole_destination() {
        let mut j = Jail::new();
        j.bind("/host/lib64", "/lib", false).unwrap();
        assert_eq!(j.rewrite("/lib/libc.so"), "/host/lib64/libc.so");
        assert_eq!(j.rewrite("/lib"), "/host/lib64");
    }

    #[test]
    fn relative_paths_use_chdir_then_chroot() {
        let mut j = Jail::new();
        j.enter_chroot("/srv/jail").unwrap();
        assert_eq!(j.absolutize("bin/sh").unwrap(), "/bin/sh");

        j.chroot_chdir("/work").unwrap();
        assert_eq!(j.absolutize("bin/sh").unwrap(), "/work/bin/sh");
        assert_eq!(j.absolutize("/abs").unwrap(), "/abs");
    }

    #[test]
    fn resolves_real_files_through_binds() {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("tool");
        std::fs::write(&host, b"#!/bin/sh\n").unwrap();

        let mut j = Jail::new();
        j.bind(dir.path().to_str().unwrap(), "/opt", false).unwrap();

        let resolved = j.get_path("/opt/tool").unwrap();
        assert_eq!(resolved, host);
    }

    #[test]
    fn chases_symlinks_via_jail_view() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("real"), b"x").unwrap();
        // Link target is a jail-side absolute path.
        std::os::unix::fs::symlink("/opt/real", dir.path().join("alias")).unwrap();

        let mut j = Jail::new();
        j.bind(dir.path().to_str().unwrap(), "/opt", false).unwrap();

        let resolved = j.get_path("/opt/alias").unwrap();
        assert_eq!(resolved, dir.path().join("real"));
    }

    #[test]
    fn directories_are_not_representable() {
        let dir = tempfile::tempdir().unwrap();
        let mut j = Jail::new();
        j.bind(dir.path().to_str().unwrap(), "/opt", false).unwrap();

        assert!(matches!(
            j.get_path("/opt"),
            Err(Error::NotRepresentable(_))
        ));
    }

    #[test]
    fn symlink_loops_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("/opt/loop", dir.path().join("loop")).unwrap();

        let mut j = Jail::new();
        j.bind(dir.path().to_str().unwrap(), "/opt", false).unwrap();

        assert!(matches!(
            j.get_path("/opt/loop"),
            Err(Error::NotRepresentable(_))
        ));
    }

    #[test]
    fn missing_files_surface_io_errors() {
        let j = Jail::new();
        assert!(matches!(
            j.get_path("/nonexistent/confine/file"),
            Err(Error::Io(_))
        ));
    }
}
