//! Marshal round-trip scenarios across the public API.
//!
//! The configuration crosses the fork/exec boundary through a pipe; these
//! tests pin down the round-trip law, the size law, and the failure modes
//! for damaged streams.

use confine::{Error, Jail, SockFilter};

#[test]
fn chroot_chdir_bind_round_trip() {
    let mut jail = Jail::new();
    jail.enter_chroot("/srv/j").unwrap();
    jail.chroot_chdir("/bin").unwrap();
    jail.bind("/lib", "/lib", false).unwrap();

    let restored = Jail::unmarshal(&jail.marshal()).unwrap();

    assert_eq!(restored.chroot_dir(), Some("/srv/j"));
    assert_eq!(restored.chdir_dir(), Some("/bin"));
    assert_eq!(restored.binds().len(), 1);
    let b = &restored.binds()[0];
    assert_eq!((b.src.as_str(), b.dest.as_str(), b.writable), ("/lib", "/lib", false));
}

#[test]
fn full_configuration_round_trip() {
    let mut jail = Jail::new();
    jail.change_uid(1000).unwrap();
    jail.change_gid(100).unwrap();
    jail.use_caps(1 << 12);
    jail.namespace_pids();
    jail.namespace_net();
    jail.no_new_privs();
    jail.log_seccomp_filter_failures();
    jail.enter_chroot("/srv/jail").unwrap();
    jail.mount_tmp();
    jail.bind("/host/ro", "/ro", false).unwrap();
    jail.bind("/host/rw", "/rw", true).unwrap();
    jail.time_limit(2500);
    jail.memory_limit(256 << 20);
    jail.output_limit(1 << 20);
    jail.stack_limit(8 << 20);
    jail.set_seccomp_filter(vec![
        SockFilter::stmt(0x20, 0),
        SockFilter::jump(0x15, 63, 0, 1),
        SockFilter::stmt(0x06, 0),
        SockFilter::stmt(0x06, 0x7fff0000),
    ])
    .unwrap();

    let restored = Jail::unmarshal(&jail.marshal()).unwrap();

    assert_eq!(restored.flags(), jail.flags());
    assert_eq!(restored.chroot_dir(), Some("/srv/jail"));
    assert_eq!(restored.binds(), jail.binds());
    assert_eq!(restored.filter(), jail.filter());
}

#[test]
fn marshal_size_matches_output() {
    let mut jail = Jail::new();
    jail.enter_chroot("/srv/j").unwrap();
    jail.bind("/a", "/b", true).unwrap();
    assert_eq!(jail.marshal().len(), jail.marshalled_size());
}

#[test]
fn truncated_stream_is_rejected() {
    let mut jail = Jail::new();
    jail.enter_chroot("/srv/j").unwrap();
    jail.bind("/lib", "/lib", false).unwrap();
    let buf = jail.marshal();

    for len in [0, 1, buf.len() / 2, buf.len() - 1] {
        assert!(
            matches!(
                Jail::unmarshal(&buf[..len]),
                Err(Error::TruncatedInput | Error::NoTerminator)
            ),
            "prefix of {len} bytes must not unmarshal"
        );
    }
}

#[test]
fn presence_flags_track_payload() {
    // No optional payloads at all.
    let empty = Jail::new();
    let restored = Jail::unmarshal(&empty.marshal()).unwrap();
    assert_eq!(restored.chroot_dir(), None);
    assert_eq!(restored.chdir_dir(), None);
    assert_eq!(restored.user_name(), None);
    assert!(restored.filter().is_none());

    // Every optional payload present.
    let mut full = Jail::new();
    full.enter_chroot("/c").unwrap();
    full.chroot_chdir("/d").unwrap();
    full.set_seccomp_filter(vec![SockFilter::stmt(0x06, 0)]).unwrap();
    let restored = Jail::unmarshal(&full.marshal()).unwrap();
    assert_eq!(restored.chroot_dir(), Some("/c"));
    assert_eq!(restored.chdir_dir(), Some("/d"));
    assert_eq!(restored.filter().map(<[SockFilter]>::len), Some(1));
}
