//! Property and data registry behavior through the public engine API.

mod common;

use crated::core::container::ContainerState;
use crated::core::registry::{FieldClass, FieldFlags};
use crated::ErrorKind;

#[test]
fn set_then_get_round_trips_for_writable_fields() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = common::scratch_engine(&tmp);
    engine.create("/a").unwrap();

    let cases = [
        ("command", "/bin/sleep 60"),
        ("hostname", "box-1"),
        ("isolate", "false"),
        ("memory_limit", "1048576"),
        ("max_respawns", "-1"),
        ("env", "A=1; B=two"),
        ("net_limit", "default: 500; eth0: 1000"),
        ("ulimit", "nofile: 1024 2048"),
    ];
    for (key, value) in cases {
        engine.set_property("/a", key, value).unwrap();
        assert_eq!(engine.get_property("/a", key).unwrap(), value, "key {key}");
    }
}

#[test]
fn read_only_fields_reject_writes() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = common::scratch_engine(&tmp);
    engine.create("/a").unwrap();

    for key in ["state", "exit_status", "oom_killed", "respawn_count", "stdout"] {
        let err = engine.set_property("/a", key, "1").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidProperty, "key {key}");
    }
}

#[test]
fn invalid_values_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = common::scratch_engine(&tmp);
    engine.create("/a").unwrap();

    for (key, value) in [
        ("memory_limit", "a lot"),
        ("isolate", "maybe"),
        ("cpu_policy", "warp"),
        ("ulimit", "nofile"),
        ("sysctl", "kernel.shmmax"),
        ("cwd", "relative/path"),
        ("net_limit", "eth0"),
    ] {
        let err = engine.set_property("/a", key, value).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidValue, "key {key}");
    }
}

#[test]
fn hidden_fields_are_readable_but_unlisted() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = common::scratch_engine(&tmp);
    engine.create("/a").unwrap();
    engine.create("/a/b").unwrap();

    // readable by name
    assert_eq!(engine.get_data("/a/b", "parent", None).unwrap(), "/a");
    // absent from enumeration
    assert!(engine
        .registry
        .list(FieldClass::Data)
        .all(|field| field.key != "parent"));
}

#[test]
fn unsupported_fields_report_not_supported() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = common::scratch_engine(&tmp);
    engine.create("/a").unwrap();

    // the scratch memory hierarchy has no total_max_rss, so the probe
    // marks max_rss unsupported at engine construction
    assert!(engine
        .registry
        .get("max_rss")
        .unwrap()
        .flags
        .has(FieldFlags::UNSUPPORTED));
    let err = engine.get_data("/a", "max_rss", None).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotSupported);
}

#[test]
fn persistent_fields_survive_a_daemon_restart() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let engine = common::scratch_engine(&tmp);
        engine.create("/a").unwrap();
        engine.set_property("/a", "command", "/bin/true").unwrap();
        engine.set_property("/a", "memory_limit", "2097152").unwrap();
        engine.set_property("/a", "hostname", "survivor").unwrap();
    }
    let engine = common::scratch_engine(&tmp);
    engine.restore().unwrap();
    assert_eq!(engine.get_property("/a", "command").unwrap(), "/bin/true");
    assert_eq!(engine.get_property("/a", "memory_limit").unwrap(), "2097152");
    assert_eq!(engine.get_property("/a", "hostname").unwrap(), "survivor");
}

#[test]
fn postmortem_data_survives_dead_but_not_stopped() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = common::scratch_engine(&tmp);
    engine.create("/a").unwrap();

    let ct = engine.container("/a").unwrap();
    {
        let mut inner = ct.lock();
        inner.set_state(ContainerState::Running);
        inner.wait_pid = 999_999;
    }
    engine.stats.running.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    // death records the exit status, visible while Dead
    engine.exit_notification(999_999, 7 << 8);
    assert_eq!(engine.get_data("/a", "state", None).unwrap(), "dead");
    assert_eq!(engine.get_data("/a", "exit_status", None).unwrap(), "7");

    // postmortem values survive a restart while the container is Dead
    {
        let engine2 = common::scratch_engine(&tmp);
        engine2.restore().unwrap();
        assert_eq!(engine2.get_data("/a", "exit_status", None).unwrap(), "7");
        assert_eq!(engine2.get_data("/a", "state", None).unwrap(), "dead");
    }

    // returning to Stopped clears them
    engine.stop("/a", std::time::Duration::from_millis(200)).unwrap();
    assert_eq!(engine.get_data("/a", "exit_status", None).unwrap(), "0");
    assert_eq!(engine.get_data("/a", "oom_killed", None).unwrap(), "false");
}

#[test]
fn indexed_stream_reads_use_offsets() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = common::scratch_engine(&tmp);
    engine.create("/a").unwrap();

    let log = tmp.path().join("stdout.log");
    std::fs::write(&log, "hello\nworld\n").unwrap();
    engine.container("/a").unwrap().lock().stdout_path = Some(log);

    assert_eq!(engine.get_data("/a", "stdout", None).unwrap(), "hello\nworld\n");
    assert_eq!(
        engine.get_data("/a", "stdout", Some("6")).unwrap(),
        "world\n"
    );
    let err = engine.get_data("/a", "stdout", Some("six")).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidValue);
}
