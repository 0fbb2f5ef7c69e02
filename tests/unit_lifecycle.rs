//! Container tree and state machine behavior, no privileges required.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use crated::core::container::ContainerState;
use crated::ErrorKind;

#[test]
fn tree_guards_parent_child_lifecycle() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = common::scratch_engine(&tmp);

    engine.create("/a").unwrap();
    engine.create("/a/b").unwrap();

    // a child cannot be created under a missing parent
    let err = engine.create("/x/y").unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);

    // a child cannot start while its parent is stopped
    let err = engine.start("/a/b").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Busy);
}

#[test]
fn start_on_running_container_is_busy() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = common::scratch_engine(&tmp);
    engine.create("/a").unwrap();
    engine
        .container("/a")
        .unwrap()
        .lock()
        .set_state(ContainerState::Running);
    let err = engine.start("/a").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Busy);
}

#[test]
fn group_containers_run_as_meta() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = common::scratch_engine(&tmp);
    engine.create("/group").unwrap();
    engine.set_property("/group", "isolate", "false").unwrap();
    engine.start("/group").unwrap();
    assert_eq!(engine.get_data("/group", "state", None).unwrap(), "meta");

    // children of a live meta group may start
    engine.create("/group/leaf").unwrap();
    engine.set_property("/group/leaf", "isolate", "false").unwrap();
    engine.start("/group/leaf").unwrap();
    assert_eq!(engine.get_data("/group/leaf", "state", None).unwrap(), "meta");

    // stop is depth-first: both end Stopped, the child never outlives
    engine.stop("/group", Duration::from_millis(200)).unwrap();
    assert_eq!(engine.get_data("/group", "state", None).unwrap(), "stopped");
    assert_eq!(
        engine.get_data("/group/leaf", "state", None).unwrap(),
        "stopped"
    );
}

#[test]
fn exit_notification_finishes_the_lifecycle() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = common::scratch_engine(&tmp);
    engine.create("/a").unwrap();
    let ct = engine.container("/a").unwrap();
    {
        let mut inner = ct.lock();
        inner.set_state(ContainerState::Running);
        inner.wait_pid = 777;
        inner.task_pid = 777;
    }
    engine.stats.running.fetch_add(1, Ordering::Relaxed);

    assert!(engine.exit_notification(777, 0).is_none());
    assert_eq!(engine.get_data("/a", "state", None).unwrap(), "dead");
    assert_eq!(engine.get_data("/a", "exit_status", None).unwrap(), "0");
    assert_eq!(engine.get_data("/a", "oom_killed", None).unwrap(), "false");
    assert_eq!(engine.get_data("/a", "respawn_count", None).unwrap(), "0");
    // pids are cleared in Dead
    assert_eq!(engine.get_data("/a", "task_pid", None).unwrap(), "0");

    // an unknown pid is nobody's business
    assert!(engine.exit_notification(42_424, 0).is_none());
}

#[test]
fn wait_returns_when_container_dies() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = common::scratch_engine(&tmp);
    engine.create("/a").unwrap();
    let ct = engine.container("/a").unwrap();
    {
        let mut inner = ct.lock();
        inner.set_state(ContainerState::Running);
        inner.wait_pid = 888;
    }
    engine.stats.running.fetch_add(1, Ordering::Relaxed);

    let waiter = {
        let engine = engine.clone();
        std::thread::spawn(move || engine.wait_death("/a", Duration::from_secs(5)))
    };
    std::thread::sleep(Duration::from_millis(50));
    engine.exit_notification(888, 0);
    let state = waiter.join().unwrap().unwrap();
    assert_eq!(state, ContainerState::Dead);
}

#[test]
fn destroy_takes_the_subtree() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = common::scratch_engine(&tmp);
    engine.create("/a").unwrap();
    engine.create("/a/b").unwrap();
    engine.create("/a/b/c").unwrap();

    engine.destroy("/a").unwrap();
    for name in ["/a", "/a/b", "/a/b/c"] {
        assert_eq!(engine.container(name).unwrap_err().kind, ErrorKind::NotFound);
    }

    let err = engine.destroy("/").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Permission);
}

#[test]
fn pause_requires_running() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = common::scratch_engine(&tmp);
    engine.create("/a").unwrap();
    let err = engine.pause("/a").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Busy);
    let err = engine.resume("/a").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Busy);
}
