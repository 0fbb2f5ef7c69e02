//! End-to-end smoke tests against the real daemon binary.
//!
//! Requirements:
//! 1. Linux, running as root.
//! 2. cgroup-v1 controller hierarchies mounted (at least freezer and
//!    memory under /sys/fs/cgroup/<controller>).
//!
//! Anything missing skips the test instead of failing it, the same
//! convention CI uses for privileged suites. Container names carry a
//! random suffix because the host cgroup tree outlives test runs.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::{Child, Command};
use std::time::Duration;

use rand::Rng;

fn can_run() -> bool {
    if cfg!(not(target_os = "linux")) {
        eprintln!("SKIP: not on Linux");
        return false;
    }
    if !nix::unistd::geteuid().is_root() {
        eprintln!("SKIP: not running as root (euid != 0)");
        return false;
    }
    for controller in ["freezer", "memory"] {
        if !Path::new("/sys/fs/cgroup").join(controller).is_dir() {
            eprintln!("SKIP: cgroup v1 controller {controller} is not mounted");
            return false;
        }
    }
    true
}

fn unique_name(prefix: &str) -> String {
    format!("/{prefix}-{:08x}", rand::thread_rng().gen::<u32>())
}

struct DaemonGuard {
    child: Child,
    socket: std::path::PathBuf,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn spawn_daemon(tmp: &tempfile::TempDir) -> DaemonGuard {
    let socket = tmp.path().join("crated.sock");
    let config = tmp.path().join("crated.conf");
    std::fs::write(
        &config,
        format!(
            r#"{{
                "daemon": {{
                    "socket_path": "{}",
                    "state_dir": "{}",
                    "log_level": "debug"
                }},
                "container": {{ "start_timeout_ms": 10000 }}
            }}"#,
            socket.display(),
            tmp.path().join("state").display(),
        ),
    )
    .unwrap();

    let child = Command::new(env!("CARGO_BIN_EXE_crated"))
        .arg("--config")
        .arg(&config)
        .spawn()
        .expect("failed to spawn crated");

    // wait for the socket to appear
    for _ in 0..100 {
        if socket.exists() {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(socket.exists(), "daemon did not come up");
    DaemonGuard { child, socket }
}

fn rpc(daemon: &DaemonGuard, request: &str) -> serde_json::Value {
    let stream = UnixStream::connect(&daemon.socket).unwrap();
    let mut writer = stream.try_clone().unwrap();
    writer.write_all(request.as_bytes()).unwrap();
    writer.write_all(b"\n").unwrap();
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    serde_json::from_str(&line).unwrap()
}

fn assert_ok(resp: &serde_json::Value) {
    assert_eq!(resp["error"], "success", "unexpected error: {resp}");
}

fn set_prop(daemon: &DaemonGuard, name: &str, key: &str, value: &str) {
    assert_ok(&rpc(
        daemon,
        &format!(
            r#"{{"req":"set_property","name":"{name}","key":"{key}","value":"{value}"}}"#
        ),
    ));
}

fn get_data(daemon: &DaemonGuard, name: &str, key: &str) -> serde_json::Value {
    rpc(
        daemon,
        &format!(r#"{{"req":"get_data","name":"{name}","key":"{key}"}}"#),
    )
}

#[test]
fn run_true_and_observe_exit() {
    if !can_run() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let daemon = spawn_daemon(&tmp);
    let name = unique_name("smoke");

    assert_ok(&rpc(&daemon, &format!(r#"{{"req":"create","name":"{name}"}}"#)));
    set_prop(&daemon, &name, "isolate", "false");
    set_prop(&daemon, &name, "command", "/bin/true");
    assert_ok(&rpc(&daemon, &format!(r#"{{"req":"start","name":"{name}"}}"#)));

    let resp = rpc(
        &daemon,
        &format!(r#"{{"req":"wait","name":"{name}","timeout_ms":10000}}"#),
    );
    assert_ok(&resp);

    assert_eq!(get_data(&daemon, &name, "exit_status")["payload"], "0");
    assert_eq!(get_data(&daemon, &name, "oom_killed")["payload"], "false");
    assert_eq!(get_data(&daemon, &name, "respawn_count")["payload"], "0");

    assert_ok(&rpc(&daemon, &format!(r#"{{"req":"destroy","name":"{name}"}}"#)));
}

#[test]
fn exit_status_is_captured() {
    if !can_run() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let daemon = spawn_daemon(&tmp);
    let name = unique_name("rc");

    assert_ok(&rpc(&daemon, &format!(r#"{{"req":"create","name":"{name}"}}"#)));
    set_prop(&daemon, &name, "isolate", "false");
    set_prop(&daemon, &name, "command", "/bin/false");
    assert_ok(&rpc(&daemon, &format!(r#"{{"req":"start","name":"{name}"}}"#)));
    assert_ok(&rpc(
        &daemon,
        &format!(r#"{{"req":"wait","name":"{name}","timeout_ms":10000}}"#),
    ));

    assert_eq!(get_data(&daemon, &name, "exit_status")["payload"], "1");
    assert_ok(&rpc(&daemon, &format!(r#"{{"req":"destroy","name":"{name}"}}"#)));
}

#[test]
fn stdout_is_captured() {
    if !can_run() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let daemon = spawn_daemon(&tmp);
    let name = unique_name("echo");

    assert_ok(&rpc(&daemon, &format!(r#"{{"req":"create","name":"{name}"}}"#)));
    set_prop(&daemon, &name, "isolate", "false");
    set_prop(&daemon, &name, "command", "/bin/echo hello");
    assert_ok(&rpc(&daemon, &format!(r#"{{"req":"start","name":"{name}"}}"#)));
    assert_ok(&rpc(
        &daemon,
        &format!(r#"{{"req":"wait","name":"{name}","timeout_ms":10000}}"#),
    ));

    assert_eq!(get_data(&daemon, &name, "stdout")["payload"], "hello\n");
    assert_ok(&rpc(&daemon, &format!(r#"{{"req":"destroy","name":"{name}"}}"#)));
}

#[test]
fn start_timeout_ends_dead() {
    if !can_run() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let daemon = spawn_daemon(&tmp);
    let name = unique_name("slow");

    assert_ok(&rpc(&daemon, &format!(r#"{{"req":"create","name":"{name}"}}"#)));
    set_prop(&daemon, &name, "isolate", "false");
    set_prop(&daemon, &name, "start_timeout_ms", "1");
    set_prop(&daemon, &name, "command", "/bin/sleep 10");

    let resp = rpc(&daemon, &format!(r#"{{"req":"start","name":"{name}"}}"#));
    assert_eq!(resp["error"], "timeout", "start should time out: {resp}");
    assert_eq!(get_data(&daemon, &name, "state")["payload"], "dead");

    assert_ok(&rpc(&daemon, &format!(r#"{{"req":"destroy","name":"{name}"}}"#)));
}
