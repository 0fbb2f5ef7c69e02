use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info, warn};
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::core::engine::Engine;
use crate::core::stats::Statistics;
use crate::error::{Error, ErrorKind, Result};
use crate::rpc::{self, Request, Response};

/// Delay before an automated restart, so a crash-looping task cannot spin
/// the daemon.
const RESPAWN_DELAY: Duration = Duration::from_secs(1);
/// Bound on the exit-status queue between the reaper and respawn side.
const EVENT_QUEUE_DEPTH: usize = 256;

pub struct Daemon {
    engine: Arc<Engine>,
}

impl Daemon {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Run the daemon: restore state, start the reaper and worker threads,
    /// then serve the listener until it fails.
    pub fn run(&self) -> Result<()> {
        // orphaned launcher processes must re-parent to us, not to init
        unsafe {
            libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1);
            // a handshake peer that aborted mid-protocol must surface as
            // EPIPE, not kill the daemon; children reset this before exec
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }

        // SIGCHLD is consumed through a signalfd on the reaper thread;
        // block it before any thread exists so every thread inherits that
        let mut sigset = SigSet::empty();
        sigset.add(Signal::SIGCHLD);
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&sigset), None).map_err(Error::from)?;

        self.engine.restore()?;

        let (respawn_tx, respawn_rx) = mpsc::sync_channel::<String>(EVENT_QUEUE_DEPTH);
        self.spawn_reaper(sigset, respawn_tx)?;
        self.spawn_respawner(respawn_rx);

        let listener = self.bind_listener()?;
        let (conn_tx, conn_rx) = mpsc::channel::<UnixStream>();
        let conn_rx = Arc::new(Mutex::new(conn_rx));
        for n in 0..self.engine.config.daemon.workers.max(1) {
            let engine = self.engine.clone();
            let conn_rx = conn_rx.clone();
            std::thread::Builder::new()
                .name(format!("worker-{n}"))
                .spawn(move || loop {
                    let stream = {
                        let rx = conn_rx.lock().expect("connection queue poisoned");
                        rx.recv()
                    };
                    match stream {
                        Ok(stream) => serve_connection(&engine, stream),
                        Err(_) => return,
                    }
                })
                .map_err(Error::from)?;
        }

        info!(
            "crated {} listening on {}",
            rpc::RPC_VERSION,
            self.engine.config.daemon.socket_path.display()
        );
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    if conn_tx.send(stream).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("accept failed: {e}");
                    Statistics::bump(&self.engine.stats.errors);
                }
            }
        }
        Ok(())
    }

    fn bind_listener(&self) -> Result<UnixListener> {
        let path = &self.engine.config.daemon.socket_path;
        if path.exists() {
            std::fs::remove_file(path).map_err(|e| {
                Error::new(
                    ErrorKind::Filesystem,
                    format!("cannot remove stale socket {}: {e}", path.display()),
                )
            })?;
        }
        if let Some(parent) = path.parent() {
            crate::util::fs::ensure_dir(parent)?;
        }
        let listener = UnixListener::bind(path).map_err(|e| {
            Error::new(
                ErrorKind::Io,
                format!("cannot bind {}: {e}", path.display()),
            )
        })?;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660));
        Ok(listener)
    }

    /// Dedicated thread turning SIGCHLD into exit notifications.
    fn spawn_reaper(&self, sigset: SigSet, respawn_tx: mpsc::SyncSender<String>) -> Result<()> {
        let engine = self.engine.clone();
        let signal_fd =
            SignalFd::with_flags(&sigset, SfdFlags::SFD_CLOEXEC).map_err(Error::from)?;
        std::thread::Builder::new()
            .name("reaper".into())
            .spawn(move || {
                let mut signal_fd = signal_fd;
                loop {
                    match signal_fd.read_signal() {
                        Ok(Some(_)) | Ok(None) => {}
                        Err(e) => {
                            error!("signalfd read failed: {e}");
                            return;
                        }
                    }
                    reap_children(&engine, &respawn_tx);
                }
            })
            .map_err(Error::from)?;
        Ok(())
    }

    fn spawn_respawner(&self, respawn_rx: mpsc::Receiver<String>) {
        let engine = self.engine.clone();
        let _ = std::thread::Builder::new()
            .name("respawn".into())
            .spawn(move || {
                while let Ok(name) = respawn_rx.recv() {
                    std::thread::sleep(RESPAWN_DELAY);
                    match engine.respawn(&name) {
                        Ok(()) => info!("respawned container {name}"),
                        Err(e) => warn!("respawn of {name} failed: {e}"),
                    }
                }
            });
    }
}

/// Drain every pending exit status and hand them to the state machine.
fn reap_children(engine: &Arc<Engine>, respawn_tx: &mpsc::SyncSender<String>) {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                Statistics::bump(&engine.stats.queued_statuses);
                handle_exit(engine, respawn_tx, pid.as_raw(), (code & 0xff) << 8);
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                Statistics::bump(&engine.stats.queued_statuses);
                handle_exit(engine, respawn_tx, pid.as_raw(), signal as i32);
            }
            Ok(WaitStatus::StillAlive) => return,
            Ok(_) => continue,
            Err(nix::errno::Errno::ECHILD) => return,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                warn!("waitpid failed: {e}");
                return;
            }
        }
    }
}

fn handle_exit(
    engine: &Arc<Engine>,
    respawn_tx: &mpsc::SyncSender<String>,
    pid: i32,
    status: i32,
) {
    if let Some(name) = engine.exit_notification(pid, status) {
        Statistics::bump(&engine.stats.queued_events);
        if respawn_tx.try_send(name.clone()).is_err() {
            warn!("respawn queue is full, dropping restart of {name}");
        }
    }
}

/// Serve one client connection: newline-delimited JSON requests in,
/// responses out.
pub fn serve_connection(engine: &Arc<Engine>, stream: UnixStream) {
    let reader = match stream.try_clone() {
        Ok(s) => BufReader::new(s),
        Err(e) => {
            warn!("cannot clone client stream: {e}");
            return;
        }
    };
    let mut writer = stream;
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => return,
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => rpc::dispatch(engine, request),
            Err(e) => Response::from_error(&Error::new(
                ErrorKind::InvalidCommand,
                format!("bad request: {e}"),
            )),
        };
        let mut body = match serde_json::to_string(&response) {
            Ok(body) => body,
            Err(e) => {
                error!("cannot serialize response: {e}");
                return;
            }
        };
        body.push('\n');
        if writer.write_all(body.as_bytes()).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::store::Store;
    use crate::platform::linux::cgroups::CgroupDriver;
    use crate::platform::linux::net::tests_support::fake_network;
    use std::io::BufRead;

    fn test_engine() -> (tempfile::TempDir, Arc<Engine>) {
        let tmp = tempfile::tempdir().unwrap();
        let cgroups = CgroupDriver::scratch(&tmp.path().join("cgroup"), &["memory"]).unwrap();
        let store = Store::open(&tmp.path().join("state")).unwrap();
        let engine = Engine::with_parts(Config::default(), cgroups, fake_network(), Some(store));
        (tmp, engine)
    }

    #[test]
    fn connection_serves_json_lines() {
        let (_tmp, engine) = test_engine();
        let (client, server) = UnixStream::pair().unwrap();
        let server_engine = engine.clone();
        let handle = std::thread::spawn(move || serve_connection(&server_engine, server));

        let mut writer = client.try_clone().unwrap();
        writer
            .write_all(b"{\"req\":\"create\",\"name\":\"/a\"}\n{\"req\":\"list_containers\"}\nnot json\n")
            .unwrap();
        drop(writer);

        let mut reader = BufReader::new(client);
        let mut lines = Vec::new();
        for _ in 0..3 {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            lines.push(line);
        }
        drop(reader);

        let created: Response = serde_json::from_str(&lines[0]).unwrap();
        assert!(created.is_success());
        let listed: Response = serde_json::from_str(&lines[1]).unwrap();
        assert_eq!(
            listed.payload,
            crate::rpc::Payload::Names(vec!["/a".to_string()])
        );
        let bad: Response = serde_json::from_str(&lines[2]).unwrap();
        assert_eq!(bad.error, ErrorKind::InvalidCommand);

        handle.join().unwrap();
    }
}
