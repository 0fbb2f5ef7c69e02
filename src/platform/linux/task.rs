use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{error, warn};
use nix::sched::CloneFlags;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};

use crate::error::{Error, ErrorKind, Result};
use crate::platform::linux::caps::{self, CapabilityPlan};
use crate::platform::linux::cgroups::Cgroup;
use crate::platform::linux::handshake::{socket_pair, Handshake, HandshakeSock};
use crate::platform::linux::mounts::MountPlan;
use crate::platform::linux::net::wait_links_up;
use crate::platform::linux::stdio::{OpenStreams, TaskStdio};
use crate::util::proc::{self, CpuPolicy, IoPolicy, Ulimit};

/// Credentials the child assumes right before capability reduction.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
    pub login_uid: Option<u32>,
}

impl Credentials {
    pub fn root() -> Self {
        Self {
            uid: 0,
            gid: 0,
            groups: Vec::new(),
            login_uid: None,
        }
    }

    fn apply(&self) -> Result<()> {
        let groups: Vec<unistd::Gid> = self.groups.iter().map(|g| unistd::Gid::from_raw(*g)).collect();
        unistd::setgroups(&groups).map_err(|e| Error::from(e).at_stage("setgroups"))?;
        let gid = unistd::Gid::from_raw(self.gid);
        unistd::setresgid(gid, gid, gid).map_err(|e| Error::from(e).at_stage("setgid"))?;
        let uid = unistd::Uid::from_raw(self.uid);
        unistd::setresuid(uid, uid, uid).map_err(|e| Error::from(e).at_stage("setuid"))?;
        Ok(())
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// Open namespace and directory fds of the container this task joins.
/// Empty for a task that creates everything fresh.
#[derive(Debug, Default)]
pub struct NamespaceFds {
    pub ipc: Option<File>,
    pub uts: Option<File>,
    pub net: Option<File>,
    pub pid: Option<File>,
    pub mnt: Option<File>,
    pub root: Option<File>,
    pub cwd: Option<File>,
}

impl NamespaceFds {
    /// Open the namespaces of a live process, plus its root and cwd.
    pub fn open(pid: i32) -> Result<Self> {
        let open = |what: &str| -> Result<File> {
            File::open(format!("/proc/{pid}/{what}"))
                .map_err(|e| Error::from(e).at_stage(&format!("open {what} of {pid}")))
        };
        Ok(Self {
            ipc: Some(open("ns/ipc")?),
            uts: Some(open("ns/uts")?),
            net: Some(open("ns/net")?),
            pid: Some(open("ns/pid")?),
            mnt: Some(open("ns/mnt")?),
            root: Some(open("root")?),
            cwd: Some(open("cwd")?),
        })
    }

    pub fn enters_pid_ns(&self) -> bool {
        self.pid.is_some()
    }
}

/// Everything the launcher needs, snapshotted from the container's
/// properties before any fork. Lives only for the duration of Start.
pub struct TaskEnv {
    pub container_name: String,
    pub container_id: u32,
    /// Empty means a meta container; the helper init becomes the task.
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub cwd: PathBuf,
    pub hostname: String,
    pub isolate: bool,
    pub net_isolate: bool,
    pub new_mount_ns: bool,
    pub mount_plan: MountPlan,
    pub stdio: TaskStdio,
    pub cred: Credentials,
    pub caps: CapabilityPlan,
    pub ulimits: Vec<Ulimit>,
    /// Per-container sysctls, family-checked in the child.
    pub sysctl: Vec<(String, String)>,
    /// Host IPC defaults applied when ipc isolation is on.
    pub ipc_sysctl: Vec<(String, String)>,
    pub resolv_conf: Option<String>,
    pub etc_hosts: Option<String>,
    pub umask: u32,
    pub oom_score_adj: i32,
    pub nice: i32,
    pub cpu_policy: CpuPolicy,
    pub cpu_priority: u32,
    pub io_policy: IoPolicy,
    pub io_priority: u32,
    pub cgroups: Vec<Cgroup>,
    pub namespaces: NamespaceFds,
    /// Re-home the task under the helper init inside the namespace.
    pub quadro_fork: bool,
    /// Open fd of the crateinit binary, for fexecve.
    pub helper_init: Option<RawFd>,
    pub autoconf_links: Vec<String>,
    pub autoconf_timeout_s: u64,
    pub start_timeout_ms: u64,
}

impl TaskEnv {
    pub fn is_meta(&self) -> bool {
        self.command.is_empty()
    }

    /// Entering a pre-existing pid namespace needs the triple-fork path.
    fn triple_fork(&self) -> bool {
        self.namespaces.enters_pid_ns()
    }

    fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.isolate {
            flags |= CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWIPC;
        }
        if self.new_mount_ns {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.isolate || !self.hostname.is_empty() {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        if self.net_isolate && self.namespaces.net.is_none() {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        flags
    }
}

/// Pids reported back by a successful handshake.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskPids {
    pub wait_pid: i32,
    pub task_pid: i32,
    pub task_vpid: i32,
    pub seize_pid: i32,
}

/// Child-side protocol accounting. The child owes the parent exactly two
/// pid messages before the error frame; Abort pads whatever was not sent.
struct Reporter<'a> {
    sock: &'a HandshakeSock,
    pids_sent: u8,
}

impl<'a> Reporter<'a> {
    fn new(sock: &'a HandshakeSock) -> Self {
        Self { sock, pids_sent: 0 }
    }

    fn report_pid(&mut self, pid: i32) {
        if let Err(e) = self.sock.send_pid(pid) {
            error!("cannot report pid: {e}");
            self.abort(e);
        }
        self.pids_sent += 1;
    }

    fn skip_report(&mut self) {
        self.pids_sent += 1;
    }

    fn abort(&mut self, err: Error) -> ! {
        let own = unsafe { libc::getpid() };
        while self.pids_sent < 2 {
            let _ = self.sock.send_pid(own);
            self.pids_sent += 1;
        }
        let _ = self.sock.send_error(&err);
        unsafe { libc::_exit(libc::EXIT_FAILURE) }
    }
}

fn die_with_parent() {
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
    }
}

fn unblock_signals() {
    use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow};
    let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);
}

fn reset_ignored_signals() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        libc::signal(libc::SIGCHLD, libc::SIG_DFL);
    }
    unblock_signals();
}

fn exec_args(command: &[String]) -> Result<(CString, Vec<CString>)> {
    let filename = CString::new(command[0].as_bytes())
        .map_err(|_| Error::new(ErrorKind::InvalidCommand, "command contains NUL"))?;
    let argv = command
        .iter()
        .map(|a| CString::new(a.as_bytes()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| Error::new(ErrorKind::InvalidCommand, "argument contains NUL"))?;
    Ok((filename, argv))
}

fn env_cstrings(env: &[String]) -> Vec<CString> {
    env.iter()
        .filter_map(|e| CString::new(e.as_bytes()).ok())
        .collect()
}

/// fexecve the helper init; only returns on failure.
fn exec_helper_init(fd: RawFd, container: &str, wait_pid: Option<i32>, env: &[String]) -> Error {
    let mut args = vec![
        CString::new("crateinit").unwrap(),
        CString::new("--container").unwrap(),
        CString::new(container).unwrap_or_else(|_| CString::new("?").unwrap()),
    ];
    if let Some(pid) = wait_pid {
        args.push(CString::new("--wait").unwrap());
        args.push(CString::new(pid.to_string()).unwrap());
    }
    let argv: Vec<*const libc::c_char> = args
        .iter()
        .map(|a| a.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    let envp_strings = env_cstrings(env);
    let envp: Vec<*const libc::c_char> = envp_strings
        .iter()
        .map(|e| e.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    unsafe {
        libc::fexecve(fd, argv.as_ptr(), envp.as_ptr());
    }
    Error::system("cannot exec helper init")
}

pub fn start(env: &TaskEnv, cancel: &AtomicBool) -> Result<TaskPids> {
    let (master, sock) = socket_pair()?;

    let intermediate = match unsafe { unistd::fork() }
        .map_err(|e| Error::from(e).at_stage("handshake"))?
    {
        ForkResult::Parent { child } => child,
        ForkResult::Child => {
            drop(master);
            run_intermediate(env, &sock);
        }
    };

    drop(sock);
    run_parent(env, master, intermediate, cancel)
}

// ─── parent ─────────────────────────────────────────────────────────────────

fn kill_and_reap(pid: Pid) {
    let _ = kill(pid, Signal::SIGKILL);
    let _ = waitpid(pid, None);
}

fn run_parent(
    env: &TaskEnv,
    master: HandshakeSock,
    intermediate: Pid,
    cancel: &AtomicBool,
) -> Result<TaskPids> {
    master.set_recv_timeout(env.start_timeout_ms)?;
    let mut hs = Handshake::new(&master);
    let mut pids = TaskPids::default();
    let mut reaped = false;

    let result = (|| -> Result<Option<Error>> {
        let check_cancel = |hs_pid: i32| -> Result<()> {
            if cancel.load(Ordering::SeqCst) {
                if hs_pid != 0 {
                    let _ = kill(Pid::from_raw(hs_pid), Signal::SIGKILL);
                }
                return Err(Error::new(
                    ErrorKind::Aborted,
                    "start cancelled by stop request",
                ));
            }
            Ok(())
        };

        check_cancel(0)?;
        let (wait_pid, vpid) = hs.recv_wpid().map_err(|e| e.at_stage("handshake"))?;
        pids.wait_pid = wait_pid;
        pids.task_vpid = vpid;
        check_cancel(wait_pid)?;

        let (task_pid, task_vpid) = hs.recv_vpid().map_err(|e| e.at_stage("handshake"))?;
        pids.task_pid = task_pid;
        pids.task_vpid = task_vpid;
        if env.triple_fork() {
            pids.seize_pid = pids.wait_pid;
        }
        check_cancel(wait_pid)?;

        // the intermediate is done once the task exists; reap it before the
        // final wakeup so its exit status cannot race the error frame
        let wait_err = match waitpid(intermediate, None) {
            Ok(WaitStatus::Exited(_, 0)) => None,
            // the daemon's reaper may have collected it already
            Err(nix::errno::Errno::ECHILD) => None,
            Ok(status) => Some(Error::new(
                ErrorKind::Unknown,
                format!("intermediate task failed: {status:?}"),
            )),
            Err(e) => Some(Error::from(e).at_stage("handshake")),
        };
        reaped = true;

        let reported = hs.finish().map_err(|e| e.at_stage("handshake"))?;
        // a reported error wins over the intermediate's exit status
        Ok(reported.or(wait_err))
    })();

    match result {
        Ok(None) => Ok(pids),
        Ok(Some(err)) => {
            if !reaped {
                kill_and_reap(intermediate);
            }
            if pids.wait_pid != 0 {
                let _ = kill(Pid::from_raw(pids.wait_pid), Signal::SIGKILL);
            }
            Err(err)
        }
        Err(err) => {
            if !reaped {
                kill_and_reap(intermediate);
            } else if pids.wait_pid != 0 {
                let _ = kill(Pid::from_raw(pids.wait_pid), Signal::SIGKILL);
            }
            Err(err)
        }
    }
}

// ─── intermediate ───────────────────────────────────────────────────────────

fn run_intermediate(env: &TaskEnv, sock: &HandshakeSock) -> ! {
    let mut reporter = Reporter::new(sock);

    unblock_signals();
    die_with_parent();
    let _ = unistd::setsid();

    // join the target cgroups before any clone so the task inherits them
    let own_pid = unsafe { libc::getpid() };
    for cg in &env.cgroups {
        if let Err(e) = cg.attach(own_pid) {
            reporter.abort(e.at_stage("config"));
        }
    }

    if let Err(e) = proc::set_oom_score_adj(env.oom_score_adj) {
        if env.oom_score_adj != 0 {
            reporter.abort(e.at_stage("config"));
        }
    }
    if let Err(e) = proc::apply_nice(env.nice) {
        reporter.abort(e.at_stage("config"));
    }
    if let Err(e) = proc::apply_scheduler(env.cpu_policy, env.cpu_priority) {
        reporter.abort(e.at_stage("config"));
    }
    if let Err(e) = proc::apply_io_priority(env.io_policy, env.io_priority) {
        reporter.abort(e.at_stage("config"));
    }

    // streams living outside the container must open before setns
    let streams = match env.stdio.open_outside() {
        Ok(s) => s,
        Err(e) => reporter.abort(e.at_stage("config")),
    };

    if let Err(e) = enter_namespaces(env) {
        reporter.abort(e.at_stage("setns"));
    }

    let triple = env.triple_fork();
    let mut inner_master: Option<HandshakeSock> = None;
    let mut inner_sock: Option<HandshakeSock> = None;

    if triple {
        // the transient child re-parents to the daemon when we exit here,
        // and becomes the wait task
        match unsafe { unistd::fork() } {
            Ok(ForkResult::Parent { .. }) => unsafe { libc::_exit(libc::EXIT_SUCCESS) },
            Ok(ForkResult::Child) => {}
            Err(e) => reporter.abort(Error::from(e).at_stage("handshake")),
        }
        match socket_pair() {
            Ok((m, s)) => {
                inner_master = Some(m);
                inner_sock = Some(s);
            }
            Err(e) => reporter.abort(e.at_stage("handshake")),
        }
        reporter.report_pid(unsafe { libc::getpid() });
    }

    let flags = env.clone_flags();
    let mut stack = vec![0u8; 64 * 1024];
    let child_sock = inner_sock.as_ref();
    let clone_result = unsafe {
        nix::sched::clone(
            Box::new(|| -> isize { run_child(env, sock, child_sock, streams, triple) }),
            &mut stack,
            flags,
            Some(libc::SIGCHLD),
        )
    };
    let clone_pid = match clone_result {
        Ok(pid) => pid,
        Err(e) => {
            let kind = if e == nix::errno::Errno::ENOMEM {
                ErrorKind::ResourceNotAvailable
            } else {
                ErrorKind::Unknown
            };
            reporter.abort(Error::from(e).reclassify(kind).at_stage("handshake"));
        }
    };

    if !triple {
        unsafe { libc::_exit(libc::EXIT_SUCCESS) }
    }

    // transient: forward the task's pid, ack it, then become the helper init
    drop(inner_sock);
    let inner_master = inner_master.unwrap();
    let (task_pid, _task_vpid) = match inner_master.recv_pid() {
        Ok(pids) => pids,
        Err(e) => reporter.abort(e.at_stage("handshake")),
    };
    reporter.report_pid(task_pid);
    if let Err(e) = inner_master.send_zero() {
        reporter.abort(e.at_stage("handshake"));
    }
    drop(inner_master);

    let Some(helper_fd) = env.helper_init else {
        reporter.abort(Error::new(ErrorKind::NotFound, "helper init binary missing").at_stage("exec"));
    };
    if let Err(e) = caps::limit_to(&caps::helper_init_caps()) {
        reporter.abort(e.at_stage("exec"));
    }
    let err = exec_helper_init(
        helper_fd,
        &env.container_name,
        Some(clone_pid.as_raw()),
        &env.env,
    );
    let _ = kill(clone_pid, Signal::SIGKILL);
    reporter.abort(err.at_stage("exec"));
}

fn enter_namespaces(env: &TaskEnv) -> Result<()> {
    use nix::sched::setns;
    let ns = &env.namespaces;
    if let Some(fd) = &ns.ipc {
        setns(fd, CloneFlags::CLONE_NEWIPC).map_err(Error::from)?;
    }
    if let Some(fd) = &ns.uts {
        setns(fd, CloneFlags::CLONE_NEWUTS).map_err(Error::from)?;
    }
    if let Some(fd) = &ns.net {
        setns(fd, CloneFlags::CLONE_NEWNET).map_err(Error::from)?;
    }
    if let Some(fd) = &ns.pid {
        setns(fd, CloneFlags::CLONE_NEWPID).map_err(Error::from)?;
    }
    if let Some(fd) = &ns.mnt {
        setns(fd, CloneFlags::CLONE_NEWNS).map_err(Error::from)?;
    }
    if let Some(fd) = &ns.root {
        if unsafe { libc::fchdir(fd.as_raw_fd()) } < 0 {
            return Err(Error::system("fchdir(root)"));
        }
        unistd::chroot(".").map_err(Error::from)?;
    }
    if let Some(fd) = &ns.cwd {
        if unsafe { libc::fchdir(fd.as_raw_fd()) } < 0 {
            return Err(Error::system("fchdir(cwd)"));
        }
    }
    Ok(())
}

// ─── child ──────────────────────────────────────────────────────────────────

fn run_child(
    env: &TaskEnv,
    sock: &HandshakeSock,
    inner_sock: Option<&HandshakeSock>,
    streams: OpenStreams,
    triple: bool,
) -> ! {
    let mut reporter = Reporter::new(sock);

    if triple {
        // the transient already reported WPid on this socket
        reporter.skip_report();
        die_with_parent();
    } else {
        reporter.report_pid(unsafe { libc::getpid() });
    }

    if let Err(e) = sock.recv_zero() {
        reporter.abort(e.at_stage("handshake"));
    }

    if let Err(e) = configure_child(env, &mut reporter, inner_sock, streams) {
        reporter.abort(e);
    }

    if let Err(e) = sock.recv_zero() {
        reporter.abort(e.at_stage("handshake"));
    }

    reset_ignored_signals();

    if !env.autoconf_links.is_empty() {
        if let Err(e) = wait_links_up(
            &env.autoconf_links,
            Duration::from_secs(env.autoconf_timeout_s),
        ) {
            reporter.abort(e.at_stage("config"));
        }
    }

    let err = child_exec(env);
    reporter.abort(err);
}

fn configure_child(
    env: &TaskEnv,
    reporter: &mut Reporter<'_>,
    inner_sock: Option<&HandshakeSock>,
    streams: OpenStreams,
) -> Result<()> {
    proc::apply_ulimits(&env.ulimits).map_err(|e| e.at_stage("config"))?;

    unistd::setsid().map_err(|e| Error::from(e).at_stage("config"))?;
    unsafe { libc::umask(0) };

    if env.new_mount_ns {
        env.mount_plan.setup().map_err(|e| e.at_stage("mount"))?;
    }

    apply_sysctls(env).map_err(|e| e.at_stage("config"))?;

    if let Some(resolv) = &env.resolv_conf {
        crate::platform::linux::mounts::write_private(
            std::path::Path::new("/etc/resolv.conf"),
            resolv,
        )
        .map_err(|e| e.at_stage("config"))?;
    }
    if let Some(hosts) = &env.etc_hosts {
        crate::platform::linux::mounts::write_private(std::path::Path::new("/etc/hosts"), hosts)
            .map_err(|e| e.at_stage("config"))?;
    }

    if !env.hostname.is_empty() {
        let _ = std::fs::write("/etc/hostname", format!("{}\n", env.hostname));
        unistd::sethostname(&env.hostname).map_err(|e| Error::from(e).at_stage("config"))?;
    }

    unistd::chdir(&env.cwd).map_err(|e| Error::from(e).at_stage("config"))?;

    if env.quadro_fork {
        quadro_fork_rehome(env)?;
    }

    // report VPid; in the triple-fork path the transient forwards it
    if let Some(inner) = inner_sock {
        inner
            .send_pid(unsafe { libc::getpid() })
            .map_err(|e| e.at_stage("handshake"))?;
        inner.recv_zero().map_err(|e| e.at_stage("handshake"))?;
        reporter.skip_report();
    } else {
        reporter.report_pid(unsafe { libc::getpid() });
    }

    if let Some(uid) = env.cred.login_uid {
        if let Err(e) = proc::set_loginuid(uid) {
            if e.errno != Some(libc::ENOENT) {
                warn!("cannot set loginuid: {e}");
            }
        }
    }

    env.cred.apply().map_err(|e| e.at_stage("config"))?;
    env.caps
        .apply(env.cred.is_root())
        .map_err(|e| e.at_stage("config"))?;

    env.stdio
        .apply_inside(streams)
        .map_err(|e| e.at_stage("config"))?;

    unsafe { libc::umask(env.umask as libc::mode_t) };
    Ok(())
}

fn apply_sysctls(env: &TaskEnv) -> Result<()> {
    if env.isolate {
        for (key, val) in &env.ipc_sysctl {
            proc::set_sysctl(key, val)?;
        }
    }
    for (key, val) in &env.sysctl {
        if proc::is_net_sysctl(key) {
            if !env.net_isolate {
                return Err(Error::new(
                    ErrorKind::Permission,
                    format!("sysctl {key} requires net isolation"),
                ));
            }
            // applied in the isolated net namespace
        } else if proc::is_ipc_sysctl(key) {
            if !env.isolate {
                return Err(Error::new(
                    ErrorKind::Permission,
                    format!("sysctl {key} requires ipc isolation"),
                ));
            }
        } else {
            return Err(Error::new(
                ErrorKind::Permission,
                format!("sysctl {key} is not allowed"),
            ));
        }
        proc::set_sysctl(key, val)?;
    }
    Ok(())
}

/// Re-home the task under the helper init: the current process execs
/// crateinit waiting on a fresh fork, which continues as the task.
fn quadro_fork_rehome(env: &TaskEnv) -> Result<()> {
    match unsafe { unistd::fork() }.map_err(|e| Error::from(e).at_stage("handshake"))? {
        ForkResult::Parent { child } => {
            let Some(helper_fd) = env.helper_init else {
                return Err(Error::new(ErrorKind::NotFound, "helper init binary missing")
                    .at_stage("exec"));
            };
            caps::limit_to(&caps::helper_init_caps()).map_err(|e| e.at_stage("exec"))?;
            let err = exec_helper_init(
                helper_fd,
                &env.container_name,
                Some(child.as_raw()),
                &env.env,
            );
            Err(err.at_stage("exec"))
        }
        ForkResult::Child => {
            unistd::setsid().map_err(|e| Error::from(e).at_stage("config"))?;
            Ok(())
        }
    }
}

fn child_exec(env: &TaskEnv) -> Error {
    if env.is_meta() {
        let Some(helper_fd) = env.helper_init else {
            return Error::new(ErrorKind::NotFound, "helper init binary missing").at_stage("exec");
        };
        return exec_helper_init(helper_fd, &env.container_name, None, &env.env).at_stage("exec");
    }

    let (filename, argv) = match exec_args(&env.command) {
        Ok(v) => v,
        Err(e) => return e.at_stage("exec"),
    };
    let envp = env_cstrings(&env.env);
    let err = unistd::execvpe(&filename, &argv, &envp).unwrap_err();
    if err == nix::errno::Errno::EAGAIN {
        return Error::from(err)
            .reclassify(ErrorKind::ResourceNotAvailable)
            .at_stage("exec");
    }
    Error::from(err)
        .reclassify(ErrorKind::InvalidCommand)
        .at_stage("exec")
}
