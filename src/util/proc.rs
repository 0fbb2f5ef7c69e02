use std::path::{Path, PathBuf};

use nix::sys::resource::{setrlimit, Resource};

use crate::error::{Error, ErrorKind, Result};
use crate::util::fs;

/// IPC sysctls that may be set inside an isolated container. Anything else
/// outside the `net.` family is rejected.
pub const IPC_SYSCTLS: &[&str] = &[
    "fs.mqueue.queues_max",
    "fs.mqueue.msg_max",
    "fs.mqueue.msgsize_max",
    "fs.mqueue.msg_default",
    "fs.mqueue.msgsize_default",
    "kernel.shmmax",
    "kernel.shmall",
    "kernel.shmmni",
    "kernel.shm_rmid_forced",
    "kernel.msgmax",
    "kernel.msgmni",
    "kernel.msgmnb",
    "kernel.sem",
];

pub fn is_ipc_sysctl(key: &str) -> bool {
    IPC_SYSCTLS.contains(&key)
}

pub fn is_net_sysctl(key: &str) -> bool {
    key.starts_with("net.")
}

fn sysctl_path(key: &str) -> PathBuf {
    Path::new("/proc/sys").join(key.replace('.', "/"))
}

pub fn get_sysctl(key: &str) -> Result<String> {
    fs::read_knob_file(&sysctl_path(key))
}

pub fn set_sysctl(key: &str, val: &str) -> Result<()> {
    std::fs::write(sysctl_path(key), val)
        .map_err(|e| Error::from(e).at_stage(&format!("sysctl {key}")))
}

/// Write /proc/self/loginuid. Missing file means the audit subsystem is off;
/// callers treat that as non-fatal.
pub fn set_loginuid(uid: u32) -> Result<()> {
    std::fs::write("/proc/self/loginuid", uid.to_string()).map_err(Error::from)
}

pub fn set_oom_score_adj(value: i32) -> Result<()> {
    std::fs::write("/proc/self/oom_score_adj", value.to_string()).map_err(Error::from)
}

pub fn pid_alive(pid: i32) -> bool {
    pid > 0 && Path::new(&format!("/proc/{pid}")).exists()
}

pub fn current_time_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

// ─── scheduler / io priority ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuPolicy {
    Normal,
    Rt,
    Batch,
    Idle,
}

impl CpuPolicy {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "normal" => Ok(Self::Normal),
            "rt" => Ok(Self::Rt),
            "batch" => Ok(Self::Batch),
            "idle" => Ok(Self::Idle),
            _ => Err(Error::new(
                ErrorKind::InvalidValue,
                format!("unknown cpu policy '{s}'"),
            )),
        }
    }

    fn as_raw(self) -> libc::c_int {
        match self {
            Self::Normal => libc::SCHED_OTHER,
            Self::Rt => libc::SCHED_RR,
            Self::Batch => libc::SCHED_BATCH,
            Self::Idle => libc::SCHED_IDLE,
        }
    }
}

pub fn apply_nice(nice: i32) -> Result<()> {
    if unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) } != 0 {
        return Err(Error::system("setpriority"));
    }
    Ok(())
}

pub fn apply_scheduler(policy: CpuPolicy, priority: u32) -> Result<()> {
    let param = libc::sched_param {
        sched_priority: if policy == CpuPolicy::Rt {
            priority.clamp(1, 99) as libc::c_int
        } else {
            0
        },
    };
    if unsafe { libc::sched_setscheduler(0, policy.as_raw(), &param) } != 0 {
        return Err(Error::system("sched_setscheduler"));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoPolicy {
    None,
    Rt,
    BestEffort,
    Idle,
}

impl IoPolicy {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "none" | "normal" => Ok(Self::None),
            "rt" => Ok(Self::Rt),
            "be" | "batch" => Ok(Self::BestEffort),
            "idle" => Ok(Self::Idle),
            _ => Err(Error::new(
                ErrorKind::InvalidValue,
                format!("unknown io policy '{s}'"),
            )),
        }
    }

    fn class(self) -> u64 {
        match self {
            Self::None => 0,
            Self::Rt => 1,
            Self::BestEffort => 2,
            Self::Idle => 3,
        }
    }
}

const IOPRIO_WHO_PROCESS: libc::c_int = 1;
const IOPRIO_CLASS_SHIFT: u64 = 13;

pub fn apply_io_priority(policy: IoPolicy, priority: u32) -> Result<()> {
    if policy == IoPolicy::None {
        return Ok(());
    }
    let ioprio = (policy.class() << IOPRIO_CLASS_SHIFT) | u64::from(priority.min(7));
    let ret = unsafe { libc::syscall(libc::SYS_ioprio_set, IOPRIO_WHO_PROCESS, 0, ioprio) };
    if ret != 0 {
        return Err(Error::system("ioprio_set"));
    }
    Ok(())
}

// ─── ulimits ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ulimit {
    pub resource: Resource,
    pub soft: u64,
    pub hard: u64,
}

fn resource_by_name(name: &str) -> Option<Resource> {
    Some(match name {
        "as" => Resource::RLIMIT_AS,
        "core" => Resource::RLIMIT_CORE,
        "cpu" => Resource::RLIMIT_CPU,
        "data" => Resource::RLIMIT_DATA,
        "fsize" => Resource::RLIMIT_FSIZE,
        "memlock" => Resource::RLIMIT_MEMLOCK,
        "msgqueue" => Resource::RLIMIT_MSGQUEUE,
        "nice" => Resource::RLIMIT_NICE,
        "nofile" => Resource::RLIMIT_NOFILE,
        "nproc" => Resource::RLIMIT_NPROC,
        "rtprio" => Resource::RLIMIT_RTPRIO,
        "sigpending" => Resource::RLIMIT_SIGPENDING,
        "stack" => Resource::RLIMIT_STACK,
        _ => return None,
    })
}

fn parse_limit_value(s: &str) -> Result<u64> {
    if s == "unlimited" {
        return Ok(libc::RLIM_INFINITY);
    }
    s.parse()
        .map_err(|_| Error::new(ErrorKind::InvalidValue, format!("bad ulimit value '{s}'")))
}

/// Parse the `ulimit` property: `name: soft hard; name: soft hard; ...`
pub fn parse_ulimits(spec: &str) -> Result<Vec<Ulimit>> {
    let mut limits = Vec::new();
    for part in spec.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (name, values) = part.split_once(':').ok_or_else(|| {
            Error::new(ErrorKind::InvalidValue, format!("bad ulimit '{part}'"))
        })?;
        let name = name.trim();
        let resource = resource_by_name(name).ok_or_else(|| {
            Error::new(ErrorKind::InvalidValue, format!("unknown ulimit '{name}'"))
        })?;
        let mut it = values.split_whitespace();
        let soft = parse_limit_value(it.next().ok_or_else(|| {
            Error::new(ErrorKind::InvalidValue, format!("ulimit '{name}' missing soft value"))
        })?)?;
        let hard = match it.next() {
            Some(v) => parse_limit_value(v)?,
            None => soft,
        };
        limits.push(Ulimit { resource, soft, hard });
    }
    Ok(limits)
}

pub fn apply_ulimits(limits: &[Ulimit]) -> Result<()> {
    for lim in limits {
        setrlimit(lim.resource, lim.soft, lim.hard)
            .map_err(|e| Error::from(e).at_stage("ulimit"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysctl_families() {
        assert!(is_ipc_sysctl("kernel.shmmax"));
        assert!(!is_ipc_sysctl("kernel.hostname"));
        assert!(is_net_sysctl("net.ipv4.ip_forward"));
        assert!(!is_net_sysctl("kernel.sem"));
    }

    #[test]
    fn sysctl_key_maps_to_path() {
        assert_eq!(
            sysctl_path("net.ipv4.ip_forward"),
            PathBuf::from("/proc/sys/net/ipv4/ip_forward")
        );
    }

    #[test]
    fn ulimit_parsing() {
        let limits = parse_ulimits("nofile: 1024 4096; nproc: 100; core: unlimited").unwrap();
        assert_eq!(limits.len(), 3);
        assert_eq!(limits[0].resource, Resource::RLIMIT_NOFILE);
        assert_eq!(limits[0].soft, 1024);
        assert_eq!(limits[0].hard, 4096);
        assert_eq!(limits[1].soft, limits[1].hard);
        assert_eq!(limits[2].soft, libc::RLIM_INFINITY);
    }

    #[test]
    fn ulimit_rejects_unknown_resource() {
        let err = parse_ulimits("bogus: 1").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidValue);
    }

    #[test]
    fn policy_parsing() {
        assert_eq!(CpuPolicy::parse("rt").unwrap(), CpuPolicy::Rt);
        assert!(CpuPolicy::parse("fancy").is_err());
        assert_eq!(IoPolicy::parse("idle").unwrap(), IoPolicy::Idle);
    }
}
