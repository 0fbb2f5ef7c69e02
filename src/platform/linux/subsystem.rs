use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::error::{Error, ErrorKind, Result};
use crate::platform::linux::cgroups::Cgroup;

fn parse_u64(s: &str, what: &str) -> Result<u64> {
    s.trim()
        .parse()
        .map_err(|_| Error::new(ErrorKind::InvalidValue, format!("bad {what} value '{s}'")))
}

// ─── memory ─────────────────────────────────────────────────────────────────

/// Parse `memory.stat`-style text: one `key value` pair per line.
pub fn parse_stat_text(text: &str) -> BTreeMap<String, u64> {
    let mut map = BTreeMap::new();
    for line in text.lines() {
        let mut it = line.split_whitespace();
        if let (Some(key), Some(val)) = (it.next(), it.next()) {
            if let Ok(val) = val.parse() {
                map.insert(key.to_string(), val);
            }
        }
    }
    map
}

#[derive(Debug, Default)]
pub struct MemorySubsystem;

impl MemorySubsystem {
    pub fn usage(&self, cg: &Cgroup) -> Result<u64> {
        parse_u64(&cg.read_knob("memory.usage_in_bytes")?, "memory usage")
    }

    pub fn statistics(&self, cg: &Cgroup) -> Result<BTreeMap<String, u64>> {
        Ok(parse_stat_text(&cg.read_knob("memory.stat")?))
    }

    pub fn use_hierarchy(&self, cg: &Cgroup) -> Result<()> {
        cg.write_knob("memory.use_hierarchy", "1")
    }

    /// 0 means unlimited.
    pub fn set_limit(&self, cg: &Cgroup, limit: u64) -> Result<()> {
        if limit == 0 {
            cg.write_knob("memory.limit_in_bytes", "-1")
        } else {
            cg.write_knob("memory.limit_in_bytes", &limit.to_string())
        }
    }

    /// Number of tasks the kernel OOM killer took from this cgroup, read
    /// from the oom_control event counters.
    pub fn oom_kill_count(&self, cg: &Cgroup) -> Result<u64> {
        let text = cg.read_knob("memory.oom_control")?;
        let stat = parse_stat_text(&text);
        // older kernels report only under_oom
        Ok(stat
            .get("oom_kill")
            .copied()
            .unwrap_or_else(|| stat.get("under_oom").copied().unwrap_or(0)))
    }

    /// Probe whether the kernel tracks total_max_rss; decides the max_rss
    /// field's supported flag at daemon start.
    pub fn supports_max_rss(&self, root: &Cgroup) -> bool {
        self.statistics(root)
            .map(|s| s.contains_key("total_max_rss"))
            .unwrap_or(false)
    }
}

// ─── cpuacct ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct CpuacctSubsystem;

impl CpuacctSubsystem {
    /// Consumed CPU time in nanoseconds.
    pub fn usage(&self, cg: &Cgroup) -> Result<u64> {
        parse_u64(&cg.read_knob("cpuacct.usage")?, "cpuacct usage")
    }
}

// ─── freezer ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezerState {
    Thawed,
    Freezing,
    Frozen,
    Thawing,
}

impl FreezerState {
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s.trim() {
            "THAWED" => Self::Thawed,
            "FREEZING" => Self::Freezing,
            "FROZEN" => Self::Frozen,
            "THAWING" => Self::Thawing,
            other => {
                return Err(Error::new(
                    ErrorKind::Unknown,
                    format!("unknown freezer state '{other}'"),
                ))
            }
        })
    }
}

#[derive(Debug)]
pub struct FreezerSubsystem {
    pub wait_timeout_ms: u64,
}

impl Default for FreezerSubsystem {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 5_000,
        }
    }
}

impl FreezerSubsystem {
    pub fn new(wait_timeout_ms: u64) -> Self {
        Self { wait_timeout_ms }
    }

    pub fn state(&self, cg: &Cgroup) -> Result<FreezerState> {
        FreezerState::parse(&cg.read_knob("freezer.state")?)
    }

    fn wait_state(&self, cg: &Cgroup, want: FreezerState) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(self.wait_timeout_ms);
        loop {
            if self.state(cg)? == want {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::new(
                    ErrorKind::Timeout,
                    format!("freezer {cg} did not reach {want:?}"),
                ));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn freeze(&self, cg: &Cgroup) -> Result<()> {
        cg.write_knob("freezer.state", "FROZEN")?;
        self.wait_state(cg, FreezerState::Frozen)
    }

    pub fn unfreeze(&self, cg: &Cgroup) -> Result<()> {
        cg.write_knob("freezer.state", "THAWED")?;
        self.wait_state(cg, FreezerState::Thawed)
    }
}

// ─── blkio ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlkioStat {
    pub device: String,
    pub read: u64,
    pub write: u64,
    pub sync: u64,
    pub r#async: u64,
}

/// Parse blkio counter files: lines of `<major:minor> <op> <value>`.
pub fn parse_blkio_text(text: &str) -> Vec<BlkioStat> {
    let mut by_device: BTreeMap<String, BlkioStat> = BTreeMap::new();
    for line in text.lines() {
        let mut it = line.split_whitespace();
        let (Some(majmin), Some(op), Some(val)) = (it.next(), it.next(), it.next()) else {
            continue;
        };
        if !majmin.contains(':') {
            continue; // trailing "Total" line
        }
        let Ok(val) = val.parse::<u64>() else {
            continue;
        };
        let stat = by_device.entry(majmin.to_string()).or_insert_with(|| BlkioStat {
            device: majmin.to_string(),
            ..Default::default()
        });
        match op {
            "Read" => stat.read = val,
            "Write" => stat.write = val,
            "Sync" => stat.sync = val,
            "Async" => stat.r#async = val,
            _ => {}
        }
    }
    by_device.into_values().collect()
}

/// Resolve `major:minor` to a kernel device name via /sys/dev/block.
fn resolve_device(majmin: &str) -> Option<String> {
    let link = std::fs::read_link(Path::new("/sys/dev/block").join(majmin)).ok()?;
    Some(link.file_name()?.to_string_lossy().into_owned())
}

#[derive(Debug, Default)]
pub struct BlkioSubsystem;

impl BlkioSubsystem {
    /// Per-device counters from one of the blkio stat files
    /// (e.g. `blkio.io_service_bytes_recursive`).
    pub fn statistics(&self, cg: &Cgroup, file: &str) -> Result<Vec<BlkioStat>> {
        let mut stats = parse_blkio_text(&cg.read_knob(file)?);
        for stat in &mut stats {
            if let Some(name) = resolve_device(&stat.device) {
                stat.device = name;
            }
        }
        Ok(stats)
    }
}

// ─── net_cls / pids / devices ───────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct NetClsSubsystem;

impl NetClsSubsystem {
    /// Tag the cgroup's traffic with a tc class handle.
    pub fn set_class_id(&self, cg: &Cgroup, handle: u32) -> Result<()> {
        cg.write_knob("net_cls.classid", &handle.to_string())
    }
}

#[derive(Debug, Default)]
pub struct PidsSubsystem;

impl PidsSubsystem {
    pub fn set_limit(&self, cg: &Cgroup, limit: u64) -> Result<()> {
        if limit == 0 {
            cg.write_knob("pids.max", "max")
        } else {
            cg.write_knob("pids.max", &limit.to_string())
        }
    }
}

#[derive(Debug, Default)]
pub struct DevicesSubsystem;

impl DevicesSubsystem {
    pub fn deny_all(&self, cg: &Cgroup) -> Result<()> {
        cg.write_knob("devices.deny", "a")
    }

    /// `spec` is a kernel devices-cgroup rule like `c 1:3 rwm`.
    pub fn allow(&self, cg: &Cgroup, spec: &str) -> Result<()> {
        cg.write_knob("devices.allow", spec)
    }
}

/// Every recognized driver, built once at daemon start.
#[derive(Debug, Default)]
pub struct Subsystems {
    pub memory: MemorySubsystem,
    pub cpuacct: CpuacctSubsystem,
    pub freezer: FreezerSubsystem,
    pub blkio: BlkioSubsystem,
    pub net_cls: NetClsSubsystem,
    pub pids: PidsSubsystem,
    pub devices: DevicesSubsystem,
}

impl Subsystems {
    pub fn new(freezer_timeout_ms: u64) -> Self {
        Self {
            freezer: FreezerSubsystem::new(freezer_timeout_ms),
            ..Default::default()
        }
    }
}
