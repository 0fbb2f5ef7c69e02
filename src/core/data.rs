use std::path::Path;

use crate::core::container::{Container, ContainerInner, ContainerState};
use crate::core::engine::Engine;
use crate::core::props::P_STDOUT_LIMIT;
use crate::core::registry::{FieldDesc, FieldFlags, Registry, Value, ValueKind};
use crate::error::{Error, ErrorKind, Result};
use crate::platform::linux::net::TcStatKind;
use crate::platform::linux::stdio::read_window;
use crate::util::proc::current_time_ms;

pub const D_STATE: &str = "state";
pub const D_ABSOLUTE_NAME: &str = "absolute_name";
pub const D_PARENT: &str = "parent";
pub const D_EXIT_STATUS: &str = "exit_status";
pub const D_START_ERRNO: &str = "start_errno";
pub const D_OOM_KILLED: &str = "oom_killed";
pub const D_RESPAWN_COUNT: &str = "respawn_count";
pub const D_TASK_PID: &str = "task_pid";
pub const D_TASK_VPID: &str = "task_vpid";
pub const D_WAIT_PID: &str = "wait_pid";
pub const D_STDOUT: &str = "stdout";
pub const D_STDERR: &str = "stderr";
pub const D_STDOUT_OFFSET: &str = "stdout_offset";
pub const D_STDERR_OFFSET: &str = "stderr_offset";
pub const D_CPU_USAGE: &str = "cpu_usage";
pub const D_MEMORY_USAGE: &str = "memory_usage";
pub const D_MINOR_FAULTS: &str = "minor_faults";
pub const D_MAJOR_FAULTS: &str = "major_faults";
pub const D_MAX_RSS: &str = "max_rss";
pub const D_IO_READ: &str = "io_read";
pub const D_IO_WRITE: &str = "io_write";
pub const D_IO_OPS: &str = "io_ops";
pub const D_TIME: &str = "time";
pub const D_NET_BYTES: &str = "net_bytes";
pub const D_NET_PACKETS: &str = "net_packets";
pub const D_NET_DROPS: &str = "net_drops";
pub const D_NET_OVERLIMITS: &str = "net_overlimits";
pub const D_NET_RX_BYTES: &str = "net_rx_bytes";
pub const D_NET_RX_PACKETS: &str = "net_rx_packets";
pub const D_NET_RX_DROPS: &str = "net_rx_drops";
pub const D_DAEMON_STAT: &str = "daemon_stat";

fn state(_e: &Engine, _ct: &Container, inner: &ContainerInner) -> Result<Value> {
    Ok(Value::Str(inner.state().to_string()))
}

fn absolute_name(_e: &Engine, ct: &Container, _inner: &ContainerInner) -> Result<Value> {
    Ok(Value::Str(ct.name.clone()))
}

fn parent_name(_e: &Engine, ct: &Container, _inner: &ContainerInner) -> Result<Value> {
    Ok(Value::Str(
        ct.parent.upgrade().map(|p| p.name.clone()).unwrap_or_default(),
    ))
}

fn exit_status(_e: &Engine, _ct: &Container, inner: &ContainerInner) -> Result<Value> {
    Ok(Value::Int(inner.exit_status.into()))
}

fn start_errno(_e: &Engine, _ct: &Container, inner: &ContainerInner) -> Result<Value> {
    Ok(Value::Int(inner.start_errno.into()))
}

fn oom_killed(_e: &Engine, _ct: &Container, inner: &ContainerInner) -> Result<Value> {
    Ok(Value::Bool(inner.oom_killed))
}

fn respawn_count(_e: &Engine, _ct: &Container, inner: &ContainerInner) -> Result<Value> {
    Ok(Value::Uint(inner.respawn_count))
}

fn task_pid(_e: &Engine, _ct: &Container, inner: &ContainerInner) -> Result<Value> {
    Ok(Value::Int(inner.task_pid.into()))
}

fn task_vpid(_e: &Engine, _ct: &Container, inner: &ContainerInner) -> Result<Value> {
    Ok(Value::Int(inner.task_vpid.into()))
}

fn wait_pid(_e: &Engine, _ct: &Container, inner: &ContainerInner) -> Result<Value> {
    Ok(Value::Int(inner.wait_pid.into()))
}

fn stdout_limit_of(engine: &Engine, ct: &Container, inner: &ContainerInner) -> u64 {
    match engine.field_value(ct, inner, P_STDOUT_LIMIT) {
        Ok(Value::Uint(v)) => v,
        _ => engine.config.container.stdout_limit,
    }
}

fn stream_window(
    engine: &Engine,
    ct: &Container,
    inner: &ContainerInner,
    path: Option<&Path>,
    index: Option<&str>,
) -> Result<Value> {
    let Some(path) = path else {
        return Ok(Value::Str(String::new()));
    };
    let offset = match index {
        Some(s) => s.trim().parse().map_err(|_| {
            Error::new(ErrorKind::InvalidValue, format!("bad stream offset '{s}'"))
        })?,
        None => 0,
    };
    Ok(Value::Str(read_window(
        path,
        offset,
        stdout_limit_of(engine, ct, inner),
    )?))
}

fn stdout(e: &Engine, ct: &Container, inner: &ContainerInner) -> Result<Value> {
    stream_window(e, ct, inner, inner.stdout_path.as_deref(), None)
}

fn stdout_indexed(e: &Engine, ct: &Container, inner: &ContainerInner, index: &str) -> Result<Value> {
    stream_window(e, ct, inner, inner.stdout_path.as_deref(), Some(index))
}

fn stderr(e: &Engine, ct: &Container, inner: &ContainerInner) -> Result<Value> {
    stream_window(e, ct, inner, inner.stderr_path.as_deref(), None)
}

fn stderr_indexed(e: &Engine, ct: &Container, inner: &ContainerInner, index: &str) -> Result<Value> {
    stream_window(e, ct, inner, inner.stderr_path.as_deref(), Some(index))
}

fn zero_offset(_e: &Engine, _ct: &Container, _inner: &ContainerInner) -> Result<Value> {
    Ok(Value::Uint(0))
}

fn cpu_usage(e: &Engine, ct: &Container, _inner: &ContainerInner) -> Result<Value> {
    let cg = e.cgroups.container_cgroup("cpuacct", &ct.name)?;
    Ok(Value::Uint(e.subsystems.cpuacct.usage(&cg)?))
}

fn memory_usage(e: &Engine, ct: &Container, _inner: &ContainerInner) -> Result<Value> {
    let cg = e.cgroups.container_cgroup("memory", &ct.name)?;
    Ok(Value::Uint(e.subsystems.memory.usage(&cg)?))
}

fn memory_stat(e: &Engine, ct: &Container) -> Result<std::collections::BTreeMap<String, u64>> {
    let cg = e.cgroups.container_cgroup("memory", &ct.name)?;
    e.subsystems.memory.statistics(&cg)
}

fn minor_faults(e: &Engine, ct: &Container, _inner: &ContainerInner) -> Result<Value> {
    let stat = memory_stat(e, ct)?;
    let total = stat.get("total_pgfault").copied().unwrap_or(0);
    let major = stat.get("total_pgmajfault").copied().unwrap_or(0);
    Ok(Value::Uint(total.saturating_sub(major)))
}

fn major_faults(e: &Engine, ct: &Container, _inner: &ContainerInner) -> Result<Value> {
    let stat = memory_stat(e, ct)?;
    Ok(Value::Uint(stat.get("total_pgmajfault").copied().unwrap_or(0)))
}

fn max_rss(e: &Engine, ct: &Container, _inner: &ContainerInner) -> Result<Value> {
    let stat = memory_stat(e, ct)?;
    Ok(Value::Uint(stat.get("total_max_rss").copied().unwrap_or(0)))
}

fn blkio_map(
    e: &Engine,
    ct: &Container,
    file: &str,
    pick: fn(&crate::platform::linux::subsystem::BlkioStat) -> u64,
) -> Result<Value> {
    let mut map = std::collections::BTreeMap::new();
    let cg = e.cgroups.container_cgroup("blkio", &ct.name)?;
    for stat in e.subsystems.blkio.statistics(&cg, file)? {
        map.insert(stat.device.clone(), pick(&stat));
    }
    Ok(Value::UintMap(map))
}

fn io_read(e: &Engine, ct: &Container, _inner: &ContainerInner) -> Result<Value> {
    blkio_map(e, ct, "blkio.io_service_bytes_recursive", |s| s.read)
}

fn io_write(e: &Engine, ct: &Container, _inner: &ContainerInner) -> Result<Value> {
    blkio_map(e, ct, "blkio.io_service_bytes_recursive", |s| s.write)
}

fn io_ops(e: &Engine, ct: &Container, _inner: &ContainerInner) -> Result<Value> {
    blkio_map(e, ct, "blkio.io_serviced_recursive", |s| s.read + s.write)
}

fn run_time(_e: &Engine, _ct: &Container, inner: &ContainerInner) -> Result<Value> {
    if inner.start_time_ms == 0 {
        return Ok(Value::Uint(0));
    }
    let until = if inner.state() == ContainerState::Dead && inner.death_time_ms != 0 {
        inner.death_time_ms
    } else {
        current_time_ms()
    };
    Ok(Value::Uint(until.saturating_sub(inner.start_time_ms) / 1000))
}

fn net_counters(e: &Engine, ct: &Container, kind: TcStatKind) -> Result<Value> {
    let mut net = e.net.lock().expect("network lock poisoned");
    Ok(Value::UintMap(
        net.get_traffic_counters(ct.id as u16, kind)?,
    ))
}

fn net_bytes(e: &Engine, ct: &Container, _i: &ContainerInner) -> Result<Value> {
    net_counters(e, ct, TcStatKind::TxBytes)
}

fn net_packets(e: &Engine, ct: &Container, _i: &ContainerInner) -> Result<Value> {
    net_counters(e, ct, TcStatKind::TxPackets)
}

fn net_drops(e: &Engine, ct: &Container, _i: &ContainerInner) -> Result<Value> {
    net_counters(e, ct, TcStatKind::TxDrops)
}

fn net_overlimits(e: &Engine, ct: &Container, _i: &ContainerInner) -> Result<Value> {
    net_counters(e, ct, TcStatKind::TxOverlimits)
}

fn net_rx_bytes(e: &Engine, ct: &Container, _i: &ContainerInner) -> Result<Value> {
    net_counters(e, ct, TcStatKind::RxBytes)
}

fn net_rx_packets(e: &Engine, ct: &Container, _i: &ContainerInner) -> Result<Value> {
    net_counters(e, ct, TcStatKind::RxPackets)
}

fn net_rx_drops(e: &Engine, ct: &Container, _i: &ContainerInner) -> Result<Value> {
    net_counters(e, ct, TcStatKind::RxDrops)
}

fn daemon_stat(e: &Engine, _ct: &Container, _inner: &ContainerInner) -> Result<Value> {
    let (containers, running) = e.container_counts();
    Ok(Value::UintMap(e.stats.snapshot(
        current_time_ms(),
        containers,
        running,
    )))
}

/// Probes taken at daemon start that decide per-field supported flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataProbes {
    pub max_rss_supported: bool,
    pub memory_supported: bool,
    pub cpuacct_supported: bool,
    pub blkio_supported: bool,
}

/// Register every read-only data field.
pub fn register_data(reg: &mut Registry, probes: DataProbes) {
    use FieldDesc as F;
    use ValueKind as K;

    let ro = FieldFlags::READ_ONLY;
    let runtime = FieldFlags::READ_ONLY | FieldFlags::RUNTIME;
    let postmortem = FieldFlags::READ_ONLY | FieldFlags::PERSISTENT | FieldFlags::POSTMORTEM;

    reg.register(
        F::data(D_STATE, K::Str, "container state")
            .with_flags(FieldFlags::READ_ONLY | FieldFlags::PERSISTENT)
            .with_default(state),
    );
    reg.register(
        F::data(D_ABSOLUTE_NAME, K::Str, "absolute name of the container")
            .with_default(absolute_name),
    );
    reg.register(
        F::data(D_PARENT, K::Str, "parent container name")
            .with_flags(ro | FieldFlags::HIDDEN)
            .with_default(parent_name),
    );
    reg.register(
        F::data(D_EXIT_STATUS, K::Int, "exit status of the task")
            .with_flags(postmortem)
            .with_default(exit_status),
    );
    reg.register(
        F::data(D_START_ERRNO, K::Int, "errno of the last failed start").with_default(start_errno),
    );
    reg.register(
        F::data(D_OOM_KILLED, K::Bool, "whether the task was killed by the oom killer")
            .with_flags(postmortem)
            .with_default(oom_killed),
    );
    reg.register(
        F::data(D_RESPAWN_COUNT, K::Uint, "how many times the container respawned")
            .with_flags(FieldFlags::READ_ONLY | FieldFlags::PERSISTENT)
            .with_default(respawn_count),
    );
    reg.register(
        F::data(D_TASK_PID, K::Int, "host-visible pid of the task")
            .with_flags(runtime)
            .with_default(task_pid),
    );
    reg.register(
        F::data(D_TASK_VPID, K::Int, "namespace-visible pid of the task")
            .with_flags(runtime)
            .with_default(task_vpid),
    );
    reg.register(
        F::data(D_WAIT_PID, K::Int, "pid the daemon waits on")
            .with_flags(runtime | FieldFlags::HIDDEN)
            .with_default(wait_pid),
    );
    reg.register(
        F::data(D_STDOUT, K::Text, "captured stdout window")
            .with_flags(runtime)
            .with_default(stdout)
            .with_indexed(stdout_indexed),
    );
    reg.register(
        F::data(D_STDERR, K::Text, "captured stderr window")
            .with_flags(runtime)
            .with_default(stderr)
            .with_indexed(stderr_indexed),
    );
    reg.register(
        F::data(D_STDOUT_OFFSET, K::Uint, "bytes already rotated out of stdout")
            .with_flags(runtime)
            .with_default(zero_offset),
    );
    reg.register(
        F::data(D_STDERR_OFFSET, K::Uint, "bytes already rotated out of stderr")
            .with_flags(runtime)
            .with_default(zero_offset),
    );

    let gated = |flags: FieldFlags, supported: bool| {
        if supported {
            flags
        } else {
            flags | FieldFlags::UNSUPPORTED
        }
    };

    reg.register(
        F::data(D_CPU_USAGE, K::Uint, "consumed cpu time in nanoseconds")
            .with_flags(gated(runtime, probes.cpuacct_supported))
            .with_default(cpu_usage),
    );
    reg.register(
        F::data(D_MEMORY_USAGE, K::Uint, "consumed memory in bytes")
            .with_flags(gated(runtime, probes.memory_supported))
            .with_default(memory_usage),
    );
    reg.register(
        F::data(D_MINOR_FAULTS, K::Uint, "minor page faults")
            .with_flags(gated(runtime, probes.memory_supported))
            .with_default(minor_faults),
    );
    reg.register(
        F::data(D_MAJOR_FAULTS, K::Uint, "major page faults")
            .with_flags(gated(runtime, probes.memory_supported))
            .with_default(major_faults),
    );
    reg.register(
        F::data(D_MAX_RSS, K::Uint, "peak anonymous memory usage")
            .with_flags(gated(runtime, probes.max_rss_supported))
            .with_default(max_rss),
    );
    reg.register(
        F::data(D_IO_READ, K::UintMap, "bytes read per device")
            .with_flags(gated(runtime, probes.blkio_supported))
            .with_default(io_read),
    );
    reg.register(
        F::data(D_IO_WRITE, K::UintMap, "bytes written per device")
            .with_flags(gated(runtime, probes.blkio_supported))
            .with_default(io_write),
    );
    reg.register(
        F::data(D_IO_OPS, K::UintMap, "io operations per device")
            .with_flags(gated(runtime, probes.blkio_supported))
            .with_default(io_ops),
    );
    reg.register(
        F::data(D_TIME, K::Uint, "seconds since the task started")
            .with_flags(runtime)
            .with_default(run_time),
    );
    reg.register(
        F::data(D_NET_BYTES, K::UintMap, "tx bytes per interface")
            .with_flags(runtime)
            .with_default(net_bytes),
    );
    reg.register(
        F::data(D_NET_PACKETS, K::UintMap, "tx packets per interface")
            .with_flags(runtime)
            .with_default(net_packets),
    );
    reg.register(
        F::data(D_NET_DROPS, K::UintMap, "dropped tx packets per interface")
            .with_flags(runtime)
            .with_default(net_drops),
    );
    reg.register(
        F::data(D_NET_OVERLIMITS, K::UintMap, "tx packets over the limit per interface")
            .with_flags(runtime)
            .with_default(net_overlimits),
    );
    reg.register(
        F::data(D_NET_RX_BYTES, K::UintMap, "rx bytes per interface")
            .with_flags(runtime)
            .with_default(net_rx_bytes),
    );
    reg.register(
        F::data(D_NET_RX_PACKETS, K::UintMap, "rx packets per interface")
            .with_flags(runtime)
            .with_default(net_rx_packets),
    );
    reg.register(
        F::data(D_NET_RX_DROPS, K::UintMap, "dropped rx packets per interface")
            .with_flags(runtime)
            .with_default(net_rx_drops),
    );
    reg.register(
        F::data(D_DAEMON_STAT, K::UintMap, "daemon statistics counters")
            .with_flags(runtime | FieldFlags::HIDDEN)
            .with_default(daemon_stat),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::FieldClass;

    #[test]
    fn data_fields_register_with_expected_flags() {
        let mut reg = Registry::empty();
        register_data(
            &mut reg,
            DataProbes {
                max_rss_supported: false,
                memory_supported: true,
                cpuacct_supported: true,
                blkio_supported: true,
            },
        );

        let exit = reg.get(D_EXIT_STATUS).unwrap();
        assert!(exit.flags.has(FieldFlags::READ_ONLY));
        assert!(exit.flags.has(FieldFlags::POSTMORTEM));
        assert!(exit.flags.has(FieldFlags::PERSISTENT));

        let max_rss = reg.get(D_MAX_RSS).unwrap();
        assert!(max_rss.flags.has(FieldFlags::UNSUPPORTED));
        let mem = reg.get(D_MEMORY_USAGE).unwrap();
        assert!(!mem.flags.has(FieldFlags::UNSUPPORTED));

        // hidden fields stay out of the listing
        let listed: Vec<_> = reg.list(FieldClass::Data).map(|f| f.key).collect();
        assert!(!listed.contains(&D_PARENT));
        assert!(!listed.contains(&D_DAEMON_STAT));
        assert!(listed.contains(&D_STDOUT));

        // stream fields expose indexed accessors
        assert!(reg.get(D_STDOUT).unwrap().indexed.is_some());
        assert!(reg.get(D_STDERR).unwrap().indexed.is_some());
    }
}
