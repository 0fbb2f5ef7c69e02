use crate::core::container::{Container, ContainerInner};
use crate::core::engine::Engine;
use crate::core::registry::{FieldDesc, Registry, Value, ValueKind};
use crate::error::{Error, ErrorKind, Result};
use crate::platform::linux::caps::parse_caps;
use crate::platform::linux::mounts::parse_devices;
use crate::util::proc::{parse_ulimits, CpuPolicy, IoPolicy};

pub const P_COMMAND: &str = "command";
pub const P_ENV: &str = "env";
pub const P_CWD: &str = "cwd";
pub const P_ROOT: &str = "root";
pub const P_USER: &str = "user";
pub const P_GROUP: &str = "group";
pub const P_HOSTNAME: &str = "hostname";
pub const P_ISOLATE: &str = "isolate";
pub const P_NET_ISOLATE: &str = "net_isolate";
pub const P_RESPAWN: &str = "respawn";
pub const P_MAX_RESPAWNS: &str = "max_respawns";
pub const P_STDIN_PATH: &str = "stdin_path";
pub const P_STDOUT_PATH: &str = "stdout_path";
pub const P_STDERR_PATH: &str = "stderr_path";
pub const P_STDOUT_LIMIT: &str = "stdout_limit";
pub const P_MEMORY_LIMIT: &str = "memory_limit";
pub const P_PIDS_LIMIT: &str = "pids_limit";
pub const P_CPU_POLICY: &str = "cpu_policy";
pub const P_CPU_PRIORITY: &str = "cpu_priority";
pub const P_IO_POLICY: &str = "io_policy";
pub const P_IO_PRIORITY: &str = "io_priority";
pub const P_NICE: &str = "nice";
pub const P_OOM_SCORE_ADJ: &str = "oom_score_adj";
pub const P_UMASK: &str = "umask";
pub const P_ULIMIT: &str = "ulimit";
pub const P_SYSCTL: &str = "sysctl";
pub const P_RESOLV_CONF: &str = "resolv_conf";
pub const P_ETC_HOSTS: &str = "etc_hosts";
pub const P_DEVICES: &str = "devices";
pub const P_CAPABILITIES: &str = "capabilities";
pub const P_CAPABILITIES_AMBIENT: &str = "capabilities_ambient";
pub const P_NET_PRIORITY: &str = "net_priority";
pub const P_NET_GUARANTEE: &str = "net_guarantee";
pub const P_NET_LIMIT: &str = "net_limit";
pub const P_START_TIMEOUT_MS: &str = "start_timeout_ms";

/// Parse the env property: `KEY=value; KEY=value; ...`
pub fn parse_env_list(spec: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for part in spec.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if !part.contains('=') {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("environment entry '{part}' has no '='"),
            ));
        }
        out.push(part.to_string());
    }
    Ok(out)
}

/// Parse the sysctl property: `key: value; key: value; ...`
pub fn parse_sysctl_list(spec: &str) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for part in spec.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (key, val) = part.split_once(':').ok_or_else(|| {
            Error::new(ErrorKind::InvalidValue, format!("bad sysctl entry '{part}'"))
        })?;
        out.push((key.trim().to_string(), val.trim().to_string()));
    }
    Ok(out)
}

/// Split a command line on whitespace into argv. Quoting is not a shell's;
/// commands that need one should spell out `sh -c`.
pub fn parse_command(spec: &str) -> Vec<String> {
    spec.split_whitespace().map(str::to_string).collect()
}

fn validate_env(v: &Value) -> Result<()> {
    if let Value::Str(s) = v {
        parse_env_list(s)?;
    }
    Ok(())
}

fn validate_sysctl(v: &Value) -> Result<()> {
    if let Value::Str(s) = v {
        parse_sysctl_list(s)?;
    }
    Ok(())
}

fn validate_ulimit(v: &Value) -> Result<()> {
    if let Value::Str(s) = v {
        parse_ulimits(s)?;
    }
    Ok(())
}

fn validate_devices(v: &Value) -> Result<()> {
    if let Value::Str(s) = v {
        parse_devices(s)?;
    }
    Ok(())
}

fn validate_caps(v: &Value) -> Result<()> {
    if let Value::Str(s) = v {
        parse_caps(s)?;
    }
    Ok(())
}

fn validate_cpu_policy(v: &Value) -> Result<()> {
    if let Value::Str(s) = v {
        CpuPolicy::parse(s)?;
    }
    Ok(())
}

fn validate_io_policy(v: &Value) -> Result<()> {
    if let Value::Str(s) = v {
        IoPolicy::parse(s)?;
    }
    Ok(())
}

fn validate_absolute_path(v: &Value) -> Result<()> {
    if let Value::Str(s) = v {
        if !s.is_empty() && !s.starts_with('/') {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("path '{s}' must be absolute"),
            ));
        }
    }
    Ok(())
}

fn default_stdout_limit(engine: &Engine, _ct: &Container, _inner: &ContainerInner) -> Result<Value> {
    Ok(Value::Uint(engine.config.container.stdout_limit))
}

fn default_start_timeout(engine: &Engine, _ct: &Container, _inner: &ContainerInner) -> Result<Value> {
    Ok(Value::Uint(engine.config.container.start_timeout_ms))
}

/// Register every writable property.
pub fn register_properties(reg: &mut Registry) {
    use FieldDesc as F;
    use Value as V;
    use ValueKind as K;

    reg.register(F::property(P_COMMAND, K::Str, "command executed on start; empty makes a meta container"));
    reg.register(
        F::property(P_ENV, K::Str, "environment of the task: NAME=value; ...")
            .with_validate(validate_env),
    );
    reg.register(
        F::property(P_CWD, K::Str, "working directory of the task")
            .with_default_value(V::Str("/".into()))
            .with_validate(validate_absolute_path),
    );
    reg.register(
        F::property(P_ROOT, K::Str, "root directory of the task")
            .with_default_value(V::Str("/".into()))
            .with_validate(validate_absolute_path),
    );
    reg.register(
        F::property(P_USER, K::Str, "user the task runs as")
            .with_default_value(V::Str("root".into())),
    );
    reg.register(
        F::property(P_GROUP, K::Str, "group the task runs as")
            .with_default_value(V::Str("root".into())),
    );
    reg.register(F::property(P_HOSTNAME, K::Str, "hostname inside the container"));
    reg.register(
        F::property(P_ISOLATE, K::Bool, "give the task fresh pid/ipc namespaces")
            .with_default_value(V::Bool(true)),
    );
    reg.register(F::property(P_NET_ISOLATE, K::Bool, "give the task a fresh network stack"));
    reg.register(F::property(P_RESPAWN, K::Bool, "restart the task automatically after death"));
    reg.register(
        F::property(P_MAX_RESPAWNS, K::Int, "respawn limit; negative means unlimited")
            .with_default_value(V::Int(-1)),
    );
    reg.register(
        F::property(P_STDIN_PATH, K::Str, "stdin source inside the container")
            .with_validate(validate_absolute_path),
    );
    reg.register(
        F::property(P_STDOUT_PATH, K::Str, "stdout target inside the container")
            .with_validate(validate_absolute_path),
    );
    reg.register(
        F::property(P_STDERR_PATH, K::Str, "stderr target inside the container")
            .with_validate(validate_absolute_path),
    );
    reg.register(
        F::property(P_STDOUT_LIMIT, K::Uint, "bytes of captured stdout/stderr kept")
            .with_default(default_stdout_limit),
    );
    reg.register(F::property(P_MEMORY_LIMIT, K::Uint, "memory limit in bytes; 0 is unlimited"));
    reg.register(F::property(P_PIDS_LIMIT, K::Uint, "pid limit; 0 is unlimited"));
    reg.register(
        F::property(P_CPU_POLICY, K::Str, "scheduler policy: normal|rt|batch|idle")
            .with_default_value(V::Str("normal".into()))
            .with_validate(validate_cpu_policy),
    );
    reg.register(F::property(P_CPU_PRIORITY, K::Uint, "realtime scheduler priority"));
    reg.register(
        F::property(P_IO_POLICY, K::Str, "io priority class: none|rt|be|idle")
            .with_default_value(V::Str("none".into()))
            .with_validate(validate_io_policy),
    );
    reg.register(F::property(P_IO_PRIORITY, K::Uint, "io priority within the class (0..7)"));
    reg.register(F::property(P_NICE, K::Int, "nice value of the task"));
    reg.register(F::property(P_OOM_SCORE_ADJ, K::Int, "oom_score_adj of the task"));
    reg.register(
        F::property(P_UMASK, K::Uint, "umask of the task")
            .with_default_value(V::Uint(0o022)),
    );
    reg.register(
        F::property(P_ULIMIT, K::Str, "resource limits: name: soft hard; ...")
            .with_validate(validate_ulimit),
    );
    reg.register(
        F::property(P_SYSCTL, K::Str, "sysctls applied inside the container: key: value; ...")
            .with_validate(validate_sysctl),
    );
    reg.register(F::property(P_RESOLV_CONF, K::Str, "content of /etc/resolv.conf"));
    reg.register(F::property(P_ETC_HOSTS, K::Str, "content of /etc/hosts"));
    reg.register(
        F::property(P_DEVICES, K::Str, "devices granted to the container: /dev/name rwm; ...")
            .with_validate(validate_devices),
    );
    reg.register(
        F::property(P_CAPABILITIES, K::Str, "bounding capability set")
            .with_validate(validate_caps),
    );
    reg.register(
        F::property(P_CAPABILITIES_AMBIENT, K::Str, "ambient capability set")
            .with_validate(validate_caps),
    );
    reg.register(F::property(P_NET_PRIORITY, K::UintMap, "egress priority per interface"));
    reg.register(F::property(P_NET_GUARANTEE, K::UintMap, "guaranteed egress rate per interface, bytes/s"));
    reg.register(F::property(P_NET_LIMIT, K::UintMap, "egress ceiling per interface, bytes/s"));
    reg.register(
        F::property(P_START_TIMEOUT_MS, K::Uint, "bound on the whole start handshake")
            .with_default(default_start_timeout),
    );
}
