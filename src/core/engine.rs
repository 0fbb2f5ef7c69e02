use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::config::Config;
use crate::core::container::{Container, ContainerInner, ContainerState, ContainerTree};
use crate::core::data::{register_data, DataProbes};
use crate::core::props::register_properties;
use crate::core::registry::{FieldClass, FieldFlags, Registry, Value};
use crate::core::stats::Statistics;
use crate::core::store::{ContainerRecord, Store};
use crate::error::{Error, ErrorKind, Result};
use crate::platform::linux::cgroups::CgroupDriver;
use crate::platform::linux::net::Network;
use crate::platform::linux::subsystem::Subsystems;
use crate::util::proc::{self, current_time_ms, IPC_SYSCTLS};

/// The daemon's world: configuration, controller drivers, the network
/// provisioner, the field registry, and the container tree. Built once at
/// startup; tests build theirs over scratch directories and fake sessions.
pub struct Engine {
    pub config: Config,
    pub cgroups: CgroupDriver,
    pub subsystems: Subsystems,
    pub net: Mutex<Network>,
    pub registry: Registry,
    pub tree: Mutex<ContainerTree>,
    pub stats: Statistics,
    pub store: Option<Store>,
    /// Path of the crateinit binary fexecve'd for meta containers.
    pub helper_init_path: Option<PathBuf>,
    death_gate: (Mutex<u64>, Condvar),
}

impl Engine {
    pub fn new(mut config: Config) -> Result<Arc<Self>> {
        let cgroups = CgroupDriver::detect()?;
        let subsystems = Subsystems::new(config.container.freezer_timeout_ms);

        let mut net = Network::connect(config.network.enable_shaping)?;
        if let Err(e) = net.update_interfaces() {
            warn!("cannot enumerate host links: {e}");
        }

        load_host_ipc_defaults(&mut config);
        let store = Store::open(&config.daemon.state_dir)?;
        let helper_init_path = find_helper_init();
        if helper_init_path.is_none() {
            warn!("crateinit binary not found; meta containers will not start");
        }

        Ok(Self::assemble(
            config,
            cgroups,
            subsystems,
            net,
            Some(store),
            helper_init_path,
        ))
    }

    /// Explicit-parts constructor used by tests.
    pub fn with_parts(
        config: Config,
        cgroups: CgroupDriver,
        net: Network,
        store: Option<Store>,
    ) -> Arc<Self> {
        let subsystems = Subsystems::new(config.container.freezer_timeout_ms);
        Self::assemble(config, cgroups, subsystems, net, store, None)
    }

    fn assemble(
        config: Config,
        cgroups: CgroupDriver,
        subsystems: Subsystems,
        net: Network,
        store: Option<Store>,
        helper_init_path: Option<PathBuf>,
    ) -> Arc<Self> {
        let probes = DataProbes {
            memory_supported: cgroups.supported("memory"),
            cpuacct_supported: cgroups.supported("cpuacct"),
            blkio_supported: cgroups.supported("blkio"),
            max_rss_supported: cgroups
                .root("memory")
                .map(|root| subsystems.memory.supports_max_rss(&root))
                .unwrap_or(false),
        };
        let mut registry = Registry::empty();
        register_properties(&mut registry);
        register_data(&mut registry, probes);

        Arc::new(Self {
            config,
            cgroups,
            subsystems,
            net: Mutex::new(net),
            registry,
            tree: Mutex::new(ContainerTree::new()),
            stats: Statistics::new(current_time_ms()),
            store,
            helper_init_path,
            death_gate: (Mutex::new(0), Condvar::new()),
        })
    }

    pub fn container(&self, name: &str) -> Result<Arc<Container>> {
        self.tree.lock().expect("tree lock poisoned").get(name)
    }

    pub fn container_counts(&self) -> (u64, u64) {
        (
            self.stats.containers.load(Ordering::Relaxed),
            self.stats.running.load(Ordering::Relaxed),
        )
    }

    // ─── field access ───────────────────────────────────────────────────────

    /// Resolve a field for a locked container: stored value, then the
    /// default producer, then the descriptor default.
    pub fn field_value(&self, ct: &Container, inner: &ContainerInner, key: &str) -> Result<Value> {
        let field = self.registry.lookup(key)?;
        if field.flags.has(FieldFlags::UNSUPPORTED) {
            return Err(Error::new(
                ErrorKind::NotSupported,
                format!("field '{key}' is not supported on this host"),
            ));
        }
        if !field.flags.has(FieldFlags::RUNTIME) {
            if let Some(value) = inner.values.get(key) {
                return Ok(value.clone());
            }
        }
        if let Some(producer) = field.default {
            return producer(self, ct, inner);
        }
        if let Some(value) = &field.default_value {
            return Ok(value.clone());
        }
        Ok(field.zero_value())
    }

    pub fn get_property(&self, name: &str, key: &str) -> Result<String> {
        let ct = self.container(name)?;
        let field = self.registry.lookup(key)?;
        if field.class != FieldClass::Property {
            return Err(Error::new(
                ErrorKind::InvalidProperty,
                format!("'{key}' is not a property"),
            ));
        }
        let inner = ct.lock();
        Ok(self.field_value(&ct, &inner, key)?.display())
    }

    pub fn set_property(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let ct = self.container(name)?;
        let field = self.registry.lookup(key)?;
        if field.class != FieldClass::Property || field.flags.has(FieldFlags::READ_ONLY) {
            return Err(Error::new(
                ErrorKind::InvalidProperty,
                format!("property '{key}' is not writable"),
            ));
        }
        if field.flags.has(FieldFlags::UNSUPPORTED) {
            return Err(Error::new(
                ErrorKind::NotSupported,
                format!("property '{key}' is not supported on this host"),
            ));
        }
        let parsed = Value::parse(field.kind, value)?;
        if let Some(validate) = field.validate {
            validate(&parsed)?;
        }
        {
            let mut inner = ct.lock();
            self.apply_dynamic(&ct, &inner, key, &parsed)?;
            inner.values.set(key, parsed);
        }
        self.commit(&ct)
    }

    /// Properties that take effect on a live container immediately.
    fn apply_dynamic(
        &self,
        ct: &Container,
        inner: &ContainerInner,
        key: &str,
        value: &Value,
    ) -> Result<()> {
        use crate::core::props::{P_MEMORY_LIMIT, P_PIDS_LIMIT};
        if !inner.state().is_live() {
            return Ok(());
        }
        match (key, value) {
            (k, Value::Uint(limit)) if k == P_MEMORY_LIMIT => {
                let cg = self.cgroups.container_cgroup("memory", &ct.name)?;
                self.subsystems.memory.set_limit(&cg, *limit)
            }
            (k, Value::Uint(limit)) if k == P_PIDS_LIMIT => {
                let cg = self.cgroups.container_cgroup("pids", &ct.name)?;
                self.subsystems.pids.set_limit(&cg, *limit)
            }
            _ => Ok(()),
        }
    }

    pub fn get_data(&self, name: &str, key: &str, index: Option<&str>) -> Result<String> {
        let ct = self.container(name)?;
        let field = self.registry.lookup(key)?;
        if field.class != FieldClass::Data {
            return Err(Error::new(
                ErrorKind::InvalidProperty,
                format!("'{key}' is not a data field"),
            ));
        }
        if field.flags.has(FieldFlags::UNSUPPORTED) {
            return Err(Error::new(
                ErrorKind::NotSupported,
                format!("field '{key}' is not supported on this host"),
            ));
        }
        let inner = ct.lock();
        let result = match index {
            Some(idx) => match field.indexed {
                Some(producer) => producer(self, &ct, &inner, idx),
                None => Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("field '{key}' has no indexed access"),
                )),
            },
            None => self.field_value(&ct, &inner, key),
        };
        match result {
            Ok(value) => Ok(value.display()),
            // runtime observation errors degrade to empty values
            Err(e) if field.flags.has(FieldFlags::RUNTIME) && e.kind != ErrorKind::InvalidValue => {
                warn!("cannot read {key} of {}: {e}", ct.name);
                Statistics::bump(&self.stats.warnings);
                Ok(field.zero_value().display())
            }
            Err(e) => Err(e),
        }
    }

    // ─── persistence ────────────────────────────────────────────────────────

    pub fn record_of(&self, ct: &Container, inner: &ContainerInner) -> ContainerRecord {
        ContainerRecord {
            name: ct.name.clone(),
            parent: ct
                .parent
                .upgrade()
                .map(|p| p.name.clone())
                .unwrap_or_else(|| "/".into()),
            state: inner.state(),
            exit_status: inner.exit_status,
            oom_killed: inner.oom_killed,
            respawn_count: inner.respawn_count,
            start_time_ms: inner.start_time_ms,
            death_time_ms: inner.death_time_ms,
            wait_pid: inner.wait_pid,
            task_pid: inner.task_pid,
            task_vpid: inner.task_vpid,
            properties: inner.values.collect_flagged(&self.registry, FieldFlags::PERSISTENT),
        }
    }

    /// Persist one container's record.
    pub fn commit(&self, ct: &Arc<Container>) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        if ct.is_root() {
            return Ok(());
        }
        let record = {
            let inner = ct.lock();
            self.record_of(ct, &inner)
        };
        store.save(&record)
    }

    /// Rebuild the tree from persisted records, applying the restart
    /// recovery rules.
    pub fn restore(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        for record in store.load_all()? {
            if let Err(e) = self.restore_one(&record) {
                warn!("cannot restore container {}: {e}", record.name);
                Statistics::bump(&self.stats.restore_failed);
            }
        }
        Ok(())
    }

    fn restore_one(&self, record: &ContainerRecord) -> Result<()> {
        let ct = {
            let mut tree = self.tree.lock().expect("tree lock poisoned");
            tree.create(&record.name)?
        };
        self.stats.containers.fetch_add(1, Ordering::Relaxed);

        let mut inner = ct.lock();
        inner.exit_status = record.exit_status;
        inner.oom_killed = record.oom_killed;
        inner.respawn_count = record.respawn_count;
        inner.start_time_ms = record.start_time_ms;
        inner.death_time_ms = record.death_time_ms;

        for (key, value) in &record.properties {
            match self.registry.get(key) {
                Some(field) => match Value::parse(field.kind, value) {
                    Ok(parsed) => inner.values.set(key, parsed),
                    Err(e) => warn!("dropping bad value of {key} for {}: {e}", record.name),
                },
                None => warn!("dropping unknown field {key} of {}", record.name),
            }
        }

        match record.state {
            ContainerState::Starting => {
                // a start was in flight when the daemon died
                inner.set_state(ContainerState::Dead);
                inner.start_errno = libc::ECANCELED;
                inner.death_time_ms = current_time_ms();
                inner.clear_task_pids();
            }
            ContainerState::Running | ContainerState::Paused | ContainerState::Meta => {
                if record.task_pid != 0 && proc::pid_alive(record.task_pid) {
                    info!("adopting live container {} (pid {})", record.name, record.task_pid);
                    inner.set_state(record.state);
                    inner.wait_pid = record.wait_pid;
                    inner.task_pid = record.task_pid;
                    inner.task_vpid = record.task_vpid;
                    self.stats.running.fetch_add(1, Ordering::Relaxed);
                } else {
                    inner.set_state(ContainerState::Dead);
                    inner.death_time_ms = current_time_ms();
                    inner.clear_task_pids();
                }
            }
            state => inner.set_state(state),
        }
        drop(inner);
        self.commit(&ct)
    }

    // ─── death notification ─────────────────────────────────────────────────

    pub fn notify_death(&self) {
        let (lock, cv) = &self.death_gate;
        *lock.lock().expect("death gate poisoned") += 1;
        cv.notify_all();
    }

    /// Block until the container reaches Dead or Stopped, bounded by
    /// `timeout`. Returns the final state.
    pub fn wait_death(&self, name: &str, timeout: Duration) -> Result<ContainerState> {
        let deadline = Instant::now() + timeout;
        let (lock, cv) = &self.death_gate;
        let mut generation = lock.lock().expect("death gate poisoned");
        loop {
            {
                let ct = self.container(name)?;
                let state = ct.lock().state();
                if matches!(state, ContainerState::Dead | ContainerState::Stopped) {
                    return Ok(state);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::new(
                    ErrorKind::Timeout,
                    format!("container '{name}' did not stop in time"),
                ));
            }
            let (guard, result) = cv
                .wait_timeout(generation, deadline - now)
                .expect("death gate poisoned");
            generation = guard;
            if result.timed_out() {
                return Err(Error::new(
                    ErrorKind::Timeout,
                    format!("container '{name}' did not stop in time"),
                ));
            }
        }
    }
}

fn load_host_ipc_defaults(config: &mut Config) {
    for key in IPC_SYSCTLS {
        if config.ipc_sysctl_value(key).is_some() {
            continue;
        }
        if let Ok(val) = proc::get_sysctl(key) {
            config.container.ipc_sysctl.push(crate::config::SysctlEntry {
                key: key.to_string(),
                val,
            });
        }
    }
}

fn find_helper_init() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let candidate = exe.parent()?.join("crateinit");
    candidate.exists().then_some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::props::{P_COMMAND, P_ISOLATE, P_MEMORY_LIMIT};
    use crate::core::data::{D_ABSOLUTE_NAME, D_EXIT_STATUS, D_STATE};
    use crate::platform::linux::net::tests_support::fake_network;

    fn test_engine() -> (tempfile::TempDir, Arc<Engine>) {
        let tmp = tempfile::tempdir().unwrap();
        let cgroups =
            CgroupDriver::scratch(&tmp.path().join("cgroup"), &["memory", "freezer", "cpuacct"])
                .unwrap();
        let store = Store::open(&tmp.path().join("state")).unwrap();
        let engine = Engine::with_parts(Config::default(), cgroups, fake_network(), Some(store));
        (tmp, engine)
    }

    fn create(engine: &Arc<Engine>, name: &str) -> Arc<Container> {
        let ct = engine.tree.lock().unwrap().create(name).unwrap();
        engine.stats.containers.fetch_add(1, Ordering::Relaxed);
        ct
    }

    #[test]
    fn property_round_trip() {
        let (_tmp, engine) = test_engine();
        create(&engine, "/a");
        engine.set_property("/a", P_COMMAND, "/bin/true").unwrap();
        assert_eq!(engine.get_property("/a", P_COMMAND).unwrap(), "/bin/true");
        // defaults resolve for unset fields
        assert_eq!(engine.get_property("/a", P_ISOLATE).unwrap(), "true");
        assert_eq!(engine.get_property("/a", "cwd").unwrap(), "/");
    }

    #[test]
    fn set_rejects_bad_values_and_read_only() {
        let (_tmp, engine) = test_engine();
        create(&engine, "/a");
        let err = engine.set_property("/a", P_MEMORY_LIMIT, "lots").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidValue);
        let err = engine.set_property("/a", D_STATE, "running").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidProperty);
        let err = engine.set_property("/a", "bogus", "1").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidProperty);
    }

    #[test]
    fn data_reads_resolve_producers() {
        let (_tmp, engine) = test_engine();
        create(&engine, "/a");
        assert_eq!(engine.get_data("/a", D_ABSOLUTE_NAME, None).unwrap(), "/a");
        assert_eq!(engine.get_data("/a", D_STATE, None).unwrap(), "stopped");
        assert_eq!(engine.get_data("/a", D_EXIT_STATUS, None).unwrap(), "0");
        // data fields reject writes
        let err = engine.set_property("/a", D_EXIT_STATUS, "1").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidProperty);
    }

    #[test]
    fn runtime_read_errors_degrade_to_zero() {
        let (_tmp, engine) = test_engine();
        create(&engine, "/a");
        // no cgroup exists for /a yet, so cpu_usage cannot be read
        assert_eq!(engine.get_data("/a", "cpu_usage", None).unwrap(), "0");
    }

    #[test]
    fn persistent_values_survive_restore() {
        let tmp = tempfile::tempdir().unwrap();
        let make = || {
            let cgroups =
                CgroupDriver::scratch(&tmp.path().join("cgroup"), &["memory"]).unwrap();
            let store = Store::open(&tmp.path().join("state")).unwrap();
            Engine::with_parts(Config::default(), cgroups, fake_network(), Some(store))
        };
        {
            let engine = make();
            create(&engine, "/a");
            engine.set_property("/a", P_COMMAND, "/bin/sleep 1").unwrap();
        }
        let engine = make();
        engine.restore().unwrap();
        assert_eq!(
            engine.get_property("/a", P_COMMAND).unwrap(),
            "/bin/sleep 1"
        );
    }

    #[test]
    fn starting_containers_die_on_restore() {
        let tmp = tempfile::tempdir().unwrap();
        let make = || {
            let cgroups =
                CgroupDriver::scratch(&tmp.path().join("cgroup"), &["memory"]).unwrap();
            let store = Store::open(&tmp.path().join("state")).unwrap();
            Engine::with_parts(Config::default(), cgroups, fake_network(), Some(store))
        };
        {
            let engine = make();
            let ct = create(&engine, "/a");
            ct.lock().set_state(ContainerState::Starting);
            engine.commit(&ct).unwrap();
        }
        let engine = make();
        engine.restore().unwrap();
        assert_eq!(engine.get_data("/a", D_STATE, None).unwrap(), "dead");
    }

    #[test]
    fn dead_running_containers_are_reaped_on_restore() {
        let tmp = tempfile::tempdir().unwrap();
        let make = || {
            let cgroups =
                CgroupDriver::scratch(&tmp.path().join("cgroup"), &["memory"]).unwrap();
            let store = Store::open(&tmp.path().join("state")).unwrap();
            Engine::with_parts(Config::default(), cgroups, fake_network(), Some(store))
        };
        {
            let engine = make();
            let ct = create(&engine, "/a");
            let mut inner = ct.lock();
            inner.set_state(ContainerState::Running);
            inner.task_pid = i32::MAX - 1; // certainly not alive
            drop(inner);
            engine.commit(&ct).unwrap();
        }
        let engine = make();
        engine.restore().unwrap();
        assert_eq!(engine.get_data("/a", D_STATE, None).unwrap(), "dead");
    }

    #[test]
    fn wait_death_times_out_on_live_container() {
        let (_tmp, engine) = test_engine();
        let ct = create(&engine, "/a");
        ct.lock().set_state(ContainerState::Running);
        let err = engine
            .wait_death("/a", Duration::from_millis(50))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }
}
