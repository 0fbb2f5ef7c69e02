//! Shared helpers for the external test suites.
#![allow(dead_code)]

use std::sync::Arc;

use crated::config::Config;
use crated::core::engine::Engine;
use crated::core::store::Store;
use crated::platform::linux::cgroups::CgroupDriver;
use crated::platform::linux::net::Network;
use crated::util::netlink::{ClassStats, LinkInfo, RouteApi};
use crated::Result;

struct EmptyRoute;

impl RouteApi for EmptyRoute {
    fn links(&mut self) -> Result<Vec<LinkInfo>> {
        Ok(Vec::new())
    }
    fn add_qdisc(&mut self, _: i32, _: u16, _: u16) -> Result<()> {
        Ok(())
    }
    fn add_class(&mut self, _: i32, _: u32, _: u32, _: u64, _: u64, _: u64) -> Result<()> {
        Ok(())
    }
    fn del_class(&mut self, _: i32, _: u32) -> Result<()> {
        Ok(())
    }
    fn class_stats(&mut self, _: i32, _: u32) -> Result<Option<ClassStats>> {
        Ok(None)
    }
}

/// Engine over a scratch cgroup tree and a link-less network session.
pub fn scratch_engine(tmp: &tempfile::TempDir) -> Arc<Engine> {
    let mut config = Config::default();
    config.daemon.state_dir = tmp.path().join("state");
    config.container.start_timeout_ms = 2_000;
    config.container.freezer_timeout_ms = 200;
    let cgroups = CgroupDriver::scratch(
        &tmp.path().join("cgroup"),
        &["memory", "freezer", "cpuacct"],
    )
    .unwrap();
    let store = Store::open(&config.daemon.state_dir).unwrap();
    Engine::with_parts(
        config,
        cgroups,
        Network::new(Box::new(EmptyRoute), false),
        Some(store),
    )
}
