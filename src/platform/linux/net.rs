use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use log::warn;

use crate::error::{Error, ErrorKind, Result};
use crate::util::netlink::{tc_handle, LinkInfo, RouteApi, RouteSocket};

/// Root qdisc major used for every managed link.
const QDISC_MAJOR: u16 = 1;
/// Minor of the default class unclassified traffic falls into.
const DEFAULT_CLASS_MINOR: u16 = 2;
/// Rate applied when a container sets no explicit guarantee (bytes/sec).
const DEFAULT_RATE: u64 = 125_000_000;
/// Priority applied when the map names none.
const DEFAULT_PRIO: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcStatKind {
    TxBytes,
    TxPackets,
    TxDrops,
    TxOverlimits,
    RxBytes,
    RxPackets,
    RxDrops,
}

impl TcStatKind {
    fn is_rx(self) -> bool {
        matches!(self, Self::RxBytes | Self::RxPackets | Self::RxDrops)
    }
}

fn map_value(map: &BTreeMap<String, u64>, link: &str, fallback: u64) -> u64 {
    map.get(link)
        .or_else(|| map.get("default"))
        .copied()
        .unwrap_or(fallback)
}

/// The network provisioner. Owns the route session and the link table;
/// callers serialize access through the engine's network lock.
pub struct Network {
    api: Box<dyn RouteApi>,
    links: Vec<LinkInfo>,
    shaping: bool,
}

impl Network {
    pub fn new(api: Box<dyn RouteApi>, shaping: bool) -> Self {
        Self {
            api,
            links: Vec::new(),
            shaping,
        }
    }

    pub fn connect(shaping: bool) -> Result<Self> {
        Ok(Self::new(Box::new(RouteSocket::connect()?), shaping))
    }

    pub fn links(&self) -> &[LinkInfo] {
        &self.links
    }

    /// Refresh the link table, ignoring loopback, and make sure each managed
    /// link carries the root qdisc with its default class.
    pub fn update_interfaces(&mut self) -> Result<()> {
        let links: Vec<LinkInfo> = self
            .api
            .links()?
            .into_iter()
            .filter(|l| !l.is_loopback())
            .collect();
        if self.shaping {
            for link in &links {
                self.api
                    .add_qdisc(link.index, QDISC_MAJOR, DEFAULT_CLASS_MINOR)?;
            }
        }
        self.links = links;
        Ok(())
    }

    /// Install or update the traffic class scoped to `minor` on every link.
    /// Map keys are link names (with a `default` fallback); unknown links in
    /// the maps are skipped with a warning.
    pub fn update_traffic_classes(
        &mut self,
        parent_minor: u16,
        minor: u16,
        prio: &BTreeMap<String, u64>,
        rate: &BTreeMap<String, u64>,
        ceil: &BTreeMap<String, u64>,
    ) -> Result<()> {
        if !self.shaping {
            return Ok(());
        }
        for key in prio.keys().chain(rate.keys()).chain(ceil.keys()) {
            if key != "default" && !self.links.iter().any(|l| &l.name == key) {
                warn!("traffic class map names unknown link {key}");
            }
        }
        let parent = if parent_minor == 0 {
            tc_handle(QDISC_MAJOR, 0)
        } else {
            tc_handle(QDISC_MAJOR, parent_minor)
        };
        for link in &self.links {
            let rate_v = map_value(rate, &link.name, DEFAULT_RATE);
            self.api.add_class(
                link.index,
                parent,
                tc_handle(QDISC_MAJOR, minor),
                map_value(prio, &link.name, DEFAULT_PRIO),
                rate_v,
                map_value(ceil, &link.name, rate_v),
            )?;
        }
        Ok(())
    }

    /// Remove every class scoped to `minor`. Links that never had one are
    /// fine; anything else is reported.
    pub fn remove_traffic_classes(&mut self, minor: u16) -> Result<()> {
        if !self.shaping {
            return Ok(());
        }
        for link in &self.links {
            match self.api.del_class(link.index, tc_handle(QDISC_MAJOR, minor)) {
                Ok(()) => {}
                Err(e) if e.kind == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Point-in-time counters per link for the class scoped to `minor`.
    pub fn get_traffic_counters(
        &mut self,
        minor: u16,
        kind: TcStatKind,
    ) -> Result<BTreeMap<String, u64>> {
        let mut out = BTreeMap::new();
        if kind.is_rx() {
            // rx is accounted at the link, not the class
            let links: Vec<LinkInfo> = self
                .api
                .links()?
                .into_iter()
                .filter(|l| !l.is_loopback())
                .collect();
            for link in links {
                let value = match kind {
                    TcStatKind::RxBytes => link.stats.rx_bytes,
                    TcStatKind::RxPackets => link.stats.rx_packets,
                    TcStatKind::RxDrops => link.stats.rx_dropped,
                    _ => unreachable!(),
                };
                out.insert(link.name, value);
            }
            return Ok(out);
        }
        for link in &self.links {
            let stats = self
                .api
                .class_stats(link.index, tc_handle(QDISC_MAJOR, minor))?
                .unwrap_or_default();
            let value = match kind {
                TcStatKind::TxBytes => stats.bytes,
                TcStatKind::TxPackets => u64::from(stats.packets),
                TcStatKind::TxDrops => u64::from(stats.drops),
                TcStatKind::TxOverlimits => u64::from(stats.overlimits),
                _ => unreachable!(),
            };
            out.insert(link.name.clone(), value);
        }
        Ok(out)
    }
}

/// Block until every named link reports up, bounded by `timeout`. The child
/// calls this before exec when address autoconfiguration is expected.
pub fn wait_links_up(names: &[String], timeout: Duration) -> Result<()> {
    if names.is_empty() {
        return Ok(());
    }
    let mut sock = RouteSocket::connect()?;
    let deadline = Instant::now() + timeout;
    loop {
        let links = sock.links()?;
        let all_up = names.iter().all(|name| {
            links
                .iter()
                .any(|l| &l.name == name && l.flags & (libc::IFF_UP as u32) != 0)
        });
        if all_up {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::new(
                ErrorKind::Timeout,
                format!("links {names:?} did not come up"),
            ));
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

#[cfg(test)]
pub mod tests_support {
    use super::*;
    use crate::util::netlink::ClassStats;

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

    /// Link-less provisioner for engine and lifecycle tests.
    pub fn fake_network() -> Network {
        Network::new(Box::new(EmptyRoute), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::netlink::{ClassStats, LinkStats};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeRoute {
        classes: Arc<Mutex<BTreeMap<(i32, u32), (u64, u64, u64)>>>,
        qdiscs: Arc<Mutex<Vec<i32>>>,
    }

    fn fake_link(index: i32, name: &str, flags: u32) -> LinkInfo {
        LinkInfo {
            index,
            name: name.into(),
            flags,
            stats: LinkStats {
                rx_bytes: 1000 * index as u64,
                rx_packets: 10,
                rx_dropped: 1,
                ..Default::default()
            },
        }
    }

    impl RouteApi for FakeRoute {
        fn links(&mut self) -> Result<Vec<LinkInfo>> {
            Ok(vec![
                fake_link(1, "lo", libc::IFF_LOOPBACK as u32),
                fake_link(2, "eth0", libc::IFF_UP as u32),
                fake_link(3, "eth1", libc::IFF_UP as u32),
            ])
        }

        fn add_qdisc(&mut self, ifindex: i32, _major: u16, _default_minor: u16) -> Result<()> {
            self.qdiscs.lock().unwrap().push(ifindex);
            Ok(())
        }

        fn add_class(
            &mut self,
            ifindex: i32,
            _parent: u32,
            handle: u32,
            prio: u64,
            rate: u64,
            ceil: u64,
        ) -> Result<()> {
            self.classes
                .lock()
                .unwrap()
                .insert((ifindex, handle), (prio, rate, ceil));
            Ok(())
        }

        fn del_class(&mut self, ifindex: i32, handle: u32) -> Result<()> {
            match self.classes.lock().unwrap().remove(&(ifindex, handle)) {
                Some(_) => Ok(()),
                None => Err(Error::new(ErrorKind::NotFound, "no class")),
            }
        }

        fn class_stats(&mut self, ifindex: i32, handle: u32) -> Result<Option<ClassStats>> {
            Ok(self.classes.lock().unwrap().get(&(ifindex, handle)).map(
                |(_, rate, _)| ClassStats {
                    bytes: *rate,
                    packets: 5,
                    drops: 0,
                    overlimits: 2,
                },
            ))
        }
    }

    fn network() -> (Network, Arc<Mutex<BTreeMap<(i32, u32), (u64, u64, u64)>>>) {
        let fake = FakeRoute::default();
        let classes = fake.classes.clone();
        let mut net = Network::new(Box::new(fake), true);
        net.update_interfaces().unwrap();
        (net, classes)
    }

    #[test]
    fn loopback_is_ignored() {
        let (net, _) = network();
        let names: Vec<_> = net.links().iter().map(|l| l.name.clone()).collect();
        assert_eq!(names, vec!["eth0", "eth1"]);
    }

    #[test]
    fn classes_cover_every_link() {
        let (mut net, classes) = network();
        let mut rate = BTreeMap::new();
        rate.insert("eth0".to_string(), 1_000u64);
        rate.insert("default".to_string(), 2_000u64);
        net.update_traffic_classes(0, 42, &BTreeMap::new(), &rate, &BTreeMap::new())
            .unwrap();

        let classes = classes.lock().unwrap();
        assert_eq!(classes.len(), 2);
        let (_, rate0, ceil0) = classes[&(2, tc_handle(1, 42))];
        assert_eq!(rate0, 1_000);
        assert_eq!(ceil0, 1_000);
        let (_, rate1, _) = classes[&(3, tc_handle(1, 42))];
        assert_eq!(rate1, 2_000);
    }

    #[test]
    fn remove_tolerates_missing_classes() {
        let (mut net, classes) = network();
        net.update_traffic_classes(0, 7, &BTreeMap::new(), &BTreeMap::new(), &BTreeMap::new())
            .unwrap();
        net.remove_traffic_classes(7).unwrap();
        assert!(classes.lock().unwrap().is_empty());
        // second removal sees not_found and keeps going
        net.remove_traffic_classes(7).unwrap();
    }

    #[test]
    fn counters_by_kind() {
        let (mut net, _) = network();
        let mut rate = BTreeMap::new();
        rate.insert("default".to_string(), 9_000u64);
        net.update_traffic_classes(0, 9, &BTreeMap::new(), &rate, &BTreeMap::new())
            .unwrap();

        let tx = net.get_traffic_counters(9, TcStatKind::TxBytes).unwrap();
        assert_eq!(tx["eth0"], 9_000);
        let over = net
            .get_traffic_counters(9, TcStatKind::TxOverlimits)
            .unwrap();
        assert_eq!(over["eth1"], 2);
        let rx = net.get_traffic_counters(9, TcStatKind::RxBytes).unwrap();
        assert_eq!(rx["eth0"], 2_000);
        assert_eq!(rx["eth1"], 3_000);
    }
}
