use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters surfaced through the hidden daemon_stat field.
#[derive(Debug, Default)]
pub struct Statistics {
    pub spawned: AtomicU64,
    pub errors: AtomicU64,
    pub warnings: AtomicU64,
    pub created: AtomicU64,
    pub started: AtomicU64,
    pub remove_dead: AtomicU64,
    pub restore_failed: AtomicU64,
    pub queued_statuses: AtomicU64,
    pub queued_events: AtomicU64,
    pub requests: AtomicU64,
    pub started_ms: AtomicU64,
    /// Current container count, kept by the lifecycle so readers need no
    /// tree lock.
    pub containers: AtomicU64,
    pub running: AtomicU64,
}

impl Statistics {
    pub fn new(now_ms: u64) -> Self {
        let stats = Self::default();
        stats.started_ms.store(now_ms, Ordering::Relaxed);
        stats
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, now_ms: u64, containers: u64, running: u64) -> BTreeMap<String, u64> {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let mut map = BTreeMap::new();
        map.insert("spawned".into(), get(&self.spawned));
        map.insert("errors".into(), get(&self.errors));
        map.insert("warnings".into(), get(&self.warnings));
        map.insert("created".into(), get(&self.created));
        map.insert("started".into(), get(&self.started));
        map.insert("remove_dead".into(), get(&self.remove_dead));
        map.insert("restore_failed".into(), get(&self.restore_failed));
        map.insert("queued_statuses".into(), get(&self.queued_statuses));
        map.insert("queued_events".into(), get(&self.queued_events));
        map.insert("requests".into(), get(&self.requests));
        map.insert(
            "uptime_s".into(),
            now_ms.saturating_sub(get(&self.started_ms)) / 1000,
        );
        map.insert("containers".into(), containers);
        map.insert("running".into(), running);
        map
    }
}
