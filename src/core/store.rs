use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::container::ContainerState;
use crate::error::{Error, ErrorKind, Result};
use crate::util::fs as ufs;

/// One persisted record per container. Absent properties take registry
/// defaults on restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub name: String,
    pub parent: String,
    pub state: ContainerState,
    pub exit_status: i32,
    pub oom_killed: bool,
    pub respawn_count: u64,
    pub start_time_ms: u64,
    pub death_time_ms: u64,
    #[serde(default)]
    pub wait_pid: i32,
    #[serde(default)]
    pub task_pid: i32,
    #[serde(default)]
    pub task_vpid: i32,
    /// Persistent property values in wire (string) form.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Filesystem layout: one JSON file per container under the state dir;
/// slashes in names are escaped with '@', which names cannot contain.
pub struct Store {
    dir: PathBuf,
}

fn record_file_name(name: &str) -> String {
    format!("{}.json", name.replace('/', "@"))
}

impl Store {
    pub fn open(state_dir: &Path) -> Result<Self> {
        let dir = state_dir.join("containers");
        ufs::ensure_dir(&dir)?;
        Ok(Self { dir })
    }

    pub fn save(&self, record: &ContainerRecord) -> Result<()> {
        let path = self.dir.join(record_file_name(&record.name));
        let json = serde_json::to_string_pretty(record)?;
        ufs::write_file(&path, &json)
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let path = self.dir.join(record_file_name(name));
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from(e).reclassify(ErrorKind::Filesystem)),
        }
    }

    /// Load every record, parents before children so the tree can be
    /// rebuilt in one pass.
    pub fn load_all(&self) -> Result<Vec<ContainerRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(Error::from)? {
            let entry = entry.map_err(Error::from)?;
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let data = ufs::read_to_string(&path)?;
            match serde_json::from_str::<ContainerRecord>(&data) {
                Ok(record) => records.push(record),
                Err(e) => {
                    log::warn!("skipping unreadable record {}: {e}", path.display());
                }
            }
        }
        records.sort_by_key(|r| r.name.matches('/').count());
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> ContainerRecord {
        ContainerRecord {
            name: name.into(),
            parent: crate::core::container::parent_name(name).into(),
            state: ContainerState::Dead,
            exit_status: 7,
            oom_killed: false,
            respawn_count: 1,
            start_time_ms: 100,
            death_time_ms: 200,
            wait_pid: 0,
            task_pid: 0,
            task_vpid: 0,
            properties: BTreeMap::from([("command".to_string(), "/bin/true".to_string())]),
        }
    }

    #[test]
    fn save_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        store.save(&record("/a")).unwrap();
        store.save(&record("/a/b")).unwrap();

        let records = store.load_all().unwrap();
        assert_eq!(records.len(), 2);
        // parents first
        assert_eq!(records[0].name, "/a");
        assert_eq!(records[1].name, "/a/b");
        assert_eq!(records[1].exit_status, 7);
        assert_eq!(records[1].properties["command"], "/bin/true");
    }

    #[test]
    fn remove_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        store.save(&record("/a")).unwrap();
        store.remove("/a").unwrap();
        store.remove("/a").unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn record_names_are_flat() {
        assert_eq!(record_file_name("/a/b"), "@a@b.json");
    }
}
