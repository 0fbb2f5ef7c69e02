use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};

use crate::core::registry::ValueMap;
use crate::error::{Error, ErrorKind, Result};
use crate::platform::linux::cgroups::Cgroup;

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Stopped,
    Starting,
    Running,
    Paused,
    Dead,
    /// Group container with no command of its own.
    Meta,
}

impl ContainerState {
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Paused | Self::Meta)
    }

    /// The transitions the state machine is allowed to make.
    pub fn can_transition(self, to: ContainerState) -> bool {
        use ContainerState::*;
        matches!(
            (self, to),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Meta)
                | (Starting, Dead)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Dead)
                | (Running, Stopped)
                | (Paused, Stopped)
                | (Paused, Dead)
                | (Meta, Stopped)
                | (Meta, Dead)
                | (Dead, Stopped)
                | (Dead, Starting)
        )
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Dead => "dead",
            Self::Meta => "meta",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ContainerState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "stopped" => Self::Stopped,
            "starting" => Self::Starting,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "dead" => Self::Dead,
            "meta" => Self::Meta,
            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("unknown state '{s}'"),
                ))
            }
        })
    }
}

/// Mutable half of a container, guarded by its mutex.
#[derive(Debug, Default)]
pub struct ContainerInner {
    pub state_value: Option<ContainerState>,
    pub exit_status: i32,
    pub oom_killed: bool,
    pub respawn_count: u64,
    pub start_errno: i32,
    /// Host pid the daemon waits on (the intermediate's reparented child).
    pub wait_pid: i32,
    /// Host-visible pid of the container's first process.
    pub task_pid: i32,
    /// Namespace-visible pid of the container's first process.
    pub task_vpid: i32,
    /// Pid of the helper init adopted for re-homed tasks.
    pub seize_pid: i32,
    pub start_time_ms: u64,
    pub death_time_ms: u64,
    pub values: ValueMap,
    pub children: Vec<Arc<Container>>,
    /// Cgroup nodes this container owns; removed when it stops.
    pub cgroups: Vec<Cgroup>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
}

impl ContainerInner {
    pub fn state(&self) -> ContainerState {
        self.state_value.unwrap_or(ContainerState::Stopped)
    }

    pub fn set_state(&mut self, state: ContainerState) {
        self.state_value = Some(state);
    }

    pub fn clear_task_pids(&mut self) {
        self.wait_pid = 0;
        self.task_pid = 0;
        self.task_vpid = 0;
        self.seize_pid = 0;
    }
}

/// A named node in the container tree. Identity is immutable; everything
/// else lives behind the per-container mutex. The cancellation flag sits
/// outside so a Stop request can reach a launcher that holds the lock.
pub struct Container {
    pub id: u32,
    pub name: String,
    pub parent: Weak<Container>,
    pub cancel_requested: AtomicBool,
    inner: Mutex<ContainerInner>,
}

impl Container {
    fn new(id: u32, name: String, parent: Weak<Container>, state: ContainerState) -> Arc<Self> {
        let mut inner = ContainerInner::default();
        inner.set_state(state);
        Arc::new(Self {
            id,
            name,
            parent,
            cancel_requested: AtomicBool::new(false),
            inner: Mutex::new(inner),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, ContainerInner> {
        self.inner.lock().expect("container lock poisoned")
    }

    pub fn is_root(&self) -> bool {
        self.name == "/"
    }

    /// Last path component; the root's is "/".
    pub fn basename(&self) -> &str {
        self.name.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or("/")
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

pub fn validate_name(name: &str) -> Result<()> {
    if name == "/" {
        return Err(Error::new(ErrorKind::InvalidValue, "the root container is reserved"));
    }
    if !name.starts_with('/') {
        return Err(Error::new(
            ErrorKind::InvalidValue,
            format!("container name '{name}' must be absolute"),
        ));
    }
    for part in name[1..].split('/') {
        if part.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("container name '{name}' has an empty component"),
            ));
        }
        if !part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            || part == "." || part == ".."
        {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("container name component '{part}' is invalid"),
            ));
        }
    }
    Ok(())
}

pub fn parent_name(name: &str) -> &str {
    match name.rfind('/') {
        Some(0) => "/",
        Some(i) => &name[..i],
        None => "/",
    }
}

/// The rooted tree. Parents own their children; child→parent references are
/// weak and resolve through the id map.
pub struct ContainerTree {
    root: Arc<Container>,
    by_name: HashMap<String, Arc<Container>>,
    by_id: HashMap<u32, Arc<Container>>,
    next_id: u32,
}

impl ContainerTree {
    pub fn new() -> Self {
        let root = Container::new(0, "/".into(), Weak::new(), ContainerState::Meta);
        let mut by_name = HashMap::new();
        let mut by_id = HashMap::new();
        by_name.insert("/".to_string(), root.clone());
        by_id.insert(0, root.clone());
        Self {
            root,
            by_name,
            by_id,
            next_id: 1,
        }
    }

    pub fn root(&self) -> Arc<Container> {
        self.root.clone()
    }

    pub fn get(&self, name: &str) -> Result<Arc<Container>> {
        self.by_name.get(name).cloned().ok_or_else(|| {
            Error::new(ErrorKind::NotFound, format!("container '{name}' not found"))
        })
    }

    pub fn get_by_id(&self, id: u32) -> Option<Arc<Container>> {
        self.by_id.get(&id).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.len() <= 1
    }

    /// Create a container under its (existing) parent.
    pub fn create(&mut self, name: &str) -> Result<Arc<Container>> {
        validate_name(name)?;
        if self.by_name.contains_key(name) {
            return Err(Error::new(
                ErrorKind::Exists,
                format!("container '{name}' already exists"),
            ));
        }
        let parent = self.get(parent_name(name)).map_err(|_| {
            Error::new(
                ErrorKind::NotFound,
                format!("parent of '{name}' does not exist"),
            )
        })?;

        let id = self.next_id;
        self.next_id += 1;
        let ct = Container::new(id, name.to_string(), Arc::downgrade(&parent), ContainerState::Stopped);
        parent.lock().children.push(ct.clone());
        self.by_name.insert(name.to_string(), ct.clone());
        self.by_id.insert(id, ct.clone());
        Ok(ct)
    }

    /// Remove a leaf container from the tree. Fails with `busy` if it still
    /// has children.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        let ct = self.get(name)?;
        if ct.is_root() {
            return Err(Error::new(ErrorKind::Permission, "cannot destroy the root container"));
        }
        if !ct.lock().children.is_empty() {
            return Err(Error::new(
                ErrorKind::Busy,
                format!("container '{name}' still has children"),
            ));
        }
        if let Some(parent) = ct.parent.upgrade() {
            parent.lock().children.retain(|c| c.id != ct.id);
        }
        self.by_name.remove(name);
        self.by_id.remove(&ct.id);
        Ok(())
    }

    /// Containers of a subtree parents-first, the order Start uses so a
    /// parent's namespaces exist before children enter them.
    pub fn subtree_breadth_first(&self, top: &Arc<Container>) -> Vec<Arc<Container>> {
        let mut out = vec![top.clone()];
        let mut i = 0;
        while i < out.len() {
            let children = out[i].lock().children.clone();
            out.extend(children);
            i += 1;
        }
        out
    }

    /// Containers of a subtree children-first, the order Stop uses.
    pub fn subtree_depth_first(&self, top: &Arc<Container>) -> Vec<Arc<Container>> {
        let mut out = self.subtree_breadth_first(top);
        out.reverse();
        out
    }

    /// Resolve a live task pid to its container.
    pub fn find_by_wait_pid(&self, pid: i32) -> Option<Arc<Container>> {
        self.by_id
            .values()
            .find(|ct| ct.lock().wait_pid == pid)
            .cloned()
    }
}

impl Default for ContainerTree {
    fn default() -> Self {
        Self::new()
    }
}
