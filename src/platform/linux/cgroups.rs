use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::warn;

use crate::error::{Error, ErrorKind, Result};
use crate::util::fs as ufs;

/// Controllers the daemon recognizes. Anything the kernel does not publish
/// in /proc/cgroups is marked unsupported and its dependent fields follow.
pub const CONTROLLERS: &[&str] = &[
    "memory", "cpu", "cpuacct", "freezer", "blkio", "net_cls", "devices", "pids", "systemd",
];

/// Permission bits for created cgroup directories.
pub const CGROUP_MODE: u32 = 0o755;

const TASKS_FILE: &str = "tasks";

/// The mounted root of one controller hierarchy. Co-mounted controllers
/// (e.g. net_cls,net_prio) share a single root.
#[derive(Debug)]
pub struct CgroupRoot {
    pub controller: String,
    /// Every controller name served by this mount.
    pub controllers: Vec<String>,
    pub mount_point: PathBuf,
    pub supported: bool,
}

/// One cgroup directory: `root.mount_point / rel`.
#[derive(Debug, Clone)]
pub struct Cgroup {
    root: Arc<CgroupRoot>,
    rel: PathBuf,
}

impl Cgroup {
    pub fn controller(&self) -> &str {
        &self.root.controller
    }

    pub fn relative_path(&self) -> &Path {
        &self.rel
    }

    pub fn path(&self) -> PathBuf {
        self.root.mount_point.join(&self.rel)
    }

    pub fn is_root(&self) -> bool {
        self.rel.as_os_str().is_empty()
    }

    pub fn child(&self, name: &str) -> Cgroup {
        Cgroup {
            root: self.root.clone(),
            rel: self.rel.join(name),
        }
    }

    /// Create this node and all missing ancestors. Idempotent; an existing
    /// directory with conflicting permissions is reported as `exists`.
    pub fn create(&self) -> Result<()> {
        let path = self.path();
        if path.exists() {
            let meta = fs::metadata(&path).map_err(Error::from)?;
            let mode = meta.permissions().mode() & 0o777;
            if mode != CGROUP_MODE {
                return Err(Error::new(
                    ErrorKind::Exists,
                    format!(
                        "cgroup {} exists with mode {mode:o}, want {CGROUP_MODE:o}",
                        path.display()
                    ),
                ));
            }
            return Ok(());
        }
        fs::DirBuilder::new()
            .recursive(true)
            .mode(CGROUP_MODE)
            .create(&path)
            .map_err(|e| {
                let errno = e.raw_os_error();
                let mut err = Error::new(
                    ErrorKind::Filesystem,
                    format!("cannot create cgroup {}: {e}", path.display()),
                );
                err.errno = errno;
                err
            })
    }

    /// Remove this node. Requires no live tasks and no child nodes.
    pub fn remove(&self) -> Result<()> {
        let path = self.path();
        if !path.exists() {
            return Ok(());
        }
        if !self.tasks()?.is_empty() {
            return Err(Error::new(
                ErrorKind::Busy,
                format!("cgroup {} still has tasks", path.display()),
            ));
        }
        if !self.children()?.is_empty() {
            return Err(Error::new(
                ErrorKind::Busy,
                format!("cgroup {} still has children", path.display()),
            ));
        }
        fs::remove_dir(&path).map_err(|e| match e.raw_os_error() {
            Some(libc::EBUSY) => Error::new(
                ErrorKind::Busy,
                format!("cgroup {} is busy", path.display()),
            )
            .with_errno(libc::EBUSY),
            _ => Error::from(e),
        })
    }

    /// Move a process into this cgroup.
    pub fn attach(&self, pid: i32) -> Result<()> {
        let tasks = self.path().join(TASKS_FILE);
        fs::write(&tasks, pid.to_string()).map_err(|e| match e.raw_os_error() {
            Some(libc::ESRCH) => {
                Error::new(ErrorKind::NotFound, format!("no such process {pid}"))
                    .with_errno(libc::ESRCH)
            }
            Some(libc::EACCES) | Some(libc::EPERM) => Error::new(
                ErrorKind::Permission,
                format!("cgroup {} rejected pid {pid}", self.path().display()),
            )
            .with_errno(e.raw_os_error().unwrap()),
            _ => Error::from(e),
        })
    }

    /// Pids currently attached to this node (not its descendants).
    pub fn tasks(&self) -> Result<Vec<i32>> {
        let content = match fs::read_to_string(self.path().join(TASKS_FILE)) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::from(e)),
        };
        Ok(content
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect())
    }

    pub fn has_knob(&self, key: &str) -> bool {
        self.path().join(key).exists()
    }

    pub fn read_knob(&self, key: &str) -> Result<String> {
        let path = self.path().join(key);
        match ufs::read_knob_file(&path) {
            Ok(v) => Ok(v),
            Err(e) if e.errno == Some(libc::ENOENT) => Err(Error::new(
                ErrorKind::NotSupported,
                format!("knob {key} is not supported by {}", self.root.controller),
            )
            .with_errno(libc::ENOENT)),
            Err(e) => Err(e),
        }
    }

    pub fn write_knob(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path().join(key);
        fs::write(&path, value).map_err(|e| match e.raw_os_error() {
            Some(libc::ENOENT) => Error::new(
                ErrorKind::NotSupported,
                format!("knob {key} is not supported by {}", self.root.controller),
            )
            .with_errno(libc::ENOENT),
            Some(libc::EINVAL) => Error::new(
                ErrorKind::InvalidValue,
                format!("knob {key} rejected value '{value}'"),
            )
            .with_errno(libc::EINVAL),
            Some(libc::EACCES) | Some(libc::EPERM) => Error::new(
                ErrorKind::Permission,
                format!("cannot write knob {key}"),
            )
            .with_errno(e.raw_os_error().unwrap()),
            _ => Error::from(e),
        })
    }

    /// Direct child nodes.
    pub fn children(&self) -> Result<Vec<Cgroup>> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(self.path()) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(Error::from(e)),
        };
        for entry in entries {
            let entry = entry.map_err(Error::from)?;
            if entry.file_type().map_err(Error::from)?.is_dir() {
                out.push(self.child(&entry.file_name().to_string_lossy()));
            }
        }
        Ok(out)
    }

    /// This node and every descendant, parents first.
    pub fn walk(&self) -> Result<Vec<Cgroup>> {
        let mut out = vec![self.clone()];
        let mut i = 0;
        while i < out.len() {
            let children = out[i].children()?;
            out.extend(children);
            i += 1;
        }
        Ok(out)
    }
}

impl std::fmt::Display for Cgroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.root.controller, self.rel.display())
    }
}

/// Controller-root table, built once at daemon startup. Tests construct one
/// over a scratch directory instead of the host's cgroupfs.
pub struct CgroupDriver {
    roots: HashMap<String, Arc<CgroupRoot>>,
}

impl CgroupDriver {
    /// Discover mounted controller hierarchies on the host.
    pub fn detect() -> Result<Self> {
        let kernel = ufs::read_to_string(Path::new("/proc/cgroups")).unwrap_or_default();
        let enabled: Vec<&str> = kernel
            .lines()
            .filter(|l| !l.starts_with('#'))
            .filter_map(|l| l.split_whitespace().next())
            .collect();
        let mounts = ufs::read_to_string(Path::new("/proc/self/mounts"))?;
        Ok(Self::from_tables(&mounts, &enabled))
    }

    /// Build the table from /proc/self/mounts content and the kernel's
    /// controller list. Split out for tests.
    pub fn from_tables(mounts: &str, enabled: &[&str]) -> Self {
        let mut roots: HashMap<String, Arc<CgroupRoot>> = HashMap::new();

        for line in mounts.lines() {
            // device mountpoint fstype options 0 0
            let mut fields = line.split_whitespace();
            let _device = fields.next();
            let (Some(mountpoint), Some(fstype), Some(options)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if fstype != "cgroup" {
                continue;
            }
            let opts: Vec<&str> = options.split(',').collect();
            let served: Vec<String> = CONTROLLERS
                .iter()
                .copied()
                .filter(|c| opts.iter().any(|o| o == c || *o == format!("name={c}")))
                .map(str::to_string)
                .collect();
            if served.is_empty() {
                continue;
            }
            for controller in &served {
                let root = Arc::new(CgroupRoot {
                    controller: controller.clone(),
                    controllers: served.clone(),
                    mount_point: PathBuf::from(mountpoint),
                    supported: true,
                });
                roots.insert(controller.clone(), root);
            }
        }

        for controller in CONTROLLERS {
            let known = *controller == "systemd" || enabled.contains(controller);
            if !roots.contains_key(*controller) {
                if known {
                    warn!("controller {controller} is enabled but not mounted");
                }
                roots.insert(
                    controller.to_string(),
                    Arc::new(CgroupRoot {
                        controller: controller.to_string(),
                        controllers: vec![controller.to_string()],
                        mount_point: PathBuf::new(),
                        supported: false,
                    }),
                );
            } else if !known {
                warn!("controller {controller} is mounted but not in /proc/cgroups");
            }
        }

        Self { roots }
    }

    /// Scratch-directory driver for tests; every listed controller gets a
    /// subdirectory of `base`.
    pub fn scratch(base: &Path, controllers: &[&str]) -> Result<Self> {
        let mut roots = HashMap::new();
        for controller in controllers {
            let mount = base.join(controller);
            ufs::ensure_dir(&mount)?;
            roots.insert(
                controller.to_string(),
                Arc::new(CgroupRoot {
                    controller: controller.to_string(),
                    controllers: vec![controller.to_string()],
                    mount_point: mount,
                    supported: true,
                }),
            );
        }
        Ok(Self { roots })
    }

    pub fn supported(&self, controller: &str) -> bool {
        self.roots.get(controller).map(|r| r.supported).unwrap_or(false)
    }

    pub fn root(&self, controller: &str) -> Result<Cgroup> {
        let root = self.roots.get(controller).ok_or_else(|| {
            Error::new(
                ErrorKind::NotSupported,
                format!("unknown controller '{controller}'"),
            )
        })?;
        if !root.supported {
            return Err(Error::new(
                ErrorKind::NotSupported,
                format!("controller '{controller}' is not mounted"),
            ));
        }
        Ok(Cgroup {
            root: root.clone(),
            rel: PathBuf::new(),
        })
    }

    /// The cgroup for a container name under a controller; `/a/b` maps to
    /// `crated/a/b` under the controller root.
    pub fn container_cgroup(&self, controller: &str, container_name: &str) -> Result<Cgroup> {
        let root = self.root(controller)?;
        let rel = container_name.trim_start_matches('/');
        Ok(Cgroup {
            root: root.root,
            rel: Path::new("crated").join(rel),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (tempfile::TempDir, CgroupDriver) {
        let tmp = tempfile::tempdir().unwrap();
        let driver = CgroupDriver::scratch(tmp.path(), &["memory", "freezer"]).unwrap();
        (tmp, driver)
    }

    #[test]
    fn co_mounted_controllers_share_a_root() {
        let mounts = "\
tmpfs /sys/fs/cgroup tmpfs rw 0 0
cgroup /sys/fs/cgroup/memory cgroup rw,memory 0 0
cgroup /sys/fs/cgroup/net_cls,net_prio cgroup rw,net_cls,net_prio 0 0
cgroup /sys/fs/cgroup/systemd cgroup rw,name=systemd 0 0
";
        let driver = CgroupDriver::from_tables(mounts, &["memory", "net_cls", "net_prio"]);
        assert!(driver.supported("memory"));
        assert!(driver.supported("net_cls"));
        assert!(driver.supported("systemd"));
        assert!(!driver.supported("blkio"));
        assert_eq!(
            driver.root("net_cls").unwrap().path(),
            PathBuf::from("/sys/fs/cgroup/net_cls,net_prio")
        );
    }

    #[test]
    fn unsupported_controller_is_reported() {
        let driver = CgroupDriver::from_tables("", &[]);
        let err = driver.root("memory").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotSupported);
    }

    #[test]
    fn create_is_idempotent() {
        let (_tmp, driver) = scratch();
        let cg = driver.container_cgroup("memory", "/a/b").unwrap();
        cg.create().unwrap();
        cg.create().unwrap();
        assert!(cg.path().is_dir());
        // ancestors were created too
        assert!(cg.path().parent().unwrap().is_dir());
    }

    #[test]
    fn create_detects_wrong_mode() {
        let (_tmp, driver) = scratch();
        let cg = driver.container_cgroup("memory", "/a").unwrap();
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(cg.path())
            .unwrap();
        let err = cg.create().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Exists);
    }

    #[test]
    fn remove_requires_empty() {
        let (_tmp, driver) = scratch();
        let cg = driver.container_cgroup("memory", "/a").unwrap();
        cg.create().unwrap();
        std::fs::write(cg.path().join("tasks"), "123\n").unwrap();
        let err = cg.remove().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Busy);

        std::fs::write(cg.path().join("tasks"), "").unwrap();
        cg.remove().unwrap();
        assert!(!cg.path().exists());
        // removing again is a no-op
        cg.remove().unwrap();
    }

    #[test]
    fn knob_round_trip_and_classification() {
        let (_tmp, driver) = scratch();
        let cg = driver.container_cgroup("memory", "/a").unwrap();
        cg.create().unwrap();
        cg.write_knob("memory.limit_in_bytes", "1048576").unwrap();
        assert_eq!(cg.read_knob("memory.limit_in_bytes").unwrap(), "1048576");

        let err = cg.read_knob("memory.bogus_knob").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotSupported);
    }

    #[test]
    fn walk_lists_descendants_parents_first() {
        let (_tmp, driver) = scratch();
        driver.container_cgroup("memory", "/a/b/c").unwrap().create().unwrap();
        let top = driver.container_cgroup("memory", "/a").unwrap();
        let nodes = top.walk().unwrap();
        let rels: Vec<_> = nodes
            .iter()
            .map(|c| c.relative_path().to_string_lossy().into_owned())
            .collect();
        assert_eq!(rels, vec!["crated/a", "crated/a/b", "crated/a/b/c"]);
    }
}
