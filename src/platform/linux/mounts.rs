use std::fs;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};

use crate::error::{Error, ErrorKind, Result};

fn mount_err(what: &str, e: nix::errno::Errno) -> Error {
    Error::from(e)
        .reclassify(ErrorKind::Filesystem)
        .at_stage(&format!("mount {what}"))
}

/// Make the mount tree private so container changes do not leak to the host.
pub fn make_mount_private() -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| mount_err("/ private", e))
}

/// Bind-mount the root onto itself so it becomes a mount point.
pub fn bind_mount_root(root: &Path) -> Result<()> {
    mount(
        Some(root),
        root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| mount_err("bind root", e))
}

fn mount_at(
    root: &Path,
    source: &str,
    target: &str,
    fstype: &str,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    let target_path = root.join(target.trim_start_matches('/'));
    if let Err(e) = fs::create_dir_all(&target_path) {
        return Err(Error::from(e).reclassify(ErrorKind::Filesystem));
    }
    mount(Some(source), &target_path, Some(fstype), flags, data)
        .map_err(|e| mount_err(target, e))
}

/// Switch into `new_root`, stashing and detaching the old root.
pub fn pivot_root(new_root: &Path) -> Result<()> {
    let put_old = new_root.join(".pivot_old");
    fs::create_dir_all(&put_old).map_err(|e| Error::from(e).reclassify(ErrorKind::Filesystem))?;
    nix::unistd::pivot_root(new_root, &put_old).map_err(|e| mount_err("pivot_root", e))?;
    nix::unistd::chdir("/").map_err(|e| mount_err("chdir /", e))?;
    umount2("/.pivot_old", MntFlags::MNT_DETACH).map_err(|e| mount_err("old root", e))?;
    let _ = fs::remove_dir("/.pivot_old");
    Ok(())
}

/// Re-expose an already mounted path as writable.
pub fn bind_remount_writable(path: &Path) -> Result<()> {
    mount(
        Some(path),
        path,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| mount_err("bind", e))?;
    mount(
        None::<&str>,
        path,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT,
        None::<&str>,
    )
    .map_err(|e| mount_err("remount rw", e))
}

/// A device node the container receives in its /dev.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub path: PathBuf,
    pub read: bool,
    pub write: bool,
    pub mknod: bool,
}

impl DeviceSpec {
    /// Resolve major/minor and type from the host node.
    fn host_node(&self) -> Result<(SFlag, u64)> {
        use std::os::unix::fs::FileTypeExt;
        use std::os::unix::fs::MetadataExt;
        let meta = fs::metadata(&self.path).map_err(|e| {
            Error::from(e).at_stage(&format!("device {}", self.path.display()))
        })?;
        let kind = if meta.file_type().is_char_device() {
            SFlag::S_IFCHR
        } else if meta.file_type().is_block_device() {
            SFlag::S_IFBLK
        } else {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("{} is not a device node", self.path.display()),
            ));
        };
        Ok((kind, meta.rdev()))
    }

    /// The matching devices-cgroup rule, e.g. `c 1:3 rwm`.
    pub fn cgroup_rule(&self) -> Result<String> {
        let (kind, rdev) = self.host_node()?;
        let type_char = if kind == SFlag::S_IFCHR { 'c' } else { 'b' };
        let mut perms = String::new();
        if self.read {
            perms.push('r');
        }
        if self.write {
            perms.push('w');
        }
        if self.mknod {
            perms.push('m');
        }
        Ok(format!(
            "{type_char} {}:{} {perms}",
            major_of(rdev),
            minor_of(rdev)
        ))
    }
}

fn major_of(rdev: u64) -> u64 {
    (rdev >> 8) & 0xfff | ((rdev >> 32) & !0xfff)
}

fn minor_of(rdev: u64) -> u64 {
    (rdev & 0xff) | ((rdev >> 12) & !0xff)
}

/// Parse the `devices` property: `/dev/null rwm; /dev/fuse rw; ...`
pub fn parse_devices(spec: &str) -> Result<Vec<DeviceSpec>> {
    let mut out = Vec::new();
    for part in spec.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let mut it = part.split_whitespace();
        let path = it.next().unwrap();
        if !path.starts_with('/') {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("device path '{path}' must be absolute"),
            ));
        }
        let perms = it.next().unwrap_or("rwm");
        if !perms.chars().all(|c| matches!(c, 'r' | 'w' | 'm')) {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("bad device access '{perms}'"),
            ));
        }
        out.push(DeviceSpec {
            path: PathBuf::from(path),
            read: perms.contains('r'),
            write: perms.contains('w'),
            mknod: perms.contains('m'),
        });
    }
    Ok(out)
}

/// Nodes every container /dev carries regardless of the devices property.
pub fn base_devices() -> Vec<(&'static str, u64, u64)> {
    vec![
        ("null", 1, 3),
        ("zero", 1, 5),
        ("full", 1, 7),
        ("random", 1, 8),
        ("urandom", 1, 9),
        ("tty", 5, 0),
    ]
}

/// The mount work the child performs inside a fresh mount namespace, in
/// order: private propagation, root bind + pivot, kernel filesystems, /dev
/// population, device sysfs write access.
#[derive(Debug, Clone)]
pub struct MountPlan {
    /// Container root; "/" means the host view is kept.
    pub root: PathBuf,
    pub devices: Vec<DeviceSpec>,
    /// Sysfs paths made writable for granted devices.
    pub writable_sysfs: Vec<PathBuf>,
}

impl MountPlan {
    pub fn rooted_elsewhere(&self) -> bool {
        self.root != Path::new("/")
    }

    pub fn setup(&self) -> Result<()> {
        make_mount_private()?;

        if self.rooted_elsewhere() {
            bind_mount_root(&self.root)?;
            mount_at(
                &self.root,
                "proc",
                "/proc",
                "proc",
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                None,
            )?;
            mount_at(
                &self.root,
                "sysfs",
                "/sys",
                "sysfs",
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_RDONLY,
                None,
            )?;
            mount_at(
                &self.root,
                "tmpfs",
                "/dev",
                "tmpfs",
                MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
                Some("mode=755,size=65536k"),
            )?;
            mount_at(
                &self.root,
                "devpts",
                "/dev/pts",
                "devpts",
                MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
                Some("newinstance,ptmxmode=0666,mode=0620"),
            )?;
            mount_at(
                &self.root,
                "tmpfs",
                "/dev/shm",
                "tmpfs",
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                Some("mode=1777,size=65536k"),
            )?;
            pivot_root(&self.root)?;
            self.populate_dev()?;
        } else {
            // keep the host layout but give the namespace its own pid view
            mount_at(
                Path::new("/"),
                "proc",
                "/proc",
                "proc",
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                None,
            )?;
        }

        for path in &self.writable_sysfs {
            bind_remount_writable(path)?;
        }
        Ok(())
    }

    /// Create device nodes inside the (pivoted) root.
    fn populate_dev(&self) -> Result<()> {
        let mode = Mode::from_bits_truncate(0o666);
        for (name, major, minor) in base_devices() {
            let path = Path::new("/dev").join(name);
            // devtmpfs may already provide the node
            let _ = mknod(&path, SFlag::S_IFCHR, mode, makedev(major, minor));
        }
        for dev in &self.devices {
            let (kind, rdev) = dev.host_node()?;
            let target = Path::new("/").join(dev.path.strip_prefix("/").unwrap_or(&dev.path));
            if let Some(parent) = target.parent() {
                let _ = fs::create_dir_all(parent);
            }
            mknod(&target, kind, mode, rdev)
                .map_err(|e| mount_err(&format!("mknod {}", target.display()), e))?;
        }
        Ok(())
    }
}

/// Write a file the container may not own by direct write first, falling
/// back to a private bind copy staged under /dev.
pub fn write_private(path: &Path, content: &str) -> Result<()> {
    match fs::write(path, content) {
        Ok(()) => return Ok(()),
        Err(e)
            if !matches!(
                e.raw_os_error(),
                Some(libc::EROFS) | Some(libc::EACCES) | Some(libc::EPERM)
            ) =>
        {
            return Err(Error::from(e).reclassify(ErrorKind::Filesystem))
        }
        Err(_) => {}
    }
    let staged = Path::new("/dev").join(format!(
        ".crated-{}",
        path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
    ));
    fs::write(&staged, content).map_err(|e| Error::from(e).reclassify(ErrorKind::Filesystem))?;
    mount(
        Some(&staged),
        path,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| mount_err("private file", e))
}
