use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorKind, Result};

/// Where one of the container's standard streams comes from or goes to.
///
/// Outside files are opened by the intermediate before it enters the
/// container's namespaces; inside files are opened by the child after
/// chroot, as the final ConfigureChild step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdioSpec {
    Null,
    OutsideFile(PathBuf),
    InsideFile(PathBuf),
}

impl StdioSpec {
    fn open(&self, read: bool) -> Result<RawFd> {
        let path = match self {
            StdioSpec::Null => Path::new("/dev/null"),
            StdioSpec::OutsideFile(p) | StdioSpec::InsideFile(p) => p,
        };
        let file = if read {
            OpenOptions::new().read(true).open(path)
        } else {
            OpenOptions::new().create(true).append(true).open(path)
        }
        .map_err(|e| {
            Error::from(e).at_stage(&format!("open stream {}", path.display()))
        })?;
        Ok(file.into_raw_fd())
    }
}

/// The three streams of a task.
#[derive(Debug, Clone)]
pub struct TaskStdio {
    pub stdin: StdioSpec,
    pub stdout: StdioSpec,
    pub stderr: StdioSpec,
}

/// Raw fds held between the outside-open stage and the final dup2. Lives
/// across fork and exec boundaries, so ownership is manual.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenStreams {
    pub stdin: Option<RawFd>,
    pub stdout: Option<RawFd>,
    pub stderr: Option<RawFd>,
}

impl TaskStdio {
    pub fn null() -> Self {
        Self {
            stdin: StdioSpec::Null,
            stdout: StdioSpec::Null,
            stderr: StdioSpec::Null,
        }
    }

    /// Open the streams that live outside the container.
    pub fn open_outside(&self) -> Result<OpenStreams> {
        let mut open = OpenStreams::default();
        if matches!(self.stdin, StdioSpec::OutsideFile(_) | StdioSpec::Null) {
            open.stdin = Some(self.stdin.open(true)?);
        }
        if matches!(self.stdout, StdioSpec::OutsideFile(_) | StdioSpec::Null) {
            open.stdout = Some(self.stdout.open(false)?);
        }
        if matches!(self.stderr, StdioSpec::OutsideFile(_) | StdioSpec::Null) {
            open.stderr = Some(self.stderr.open(false)?);
        }
        Ok(open)
    }

    /// Open the remaining inside paths and wire all three onto fds 0..2.
    pub fn apply_inside(&self, mut open: OpenStreams) -> Result<()> {
        if open.stdin.is_none() {
            open.stdin = Some(self.stdin.open(true)?);
        }
        if open.stdout.is_none() {
            open.stdout = Some(self.stdout.open(false)?);
        }
        if open.stderr.is_none() {
            open.stderr = Some(self.stderr.open(false)?);
        }
        for (fd, target) in [
            (open.stdin.unwrap(), 0),
            (open.stdout.unwrap(), 1),
            (open.stderr.unwrap(), 2),
        ] {
            if unsafe { libc::dup2(fd, target) } < 0 {
                return Err(Error::system("dup2"));
            }
            if fd > 2 {
                unsafe { libc::close(fd) };
            }
        }
        Ok(())
    }
}

/// Copy-out snapshot of a stream log bounded by (offset, limit); the read
/// side of the stdout/stderr data fields.
pub fn read_window(path: &Path, offset: u64, limit: u64) -> Result<String> {
    let mut file = File::open(path).map_err(Error::from)?;
    let size = file.metadata().map_err(Error::from)?.len();
    if offset >= size {
        return Ok(String::new());
    }
    file.seek(SeekFrom::Start(offset)).map_err(Error::from)?;
    let want = limit.min(size - offset) as usize;
    let mut buf = vec![0u8; want];
    let mut read = 0;
    while read < want {
        match file.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) => return Err(Error::from(e)),
        }
    }
    buf.truncate(read);
    String::from_utf8(buf)
        .map_err(|_| Error::new(ErrorKind::InvalidValue, "stream window is not valid utf-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_reads_respect_offset_and_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stdout.log");
        std::fs::write(&path, "hello\nworld\n").unwrap();

        assert_eq!(read_window(&path, 0, 1024).unwrap(), "hello\nworld\n");
        assert_eq!(read_window(&path, 6, 1024).unwrap(), "world\n");
        assert_eq!(read_window(&path, 0, 5).unwrap(), "hello");
        assert_eq!(read_window(&path, 100, 10).unwrap(), "");
    }

    #[test]
    fn outside_open_skips_inside_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("out.log");
        let stdio = TaskStdio {
            stdin: StdioSpec::Null,
            stdout: StdioSpec::OutsideFile(log.clone()),
            stderr: StdioSpec::InsideFile(PathBuf::from("/dev/console")),
        };
        let open = stdio.open_outside().unwrap();
        assert!(open.stdin.is_some());
        assert!(open.stdout.is_some());
        assert!(open.stderr.is_none());
        assert!(log.exists());
        for fd in [open.stdin, open.stdout].into_iter().flatten() {
            unsafe { libc::close(fd) };
        }
    }
}
