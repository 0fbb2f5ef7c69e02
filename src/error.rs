use serde::{Deserialize, Serialize};

/// Error classification shared by every subsystem and by the RPC wire.
///
/// The discriminants are the stable wire values; never reorder them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ErrorKind {
    Success = 0,
    Unknown = 1,
    InvalidValue = 2,
    InvalidCommand = 3,
    InvalidProperty = 4,
    Permission = 5,
    NotFound = 6,
    Exists = 7,
    Busy = 8,
    NotSupported = 9,
    ResourceNotAvailable = 10,
    Timeout = 11,
    Aborted = 12,
    Io = 13,
    Filesystem = 14,
    System = 15,
}

impl ErrorKind {
    pub fn wire_value(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Unknown => "unknown",
            Self::InvalidValue => "invalid_value",
            Self::InvalidCommand => "invalid_command",
            Self::InvalidProperty => "invalid_property",
            Self::Permission => "permission",
            Self::NotFound => "not_found",
            Self::Exists => "exists",
            Self::Busy => "busy",
            Self::NotSupported => "not_supported",
            Self::ResourceNotAvailable => "resource_not_available",
            Self::Timeout => "timeout",
            Self::Aborted => "aborted",
            Self::Io => "io",
            Self::Filesystem => "filesystem",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The error type carried through the engine and surfaced over RPC and over
/// the launcher handshake. Low-level operations attach the errno they saw;
/// callers may reclassify the kind without losing it.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{kind}: {msg}")]
pub struct Error {
    pub kind: ErrorKind,
    pub errno: Option<i32>,
    pub msg: String,
}

impl Error {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            errno: None,
            msg: msg.into(),
        }
    }

    /// Capture the calling thread's current errno, with its description
    /// folded into the message.
    pub fn sys(kind: ErrorKind, msg: impl Into<String>) -> Self {
        let errno = nix::errno::Errno::last();
        Self {
            kind,
            errno: Some(errno as i32),
            msg: format!("{}: {}", msg.into(), errno.desc()),
        }
    }

    /// `system` with the current errno, the classification for failed
    /// syscalls nobody reinterprets.
    pub fn system(msg: impl Into<String>) -> Self {
        Self::sys(ErrorKind::System, msg)
    }

    pub fn with_errno(mut self, errno: i32) -> Self {
        self.errno = Some(errno);
        self
    }

    /// Keep errno and description, change the classification.
    pub fn reclassify(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    /// Prefix the description with the launcher stage that failed
    /// (config, setns, mount, exec, handshake).
    pub fn at_stage(mut self, stage: &str) -> Self {
        self.msg = format!("{stage}: {}", self.msg);
        self
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error {
            kind: match e {
                nix::errno::Errno::EACCES | nix::errno::Errno::EPERM => ErrorKind::Permission,
                nix::errno::Errno::ENOENT => ErrorKind::NotFound,
                nix::errno::Errno::EEXIST => ErrorKind::Exists,
                nix::errno::Errno::EBUSY => ErrorKind::Busy,
                nix::errno::Errno::ENOMEM | nix::errno::Errno::EAGAIN => {
                    ErrorKind::ResourceNotAvailable
                }
                _ => ErrorKind::System,
            },
            errno: Some(e as i32),
            msg: e.desc().to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::Permission,
            std::io::ErrorKind::AlreadyExists => ErrorKind::Exists,
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ErrorKind::Timeout,
            _ => ErrorKind::Io,
        };
        Error {
            kind,
            errno: e.raw_os_error(),
            msg: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::new(ErrorKind::InvalidValue, e.to_string())
    }
}

impl From<caps::errors::CapsError> for Error {
    fn from(e: caps::errors::CapsError) -> Self {
        Error::new(ErrorKind::Permission, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_are_stable() {
        assert_eq!(ErrorKind::Success.wire_value(), 0);
        assert_eq!(ErrorKind::InvalidProperty.wire_value(), 4);
        assert_eq!(ErrorKind::Timeout.wire_value(), 11);
        assert_eq!(ErrorKind::System.wire_value(), 15);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let s = serde_json::to_string(&ErrorKind::ResourceNotAvailable).unwrap();
        assert_eq!(s, "\"resource_not_available\"");
        let k: ErrorKind = serde_json::from_str("\"invalid_property\"").unwrap();
        assert_eq!(k, ErrorKind::InvalidProperty);
    }

    #[test]
    fn reclassify_keeps_errno() {
        let e = Error::new(ErrorKind::Unknown, "clone()").with_errno(libc::ENOMEM);
        let e = e.reclassify(ErrorKind::ResourceNotAvailable);
        assert_eq!(e.kind, ErrorKind::ResourceNotAvailable);
        assert_eq!(e.errno, Some(libc::ENOMEM));
    }

    #[test]
    fn error_round_trips_through_json() {
        let e = Error::sys(ErrorKind::Filesystem, "mount /proc");
        let json = serde_json::to_string(&e).unwrap();
        let back: Error = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, e.kind);
        assert_eq!(back.msg, e.msg);
    }
}
