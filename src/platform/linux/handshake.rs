use std::io::{Read, Write};
use std::mem;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use nix::sys::socket::{setsockopt, socketpair, sockopt, AddressFamily, SockFlag, SockType};

use crate::error::{Error, ErrorKind, Result};

/// One side of the launcher's handshake socket pair.
///
/// Pids travel as SCM_CREDENTIALS plus a payload copy: the kernel translates
/// the credential pid into the receiver's pid namespace, so one message
/// carries both the host-visible and the namespace-visible pid.
pub struct HandshakeSock {
    stream: UnixStream,
}

pub fn socket_pair() -> Result<(HandshakeSock, HandshakeSock)> {
    let (a, b) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(Error::from)?;
    let a = HandshakeSock {
        stream: UnixStream::from(a),
    };
    let b = HandshakeSock {
        stream: UnixStream::from(b),
    };
    setsockopt(&a.stream, sockopt::PassCred, &true).map_err(Error::from)?;
    setsockopt(&b.stream, sockopt::PassCred, &true).map_err(Error::from)?;
    Ok((a, b))
}

impl HandshakeSock {
    pub fn set_recv_timeout(&self, timeout_ms: u64) -> Result<()> {
        self.stream
            .set_read_timeout(Some(Duration::from_millis(timeout_ms.max(1))))
            .map_err(Error::from)
    }

    /// Send `pid` with matching credentials. Forwarding a pid other than our
    /// own relies on CAP_SYS_ADMIN, which the launcher processes hold.
    pub fn send_pid(&self, pid: i32) -> Result<()> {
        let payload = pid.to_le_bytes();
        let ucred = libc::ucred {
            pid,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        };
        let cred_len = mem::size_of::<libc::ucred>();
        unsafe {
            let mut iov = libc::iovec {
                iov_base: payload.as_ptr() as *mut libc::c_void,
                iov_len: payload.len(),
            };
            let mut cbuf = [0u8; 64];
            let mut msg: libc::msghdr = mem::zeroed();
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_control = cbuf.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = libc::CMSG_SPACE(cred_len as u32) as usize;
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_CREDENTIALS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(cred_len as u32) as usize;
            std::ptr::copy_nonoverlapping(
                &ucred as *const libc::ucred as *const u8,
                libc::CMSG_DATA(cmsg),
                cred_len,
            );
            if libc::sendmsg(self.stream.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) < 0 {
                return Err(Error::system("sendmsg(pid)"));
            }
        }
        Ok(())
    }

    /// Receive one pid message: (host-visible pid, namespace-visible pid).
    pub fn recv_pid(&self) -> Result<(i32, i32)> {
        let mut payload = [0u8; 4];
        let cred_len = mem::size_of::<libc::ucred>();
        unsafe {
            let mut iov = libc::iovec {
                iov_base: payload.as_mut_ptr() as *mut libc::c_void,
                iov_len: payload.len(),
            };
            let mut cbuf = [0u8; 64];
            let mut msg: libc::msghdr = mem::zeroed();
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_control = cbuf.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = libc::CMSG_SPACE(cred_len as u32) as usize;
            let n = libc::recvmsg(self.stream.as_raw_fd(), &mut msg, 0);
            if n < 0 {
                let errno = nix::errno::Errno::last_raw();
                let kind = if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                    ErrorKind::Timeout
                } else {
                    ErrorKind::System
                };
                return Err(Error::new(kind, "recvmsg(pid)").with_errno(errno));
            }
            if n < payload.len() as isize {
                return Err(Error::new(ErrorKind::Io, "short pid message"));
            }
            let vpid = i32::from_le_bytes(payload);
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET
                    && (*cmsg).cmsg_type == libc::SCM_CREDENTIALS
                {
                    let mut ucred: libc::ucred = mem::zeroed();
                    std::ptr::copy_nonoverlapping(
                        libc::CMSG_DATA(cmsg),
                        &mut ucred as *mut libc::ucred as *mut u8,
                        cred_len,
                    );
                    return Ok((ucred.pid, vpid));
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
            // no credentials attached; the payload is all we have
            Ok((vpid, vpid))
        }
    }

    pub fn send_zero(&self) -> Result<()> {
        (&self.stream).write_all(&[0]).map_err(Error::from)
    }

    pub fn recv_zero(&self) -> Result<()> {
        let mut buf = [0u8; 1];
        (&self.stream).read_exact(&mut buf).map_err(Error::from)
    }

    /// Length-prefixed JSON error frame.
    pub fn send_error(&self, err: &Error) -> Result<()> {
        let body = serde_json::to_vec(err)?;
        let mut frame = (body.len() as u32).to_le_bytes().to_vec();
        frame.extend_from_slice(&body);
        (&self.stream).write_all(&frame).map_err(Error::from)
    }

    /// A clean EOF means the peer exec'd without reporting anything: success.
    pub fn recv_error(&self) -> Result<Option<Error>> {
        let mut len_buf = [0u8; 4];
        let mut read = 0;
        while read < len_buf.len() {
            match (&self.stream).read(&mut len_buf[read..]) {
                Ok(0) if read == 0 => return Ok(None),
                Ok(0) => return Err(Error::new(ErrorKind::Io, "truncated error frame")),
                Ok(n) => read += n,
                Err(e) => return Err(Error::from(e)),
            }
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > 1 << 20 {
            return Err(Error::new(ErrorKind::Io, "oversized error frame"));
        }
        let mut body = vec![0u8; len];
        (&self.stream).read_exact(&mut body).map_err(Error::from)?;
        Ok(Some(serde_json::from_slice(&body)?))
    }
}

/// What the parent side still expects from the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    AwaitWPid,
    AwaitVPid,
    AwaitError,
    Done,
}

/// The parent's view of the handshake, generic over the transport so tests
/// drive it with an in-memory channel.
pub trait HandshakeChannel {
    fn recv_pid(&mut self) -> Result<(i32, i32)>;
    fn send_zero(&mut self) -> Result<()>;
    fn recv_error(&mut self) -> Result<Option<Error>>;
}

impl HandshakeChannel for &HandshakeSock {
    fn recv_pid(&mut self) -> Result<(i32, i32)> {
        HandshakeSock::recv_pid(self)
    }

    fn send_zero(&mut self) -> Result<()> {
        HandshakeSock::send_zero(self)
    }

    fn recv_error(&mut self) -> Result<Option<Error>> {
        HandshakeSock::recv_error(self)
    }
}

pub struct Handshake<C> {
    chan: C,
    stage: HandshakeStage,
}

impl<C: HandshakeChannel> Handshake<C> {
    pub fn new(chan: C) -> Self {
        Self {
            chan,
            stage: HandshakeStage::AwaitWPid,
        }
    }

    pub fn stage(&self) -> HandshakeStage {
        self.stage
    }

    fn expect(&self, stage: HandshakeStage) -> Result<()> {
        if self.stage != stage {
            return Err(Error::new(
                ErrorKind::Unknown,
                format!("handshake out of order: at {:?}, wanted {stage:?}", self.stage),
            ));
        }
        Ok(())
    }

    /// Receive (WPid, VPid-so-far) and ack it.
    pub fn recv_wpid(&mut self) -> Result<(i32, i32)> {
        self.expect(HandshakeStage::AwaitWPid)?;
        let pids = self.chan.recv_pid()?;
        self.chan.send_zero()?;
        self.stage = HandshakeStage::AwaitVPid;
        Ok(pids)
    }

    /// Receive (TaskPid, TaskVPid).
    pub fn recv_vpid(&mut self) -> Result<(i32, i32)> {
        self.expect(HandshakeStage::AwaitVPid)?;
        let pids = self.chan.recv_pid()?;
        self.stage = HandshakeStage::AwaitError;
        Ok(pids)
    }

    /// Wake the child for exec and collect its verdict. `None` is success.
    /// A failed wakeup is not fatal: an aborted child has closed its end,
    /// but its error frame is still buffered in the socket.
    pub fn finish(&mut self) -> Result<Option<Error>> {
        self.expect(HandshakeStage::AwaitError)?;
        if let Err(e) = self.chan.send_zero() {
            log::warn!("task wakeup failed: {e}");
        }
        let result = self.chan.recv_error()?;
        self.stage = HandshakeStage::Done;
        Ok(result)
    }
}
