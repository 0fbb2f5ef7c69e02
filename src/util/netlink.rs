use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};

use crate::error::{Error, ErrorKind, Result};

/// Route-socket session used by the network provisioner. One instance per
/// daemon, serialized by the provisioner's lock.
///
/// Message packing lives here so the rest of the crate only sees typed link
/// and class operations.
pub struct RouteSocket {
    sock: Socket,
    seq: u32,
}

#[derive(Debug, Clone, Default)]
pub struct LinkStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
}

#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub index: i32,
    pub name: String,
    pub flags: u32,
    pub stats: LinkStats,
}

impl LinkInfo {
    pub fn is_loopback(&self) -> bool {
        self.flags & (libc::IFF_LOOPBACK as u32) != 0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ClassStats {
    pub bytes: u64,
    pub packets: u32,
    pub drops: u32,
    pub overlimits: u32,
}

/// Typed operations the provisioner needs; tests substitute an in-memory
/// implementation.
pub trait RouteApi: Send {
    fn links(&mut self) -> Result<Vec<LinkInfo>>;
    fn add_qdisc(&mut self, ifindex: i32, major: u16, default_minor: u16) -> Result<()>;
    fn add_class(
        &mut self,
        ifindex: i32,
        parent: u32,
        handle: u32,
        prio: u64,
        rate: u64,
        ceil: u64,
    ) -> Result<()>;
    fn del_class(&mut self, ifindex: i32, handle: u32) -> Result<()>;
    fn class_stats(&mut self, ifindex: i32, handle: u32) -> Result<Option<ClassStats>>;
}

pub fn tc_handle(major: u16, minor: u16) -> u32 {
    (u32::from(major) << 16) | u32::from(minor)
}

const TC_H_ROOT: u32 = 0xFFFF_FFFF;

const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;

const IFLA_IFNAME: u16 = 3;
const IFLA_STATS64: u16 = 23;

const TCA_KIND: u16 = 1;
const TCA_OPTIONS: u16 = 2;
const TCA_STATS: u16 = 3;

const TCA_HTB_PARMS: u16 = 1;
const TCA_HTB_INIT: u16 = 2;

const NLMSG_HDRLEN: usize = 16;

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Classify a negative netlink ack into the provisioner's error set.
pub fn classify_nl_errno(errno: i32, what: &str) -> Error {
    let kind = match errno {
        libc::EBUSY => ErrorKind::Busy,
        libc::ENOENT => ErrorKind::NotFound,
        _ => ErrorKind::Io,
    };
    Error::new(kind, format!("netlink: {what}")).with_errno(errno)
}

struct MsgBuilder {
    buf: Vec<u8>,
}

impl MsgBuilder {
    fn new(msg_type: u16, flags: u16, seq: u32) -> Self {
        let mut buf = vec![0u8; NLMSG_HDRLEN];
        buf[4..6].copy_from_slice(&msg_type.to_ne_bytes());
        buf[6..8].copy_from_slice(&flags.to_ne_bytes());
        buf[8..12].copy_from_slice(&seq.to_ne_bytes());
        MsgBuilder { buf }
    }

    fn payload(mut self, data: &[u8]) -> Self {
        self.buf.extend_from_slice(data);
        self.buf.resize(align4(self.buf.len()), 0);
        self
    }

    fn attr(mut self, attr_type: u16, data: &[u8]) -> Self {
        let len = 4 + data.len();
        self.buf.extend_from_slice(&(len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&attr_type.to_ne_bytes());
        self.buf.extend_from_slice(data);
        self.buf.resize(align4(self.buf.len()), 0);
        self
    }

    /// Append a nested attribute built by `f`.
    fn nested(mut self, attr_type: u16, f: impl FnOnce(Vec<u8>) -> Vec<u8>) -> Self {
        let start = self.buf.len();
        self.buf.extend_from_slice(&[0, 0]);
        self.buf.extend_from_slice(&attr_type.to_ne_bytes());
        let inner = f(Vec::new());
        self.buf.extend_from_slice(&inner);
        self.buf.resize(align4(self.buf.len()), 0);
        let len = (self.buf.len() - start) as u16;
        self.buf[start..start + 2].copy_from_slice(&len.to_ne_bytes());
        self
    }

    fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }
}

fn push_attr(mut buf: Vec<u8>, attr_type: u16, data: &[u8]) -> Vec<u8> {
    let len = 4 + data.len();
    buf.extend_from_slice(&(len as u16).to_ne_bytes());
    buf.extend_from_slice(&attr_type.to_ne_bytes());
    buf.extend_from_slice(data);
    buf.resize(align4(buf.len()), 0);
    buf
}

fn ifinfomsg(index: i32) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[0] = libc::AF_UNSPEC as u8;
    buf[4..8].copy_from_slice(&index.to_ne_bytes());
    buf
}

/// struct tcmsg: family, pad, ifindex, handle, parent, info.
fn tcmsg(index: i32, handle: u32, parent: u32) -> [u8; 20] {
    let mut buf = [0u8; 20];
    buf[0] = libc::AF_UNSPEC as u8;
    buf[4..8].copy_from_slice(&index.to_ne_bytes());
    buf[8..12].copy_from_slice(&handle.to_ne_bytes());
    buf[12..16].copy_from_slice(&parent.to_ne_bytes());
    buf
}

/// struct tc_ratespec with only the rate field populated; modern kernels
/// compute their own timing tables.
fn ratespec(bytes_per_sec: u64) -> [u8; 12] {
    let mut buf = [0u8; 12];
    let rate = bytes_per_sec.min(u64::from(u32::MAX)) as u32;
    buf[8..12].copy_from_slice(&rate.to_ne_bytes());
    buf
}

/// struct tc_htb_opt { rate, ceil, buffer, cbuffer, quantum, level, prio }.
fn htb_opt(prio: u64, rate: u64, ceil: u64) -> [u8; 44] {
    let mut buf = [0u8; 44];
    buf[0..12].copy_from_slice(&ratespec(rate));
    buf[12..24].copy_from_slice(&ratespec(ceil.max(rate)));
    // buffer/cbuffer: one sec worth of tokens, bounded
    let burst = (rate / 8).clamp(1600, 10_000_000) as u32;
    buf[24..28].copy_from_slice(&burst.to_ne_bytes());
    buf[28..32].copy_from_slice(&burst.to_ne_bytes());
    buf[40..44].copy_from_slice(&(prio as u32).to_ne_bytes());
    buf
}

/// struct tc_htb_glob { version, rate2quantum, defcls, debug, direct_pkts }.
fn htb_glob(default_minor: u16) -> [u8; 20] {
    let mut buf = [0u8; 20];
    buf[0..4].copy_from_slice(&3u32.to_ne_bytes());
    buf[4..8].copy_from_slice(&10u32.to_ne_bytes());
    buf[8..12].copy_from_slice(&u32::from(default_minor).to_ne_bytes());
    buf
}

struct NlMsg<'a> {
    msg_type: u16,
    payload: &'a [u8],
}

fn parse_messages(buf: &[u8]) -> Vec<NlMsg<'_>> {
    let mut msgs = Vec::new();
    let mut off = 0;
    while off + NLMSG_HDRLEN <= buf.len() {
        let len = u32::from_ne_bytes(buf[off..off + 4].try_into().unwrap()) as usize;
        if len < NLMSG_HDRLEN || off + len > buf.len() {
            break;
        }
        let msg_type = u16::from_ne_bytes(buf[off + 4..off + 6].try_into().unwrap());
        msgs.push(NlMsg {
            msg_type,
            payload: &buf[off + NLMSG_HDRLEN..off + len],
        });
        off += align4(len);
    }
    msgs
}

/// Iterate rtattrs in `buf`, yielding (type, payload).
fn parse_attrs(buf: &[u8]) -> Vec<(u16, &[u8])> {
    let mut attrs = Vec::new();
    let mut off = 0;
    while off + 4 <= buf.len() {
        let len = u16::from_ne_bytes(buf[off..off + 2].try_into().unwrap()) as usize;
        let attr_type = u16::from_ne_bytes(buf[off + 2..off + 4].try_into().unwrap());
        if len < 4 || off + len > buf.len() {
            break;
        }
        // high bits carry NLA_F_NESTED and friends
        attrs.push((attr_type & 0x3FFF, &buf[off + 4..off + len]));
        off += align4(len);
    }
    attrs
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    buf.get(off..off + 8)
        .map(|b| u64::from_ne_bytes(b.try_into().unwrap()))
        .unwrap_or(0)
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    buf.get(off..off + 4)
        .map(|b| u32::from_ne_bytes(b.try_into().unwrap()))
        .unwrap_or(0)
}

impl RouteSocket {
    pub fn connect() -> Result<Self> {
        let mut sock = Socket::new(NETLINK_ROUTE)
            .map_err(|e| Error::new(ErrorKind::Io, format!("netlink socket: {e}")))?;
        sock.bind_auto()
            .map_err(|e| Error::new(ErrorKind::Io, format!("netlink bind: {e}")))?;
        sock.connect(&SocketAddr::new(0, 0))
            .map_err(|e| Error::new(ErrorKind::Io, format!("netlink connect: {e}")))?;
        Ok(Self { sock, seq: 1 })
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn send(&mut self, msg: &[u8]) -> Result<()> {
        self.sock
            .send(msg, 0)
            .map_err(|e| Error::new(ErrorKind::Io, format!("netlink send: {e}")))?;
        Ok(())
    }

    fn recv(&mut self) -> Result<Vec<u8>> {
        let (buf, _addr) = self
            .sock
            .recv_from_full()
            .map_err(|e| Error::new(ErrorKind::Io, format!("netlink recv: {e}")))?;
        Ok(buf)
    }

    /// Read a single ack for a change request; error acks are classified.
    fn recv_ack(&mut self, what: &str) -> Result<()> {
        let buf = self.recv()?;
        for msg in parse_messages(&buf) {
            if msg.msg_type == NLMSG_ERROR && msg.payload.len() >= 4 {
                let errno = i32::from_ne_bytes(msg.payload[0..4].try_into().unwrap());
                if errno == 0 {
                    return Ok(());
                }
                return Err(classify_nl_errno(-errno, what));
            }
        }
        Err(Error::new(ErrorKind::Io, format!("netlink: no ack for {what}")))
    }

    /// Collect a multipart dump, invoking `f` on every payload of `want_type`.
    fn recv_dump(&mut self, want_type: u16, mut f: impl FnMut(&[u8])) -> Result<()> {
        loop {
            let buf = self.recv()?;
            for msg in parse_messages(&buf) {
                match msg.msg_type {
                    NLMSG_DONE => return Ok(()),
                    NLMSG_ERROR if msg.payload.len() >= 4 => {
                        let errno = i32::from_ne_bytes(msg.payload[0..4].try_into().unwrap());
                        if errno != 0 {
                            return Err(classify_nl_errno(-errno, "dump"));
                        }
                    }
                    t if t == want_type => f(msg.payload),
                    _ => {}
                }
            }
        }
    }
}

impl RouteApi for RouteSocket {
    fn links(&mut self) -> Result<Vec<LinkInfo>> {
        let seq = self.next_seq();
        let msg = MsgBuilder::new(
            libc::RTM_GETLINK,
            (libc::NLM_F_REQUEST | libc::NLM_F_DUMP) as u16,
            seq,
        )
        .payload(&ifinfomsg(0))
        .finish();
        self.send(&msg)?;

        let mut links = Vec::new();
        self.recv_dump(libc::RTM_NEWLINK, |payload| {
            if payload.len() < 16 {
                return;
            }
            let index = i32::from_ne_bytes(payload[4..8].try_into().unwrap());
            let flags = read_u32(payload, 8);
            let mut name = String::new();
            let mut stats = LinkStats::default();
            for (attr_type, data) in parse_attrs(&payload[16..]) {
                match attr_type {
                    IFLA_IFNAME => {
                        name = String::from_utf8_lossy(
                            data.split(|b| *b == 0).next().unwrap_or(data),
                        )
                        .into_owned();
                    }
                    IFLA_STATS64 => {
                        stats = LinkStats {
                            rx_packets: read_u64(data, 0),
                            tx_packets: read_u64(data, 8),
                            rx_bytes: read_u64(data, 16),
                            tx_bytes: read_u64(data, 24),
                            rx_errors: read_u64(data, 32),
                            tx_errors: read_u64(data, 40),
                            rx_dropped: read_u64(data, 48),
                            tx_dropped: read_u64(data, 56),
                        };
                    }
                    _ => {}
                }
            }
            links.push(LinkInfo {
                index,
                name,
                flags,
                stats,
            });
        })?;
        Ok(links)
    }

    fn add_qdisc(&mut self, ifindex: i32, major: u16, default_minor: u16) -> Result<()> {
        let seq = self.next_seq();
        let msg = MsgBuilder::new(
            libc::RTM_NEWQDISC,
            (libc::NLM_F_REQUEST | libc::NLM_F_ACK | libc::NLM_F_CREATE | libc::NLM_F_REPLACE)
                as u16,
            seq,
        )
        .payload(&tcmsg(ifindex, tc_handle(major, 0), TC_H_ROOT))
        .attr(TCA_KIND, b"htb\0")
        .nested(TCA_OPTIONS, |buf| {
            push_attr(buf, TCA_HTB_INIT, &htb_glob(default_minor))
        })
        .finish();
        self.send(&msg)?;
        self.recv_ack("qdisc create")
    }

    fn add_class(
        &mut self,
        ifindex: i32,
        parent: u32,
        handle: u32,
        prio: u64,
        rate: u64,
        ceil: u64,
    ) -> Result<()> {
        let seq = self.next_seq();
        let msg = MsgBuilder::new(
            libc::RTM_NEWTCLASS,
            (libc::NLM_F_REQUEST | libc::NLM_F_ACK | libc::NLM_F_CREATE | libc::NLM_F_REPLACE)
                as u16,
            seq,
        )
        .payload(&tcmsg(ifindex, handle, parent))
        .attr(TCA_KIND, b"htb\0")
        .nested(TCA_OPTIONS, |buf| {
            push_attr(buf, TCA_HTB_PARMS, &htb_opt(prio, rate, ceil))
        })
        .finish();
        self.send(&msg)?;
        self.recv_ack("class create")
    }

    fn del_class(&mut self, ifindex: i32, handle: u32) -> Result<()> {
        let seq = self.next_seq();
        let msg = MsgBuilder::new(
            libc::RTM_DELTCLASS,
            (libc::NLM_F_REQUEST | libc::NLM_F_ACK) as u16,
            seq,
        )
        .payload(&tcmsg(ifindex, handle, 0))
        .finish();
        self.send(&msg)?;
        self.recv_ack("class delete")
    }

    fn class_stats(&mut self, ifindex: i32, handle: u32) -> Result<Option<ClassStats>> {
        let seq = self.next_seq();
        let msg = MsgBuilder::new(
            libc::RTM_GETTCLASS,
            (libc::NLM_F_REQUEST | libc::NLM_F_DUMP) as u16,
            seq,
        )
        .payload(&tcmsg(ifindex, 0, 0))
        .finish();
        self.send(&msg)?;

        let mut found = None;
        self.recv_dump(libc::RTM_NEWTCLASS, |payload| {
            if payload.len() < 20 {
                return;
            }
            let msg_handle = read_u32(payload, 8);
            if msg_handle != handle {
                return;
            }
            for (attr_type, data) in parse_attrs(&payload[20..]) {
                if attr_type == TCA_STATS && data.len() >= 20 {
                    found = Some(ClassStats {
                        bytes: read_u64(data, 0),
                        packets: read_u32(data, 8),
                        drops: read_u32(data, 12),
                        overlimits: read_u32(data, 16),
                    });
                }
            }
        })?;
        Ok(found)
    }
}
