//! nf_tables over NETLINK_NETFILTER
//!
//! Writes are sent as nfnetlink batches with an ACK requested per message;
//! reads use plain requests or dumps. One socket is shared and serialised,
//! so replies are always matched against the request just sent.

use super::maps::MapSpec;
use super::{codec, Element, Key, Lookup, PacketFilter, Provisioned, Value, Verdict};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::os::unix::io::RawFd;
use tracing::{debug, trace, warn};

const NFNL_SUBSYS_NFTABLES: u16 = 10;
const NFNL_MSG_BATCH_BEGIN: u16 = 0x10;
const NFNL_MSG_BATCH_END: u16 = 0x11;

/// nf_tables message ids
mod msg {
    pub const NEWTABLE: u16 = 0;
    pub const NEWRULE: u16 = 6;
    pub const NEWSET: u16 = 9;
    pub const GETSET: u16 = 10;
    pub const NEWSETELEM: u16 = 12;
    pub const GETSETELEM: u16 = 13;
    pub const DELSETELEM: u16 = 14;
}

const NLM_F_REQUEST: u16 = 0x1;
const NLM_F_ACK: u16 = 0x4;
const NLM_F_DUMP: u16 = 0x300;
const NLM_F_CREATE: u16 = 0x400;

const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;

const NLMSG_HDRLEN: usize = 16;
const NFGENMSG_LEN: usize = 4;
const NLA_HDRLEN: usize = 4;
const NLA_F_NESTED: u16 = 0x8000;
const NLA_TYPE_MASK: u16 = 0x3fff;

/// NFTA_* attribute ids
mod attr {
    pub const TABLE_NAME: u16 = 1;

    pub const SET_TABLE: u16 = 1;
    pub const SET_NAME: u16 = 2;
    pub const SET_FLAGS: u16 = 3;
    pub const SET_KEY_TYPE: u16 = 4;
    pub const SET_KEY_LEN: u16 = 5;
    pub const SET_DATA_TYPE: u16 = 6;
    pub const SET_DATA_LEN: u16 = 7;
    pub const SET_DESC: u16 = 9;
    pub const SET_DESC_CONCAT: u16 = 2;
    pub const SET_FIELD_LEN: u16 = 1;

    pub const LIST_ELEM: u16 = 1;

    pub const ELEM_LIST_TABLE: u16 = 1;
    pub const ELEM_LIST_SET: u16 = 2;
    pub const ELEM_LIST_ELEMENTS: u16 = 3;

    pub const ELEM_KEY: u16 = 1;
    pub const ELEM_DATA: u16 = 2;
    pub const ELEM_FLAGS: u16 = 3;
    pub const ELEM_KEY_END: u16 = 10;

    pub const DATA_VALUE: u16 = 1;
    pub const DATA_VERDICT: u16 = 2;
    pub const VERDICT_CODE: u16 = 1;
    pub const VERDICT_CHAIN: u16 = 2;

    pub const RULE_TABLE: u16 = 1;
    pub const RULE_CHAIN: u16 = 2;
    pub const RULE_EXPRESSIONS: u16 = 4;

    pub const EXPR_NAME: u16 = 1;
    pub const EXPR_DATA: u16 = 2;

    pub const META_DREG: u16 = 1;
    pub const META_KEY: u16 = 2;

    pub const PAYLOAD_DREG: u16 = 1;
    pub const PAYLOAD_BASE: u16 = 2;
    pub const PAYLOAD_OFFSET: u16 = 3;
    pub const PAYLOAD_LEN: u16 = 4;

    pub const CMP_SREG: u16 = 1;
    pub const CMP_OP: u16 = 2;
    pub const CMP_DATA: u16 = 3;

    pub const LOOKUP_SET: u16 = 1;
    pub const LOOKUP_SREG: u16 = 2;
    pub const LOOKUP_DREG: u16 = 3;
}

const NFT_SET_ELEM_INTERVAL_END: u32 = 0x1;
const NFT_SET_INTERVAL: u32 = 0x4;

const NFT_REG_VERDICT: u32 = 0;
const NFT_REG_1: u32 = 1;
const NFT_REG32_00: u32 = 8;

const NFT_META_IIFNAME: u32 = 6;
const NFT_META_OIFNAME: u32 = 7;
const NFT_META_IIFTYPE: u32 = 8;
const NFT_META_NFPROTO: u32 = 15;

const NFT_PAYLOAD_LL_HEADER: u32 = 0;
const NFT_PAYLOAD_NETWORK_HEADER: u32 = 1;

const NFT_CMP_EQ: u32 = 0;
const ARPHRD_ETHER: u16 = 1;
const NFPROTO_IPV4: u8 = 2;

const RECV_BUF_SIZE: usize = 1 << 16;

/// Attribute payload builder.
#[derive(Debug, Default)]
pub(super) struct AttrBuf {
    buf: Vec<u8>,
}

impl AttrBuf {
    fn new() -> Self {
        Self::default()
    }

    fn align(&mut self) {
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
    }

    fn put(&mut self, ty: u16, data: &[u8]) {
        let len = (NLA_HDRLEN + data.len()) as u16;
        self.buf.extend_from_slice(&len.to_ne_bytes());
        self.buf.extend_from_slice(&ty.to_ne_bytes());
        self.buf.extend_from_slice(data);
        self.align();
    }

    fn put_u32(&mut self, ty: u16, v: u32) {
        self.put(ty, &v.to_be_bytes());
    }

    fn put_str(&mut self, ty: u16, s: &str) {
        let mut data = Vec::with_capacity(s.len() + 1);
        data.extend_from_slice(s.as_bytes());
        data.push(0);
        self.put(ty, &data);
    }

    fn nest_start(&mut self, ty: u16) -> usize {
        let start = self.buf.len();
        self.buf.extend_from_slice(&0u16.to_ne_bytes());
        self.buf.extend_from_slice(&(ty | NLA_F_NESTED).to_ne_bytes());
        start
    }

    fn nest_end(&mut self, start: usize) {
        let len = (self.buf.len() - start) as u16;
        self.buf[start..start + 2].copy_from_slice(&len.to_ne_bytes());
    }

    fn nested(&mut self, ty: u16, body: impl FnOnce(&mut Self)) {
        let start = self.nest_start(ty);
        body(self);
        self.nest_end(start);
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Iterator over a run of netlink attributes.
pub(super) struct Attrs<'a> {
    buf: &'a [u8],
}

impl<'a> Attrs<'a> {
    pub(super) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for Attrs<'a> {
    type Item = Result<(u16, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < NLA_HDRLEN {
            return None;
        }
        let len = u16::from_ne_bytes([self.buf[0], self.buf[1]]) as usize;
        let ty = u16::from_ne_bytes([self.buf[2], self.buf[3]]) & NLA_TYPE_MASK;
        if len < NLA_HDRLEN || len > self.buf.len() {
            self.buf = &[];
            return Some(Err(Error::Protocol(format!("bad attribute length {}", len))));
        }
        let payload = &self.buf[NLA_HDRLEN..len];
        let advance = ((len + 3) & !3).min(self.buf.len());
        self.buf = &self.buf[advance..];
        Some(Ok((ty, payload)))
    }
}

fn be_u32(data: &[u8]) -> Result<u32> {
    data.get(..4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| Error::Protocol("short u32 attribute".into()))
}

fn nul_str(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// Header of a received netlink message.
#[derive(Debug, Clone, Copy)]
pub(super) struct MsgHeader {
    pub ty: u16,
    pub seq: u32,
}

/// Split a receive buffer into (header, payload) pairs.
pub(super) fn messages(buf: &[u8]) -> Result<Vec<(MsgHeader, &[u8])>> {
    let mut out = Vec::new();
    let mut rest = buf;
    while rest.len() >= NLMSG_HDRLEN {
        let len = u32::from_ne_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        if len < NLMSG_HDRLEN || len > rest.len() {
            return Err(Error::Protocol(format!("bad message length {}", len)));
        }
        let ty = u16::from_ne_bytes([rest[4], rest[5]]);
        let seq = u32::from_ne_bytes([rest[8], rest[9], rest[10], rest[11]]);
        out.push((MsgHeader { ty, seq }, &rest[NLMSG_HDRLEN..len]));
        let advance = ((len + 3) & !3).min(rest.len());
        rest = &rest[advance..];
    }
    Ok(out)
}

/// Append one nfnetlink message to `buf`.
pub(super) fn push_message(
    buf: &mut Vec<u8>,
    ty: u16,
    flags: u16,
    seq: u32,
    family: u8,
    res_id: u16,
    attrs: &[u8],
) {
    let len = (NLMSG_HDRLEN + NFGENMSG_LEN + attrs.len()) as u32;
    buf.extend_from_slice(&len.to_ne_bytes());
    buf.extend_from_slice(&ty.to_ne_bytes());
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&seq.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());
    // nfgenmsg
    buf.push(family);
    buf.push(0);
    buf.extend_from_slice(&res_id.to_be_bytes());
    buf.extend_from_slice(attrs);
}

fn nft_type(m: u16) -> u16 {
    (NFNL_SUBSYS_NFTABLES << 8) | m
}

/// The errno carried in an NLMSG_ERROR payload (0 for an ACK).
fn error_code(payload: &[u8]) -> Result<i32> {
    payload
        .get(..4)
        .map(|b| i32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| Error::Protocol("short error message".into()))
}

/// One message of a write batch.
struct Request {
    ty: u16,
    flags: u16,
    family: u8,
    attrs: Vec<u8>,
}

struct Socket {
    fd: RawFd,
    seq: u32,
}

impl Socket {
    fn open() -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_NETFILTER,
            )
        };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as u16;

        let ret = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as u32,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Io(err));
        }

        let seed = chrono::Utc::now().timestamp() as u32;
        Ok(Self { fd, seq: seed })
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn send(&self, buf: &[u8]) -> io::Result<()> {
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as u16;

        let n = unsafe {
            libc::sendto(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as u32,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = unsafe {
                libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(n as usize);
        }
    }

    /// Send a write batch and wait for one ACK per message.
    fn batch(&mut self, requests: &[Request]) -> io::Result<()> {
        let mut buf = Vec::with_capacity(256);
        let begin_seq = self.next_seq();
        push_message(
            &mut buf,
            NFNL_MSG_BATCH_BEGIN,
            NLM_F_REQUEST,
            begin_seq,
            libc::AF_UNSPEC as u8,
            NFNL_SUBSYS_NFTABLES,
            &[],
        );

        let mut pending = HashSet::new();
        for req in requests {
            let seq = self.next_seq();
            push_message(
                &mut buf,
                nft_type(req.ty),
                NLM_F_REQUEST | NLM_F_ACK | req.flags,
                seq,
                req.family,
                0,
                &req.attrs,
            );
            pending.insert(seq);
        }

        let end_seq = self.next_seq();
        push_message(
            &mut buf,
            NFNL_MSG_BATCH_END,
            NLM_F_REQUEST,
            end_seq,
            libc::AF_UNSPEC as u8,
            NFNL_SUBSYS_NFTABLES,
            &[],
        );

        self.send(&buf)?;

        let mut rbuf = vec![0u8; RECV_BUF_SIZE];
        let mut first_err: Option<io::Error> = None;
        while !pending.is_empty() {
            let n = self.recv(&mut rbuf)?;
            let msgs = messages(&rbuf[..n]).map_err(to_io)?;
            for (hdr, payload) in msgs {
                if hdr.ty != NLMSG_ERROR {
                    continue;
                }
                let code = error_code(payload).map_err(to_io)?;
                if !pending.remove(&hdr.seq) {
                    // the batch itself was refused
                    if code != 0 {
                        return Err(io::Error::from_raw_os_error(-code));
                    }
                    continue;
                }
                if code != 0 && first_err.is_none() {
                    first_err = Some(io::Error::from_raw_os_error(-code));
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Send a read request and collect every reply message up to the
    /// terminating DONE or ACK.
    fn request(&mut self, ty: u16, flags: u16, family: u8, attrs: &[u8]) -> io::Result<Vec<Vec<u8>>> {
        let seq = self.next_seq();
        let mut buf = Vec::with_capacity(64);
        push_message(&mut buf, nft_type(ty), NLM_F_REQUEST | flags, seq, family, 0, attrs);
        self.send(&buf)?;

        let mut rbuf = vec![0u8; RECV_BUF_SIZE];
        let mut replies = Vec::new();
        loop {
            let n = self.recv(&mut rbuf)?;
            let msgs = messages(&rbuf[..n]).map_err(to_io)?;
            for (hdr, payload) in msgs {
                if hdr.seq != seq {
                    trace!("netlink: skipping stale message seq={}", hdr.seq);
                    continue;
                }
                match hdr.ty {
                    NLMSG_DONE => return Ok(replies),
                    NLMSG_ERROR => {
                        let code = error_code(payload).map_err(to_io)?;
                        if code != 0 {
                            return Err(io::Error::from_raw_os_error(-code));
                        }
                        return Ok(replies);
                    }
                    _ => replies.push(payload.to_vec()),
                }
            }
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

fn to_io(err: Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err.to_string())
}

fn is_errno(err: &io::Error, errno: i32) -> bool {
    err.raw_os_error() == Some(errno)
}

/// Kernel-backed packet filter.
pub struct NetlinkFilter {
    sock: Mutex<Socket>,
    shapes: Mutex<HashMap<(String, String), MapSpec>>,
}

impl NetlinkFilter {
    pub fn open() -> Result<Self> {
        let sock = Socket::open()?;
        debug!("netlink: opened NETLINK_NETFILTER socket");
        Ok(Self {
            sock: Mutex::new(sock),
            shapes: Mutex::new(HashMap::new()),
        })
    }

    fn write(&self, op: &'static str, map: &MapSpec, requests: &[Request]) -> Result<()> {
        self.sock
            .lock()
            .batch(requests)
            .map_err(|e| kernel_error(op, map, e))
    }

    fn query_set(&self, map: &MapSpec) -> io::Result<Vec<Vec<u8>>> {
        let mut attrs = AttrBuf::new();
        attrs.put_str(attr::SET_TABLE, &map.table);
        attrs.put_str(attr::SET_NAME, &map.name);
        self.sock
            .lock()
            .request(msg::GETSET, NLM_F_ACK, map.family.nfproto(), &attrs.into_bytes())
    }
}

fn kernel_error(op: &'static str, map: &MapSpec, err: io::Error) -> Error {
    if is_errno(&err, libc::ENOENT) {
        if op == "delete" {
            return Error::ElementNotFound {
                map: map.name.clone(),
            };
        }
        return Error::MapNotFound {
            table: map.table.clone(),
            map: map.name.clone(),
        };
    }
    Error::Netfilter {
        op,
        map: map.name.clone(),
        source: err,
    }
}

fn enumeration_error(map: &MapSpec, err: io::Error) -> Error {
    if is_errno(&err, libc::EINVAL) {
        return Error::EnumerationUnsupported {
            map: map.name.clone(),
            reason: "netlink receive: invalid argument".into(),
        };
    }
    kernel_error("list", map, err)
}

/// Attributes of NFT_MSG_NEWTABLE.
pub(super) fn table_attrs(table: &str) -> Vec<u8> {
    let mut a = AttrBuf::new();
    a.put_str(attr::TABLE_NAME, table);
    a.into_bytes()
}

/// Attributes of NFT_MSG_NEWSET for `map`.
pub(super) fn set_attrs(map: &MapSpec) -> Vec<u8> {
    let mut a = AttrBuf::new();
    a.put_str(attr::SET_TABLE, &map.table);
    a.put_str(attr::SET_NAME, &map.name);
    a.put_u32(attr::SET_FLAGS, map.set_flags());
    a.put_u32(attr::SET_KEY_TYPE, map.key_type());
    a.put_u32(attr::SET_KEY_LEN, map.key_len() as u32);
    a.put_u32(attr::SET_DATA_TYPE, map.data_type());
    if !map.is_verdict_map() {
        a.put_u32(attr::SET_DATA_LEN, map.data_len() as u32);
    }
    if map.is_concat() {
        a.nested(attr::SET_DESC, |a| {
            a.nested(attr::SET_DESC_CONCAT, |a| {
                for field in &map.key {
                    a.nested(attr::LIST_ELEM, |a| {
                        a.put_u32(attr::SET_FIELD_LEN, field.field_len() as u32);
                    });
                }
            });
        });
    }
    a.into_bytes()
}

fn put_verdict(a: &mut AttrBuf, verdict: &Verdict) {
    a.nested(attr::DATA_VERDICT, |a| {
        a.put_u32(attr::VERDICT_CODE, verdict.code() as u32);
        if let Some(chain) = verdict.chain() {
            a.put_str(attr::VERDICT_CHAIN, chain);
        }
    });
}

/// Element list attributes. `value` is `None` for deletes.
pub(super) fn element_attrs(map: &MapSpec, key: &Key, value: Option<&Value>) -> Result<Vec<u8>> {
    let key_len = map.key_len();
    if key.bytes.len() > key_len {
        return Err(Error::Parse(format!(
            "key of {} bytes exceeds {} key length {}",
            key.bytes.len(),
            map.name,
            key_len
        )));
    }
    if key.is_range() && !map.interval {
        return Err(Error::Parse(format!("{} does not hold ranges", map.name)));
    }

    let data = match value {
        Some(Value::Data(_)) if map.is_verdict_map() => {
            return Err(Error::Parse(format!("{} expects a verdict", map.name)))
        }
        Some(v) if !map.is_verdict_map() => Some(v.data_for(map)?),
        _ => None,
    };

    let start = codec::pad_to(&key.bytes, key_len);
    let end = codec::pad_to(key.end_or_start(), key_len);

    let mut a = AttrBuf::new();
    a.put_str(attr::ELEM_LIST_TABLE, &map.table);
    a.put_str(attr::ELEM_LIST_SET, &map.name);
    a.nested(attr::ELEM_LIST_ELEMENTS, |a| {
        a.nested(attr::LIST_ELEM, |a| {
            a.nested(attr::ELEM_KEY, |a| a.put(attr::DATA_VALUE, &start));
            if map.interval {
                a.nested(attr::ELEM_KEY_END, |a| a.put(attr::DATA_VALUE, &end));
            }
            match (value, &data) {
                (_, Some(bytes)) => a.nested(attr::ELEM_DATA, |a| a.put(attr::DATA_VALUE, bytes)),
                (Some(Value::Verdict(v)), None) => a.nested(attr::ELEM_DATA, |a| put_verdict(a, v)),
                _ => {}
            }
        });
    });
    Ok(a.into_bytes())
}

fn flush_attrs(map: &MapSpec) -> Vec<u8> {
    let mut a = AttrBuf::new();
    a.put_str(attr::ELEM_LIST_TABLE, &map.table);
    a.put_str(attr::ELEM_LIST_SET, &map.name);
    a.into_bytes()
}

fn expr(a: &mut AttrBuf, name: &str, body: impl FnOnce(&mut AttrBuf)) {
    a.nested(attr::LIST_ELEM, |a| {
        a.put_str(attr::EXPR_NAME, name);
        a.nested(attr::EXPR_DATA, body);
    });
}

fn meta(a: &mut AttrBuf, key: u32, dreg: u32) {
    expr(a, "meta", |a| {
        a.put_u32(attr::META_DREG, dreg);
        a.put_u32(attr::META_KEY, key);
    });
}

fn payload(a: &mut AttrBuf, base: u32, offset: u32, len: u32, dreg: u32) {
    expr(a, "payload", |a| {
        a.put_u32(attr::PAYLOAD_DREG, dreg);
        a.put_u32(attr::PAYLOAD_BASE, base);
        a.put_u32(attr::PAYLOAD_OFFSET, offset);
        a.put_u32(attr::PAYLOAD_LEN, len);
    });
}

fn cmp_eq(a: &mut AttrBuf, sreg: u32, data: &[u8]) {
    expr(a, "cmp", |a| {
        a.put_u32(attr::CMP_SREG, sreg);
        a.put_u32(attr::CMP_OP, NFT_CMP_EQ);
        a.nested(attr::CMP_DATA, |a| a.put(attr::DATA_VALUE, data));
    });
}

fn vmap_lookup(a: &mut AttrBuf, set: &str, sreg: u32) {
    expr(a, "lookup", |a| {
        a.put_str(attr::LOOKUP_SET, set);
        a.put_u32(attr::LOOKUP_SREG, sreg);
        a.put_u32(attr::LOOKUP_DREG, NFT_REG_VERDICT);
    });
}

/// `meta nfproto ipv4 ip daddr . oifname vmap @dst
///  meta iiftype ether ip saddr . iifname . ether saddr vmap @src`
pub(super) fn zone_rule_attrs(table: &str, chain: &str, dst: &str, src: &str) -> Vec<u8> {
    // 32-bit registers: address at 00, ifname at 01..04, MAC at 05..06
    let ip_reg = NFT_REG32_00;
    let ifname_reg = NFT_REG32_00 + 1;
    let mac_reg = NFT_REG32_00 + 5;

    let mut a = AttrBuf::new();
    a.put_str(attr::RULE_TABLE, table);
    a.put_str(attr::RULE_CHAIN, chain);
    a.nested(attr::RULE_EXPRESSIONS, |a| {
        meta(a, NFT_META_NFPROTO, NFT_REG_1);
        cmp_eq(a, NFT_REG_1, &[NFPROTO_IPV4]);
        payload(a, NFT_PAYLOAD_NETWORK_HEADER, 16, 4, ip_reg);
        meta(a, NFT_META_OIFNAME, ifname_reg);
        vmap_lookup(a, dst, ip_reg);

        meta(a, NFT_META_IIFTYPE, NFT_REG_1);
        cmp_eq(a, NFT_REG_1, &ARPHRD_ETHER.to_ne_bytes());
        payload(a, NFT_PAYLOAD_NETWORK_HEADER, 12, 4, ip_reg);
        meta(a, NFT_META_IIFNAME, ifname_reg);
        payload(a, NFT_PAYLOAD_LL_HEADER, 6, 6, mac_reg);
        vmap_lookup(a, src, ip_reg);
    });
    a.into_bytes()
}

/// Pull flags, key length and data type out of a NEWSET reply.
#[derive(Debug, Default, PartialEq, Eq)]
pub(super) struct SetInfo {
    pub flags: u32,
    pub key_len: u32,
    pub data_type: Option<u32>,
}

pub(super) fn parse_set_info(payload: &[u8]) -> Result<SetInfo> {
    let attrs = payload
        .get(NFGENMSG_LEN..)
        .ok_or_else(|| Error::Protocol("short set message".into()))?;
    let mut info = SetInfo::default();
    for a in Attrs::new(attrs) {
        let (ty, data) = a?;
        match ty {
            attr::SET_FLAGS => info.flags = be_u32(data)?,
            attr::SET_KEY_LEN => info.key_len = be_u32(data)?,
            attr::SET_DATA_TYPE => info.data_type = Some(be_u32(data)?),
            _ => {}
        }
    }
    Ok(info)
}

fn parse_data_value(data: &[u8]) -> Result<Vec<u8>> {
    for a in Attrs::new(data) {
        let (ty, inner) = a?;
        if ty == attr::DATA_VALUE {
            return Ok(inner.to_vec());
        }
    }
    Err(Error::Protocol("missing data value".into()))
}

fn parse_verdict(data: &[u8]) -> Result<Verdict> {
    let mut code = None;
    let mut chain = None;
    for a in Attrs::new(data) {
        let (ty, inner) = a?;
        match ty {
            attr::VERDICT_CODE => code = Some(be_u32(inner)? as i32),
            attr::VERDICT_CHAIN => chain = Some(nul_str(inner)),
            _ => {}
        }
    }
    let code = code.ok_or_else(|| Error::Protocol("verdict without code".into()))?;
    Verdict::from_code(code, chain)
}

fn parse_elem_data(data: &[u8]) -> Result<Value> {
    for a in Attrs::new(data) {
        let (ty, inner) = a?;
        match ty {
            attr::DATA_VALUE => return Ok(Value::Data(inner.to_vec())),
            attr::DATA_VERDICT => return Ok(Value::Verdict(parse_verdict(inner)?)),
            _ => {}
        }
    }
    Err(Error::Protocol("empty element data".into()))
}

/// Decode the elements carried in one NEWSETELEM message.
pub(super) fn parse_elements(payload: &[u8]) -> Result<Vec<Element>> {
    let attrs = payload
        .get(NFGENMSG_LEN..)
        .ok_or_else(|| Error::Protocol("short element message".into()))?;
    let mut out = Vec::new();

    for a in Attrs::new(attrs) {
        let (ty, list) = a?;
        if ty != attr::ELEM_LIST_ELEMENTS {
            continue;
        }
        for e in Attrs::new(list) {
            let (_, elem) = e?;
            let mut key = None;
            let mut end = None;
            let mut value = None;
            let mut flags = 0;
            for f in Attrs::new(elem) {
                let (fty, data) = f?;
                match fty {
                    attr::ELEM_KEY => key = Some(parse_data_value(data)?),
                    attr::ELEM_KEY_END => end = Some(parse_data_value(data)?),
                    attr::ELEM_DATA => value = Some(parse_elem_data(data)?),
                    attr::ELEM_FLAGS => flags = be_u32(data)?,
                    _ => {}
                }
            }
            if flags & NFT_SET_ELEM_INTERVAL_END != 0 {
                continue;
            }
            let Some(bytes) = key else { continue };
            out.push(Element::new(
                Key { bytes, end },
                value.unwrap_or(Value::Data(Vec::new())),
            ));
        }
    }
    Ok(out)
}

/// `map` as the kernel declared it. Single-field keys never carry an end,
/// so the interval flag is only taken over for concatenations.
fn kernel_shape(map: &MapSpec, flags: u32) -> MapSpec {
    let mut spec = map.clone();
    spec.interval = map.is_concat() && flags & NFT_SET_INTERVAL != 0;
    spec
}

impl PacketFilter for NetlinkFilter {
    fn ensure_map(&self, map: &MapSpec) -> Result<Provisioned> {
        let id = (map.table.clone(), map.name.clone());
        if let Some(spec) = self.shapes.lock().get(&id) {
            return Ok(Provisioned::existing(spec.clone()));
        }

        let (spec, created) = match self.query_set(map) {
            Ok(replies) => {
                let info = replies
                    .first()
                    .map(|p| parse_set_info(p))
                    .transpose()?
                    .unwrap_or_default();
                if info.key_len as usize != map.key_len() {
                    return Err(Error::Protocol(format!(
                        "{} {} has key length {}, expected {}",
                        map.table,
                        map.name,
                        info.key_len,
                        map.key_len()
                    )));
                }
                (kernel_shape(map, info.flags), false)
            }
            Err(e) if is_errno(&e, libc::ENOENT) => {
                debug!("netlink: creating {}", map);
                let requests = [
                    Request {
                        ty: msg::NEWTABLE,
                        flags: NLM_F_CREATE,
                        family: map.family.nfproto(),
                        attrs: table_attrs(&map.table),
                    },
                    Request {
                        ty: msg::NEWSET,
                        flags: NLM_F_CREATE,
                        family: map.family.nfproto(),
                        attrs: set_attrs(map),
                    },
                ];
                self.write("create", map, &requests)?;
                (map.clone(), true)
            }
            Err(e) if is_errno(&e, libc::EINVAL) => {
                warn!(
                    "netlink: cannot read back {} {}, assuming known shape",
                    map.table, map.name
                );
                (map.clone(), false)
            }
            Err(e) => return Err(kernel_error("lookup", map, e)),
        };

        self.shapes.lock().insert(id, spec.clone());
        Ok(Provisioned { spec, created })
    }

    fn add_element(&self, map: &MapSpec, element: &Element) -> Result<()> {
        let attrs = element_attrs(map, &element.key, Some(&element.value))?;
        trace!("netlink: add {} ({} bytes)", map.name, attrs.len());
        self.write(
            "add",
            map,
            &[Request {
                ty: msg::NEWSETELEM,
                flags: NLM_F_CREATE,
                family: map.family.nfproto(),
                attrs,
            }],
        )
    }

    fn delete_element(&self, map: &MapSpec, key: &Key) -> Result<()> {
        let attrs = element_attrs(map, key, None)?;
        self.write(
            "delete",
            map,
            &[Request {
                ty: msg::DELSETELEM,
                flags: 0,
                family: map.family.nfproto(),
                attrs,
            }],
        )
    }

    fn get_element(&self, map: &MapSpec, key: &Key) -> Result<Lookup> {
        let elements = match self.list_elements(map) {
            Ok(e) => e,
            Err(e) if e.is_enumeration_quirk() => {
                debug!("netlink: {} not enumerable, assuming present", map.name);
                return Ok(Lookup::Unverified);
            }
            Err(Error::MapNotFound { .. }) => return Ok(Lookup::Absent),
            Err(e) => return Err(e),
        };
        let want = codec::pad_to(&key.bytes, map.key_len());
        Ok(elements
            .into_iter()
            .find(|e| codec::pad_to(&e.key.bytes, map.key_len()) == want)
            .map(Lookup::Present)
            .unwrap_or(Lookup::Absent))
    }

    fn list_elements(&self, map: &MapSpec) -> Result<Vec<Element>> {
        let replies = self
            .sock
            .lock()
            .request(msg::GETSETELEM, NLM_F_DUMP, map.family.nfproto(), &flush_attrs(map))
            .map_err(|e| enumeration_error(map, e))?;

        let mut out = Vec::new();
        for payload in &replies {
            out.extend(parse_elements(payload)?);
        }
        Ok(out)
    }

    fn flush_map(&self, map: &MapSpec) -> Result<()> {
        self.write(
            "flush",
            map,
            &[Request {
                ty: msg::DELSETELEM,
                flags: 0,
                family: map.family.nfproto(),
                attrs: flush_attrs(map),
            }],
        )
    }

    fn link_zone_maps(&self, chain: &str, dst: &MapSpec, src: &MapSpec) -> Result<()> {
        debug!(
            "netlink: linking {} and {} from {}",
            dst.name, src.name, chain
        );
        self.write(
            "insert rule",
            dst,
            &[Request {
                ty: msg::NEWRULE,
                flags: NLM_F_CREATE,
                family: dst.family.nfproto(),
                attrs: zone_rule_attrs(&dst.table, chain, &dst.name, &src.name),
            }],
        )
    }
}

impl std::fmt::Debug for NetlinkFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetlinkFilter")
            .field("cached_shapes", &self.shapes.lock().len())
            .finish()
    }
}
