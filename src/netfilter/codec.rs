//! Byte encodings for nftables set keys and values
//!
//! Layouts follow the kernel's register conventions: a single-field key is
//! stored at its natural width, while every field of a concatenated key is
//! padded to a 4-byte boundary.

use super::Verdict;
use crate::types::MacAddr;
use crate::{Error, Result};
use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Interface name field width, including the terminating NUL.
pub const IFNAMSIZ: usize = 16;

/// Bits per sub-type in a concatenated datatype id.
const TYPE_BITS: u32 = 6;

/// nftables datatype ids
pub mod datatype {
    pub const VERDICT: u32 = 1;
    pub const IPADDR: u32 = 7;
    pub const ETHERADDR: u32 = 9;
    pub const INET_PROTOCOL: u32 = 12;
    pub const INET_SERVICE: u32 = 13;
    pub const IFNAME: u32 = 41;
}

/// Field types that appear in policy map keys and values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Ipv4Addr,
    InetService,
    InetProto,
    Ifname,
    EtherAddr,
}

impl FieldType {
    pub fn datatype(self) -> u32 {
        match self {
            FieldType::Ipv4Addr => datatype::IPADDR,
            FieldType::InetService => datatype::INET_SERVICE,
            FieldType::InetProto => datatype::INET_PROTOCOL,
            FieldType::Ifname => datatype::IFNAME,
            FieldType::EtherAddr => datatype::ETHERADDR,
        }
    }

    /// Width of the field when it is the whole key.
    pub fn len(self) -> usize {
        match self {
            FieldType::Ipv4Addr => 4,
            FieldType::InetService => 2,
            FieldType::InetProto => 1,
            FieldType::Ifname => IFNAMSIZ,
            // MACs are always carried register-padded
            FieldType::EtherAddr => 8,
        }
    }

    /// Unpadded width, as declared in a set's concat field description.
    pub fn field_len(self) -> usize {
        match self {
            FieldType::EtherAddr => 6,
            other => other.len(),
        }
    }

    /// Width inside a concatenation.
    pub fn concat_len(self) -> usize {
        (self.field_len() + 3) & !3
    }

    pub fn name(self) -> &'static str {
        match self {
            FieldType::Ipv4Addr => "ipv4_addr",
            FieldType::InetService => "inet_service",
            FieldType::InetProto => "inet_proto",
            FieldType::Ifname => "ifname",
            FieldType::EtherAddr => "ether_addr",
        }
    }
}

/// Encoded length of a key (or data) made of `fields`.
pub fn fields_len(fields: &[FieldType]) -> usize {
    match fields {
        [] => 0,
        [single] => single.len(),
        many => many.iter().map(|f| f.concat_len()).sum(),
    }
}

/// Datatype id of a (possibly concatenated) key.
pub fn concat_type(fields: &[FieldType]) -> u32 {
    fields
        .iter()
        .fold(0u32, |acc, f| (acc << TYPE_BITS) | f.datatype())
}

/// Transport protocols accepted in firewall rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Transport::Tcp => protocol::TCP,
            Transport::Udp => protocol::UDP,
        }
    }
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Transport::Tcp),
            "udp" => Ok(Transport::Udp),
            other => Err(Error::validation(
                "Protocol",
                format!("'{}' is not tcp or udp", other),
            )),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// IANA protocol numbers
pub mod protocol {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

/// Protocol name to IANA number; unknown names must be numeric.
pub fn protocol_number(name: &str) -> Result<u8> {
    match name {
        "tcp" => Ok(protocol::TCP),
        "udp" => Ok(protocol::UDP),
        "icmp" => Ok(protocol::ICMP),
        other => other
            .parse::<u8>()
            .map_err(|_| Error::Parse(format!("unknown protocol '{}'", other))),
    }
}

pub fn encode_ipv4(ip: Ipv4Addr) -> [u8; 4] {
    ip.octets()
}

/// Parse "a.b.c.d" or "a.b.c.d/len" into a network. A bare address is a /32.
pub fn parse_ipv4_or_cidr(s: &str) -> Result<Ipv4Net> {
    if s.contains('/') {
        let net: Ipv4Net = s
            .parse()
            .map_err(|_| Error::Parse(format!("invalid CIDR '{}'", s)))?;
        Ok(net.trunc())
    } else {
        let ip: Ipv4Addr = s
            .parse()
            .map_err(|_| Error::Parse(format!("invalid IPv4 address '{}'", s)))?;
        Ok(Ipv4Net::from(ip))
    }
}

pub fn encode_port(port: u16) -> [u8; 2] {
    port.to_be_bytes()
}

/// Port inside a concatenated key: big-endian, then two bytes of padding.
pub fn encode_port_concat(port: u16) -> [u8; 4] {
    let [hi, lo] = port.to_be_bytes();
    [hi, lo, 0, 0]
}

/// Parse "80" or "1000-2000".
pub fn parse_port_range(s: &str) -> Result<(u16, u16)> {
    let parse = |p: &str| {
        p.parse::<u16>()
            .map_err(|_| Error::Parse(format!("invalid port '{}'", s)))
    };
    match s.split_once('-') {
        Some((lo, hi)) => {
            let (lo, hi) = (parse(lo)?, parse(hi)?);
            if lo > hi {
                return Err(Error::Parse(format!("invalid port range '{}'", s)));
            }
            Ok((lo, hi))
        }
        None => {
            let p = parse(s)?;
            Ok((p, p))
        }
    }
}

pub fn encode_proto_concat(proto: u8) -> [u8; 4] {
    [proto, 0, 0, 0]
}

/// Interface name, NUL padded to IFNAMSIZ.
pub fn encode_ifname(name: &str) -> Result<[u8; IFNAMSIZ]> {
    if name.is_empty() || name.len() >= IFNAMSIZ || name.contains('\0') {
        return Err(Error::Parse(format!("invalid interface name '{}'", name)));
    }
    let mut out = [0u8; IFNAMSIZ];
    out[..name.len()].copy_from_slice(name.as_bytes());
    Ok(out)
}

/// MAC, padded to 8 bytes.
pub fn encode_mac(mac: MacAddr) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..6].copy_from_slice(&mac.0);
    out
}

/// Verdict as a 4-byte big-endian code, for maps whose data is not `verdict`.
pub fn verdict_to_bytes(verdict: &Verdict) -> [u8; 4] {
    verdict.code().to_be_bytes()
}

/// Builds start and end keys field by field.
///
/// Range inputs (CIDRs, port ranges) extend the end key; every other field
/// contributes the same bytes to both, so a key without ranges has
/// `end == start`.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    concat: bool,
    start: Vec<u8>,
    end: Vec<u8>,
    ranged: bool,
}

impl KeyBuilder {
    pub fn new(field_count: usize) -> Self {
        Self {
            concat: field_count > 1,
            start: Vec::with_capacity(32),
            end: Vec::with_capacity(32),
            ranged: false,
        }
    }

    fn push(&mut self, start: &[u8], end: &[u8]) {
        self.start.extend_from_slice(start);
        self.end.extend_from_slice(end);
        if start != end {
            self.ranged = true;
        }
    }

    pub fn addr(mut self, ip: Ipv4Addr) -> Self {
        let b = encode_ipv4(ip);
        self.push(&b, &b);
        self
    }

    /// An address or CIDR. A CIDR spans network through broadcast.
    pub fn ipv4(mut self, s: &str) -> Result<Self> {
        let net = parse_ipv4_or_cidr(s)?;
        self.push(&encode_ipv4(net.network()), &encode_ipv4(net.broadcast()));
        Ok(self)
    }

    pub fn port(mut self, s: &str) -> Result<Self> {
        let (lo, hi) = parse_port_range(s)?;
        if self.concat {
            if lo == hi && lo == 0 {
                return Err(Error::Parse("port 0 is not valid here".into()));
            }
            self.push(&encode_port_concat(lo), &encode_port_concat(hi));
        } else {
            self.push(&encode_port(lo), &encode_port(hi));
        }
        Ok(self)
    }

    pub fn proto(mut self, s: &str) -> Result<Self> {
        let n = protocol_number(s)?;
        if self.concat {
            let b = encode_proto_concat(n);
            self.push(&b, &b);
        } else {
            self.push(&[n], &[n]);
        }
        Ok(self)
    }

    pub fn ifname(mut self, name: &str) -> Result<Self> {
        let b = encode_ifname(name)?;
        self.push(&b, &b);
        Ok(self)
    }

    pub fn mac(mut self, mac: MacAddr) -> Self {
        let b = encode_mac(mac);
        self.push(&b, &b);
        self
    }

    pub fn build(self) -> Key {
        Key {
            bytes: self.start,
            end: if self.ranged { Some(self.end) } else { None },
        }
    }
}

/// An encoded set key; `end` is present only for genuine ranges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    pub bytes: Vec<u8>,
    pub end: Option<Vec<u8>>,
}

impl Key {
    pub fn point(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            end: None,
        }
    }

    /// End key, falling back to the start key for point entries.
    pub fn end_or_start(&self) -> &[u8] {
        self.end.as_deref().unwrap_or(&self.bytes)
    }

    pub fn is_range(&self) -> bool {
        self.end.as_ref().is_some_and(|e| *e != self.bytes)
    }
}

/// Zero-pad `bytes` out to `len`.
pub fn pad_to(bytes: &[u8], len: usize) -> Vec<u8> {
    let mut out = bytes.to_vec();
    if out.len() < len {
        out.resize(len, 0);
    }
    out
}

/// One decoded field of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPart {
    Ipv4(Ipv4Addr),
    Port(u16),
    Proto(u8),
    Ifname(String),
    Mac(MacAddr),
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Ipv4(ip) => write!(f, "{}", ip),
            KeyPart::Port(p) => write!(f, "{}", p),
            KeyPart::Proto(protocol::TCP) => f.write_str("tcp"),
            KeyPart::Proto(protocol::UDP) => f.write_str("udp"),
            KeyPart::Proto(protocol::ICMP) => f.write_str("icmp"),
            KeyPart::Proto(n) => write!(f, "{}", n),
            KeyPart::Ifname(name) => f.write_str(name),
            KeyPart::Mac(mac) => write!(f, "{}", mac),
        }
    }
}

/// Split an encoded key back into its fields.
pub fn decode_key(fields: &[FieldType], bytes: &[u8]) -> Result<Vec<KeyPart>> {
    let concat = fields.len() > 1;
    let mut parts = Vec::with_capacity(fields.len());
    let mut off = 0;

    for field in fields {
        let remaining = bytes.len().saturating_sub(off);
        let width = match (concat, field) {
            (true, f) => f.concat_len(),
            // single-field MAC keys may come back unpadded
            (false, FieldType::EtherAddr) => remaining.min(8),
            (false, f) => f.len(),
        };
        let chunk = bytes.get(off..off + width).ok_or_else(|| {
            Error::Parse(format!(
                "key of {} bytes too short for {}",
                bytes.len(),
                field.name()
            ))
        })?;
        parts.push(match field {
            FieldType::Ipv4Addr => KeyPart::Ipv4(Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3])),
            FieldType::InetService => KeyPart::Port(u16::from_be_bytes([chunk[0], chunk[1]])),
            FieldType::InetProto => KeyPart::Proto(chunk[0]),
            FieldType::Ifname => {
                let end = chunk.iter().position(|&b| b == 0).unwrap_or(chunk.len());
                KeyPart::Ifname(String::from_utf8_lossy(&chunk[..end]).into_owned())
            }
            FieldType::EtherAddr => {
                if chunk.len() < 6 {
                    return Err(Error::Parse("short ether_addr field".into()));
                }
                let mut mac = [0u8; 6];
                mac.copy_from_slice(&chunk[..6]);
                KeyPart::Mac(MacAddr(mac))
            }
        });
        off += width;
    }

    Ok(parts)
}

/// Render decoded parts the way nft prints concatenations.
pub fn format_parts(parts: &[KeyPart]) -> String {
    parts
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(" . ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_encodings() {
        assert_eq!(encode_port(8080), [0x1f, 0x90]);
        assert_eq!(encode_port_concat(8080), [0x1f, 0x90, 0, 0]);
        assert_eq!(parse_port_range("1000-2000").unwrap(), (1000, 2000));
        assert_eq!(parse_port_range("53").unwrap(), (53, 53));
        assert!(parse_port_range("2000-1000").is_err());
        assert!(parse_port_range("70000").is_err());
        assert!(parse_port_range("http").is_err());
    }

    #[test]
    fn test_protocol_numbers() {
        assert_eq!(protocol_number("tcp").unwrap(), 6);
        assert_eq!(protocol_number("udp").unwrap(), 17);
        assert_eq!(protocol_number("icmp").unwrap(), 1);
        assert_eq!(protocol_number("47").unwrap(), 47);
        assert!(protocol_number("sctp").is_err());
        assert_eq!(encode_proto_concat(6), [6, 0, 0, 0]);
    }

    #[test]
    fn test_ifname_padding() {
        let b = encode_ifname("wlan0").unwrap();
        assert_eq!(&b[..5], b"wlan0");
        assert!(b[5..].iter().all(|&x| x == 0));
        assert!(encode_ifname("").is_err());
        assert!(encode_ifname("a-very-long-ifname").is_err());
    }

    #[test]
    fn test_mac_padding() {
        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(encode_mac(mac), [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 0, 0]);
    }

    #[test]
    fn test_verdict_bytes() {
        assert_eq!(verdict_to_bytes(&Verdict::Accept), [0, 0, 0, 1]);
        assert_eq!(verdict_to_bytes(&Verdict::Drop), [0, 0, 0, 0]);
        assert_eq!(verdict_to_bytes(&Verdict::Return), (-5i32).to_be_bytes());
        assert_eq!(
            verdict_to_bytes(&Verdict::Goto("PFWDROPLOG".into())),
            (-4i32).to_be_bytes()
        );
    }

    #[test]
    fn test_concat_type_and_lengths() {
        let fields = [FieldType::Ipv4Addr, FieldType::Ifname, FieldType::EtherAddr];
        assert_eq!(concat_type(&fields), (((7 << 6) | 41) << 6) | 9);
        assert_eq!(fields_len(&fields), 4 + 16 + 8);
        assert_eq!(fields_len(&[FieldType::InetService]), 2);
        assert_eq!(
            fields_len(&[FieldType::Ipv4Addr, FieldType::InetService]),
            8
        );
    }

    #[test]
    fn test_block_key_layout() {
        let key = KeyBuilder::new(3)
            .ipv4("192.168.1.0/24")
            .unwrap()
            .ipv4("8.8.8.8")
            .unwrap()
            .proto("tcp")
            .unwrap()
            .build();

        assert_eq!(
            key.bytes,
            vec![192, 168, 1, 0, 8, 8, 8, 8, 6, 0, 0, 0]
        );
        assert_eq!(
            key.end,
            Some(vec![192, 168, 1, 255, 8, 8, 8, 8, 6, 0, 0, 0])
        );
        assert!(key.is_range());
    }

    #[test]
    fn test_point_key_has_no_end() {
        let key = KeyBuilder::new(2)
            .ipv4("10.0.0.2")
            .unwrap()
            .port("443")
            .unwrap()
            .build();
        assert_eq!(key.bytes, vec![10, 0, 0, 2, 0x01, 0xbb, 0, 0]);
        assert_eq!(key.end, None);
        assert_eq!(key.end_or_start(), key.bytes.as_slice());
    }

    #[test]
    fn test_single_field_port_key() {
        let key = KeyBuilder::new(1).port("22").unwrap().build();
        assert_eq!(key.bytes, vec![0, 22]);
    }

    #[test]
    fn test_decode_key() {
        let mac: MacAddr = "00:11:22:33:44:55".parse().unwrap();
        let key = KeyBuilder::new(3)
            .addr(Ipv4Addr::new(192, 168, 2, 6))
            .ifname("wlan1")
            .unwrap()
            .mac(mac)
            .build();

        let parts = decode_key(
            &[FieldType::Ipv4Addr, FieldType::Ifname, FieldType::EtherAddr],
            &key.bytes,
        )
        .unwrap();
        assert_eq!(
            parts,
            vec![
                KeyPart::Ipv4(Ipv4Addr::new(192, 168, 2, 6)),
                KeyPart::Ifname("wlan1".into()),
                KeyPart::Mac(mac),
            ]
        );
        assert_eq!(
            format_parts(&parts),
            "192.168.2.6 . wlan1 . 00:11:22:33:44:55"
        );
    }

    #[test]
    fn test_decode_short_key() {
        assert!(decode_key(&[FieldType::Ipv4Addr, FieldType::Ifname], &[1, 2, 3, 4]).is_err());
    }
}
