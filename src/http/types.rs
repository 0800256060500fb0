use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Number of transactions held by a single batch.
/// Must match `HTTP_BATCH_SIZE` in the kernel program.
pub const HTTP_BATCH_SIZE: usize = 15;

/// Number of physical batch slots per CPU. Batches are written cyclically,
/// so batch `idx` lives in slot `idx % HTTP_BATCH_PAGES`.
pub const HTTP_BATCH_PAGES: u64 = 3;

/// Capacity of the request fragment captured by the kernel program.
pub const HTTP_BUFFER_SIZE: usize = 160;

/// Metadata bit: connection is TCP (unset means UDP).
pub const CONN_TYPE_TCP: u32 = 1;
/// Metadata bit: addresses are IPv6 (unset means IPv4).
pub const CONN_V6: u32 = 1 << 1;

const DIRECTION_SHIFT: u32 = 2;
const DIRECTION_MASK: u32 = 0b11 << DIRECTION_SHIFT;

/// Static connection tags attached by the kernel program.
pub const TAG_GNUTLS: u64 = 0x1;
pub const TAG_OPENSSL: u64 = 0x2;
pub const TAG_GO_TLS: u64 = 0x4;

/// HTTP request method as encoded by the kernel program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Method {
    Unknown = 0,
    Get = 1,
    Post = 2,
    Put = 3,
    Delete = 4,
    Head = 5,
    Options = 6,
    Patch = 7,
}

impl Method {
    /// Returns the canonical method name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
        }
    }

    /// Convert from a raw u8 value. Out-of-range values map to `Unknown`.
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Get,
            2 => Self::Post,
            3 => Self::Put,
            4 => Self::Delete,
            5 => Self::Head,
            6 => Self::Options,
            7 => Self::Patch,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a connection relative to the observed host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionDirection {
    Incoming,
    Outgoing,
}

impl ConnectionDirection {
    /// Decode the direction bits of a tuple's metadata.
    ///
    /// Unrecognized values fall back to `Outgoing`.
    pub fn from_metadata(metadata: u32) -> Self {
        match (metadata & DIRECTION_MASK) >> DIRECTION_SHIFT {
            1 => Self::Incoming,
            2 => Self::Outgoing,
            _ => Self::Outgoing,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
        }
    }
}

/// Connection identity as written by the kernel program.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ConnTuple {
    pub saddr_h: u64,
    pub saddr_l: u64,
    pub daddr_h: u64,
    pub daddr_l: u64,
    pub sport: u16,
    pub dport: u16,
    pub netns: u32,
    pub pid: u32,
    pub metadata: u32,
}

impl ConnTuple {
    pub fn is_ipv6(&self) -> bool {
        self.metadata & CONN_V6 != 0
    }

    pub fn is_tcp(&self) -> bool {
        self.metadata & CONN_TYPE_TCP != 0
    }

    pub fn direction(&self) -> ConnectionDirection {
        ConnectionDirection::from_metadata(self.metadata)
    }

    pub fn source_addr(&self) -> IpAddr {
        addr_from_words(self.saddr_h, self.saddr_l, self.is_ipv6())
    }

    pub fn dest_addr(&self) -> IpAddr {
        addr_from_words(self.daddr_h, self.daddr_l, self.is_ipv6())
    }
}

/// IPv4 addresses are stored in the low word in network byte order as read
/// by a little-endian load; IPv6 addresses span both words.
fn addr_from_words(high: u64, low: u64, v6: bool) -> IpAddr {
    if v6 {
        let mut octets = [0u8; 16];
        octets[..8].copy_from_slice(&high.to_le_bytes());
        octets[8..].copy_from_slice(&low.to_le_bytes());
        IpAddr::V6(Ipv6Addr::from(octets))
    } else {
        let raw = (low & 0xffff_ffff) as u32;
        IpAddr::V4(Ipv4Addr::from(raw.to_le_bytes()))
    }
}

/// One observed HTTP request/response exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct HttpTransaction {
    pub tup: ConnTuple,
    pub request_started: u64,
    pub request_method: u8,
    pub response_status_code: u16,
    pub response_last_seen: u64,
    pub request_fragment: [u8; HTTP_BUFFER_SIZE],
    pub owned_by_src_port: u16,
    pub tcp_seq: u32,
    pub tags: u64,
}

impl Default for HttpTransaction {
    fn default() -> Self {
        Self {
            tup: ConnTuple::default(),
            request_started: 0,
            request_method: 0,
            response_status_code: 0,
            response_last_seen: 0,
            request_fragment: [0u8; HTTP_BUFFER_SIZE],
            owned_by_src_port: 0,
            tcp_seq: 0,
            tags: 0,
        }
    }
}

impl fmt::Debug for HttpTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fragment_len = self
            .request_fragment
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(HTTP_BUFFER_SIZE);
        f.debug_struct("HttpTransaction")
            .field("tup", &self.tup)
            .field("method", &self.method())
            .field("status", &self.response_status_code)
            .field("request_started", &self.request_started)
            .field("response_last_seen", &self.response_last_seen)
            .field(
                "fragment",
                &String::from_utf8_lossy(&self.request_fragment[..fragment_len]),
            )
            .field("tcp_seq", &self.tcp_seq)
            .field("tags", &self.tags)
            .finish()
    }
}

impl HttpTransaction {
    pub fn method(&self) -> Method {
        Method::from_u8(self.request_method)
    }

    /// Status code class rounded down to the hundred (200, 404 -> 400, ...).
    pub fn status_class(&self) -> u16 {
        (self.response_status_code / 100) * 100
    }

    /// Request latency in nanoseconds, 0 if either timestamp is missing or
    /// the clock went backwards.
    pub fn latency_ns(&self) -> u64 {
        if self.request_started == 0 || self.response_last_seen == 0 {
            return 0;
        }
        self.response_last_seen
            .saturating_sub(self.request_started)
    }

    /// Only the request half has been observed.
    pub fn is_request_only(&self) -> bool {
        self.request_started != 0 && self.response_status_code == 0
    }

    /// Only the response half has been observed.
    pub fn is_response_only(&self) -> bool {
        self.request_started == 0 && self.response_status_code != 0
    }

    pub fn is_incomplete(&self) -> bool {
        self.request_started == 0 || self.response_status_code == 0
    }

    /// Static tags (TLS library) restricted to the known bits.
    pub fn static_tags(&self) -> u64 {
        self.tags & (TAG_GNUTLS | TAG_OPENSSL | TAG_GO_TLS)
    }

    /// Extracts the request path from the fragment.
    ///
    /// Returns the path bytes and whether the path was fully captured (the
    /// fragment was not truncated before the path ended). The fragment is
    /// treated as opaque apart from locating the request target token.
    pub fn path(&self) -> Option<(&[u8], bool)> {
        let fragment = &self.request_fragment;
        let end = fragment.iter().position(|&b| b == 0).unwrap_or(fragment.len());
        let fragment = &fragment[..end];

        let start = fragment.iter().position(|&b| b == b' ')? + 1;
        let rest = fragment.get(start..)?;
        if rest.first() != Some(&b'/') {
            return None;
        }

        match rest.iter().position(|&b| b == b' ' || b == b'?') {
            Some(stop) => Some((&rest[..stop], true)),
            None => Some((rest, false)),
        }
    }
}

/// A fixed-capacity container of transactions for one CPU.
#[derive(Debug, Clone)]
pub struct HttpBatch {
    /// Absolute batch sequence number on its CPU.
    pub idx: u64,
    /// Number of committed transactions, `<= HTTP_BATCH_SIZE` once decoded.
    pub pos: u8,
    pub txs: Vec<HttpTransaction>,
}

impl HttpBatch {
    /// Committed transactions in slot order.
    pub fn committed(&self) -> &[HttpTransaction] {
        let end = usize::from(self.pos).min(self.txs.len());
        &self.txs[..end]
    }
}

/// Index into the batch storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub cpu: u32,
    pub num: u32,
}

impl BatchKey {
    /// Key of the physical slot holding batch `idx` on `cpu`.
    pub fn new(cpu: u32, idx: u64) -> Self {
        Self {
            cpu,
            num: (idx % HTTP_BATCH_PAGES) as u32,
        }
    }
}

/// Doorbell: batch `idx` on `cpu` is ready to be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchNotification {
    pub cpu: u32,
    pub idx: u64,
}

/// A batch notification from `cpu` was dropped before delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LostNotification {
    pub cpu: u32,
}
