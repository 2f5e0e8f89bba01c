//! DNS record model and protocol limits.

use std::fmt;
use std::str::FromStr;

/// Maximum length of a presentation-form domain name.
pub const MAX_NAME_LEN: usize = 255;

/// Maximum length of a single label.
pub const MAX_LABEL_LEN: usize = 63;

/// Records kept per message section and per cache entry.
pub const MAX_RECORDS: usize = 64;

/// Size cap for an outgoing UDP query.
pub const MAX_QUERY_SIZE: usize = 512;

/// Receive buffer for replies. A reply that fills it is treated as oversized.
pub const MAX_REPLY_SIZE: usize = 4096;

/// The only class honored.
pub const CLASS_IN: u16 = 1;

/// Well-known RCODE values from the header flag word.
pub mod rcode {
    pub const NOERROR: u8 = 0;
    pub const NXDOMAIN: u8 = 3;
}

/// Closed set of record types the resolver understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RecordType {
    A = 1,
    Ns = 2,
    Cname = 5,
    Soa = 6,
    Ptr = 12,
    Mx = 15,
    Txt = 16,
    Aaaa = 28,
    Any = 255,
}

impl RecordType {
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Maps a wire type code back into the closed set, if it is in the set.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(RecordType::A),
            2 => Some(RecordType::Ns),
            5 => Some(RecordType::Cname),
            6 => Some(RecordType::Soa),
            12 => Some(RecordType::Ptr),
            15 => Some(RecordType::Mx),
            16 => Some(RecordType::Txt),
            28 => Some(RecordType::Aaaa),
            255 => Some(RecordType::Any),
            _ => None,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordType::A => "A",
            RecordType::Ns => "NS",
            RecordType::Cname => "CNAME",
            RecordType::Soa => "SOA",
            RecordType::Ptr => "PTR",
            RecordType::Mx => "MX",
            RecordType::Txt => "TXT",
            RecordType::Aaaa => "AAAA",
            RecordType::Any => "ANY",
        };
        f.write_str(s)
    }
}

impl FromStr for RecordType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "AAAA" => Ok(RecordType::Aaaa),
            "NS" => Ok(RecordType::Ns),
            "MX" => Ok(RecordType::Mx),
            "CNAME" => Ok(RecordType::Cname),
            "PTR" => Ok(RecordType::Ptr),
            "SOA" => Ok(RecordType::Soa),
            "TXT" => Ok(RecordType::Txt),
            "ANY" => Ok(RecordType::Any),
            _ => Err(()),
        }
    }
}

/// One resource record with its payload already rendered to text.
///
/// The payload is materialized at parse time; nothing borrows from the wire
/// buffer. For A/AAAA the data is the address text, for NS/CNAME/PTR the
/// referenced name, for MX the exchange name with `preference` set, for TXT
/// the first character-string, and a `0x…` hex dump for everything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub data: String,
    pub preference: Option<u16>,
}

/// Canonical form of a domain name: lowercase, trailing dot stripped.
/// The root name canonicalizes to the empty string.
pub fn canonical_name(input: &str) -> String {
    input.trim_end_matches('.').to_ascii_lowercase()
}
