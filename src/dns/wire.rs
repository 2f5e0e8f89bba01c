//! DNS message codec: query encoding and response decoding.
//!
//! Decoding follows RFC 1035 including name compression. Every decoded name
//! is returned as an owned canonical `String`; nothing in the parsed message
//! borrows from the wire buffer.

use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;

use super::types::{
    CLASS_IN, DnsRecord, MAX_LABEL_LEN, MAX_NAME_LEN, MAX_QUERY_SIZE, MAX_RECORDS, RecordType,
    canonical_name,
};

pub const HEADER_SIZE: usize = 12;

/// Maximum pointer jumps while decompressing one name.
const MAX_POINTER_JUMPS: u32 = 10;

const FLAG_TC: u16 = 0x0200;
const RCODE_MASK: u16 = 0x000f;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("label longer than {MAX_LABEL_LEN} octets")]
    LabelTooLong,
    #[error("empty label in name")]
    EmptyLabel,
    #[error("encoded name longer than {MAX_NAME_LEN} octets")]
    NameTooLong,
    #[error("query exceeds {MAX_QUERY_SIZE} octets")]
    QueryTooLong,
    #[error("message truncated")]
    UnexpectedEof,
    #[error("compression pointer loop")]
    PointerLoop,
    #[error("compression pointer out of range")]
    PointerOutOfRange,
    #[error("record data out of range")]
    BadRdata,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl DnsHeader {
    pub fn is_truncated(&self) -> bool {
        self.flags & FLAG_TC != 0
    }

    pub fn rcode(&self) -> u8 {
        (self.flags & RCODE_MASK) as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// A fully decoded message. Sections hold at most [`MAX_RECORDS`] records;
/// the rest are parsed to keep offsets consistent and then dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsMessage {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub additionals: Vec<DnsRecord>,
}

/// Encodes a query for `name`/`qtype` with the given transaction id.
///
/// The header carries a zeroed flag word (iterative queries do not ask for
/// recursion) and a single question. The name is canonicalized before
/// encoding and refused when a label exceeds 63 octets or the full encoding
/// exceeds 255 octets.
pub fn build_query(name: &str, qtype: RecordType, id: u16) -> Result<Vec<u8>, WireError> {
    let canonical = canonical_name(name);

    let mut out = Vec::with_capacity(HEADER_SIZE + canonical.len() + 6);
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // flags
    out.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());

    write_name(&canonical, &mut out)?;

    out.extend_from_slice(&qtype.code().to_be_bytes());
    out.extend_from_slice(&CLASS_IN.to_be_bytes());

    if out.len() > MAX_QUERY_SIZE {
        return Err(WireError::QueryTooLong);
    }
    Ok(out)
}

fn write_name(name: &str, out: &mut Vec<u8>) -> Result<(), WireError> {
    let start = out.len();

    if !name.is_empty() {
        for label in name.split('.') {
            if label.is_empty() {
                return Err(WireError::EmptyLabel);
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(WireError::LabelTooLong);
            }
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
    }
    out.push(0);

    if out.len() - start > MAX_NAME_LEN {
        return Err(WireError::NameTooLong);
    }
    Ok(())
}

/// Decodes a full message: header, questions, and the three record sections.
pub fn parse_message(buf: &[u8]) -> Result<DnsMessage, WireError> {
    if buf.len() < HEADER_SIZE {
        return Err(WireError::UnexpectedEof);
    }

    let header = DnsHeader {
        id: be16(buf, 0),
        flags: be16(buf, 2),
        qdcount: be16(buf, 4),
        ancount: be16(buf, 6),
        nscount: be16(buf, 8),
        arcount: be16(buf, 10),
    };

    let mut msg = DnsMessage {
        header,
        ..Default::default()
    };
    let mut offset = HEADER_SIZE;

    for _ in 0..header.qdcount {
        let name = read_name(buf, &mut offset)?;
        if offset + 4 > buf.len() {
            return Err(WireError::UnexpectedEof);
        }
        let qtype = be16(buf, offset);
        let qclass = be16(buf, offset + 2);
        offset += 4;
        msg.questions.push(DnsQuestion {
            name,
            qtype,
            qclass,
        });
    }

    for (count, section) in [
        (header.ancount, &mut msg.answers),
        (header.nscount, &mut msg.authorities),
        (header.arcount, &mut msg.additionals),
    ] {
        for _ in 0..count {
            let record = read_record(buf, &mut offset)?;
            if section.len() < MAX_RECORDS {
                section.push(record);
            }
        }
    }

    Ok(msg)
}

fn be16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn be32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Reads one possibly-compressed name starting at `*offset`.
///
/// The offset advances past the in-place bytes only: after the first pointer
/// jump it lands just behind the pointer, not behind the jump target. Jump
/// depth is capped and every pointer must land strictly inside the message.
fn read_name(buf: &[u8], offset: &mut usize) -> Result<String, WireError> {
    let mut pos = *offset;
    let mut out = String::new();
    let mut jumped = false;
    let mut resume = 0usize;
    let mut jumps = 0u32;

    loop {
        if pos >= buf.len() {
            return Err(WireError::UnexpectedEof);
        }
        let len = buf[pos];

        if len == 0 {
            pos += 1;
            break;
        }

        if len & 0xc0 == 0xc0 {
            if pos + 1 >= buf.len() {
                return Err(WireError::UnexpectedEof);
            }
            let target = (((len & 0x3f) as usize) << 8) | buf[pos + 1] as usize;
            if target >= buf.len() {
                return Err(WireError::PointerOutOfRange);
            }
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return Err(WireError::PointerLoop);
            }
            if !jumped {
                resume = pos + 2;
                jumped = true;
            }
            pos = target;
            continue;
        }

        if len & 0xc0 != 0 {
            // 0x40/0x80 label types are not in the closed wire model.
            return Err(WireError::BadRdata);
        }

        let len = len as usize;
        pos += 1;
        if pos + len > buf.len() {
            return Err(WireError::UnexpectedEof);
        }
        if !out.is_empty() {
            out.push('.');
        }
        for &b in &buf[pos..pos + len] {
            out.push(b.to_ascii_lowercase() as char);
        }
        if out.len() > MAX_NAME_LEN {
            return Err(WireError::NameTooLong);
        }
        pos += len;
    }

    *offset = if jumped { resume } else { pos };
    Ok(canonical_name(&out))
}

fn read_record(buf: &[u8], offset: &mut usize) -> Result<DnsRecord, WireError> {
    let name = read_name(buf, offset)?;
    if *offset + 10 > buf.len() {
        return Err(WireError::UnexpectedEof);
    }
    let rtype = be16(buf, *offset);
    let class = be16(buf, *offset + 2);
    let ttl = be32(buf, *offset + 4);
    let rdlength = be16(buf, *offset + 8) as usize;
    *offset += 10;

    let rdata_at = *offset;
    if rdata_at + rdlength > buf.len() {
        return Err(WireError::BadRdata);
    }
    let (data, preference) = parse_rdata(buf, rdata_at, rdlength, rtype)?;
    *offset = rdata_at + rdlength;

    Ok(DnsRecord {
        name,
        rtype,
        class,
        ttl,
        data,
        preference,
    })
}

fn parse_rdata(
    buf: &[u8],
    at: usize,
    rdlength: usize,
    rtype: u16,
) -> Result<(String, Option<u16>), WireError> {
    let rdata = &buf[at..at + rdlength];

    if rtype == RecordType::A.code() && rdlength == 4 {
        let ip = Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]);
        return Ok((ip.to_string(), None));
    }

    if rtype == RecordType::Aaaa.code() && rdlength == 16 {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(rdata);
        return Ok((Ipv6Addr::from(octets).to_string(), None));
    }

    if rtype == RecordType::Ns.code()
        || rtype == RecordType::Cname.code()
        || rtype == RecordType::Ptr.code()
    {
        let mut name_at = at;
        let name = read_name(buf, &mut name_at)?;
        return Ok((name, None));
    }

    if rtype == RecordType::Mx.code() {
        if rdlength < 2 {
            return Err(WireError::BadRdata);
        }
        let preference = be16(buf, at);
        let mut name_at = at + 2;
        let name = read_name(buf, &mut name_at)?;
        return Ok((name, Some(preference)));
    }

    if rtype == RecordType::Txt.code() {
        if rdlength < 1 {
            return Err(WireError::BadRdata);
        }
        // Only the first character-string is kept.
        let txt_len = (rdata[0] as usize).min(rdlength - 1);
        let text = String::from_utf8_lossy(&rdata[1..1 + txt_len]).into_owned();
        return Ok((text, None));
    }

    Ok((format!("0x{}", hex::encode(rdata)), None))
}
