//! The slice of the DNS wire format the proxy needs: the header and the
//! first question of a query, and a synthesized NXDOMAIN reply.

use anyhow::{bail, Context, Result};

pub const HEADER_LEN: usize = 12;
const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 253;

const FLAG_QR: u16 = 0x8000;
const MASK_OPCODE: u16 = 0x7800;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;
const RCODE_NXDOMAIN: u16 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl DnsHeader {
    pub fn parse(packet: &[u8]) -> Result<Self> {
        if packet.len() < HEADER_LEN {
            bail!("packet shorter than a DNS header ({} bytes)", packet.len());
        }
        let word = |at: usize| u16::from_be_bytes([packet[at], packet[at + 1]]);
        Ok(Self {
            id: word(0),
            flags: word(2),
            qdcount: word(4),
            ancount: word(6),
            nscount: word(8),
            arcount: word(10),
        })
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }

    pub fn rcode(&self) -> u16 {
        self.flags & 0x000f
    }

    fn write(&self, out: &mut Vec<u8>) {
        for word in [
            self.id,
            self.flags,
            self.qdcount,
            self.ancount,
            self.nscount,
            self.arcount,
        ] {
            out.extend_from_slice(&word.to_be_bytes());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    /// Lowercase, dot separated, without the trailing root dot.
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
    /// Offset one past the question in the packet.
    end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub header: DnsHeader,
    pub question: DnsQuestion,
}

pub fn parse_query(packet: &[u8]) -> Result<DnsQuery> {
    let header = DnsHeader::parse(packet)?;
    if header.is_response() {
        bail!("packet is a response, not a query");
    }
    if header.qdcount == 0 {
        bail!("query carries no question");
    }

    let (name, mut offset) = read_name(packet, HEADER_LEN)?;
    let fixed = packet
        .get(offset..offset + 4)
        .context("question truncated before type and class")?;
    let qtype = u16::from_be_bytes([fixed[0], fixed[1]]);
    let qclass = u16::from_be_bytes([fixed[2], fixed[3]]);
    offset += 4;

    Ok(DnsQuery {
        header,
        question: DnsQuestion {
            name,
            qtype,
            qclass,
            end: offset,
        },
    })
}

fn read_name(packet: &[u8], mut offset: usize) -> Result<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut total = 0usize;
    loop {
        let len = *packet.get(offset).context("name runs past end of packet")? as usize;
        offset += 1;
        if len == 0 {
            break;
        }
        if len & 0xc0 != 0 {
            bail!("compressed or extended label in question name");
        }
        if len > MAX_LABEL_LEN {
            bail!("label longer than {MAX_LABEL_LEN} bytes");
        }
        let label = packet
            .get(offset..offset + len)
            .context("label runs past end of packet")?;
        offset += len;
        total += len + 1;
        if total > MAX_NAME_LEN + 1 {
            bail!("name longer than {MAX_NAME_LEN} bytes");
        }
        labels.push(String::from_utf8_lossy(label).to_ascii_lowercase());
    }
    Ok((labels.join("."), offset))
}

/// Reply to `packet` with NXDOMAIN: same id, opcode and RD copied, QR and
/// RA set, the first question echoed, no records.
pub fn nxdomain_response(packet: &[u8], query: &DnsQuery) -> Vec<u8> {
    let flags = FLAG_QR
        | (query.header.flags & MASK_OPCODE)
        | (query.header.flags & FLAG_RD)
        | FLAG_RA
        | RCODE_NXDOMAIN;
    let header = DnsHeader {
        id: query.header.id,
        flags,
        qdcount: 1,
        ancount: 0,
        nscount: 0,
        arcount: 0,
    };

    let question = &packet[HEADER_LEN..query.question.end];
    let mut out = Vec::with_capacity(HEADER_LEN + question.len());
    header.write(&mut out);
    out.extend_from_slice(question);
    out
}

/// Build a single-question query; used by tests and the proxy self-check.
pub fn build_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let header = DnsHeader {
        id,
        flags: FLAG_RD,
        qdcount: 1,
        ancount: 0,
        nscount: 0,
        arcount: 0,
    };
    let mut out = Vec::new();
    header.write(&mut out);
    for label in name.trim_end_matches('.').split('.').filter(|l| !l.is_empty()) {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out.extend_from_slice(&qtype.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out
}
