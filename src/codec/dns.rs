//! DNS message assembly and disassembly, restricted to the subset mDNS
//! service discovery needs: PTR and A records, the unicast-response bit on
//! question classes, compression pointers on parse only.

use std::net::Ipv4Addr;

use super::name::DomainName;
use super::wire::{Reader, Writer};
use super::UnknownFormat;

pub const TYPE_A: u16 = 1;
pub const TYPE_PTR: u16 = 12;
pub const CLASS_IN: u16 = 1;

/// The `QR opcode(4) AA TC RD RA Z(3) RCODE(4)` half of the header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DnsFlags {
    pub response: bool,
    pub opcode: u8,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub z: u8,
    pub rcode: u8,
}

impl DnsFlags {
    fn from_u16(flags: u16) -> Self {
        DnsFlags {
            response: flags & 0x8000 != 0,
            opcode: ((flags >> 11) & 0x0F) as u8,
            authoritative: flags & 0x0400 != 0,
            truncated: flags & 0x0200 != 0,
            recursion_desired: flags & 0x0100 != 0,
            recursion_available: flags & 0x0080 != 0,
            z: ((flags >> 4) & 0x07) as u8,
            rcode: (flags & 0x0F) as u8,
        }
    }

    fn to_u16(self) -> u16 {
        let mut flags = 0u16;
        if self.response {
            flags |= 0x8000;
        }
        flags |= ((self.opcode & 0x0F) as u16) << 11;
        if self.authoritative {
            flags |= 0x0400;
        }
        if self.truncated {
            flags |= 0x0200;
        }
        if self.recursion_desired {
            flags |= 0x0100;
        }
        if self.recursion_available {
            flags |= 0x0080;
        }
        flags |= ((self.z & 0x07) as u16) << 4;
        flags |= (self.rcode & 0x0F) as u16;
        flags
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: DomainName,
    pub qtype: u16,
    pub qclass: u16,
    /// mDNS "QU" extension: top bit of qclass on the wire.
    pub unicast_response: bool,
}

/// Typed record data. Wrong-type access is unrepresentable; record types the
/// engine does not use are carried as `Other` with their rdata dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    Ptr(DomainName),
    A(Ipv4Addr),
    Other { rrtype: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: DomainName,
    pub rrclass: u16,
    pub ttl: u32,
    pub rdata: RData,
}

impl Record {
    pub fn rrtype(&self) -> u16 {
        match self.rdata {
            RData::Ptr(_) => TYPE_PTR,
            RData::A(_) => TYPE_A,
            RData::Other { rrtype } => rrtype,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsMessage {
    pub id: u16,
    pub flags: DnsFlags,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
}

impl DnsMessage {
    /// Parse a whole datagram. Authority and additional records are read and
    /// discarded; any octet left over (or missing) fails the parse.
    pub fn parse(data: &[u8]) -> Result<Self, UnknownFormat> {
        let mut r = Reader::new(data);

        let id = r.read_u16()?;
        let flags = DnsFlags::from_u16(r.read_u16()?);
        let qd_count = r.read_u16()?;
        let an_count = r.read_u16()?;
        let ns_count = r.read_u16()?;
        let ar_count = r.read_u16()?;

        let mut questions = Vec::with_capacity(qd_count as usize);
        for _ in 0..qd_count {
            questions.push(parse_question(&mut r)?);
        }

        let mut answers = Vec::with_capacity(an_count as usize);
        for _ in 0..an_count {
            answers.push(parse_record(&mut r)?);
        }

        for _ in 0..(ns_count as u32 + ar_count as u32) {
            parse_record(&mut r)?;
        }

        if !r.is_empty() {
            return Err(UnknownFormat);
        }

        Ok(DnsMessage {
            id,
            flags,
            questions,
            answers,
        })
    }

    /// Serialise. Names are always emitted in full; this side of the codec
    /// never writes compression pointers.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u16(self.id);
        w.put_u16(self.flags.to_u16());
        w.put_u16(self.questions.len() as u16);
        w.put_u16(self.answers.len() as u16);
        w.put_u16(0);
        w.put_u16(0);

        for q in &self.questions {
            q.name.encode_into(&mut w);
            w.put_u16(q.qtype);
            let qclass = if q.unicast_response {
                q.qclass | 0x8000
            } else {
                q.qclass
            };
            w.put_u16(qclass);
        }

        for a in &self.answers {
            a.name.encode_into(&mut w);
            w.put_u16(a.rrtype());
            w.put_u16(a.rrclass);
            w.put_u32(a.ttl);
            match &a.rdata {
                RData::Ptr(target) => {
                    w.put_u16(target.wire_len() as u16);
                    target.encode_into(&mut w);
                }
                RData::A(addr) => {
                    w.put_u16(4);
                    w.put_u32(u32::from(*addr));
                }
                RData::Other { .. } => {
                    w.put_u16(0);
                }
            }
        }

        w.into_bytes()
    }
}

fn parse_question(r: &mut Reader<'_>) -> Result<Question, UnknownFormat> {
    let name = DomainName::decode(r)?;
    let qtype = r.read_u16()?;
    let raw_class = r.read_u16()?;
    Ok(Question {
        name,
        qtype,
        qclass: raw_class & 0x7FFF,
        unicast_response: raw_class & 0x8000 != 0,
    })
}

fn parse_record(r: &mut Reader<'_>) -> Result<Record, UnknownFormat> {
    let name = DomainName::decode(r)?;
    let rrtype = r.read_u16()?;
    // the unicast-response extension bit is meaningless on records; drop it
    let rrclass = r.read_u16()? & 0x7FFF;
    let ttl = r.read_u32()?;
    let rdlength = r.read_u16()?;

    let rdata = match rrtype {
        TYPE_PTR => {
            let target = DomainName::decode(r)?;
            if target.parent() != name {
                // a PTR for a service must point at <label>.<service name>
                return Err(UnknownFormat);
            }
            RData::Ptr(target)
        }
        TYPE_A => {
            if rdlength != 4 {
                return Err(UnknownFormat);
            }
            RData::A(Ipv4Addr::from(r.read_u32()?))
        }
        _ => {
            r.skip(rdlength as usize)?;
            RData::Other { rrtype }
        }
    };

    Ok(Record {
        name,
        rrclass,
        ttl,
        rdata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr_question(name: &str, unicast: bool) -> Question {
        Question {
            name: DomainName::from_dotted(name),
            qtype: TYPE_PTR,
            qclass: CLASS_IN,
            unicast_response: unicast,
        }
    }

    #[test]
    fn query_round_trip() {
        let msg = DnsMessage {
            id: 0x1234,
            flags: DnsFlags::default(),
            questions: vec![
                ptr_question("_ssh._tcp.local.", true),
                ptr_question("_opoznienia._udp.local.", false),
            ],
            answers: vec![],
        };

        let parsed = DnsMessage::parse(&msg.encode()).unwrap();
        assert_eq!(parsed, msg);
        assert!(parsed.questions[0].unicast_response);
        assert!(!parsed.questions[1].unicast_response);
        assert_eq!(parsed.questions[0].qclass, CLASS_IN);
    }

    #[test]
    fn response_round_trip() {
        let service = DomainName::from_dotted("_opoznienia._udp.local.");
        let msg = DnsMessage {
            id: 0,
            flags: DnsFlags {
                response: true,
                ..DnsFlags::default()
            },
            questions: vec![],
            answers: vec![
                Record {
                    name: service.clone(),
                    rrclass: CLASS_IN,
                    ttl: 4500,
                    rdata: RData::Ptr(DomainName::from_dotted("node._opoznienia._udp.local.")),
                },
                Record {
                    name: DomainName::from_dotted("node._opoznienia._udp.local."),
                    rrclass: CLASS_IN,
                    ttl: 4500,
                    rdata: RData::A(Ipv4Addr::new(10, 1, 2, 3)),
                },
            ],
        };

        let parsed = DnsMessage::parse(&msg.encode()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn opcode_and_rcode_extraction() {
        // opcode 2 (STATUS), rcode 3 (NXDOMAIN)
        let flags = DnsFlags::from_u16(0x9003 | (2 << 11));
        assert_eq!(flags.opcode, 2);
        assert_eq!(flags.rcode, 3);
        assert!(flags.response);

        let zero = DnsFlags::from_u16(0x8000);
        assert_eq!(zero.opcode, 0);
        assert_eq!(zero.rcode, 0);
    }

    #[test]
    fn trailing_bytes_fail() {
        let msg = DnsMessage {
            id: 1,
            flags: DnsFlags::default(),
            questions: vec![ptr_question("_opoznienia._udp.local.", false)],
            answers: vec![],
        };
        let mut bytes = msg.encode();
        bytes.push(0);
        assert_eq!(DnsMessage::parse(&bytes), Err(UnknownFormat));
    }

    #[test]
    fn truncated_message_fails() {
        let msg = DnsMessage {
            id: 1,
            flags: DnsFlags::default(),
            questions: vec![ptr_question("_opoznienia._udp.local.", false)],
            answers: vec![],
        };
        let bytes = msg.encode();
        assert_eq!(DnsMessage::parse(&bytes[..bytes.len() - 2]), Err(UnknownFormat));
    }

    #[test]
    fn count_mismatch_fails() {
        // header claims one question but carries none
        let mut w = Writer::new();
        w.put_u16(0); // id
        w.put_u16(0); // flags
        w.put_u16(1); // qd
        w.put_u16(0);
        w.put_u16(0);
        w.put_u16(0);
        assert_eq!(DnsMessage::parse(&w.into_bytes()), Err(UnknownFormat));
    }

    #[test]
    fn ptr_parent_mismatch_fails() {
        let msg = DnsMessage {
            id: 0,
            flags: DnsFlags {
                response: true,
                ..DnsFlags::default()
            },
            questions: vec![],
            answers: vec![Record {
                name: DomainName::from_dotted("_ssh._tcp.local."),
                rrclass: CLASS_IN,
                ttl: 4500,
                // parent of the target is _opoznienia._udp.local., not the name
                rdata: RData::Ptr(DomainName::from_dotted("node._opoznienia._udp.local.")),
            }],
        };
        assert_eq!(DnsMessage::parse(&msg.encode()), Err(UnknownFormat));
    }

    #[test]
    fn a_record_bad_length_fails() {
        let name = DomainName::from_dotted("node._opoznienia._udp.local.");
        let mut w = Writer::new();
        w.put_u16(0);
        w.put_u16(0x8000);
        w.put_u16(0);
        w.put_u16(1); // one answer
        w.put_u16(0);
        w.put_u16(0);
        name.encode_into(&mut w);
        w.put_u16(TYPE_A);
        w.put_u16(CLASS_IN);
        w.put_u32(4500);
        w.put_u16(3); // rdlength must be 4
        w.put_u8(10);
        w.put_u8(0);
        w.put_u8(1);
        assert_eq!(DnsMessage::parse(&w.into_bytes()), Err(UnknownFormat));
    }

    #[test]
    fn unknown_record_types_are_skipped() {
        let name = DomainName::from_dotted("node.local.");
        let mut w = Writer::new();
        w.put_u16(7);
        w.put_u16(0x8000);
        w.put_u16(0);
        w.put_u16(1);
        w.put_u16(0);
        w.put_u16(0);
        name.encode_into(&mut w);
        w.put_u16(16); // TXT
        w.put_u16(CLASS_IN);
        w.put_u32(120);
        w.put_u16(3);
        w.put_slice(b"abc");

        let parsed = DnsMessage::parse(&w.into_bytes()).unwrap();
        assert_eq!(parsed.answers.len(), 1);
        assert_eq!(parsed.answers[0].rdata, RData::Other { rrtype: 16 });
    }

    #[test]
    fn compressed_ptr_parses_like_uncompressed() {
        // hand-built response whose PTR rdata compresses against the record name
        let mut w = Writer::new();
        w.put_u16(0);
        w.put_u16(0x8000);
        w.put_u16(0);
        w.put_u16(1);
        w.put_u16(0);
        w.put_u16(0);
        let name_offset = w.len();
        let service = DomainName::from_dotted("_opoznienia._udp.local.");
        service.encode_into(&mut w);
        w.put_u16(TYPE_PTR);
        w.put_u16(CLASS_IN);
        w.put_u32(4500);
        w.put_u16(6); // label "node" + 2-octet pointer
        w.put_u8(4);
        w.put_slice(b"node");
        w.put_u8(0xC0 | (name_offset >> 8) as u8);
        w.put_u8(name_offset as u8);

        let parsed = DnsMessage::parse(&w.into_bytes()).unwrap();
        assert_eq!(
            parsed.answers[0].rdata,
            RData::Ptr(DomainName::from_dotted("node._opoznienia._udp.local."))
        );
        // re-encoding emits the full name, but reparsing yields the same message
        let reparsed = DnsMessage::parse(&parsed.encode()).unwrap();
        assert_eq!(reparsed, parsed);
    }
}
