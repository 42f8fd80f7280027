//! DNS domain names in wire form.
//!
//! Names are kept as the length-prefixed label sequence they have on the
//! wire (terminating zero octet included), so that equality, hashing and the
//! first-label / parent splits used by service discovery operate on exactly
//! the bytes peers sent. Compression pointers are honoured when decoding and
//! never emitted when encoding.

use std::fmt;

use super::wire::{Reader, Writer};
use super::UnknownFormat;

/// Upper bound on the decoded octet count of a single name. Doubles as the
/// loop guard against pointer cycles.
const MAX_NAME_OCTETS: u16 = 255;

/// A domain name in wire form: `\x01a\x05local\x00` for `a.local.`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DomainName(Vec<u8>);

impl DomainName {
    /// Encode a dotted string. A trailing dot is implicit; `a.local` and
    /// `a.local.` produce the same name.
    pub fn from_dotted(s: &str) -> Self {
        let mut bytes = Vec::with_capacity(s.len() + 2);
        for label in s.split('.') {
            if label.is_empty() {
                continue;
            }
            bytes.push(label.len() as u8);
            bytes.extend_from_slice(label.as_bytes());
        }
        bytes.push(0);
        DomainName(bytes)
    }

    /// Decode a name at the reader's cursor, following compression pointers.
    ///
    /// mDNS is case-insensitive, so ASCII letters are folded to lowercase;
    /// all comparisons elsewhere are plain byte equality.
    pub fn decode(reader: &mut Reader<'_>) -> Result<Self, UnknownFormat> {
        let mut out = Vec::new();
        let mut budget = MAX_NAME_OCTETS;
        let end = decode_labels(reader.full(), reader.position(), &mut budget, &mut out)?;
        reader.advance_to(end);
        out.make_ascii_lowercase();
        Ok(DomainName(out))
    }

    pub fn encode_into(&self, w: &mut Writer) {
        w.put_slice(&self.0);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn wire_len(&self) -> usize {
        self.0.len()
    }

    /// The leading label alone, as a one-label name.
    pub fn first_label(&self) -> DomainName {
        let Some(&len) = self.0.first() else {
            return self.clone();
        };
        let len = len as usize;
        let mut bytes = self.0[..=len.min(self.0.len() - 1)].to_vec();
        bytes.push(0);
        DomainName(bytes)
    }

    /// Everything after the leading label: the parent domain.
    pub fn parent(&self) -> DomainName {
        let Some(&len) = self.0.first() else {
            return self.clone();
        };
        let skip = (len as usize + 1).min(self.0.len());
        DomainName(self.0[skip..].to_vec())
    }
}

/// Walk length-prefixed labels starting at `pos`, recursing through
/// compression pointers. Returns the cursor position just past the name at
/// the *top* level (a pointer ends the top-level walk). `budget` is shared
/// across recursion so a pointer cycle runs out of octets and fails instead
/// of looping.
fn decode_labels(
    data: &[u8],
    mut pos: usize,
    budget: &mut u16,
    out: &mut Vec<u8>,
) -> Result<usize, UnknownFormat> {
    loop {
        if *budget == 0 {
            return Err(UnknownFormat);
        }
        let len = *data.get(pos).ok_or(UnknownFormat)?;
        pos += 1;
        *budget -= 1;

        if len == 0 {
            out.push(0);
            return Ok(pos);
        }

        if len & 0xC0 == 0xC0 {
            if *budget == 0 {
                return Err(UnknownFormat);
            }
            let low = *data.get(pos).ok_or(UnknownFormat)?;
            pos += 1;
            *budget -= 1;

            let offset = (((len & 0x3F) as usize) << 8) | low as usize;
            if offset >= data.len() {
                return Err(UnknownFormat);
            }
            decode_labels(data, offset, budget, out)?;
            return Ok(pos);
        }

        out.push(len);
        for _ in 0..len {
            if *budget == 0 {
                return Err(UnknownFormat);
            }
            let b = *data.get(pos).ok_or(UnknownFormat)?;
            pos += 1;
            *budget -= 1;
            out.push(b);
        }
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut pos = 0;
        while pos < self.0.len() {
            let len = self.0[pos] as usize;
            if len == 0 {
                break;
            }
            let end = (pos + 1 + len).min(self.0.len());
            for &b in &self.0[pos + 1..end] {
                write!(f, "{}", b as char)?;
            }
            write!(f, ".")?;
            pos = end;
        }
        Ok(())
    }
}

impl fmt::Debug for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DomainName({})", self)
    }
}
