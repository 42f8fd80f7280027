//! Wire codecs: big-endian cursor primitives, DNS names and messages,
//! ICMP echo packets.
//!
//! Every decoder in this module is pure: it either returns the decoded value
//! or fails with [`UnknownFormat`] without touching any state. Receive paths
//! catch the error, drop the offending datagram and re-arm.

pub mod dns;
pub mod icmp;
pub mod name;
pub mod wire;

pub use dns::{DnsFlags, DnsMessage, Question, RData, Record};
pub use icmp::IcmpEcho;
pub use name::DomainName;
pub use wire::{Reader, Writer};

/// The single error family raised by every decoder in the crate: a truncated
/// buffer, an out-of-range compression pointer, a count/length mismatch, a
/// bad checksum. Callers treat all of these the same way.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown wire format")]
pub struct UnknownFormat;
