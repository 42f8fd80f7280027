//! Latency probing over three transports: application-level UDP echo, raw
//! ICMP echo, and TCP connect. Each prober keeps its own in-flight
//! correlation table; the [`engine`] drives one probing round per interval
//! over the peers the latency store currently considers live.

pub mod engine;
pub mod history;
pub mod icmp;
pub mod tcp;
pub mod udp;

pub use engine::ProbeEngine;
pub use history::InflightTable;
pub use icmp::IcmpProber;
pub use tcp::TcpProber;
pub use udp::UdpProber;

use std::time::Duration;

/// Outstanding-probe TTL: in-flight entries older than this are purged and
/// their late responses dropped.
pub const MAX_LATENCY: Duration = Duration::from_secs(10);

/// Wall-clock microseconds since the Unix epoch, the timestamp unit of the
/// UDP echo wire format.
pub(crate) fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_micros() as u64
}
