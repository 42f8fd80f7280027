//! Shared latency store: per-peer, per-protocol TTL-based liveness plus a
//! rolling window of recent latency samples.
//!
//! One mutex guards the whole peer map; every operation refreshes the
//! touched hosts' expiration state and drops hosts whose UDP and TCP
//! deadlines have both lapsed. Time enters through explicit `*_at` variants
//! so TTL behavior is exercised without sleeping.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Latency samples kept per (peer, protocol).
const WINDOW_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
    Tcp,
    Icmp,
}

/// Dashboard column order.
pub const ALL_PROTOCOLS: [Protocol; 3] = [Protocol::Udp, Protocol::Tcp, Protocol::Icmp];

/// Fixed-capacity ring of the last ten samples with a running sum; insertion
/// is O(1) and evicts the oldest sample.
#[derive(Debug, Clone, Default)]
pub struct RollingWindow {
    samples: VecDeque<u64>,
    sum: u64,
}

impl RollingWindow {
    pub fn push(&mut self, micros: u64) {
        if self.samples.len() == WINDOW_CAPACITY {
            if let Some(evicted) = self.samples.pop_front() {
                self.sum -= evicted;
            }
        }
        self.samples.push_back(micros);
        self.sum += micros;
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean in whole microseconds (integer division), `None` while empty.
    pub fn average(&self) -> Option<u64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.sum / self.samples.len() as u64)
        }
    }

    fn clear(&mut self) {
        self.samples.clear();
        self.sum = 0;
    }
}

/// Per-peer record: two reachability deadlines and three sample windows.
/// ICMP reachability piggybacks on the UDP deadline, since ICMP is only
/// probed toward peers advertising the UDP service.
#[derive(Debug, Clone)]
pub struct Host {
    udp_deadline: Option<Instant>,
    tcp_deadline: Option<Instant>,
    udp_expired: bool,
    tcp_expired: bool,
    udp_window: RollingWindow,
    tcp_window: RollingWindow,
    icmp_window: RollingWindow,
}

impl Default for Host {
    fn default() -> Self {
        Host {
            udp_deadline: None,
            tcp_deadline: None,
            udp_expired: true,
            tcp_expired: true,
            udp_window: RollingWindow::default(),
            tcp_window: RollingWindow::default(),
            icmp_window: RollingWindow::default(),
        }
    }
}

impl Host {
    /// Recompute the expiration flags; a lapsed deadline resets the windows
    /// that depend on it.
    fn refresh(&mut self, now: Instant) {
        self.tcp_expired = match self.tcp_deadline {
            Some(deadline) => now > deadline,
            None => true,
        };
        if self.tcp_expired {
            self.tcp_window.clear();
        }

        self.udp_expired = match self.udp_deadline {
            Some(deadline) => now > deadline,
            None => true,
        };
        if self.udp_expired {
            self.udp_window.clear();
            self.icmp_window.clear();
        }
    }

    pub fn is_protocol_available(&self, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Tcp => !self.tcp_expired,
            Protocol::Udp | Protocol::Icmp => !self.udp_expired,
        }
    }

    pub fn is_any_protocol_available(&self) -> bool {
        !self.tcp_expired || !self.udp_expired
    }

    fn window(&self, protocol: Protocol) -> &RollingWindow {
        match protocol {
            Protocol::Udp => &self.udp_window,
            Protocol::Tcp => &self.tcp_window,
            Protocol::Icmp => &self.icmp_window,
        }
    }

    fn window_mut(&mut self, protocol: Protocol) -> &mut RollingWindow {
        match protocol {
            Protocol::Udp => &mut self.udp_window,
            Protocol::Tcp => &mut self.tcp_window,
            Protocol::Icmp => &mut self.icmp_window,
        }
    }

    /// Rolling-window mean latency in microseconds, `None` without samples.
    pub fn latency(&self, protocol: Protocol) -> Option<u64> {
        self.window(protocol).average()
    }

    /// Unweighted mean across the protocols that have samples; peers with no
    /// samples at all rank as infinity (slowest, top of the dashboard).
    pub fn average_latency(&self) -> f64 {
        let mut sum = 0u64;
        let mut count = 0u32;
        for protocol in ALL_PROTOCOLS {
            if let Some(avg) = self.latency(protocol) {
                sum += avg;
                count += 1;
            }
        }
        if count == 0 {
            f64::INFINITY
        } else {
            sum as f64 / count as f64
        }
    }
}

/// The peer map behind its single mutex.
#[derive(Default)]
pub struct LatencyStore {
    hosts: Mutex<HashMap<Ipv4Addr, Host>>,
}

impl LatencyStore {
    pub fn new() -> Self {
        LatencyStore::default()
    }

    /// Mark `protocol` reachable for `peer` for the next `ttl`. A peer seen
    /// for the first time, or seen again after fully expiring, starts from a
    /// fresh record.
    pub fn set_connection_available(&self, protocol: Protocol, peer: Ipv4Addr, ttl: Duration) {
        self.set_connection_available_at(protocol, peer, ttl, Instant::now());
    }

    pub fn set_connection_available_at(
        &self,
        protocol: Protocol,
        peer: Ipv4Addr,
        ttl: Duration,
        now: Instant,
    ) {
        let mut hosts = self.hosts.lock();
        let host = hosts.entry(peer).or_default();

        host.refresh(now);
        if !host.is_any_protocol_available() {
            *host = Host::default();
        }

        match protocol {
            Protocol::Tcp => host.tcp_deadline = Some(now + ttl),
            Protocol::Udp => host.udp_deadline = Some(now + ttl),
            Protocol::Icmp => {}
        }
        host.refresh(now);
    }

    /// Record one latency sample. Ignored when the peer is unknown, fully
    /// expired (the record is dropped), or not reachable over `protocol`.
    pub fn add_latency(&self, protocol: Protocol, peer: Ipv4Addr, sample: Duration) {
        self.add_latency_at(protocol, peer, sample, Instant::now());
    }

    pub fn add_latency_at(
        &self,
        protocol: Protocol,
        peer: Ipv4Addr,
        sample: Duration,
        now: Instant,
    ) {
        let mut hosts = self.hosts.lock();
        let Some(host) = hosts.get_mut(&peer) else {
            return;
        };

        host.refresh(now);
        if !host.is_any_protocol_available() {
            hosts.remove(&peer);
            return;
        }
        if !host.is_protocol_available(protocol) {
            return;
        }

        host.window_mut(protocol).push(sample.as_micros() as u64);
    }

    /// Snapshot the live peers, dropping the fully expired on the way.
    pub fn get_all(&self) -> Vec<(Ipv4Addr, Host)> {
        self.get_all_at(Instant::now())
    }

    pub fn get_all_at(&self, now: Instant) -> Vec<(Ipv4Addr, Host)> {
        let mut hosts = self.hosts.lock();
        hosts.retain(|_, host| {
            host.refresh(now);
            host.is_any_protocol_available()
        });
        hosts.iter().map(|(addr, host)| (*addr, host.clone())).collect()
    }
}
