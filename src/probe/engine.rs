//! The probing round driver.
//!
//! Once per configured interval the engine snapshots the latency store,
//! splits the live peers by protocol availability, and drives one UDP, one
//! ICMP and one TCP round. ICMP shares the UDP peer set: it is only probed
//! toward peers that advertised the UDP service.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::probe::{IcmpProber, TcpProber, UdpProber};
use crate::store::{LatencyStore, Protocol};

pub struct ProbeEngine {
    store: Arc<LatencyStore>,
    udp: Arc<UdpProber>,
    icmp: Arc<IcmpProber>,
    tcp: Arc<TcpProber>,
    interval: Duration,
    cancel: CancellationToken,
}

impl ProbeEngine {
    pub fn new(
        store: Arc<LatencyStore>,
        udp: Arc<UdpProber>,
        icmp: Arc<IcmpProber>,
        tcp: Arc<TcpProber>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        ProbeEngine {
            store,
            udp,
            icmp,
            tcp,
            interval,
            cancel,
        }
    }

    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    let hosts = self.store.get_all();
                    let mut udp_peers: Vec<Ipv4Addr> = Vec::new();
                    let mut tcp_peers: Vec<Ipv4Addr> = Vec::new();
                    for (addr, host) in &hosts {
                        if host.is_protocol_available(Protocol::Udp) {
                            udp_peers.push(*addr);
                        }
                        if host.is_protocol_available(Protocol::Tcp) {
                            tcp_peers.push(*addr);
                        }
                    }
                    trace!(udp = udp_peers.len(), tcp = tcp_peers.len(), "probe round");

                    self.udp.measure(&udp_peers).await;
                    self.icmp.measure(&udp_peers);
                    self.tcp.measure(&tcp_peers);
                }
            }
        }
    }
}
