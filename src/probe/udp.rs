//! UDP echo probe, client and server halves.
//!
//! Wire format: a request is 8 octets carrying the sender's send timestamp
//! in big-endian microseconds; the reply is 16 octets, the echoed send
//! timestamp followed by the responder's own timestamp. Only the echoed
//! value is used for correlation, so clocks never need to agree. Datagrams
//! of any other size are dropped.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::probe::history::InflightTable;
use crate::probe::{now_micros, MAX_LATENCY};
use crate::store::{LatencyStore, Protocol};

const REQUEST_LEN: usize = 8;
const REPLY_LEN: usize = 16;

/// Build the 16-octet reply for a valid 8-octet request, `None` otherwise.
pub fn echo_reply(request: &[u8], response_micros: u64) -> Option<[u8; REPLY_LEN]> {
    let send_time: [u8; 8] = request.try_into().ok()?;
    let mut reply = [0u8; REPLY_LEN];
    reply[..8].copy_from_slice(&send_time);
    reply[8..].copy_from_slice(&response_micros.to_be_bytes());
    Some(reply)
}

pub struct UdpProber {
    /// Ephemerally bound socket requests leave from and replies return to.
    client: Arc<UdpSocket>,
    /// Socket answering other nodes' requests on the configured probe port.
    server: Arc<UdpSocket>,
    probe_port: u16,
    inflight: Mutex<InflightTable<(Ipv4Addr, u64)>>,
    store: Arc<LatencyStore>,
}

impl UdpProber {
    pub async fn bind(probe_port: u16, store: Arc<LatencyStore>) -> Result<Self> {
        let server = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, probe_port))
            .await
            .with_context(|| format!("failed to bind UDP probe server on port {probe_port}"))?;
        // resolve an ephemeral request into the concrete port probes target
        let probe_port = server.local_addr().context("server socket has no address")?.port();
        let client = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .context("failed to bind UDP probe client socket")?;

        Ok(UdpProber {
            client: Arc::new(client),
            server: Arc::new(server),
            probe_port,
            inflight: Mutex::new(InflightTable::new()),
            store,
        })
    }

    /// Spawn the server and client receive loops.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) {
        let prober = self.clone();
        let token = cancel.clone();
        tokio::spawn(async move { prober.server_loop(token).await });

        let prober = self.clone();
        tokio::spawn(async move { prober.client_loop(cancel).await });
    }

    /// Send one timestamped request to every peer. The in-flight entry is
    /// keyed by (peer, send timestamp); stale entries age out first.
    pub async fn measure(&self, peers: &[Ipv4Addr]) {
        self.inflight.lock().purge(MAX_LATENCY, Instant::now());

        for &peer in peers {
            let send_time = now_micros();
            self.inflight.lock().record((peer, send_time), Instant::now());

            let dest = SocketAddrV4::new(peer, self.probe_port);
            if let Err(e) = self.client.send_to(&send_time.to_be_bytes(), dest).await {
                debug!(peer = %peer, error = %e, "UDP probe send failed");
            }
        }
    }

    async fn server_loop(&self, cancel: CancellationToken) {
        let mut buf = [0u8; 1500];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.server.recv_from(&mut buf) => {
                    let (len, sender) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            debug!(error = %e, "UDP server receive failed");
                            continue;
                        }
                    };
                    if let Some(reply) = echo_reply(&buf[..len], now_micros()) {
                        if let Err(e) = self.server.send_to(&reply, sender).await {
                            debug!(peer = %sender, error = %e, "UDP echo reply failed");
                        }
                    }
                }
            }
        }
    }

    async fn client_loop(&self, cancel: CancellationToken) {
        let mut buf = [0u8; 1500];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.client.recv_from(&mut buf) => {
                    let (len, sender) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            debug!(error = %e, "UDP client receive failed");
                            continue;
                        }
                    };
                    if let SocketAddr::V4(sender) = sender {
                        self.handle_reply(&buf[..len], *sender.ip(), now_micros());
                    }
                }
            }
        }
    }

    /// Correlate a 16-octet reply against the in-flight table and feed the
    /// elapsed time into the store.
    fn handle_reply(&self, data: &[u8], sender: Ipv4Addr, now: u64) {
        if data.len() != REPLY_LEN {
            trace!(len = data.len(), peer = %sender, "dropping odd-sized UDP reply");
            return;
        }
        let send_time = u64::from_be_bytes(data[..8].try_into().expect("checked length"));

        if self.inflight.lock().take(&(sender, send_time)).is_none() {
            trace!(peer = %sender, "UDP reply with no matching request");
            return;
        }

        let elapsed = Duration::from_micros(now.saturating_sub(send_time));
        self.store.add_latency(Protocol::Udp, sender, elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 9);

    fn test_prober() -> UdpProber {
        // sockets are unused by the correlation tests
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .unwrap();
        runtime.block_on(async { UdpProber::bind(0, Arc::new(LatencyStore::new())).await.unwrap() })
    }

    #[test]
    fn echo_reply_format() {
        let request = 0x64u64.to_be_bytes();
        let reply = echo_reply(&request, 0xFA).unwrap();
        assert_eq!(&reply[..8], &request);
        assert_eq!(&reply[8..], &0xFAu64.to_be_bytes());
    }

    #[test]
    fn echo_reply_rejects_other_sizes() {
        assert!(echo_reply(&[0u8; 7], 1).is_none());
        assert!(echo_reply(&[0u8; 9], 1).is_none());
        assert!(echo_reply(&[0u8; 16], 1).is_none());
    }

    #[test]
    fn reply_correlates_and_records() {
        let prober = test_prober();
        let t0 = Instant::now();
        prober
            .store
            .set_connection_available_at(Protocol::Udp, PEER, Duration::from_secs(60), t0);

        let send_time = 100u64;
        prober.inflight.lock().record((PEER, send_time), t0);

        let mut reply = [0u8; 16];
        reply[..8].copy_from_slice(&send_time.to_be_bytes());
        reply[8..].copy_from_slice(&250u64.to_be_bytes());
        prober.handle_reply(&reply, PEER, send_time + 250);

        let all = prober.store.get_all_at(t0);
        assert_eq!(all[0].1.latency(Protocol::Udp), Some(250));
        // the entry is consumed; a duplicate reply records nothing
        prober.handle_reply(&reply, PEER, send_time + 400);
        let all = prober.store.get_all_at(t0);
        assert_eq!(all[0].1.latency(Protocol::Udp), Some(250));
    }

    #[test]
    fn odd_sized_replies_are_dropped() {
        let prober = test_prober();
        let t0 = Instant::now();
        prober
            .store
            .set_connection_available_at(Protocol::Udp, PEER, Duration::from_secs(60), t0);
        prober.inflight.lock().record((PEER, 100), t0);

        prober.handle_reply(&[0u8; 15], PEER, 350);
        prober.handle_reply(&[0u8; 17], PEER, 350);

        assert_eq!(prober.inflight.lock().len(), 1);
        let all = prober.store.get_all_at(t0);
        assert_eq!(all[0].1.latency(Protocol::Udp), None);
    }

    #[test]
    fn reply_from_wrong_peer_is_dropped() {
        let prober = test_prober();
        let t0 = Instant::now();
        prober.inflight.lock().record((PEER, 100), t0);

        let mut reply = [0u8; 16];
        reply[..8].copy_from_slice(&100u64.to_be_bytes());
        prober.handle_reply(&reply, Ipv4Addr::new(192, 168, 0, 10), 350);

        assert_eq!(prober.inflight.lock().len(), 1);
    }
}
