//! Raw-socket ICMP echo probe.
//!
//! One raw ICMPv4 socket serves both directions: the measurement round
//! writes echo requests, a dedicated blocking thread drains replies and
//! correlates them by (peer, identifier, sequence). The identifier is drawn
//! fresh per request; the sequence number is shared across a round and wraps
//! at 0xFFFF.

use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::Rng;
use socket2::{Domain, Protocol as SockProtocol, SockAddr, Socket, Type};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::icmp::IcmpEcho;
use crate::probe::history::InflightTable;
use crate::probe::MAX_LATENCY;
use crate::store::{LatencyStore, Protocol};

/// Correlation key: (peer, identifier, sequence).
pub type IcmpKey = (Ipv4Addr, u16, u16);

pub struct IcmpProber {
    socket: Arc<Socket>,
    inflight: Arc<Mutex<InflightTable<IcmpKey>>>,
    store: Arc<LatencyStore>,
    sequence: Mutex<u16>,
    rng: Mutex<StdRng>,
}

impl IcmpProber {
    /// Open the raw socket. Requires CAP_NET_RAW; failure here is fatal at
    /// startup.
    pub fn open(store: Arc<LatencyStore>, rng: StdRng) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(SockProtocol::ICMPV4))
            .context("failed to open raw ICMP socket (requires CAP_NET_RAW or root)")?;
        // short timeout so the receive thread can poll for cancellation
        socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .context("failed to set ICMP socket read timeout")?;

        Ok(IcmpProber {
            socket: Arc::new(socket),
            inflight: Arc::new(Mutex::new(InflightTable::new())),
            store,
            sequence: Mutex::new(0),
            rng: Mutex::new(rng),
        })
    }

    /// Run the reply drain on a dedicated OS thread (blocking I/O).
    pub fn spawn_receiver(&self, cancel: CancellationToken) -> std::thread::JoinHandle<()> {
        let socket = self.socket.clone();
        let inflight = self.inflight.clone();
        let store = self.store.clone();

        std::thread::spawn(move || {
            let mut buf = [0u8; 1500];
            while !cancel.is_cancelled() {
                let uninit: &mut [MaybeUninit<u8>] = unsafe {
                    std::slice::from_raw_parts_mut(
                        buf.as_mut_ptr() as *mut MaybeUninit<u8>,
                        buf.len(),
                    )
                };
                let (len, sender) = match socket.recv_from(uninit) {
                    Ok((len, addr)) => match addr.as_socket_ipv4() {
                        Some(v4) => (len, *v4.ip()),
                        None => continue,
                    },
                    Err(e) => {
                        let timeout = matches!(
                            e.kind(),
                            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                        );
                        if !timeout {
                            warn!(error = %e, "ICMP receive failed");
                        }
                        continue;
                    }
                };

                let echo = match IcmpEcho::decode(&buf[..len], true) {
                    Ok(echo) => echo,
                    Err(_) => {
                        trace!(peer = %sender, "dropping non-matching ICMP datagram");
                        continue;
                    }
                };
                correlate_reply(&inflight, &store, sender, &echo, Instant::now());
            }
        })
    }

    /// Send one echo request per peer, all sharing this round's sequence
    /// number. An entry enters the in-flight table only after a successful
    /// send.
    pub fn measure(&self, peers: &[Ipv4Addr]) {
        self.inflight.lock().purge(MAX_LATENCY, Instant::now());

        let sequence = *self.sequence.lock();
        for &peer in peers {
            let identifier: u16 = self.rng.lock().gen();
            let request = IcmpEcho::request(identifier, sequence);

            let dest = SockAddr::from(SocketAddrV4::new(peer, 0));
            if let Err(e) = self.socket.send_to(&request.encode(), &dest) {
                debug!(peer = %peer, error = %e, "ICMP probe send failed");
                continue;
            }
            self.inflight
                .lock()
                .record((peer, identifier, sequence), Instant::now());
        }

        let mut seq = self.sequence.lock();
        *seq += 1;
        if *seq == 0xFFFF {
            *seq = 0;
        }
    }
}

/// Look the reply up by its full key; on a hit, record the elapsed time and
/// retire the entry. Replies from the wrong peer or with no matching entry
/// are dropped.
fn correlate_reply(
    inflight: &Mutex<InflightTable<IcmpKey>>,
    store: &LatencyStore,
    sender: Ipv4Addr,
    echo: &IcmpEcho,
    now: Instant,
) {
    let key = (sender, echo.identifier, echo.sequence);
    let Some(sent_at) = inflight.lock().take(&key) else {
        trace!(peer = %sender, "ICMP reply with no matching request");
        return;
    };
    store.add_latency(Protocol::Icmp, sender, now.duration_since(sent_at));
}
