//! TCP connect probe.
//!
//! The measurement is the duration of a plain connect to the peer's SSH
//! port; no payload is exchanged and the connection is closed as soon as it
//! opens. Each pending connect runs as its own task; the purge pass aborts
//! attempts that have outlived the in-flight bound.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::probe::MAX_LATENCY;
use crate::store::{LatencyStore, Protocol};

/// The port the `_ssh._tcp` service advertises.
pub const TCP_PROBE_PORT: u16 = 22;

pub struct TcpProber {
    pending: Mutex<VecDeque<(AbortHandle, Instant)>>,
    store: Arc<LatencyStore>,
    cancel: CancellationToken,
}

impl TcpProber {
    pub fn new(store: Arc<LatencyStore>, cancel: CancellationToken) -> Self {
        TcpProber {
            pending: Mutex::new(VecDeque::new()),
            store,
            cancel,
        }
    }

    /// Start one connect attempt per peer. Connect failures are silent; a
    /// successful connect records its elapsed time and closes the socket.
    pub fn measure(&self, peers: &[Ipv4Addr]) {
        self.purge();

        for &peer in peers {
            let store = self.store.clone();
            let cancel = self.cancel.clone();
            let started = Instant::now();

            let handle = tokio::spawn(async move {
                let dest = SocketAddrV4::new(peer, TCP_PROBE_PORT);
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    connected = TcpStream::connect(dest) => match connected {
                        Ok(stream) => {
                            store.add_latency(Protocol::Tcp, peer, started.elapsed());
                            drop(stream);
                        }
                        Err(e) => {
                            trace!(peer = %peer, error = %e, "TCP probe connect failed");
                        }
                    }
                }
            });

            self.pending.lock().push_back((handle.abort_handle(), started));
        }
    }

    /// Abort connect attempts older than the in-flight bound. Finished tasks
    /// age out of the queue the same way; aborting them is a no-op.
    fn purge(&self) {
        let now = Instant::now();
        let mut pending = self.pending.lock();
        while let Some((_, started)) = pending.front() {
            if now.duration_since(*started) <= MAX_LATENCY {
                break;
            }
            if let Some((handle, _)) = pending.pop_front() {
                handle.abort();
            }
        }
    }
}
