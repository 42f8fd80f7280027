//! The dashboard server: plain TCP carrying a character-mode terminal
//! session.
//!
//! On accept the server negotiates `WILL SUPPRESS-GO-AHEAD` + `WILL ECHO`
//! to put line-oriented clients into character-at-a-time, no-local-echo
//! mode. `q` scrolls up, `a` scrolls down, anything else rings the bell.
//! A refresh task re-renders the store snapshot at the configured period
//! and pushes each client its visible slice.

pub mod render;

pub use render::{render_lines, visible_range, CONSOLE_HEIGHT, CONSOLE_WIDTH};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::store::LatencyStore;

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const OPT_ECHO: u8 = 1;
const OPT_SUPPRESS_GO_AHEAD: u8 = 3;
const BELL: u8 = 0x07;
const ESC: u8 = 0x1B;

/// Sent immediately after accept: take over echoing and go-ahead.
const INITIAL_NEGOTIATION: [u8; 6] = [IAC, WILL, OPT_SUPPRESS_GO_AHEAD, IAC, WILL, OPT_ECHO];

pub struct DashboardServer {
    store: Arc<LatencyStore>,
    /// Rendered dashboard, shared between the refresh task and per-client
    /// scroll handling.
    lines: Mutex<Vec<String>>,
    /// Weak so that the list never keeps a closed session alive; the read
    /// task's own Arc is what keeps a session live.
    clients: Mutex<Vec<Weak<ClientSession>>>,
}

struct ClientSession {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    top_row: AtomicUsize,
}

impl ClientSession {
    async fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await
    }
}

/// What one pass over a client's buffered input asks the server to do.
#[derive(Debug, PartialEq, Eq)]
enum ClientEvent {
    Send(Vec<u8>),
    Redraw,
}

/// Consume as much buffered input as possible. An option-negotiation
/// command is three bytes; a partial one stays buffered until the rest
/// arrives. The first two `DO` acknowledgements of the options we offered
/// are accepted silently, every other request is refused.
fn consume_input(
    buffer: &mut Vec<u8>,
    top_row: &mut usize,
    ack_count: &mut u32,
    total_rows: usize,
) -> Vec<ClientEvent> {
    let mut events = Vec::new();

    while let Some(&byte) = buffer.first() {
        match byte {
            IAC => {
                if buffer.len() < 3 {
                    break;
                }
                let verb = buffer[1];
                let option = buffer[2];
                if verb == WILL {
                    events.push(ClientEvent::Send(vec![IAC, DONT, option]));
                } else if verb == DO {
                    let expected_ack = *ack_count < 2
                        && (option == OPT_ECHO || option == OPT_SUPPRESS_GO_AHEAD);
                    if !expected_ack {
                        events.push(ClientEvent::Send(vec![IAC, WONT, option]));
                    }
                    *ack_count += 1;
                }
                buffer.drain(..3);
            }
            b'Q' | b'q' => {
                buffer.remove(0);
                if *top_row > 0 {
                    *top_row -= 1;
                    events.push(ClientEvent::Redraw);
                }
            }
            b'A' | b'a' => {
                buffer.remove(0);
                if *top_row + CONSOLE_HEIGHT < total_rows {
                    *top_row += 1;
                    events.push(ClientEvent::Redraw);
                } else {
                    events.push(ClientEvent::Send(vec![BELL]));
                }
            }
            _ => {
                buffer.remove(0);
                events.push(ClientEvent::Send(vec![BELL]));
            }
        }
    }

    events
}

impl DashboardServer {
    pub fn new(store: Arc<LatencyStore>) -> Self {
        DashboardServer {
            store,
            lines: Mutex::new(Vec::new()),
            clients: Mutex::new(Vec::new()),
        }
    }

    /// Start the acceptor and the periodic refresh.
    pub fn spawn(self: &Arc<Self>, listener: TcpListener, refresh: Duration, cancel: CancellationToken) {
        let server = self.clone();
        let token = cancel.clone();
        tokio::spawn(async move { server.accept_loop(listener, token).await });

        let server = self.clone();
        tokio::spawn(async move { server.refresh_loop(refresh, cancel).await });
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            debug!(error = %e, "dashboard accept failed");
                            continue;
                        }
                    };
                    trace!(peer = %peer, "dashboard client connected");

                    let (reader, writer) = stream.into_split();
                    let session = Arc::new(ClientSession {
                        writer: tokio::sync::Mutex::new(writer),
                        top_row: AtomicUsize::new(0),
                    });

                    if session.write(&INITIAL_NEGOTIATION).await.is_err() {
                        continue;
                    }
                    self.clients.lock().push(Arc::downgrade(&session));

                    let server = self.clone();
                    let token = cancel.clone();
                    tokio::spawn(async move { server.client_loop(session, reader, token).await });
                }
            }
        }
    }

    async fn client_loop(
        self: Arc<Self>,
        session: Arc<ClientSession>,
        mut reader: OwnedReadHalf,
        cancel: CancellationToken,
    ) {
        let mut buffer = Vec::new();
        let mut ack_count = 0u32;
        let mut chunk = [0u8; 128];

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => return,
                received = reader.read(&mut chunk) => received,
            };
            let len = match received {
                Ok(0) | Err(_) => return,
                Ok(len) => len,
            };
            buffer.extend_from_slice(&chunk[..len]);

            let total_rows = self.lines.lock().len();
            let mut top_row = session.top_row.load(Ordering::Relaxed);
            let events = consume_input(&mut buffer, &mut top_row, &mut ack_count, total_rows);
            session.top_row.store(top_row, Ordering::Relaxed);

            for event in events {
                let result = match event {
                    ClientEvent::Send(bytes) => session.write(&bytes).await,
                    ClientEvent::Redraw => self.redraw_client(&session).await,
                };
                if result.is_err() {
                    return;
                }
            }
        }
    }

    async fn refresh_loop(self: Arc<Self>, refresh: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(refresh);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    *self.lines.lock() = render_lines(self.store.get_all());

                    // prune dead sessions, then push the new frame to the rest
                    let live: Vec<Arc<ClientSession>> = {
                        let mut clients = self.clients.lock();
                        clients.retain(|client| client.strong_count() > 0);
                        clients.iter().filter_map(Weak::upgrade).collect()
                    };
                    for session in live {
                        let _ = self.redraw_client(&session).await;
                    }
                }
            }
        }
    }

    /// Clear the screen, home the cursor, and write the client's visible
    /// slice with next-line between rows.
    async fn redraw_client(&self, session: &ClientSession) -> std::io::Result<()> {
        let frame = {
            let lines = self.lines.lock();
            let range = visible_range(lines.len(), session.top_row.load(Ordering::Relaxed));
            let mut frame: Vec<u8> = vec![ESC, b'[', b'2', b'J', ESC, b'[', b'H'];
            let mut first = true;
            for line in &lines[range] {
                if !first {
                    frame.push(ESC);
                    frame.push(b'E');
                }
                frame.extend_from_slice(line.as_bytes());
                first = false;
            }
            frame
        };
        session.write(&frame).await
    }
}
