//! Cross-module scenario tests: the discovery handshake between two nodes,
//! a real UDP probe round over loopback, and a dashboard client session.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use lagmon::discovery::{Discovery, MDNS_PORT};
use lagmon::probe::UdpProber;
use lagmon::store::{LatencyStore, Protocol};
use lagmon::terminal::DashboardServer;

const X_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const Y_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

/// The full mDNS exchange: a PTR query with the unicast bit set, a unicast
/// PTR answer, the follow-up A query, and the A answer that lands the peer
/// in the querier's latency store with UDP (and only UDP) available.
#[test]
fn discovery_handshake_populates_the_store() {
    let now = Instant::now();

    let x_store = Arc::new(LatencyStore::new());
    let x = Discovery::new(x_store.clone(), false, "x".into(), StdRng::seed_from_u64(1))
        .with_addr_source(|_| X_ADDR);

    let y_store = Arc::new(LatencyStore::new());
    let y = Discovery::new(y_store, false, "y".into(), StdRng::seed_from_u64(2))
        .with_addr_source(|_| Y_ADDR);
    y.establish_hostname();
    assert_eq!(y.hostname(), "y-0");

    let x_at = SocketAddrV4::new(X_ADDR, MDNS_PORT);
    let y_at = SocketAddrV4::new(Y_ADDR, MDNS_PORT);

    // X multicasts its PTR query asking for unicast responses
    let query = x.query_message(true);
    let replies = y.process_datagram(&query.encode(), x_at, false, now);

    // Y answers the latency service question only (no _ssh._tcp advertised),
    // by unicast, with the full TTL
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].dest, x_at);
    let answer = &replies[0].message.answers[0];
    assert_eq!(answer.ttl, 4500);
    assert_eq!(
        format!("{}", match &answer.rdata {
            lagmon::codec::RData::Ptr(target) => target.clone(),
            other => panic!("expected a PTR answer, got {other:?}"),
        }),
        "y-0._opoznienia._udp.local."
    );

    // X digests the PTR answer and follows up with an A query
    let follow_up = x.process_datagram(&replies[0].message.encode(), y_at, true, now);
    assert_eq!(follow_up.len(), 1);
    assert_eq!(follow_up[0].message.questions[0].qtype, lagmon::codec::dns::TYPE_A);

    // Y resolves the name to its own address on X's subnet
    let a_replies = y.process_datagram(&follow_up[0].message.encode(), x_at, false, now);
    assert_eq!(a_replies.len(), 1);
    assert_eq!(a_replies[0].message.answers[0].ttl, 4500);

    // the A answer makes Y a live UDP peer in X's store
    x.process_datagram(&a_replies[0].message.encode(), y_at, false, now);

    let all = x_store.get_all_at(now);
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].0, Y_ADDR);
    assert!(all[0].1.is_protocol_available(Protocol::Udp));
    assert!(!all[0].1.is_protocol_available(Protocol::Tcp));
}

/// One real probe round against this node's own echo server over loopback:
/// request out, reply back, a sample lands in the UDP window.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn udp_probe_round_trip_over_loopback() {
    let peer = Ipv4Addr::LOCALHOST;
    let store = Arc::new(LatencyStore::new());
    store.set_connection_available(Protocol::Udp, peer, Duration::from_secs(60));

    let prober = Arc::new(UdpProber::bind(0, store.clone()).await.expect("bind prober"));
    let cancel = CancellationToken::new();
    prober.spawn(cancel.clone());

    prober.measure(&[peer]).await;

    let mut sampled = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let all = store.get_all();
        if all
            .iter()
            .any(|(addr, host)| *addr == peer && host.latency(Protocol::Udp).is_some())
        {
            sampled = true;
            break;
        }
    }
    cancel.cancel();
    assert!(sampled, "no UDP latency sample recorded");
}

/// A dashboard session: option negotiation on connect, bell on unknown
/// input.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dashboard_negotiates_and_rings_the_bell() {
    const IAC: u8 = 255;
    const WILL: u8 = 251;
    const BELL: u8 = 0x07;

    let store = Arc::new(LatencyStore::new());
    let server = Arc::new(DashboardServer::new(store));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("listener addr");
    let cancel = CancellationToken::new();
    server.spawn(listener, Duration::from_millis(50), cancel.clone());

    let mut client = tokio::net::TcpStream::connect(addr).await.expect("connect");

    // IAC WILL SUPPRESS-GO-AHEAD, IAC WILL ECHO
    let mut negotiation = [0u8; 6];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut negotiation))
        .await
        .expect("negotiation timed out")
        .expect("read negotiation");
    assert_eq!(negotiation, [IAC, WILL, 3, IAC, WILL, 1]);

    // an unknown key is answered with a single bell (redraw frames may
    // interleave, so scan the stream)
    client.write_all(b"x").await.expect("send input");
    let mut seen = Vec::new();
    let belled = tokio::time::timeout(Duration::from_secs(5), async {
        let mut chunk = [0u8; 256];
        loop {
            let len = client.read(&mut chunk).await.expect("read");
            if len == 0 {
                panic!("server closed the session");
            }
            seen.extend_from_slice(&chunk[..len]);
            if seen.contains(&BELL) {
                break;
            }
        }
    })
    .await;
    cancel.cancel();
    assert!(belled.is_ok(), "no bell received");
}
