//! mDNS service discovery: the probe/announce/respond state machine.
//!
//! Two service types are involved: `_opoznienia._udp.local.` (the latency
//! service, always advertised) and `_ssh._tcp.local.` (advertised only when
//! configured). The engine periodically multicasts PTR queries for both,
//! answers queries about this node's services, resolves hostname conflicts
//! against the discovered-host table, and feeds discovered peers into the
//! latency store.
//!
//! [`Discovery::process_datagram`] is a pure-ish state transition: it parses
//! one datagram, updates engine state, and returns the messages to send.
//! The socket loops in [`spawn`] only move bytes.

pub mod socket;

pub use socket::{local_addr_on_subnet, MdnsSocket, MDNS_GROUP, MDNS_PORT};

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::dns::{DnsFlags, DnsMessage, Question, RData, Record, CLASS_IN, TYPE_A, TYPE_PTR};
use crate::codec::DomainName;
use crate::store::{LatencyStore, Protocol};

pub const UDP_SERVICE: &str = "_opoznienia._udp.local.";
pub const TCP_SERVICE: &str = "_ssh._tcp.local.";

/// TTL carried by generated PTR and A records.
pub const DEFAULT_RECORD_TTL: u32 = 4500;
/// TTL cap for answers to legacy (non-5353-sourced) unicast queries.
const LEGACY_UNICAST_TTL: u32 = 10;

/// A response that has been multicast within a quarter of its TTL is not
/// multicast again; the querier gets a unicast copy instead.
const MULTICAST_SUPPRESSION: Duration = Duration::from_secs(DEFAULT_RECORD_TTL as u64 / 4);

/// Rate-limit bookkeeping slots, one per generated record type.
const KIND_PTR: usize = 0;
const KIND_A: usize = 1;

/// A message the engine decided to send: to whom, and after what delay.
#[derive(Debug)]
pub struct OutgoingMessage {
    pub message: DnsMessage,
    pub dest: SocketAddrV4,
    pub delay: Duration,
}

impl OutgoingMessage {
    fn multicast(message: DnsMessage, delay: Duration) -> Self {
        OutgoingMessage {
            message,
            dest: SocketAddrV4::new(MDNS_GROUP, MDNS_PORT),
            delay,
        }
    }

    fn unicast(message: DnsMessage, dest: SocketAddrV4, delay: Duration) -> Self {
        OutgoingMessage {
            message,
            dest,
            delay,
        }
    }
}

pub struct Discovery {
    store: Arc<LatencyStore>,
    advertise_tcp: bool,
    hostname: Mutex<String>,
    hostname_established: AtomicBool,
    /// First label of a discovered domain → expiry.
    known_hosts: Mutex<HashMap<DomainName, Instant>>,
    /// When this node last multicast a PTR / A response (send delay included).
    last_multicast: Mutex<[Option<Instant>; 2]>,
    rng: Mutex<StdRng>,
    udp_service: DomainName,
    tcp_service: DomainName,
    /// Picks the local address announced in A answers for a given querier.
    addr_source: Box<dyn Fn(Ipv4Addr) -> Ipv4Addr + Send + Sync>,
}

impl Discovery {
    pub fn new(
        store: Arc<LatencyStore>,
        advertise_tcp: bool,
        base_hostname: String,
        rng: StdRng,
    ) -> Self {
        Discovery {
            store,
            advertise_tcp,
            hostname: Mutex::new(base_hostname),
            hostname_established: AtomicBool::new(false),
            known_hosts: Mutex::new(HashMap::new()),
            last_multicast: Mutex::new([None; 2]),
            rng: Mutex::new(rng),
            udp_service: DomainName::from_dotted(UDP_SERVICE),
            tcp_service: DomainName::from_dotted(TCP_SERVICE),
            addr_source: Box::new(local_addr_on_subnet),
        }
    }

    /// Replace the interface-scanning address source.
    pub fn with_addr_source(
        mut self,
        source: impl Fn(Ipv4Addr) -> Ipv4Addr + Send + Sync + 'static,
    ) -> Self {
        self.addr_source = Box::new(source);
        self
    }

    pub fn hostname(&self) -> String {
        self.hostname.lock().clone()
    }

    /// The periodic PTR query for both service names. The first round asks
    /// for unicast responses ("QU"), later rounds for multicast ("QM").
    pub fn query_message(&self, unicast_response: bool) -> DnsMessage {
        let question = |name: &DomainName| Question {
            name: name.clone(),
            qtype: TYPE_PTR,
            qclass: CLASS_IN,
            unicast_response,
        };
        DnsMessage {
            id: 0,
            flags: DnsFlags::default(),
            questions: vec![question(&self.tcp_service), question(&self.udp_service)],
            answers: vec![],
        }
    }

    /// Adopt the first `base-i` label that is absent from the discovered
    /// hosts table. Questions are only answered once this has run.
    pub fn establish_hostname(&self) {
        if self.hostname_established.load(Ordering::Acquire) {
            return;
        }
        let now = Instant::now();
        let base = self.hostname.lock().clone();

        let mut index = 0u32;
        let adopted = loop {
            let candidate = format!("{base}-{index}");
            if !self.is_host_known(&DomainName::from_dotted(&candidate), now) {
                break candidate;
            }
            index += 1;
        };

        info!(hostname = %adopted, "hostname established");
        *self.hostname.lock() = adopted;
        self.hostname_established.store(true, Ordering::Release);
    }

    /// Digest one received datagram and return the responses to send.
    /// `directed` is true when the datagram was unicast to this host rather
    /// than sent to the multicast group.
    pub fn process_datagram(
        &self,
        data: &[u8],
        sender: SocketAddrV4,
        directed: bool,
        now: Instant,
    ) -> Vec<OutgoingMessage> {
        let message = match DnsMessage::parse(data) {
            Ok(message) => message,
            Err(_) => {
                trace!(sender = %sender, "dropping malformed DNS datagram");
                return Vec::new();
            }
        };

        if message.flags.opcode != 0 || message.flags.rcode != 0 {
            return Vec::new();
        }

        if !message.flags.response && self.hostname_established.load(Ordering::Acquire) {
            self.handle_questions(&message, sender, directed, now)
        } else {
            self.handle_responses(&message, sender, now)
        }
    }

    fn handle_questions(
        &self,
        message: &DnsMessage,
        sender: SocketAddrV4,
        directed: bool,
        now: Instant,
    ) -> Vec<OutgoingMessage> {
        let mut out = Vec::new();
        for question in &message.questions {
            if self.ignore_question(question) {
                continue;
            }

            if sender.port() != MDNS_PORT {
                // legacy unicast query; truncated ones are not supported
                if !message.flags.truncated {
                    out.extend(self.legacy_response(message.id, question, sender));
                }
            } else if directed || question.unicast_response {
                out.extend(self.unicast_response(question, sender));
            } else {
                out.extend(self.rate_limited_response(question, sender, now));
            }
        }
        out
    }

    fn ignore_question(&self, question: &Question) -> bool {
        if question.qtype != TYPE_PTR && question.qtype != TYPE_A {
            return true;
        }
        if !self.advertise_tcp {
            let hostname = self.hostname.lock().clone();
            let own_tcp_name = DomainName::from_dotted(&format!("{hostname}.{TCP_SERVICE}"));
            if question.name == self.tcp_service || question.name == own_tcp_name {
                return true;
            }
        }
        question.qclass != CLASS_IN
    }

    /// Answer a query from an ordinary DNS client: echo its id and question,
    /// cap the TTL, reply straight to its source port.
    fn legacy_response(
        &self,
        query_id: u16,
        question: &Question,
        sender: SocketAddrV4,
    ) -> Option<OutgoingMessage> {
        let mut answer = self.answer_for(question, sender)?;
        answer.ttl = LEGACY_UNICAST_TTL;

        let message = DnsMessage {
            id: query_id,
            flags: DnsFlags {
                response: true,
                ..DnsFlags::default()
            },
            questions: vec![question.clone()],
            answers: vec![answer],
        };
        Some(OutgoingMessage::unicast(message, sender, Duration::ZERO))
    }

    /// Answer a directed or QU question: unicast back to the querier.
    fn unicast_response(
        &self,
        question: &Question,
        sender: SocketAddrV4,
    ) -> Option<OutgoingMessage> {
        let answer = self.answer_for(question, sender)?;
        let delay = self.response_delay(question.qtype);
        Some(OutgoingMessage::unicast(
            response_message(answer),
            sender,
            delay,
        ))
    }

    /// Answer a QM question. The response goes to the group unless a
    /// multicast response of the same record type went out within a quarter
    /// of the TTL; within that window the querier gets a unicast copy.
    fn rate_limited_response(
        &self,
        question: &Question,
        sender: SocketAddrV4,
        now: Instant,
    ) -> Option<OutgoingMessage> {
        let kind = kind_index(question.qtype);
        let recently_multicast = self.last_multicast.lock()[kind]
            .is_some_and(|at| now.duration_since(at) < MULTICAST_SUPPRESSION);

        if recently_multicast {
            return self.unicast_response(question, sender);
        }

        let answer = self.answer_for(question, sender)?;
        let delay = self.response_delay(question.qtype);
        self.last_multicast.lock()[kind] = Some(now + delay);
        Some(OutgoingMessage::multicast(response_message(answer), delay))
    }

    /// Build the PTR or A answer for a question about this node's services;
    /// `None` when the question does not match an advertised name.
    fn answer_for(&self, question: &Question, sender: SocketAddrV4) -> Option<Record> {
        match question.qtype {
            TYPE_PTR => self.ptr_answer(question),
            TYPE_A => self.a_answer(question, *sender.ip()),
            _ => None,
        }
    }

    fn ptr_answer(&self, question: &Question) -> Option<Record> {
        let hostname = self.hostname.lock().clone();
        for (service, text) in [
            (&self.tcp_service, TCP_SERVICE),
            (&self.udp_service, UDP_SERVICE),
        ] {
            if question.name == *service {
                return Some(Record {
                    name: question.name.clone(),
                    rrclass: CLASS_IN,
                    ttl: DEFAULT_RECORD_TTL,
                    rdata: RData::Ptr(DomainName::from_dotted(&format!("{hostname}.{text}"))),
                });
            }
        }
        None
    }

    fn a_answer(&self, question: &Question, querier: Ipv4Addr) -> Option<Record> {
        let hostname = self.hostname.lock().clone();
        for text in [TCP_SERVICE, UDP_SERVICE] {
            if question.name == DomainName::from_dotted(&format!("{hostname}.{text}")) {
                return Some(Record {
                    name: question.name.clone(),
                    rrclass: CLASS_IN,
                    ttl: DEFAULT_RECORD_TTL,
                    rdata: RData::A((self.addr_source)(querier)),
                });
            }
        }
        None
    }

    /// PTR responses are spread over a small random delay; A responses go
    /// out immediately.
    fn response_delay(&self, qtype: u16) -> Duration {
        if qtype == TYPE_PTR {
            Duration::from_micros(self.rng.lock().gen_range(20..=120))
        } else {
            Duration::ZERO
        }
    }

    /// Digest answers from a real mDNS responder (source port 5353 only).
    fn handle_responses(
        &self,
        message: &DnsMessage,
        sender: SocketAddrV4,
        now: Instant,
    ) -> Vec<OutgoingMessage> {
        if sender.port() != MDNS_PORT {
            return Vec::new();
        }

        let mut out = Vec::new();
        for record in &message.answers {
            match &record.rdata {
                RData::Ptr(target) => {
                    if !self.supported_service(target) {
                        continue;
                    }
                    debug!(instance = %target, "discovered service instance");
                    self.add_known_host(target, Duration::from_secs(record.ttl as u64), now);
                    out.push(OutgoingMessage::multicast(
                        a_query(target),
                        Duration::ZERO,
                    ));
                }
                RData::A(addr) => {
                    if !self.supported_service(&record.name)
                        || !self.is_host_known(&record.name, now)
                    {
                        continue;
                    }
                    let ttl = Duration::from_secs(record.ttl as u64);
                    let parent = record.name.parent();
                    if parent == self.tcp_service {
                        self.store
                            .set_connection_available_at(Protocol::Tcp, *addr, ttl, now);
                    }
                    if parent == self.udp_service {
                        self.store
                            .set_connection_available_at(Protocol::Udp, *addr, ttl, now);
                    }
                }
                RData::Other { .. } => {}
            }
        }
        out
    }

    fn supported_service(&self, domain: &DomainName) -> bool {
        let parent = domain.parent();
        parent == self.tcp_service || parent == self.udp_service
    }

    fn add_known_host(&self, domain: &DomainName, ttl: Duration, now: Instant) {
        self.known_hosts
            .lock()
            .insert(domain.first_label(), now + ttl);
    }

    fn is_host_known(&self, domain: &DomainName, now: Instant) -> bool {
        let label = domain.first_label();
        let mut known = self.known_hosts.lock();
        if known.get(&label).is_some_and(|expiry| *expiry < now) {
            known.remove(&label);
        }
        known.contains_key(&label)
    }
}

fn response_message(answer: Record) -> DnsMessage {
    DnsMessage {
        id: 0,
        flags: DnsFlags {
            response: true,
            ..DnsFlags::default()
        },
        questions: vec![],
        answers: vec![answer],
    }
}

/// The follow-up A query emitted after discovering a service instance.
fn a_query(target: &DomainName) -> DnsMessage {
    DnsMessage {
        id: 0,
        flags: DnsFlags::default(),
        questions: vec![Question {
            name: target.clone(),
            qtype: TYPE_A,
            qclass: CLASS_IN,
            unicast_response: false,
        }],
        answers: vec![],
    }
}

fn kind_index(qtype: u16) -> usize {
    if qtype == TYPE_PTR {
        KIND_PTR
    } else {
        KIND_A
    }
}

/// Start the receive thread and the periodic lookup task.
pub fn spawn(
    discovery: Arc<Discovery>,
    mdns: Arc<MdnsSocket>,
    cancel: CancellationToken,
    lookup_interval: Duration,
) -> std::thread::JoinHandle<()> {
    let receiver = {
        let discovery = discovery.clone();
        let mdns = mdns.clone();
        let cancel = cancel.clone();
        std::thread::spawn(move || receive_loop(discovery, mdns, cancel))
    };

    tokio::spawn(async move {
        let mut unicast_round = true;
        loop {
            let query = discovery.query_message(unicast_round);
            dispatch(
                &mdns,
                OutgoingMessage::multicast(query, Duration::ZERO),
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(lookup_interval) => {}
            }

            unicast_round = false;
            discovery.establish_hostname();
        }
    });

    receiver
}

fn receive_loop(discovery: Arc<Discovery>, mdns: Arc<MdnsSocket>, cancel: CancellationToken) {
    let mut buf = [0u8; 1500];
    while !cancel.is_cancelled() {
        let (len, sender, destination) = match mdns.recv_with_destination(&mut buf) {
            Ok(received) => received,
            Err(e) => {
                let timeout = matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                );
                if !timeout {
                    warn!(error = %e, "mDNS receive failed");
                }
                continue;
            }
        };

        let directed = destination != MDNS_GROUP;
        let outgoing = discovery.process_datagram(&buf[..len], sender, directed, Instant::now());
        for message in outgoing {
            dispatch(&mdns, message);
        }
    }
}

/// Immediate sends go out inline; delayed ones from a detached thread so
/// the receive loop never sleeps.
fn dispatch(mdns: &Arc<MdnsSocket>, outgoing: OutgoingMessage) {
    let bytes = outgoing.message.encode();
    if outgoing.delay.is_zero() {
        mdns.send_to(&bytes, outgoing.dest);
    } else {
        let mdns = mdns.clone();
        let dest = outgoing.dest;
        let delay = outgoing.delay;
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            mdns.send_to(&bytes, dest);
        });
    }
}
