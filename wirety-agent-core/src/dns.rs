//! In-process authoritative + recursive DNS resolver (§4.5 step 4, §6).
//! Answers A queries locally for `peer.domain_suffix` and for route DNS
//! mappings from the bundle's `dns_zone`; everything else is relayed to
//! the configured upstreams in order until one answers.
//!
//! `hickory-proto`/`hickory-resolver` are the corpus's DNS stack
//! (`firezone-firezone/rust/connlib/tunnel/src/dns.rs`).

use std::{net::{IpAddr, SocketAddr}, sync::Arc, time::Duration};

use hickory_proto::{
    op::{Message, MessageType, ResponseCode},
    rr::{rdata::A, Name, RData, Record, RecordType},
};
use parking_lot::RwLock;
use tokio::net::UdpSocket;

use wirety_core::compiler::DnsZone;

use crate::error::AgentError;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(2);
const HIJACK_TTL: u32 = 1;
const RECORD_TTL: u32 = 60;

/// Mutable resolver state, swapped atomically under a write lock on every
/// reconciliation pass (§4.5 step 4: "update ... atomically (swap under a
/// write lock)").
pub struct Resolver {
    domain_suffix: String,
    zone: RwLock<DnsZone>,
    upstreams: RwLock<Vec<IpAddr>>,
    /// Peers behind a captive portal that have not yet authenticated;
    /// every A query from them is hijacked to `portal_ip` (§6).
    hijacked_peers: RwLock<Vec<IpAddr>>,
    portal_ip: RwLock<Option<IpAddr>>,
}

impl Resolver {
    pub fn new(domain_suffix: String) -> Arc<Self> {
        Arc::new(Self {
            domain_suffix,
            zone: RwLock::new(DnsZone::default()),
            upstreams: RwLock::new(Vec::new()),
            hijacked_peers: RwLock::new(Vec::new()),
            portal_ip: RwLock::new(None),
        })
    }

    pub fn update_zone(&self, zone: DnsZone, upstreams: Vec<IpAddr>) {
        *self.zone.write() = zone;
        *self.upstreams.write() = upstreams;
    }

    pub fn update_captive(&self, hijacked_peers: Vec<IpAddr>, portal_ip: Option<IpAddr>) {
        *self.hijacked_peers.write() = hijacked_peers;
        *self.portal_ip.write() = portal_ip;
    }

    fn local_answer(&self, name: &str, record_type: RecordType) -> Option<IpAddr> {
        if record_type != RecordType::A {
            return None;
        }
        let name = name.trim_end_matches('.');
        self.zone
            .read()
            .records
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(name))
            .map(|r| r.address)
    }

    fn hijack_for(&self, source: IpAddr) -> Option<IpAddr> {
        if self.hijacked_peers.read().iter().any(|p| p == &source) {
            *self.portal_ip.read()
        } else {
            None
        }
    }
}

/// Runs the UDP listener until the socket errors out or the process is
/// cancelled. One task per agent, per §5's scheduling model.
pub async fn serve(resolver: Arc<Resolver>, listen_addr: SocketAddr) -> Result<(), AgentError> {
    let socket = UdpSocket::bind(listen_addr)
        .await
        .map_err(|e| AgentError::Dns(format!("failed to bind {listen_addr}: {e}")))?;
    let socket = Arc::new(socket);
    log::info!("dns resolver listening on {listen_addr}");

    let mut buf = [0u8; 512];
    loop {
        let (len, source) = socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| AgentError::Dns(format!("recv_from failed: {e}")))?;
        let query = buf[..len].to_vec();
        let resolver = resolver.clone();
        let socket = socket.clone();
        tokio::task::spawn(async move {
            if let Err(e) = handle_query(&resolver, &socket, &query, source).await {
                log::warn!("dns query from {source} failed: {e}");
            }
        });
    }
}

async fn handle_query(resolver: &Resolver, socket: &UdpSocket, query: &[u8], source: SocketAddr) -> Result<(), AgentError> {
    let message = Message::from_vec(query).map_err(|e| AgentError::Dns(format!("malformed query: {e}")))?;
    let Some(question) = message.queries().first().cloned() else {
        return respond(socket, source, servfail(&message)).await;
    };

    if let Some(portal_ip) = resolver.hijack_for(source.ip()) {
        return respond(socket, source, hijack_response(&message, &question.name().to_utf8(), portal_ip)).await;
    }

    let name = question.name().to_utf8();
    if name.trim_end_matches('.').eq_ignore_ascii_case(resolver.domain_suffix.trim_end_matches('.'))
        || name.ends_with(&format!(".{}", resolver.domain_suffix))
    {
        if let Some(addr) = resolver.local_answer(&name, question.query_type()) {
            return respond(socket, source, authoritative_response(&message, &name, addr)).await;
        }
        return respond(socket, source, nxdomain(&message)).await;
    }

    let upstreams = resolver.upstreams.read().clone();
    for upstream in upstreams {
        match forward(query, upstream).await {
            Ok(response) => {
                socket
                    .send_to(&response, source)
                    .await
                    .map_err(|e| AgentError::Dns(format!("send_to {source} failed: {e}")))?;
                return Ok(());
            },
            Err(e) => log::debug!("upstream {upstream} failed: {e}"),
        }
    }
    respond(socket, source, servfail(&message)).await
}

async fn forward(query: &[u8], upstream: IpAddr) -> Result<Vec<u8>, AgentError> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await.map_err(|e| AgentError::Dns(e.to_string()))?;
    socket
        .send_to(query, (upstream, 53))
        .await
        .map_err(|e| AgentError::Dns(format!("forward to {upstream} failed: {e}")))?;

    let mut buf = [0u8; 512];
    let len = tokio::time::timeout(UPSTREAM_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| AgentError::Dns(format!("upstream {upstream} timed out")))?
        .map_err(|e| AgentError::Dns(format!("upstream {upstream} recv failed: {e}")))?;
    Ok(buf[..len].to_vec())
}

async fn respond(socket: &UdpSocket, source: SocketAddr, message: Message) -> Result<(), AgentError> {
    let bytes = message.to_vec().map_err(|e| AgentError::Dns(format!("failed to encode response: {e}")))?;
    socket
        .send_to(&bytes, source)
        .await
        .map_err(|e| AgentError::Dns(format!("send_to {source} failed: {e}")))?;
    Ok(())
}

fn reply_shell(query: &Message) -> Message {
    let mut reply = Message::new();
    reply.set_id(query.id());
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(query.op_code());
    reply.set_recursion_desired(query.recursion_desired());
    reply.set_recursion_available(true);
    for q in query.queries() {
        reply.add_query(q.clone());
    }
    reply
}

fn authoritative_response(query: &Message, name: &str, addr: IpAddr) -> Message {
    let mut reply = reply_shell(query);
    reply.set_response_code(ResponseCode::NoError);
    if let (IpAddr::V4(v4), Ok(fqdn)) = (addr, Name::from_utf8(name)) {
        reply.add_answer(Record::from_rdata(fqdn, RECORD_TTL, RData::A(A(v4))));
    }
    reply
}

/// Captive-portal DNS hijacker (§6): "answers A queries from
/// non-authenticated peers with the portal IP, TTL 1".
fn hijack_response(query: &Message, name: &str, portal_ip: IpAddr) -> Message {
    let mut reply = reply_shell(query);
    reply.set_response_code(ResponseCode::NoError);
    if let (IpAddr::V4(v4), Ok(fqdn)) = (portal_ip, Name::from_utf8(name)) {
        reply.add_answer(Record::from_rdata(fqdn, HIJACK_TTL, RData::A(A(v4))));
    }
    reply
}

fn nxdomain(query: &Message) -> Message {
    let mut reply = reply_shell(query);
    reply.set_response_code(ResponseCode::NXDomain);
    reply
}

fn servfail(query: &Message) -> Message {
    let mut reply = reply_shell(query);
    reply.set_response_code(ResponseCode::ServFail);
    reply
}
