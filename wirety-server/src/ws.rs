//! The distribution channel's websocket-accept endpoint (C9, §4.7): a
//! standalone TCP listener, separate from the admin HTTP API, that agents
//! dial to enroll and then exchange `Frame`s over for the life of the
//! session.
//!
//! Grounded in `sblanchard-SerialAgent`'s `node-sdk` test harness
//! (`protocol_loop.rs`'s `start_mini_gateway`): a bare `TcpListener` accept
//! loop handing each connection to `tokio_tungstenite::accept_hdr_async`,
//! rather than retrofitting hyper's `Upgrade` machinery into the admin
//! router — the channel never needs to share a port with `http::route`.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_tungstenite::{
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        Message,
    },
    WebSocketStream,
};

use wirety_core::{compiler::PolicyBundle, id::PeerId, model::AgentSession};

use crate::{
    channel::{DistributionChannel, Transport},
    enrollment::Enrollment,
    error::ServerError,
    wire::{CaptivePortalContext, Close, CloseReason, DnsPeerRecord, Frame, PolicyPush},
};

/// What a `Session::push_policy`/`close` call actually hands the writer
/// task, once it crosses from the synchronous `Transport` trait into the
/// async world the real socket lives in.
enum Outgoing {
    PolicyPush(PolicyBundle, String),
    Close(CloseReason, Option<String>),
}

/// Bridges `channel::Transport` (synchronous, so `Session` stays testable
/// without a real socket) to a connection's writer task:
/// `UnboundedSender::send` is itself synchronous and never blocks, so the
/// trait methods just hand the frame off and return.
struct WsTransport {
    sender: mpsc::UnboundedSender<Outgoing>,
}

impl Transport for WsTransport {
    fn send_policy_push(&self, bundle: &PolicyBundle, bundle_id: &str) {
        let _ = self.sender.send(Outgoing::PolicyPush(bundle.clone(), bundle_id.to_string()));
    }

    fn send_close(&self, reason: CloseReason, detail: Option<String>) {
        let _ = self.sender.send(Outgoing::Close(reason, detail));
    }
}

/// Runs the accept loop until the process is killed; one task per
/// connection, living for the duration of that agent's session.
pub async fn serve(listen_addr: SocketAddr, enrollment: Arc<Enrollment>, channel: Arc<DistributionChannel>) -> Result<(), ServerError> {
    let listener = TcpListener::bind(listen_addr).await?;
    log::info!("distribution channel listening on {listen_addr}");

    loop {
        let (stream, source_addr) = listener.accept().await?;
        let enrollment = enrollment.clone();
        let channel = channel.clone();
        tokio::task::spawn(async move {
            if let Err(e) = handle_connection(stream, source_addr, enrollment, channel).await {
                log::warn!("channel connection from {source_addr} failed: {e}");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    source_addr: SocketAddr,
    enrollment: Arc<Enrollment>,
    channel: Arc<DistributionChannel>,
) -> Result<(), ServerError> {
    let handshake: Arc<Mutex<Option<(String, String)>>> = Arc::new(Mutex::new(None));
    let captured = handshake.clone();
    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let query = req.uri().query().unwrap_or("").to_string();
        *captured.lock().expect("handshake capture mutex poisoned") = Some((query, device_fingerprint(req)));
        Ok(resp)
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(|e| ServerError::InvalidQuery(format!("websocket handshake failed: {e}")))?;

    let (query, device_fingerprint) = handshake
        .lock()
        .expect("handshake capture mutex poisoned")
        .clone()
        .ok_or_else(|| ServerError::InvalidQuery("handshake callback never ran".into()))?;
    let token = token_from_query(&query).ok_or(ServerError::Unauthorized)?;

    let (sink, stream) = ws.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let transport = Arc::new(WsTransport { sender: tx });

    let mut session = enrollment.enroll(&token, source_addr, &device_fingerprint, transport)?;
    let peer_id = session.peer_id.clone();
    log::info!("peer {peer_id} enrolled from {source_addr}");

    let writer = tokio::task::spawn(run_writer(sink, rx));
    let result = run_reader(stream, &channel, &enrollment, &peer_id, &mut session).await;

    let _ = writer.await;
    channel.close(&peer_id, "channel connection closed");
    result
}

async fn run_writer(mut sink: SplitSink<WebSocketStream<TcpStream>, Message>, mut rx: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(outgoing) = rx.recv().await {
        let frame = match outgoing {
            Outgoing::PolicyPush(bundle, bundle_id) => Frame::PolicyPush(bundle_to_push(&bundle, &bundle_id)),
            Outgoing::Close(reason, detail) => Frame::Close(Close { reason, detail }),
        };
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                log::error!("failed to encode outgoing frame: {e}");
                continue;
            },
        };
        if sink.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Handles the agent's half of the conversation: heartbeats update the
/// session's liveness, the first `status_ack` acknowledges the enrollment
/// bundle (§4.7), everything else is either informational or not yet
/// acted on.
async fn run_reader(
    mut stream: SplitStream<WebSocketStream<TcpStream>>,
    channel: &Arc<DistributionChannel>,
    enrollment: &Arc<Enrollment>,
    peer_id: &PeerId,
    session: &mut AgentSession,
) -> Result<(), ServerError> {
    let mut acknowledged = false;

    while let Some(message) = stream.next().await {
        let message = message.map_err(|e| ServerError::InvalidQuery(format!("channel read failed: {e}")))?;
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let frame: Frame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("malformed frame from {peer_id}: {e}");
                continue;
            },
        };

        match frame {
            Frame::Heartbeat(_) => {
                if let Some(session) = channel.get(peer_id) {
                    session.record_heartbeat();
                }
            },
            Frame::StatusAck(ack) => {
                log::debug!("peer {peer_id} acked bundle {} ok={}", ack.bundle_id, ack.ok);
                if !acknowledged {
                    acknowledged = true;
                    *session = enrollment.acknowledge(session.clone())?;
                }
            },
            Frame::EndpointReport(_) | Frame::PolicyPush(_) | Frame::WhitelistUpdate(_) | Frame::Close(_) => {},
        }
    }

    Ok(())
}

fn device_fingerprint(req: &Request) -> String {
    req.headers()
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string()
}

fn token_from_query(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "token").then(|| value.to_string())
    })
}

/// The inverse of `wirety-agent-core::reconcile::dns_zone_from_peers`:
/// groups the compiler's flat `DnsZone` records back into one
/// `DnsPeerRecord` per hostname, pairing up a peer's A and AAAA entries.
fn bundle_to_push(bundle: &PolicyBundle, bundle_id: &str) -> PolicyPush {
    use std::collections::BTreeMap;

    let mut by_name: BTreeMap<String, DnsPeerRecord> = BTreeMap::new();
    for record in &bundle.dns_zone.records {
        let entry = by_name.entry(record.name.clone()).or_insert_with(|| DnsPeerRecord {
            name: record.name.clone(),
            ipv4: None,
            ipv6: None,
        });
        match record.address {
            std::net::IpAddr::V4(v4) => entry.ipv4 = Some(v4),
            std::net::IpAddr::V6(v6) => entry.ipv6 = Some(v6),
        }
    }

    PolicyPush {
        bundle_id: bundle_id.to_string(),
        wg_config: bundle.wg_config.clone(),
        iptables_rules: bundle.iptables_rules.clone(),
        ip6tables_rules: bundle.ip6tables_rules.clone(),
        dns_peers: by_name.into_values().collect(),
        upstream_dns: Vec::new(),
        captive_portal: CaptivePortalContext {
            whitelist: Vec::new(),
            non_agent_peers: Vec::new(),
            allowed_domains: bundle.allowed_domains.clone(),
            portal_token: String::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_from_query_finds_token_among_other_params() {
        assert_eq!(token_from_query("a=1&token=abc123&b=2"), Some("abc123".to_string()));
        assert_eq!(token_from_query("a=1"), None);
        assert_eq!(token_from_query(""), None);
    }

    #[test]
    fn bundle_to_push_pairs_v4_and_v6_records_under_one_host() {
        use wirety_core::compiler::{DnsRecord, DnsZone};

        let bundle = PolicyBundle {
            dns_zone: DnsZone {
                records: vec![
                    DnsRecord { name: "alice.net.wirety".into(), address: "10.0.0.2".parse().unwrap() },
                    DnsRecord { name: "alice.net.wirety".into(), address: "fd00::2".parse().unwrap() },
                ],
            },
            ..Default::default()
        };

        let push = bundle_to_push(&bundle, "bundle_1");
        assert_eq!(push.dns_peers.len(), 1);
        assert_eq!(push.dns_peers[0].name, "alice.net.wirety");
        assert_eq!(push.dns_peers[0].ipv4, Some("10.0.0.2".parse().unwrap()));
        assert_eq!(push.dns_peers[0].ipv6, Some("fd00::2".parse().unwrap()));
    }
}
