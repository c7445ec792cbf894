//! The distribution-channel wire protocol (§6): one JSON object per frame.
//! Shared between the server's channel and the agent's channel client —
//! kept in `wirety-core` so neither side depends on the other to decode
//! the same frames.

use serde::{Deserialize, Serialize};

use crate::model::Endpoint;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsPeerRecord {
    pub name: String,
    pub ipv4: Option<std::net::Ipv4Addr>,
    pub ipv6: Option<std::net::Ipv6Addr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptivePortalContext {
    pub whitelist: Vec<std::net::IpAddr>,
    pub non_agent_peers: Vec<std::net::IpAddr>,
    pub allowed_domains: Vec<String>,
    pub portal_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyPush {
    pub bundle_id: String,
    pub wg_config: String,
    pub iptables_rules: Vec<String>,
    pub ip6tables_rules: Vec<String>,
    pub dns_peers: Vec<DnsPeerRecord>,
    pub upstream_dns: Vec<std::net::IpAddr>,
    pub captive_portal: CaptivePortalContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelStatus {
    pub wg: bool,
    pub firewall: bool,
    pub dns: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub session_id: String,
    pub timestamp: i64,
    pub reported_endpoint: Option<Endpoint>,
    pub kernel_status: KernelStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointReport {
    pub peer_id: String,
    pub endpoint: Option<Endpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusAck {
    pub bundle_id: String,
    pub ok: bool,
    pub per_subsystem: KernelStatus,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WhitelistAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistUpdate {
    pub peer_ip: std::net::IpAddr,
    pub action: WhitelistAction,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Superseded,
    Stale,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Close {
    pub reason: CloseReason,
    pub detail: Option<String>,
}

/// One frame, newline-delimited JSON on the wire (§6: "any equivalent
/// self-describing envelope is acceptable" — this is the one we picked).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    PolicyPush(PolicyPush),
    Heartbeat(Heartbeat),
    EndpointReport(EndpointReport),
    StatusAck(StatusAck),
    WhitelistUpdate(WhitelistUpdate),
    Close(Close),
}
