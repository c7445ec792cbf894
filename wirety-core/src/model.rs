//! The declarative model (C1): networks, peers, groups, policies, routes,
//! DNS mappings, peer connections, agent sessions and security incidents.
//!
//! These types carry no behavior beyond basic validation helpers; §3's
//! invariants are enforced by the network service (C5) and the policy
//! compiler (C4) refuses to compile a model that violates them.

use std::{
    collections::BTreeSet,
    fmt::{self, Display, Formatter},
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    ops::{Deref, DerefMut},
    str::FromStr,
    time::{Duration, SystemTime},
};

use ipnet::IpNet;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::id::{
    AgentSessionId, DnsMappingId, GroupId, NetworkId, PeerId, PolicyId, PolicyRuleId, RouteId,
    SecurityIncidentId,
};

/// Hostname-shaped name, reused for peer and group names wherever the spec
/// calls for a DNS label.
static HOSTNAME_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([a-z0-9]-?)*[a-z0-9]$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hostname(String);

impl Hostname {
    pub fn is_valid(name: &str) -> bool {
        name.len() < 64 && HOSTNAME_REGEX.is_match(name)
    }
}

impl FromStr for Hostname {
    type Err = &'static str;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        if Self::is_valid(name) {
            Ok(Self(name.to_string()))
        } else {
            Err("invalid hostname (must match hostname(7), lowercase alphanumeric with dashes)")
        }
    }
}

impl Deref for Hostname {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for Hostname {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A `host:port` endpoint; host may be an IP address or domain name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn host_port(&self) -> &str {
        &self.0
    }
}

impl FromStr for Endpoint {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Endpoint(s.to_string()))
            },
            _ => Err("couldn't parse in form of 'host:port'"),
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A relative duration string like `30d`, `7w`, `2h`, `60m`, `1000s`,
/// used for invite and captive-portal token expiry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timestring {
    raw: String,
    seconds: u64,
}

impl Timestring {
    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.seconds)
    }
}

impl Display for Timestring {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Timestring {
    type Err = &'static str;

    fn from_str(timestring: &str) -> Result<Self, Self::Err> {
        if timestring.len() < 2 {
            return Err("timestring isn't long enough");
        }
        let (n, suffix) = timestring.split_at(timestring.len() - 1);
        let n: u64 = n
            .parse()
            .map_err(|_| "invalid timestring (a number followed by s/m/h/d/w)")?;
        let multiplier = match suffix {
            "s" => 1,
            "m" => 60,
            "h" => 60 * 60,
            "d" => 60 * 60 * 24,
            "w" => 60 * 60 * 24 * 7,
            _ => return Err("invalid timestring suffix (must be one of s, m, h, d, w)"),
        };
        Ok(Self {
            raw: timestring.to_string(),
            seconds: n * multiplier,
        })
    }
}

/// §3: "anticipated extension: ipv4_cidr, ipv6_cidr, ip_stack_mode".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IpStackMode {
    #[default]
    Ipv4,
    Ipv6,
    Dual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    #[serde(default)]
    pub id: NetworkId,
    pub name: String,
    pub ipv4_cidr: IpNet,
    pub ipv6_cidr: Option<IpNet>,
    #[serde(default)]
    pub ip_stack_mode: IpStackMode,
    pub domain_suffix: String,
    #[serde(default)]
    pub default_group_ids: Vec<GroupId>,
    #[serde(default)]
    pub dns_upstreams: Vec<IpAddr>,
}

impl Network {
    pub fn default_domain_suffix() -> String {
        "internal".to_string()
    }

    /// Stack variant a peer address must respect per I1.
    pub fn wants_ipv4(&self) -> bool {
        matches!(self.ip_stack_mode, IpStackMode::Ipv4 | IpStackMode::Dual)
    }

    pub fn wants_ipv6(&self) -> bool {
        matches!(self.ip_stack_mode, IpStackMode::Ipv6 | IpStackMode::Dual)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    #[serde(default)]
    pub id: PeerId,
    pub network_id: NetworkId,
    pub name: Hostname,
    pub public_key: String,
    /// Present only if the server generated the key-pair.
    pub private_key: Option<String>,
    pub ipv4_address: Option<Ipv4Addr>,
    pub ipv6_address: Option<Ipv6Addr>,
    pub endpoint: Option<Endpoint>,
    pub listen_port: Option<u16>,
    pub is_jump: bool,
    pub uses_agent: bool,
    #[serde(default)]
    pub additional_allowed_ips: Vec<IpNet>,
    /// Empty/`None` ⇒ administrator-owned.
    pub owner_user_id: Option<String>,
    pub enrollment_token: String,
}

impl Peer {
    pub fn is_admin_owned(&self) -> bool {
        self.owner_user_id.is_none()
    }

    /// The address used on the wire for the peer's /32 (or /128) AllowedIPs
    /// entry. Dual-stack peers have both; this is the IPv4 one, used by §4.2
    /// wherever the spec's base text talks about "address" without
    /// qualification.
    pub fn primary_ipv4(&self) -> Option<IpAddr> {
        self.ipv4_address.map(IpAddr::V4)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    #[serde(default)]
    pub id: GroupId,
    pub network_id: NetworkId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub peer_ids: BTreeSet<PeerId>,
    /// Ordered: applied in attachment order (§4.2 tie-breaks).
    #[serde(default)]
    pub policy_ids: Vec<PolicyId>,
    #[serde(default)]
    pub route_ids: BTreeSet<RouteId>,
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

/// Design Notes §9: "use a tagged variant for target
/// `{cidr(CIDR), peer(PeerId), group(GroupId)}`".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyTarget {
    Cidr(IpNet),
    Peer(PeerId),
    Group(GroupId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    #[serde(default)]
    pub id: PolicyRuleId,
    pub direction: Direction,
    pub action: RuleAction,
    pub target: PolicyTarget,
    pub protocol: Option<Protocol>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub id: PolicyId,
    pub network_id: NetworkId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Ordered: first matching rule wins (§4.2 tie-breaks).
    pub rules: Vec<PolicyRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    #[serde(default)]
    pub id: RouteId,
    pub network_id: NetworkId,
    pub name: String,
    pub destination_cidr: IpNet,
    pub jump_peer_id: PeerId,
    pub domain_suffix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsMapping {
    #[serde(default)]
    pub id: DnsMappingId,
    pub route_id: RouteId,
    pub name: String,
    pub ip_address: IpAddr,
}

/// §3 (I4): symmetric, at most one preshared key per unordered pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConnection {
    pub peer_a_id: PeerId,
    pub peer_b_id: PeerId,
    pub preshared_key: String,
}

impl PeerConnection {
    /// Builds a connection with its pair normalized so `(a, b)` and `(b, a)`
    /// always produce the same stored row — the symmetry I4 requires.
    pub fn new(peer_a_id: PeerId, peer_b_id: PeerId, preshared_key: String) -> Self {
        if peer_a_id <= peer_b_id {
            Self {
                peer_a_id,
                peer_b_id,
                preshared_key,
            }
        } else {
            Self {
                peer_a_id: peer_b_id,
                peer_b_id: peer_a_id,
                preshared_key,
            }
        }
    }

    pub fn involves(&self, peer_id: &PeerId) -> bool {
        &self.peer_a_id == peer_id || &self.peer_b_id == peer_id
    }

    pub fn other(&self, peer_id: &PeerId) -> Option<&PeerId> {
        if &self.peer_a_id == peer_id {
            Some(&self.peer_b_id)
        } else if &self.peer_b_id == peer_id {
            Some(&self.peer_a_id)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connecting,
    Active,
    Stale,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSession {
    pub id: AgentSessionId,
    pub network_id: NetworkId,
    pub peer_id: PeerId,
    pub session_hash: String,
    pub started_at: SystemTime,
    pub last_heartbeat_at: SystemTime,
    pub reported_endpoint: Option<Endpoint>,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointChange {
    pub peer_id: PeerId,
    pub prior_endpoint: Option<Endpoint>,
    pub new_endpoint: Option<Endpoint>,
    pub changed_at: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    SharedConfig,
    SessionConflict,
    SuspiciousActivity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityIncident {
    pub id: SecurityIncidentId,
    pub kind: IncidentKind,
    pub network_id: NetworkId,
    pub peer_id: PeerId,
    pub detected_at: SystemTime,
    pub resolved: bool,
    pub resolved_at: Option<SystemTime>,
    pub resolved_by: Option<String>,
    pub evidence: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptivePortalToken {
    pub token: String,
    pub network_id: NetworkId,
    pub jump_peer_id: PeerId,
    pub expires_at: SystemTime,
}

/// Mirrors `shared::types::CidrTree`: a read-only view letting the compiler
/// and IPAM walk the ancestor/descendant relationship between CIDRs
/// without owning the storage.
pub struct CidrTree<'a> {
    all: &'a [IpamPrefixView],
    root: &'a IpamPrefixView,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpamPrefixView {
    pub cidr: IpNet,
    pub parent_cidr: Option<IpNet>,
}

impl<'a> CidrTree<'a> {
    pub fn new(all: &'a [IpamPrefixView], root: &'a IpamPrefixView) -> Self {
        Self { all, root }
    }

    pub fn children(&self) -> impl Iterator<Item = &'a IpamPrefixView> {
        let root_cidr = self.root.cidr;
        self.all
            .iter()
            .filter(move |p| p.parent_cidr == Some(root_cidr))
    }

    pub fn deref_cidr(&self) -> IpNet {
        self.root.cidr
    }
}

impl<'a> Deref for CidrTree<'a> {
    type Target = IpamPrefixView;

    fn deref(&self) -> &Self::Target {
        self.root
    }
}

/// Nothing above mutates in place except through explicit setters, so
/// `DerefMut` is only exposed where a caller genuinely owns the value
/// (used by `wirety-server`'s repositories when reading a row into one of
/// these structs before persisting edits back).
pub trait WithId {
    type Id;
    fn id(&self) -> &Self::Id;
}

impl WithId for Peer {
    type Id = PeerId;
    fn id(&self) -> &PeerId {
        &self.id
    }
}

impl WithId for Group {
    type Id = GroupId;
    fn id(&self) -> &GroupId {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_rejects_uppercase_and_underscores() {
        assert!(Hostname::from_str("laptop-1").is_ok());
        assert!(Hostname::from_str("Laptop").is_err());
        assert!(Hostname::from_str("lap_top").is_err());
    }

    #[test]
    fn endpoint_requires_host_and_port() {
        assert!(Endpoint::from_str("198.51.100.10:51820").is_ok());
        assert!(Endpoint::from_str("198.51.100.10").is_err());
    }

    #[test]
    fn timestring_parses_units() {
        assert_eq!(
            Timestring::from_str("30d").unwrap().as_duration(),
            Duration::from_secs(30 * 86400)
        );
        assert_eq!(
            Timestring::from_str("15m").unwrap().as_duration(),
            Duration::from_secs(15 * 60)
        );
        assert!(Timestring::from_str("bogus").is_err());
    }

    #[test]
    fn peer_connection_is_symmetric() {
        let a = PeerId::from("peer_a");
        let b = PeerId::from("peer_b");
        let c1 = PeerConnection::new(a.clone(), b.clone(), "psk".into());
        let c2 = PeerConnection::new(b.clone(), a.clone(), "psk".into());
        assert_eq!(c1, c2);
        assert!(c1.involves(&a));
        assert_eq!(c1.other(&a), Some(&b));
    }
}
