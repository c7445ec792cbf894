//! The policy compiler (C4): a pure function from a repository snapshot to
//! a per-peer policy bundle (WireGuard config, firewall rules, DNS zone).
//!
//! Grounded in the shape of `shared::wg`'s `PeerInfoExt::diff` (declarative
//! config in, ordered mutations out) and `shared::interface_config`'s
//! managed-file marker convention, but the compiler itself never touches
//! the kernel — it only emits text and structured rule lists for the agent
//! to apply.

use std::{
    collections::BTreeSet,
    fmt::Write as _,
    net::IpAddr,
};

use ipnet::IpNet;

use crate::{
    error::{CircularRoutingDetail, CompileError, ModelError},
    model::{
        DnsMapping, Group, Network, Peer, Policy, PolicyRule, PolicyTarget, Route, RuleAction,
    },
};

/// First line of every managed WireGuard config file (§6): agents refuse to
/// overwrite a file lacking this exact marker.
pub const WG_CONFIG_MARKER: &str = "# Managed by wirety. Do not edit by hand.";

/// The dedicated filter chain jump rules are written into (§4.2b).
pub const JUMP_CHAIN: &str = "WIRETY_JUMP";
pub const CAPTIVE_NAT_CHAIN: &str = "WIRETY_CAPTIVE_NAT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub address: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DnsZone {
    pub records: Vec<DnsRecord>,
}

/// Everything the agent needs to reconcile one peer's kernel state, per §4.5.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PolicyBundle {
    pub wg_config: String,
    pub iptables_rules: Vec<String>,
    pub ip6tables_rules: Vec<String>,
    pub dns_zone: DnsZone,
    pub allowed_domains: Vec<String>,
}

/// Input snapshot the compiler closes over. Constructing one is the
/// caller's job (typically `wirety-server`'s repositories); the compiler
/// itself never mutates or fetches.
pub struct Snapshot<'a> {
    pub network: &'a Network,
    pub peers: &'a [Peer],
    pub groups: &'a [Group],
    pub policies: &'a [Policy],
    pub routes: &'a [Route],
    pub dns_mappings: &'a [DnsMapping],
    pub preshared_key: &'a dyn Fn(&Peer, &Peer) -> Option<String>,
}

impl<'a> Snapshot<'a> {
    fn groups_of(&self, peer_id: &crate::id::PeerId) -> Vec<&Group> {
        self.groups.iter().filter(|g| g.peer_ids.contains(peer_id)).collect()
    }

    fn routes_jumping_through(&self, jump_peer_id: &crate::id::PeerId) -> Vec<&Route> {
        self.routes.iter().filter(|r| &r.jump_peer_id == jump_peer_id).collect()
    }

    fn peer(&self, id: &crate::id::PeerId) -> Option<&Peer> {
        self.peers.iter().find(|p| &p.id == id)
    }
}

/// Validates I2/I3 against the snapshot. The network service calls this on
/// every mutation; the compiler calls it again before emitting, so a bundle
/// is never produced for an invalid model.
pub fn validate(snapshot: &Snapshot) -> Result<(), ModelError> {
    for group in snapshot.groups {
        for route_id in &group.route_ids {
            let Some(route) = snapshot.routes.iter().find(|r| &r.id == route_id) else {
                continue;
            };
            if group.peer_ids.contains(&route.jump_peer_id) {
                return Err(ModelError::CircularRouting(CircularRoutingDetail {
                    peer_id: route.jump_peer_id.to_string(),
                    group_id: group.id.to_string(),
                    route_ids: vec![route.id.to_string()],
                }));
            }
        }
    }

    for mapping in snapshot.dns_mappings {
        let Some(route) = snapshot.routes.iter().find(|r| r.id == mapping.route_id) else {
            return Err(ModelError::NotFound("route"));
        };
        if !route.destination_cidr.contains(&mapping.ip_address) {
            return Err(ModelError::DnsMappingOutsideRoute {
                ip: mapping.ip_address.to_string(),
                cidr: route.destination_cidr.to_string(),
            });
        }
    }

    Ok(())
}

/// AllowedIPs entries deduplicated by CIDR identity, narrower host entries
/// (prefix length closer to the address width) preceding broader ones, per
/// §4.2's tie-break rule.
fn push_allowed_ip(list: &mut Vec<IpNet>, cidr: IpNet) {
    if !list.contains(&cidr) {
        list.push(cidr);
    }
}

fn sort_allowed_ips(list: &mut [IpNet]) {
    list.sort_by(|a, b| b.prefix_len().cmp(&a.prefix_len()).then(a.cmp(b)));
}

/// §4.2(a): `AllowedIPs` that `other` should carry in `target`'s peer
/// section, from `target`'s point of view.
fn allowed_ips_for(snapshot: &Snapshot, target: &Peer, other: &Peer) -> Vec<IpNet> {
    let mut ips = Vec::new();

    if other.is_jump {
        ips.push(snapshot.network.ipv4_cidr);
        if let Some(v6) = snapshot.network.ipv6_cidr {
            ips.push(v6);
        }
        let target_groups: BTreeSet<_> = snapshot
            .groups_of(&target.id)
            .iter()
            .map(|g| g.id.clone())
            .collect();
        for route in snapshot.routes_jumping_through(&other.id) {
            let attached = snapshot
                .groups
                .iter()
                .any(|g| g.route_ids.contains(&route.id) && target_groups.contains(&g.id));
            if attached {
                push_allowed_ip(&mut ips, route.destination_cidr);
            }
        }
        for extra in &other.additional_allowed_ips {
            push_allowed_ip(&mut ips, *extra);
        }
    } else if let Some(addr) = other.primary_ipv4() {
        ips.push(IpNet::new(addr, 32).expect("/32 is always valid for an IPv4 address"));
        if let Some(v6) = other.ipv6_address {
            ips.push(IpNet::new(IpAddr::V6(v6), 128).expect("/128 is always valid for an IPv6 address"));
        }
    }

    sort_allowed_ips(&mut ips);
    ips
}

/// Two peers are allowed to talk when they share at least one group, or
/// when either one is a jump peer that the other's routes/groups reach.
/// Jump peers are reachable by every peer in the network so the overlay
/// has a gateway of last resort; regular peers are reachable only through
/// shared-group membership.
fn permitted(snapshot: &Snapshot, target: &Peer, other: &Peer) -> bool {
    if target.id == other.id {
        return false;
    }
    if target.is_jump || other.is_jump {
        return true;
    }
    let target_groups: BTreeSet<_> = snapshot.groups_of(&target.id).iter().map(|g| &g.id).collect();
    snapshot
        .groups_of(&other.id)
        .iter()
        .any(|g| target_groups.contains(&g.id))
}

fn render_wg_config(snapshot: &Snapshot, target: &Peer) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{WG_CONFIG_MARKER}");
    let _ = writeln!(out, "[Interface]");
    if let Some(private_key) = &target.private_key {
        let _ = writeln!(out, "PrivateKey = {private_key}");
    }
    let mut addresses = Vec::new();
    if let Some(v4) = target.ipv4_address {
        addresses.push(format!("{v4}/32"));
    }
    if let Some(v6) = target.ipv6_address {
        addresses.push(format!("{v6}/128"));
    }
    let _ = writeln!(out, "Address = {}", addresses.join(", "));
    if let Some(port) = target.listen_port {
        let _ = writeln!(out, "ListenPort = {port}");
    }

    let dns_via = if target.is_jump {
        target.primary_ipv4()
    } else {
        snapshot
            .peers
            .iter()
            .find(|p| p.is_jump)
            .and_then(Peer::primary_ipv4)
    };
    if let Some(dns_via) = dns_via {
        let _ = writeln!(out, "DNS = {dns_via}");
    }

    for other in snapshot.peers {
        if !permitted(snapshot, target, other) {
            continue;
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "[Peer]");
        let _ = writeln!(out, "PublicKey = {}", other.public_key);
        if let Some(psk) = (snapshot.preshared_key)(target, other) {
            let _ = writeln!(out, "PresharedKey = {psk}");
        }
        let allowed = allowed_ips_for(snapshot, target, other);
        let allowed_str = allowed.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
        let _ = writeln!(out, "AllowedIPs = {allowed_str}");

        let stable_endpoint = other.endpoint.is_some();
        let jump_to_nated_regular = target.is_jump && !other.is_jump && other.endpoint.is_none();
        if let Some(endpoint) = &other.endpoint {
            let _ = writeln!(out, "Endpoint = {endpoint}");
        }
        if stable_endpoint || jump_to_nated_regular {
            let _ = writeln!(out, "PersistentKeepalive = 25");
        }
    }

    out
}

/// §4.2(b): the jump chain for peer `jump`. Default-deny terminates the
/// chain; a rule-existence probe before every insert is the agent's job
/// (the compiler only decides rule *content* and *order*).
fn render_firewall(snapshot: &Snapshot, jump: &Peer) -> (Vec<String>, Vec<String>) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();

    v4.push(format!("-N {JUMP_CHAIN}"));
    v4.push(format!("-F {JUMP_CHAIN}"));

    let routed_groups: Vec<&Group> = snapshot
        .groups
        .iter()
        .filter(|g| {
            g.route_ids
                .iter()
                .filter_map(|r| snapshot.routes.iter().find(|route| &route.id == r))
                .any(|r| r.jump_peer_id == jump.id)
        })
        .collect();

    let mut ordered_policy_ids = Vec::new();
    let mut sorted_groups = routed_groups.clone();
    sorted_groups.sort_by_key(|g| g.priority);
    for group in sorted_groups {
        for policy_id in &group.policy_ids {
            if !ordered_policy_ids.contains(policy_id) {
                ordered_policy_ids.push(policy_id.clone());
            }
        }
    }

    for policy_id in &ordered_policy_ids {
        let Some(policy) = snapshot.policies.iter().find(|p| &p.id == policy_id) else {
            continue;
        };
        for rule in &policy.rules {
            if let Some(line) = render_rule(snapshot, rule) {
                match rule_ip_version(snapshot, rule) {
                    IpVersion::V4 => v4.push(line),
                    IpVersion::V6 => v6.push(line),
                }
            }
        }
    }

    v4.push(format!("-A {JUMP_CHAIN} -p udp --dport 53 -j ACCEPT"));
    v4.push(format!(
        "-A {JUMP_CHAIN} -p tcp --dport 80 -j WIRETY_CAPTIVE_HTTP"
    ));
    v4.push(format!(
        "-A {JUMP_CHAIN} -p tcp --dport 443 -j WIRETY_CAPTIVE_TLS"
    ));
    v4.push(format!("-A {JUMP_CHAIN} -j DROP"));

    v4.push(format!("-N {CAPTIVE_NAT_CHAIN}"));
    v4.push(format!("-F {CAPTIVE_NAT_CHAIN}"));
    v4.push(format!(
        "-A {CAPTIVE_NAT_CHAIN} -p tcp --dport 80 -j REDIRECT --to-port 8080"
    ));
    v4.push(format!(
        "-A {CAPTIVE_NAT_CHAIN} -p tcp --dport 443 -j REDIRECT --to-port 8443"
    ));

    (v4, v6)
}

enum IpVersion {
    V4,
    V6,
}

fn rule_ip_version(snapshot: &Snapshot, rule: &PolicyRule) -> IpVersion {
    match &rule.target {
        PolicyTarget::Cidr(cidr) => match cidr {
            IpNet::V4(_) => IpVersion::V4,
            IpNet::V6(_) => IpVersion::V6,
        },
        PolicyTarget::Peer(id) => match snapshot.peer(id).and_then(|p| p.ipv6_address).is_some()
            && snapshot.peer(id).and_then(Peer::primary_ipv4).is_none()
        {
            true => IpVersion::V6,
            false => IpVersion::V4,
        },
        PolicyTarget::Group(_) => IpVersion::V4,
    }
}

fn render_rule(snapshot: &Snapshot, rule: &PolicyRule) -> Option<String> {
    let dir_flag = match rule.direction {
        crate::model::Direction::Input => "-i",
        crate::model::Direction::Output => "-o",
    };
    let verdict = match rule.action {
        RuleAction::Allow => "ACCEPT",
        RuleAction::Deny => "DROP",
    };

    let target_clause = match &rule.target {
        PolicyTarget::Cidr(cidr) => format!("-s {cidr}"),
        PolicyTarget::Peer(id) => {
            let peer = snapshot.peer(id)?;
            let addr = peer.primary_ipv4()?;
            format!("-s {addr}/32")
        },
        PolicyTarget::Group(id) => {
            let group = snapshot.groups.iter().find(|g| &g.id == id)?;
            let addrs: Vec<String> = group
                .peer_ids
                .iter()
                .filter_map(|pid| snapshot.peer(pid))
                .filter_map(Peer::primary_ipv4)
                .map(|a| format!("{a}/32"))
                .collect();
            if addrs.is_empty() {
                return None;
            }
            format!("-s {}", addrs.join(","))
        },
    };

    let mut line = format!("-A {JUMP_CHAIN} {dir_flag} %IFACE% {target_clause}");
    if let Some(protocol) = rule.protocol {
        let proto = match protocol {
            crate::model::Protocol::Tcp => "tcp",
            crate::model::Protocol::Udp => "udp",
            crate::model::Protocol::Icmp => "icmp",
        };
        let _ = write!(line, " -p {proto}");
        if let Some(port) = rule.port {
            let _ = write!(line, " --dport {port}");
        }
    }
    let _ = write!(line, " -j {verdict}");
    Some(line)
}

/// §4.2(c): A records for every addressed peer plus every DNS mapping under
/// a route attached to `jump`.
fn render_dns_zone(snapshot: &Snapshot, jump: &Peer) -> DnsZone {
    let mut records = Vec::new();

    for peer in snapshot.peers {
        if let Some(addr) = peer.primary_ipv4() {
            records.push(DnsRecord {
                name: format!("{}.{}", peer.name, snapshot.network.domain_suffix),
                address: addr,
            });
        }
        if let Some(v6) = peer.ipv6_address {
            records.push(DnsRecord {
                name: format!("{}.{}", peer.name, snapshot.network.domain_suffix),
                address: IpAddr::V6(v6),
            });
        }
    }

    for route in snapshot.routes_jumping_through(&jump.id) {
        for mapping in snapshot.dns_mappings.iter().filter(|m| m.route_id == route.id) {
            records.push(DnsRecord {
                name: format!("{}.{}", mapping.name, route.domain_suffix),
                address: mapping.ip_address,
            });
        }
    }

    DnsZone { records }
}

/// Compiles the full bundle for `target`. Refuses (returns `CompileError`)
/// if the snapshot violates an invariant the compiler can check (I2/I3);
/// everything else is total.
pub fn compile(snapshot: &Snapshot, target: &Peer) -> Result<PolicyBundle, CompileError> {
    validate(snapshot)?;

    let wg_config = render_wg_config(snapshot, target);
    let (iptables_rules, ip6tables_rules) = if target.is_jump {
        render_firewall(snapshot, target)
    } else {
        (Vec::new(), Vec::new())
    };
    let dns_zone = if target.is_jump {
        render_dns_zone(snapshot, target)
    } else {
        DnsZone::default()
    };
    let allowed_domains = vec![snapshot.network.domain_suffix.clone()];

    Ok(PolicyBundle {
        wg_config,
        iptables_rules,
        ip6tables_rules,
        dns_zone,
        allowed_domains,
    })
}

/// §4.3: the recompile scope for a mutation touching `peer_id` — the peer
/// itself, co-members of its groups, and every jump peer it routes through.
pub fn recompile_scope(snapshot: &Snapshot, peer_id: &crate::id::PeerId) -> BTreeSet<crate::id::PeerId> {
    let mut scope = BTreeSet::new();
    scope.insert(peer_id.clone());

    for group in snapshot.groups_of(peer_id) {
        for member in &group.peer_ids {
            scope.insert(member.clone());
        }
        for route_id in &group.route_ids {
            if let Some(route) = snapshot.routes.iter().find(|r| &r.id == route_id) {
                scope.insert(route.jump_peer_id.clone());
            }
        }
    }

    for peer in snapshot.peers {
        if peer.is_jump {
            scope.insert(peer.id.clone());
        }
    }

    scope
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        id::{GroupId, NetworkId, PeerId, RouteId},
        model::{Hostname, IpStackMode},
    };
    use std::str::FromStr;

    fn network() -> Network {
        Network {
            id: NetworkId::from("net_test"),
            name: "test".into(),
            ipv4_cidr: "10.10.0.0/16".parse().unwrap(),
            ipv6_cidr: None,
            ip_stack_mode: IpStackMode::Ipv4,
            domain_suffix: "internal".into(),
            default_group_ids: vec![],
            dns_upstreams: vec![],
        }
    }

    fn peer(id: &str, addr: &str, is_jump: bool) -> Peer {
        Peer {
            id: PeerId::from(id),
            network_id: NetworkId::from("net_test"),
            name: Hostname::from_str(id).unwrap(),
            public_key: format!("pub_{id}"),
            private_key: Some(format!("priv_{id}")),
            ipv4_address: Some(addr.parse().unwrap()),
            ipv6_address: None,
            endpoint: None,
            listen_port: if is_jump { Some(51820) } else { None },
            is_jump,
            uses_agent: true,
            additional_allowed_ips: vec![],
            owner_user_id: None,
            enrollment_token: format!("token_{id}"),
        }
    }

    #[test]
    fn jump_peer_allowed_ips_cover_whole_network() {
        let net = network();
        let jump = peer("jump", "10.10.0.1", true);
        let regular = peer("reg", "10.10.0.2", false);
        let peers = vec![jump.clone(), regular.clone()];
        let snapshot = Snapshot {
            network: &net,
            peers: &peers,
            groups: &[],
            policies: &[],
            routes: &[],
            dns_mappings: &[],
            preshared_key: &|_, _| Some("psk".to_string()),
        };

        let ips = allowed_ips_for(&snapshot, &regular, &jump);
        assert!(ips.contains(&net.ipv4_cidr));
    }

    #[test]
    fn jump_peers_own_entries_for_regular_peers_are_host_routes() {
        // S1: from jump peer J's own point of view, entries for regular
        // peers A and B are each /32, not the whole network CIDR — the
        // whole-network AllowedIPs only ever describes what *other* peers
        // see when J is the entry, not what J sees of them.
        let net = network();
        let jump = peer("jump", "10.10.0.1", true);
        let a = peer("a", "10.10.0.2", false);
        let b = peer("b", "10.10.0.3", false);
        let peers = vec![jump.clone(), a.clone(), b.clone()];
        let snapshot = Snapshot {
            network: &net,
            peers: &peers,
            groups: &[],
            policies: &[],
            routes: &[],
            dns_mappings: &[],
            preshared_key: &|_, _| Some("psk".to_string()),
        };

        assert_eq!(allowed_ips_for(&snapshot, &jump, &a), vec!["10.10.0.2/32".parse::<IpNet>().unwrap()]);
        assert_eq!(allowed_ips_for(&snapshot, &jump, &b), vec!["10.10.0.3/32".parse::<IpNet>().unwrap()]);
    }

    #[test]
    fn regular_peers_see_only_host_routes_for_each_other() {
        let net = network();
        let a = peer("a", "10.10.0.2", false);
        let b = peer("b", "10.10.0.3", false);
        let peers = vec![a.clone(), b.clone()];
        let group = Group {
            id: GroupId::from("grp_shared"),
            network_id: net.id.clone(),
            name: "shared".into(),
            description: String::new(),
            peer_ids: [a.id.clone(), b.id.clone()].into_iter().collect(),
            policy_ids: vec![],
            route_ids: Default::default(),
            priority: 0,
        };
        let groups = vec![group];
        let snapshot = Snapshot {
            network: &net,
            peers: &peers,
            groups: &groups,
            policies: &[],
            routes: &[],
            dns_mappings: &[],
            preshared_key: &|_, _| Some("psk".to_string()),
        };

        let ips = allowed_ips_for(&snapshot, &a, &b);
        assert_eq!(ips, vec!["10.10.0.3/32".parse::<IpNet>().unwrap()]);
    }

    #[test]
    fn circular_routing_is_rejected() {
        let net = network();
        let jump = peer("jump", "10.10.0.1", true);
        let route = Route {
            id: RouteId::from("route_1"),
            network_id: net.id.clone(),
            name: "r1".into(),
            destination_cidr: "192.168.1.0/24".parse().unwrap(),
            jump_peer_id: jump.id.clone(),
            domain_suffix: "internal".into(),
        };
        let group = Group {
            id: GroupId::from("grp_bad"),
            network_id: net.id.clone(),
            name: "bad".into(),
            description: String::new(),
            peer_ids: [jump.id.clone()].into_iter().collect(),
            policy_ids: vec![],
            route_ids: [route.id.clone()].into_iter().collect(),
            priority: 0,
        };
        let peers = vec![jump];
        let groups = vec![group];
        let routes = vec![route];
        let snapshot = Snapshot {
            network: &net,
            peers: &peers,
            groups: &groups,
            policies: &[],
            routes: &routes,
            dns_mappings: &[],
            preshared_key: &|_, _| None,
        };

        assert!(matches!(validate(&snapshot), Err(ModelError::CircularRouting(_))));
    }

    #[test]
    fn dns_mapping_outside_route_is_rejected() {
        let net = network();
        let jump = peer("jump", "10.10.0.1", true);
        let route = Route {
            id: RouteId::from("route_1"),
            network_id: net.id.clone(),
            name: "r1".into(),
            destination_cidr: "192.168.1.0/24".parse().unwrap(),
            jump_peer_id: jump.id.clone(),
            domain_suffix: "internal".into(),
        };
        let mapping = DnsMapping {
            id: crate::id::DnsMappingId::from("dns_1"),
            route_id: route.id.clone(),
            name: "printer".into(),
            ip_address: "10.0.0.5".parse().unwrap(),
        };
        let peers = vec![jump];
        let routes = vec![route];
        let mappings = vec![mapping];
        let snapshot = Snapshot {
            network: &net,
            peers: &peers,
            groups: &[],
            policies: &[],
            routes: &routes,
            dns_mappings: &mappings,
            preshared_key: &|_, _| None,
        };

        assert!(matches!(
            validate(&snapshot),
            Err(ModelError::DnsMappingOutsideRoute { .. })
        ));
    }

    #[test]
    fn wg_config_carries_managed_marker() {
        let net = network();
        let jump = peer("jump", "10.10.0.1", true);
        let peers = vec![jump.clone()];
        let snapshot = Snapshot {
            network: &net,
            peers: &peers,
            groups: &[],
            policies: &[],
            routes: &[],
            dns_mappings: &[],
            preshared_key: &|_, _| None,
        };
        let bundle = compile(&snapshot, &jump).unwrap();
        assert!(bundle.wg_config.starts_with(WG_CONFIG_MARKER));
    }
}
