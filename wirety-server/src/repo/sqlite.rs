//! SQLite-backed `Repositories` (one database file per network, same
//! layout convention as the teacher: `ServerConfig::database_path` keys a
//! connection by interface/network name).
//!
//! Scalar columns map onto the obvious SQL types; ordered/nested
//! collections (policy rule lists, group membership sets, IPAM trees) are
//! stored as a single JSON `TEXT` column, the same trick the teacher uses
//! for `peers.endpoint_candidates`.

use std::sync::Mutex;

use ipnet::IpNet;
use rusqlite::{params, Connection, OptionalExtension};

use wirety_core::{
    id::{
        AgentSessionId, DnsMappingId, GroupId, NetworkId, PeerId, PolicyId, PolicyRuleId, RouteId,
        SecurityIncidentId,
    },
    ipam::{IpamPrefix, PrefixTree},
    model::{
        AgentSession, DnsMapping, EndpointChange, Group, IncidentKind, IpStackMode, Network, Peer,
        Policy, Route, SecurityIncident, SessionStatus,
    },
};

use super::{NetworkSnapshot, Repositories};
use crate::error::ServerError;

pub static CREATE_TABLE_SQL: &str = "
    CREATE TABLE IF NOT EXISTS networks (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        ipv4_cidr TEXT NOT NULL,
        ipv6_cidr TEXT,
        ip_stack_mode TEXT NOT NULL,
        domain_suffix TEXT NOT NULL,
        default_group_ids TEXT NOT NULL,
        dns_upstreams TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS peers (
        id TEXT PRIMARY KEY,
        network_id TEXT NOT NULL REFERENCES networks(id),
        name TEXT NOT NULL,
        public_key TEXT NOT NULL,
        private_key TEXT,
        ipv4_address TEXT,
        ipv6_address TEXT,
        endpoint TEXT,
        listen_port INTEGER,
        is_jump INTEGER NOT NULL DEFAULT 0,
        uses_agent INTEGER NOT NULL DEFAULT 1,
        additional_allowed_ips TEXT NOT NULL DEFAULT '[]',
        owner_user_id TEXT,
        enrollment_token TEXT NOT NULL UNIQUE,
        UNIQUE(network_id, ipv4_address),
        UNIQUE(network_id, ipv6_address)
    );
    CREATE TABLE IF NOT EXISTS groups_ (
        id TEXT PRIMARY KEY,
        network_id TEXT NOT NULL REFERENCES networks(id),
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        peer_ids TEXT NOT NULL DEFAULT '[]',
        policy_ids TEXT NOT NULL DEFAULT '[]',
        route_ids TEXT NOT NULL DEFAULT '[]',
        priority INTEGER NOT NULL DEFAULT 0,
        UNIQUE(network_id, name)
    );
    CREATE TABLE IF NOT EXISTS policies (
        id TEXT PRIMARY KEY,
        network_id TEXT NOT NULL REFERENCES networks(id),
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        rules TEXT NOT NULL DEFAULT '[]'
    );
    CREATE TABLE IF NOT EXISTS routes (
        id TEXT PRIMARY KEY,
        network_id TEXT NOT NULL REFERENCES networks(id),
        name TEXT NOT NULL,
        destination_cidr TEXT NOT NULL,
        jump_peer_id TEXT NOT NULL REFERENCES peers(id),
        domain_suffix TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS dns_mappings (
        id TEXT PRIMARY KEY,
        route_id TEXT NOT NULL REFERENCES routes(id),
        name TEXT NOT NULL,
        ip_address TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS peer_connections (
        peer_a_id TEXT NOT NULL,
        peer_b_id TEXT NOT NULL,
        preshared_key TEXT NOT NULL,
        PRIMARY KEY (peer_a_id, peer_b_id)
    );
    CREATE TABLE IF NOT EXISTS agent_sessions (
        id TEXT PRIMARY KEY,
        network_id TEXT NOT NULL,
        peer_id TEXT NOT NULL,
        session_hash TEXT NOT NULL,
        started_at INTEGER NOT NULL,
        last_heartbeat_at INTEGER NOT NULL,
        reported_endpoint TEXT,
        status TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS endpoint_changes (
        peer_id TEXT NOT NULL,
        prior_endpoint TEXT,
        new_endpoint TEXT,
        changed_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS security_incidents (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        network_id TEXT NOT NULL,
        peer_id TEXT NOT NULL,
        detected_at INTEGER NOT NULL,
        resolved INTEGER NOT NULL DEFAULT 0,
        resolved_at INTEGER,
        resolved_by TEXT,
        evidence TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS ipam_prefixes (
        network_id TEXT NOT NULL,
        cidr TEXT NOT NULL,
        parent_cidr TEXT,
        allocated_ips TEXT NOT NULL DEFAULT '[]',
        PRIMARY KEY (network_id, cidr)
    );
";

pub fn auto_migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(CREATE_TABLE_SQL)
}

pub struct SqliteRepositories {
    conn: Mutex<Connection>,
}

impl SqliteRepositories {
    pub fn open_in_memory() -> Result<Self, ServerError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", 1)?;
        auto_migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open(path: &std::path::Path) -> Result<Self, ServerError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", 1)?;
        auto_migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("sqlite connection mutex poisoned")
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).expect("in-memory value is always serializable")
}

fn from_json<T: serde::de::DeserializeOwned>(text: &str) -> T {
    serde_json::from_str(text).expect("stored JSON column is well-formed")
}

fn network_from_row(row: &rusqlite::Row) -> rusqlite::Result<Network> {
    let ipv4_cidr: String = row.get("ipv4_cidr")?;
    let ipv6_cidr: Option<String> = row.get("ipv6_cidr")?;
    let ip_stack_mode: String = row.get("ip_stack_mode")?;
    let default_group_ids: String = row.get("default_group_ids")?;
    let dns_upstreams: String = row.get("dns_upstreams")?;
    Ok(Network {
        id: row.get::<_, String>("id")?.into(),
        name: row.get("name")?,
        ipv4_cidr: ipv4_cidr.parse().expect("stored CIDR is valid"),
        ipv6_cidr: ipv6_cidr.map(|s| s.parse().expect("stored CIDR is valid")),
        ip_stack_mode: match ip_stack_mode.as_str() {
            "ipv6" => IpStackMode::Ipv6,
            "dual" => IpStackMode::Dual,
            _ => IpStackMode::Ipv4,
        },
        domain_suffix: row.get("domain_suffix")?,
        default_group_ids: from_json(&default_group_ids),
        dns_upstreams: from_json(&dns_upstreams),
    })
}

fn peer_from_row(row: &rusqlite::Row) -> rusqlite::Result<Peer> {
    let ipv4_address: Option<String> = row.get("ipv4_address")?;
    let ipv6_address: Option<String> = row.get("ipv6_address")?;
    let endpoint: Option<String> = row.get("endpoint")?;
    let listen_port: Option<i64> = row.get("listen_port")?;
    let additional_allowed_ips: String = row.get("additional_allowed_ips")?;
    Ok(Peer {
        id: row.get::<_, String>("id")?.into(),
        network_id: row.get::<_, String>("network_id")?.into(),
        name: row
            .get::<_, String>("name")?
            .parse()
            .expect("stored hostname is valid"),
        public_key: row.get("public_key")?,
        private_key: row.get("private_key")?,
        ipv4_address: ipv4_address.map(|s| s.parse().expect("stored IPv4 is valid")),
        ipv6_address: ipv6_address.map(|s| s.parse().expect("stored IPv6 is valid")),
        endpoint: endpoint.map(|s| s.parse().expect("stored endpoint is valid")),
        listen_port: listen_port.map(|p| p as u16),
        is_jump: row.get::<_, i64>("is_jump")? != 0,
        uses_agent: row.get::<_, i64>("uses_agent")? != 0,
        additional_allowed_ips: from_json(&additional_allowed_ips),
        owner_user_id: row.get("owner_user_id")?,
        enrollment_token: row.get("enrollment_token")?,
    })
}

fn group_from_row(row: &rusqlite::Row) -> rusqlite::Result<Group> {
    let peer_ids: String = row.get("peer_ids")?;
    let policy_ids: String = row.get("policy_ids")?;
    let route_ids: String = row.get("route_ids")?;
    Ok(Group {
        id: row.get::<_, String>("id")?.into(),
        network_id: row.get::<_, String>("network_id")?.into(),
        name: row.get("name")?,
        description: row.get("description")?,
        peer_ids: from_json(&peer_ids),
        policy_ids: from_json(&policy_ids),
        route_ids: from_json(&route_ids),
        priority: row.get("priority")?,
    })
}

fn policy_from_row(row: &rusqlite::Row) -> rusqlite::Result<Policy> {
    let rules: String = row.get("rules")?;
    Ok(Policy {
        id: row.get::<_, String>("id")?.into(),
        network_id: row.get::<_, String>("network_id")?.into(),
        name: row.get("name")?,
        description: row.get("description")?,
        rules: from_json(&rules),
    })
}

fn route_from_row(row: &rusqlite::Row) -> rusqlite::Result<Route> {
    let destination_cidr: String = row.get("destination_cidr")?;
    Ok(Route {
        id: row.get::<_, String>("id")?.into(),
        network_id: row.get::<_, String>("network_id")?.into(),
        name: row.get("name")?,
        destination_cidr: destination_cidr.parse().expect("stored CIDR is valid"),
        jump_peer_id: row.get::<_, String>("jump_peer_id")?.into(),
        domain_suffix: row.get("domain_suffix")?,
    })
}

fn dns_mapping_from_row(row: &rusqlite::Row) -> rusqlite::Result<DnsMapping> {
    let ip_address: String = row.get("ip_address")?;
    Ok(DnsMapping {
        id: row.get::<_, String>("id")?.into(),
        route_id: row.get::<_, String>("route_id")?.into(),
        name: row.get("name")?,
        ip_address: ip_address.parse().expect("stored IP is valid"),
    })
}

fn session_from_row(row: &rusqlite::Row) -> rusqlite::Result<AgentSession> {
    let started_at: i64 = row.get("started_at")?;
    let last_heartbeat_at: i64 = row.get("last_heartbeat_at")?;
    let reported_endpoint: Option<String> = row.get("reported_endpoint")?;
    let status: String = row.get("status")?;
    Ok(AgentSession {
        id: row.get::<_, String>("id")?.into(),
        network_id: row.get::<_, String>("network_id")?.into(),
        peer_id: row.get::<_, String>("peer_id")?.into(),
        session_hash: row.get("session_hash")?,
        started_at: std::time::UNIX_EPOCH + std::time::Duration::from_secs(started_at as u64),
        last_heartbeat_at: std::time::UNIX_EPOCH
            + std::time::Duration::from_secs(last_heartbeat_at as u64),
        reported_endpoint: reported_endpoint.map(|s| s.parse().expect("stored endpoint is valid")),
        status: match status.as_str() {
            "active" => SessionStatus::Active,
            "stale" => SessionStatus::Stale,
            "closed" => SessionStatus::Closed,
            _ => SessionStatus::Connecting,
        },
    })
}

fn incident_from_row(row: &rusqlite::Row) -> rusqlite::Result<SecurityIncident> {
    let detected_at: i64 = row.get("detected_at")?;
    let resolved_at: Option<i64> = row.get("resolved_at")?;
    let kind: String = row.get("kind")?;
    Ok(SecurityIncident {
        id: row.get::<_, String>("id")?.into(),
        kind: match kind.as_str() {
            "session_conflict" => IncidentKind::SessionConflict,
            "suspicious_activity" => IncidentKind::SuspiciousActivity,
            _ => IncidentKind::SharedConfig,
        },
        network_id: row.get::<_, String>("network_id")?.into(),
        peer_id: row.get::<_, String>("peer_id")?.into(),
        detected_at: std::time::UNIX_EPOCH + std::time::Duration::from_secs(detected_at as u64),
        resolved: row.get::<_, i64>("resolved")? != 0,
        resolved_at: resolved_at
            .map(|s| std::time::UNIX_EPOCH + std::time::Duration::from_secs(s as u64)),
        resolved_by: row.get("resolved_by")?,
        evidence: row.get("evidence")?,
    })
}

fn unix_secs(t: std::time::SystemTime) -> i64 {
    t.duration_since(std::time::UNIX_EPOCH)
        .expect("system time is after the epoch")
        .as_secs() as i64
}

fn incident_kind_str(kind: IncidentKind) -> &'static str {
    match kind {
        IncidentKind::SharedConfig => "shared_config",
        IncidentKind::SessionConflict => "session_conflict",
        IncidentKind::SuspiciousActivity => "suspicious_activity",
    }
}

impl Repositories for SqliteRepositories {
    fn create_network(&self, network: Network) -> Result<Network, ServerError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO networks (id, name, ipv4_cidr, ipv6_cidr, ip_stack_mode, domain_suffix, default_group_ids, dns_upstreams)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                network.id.as_str(),
                network.name,
                network.ipv4_cidr.to_string(),
                network.ipv6_cidr.map(|c| c.to_string()),
                match network.ip_stack_mode {
                    IpStackMode::Ipv4 => "ipv4",
                    IpStackMode::Ipv6 => "ipv6",
                    IpStackMode::Dual => "dual",
                },
                network.domain_suffix,
                to_json(&network.default_group_ids),
                to_json(&network.dns_upstreams),
            ],
        )?;
        Ok(network)
    }

    fn get_network(&self, id: &NetworkId) -> Result<Network, ServerError> {
        let conn = self.conn();
        conn.query_row(
            "SELECT * FROM networks WHERE id = ?1",
            params![id.as_str()],
            network_from_row,
        )
        .map_err(Into::into)
    }

    fn update_network(&self, network: Network) -> Result<Network, ServerError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE networks SET name=?2, ipv4_cidr=?3, ipv6_cidr=?4, ip_stack_mode=?5, domain_suffix=?6, default_group_ids=?7, dns_upstreams=?8 WHERE id=?1",
            params![
                network.id.as_str(),
                network.name,
                network.ipv4_cidr.to_string(),
                network.ipv6_cidr.map(|c| c.to_string()),
                match network.ip_stack_mode {
                    IpStackMode::Ipv4 => "ipv4",
                    IpStackMode::Ipv6 => "ipv6",
                    IpStackMode::Dual => "dual",
                },
                network.domain_suffix,
                to_json(&network.default_group_ids),
                to_json(&network.dns_upstreams),
            ],
        )?;
        Ok(network)
    }

    fn delete_network(&self, id: &NetworkId) -> Result<(), ServerError> {
        let conn = self.conn();
        let peer_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM peers WHERE network_id = ?1",
            params![id.as_str()],
            |r| r.get(0),
        )?;
        if peer_count > 0 {
            return Err(ServerError::Conflict("network still has peers".into()));
        }
        conn.execute("DELETE FROM networks WHERE id = ?1", params![id.as_str()])?;
        Ok(())
    }

    fn list_networks(&self) -> Result<Vec<Network>, ServerError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM networks")?;
        let rows = stmt.query_map([], network_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn snapshot(&self, network_id: &NetworkId) -> Result<NetworkSnapshot, ServerError> {
        Ok(NetworkSnapshot {
            network: self.get_network(network_id)?,
            peers: self.list_peers(network_id)?,
            groups: self.list_groups(network_id)?,
            policies: self.list_policies(network_id)?,
            routes: self.list_routes(network_id)?,
            dns_mappings: self.list_dns_mappings(network_id)?,
        })
    }

    fn create_peer(&self, peer: Peer) -> Result<Peer, ServerError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO peers (id, network_id, name, public_key, private_key, ipv4_address, ipv6_address, endpoint, listen_port, is_jump, uses_agent, additional_allowed_ips, owner_user_id, enrollment_token)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
            params![
                peer.id.as_str(),
                peer.network_id.as_str(),
                peer.name.to_string(),
                peer.public_key,
                peer.private_key,
                peer.ipv4_address.map(|a| a.to_string()),
                peer.ipv6_address.map(|a| a.to_string()),
                peer.endpoint.as_ref().map(ToString::to_string),
                peer.listen_port,
                peer.is_jump as i64,
                peer.uses_agent as i64,
                to_json(&peer.additional_allowed_ips),
                peer.owner_user_id,
                peer.enrollment_token,
            ],
        )?;
        Ok(peer)
    }

    fn get_peer(&self, id: &PeerId) -> Result<Peer, ServerError> {
        let conn = self.conn();
        conn.query_row("SELECT * FROM peers WHERE id = ?1", params![id.as_str()], peer_from_row)
            .map_err(Into::into)
    }

    fn get_peer_by_token(&self, token: &str) -> Result<Peer, ServerError> {
        let conn = self.conn();
        conn.query_row(
            "SELECT * FROM peers WHERE enrollment_token = ?1",
            params![token],
            peer_from_row,
        )
        .map_err(Into::into)
    }

    fn update_peer(&self, peer: Peer) -> Result<Peer, ServerError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE peers SET name=?2, public_key=?3, private_key=?4, ipv4_address=?5, ipv6_address=?6, endpoint=?7, listen_port=?8, is_jump=?9, uses_agent=?10, additional_allowed_ips=?11, owner_user_id=?12, enrollment_token=?13 WHERE id=?1",
            params![
                peer.id.as_str(),
                peer.name.to_string(),
                peer.public_key,
                peer.private_key,
                peer.ipv4_address.map(|a| a.to_string()),
                peer.ipv6_address.map(|a| a.to_string()),
                peer.endpoint.as_ref().map(ToString::to_string),
                peer.listen_port,
                peer.is_jump as i64,
                peer.uses_agent as i64,
                to_json(&peer.additional_allowed_ips),
                peer.owner_user_id,
                peer.enrollment_token,
            ],
        )?;
        Ok(peer)
    }

    fn delete_peer(&self, id: &PeerId) -> Result<(), ServerError> {
        let conn = self.conn();
        conn.execute("DELETE FROM peers WHERE id = ?1", params![id.as_str()])?;
        Ok(())
    }

    fn list_peers(&self, network_id: &NetworkId) -> Result<Vec<Peer>, ServerError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM peers WHERE network_id = ?1")?;
        let rows = stmt.query_map(params![network_id.as_str()], peer_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn create_group(&self, group: Group) -> Result<Group, ServerError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO groups_ (id, network_id, name, description, peer_ids, policy_ids, route_ids, priority)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                group.id.as_str(),
                group.network_id.as_str(),
                group.name,
                group.description,
                to_json(&group.peer_ids),
                to_json(&group.policy_ids),
                to_json(&group.route_ids),
                group.priority,
            ],
        )?;
        Ok(group)
    }

    fn get_group(&self, id: &GroupId) -> Result<Group, ServerError> {
        let conn = self.conn();
        conn.query_row("SELECT * FROM groups_ WHERE id = ?1", params![id.as_str()], group_from_row)
            .map_err(Into::into)
    }

    fn update_group(&self, group: Group) -> Result<Group, ServerError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE groups_ SET name=?2, description=?3, peer_ids=?4, policy_ids=?5, route_ids=?6, priority=?7 WHERE id=?1",
            params![
                group.id.as_str(),
                group.name,
                group.description,
                to_json(&group.peer_ids),
                to_json(&group.policy_ids),
                to_json(&group.route_ids),
                group.priority,
            ],
        )?;
        Ok(group)
    }

    fn delete_group(&self, id: &GroupId) -> Result<(), ServerError> {
        let conn = self.conn();
        conn.execute("DELETE FROM groups_ WHERE id = ?1", params![id.as_str()])?;
        Ok(())
    }

    fn list_groups(&self, network_id: &NetworkId) -> Result<Vec<Group>, ServerError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM groups_ WHERE network_id = ?1")?;
        let rows = stmt.query_map(params![network_id.as_str()], group_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn create_policy(&self, policy: Policy) -> Result<Policy, ServerError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO policies (id, network_id, name, description, rules) VALUES (?1,?2,?3,?4,?5)",
            params![
                policy.id.as_str(),
                policy.network_id.as_str(),
                policy.name,
                policy.description,
                to_json(&policy.rules),
            ],
        )?;
        Ok(policy)
    }

    fn get_policy(&self, id: &PolicyId) -> Result<Policy, ServerError> {
        let conn = self.conn();
        conn.query_row("SELECT * FROM policies WHERE id = ?1", params![id.as_str()], policy_from_row)
            .map_err(Into::into)
    }

    fn update_policy(&self, policy: Policy) -> Result<Policy, ServerError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE policies SET name=?2, description=?3, rules=?4 WHERE id=?1",
            params![policy.id.as_str(), policy.name, policy.description, to_json(&policy.rules)],
        )?;
        Ok(policy)
    }

    fn delete_policy(&self, id: &PolicyId) -> Result<(), ServerError> {
        let conn = self.conn();
        conn.execute("DELETE FROM policies WHERE id = ?1", params![id.as_str()])?;
        Ok(())
    }

    fn list_policies(&self, network_id: &NetworkId) -> Result<Vec<Policy>, ServerError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM policies WHERE network_id = ?1")?;
        let rows = stmt.query_map(params![network_id.as_str()], policy_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn create_route(&self, route: Route) -> Result<Route, ServerError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO routes (id, network_id, name, destination_cidr, jump_peer_id, domain_suffix)
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                route.id.as_str(),
                route.network_id.as_str(),
                route.name,
                route.destination_cidr.to_string(),
                route.jump_peer_id.as_str(),
                route.domain_suffix,
            ],
        )?;
        Ok(route)
    }

    fn get_route(&self, id: &RouteId) -> Result<Route, ServerError> {
        let conn = self.conn();
        conn.query_row("SELECT * FROM routes WHERE id = ?1", params![id.as_str()], route_from_row)
            .map_err(Into::into)
    }

    fn update_route(&self, route: Route) -> Result<Route, ServerError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE routes SET name=?2, destination_cidr=?3, jump_peer_id=?4, domain_suffix=?5 WHERE id=?1",
            params![
                route.id.as_str(),
                route.name,
                route.destination_cidr.to_string(),
                route.jump_peer_id.as_str(),
                route.domain_suffix,
            ],
        )?;
        Ok(route)
    }

    fn delete_route(&self, id: &RouteId) -> Result<(), ServerError> {
        let conn = self.conn();
        conn.execute("DELETE FROM routes WHERE id = ?1", params![id.as_str()])?;
        Ok(())
    }

    fn list_routes(&self, network_id: &NetworkId) -> Result<Vec<Route>, ServerError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM routes WHERE network_id = ?1")?;
        let rows = stmt.query_map(params![network_id.as_str()], route_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn create_dns_mapping(&self, mapping: DnsMapping) -> Result<DnsMapping, ServerError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO dns_mappings (id, route_id, name, ip_address) VALUES (?1,?2,?3,?4)",
            params![
                mapping.id.as_str(),
                mapping.route_id.as_str(),
                mapping.name,
                mapping.ip_address.to_string(),
            ],
        )?;
        Ok(mapping)
    }

    fn delete_dns_mapping(&self, id: &DnsMappingId) -> Result<(), ServerError> {
        let conn = self.conn();
        conn.execute("DELETE FROM dns_mappings WHERE id = ?1", params![id.as_str()])?;
        Ok(())
    }

    fn list_dns_mappings(&self, network_id: &NetworkId) -> Result<Vec<DnsMapping>, ServerError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT dns_mappings.* FROM dns_mappings
             JOIN routes ON routes.id = dns_mappings.route_id
             WHERE routes.network_id = ?1",
        )?;
        let rows = stmt.query_map(params![network_id.as_str()], dns_mapping_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn preshared_key(&self, a: &PeerId, b: &PeerId) -> Result<Option<String>, ServerError> {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let conn = self.conn();
        conn.query_row(
            "SELECT preshared_key FROM peer_connections WHERE peer_a_id = ?1 AND peer_b_id = ?2",
            params![lo.as_str(), hi.as_str()],
            |r| r.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    fn set_preshared_key(&self, a: &PeerId, b: &PeerId, key: String) -> Result<(), ServerError> {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let conn = self.conn();
        conn.execute(
            "INSERT INTO peer_connections (peer_a_id, peer_b_id, preshared_key) VALUES (?1,?2,?3)
             ON CONFLICT (peer_a_id, peer_b_id) DO UPDATE SET preshared_key = excluded.preshared_key",
            params![lo.as_str(), hi.as_str(), key],
        )?;
        Ok(())
    }

    fn attach_policy_to_group(&self, group_id: &GroupId, policy_id: &PolicyId) -> Result<(), ServerError> {
        let mut group = self.get_group(group_id)?;
        if !group.policy_ids.contains(policy_id) {
            group.policy_ids.push(policy_id.clone());
        }
        self.update_group(group)?;
        Ok(())
    }

    fn detach_policy_from_group(&self, group_id: &GroupId, policy_id: &PolicyId) -> Result<(), ServerError> {
        let mut group = self.get_group(group_id)?;
        group.policy_ids.retain(|id| id != policy_id);
        self.update_group(group)?;
        Ok(())
    }

    fn attach_route_to_group(&self, group_id: &GroupId, route_id: &RouteId) -> Result<(), ServerError> {
        let mut group = self.get_group(group_id)?;
        group.route_ids.insert(route_id.clone());
        self.update_group(group)?;
        Ok(())
    }

    fn detach_route_from_group(&self, group_id: &GroupId, route_id: &RouteId) -> Result<(), ServerError> {
        let mut group = self.get_group(group_id)?;
        group.route_ids.remove(route_id);
        self.update_group(group)?;
        Ok(())
    }

    fn create_session(&self, session: AgentSession) -> Result<AgentSession, ServerError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO agent_sessions (id, network_id, peer_id, session_hash, started_at, last_heartbeat_at, reported_endpoint, status)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                session.id.as_str(),
                session.network_id.as_str(),
                session.peer_id.as_str(),
                session.session_hash,
                unix_secs(session.started_at),
                unix_secs(session.last_heartbeat_at),
                session.reported_endpoint.as_ref().map(ToString::to_string),
                format!("{:?}", session.status).to_lowercase(),
            ],
        )?;
        Ok(session)
    }

    fn update_session(&self, session: AgentSession) -> Result<AgentSession, ServerError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE agent_sessions SET last_heartbeat_at=?2, reported_endpoint=?3, status=?4 WHERE id=?1",
            params![
                session.id.as_str(),
                unix_secs(session.last_heartbeat_at),
                session.reported_endpoint.as_ref().map(ToString::to_string),
                format!("{:?}", session.status).to_lowercase(),
            ],
        )?;
        Ok(session)
    }

    fn get_active_session(&self, peer_id: &PeerId) -> Result<Option<AgentSession>, ServerError> {
        let conn = self.conn();
        conn.query_row(
            "SELECT * FROM agent_sessions WHERE peer_id = ?1 AND status IN ('connecting', 'active') ORDER BY started_at DESC LIMIT 1",
            params![peer_id.as_str()],
            session_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    fn close_session(&self, id: &AgentSessionId) -> Result<(), ServerError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE agent_sessions SET status = 'closed' WHERE id = ?1",
            params![id.as_str()],
        )?;
        Ok(())
    }

    fn append_endpoint_change(&self, change: EndpointChange) -> Result<(), ServerError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO endpoint_changes (peer_id, prior_endpoint, new_endpoint, changed_at) VALUES (?1,?2,?3,?4)",
            params![
                change.peer_id.as_str(),
                change.prior_endpoint.as_ref().map(ToString::to_string),
                change.new_endpoint.as_ref().map(ToString::to_string),
                unix_secs(change.changed_at),
            ],
        )?;
        Ok(())
    }

    fn create_incident(&self, incident: SecurityIncident) -> Result<SecurityIncident, ServerError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO security_incidents (id, kind, network_id, peer_id, detected_at, resolved, resolved_at, resolved_by, evidence)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                incident.id.as_str(),
                incident_kind_str(incident.kind),
                incident.network_id.as_str(),
                incident.peer_id.as_str(),
                unix_secs(incident.detected_at),
                incident.resolved as i64,
                incident.resolved_at.map(unix_secs),
                incident.resolved_by,
                incident.evidence,
            ],
        )?;
        Ok(incident)
    }

    fn find_unresolved_incident(
        &self,
        network_id: &NetworkId,
        peer_id: &PeerId,
        kind: IncidentKind,
    ) -> Result<Option<SecurityIncident>, ServerError> {
        let conn = self.conn();
        conn.query_row(
            "SELECT * FROM security_incidents WHERE network_id = ?1 AND peer_id = ?2 AND kind = ?3 AND resolved = 0",
            params![network_id.as_str(), peer_id.as_str(), incident_kind_str(kind)],
            incident_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    fn resolve_incident(&self, id: &SecurityIncidentId, resolved_by: String) -> Result<(), ServerError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE security_incidents SET resolved = 1, resolved_at = ?2, resolved_by = ?3 WHERE id = ?1",
            params![id.as_str(), unix_secs(std::time::SystemTime::now()), resolved_by],
        )?;
        Ok(())
    }

    fn list_incidents(&self, network_id: &NetworkId) -> Result<Vec<SecurityIncident>, ServerError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM security_incidents WHERE network_id = ?1")?;
        let rows = stmt.query_map(params![network_id.as_str()], incident_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn ipam_prefixes(&self, network_id: &NetworkId) -> Result<Vec<IpamPrefix>, ServerError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT cidr, parent_cidr, allocated_ips FROM ipam_prefixes WHERE network_id = ?1")?;
        let rows = stmt.query_map(params![network_id.as_str()], |row| {
            let cidr: String = row.get(0)?;
            let parent_cidr: Option<String> = row.get(1)?;
            let allocated_ips: String = row.get(2)?;
            Ok(IpamPrefix {
                cidr: cidr.parse::<IpNet>().expect("stored CIDR is valid"),
                parent_cidr: parent_cidr.map(|s| s.parse().expect("stored CIDR is valid")),
                allocated_ips: from_json(&allocated_ips),
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn save_ipam_tree(&self, network_id: &NetworkId, tree: &PrefixTree) -> Result<(), ServerError> {
        let conn = self.conn();
        conn.execute("DELETE FROM ipam_prefixes WHERE network_id = ?1", params![network_id.as_str()])?;
        for prefix in tree.prefixes() {
            conn.execute(
                "INSERT INTO ipam_prefixes (network_id, cidr, parent_cidr, allocated_ips) VALUES (?1,?2,?3,?4)",
                params![
                    network_id.as_str(),
                    prefix.cidr.to_string(),
                    prefix.parent_cidr.map(|c| c.to_string()),
                    to_json(&prefix.allocated_ips),
                ],
            )?;
        }
        Ok(())
    }

    fn policy_rule_ids_for(&self, policy_id: &PolicyId) -> Result<Vec<PolicyRuleId>, ServerError> {
        let policy = self.get_policy(policy_id)?;
        Ok(policy.rules.into_iter().map(|r| r.id).collect())
    }
}
