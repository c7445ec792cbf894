//! Abstract repositories (C2): CRUD for every entity plus session and
//! incident persistence. `wirety-core` never depends on these traits —
//! they exist purely so `service`, `channel` and `audit` can be written
//! against an interface instead of a concrete SQLite connection, mirroring
//! the way the teacher's `db::DatabasePeer`/`DatabaseCidr` wrap a `Peer`/
//! `Cidr` around a `rusqlite::Connection` without leaking SQL upward.

mod sqlite;

pub use sqlite::SqliteRepositories;

use wirety_core::{
    id::{
        AgentSessionId, DnsMappingId, GroupId, NetworkId, PeerId, PolicyId, PolicyRuleId, RouteId,
        SecurityIncidentId,
    },
    model::{
        AgentSession, DnsMapping, EndpointChange, Group, Network, Peer, Policy, Route,
        SecurityIncident,
    },
};

use crate::error::ServerError;

/// One network's worth of state, the unit `compiler::Snapshot` is built
/// from.
pub struct NetworkSnapshot {
    pub network: Network,
    pub peers: Vec<Peer>,
    pub groups: Vec<Group>,
    pub policies: Vec<Policy>,
    pub routes: Vec<Route>,
    pub dns_mappings: Vec<DnsMapping>,
}

/// Capability trait implemented once per storage backend. `SqliteRepositories`
/// is the only implementation shipped; the trait boundary exists so the
/// network service and tests don't depend on SQLite directly.
pub trait Repositories: Send + Sync {
    fn create_network(&self, network: Network) -> Result<Network, ServerError>;
    fn get_network(&self, id: &NetworkId) -> Result<Network, ServerError>;
    fn update_network(&self, network: Network) -> Result<Network, ServerError>;
    fn delete_network(&self, id: &NetworkId) -> Result<(), ServerError>;
    fn list_networks(&self) -> Result<Vec<Network>, ServerError>;

    fn snapshot(&self, network_id: &NetworkId) -> Result<NetworkSnapshot, ServerError>;

    fn create_peer(&self, peer: Peer) -> Result<Peer, ServerError>;
    fn get_peer(&self, id: &PeerId) -> Result<Peer, ServerError>;
    fn get_peer_by_token(&self, token: &str) -> Result<Peer, ServerError>;
    fn update_peer(&self, peer: Peer) -> Result<Peer, ServerError>;
    fn delete_peer(&self, id: &PeerId) -> Result<(), ServerError>;
    fn list_peers(&self, network_id: &NetworkId) -> Result<Vec<Peer>, ServerError>;

    fn create_group(&self, group: Group) -> Result<Group, ServerError>;
    fn get_group(&self, id: &GroupId) -> Result<Group, ServerError>;
    fn update_group(&self, group: Group) -> Result<Group, ServerError>;
    fn delete_group(&self, id: &GroupId) -> Result<(), ServerError>;
    fn list_groups(&self, network_id: &NetworkId) -> Result<Vec<Group>, ServerError>;

    fn create_policy(&self, policy: Policy) -> Result<Policy, ServerError>;
    fn get_policy(&self, id: &PolicyId) -> Result<Policy, ServerError>;
    fn update_policy(&self, policy: Policy) -> Result<Policy, ServerError>;
    fn delete_policy(&self, id: &PolicyId) -> Result<(), ServerError>;
    fn list_policies(&self, network_id: &NetworkId) -> Result<Vec<Policy>, ServerError>;

    fn create_route(&self, route: Route) -> Result<Route, ServerError>;
    fn get_route(&self, id: &RouteId) -> Result<Route, ServerError>;
    fn update_route(&self, route: Route) -> Result<Route, ServerError>;
    fn delete_route(&self, id: &RouteId) -> Result<(), ServerError>;
    fn list_routes(&self, network_id: &NetworkId) -> Result<Vec<Route>, ServerError>;

    fn create_dns_mapping(&self, mapping: DnsMapping) -> Result<DnsMapping, ServerError>;
    fn delete_dns_mapping(&self, id: &DnsMappingId) -> Result<(), ServerError>;
    fn list_dns_mappings(&self, network_id: &NetworkId) -> Result<Vec<DnsMapping>, ServerError>;

    fn preshared_key(&self, a: &PeerId, b: &PeerId) -> Result<Option<String>, ServerError>;
    fn set_preshared_key(&self, a: &PeerId, b: &PeerId, key: String) -> Result<(), ServerError>;

    fn attach_policy_to_group(&self, group_id: &GroupId, policy_id: &PolicyId) -> Result<(), ServerError>;
    fn detach_policy_from_group(&self, group_id: &GroupId, policy_id: &PolicyId) -> Result<(), ServerError>;
    fn attach_route_to_group(&self, group_id: &GroupId, route_id: &RouteId) -> Result<(), ServerError>;
    fn detach_route_from_group(&self, group_id: &GroupId, route_id: &RouteId) -> Result<(), ServerError>;

    fn create_session(&self, session: AgentSession) -> Result<AgentSession, ServerError>;
    fn update_session(&self, session: AgentSession) -> Result<AgentSession, ServerError>;
    fn get_active_session(&self, peer_id: &PeerId) -> Result<Option<AgentSession>, ServerError>;
    fn close_session(&self, id: &AgentSessionId) -> Result<(), ServerError>;

    fn append_endpoint_change(&self, change: EndpointChange) -> Result<(), ServerError>;

    fn create_incident(&self, incident: SecurityIncident) -> Result<SecurityIncident, ServerError>;
    fn find_unresolved_incident(
        &self,
        network_id: &NetworkId,
        peer_id: &PeerId,
        kind: wirety_core::model::IncidentKind,
    ) -> Result<Option<SecurityIncident>, ServerError>;
    fn resolve_incident(
        &self,
        id: &SecurityIncidentId,
        resolved_by: String,
    ) -> Result<(), ServerError>;
    fn list_incidents(&self, network_id: &NetworkId) -> Result<Vec<SecurityIncident>, ServerError>;

    fn ipam_prefixes(&self, network_id: &NetworkId) -> Result<Vec<wirety_core::ipam::IpamPrefix>, ServerError>;
    fn save_ipam_tree(
        &self,
        network_id: &NetworkId,
        tree: &wirety_core::ipam::PrefixTree,
    ) -> Result<(), ServerError>;

    fn policy_rule_ids_for(&self, policy_id: &PolicyId) -> Result<Vec<PolicyRuleId>, ServerError>;
}
