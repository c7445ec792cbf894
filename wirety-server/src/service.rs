//! The network service (C5): the sole mutator of the declarative model.
//! Every public method here persists through `Repositories`, recomputes
//! the recompile scope via `wirety_core::compiler`, and hands the result
//! to the distribution channel for fan-out — mirroring the teacher's
//! `add_peer`/`add_cidr` free functions in `lib.rs`, but as methods on a
//! shared service object instead of one-shot CLI commands.

use std::sync::Arc;

use wirety_core::{
    compiler::{self, PolicyBundle, Snapshot},
    id::{DnsMappingId, GroupId, NetworkId, PeerId, PolicyId, RouteId},
    ipam::PrefixTree,
    model::{DnsMapping, Group, IpStackMode, Network, Peer, Policy, Route},
};

use crate::{channel::DistributionChannel, error::ServerError, repo::Repositories};

pub struct NetworkService {
    repo: Arc<dyn Repositories>,
    channel: Arc<DistributionChannel>,
}

impl NetworkService {
    pub fn new(repo: Arc<dyn Repositories>, channel: Arc<DistributionChannel>) -> Self {
        Self { repo, channel }
    }

    fn load_tree(&self, network: &Network) -> Result<PrefixTree, ServerError> {
        let mut tree = PrefixTree::from_prefixes(network.ipv4_cidr, self.repo.ipam_prefixes(&network.id)?);
        tree.ensure_root(network.ipv4_cidr);
        if let Some(v6) = network.ipv6_cidr {
            tree.ensure_root(v6);
        }
        Ok(tree)
    }

    pub fn create_network(&self, mut network: Network) -> Result<Network, ServerError> {
        if network.domain_suffix.is_empty() {
            network.domain_suffix = Network::default_domain_suffix();
        }
        let network = self.repo.create_network(network)?;
        let mut tree = PrefixTree::new();
        tree.ensure_root(network.ipv4_cidr);
        if let Some(v6) = network.ipv6_cidr {
            tree.ensure_root(v6);
        }
        self.repo.save_ipam_tree(&network.id, &tree)?;
        Ok(network)
    }

    pub fn delete_network(&self, id: &NetworkId) -> Result<(), ServerError> {
        self.repo.delete_network(id)
    }

    /// Allocates address(es), mints a key-pair if one wasn't supplied, mints
    /// an enrollment token, and for non-administrator-created peers appends
    /// the network's default groups (§4.3).
    pub fn create_peer(
        &self,
        network_id: &NetworkId,
        mut peer: Peer,
        created_by_admin: bool,
    ) -> Result<Peer, ServerError> {
        let network = self.repo.get_network(network_id)?;
        let mut tree = self.load_tree(&network)?;

        if peer.ipv4_address.is_none() && network.wants_ipv4() {
            let ip = tree.acquire_ip(network.ipv4_cidr)?;
            peer.ipv4_address = Some(match ip {
                std::net::IpAddr::V4(v4) => v4,
                _ => unreachable!("root prefix is IPv4"),
            });
        }
        if peer.ipv6_address.is_none() && network.wants_ipv6() {
            if let Some(v6_cidr) = network.ipv6_cidr {
                let ip = tree.acquire_ip(v6_cidr)?;
                peer.ipv6_address = Some(match ip {
                    std::net::IpAddr::V6(v6) => v6,
                    _ => unreachable!("v6 prefix is IPv6"),
                });
            }
        }

        if peer.public_key.is_empty() {
            return Err(ServerError::InvalidQuery("peer requires a public key".into()));
        }
        if peer.enrollment_token.is_empty() {
            peer.enrollment_token = wirety_core::id::generate("enroll");
        }

        if !created_by_admin {
            for group_id in &network.default_group_ids {
                if let Ok(mut group) = self.repo.get_group(group_id) {
                    group.peer_ids.insert(peer.id.clone());
                    self.repo.update_group(group)?;
                }
            }
        }

        let peer = self.repo.create_peer(peer)?;
        self.repo.save_ipam_tree(&network.id, &tree)?;
        self.notify_scope(network_id, &peer.id)?;
        Ok(peer)
    }

    pub fn update_peer(&self, peer: Peer) -> Result<Peer, ServerError> {
        let peer = self.repo.update_peer(peer)?;
        self.notify_scope(&peer.network_id, &peer.id)?;
        Ok(peer)
    }

    /// Releases the peer's address(es) and ends its active session.
    pub fn delete_peer(&self, network_id: &NetworkId, id: &PeerId) -> Result<(), ServerError> {
        let network = self.repo.get_network(network_id)?;
        let peer = self.repo.get_peer(id)?;
        let mut tree = self.load_tree(&network)?;
        if let Some(v4) = peer.ipv4_address {
            tree.release_ip(network.ipv4_cidr, std::net::IpAddr::V4(v4))?;
        }
        if let (Some(v6), Some(v6_cidr)) = (peer.ipv6_address, network.ipv6_cidr) {
            tree.release_ip(v6_cidr, std::net::IpAddr::V6(v6))?;
        }
        self.repo.save_ipam_tree(network_id, &tree)?;

        if let Some(session) = self.repo.get_active_session(id)? {
            self.repo.close_session(&session.id)?;
            self.channel.close(id, "peer deleted");
        }

        self.repo.delete_peer(id)?;
        Ok(())
    }

    pub fn create_group(&self, group: Group) -> Result<Group, ServerError> {
        let mut snapshot = self.repo.snapshot(&group.network_id)?;
        snapshot.groups.push(group.clone());
        self.validate_snapshot(&snapshot)?;

        let group = self.repo.create_group(group)?;
        self.notify_network(&group.network_id)?;
        Ok(group)
    }

    pub fn update_group(&self, group: Group) -> Result<Group, ServerError> {
        let mut snapshot = self.repo.snapshot(&group.network_id)?;
        match snapshot.groups.iter_mut().find(|g| g.id == group.id) {
            Some(slot) => *slot = group.clone(),
            None => snapshot.groups.push(group.clone()),
        }
        self.validate_snapshot(&snapshot)?;

        let group = self.repo.update_group(group)?;
        self.notify_network(&group.network_id)?;
        Ok(group)
    }

    pub fn delete_group(&self, network_id: &NetworkId, id: &GroupId) -> Result<(), ServerError> {
        self.repo.delete_group(id)?;
        self.notify_network(network_id)?;
        Ok(())
    }

    pub fn create_policy(&self, policy: Policy) -> Result<Policy, ServerError> {
        let policy = self.repo.create_policy(policy)?;
        self.notify_network(&policy.network_id)?;
        Ok(policy)
    }

    pub fn create_route(&self, route: Route) -> Result<Route, ServerError> {
        let route = self.repo.create_route(route)?;
        self.notify_network(&route.network_id)?;
        Ok(route)
    }

    pub fn create_dns_mapping(
        &self,
        network_id: &NetworkId,
        mapping: DnsMapping,
    ) -> Result<DnsMapping, ServerError> {
        self.validate_network(network_id)?;
        let mapping = self.repo.create_dns_mapping(mapping)?;
        self.notify_network(network_id)?;
        Ok(mapping)
    }

    pub fn delete_dns_mapping(&self, network_id: &NetworkId, id: &DnsMappingId) -> Result<(), ServerError> {
        self.repo.delete_dns_mapping(id)?;
        self.notify_network(network_id)?;
        Ok(())
    }

    pub fn attach_policy_to_group(
        &self,
        network_id: &NetworkId,
        group_id: &GroupId,
        policy_id: &PolicyId,
    ) -> Result<(), ServerError> {
        self.repo.attach_policy_to_group(group_id, policy_id)?;
        self.notify_network(network_id)?;
        Ok(())
    }

    pub fn attach_route_to_group(
        &self,
        network_id: &NetworkId,
        group_id: &GroupId,
        route_id: &RouteId,
    ) -> Result<(), ServerError> {
        let mut snapshot = self.repo.snapshot(network_id)?;
        let group = snapshot
            .groups
            .iter_mut()
            .find(|g| &g.id == group_id)
            .ok_or(ServerError::NotFound)?;
        group.route_ids.insert(route_id.clone());
        self.validate_snapshot(&snapshot)?;

        self.repo.attach_route_to_group(group_id, route_id)?;
        self.notify_network(network_id)?;
        Ok(())
    }

    /// Validates a network's current, persisted snapshot against I2/I3.
    fn validate_network(&self, network_id: &NetworkId) -> Result<(), ServerError> {
        let snapshot = self.repo.snapshot(network_id)?;
        self.validate_snapshot(&snapshot)
    }

    /// Validates a proposed (possibly not-yet-persisted) snapshot against
    /// I2/I3; callers build the post-mutation state in memory and check it
    /// here before committing anything through `self.repo`, so a rejected
    /// mutation never reaches storage.
    fn validate_snapshot(&self, snapshot: &crate::repo::NetworkSnapshot) -> Result<(), ServerError> {
        let preshared_key = |_: &Peer, _: &Peer| None;
        compiler::validate(&Snapshot {
            network: &snapshot.network,
            peers: &snapshot.peers,
            groups: &snapshot.groups,
            policies: &snapshot.policies,
            routes: &snapshot.routes,
            dns_mappings: &snapshot.dns_mappings,
            preshared_key: &preshared_key,
        })?;
        Ok(())
    }

    /// Compiles and pushes a bundle to every peer in `scope`.
    fn notify_scope(&self, network_id: &NetworkId, peer_id: &PeerId) -> Result<(), ServerError> {
        let snapshot = self.repo.snapshot(network_id)?;
        let repo = self.repo.clone();
        let preshared_key = move |a: &Peer, b: &Peer| repo.preshared_key(&a.id, &b.id).ok().flatten();
        let core_snapshot = Snapshot {
            network: &snapshot.network,
            peers: &snapshot.peers,
            groups: &snapshot.groups,
            policies: &snapshot.policies,
            routes: &snapshot.routes,
            dns_mappings: &snapshot.dns_mappings,
            preshared_key: &preshared_key,
        };

        let scope = compiler::recompile_scope(&core_snapshot, peer_id);
        for target_id in &scope {
            if let Some(target) = snapshot.peers.iter().find(|p| &p.id == target_id) {
                let bundle = compiler::compile(&core_snapshot, target)?;
                self.channel.push_policy(network_id, target_id, bundle);
            }
        }
        Ok(())
    }

    /// Recompiles every peer in the network; used for group/policy/route
    /// mutations that don't obviously originate from a single peer.
    fn notify_network(&self, network_id: &NetworkId) -> Result<(), ServerError> {
        let snapshot = self.repo.snapshot(network_id)?;
        let repo = self.repo.clone();
        let preshared_key = move |a: &Peer, b: &Peer| repo.preshared_key(&a.id, &b.id).ok().flatten();
        let core_snapshot = Snapshot {
            network: &snapshot.network,
            peers: &snapshot.peers,
            groups: &snapshot.groups,
            policies: &snapshot.policies,
            routes: &snapshot.routes,
            dns_mappings: &snapshot.dns_mappings,
            preshared_key: &preshared_key,
        };
        for target in &snapshot.peers {
            let bundle = compiler::compile(&core_snapshot, target)?;
            self.channel.push_policy(network_id, &target.id, bundle);
        }
        Ok(())
    }

    /// Ensures a symmetric preshared key exists for every pair this peer
    /// can talk to; used on peer creation so the first compile has keys to
    /// reference.
    pub fn ensure_preshared_keys(&self, network_id: &NetworkId, peer_id: &PeerId) -> Result<(), ServerError> {
        let peers = self.repo.list_peers(network_id)?;
        for other in &peers {
            if &other.id == peer_id {
                continue;
            }
            if self.repo.preshared_key(peer_id, &other.id)?.is_none() {
                self.repo
                    .set_preshared_key(peer_id, &other.id, wirety_core::id::generate("psk"))?;
            }
        }
        Ok(())
    }

    pub fn compile_for(&self, network_id: &NetworkId, peer_id: &PeerId) -> Result<PolicyBundle, ServerError> {
        let snapshot = self.repo.snapshot(network_id)?;
        let repo = self.repo.clone();
        let preshared_key = move |a: &Peer, b: &Peer| repo.preshared_key(&a.id, &b.id).ok().flatten();
        let core_snapshot = Snapshot {
            network: &snapshot.network,
            peers: &snapshot.peers,
            groups: &snapshot.groups,
            policies: &snapshot.policies,
            routes: &snapshot.routes,
            dns_mappings: &snapshot.dns_mappings,
            preshared_key: &preshared_key,
        };
        let target = snapshot
            .peers
            .iter()
            .find(|p| &p.id == peer_id)
            .ok_or(ServerError::NotFound)?;
        Ok(compiler::compile(&core_snapshot, target)?)
    }
}

/// Groups/Policies/Routes keep `ip_stack_mode`-agnostic defaults so a peer
/// created against a dual-stack network without an explicit stack choice
/// still gets only the address families the network asks for.
pub fn default_stack_mode() -> IpStackMode {
    IpStackMode::Ipv4
}

#[cfg(test)]
mod tests {
    use wirety_core::model::Route;

    use crate::test::Harness;

    /// S3: attaching a route to a group already containing that route's
    /// jump peer is circular routing (I2) and must be refused without
    /// touching the stored group.
    #[test]
    fn attach_route_to_group_rejects_circular_routing_and_leaves_group_unchanged() -> anyhow::Result<()> {
        let harness = Harness::new()?;
        let network = harness.create_network()?;
        let jump = harness.create_peer(&network.id, "jump")?;
        let group_id = harness.create_group(&network.id, "jump-group")?;
        harness.service().update_peer({
            let mut jump = jump.clone();
            jump.is_jump = true;
            jump
        })?;
        let mut group = harness.repo().get_group(&group_id)?;
        group.peer_ids.insert(jump.id.clone());
        harness.service().update_group(group)?;

        let route = harness.service().create_route(Route {
            id: Default::default(),
            network_id: network.id.clone(),
            name: "via-jump".into(),
            destination_cidr: "10.90.0.0/24".parse()?,
            jump_peer_id: jump.id.clone(),
            domain_suffix: String::new(),
        })?;

        let result = harness
            .service()
            .attach_route_to_group(&network.id, &group_id, &route.id);
        assert!(result.is_err());

        let group_after = harness.repo().get_group(&group_id)?;
        assert!(
            !group_after.route_ids.contains(&route.id),
            "rejected attach must not be committed to the repository"
        );
        Ok(())
    }

    /// Mirrors the above for `create_group`: a freshly-created group that
    /// already bundles a jump peer together with a route through it must
    /// be rejected up front, with no group ever persisted.
    #[test]
    fn create_group_rejects_circular_routing() -> anyhow::Result<()> {
        let harness = Harness::new()?;
        let network = harness.create_network()?;
        let jump = harness.create_peer(&network.id, "jump")?;
        harness.service().update_peer({
            let mut jump = jump.clone();
            jump.is_jump = true;
            jump
        })?;
        let route = harness.service().create_route(Route {
            id: Default::default(),
            network_id: network.id.clone(),
            name: "via-jump".into(),
            destination_cidr: "10.91.0.0/24".parse()?,
            jump_peer_id: jump.id.clone(),
            domain_suffix: String::new(),
        })?;

        let mut group = wirety_core::model::Group {
            id: wirety_core::id::GroupId::generate(),
            network_id: network.id.clone(),
            name: "bad-group".into(),
            description: String::new(),
            peer_ids: Default::default(),
            policy_ids: Vec::new(),
            route_ids: Default::default(),
            priority: 0,
        };
        group.peer_ids.insert(jump.id.clone());
        group.route_ids.insert(route.id.clone());

        let group_id = group.id.clone();
        assert!(harness.service().create_group(group).is_err());
        assert!(harness.repo().get_group(&group_id).is_err());
        Ok(())
    }
}
