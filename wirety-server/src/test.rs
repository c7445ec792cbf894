#![allow(dead_code)]
//! Integration test harness: spins up a fully wired `Application` against
//! an in-memory database, the way the teacher's `test::Server` spun up a
//! temp-dir-backed database and wizard-initialized network. No process,
//! no sockets — callers drive `NetworkService`/`Repositories` directly and,
//! for HTTP-layer tests, go through `http::hyper_service`.

use std::sync::Arc;

use wirety_core::{
    id::{GroupId, NetworkId, PeerId},
    model::{Hostname, IpStackMode, Network, Peer},
};

use crate::{Application, NetworkService, Repositories};

pub const NETWORK_CIDR: &str = "10.80.0.0/16";

pub struct Harness {
    pub app: Application,
}

impl Harness {
    pub fn new() -> anyhow::Result<Self> {
        let app = Application::in_memory("test-admin-token".to_string())?;
        Ok(Self { app })
    }

    pub fn repo(&self) -> &Arc<dyn Repositories> {
        &self.app.repo
    }

    pub fn service(&self) -> &Arc<NetworkService> {
        &self.app.service
    }

    pub fn create_network(&self) -> anyhow::Result<Network> {
        let network = Network {
            id: NetworkId::generate(),
            name: "test".into(),
            ipv4_cidr: NETWORK_CIDR.parse()?,
            ipv6_cidr: None,
            ip_stack_mode: IpStackMode::Ipv4,
            domain_suffix: Network::default_domain_suffix(),
            default_group_ids: Vec::new(),
            dns_upstreams: Vec::new(),
        };
        Ok(self.app.service.create_network(network)?)
    }

    pub fn create_peer(&self, network_id: &NetworkId, name: &str) -> anyhow::Result<Peer> {
        let peer = Peer {
            id: PeerId::generate(),
            network_id: network_id.clone(),
            name: name.parse::<Hostname>().map_err(|e| anyhow::anyhow!(e))?,
            public_key: base64_like_key(name),
            private_key: None,
            ipv4_address: None,
            ipv6_address: None,
            endpoint: None,
            listen_port: None,
            is_jump: false,
            uses_agent: true,
            additional_allowed_ips: Vec::new(),
            owner_user_id: None,
            enrollment_token: String::new(),
        };
        Ok(self.app.service.create_peer(network_id, peer, true)?)
    }

    pub fn create_group(&self, network_id: &NetworkId, name: &str) -> anyhow::Result<GroupId> {
        let group = wirety_core::model::Group {
            id: GroupId::generate(),
            network_id: network_id.clone(),
            name: name.into(),
            description: String::new(),
            peer_ids: Default::default(),
            policy_ids: Vec::new(),
            route_ids: Default::default(),
            priority: 0,
        };
        Ok(self.app.service.create_group(group)?.id)
    }
}

/// Deterministic stand-in for a WireGuard public key; real keys come from
/// `wirety-agent-core`'s keypair generation, out of scope for server tests.
fn base64_like_key(seed: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    format!("{:016x}{:016x}", hasher.finish(), hasher.finish().wrapping_add(1))
}
