//! Agent enrollment (C9), per §4.7: turns a bearer enrollment token into a
//! live, registered `AgentSession` and pushes the peer's first policy
//! bundle as the opening frame.
//!
//! Grounded in the teacher's `get_session` (`lib.rs`): both look up a peer
//! from an untrusted credential, reject unknown/disabled peers, and hand
//! back a typed session object rather than leaking the raw credential
//! further into the call stack.

use std::{net::SocketAddr, sync::Arc};

use wirety_core::{
    id::NetworkId,
    model::{AgentSession, SessionStatus},
};

use crate::{
    audit::{session_hash, Auditor},
    channel::{DistributionChannel, Transport},
    error::ServerError,
    repo::Repositories,
    service::NetworkService,
};

pub struct Enrollment {
    repo: Arc<dyn Repositories>,
    channel: Arc<DistributionChannel>,
    service: Arc<NetworkService>,
}

impl Enrollment {
    pub fn new(repo: Arc<dyn Repositories>, channel: Arc<DistributionChannel>, service: Arc<NetworkService>) -> Self {
        Self { repo, channel, service }
    }

    /// Runs the full handshake described in §4.7: resolve the token,
    /// run the auditor against any session it is replacing, open and
    /// register the new session, then push a full policy bundle as the
    /// first frame. Returns the session now marked `connecting`; the
    /// caller transitions it to `active` once the agent acknowledges.
    pub fn enroll(
        &self,
        token: &str,
        source_addr: SocketAddr,
        device_fingerprint: &str,
        transport: Arc<dyn Transport>,
    ) -> Result<AgentSession, ServerError> {
        let peer = self.repo.get_peer_by_token(token).map_err(|_| ServerError::Unauthorized)?;
        let network_id = peer.network_id.clone();

        let prior = self.repo.get_active_session(&peer.id)?;
        {
            let auditor = Auditor::new(&*self.repo);
            auditor.observe_enrollment(&network_id, &peer.id, source_addr, device_fingerprint, prior.as_ref())?;
        }

        if let Some(prior) = &prior {
            self.repo.close_session(&prior.id)?;
        }

        let session = self.repo.create_session(AgentSession {
            id: wirety_core::id::AgentSessionId::generate(),
            network_id: network_id.clone(),
            peer_id: peer.id.clone(),
            session_hash: session_hash(source_addr, device_fingerprint),
            started_at: std::time::SystemTime::now(),
            last_heartbeat_at: std::time::SystemTime::now(),
            reported_endpoint: None,
            status: SessionStatus::Connecting,
        })?;

        self.channel.register(network_id.clone(), peer.id.clone(), source_addr, device_fingerprint.to_string(), transport);

        let bundle = self.service.compile_for(&network_id, &peer.id)?;
        self.channel.push_policy(&network_id, &peer.id, bundle);

        Ok(session)
    }

    /// Called when the agent's `status_ack` arrives for the bundle pushed
    /// during enrollment; transitions the session from `connecting` to
    /// `active`.
    pub fn acknowledge(&self, session: AgentSession) -> Result<AgentSession, ServerError> {
        self.repo.update_session(AgentSession {
            status: SessionStatus::Active,
            ..session
        })
    }

    pub fn network_id_for_token(&self, token: &str) -> Result<NetworkId, ServerError> {
        Ok(self.repo.get_peer_by_token(token).map_err(|_| ServerError::Unauthorized)?.network_id)
    }
}
