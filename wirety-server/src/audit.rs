//! Session/security auditor (C7). Two detectors run in the enrollment hot
//! path: shared-credential use and concurrent-session conflicts. Both
//! raise a `SecurityIncident`, persisted and de-duplicated by (kind,
//! peer_id) until an operator resolves it.
//!
//! Grounded in the teacher's expired-invite sweeper (`spawn_expired_invite_sweeper`
//! in the original `lib.rs`): a small stateful helper invoked from the
//! request path rather than its own background task, since both
//! detections only matter at the moment a new session is being opened.

use std::time::{Duration, SystemTime};

use wirety_core::{
    id::{NetworkId, PeerId},
    model::{IncidentKind, SecurityIncident},
};

use crate::{error::ServerError, repo::Repositories};

/// How close together two successful authentications for the same peer
/// have to land to count as a conflict, per §4.6.
pub const CONFLICT_WINDOW: Duration = Duration::from_secs(10);

pub struct Auditor<'a> {
    repo: &'a dyn Repositories,
}

impl<'a> Auditor<'a> {
    pub fn new(repo: &'a dyn Repositories) -> Self {
        Self { repo }
    }

    /// Called once per enrollment attempt, after the token has resolved
    /// to a peer but before the new session replaces any prior one.
    /// `source_addr`/`device_fingerprint` describe the incoming agent;
    /// `prior` is the session being superseded, if any.
    pub fn observe_enrollment(
        &self,
        network_id: &NetworkId,
        peer_id: &PeerId,
        source_addr: std::net::SocketAddr,
        device_fingerprint: &str,
        prior: Option<&wirety_core::model::AgentSession>,
    ) -> Result<(), ServerError> {
        if let Some(prior) = prior {
            self.check_shared_config(network_id, peer_id, &prior.session_hash, source_addr, device_fingerprint)?;
            self.check_session_conflict(network_id, peer_id, prior)?;
        }
        Ok(())
    }

    fn check_shared_config(
        &self,
        network_id: &NetworkId,
        peer_id: &PeerId,
        prior_session_hash: &str,
        source_addr: std::net::SocketAddr,
        device_fingerprint: &str,
    ) -> Result<(), ServerError> {
        let Some((prior_addr, prior_fingerprint)) = split_session_hash(prior_session_hash) else {
            return Ok(());
        };
        let endpoint_differs = prior_addr != source_addr.to_string();
        let device_differs = prior_fingerprint != device_fingerprint;
        if !(endpoint_differs && device_differs) {
            return Ok(());
        }

        self.raise_if_unresolved(
            network_id,
            peer_id,
            IncidentKind::SharedConfig,
            format!(
                "second session for the same enrollment token from {source_addr} (device {device_fingerprint})"
            ),
        )
    }

    fn check_session_conflict(
        &self,
        network_id: &NetworkId,
        peer_id: &PeerId,
        prior: &wirety_core::model::AgentSession,
    ) -> Result<(), ServerError> {
        let elapsed = SystemTime::now()
            .duration_since(prior.last_heartbeat_at)
            .unwrap_or_default();
        if elapsed > CONFLICT_WINDOW {
            return Ok(());
        }

        self.raise_if_unresolved(
            network_id,
            peer_id,
            IncidentKind::SessionConflict,
            format!("two authenticated sessions for peer {peer_id} within {CONFLICT_WINDOW:?}"),
        )
    }

    fn raise_if_unresolved(
        &self,
        network_id: &NetworkId,
        peer_id: &PeerId,
        kind: IncidentKind,
        evidence: String,
    ) -> Result<(), ServerError> {
        if self.repo.find_unresolved_incident(network_id, peer_id, kind)?.is_some() {
            return Ok(());
        }

        self.repo.create_incident(SecurityIncident {
            id: wirety_core::id::SecurityIncidentId::generate(),
            kind,
            network_id: network_id.clone(),
            peer_id: peer_id.clone(),
            detected_at: SystemTime::now(),
            resolved: false,
            resolved_at: None,
            resolved_by: None,
            evidence,
        })?;
        Ok(())
    }

    pub fn resolve(&self, id: &wirety_core::id::SecurityIncidentId, resolved_by: String) -> Result<(), ServerError> {
        self.repo.resolve_incident(id, resolved_by)
    }
}

/// `session_hash` packs the originating address and device fingerprint so
/// the next enrollment can tell whether *both* differ, per §4.6.
pub fn session_hash(source_addr: std::net::SocketAddr, device_fingerprint: &str) -> String {
    format!("{source_addr}|{device_fingerprint}")
}

fn split_session_hash(hash: &str) -> Option<(&str, &str)> {
    hash.split_once('|')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::SqliteRepositories;
    use wirety_core::model::{AgentSession, SessionStatus};

    fn session(peer_id: PeerId, network_id: NetworkId, hash: &str, when: SystemTime) -> AgentSession {
        AgentSession {
            id: wirety_core::id::AgentSessionId::generate(),
            network_id,
            peer_id,
            session_hash: hash.into(),
            started_at: when,
            last_heartbeat_at: when,
            reported_endpoint: None,
            status: SessionStatus::Active,
        }
    }

    #[test]
    fn shared_config_is_raised_once_for_repeated_collisions() {
        let repo = SqliteRepositories::open_in_memory().unwrap();
        let network_id: NetworkId = "net_1".into();
        let peer_id: PeerId = "peer_1".into();
        let prior_hash = session_hash("10.0.0.1:51820".parse().unwrap(), "fp-a");
        let prior = session(peer_id.clone(), network_id.clone(), &prior_hash, SystemTime::now());

        let auditor = Auditor::new(&repo);
        auditor
            .observe_enrollment(
                &network_id,
                &peer_id,
                "10.0.0.2:51820".parse().unwrap(),
                "fp-b",
                Some(&prior),
            )
            .unwrap();
        auditor
            .observe_enrollment(
                &network_id,
                &peer_id,
                "10.0.0.3:51820".parse().unwrap(),
                "fp-c",
                Some(&prior),
            )
            .unwrap();

        let incidents = repo.list_incidents(&network_id).unwrap();
        let shared_config_count = incidents
            .iter()
            .filter(|i| i.kind == wirety_core::model::IncidentKind::SharedConfig)
            .count();
        assert_eq!(shared_config_count, 1);
    }
}
