//! The reconciliation loop (C8): applies one policy bundle to the kernel
//! WireGuard interface, the firewall, the DNS resolver and the
//! captive-portal gateway, in the order §4.5 specifies, then reports a
//! `status_ack`. Per §7's propagation policy, a subsystem failure never
//! aborts the pass — every subsystem gets a chance to apply, and failures
//! surface only in the ack.
//!
//! Per §5 ("the reconciliation loop is single-threaded; the agent
//! serializes apply operations"), `Reconciler::apply` takes `&mut self`
//! and is only ever driven by one task at a time.

use std::{net::IpAddr, sync::Arc};

use wirety_core::wire::{DnsPeerRecord, KernelStatus, PolicyPush, StatusAck};

use crate::{
    captive::Gateway,
    config::ApplyMethod,
    dns::Resolver,
    error::AgentError,
    firewall,
    wireguard::{self, WireGuardReconciler},
};

pub struct Reconciler {
    wg: WireGuardReconciler,
    nat_interface: Option<String>,
    apply_method: ApplyMethod,
    resolver: Arc<Resolver>,
    gateway: Arc<Gateway>,
    server_host: String,
}

impl Reconciler {
    pub fn new(
        wg: WireGuardReconciler,
        nat_interface: Option<String>,
        apply_method: ApplyMethod,
        resolver: Arc<Resolver>,
        gateway: Arc<Gateway>,
        server_url: &str,
    ) -> Self {
        Self {
            wg,
            nat_interface,
            apply_method,
            resolver,
            gateway,
            server_host: host_of(server_url),
        }
    }

    /// Applies `push` to every kernel subsystem and builds the
    /// `status_ack` the agent reports back (§4.5 step 6).
    pub fn apply(&mut self, push: &PolicyPush) -> StatusAck {
        let interface = self.wg.interface_name.as_str_lossy();
        let mut errors = Vec::new();

        let wg_ok = match self.apply_wireguard(&push.wg_config) {
            Ok(()) => true,
            Err(e) => {
                errors.push(format!("wg: {e}"));
                false
            },
        };

        let firewall_ok = match self.apply_firewall(push, &interface) {
            Ok(()) => true,
            Err(e) => {
                errors.push(format!("firewall: {e}"));
                false
            },
        };

        let dns_ok = match self.apply_dns(push) {
            Ok(()) => true,
            Err(e) => {
                errors.push(format!("dns: {e}"));
                false
            },
        };

        if let Err(e) = self.apply_captive(push) {
            errors.push(format!("captive: {e}"));
        }

        StatusAck {
            bundle_id: push.bundle_id.clone(),
            ok: errors.is_empty(),
            per_subsystem: KernelStatus { wg: wg_ok, firewall: firewall_ok, dns: dns_ok },
            errors,
        }
    }

    fn apply_wireguard(&mut self, wg_config: &str) -> Result<(), AgentError> {
        let path = crate::config::wireguard_config_path(&self.wg.interface_name.as_str_lossy());
        wireguard::write_managed_config(&path, wg_config)?;
        let parsed = wireguard::parse(wg_config)?;
        let used = self.wg.apply(&parsed, self.apply_method)?;
        // Once recreated, subsequent applies use the configured method.
        self.apply_method = if used == ApplyMethod::Recreate { self.apply_method } else { used };
        Ok(())
    }

    fn apply_firewall(&self, push: &PolicyPush, interface: &str) -> Result<(), AgentError> {
        firewall::apply_ipv4(&push.iptables_rules, interface, self.nat_interface.as_deref())?;
        firewall::apply_ipv6(&push.ip6tables_rules, interface)?;
        wireguard::enable_forwarding(!push.ip6tables_rules.is_empty())
    }

    fn apply_dns(&self, push: &PolicyPush) -> Result<(), AgentError> {
        let zone = dns_zone_from_peers(&push.dns_peers);
        self.resolver.update_zone(zone, push.upstream_dns.clone());
        Ok(())
    }

    fn apply_captive(&self, push: &PolicyPush) -> Result<(), AgentError> {
        self.gateway.update(&push.captive_portal, &self.server_host);
        Ok(())
    }
}

fn dns_zone_from_peers(peers: &[DnsPeerRecord]) -> wirety_core::compiler::DnsZone {
    let mut records = Vec::new();
    for peer in peers {
        if let Some(v4) = peer.ipv4 {
            records.push(wirety_core::compiler::DnsRecord { name: peer.name.clone(), address: IpAddr::V4(v4) });
        }
        if let Some(v6) = peer.ipv6 {
            records.push(wirety_core::compiler::DnsRecord { name: peer.name.clone(), address: IpAddr::V6(v6) });
        }
    }
    wirety_core::compiler::DnsZone { records }
}

fn host_of(server_url: &str) -> String {
    let without_scheme = server_url.split("://").last().unwrap_or(server_url);
    let host_port = without_scheme.split('/').next().unwrap_or(without_scheme);
    host_port.split(':').next().unwrap_or(host_port).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_of_strips_scheme_port_and_path() {
        assert_eq!(host_of("wss://mesh.example.com:8080/v1/channel"), "mesh.example.com");
        assert_eq!(host_of("mesh.example.com"), "mesh.example.com");
    }

    #[test]
    fn dns_zone_emits_a_and_aaaa_records_per_peer() {
        let peers = vec![DnsPeerRecord {
            name: "alice.wirety".into(),
            ipv4: Some("10.0.0.2".parse().unwrap()),
            ipv6: Some("fd00::2".parse().unwrap()),
        }];
        let zone = dns_zone_from_peers(&peers);
        assert_eq!(zone.records.len(), 2);
    }
}
