//! Agent-side reconciliation loop (C8): kernel subsystem adapters
//! (WireGuard, firewall, DNS, captive portal) plus the distribution
//! channel client that drives them from server-pushed policy bundles.
//!
//! This crate is the agent's counterpart to `wirety-server`: where the
//! server owns the declarative model, this crate owns nothing but the
//! local kernel state it's told to converge on.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use wireguard_control::{Backend, InterfaceName};
use wirety_core::wire::{Frame, Heartbeat, KernelStatus};

pub mod captive;
pub mod channel_client;
pub mod config;
pub mod dns;
pub mod error;
pub mod firewall;
pub mod reconcile;
pub mod wireguard;

use channel_client::ChannelTransport;
use config::ApplyMethod;
use error::AgentError;
use reconcile::Reconciler;

/// Agents send a heartbeat every N seconds (§4.4, default 30).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Where the agent's three supervised background services listen.
pub struct ListenAddrs {
    pub dns: SocketAddr,
    pub http: SocketAddr,
    pub https: SocketAddr,
}

/// Everything one running agent process needs, built once at startup and
/// driven by `run`. Mirrors `wirety-server::Application`'s role: the
/// place concrete implementations are wired together before the loop
/// starts.
pub struct Agent<T: ChannelTransport> {
    transport: T,
    reconciler: Reconciler,
    resolver: Arc<dns::Resolver>,
    gateway: Arc<captive::Gateway>,
    session_id: String,
}

impl<T: ChannelTransport> Agent<T> {
    pub fn new(
        transport: T,
        interface_name: InterfaceName,
        backend: Backend,
        apply_method: ApplyMethod,
        nat_interface: Option<String>,
        domain_suffix: String,
        server_url: &str,
    ) -> Self {
        let resolver = dns::Resolver::new(domain_suffix);
        let gateway = captive::Gateway::new(resolver.clone());
        let wg = wireguard::WireGuardReconciler::new(interface_name, backend);
        let reconciler = Reconciler::new(wg, nat_interface, apply_method, resolver.clone(), gateway.clone(), server_url);
        Self {
            transport,
            reconciler,
            resolver,
            gateway,
            session_id: wirety_core::id::generate("sess"),
        }
    }

    /// Spawns the captive-portal HTTP proxy, TLS-SNI gateway and DNS
    /// resolver as supervised background tasks (§4.5 step 5, `SPEC_FULL.md`'s
    /// `wirety-agent-core::captive`), then drives the channel read/write
    /// loop until the server closes the session or the process is told to
    /// stop.
    pub async fn run(mut self, listen: ListenAddrs) -> Result<(), AgentError> {
        spawn_supervised("dns resolver", dns::serve(self.resolver.clone(), listen.dns));
        spawn_supervised("captive http proxy", captive::serve_http(self.gateway.clone(), listen.http));
        spawn_supervised("tls-sni gateway", captive::serve_tls_sni(self.gateway.clone(), listen.https));

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await; // first tick fires immediately; consume it so the first real beat is after one interval

        loop {
            tokio::select! {
                frame = self.transport.read_frame() => {
                    match frame? {
                        None => {
                            log::info!("distribution channel closed by peer");
                            return Ok(());
                        },
                        Some(Frame::PolicyPush(push)) => {
                            log::info!("applying policy bundle {}", push.bundle_id);
                            let ack = self.reconciler.apply(&push);
                            if !ack.ok {
                                log::warn!("policy bundle {} applied with errors: {:?}", ack.bundle_id, ack.errors);
                            }
                            self.transport.write_frame(&Frame::StatusAck(ack)).await?;
                        },
                        Some(Frame::WhitelistUpdate(update)) => {
                            self.gateway.apply_whitelist_update(&update);
                        },
                        Some(Frame::Close(close)) => {
                            log::warn!("server closed the channel: {:?} ({:?})", close.reason, close.detail);
                            return Ok(());
                        },
                        Some(_) => {},
                    }
                },
                _ = heartbeat.tick() => {
                    self.transport.write_frame(&Frame::Heartbeat(self.heartbeat_frame())).await?;
                },
            }
        }
    }

    fn heartbeat_frame(&self) -> Heartbeat {
        Heartbeat {
            session_id: self.session_id.clone(),
            timestamp: unix_timestamp(),
            reported_endpoint: None,
            kernel_status: KernelStatus { wg: true, firewall: true, dns: true },
        }
    }
}

fn unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn spawn_supervised(name: &'static str, fut: impl std::future::Future<Output = Result<(), AgentError>> + Send + 'static) {
    tokio::task::spawn(async move {
        if let Err(e) = fut.await {
            log::error!("{name} task exited: {e}");
        }
    });
}
