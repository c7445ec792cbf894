//! The wirety control-plane server: owns the declarative network model,
//! compiles it into per-peer policy bundles, and distributes those bundles
//! to connected agents.
//!
//! Module shape mirrors the teacher's original `lib.rs` (one flat module
//! per concern, no deep nesting) generalized from a single-interface,
//! single-database server to one process managing many networks.

use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use hyper::{server::conn::AddrStream, service::{make_service_fn, service_fn}};

pub mod audit;
pub mod channel;
pub mod config;
pub mod enrollment;
mod error;
pub mod repo;
pub mod service;
#[cfg(test)]
mod test;
pub mod wire;
pub mod ws;

mod http;

pub use channel::DistributionChannel;
pub use config::{ConfigFile, ServerConfig};
pub use error::ServerError;
pub use repo::{Repositories, SqliteRepositories};
pub use service::NetworkService;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything one running server process needs: a repository, a
/// distribution channel and the service layered on top of them. One
/// `Application` per process; it may host many networks, since neither
/// `Repositories` nor `DistributionChannel` are scoped to a single one.
pub struct Application {
    pub repo: Arc<dyn Repositories>,
    pub channel: Arc<DistributionChannel>,
    pub service: Arc<NetworkService>,
    pub enrollment: Arc<enrollment::Enrollment>,
    pub admin_token: String,
}

impl Application {
    pub fn open(database_path: &Path, admin_token: String) -> Result<Self, ServerError> {
        let repo: Arc<dyn Repositories> = Arc::new(SqliteRepositories::open(database_path)?);
        Self::with_repo(repo, admin_token)
    }

    pub fn in_memory(admin_token: String) -> Result<Self, ServerError> {
        let repo: Arc<dyn Repositories> = Arc::new(SqliteRepositories::open_in_memory()?);
        Self::with_repo(repo, admin_token)
    }

    fn with_repo(repo: Arc<dyn Repositories>, admin_token: String) -> Result<Self, ServerError> {
        let channel = Arc::new(DistributionChannel::new());
        let service = Arc::new(NetworkService::new(repo.clone(), channel.clone()));
        let enrollment = Arc::new(enrollment::Enrollment::new(repo.clone(), channel.clone(), service.clone()));
        Ok(Self { repo, channel, service, enrollment, admin_token })
    }

    fn http_context(&self) -> http::Context {
        http::Context {
            repo: self.repo.clone(),
            service: self.service.clone(),
            admin_token: self.admin_token.clone(),
        }
    }
}

/// Periodically tears down agent sessions that have gone quiet, per §5's
/// "one session-staleness sweeper" task. Grounded in the teacher's
/// `spawn_expired_invite_sweeper`.
fn spawn_session_sweeper(channel: Arc<DistributionChannel>) {
    tokio::task::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;
            let (stale, torn_down) = channel.sweep_stale();
            if !stale.is_empty() {
                log::warn!("{} agent session(s) missed {} heartbeats", stale.len(), channel::STALE_AFTER_MISSED);
            }
            if !torn_down.is_empty() {
                log::info!("tore down {} stale agent session(s)", torn_down.len());
            }
        }
    });
}

/// Runs the admin HTTP API and the distribution channel's websocket-accept
/// listener side by side until either fails or the process is killed.
/// They're two separate listeners (`listen_addr` for the admin API,
/// `channel_addr` for agents dialing in) rather than one shared port — see
/// `ws::serve`'s module doc for why.
pub async fn serve(listen_addr: SocketAddr, channel_addr: SocketAddr, app: Application) -> Result<(), ServerError> {
    log::info!("wirety-server {} starting, admin api on {}, channel on {}", VERSION, listen_addr, channel_addr);

    spawn_session_sweeper(app.channel.clone());

    let context = app.http_context();
    let make_svc = make_service_fn(move |socket: &AddrStream| {
        let remote_addr = socket.remote_addr();
        let context = context.clone();
        async move {
            Ok::<_, hyper::http::Error>(service_fn(move |req| {
                http::hyper_service(req, context.clone(), remote_addr)
            }))
        }
    });

    let http_server = hyper::Server::bind(&listen_addr).serve(make_svc);
    let channel = ws::serve(channel_addr, app.enrollment.clone(), app.channel.clone());

    tokio::try_join!(async { http_server.await.map_err(ServerError::from) }, channel)?;
    Ok(())
}
