//! Agent CLI: enrolls a host into a wirety mesh over the distribution
//! channel, then drives `wirety_agent_core::Agent`'s reconciliation loop
//! until the server closes the session. Grounded in the teacher's
//! `client/src/main.rs` derive-based `Opts` shape, reduced to the
//! single long-running-daemon flow §6 describes (no enroll/uninstall
//! subcommands, since the enrollment token is presented on every connect).

use std::{env, net::SocketAddr, path::PathBuf, process::ExitCode};

use clap::Parser;
use wireguard_control::{Backend, InterfaceName};
use wirety_agent_core::{channel_client::WsChannelClient, config::ApplyMethod, Agent, ListenAddrs};

#[derive(Debug, Parser)]
#[clap(name = "wirety-agent", author, version, about)]
struct Opts {
    /// Distribution-channel URL, e.g. wss://mesh.example.com:8080/v1/channel
    #[clap(long)]
    server_url: String,

    #[clap(long)]
    enrollment_token: String,

    #[clap(long, default_value = "/etc/wirety-agent/config.toml")]
    config_path: PathBuf,

    #[clap(long, default_value = "wirety0")]
    interface_name: String,

    #[clap(long, default_value = "recreate")]
    apply_method: ApplyMethod,

    /// Captive-portal HTTP proxy listen port.
    #[clap(long, default_value_t = 8080)]
    http_port: u16,

    /// Captive-portal TLS-SNI gateway listen port.
    #[clap(long, default_value_t = 8443)]
    https_port: u16,

    /// Egress interface MASQUERADEd traffic is sent out on.
    #[clap(long)]
    nat_interface: Option<String>,

    #[clap(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let opts = Opts::parse();
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", format!("warn,wirety_agent={0},wirety_agent_core={0}", opts.log_level));
    }
    pretty_env_logger::init();

    match run(opts).await {
        Ok(()) => {
            log::info!("wirety-agent shut down cleanly");
            ExitCode::SUCCESS
        },
        Err(e) => {
            log::error!("fatal enrollment failure: {e}");
            ExitCode::FAILURE
        },
    }
}

async fn run(opts: Opts) -> anyhow::Result<()> {
    let interface_name: InterfaceName = opts
        .interface_name
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid interface name {}: {e}", opts.interface_name))?;

    let config = wirety_agent_core::config::ConfigFile {
        server_url: opts.server_url.clone(),
        interface_name: opts.interface_name.clone(),
        apply_method: opts.apply_method,
        nat_interface: opts.nat_interface.clone(),
    };
    if let Some(parent) = opts.config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    config.write_to_path(&opts.config_path)?;

    let transport = WsChannelClient::connect(&opts.server_url, &opts.enrollment_token)
        .await
        .map_err(|e| anyhow::anyhow!("enrollment failed: {e}"))?;
    log::info!("enrolled with {}", opts.server_url);

    let agent = Agent::new(
        transport,
        interface_name,
        Backend::default(),
        opts.apply_method,
        opts.nat_interface.clone(),
        default_domain_suffix(&opts.server_url),
        &opts.server_url,
    );

    let listen = ListenAddrs {
        dns: SocketAddr::from(([0, 0, 0, 0], 53)),
        http: SocketAddr::from(([0, 0, 0, 0], opts.http_port)),
        https: SocketAddr::from(([0, 0, 0, 0], opts.https_port)),
    };

    agent.run(listen).await.map_err(|e| anyhow::anyhow!(e.to_string()))?;
    Ok(())
}

fn default_domain_suffix(server_url: &str) -> String {
    let without_scheme = server_url.split("://").last().unwrap_or(server_url);
    let host = without_scheme.split('/').next().unwrap_or(without_scheme);
    let host = host.split(':').next().unwrap_or(host);
    format!("{host}.wirety")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_domain_suffix_strips_scheme_port_and_path() {
        assert_eq!(default_domain_suffix("wss://mesh.example.com:8443/v1/channel"), "mesh.example.com.wirety");
        assert_eq!(default_domain_suffix("mesh.example.com"), "mesh.example.com.wirety");
    }
}
