use std::{env, net::SocketAddr, path::PathBuf};

use clap::{Parser, Subcommand};
use wirety_core::model::{IpStackMode, Network};
use wirety_server::{config::ServerConfig, Application, ConfigFile};

#[derive(Debug, Parser)]
#[clap(name = "wirety-server", author, version, about)]
struct Opts {
    #[clap(subcommand)]
    command: Command,

    #[clap(short, long, default_value = "/etc/wirety-server")]
    config_dir: PathBuf,

    #[clap(short, long, default_value = "/var/lib/wirety-server")]
    data_dir: PathBuf,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a new network and its database.
    New {
        name: String,
        /// IPv4 CIDR the network allocates peer addresses from.
        ipv4_cidr: ipnet::IpNet,
        /// Optional IPv6 CIDR for dual-stack networks.
        #[clap(long)]
        ipv6_cidr: Option<ipnet::IpNet>,
        #[clap(long, default_value = "51820")]
        listen_port: u16,
        /// Port the distribution channel's websocket-accept listener records
        /// in the network's config file.
        #[clap(long, default_value = "8443")]
        channel_port: u16,
    },

    /// Serve the control plane for an existing network.
    Serve {
        name: String,
        #[clap(long, default_value = "0.0.0.0")]
        listen_addr: std::net::IpAddr,
        /// Admin HTTP API port.
        #[clap(long, default_value = "8080")]
        http_port: u16,
        /// Distribution channel websocket-accept port agents dial.
        #[clap(long, default_value = "8443")]
        channel_port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", "warn,wirety_server=info");
    }
    pretty_env_logger::init();

    let opts = Opts::parse();
    let conf = ServerConfig::new(opts.config_dir, opts.data_dir);
    std::fs::create_dir_all(&conf.config_dir)?;
    std::fs::create_dir_all(&conf.data_dir)?;

    match opts.command {
        Command::New { name, ipv4_cidr, ipv6_cidr, listen_port, channel_port } => {
            new_network(&conf, name, ipv4_cidr, ipv6_cidr, listen_port, channel_port)?
        },
        Command::Serve { name, listen_addr, http_port, channel_port } => {
            serve(&conf, name, listen_addr, http_port, channel_port).await?
        },
    }

    Ok(())
}

fn new_network(
    conf: &ServerConfig,
    name: String,
    ipv4_cidr: ipnet::IpNet,
    ipv6_cidr: Option<ipnet::IpNet>,
    listen_port: u16,
    channel_port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    let database_path = conf.database_path(&name);
    let app = Application::open(&database_path, wirety_core::id::generate("admin"))?;

    let network = Network {
        id: wirety_core::id::NetworkId::generate(),
        name: name.clone(),
        ipv4_cidr,
        ipv6_cidr,
        ip_stack_mode: if ipv6_cidr.is_some() { IpStackMode::Dual } else { IpStackMode::Ipv4 },
        domain_suffix: Network::default_domain_suffix(),
        default_group_ids: Vec::new(),
        dns_upstreams: Vec::new(),
    };
    app.service.create_network(network)?;

    let config = ConfigFile {
        listen_addr: "0.0.0.0".parse()?,
        listen_port,
        channel_port: Some(channel_port),
    };
    config.write_to_path(conf.config_path(&name))?;

    println!("network {name} created at {}", database_path.display());
    Ok(())
}

async fn serve(
    conf: &ServerConfig,
    name: String,
    listen_addr: std::net::IpAddr,
    http_port: u16,
    channel_port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    let database_path = conf.database_path(&name);
    let admin_token = env::var("WIRETY_ADMIN_TOKEN").unwrap_or_else(|_| wirety_core::id::generate("admin"));
    if env::var("WIRETY_ADMIN_TOKEN").is_err() {
        log::warn!("WIRETY_ADMIN_TOKEN not set; generated ephemeral token {admin_token}");
    }

    let app = Application::open(&database_path, admin_token)?;
    wirety_server::serve(SocketAddr::new(listen_addr, http_port), SocketAddr::new(listen_addr, channel_port), app).await?;
    Ok(())
}
