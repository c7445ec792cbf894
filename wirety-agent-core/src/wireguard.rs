//! WireGuard interface reconciliation (§4.5 step 1): parses the compiler's
//! rendered `wg_config` text, writes it to the managed config file under
//! the marker convention (§6), and applies it to the kernel via
//! `wireguard-control` using one of the two apply strategies.
//!
//! Grounded in the teacher's `client-core/src/interface.rs`/`wg.rs`: same
//! `DeviceUpdate`/`PeerConfigBuilder` calls, generalized from "diff against
//! a server peer list" to "apply a fully-rendered config the compiler
//! already decided the content of".

use std::{
    fs,
    io::Write as _,
    net::SocketAddr,
    path::Path,
};

use ipnet::IpNet;
use wireguard_control::{AllowedIp, Backend, Device, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder};

use wirety_core::compiler::WG_CONFIG_MARKER;

use crate::{config::ApplyMethod, error::AgentError};

#[derive(Debug, Clone)]
pub struct ParsedPeer {
    pub public_key: Key,
    pub preshared_key: Option<Key>,
    pub allowed_ips: Vec<AllowedIp>,
    pub endpoint: Option<SocketAddr>,
    pub persistent_keepalive: Option<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedInterface {
    pub private_key: Option<Key>,
    pub addresses: Vec<IpNet>,
    pub listen_port: Option<u16>,
    pub peers: Vec<ParsedPeer>,
}

/// Parses the `[Interface]`/`[Peer]` sections the compiler emits
/// (`wirety_core::compiler::render_wg_config`'s format). Deliberately
/// narrow: it only understands the keys the compiler ever writes.
pub fn parse(wg_config: &str) -> Result<ParsedInterface, AgentError> {
    let mut out = ParsedInterface::default();
    let mut current_peer: Option<ParsedPeer> = None;
    let mut in_interface = false;

    for line in wg_config.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.eq_ignore_ascii_case("[Interface]") {
            in_interface = true;
            flush_peer(&mut out, &mut current_peer);
            continue;
        }
        if line.eq_ignore_ascii_case("[Peer]") {
            in_interface = false;
            flush_peer(&mut out, &mut current_peer);
            current_peer = Some(ParsedPeer {
                public_key: Key::zero(),
                preshared_key: None,
                allowed_ips: Vec::new(),
                endpoint: None,
                persistent_keepalive: None,
            });
            continue;
        }

        let Some((key, value)) = line.split_once('=') else { continue };
        let key = key.trim();
        let value = value.trim();

        if in_interface {
            match key {
                "PrivateKey" => {
                    out.private_key = Some(
                        Key::from_base64(value)
                            .map_err(|_| AgentError::Protocol("invalid PrivateKey in wg_config".into()))?,
                    );
                },
                "Address" => {
                    for addr in value.split(',') {
                        let addr = addr.trim();
                        if addr.is_empty() {
                            continue;
                        }
                        out.addresses.push(
                            addr.parse()
                                .map_err(|_| AgentError::Protocol(format!("invalid Address {addr} in wg_config")))?,
                        );
                    }
                },
                "ListenPort" => {
                    out.listen_port = Some(
                        value
                            .parse()
                            .map_err(|_| AgentError::Protocol("invalid ListenPort in wg_config".into()))?,
                    );
                },
                _ => {},
            }
        } else if let Some(peer) = current_peer.as_mut() {
            match key {
                "PublicKey" => {
                    peer.public_key = Key::from_base64(value)
                        .map_err(|_| AgentError::Protocol("invalid PublicKey in wg_config".into()))?;
                },
                "PresharedKey" => {
                    peer.preshared_key = Some(
                        Key::from_base64(value)
                            .map_err(|_| AgentError::Protocol("invalid PresharedKey in wg_config".into()))?,
                    );
                },
                "AllowedIPs" => {
                    for entry in value.split(',') {
                        let entry = entry.trim();
                        if entry.is_empty() {
                            continue;
                        }
                        peer.allowed_ips.push(
                            entry
                                .parse()
                                .map_err(|_| AgentError::Protocol(format!("invalid AllowedIPs entry {entry}")))?,
                        );
                    }
                },
                "Endpoint" => {
                    peer.endpoint = Some(
                        value
                            .parse()
                            .map_err(|_| AgentError::Protocol(format!("invalid Endpoint {value} in wg_config")))?,
                    );
                },
                "PersistentKeepalive" => {
                    peer.persistent_keepalive = Some(
                        value
                            .parse()
                            .map_err(|_| AgentError::Protocol("invalid PersistentKeepalive in wg_config".into()))?,
                    );
                },
                _ => {},
            }
        }
    }
    flush_peer(&mut out, &mut current_peer);

    Ok(out)
}

fn flush_peer(out: &mut ParsedInterface, current: &mut Option<ParsedPeer>) {
    if let Some(peer) = current.take() {
        out.peers.push(peer);
    }
}

/// Writes `wg_config` atomically, refusing to overwrite a file that
/// exists but lacks the managed-file marker (§6).
pub fn write_managed_config(path: &Path, wg_config: &str) -> Result<(), AgentError> {
    if !wg_config.starts_with(WG_CONFIG_MARKER) {
        return Err(AgentError::Protocol("wg_config is missing the managed-file marker".into()));
    }
    if let Ok(existing) = fs::read_to_string(path) {
        if !existing.starts_with(WG_CONFIG_MARKER) {
            return Err(AgentError::Fatal(format!(
                "refusing to overwrite unmanaged WireGuard config at {}",
                path.display()
            )));
        }
    }

    let tmp_path = path.with_extension("conf.tmp");
    {
        let mut tmp = fs::File::create(&tmp_path).map_err(AgentError::Kernel)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.set_permissions(fs::Permissions::from_mode(0o600)).map_err(AgentError::Kernel)?;
        }
        tmp.write_all(wg_config.as_bytes()).map_err(AgentError::Kernel)?;
    }
    fs::rename(&tmp_path, path).map_err(AgentError::Kernel)?;
    Ok(())
}

pub struct WireGuardReconciler {
    pub interface_name: InterfaceName,
    pub backend: Backend,
}

impl WireGuardReconciler {
    pub fn new(interface_name: InterfaceName, backend: Backend) -> Self {
        Self { interface_name, backend }
    }

    fn device_exists(&self) -> Result<bool, AgentError> {
        Ok(Device::list(self.backend)
            .map_err(AgentError::Kernel)?
            .iter()
            .any(|name| name == &self.interface_name))
    }

    /// Applies `parsed` to the kernel using `method`, falling back to
    /// *recreate* when the interface does not yet exist (§4.5 step 1:
    /// "used when the interface is absent"). Returns the method actually
    /// used.
    pub fn apply(&self, parsed: &ParsedInterface, method: ApplyMethod) -> Result<ApplyMethod, AgentError> {
        let exists = self.device_exists()?;
        let effective = if exists { method } else { ApplyMethod::Recreate };

        let mut update = DeviceUpdate::new().replace_peers();
        if let Some(private_key) = &parsed.private_key {
            update = update.set_private_key(private_key.clone());
        }
        if let Some(listen_port) = parsed.listen_port {
            update = update.set_listen_port(listen_port);
        }
        for peer in &parsed.peers {
            let mut builder = PeerConfigBuilder::new(&peer.public_key).replace_allowed_ips();
            if let Some(psk) = &peer.preshared_key {
                builder = builder.set_preshared_key(psk.clone());
            }
            if let Some(endpoint) = peer.endpoint {
                builder = builder.set_endpoint(endpoint);
            }
            if let Some(keepalive) = peer.persistent_keepalive {
                builder = builder.set_persistent_keepalive_interval(keepalive);
            }
            builder = builder.add_allowed_ips(&peer.allowed_ips);
            update = update.add_peer(builder);
        }

        if matches!(effective, ApplyMethod::Recreate) && exists {
            Device::get(&self.interface_name, self.backend)
                .map_err(AgentError::Kernel)?
                .delete()
                .map_err(AgentError::Kernel)?;
        }

        update.apply(&self.interface_name, self.backend).map_err(AgentError::Kernel)?;

        if matches!(effective, ApplyMethod::Recreate) {
            self.configure_link(parsed)?;
        }

        Ok(effective)
    }

    /// Address assignment, link-up and kernel forwarding are not part of
    /// the WireGuard netlink family `wireguard-control` speaks; mirrors
    /// the corpus's pattern of shelling out to `ip` for those (distinct
    /// from the `iptables`/`ip6tables` shelling the firewall adapter does).
    #[cfg(target_os = "linux")]
    fn configure_link(&self, parsed: &ParsedInterface) -> Result<(), AgentError> {
        let iface = self.interface_name.as_str_lossy();
        for addr in &parsed.addresses {
            run("ip", &["address", "replace", &addr.to_string(), "dev", &iface])?;
        }
        run("ip", &["link", "set", "up", "dev", &iface])
    }

    #[cfg(not(target_os = "linux"))]
    fn configure_link(&self, _parsed: &ParsedInterface) -> Result<(), AgentError> {
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn run(bin: &str, args: &[&str]) -> Result<(), AgentError> {
    let output = std::process::Command::new(bin).args(args).output().map_err(AgentError::Kernel)?;
    if output.status.success() {
        Ok(())
    } else {
        Err(AgentError::Firewall(format!(
            "{bin} {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}

/// Enables IPv4 (and, for dual-stack bundles, IPv6) forwarding, per §4.5
/// step 3. Idempotent: writing the same value twice is a no-op at the
/// kernel level.
#[cfg(target_os = "linux")]
pub fn enable_forwarding(enable_ipv6: bool) -> Result<(), AgentError> {
    fs::write("/proc/sys/net/ipv4/ip_forward", b"1\n").map_err(AgentError::Kernel)?;
    if enable_ipv6 {
        fs::write("/proc/sys/net/ipv6/conf/all/forwarding", b"1\n").map_err(AgentError::Kernel)?;
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn enable_forwarding(_enable_ipv6: bool) -> Result<(), AgentError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "# Managed by wirety. Do not edit by hand.\n[Interface]\nPrivateKey = AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=\nAddress = 10.80.0.1/32\nListenPort = 51820\n\n[Peer]\nPublicKey = BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB=\nAllowedIPs = 10.80.0.2/32\nEndpoint = 1.2.3.4:51820\nPersistentKeepalive = 25\n";

    #[test]
    fn parses_interface_and_peer_sections() {
        let parsed = parse(SAMPLE).unwrap();
        assert!(parsed.private_key.is_some());
        assert_eq!(parsed.listen_port, Some(51820));
        assert_eq!(parsed.addresses.len(), 1);
        assert_eq!(parsed.peers.len(), 1);
        assert_eq!(parsed.peers[0].allowed_ips.len(), 1);
        assert_eq!(parsed.peers[0].persistent_keepalive, Some(25));
        assert!(parsed.peers[0].endpoint.is_some());
    }

    #[test]
    fn rejects_config_missing_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wirety0.conf");
        let err = write_managed_config(&path, "[Interface]\nPrivateKey = x\n").unwrap_err();
        assert!(matches!(err, AgentError::Protocol(_)));
    }

    #[test]
    fn refuses_to_overwrite_unmanaged_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wirety0.conf");
        fs::write(&path, "# hand-edited, no marker\n[Interface]\n").unwrap();

        let err = write_managed_config(&path, SAMPLE).unwrap_err();
        assert!(matches!(err, AgentError::Fatal(_)));
    }

    #[test]
    fn overwrites_a_previously_managed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wirety0.conf");
        write_managed_config(&path, SAMPLE).unwrap();
        write_managed_config(&path, SAMPLE).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), SAMPLE);
    }
}
