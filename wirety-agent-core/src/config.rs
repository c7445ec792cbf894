//! Agent-side configuration: the on-disk `InterfaceConfig`-equivalent plus
//! the `--apply-method` sum type named by the REDESIGN FLAGS
//! (`{apply_method} = {apply_bundle}`). Grounded in
//! `wirety-server::config::ConfigFile` for the toml round-trip shape.

use std::{
    fs::File,
    io::Write as _,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// Which strategy the reconciler uses to bring the kernel WireGuard
/// interface in line with a new `wg_config` (§4.5 step 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyMethod {
    /// Bring the interface down and back up. Simple, drops connections;
    /// used when the interface is absent.
    Recreate,
    /// Pipe the stripped config into the kernel's live-sync operation
    /// without bringing the interface down; used on subsequent applies.
    Sync,
}

impl std::str::FromStr for ApplyMethod {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recreate" => Ok(ApplyMethod::Recreate),
            "sync" => Ok(ApplyMethod::Sync),
            other => Err(AgentError::Protocol(format!("unknown apply method: {other}"))),
        }
    }
}

impl std::fmt::Display for ApplyMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ApplyMethod::Recreate => "recreate",
            ApplyMethod::Sync => "sync",
        })
    }
}

impl Default for ApplyMethod {
    /// The interface is absent on first run, so recreate is the only
    /// strategy that can possibly apply; `Reconciler::apply_method_for`
    /// upgrades to the configured method once the interface exists.
    fn default() -> Self {
        ApplyMethod::Recreate
    }
}

/// Credentials and endpoints persisted across restarts, written once on
/// successful enrollment (§4.7) and read back on every subsequent start.
/// No session credentials are persisted here (§6: "session credentials
/// held in memory").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigFile {
    pub server_url: String,
    pub interface_name: String,
    pub apply_method: ApplyMethod,
    #[serde(default)]
    pub nat_interface: Option<String>,
}

impl ConfigFile {
    pub fn write_to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), AgentError> {
        let path = path.as_ref();
        let mut file = File::create(path).map_err(AgentError::Kernel)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600)).map_err(AgentError::Kernel)?;
        }
        let rendered = toml::to_string(self).expect("ConfigFile always serializes");
        file.write_all(rendered.as_bytes()).map_err(AgentError::Kernel)?;
        Ok(())
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, AgentError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(AgentError::Kernel)?;
        toml::from_str(&contents)
            .map_err(|e| AgentError::Protocol(format!("malformed config at {}: {e}", path.display())))
    }
}

/// Directory layout: one managed WireGuard config per interface, matching
/// §6's "one WireGuard config file per managed interface under
/// `/etc/wireguard/<iface>.conf`".
pub fn wireguard_config_path(interface_name: &str) -> PathBuf {
    PathBuf::from("/etc/wireguard").join(interface_name).with_extension("conf")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wirety-agent.toml");
        let config = ConfigFile {
            server_url: "https://mesh.example.com:8080".into(),
            interface_name: "wirety0".into(),
            apply_method: ApplyMethod::Sync,
            nat_interface: Some("eth0".into()),
        };
        config.write_to_path(&path).unwrap();

        let loaded = ConfigFile::from_file(&path).unwrap();
        assert_eq!(loaded.server_url, config.server_url);
        assert_eq!(loaded.apply_method, ApplyMethod::Sync);
        assert_eq!(loaded.nat_interface.as_deref(), Some("eth0"));
    }

    #[test]
    fn apply_method_parses_and_displays() {
        assert_eq!("recreate".parse::<ApplyMethod>().unwrap(), ApplyMethod::Recreate);
        assert_eq!("sync".parse::<ApplyMethod>().unwrap(), ApplyMethod::Sync);
        assert!("garbage".parse::<ApplyMethod>().is_err());
        assert_eq!(ApplyMethod::Sync.to_string(), "sync");
    }
}
