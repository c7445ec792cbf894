//! On-disk server configuration (toml), grounded in the teacher's
//! `ConfigFile`/`ServerConfig` pair in the original `lib.rs`: one small
//! struct for the process-wide settings that must survive a restart, kept
//! separate from `ServerConfig`'s directory bookkeeping.

use std::{
    fs::File,
    io::Write as _,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::ServerError;

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigFile {
    pub listen_addr: std::net::IpAddr,
    pub listen_port: u16,
    #[serde(default)]
    pub channel_port: Option<u16>,
}

impl ConfigFile {
    pub fn write_to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), ServerError> {
        let path = path.as_ref();
        let mut file = File::create(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(toml::to_string(self).expect("ConfigFile always serializes").as_bytes())?;
        Ok(())
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ServerError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| ServerError::InvalidQuery(format!("malformed config at {}: {e}", path.display())))
    }
}

/// Directory layout: one SQLite database and one config file per network,
/// named after the network's interface. Mirrors the teacher's per-interface
/// `database_path`/`config_path` helpers on `ServerConfig`.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl ServerConfig {
    pub fn new(config_dir: PathBuf, data_dir: PathBuf) -> Self {
        Self { config_dir, data_dir }
    }

    pub fn database_path(&self, network_name: &str) -> PathBuf {
        self.data_dir.join(network_name).with_extension("db")
    }

    pub fn config_path(&self, network_name: &str) -> PathBuf {
        self.config_dir.join(network_name).with_extension("toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wirety0.toml");
        let config = ConfigFile {
            listen_addr: "0.0.0.0".parse().unwrap(),
            listen_port: 51820,
            channel_port: Some(8080),
        };
        config.write_to_path(&path).unwrap();

        let loaded = ConfigFile::from_file(&path).unwrap();
        assert_eq!(loaded.listen_port, 51820);
        assert_eq!(loaded.channel_port, Some(8080));
    }
}
