use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{error::Error, types::PeerId};

/// 2MB maximum message size, bigger length prefixes close the connection.
pub const MAX_MESSAGE_SIZE: u32 = 2 * 1024 * 1024;

/// Seconds between keep-alives sent by the session.
pub const KEEP_ALIVE_INTERVAL: u64 = 55;

/// Configuration of a connection, every key is optional in the TOML file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Our peer id, taken byte by byte. Must have exactly 20 characters, a
    /// random one is generated when absent.
    pub local_peer_id: Option<String>,

    /// If the local side speaks the extension protocol (BEP 10).
    pub extension_protocol: bool,

    /// If the local side advertises DHT support.
    pub dht: bool,

    pub max_message_size: u32,

    /// In seconds.
    pub keep_alive_interval: u64,

    /// Advertised in our extension handshake.
    pub reqq: Option<u16>,

    /// Advertised in our extension handshake.
    pub client_version: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_peer_id: None,
            extension_protocol: true,
            dht: false,
            max_message_size: MAX_MESSAGE_SIZE,
            keep_alive_interval: KEEP_ALIVE_INTERVAL,
            reqq: None,
            client_version: None,
        }
    }
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self, Error> {
        Ok(toml::from_str::<Config>(s)?)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Error> {
        let s = fs::read_to_string(path)?;
        Self::from_toml(&s)
    }

    /// Path of `config.toml` inside the user's config folder.
    ///
    /// # Errors
    ///
    /// Fails if the user does not have a home folder.
    pub fn config_path() -> Result<PathBuf, Error> {
        let dotfile =
            ProjectDirs::from("", "", "Vincenzo").ok_or(Error::HomeInvalid)?;
        let mut config_path = dotfile.config_dir().to_path_buf();
        config_path.push("config.toml");
        Ok(config_path)
    }

    /// Load the configuration file from the user's config folder. If the
    /// file does not exist, the default configuration is used.
    pub fn load() -> Result<Self, Error> {
        let path = Self::config_path()?;

        if !path.exists() {
            debug!("no config file at {path:?}, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(path)
    }

    /// The configured peer id, or a freshly generated one if it is absent
    /// or does not have 20 bytes.
    pub fn peer_id(&self) -> PeerId {
        self.local_peer_id
            .as_deref()
            .and_then(|id| PeerId::try_from(id).ok())
            .unwrap_or_else(PeerId::generate)
    }

    /// Never shorter than a second, a zero period can't drive a timer.
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval.max(1))
    }
}
