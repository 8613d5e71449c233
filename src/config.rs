use std::{
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "./config.toml";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ListenSettings {
    /// Address the proxy binds to when no socket is passed by systemd.
    pub address: SocketAddr,
    /// The TLS key material to present server facing TLS certificates
    pub tls_privkey: Option<PathBuf>,
    pub tls_chain: Option<PathBuf>,
}

impl Default for ListenSettings {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            tls_privkey: None,
            tls_chain: None,
        }
    }
}

/// All timeouts are expressed in seconds. Zero disables the timeout.
#[serde_with::serde_as]
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TimeoutSettings {
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub dest_dial: Duration,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub dest_read: Duration,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub dest_write: Duration,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub client_read: Duration,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub client_write: Duration,
    /// Time allowed for a client to send a complete request header section.
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub server_read_header: Duration,
    /// How long shutdown waits for in-flight connections and tunnels.
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub shutdown_grace: Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            dest_dial: Duration::from_secs(10),
            dest_read: Duration::from_secs(5),
            dest_write: Duration::from_secs(5),
            client_read: Duration::from_secs(5),
            client_write: Duration::from_secs(5),
            server_read_header: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Settings {
    /// Requests whose host contains this string are refused. Empty allows all.
    pub avoid: String,
    /// Log at debug level instead of error level when `RUST_LOG` is unset.
    pub verbose: bool,
    /// Settings for the socket clients connect to.
    pub listener: ListenSettings,
    pub timeouts: TimeoutSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            avoid: String::new(),
            verbose: true,
            listener: ListenSettings::default(),
            timeouts: TimeoutSettings::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

impl Settings {
    /// Resolved values the request dispatcher runs with.
    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            avoid: self.avoid.clone(),
            dest_dial_timeout: self.timeouts.dest_dial,
            dest_read_timeout: self.timeouts.dest_read,
            dest_write_timeout: self.timeouts.dest_write,
            client_read_timeout: self.timeouts.client_read,
            client_write_timeout: self.timeouts.client_write,
        }
    }
}

/// Immutable configuration of the dispatch and tunneling engine.
///
/// A zero duration disables the matching timeout or deadline.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub avoid: String,
    pub dest_dial_timeout: Duration,
    pub dest_read_timeout: Duration,
    pub dest_write_timeout: Duration,
    pub client_read_timeout: Duration,
    pub client_write_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Settings::default().proxy_config()
    }
}

pub fn parse(contents: &str) -> Result<Settings, ConfigError> {
    Ok(toml::from_str(contents)?)
}

pub fn load(path: &Path) -> Result<Settings, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    parse(&contents)
}

/// Like [`load`], but a missing file yields the default settings.
pub fn load_or_default(path: &Path) -> Result<Settings, ConfigError> {
    match load(path) {
        Err(ConfigError::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
            Ok(Settings::default())
        }
        other => other,
    }
}
