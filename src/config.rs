//! Configuration files
//!
//! One YAML document holds a `server:` mapping, a `client:` mapping, and the
//! relay's top-level `forwards:` list; each binary reads only its part. Users
//! live in a separate YAML file on the server.

use crate::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

/// Server-side settings (`server:` mapping)
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Hostname used in the SMTP greeting
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// TLS certificate chain, PEM
    #[serde(default = "default_cert_file")]
    pub cert_file: String,
    /// TLS private key, PEM
    #[serde(default = "default_key_file")]
    pub key_file: String,
    /// Users file path
    #[serde(default = "default_users_file")]
    pub users_file: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            hostname: default_hostname(),
            cert_file: default_cert_file(),
            key_file: default_key_file(),
            users_file: default_users_file(),
        }
    }
}

/// Relay-side settings (`client:` mapping)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// SMTP host to dial
    pub server_host: String,
    /// SMTP submission port
    pub server_port: u16,
    /// Account name
    pub username: String,
    /// Shared secret
    pub secret: String,
    /// SNI/verification override; defaults to the dialed host
    pub tls_server_name: Option<String>,
    /// CA bundle; when unset, certificate verification is disabled
    pub ca_cert: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server_host: default_server_host(),
            server_port: default_port(),
            username: String::new(),
            secret: String::new(),
            tls_server_name: None,
            ca_cert: None,
        }
    }
}

impl RelayConfig {
    /// Required fields must be present before the supervisor starts
    pub fn validate(&self) -> Result<()> {
        if self.username.is_empty() || self.secret.is_empty() {
            return Err(Error::Config(
                "client.username and client.secret are required".into(),
            ));
        }
        Ok(())
    }
}

/// One local listener bound to a remote target
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardEntry {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_server_host")]
    pub target_host: String,
    #[serde(default = "default_forward_port")]
    pub target_port: u16,
}

/// Parsed forward rule
#[derive(Debug, Clone)]
pub struct ForwardRule {
    pub listen_host: String,
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
}

impl ForwardRule {
    fn parse(entry: &ForwardEntry) -> Result<Self> {
        let (host, port) = entry
            .listen
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("forward listen '{}' needs host:port", entry.listen)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::Config(format!("forward listen '{}' has a bad port", entry.listen)))?;
        Ok(Self {
            listen_host: host.to_string(),
            listen_port: port,
            target_host: entry.target_host.clone(),
            target_port: entry.target_port,
        })
    }
}

/// Whole configuration file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub client: RelayConfig,
    pub forwards: Vec<ForwardEntry>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        serde_yaml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.as_ref().display())))
    }

    /// Forward rules with their listen strings split and checked
    pub fn forward_rules(&self) -> Result<Vec<ForwardRule>> {
        self.forwards.iter().map(ForwardRule::parse).collect()
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| Error::Config(format!("bad server address {}:{}", self.host, self.port)))
    }
}

/// A user record, immutable after load
#[derive(Debug, Clone)]
pub struct User {
    pub secret: String,
    /// When false, the server demotes this session's activity lines to debug
    pub logging: bool,
}

/// Users-file entry: either a bare secret or a mapping
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UserEntry {
    Plain(String),
    Full {
        #[serde(default)]
        secret: String,
        #[serde(default = "default_true")]
        logging: bool,
    },
}

#[derive(Debug, Default, Deserialize)]
struct UsersFile {
    #[serde(default)]
    users: HashMap<String, UserEntry>,
}

/// Load the users table; a missing file is an empty table.
pub fn load_users<P: AsRef<Path>>(path: P) -> Result<HashMap<String, User>> {
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => {
            return Err(Error::Config(format!(
                "cannot read {}: {e}",
                path.as_ref().display()
            )))
        }
    };
    let file: UsersFile = serde_yaml::from_str(&content)
        .map_err(|e| Error::Config(format!("{}: {e}", path.as_ref().display())))?;

    Ok(file
        .users
        .into_iter()
        .map(|(name, entry)| {
            let user = match entry {
                UserEntry::Plain(secret) => User {
                    secret,
                    logging: true,
                },
                UserEntry::Full { secret, logging } => User { secret, logging },
            };
            (name, user)
        })
        .collect())
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_server_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    587
}
fn default_forward_port() -> u16 {
    8080
}
fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_hostname() -> String {
    "mail.example.com".to_string()
}
fn default_cert_file() -> String {
    "server.crt".to_string()
}
fn default_key_file() -> String {
    "server.key".to_string()
}
fn default_users_file() -> String {
    "users.yaml".to_string()
}
fn default_true() -> bool {
    true
}
