use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{Error, Result};

/// Process role selected by `run_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Client,
    Server,
    Nat,
    Forward,
}

/// Routing policy for a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    #[default]
    Proxy,
    Bypass,
    Block,
}

/// The JSON configuration document. Unknown keys are ignored; defaults
/// match the original deployment format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub run_type: RunType,
    #[serde(default = "default_local_host")]
    pub local_host: String,
    pub local_port: u16,
    #[serde(default)]
    pub remote_host: String,
    #[serde(default)]
    pub remote_port: u16,
    /// Fixed destination for forward mode.
    #[serde(default)]
    pub target_host: String,
    #[serde(default)]
    pub target_port: u16,
    #[serde(default)]
    pub passwords: Vec<String>,
    /// 0 = debug, 1 = info, 2 = warn, 3 = error, 4 = silent.
    #[serde(default = "default_log_level")]
    pub log_level: u8,
    /// Idle timeout in seconds for UDP relays.
    #[serde(default = "default_udp_timeout")]
    pub udp_timeout: u64,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub mux: MuxConfig,
    #[serde(default)]
    pub mysql: MysqlConfig,
    #[serde(default)]
    pub router: RouterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub cert: String,
    pub key: String,
    pub key_password: String,
    pub sni: String,
    pub verify: bool,
    pub verify_hostname: bool,
    pub session_ticket: bool,
    /// Colon-separated TLS 1.2 suite names; empty = library default.
    pub cipher: String,
    /// Colon-separated TLS 1.3 suite names; empty = library default.
    pub cipher_tls13: String,
    /// Decoy port on `remote_host` for unauthenticated traffic.
    pub fallback_port: u16,
    /// Canned response written when no decoy is configured.
    pub http_response_file: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert: String::new(),
            key: String::new(),
            key_password: String::new(),
            sni: String::new(),
            verify: true,
            verify_hostname: true,
            session_ticket: true,
            cipher: String::new(),
            cipher_tls13: String::new(),
            fallback_port: 0,
            http_response_file: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub prefer_ipv4: bool,
    pub no_delay: bool,
    pub reuse_port: bool,
    pub fast_open: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            prefer_ipv4: false,
            no_delay: true,
            reuse_port: false,
            fast_open: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    pub enabled: bool,
    pub concurrency: usize,
    /// Seconds a streamless physical session stays open.
    pub idle_timeout: u64,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            concurrency: 8,
            idle_timeout: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MysqlConfig {
    pub enabled: bool,
    pub server_host: String,
    pub server_port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    /// Seconds between credential table polls.
    pub check_rate: u64,
}

impl Default for MysqlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_host: "localhost".to_string(),
            server_port: 3306,
            username: String::new(),
            password: String::new(),
            database: String::new(),
            check_rate: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RouterConfig {
    pub default_policy: Policy,
    pub block_files: Vec<String>,
    pub proxy_files: Vec<String>,
    pub bypass_files: Vec<String>,
}

impl MysqlConfig {
    pub fn url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.username, self.password, self.server_host, self.server_port, self.database
        )
    }
}

fn default_local_host() -> String {
    "0.0.0.0".to_string()
}

fn default_log_level() -> u8 {
    1
}

fn default_udp_timeout() -> u64 {
    60
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config_with_source(
                format!("cannot read config file {}", path.as_ref().display()),
                e,
            )
        })?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(data)
            .map_err(|e| Error::config_with_source("invalid config document", e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        match self.run_type {
            RunType::Server => {
                if self.passwords.is_empty() && !self.mysql.enabled {
                    return Err(Error::config("no password found"));
                }
                if self.tls.cert.is_empty() || self.tls.key.is_empty() {
                    return Err(Error::config("server requires tls.cert and tls.key"));
                }
            }
            RunType::Client | RunType::Nat | RunType::Forward => {
                if self.passwords.is_empty() {
                    return Err(Error::config("no password found"));
                }
                if self.remote_host.is_empty() || self.remote_port == 0 {
                    return Err(Error::config("remote_host and remote_port are required"));
                }
            }
        }
        if self.run_type == RunType::Forward
            && (self.target_host.is_empty() || self.target_port == 0)
        {
            return Err(Error::config(
                "forward mode requires target_host and target_port",
            ));
        }
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        resolve_host(&self.local_host, self.local_port, self.tcp.prefer_ipv4)
    }

    /// Server name presented in the client hello; falls back to the remote
    /// host when `tls.sni` is unset.
    pub fn effective_sni(&self) -> &str {
        if self.tls.sni.is_empty() {
            &self.remote_host
        } else {
            &self.tls.sni
        }
    }

    /// Decoy address for unauthenticated traffic, if configured.
    pub fn fallback_addr(&self) -> Option<(String, u16)> {
        if self.tls.fallback_port == 0 {
            return None;
        }
        let host = if self.remote_host.is_empty() {
            "127.0.0.1".to_string()
        } else {
            self.remote_host.clone()
        };
        Some((host, self.tls.fallback_port))
    }

    /// Canned HTTP response for the no-decoy fallback path.
    pub fn http_response(&self) -> Option<Vec<u8>> {
        if self.tls.http_response_file.is_empty() {
            return None;
        }
        match std::fs::read(&self.tls.http_response_file) {
            Ok(payload) => Some(payload),
            Err(e) => {
                tracing::warn!(
                    file = %self.tls.http_response_file,
                    error = %e,
                    "failed to load http response file"
                );
                None
            }
        }
    }
}

/// Blocking name resolution, used at startup only.
pub fn resolve_host(host: &str, port: u16, prefer_ipv4: bool) -> Result<SocketAddr> {
    use std::net::ToSocketAddrs;
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::config_with_source(format!("cannot resolve {host}:{port}"), e))?
        .collect();
    let picked = if prefer_ipv4 {
        addrs.iter().find(|a| a.is_ipv4()).or(addrs.first())
    } else {
        addrs.first()
    };
    picked
        .copied()
        .ok_or_else(|| Error::config(format!("no address for {host}:{port}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_server_config() {
        let config = Config::parse(
            r#"{
                "run_type": "server",
                "local_host": "0.0.0.0",
                "local_port": 443,
                "remote_host": "127.0.0.1",
                "remote_port": 80,
                "passwords": ["swordfish"],
                "tls": {
                    "cert": "server.crt",
                    "key": "server.key",
                    "fallback_port": 1443
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.run_type, RunType::Server);
        assert!(config.tls.verify);
        assert!(config.tls.session_ticket);
        assert_eq!(config.mux.concurrency, 8);
        assert_eq!(config.mux.idle_timeout, 60);
        assert_eq!(config.mysql.check_rate, 60);
        assert_eq!(config.router.default_policy, Policy::Proxy);
        assert_eq!(config.fallback_addr(), Some(("127.0.0.1".to_string(), 1443)));
    }

    #[test]
    fn client_requires_password() {
        let err = Config::parse(
            r#"{
                "run_type": "client",
                "local_port": 1080,
                "remote_host": "proxy.example.com",
                "remote_port": 443
            }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn forward_requires_target() {
        let err = Config::parse(
            r#"{
                "run_type": "forward",
                "local_port": 5353,
                "remote_host": "proxy.example.com",
                "remote_port": 443,
                "passwords": ["p"]
            }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("target"));
    }

    #[test]
    fn sni_defaults_to_remote_host() {
        let config = Config::parse(
            r#"{
                "run_type": "client",
                "local_port": 1080,
                "remote_host": "proxy.example.com",
                "remote_port": 443,
                "passwords": ["p"]
            }"#,
        )
        .unwrap();
        assert_eq!(config.effective_sni(), "proxy.example.com");
        assert_eq!(config.fallback_addr(), None);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let config = Config::parse(
            r#"{
                "run_type": "client",
                "local_port": 1080,
                "remote_host": "h",
                "remote_port": 443,
                "passwords": ["p"],
                "websocket": {"enabled": true}
            }"#,
        );
        assert!(config.is_ok());
    }
}
