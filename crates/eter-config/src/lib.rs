//! Shared configuration for eter tools
//!
//! Reads from ~/.eter/config.toml

use anyhow::{Context, Result};
use eter_p2p::{CoordinatorConfig, CoordinatorOptions, IceConfig, IceServer, Timing};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default STUN servers used when no relay configuration is fetched
pub const DEFAULT_STUN_SERVERS: &[&str] = &["stun:stun.l.google.com:19302"];

/// Top-level config structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub ice: IceSettings,
    #[serde(default)]
    pub peer: PeerConfig,
    #[serde(default)]
    pub timing: Timing,
}

/// Signaling server location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_key")]
    pub key: String,
    #[serde(default = "default_path")]
    pub path: String,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            secure: false,
            port: default_port(),
            key: default_key(),
            path: default_path(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_key() -> String {
    "peerjs".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

/// ICE settings: an optional rtcconfig endpoint plus static servers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceSettings {
    /// Base URL of the rtcconfig API; static servers are used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_ice_servers")]
    pub servers: Vec<IceServer>,
}

impl Default for IceSettings {
    fn default() -> Self {
        Self {
            api: None,
            app_name: default_app_name(),
            servers: default_ice_servers(),
        }
    }
}

fn default_app_name() -> String {
    "eter".to_string()
}

fn default_ice_servers() -> Vec<IceServer> {
    DEFAULT_STUN_SERVERS.iter().map(|url| IceServer::stun(*url)).collect()
}

impl IceSettings {
    /// Static configuration built from `servers`
    pub fn static_config(&self) -> IceConfig {
        IceConfig {
            expires_on: String::new(),
            ice_servers: self.servers.clone(),
        }
    }
}

/// Peer behaviour
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer to connect to once the session opens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default)]
    pub relay: bool,
    #[serde(default)]
    pub force_turn: bool,
    #[serde(default)]
    pub force_websocket: bool,
}

impl Config {
    /// Load config from file, or create default if doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path())
    }

    /// Load config, returning default on any error (no panic)
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&get_config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }

    /// Coordinator parameters for `code`, using `ice` when given and the
    /// static servers otherwise
    pub fn coordinator_config(&self, code: &str, ice: Option<IceConfig>) -> CoordinatorConfig {
        let mut config = CoordinatorConfig::new(code, self.signaling.host.clone())
            .with_ice(ice.unwrap_or_else(|| self.ice.static_config()))
            .with_options(CoordinatorOptions {
                force_turn: self.peer.force_turn,
                force_websocket: self.peer.force_websocket,
                ..Default::default()
            })
            .with_timing(self.timing);
        config.secure = self.signaling.secure;
        config.port = self.signaling.port;
        config.key = self.signaling.key.clone();
        config.path = self.signaling.path.clone();
        config.relay = self.peer.relay;
        config.server = self.peer.server.clone();
        config
    }
}

/// Get the eter directory (~/.eter)
pub fn get_eter_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("ETER_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".eter")
}

/// Get the config file path (~/.eter/config.toml)
pub fn get_config_path() -> PathBuf {
    get_eter_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.signaling.host, "localhost");
        assert_eq!(config.signaling.port, 9000);
        assert!(!config.signaling.secure);
        assert!(!config.ice.servers.is_empty());
        assert!(config.peer.server.is_none());
    }

    #[test]
    fn test_parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[signaling]
host = "signal.example.com"
secure = true
port = 443

[peer]
server = "host-1"
force_websocket = true

[timing]
max_conn_retry = 3
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.signaling.host, "signal.example.com");
        assert_eq!(config.signaling.key, "peerjs");
        assert_eq!(config.peer.server.as_deref(), Some("host-1"));
        assert!(config.peer.force_websocket);
        assert_eq!(config.timing.max_conn_retry, 3);
        assert_eq!(config.timing.max_id_retry, Timing::default().max_id_retry);
        assert_eq!(config.ice.app_name, "eter");
    }

    #[test]
    fn test_parse_ice_servers() {
        let toml = r#"
[ice]
api = "https://api.example.com"

[[ice.servers]]
urls = ["turn:turn.example.com:3478"]
username = "u"
credential = "c"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.ice.api.as_deref(), Some("https://api.example.com"));
        assert_eq!(config.ice.servers.len(), 1);
        assert_eq!(config.ice.servers[0].username.as_deref(), Some("u"));
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.peer.server = Some("host-1".to_string());
        config.peer.relay = true;
        config.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.peer.server.as_deref(), Some("host-1"));
        assert!(reloaded.peer.relay);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[signaling\nhost=").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_coordinator_config_mapping() {
        let mut config = Config::default();
        config.peer.server = Some("host-1".to_string());
        config.peer.force_turn = true;
        config.signaling.path = "/signal/".to_string();

        let coordinator = config.coordinator_config("guest-1", None);
        assert_eq!(coordinator.code, "guest-1");
        assert_eq!(coordinator.host, "localhost");
        assert!(!coordinator.secure);
        assert_eq!(coordinator.port, 9000);
        assert_eq!(coordinator.path, "/signal/");
        assert_eq!(coordinator.server.as_deref(), Some("host-1"));
        assert!(coordinator.relay_only());
        assert_eq!(coordinator.ice.ice_servers, config.ice.servers);

        let fetched = IceConfig {
            expires_on: "2030-01-01T00:00:00Z".to_string(),
            ice_servers: vec![IceServer::stun("stun:other:3478")],
        };
        let coordinator = config.coordinator_config("guest-1", Some(fetched.clone()));
        assert_eq!(coordinator.ice, fetched);
    }
}
