use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub identity: String,
    pub relay_url: String,
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default)]
    pub config_path: Option<PathBuf>,
}

/// One STUN/TURN entry handed to the peer link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
        }
    }
}

impl ReconnectConfig {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_true")]
    pub audio: bool,
    #[serde(default = "default_true")]
    pub video: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub identity: Option<String>,
    pub relay_url: Option<String>,
}

impl Config {
    /// Build a config in code with every optional section at its default.
    pub fn new(identity: &str, relay_url: &str) -> Result<Self> {
        let mut cfg = Config {
            identity: identity.to_string(),
            relay_url: relay_url.to_string(),
            ice_servers: default_ice_servers(),
            reconnect: ReconnectConfig::default(),
            media: MediaConfig::default(),
            log_path: None,
            config_path: None,
        };
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_overrides(path, ConfigOverrides::default())
    }

    pub fn load_with_overrides(path: &Path, overrides: ConfigOverrides) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut cfg: Config = serde_json::from_str(&data).context("parse config json")?;
        cfg.config_path = Some(path.to_path_buf());
        if let Some(identity) = overrides.identity {
            cfg.identity = identity;
        }
        if let Some(relay_url) = overrides.relay_url {
            cfg.relay_url = relay_url;
        }
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn log_file_path(&self) -> PathBuf {
        if let Some(p) = &self.log_path {
            return p.clone();
        }
        if let Some(dir) = self.config_path.as_ref().and_then(|p| p.parent()) {
            return dir.join("logs").join("peercall.log");
        }
        std::env::temp_dir().join("peercall").join("peercall.log")
    }

    fn normalize(&mut self) {
        self.identity = self.identity.trim().to_string();
        self.relay_url = self.relay_url.trim().to_string();
        for server in &mut self.ice_servers {
            let has_credentials = server.username.is_some() && server.credential.is_some();
            for url in &mut server.urls {
                *url = add_ice_url_scheme(url.trim(), has_credentials);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        validate_identity(&self.identity)?;
        validate_relay_url(&self.relay_url).context("relay_url")?;
        for server in &self.ice_servers {
            validate_ice_server(server).context("ice_servers")?;
        }
        if self.reconnect.initial_ms == 0 {
            anyhow::bail!("reconnect.initial_ms must be positive");
        }
        if self.reconnect.max_ms < self.reconnect.initial_ms {
            anyhow::bail!("reconnect.max_ms must be >= reconnect.initial_ms");
        }
        Ok(())
    }
}

/// Bare `host:port` entries become STUN, or TURN when credentials are present.
fn add_ice_url_scheme(url: &str, has_credentials: bool) -> String {
    if url.starts_with("stun:")
        || url.starts_with("stuns:")
        || url.starts_with("turn:")
        || url.starts_with("turns:")
    {
        url.to_string()
    } else if has_credentials {
        format!("turn:{url}")
    } else {
        format!("stun:{url}")
    }
}

fn validate_ice_server(server: &IceServerConfig) -> Result<()> {
    if server.urls.is_empty() || server.urls.iter().any(|u| u.len() <= "stun:".len()) {
        anyhow::bail!("ice server url cannot be empty");
    }
    let is_turn = server
        .urls
        .iter()
        .any(|u| u.starts_with("turn:") || u.starts_with("turns:"));
    if is_turn && (server.username.is_none() || server.credential.is_none()) {
        anyhow::bail!("turn servers require username and credential");
    }
    Ok(())
}

fn validate_relay_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)?;
    if url.scheme() != "ws" && url.scheme() != "wss" {
        anyhow::bail!("url must be ws or wss");
    }
    Ok(())
}

fn validate_identity(identity: &str) -> Result<()> {
    static PATTERN: once_cell::sync::Lazy<Regex> =
        once_cell::sync::Lazy::new(|| Regex::new(r"^[A-Za-z0-9._@-]{1,64}$").unwrap());
    if PATTERN.is_match(identity) {
        Ok(())
    } else {
        anyhow::bail!("invalid identity: {identity:?}")
    }
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        IceServerConfig {
            urls: vec!["stun:stun.l.google.com:19302".into()],
            username: None,
            credential: None,
        },
        IceServerConfig {
            urls: vec!["stun:stun1.l.google.com:19302".into()],
            username: None,
            credential: None,
        },
        IceServerConfig {
            urls: vec!["turn:relay.metered.ca:80".into()],
            username: Some("open".into()),
            credential: Some("open".into()),
        },
    ]
}

fn default_initial_ms() -> u64 {
    1000
}

fn default_max_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}
