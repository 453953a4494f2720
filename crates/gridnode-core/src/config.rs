//! `gridnode.toml` configuration parser.
//!
//! ```toml
//! [node]
//! external_uri = "http://10.0.0.5:5555"
//! session_timeout = "300s"
//! heartbeat_period = "60s"
//!
//! [[relay]]
//! url = "http://127.0.0.1:4723"
//!
//! [[relay.configs]]
//! max_sessions = 2
//! stereotype = { browserName = "chrome", platformName = "LINUX" }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::capabilities::Capabilities;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node: NodeSection,
    #[serde(default)]
    pub relay: Vec<RelayConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Address the grid reaches this node on.
    pub external_uri: String,
    /// Public grid address used when rewriting websocket endpoints.
    pub grid_uri: Option<String>,
    /// Concurrent session cap. Defaults to (and is clamped to) the slot count.
    pub max_sessions: Option<usize>,
    #[serde(default = "default_session_timeout")]
    pub session_timeout: String,
    #[serde(default = "default_heartbeat_period")]
    pub heartbeat_period: String,
    #[serde(default = "default_sweep_period")]
    pub sweep_period: String,
    /// Drain automatically after this many sessions. 0 disables.
    #[serde(default)]
    pub drain_after_session_count: u64,
    #[serde(default = "default_true")]
    pub enable_cdp: bool,
    #[serde(default = "default_true")]
    pub enable_bidi: bool,
    #[serde(default)]
    pub enable_managed_downloads: bool,
    pub tmp_dir: Option<PathBuf>,
}

/// An upstream WebDriver service this node relays sessions to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub url: String,
    #[serde(default = "default_status_endpoint")]
    pub status_endpoint: String,
    #[serde(default = "default_probe_interval")]
    pub probe_interval: String,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: String,
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default)]
    pub configs: Vec<SlotConfig>,
}

/// `max_sessions` slots sharing one stereotype.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotConfig {
    #[serde(default = "default_slot_sessions")]
    pub max_sessions: usize,
    pub stereotype: Capabilities,
}

fn default_session_timeout() -> String {
    "300s".to_string()
}

fn default_heartbeat_period() -> String {
    "60s".to_string()
}

fn default_sweep_period() -> String {
    "30s".to_string()
}

fn default_status_endpoint() -> String {
    "/status".to_string()
}

fn default_probe_interval() -> String {
    "5s".to_string()
}

fn default_probe_timeout() -> String {
    "2s".to_string()
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_slot_sessions() -> usize {
    1
}

fn default_true() -> bool {
    true
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> CoreResult<Self> {
        let config: NodeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every derived value parses.
    pub fn validate(&self) -> CoreResult<()> {
        self.node.external_uri()?;
        self.node.grid_uri()?;
        self.node.session_timeout()?;
        self.node.heartbeat_period()?;
        self.node.sweep_period()?;
        for relay in &self.relay {
            relay.service_url()?;
            relay.probe_interval()?;
            relay.probe_timeout()?;
            if relay.configs.is_empty() {
                return Err(CoreError::Config(format!(
                    "relay {} declares no slot configs",
                    relay.url
                )));
            }
        }
        Ok(())
    }

    /// Total slots declared across all relays.
    pub fn slot_count(&self) -> usize {
        self.relay
            .iter()
            .flat_map(|r| r.configs.iter())
            .map(|c| c.max_sessions)
            .sum()
    }
}

impl NodeSection {
    pub fn external_uri(&self) -> CoreResult<Url> {
        Ok(Url::parse(&self.external_uri)?)
    }

    /// `grid_uri` if set, else `external_uri`.
    pub fn grid_uri(&self) -> CoreResult<Url> {
        match &self.grid_uri {
            Some(uri) => Ok(Url::parse(uri)?),
            None => self.external_uri(),
        }
    }

    pub fn session_timeout(&self) -> CoreResult<Duration> {
        parse_duration(&self.session_timeout)
    }

    pub fn heartbeat_period(&self) -> CoreResult<Duration> {
        parse_duration(&self.heartbeat_period)
    }

    pub fn sweep_period(&self) -> CoreResult<Duration> {
        parse_duration(&self.sweep_period)
    }
}

impl RelayConfig {
    pub fn service_url(&self) -> CoreResult<Url> {
        Ok(Url::parse(&self.url)?)
    }

    pub fn probe_interval(&self) -> CoreResult<Duration> {
        parse_duration(&self.probe_interval)
    }

    pub fn probe_timeout(&self) -> CoreResult<Duration> {
        parse_duration(&self.probe_timeout)
    }
}

/// Parse a duration string like "5s", "500ms", "2m", or a bare number of
/// seconds.
pub fn parse_duration(s: &str) -> CoreResult<Duration> {
    let s = s.trim();
    let parsed = if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    };
    parsed.ok_or_else(|| CoreError::InvalidDuration(s.to_string()))
}
