// Configuration of the negotiator: ICE servers, timing and capabilities.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::ConfigError;
use crate::peer::media::MediaConstraints;
use crate::utils::add_ice_url_scheme;

pub const DEFAULT_ICE_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Period a dropped link may take to heal before the call is failed
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

pub const DEFAULT_CANDIDATE_POOL_SIZE: u8 = 10;

pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "transcript";

/// Subset handed to the transport when a connection is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceSettings {
    pub ice_servers: Vec<String>,
    pub candidate_pool_size: u8,
}

impl Default for IceSettings {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            candidate_pool_size: DEFAULT_CANDIDATE_POOL_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct NegotiatorConfig {
    pub ice_servers: Vec<String>,
    pub candidate_pool_size: u8,
    pub grace_period_ms: u64,
    /// open the transcript channel on the offering side
    pub data_channel: bool,
    pub data_channel_label: String,
    /// re-arm an idle connection right after hangup
    pub redial: bool,
    pub delete_session_on_hangup: bool,
    pub media: MediaConstraints,
    pub logging_enabled: bool,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            candidate_pool_size: DEFAULT_CANDIDATE_POOL_SIZE,
            grace_period_ms: DEFAULT_GRACE_PERIOD.as_millis() as u64,
            data_channel: true,
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
            redial: true,
            delete_session_on_hangup: false,
            media: MediaConstraints::default(),
            logging_enabled: cfg!(debug_assertions),
        }
    }
}

impl NegotiatorConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()
    }

    /// Defaults overridden by `PEERCALL_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(servers) = env::var("PEERCALL_ICE_SERVERS") {
            config.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(pool) = env::var("PEERCALL_CANDIDATE_POOL") {
            config.candidate_pool_size = pool.trim().parse().map_err(|_| ConfigError::Env {
                key: "PEERCALL_CANDIDATE_POOL",
                value: pool.clone(),
            })?;
        }
        if let Ok(grace) = env::var("PEERCALL_GRACE_MS") {
            config.grace_period_ms = grace.trim().parse().map_err(|_| ConfigError::Env {
                key: "PEERCALL_GRACE_MS",
                value: grace.clone(),
            })?;
        }
        if let Ok(logging) = env::var("PEERCALL_LOGGING") {
            config.logging_enabled = matches!(logging.trim(), "1" | "true" | "on");
        }

        config.validate()
    }

    /// Checks the server list and normalises every entry to a full ICE URI
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.ice_servers.is_empty() {
            return Err(ConfigError::NoIceServers);
        }
        for server in self.ice_servers.iter_mut() {
            let trimmed = server.trim();
            if trimmed.is_empty() || trimmed.ends_with(':') {
                return Err(ConfigError::InvalidIceServer(server.clone()));
            }
            *server = add_ice_url_scheme(trimmed);
        }
        Ok(self)
    }

    pub fn ice_settings(&self) -> IceSettings {
        IceSettings {
            ice_servers: self.ice_servers.clone(),
            candidate_pool_size: self.candidate_pool_size,
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}
