//! Runtime configuration: an optional JSON file overlaid by command-line flags.

use crate::{
    poller::Backoff,
    types::Address,
};
use serde::Deserialize;
use std::{
    path::PathBuf,
    time::Duration,
};
use thiserror::Error;

pub const DEFAULT_SEPOLIA_RPC_URL: &str = "https://ethereum-sepolia-rpc.publicnode.com";
pub const DEFAULT_LOCAL_RPC_URL: &str = "http://127.0.0.1:8545";
pub const SEPOLIA_CHAIN_ID: u64 = 11_155_111;
pub const LOCAL_CHAIN_ID: u64 = 31_337;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5_000);
pub const DEFAULT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to expand config path '{path}': {reason}")]
    Expand { path: String, reason: String },
    #[error("failed to read config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },
    #[error("backoff_base_ms must not exceed backoff_max_ms")]
    BackoffRange,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    Sepolia,
    Local,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkTarget {
    Sepolia { url: String },
    LocalNode { url: String },
}

impl NetworkTarget {
    pub fn url(&self) -> &str {
        match self {
            NetworkTarget::Sepolia { url } | NetworkTarget::LocalNode { url } => url,
        }
    }

    pub fn default_chain_id(&self) -> u64 {
        match self {
            NetworkTarget::Sepolia { .. } => SEPOLIA_CHAIN_ID,
            NetworkTarget::LocalNode { .. } => LOCAL_CHAIN_ID,
        }
    }
}

/// Settings as written in a config file or given on the command line. Every field
/// is optional; later layers override earlier ones.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub network: Option<NetworkKind>,
    pub rpc_url: Option<String>,
    pub contract: Option<Address>,
    pub player: Option<Address>,
    pub chain_id: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub receipt_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
    pub log_dir: Option<String>,
}

impl ConfigFile {
    /// Reads a JSON config file; `~` and environment variables in `path` are
    /// expanded.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let path = expand_path(path)?;
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse { path, source })
    }

    /// Fields set in `other` win.
    pub fn overlay(self, other: ConfigFile) -> ConfigFile {
        ConfigFile {
            network: other.network.or(self.network),
            rpc_url: other.rpc_url.or(self.rpc_url),
            contract: other.contract.or(self.contract),
            player: other.player.or(self.player),
            chain_id: other.chain_id.or(self.chain_id),
            poll_interval_ms: other.poll_interval_ms.or(self.poll_interval_ms),
            receipt_timeout_ms: other.receipt_timeout_ms.or(self.receipt_timeout_ms),
            request_timeout_ms: other.request_timeout_ms.or(self.request_timeout_ms),
            backoff_base_ms: other.backoff_base_ms.or(self.backoff_base_ms),
            backoff_max_ms: other.backoff_max_ms.or(self.backoff_max_ms),
            log_dir: other.log_dir.or(self.log_dir),
        }
    }

    pub fn resolve(self) -> Result<AppConfig, ConfigError> {
        let network = match self.network.unwrap_or(NetworkKind::Sepolia) {
            NetworkKind::Sepolia => NetworkTarget::Sepolia {
                url: self
                    .rpc_url
                    .unwrap_or_else(|| DEFAULT_SEPOLIA_RPC_URL.to_string()),
            },
            NetworkKind::Local => NetworkTarget::LocalNode {
                url: self
                    .rpc_url
                    .unwrap_or_else(|| DEFAULT_LOCAL_RPC_URL.to_string()),
            },
        };
        let expected_chain_id = self
            .chain_id
            .unwrap_or_else(|| network.default_chain_id());
        let backoff_defaults = Backoff::default();
        let backoff = Backoff {
            base: millis("backoff_base_ms", self.backoff_base_ms, backoff_defaults.base)?,
            max: millis("backoff_max_ms", self.backoff_max_ms, backoff_defaults.max)?,
        };
        if backoff.base > backoff.max {
            return Err(ConfigError::BackoffRange);
        }
        Ok(AppConfig {
            network,
            contract: self.contract,
            player: self.player,
            expected_chain_id,
            poll_interval: millis(
                "poll_interval_ms",
                self.poll_interval_ms,
                DEFAULT_POLL_INTERVAL,
            )?,
            receipt_timeout: millis(
                "receipt_timeout_ms",
                self.receipt_timeout_ms,
                DEFAULT_RECEIPT_TIMEOUT,
            )?,
            request_timeout: millis(
                "request_timeout_ms",
                self.request_timeout_ms,
                DEFAULT_REQUEST_TIMEOUT,
            )?,
            backoff,
            log_dir: self.log_dir.as_deref().map(expand_path).transpose()?,
        })
    }
}

fn millis(
    field: &'static str,
    value: Option<u64>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(0) => Err(ConfigError::ZeroDuration { field }),
        Some(ms) => Ok(Duration::from_millis(ms)),
    }
}

fn expand_path(raw: &str) -> Result<PathBuf, ConfigError> {
    shellexpand::full(raw)
        .map(|expanded| PathBuf::from(expanded.as_ref()))
        .map_err(|err| ConfigError::Expand {
            path: raw.to_string(),
            reason: err.to_string(),
        })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppConfig {
    pub network: NetworkTarget,
    /// Required to watch a deployed contract; the simulated scenario ignores it.
    pub contract: Option<Address>,
    /// Node-managed account used as the player's wallet.
    pub player: Option<Address>,
    pub expected_chain_id: u64,
    pub poll_interval: Duration,
    pub receipt_timeout: Duration,
    pub request_timeout: Duration,
    pub backoff: Backoff,
    pub log_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            network: NetworkTarget::Sepolia {
                url: DEFAULT_SEPOLIA_RPC_URL.to_string(),
            },
            contract: None,
            player: None,
            expected_chain_id: SEPOLIA_CHAIN_ID,
            poll_interval: DEFAULT_POLL_INTERVAL,
            receipt_timeout: DEFAULT_RECEIPT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            backoff: Backoff::default(),
            log_dir: None,
        }
    }
}
