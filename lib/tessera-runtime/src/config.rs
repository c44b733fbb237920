// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Node configuration.
//!
//! Sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. System config file at `/opt/tessera/etc/tessera.toml`
//! 3. TOML file named by `TESSERA_CONFIG_PATH`
//! 4. `TESSERA_<SECTION>_<KEY>` environment variables, e.g. `TESSERA_NODE_RANK=1`
//!
//! Example:
//! ```toml
//! [node]
//! rank = 1
//! peers = ["10.0.0.1:5600", "10.0.0.2:5600"]
//!
//! [tcp]
//! connect_retries = 20
//!
//! [logging]
//! level = "debug"
//!
//! [logging.filters]
//! "tessera_comm::transport" = "info"
//! ```

use figment::{
    Figment, Metadata, Profile, Provider,
    providers::{Env, Format, Json, Serialized, Toml},
    value::{Dict, Map},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

use tessera_comm::{TcpOptions, parse_tcp_endpoint};
use tessera_common::NodeId;

const SYSTEM_CONFIG_PATH: &str = "/opt/tessera/etc/tessera.toml";

/// ENV naming an additional TOML configuration file
pub const CONFIG_PATH_ENV: &str = "TESSERA_CONFIG_PATH";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Configuration error: {0}")]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct TesseraConfig {
    #[validate(nested)]
    pub node: NodeConfig,

    #[validate(nested)]
    #[serde(default)]
    pub tcp: TcpConfig,

    #[validate(nested)]
    #[serde(default)]
    pub tokio: TokioConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// This node's place in the group.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_rank"))]
pub struct NodeConfig {
    pub rank: u32,

    /// Listening endpoint of every rank, indexed by rank. Its length is the group size.
    #[validate(length(min = 1))]
    pub peers: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            peers: vec!["127.0.0.1:5600".to_string()],
        }
    }
}

impl NodeConfig {
    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.rank)
    }

    pub fn group_size(&self) -> u32 {
        self.peers.len() as u32
    }

    /// Resolves every peer endpoint, in rank order.
    pub fn peer_addrs(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.peers
            .iter()
            .map(|peer| parse_tcp_endpoint(peer).map_err(ConfigError::Other))
            .collect()
    }
}

fn validate_rank(node: &NodeConfig) -> Result<(), ValidationError> {
    if (node.rank as usize) < node.peers.len() {
        return Ok(());
    }
    let mut error = ValidationError::new("rank_out_of_range");
    error.message = Some(
        format!(
            "rank {} is outside a group of {} peers",
            node.rank,
            node.peers.len()
        )
        .into(),
    );
    Err(error)
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TcpConfig {
    pub connect_retries: u32,

    #[validate(range(min = 1))]
    pub retry_interval_ms: u64,

    pub nodelay: bool,

    #[validate(range(min = 4096))]
    pub socket_buffer_size: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        let options = TcpOptions::default();
        Self {
            connect_retries: options.connect_retries,
            retry_interval_ms: options.retry_interval.as_millis() as u64,
            nodelay: options.nodelay,
            socket_buffer_size: options.socket_buffer_size,
        }
    }
}

impl TcpConfig {
    pub fn tcp_options(&self) -> TcpOptions {
        TcpOptions {
            connect_retries: self.connect_retries,
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            nodelay: self.nodelay,
            socket_buffer_size: self.socket_buffer_size,
        }
    }
}

/// Tokio runtime configuration.
///
/// The communicator only runs on a multi-threaded runtime, so there is no
/// current-thread option.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TokioConfig {
    /// If None, uses the number of logical CPUs.
    #[validate(range(min = 2))]
    pub worker_threads: Option<usize>,

    #[validate(range(min = 1))]
    pub max_blocking_threads: Option<usize>,
}

impl Default for TokioConfig {
    fn default() -> Self {
        Self {
            worker_threads: Some(2),
            max_blocking_threads: None,
        }
    }
}

impl TokioConfig {
    pub fn build_runtime(&self) -> std::io::Result<tokio::runtime::Runtime> {
        let mut builder = tokio::runtime::Builder::new_multi_thread();

        if let Some(threads) = self.worker_threads {
            builder.worker_threads(threads);
        }

        if let Some(blocking) = self.max_blocking_threads {
            builder.max_blocking_threads(blocking);
        }

        builder.enable_all().build()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// None = unbounded store.
    #[serde(default)]
    pub capacity_bytes: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,

    /// Module path to level, applied on top of `level`.
    #[serde(default)]
    pub filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            filters: HashMap::from([
                ("h2".to_string(), "error".to_string()),
                ("tokio_util".to_string(), "error".to_string()),
            ]),
        }
    }
}

impl TesseraConfig {
    /// Create a Figment configuration with all sources merged.
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(TesseraConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH))
            .merge(Toml::file(&config_path))
            // TESSERA_NODE_RANK, TESSERA_NODE_PEERS
            .merge(section_env("NODE", "node"))
            // TESSERA_TCP_CONNECT_RETRIES, TESSERA_TCP_RETRY_INTERVAL_MS, ...
            .merge(section_env("TCP", "tcp"))
            .merge(section_env("TOKIO", "tokio"))
            // TESSERA_STORAGE_CAPACITY_BYTES
            .merge(section_env("STORAGE", "storage"))
            .merge(section_env("LOGGING", "logging"))
    }

    /// Load configuration from default figment (env and files).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract configuration from any provider and validate it.
    ///
    /// # Example
    /// ```rust,ignore
    /// let config = TesseraConfig::extract_from(
    ///     TesseraConfig::figment().merge(("node.rank", 1u32))
    /// )?;
    /// ```
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a figment from defaults, then merge a custom provider with highest priority.
    pub fn figment_with<T: Provider>(extra: T) -> Figment {
        Self::figment().merge(extra)
    }

    /// Load configuration with JSON overrides on top of every other source.
    pub fn from_figment_with_json(json: &str) -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment().merge(Json::string(json)))
    }
}

fn section_env(prefix: &str, section: &'static str) -> Env {
    Env::prefixed(&format!("TESSERA_{prefix}_"))
        .map(move |k| format!("{section}.{}", k.as_str().to_lowercase()).into())
}

impl Provider for TesseraConfig {
    fn metadata(&self) -> Metadata {
        Metadata::named("TesseraConfig")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        Serialized::defaults(self).data()
    }
}
