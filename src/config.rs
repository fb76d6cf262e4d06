//! Node configuration
//!
//! A JSON file whose fields all default, so an empty object is a valid
//! config. Command-line flags override what the file says.

use crate::core::ChainParams;
use crate::mining::{MempoolPolicy, MinerConfig};
use crate::network::NodeType;
use crate::storage::StorageConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Unknown network: {0}")]
    UnknownNetwork(String),
}

/// Everything a node needs to start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// `mainnet` or `regtest`
    pub network: String,
    pub node_type: NodeType,
    pub storage: StorageConfig,
    pub miner: MinerConfig,
    pub mempool: MempoolPolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: "mainnet".to_string(),
            node_type: NodeType::FULL,
            storage: StorageConfig::default(),
            miner: MinerConfig::default(),
            mempool: MempoolPolicy::default(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }

    /// Load `path` if given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Consensus parameters of the configured network
    pub fn chain_params(&self) -> Result<ChainParams, ConfigError> {
        ChainParams::by_name(&self.network)
            .ok_or_else(|| ConfigError::UnknownNetwork(self.network.clone()))
    }

    pub fn data_dir(&self) -> &Path {
        &self.storage.data_dir
    }

    pub fn wallets_dir(&self) -> PathBuf {
        self.storage.data_dir.join("wallets")
    }
}
