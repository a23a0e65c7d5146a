use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node: NodeSettings,
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub chain: ChainConfig,
    pub reconcile: ReconcileSettings,
    pub anchor: AnchorSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    pub name: String,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "memory" or "rocksdb" (the latter needs the `rocksdb` feature).
    pub backend: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub rpc_url: String,
    /// Network name used for contract-table lookups.
    pub network: String,
    /// Custody signer; the key itself lives with the provider.
    pub custody_address: String,
    pub confirmation_depth: u64,
    pub confirm_timeout_secs: u64,
    pub poll_interval_secs: u64,
    /// Block range the reconciliation log scan covers.
    pub lookback_blocks: u64,
    pub tokens: Vec<TokenSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSettings {
    pub symbol: String,
    pub network: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub match_window_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorSettings {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSettings {
                name: "tranche-node".to_string(),
                data_dir: PathBuf::from("./data"),
            },
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            storage: StorageConfig {
                backend: "memory".to_string(),
            },
            chain: ChainConfig {
                rpc_url: "http://127.0.0.1:8545".to_string(),
                network: "devnet".to_string(),
                custody_address: "0x0000000000000000000000000000000000000000".to_string(),
                confirmation_depth: 1,
                confirm_timeout_secs: 90,
                poll_interval_secs: 2,
                lookback_blocks: 10_000,
                tokens: vec![TokenSettings {
                    symbol: "USDC".to_string(),
                    network: "devnet".to_string(),
                    address: "0x0000000000000000000000000000000000000001".to_string(),
                }],
            },
            reconcile: ReconcileSettings {
                enabled: true,
                interval_secs: 300,
                match_window_hours: 24,
            },
            anchor: AnchorSettings {
                enabled: true,
                interval_secs: 3_600,
            },
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
