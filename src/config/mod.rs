use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::oracle::{Wei, MOCK_DECIMALS, MOCK_INITIAL_ANSWER, PRECISION};

pub const DEFAULT_ACCOUNTS: usize = 10;
pub const DEFAULT_ACCOUNT_BALANCE: Wei = 10_000 * PRECISION;
pub const DEFAULT_FEED_ADDRESS: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Parameters of the local devnet: mock feed and pre-funded accounts.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DevnetConfig {
    pub feed_address: String,
    pub feed_decimals: u8,
    pub initial_answer: i128,
    pub accounts: usize,
    pub account_balance: Wei,
    /// Index into the generated accounts of the identity that deploys the ledger.
    pub deployer: usize,
}

impl Default for DevnetConfig {
    fn default() -> Self {
        Self {
            feed_address: DEFAULT_FEED_ADDRESS.to_string(),
            feed_decimals: MOCK_DECIMALS,
            initial_answer: MOCK_INITIAL_ANSWER,
            accounts: DEFAULT_ACCOUNTS,
            account_balance: DEFAULT_ACCOUNT_BALANCE,
            deployer: 0,
        }
    }
}

impl DevnetConfig {
    /// Reads a JSON config; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no devnet config, using defaults");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accounts == 0 {
            return Err(ConfigError::Invalid("accounts must be > 0".into()));
        }
        if self.deployer >= self.accounts {
            return Err(ConfigError::Invalid(format!(
                "deployer index {} outside {} accounts",
                self.deployer, self.accounts
            )));
        }
        if self.initial_answer <= 0 {
            return Err(ConfigError::Invalid("initial_answer must be positive".into()));
        }
        Ok(())
    }

    /// Deterministic account addresses, `0x` + 40 hex chars.
    pub fn account_addresses(&self) -> Vec<String> {
        (0..self.accounts).map(account_address).collect()
    }
}

pub fn account_address(index: usize) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(b"fundme-devnet-account");
    hasher.update((index as u64).to_le_bytes());
    let digest = hasher.finalize();
    format!("0x{}", hex::encode(&digest[..20]))
}
