//! Environment-based configuration.
//!
//! Everything is read from environment variables (optionally seeded from a
//! `.env` file). Chains are declared as an indexed list:
//!
//! ```text
//! CHAINS_COUNT=2
//! CHAIN_0_NAME=eth
//! CHAIN_0_RPC_URL=http://localhost:8545
//! CHAIN_0_CHAIN_ID=1
//! CHAIN_0_AGENT_ADDRESS=0x...
//! CHAIN_0_START_HEIGHT=0
//! CHAIN_0_CONFIRMATIONS=15
//! CHAIN_0_COUNTERPART=bsc
//! CHAIN_0_FILL_VARIANT=eth2bsc
//! CHAIN_0_AGENT_TOKEN=0x...        # optional, for agents whose events carry no token
//! ```
//!
//! Fatal validation errors abort startup; the engine never retries
//! configuration-level faults.

use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use eyre::{eyre, Result, WrapErr};

use crate::types::{Direction, FeePolicy, FillVariant};

/// Main configuration for the bridge engine.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub chains: Vec<ChainConfig>,
    pub engine: EngineConfig,
    pub keys: KeySourceConfig,
}

/// Database configuration.
#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// One watched chain.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub name: String,
    pub rpc_url: String,
    pub chain_id: u64,
    pub agent_address: String,
    pub start_height: u64,
    pub confirmations: u64,
    /// Default destination for events that carry no destination chain id
    /// (forward swap starts and pair registrations).
    pub counterpart: Option<String>,
    pub fill_variant: FillVariant,
    /// Token address stamped onto swap events whose log layout carries none
    /// (reverse-layout agents are deployed per token).
    pub agent_token: Option<String>,
}

/// Engine tuning. Defaults follow the production deployment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub observer_poll_ms: u64,
    pub engine_poll_ms: u64,
    pub rpc_timeout_ms: u64,
    pub swap_batch_size: i64,
    pub track_batch_size: i64,
    pub pair_batch_size: i64,
    /// Track-sent attempts without a receipt before a record fails.
    pub receipt_attempts: i32,
    pub fee_policy: FeePolicy,
}

impl EngineConfig {
    pub fn observer_poll(&self) -> Duration {
        Duration::from_millis(self.observer_poll_ms)
    }

    pub fn engine_poll(&self) -> Duration {
        Duration::from_millis(self.engine_poll_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// Where signing keys come from.
#[derive(Clone)]
pub struct KeySourceConfig {
    /// `env` or `file`.
    pub kind: String,
    /// Path to the JSON key file when `kind = file`.
    pub file: Option<String>,
}

impl fmt::Debug for KeySourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySourceConfig")
            .field("kind", &self.kind)
            .field("file", &self.file)
            .finish()
    }
}

fn default_observer_poll_ms() -> u64 {
    2000
}

fn default_engine_poll_ms() -> u64 {
    5000
}

fn default_rpc_timeout_ms() -> u64 {
    5000
}

fn default_swap_batch_size() -> i64 {
    50
}

fn default_track_batch_size() -> i64 {
    100
}

fn default_pair_batch_size() -> i64 {
    5
}

fn default_receipt_attempts() -> i32 {
    30
}

impl Config {
    /// Load configuration from environment variables, seeding from `.env`
    /// when present.
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    /// Load from a specific .env file path.
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| eyre!("DATABASE_URL environment variable is required"))?,
        };

        let count: usize = env::var("CHAINS_COUNT")
            .map_err(|_| eyre!("CHAINS_COUNT environment variable is required"))?
            .parse()
            .wrap_err("CHAINS_COUNT must be a valid integer")?;

        let mut chains = Vec::with_capacity(count);
        for i in 0..count {
            chains.push(ChainConfig::load_from_env(i)?);
        }

        let engine = EngineConfig {
            observer_poll_ms: env_or_default("OBSERVER_POLL_MS", default_observer_poll_ms())?,
            engine_poll_ms: env_or_default("ENGINE_POLL_MS", default_engine_poll_ms())?,
            rpc_timeout_ms: env_or_default("RPC_TIMEOUT_MS", default_rpc_timeout_ms())?,
            swap_batch_size: env_or_default("SWAP_BATCH_SIZE", default_swap_batch_size())?,
            track_batch_size: env_or_default("TRACK_BATCH_SIZE", default_track_batch_size())?,
            pair_batch_size: env_or_default("PAIR_BATCH_SIZE", default_pair_batch_size())?,
            receipt_attempts: env_or_default("RECEIPT_ATTEMPTS", default_receipt_attempts())?,
            fee_policy: match env::var("FEE_POLICY") {
                Ok(v) => v.parse()?,
                Err(_) => FeePolicy::Gross,
            },
        };

        let keys = KeySourceConfig {
            kind: env::var("KEY_SOURCE").unwrap_or_else(|_| "env".to_string()),
            file: env::var("KEY_FILE").ok(),
        };

        let config = Config {
            database,
            chains,
            engine,
            keys,
        };

        config.validate()?;
        Ok(config)
    }

    /// All ordered chain pairs; one swap pipeline runs per direction.
    pub fn directions(&self) -> Vec<Direction> {
        let mut out = Vec::new();
        for src in &self.chains {
            for dst in &self.chains {
                if src.name != dst.name {
                    out.push(Direction::new(src.name.clone(), dst.name.clone()));
                }
            }
        }
        out
    }

    pub fn chain(&self, name: &str) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.name == name)
    }

    /// Validate the configuration. All failures here are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        if self.chains.len() < 2 {
            return Err(eyre!(
                "at least two chains are required, got {}",
                self.chains.len()
            ));
        }

        for chain in &self.chains {
            chain.validate()?;

            if let Some(ref counterpart) = chain.counterpart {
                if self.chain(counterpart).is_none() {
                    return Err(eyre!(
                        "chain {} names unknown counterpart {}",
                        chain.name,
                        counterpart
                    ));
                }
                if counterpart == &chain.name {
                    return Err(eyre!("chain {} is its own counterpart", chain.name));
                }
            }
        }

        // Duplicate names or ids would make destination resolution ambiguous.
        for (i, a) in self.chains.iter().enumerate() {
            for b in &self.chains[i + 1..] {
                if a.name == b.name {
                    return Err(eyre!("duplicate chain name {}", a.name));
                }
                if a.chain_id == b.chain_id {
                    return Err(eyre!("duplicate chain id {}", a.chain_id));
                }
            }
        }

        match self.keys.kind.as_str() {
            "env" => {}
            "file" => {
                if self.keys.file.is_none() {
                    return Err(eyre!("KEY_FILE is required when KEY_SOURCE=file"));
                }
            }
            other => return Err(eyre!("unknown KEY_SOURCE {other:?}, expected env or file")),
        }

        Ok(())
    }
}

impl ChainConfig {
    fn load_from_env(index: usize) -> Result<Self> {
        let var = |suffix: &str| -> Result<String> {
            let key = format!("CHAIN_{index}_{suffix}");
            env::var(&key).map_err(|_| eyre!("{key} environment variable is required"))
        };
        let opt = |suffix: &str| env::var(format!("CHAIN_{index}_{suffix}")).ok();

        Ok(ChainConfig {
            name: var("NAME")?,
            rpc_url: var("RPC_URL")?,
            chain_id: var("CHAIN_ID")?
                .parse()
                .wrap_err_with(|| format!("CHAIN_{index}_CHAIN_ID must be a valid u64"))?,
            agent_address: var("AGENT_ADDRESS")?,
            start_height: var("START_HEIGHT")?
                .parse()
                .wrap_err_with(|| format!("CHAIN_{index}_START_HEIGHT must be a valid u64"))?,
            confirmations: var("CONFIRMATIONS")?
                .parse()
                .wrap_err_with(|| format!("CHAIN_{index}_CONFIRMATIONS must be a valid u64"))?,
            counterpart: opt("COUNTERPART"),
            fill_variant: FillVariant::from_str(&var("FILL_VARIANT")?)?,
            agent_token: opt("AGENT_TOKEN"),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(eyre!("chain name cannot be empty"));
        }
        // Direction tags are "{src}_{dst}"; an underscore in a name would
        // make the tag ambiguous.
        if self.name.contains('_') {
            return Err(eyre!("chain name {} must not contain '_'", self.name));
        }
        if self.rpc_url.is_empty() {
            return Err(eyre!("chain {}: rpc_url cannot be empty", self.name));
        }
        if !is_hex_address(&self.agent_address) {
            return Err(eyre!(
                "chain {}: agent_address must be a valid hex address (42 chars with 0x prefix)",
                self.name
            ));
        }
        if let Some(ref token) = self.agent_token {
            if !is_hex_address(token) {
                return Err(eyre!(
                    "chain {}: agent_token must be a valid hex address (42 chars with 0x prefix)",
                    self.name
                ));
            }
        }
        Ok(())
    }
}

fn is_hex_address(s: &str) -> bool {
    s.len() == 42 && s.starts_with("0x") && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

fn env_or_default<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| eyre!("{key} could not be parsed: {v:?}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(name: &str, chain_id: u64) -> ChainConfig {
        ChainConfig {
            name: name.to_string(),
            rpc_url: "http://localhost:8545".to_string(),
            chain_id,
            agent_address: "0x0000000000000000000000000000000000000001".to_string(),
            start_height: 0,
            confirmations: 15,
            counterpart: None,
            fill_variant: FillVariant::Generic,
            agent_token: None,
        }
    }

    fn config(chains: Vec<ChainConfig>) -> Config {
        Config {
            database: DatabaseConfig {
                url: "postgres://localhost/test".to_string(),
            },
            chains,
            engine: EngineConfig {
                observer_poll_ms: default_observer_poll_ms(),
                engine_poll_ms: default_engine_poll_ms(),
                rpc_timeout_ms: default_rpc_timeout_ms(),
                swap_batch_size: default_swap_batch_size(),
                track_batch_size: default_track_batch_size(),
                pair_batch_size: default_pair_batch_size(),
                receipt_attempts: default_receipt_attempts(),
                fee_policy: FeePolicy::Gross,
            },
            keys: KeySourceConfig {
                kind: "env".to_string(),
                file: None,
            },
        }
    }

    #[test]
    fn valid_two_chain_config_passes() {
        let config = config(vec![chain("eth", 1), chain("bsc", 56)]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn directions_are_all_ordered_pairs() {
        let config = config(vec![chain("eth", 1), chain("bsc", 56), chain("matic", 137)]);
        let dirs = config.directions();
        assert_eq!(dirs.len(), 6);
        assert!(dirs.contains(&Direction::new("eth", "bsc")));
        assert!(dirs.contains(&Direction::new("bsc", "eth")));
        assert!(dirs.contains(&Direction::new("matic", "eth")));
    }

    #[test]
    fn single_chain_rejected() {
        let config = config(vec![chain("eth", 1)]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_chain_id_rejected() {
        let config = config(vec![chain("eth", 1), chain("bsc", 1)]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate chain id"));
    }

    #[test]
    fn underscore_in_chain_name_rejected() {
        let config = config(vec![chain("eth_main", 1), chain("bsc", 56)]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_agent_address_rejected() {
        let mut bad = chain("eth", 1);
        bad.agent_address = "not-an-address".to_string();
        let config = config(vec![bad, chain("bsc", 56)]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_counterpart_rejected() {
        let mut eth = chain("eth", 1);
        eth.counterpart = Some("matic".to_string());
        let config = config(vec![eth, chain("bsc", 56)]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_key_source_requires_path() {
        let mut config = config(vec![chain("eth", 1), chain("bsc", 56)]);
        config.keys.kind = "file".to_string();
        assert!(config.validate().is_err());
        config.keys.file = Some("/etc/swap/keys.json".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn hex_address_check() {
        assert!(is_hex_address(
            "0x0000000000000000000000000000000000000001"
        ));
        assert!(!is_hex_address("0x123"));
        assert!(!is_hex_address(
            "0x00000000000000000000000000000000000000zz"
        ));
    }
}
