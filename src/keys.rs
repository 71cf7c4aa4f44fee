//! Key Source collaborator.
//!
//! Signing keys are fetched once at startup and live only in process memory;
//! nothing here is ever persisted. The trait is the seam where a remote
//! secret manager would plug in; this crate ships the local environment
//! source and a JSON key-file source.

use std::collections::HashMap;

use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};

use crate::config::KeySourceConfig;

/// Per-chain signing key material, keyed by chain name. Values are hex
/// private keys (0x-prefixed or bare).
pub type KeyMaterial = HashMap<String, String>;

#[async_trait]
pub trait KeySource: Send + Sync {
    /// Fetch signing keys for the given chains. Missing key material is an
    /// error; this core expects no retry semantics from the source.
    async fn signing_keys(&self, chains: &[String]) -> Result<KeyMaterial>;
}

/// Reads `{NAME}_PRIVATE_KEY` environment variables, e.g. `ETH_PRIVATE_KEY`
/// for a chain named `eth`.
pub struct EnvKeySource;

#[async_trait]
impl KeySource for EnvKeySource {
    async fn signing_keys(&self, chains: &[String]) -> Result<KeyMaterial> {
        let mut keys = HashMap::with_capacity(chains.len());
        for chain in chains {
            let var = format!("{}_PRIVATE_KEY", chain.to_uppercase());
            let key = std::env::var(&var)
                .map_err(|_| eyre!("{var} environment variable is required"))?;
            keys.insert(chain.clone(), key);
        }
        Ok(keys)
    }
}

/// Reads a JSON object mapping chain name to hex private key from a file.
/// Stands in for a remote secret-manager lookup.
pub struct FileKeySource {
    path: String,
}

impl FileKeySource {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl KeySource for FileKeySource {
    async fn signing_keys(&self, chains: &[String]) -> Result<KeyMaterial> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .wrap_err_with(|| format!("Failed to read key file {}", self.path))?;
        let all: HashMap<String, String> = serde_json::from_str(&raw)
            .wrap_err_with(|| format!("Key file {} is not a JSON object of strings", self.path))?;

        let mut keys = HashMap::with_capacity(chains.len());
        for chain in chains {
            let key = all
                .get(chain)
                .ok_or_else(|| eyre!("key file {} has no entry for chain {}", self.path, chain))?;
            keys.insert(chain.clone(), key.clone());
        }
        Ok(keys)
    }
}

/// Build the configured key source.
pub fn from_config(cfg: &KeySourceConfig) -> Result<Box<dyn KeySource>> {
    match cfg.kind.as_str() {
        "env" => Ok(Box::new(EnvKeySource)),
        "file" => {
            let path = cfg
                .file
                .as_ref()
                .ok_or_else(|| eyre!("KEY_FILE is required when KEY_SOURCE=file"))?;
            Ok(Box::new(FileKeySource::new(path.clone())))
        }
        other => Err(eyre!("unknown KEY_SOURCE {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_source_reads_json_map() {
        let dir = std::env::temp_dir();
        let path = dir.join("swap-operator-keys-test.json");
        tokio::fs::write(
            &path,
            r#"{"eth": "0x01", "bsc": "0x02"}"#,
        )
        .await
        .unwrap();

        let source = FileKeySource::new(path.to_string_lossy().to_string());
        let keys = source
            .signing_keys(&["eth".to_string(), "bsc".to_string()])
            .await
            .unwrap();
        assert_eq!(keys["eth"], "0x01");
        assert_eq!(keys["bsc"], "0x02");

        let missing = source.signing_keys(&["matic".to_string()]).await;
        assert!(missing.is_err());

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn env_source_requires_every_chain() {
        std::env::set_var("TESTNETA_PRIVATE_KEY", "0xab");
        let source = EnvKeySource;
        let keys = source
            .signing_keys(&["testneta".to_string()])
            .await
            .unwrap();
        assert_eq!(keys["testneta"], "0xab");

        let missing = source.signing_keys(&["testnetb".to_string()]).await;
        assert!(missing.is_err());
        std::env::remove_var("TESTNETA_PRIVATE_KEY");
    }
}
