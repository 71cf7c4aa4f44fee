//! Chain Client Adapter: one RPC handle per watched chain.
//!
//! A `ChainContext` bundles everything the pipelines need to talk to one
//! chain: the read provider, the wallet-backed provider for submission, the
//! agent contract address, the configured fill variant and the per-chain
//! submission lock. Nonce correctness requires that the whole
//! "pending nonce → sign → submit" sequence is serialized per chain, so the
//! lock lives here, owned by the adapter, and every pipeline targeting this
//! chain queues on it.
//!
//! Every network call is bounded by the configured RPC deadline; a timed-out
//! call surfaces as [`RpcError::Timeout`] with no other side effects.

use std::future::IntoFuture;
use std::str::FromStr;
use std::time::Duration;

use alloy::network::{Ethereum, EthereumWallet};
use alloy::primitives::{Address, B256};
use alloy::providers::fillers::{FillProvider, JoinFill, WalletFiller};
use alloy::providers::{Identity, Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{BlockTransactionsKind, Filter, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::http::{Client, Http};
use alloy::transports::TransportError;
use eyre::{Result, WrapErr};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{ChainConfig, EngineConfig};
use crate::confirmation::ReceiptChecker;
use crate::events::{self, AgentEvent, PAIR_REGISTER_TOPIC, SWAP_STARTED_TOPIC};
use crate::types::FillVariant;

/// Read-only provider.
pub type ReadProvider = RootProvider<Http<Client>>;

/// Provider with the chain's signing key attached. Nonce, gas and chain id
/// are always set explicitly by the caller, so no other fillers are used.
pub type WalletProvider = FillProvider<
    JoinFill<Identity, WalletFiller<EthereumWallet>>,
    RootProvider<Http<Client>>,
    Http<Client>,
    Ethereum,
>;

/// RPC failure surfaced to the polling loops. Both variants are transient:
/// the caller leaves persisted state untouched and retries next tick.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc call exceeded the {0:?} deadline")]
    Timeout(Duration),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// One extracted event plus the log coordinates it came from.
#[derive(Debug, Clone)]
pub struct ExtractedEvent {
    pub event: AgentEvent,
    pub tx_hash: B256,
    pub log_index: u64,
}

/// All agent events found at one height. Produced per scanned block and
/// consumed immediately by the observer; never persisted as a unit.
#[derive(Debug, Clone)]
pub struct BlockEventBatch {
    pub chain: String,
    pub height: u64,
    pub block_hash: B256,
    pub parent_hash: B256,
    pub block_time: u64,
    pub events: Vec<ExtractedEvent>,
}

/// Per-chain RPC handle and signing context.
pub struct ChainContext {
    pub name: String,
    pub chain_id: u64,
    pub agent: Address,
    pub fill_variant: FillVariant,
    pub agent_token: Option<Address>,
    pub confirmations: u64,
    pub operator: Address,
    pub receipts: ReceiptChecker,
    provider: ReadProvider,
    wallet_provider: WalletProvider,
    submit_lock: Mutex<()>,
    rpc_timeout: Duration,
}

impl ChainContext {
    /// Build the context for one chain. A bad agent address or unparsable
    /// key is a configuration-level fault and aborts startup.
    pub fn new(cfg: &ChainConfig, engine: &EngineConfig, private_key: &str) -> Result<Self> {
        let agent = Address::from_str(&cfg.agent_address)
            .wrap_err_with(|| format!("chain {}: invalid agent address", cfg.name))?;
        let agent_token = cfg
            .agent_token
            .as_deref()
            .map(Address::from_str)
            .transpose()
            .wrap_err_with(|| format!("chain {}: invalid agent token address", cfg.name))?;

        let signer: PrivateKeySigner = private_key
            .parse()
            .wrap_err_with(|| format!("chain {}: invalid private key", cfg.name))?;
        let operator = signer.address();

        let url: reqwest::Url = cfg
            .rpc_url
            .parse()
            .wrap_err_with(|| format!("chain {}: invalid RPC URL", cfg.name))?;
        let provider = ProviderBuilder::new().on_http(url.clone());
        let wallet_provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .on_http(url);

        let receipts = ReceiptChecker::new(&cfg.rpc_url, engine.rpc_timeout())?;

        Ok(Self {
            name: cfg.name.clone(),
            chain_id: cfg.chain_id,
            agent,
            fill_variant: cfg.fill_variant,
            agent_token,
            confirmations: cfg.confirmations,
            operator,
            receipts,
            provider,
            wallet_provider,
            submit_lock: Mutex::new(()),
            rpc_timeout: engine.rpc_timeout(),
        })
    }

    /// Serialize a nonce/sign/submit critical section against this chain.
    pub async fn lock_submission(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.submit_lock.lock().await
    }

    /// Current chain tip height.
    pub async fn tip_height(&self) -> Result<u64, RpcError> {
        self.with_timeout(self.provider.get_block_number()).await
    }

    /// Header and agent logs at one exact height. `None` when the chain tip
    /// has not reached the height yet.
    pub async fn block_events(&self, height: u64) -> Result<Option<BlockEventBatch>, RpcError> {
        let block = self
            .with_timeout(
                self.provider
                    .get_block_by_number(height.into(), BlockTransactionsKind::Hashes),
            )
            .await?;
        let Some(block) = block else {
            return Ok(None);
        };

        let filter = Filter::new()
            .address(self.agent)
            .from_block(height)
            .to_block(height);
        let logs = self.with_timeout(self.provider.get_logs(&filter)).await?;

        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            let topic0 = log.topics().first().copied();
            match events::extract(self.fill_variant, &log) {
                Some(event) => {
                    let (Some(tx_hash), Some(log_index)) = (log.transaction_hash, log.log_index)
                    else {
                        warn!(
                            chain = %self.name,
                            height,
                            "agent log missing tx hash or index, skipping"
                        );
                        continue;
                    };
                    events.push(ExtractedEvent {
                        event,
                        tx_hash,
                        log_index,
                    });
                }
                None => {
                    // Only worth a warning when the topic claimed to be ours.
                    if topic0 == Some(SWAP_STARTED_TOPIC) || topic0 == Some(PAIR_REGISTER_TOPIC) {
                        warn!(
                            chain = %self.name,
                            height,
                            tx_hash = ?log.transaction_hash,
                            data = %hex::encode(log.data().data.as_ref()),
                            "failed to decode agent log, skipping"
                        );
                    } else {
                        debug!(chain = %self.name, height, "ignoring unrelated agent log");
                    }
                }
            }
        }

        Ok(Some(BlockEventBatch {
            chain: self.name.clone(),
            height,
            block_hash: block.header.hash,
            parent_hash: block.header.parent_hash,
            block_time: block.header.timestamp,
            events,
        }))
    }

    /// Pending nonce for the operator account.
    pub async fn pending_nonce(&self) -> Result<u64, RpcError> {
        self.with_timeout(self.provider.get_transaction_count(self.operator).pending())
            .await
    }

    /// Suggested gas price.
    pub async fn gas_price(&self) -> Result<u128, RpcError> {
        self.with_timeout(self.provider.get_gas_price()).await
    }

    /// Estimate gas for a call.
    pub async fn estimate_gas(&self, tx: &TransactionRequest) -> Result<u64, RpcError> {
        self.with_timeout(self.provider.estimate_gas(tx)).await
    }

    /// Sign and broadcast. Callers must hold the submission lock and have
    /// filled nonce, gas price, gas limit and chain id.
    pub async fn submit(&self, tx: TransactionRequest) -> Result<B256, RpcError> {
        let pending = self
            .with_timeout(self.wallet_provider.send_transaction(tx))
            .await?;
        Ok(*pending.tx_hash())
    }

    async fn with_timeout<T, F>(&self, fut: F) -> Result<T, RpcError>
    where
        F: IntoFuture<Output = Result<T, TransportError>>,
    {
        match tokio::time::timeout(self.rpc_timeout, fut.into_future()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(RpcError::Transport(err)),
            Err(_) => Err(RpcError::Timeout(self.rpc_timeout)),
        }
    }
}

impl std::fmt::Debug for ChainContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainContext")
            .field("name", &self.name)
            .field("chain_id", &self.chain_id)
            .field("agent", &self.agent)
            .field("fill_variant", &self.fill_variant)
            .field("operator", &self.operator)
            .field("confirmations", &self.confirmations)
            .finish()
    }
}
