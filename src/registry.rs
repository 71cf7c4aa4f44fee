//! Swap Pair Registry: in-memory lookup from token address to pair metadata.
//!
//! One component owns both lookup directions (source token and destination
//! token) behind a single read-write lock. Readers are every swap
//! evaluation; the only writer is pair finalization, so the lock is
//! read-mostly. Bootstrapped from finalized pair records at startup.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use alloy::primitives::{Address, U256};
use eyre::{eyre, Result, WrapErr};
use sqlx::PgPool;
use tracing::info;

use crate::db::{self, SwapPair};

/// Upper bounds at or above this sentinel mean "unbounded above".
pub const MAX_UPPER_BOUND: &str = "999999999999999999999999999999999999";

/// Metadata for one live token pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairEntry {
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
    pub low_bound: U256,
    pub upper_bound: U256,
    pub src_token: Address,
    pub dst_token: Address,
}

impl PairEntry {
    /// Whether `amount` falls inside `[low_bound, upper_bound]`, both ends
    /// inclusive. An upper bound at the sentinel disables the upper check.
    pub fn bounds_ok(&self, amount: U256) -> bool {
        if amount < self.low_bound {
            return false;
        }
        self.upper_bound >= max_upper_bound() || amount <= self.upper_bound
    }

    /// Parse a persisted pair record. Unparsable bounds or addresses are a
    /// bootstrap-level fault.
    pub fn from_record(pair: &SwapPair) -> Result<Self> {
        let low_bound = U256::from_str(&pair.low_bound)
            .map_err(|_| eyre!("invalid low bound {:?} for pair {}", pair.low_bound, pair.id))?;
        let upper_bound = U256::from_str(&pair.upper_bound).map_err(|_| {
            eyre!(
                "invalid upper bound {:?} for pair {}",
                pair.upper_bound,
                pair.id
            )
        })?;
        let src_token = Address::from_str(&pair.src_token_addr)
            .wrap_err_with(|| format!("invalid source token address for pair {}", pair.id))?;
        let dst_token = Address::from_str(&pair.dst_token_addr)
            .wrap_err_with(|| format!("invalid destination token address for pair {}", pair.id))?;
        let decimals = u8::try_from(pair.decimals)
            .map_err(|_| eyre!("invalid decimals {} for pair {}", pair.decimals, pair.id))?;

        Ok(PairEntry {
            symbol: pair.symbol.clone(),
            name: pair.name.clone(),
            decimals,
            low_bound,
            upper_bound,
            src_token,
            dst_token,
        })
    }
}

pub fn max_upper_bound() -> U256 {
    U256::from_str(MAX_UPPER_BOUND).expect("sentinel bound is a valid decimal")
}

#[derive(Default)]
struct Maps {
    by_src: HashMap<Address, Arc<PairEntry>>,
    by_dst: HashMap<Address, Arc<PairEntry>>,
}

/// Shared pair lookup. Cheap to clone handles via `Arc` at the call sites.
#[derive(Default)]
pub struct PairRegistry {
    inner: RwLock<Maps>,
}

impl PairRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every finalized pair from the store. Called once at startup;
    /// a malformed persisted pair aborts the boot.
    pub async fn bootstrap(&self, pool: &PgPool) -> Result<usize> {
        let pairs = db::finalized_swap_pairs(pool).await?;
        let mut loaded = 0usize;
        for pair in &pairs {
            let entry = PairEntry::from_record(pair)?;
            self.insert(entry.clone())?;
            info!(
                symbol = %entry.symbol,
                src_token = %entry.src_token,
                dst_token = %entry.dst_token,
                "Loaded swap pair"
            );
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Register a finalized pair. Refuses a second live mapping for the
    /// same source token to a different destination token.
    pub fn insert(&self, entry: PairEntry) -> Result<()> {
        let mut maps = self.inner.write().expect("pair registry lock poisoned");

        if let Some(existing) = maps.by_src.get(&entry.src_token) {
            if existing.dst_token != entry.dst_token {
                return Err(eyre!(
                    "source token {} already maps to {}, refusing conflicting pair to {}",
                    entry.src_token,
                    existing.dst_token,
                    entry.dst_token
                ));
            }
        }

        let entry = Arc::new(entry);
        maps.by_src.insert(entry.src_token, entry.clone());
        maps.by_dst.insert(entry.dst_token, entry);
        Ok(())
    }

    /// Lookup by the token address on the pair's registration (source) chain.
    pub fn by_src_token(&self, token: &Address) -> Option<Arc<PairEntry>> {
        self.inner
            .read()
            .expect("pair registry lock poisoned")
            .by_src
            .get(token)
            .cloned()
    }

    /// Lookup by the token address on the pair's destination chain.
    pub fn by_dst_token(&self, token: &Address) -> Option<Arc<PairEntry>> {
        self.inner
            .read()
            .expect("pair registry lock poisoned")
            .by_dst
            .get(token)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("pair registry lock poisoned")
            .by_src
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for PairRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairRegistry")
            .field("pairs", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(src: u8, dst: u8, low: u64, upper: &str) -> PairEntry {
        PairEntry {
            symbol: "TST".to_string(),
            name: "Test Token".to_string(),
            decimals: 18,
            low_bound: U256::from(low),
            upper_bound: U256::from_str(upper).unwrap(),
            src_token: Address::repeat_byte(src),
            dst_token: Address::repeat_byte(dst),
        }
    }

    #[test]
    fn bounds_inclusive_at_both_ends() {
        let pair = entry(0x01, 0x02, 1000, "500000");
        assert!(!pair.bounds_ok(U256::from(999u64)));
        assert!(pair.bounds_ok(U256::from(1000u64)));
        assert!(pair.bounds_ok(U256::from(250_000u64)));
        assert!(pair.bounds_ok(U256::from(500_000u64)));
        assert!(!pair.bounds_ok(U256::from(500_001u64)));
    }

    #[test]
    fn sentinel_upper_bound_is_unbounded() {
        let pair = entry(0x01, 0x02, 1, MAX_UPPER_BOUND);
        assert!(pair.bounds_ok(U256::from(u64::MAX) * U256::from(u64::MAX)));
        assert!(!pair.bounds_ok(U256::ZERO));
    }

    #[test]
    fn lookup_both_directions() {
        let registry = PairRegistry::new();
        registry.insert(entry(0x01, 0x02, 0, "100")).unwrap();

        let by_src = registry.by_src_token(&Address::repeat_byte(0x01)).unwrap();
        assert_eq!(by_src.dst_token, Address::repeat_byte(0x02));

        let by_dst = registry.by_dst_token(&Address::repeat_byte(0x02)).unwrap();
        assert_eq!(by_dst.src_token, Address::repeat_byte(0x01));

        assert!(registry.by_src_token(&Address::repeat_byte(0x03)).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn conflicting_mapping_refused() {
        let registry = PairRegistry::new();
        registry.insert(entry(0x01, 0x02, 0, "100")).unwrap();

        // Same source, different destination: refused.
        assert!(registry.insert(entry(0x01, 0x03, 0, "100")).is_err());

        // Re-registering the same mapping is fine (bounds may be refreshed).
        assert!(registry.insert(entry(0x01, 0x02, 5, "200")).is_ok());
        let updated = registry.by_src_token(&Address::repeat_byte(0x01)).unwrap();
        assert_eq!(updated.low_bound, U256::from(5u64));
    }

    #[test]
    fn concurrent_readers_share_entries() {
        let registry = Arc::new(PairRegistry::new());
        registry.insert(entry(0x01, 0x02, 0, "100")).unwrap();

        tokio_test::block_on(async {
            let mut handles = Vec::new();
            for _ in 0..8 {
                let registry = registry.clone();
                handles.push(tokio::spawn(async move {
                    registry.by_src_token(&Address::repeat_byte(0x01)).is_some()
                }));
            }
            for handle in handles {
                assert!(handle.await.unwrap());
            }
        });
    }

    #[test]
    fn from_record_rejects_bad_bounds() {
        let record = SwapPair {
            id: 1,
            chain: "eth".to_string(),
            sponsor: "0x0000000000000000000000000000000000000001".to_string(),
            symbol: "TST".to_string(),
            name: "Test".to_string(),
            decimals: 18,
            low_bound: "not-a-number".to_string(),
            upper_bound: "100".to_string(),
            src_token_addr: "0x0000000000000000000000000000000000000002".to_string(),
            dst_token_addr: "0x0000000000000000000000000000000000000003".to_string(),
            block_hash: String::new(),
            tx_hash: String::new(),
            height: 0,
            direction: "eth_bsc".to_string(),
            status: "finalized".to_string(),
            fill_tx_hash: None,
            track_attempts: 0,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        assert!(PairEntry::from_record(&record).is_err());
    }
}
