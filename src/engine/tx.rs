//! Fulfillment transaction building, signing and submission.
//!
//! The whole nonce/gas/sign/broadcast sequence for one destination chain
//! runs under that chain's submission lock, so two pipelines targeting the
//! same chain can never race on a nonce.

use std::str::FromStr;

use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::rpc::types::TransactionRequest;
use alloy::sol_types::SolCall;
use eyre::{eyre, Result};
use tracing::debug;

use crate::chain::ChainContext;
use crate::contracts::SwapAgent;
use crate::db::{SwapEvent, SwapPair};
use crate::registry::PairEntry;
use crate::types::{FeePolicy, FillVariant};

/// Amounts derived from one swap event under the configured fee policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapAmounts {
    /// What the pair bound check applies to.
    pub checked: U256,
    /// What the destination agent is asked to release: always net of fee.
    pub fill: U256,
}

pub fn swap_amounts(swap: &SwapEvent, policy: FeePolicy) -> Result<SwapAmounts> {
    let amount = U256::from_str(&swap.amount)
        .map_err(|_| eyre!("swap {}: invalid amount {:?}", swap.id, swap.amount))?;
    let fee = U256::from_str(&swap.fee_amount)
        .map_err(|_| eyre!("swap {}: invalid fee {:?}", swap.id, swap.fee_amount))?;

    let net = amount.saturating_sub(fee);
    let checked = match policy {
        FeePolicy::Gross => amount,
        FeePolicy::Net => net,
    };

    Ok(SwapAmounts { checked, fill: net })
}

/// ABI-encode the fill call the destination agent accepts.
pub fn encode_fill(
    dest: &ChainContext,
    swap: &SwapEvent,
    pair: &PairEntry,
    fill_amount: U256,
) -> Result<Bytes> {
    let to_address = Address::from_str(&swap.from_addr)
        .map_err(|_| eyre!("swap {}: invalid recipient {:?}", swap.id, swap.from_addr))?;
    let source_tx_hash = B256::from_str(&swap.tx_hash)
        .map_err(|_| eyre!("swap {}: invalid source tx hash {:?}", swap.id, swap.tx_hash))?;

    let data = match dest.fill_variant {
        FillVariant::Eth2Bsc => SwapAgent::fillETH2BSCSwapCall {
            ethTxHash: source_tx_hash,
            erc20Addr: pair.src_token,
            toAddress: to_address,
            amount: fill_amount,
        }
        .abi_encode(),
        FillVariant::Bsc2Eth => SwapAgent::fillBSC2ETHSwapCall {
            bscTxHash: source_tx_hash,
            erc20Addr: pair.src_token,
            toAddress: to_address,
            amount: fill_amount,
        }
        .abi_encode(),
        FillVariant::Generic => SwapAgent::fillSwapCall {
            swapNonce: U256::ZERO,
            toChainId: U256::from(dest.chain_id),
            toAddress: to_address,
            amount: fill_amount,
        }
        .abi_encode(),
    };

    Ok(data.into())
}

/// ABI-encode the `createSwapPair` call for a confirmed registration.
pub fn encode_create_pair(pair: &SwapPair) -> Result<Bytes> {
    let register_tx_hash = B256::from_str(&pair.tx_hash)
        .map_err(|_| eyre!("pair {}: invalid register tx hash {:?}", pair.id, pair.tx_hash))?;
    let src_token = Address::from_str(&pair.src_token_addr)
        .map_err(|_| eyre!("pair {}: invalid source token", pair.id))?;
    let dst_token = Address::from_str(&pair.dst_token_addr)
        .map_err(|_| eyre!("pair {}: invalid destination token", pair.id))?;
    let decimals = u8::try_from(pair.decimals)
        .map_err(|_| eyre!("pair {}: invalid decimals {}", pair.id, pair.decimals))?;

    Ok(SwapAgent::createSwapPairCall {
        registerTxHash: register_tx_hash,
        erc20Addr: src_token,
        bep20Addr: dst_token,
        name: pair.name.clone(),
        symbol: pair.symbol.clone(),
        decimals,
    }
    .abi_encode()
    .into())
}

/// Acquire the destination chain's submission lock, then read the pending
/// nonce and suggested gas price, estimate gas, sign and broadcast.
/// Returns the broadcast transaction hash.
pub async fn submit_call(dest: &ChainContext, input: Bytes) -> Result<B256> {
    let _guard = dest.lock_submission().await;

    let nonce = dest.pending_nonce().await?;
    let gas_price = dest.gas_price().await?;

    let tx = TransactionRequest::default()
        .with_from(dest.operator)
        .with_to(dest.agent)
        .with_value(U256::ZERO)
        .with_input(input)
        .with_chain_id(dest.chain_id);
    let gas_limit = dest.estimate_gas(&tx).await?;

    let tx = tx
        .with_nonce(nonce)
        .with_gas_price(gas_price)
        .with_gas_limit(gas_limit);

    debug!(
        chain = %dest.name,
        nonce,
        gas_price,
        gas_limit,
        "Submitting fulfillment transaction"
    );

    let hash = dest.submit(tx).await?;
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChainConfig, EngineConfig};
    use chrono::Utc;

    fn swap(amount: &str, fee: &str) -> SwapEvent {
        SwapEvent {
            id: 1,
            chain: "eth".to_string(),
            token_addr: "0x1111111111111111111111111111111111111111".to_string(),
            from_addr: "0x2222222222222222222222222222222222222222".to_string(),
            dest_chain_id: None,
            amount: amount.to_string(),
            fee_amount: fee.to_string(),
            block_hash: "0x0303030303030303030303030303030303030303030303030303030303030303"
                .to_string(),
            tx_hash: "0x0404040404040404040404040404040404040404040404040404040404040404"
                .to_string(),
            height: 80,
            direction: "eth_bsc".to_string(),
            status: "confirmed".to_string(),
            fill_tx_hash: None,
            track_attempts: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn pair_entry() -> PairEntry {
        PairEntry {
            symbol: "TST".to_string(),
            name: "Test".to_string(),
            decimals: 18,
            low_bound: U256::ZERO,
            upper_bound: U256::from(1_000_000u64),
            src_token: Address::repeat_byte(0x11),
            dst_token: Address::repeat_byte(0x12),
        }
    }

    fn context(variant: FillVariant) -> ChainContext {
        let cfg = ChainConfig {
            name: "bsc".to_string(),
            rpc_url: "http://localhost:8545".to_string(),
            chain_id: 56,
            agent_address: "0x000000000000000000000000000000000000aaaa".to_string(),
            start_height: 0,
            confirmations: 15,
            counterpart: None,
            fill_variant: variant,
            agent_token: None,
        };
        let engine = EngineConfig {
            observer_poll_ms: 1000,
            engine_poll_ms: 1000,
            rpc_timeout_ms: 1000,
            swap_batch_size: 50,
            track_batch_size: 100,
            pair_batch_size: 5,
            receipt_attempts: 30,
            fee_policy: FeePolicy::Gross,
        };
        // Anvil's well-known throwaway key; nothing here touches the network.
        ChainContext::new(
            &cfg,
            &engine,
            "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
        )
        .unwrap()
    }

    #[test]
    fn amounts_follow_fee_policy() {
        let record = swap("5000", "30");

        let gross = swap_amounts(&record, FeePolicy::Gross).unwrap();
        assert_eq!(gross.checked, U256::from(5000u64));
        assert_eq!(gross.fill, U256::from(4970u64));

        let net = swap_amounts(&record, FeePolicy::Net).unwrap();
        assert_eq!(net.checked, U256::from(4970u64));
        assert_eq!(net.fill, U256::from(4970u64));
    }

    #[test]
    fn fee_larger_than_amount_saturates() {
        let record = swap("10", "30");
        let amounts = swap_amounts(&record, FeePolicy::Net).unwrap();
        assert_eq!(amounts.checked, U256::ZERO);
        assert_eq!(amounts.fill, U256::ZERO);
    }

    #[test]
    fn bad_amount_is_an_error() {
        let record = swap("not-a-number", "0");
        assert!(swap_amounts(&record, FeePolicy::Gross).is_err());
    }

    #[test]
    fn fill_selector_matches_destination_variant() {
        let record = swap("5000", "30");
        let pair = pair_entry();

        let eth2bsc = encode_fill(
            &context(FillVariant::Eth2Bsc),
            &record,
            &pair,
            U256::from(4970u64),
        )
        .unwrap();
        assert_eq!(&eth2bsc[..4], SwapAgent::fillETH2BSCSwapCall::SELECTOR.as_slice());

        let bsc2eth = encode_fill(
            &context(FillVariant::Bsc2Eth),
            &record,
            &pair,
            U256::from(4970u64),
        )
        .unwrap();
        assert_eq!(&bsc2eth[..4], SwapAgent::fillBSC2ETHSwapCall::SELECTOR.as_slice());

        let generic = encode_fill(
            &context(FillVariant::Generic),
            &record,
            &pair,
            U256::from(4970u64),
        )
        .unwrap();
        assert_eq!(&generic[..4], SwapAgent::fillSwapCall::SELECTOR.as_slice());

        // The generic call carries the destination chain id.
        let decoded = SwapAgent::fillSwapCall::abi_decode(&generic, true).unwrap();
        assert_eq!(decoded.toChainId, U256::from(56u64));
        assert_eq!(decoded.swapNonce, U256::ZERO);
    }

    #[test]
    fn fill_carries_source_tx_hash_and_recipient() {
        let record = swap("5000", "30");
        let pair = pair_entry();
        let encoded = encode_fill(
            &context(FillVariant::Eth2Bsc),
            &record,
            &pair,
            U256::from(4970u64),
        )
        .unwrap();

        let decoded = SwapAgent::fillETH2BSCSwapCall::abi_decode(&encoded, true).unwrap();
        assert_eq!(
            format!("{:?}", decoded.ethTxHash),
            record.tx_hash
        );
        assert_eq!(format!("{:?}", decoded.toAddress), record.from_addr);
        assert_eq!(decoded.erc20Addr, pair.src_token);
        assert_eq!(decoded.amount, U256::from(4970u64));
    }

    #[test]
    fn create_pair_encoding_round_trips() {
        let record = SwapPair {
            id: 7,
            chain: "eth".to_string(),
            sponsor: "0x3333333333333333333333333333333333333333".to_string(),
            symbol: "TST".to_string(),
            name: "Test Token".to_string(),
            decimals: 18,
            low_bound: "0".to_string(),
            upper_bound: "100".to_string(),
            src_token_addr: "0x1111111111111111111111111111111111111111".to_string(),
            dst_token_addr: "0x2222222222222222222222222222222222222222".to_string(),
            block_hash: "0x0505050505050505050505050505050505050505050505050505050505050505"
                .to_string(),
            tx_hash: "0x0606060606060606060606060606060606060606060606060606060606060606"
                .to_string(),
            height: 10,
            direction: "eth_bsc".to_string(),
            status: "confirmed".to_string(),
            fill_tx_hash: None,
            track_attempts: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let encoded = encode_create_pair(&record).unwrap();
        let decoded = SwapAgent::createSwapPairCall::abi_decode(&encoded, true).unwrap();
        assert_eq!(decoded.name, "Test Token");
        assert_eq!(decoded.symbol, "TST");
        assert_eq!(decoded.decimals, 18);
        assert_eq!(format!("{:?}", decoded.registerTxHash), record.tx_hash);

        let bad_decimals = SwapPair {
            decimals: 300,
            ..record
        };
        assert!(encode_create_pair(&bad_decimals).is_err());
    }
}
