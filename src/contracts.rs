//! Swap-agent contract ABI definition.
//!
//! Uses alloy's sol! macro to generate type-safe call encodings for the
//! agent's fulfillment entrypoints. Three fill variants exist in the wild:
//! the two chain-specific calls taken by older agent deployments and the
//! generalized `fillSwap` that carries an explicit destination chain id.
//! Which one a destination accepts is per-chain configuration.

use alloy::sol;

sol! {
    contract SwapAgent {
        /// Fill a forward swap on the destination agent. `erc20Addr`
        /// identifies the source-chain token; the agent maps it to its
        /// local mirror and enforces one fill per source tx hash.
        function fillETH2BSCSwap(
            bytes32 ethTxHash,
            address erc20Addr,
            address toAddress,
            uint256 amount
        ) external;

        /// Fill a reverse swap; same shape keyed by the source tx hash.
        function fillBSC2ETHSwap(
            bytes32 bscTxHash,
            address erc20Addr,
            address toAddress,
            uint256 amount
        ) external;

        /// Generalized fill. The leading word is reserved and always zero.
        function fillSwap(
            uint256 swapNonce,
            uint256 toChainId,
            address toAddress,
            uint256 amount
        ) external;

        /// Create the destination-side half of a registered token pair.
        function createSwapPair(
            bytes32 registerTxHash,
            address erc20Addr,
            address bep20Addr,
            string name,
            string symbol,
            uint8 decimals
        ) external;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{b256, Address, U256};
    use alloy::sol_types::SolCall;

    #[test]
    fn fill_swap_encodes_reserved_zero_word() {
        let call = SwapAgent::fillSwapCall {
            swapNonce: U256::ZERO,
            toChainId: U256::from(56u64),
            toAddress: Address::repeat_byte(0x11),
            amount: U256::from(1000u64),
        };
        let encoded = call.abi_encode();
        // 4-byte selector + 4 words
        assert_eq!(encoded.len(), 4 + 32 * 4);
        // Reserved word is zero.
        assert!(encoded[4..36].iter().all(|b| *b == 0));
        // toChainId = 56 in the second word.
        assert_eq!(encoded[67], 56);
    }

    #[test]
    fn fill_eth2bsc_carries_source_tx_hash() {
        let tx_hash = b256!("7b2b39fe8cb99baf3c533665217a130daefeee1af6329eca59c5bf06a53999ac");
        let call = SwapAgent::fillETH2BSCSwapCall {
            ethTxHash: tx_hash,
            erc20Addr: Address::repeat_byte(0x22),
            toAddress: Address::repeat_byte(0x33),
            amount: U256::from(7u64),
        };
        let encoded = call.abi_encode();
        assert_eq!(&encoded[4..36], tx_hash.as_slice());
    }

    #[test]
    fn create_swap_pair_encodes_metadata() {
        let call = SwapAgent::createSwapPairCall {
            registerTxHash: b256!(
                "06101386f3a9dd45570dce2027311173d0e136955e5b912edece89cca5bb526d"
            ),
            erc20Addr: Address::repeat_byte(0x01),
            bep20Addr: Address::repeat_byte(0x02),
            name: "Wrapped Test".to_string(),
            symbol: "WTST".to_string(),
            decimals: 18,
        };
        let encoded = call.abi_encode();
        let decoded = SwapAgent::createSwapPairCall::abi_decode(&encoded, true).unwrap();
        assert_eq!(decoded.name, "Wrapped Test");
        assert_eq!(decoded.symbol, "WTST");
        assert_eq!(decoded.decimals, 18);
    }
}
