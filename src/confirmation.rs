//! Receipt polling for submitted fulfillment transactions.
//!
//! The track-sent stages only need two RPC methods, so this talks plain
//! JSON-RPC over reqwest instead of going through the provider stack.

use eyre::{eyre, Result};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

/// Outcome of one receipt poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptStatus {
    /// No receipt yet; the transaction may still be in the mempool.
    NotFound,
    /// Mined and executed successfully.
    Success { block_number: Option<u64> },
    /// Mined but reverted.
    Reverted,
}

/// EVM transaction receipt, reduced to the fields the tracker reads.
#[derive(Debug, Deserialize)]
struct TransactionReceipt {
    #[serde(rename = "blockNumber")]
    block_number: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i32,
    message: String,
}

/// Minimal JSON-RPC client for receipt checks.
#[derive(Clone)]
pub struct ReceiptChecker {
    client: Client,
    rpc_url: String,
}

impl ReceiptChecker {
    pub fn new(rpc_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            rpc_url: rpc_url.to_string(),
        })
    }

    /// Poll the receipt for a 0x-prefixed transaction hash.
    pub async fn check(&self, tx_hash: &str) -> Result<ReceiptStatus> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_getTransactionReceipt",
            "params": [tx_hash],
            "id": 1
        });

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await?
            .json::<RpcResponse<TransactionReceipt>>()
            .await?;

        if let Some(error) = response.error {
            return Err(eyre!("RPC error: {} - {}", error.code, error.message));
        }

        let Some(receipt) = response.result else {
            return Ok(ReceiptStatus::NotFound);
        };

        if receipt.status.as_deref() == Some("0x0") {
            return Ok(ReceiptStatus::Reverted);
        }

        let block_number = receipt
            .block_number
            .as_deref()
            .and_then(|hex| u64::from_str_radix(hex.trim_start_matches("0x"), 16).ok());

        Ok(ReceiptStatus::Success { block_number })
    }
}

impl std::fmt::Debug for ReceiptChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiptChecker")
            .field("rpc_url", &self.rpc_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipt_response_parses_success() {
        let raw = r#"{"result":{"blockNumber":"0x64","status":"0x1"},"error":null}"#;
        let parsed: RpcResponse<TransactionReceipt> = serde_json::from_str(raw).unwrap();
        let receipt = parsed.result.unwrap();
        assert_eq!(receipt.status.as_deref(), Some("0x1"));
        assert_eq!(
            u64::from_str_radix(
                receipt.block_number.unwrap().trim_start_matches("0x"),
                16
            )
            .unwrap(),
            100
        );
    }

    #[test]
    fn receipt_response_parses_revert_and_missing() {
        let raw = r#"{"result":{"blockNumber":"0x64","status":"0x0"},"error":null}"#;
        let parsed: RpcResponse<TransactionReceipt> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.result.unwrap().status.as_deref(), Some("0x0"));

        let raw = r#"{"result":null,"error":null}"#;
        let parsed: RpcResponse<TransactionReceipt> = serde_json::from_str(raw).unwrap();
        assert!(parsed.result.is_none());
    }
}
