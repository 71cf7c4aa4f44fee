#![allow(dead_code)]

//! Row structs for the persisted records.
//!
//! Amounts and bounds are stored as NUMERIC(78,0) and cross the boundary as
//! decimal strings: inserts cast with `$n::NUMERIC`, selects cast back with
//! `::TEXT`, so no precision is lost on 256-bit values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A swap-start event observed on a source chain. Append-only: once written
/// only the status, fill tx hash and track counter ever change.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SwapEvent {
    pub id: i64,
    pub chain: String,
    pub token_addr: String,
    pub from_addr: String,
    /// Decimal chain id carried by reverse-layout events; empty for forward
    /// events whose destination is the configured counterpart.
    pub dest_chain_id: Option<String>,
    pub amount: String,
    pub fee_amount: String,
    pub block_hash: String,
    pub tx_hash: String,
    pub height: i64,
    pub direction: String,
    pub status: String,
    pub fill_tx_hash: Option<String>,
    pub track_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// For inserting newly observed swap events.
#[derive(Debug, Clone)]
pub struct NewSwapEvent {
    pub chain: String,
    pub token_addr: String,
    pub from_addr: String,
    pub dest_chain_id: Option<String>,
    pub amount: String,
    pub fee_amount: String,
    pub block_hash: String,
    pub tx_hash: String,
    pub height: i64,
    pub direction: String,
}

/// A token-pair registration observed on a source chain.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SwapPair {
    pub id: i64,
    pub chain: String,
    pub sponsor: String,
    pub symbol: String,
    pub name: String,
    pub decimals: i32,
    pub low_bound: String,
    pub upper_bound: String,
    pub src_token_addr: String,
    pub dst_token_addr: String,
    pub block_hash: String,
    pub tx_hash: String,
    pub height: i64,
    pub direction: String,
    pub status: String,
    pub fill_tx_hash: Option<String>,
    pub track_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// For inserting newly observed pair registrations.
#[derive(Debug, Clone)]
pub struct NewSwapPair {
    pub chain: String,
    pub sponsor: String,
    pub symbol: String,
    pub name: String,
    pub decimals: i32,
    pub low_bound: String,
    pub upper_bound: String,
    pub src_token_addr: String,
    pub dst_token_addr: String,
    pub block_hash: String,
    pub tx_hash: String,
    pub height: i64,
    pub direction: String,
}

/// A re-attempt of a failed fulfillment, tied to one originating swap event.
/// Its status is independent of the original record so the first attempt's
/// audit trail survives.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RetrySwap {
    pub id: i64,
    pub swap_id: i64,
    pub status: String,
    pub fill_tx_hash: Option<String>,
    pub track_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Last fully-processed height per watched chain.
#[derive(Debug, Clone, FromRow)]
pub struct ScanCursor {
    pub chain: String,
    pub height: i64,
    pub updated_at: DateTime<Utc>,
}
