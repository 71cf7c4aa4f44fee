#![allow(dead_code)]

//! Persistent store: Postgres via sqlx.
//!
//! The database is the single source of truth for every record status. All
//! stage transitions go through the conditional `transition_*` helpers,
//! which compare-and-set on the current status and report whether the row
//! actually moved; a `false` return means another loop got there first (or
//! the record is already terminal) and the caller must treat the tick as a
//! no-op. Swap events and pair registrations are unique on
//! `(chain, tx_hash)`, which makes the observer's at-least-once delivery
//! safe to replay.

use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

pub mod models;

pub use models::*;

use crate::types::{PairStatus, RetryStatus, SwapStatus};

/// Create a database connection pool.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/).
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Scan cursors
// ---------------------------------------------------------------------------

/// Last fully-processed height for a chain, if any.
pub async fn get_scan_cursor(pool: &PgPool, chain: &str) -> Result<Option<i64>> {
    let row: Option<(i64,)> =
        sqlx::query_as(r#"SELECT height FROM scan_cursors WHERE chain = $1"#)
            .bind(chain)
            .fetch_optional(pool)
            .await
            .wrap_err("Failed to get scan cursor")?;

    Ok(row.map(|r| r.0))
}

/// Advance a chain's cursor. Called only after the height's events are
/// durably persisted; the height never decreases.
pub async fn upsert_scan_cursor(pool: &PgPool, chain: &str, height: i64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO scan_cursors (chain, height, updated_at)
        VALUES ($1, $2, NOW())
        ON CONFLICT (chain) DO UPDATE
            SET height = GREATEST(scan_cursors.height, EXCLUDED.height), updated_at = NOW()
        "#,
    )
    .bind(chain)
    .bind(height)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to advance scan cursor for {chain}"))?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Swap events
// ---------------------------------------------------------------------------

/// Insert a newly observed swap event in `received` status. Returns `None`
/// when the (chain, tx_hash) pair was already recorded.
pub async fn insert_swap_event(pool: &PgPool, event: &NewSwapEvent) -> Result<Option<i64>> {
    let row = sqlx::query(
        r#"
        INSERT INTO swap_events (chain, token_addr, from_addr, dest_chain_id, amount,
            fee_amount, block_hash, tx_hash, height, direction, status)
        VALUES ($1, $2, $3, $4, $5::NUMERIC, $6::NUMERIC, $7, $8, $9, $10, 'received')
        ON CONFLICT (chain, tx_hash) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(&event.chain)
    .bind(&event.token_addr)
    .bind(&event.from_addr)
    .bind(&event.dest_chain_id)
    .bind(&event.amount)
    .bind(&event.fee_amount)
    .bind(&event.block_hash)
    .bind(&event.tx_hash)
    .bind(event.height)
    .bind(&event.direction)
    .fetch_optional(pool)
    .await
    .wrap_err("Failed to insert swap event")?;

    Ok(row.map(|r| r.get("id")))
}

/// Batched status-filtered scan for one direction, oldest first.
pub async fn swap_events_by_status(
    pool: &PgPool,
    direction: &str,
    status: SwapStatus,
    limit: i64,
) -> Result<Vec<SwapEvent>> {
    let rows = sqlx::query_as::<_, SwapEvent>(
        r#"SELECT id, chain, token_addr, from_addr, dest_chain_id, amount::TEXT as amount,
                  fee_amount::TEXT as fee_amount, block_hash, tx_hash, height, direction,
                  status, fill_tx_hash, track_attempts, created_at, updated_at
           FROM swap_events
           WHERE direction = $1 AND status = $2
           ORDER BY id ASC
           LIMIT $3"#,
    )
    .bind(direction)
    .bind(status.as_str())
    .bind(limit)
    .fetch_all(pool)
    .await
    .wrap_err("Failed to scan swap events by status")?;

    Ok(rows)
}

/// Fetch one swap event by id.
pub async fn get_swap_event(pool: &PgPool, id: i64) -> Result<Option<SwapEvent>> {
    let row = sqlx::query_as::<_, SwapEvent>(
        r#"SELECT id, chain, token_addr, from_addr, dest_chain_id, amount::TEXT as amount,
                  fee_amount::TEXT as fee_amount, block_hash, tx_hash, height, direction,
                  status, fill_tx_hash, track_attempts, created_at, updated_at
           FROM swap_events WHERE id = $1"#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .wrap_err("Failed to get swap event")?;

    Ok(row)
}

/// Compare-and-set status transition. Returns whether the row moved.
pub async fn transition_swap(
    pool: &PgPool,
    id: i64,
    from: SwapStatus,
    to: SwapStatus,
) -> Result<bool> {
    let result = sqlx::query(
        r#"UPDATE swap_events SET status = $1, updated_at = NOW()
           WHERE id = $2 AND status = $3"#,
    )
    .bind(to.as_str())
    .bind(id)
    .bind(from.as_str())
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to transition swap {id} {from} -> {to}"))?;

    Ok(result.rows_affected() == 1)
}

/// `confirmed -> sending` with the submitted tx hash attached.
pub async fn mark_swap_sending(pool: &PgPool, id: i64, fill_tx_hash: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"UPDATE swap_events SET status = 'sending', fill_tx_hash = $1, updated_at = NOW()
           WHERE id = $2 AND status = 'confirmed'"#,
    )
    .bind(fill_tx_hash)
    .bind(id)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to mark swap {id} sending"))?;

    Ok(result.rows_affected() == 1)
}

/// Count one receipt poll that found nothing; returns the new counter.
pub async fn bump_swap_track_attempts(pool: &PgPool, id: i64) -> Result<i32> {
    let row = sqlx::query(
        r#"UPDATE swap_events SET track_attempts = track_attempts + 1, updated_at = NOW()
           WHERE id = $1
           RETURNING track_attempts"#,
    )
    .bind(id)
    .fetch_one(pool)
    .await
    .wrap_err_with(|| format!("Failed to bump track attempts for swap {id}"))?;

    Ok(row.get("track_attempts"))
}

// ---------------------------------------------------------------------------
// Swap pairs
// ---------------------------------------------------------------------------

/// Insert a newly observed pair registration in `received` status.
pub async fn insert_swap_pair(pool: &PgPool, pair: &NewSwapPair) -> Result<Option<i64>> {
    let row = sqlx::query(
        r#"
        INSERT INTO swap_pairs (chain, sponsor, symbol, name, decimals, low_bound,
            upper_bound, src_token_addr, dst_token_addr, block_hash, tx_hash, height,
            direction, status)
        VALUES ($1, $2, $3, $4, $5, $6::NUMERIC, $7::NUMERIC, $8, $9, $10, $11, $12,
            $13, 'received')
        ON CONFLICT (chain, tx_hash) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(&pair.chain)
    .bind(&pair.sponsor)
    .bind(&pair.symbol)
    .bind(&pair.name)
    .bind(pair.decimals)
    .bind(&pair.low_bound)
    .bind(&pair.upper_bound)
    .bind(&pair.src_token_addr)
    .bind(&pair.dst_token_addr)
    .bind(&pair.block_hash)
    .bind(&pair.tx_hash)
    .bind(pair.height)
    .bind(&pair.direction)
    .fetch_optional(pool)
    .await
    .wrap_err("Failed to insert swap pair")?;

    Ok(row.map(|r| r.get("id")))
}

const PAIR_COLUMNS: &str = r#"id, chain, sponsor, symbol, name, decimals,
    low_bound::TEXT as low_bound, upper_bound::TEXT as upper_bound, src_token_addr,
    dst_token_addr, block_hash, tx_hash, height, direction, status, fill_tx_hash,
    track_attempts, created_at, updated_at"#;

/// Batched status-filtered scan for one direction, oldest first.
pub async fn swap_pairs_by_status(
    pool: &PgPool,
    direction: &str,
    status: PairStatus,
    limit: i64,
) -> Result<Vec<SwapPair>> {
    let query = format!(
        "SELECT {PAIR_COLUMNS} FROM swap_pairs
         WHERE direction = $1 AND status = $2
         ORDER BY id ASC LIMIT $3"
    );
    let rows = sqlx::query_as::<_, SwapPair>(&query)
        .bind(direction)
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to scan swap pairs by status")?;

    Ok(rows)
}

/// All finalized pairs, for the registry bootstrap.
pub async fn finalized_swap_pairs(pool: &PgPool) -> Result<Vec<SwapPair>> {
    let query = format!("SELECT {PAIR_COLUMNS} FROM swap_pairs WHERE status = 'finalized'");
    let rows = sqlx::query_as::<_, SwapPair>(&query)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to load finalized swap pairs")?;

    Ok(rows)
}

/// Compare-and-set status transition. Returns whether the row moved.
pub async fn transition_pair(
    pool: &PgPool,
    id: i64,
    from: PairStatus,
    to: PairStatus,
) -> Result<bool> {
    let result = sqlx::query(
        r#"UPDATE swap_pairs SET status = $1, updated_at = NOW()
           WHERE id = $2 AND status = $3"#,
    )
    .bind(to.as_str())
    .bind(id)
    .bind(from.as_str())
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to transition pair {id} {from} -> {to}"))?;

    Ok(result.rows_affected() == 1)
}

/// `confirmed -> sending` with the submitted tx hash attached.
pub async fn mark_pair_sending(pool: &PgPool, id: i64, fill_tx_hash: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"UPDATE swap_pairs SET status = 'sending', fill_tx_hash = $1, updated_at = NOW()
           WHERE id = $2 AND status = 'confirmed'"#,
    )
    .bind(fill_tx_hash)
    .bind(id)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to mark pair {id} sending"))?;

    Ok(result.rows_affected() == 1)
}

/// Count one receipt poll that found nothing; returns the new counter.
pub async fn bump_pair_track_attempts(pool: &PgPool, id: i64) -> Result<i32> {
    let row = sqlx::query(
        r#"UPDATE swap_pairs SET track_attempts = track_attempts + 1, updated_at = NOW()
           WHERE id = $1
           RETURNING track_attempts"#,
    )
    .bind(id)
    .fetch_one(pool)
    .await
    .wrap_err_with(|| format!("Failed to bump track attempts for pair {id}"))?;

    Ok(row.get("track_attempts"))
}

// ---------------------------------------------------------------------------
// Retry swaps
// ---------------------------------------------------------------------------

/// Insert a retry record in `confirmed` status. Creation is an external
/// administrative action; the engine itself never calls this.
pub async fn insert_retry_swap(pool: &PgPool, swap_id: i64) -> Result<i64> {
    let row = sqlx::query(
        r#"INSERT INTO retry_swaps (swap_id, status) VALUES ($1, 'confirmed') RETURNING id"#,
    )
    .bind(swap_id)
    .fetch_one(pool)
    .await
    .wrap_err("Failed to insert retry swap")?;

    Ok(row.get("id"))
}

/// Batched status-filtered scan over all retry records, oldest first.
pub async fn retry_swaps_by_status(
    pool: &PgPool,
    status: RetryStatus,
    limit: i64,
) -> Result<Vec<RetrySwap>> {
    let rows = sqlx::query_as::<_, RetrySwap>(
        r#"SELECT id, swap_id, status, fill_tx_hash, track_attempts, created_at, updated_at
           FROM retry_swaps
           WHERE status = $1
           ORDER BY id ASC
           LIMIT $2"#,
    )
    .bind(status.as_str())
    .bind(limit)
    .fetch_all(pool)
    .await
    .wrap_err("Failed to scan retry swaps by status")?;

    Ok(rows)
}

/// Compare-and-set status transition. Returns whether the row moved.
pub async fn transition_retry(
    pool: &PgPool,
    id: i64,
    from: RetryStatus,
    to: RetryStatus,
) -> Result<bool> {
    let result = sqlx::query(
        r#"UPDATE retry_swaps SET status = $1, updated_at = NOW()
           WHERE id = $2 AND status = $3"#,
    )
    .bind(to.as_str())
    .bind(id)
    .bind(from.as_str())
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to transition retry {id} {from} -> {to}"))?;

    Ok(result.rows_affected() == 1)
}

/// `confirmed -> sending` with the submitted tx hash attached.
pub async fn mark_retry_sending(pool: &PgPool, id: i64, fill_tx_hash: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"UPDATE retry_swaps SET status = 'sending', fill_tx_hash = $1, updated_at = NOW()
           WHERE id = $2 AND status = 'confirmed'"#,
    )
    .bind(fill_tx_hash)
    .bind(id)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to mark retry {id} sending"))?;

    Ok(result.rows_affected() == 1)
}

/// Count one receipt poll that found nothing; returns the new counter.
pub async fn bump_retry_track_attempts(pool: &PgPool, id: i64) -> Result<i32> {
    let row = sqlx::query(
        r#"UPDATE retry_swaps SET track_attempts = track_attempts + 1, updated_at = NOW()
           WHERE id = $1
           RETURNING track_attempts"#,
    )
    .bind(id)
    .fetch_one(pool)
    .await
    .wrap_err_with(|| format!("Failed to bump track attempts for retry {id}"))?;

    Ok(row.get("track_attempts"))
}
