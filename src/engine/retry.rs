//! Retry Subsystem and transmission error taxonomy.
//!
//! Two things live here. [`RetryConfig`]/[`classify_error`] give the stage
//! loops exponential backoff and a coarse classification of submission
//! errors for logging and pacing. [`RetryEngine`] is the narrower state
//! machine that re-attempts fulfillment for swaps whose first attempt ended
//! in `sent_fail`: it operates on `retry_swaps` rows, never touches the
//! original record's terminal status, and never creates retries itself —
//! insertion is an administrative action.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use eyre::{eyre, Result};
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::chain::ChainContext;
use crate::confirmation::ReceiptStatus;
use crate::config::EngineConfig;
use crate::db::{self, RetrySwap, SwapEvent};
use crate::engine::{lookup_pair, tx};
use crate::registry::PairRegistry;
use crate::types::{Direction, RetryStatus};

/// Backoff applied to a stage loop after consecutive tick failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff duration for a given attempt (0-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Coarse classification of submission errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorClass {
    /// Temporary failure: RPC timeout, network issues.
    Transient,
    /// Transaction underpriced; a later attempt with fresh gas will do.
    Underpriced,
    /// Nonce already consumed; the transaction probably landed.
    NonceTooLow,
    /// Nonce ahead of the chain; pending transactions must clear first.
    NonceTooHigh,
    /// Permanent failure: revert, bad params, insufficient funds.
    Permanent,
    Unknown,
}

/// Classify an error string for pacing and logging decisions.
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    if error_lower.contains("timeout")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
    {
        return ErrorClass::Transient;
    }

    if error_lower.contains("underpriced")
        || error_lower.contains("replacement transaction")
        || error_lower.contains("gas price too low")
        || error_lower.contains("max fee per gas less than")
    {
        return ErrorClass::Underpriced;
    }

    if error_lower.contains("nonce too low")
        || error_lower.contains("already known")
        || error_lower.contains("already been processed")
    {
        return ErrorClass::NonceTooLow;
    }

    if error_lower.contains("nonce too high") {
        return ErrorClass::NonceTooHigh;
    }

    if error_lower.contains("reverted")
        || error_lower.contains("execution reverted")
        || error_lower.contains("invalid signature")
        || error_lower.contains("insufficient funds")
        || error_lower.contains("out of gas")
        || error_lower.contains("invalid parameters")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

/// Re-attempts fulfillment for failed swaps via their retry records.
pub struct RetryEngine {
    db: PgPool,
    registry: Arc<PairRegistry>,
    chains: HashMap<String, Arc<ChainContext>>,
    cfg: EngineConfig,
}

impl RetryEngine {
    pub fn new(
        db: PgPool,
        registry: Arc<PairRegistry>,
        chains: HashMap<String, Arc<ChainContext>>,
        cfg: EngineConfig,
    ) -> Self {
        Self {
            db,
            registry,
            chains,
            cfg,
        }
    }

    /// Spawn the retry send and track loops.
    pub fn spawn(
        self: Arc<Self>,
        join_set: &mut JoinSet<Result<()>>,
        shutdown: &watch::Receiver<bool>,
    ) {
        let engine = self.clone();
        let rx = shutdown.clone();
        join_set.spawn(async move { engine.run_loop("retry-send", rx, Self::send_tick).await });

        let rx = shutdown.clone();
        join_set.spawn(async move { self.run_loop("retry-track", rx, Self::track_tick).await });
    }

    async fn run_loop<F, Fut>(
        self: Arc<Self>,
        stage: &'static str,
        mut shutdown: watch::Receiver<bool>,
        tick: F,
    ) -> Result<()>
    where
        F: Fn(Arc<Self>) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let backoff = RetryConfig::default();
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                info!(stage, "Retry loop stopping");
                return Ok(());
            }

            match tick(self.clone()).await {
                Ok(()) => failures = 0,
                Err(err) => {
                    failures += 1;
                    error!(
                        stage,
                        error = %err,
                        consecutive_failures = failures,
                        "Retry tick failed"
                    );
                }
            }

            let delay = if failures > 0 {
                backoff.backoff_for_attempt(failures.min(5))
            } else {
                self.cfg.engine_poll()
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Load the originating swap and the chain contexts for its direction.
    async fn load_context(
        &self,
        retry: &RetrySwap,
    ) -> Result<(SwapEvent, Arc<ChainContext>, Arc<ChainContext>)> {
        let swap = db::get_swap_event(&self.db, retry.swap_id)
            .await?
            .ok_or_else(|| eyre!("retry {} references missing swap {}", retry.id, retry.swap_id))?;
        let direction = Direction::from_str(&swap.direction)?;
        let src = self
            .chains
            .get(&direction.src)
            .cloned()
            .ok_or_else(|| eyre!("unknown source chain {}", direction.src))?;
        let dest = self
            .chains
            .get(&direction.dst)
            .cloned()
            .ok_or_else(|| eyre!("unknown destination chain {}", direction.dst))?;
        Ok((swap, src, dest))
    }

    async fn send_tick(self: Arc<Self>) -> Result<()> {
        let retries = db::retry_swaps_by_status(
            &self.db,
            RetryStatus::Confirmed,
            self.cfg.swap_batch_size,
        )
        .await?;

        for retry in retries {
            let (swap, src, dest) = match self.load_context(&retry).await {
                Ok(parts) => parts,
                Err(err) => {
                    error!(retry_id = retry.id, error = %err, "Skipping retry record");
                    continue;
                }
            };

            let Some(pair) = lookup_pair(&self.registry, &src, &swap) else {
                warn!(
                    retry_id = retry.id,
                    swap_id = swap.id,
                    token = %swap.token_addr,
                    "No finalized pair for retried swap, waiting"
                );
                continue;
            };

            let amounts = match tx::swap_amounts(&swap, self.cfg.fee_policy) {
                Ok(amounts) => amounts,
                Err(err) => {
                    error!(retry_id = retry.id, error = %err, "Unusable swap amounts");
                    continue;
                }
            };

            let input = match tx::encode_fill(&dest, &swap, &pair, amounts.fill) {
                Ok(input) => input,
                Err(err) => {
                    error!(retry_id = retry.id, error = %err, "Failed to encode fill");
                    continue;
                }
            };

            match tx::submit_call(&dest, input).await {
                Ok(hash) => {
                    let fill_tx = format!("{hash:?}");
                    if db::mark_retry_sending(&self.db, retry.id, &fill_tx).await? {
                        info!(
                            retry_id = retry.id,
                            swap_id = swap.id,
                            chain = %dest.name,
                            tx_hash = %fill_tx,
                            "Retry fill submitted"
                        );
                    }
                }
                Err(err) => {
                    let class = classify_error(&err.to_string());
                    error!(
                        retry_id = retry.id,
                        swap_id = swap.id,
                        chain = %dest.name,
                        error = %err,
                        ?class,
                        "Retry fill submission failed, will re-attempt"
                    );
                }
            }
        }

        Ok(())
    }

    async fn track_tick(self: Arc<Self>) -> Result<()> {
        for status in [RetryStatus::Sending, RetryStatus::Sent] {
            let retries =
                db::retry_swaps_by_status(&self.db, status, self.cfg.track_batch_size).await?;

            for retry in &retries {
                let (_, _, dest) = match self.load_context(retry).await {
                    Ok(parts) => parts,
                    Err(err) => {
                        error!(retry_id = retry.id, error = %err, "Skipping retry record");
                        continue;
                    }
                };

                let Some(fill_tx) = retry.fill_tx_hash.as_deref() else {
                    error!(retry_id = retry.id, "Retry in {status} with no fill tx hash");
                    continue;
                };

                match dest.receipts.check(fill_tx).await {
                    Ok(ReceiptStatus::NotFound) => {
                        let attempts = db::bump_retry_track_attempts(&self.db, retry.id).await?;
                        if attempts >= self.cfg.receipt_attempts
                            && db::transition_retry(
                                &self.db,
                                retry.id,
                                status,
                                RetryStatus::SentFail,
                            )
                            .await?
                        {
                            warn!(
                                retry_id = retry.id,
                                tx_hash = %fill_tx,
                                attempts,
                                "No receipt within budget, retry failed"
                            );
                        }
                    }
                    Ok(ReceiptStatus::Success { .. }) => match status {
                        RetryStatus::Sending => {
                            db::transition_retry(
                                &self.db,
                                retry.id,
                                RetryStatus::Sending,
                                RetryStatus::Sent,
                            )
                            .await?;
                        }
                        _ => {
                            if db::transition_retry(
                                &self.db,
                                retry.id,
                                RetryStatus::Sent,
                                RetryStatus::SentSuccess,
                            )
                            .await?
                            {
                                info!(retry_id = retry.id, tx_hash = %fill_tx, "Retry succeeded");
                            }
                        }
                    },
                    Ok(ReceiptStatus::Reverted) => {
                        if status == RetryStatus::Sending {
                            db::transition_retry(
                                &self.db,
                                retry.id,
                                RetryStatus::Sending,
                                RetryStatus::Sent,
                            )
                            .await?;
                        }
                        if db::transition_retry(
                            &self.db,
                            retry.id,
                            RetryStatus::Sent,
                            RetryStatus::SentFail,
                        )
                        .await?
                        {
                            warn!(retry_id = retry.id, tx_hash = %fill_tx, "Retry fill reverted");
                        }
                    }
                    Err(err) => {
                        debug!(
                            retry_id = retry.id,
                            error = %err,
                            "Receipt poll failed, will retry"
                        );
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_calculation() {
        let config = RetryConfig::default();

        assert_eq!(config.backoff_for_attempt(0), Duration::from_secs(2));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_secs(4));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_secs(8));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_secs(16));
        assert_eq!(config.backoff_for_attempt(4), Duration::from_secs(32));
        assert_eq!(config.backoff_for_attempt(5), Duration::from_secs(60)); // capped
    }

    #[test]
    fn should_retry_respects_limit() {
        let config = RetryConfig::default();
        assert!(config.should_retry(0));
        assert!(config.should_retry(4));
        assert!(!config.should_retry(5));
    }

    #[test]
    fn error_classification() {
        assert_eq!(classify_error("connection timeout"), ErrorClass::Transient);
        assert_eq!(
            classify_error("replacement transaction underpriced"),
            ErrorClass::Underpriced
        );
        assert_eq!(classify_error("nonce too low"), ErrorClass::NonceTooLow);
        assert_eq!(classify_error("nonce too high"), ErrorClass::NonceTooHigh);
        assert_eq!(classify_error("execution reverted"), ErrorClass::Permanent);
        assert_eq!(classify_error("insufficient funds"), ErrorClass::Permanent);
        assert_eq!(classify_error("some unknown error"), ErrorClass::Unknown);
    }
}
