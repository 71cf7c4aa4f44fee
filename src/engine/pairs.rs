//! Pair-registration pipeline.
//!
//! Structurally the same confirm/send/track state machine as the swap
//! pipeline, with a different payload (`createSwapPair` on the counterpart
//! chain's agent) and one extra terminal stage: `finalize`, which loads the
//! now-active pair into the registry.

use std::collections::HashMap;
use std::sync::Arc;

use eyre::{eyre, Result};
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::chain::ChainContext;
use crate::confirmation::ReceiptStatus;
use crate::config::EngineConfig;
use crate::engine::retry::{classify_error, RetryConfig};
use crate::engine::tx;
use crate::registry::{PairEntry, PairRegistry};
use crate::types::{Direction, PairStatus};

/// Drives pair registrations from sighting to registry activation. One set
/// of stage loops runs per chain that has a configured counterpart.
pub struct PairEngine {
    db: PgPool,
    registry: Arc<PairRegistry>,
    chains: HashMap<String, Arc<ChainContext>>,
    cfg: EngineConfig,
}

impl PairEngine {
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

    /// Spawn confirm/send/track/finalize loops for each registration
    /// direction.
    pub fn spawn(
        self: Arc<Self>,
        directions: Vec<Direction>,
        join_set: &mut JoinSet<Result<()>>,
        shutdown: &watch::Receiver<bool>,
    ) {
        for direction in directions {
            for stage in [Stage::Confirm, Stage::Send, Stage::Track, Stage::Finalize] {
                let engine = self.clone();
                let dir = direction.clone();
                let rx = shutdown.clone();
                join_set.spawn(async move { engine.run_stage(stage, dir, rx).await });
            }
        }
    }

    async fn run_stage(
        self: Arc<Self>,
        stage: Stage,
        direction: Direction,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let backoff = RetryConfig::default();
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                info!(stage = stage.name(), direction = %direction, "Pair loop stopping");
                return Ok(());
            }

            let tick = match stage {
                Stage::Confirm => self.confirm_tick(&direction).await,
                Stage::Send => self.send_tick(&direction).await,
                Stage::Track => self.track_tick(&direction).await,
                Stage::Finalize => self.finalize_tick(&direction).await,
            };

            match tick {
                Ok(()) => failures = 0,
                Err(err) => {
                    failures += 1;
                    error!(
                        stage = stage.name(),
                        direction = %direction,
                        error = %err,
                        consecutive_failures = failures,
                        "Pair tick failed"
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

    fn chain(&self, name: &str) -> Result<Arc<ChainContext>> {
        self.chains
            .get(name)
            .cloned()
            .ok_or_else(|| eyre!("unknown chain {name}"))
    }

    /// Promote `received` registrations once confirmation depth is reached.
    /// Registrations have no bound check.
    async fn confirm_tick(&self, direction: &Direction) -> Result<()> {
        let pairs = crate::db::swap_pairs_by_status(
            &self.db,
            &direction.tag(),
            PairStatus::Received,
            self.cfg.pair_batch_size,
        )
        .await?;
        if pairs.is_empty() {
            return Ok(());
        }

        let src = self.chain(&direction.src)?;
        let tip = src.tip_height().await?;

        for pair in pairs {
            let height = pair.height as u64;
            if !crate::engine::depth_reached(tip, height, src.confirmations) {
                continue;
            }

            if crate::db::transition_pair(&self.db, pair.id, PairStatus::Received, PairStatus::Confirmed)
                .await?
            {
                info!(
                    pair_id = pair.id,
                    symbol = %pair.symbol,
                    direction = %direction,
                    height,
                    tip,
                    "Pair registration confirmed"
                );
            }
        }

        Ok(())
    }

    /// Submit `createSwapPair` on the destination agent for confirmed
    /// registrations.
    async fn send_tick(&self, direction: &Direction) -> Result<()> {
        let pairs = crate::db::swap_pairs_by_status(
            &self.db,
            &direction.tag(),
            PairStatus::Confirmed,
            self.cfg.pair_batch_size,
        )
        .await?;
        if pairs.is_empty() {
            return Ok(());
        }

        let dest = self.chain(&direction.dst)?;

        for pair in pairs {
            let input = match tx::encode_create_pair(&pair) {
                Ok(input) => input,
                Err(err) => {
                    error!(pair_id = pair.id, error = %err, "Failed to encode createSwapPair");
                    continue;
                }
            };

            match tx::submit_call(&dest, input).await {
                Ok(hash) => {
                    let fill_tx = format!("{hash:?}");
                    if crate::db::mark_pair_sending(&self.db, pair.id, &fill_tx).await? {
                        info!(
                            pair_id = pair.id,
                            symbol = %pair.symbol,
                            chain = %dest.name,
                            tx_hash = %fill_tx,
                            "createSwapPair submitted"
                        );
                    }
                }
                Err(err) => {
                    let class = classify_error(&err.to_string());
                    error!(
                        pair_id = pair.id,
                        chain = %dest.name,
                        error = %err,
                        ?class,
                        "createSwapPair submission failed, will re-attempt"
                    );
                }
            }
        }

        Ok(())
    }

    /// Poll receipts for in-flight `createSwapPair` transactions.
    async fn track_tick(&self, direction: &Direction) -> Result<()> {
        let dest = self.chain(&direction.dst)?;

        for status in [PairStatus::Sending, PairStatus::Sent] {
            let pairs = crate::db::swap_pairs_by_status(
                &self.db,
                &direction.tag(),
                status,
                self.cfg.pair_batch_size,
            )
            .await?;

            for pair in pairs {
                let Some(fill_tx) = pair.fill_tx_hash.as_deref() else {
                    error!(pair_id = pair.id, "Pair in {status} with no fill tx hash");
                    continue;
                };

                match dest.receipts.check(fill_tx).await {
                    Ok(ReceiptStatus::NotFound) => {
                        let attempts =
                            crate::db::bump_pair_track_attempts(&self.db, pair.id).await?;
                        if attempts >= self.cfg.receipt_attempts
                            && crate::db::transition_pair(
                                &self.db,
                                pair.id,
                                status,
                                PairStatus::SentFail,
                            )
                            .await?
                        {
                            warn!(
                                pair_id = pair.id,
                                tx_hash = %fill_tx,
                                attempts,
                                "No receipt within budget, pair creation failed"
                            );
                        }
                    }
                    Ok(ReceiptStatus::Success { .. }) => match status {
                        PairStatus::Sending => {
                            crate::db::transition_pair(
                                &self.db,
                                pair.id,
                                PairStatus::Sending,
                                PairStatus::Sent,
                            )
                            .await?;
                        }
                        _ => {
                            if crate::db::transition_pair(
                                &self.db,
                                pair.id,
                                PairStatus::Sent,
                                PairStatus::SentSuccess,
                            )
                            .await?
                            {
                                info!(
                                    pair_id = pair.id,
                                    symbol = %pair.symbol,
                                    tx_hash = %fill_tx,
                                    "createSwapPair landed"
                                );
                            }
                        }
                    },
                    Ok(ReceiptStatus::Reverted) => {
                        if status == PairStatus::Sending {
                            crate::db::transition_pair(
                                &self.db,
                                pair.id,
                                PairStatus::Sending,
                                PairStatus::Sent,
                            )
                            .await?;
                        }
                        if crate::db::transition_pair(
                            &self.db,
                            pair.id,
                            PairStatus::Sent,
                            PairStatus::SentFail,
                        )
                        .await?
                        {
                            warn!(pair_id = pair.id, tx_hash = %fill_tx, "createSwapPair reverted");
                        }
                    }
                    Err(err) => {
                        debug!(pair_id = pair.id, error = %err, "Receipt poll failed, will retry");
                    }
                }
            }
        }

        Ok(())
    }

    /// Load `sent_success` pairs into the registry, then mark them
    /// `finalized`. The registry insert happens first so a crash between
    /// the two leaves a re-insertable (idempotent) mapping, never a
    /// finalized-but-unloaded pair.
    async fn finalize_tick(&self, direction: &Direction) -> Result<()> {
        let pairs = crate::db::swap_pairs_by_status(
            &self.db,
            &direction.tag(),
            PairStatus::SentSuccess,
            self.cfg.pair_batch_size,
        )
        .await?;

        for pair in pairs {
            let entry = match PairEntry::from_record(&pair) {
                Ok(entry) => entry,
                Err(err) => {
                    error!(pair_id = pair.id, error = %err, "Unloadable pair record");
                    continue;
                }
            };

            if let Err(err) = self.registry.insert(entry) {
                // A conflicting mapping never goes live; the record stays in
                // sent_success for an operator to resolve.
                error!(pair_id = pair.id, error = %err, "Refusing to finalize pair");
                continue;
            }

            if crate::db::transition_pair(
                &self.db,
                pair.id,
                PairStatus::SentSuccess,
                PairStatus::Finalized,
            )
            .await?
            {
                info!(
                    pair_id = pair.id,
                    symbol = %pair.symbol,
                    src_token = %pair.src_token_addr,
                    dst_token = %pair.dst_token_addr,
                    "Pair finalized and live in registry"
                );
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Confirm,
    Send,
    Track,
    Finalize,
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::Confirm => "pair-confirm",
            Stage::Send => "pair-send",
            Stage::Track => "pair-track",
            Stage::Finalize => "pair-finalize",
        }
    }
}
