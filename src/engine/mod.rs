//! Swap Engine: the per-direction lifecycle state machine.
//!
//! One pipeline runs per ordered chain pair. Each pipeline is three
//! independently ticking stage loops — confirm, send, track-sent — and a
//! record can only be picked up by the stage matching its current status,
//! so stage order is enforced by the status field while different records
//! progress independently. All pipelines share the pair registry and the
//! per-chain submission locks.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::Address;
use eyre::{eyre, Result};
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub mod pairs;
pub mod retry;
pub mod tx;

pub use pairs::PairEngine;
pub use retry::RetryEngine;

use crate::chain::ChainContext;
use crate::confirmation::ReceiptStatus;
use crate::config::EngineConfig;
use crate::db::{self, SwapEvent};
use crate::engine::retry::{classify_error, RetryConfig};
use crate::registry::{PairEntry, PairRegistry};
use crate::types::{Direction, SwapStatus};

/// Whether `confirmations` blocks have built on top of `height` at `tip`.
/// Promoting one height early is a defect, so the comparison is exact.
pub(crate) fn depth_reached(tip: u64, height: u64, confirmations: u64) -> bool {
    tip.saturating_sub(height) >= confirmations
}

/// Resolve the pair a swap event settles against. Forward-layout chains
/// emit their pair's registration-side token, reverse-layout chains emit
/// (or are stamped with) the destination-side token.
pub(crate) fn lookup_pair(
    registry: &PairRegistry,
    src: &ChainContext,
    swap: &SwapEvent,
) -> Option<Arc<PairEntry>> {
    let token = Address::from_str(&swap.token_addr).ok()?;
    if src.fill_variant.emits_forward_layout() {
        registry.by_src_token(&token)
    } else {
        registry.by_dst_token(&token)
    }
}

/// Drives swap events from sighting to settled fulfillment.
pub struct SwapEngine {
    db: PgPool,
    registry: Arc<PairRegistry>,
    chains: HashMap<String, Arc<ChainContext>>,
    cfg: EngineConfig,
}

impl SwapEngine {
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

    /// Spawn confirm/send/track loops for every direction.
    pub fn spawn(
        self: Arc<Self>,
        directions: Vec<Direction>,
        join_set: &mut JoinSet<Result<()>>,
        shutdown: &watch::Receiver<bool>,
    ) {
        for direction in directions {
            for stage in [Stage::Confirm, Stage::Send, Stage::Track] {
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
        info!(stage = stage.name(), direction = %direction, "Stage loop starting");

        loop {
            if *shutdown.borrow() {
                info!(stage = stage.name(), direction = %direction, "Stage loop stopping");
                return Ok(());
            }

            let tick = match stage {
                Stage::Confirm => self.confirm_tick(&direction).await,
                Stage::Send => self.send_tick(&direction).await,
                Stage::Track => self.track_tick(&direction).await,
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
                        "Stage tick failed"
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

    /// Confirm stage: promote `received` records once the source chain has
    /// built enough blocks on top of them, or reject them when the pair
    /// bound check fails. The tip height is re-derived on every tick.
    async fn confirm_tick(&self, direction: &Direction) -> Result<()> {
        let records = db::swap_events_by_status(
            &self.db,
            &direction.tag(),
            SwapStatus::Received,
            self.cfg.swap_batch_size,
        )
        .await?;
        if records.is_empty() {
            return Ok(());
        }

        let src = self.chain(&direction.src)?;
        let tip = src.tip_height().await?;

        for record in records {
            let height = record.height as u64;
            if !depth_reached(tip, height, src.confirmations) {
                continue;
            }

            let Some(pair) = lookup_pair(&self.registry, &src, &record) else {
                debug!(
                    swap_id = record.id,
                    token = %record.token_addr,
                    "No finalized pair for swap, waiting"
                );
                continue;
            };

            let amounts = match tx::swap_amounts(&record, self.cfg.fee_policy) {
                Ok(amounts) => amounts,
                Err(err) => {
                    error!(swap_id = record.id, error = %err, "Unusable swap amounts");
                    continue;
                }
            };

            if pair.bounds_ok(amounts.checked) {
                if db::transition_swap(
                    &self.db,
                    record.id,
                    SwapStatus::Received,
                    SwapStatus::Confirmed,
                )
                .await?
                {
                    info!(
                        swap_id = record.id,
                        direction = %direction,
                        height,
                        tip,
                        amount = %record.amount,
                        "Swap confirmed"
                    );
                }
            } else if db::transition_swap(
                &self.db,
                record.id,
                SwapStatus::Received,
                SwapStatus::Rejected,
            )
            .await?
            {
                warn!(
                    swap_id = record.id,
                    direction = %direction,
                    amount = %record.amount,
                    low_bound = %pair.low_bound,
                    upper_bound = %pair.upper_bound,
                    "Swap amount outside pair bounds, rejected"
                );
            }
        }

        Ok(())
    }

    /// Send stage: build, sign and submit the fulfillment call for each
    /// `confirmed` record, then attach the broadcast hash.
    async fn send_tick(&self, direction: &Direction) -> Result<()> {
        let records = db::swap_events_by_status(
            &self.db,
            &direction.tag(),
            SwapStatus::Confirmed,
            self.cfg.swap_batch_size,
        )
        .await?;
        if records.is_empty() {
            return Ok(());
        }

        let src = self.chain(&direction.src)?;
        let dest = self.chain(&direction.dst)?;

        for record in records {
            let Some(pair) = lookup_pair(&self.registry, &src, &record) else {
                warn!(
                    swap_id = record.id,
                    token = %record.token_addr,
                    "Pair vanished between confirm and send, waiting"
                );
                continue;
            };

            let amounts = match tx::swap_amounts(&record, self.cfg.fee_policy) {
                Ok(amounts) => amounts,
                Err(err) => {
                    error!(swap_id = record.id, error = %err, "Unusable swap amounts");
                    continue;
                }
            };

            let input = match tx::encode_fill(&dest, &record, &pair, amounts.fill) {
                Ok(input) => input,
                Err(err) => {
                    error!(swap_id = record.id, error = %err, "Failed to encode fill");
                    continue;
                }
            };

            match tx::submit_call(&dest, input).await {
                Ok(hash) => {
                    let fill_tx = format!("{hash:?}");
                    // A store failure after this point leaves the record
                    // confirmed and the broadcast in flight; the re-send is
                    // made safe by the agent contract's one-fill-per-source-
                    // tx-hash guard, not by this state machine.
                    if db::mark_swap_sending(&self.db, record.id, &fill_tx).await? {
                        info!(
                            swap_id = record.id,
                            direction = %direction,
                            chain = %dest.name,
                            tx_hash = %fill_tx,
                            amount = %amounts.fill,
                            "Fulfillment submitted"
                        );
                    }
                }
                Err(err) => {
                    let class = classify_error(&err.to_string());
                    error!(
                        swap_id = record.id,
                        direction = %direction,
                        chain = %dest.name,
                        error = %err,
                        ?class,
                        "Fulfillment submission failed, record stays confirmed"
                    );
                }
            }
        }

        Ok(())
    }

    /// Track-sent stage: poll receipts for `sending`/`sent` records and
    /// settle them. Terminal records are never picked up again.
    async fn track_tick(&self, direction: &Direction) -> Result<()> {
        let dest = self.chain(&direction.dst)?;

        for status in [SwapStatus::Sending, SwapStatus::Sent] {
            let records = db::swap_events_by_status(
                &self.db,
                &direction.tag(),
                status,
                self.cfg.track_batch_size,
            )
            .await?;

            for record in records {
                let Some(fill_tx) = record.fill_tx_hash.as_deref() else {
                    error!(swap_id = record.id, "Swap in {status} with no fill tx hash");
                    continue;
                };

                match dest.receipts.check(fill_tx).await {
                    Ok(ReceiptStatus::NotFound) => {
                        let attempts = db::bump_swap_track_attempts(&self.db, record.id).await?;
                        if attempts >= self.cfg.receipt_attempts
                            && db::transition_swap(&self.db, record.id, status, SwapStatus::SentFail)
                                .await?
                        {
                            warn!(
                                swap_id = record.id,
                                tx_hash = %fill_tx,
                                attempts,
                                "No receipt within budget, fulfillment failed"
                            );
                        }
                    }
                    Ok(ReceiptStatus::Success { block_number }) => match status {
                        SwapStatus::Sending => {
                            if db::transition_swap(
                                &self.db,
                                record.id,
                                SwapStatus::Sending,
                                SwapStatus::Sent,
                            )
                            .await?
                            {
                                debug!(
                                    swap_id = record.id,
                                    tx_hash = %fill_tx,
                                    block_number,
                                    "Fulfillment mined"
                                );
                            }
                        }
                        _ => {
                            if db::transition_swap(
                                &self.db,
                                record.id,
                                SwapStatus::Sent,
                                SwapStatus::SentSuccess,
                            )
                            .await?
                            {
                                info!(
                                    swap_id = record.id,
                                    tx_hash = %fill_tx,
                                    "Fulfillment succeeded"
                                );
                            }
                        }
                    },
                    Ok(ReceiptStatus::Reverted) => {
                        if status == SwapStatus::Sending {
                            db::transition_swap(
                                &self.db,
                                record.id,
                                SwapStatus::Sending,
                                SwapStatus::Sent,
                            )
                            .await?;
                        }
                        if db::transition_swap(
                            &self.db,
                            record.id,
                            SwapStatus::Sent,
                            SwapStatus::SentFail,
                        )
                        .await?
                        {
                            warn!(
                                swap_id = record.id,
                                tx_hash = %fill_tx,
                                "Fulfillment reverted"
                            );
                        }
                    }
                    Err(err) => {
                        debug!(
                            swap_id = record.id,
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

#[derive(Debug, Clone, Copy)]
enum Stage {
    Confirm,
    Send,
    Track,
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::Confirm => "swap-confirm",
            Stage::Send => "swap-send",
            Stage::Track => "swap-track",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChainConfig, EngineConfig};
    use crate::registry::PairEntry;
    use crate::types::{FeePolicy, FillVariant};
    use alloy::primitives::U256;
    use chrono::Utc;

    #[test]
    fn confirmation_depth_gating() {
        // Tip at 100 with depth 15: an event at height 80 is confirmable
        // (100 - 80 = 20 >= 15), an event at height 90 is not (10 < 15).
        assert!(depth_reached(100, 80, 15));
        assert!(!depth_reached(100, 90, 15));

        // Exactly at depth counts; one short does not.
        assert!(depth_reached(100, 85, 15));
        assert!(!depth_reached(100, 86, 15));

        // A tip behind the event height never confirms.
        assert!(!depth_reached(79, 80, 15));
        assert!(depth_reached(80, 80, 0));
    }

    fn context(name: &str, variant: FillVariant) -> ChainContext {
        let cfg = ChainConfig {
            name: name.to_string(),
            rpc_url: "http://localhost:8545".to_string(),
            chain_id: 1,
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
        ChainContext::new(
            &cfg,
            &engine,
            "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
        )
        .unwrap()
    }

    fn swap_with_token(token: &str) -> SwapEvent {
        SwapEvent {
            id: 1,
            chain: "eth".to_string(),
            token_addr: token.to_string(),
            from_addr: "0x2222222222222222222222222222222222222222".to_string(),
            dest_chain_id: None,
            amount: "5000".to_string(),
            fee_amount: "0".to_string(),
            block_hash: "0x0303030303030303030303030303030303030303030303030303030303030303"
                .to_string(),
            tx_hash: "0x0404040404040404040404040404040404040404040404040404040404040404"
                .to_string(),
            height: 80,
            direction: "eth_bsc".to_string(),
            status: "received".to_string(),
            fill_tx_hash: None,
            track_attempts: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn pair_lookup_routes_by_source_layout() {
        let registry = PairRegistry::new();
        registry
            .insert(PairEntry {
                symbol: "TST".to_string(),
                name: "Test".to_string(),
                decimals: 18,
                low_bound: U256::ZERO,
                upper_bound: U256::from(1_000_000u64),
                src_token: Address::repeat_byte(0x11),
                dst_token: Address::repeat_byte(0x22),
            })
            .unwrap();

        // A forward-layout chain emits the registration-side token.
        let forward = context("eth", FillVariant::Eth2Bsc);
        let swap = swap_with_token("0x1111111111111111111111111111111111111111");
        assert!(lookup_pair(&registry, &forward, &swap).is_some());

        // A reverse-layout chain holds the destination-side token.
        let reverse = context("bsc", FillVariant::Generic);
        let swap = swap_with_token("0x2222222222222222222222222222222222222222");
        assert!(lookup_pair(&registry, &reverse, &swap).is_some());

        // Crossed layouts find nothing.
        let swap = swap_with_token("0x2222222222222222222222222222222222222222");
        assert!(lookup_pair(&registry, &forward, &swap).is_none());

        // A garbage token address is a miss, not a panic.
        let swap = swap_with_token("not-an-address");
        assert!(lookup_pair(&registry, &reverse, &swap).is_none());
    }
}
