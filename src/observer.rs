//! Chain Observer: sequential block scanning with a persisted cursor.
//!
//! One observer per watched chain. Heights are processed strictly in
//! increasing order; the cursor only advances after the height's events are
//! durably persisted, so a crash replays the height and the store's
//! `(chain, tx_hash)` uniqueness absorbs the duplicates.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::U256;
use eyre::Result;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::chain::{BlockEventBatch, ChainContext};
use crate::config::{ChainConfig, Config, EngineConfig};
use crate::db::{self, NewSwapEvent, NewSwapPair};
use crate::events::{AgentEvent, PairRegisteredEvent, SwapStartedEvent};
use crate::registry::MAX_UPPER_BOUND;
use crate::types::Direction;

/// Outcome of one scan tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// A height was processed and the cursor advanced.
    Scanned(u64),
    /// The chain tip has not produced the next height yet.
    TipReached,
}

/// Watches one chain for agent events and persists them as pending records.
pub struct ChainObserver {
    ctx: Arc<ChainContext>,
    db: PgPool,
    start_height: u64,
    /// Default destination for events that carry no chain id.
    counterpart: Option<String>,
    /// Numeric chain id -> chain name, for reverse-layout events.
    chains_by_id: HashMap<u64, String>,
    poll_interval: std::time::Duration,
}

impl ChainObserver {
    pub fn new(
        ctx: Arc<ChainContext>,
        db: PgPool,
        chain_cfg: &ChainConfig,
        engine_cfg: &EngineConfig,
        config: &Config,
    ) -> Self {
        let chains_by_id = config
            .chains
            .iter()
            .map(|c| (c.chain_id, c.name.clone()))
            .collect();

        Self {
            ctx,
            db,
            start_height: chain_cfg.start_height,
            counterpart: chain_cfg.counterpart.clone(),
            chains_by_id,
            poll_interval: engine_cfg.observer_poll(),
        }
    }

    /// Run the scan loop until shutdown. The in-flight tick always finishes
    /// (or times out at the RPC deadline) before the loop exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(chain = %self.ctx.name, "Observer starting");

        loop {
            if *shutdown.borrow() {
                info!(chain = %self.ctx.name, "Observer stopping");
                return Ok(());
            }

            match self.scan_next().await {
                // Keep draining the backlog without sleeping.
                Ok(ScanOutcome::Scanned(height)) => {
                    debug!(chain = %self.ctx.name, height, "Scanned height");
                    continue;
                }
                Ok(ScanOutcome::TipReached) => {}
                Err(err) => {
                    warn!(
                        chain = %self.ctx.name,
                        error = %err,
                        "Scan tick failed, will retry"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Scan the next height: fetch its header and agent logs, persist the
    /// decoded events as pending records, then advance the cursor.
    pub async fn scan_next(&self) -> Result<ScanOutcome> {
        let cursor = db::get_scan_cursor(&self.db, &self.ctx.name).await?;
        let next = match cursor {
            Some(height) => height as u64 + 1,
            None => self.start_height,
        };

        // A timeout or transport error propagates with the cursor untouched;
        // the next tick retries the same height.
        let batch = match self.ctx.block_events(next).await? {
            Some(batch) => batch,
            None => return Ok(ScanOutcome::TipReached),
        };

        self.persist_batch(&batch).await?;
        db::upsert_scan_cursor(&self.db, &self.ctx.name, next as i64).await?;

        Ok(ScanOutcome::Scanned(next))
    }

    async fn persist_batch(&self, batch: &BlockEventBatch) -> Result<()> {
        for extracted in &batch.events {
            match &extracted.event {
                AgentEvent::SwapStarted(event) => {
                    self.persist_swap(batch, event, extracted.tx_hash).await?;
                }
                AgentEvent::PairRegistered(event) => {
                    self.persist_pair(batch, event, extracted.tx_hash).await?;
                }
            }
        }
        Ok(())
    }

    async fn persist_swap(
        &self,
        batch: &BlockEventBatch,
        event: &SwapStartedEvent,
        tx_hash: alloy::primitives::B256,
    ) -> Result<()> {
        let Some(destination) = self.resolve_destination(event.dest_chain_id) else {
            warn!(
                chain = %self.ctx.name,
                tx_hash = ?tx_hash,
                dest_chain_id = ?event.dest_chain_id,
                "Swap event has no resolvable destination, skipping"
            );
            return Ok(());
        };

        // Reverse-layout agents are deployed per token and emit none; the
        // configured agent token fills the gap.
        let token_addr = match event.token.or(self.ctx.agent_token) {
            Some(token) => format!("{token:?}"),
            None => {
                warn!(
                    chain = %self.ctx.name,
                    tx_hash = ?tx_hash,
                    "Swap event carries no token and chain has no agent token, skipping"
                );
                return Ok(());
            }
        };

        let direction = Direction::new(self.ctx.name.clone(), destination);
        let record = NewSwapEvent {
            chain: self.ctx.name.clone(),
            token_addr,
            from_addr: format!("{:?}", event.from),
            dest_chain_id: event.dest_chain_id.map(|id| id.to_string()),
            amount: event.amount.to_string(),
            fee_amount: event.fee.to_string(),
            block_hash: format!("{:?}", batch.block_hash),
            tx_hash: format!("{tx_hash:?}"),
            height: batch.height as i64,
            direction: direction.tag(),
        };

        match db::insert_swap_event(&self.db, &record).await? {
            Some(id) => {
                info!(
                    chain = %self.ctx.name,
                    id,
                    tx_hash = %record.tx_hash,
                    direction = %record.direction,
                    from = %record.from_addr,
                    amount = %record.amount,
                    "New swap event"
                );
            }
            None => {
                debug!(
                    chain = %self.ctx.name,
                    tx_hash = %record.tx_hash,
                    "Swap event already recorded"
                );
            }
        }
        Ok(())
    }

    async fn persist_pair(
        &self,
        batch: &BlockEventBatch,
        event: &PairRegisteredEvent,
        tx_hash: alloy::primitives::B256,
    ) -> Result<()> {
        let Some(ref destination) = self.counterpart else {
            warn!(
                chain = %self.ctx.name,
                tx_hash = ?tx_hash,
                "Pair registration on a chain with no counterpart, skipping"
            );
            return Ok(());
        };

        let direction = Direction::new(self.ctx.name.clone(), destination.clone());
        let record = NewSwapPair {
            chain: self.ctx.name.clone(),
            sponsor: format!("{:?}", event.sponsor),
            symbol: event.symbol.clone(),
            name: event.name.clone(),
            decimals: i32::from(event.decimals),
            // Registration events carry no bounds; pairs start wide open
            // until an operator narrows them.
            low_bound: "0".to_string(),
            upper_bound: MAX_UPPER_BOUND.to_string(),
            src_token_addr: format!("{:?}", event.src_token),
            dst_token_addr: format!("{:?}", event.dst_token),
            block_hash: format!("{:?}", batch.block_hash),
            tx_hash: format!("{tx_hash:?}"),
            height: batch.height as i64,
            direction: direction.tag(),
        };

        match db::insert_swap_pair(&self.db, &record).await? {
            Some(id) => {
                info!(
                    chain = %self.ctx.name,
                    id,
                    symbol = %record.symbol,
                    src_token = %record.src_token_addr,
                    dst_token = %record.dst_token_addr,
                    "New pair registration"
                );
            }
            None => {
                debug!(
                    chain = %self.ctx.name,
                    tx_hash = %record.tx_hash,
                    "Pair registration already recorded"
                );
            }
        }
        Ok(())
    }

    /// Destination chain for a swap event: the explicit chain id when the
    /// event carries one, the configured counterpart otherwise.
    fn resolve_destination(&self, dest_chain_id: Option<U256>) -> Option<String> {
        match dest_chain_id {
            Some(id) => {
                let id: u64 = id.try_into().ok()?;
                let name = self.chains_by_id.get(&id)?;
                if *name == self.ctx.name {
                    error!(
                        chain = %self.ctx.name,
                        dest_chain_id = id,
                        "Swap event targets its own chain"
                    );
                    return None;
                }
                Some(name.clone())
            }
            None => self.counterpart.clone(),
        }
    }
}
