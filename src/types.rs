//! Domain types shared across the observer, engine and store.

use std::fmt;
use std::str::FromStr;

use eyre::{eyre, Report};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a swap event record.
///
/// The only legal edges are the ones encoded in [`SwapStatus::can_advance_to`];
/// every store update is a compare-and-set on the current status, so a record
/// can never skip a stage even under concurrent stage loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
pub enum SwapStatus {
    Received,
    Rejected,
    Confirmed,
    Sending,
    Sent,
    SentSuccess,
    SentFail,
}

impl SwapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapStatus::Received => "received",
            SwapStatus::Rejected => "rejected",
            SwapStatus::Confirmed => "confirmed",
            SwapStatus::Sending => "sending",
            SwapStatus::Sent => "sent",
            SwapStatus::SentSuccess => "sent_success",
            SwapStatus::SentFail => "sent_fail",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(&self, next: SwapStatus) -> bool {
        use SwapStatus::*;
        matches!(
            (self, next),
            (Received, Confirmed)
                | (Received, Rejected)
                | (Confirmed, Sending)
                | (Sending, Sent)
                | (Sending, SentFail)
                | (Sent, SentSuccess)
                | (Sent, SentFail)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwapStatus::Rejected | SwapStatus::SentSuccess | SwapStatus::SentFail
        )
    }
}

impl fmt::Display for SwapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a swap-pair registration record.
///
/// Same shape as [`SwapStatus`] plus the `finalized` terminal stage that
/// loads the pair into the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
pub enum PairStatus {
    Received,
    Confirmed,
    Sending,
    Sent,
    SentSuccess,
    SentFail,
    Finalized,
}

impl PairStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairStatus::Received => "received",
            PairStatus::Confirmed => "confirmed",
            PairStatus::Sending => "sending",
            PairStatus::Sent => "sent",
            PairStatus::SentSuccess => "sent_success",
            PairStatus::SentFail => "sent_fail",
            PairStatus::Finalized => "finalized",
        }
    }

    pub fn can_advance_to(&self, next: PairStatus) -> bool {
        use PairStatus::*;
        matches!(
            (self, next),
            (Received, Confirmed)
                | (Confirmed, Sending)
                | (Sending, Sent)
                | (Sending, SentFail)
                | (Sent, SentSuccess)
                | (Sent, SentFail)
                | (SentSuccess, Finalized)
        )
    }
}

impl fmt::Display for PairStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a retry record. Independent of the originating swap's
/// status so a retry never rewrites the first attempt's audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
pub enum RetryStatus {
    Confirmed,
    Sending,
    Sent,
    SentSuccess,
    SentFail,
}

impl RetryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStatus::Confirmed => "confirmed",
            RetryStatus::Sending => "sending",
            RetryStatus::Sent => "sent",
            RetryStatus::SentSuccess => "sent_success",
            RetryStatus::SentFail => "sent_fail",
        }
    }

    pub fn can_advance_to(&self, next: RetryStatus) -> bool {
        use RetryStatus::*;
        matches!(
            (self, next),
            (Confirmed, Sending)
                | (Sending, Sent)
                | (Sending, SentFail)
                | (Sent, SentSuccess)
                | (Sent, SentFail)
        )
    }
}

impl fmt::Display for RetryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An ordered (source chain, destination chain) pair. One swap pipeline runs
/// per direction; the tag form (`eth_bsc`) is what the store persists.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Direction {
    pub src: String,
    pub dst: String,
}

impl Direction {
    pub fn new(src: impl Into<String>, dst: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
        }
    }

    pub fn tag(&self) -> String {
        format!("{}_{}", self.src, self.dst)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.src, self.dst)
    }
}

impl FromStr for Direction {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (src, dst) = s
            .split_once('_')
            .ok_or_else(|| eyre!("invalid direction tag: {s}"))?;
        if src.is_empty() || dst.is_empty() {
            return Err(eyre!("invalid direction tag: {s}"));
        }
        Ok(Direction::new(src, dst))
    }
}

/// Which fill entrypoint a chain's swap-agent contract exposes.
///
/// The two chain-specific variants predate the generalized `fillSwap`; which
/// one a given agent accepts is deployment-specific, so it is explicit
/// per-chain configuration rather than something inferred at runtime. The
/// variant also fixes the `SwapStarted` log layout the agent emits:
/// `Eth2Bsc` agents emit the forward layout (token/sender in topics,
/// amount/fee in data), the other two emit the reverse layout (chain id,
/// sender and amount all in topics).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillVariant {
    Eth2Bsc,
    Bsc2Eth,
    Generic,
}

impl FillVariant {
    /// True when this agent emits the forward `SwapStarted` layout.
    pub fn emits_forward_layout(&self) -> bool {
        matches!(self, FillVariant::Eth2Bsc)
    }
}

impl FromStr for FillVariant {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eth2bsc" => Ok(FillVariant::Eth2Bsc),
            "bsc2eth" => Ok(FillVariant::Bsc2Eth),
            "generic" => Ok(FillVariant::Generic),
            other => Err(eyre!(
                "unknown fill variant {other:?}, expected eth2bsc, bsc2eth or generic"
            )),
        }
    }
}

/// Whether the pair bound check applies to the emitted amount or to the
/// amount net of fee. The fill amount is always net of fee either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeePolicy {
    /// Bounds checked against the emitted (gross) amount.
    Gross,
    /// Bounds checked against amount minus fee.
    Net,
}

impl FromStr for FeePolicy {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gross" => Ok(FeePolicy::Gross),
            "net" => Ok(FeePolicy::Net),
            other => Err(eyre!("unknown fee policy {other:?}, expected gross or net")),
        }
    }
}
