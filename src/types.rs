//! Core data structures for the settlement keeper.
//!
//! Everything here is cycle-scoped: work items are re-fetched from the index
//! service / application API every iteration and discarded after submission.
//! Only price quotes and the invalid-id set outlive a cycle (see `cache`).

use alloy::primitives::{Address, Bytes};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hard cap on entries per settlement transaction. Excess items are simply
/// picked up again on the next cycle.
pub const MAX_BATCH_SIZE: usize = 100;

/// Eligibility window for regular (non-limit) queued trades, in seconds.
pub const OPEN_WINDOW_SECS: u64 = 60;

/// A pending trade row from the application REST API (`trades/all_pending`).
///
/// Deserialization is strict: a row missing any of these fields is a schema
/// mismatch and is rejected at the adapter boundary instead of leaking an
/// "absent" placeholder into the filters.
#[derive(Debug, Clone, Deserialize)]
pub struct PendingTrade {
    pub queue_id: u64,
    pub user_address: Address,
    pub trade_size: u128,
    pub period: u64,
    pub target_contract: Address,
    pub strike: u128,
    /// Slippage tolerance in basis points (parts per 10,000).
    pub slippage: u32,
    pub allow_partial_fill: bool,
    pub referral_code: String,
    pub trader_nft_id: u64,
    pub queued_timestamp: u64,
    pub is_limit_order: bool,
    pub limit_order_expiration: u64,
    pub settlement_fee: u128,
    pub settlement_fee_signature: Bytes,
    pub settlement_fee_sign_expiration: u64,
    pub user_partial_signature: Bytes,
    pub signature_timestamp: u64,
}

impl PendingTrade {
    /// Reference timestamp for the price quote: "now" for limit orders,
    /// the queueing time for regular trades.
    pub fn price_timestamp(&self, now: u64) -> u64 {
        if self.is_limit_order {
            now
        } else {
            self.queued_timestamp
        }
    }
}

/// An expired option discovered via the index service (state == active,
/// expiration in the past).
#[derive(Debug, Clone)]
pub struct ExpiredOption {
    pub option_id: u64,
    pub market: Address,
    pub expiration_time: u64,
}

/// A settled option (state 2/3) used for the post-unlock record-store sync.
#[derive(Debug, Clone)]
pub struct SettledOption {
    pub option_id: u64,
    pub market: Address,
    pub payout: u128,
    pub expiration_price: u128,
    pub close_time: u64,
}

/// One unit of settlement work, produced by the trade source adapter.
#[derive(Debug, Clone)]
pub enum WorkItem {
    PendingOpen(PendingTrade),
    PendingLimitOrder(PendingTrade),
    ExpiredOption(ExpiredOption),
    /// A queue entry whose trade fields are known but whose on-chain queue
    /// slot was never consumed; drained through `resolveQueuedTrades`.
    ResolvableQueueEntry(PendingTrade),
}

impl WorkItem {
    pub fn from_pending(trade: PendingTrade) -> Self {
        if trade.is_limit_order {
            WorkItem::PendingLimitOrder(trade)
        } else {
            WorkItem::PendingOpen(trade)
        }
    }

    /// The trade row behind an open/resolve item.
    pub fn into_pending(self) -> Option<PendingTrade> {
        match self {
            WorkItem::PendingOpen(t)
            | WorkItem::PendingLimitOrder(t)
            | WorkItem::ResolvableQueueEntry(t) => Some(t),
            WorkItem::ExpiredOption(_) => None,
        }
    }

    /// The expired option behind an unlock/expire item.
    pub fn into_expired(self) -> Option<ExpiredOption> {
        match self {
            WorkItem::ExpiredOption(o) => Some(o),
            _ => None,
        }
    }

    /// Primary identifying key used for dedup and invalid-id exclusion.
    pub fn key(&self) -> WorkKey {
        match self {
            WorkItem::PendingOpen(t)
            | WorkItem::PendingLimitOrder(t)
            | WorkItem::ResolvableQueueEntry(t) => WorkKey::Queue(t.queue_id),
            WorkItem::ExpiredOption(o) => WorkKey::Option {
                option_id: o.option_id,
                market: o.market,
            },
        }
    }
}

/// Primary key of a settlement payload entry: queue id for the open/resolve
/// path, `(optionId, market)` for the unlock/expire path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkKey {
    Queue(u64),
    Option { option_id: u64, market: Address },
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkKey::Queue(id) => write!(f, "queue#{id}"),
            WorkKey::Option { option_id, market } => {
                write!(f, "option#{option_id}@{market}")
            }
        }
    }
}

/// Composite lookup key for a signed price quote.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PriceKey {
    pub pair: String,
    pub timestamp: u64,
}

impl PriceKey {
    pub fn new(pair: impl Into<String>, timestamp: u64) -> Self {
        Self {
            pair: pair.into(),
            timestamp,
        }
    }

    /// Canonical cache/map key, `PAIR-timestamp`.
    pub fn cache_key(&self) -> String {
        format!("{}-{}", self.pair, self.timestamp)
    }
}

/// A signed price quote. Valid only for the `PriceKey` it was fetched for;
/// the signature is opaque to this crate and passed through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub price: u128,
    pub signature: Bytes,
}

/// A signed settlement-fee quote, keyed by asset pair. Fetched once per
/// cycle; only limit orders consume it (regular trades carry their own fee).
#[derive(Debug, Clone, Deserialize)]
pub struct SettlementFeeQuote {
    pub settlement_fee: u128,
    pub settlement_fee_signature: Bytes,
    pub settlement_fee_sign_expiration: u64,
}

/// Active-market record from the application API, joined against expired
/// options on the close path for the direction flag and user signature.
#[derive(Debug, Clone, Deserialize)]
pub struct ActiveMarket {
    pub queue_id: u64,
    pub queued_timestamp: u64,
    pub state: u8,
    pub is_above: bool,
    pub user_full_signature: Bytes,
    pub signature_timestamp: u64,
    pub expiration_time: u64,
}

/// Which state-transition call a batch is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    OpenTrades,
    ResolveQueuedTrades,
    ExecuteOptions,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::OpenTrades => write!(f, "openTrades"),
            OperationKind::ResolveQueuedTrades => write!(f, "resolveQueuedTrades"),
            OperationKind::ExecuteOptions => write!(f, "executeOptions"),
        }
    }
}

/// Outcome of one batch submission attempt.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// Transaction mined; `failed` holds the keys individually rejected
    /// on-chain (already appended to the invalid-id set by the submitter).
    Confirmed {
        tx_hash: alloy::primitives::B256,
        failed: Vec<WorkKey>,
    },
    /// "nonce too low" — another keeper instance got there first. Benign.
    NonceRace,
    /// Anything else; logged and surfaced, never fatal to the loop.
    Failed(String),
}

/// An ordered, deduplicated, size-capped batch of payload entries.
///
/// First-seen entries win on dedup and truncation keeps the earliest
/// discovered entries; nothing is dropped permanently by the cap alone,
/// the remainder is re-fetched next cycle.
#[derive(Debug, Clone)]
pub struct Batch<T> {
    entries: Vec<T>,
}

impl<T> Batch<T> {
    pub fn build<K, F>(items: impl IntoIterator<Item = T>, key_of: F) -> Self
    where
        K: std::hash::Hash + Eq,
        F: Fn(&T) -> K,
    {
        let mut seen = std::collections::HashSet::new();
        let mut entries = Vec::new();
        for item in items {
            if entries.len() >= MAX_BATCH_SIZE {
                break;
            }
            if seen.insert(key_of(&item)) {
                entries.push(item);
            }
        }
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[T] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<T> {
        self.entries
    }
}
