//! Pure batch-construction logic.
//!
//! Everything here is synchronous and side-effect free: inputs are the rows
//! and chain reads a cycle already gathered, outputs are ready-to-submit
//! payload batches plus the queue-id lists the record store needs. All
//! arithmetic is integer math on u128/U256; prices and strikes never touch
//! floats.

use crate::cache::InvalidIdSet;
use crate::chain::OptionInfo;
use crate::contracts::ISettlementRouter::{ExecuteEntry, SignInfo, TradeEntry};
use crate::types::{
    ActiveMarket, Batch, ExpiredOption, PendingTrade, PriceKey, PriceQuote, SettlementFeeQuote,
    WorkKey, OPEN_WINDOW_SECS,
};
use alloy::primitives::{Address, U256};
use std::collections::HashMap;
use tracing::debug;

const BPS_DENOMINATOR: u128 = 10_000;

/// Inclusive slippage check: the live price must sit within
/// `strike * (1 ± slippage/10000)`, both bounds included.
pub fn strike_within_slippage(slippage_bps: u32, current_price: u128, strike: u128) -> bool {
    let scaled = current_price.saturating_mul(BPS_DENOMINATOR);
    let upper = strike.saturating_mul(BPS_DENOMINATOR + slippage_bps as u128);
    let lower = strike.saturating_mul(BPS_DENOMINATOR - (slippage_bps as u128).min(BPS_DENOMINATOR));
    scaled <= upper && scaled >= lower
}

/// Whether a pending trade is still inside its submission window.
/// Regular trades: queued within the last [`OPEN_WINDOW_SECS`] seconds,
/// boundary included. Limit orders: expiry strictly in the future.
pub fn within_open_window(trade: &PendingTrade, now: u64) -> bool {
    if trade.is_limit_order {
        trade.limit_order_expiration > now
    } else {
        now.saturating_sub(trade.queued_timestamp) <= OPEN_WINDOW_SECS
    }
}

/// The exact complement of [`within_open_window`]; these queue ids get
/// cancelled in the record store.
fn window_expired(trade: &PendingTrade, now: u64) -> bool {
    !within_open_window(trade, now)
}

/// Price keys needed to settle `trades`, deduplicated in first-seen order.
/// Trades whose market has no known asset pair contribute nothing.
pub fn price_requests_for_trades(
    trades: &[PendingTrade],
    pairs: &HashMap<Address, String>,
    now: u64,
) -> Vec<PriceKey> {
    let mut seen = std::collections::HashSet::new();
    let mut keys = Vec::new();
    for trade in trades {
        let Some(pair) = pairs.get(&trade.target_contract) else {
            continue;
        };
        let key = PriceKey::new(pair.clone(), trade.price_timestamp(now));
        if seen.insert(key.cache_key()) {
            keys.push(key);
        }
    }
    keys
}

fn quote_for<'p>(
    trade: &PendingTrade,
    pairs: &HashMap<Address, String>,
    prices: &'p HashMap<String, PriceQuote>,
    now: u64,
) -> Option<(&'p PriceQuote, u64)> {
    let pair = pairs.get(&trade.target_contract)?;
    let timestamp = trade.price_timestamp(now);
    let quote = prices.get(&PriceKey::new(pair.clone(), timestamp).cache_key())?;
    Some((quote, timestamp))
}

fn sign_info(signature: alloy::primitives::Bytes, timestamp: u64) -> SignInfo {
    SignInfo {
        signature,
        timestamp: U256::from(timestamp),
    }
}

fn trade_entry(
    trade: &PendingTrade,
    quote: &PriceQuote,
    price_timestamp: u64,
    fee: Option<&SettlementFeeQuote>,
) -> TradeEntry {
    let (settlement_fee, fee_sign) = match fee {
        // Limit orders take the live fee quote
        Some(f) => (
            f.settlement_fee,
            sign_info(f.settlement_fee_signature.clone(), f.settlement_fee_sign_expiration),
        ),
        // Regular trades carry the fee they were queued with
        None => (
            trade.settlement_fee,
            sign_info(
                trade.settlement_fee_signature.clone(),
                trade.settlement_fee_sign_expiration,
            ),
        ),
    };
    TradeEntry {
        queueId: U256::from(trade.queue_id),
        user: trade.user_address,
        tradeSize: U256::from(trade.trade_size),
        period: U256::from(trade.period),
        targetContract: trade.target_contract,
        strike: U256::from(trade.strike),
        slippage: U256::from(trade.slippage),
        allowPartialFill: trade.allow_partial_fill,
        referralCode: trade.referral_code.clone(),
        traderNFTId: U256::from(trade.trader_nft_id),
        price: U256::from(quote.price),
        settlementFee: U256::from(settlement_fee),
        isLimitOrder: trade.is_limit_order,
        limitOrderExpiry: if trade.is_limit_order {
            U256::from(trade.limit_order_expiration)
        } else {
            U256::ZERO
        },
        settlementFeeSignInfo: fee_sign,
        userSignInfo: sign_info(trade.user_partial_signature.clone(), trade.signature_timestamp),
        publisherSignInfo: sign_info(quote.signature.clone(), price_timestamp),
    }
}

/// Outcome of open-batch construction.
pub struct OpenPlan {
    pub batch: Batch<TradeEntry>,
    /// Queue ids included in the batch, for the post-confirm record update.
    pub accepted: Vec<u64>,
    /// Queue ids rejected because their window lapsed; cancelled upstream.
    pub expired: Vec<u64>,
}

/// Build the `openTrades` batch from pending trades.
///
/// A trade makes the batch only if its queue id has not been rejected
/// on-chain before, its market's asset pair is known, a signed price is on
/// hand, the price sits inside the strike slippage bounds, the submission
/// window holds, and (for limit orders) a live settlement-fee quote exists
/// for the pair. Trades on the invalid-id list are ignored entirely: never
/// batched, never cancelled.
pub fn build_open_plan(
    trades: &[PendingTrade],
    pairs: &HashMap<Address, String>,
    prices: &HashMap<String, PriceQuote>,
    fees: &HashMap<String, SettlementFeeQuote>,
    invalid_ids: &InvalidIdSet,
    now: u64,
) -> OpenPlan {
    let trades: Vec<&PendingTrade> = trades
        .iter()
        .filter(|t| !invalid_ids.contains(&WorkKey::Queue(t.queue_id)))
        .collect();
    let mut entries = Vec::new();
    let mut accepted = Vec::new();
    for trade in &trades {
        let Some((quote, price_ts)) = quote_for(trade, pairs, prices, now) else {
            continue;
        };
        if !strike_within_slippage(trade.slippage, quote.price, trade.strike) {
            debug!("queue#{}: price {} outside strike bounds", trade.queue_id, quote.price);
            continue;
        }
        if !within_open_window(trade, now) {
            continue;
        }
        let fee = if trade.is_limit_order {
            let Some(pair) = pairs.get(&trade.target_contract) else {
                continue;
            };
            match fees.get(pair) {
                Some(f) => Some(f),
                None => {
                    debug!("queue#{}: no settlement fee for {pair}", trade.queue_id);
                    continue;
                }
            }
        } else {
            None
        };
        entries.push(trade_entry(trade, quote, price_ts, fee));
    }
    let batch = Batch::build(entries, |e: &TradeEntry| e.queueId);
    let mut in_batch = std::collections::HashSet::new();
    for entry in batch.entries() {
        let id: u64 = entry.queueId.saturating_to();
        if in_batch.insert(id) {
            accepted.push(id);
        }
    }
    let expired = trades
        .iter()
        .filter(|t| !in_batch.contains(&t.queue_id) && window_expired(t, now))
        .map(|t| t.queue_id)
        .collect();
    OpenPlan {
        batch,
        accepted,
        expired,
    }
}

/// Build the `resolveQueuedTrades` batch. Entries here already missed their
/// window once; the gates are a clean invalid-id record and a signed price
/// at the queueing timestamp.
pub fn build_resolve_batch(
    trades: &[PendingTrade],
    pairs: &HashMap<Address, String>,
    prices: &HashMap<String, PriceQuote>,
    invalid_ids: &InvalidIdSet,
) -> Batch<TradeEntry> {
    let entries = trades.iter().filter_map(|trade| {
        if invalid_ids.contains(&WorkKey::Queue(trade.queue_id)) {
            return None;
        }
        let pair = pairs.get(&trade.target_contract)?;
        let timestamp = trade.queued_timestamp;
        let quote = prices.get(&PriceKey::new(pair.clone(), timestamp).cache_key())?;
        Some(trade_entry(trade, quote, timestamp, None))
    });
    Batch::build(entries, |e: &TradeEntry| e.queueId)
}

/// An expired option that survived the liveness joins and awaits a price.
#[derive(Debug, Clone)]
pub struct ExecuteCandidate {
    pub option: ExpiredOption,
    pub is_above: bool,
    pub user_signature: alloy::primitives::Bytes,
    pub signature_timestamp: u64,
}

/// Join expired options against their chain state, the router's queue-id
/// mapping, the active-market records, and the invalid-id set.
///
/// `states` and `queue_ids` are positional per option; `None` marks an
/// unavailable read, which skips the option for the cycle.
pub fn execute_candidates(
    options: &[ExpiredOption],
    states: &[Option<OptionInfo>],
    queue_ids: &[Option<u64>],
    markets: &HashMap<u64, ActiveMarket>,
    invalid_ids: &InvalidIdSet,
) -> Vec<ExecuteCandidate> {
    options
        .iter()
        .zip(states.iter().zip(queue_ids.iter()))
        .filter_map(|(option, (state, queue_id))| {
            let state = state.as_ref()?;
            if state.state != 1 {
                return None;
            }
            let key = WorkKey::Option {
                option_id: option.option_id,
                market: option.market,
            };
            if invalid_ids.contains(&key) {
                return None;
            }
            let market = markets.get(&(*queue_id)?)?;
            Some(ExecuteCandidate {
                option: option.clone(),
                is_above: market.is_above,
                user_signature: market.user_full_signature.clone(),
                signature_timestamp: market.signature_timestamp,
            })
        })
        .collect()
}

/// Price keys for execute candidates: one per `(pair, expirationTime)`.
pub fn price_requests_for_executes(
    candidates: &[ExecuteCandidate],
    pairs: &HashMap<Address, String>,
) -> Vec<PriceKey> {
    let mut seen = std::collections::HashSet::new();
    let mut keys = Vec::new();
    for candidate in candidates {
        let Some(pair) = pairs.get(&candidate.option.market) else {
            continue;
        };
        let key = PriceKey::new(pair.clone(), candidate.option.expiration_time);
        if seen.insert(key.cache_key()) {
            keys.push(key);
        }
    }
    keys
}

/// Build the `executeOptions` batch: candidates with a signed expiry price,
/// deduplicated on `(optionId, market)`.
pub fn build_execute_batch(
    candidates: &[ExecuteCandidate],
    pairs: &HashMap<Address, String>,
    prices: &HashMap<String, PriceQuote>,
) -> Batch<ExecuteEntry> {
    let entries = candidates.iter().filter_map(|c| {
        let pair = pairs.get(&c.option.market)?;
        let key = PriceKey::new(pair.clone(), c.option.expiration_time);
        let quote = prices.get(&key.cache_key())?;
        Some(ExecuteEntry {
            optionId: U256::from(c.option.option_id),
            targetContract: c.option.market,
            price: U256::from(quote.price),
            isAbove: c.is_above,
            userSignInfo: sign_info(c.user_signature.clone(), c.signature_timestamp),
            publisherSignInfo: sign_info(quote.signature.clone(), c.option.expiration_time),
        })
    });
    Batch::build(entries, |e: &ExecuteEntry| WorkKey::Option {
        option_id: e.optionId.saturating_to(),
        market: e.targetContract,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_support::pending_trade;
    use alloy::primitives::Bytes;

    const NOW: u64 = 1_700_000_050;

    fn market() -> Address {
        Address::repeat_byte(0x11)
    }

    fn pairs() -> HashMap<Address, String> {
        HashMap::from([(market(), "BTCUSD".to_string())])
    }

    fn quote(price: u128) -> PriceQuote {
        PriceQuote {
            price,
            signature: Bytes::from(vec![0xee; 65]),
        }
    }

    fn prices_at(timestamp: u64, price: u128) -> HashMap<String, PriceQuote> {
        HashMap::from([(format!("BTCUSD-{timestamp}"), quote(price))])
    }

    fn rejected(keys: impl IntoIterator<Item = WorkKey>) -> (tempfile::TempDir, InvalidIdSet) {
        let dir = tempfile::tempdir().unwrap();
        let set = InvalidIdSet::open(dir.path().join("ids.json"));
        set.extend(keys);
        (dir, set)
    }

    #[test]
    fn strike_bounds_are_inclusive() {
        // 50 bps around 10_000: [9_950, 10_050]
        assert!(strike_within_slippage(50, 9_950, 10_000));
        assert!(strike_within_slippage(50, 10_050, 10_000));
        assert!(strike_within_slippage(50, 10_000, 10_000));
        assert!(!strike_within_slippage(50, 9_949, 10_000));
        assert!(!strike_within_slippage(50, 10_051, 10_000));
    }

    #[test]
    fn zero_slippage_requires_exact_price() {
        assert!(strike_within_slippage(0, 10_000, 10_000));
        assert!(!strike_within_slippage(0, 10_001, 10_000));
    }

    #[test]
    fn open_window_boundary_is_inclusive() {
        let mut trade = pending_trade(1, false);
        trade.queued_timestamp = NOW - OPEN_WINDOW_SECS;
        assert!(within_open_window(&trade, NOW));
        trade.queued_timestamp = NOW - OPEN_WINDOW_SECS - 1;
        assert!(!within_open_window(&trade, NOW));
        trade.queued_timestamp = NOW - 1;
        assert!(within_open_window(&trade, NOW));
    }

    #[test]
    fn limit_order_window_is_its_expiry() {
        let mut trade = pending_trade(1, true);
        trade.limit_order_expiration = NOW + 1;
        assert!(within_open_window(&trade, NOW));
        trade.limit_order_expiration = NOW;
        assert!(!within_open_window(&trade, NOW));
    }

    #[test]
    fn stale_trade_is_cancelled_fresh_trade_kept_for_retry() {
        let mut stale = pending_trade(1, false);
        stale.queued_timestamp = NOW - 61;
        let mut fresh = pending_trade(2, false);
        fresh.queued_timestamp = NOW - 59;
        // No prices at all: nothing accepted, only the stale one cancelled
        let (_dir, clean) = rejected([]);
        let plan = build_open_plan(
            &[stale, fresh],
            &pairs(),
            &HashMap::new(),
            &HashMap::new(),
            &clean,
            NOW,
        );
        assert!(plan.batch.is_empty());
        assert!(plan.accepted.is_empty());
        assert_eq!(plan.expired, vec![1]);
    }

    #[test]
    fn open_plan_attaches_price_and_fee_fields() {
        let mut trade = pending_trade(4, false);
        trade.queued_timestamp = NOW - 10;
        let prices = prices_at(trade.queued_timestamp, trade.strike);
        let (_dir, clean) = rejected([]);
        let plan = build_open_plan(
            std::slice::from_ref(&trade),
            &pairs(),
            &prices,
            &HashMap::new(),
            &clean,
            NOW,
        );
        assert_eq!(plan.accepted, vec![4]);
        let entry = &plan.batch.entries()[0];
        assert_eq!(entry.price, U256::from(trade.strike));
        assert_eq!(entry.settlementFee, U256::from(trade.settlement_fee));
        assert_eq!(entry.limitOrderExpiry, U256::ZERO);
        assert_eq!(
            entry.publisherSignInfo.timestamp,
            U256::from(trade.queued_timestamp)
        );
    }

    #[test]
    fn limit_order_without_fee_quote_is_skipped() {
        let mut trade = pending_trade(5, true);
        trade.limit_order_expiration = NOW + 100;
        let prices = prices_at(NOW, trade.strike);
        let (_dir, clean) = rejected([]);
        let plan = build_open_plan(
            std::slice::from_ref(&trade),
            &pairs(),
            &prices,
            &HashMap::new(),
            &clean,
            NOW,
        );
        assert!(plan.batch.is_empty());
        // Not cancelled either: the window still holds
        assert!(plan.expired.is_empty());

        let fees = HashMap::from([(
            "BTCUSD".to_string(),
            SettlementFeeQuote {
                settlement_fee: 777,
                settlement_fee_signature: Bytes::from(vec![0xcc; 65]),
                settlement_fee_sign_expiration: NOW + 500,
            },
        )]);
        let plan =
            build_open_plan(std::slice::from_ref(&trade), &pairs(), &prices, &fees, &clean, NOW);
        assert_eq!(plan.batch.len(), 1);
        let entry = &plan.batch.entries()[0];
        assert_eq!(entry.settlementFee, U256::from(777u64));
        assert_eq!(entry.limitOrderExpiry, U256::from(trade.limit_order_expiration));
        // Limit orders are priced at "now"
        assert_eq!(entry.publisherSignInfo.timestamp, U256::from(NOW));
    }

    #[test]
    fn missing_price_drops_entry_without_cancelling() {
        let mut priced = pending_trade(1, false);
        priced.queued_timestamp = NOW - 5;
        let mut unpriced = pending_trade(2, false);
        unpriced.queued_timestamp = NOW - 6;
        let prices = prices_at(priced.queued_timestamp, priced.strike);
        let (_dir, clean) = rejected([]);
        let plan = build_open_plan(
            &[priced, unpriced],
            &pairs(),
            &prices,
            &HashMap::new(),
            &clean,
            NOW,
        );
        assert_eq!(plan.accepted, vec![1]);
        assert!(plan.expired.is_empty());
    }

    #[test]
    fn rejected_queue_id_never_reenters_open_plan() {
        // Trade 5 is fully eligible (fresh, priced at its strike) but its
        // queue id was rejected on-chain in an earlier cycle.
        let mut blocked = pending_trade(5, false);
        blocked.queued_timestamp = NOW - 10;
        let mut fine = pending_trade(6, false);
        fine.queued_timestamp = NOW - 10;
        let prices = prices_at(NOW - 10, blocked.strike);
        let (_dir, invalid) = rejected([WorkKey::Queue(5)]);

        let plan = build_open_plan(
            &[blocked, fine],
            &pairs(),
            &prices,
            &HashMap::new(),
            &invalid,
            NOW,
        );
        assert_eq!(plan.accepted, vec![6]);
        assert_eq!(plan.batch.len(), 1);
        assert_eq!(plan.batch.entries()[0].queueId, U256::from(6u64));
        // Ignored, not cancelled
        assert!(plan.expired.is_empty());
    }

    #[test]
    fn rejected_queue_id_is_skipped_by_resolve_batch() {
        let mut blocked = pending_trade(5, false);
        blocked.queued_timestamp = NOW - 10_000;
        let mut fine = pending_trade(6, false);
        fine.queued_timestamp = NOW - 10_000;
        let prices = prices_at(NOW - 10_000, blocked.strike);
        let (_dir, invalid) = rejected([WorkKey::Queue(5)]);

        let batch = build_resolve_batch(&[blocked, fine], &pairs(), &prices, &invalid);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.entries()[0].queueId, U256::from(6u64));
    }

    #[test]
    fn price_requests_dedup_across_trades() {
        let mut a = pending_trade(1, false);
        let mut b = pending_trade(2, false);
        a.queued_timestamp = 100;
        b.queued_timestamp = 100;
        let mut c = pending_trade(3, false);
        c.queued_timestamp = 200;
        let keys = price_requests_for_trades(&[a, b, c], &pairs(), NOW);
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].timestamp, 100);
        assert_eq!(keys[1].timestamp, 200);
    }

    #[test]
    fn resolve_batch_skips_window_and_strike_checks() {
        let mut trade = pending_trade(8, false);
        trade.queued_timestamp = NOW - 10_000; // far outside the open window
        let far_price = trade.strike * 3; // far outside slippage
        let prices = prices_at(trade.queued_timestamp, far_price);
        let (_dir, clean) = rejected([]);
        let batch = build_resolve_batch(std::slice::from_ref(&trade), &pairs(), &prices, &clean);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.entries()[0].price, U256::from(far_price));
    }

    fn expired_option(id: u64) -> ExpiredOption {
        ExpiredOption {
            option_id: id,
            market: market(),
            expiration_time: NOW - 100,
        }
    }

    fn live_state() -> Option<OptionInfo> {
        Some(OptionInfo {
            state: 1,
            strike: 10_000,
            amount: 1,
            expiration_time: NOW - 100,
        })
    }

    fn active_market(queue_id: u64) -> (u64, ActiveMarket) {
        (
            queue_id,
            ActiveMarket {
                queue_id,
                queued_timestamp: NOW - 1_000,
                state: 1,
                is_above: true,
                user_full_signature: Bytes::from(vec![0xdd; 65]),
                signature_timestamp: NOW - 1_000,
                expiration_time: NOW - 100,
            },
        )
    }

    #[test]
    fn execute_candidates_apply_all_liveness_gates() {
        // Option 3 was rejected on-chain. Queue id 1 was too, but a queue
        // rejection must not shadow the option with the same number.
        let (_dir, invalid) = rejected([
            WorkKey::Option {
                option_id: 3,
                market: market(),
            },
            WorkKey::Queue(1),
        ]);

        let options = vec![
            expired_option(1), // fine
            expired_option(2), // already settled on-chain
            expired_option(3), // invalid id
            expired_option(4), // no market record
            expired_option(5), // mapping read unavailable
        ];
        let states = vec![
            live_state(),
            Some(OptionInfo { state: 2, ..live_state().unwrap() }),
            live_state(),
            live_state(),
            live_state(),
        ];
        let queue_ids = vec![Some(11), Some(12), Some(13), Some(14), None];
        let markets = HashMap::from([active_market(11), active_market(12), active_market(13)]);

        let candidates = execute_candidates(&options, &states, &queue_ids, &markets, &invalid);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].option.option_id, 1);
        assert!(candidates[0].is_above);
    }

    #[test]
    fn execute_batch_requires_price_and_dedups() {
        let (_dir, invalid) = rejected([]);

        let options: Vec<ExpiredOption> =
            vec![expired_option(1), expired_option(2), expired_option(2), expired_option(9)];
        let states: Vec<Option<OptionInfo>> = options.iter().map(|_| live_state()).collect();
        let queue_ids = vec![Some(11), Some(12), Some(12), Some(13)];
        let markets = HashMap::from([active_market(11), active_market(12), active_market(13)]);
        let candidates = execute_candidates(&options, &states, &queue_ids, &markets, &invalid);
        assert_eq!(candidates.len(), 4);

        let prices = prices_at(NOW - 100, 10_000);
        let keys = price_requests_for_executes(&candidates, &pairs());
        assert_eq!(keys.len(), 1); // all four share (BTCUSD, NOW-100)

        let batch = build_execute_batch(&candidates, &pairs(), &prices);
        // 1, 2 (deduped), 9
        assert_eq!(batch.len(), 3);
        let ids: Vec<u64> = batch
            .entries()
            .iter()
            .map(|e| e.optionId.saturating_to())
            .collect();
        assert_eq!(ids, vec![1, 2, 9]);
    }
}
