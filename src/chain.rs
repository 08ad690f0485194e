//! Batched on-chain reads.
//!
//! Every liveness check a cycle needs (queue slots, option state, id
//! mappings) is folded into a single Multicall3 `aggregate3` round trip, so
//! all reads observe the same block height. Individual calls are made with
//! `allowFailure: true`; a failed or undecodable slot surfaces as
//! [`ReadResult::Unavailable`] and the corresponding work item is skipped
//! for the cycle rather than failing the batch.

use crate::contracts::{IMulticall3, IOptionsMarket, ISettlementRouter};
use alloy::primitives::{Address, U256};
use alloy::providers::DynProvider;
use alloy::sol_types::SolCall;
use anyhow::{Context, Result};
use dashmap::DashMap;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Calls per `aggregate3` invocation. Keeps calldata and return payloads
/// well under node response limits.
const MULTICALL_CHUNK: usize = 200;

/// One requested read, addressed to the router or an options market.
#[derive(Debug, Clone)]
pub enum ReadCall {
    /// `market.options(optionId)`
    OptionState { market: Address, option_id: u64 },
    /// `router.optionIdMapping(market, optionId)`
    QueueIdForOption { market: Address, option_id: u64 },
    /// `router.queuedTrades(queueId)`
    QueuedTrade { queue_id: u64 },
    /// `market.assetPair()`
    AssetPair { market: Address },
}

/// Decoded option record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionInfo {
    pub state: u8,
    pub strike: u128,
    pub amount: u128,
    pub expiration_time: u64,
}

/// Result slot, positionally matched to the submitted [`ReadCall`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    OptionState(OptionInfo),
    QueueId(u64),
    QueuedTrade { taker: Address, queued_timestamp: u64 },
    AssetPair(String),
    /// The call reverted or its return data did not decode.
    Unavailable,
}

fn encode_call(router: Address, call: &ReadCall) -> IMulticall3::Call3 {
    let (target, call_data) = match call {
        ReadCall::OptionState { market, option_id } => (
            *market,
            IOptionsMarket::optionsCall {
                optionId: U256::from(*option_id),
            }
            .abi_encode(),
        ),
        ReadCall::QueueIdForOption { market, option_id } => (
            router,
            ISettlementRouter::optionIdMappingCall {
                targetContract: *market,
                optionId: U256::from(*option_id),
            }
            .abi_encode(),
        ),
        ReadCall::QueuedTrade { queue_id } => (
            router,
            ISettlementRouter::queuedTradesCall {
                queueId: U256::from(*queue_id),
            }
            .abi_encode(),
        ),
        ReadCall::AssetPair { market } => {
            (*market, IOptionsMarket::assetPairCall {}.abi_encode())
        }
    };
    IMulticall3::Call3 {
        target,
        allowFailure: true,
        callData: call_data.into(),
    }
}

fn decode_result(call: &ReadCall, raw: &IMulticall3::Result) -> ReadResult {
    if !raw.success {
        return ReadResult::Unavailable;
    }
    let data = raw.returnData.as_ref();
    let decoded = match call {
        ReadCall::OptionState { .. } => IOptionsMarket::optionsCall::abi_decode_returns(data)
            .ok()
            .map(|r| {
                ReadResult::OptionState(OptionInfo {
                    state: r.state,
                    strike: r.strike.saturating_to(),
                    amount: r.amount.saturating_to(),
                    expiration_time: r.expirationTime.saturating_to(),
                })
            }),
        ReadCall::QueueIdForOption { .. } => {
            ISettlementRouter::optionIdMappingCall::abi_decode_returns(data)
                .ok()
                .map(|queue_id| ReadResult::QueueId(queue_id.saturating_to()))
        }
        ReadCall::QueuedTrade { .. } => {
            ISettlementRouter::queuedTradesCall::abi_decode_returns(data)
                .ok()
                .map(|r| ReadResult::QueuedTrade {
                    taker: r.taker,
                    queued_timestamp: r.queuedTimestamp.saturating_to(),
                })
        }
        ReadCall::AssetPair { .. } => IOptionsMarket::assetPairCall::abi_decode_returns(data)
            .ok()
            .map(ReadResult::AssetPair),
    };
    decoded.unwrap_or(ReadResult::Unavailable)
}

/// Multicall-backed chain reader with a per-market asset-pair cache.
pub struct ChainReader {
    provider: DynProvider,
    router: Address,
    multicall: Address,
    /// Asset pairs are immutable per market contract, cached forever.
    pair_cache: DashMap<Address, String>,
}

impl ChainReader {
    pub fn new(provider: DynProvider, router: Address, multicall: Address) -> Self {
        Self {
            provider,
            router,
            multicall,
            pair_cache: DashMap::new(),
        }
    }

    /// Execute `calls` in chunks and return one [`ReadResult`] per call,
    /// in order.
    pub async fn read_batch(&self, calls: &[ReadCall]) -> Result<Vec<ReadResult>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }
        let multicall = IMulticall3::new(self.multicall, self.provider.clone());
        let mut results = Vec::with_capacity(calls.len());
        for chunk in calls.chunks(MULTICALL_CHUNK) {
            let encoded: Vec<IMulticall3::Call3> =
                chunk.iter().map(|c| encode_call(self.router, c)).collect();
            let raw = multicall
                .aggregate3(encoded)
                .call()
                .await
                .context("multicall aggregate3 failed")?;
            if raw.len() != chunk.len() {
                anyhow::bail!(
                    "multicall returned {} results for {} calls",
                    raw.len(),
                    chunk.len()
                );
            }
            for (call, slot) in chunk.iter().zip(raw.iter()) {
                let decoded = decode_result(call, slot);
                if matches!(decoded, ReadResult::Unavailable) {
                    warn!("chain read unavailable for {call:?}");
                }
                results.push(decoded);
            }
        }
        debug!("read_batch resolved {} calls", results.len());
        Ok(results)
    }

    /// Resolve asset pairs for a set of market contracts, hitting the chain
    /// only for markets not yet seen. Markets whose `assetPair()` read fails
    /// are absent from the result.
    pub async fn asset_pairs(&self, markets: &[Address]) -> Result<HashMap<Address, String>> {
        let mut out = HashMap::new();
        let mut missing = Vec::new();
        for market in markets {
            match self.pair_cache.get(market) {
                Some(pair) => {
                    out.insert(*market, pair.value().clone());
                }
                None if !missing.contains(market) => missing.push(*market),
                None => {}
            }
        }
        if missing.is_empty() {
            return Ok(out);
        }
        let calls: Vec<ReadCall> = missing
            .iter()
            .map(|m| ReadCall::AssetPair { market: *m })
            .collect();
        for (market, result) in missing.iter().zip(self.read_batch(&calls).await?) {
            if let ReadResult::AssetPair(pair) = result {
                // Oracle keys use the dashless pair form ("BTC-USD" -> "BTCUSD")
                let pair = pair.replace('-', "");
                self.pair_cache.insert(*market, pair.clone());
                out.insert(*market, pair);
            }
        }
        Ok(out)
    }
}
