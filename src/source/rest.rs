//! Application REST API client.
//!
//! Authenticated with a fixed keeper signature: the keeper key signs the
//! literal message `"Sign to verify user address"` once at startup and the
//! hex signature rides along every request as `user_signature`.
//!
//! Row parsing is strict and per-record: a row that does not match the
//! expected schema is logged and dropped, never padded with placeholder
//! values, so malformed upstream data can only shrink a batch.

use crate::types::{ActiveMarket, PendingTrade, SettlementFeeQuote, WorkItem};
use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{info, warn};

const AUTH_MESSAGE: &str = "Sign to verify user address";

/// Post-unlock record-store row (`trade/unlock`).
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UnlockRecord {
    pub queue_id: u64,
    pub payout: u128,
    pub expiry_price: u128,
    pub close_time: u64,
}

pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    chain_id: u64,
    keeper_address: Address,
    auth_signature: String,
}

impl RestClient {
    /// Build the client, signing the auth message with the keeper key.
    pub async fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        chain_id: u64,
        signer: &PrivateKeySigner,
    ) -> Result<Self> {
        let signature = signer
            .sign_message(AUTH_MESSAGE.as_bytes())
            .await
            .context("signing keeper auth message")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            chain_id,
            keeper_address: signer.address(),
            auth_signature: format!("0x{}", alloy::hex::encode(signature.as_bytes())),
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{path}/?environment={}&user_signature={}",
            self.base_url, self.chain_id, self.auth_signature
        )
    }

    async fn get_rows(&self, url: &str) -> Result<Vec<Value>> {
        self.client
            .get(url)
            .send()
            .await
            .context("REST request failed")?
            .error_for_status()
            .context("REST returned error status")?
            .json::<Vec<Value>>()
            .await
            .context("REST response is not a JSON array")
    }

    fn parse_rows<T: serde::de::DeserializeOwned>(rows: Vec<Value>, what: &str) -> Vec<T> {
        let mut parsed = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value::<T>(row.clone()) {
                Ok(v) => parsed.push(v),
                Err(e) => warn!("dropping malformed {what} row: {e} ({row})"),
            }
        }
        parsed
    }

    /// Queued trades awaiting `openTrades` (`trades/all_pending`), tagged
    /// as regular or limit-order work.
    pub async fn fetch_pending(&self) -> Vec<WorkItem> {
        let rows = match self.get_rows(&self.url("trades/all_pending")).await {
            Ok(rows) => Self::parse_rows(rows, "pending trade"),
            Err(e) => {
                warn!("pending-trades fetch failed: {e:#}");
                Vec::new()
            }
        };
        rows.into_iter().map(WorkItem::from_pending).collect()
    }

    /// Regular queued trades whose record-store state is still `QUEUED`,
    /// drained through `resolveQueuedTrades` (`trades/queued`).
    pub async fn fetch_resolvable(&self) -> Vec<WorkItem> {
        self.resolvable_trades()
            .await
            .into_iter()
            .map(WorkItem::ResolvableQueueEntry)
            .collect()
    }

    async fn resolvable_trades(&self) -> Vec<PendingTrade> {
        let url = format!(
            "{}&user_address={}",
            self.url("trades/queued"),
            self.keeper_address
        );
        let rows = match self.get_rows(&url).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("resolvable-trades fetch failed: {e:#}");
                return Vec::new();
            }
        };
        let rows: Vec<Value> = rows
            .into_iter()
            .filter(|r| {
                r.get("state").and_then(Value::as_str) == Some("QUEUED")
                    && r.get("is_limit_order").and_then(Value::as_bool) == Some(false)
            })
            .collect();
        Self::parse_rows(rows, "resolvable trade")
    }

    /// Active-market records keyed by queue id (`trades/all_active`); joined
    /// against expired options on the close path.
    pub async fn active_markets(&self) -> HashMap<u64, ActiveMarket> {
        let url = format!("{}&order_by=-queued_timestamp", self.url("trades/all_active"));
        match self.get_rows(&url).await {
            Ok(rows) => Self::parse_rows::<ActiveMarket>(rows, "active market")
                .into_iter()
                .map(|m| (m.queue_id, m))
                .collect(),
            Err(e) => {
                warn!("active-markets fetch failed: {e:#}");
                HashMap::new()
            }
        }
    }

    /// Current signed settlement fees keyed by asset pair (`settlement_fee`).
    /// Only limit orders consume these; regular trades carry their own fee.
    pub async fn settlement_fees(&self) -> HashMap<String, SettlementFeeQuote> {
        let url = format!("{}/settlement_fee/?environment={}", self.base_url, self.chain_id);
        let fetched: Result<HashMap<String, SettlementFeeQuote>> = async {
            self.client
                .get(&url)
                .send()
                .await
                .context("REST request failed")?
                .error_for_status()
                .context("REST returned error status")?
                .json()
                .await
                .context("settlement-fee response is not a pair map")
        }
        .await;
        match fetched {
            Ok(map) => map,
            Err(e) => {
                warn!("settlement-fees fetch failed: {e:#}");
                HashMap::new()
            }
        }
    }

    async fn post(&self, url: String, payload: &impl Serialize, what: &str) {
        let result = async {
            self.client
                .post(&url)
                .json(payload)
                .send()
                .await
                .context("REST request failed")?
                .error_for_status()
                .context("REST returned error status")?;
            anyhow::Ok(())
        }
        .await;
        match result {
            Ok(()) => info!("{what} recorded"),
            Err(e) => warn!("{what} write-back failed: {e:#}"),
        }
    }

    /// Mark queue ids as opened after a confirmed `openTrades` (`trade/update`).
    pub async fn update_after_open(&self, queue_ids: &[u64]) {
        if queue_ids.is_empty() {
            return;
        }
        self.post(self.url("trade/update"), &queue_ids, "open update")
            .await;
    }

    /// Cancel queue ids that fell out of their eligibility window
    /// (`trades/cancel`).
    pub async fn cancel_trades(&self, queue_ids: &[u64]) {
        if queue_ids.is_empty() {
            return;
        }
        let url = format!(
            "{}&user_address={}",
            self.url("trades/cancel"),
            self.keeper_address
        );
        self.post(url, &queue_ids, "trade cancellation").await;
    }

    /// Sync settled-option outcomes into the record store (`trade/unlock`).
    pub async fn update_after_unlock(&self, records: &[UnlockRecord]) {
        if records.is_empty() {
            return;
        }
        self.post(self.url("trade/unlock"), &records, "unlock update")
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_support::pending_trade;

    #[test]
    fn malformed_rows_are_dropped_not_defaulted() {
        let good = serde_json::json!({
            "queue_id": 5,
            "user_address": "0x3333333333333333333333333333333333333333",
            "trade_size": 5000000u64,
            "period": 900,
            "target_contract": "0x1111111111111111111111111111111111111111",
            "strike": 6500000000000u64,
            "slippage": 50,
            "allow_partial_fill": false,
            "referral_code": "",
            "trader_nft_id": 0,
            "queued_timestamp": 1700000000u64,
            "is_limit_order": false,
            "limit_order_expiration": 1700001000u64,
            "settlement_fee": 500,
            "settlement_fee_signature": "0xaa",
            "settlement_fee_sign_expiration": 1700000500u64,
            "user_partial_signature": "0xbb",
            "signature_timestamp": 1700000000u64
        });
        let bad = serde_json::json!({"queue_id": 6}); // missing everything else
        let rows = vec![good, bad];
        let parsed: Vec<PendingTrade> = RestClient::parse_rows(rows, "pending trade");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].queue_id, 5);
        assert_eq!(parsed[0].strike, pending_trade(5, false).strike);
    }

    #[test]
    fn unlock_record_serializes_flat() {
        let record = UnlockRecord {
            queue_id: 9,
            payout: 1_000_000,
            expiry_price: 65_000,
            close_time: 1_700_000_910,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["queue_id"], 9);
        assert_eq!(json["expiry_price"], 65_000);
    }
}
