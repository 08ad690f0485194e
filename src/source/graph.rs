//! Index-service (subgraph) queries for the unlock/expire path.

use crate::types::{ExpiredOption, SettledOption, WorkItem};
use alloy::primitives::Address;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

const PAGE_SIZE: usize = 1000;

#[derive(Debug, Deserialize)]
struct GraphResponse {
    data: Option<GraphData>,
}

#[derive(Debug, Deserialize)]
struct GraphData {
    #[serde(rename = "userOptionDatas")]
    user_option_datas: Vec<OptionRow>,
}

#[derive(Debug, Deserialize)]
struct OptionRow {
    #[serde(rename = "optionID", deserialize_with = "super::u64_lenient")]
    option_id: u64,
    #[serde(rename = "optionContract")]
    option_contract: OptionContract,
    #[serde(rename = "expirationTime", deserialize_with = "super::u64_lenient")]
    expiration_time: u64,
    #[serde(default, deserialize_with = "super::u128_lenient_or_zero")]
    payout: u128,
    #[serde(
        rename = "expirationPrice",
        default,
        deserialize_with = "super::u128_lenient_or_zero"
    )]
    expiration_price: u128,
    #[serde(rename = "closeTime", default, deserialize_with = "super::u64_lenient")]
    close_time: u64,
}

#[derive(Debug, Deserialize)]
struct OptionContract {
    address: Address,
}

/// Subgraph client for option state listings.
pub struct GraphClient {
    client: reqwest::Client,
    endpoint: String,
}

impl GraphClient {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    async fn query(&self, query: String) -> Result<Vec<OptionRow>> {
        let body = json!({
            "query": query,
            "variables": null,
            "operationName": "UserOptionHistory",
        });
        let response: GraphResponse = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .context("index service request failed")?
            .error_for_status()
            .context("index service returned error status")?
            .json()
            .await
            .context("index service response is not graph JSON")?;
        Ok(response
            .data
            .context("index service response has no data")?
            .user_option_datas)
    }

    /// Active options (state 1) whose expiration is already in the past,
    /// tagged as unlock work. Failures yield an empty list; the options are
    /// picked up next cycle.
    pub async fn fetch_expiring(&self, now: u64) -> Vec<WorkItem> {
        self.expiring_options(now)
            .await
            .into_iter()
            .map(WorkItem::ExpiredOption)
            .collect()
    }

    async fn expiring_options(&self, now: u64) -> Vec<ExpiredOption> {
        let query = format!(
            "query UserOptionHistory {{ userOptionDatas(orderBy: creationTime, \
             orderDirection: asc, where: {{state_in: [1], expirationTime_lt: {now}}}, \
             first: {PAGE_SIZE}) {{ optionID queueID optionContract {{address}} expirationTime }} }}"
        );
        match self.query(query).await {
            Ok(rows) => rows
                .into_iter()
                .map(|r| ExpiredOption {
                    option_id: r.option_id,
                    market: r.option_contract.address,
                    expiration_time: r.expiration_time,
                })
                .collect(),
            Err(e) => {
                warn!("expiring-options query failed: {e:#}");
                Vec::new()
            }
        }
    }

    /// Settled options (state 2/3) expiring at or after `min_timestamp`,
    /// used for the post-unlock record-store sync.
    pub async fn settled_options(&self, min_timestamp: u64) -> Vec<SettledOption> {
        let query = format!(
            "query UserOptionHistory {{ userOptionDatas(orderBy: creationTime, \
             orderDirection: asc, where: {{state_in: [2,3], expirationTime_gte: {min_timestamp}}}, \
             first: {PAGE_SIZE}) {{ optionID queueID payout expirationPrice closeTime \
             optionContract {{address}} expirationTime }} }}"
        );
        match self.query(query).await {
            Ok(rows) => rows
                .into_iter()
                .map(|r| SettledOption {
                    option_id: r.option_id,
                    market: r.option_contract.address,
                    payout: r.payout,
                    expiration_price: r.expiration_price,
                    close_time: r.close_time,
                })
                .collect(),
            Err(e) => {
                warn!("settled-options query failed: {e:#}");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_rows_decode_with_string_bigints() {
        let raw = r#"{
            "data": {"userOptionDatas": [{
                "optionID": "17",
                "optionContract": {"address": "0x1111111111111111111111111111111111111111"},
                "expirationTime": "1700000900",
                "payout": null,
                "expirationPrice": "6500000000000",
                "closeTime": "1700000910"
            }]}
        }"#;
        let parsed: GraphResponse = serde_json::from_str(raw).unwrap();
        let rows = parsed.data.unwrap().user_option_datas;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].option_id, 17);
        assert_eq!(rows[0].payout, 0);
        assert_eq!(rows[0].expiration_price, 6_500_000_000_000);
    }

    #[test]
    fn settled_fields_default_when_absent() {
        // The expiring-options query does not select payout/closeTime
        let raw = r#"{
            "data": {"userOptionDatas": [{
                "optionID": 3,
                "optionContract": {"address": "0x2222222222222222222222222222222222222222"},
                "expirationTime": 1700000000
            }]}
        }"#;
        let parsed: GraphResponse = serde_json::from_str(raw).unwrap();
        let rows = parsed.data.unwrap().user_option_datas;
        assert_eq!(rows[0].payout, 0);
        assert_eq!(rows[0].close_time, 0);
    }
}
