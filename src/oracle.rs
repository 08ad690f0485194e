//! Signed price oracle client.
//!
//! The oracle serves `(pair, timestamp)` → signed price quotes over HTTP.
//! Quotes are immutable once signed, so every served quote goes straight
//! into the persistent [`PriceCache`] and a key is never requested twice
//! across the process lifetime.
//!
//! The oracle answers with an empty result set while its signers have not
//! yet produced a quote for the requested timestamp; that case is polled on
//! a fixed schedule ([`RetryPolicy::oracle_default`]). Transport-level
//! failures are not retried here, they propagate to the cycle loop which
//! owns error classification.

use crate::cache::PriceCache;
use crate::retry::{RetryPolicy, Sleeper};
use crate::types::{PriceKey, PriceQuote};
use alloy::primitives::Bytes;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One row of the oracle's `price/query` response. Price and signature are
/// independently optional: the oracle may know a price it cannot yet sign.
#[derive(Debug, Clone, Deserialize)]
pub struct OracleRow {
    pub pair: String,
    pub timestamp: u64,
    pub price: Option<u128>,
    pub signature: Option<Bytes>,
}

#[async_trait]
pub trait OracleApi: Send + Sync {
    /// Query quotes for a set of keys. An empty vec means "not signed yet".
    async fn query_prices(&self, requests: &[PriceKey]) -> Result<Vec<OracleRow>>;
}

/// Production oracle transport: `POST {oracle_url}/price/query` with a JSON
/// array of `{pair, timestamp}` objects.
pub struct HttpOracleApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpOracleApi {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl OracleApi for HttpOracleApi {
    async fn query_prices(&self, requests: &[PriceKey]) -> Result<Vec<OracleRow>> {
        let url = format!("{}/price/query", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(requests)
            .send()
            .await
            .context("oracle request failed")?
            .error_for_status()
            .context("oracle returned error status")?;
        response
            .json::<Vec<OracleRow>>()
            .await
            .context("oracle response is not a quote array")
    }
}

/// Cache-fronted oracle client.
pub struct OracleClient<A, S> {
    api: A,
    sleeper: S,
    policy: RetryPolicy,
    cache: Arc<PriceCache>,
}

impl<A: OracleApi, S: Sleeper> OracleClient<A, S> {
    pub fn new(api: A, sleeper: S, policy: RetryPolicy, cache: Arc<PriceCache>) -> Self {
        Self {
            api,
            sleeper,
            policy,
            cache,
        }
    }

    /// Resolve signed quotes for `requests`, keyed by [`PriceKey::cache_key`].
    ///
    /// Keys already cached are never sent to the oracle. Keys the oracle does
    /// not serve within the retry budget are absent from the result; callers
    /// drop the affected payload entries and retry next cycle.
    pub async fn fetch_prices(
        &self,
        requests: &[PriceKey],
        now: u64,
    ) -> Result<HashMap<String, PriceQuote>> {
        let mut resolved = HashMap::new();
        let mut missing = Vec::new();
        for key in requests {
            match self.cache.get(key) {
                Some(quote) => {
                    resolved.insert(key.cache_key(), quote);
                }
                None => missing.push(key.clone()),
            }
        }
        if missing.is_empty() {
            return Ok(resolved);
        }
        debug!(
            "price fetch: {} cached, {} to query",
            resolved.len(),
            missing.len()
        );

        let mut attempt = 0;
        let rows = loop {
            attempt += 1;
            let rows = self.api.query_prices(&missing).await?;
            if !rows.is_empty() {
                break rows;
            }
            if attempt >= self.policy.max_attempts {
                warn!(
                    "oracle served no quotes for {} keys after {} attempts",
                    missing.len(),
                    attempt
                );
                break rows;
            }
            self.sleeper.sleep(self.policy.delay).await;
        };

        let mut fresh = Vec::new();
        for row in rows {
            let key = PriceKey::new(row.pair.clone(), row.timestamp);
            match (row.price, row.signature) {
                (Some(price), Some(signature)) => {
                    if now > row.timestamp {
                        info!(
                            "price served for {} with {}s lag",
                            key.cache_key(),
                            now - row.timestamp
                        );
                    }
                    fresh.push((key, PriceQuote { price, signature }));
                }
                _ => {
                    // Unsigned quotes are unusable on-chain
                    warn!("discarding unsigned oracle row for {}", key.cache_key());
                }
            }
        }
        for (key, quote) in &fresh {
            resolved.insert(key.cache_key(), quote.clone());
        }
        self.cache.insert_many(fresh);
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::test_support::RecordingSleeper;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FakeOracle {
        calls: AtomicU32,
        responses: Mutex<Vec<Vec<OracleRow>>>,
    }

    impl FakeOracle {
        fn new(responses: Vec<Vec<OracleRow>>) -> Self {
            Self {
                calls: AtomicU32::new(0),
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl OracleApi for &FakeOracle {
        async fn query_prices(&self, _requests: &[PriceKey]) -> Result<Vec<OracleRow>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    fn signed_row(pair: &str, timestamp: u64, price: u128) -> OracleRow {
        OracleRow {
            pair: pair.to_string(),
            timestamp,
            price: Some(price),
            signature: Some(Bytes::from(vec![0xee; 65])),
        }
    }

    fn client<'a>(
        oracle: &'a FakeOracle,
        sleeper: &'a RecordingSleeper,
        cache: Arc<PriceCache>,
    ) -> OracleClient<&'a FakeOracle, &'a RecordingSleeper> {
        OracleClient::new(oracle, sleeper, RetryPolicy::oracle_default(), cache)
    }

    #[tokio::test]
    async fn cached_keys_are_never_refetched() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(PriceCache::open(dir.path().join("p.json")));
        let oracle = FakeOracle::new(vec![vec![signed_row("BTCUSD", 100, 42)]]);
        let sleeper = RecordingSleeper::default();
        let c = client(&oracle, &sleeper, cache.clone());

        let key = PriceKey::new("BTCUSD", 100);
        let first = c.fetch_prices(std::slice::from_ref(&key), 100).await.unwrap();
        assert_eq!(first[&key.cache_key()].price, 42);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);

        // Second fetch for the same key is served from cache
        let second = c.fetch_prices(std::slice::from_ref(&key), 200).await.unwrap();
        assert_eq!(second[&key.cache_key()].price, 42);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn polls_until_quotes_appear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(PriceCache::open(dir.path().join("p.json")));
        let oracle = FakeOracle::new(vec![
            vec![],
            vec![],
            vec![signed_row("ETHUSD", 50, 7)],
        ]);
        let sleeper = RecordingSleeper::default();
        let c = client(&oracle, &sleeper, cache);

        let got = c
            .fetch_prices(&[PriceKey::new("ETHUSD", 50)], 55)
            .await
            .unwrap();
        assert_eq!(got["ETHUSD-50"].price, 7);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sleeper.slept.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_attempt_budget() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(PriceCache::open(dir.path().join("p.json")));
        let oracle = FakeOracle::new(vec![]); // always empty
        let sleeper = RecordingSleeper::default();
        let c = client(&oracle, &sleeper, cache);

        let got = c
            .fetch_prices(&[PriceKey::new("BTCUSD", 1)], 5)
            .await
            .unwrap();
        assert!(got.is_empty());
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 10);
        assert_eq!(sleeper.slept.lock().unwrap().len(), 9);
    }

    #[tokio::test]
    async fn unsigned_rows_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(PriceCache::open(dir.path().join("p.json")));
        let oracle = FakeOracle::new(vec![vec![
            signed_row("BTCUSD", 10, 99),
            OracleRow {
                pair: "ETHUSD".to_string(),
                timestamp: 10,
                price: Some(5),
                signature: None,
            },
        ]]);
        let sleeper = RecordingSleeper::default();
        let c = client(&oracle, &sleeper, cache.clone());

        let got = c
            .fetch_prices(
                &[PriceKey::new("BTCUSD", 10), PriceKey::new("ETHUSD", 10)],
                10,
            )
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert!(got.contains_key("BTCUSD-10"));
        assert!(cache.get(&PriceKey::new("ETHUSD", 10)).is_none());
    }
}
