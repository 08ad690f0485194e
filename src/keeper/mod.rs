//! Cycle orchestration.
//!
//! Two independent loops share this module: the open role drains queued
//! trades (`openTrades`, plus `resolveQueuedTrades` for entries stuck in the
//! record store) and the close role settles expired options
//! (`executeOptions`) and syncs outcomes back upstream. Each loop is
//! unbounded; a cycle error is classified, logged, and answered with a
//! longer sleep, never a crash.

use crate::cache::{InvalidIdSet, PriceCache};
use crate::chain::{ChainReader, ReadCall, ReadResult};
use crate::config::KeeperConfig;
use crate::filters;
use crate::oracle::{HttpOracleApi, OracleClient};
use crate::retry::{RetryPolicy, TokioSleeper};
use crate::source::{GraphClient, RestClient, UnlockRecord};
use crate::submit::BatchSubmitter;
use crate::types::{
    ExpiredOption, OperationKind, PendingTrade, SubmitOutcome, WorkItem, MAX_BATCH_SIZE,
};
use alloy::network::EthereumWallet;
use alloy::primitives::Address;
use alloy::providers::{Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Which settlement duties a loop instance carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Open,
    Close,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Open => write!(f, "open"),
            Role::Close => write!(f, "close"),
        }
    }
}

/// Where a loop currently is; logged on transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Fetching,
    Validating,
    Submitting,
    Sleeping,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopState::Idle => "idle",
            LoopState::Fetching => "fetching",
            LoopState::Validating => "validating",
            LoopState::Submitting => "submitting",
            LoopState::Sleeping => "sleeping",
        };
        write!(f, "{s}")
    }
}

/// Per-loop state tracker.
pub struct LoopTracker {
    role: Role,
    state: LoopState,
}

impl LoopTracker {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: LoopState::Idle,
        }
    }

    fn enter(&mut self, state: LoopState) {
        if state != self.state {
            debug!("{} loop: {} -> {state}", self.role, self.state);
            self.state = state;
        }
    }
}

/// A failed cycle, classified by upstream error text. Transient variants
/// are expected operational noise; only `Other` suggests a real defect.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    /// HTTP 429 from the node or an upstream API.
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// The node has not caught up to the block we asked about.
    #[error("node lagging: {0}")]
    NodeLagging(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CycleError {
    pub fn classify(err: anyhow::Error) -> Self {
        let message = format!("{err:#}");
        if message.contains("429") || message.contains("Too Many Requests") {
            CycleError::RateLimited(message)
        } else if message.contains("unsupported block number") {
            CycleError::NodeLagging(message)
        } else {
            CycleError::Other(err)
        }
    }

    pub fn is_transient(&self) -> bool {
        !matches!(self, CycleError::Other(_))
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Everything a cycle needs, built once per role. No ambient globals.
pub struct KeeperContext {
    pub role: Role,
    pub config: KeeperConfig,
    pub chain: ChainReader,
    pub rest: RestClient,
    pub graph: GraphClient,
    pub oracle: OracleClient<HttpOracleApi, TokioSleeper>,
    pub submitter: BatchSubmitter,
    pub invalid_ids: Arc<InvalidIdSet>,
}

/// Durable stores shared by every role task in the process.
///
/// Opened exactly once: persisting snapshots the whole map to disk, so a
/// second independent handle on the same files would erase whatever the
/// first handle had recorded.
#[derive(Clone)]
pub struct KeeperStores {
    pub price_cache: Arc<PriceCache>,
    pub invalid_ids: Arc<InvalidIdSet>,
}

pub fn open_stores(config: &KeeperConfig) -> KeeperStores {
    let cache_dir = std::path::Path::new(&config.cache_dir);
    KeeperStores {
        price_cache: Arc::new(PriceCache::open(cache_dir.join("prices.json"))),
        invalid_ids: Arc::new(InvalidIdSet::open(cache_dir.join("invalid_ids.json"))),
    }
}

/// Wire up signer, provider, and adapters for one role, on top of the
/// process-wide stores.
pub async fn build_context(
    config: KeeperConfig,
    role: Role,
    stores: KeeperStores,
) -> Result<KeeperContext> {
    let pk = match role {
        Role::Open => &config.open_keeper_pk,
        Role::Close => &config.close_keeper_pk,
    };
    let signer: PrivateKeySigner = pk.parse().context("parsing keeper private key")?;
    let signer = signer.with_chain_id(Some(config.chain_id));
    let keeper = signer.address();
    info!(
        "{role} keeper account: {keeper} (router {}, gas hint {} gwei)",
        config.deployment.router, config.deployment.gas_price_hint_gwei
    );

    let url: reqwest::Url = config.rpc_url.parse().context("parsing RPC_URL")?;
    let provider = ProviderBuilder::new()
        .wallet(EthereumWallet::from(signer.clone()))
        .connect_http(url)
        .erased();

    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .context("building HTTP client")?;

    let KeeperStores {
        price_cache,
        invalid_ids,
    } = stores;

    let chain = ChainReader::new(
        provider.clone(),
        config.deployment.router,
        config.deployment.multicall,
    );
    let rest = RestClient::new(http.clone(), config.base_url.clone(), config.chain_id, &signer)
        .await?;
    let graph = GraphClient::new(http.clone(), config.deployment.graph_endpoint);
    let oracle = OracleClient::new(
        HttpOracleApi::new(http, config.oracle_url.clone()),
        TokioSleeper,
        RetryPolicy::oracle_default(),
        price_cache,
    );
    let submitter = BatchSubmitter::new(
        provider,
        config.deployment.router,
        keeper,
        config.confirmations,
        config.deployment.gas_limit_ceiling,
        config.min_balance_wei,
        invalid_ids.clone(),
    );

    Ok(KeeperContext {
        role,
        config,
        chain,
        rest,
        graph,
        oracle,
        submitter,
        invalid_ids,
    })
}

/// One open-role pass: pending trades -> liveness -> prices -> filter ->
/// `openTrades`, then record-store updates for accepted and lapsed entries.
pub async fn open_cycle(ctx: &KeeperContext, tracker: &mut LoopTracker) -> Result<()> {
    let now = unix_now();
    tracker.enter(LoopState::Fetching);
    let mut pending: Vec<PendingTrade> = ctx
        .rest
        .fetch_pending()
        .await
        .into_iter()
        .filter_map(WorkItem::into_pending)
        .collect();
    if pending.is_empty() {
        return Ok(());
    }
    pending.truncate(MAX_BATCH_SIZE);

    // Drop entries whose queue slot is already consumed on-chain
    let reads: Vec<ReadCall> = pending
        .iter()
        .map(|t| ReadCall::QueuedTrade { queue_id: t.queue_id })
        .collect();
    let slots = ctx.chain.read_batch(&reads).await?;
    let pending: Vec<PendingTrade> = pending
        .into_iter()
        .zip(slots)
        .filter_map(|(trade, slot)| match slot {
            ReadResult::QueuedTrade { taker, .. } if taker == Address::ZERO => Some(trade),
            _ => None,
        })
        .collect();
    if pending.is_empty() {
        return Ok(());
    }

    let markets: Vec<Address> = pending.iter().map(|t| t.target_contract).collect();
    let pairs = ctx.chain.asset_pairs(&markets).await?;
    let keys = filters::price_requests_for_trades(&pending, &pairs, now);
    let prices = ctx.oracle.fetch_prices(&keys, now).await?;

    tracker.enter(LoopState::Validating);
    let fees = if pending.iter().any(|t| t.is_limit_order) {
        ctx.rest.settlement_fees().await
    } else {
        HashMap::new()
    };
    let plan = filters::build_open_plan(&pending, &pairs, &prices, &fees, &ctx.invalid_ids, now);

    if !plan.batch.is_empty() {
        tracker.enter(LoopState::Submitting);
        info!("openTrades: {} entries eligible", plan.batch.len());
        let outcome = ctx
            .submitter
            .submit_trades(OperationKind::OpenTrades, plan.batch.into_entries())
            .await?;
        if let SubmitOutcome::Confirmed { tx_hash, .. } = &outcome {
            info!("openTrades confirmed in {tx_hash}");
            ctx.rest.update_after_open(&plan.accepted).await;
        }
    }
    if !plan.expired.is_empty() {
        info!("cancelling {} lapsed queue entries", plan.expired.len());
        ctx.rest.cancel_trades(&plan.expired).await;
    }
    Ok(())
}

/// Drain record-store entries stuck in `QUEUED` through
/// `resolveQueuedTrades`. No window or strike gating here; these already
/// missed their window once and settle at their original queue price.
pub async fn resolve_cycle(ctx: &KeeperContext, tracker: &mut LoopTracker) -> Result<()> {
    let now = unix_now();
    tracker.enter(LoopState::Fetching);
    let mut trades: Vec<PendingTrade> = ctx
        .rest
        .fetch_resolvable()
        .await
        .into_iter()
        .filter_map(WorkItem::into_pending)
        .collect();
    if trades.is_empty() {
        return Ok(());
    }
    trades.truncate(MAX_BATCH_SIZE);

    let markets: Vec<Address> = trades.iter().map(|t| t.target_contract).collect();
    let pairs = ctx.chain.asset_pairs(&markets).await?;
    let keys = filters::price_requests_for_trades(&trades, &pairs, now);
    let prices = ctx.oracle.fetch_prices(&keys, now).await?;

    tracker.enter(LoopState::Validating);
    let batch = filters::build_resolve_batch(&trades, &pairs, &prices, &ctx.invalid_ids);
    if batch.is_empty() {
        return Ok(());
    }
    tracker.enter(LoopState::Submitting);
    info!("resolveQueuedTrades: {} entries", batch.len());
    ctx.submitter
        .submit_trades(OperationKind::ResolveQueuedTrades, batch.into_entries())
        .await?;
    Ok(())
}

/// One close-role pass: expired options -> liveness joins -> expiry prices
/// -> `executeOptions`, then the settled-outcome sync.
pub async fn close_cycle(ctx: &KeeperContext, tracker: &mut LoopTracker) -> Result<()> {
    let now = unix_now();
    tracker.enter(LoopState::Fetching);
    let mut options: Vec<ExpiredOption> = ctx
        .graph
        .fetch_expiring(now)
        .await
        .into_iter()
        .filter_map(WorkItem::into_expired)
        .collect();
    options.truncate(MAX_BATCH_SIZE);

    if !options.is_empty() {
        let mut reads = Vec::with_capacity(options.len() * 2);
        for option in &options {
            reads.push(ReadCall::OptionState {
                market: option.market,
                option_id: option.option_id,
            });
            reads.push(ReadCall::QueueIdForOption {
                market: option.market,
                option_id: option.option_id,
            });
        }
        let results = ctx.chain.read_batch(&reads).await?;
        let mut states = Vec::with_capacity(options.len());
        let mut queue_ids = Vec::with_capacity(options.len());
        for pair in results.chunks(2) {
            states.push(match &pair[0] {
                ReadResult::OptionState(info) => Some(info.clone()),
                _ => None,
            });
            queue_ids.push(match pair.get(1) {
                Some(ReadResult::QueueId(id)) => Some(*id),
                _ => None,
            });
        }

        let market_records = ctx.rest.active_markets().await;
        tracker.enter(LoopState::Validating);
        let candidates = filters::execute_candidates(
            &options,
            &states,
            &queue_ids,
            &market_records,
            &ctx.invalid_ids,
        );
        if !candidates.is_empty() {
            let markets: Vec<Address> = candidates.iter().map(|c| c.option.market).collect();
            let pairs = ctx.chain.asset_pairs(&markets).await?;
            let keys = filters::price_requests_for_executes(&candidates, &pairs);
            let prices = ctx.oracle.fetch_prices(&keys, now).await?;
            let batch = filters::build_execute_batch(&candidates, &pairs, &prices);
            if !batch.is_empty() {
                tracker.enter(LoopState::Submitting);
                info!("executeOptions: {} entries eligible", batch.len());
                let outcome = ctx.submitter.submit_executes(batch.into_entries()).await?;
                if let SubmitOutcome::Confirmed { tx_hash, failed } = outcome {
                    info!(
                        "executeOptions confirmed in {tx_hash} ({} rejected)",
                        failed.len()
                    );
                }
            }
        }
    }

    sync_settled(ctx).await
}

/// Push settled-option outcomes (payout, expiry price, close time) back to
/// the record store, joined through the router's option-id mapping.
async fn sync_settled(ctx: &KeeperContext) -> Result<()> {
    let markets = ctx.rest.active_markets().await;
    let Some(min_ts) = markets.values().map(|m| m.queued_timestamp).min() else {
        return Ok(());
    };
    let settled = ctx.graph.settled_options(min_ts).await;
    if settled.is_empty() {
        return Ok(());
    }
    let reads: Vec<ReadCall> = settled
        .iter()
        .map(|s| ReadCall::QueueIdForOption {
            market: s.market,
            option_id: s.option_id,
        })
        .collect();
    let results = ctx.chain.read_batch(&reads).await?;
    let records: Vec<UnlockRecord> = settled
        .iter()
        .zip(results)
        .filter_map(|(option, result)| {
            let ReadResult::QueueId(queue_id) = result else {
                return None;
            };
            markets.contains_key(&queue_id).then(|| UnlockRecord {
                queue_id,
                payout: option.payout,
                expiry_price: option.expiration_price,
                close_time: option.close_time,
            })
        })
        .collect();
    ctx.rest.update_after_unlock(&records).await;
    Ok(())
}

/// Run a role's loop forever. Errors classify into a longer sleep; the loop
/// itself never exits.
pub async fn run_role(ctx: KeeperContext) {
    let mut tracker = LoopTracker::new(ctx.role);
    info!(
        "{} keeper loop starting (cycle {:?}, error wait {:?})",
        ctx.role, ctx.config.cycle_delay, ctx.config.error_wait
    );
    loop {
        let result = match ctx.role {
            Role::Open => {
                let r = open_cycle(&ctx, &mut tracker).await;
                match r {
                    Ok(()) => resolve_cycle(&ctx, &mut tracker).await,
                    Err(e) => Err(e),
                }
            }
            Role::Close => close_cycle(&ctx, &mut tracker).await,
        };
        let wait = match result {
            Ok(()) => ctx.config.cycle_delay,
            Err(e) => {
                let classified = CycleError::classify(e);
                if classified.is_transient() {
                    warn!("{} cycle: {classified}", ctx.role);
                } else {
                    error!("{} cycle failed: {classified:#}", ctx.role);
                }
                ctx.config.error_wait
            }
        };
        tracker.enter(LoopState::Sleeping);
        tokio::time::sleep(wait).await;
        tracker.enter(LoopState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_by_message() {
        let rate = CycleError::classify(anyhow::anyhow!("server returned 429 Too Many Requests"));
        assert!(matches!(rate, CycleError::RateLimited(_)));
        assert!(rate.is_transient());

        let lag = CycleError::classify(
            anyhow::anyhow!("rpc error").context("unsupported block number 123"),
        );
        assert!(matches!(lag, CycleError::NodeLagging(_)));

        let other = CycleError::classify(anyhow::anyhow!("connection reset by peer"));
        assert!(matches!(other, CycleError::Other(_)));
        assert!(!other.is_transient());
    }

    #[test]
    fn tracker_only_logs_transitions() {
        let mut tracker = LoopTracker::new(Role::Open);
        assert_eq!(tracker.state, LoopState::Idle);
        tracker.enter(LoopState::Fetching);
        tracker.enter(LoopState::Fetching);
        assert_eq!(tracker.state, LoopState::Fetching);
    }

    #[test]
    fn role_and_state_display() {
        assert_eq!(Role::Close.to_string(), "close");
        assert_eq!(LoopState::Submitting.to_string(), "submitting");
    }

    // Both role contexts must hold the same store handles: persisting is a
    // whole-file snapshot, so separate handles would overwrite each other's
    // rejected ids.
    #[tokio::test]
    async fn role_contexts_share_one_store_pair() {
        let dir = tempfile::tempdir().unwrap();
        let config = KeeperConfig {
            environment: "arb-sandbox".to_string(),
            rpc_url: "http://localhost:8545".to_string(),
            chain_id: 421_614,
            open_keeper_pk: "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
                .to_string(),
            close_keeper_pk: "59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d"
                .to_string(),
            base_url: "http://localhost:9000".to_string(),
            oracle_url: "http://localhost:9001".to_string(),
            confirmations: 1,
            cycle_delay: std::time::Duration::from_secs(5),
            error_wait: std::time::Duration::from_secs(30),
            min_balance_wei: 0,
            cache_dir: dir.path().to_string_lossy().into_owned(),
            deployment: crate::config::Deployment::for_environment("arb-sandbox").unwrap(),
        };
        let stores = open_stores(&config);
        let open = build_context(config.clone(), Role::Open, stores.clone())
            .await
            .unwrap();
        let close = build_context(config, Role::Close, stores.clone())
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&open.invalid_ids, &stores.invalid_ids));
        assert!(Arc::ptr_eq(&open.invalid_ids, &close.invalid_ids));
    }
}
