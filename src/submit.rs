//! Settlement transaction submission.
//!
//! One transaction per cycle per operation. Gas is estimated once for the
//! whole batch and padded by 1%; fees are EIP-1559 style with
//! `max_fee = 2 * base_fee + priority_fee` so a batch stays includable
//! through a doubling of the base fee. Individually rejected entries show up
//! as `FailResolve`/`FailUnlock` events on the receipt and are appended to
//! the persistent invalid-id set so they are never submitted again.

use crate::cache::InvalidIdSet;
use crate::contracts::ISettlementRouter;
use crate::types::{OperationKind, SubmitOutcome, WorkKey};
use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, U256};
use alloy::providers::{DynProvider, Provider};
use alloy::rpc::types::{BlockNumberOrTag, TransactionReceipt, TransactionRequest};
use alloy::sol_types::SolCall;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Gas estimate padding: 1%.
fn padded_gas(estimate: u64) -> u64 {
    estimate + estimate / 100
}

/// `max_fee = 2 * base_fee + priority_fee`.
fn max_fee(base_fee: u128, priority_fee: u128) -> u128 {
    base_fee.saturating_mul(2).saturating_add(priority_fee)
}

/// A "nonce too low" rejection means a sibling keeper instance landed the
/// same batch first. Benign.
fn is_nonce_race(message: &str) -> bool {
    message.contains("nonce too low")
}

fn failed_keys(receipt: &TransactionReceipt, operation: OperationKind) -> Vec<WorkKey> {
    let mut keys = Vec::new();
    for log in receipt.inner.logs() {
        match operation {
            OperationKind::OpenTrades | OperationKind::ResolveQueuedTrades => {
                if let Ok(decoded) = log.log_decode::<ISettlementRouter::FailResolve>() {
                    let event = decoded.inner.data;
                    warn!("queue#{} rejected on-chain: {}", event.queueId, event.reason);
                    keys.push(WorkKey::Queue(event.queueId.saturating_to()));
                }
            }
            OperationKind::ExecuteOptions => {
                if let Ok(decoded) = log.log_decode::<ISettlementRouter::FailUnlock>() {
                    let event = decoded.inner.data;
                    warn!(
                        "option#{}@{} rejected on-chain: {}",
                        event.optionId, event.targetContract, event.reason
                    );
                    keys.push(WorkKey::Option {
                        option_id: event.optionId.saturating_to(),
                        market: event.targetContract,
                    });
                }
            }
        }
    }
    keys
}

pub struct BatchSubmitter {
    provider: DynProvider,
    router: Address,
    keeper: Address,
    confirmations: u64,
    gas_limit_ceiling: u64,
    min_balance_wei: u128,
    invalid_ids: Arc<InvalidIdSet>,
}

impl BatchSubmitter {
    pub fn new(
        provider: DynProvider,
        router: Address,
        keeper: Address,
        confirmations: u64,
        gas_limit_ceiling: u64,
        min_balance_wei: u128,
        invalid_ids: Arc<InvalidIdSet>,
    ) -> Self {
        Self {
            provider,
            router,
            keeper,
            confirmations,
            gas_limit_ceiling,
            min_balance_wei,
            invalid_ids,
        }
    }

    pub async fn submit_trades(
        &self,
        operation: OperationKind,
        entries: Vec<ISettlementRouter::TradeEntry>,
    ) -> Result<SubmitOutcome> {
        let calldata = match operation {
            OperationKind::OpenTrades => {
                ISettlementRouter::openTradesCall { params: entries }.abi_encode()
            }
            OperationKind::ResolveQueuedTrades => {
                ISettlementRouter::resolveQueuedTradesCall { params: entries }.abi_encode()
            }
            OperationKind::ExecuteOptions => {
                anyhow::bail!("executeOptions takes ExecuteEntry payloads")
            }
        };
        self.execute(operation, calldata).await
    }

    pub async fn submit_executes(
        &self,
        entries: Vec<ISettlementRouter::ExecuteEntry>,
    ) -> Result<SubmitOutcome> {
        let calldata = ISettlementRouter::executeOptionsCall { params: entries }.abi_encode();
        self.execute(OperationKind::ExecuteOptions, calldata).await
    }

    /// Current EIP-1559 fee fields, derived from the latest block.
    async fn fees(&self) -> Result<(u128, u128)> {
        let priority_fee = self
            .provider
            .get_max_priority_fee_per_gas()
            .await
            .context("fetching priority fee")?;
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Latest)
            .await
            .context("fetching latest block")?
            .context("no latest block")?;
        let base_fee = block.header.base_fee_per_gas.unwrap_or_default() as u128;
        Ok((max_fee(base_fee, priority_fee), priority_fee))
    }

    async fn execute(&self, operation: OperationKind, calldata: Vec<u8>) -> Result<SubmitOutcome> {
        let (max_fee, priority_fee) = self.fees().await?;
        let tx = TransactionRequest::default()
            .with_from(self.keeper)
            .with_to(self.router)
            .with_input(Bytes::from(calldata))
            .with_max_fee_per_gas(max_fee)
            .with_max_priority_fee_per_gas(priority_fee);

        // Estimate once per batch; a revert here means the whole batch is
        // unsubmittable and the cycle moves on.
        let estimate = self
            .provider
            .estimate_gas(tx.clone())
            .await
            .with_context(|| format!("estimating gas for {operation}"))?;
        let gas = padded_gas(estimate);
        if gas > self.gas_limit_ceiling {
            return Ok(SubmitOutcome::Failed(format!(
                "{operation}: gas {gas} exceeds ceiling {}",
                self.gas_limit_ceiling
            )));
        }
        info!("{operation}: submitting at {gas} gas units");

        let pending = match self.provider.send_transaction(tx.with_gas_limit(gas)).await {
            Ok(pending) => pending,
            Err(e) => {
                let message = e.to_string();
                if is_nonce_race(&message) {
                    info!("{operation}: {message}");
                    return Ok(SubmitOutcome::NonceRace);
                }
                error!("{operation}: send failed: {message}");
                return Ok(SubmitOutcome::Failed(message));
            }
        };
        let receipt = pending
            .with_required_confirmations(self.confirmations)
            .get_receipt()
            .await
            .with_context(|| format!("awaiting receipt for {operation}"))?;

        let failed = failed_keys(&receipt, operation);
        if !failed.is_empty() {
            self.invalid_ids.extend(failed.iter().copied());
        }
        if !receipt.status() {
            warn!(
                "{operation}: transaction {} reverted",
                receipt.transaction_hash
            );
        }
        self.check_wallet().await;
        Ok(SubmitOutcome::Confirmed {
            tx_hash: receipt.transaction_hash,
            failed,
        })
    }

    /// Low-balance alert after each submission, mirroring the fee drain.
    async fn check_wallet(&self) {
        match self.provider.get_balance(self.keeper).await {
            Ok(balance) => {
                if balance < U256::from(self.min_balance_wei) {
                    error!(
                        "keeper {} balance {balance} below minimum {}",
                        self.keeper, self.min_balance_wei
                    );
                }
            }
            Err(e) => warn!("balance check failed: {e:#}"),
        }
    }
}
