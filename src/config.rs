//! Configuration management.
//!
//! Runtime settings come from the environment (`.env` files supported via
//! `dotenv`); per-deployment contract addresses and endpoints are static
//! tables selected by an environment identifier string such as
//! `arb-mainnet` or `polygon-testnet`.

use alloy::primitives::{address, Address};
use anyhow::{bail, Context, Result};
use std::time::Duration;

/// Static per-deployment constants.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub environment: &'static str,
    pub router: Address,
    pub multicall: Address,
    pub graph_endpoint: &'static str,
    /// Gas price hint in gwei, logged at startup for operators; actual fees
    /// are derived from the live base fee at submission time.
    pub gas_price_hint_gwei: f64,
    /// Hard per-transaction gas ceiling; estimates above this abort the batch.
    pub gas_limit_ceiling: u64,
}

const DEPLOYMENTS: &[Deployment] = &[
    Deployment {
        environment: "arb-sandbox",
        router: address!("2Acf434D53B6427d450Ae44563820f9714B5d776"),
        multicall: address!("20f171c51A9B707D1A6daAb809e2729308406f99"),
        graph_endpoint: "https://api.thegraph.com/subgraphs/name/keeper/options-arbitrum-testnet",
        gas_price_hint_gwei: 0.1,
        gas_limit_ceiling: 10_000_000,
    },
    Deployment {
        environment: "arb-testnet",
        router: address!("2Acf434D53B6427d450Ae44563820f9714B5d776"),
        multicall: address!("20f171c51A9B707D1A6daAb809e2729308406f99"),
        graph_endpoint: "https://api.thegraph.com/subgraphs/name/keeper/options-arbitrum-testnet",
        gas_price_hint_gwei: 0.1,
        gas_limit_ceiling: 10_000_000,
    },
    Deployment {
        environment: "arb-mainnet",
        router: address!("0e0A1241C9cE6649d5D30134a194BA3E24130305"),
        multicall: address!("842eC2c7D803033Edf55E478F461FC547Bc54EB2"),
        graph_endpoint: "https://api.thegraph.com/subgraphs/name/keeper/options-arbitrum-mainnet",
        gas_price_hint_gwei: 0.1,
        gas_limit_ceiling: 15_000_000,
    },
    Deployment {
        environment: "polygon-testnet",
        router: address!("3E8d70286567bf962261a81Da5DBDe6cBbc444C4"),
        multicall: address!("F6b05f349E64CB2202a6C7D53daaDccC48f82C25"),
        graph_endpoint: "https://api.thegraph.com/subgraphs/name/keeper/options-polygon-testnet",
        gas_price_hint_gwei: 0.1,
        gas_limit_ceiling: 5_000_000,
    },
    Deployment {
        environment: "polygon-mainnet",
        router: address!("BBac5088Ea7E70f21C28058A434Afa64FDf401c7"),
        multicall: address!("c8E51042792d7405184DfCa245F2d27B94D013b6"),
        graph_endpoint: "https://api.thegraph.com/subgraphs/name/keeper/options-polygon-mainnet",
        gas_price_hint_gwei: 200.0,
        gas_limit_ceiling: 5_000_000,
    },
];

impl Deployment {
    pub fn for_environment(environment: &str) -> Result<&'static Deployment> {
        DEPLOYMENTS
            .iter()
            .find(|d| d.environment == environment)
            .with_context(|| format!("unknown environment '{environment}'"))
    }
}

/// Process-wide keeper configuration, constructed once and passed to every
/// component (never read from ambient globals after startup).
#[derive(Debug, Clone)]
pub struct KeeperConfig {
    pub environment: String,
    pub rpc_url: String,
    pub chain_id: u64,

    /// Signing keys for the two bot roles.
    pub open_keeper_pk: String,
    pub close_keeper_pk: String,

    /// Application REST API base URL.
    pub base_url: String,
    /// Oracle price endpoint base URL.
    pub oracle_url: String,

    /// Confirmations to await per submission.
    pub confirmations: u64,
    /// Fixed inter-cycle delay.
    pub cycle_delay: Duration,
    /// Extended wait after a classified/unclassified cycle error.
    pub error_wait: Duration,

    /// Keeper wallet low-balance warning threshold, in wei.
    pub min_balance_wei: u128,
    /// Directory for the persistent price cache and invalid-id set.
    pub cache_dir: String,

    pub deployment: &'static Deployment,
}

pub fn load_config(environment: &str) -> Result<KeeperConfig> {
    dotenv::dotenv().ok();

    let deployment = Deployment::for_environment(environment)?;

    let min_balance_eth: f64 = std::env::var("MIN_BALANCE")
        .unwrap_or_else(|_| "0.1".to_string())
        .parse()
        .context("MIN_BALANCE must be a number (ether)")?;
    if min_balance_eth < 0.0 {
        bail!("MIN_BALANCE must be non-negative");
    }

    Ok(KeeperConfig {
        environment: environment.to_string(),
        rpc_url: std::env::var("RPC_URL").context("RPC_URL not set")?,
        chain_id: std::env::var("CHAIN_ID")
            .context("CHAIN_ID not set")?
            .parse()
            .context("CHAIN_ID must be an integer")?,
        open_keeper_pk: std::env::var("OPEN_KEEPER_ACCOUNT_PK")
            .context("OPEN_KEEPER_ACCOUNT_PK not set")?,
        close_keeper_pk: std::env::var("CLOSE_KEEPER_ACCOUNT_PK")
            .context("CLOSE_KEEPER_ACCOUNT_PK not set")?,
        base_url: std::env::var("BASE_URL").context("BASE_URL not set")?,
        oracle_url: std::env::var("ORACLE_URL").context("ORACLE_URL not set")?,
        confirmations: std::env::var("CONFS")
            .unwrap_or_else(|_| "1".to_string())
            .parse()
            .context("CONFS must be an integer")?,
        cycle_delay: Duration::from_secs(
            std::env::var("DELAY")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("DELAY must be seconds")?,
        ),
        error_wait: Duration::from_secs(
            std::env::var("WAIT_TIME")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("WAIT_TIME must be seconds")?,
        ),
        min_balance_wei: (min_balance_eth * 1e18) as u128,
        cache_dir: std::env::var("CACHE_DIR").unwrap_or_else(|_| "cache".to_string()),
        deployment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_environments_resolve() {
        for env in [
            "arb-sandbox",
            "arb-testnet",
            "arb-mainnet",
            "polygon-testnet",
            "polygon-mainnet",
        ] {
            let d = Deployment::for_environment(env).unwrap();
            assert_eq!(d.environment, env);
            assert!(d.gas_limit_ceiling > 0);
        }
    }

    #[test]
    fn unknown_environment_is_an_error() {
        assert!(Deployment::for_environment("base-mainnet").is_err());
    }
}
