//! Options Settlement Keeper Library
//!
//! Components for keeping an on-chain options protocol settled: queued-trade
//! opening, limit-order execution, expired-option unlocking, and the
//! record-store synchronization around them.

pub mod cache;
pub mod chain;
pub mod config;
pub mod contracts;
pub mod filters;
pub mod keeper;
pub mod oracle;
pub mod retry;
pub mod source;
pub mod submit;
pub mod types;

// Re-export commonly used types
pub use cache::{InvalidIdSet, PriceCache};
pub use config::{load_config, KeeperConfig};
pub use keeper::{build_context, open_stores, run_role, KeeperContext, KeeperStores, Role};
pub use types::{
    Batch, OperationKind, PendingTrade, PriceKey, PriceQuote, SubmitOutcome, WorkItem, WorkKey,
    MAX_BATCH_SIZE, OPEN_WINDOW_SECS,
};
