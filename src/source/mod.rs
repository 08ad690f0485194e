//! Trade source adapters.
//!
//! Work items come from two feeds: the application REST API (pending trades,
//! active-market records, settlement fees, record-store write-backs) and the
//! index service (options to expire, settled options). Both adapters share
//! the same failure policy: a read that fails is logged and yields an empty
//! result, so one flaky upstream never kills a cycle. Write-backs log the
//! failure and move on; the records are reconciled on a later cycle.

mod graph;
mod rest;

pub use graph::GraphClient;
pub use rest::{RestClient, UnlockRecord};

use serde::{Deserialize, Deserializer};

/// The index service and some REST fields serialize integers as JSON
/// strings. Accept both forms.
pub(crate) fn u64_lenient<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }
    match Raw::deserialize(d)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Like [`u64_lenient`] but for u128 fields, and treating JSON `null` as
/// zero (the index service reports no payout for expired-worthless options).
pub(crate) fn u128_lenient_or_zero<'de, D: Deserializer<'de>>(d: D) -> Result<u128, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u128),
        Str(String),
        Null,
    }
    match Option::<Raw>::deserialize(d)? {
        Some(Raw::Num(n)) => Ok(n),
        Some(Raw::Str(s)) => s.parse().map_err(serde::de::Error::custom),
        Some(Raw::Null) | None => Ok(0),
    }
}
