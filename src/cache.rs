//! Durable keeper-local stores.
//!
//! Two stores survive across cycles (and restarts):
//! - [`PriceCache`]: `(pair, timestamp)` → signed quote. Timestamp-keyed, so
//!   entries never go stale and no eviction is needed; a signed quote for a
//!   given key does not change once issued.
//! - [`InvalidIdSet`]: work keys rejected on-chain by a prior submission,
//!   excluded from every future batch. Append-only from this crate's point
//!   of view. Keyed by [`WorkKey`] so a rejected queue id can never shadow
//!   an unrelated option id that happens to share the same number.
//!
//! Both are plain JSON files, written through on every mutation via a
//! temp-file rename. Each store is opened once per process and shared
//! behind an `Arc` by every role task; `persist` snapshots the whole map,
//! so a second independent handle on the same file would silently drop the
//! first handle's entries.

use crate::types::{PriceKey, PriceQuote, WorkKey};
use anyhow::{Context, Result};
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating cache dir {}", parent.display()))?;
    }
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp, data).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

/// Persistent `(pair, timestamp)` → [`PriceQuote`] store.
pub struct PriceCache {
    path: PathBuf,
    map: DashMap<String, PriceQuote>,
}

impl PriceCache {
    /// Open the cache at `path`, loading existing contents if present.
    /// A missing or unreadable file starts the cache empty (never fatal).
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let map = DashMap::new();
        match std::fs::read(&path) {
            Ok(data) => match serde_json::from_slice::<HashMap<String, PriceQuote>>(&data) {
                Ok(entries) => {
                    debug!("price cache loaded: {} entries from {}", entries.len(), path.display());
                    for (k, v) in entries {
                        map.insert(k, v);
                    }
                }
                Err(e) => warn!("price cache at {} unreadable, starting empty: {e}", path.display()),
            },
            Err(_) => debug!("no price cache at {}, starting empty", path.display()),
        }
        Self { path, map }
    }

    pub fn get(&self, key: &PriceKey) -> Option<PriceQuote> {
        self.map.get(&key.cache_key()).map(|v| v.value().clone())
    }

    /// Merge freshly fetched quotes and persist. A persist failure is logged
    /// and swallowed: the in-memory cache stays correct for this process.
    pub fn insert_many<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (PriceKey, PriceQuote)>,
    {
        let mut added = 0usize;
        for (key, quote) in entries {
            self.map.insert(key.cache_key(), quote);
            added += 1;
        }
        if added == 0 {
            return;
        }
        if let Err(e) = self.persist() {
            warn!("price cache persist failed: {e:#}");
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn persist(&self) -> Result<()> {
        let snapshot: BTreeMap<String, PriceQuote> = self
            .map
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        write_json_atomic(&self.path, &snapshot)
    }
}

/// Persistent set of work keys the chain has rejected. Stored on disk as
/// the keys' display form (`queue#N` / `option#N@market`).
pub struct InvalidIdSet {
    path: PathBuf,
    set: DashMap<String, ()>,
}

impl InvalidIdSet {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let set = DashMap::new();
        match std::fs::read(&path) {
            Ok(data) => match serde_json::from_slice::<Vec<String>>(&data) {
                Ok(keys) => {
                    debug!("invalid-id set loaded: {} keys from {}", keys.len(), path.display());
                    for key in keys {
                        set.insert(key, ());
                    }
                }
                Err(e) => warn!("invalid-id set at {} unreadable, starting empty: {e}", path.display()),
            },
            Err(_) => debug!("no invalid-id set at {}, starting empty", path.display()),
        }
        Self { path, set }
    }

    pub fn contains(&self, key: &WorkKey) -> bool {
        self.set.contains_key(&key.to_string())
    }

    /// Record keys rejected on-chain. Append-only; never shrinks.
    pub fn extend<I: IntoIterator<Item = WorkKey>>(&self, keys: I) {
        let mut added = 0usize;
        for key in keys {
            if self.set.insert(key.to_string(), ()).is_none() {
                added += 1;
            }
        }
        if added == 0 {
            return;
        }
        if let Err(e) = self.persist() {
            warn!("invalid-id set persist failed: {e:#}");
        }
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    fn persist(&self) -> Result<()> {
        let snapshot: BTreeSet<String> = self.set.iter().map(|e| e.key().clone()).collect();
        write_json_atomic(&self.path, &snapshot)
    }
}
