// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Content-addressed result cache: fingerprint of inputs to the feature-id
//! set a prior backend run produced. Drives the combine-with-previous
//! semantics without re-running spatial predicates.
//!
//! Session-scoped: the cache dies with the engine and is never persisted.
//!

use crate::{fid::FidSet, fingerprint::Fingerprint, layer::LayerRef};
use jiff::Timestamp;
use schnellru::{ByLength, LruMap};
use tracing::debug;

/// One cached spatial-match result.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The matching feature ids.
    pub fids: FidSet,
    /// Target layer the match was computed against.
    pub target: LayerRef,
    /// When the entry was created.
    pub created_at: Timestamp,
    /// Number of times the entry has been served.
    pub hit_count: u64,
}

/// LRU cache of spatial-match fid sets keyed by request fingerprint.
pub struct ResultCache {
    inner: LruMap<Fingerprint, CacheEntry, ByLength>,
    capacity: u32,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("capacity", &self.capacity)
            .field("len", &self.inner.len())
            .finish()
    }
}

impl ResultCache {
    /// Create a cache bounded to `capacity` entries.
    pub fn new(capacity: u32) -> Self {
        Self {
            inner: LruMap::new(ByLength::new(capacity)),
            capacity,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// TRUE when no entries are cached.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Look a fingerprint up, bumping recency and the hit counter.
    pub fn get(&mut self, fp: &Fingerprint) -> Option<&FidSet> {
        match self.inner.get(fp) {
            Some(entry) => {
                entry.hit_count += 1;
                debug!("cache hit {fp} (hits={})", entry.hit_count);
                Some(&entry.fids)
            }
            None => None,
        }
    }

    /// Store a fresh spatial-match result. The LRU policy may evict the
    /// coldest entry to make room.
    pub fn insert(&mut self, fp: Fingerprint, target: LayerRef, fids: FidSet) {
        self.inner.insert(
            fp,
            CacheEntry {
                fids,
                target,
                created_at: Timestamp::now(),
                hit_count: 0,
            },
        );
    }

    /// Drop one entry, e.g. after a [`CacheInconsistency`]
    /// [crate::FilterError::CacheInconsistency] observation.
    pub fn invalidate(&mut self, fp: &Fingerprint) {
        self.inner.remove(fp);
    }

    /// Drop every entry computed against a layer; called when the host
    /// reports the layer as edited or removed.
    pub fn invalidate_layer(&mut self, layer: &LayerRef) {
        let stale: Vec<Fingerprint> = self
            .inner
            .iter()
            .filter(|(_, entry)| entry.target == *layer)
            .map(|(fp, _)| *fp)
            .collect();
        if !stale.is_empty() {
            debug!("invalidating {} cache entries for layer {layer}", stale.len());
        }
        for fp in stale {
            self.inner.remove(&fp);
        }
    }

    /// Drop everything (engine reset / shutdown).
    pub fn clear(&mut self) {
        self.inner = LruMap::new(ByLength::new(self.capacity));
    }
}
