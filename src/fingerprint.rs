// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Deterministic fingerprints over filter-request inputs, keying the result
//! cache and naming backend artifacts.
//!
//! The hashed byte string is exact after canonicalisation: coordinates at
//! fixed WKT precision, the buffer value rounded to 4 decimals, predicates
//! sorted by canonical name, and booleans serialised as single letters. Two
//! requests differing only in parameter ordering hash identically.
//!

use crate::{layer::LayerDescriptor, predicate::{Predicate, normalise}};
use core::fmt;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

/// Identity of a target layer inside a fingerprint: the provider URI hash
/// plus the geometry column and SRID, so renaming a host layer does not
/// shift the cache while repointing it at other data does.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetKey {
    /// xxh3 of the provider URI.
    pub uri_hash: u64,
    /// Geometry column name.
    pub geometry_column: String,
    /// Declared SRID.
    pub srid: i32,
}

impl TargetKey {
    /// Build the key for a layer.
    pub fn for_layer(layer: &LayerDescriptor) -> Self {
        Self {
            uri_hash: xxh3_64(layer.provider_uri.as_bytes()),
            geometry_column: layer.geometry_column.clone(),
            srid: layer.srid,
        }
    }
}

/// A deterministic hash of filter inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(u64);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl Fingerprint {
    /// Compute the fingerprint of one (source probe, target layer) pairing.
    pub fn compute(
        canonical_wkt: &str,
        buffer: f64,
        predicates: &[Predicate],
        target: &TargetKey,
        use_source_centroid: bool,
        use_target_centroid: bool,
    ) -> Self {
        let names: Vec<&str> = normalise(predicates)
            .iter()
            .map(|p| p.canonical_name())
            .collect();
        let canonical = format!(
            "{wkt}|{buffer:.4}|{preds}|{uri:016x}|{col}|{srid}|{sc}{tc}",
            wkt = canonical_wkt,
            buffer = buffer,
            preds = names.join(","),
            uri = target.uri_hash,
            col = target.geometry_column,
            srid = target.srid,
            sc = if use_source_centroid { 'T' } else { 'F' },
            tc = if use_target_centroid { 'T' } else { 'F' },
        );
        Self(xxh3_64(canonical.as_bytes()))
    }

    /// Short hex form used inside backend artifact names
    /// (`fm_src_{session}_{short}`).
    pub fn short(&self) -> String {
        format!("{:08x}", self.0 >> 32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> TargetKey {
        TargetKey {
            uri_hash: 0xfeed_beef,
            geometry_column: "geom".into(),
            srid: 3857,
        }
    }

    #[test]
    fn test_predicate_order_is_canonicalised() {
        let a = Fingerprint::compute(
            "POINT (1 2)",
            500.0,
            &[Predicate::Within, Predicate::Intersects],
            &key(),
            false,
            false,
        );
        let b = Fingerprint::compute(
            "POINT (1 2)",
            500.0,
            &[Predicate::Intersects, Predicate::Within],
            &key(),
            false,
            false,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_buffer_rounded_to_4_decimals() {
        let a = Fingerprint::compute("POINT (1 2)", 500.00001, &[Predicate::Intersects], &key(), false, false);
        let b = Fingerprint::compute("POINT (1 2)", 500.00004, &[Predicate::Intersects], &key(), false, false);
        let c = Fingerprint::compute("POINT (1 2)", 500.1, &[Predicate::Intersects], &key(), false, false);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_inputs_discriminate() {
        let base = Fingerprint::compute("POINT (1 2)", 0.0, &[Predicate::Intersects], &key(), false, false);
        let wkt = Fingerprint::compute("POINT (1 3)", 0.0, &[Predicate::Intersects], &key(), false, false);
        let flag = Fingerprint::compute("POINT (1 2)", 0.0, &[Predicate::Intersects], &key(), true, false);
        let mut other = key();
        other.srid = 4326;
        let tgt = Fingerprint::compute("POINT (1 2)", 0.0, &[Predicate::Intersects], &other, false, false);
        assert_ne!(base, wkt);
        assert_ne!(base, flag);
        assert_ne!(base, tgt);
    }

    #[test]
    fn test_short_is_8_hex_chars() {
        let fp = Fingerprint::compute("POINT (0 0)", 0.0, &[Predicate::Intersects], &key(), false, false);
        assert_eq!(fp.short().len(), 8);
        assert!(fp.short().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
