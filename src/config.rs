// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Configuration parameters affecting the behaviour of this library.
//!
//! Options are read once at initialisation and handed to [`Core`]
//! [crate::Core] as a plain value; nothing here is a process-wide singleton.
//! Every option can be overridden from the environment (`GEOSIEVE_*`
//! variables, also honouring a `.env` file via `dotenvy`).
//!

use dotenvy::var;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Style used for buffer end caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferEndcap {
    /// Rounded caps (default).
    Round,
    /// Flat caps ending at the line ends.
    Flat,
    /// Square caps extending past the line ends.
    Square,
}

/// Interior-point selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CentroidMode {
    /// Point guaranteed to lie on the geometry (default).
    PointOnSurface,
    /// Geometric centroid; may fall outside non-convex polygons.
    Centroid,
    /// Point-on-surface for areal geometries, centroid otherwise.
    Auto,
}

/// Reprojection policy for geographic source geometries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrsPolicy {
    /// Reproject geographic geometries to a metric CRS when buffering (default).
    Auto,
    /// Always reproject to the metric CRS.
    ForceMetric,
    /// Never reproject.
    AsIs,
}

/// The recognised configuration options, with their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// `backend.postgresql.enabled`: if FALSE, the PostgreSQL backend is
    /// skipped even when available.
    pub postgresql_enabled: bool,
    /// `backend.postgresql.materialised_view_schema`: schema hosting
    /// session-scoped materialised views.
    pub materialised_view_schema: String,
    /// `cache.capacity`: maximum entries in the result cache.
    pub cache_capacity: u32,
    /// `history.capacity`: maximum entries per history stack.
    pub history_capacity: u32,
    /// `geometry.buffer_endcap`: buffer end-cap style.
    pub buffer_endcap: BufferEndcap,
    /// `geometry.centroid_mode`: interior-point selection.
    pub centroid_mode: CentroidMode,
    /// `geometry.simplify_before_buffer`: adaptive simplification toggle.
    pub simplify_before_buffer: bool,
    /// `crs.policy`: reprojection policy.
    pub crs_policy: CrsPolicy,
    /// `execution.concurrency`: maximum overlapping backend tasks.
    pub concurrency: u32,
    /// `execution.progress_every_n_features`: OGR progress granularity.
    pub progress_every_n_features: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            postgresql_enabled: true,
            materialised_view_schema: "public".to_owned(),
            cache_capacity: 128,
            history_capacity: 100,
            buffer_endcap: BufferEndcap::Round,
            centroid_mode: CentroidMode::PointOnSurface,
            simplify_before_buffer: true,
            crs_policy: CrsPolicy::Auto,
            concurrency: 1,
            progress_every_n_features: 1000,
        }
    }
}

impl Config {
    /// Build a configuration from the defaults, then apply any `GEOSIEVE_*`
    /// environment overrides. Unparseable values are warned about and
    /// ignored.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(x) = var("GEOSIEVE_PG_ENABLED") {
            match x.parse::<bool>() {
                Ok(b) => cfg.postgresql_enabled = b,
                Err(_) => warn!("Ignoring non-boolean GEOSIEVE_PG_ENABLED={x}"),
            }
        }
        if let Ok(x) = var("GEOSIEVE_MV_SCHEMA") {
            cfg.materialised_view_schema = x;
        }
        if let Ok(x) = var("GEOSIEVE_CACHE_CAPACITY") {
            match x.parse::<u32>() {
                Ok(n) => cfg.cache_capacity = n,
                Err(_) => warn!("Ignoring non-numeric GEOSIEVE_CACHE_CAPACITY={x}"),
            }
        }
        if let Ok(x) = var("GEOSIEVE_HISTORY_CAPACITY") {
            match x.parse::<u32>() {
                Ok(n) => cfg.history_capacity = n,
                Err(_) => warn!("Ignoring non-numeric GEOSIEVE_HISTORY_CAPACITY={x}"),
            }
        }
        if let Ok(x) = var("GEOSIEVE_BUFFER_ENDCAP") {
            cfg.buffer_endcap = match x.to_ascii_lowercase().as_str() {
                "round" => BufferEndcap::Round,
                "flat" => BufferEndcap::Flat,
                "square" => BufferEndcap::Square,
                _ => {
                    warn!("Ignoring unknown GEOSIEVE_BUFFER_ENDCAP={x}");
                    cfg.buffer_endcap
                }
            };
        }
        if let Ok(x) = var("GEOSIEVE_CENTROID_MODE") {
            cfg.centroid_mode = match x.to_ascii_lowercase().as_str() {
                "point_on_surface" => CentroidMode::PointOnSurface,
                "centroid" => CentroidMode::Centroid,
                "auto" => CentroidMode::Auto,
                _ => {
                    warn!("Ignoring unknown GEOSIEVE_CENTROID_MODE={x}");
                    cfg.centroid_mode
                }
            };
        }
        if let Ok(x) = var("GEOSIEVE_SIMPLIFY_BEFORE_BUFFER") {
            match x.parse::<bool>() {
                Ok(b) => cfg.simplify_before_buffer = b,
                Err(_) => warn!("Ignoring non-boolean GEOSIEVE_SIMPLIFY_BEFORE_BUFFER={x}"),
            }
        }
        if let Ok(x) = var("GEOSIEVE_CRS_POLICY") {
            cfg.crs_policy = match x.to_ascii_lowercase().as_str() {
                "auto" => CrsPolicy::Auto,
                "force_metric" => CrsPolicy::ForceMetric,
                "as_is" => CrsPolicy::AsIs,
                _ => {
                    warn!("Ignoring unknown GEOSIEVE_CRS_POLICY={x}");
                    cfg.crs_policy
                }
            };
        }
        if let Ok(x) = var("GEOSIEVE_CONCURRENCY") {
            match x.parse::<u32>() {
                Ok(n) if n > 0 => cfg.concurrency = n,
                _ => warn!("Ignoring invalid GEOSIEVE_CONCURRENCY={x}"),
            }
        }
        if let Ok(x) = var("GEOSIEVE_PROGRESS_EVERY") {
            match x.parse::<u32>() {
                Ok(n) if n > 0 => cfg.progress_every_n_features = n,
                _ => warn!("Ignoring invalid GEOSIEVE_PROGRESS_EVERY={x}"),
            }
        }
        cfg
    }
}
