// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! The backend abstraction: one port, three implementations (PostgreSQL,
//! Spatialite, OGR/in-process) plus the factory choosing among them.
//!
//! Backends are modelled as a tagged enum over concrete states with the
//! shared contract expressed as a trait, so capability matching and the
//! error taxonomy stay explicit.
//!

mod factory;
mod ogr;
mod pg;
mod spatialite;

pub use factory::*;
pub use ogr::*;
pub use pg::*;
pub use spatialite::*;

use crate::{
    error::FilterError,
    layer::LayerDescriptor,
    predicate::Predicate,
    state::FilterPayload,
    task::TaskContext,
};
use async_trait::async_trait;
use core::fmt;
use geos::Geometry;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The three backend families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// PostgreSQL + PostGIS.
    Postgres,
    /// SQLite + Spatialite (GeoPackage included).
    Spatialite,
    /// In-process feature iteration over the host's vector abstraction.
    Ogr,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Postgres => write!(f, "postgresql"),
            BackendKind::Spatialite => write!(f, "spatialite"),
            BackendKind::Ogr => write!(f, "ogr"),
        }
    }
}

/// Capability flags consulted at planning time; the single source of truth
/// replacing scattered backend-kind checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilitySet {
    kind: BackendKind,
    /// Session-scoped materialised views are available.
    pub materialised_view: bool,
    /// Spatial indexes (GIST / R-tree) can back the probe.
    pub rtree: bool,
    /// Negative buffer distances behave per contract.
    pub negative_buffer: bool,
    /// The backend can rewrite an applied filter in place
    /// (`REFRESH MATERIALIZED VIEW`).
    pub rewrite_in_place: bool,
    /// Read queries may fan out over a connection pool.
    pub concurrent_reads: bool,
}

impl CapabilitySet {
    /// The capability set of one backend kind.
    pub fn of(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Postgres => Self {
                kind,
                materialised_view: true,
                rtree: true,
                negative_buffer: true,
                rewrite_in_place: true,
                concurrent_reads: true,
            },
            BackendKind::Spatialite => Self {
                kind,
                materialised_view: false,
                rtree: true,
                negative_buffer: true,
                rewrite_in_place: false,
                concurrent_reads: false,
            },
            BackendKind::Ogr => Self {
                kind,
                materialised_view: false,
                rtree: false,
                // an eroded-to-empty probe yields the universally-false
                // subset, nothing stronger...
                negative_buffer: false,
                rewrite_in_place: false,
                concurrent_reads: false,
            },
        }
    }

    /// TRUE when the backend can evaluate a predicate itself.
    pub fn supports_predicate(&self, p: Predicate) -> bool {
        p.supported_natively(self.kind)
    }
}

/// A backend-owned artifact to drop at cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// A session-scoped materialised view, by qualified name.
    MaterialisedView(String),
    /// A temporary table.
    TempTable(String),
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Artifact::MaterialisedView(x) => write!(f, "materialised view {x}"),
            Artifact::TempTable(x) => write!(f, "temp table {x}"),
        }
    }
}

/// Mutable, process-scoped backend session: its id names the artifacts it
/// owns; the artifact ledger is drained LIFO at cleanup and must be empty
/// on teardown.
#[derive(Debug)]
pub struct Session {
    id: String,
    kind: BackendKind,
    artifacts: Vec<Artifact>,
}

impl Session {
    /// A fresh session for one backend.
    pub fn new(kind: BackendKind) -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self {
            id,
            kind,
            artifacts: Vec::new(),
        }
    }

    /// Session id used inside artifact names.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Backend family this session belongs to.
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Record ownership of a freshly created artifact.
    pub fn adopt(&mut self, artifact: Artifact) {
        if !self.artifacts.contains(&artifact) {
            self.artifacts.push(artifact);
        }
    }

    /// Disown one artifact after it was dropped externally (rollback path).
    pub fn disown(&mut self, artifact: &Artifact) {
        self.artifacts.retain(|a| a != artifact);
    }

    /// TRUE when an artifact with this name is already owned.
    pub fn owns(&self, artifact: &Artifact) -> bool {
        self.artifacts.contains(artifact)
    }

    /// Drain all artifacts, newest first.
    pub fn drain_lifo(&mut self) -> Vec<Artifact> {
        let mut out = std::mem::take(&mut self.artifacts);
        out.reverse();
        out
    }

    /// Number of live artifacts.
    pub fn artifact_count(&self) -> usize {
        self.artifacts.len()
    }
}

/// The source probe geometry after CRS normalisation, simplification and
/// buffering, ready for a backend to materialise.
#[derive(Debug, Clone)]
pub struct SourceProbe {
    /// Probe geometry in the normalised CRS.
    pub geometry: Geometry,
    /// Canonical WKT of the probe (fingerprint input).
    pub wkt: String,
    /// SRID of the normalised CRS.
    pub srid: i32,
    /// Short content hash naming backend artifacts for this probe.
    pub short_hash: String,
    /// The request's buffer distance (also the `dwithin` distance).
    pub buffer: f64,
}

/// Handle to a materialised source probe inside a backend session.
#[derive(Debug, Clone)]
pub struct PreparedSource {
    /// The probe it was built from.
    pub probe: SourceProbe,
    /// Backend artifact (view/temp-table name) holding the probe, when the
    /// backend works through SQL.
    pub artifact: Option<String>,
    /// TRUE when this call created the artifact (as opposed to refreshing
    /// one a previous run left in the session). Rollback only drops what
    /// the current request created.
    pub created: bool,
}

/// The contract every backend implements. `prepare_source` and
/// `apply_filter` are retryable: a failure leaves no partial artifacts.
#[async_trait]
pub trait FilterPort {
    /// This backend's family.
    fn kind(&self) -> BackendKind;

    /// Capability flags.
    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::of(self.kind())
    }

    /// Establish (or reuse) the connection for a provider URI. Idempotent
    /// per URI within a process.
    async fn open_session(&mut self, uri: &str) -> Result<(), FilterError>;

    /// Materialise the source probe for reuse across targets. The resulting
    /// artifact is owned by the session.
    async fn prepare_source(
        &mut self,
        probe: &SourceProbe,
        ctx: &TaskContext,
    ) -> Result<PreparedSource, FilterError>;

    /// Produce the new spatial-match filter for one target layer. The
    /// returned payload is *not* yet combined with any previous filter.
    async fn apply_filter(
        &mut self,
        target: &LayerDescriptor,
        prepared: &PreparedSource,
        predicates: &[Predicate],
        use_target_centroid: bool,
        ctx: &TaskContext,
    ) -> Result<FilterPayload, FilterError>;

    /// Fast feature count of a subset string over a target layer.
    async fn count_features(
        &self,
        target: &LayerDescriptor,
        subset: &str,
    ) -> Result<u64, FilterError>;

    /// Drop all artifacts owned by the session, newest first. Failures are
    /// logged and skipped; the ledger is empty afterwards either way.
    async fn cleanup(&mut self) -> Result<(), FilterError>;

    /// Number of artifacts the session currently owns.
    fn artifact_count(&self) -> usize;
}

/// The tagged union the orchestrator stores and dispatches on.
#[derive(Debug)]
pub enum Backend {
    /// PostgreSQL + PostGIS.
    Postgres(PgBackend),
    /// SQLite + Spatialite.
    Spatialite(SpatialiteBackend),
    /// In-process.
    Ogr(OgrBackend),
}

#[async_trait]
impl FilterPort for Backend {
    fn kind(&self) -> BackendKind {
        match self {
            Backend::Postgres(x) => x.kind(),
            Backend::Spatialite(x) => x.kind(),
            Backend::Ogr(x) => x.kind(),
        }
    }

    async fn open_session(&mut self, uri: &str) -> Result<(), FilterError> {
        match self {
            Backend::Postgres(x) => x.open_session(uri).await,
            Backend::Spatialite(x) => x.open_session(uri).await,
            Backend::Ogr(x) => x.open_session(uri).await,
        }
    }

    async fn prepare_source(
        &mut self,
        probe: &SourceProbe,
        ctx: &TaskContext,
    ) -> Result<PreparedSource, FilterError> {
        match self {
            Backend::Postgres(x) => x.prepare_source(probe, ctx).await,
            Backend::Spatialite(x) => x.prepare_source(probe, ctx).await,
            Backend::Ogr(x) => x.prepare_source(probe, ctx).await,
        }
    }

    async fn apply_filter(
        &mut self,
        target: &LayerDescriptor,
        prepared: &PreparedSource,
        predicates: &[Predicate],
        use_target_centroid: bool,
        ctx: &TaskContext,
    ) -> Result<FilterPayload, FilterError> {
        match self {
            Backend::Postgres(x) => {
                x.apply_filter(target, prepared, predicates, use_target_centroid, ctx)
                    .await
            }
            Backend::Spatialite(x) => {
                x.apply_filter(target, prepared, predicates, use_target_centroid, ctx)
                    .await
            }
            Backend::Ogr(x) => {
                x.apply_filter(target, prepared, predicates, use_target_centroid, ctx)
                    .await
            }
        }
    }

    async fn count_features(
        &self,
        target: &LayerDescriptor,
        subset: &str,
    ) -> Result<u64, FilterError> {
        match self {
            Backend::Postgres(x) => x.count_features(target, subset).await,
            Backend::Spatialite(x) => x.count_features(target, subset).await,
            Backend::Ogr(x) => x.count_features(target, subset).await,
        }
    }

    async fn cleanup(&mut self) -> Result<(), FilterError> {
        match self {
            Backend::Postgres(x) => x.cleanup().await,
            Backend::Spatialite(x) => x.cleanup().await,
            Backend::Ogr(x) => x.cleanup().await,
        }
    }

    fn artifact_count(&self) -> usize {
        match self {
            Backend::Postgres(x) => x.artifact_count(),
            Backend::Spatialite(x) => x.artifact_count(),
            Backend::Ogr(x) => x.artifact_count(),
        }
    }
}

impl Backend {
    /// Drop the artifact a cancelled or failed request created for its
    /// probe; refreshed pre-existing artifacts are left alone.
    pub async fn rollback_probe(&mut self, prepared: &PreparedSource) -> Result<(), FilterError> {
        if !prepared.created {
            return Ok(());
        }
        match self {
            Backend::Postgres(x) => x.drop_probe(prepared).await,
            Backend::Spatialite(x) => x.drop_probe(prepared).await,
            Backend::Ogr(_) => Ok(()),
        }
    }
}
