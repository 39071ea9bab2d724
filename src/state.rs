// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Filter requests, per-layer filter states, and the outcome summary
//! returned to the host after a pipeline run.
//!

use crate::{
    backend::BackendKind,
    config::CrsPolicy,
    error::FilterError,
    fid::{CombineOp, FidSet},
    layer::LayerRef,
    predicate::Predicate,
};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The backend-native form of an applied filter. A layer carries either a
/// subset string or a fid set, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterPayload {
    /// A WHERE-dialect subset string applied to the host layer.
    SubsetString(String),
    /// A subset string whose source probe lives in a session-scoped
    /// materialised view.
    MaterialisedView {
        /// Qualified view name owning the probe geometry.
        view: String,
        /// The subset string referencing it.
        subset: String,
    },
    /// An explicit feature-id set.
    Fids(FidSet),
}

impl FilterPayload {
    /// The `kind_of_filter` discriminator name.
    pub fn kind_name(&self) -> &'static str {
        match self {
            FilterPayload::SubsetString(_) => "subset_string",
            FilterPayload::MaterialisedView { .. } => "materialised_view",
            FilterPayload::Fids(_) => "fid_set",
        }
    }

    /// Render the payload as the subset string handed to the host for this
    /// layer. Fid sets render as chunked `IN` lists over the primary key.
    pub fn to_subset_string(&self, pk: &str) -> String {
        match self {
            FilterPayload::SubsetString(s) => s.clone(),
            FilterPayload::MaterialisedView { subset, .. } => subset.clone(),
            FilterPayload::Fids(fids) => fids.subset_string(pk),
        }
    }

    /// The fid set, when the payload carries one.
    pub fn as_fids(&self) -> Option<&FidSet> {
        match self {
            FilterPayload::Fids(x) => Some(x),
            _ => None,
        }
    }

    /// TRUE when the payload means "no filter at all".
    pub fn is_unfiltered(&self) -> bool {
        matches!(self, FilterPayload::SubsetString(s) if s.is_empty())
    }
}

/// The immutable record of one layer's filter at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterState {
    /// Backend that produced the filter.
    pub backend: BackendKind,
    /// Backend-native filter form.
    pub payload: FilterPayload,
    /// Features matching at the time the state was captured.
    pub feature_count: u64,
    /// Capture time.
    pub created_at: Timestamp,
    /// Short human-readable description for history UIs.
    pub description: String,
}

impl FilterState {
    /// TRUE when two states describe the same applied filter from the same
    /// kind of request, ignoring capture time. Distinct requests that
    /// happen to land on the same feature set (say, two buffer distances
    /// with one match) keep separate history entries.
    pub fn same_filter(&self, other: &FilterState) -> bool {
        self.backend == other.backend
            && self.payload == other.payload
            && self.description == other.description
    }
}

/// Atomic snapshot of filters across every layer a multi-layer request
/// touched, in the request's target order (source last).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalFilterState {
    /// Participating layers and their captured states.
    pub states: Vec<(LayerRef, FilterState)>,
}

impl GlobalFilterState {
    /// Look up the state captured for one layer.
    pub fn state_for(&self, layer: &LayerRef) -> Option<&FilterState> {
        self.states
            .iter()
            .find(|(l, _)| l == layer)
            .map(|(_, s)| s)
    }

    /// Layers participating in the snapshot.
    pub fn layers(&self) -> impl Iterator<Item = &LayerRef> {
        self.states.iter().map(|(l, _)| l)
    }

    /// TRUE when two snapshots pin the same filters to the same layers.
    pub fn same_filter(&self, other: &GlobalFilterState) -> bool {
        self.states.len() == other.states.len()
            && self
                .states
                .iter()
                .zip(other.states.iter())
                .all(|((la, sa), (lb, sb))| la == lb && sa.same_filter(sb))
    }
}

/// An immutable filter request, as assembled by the host UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRequest {
    /// Layer providing the probe geometry.
    pub source_layer: LayerRef,
    /// Attribute filter on the source layer; may be empty.
    pub source_expression: String,
    /// Layers to filter with the probe; may be empty for an attribute-only
    /// request.
    pub target_layers: Vec<LayerRef>,
    /// Spatial predicates to apply; non-empty whenever targets are named.
    pub predicates: Vec<Predicate>,
    /// Buffer distance in metric units (after CRS normalisation); zero or
    /// negative permitted.
    pub buffer: f64,
    /// Collapse the source probe to interior points first.
    pub use_source_centroid: bool,
    /// Test target interior points instead of full geometries.
    pub use_target_centroid: bool,
    /// How the new result meets the previous filter state.
    pub combine: CombineOp,
    /// Prior per-target filter state, as the host last applied it.
    pub previous: HashMap<LayerRef, FilterPayload>,
    /// Reprojection policy override for this request.
    pub crs_policy: CrsPolicy,
}

impl FilterRequest {
    /// Structural validation independent of any layer I/O.
    pub fn validate(&self) -> Result<(), FilterError> {
        if !self.target_layers.is_empty() && self.predicates.is_empty() {
            return Err(FilterError::Runtime(
                "spatial request names targets but no predicates".into(),
            ));
        }
        Ok(())
    }
}

/// Per-layer summary inside a [`FilterOutcome`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerOutcome {
    /// The filtered layer.
    pub layer: LayerRef,
    /// Backend used for it.
    pub backend: BackendKind,
    /// Rows matching the final (combined) filter.
    pub matched: u64,
    /// TRUE when the spatial match was served from the result cache.
    pub cache_hit: bool,
    /// Wall-clock spent on this layer, in milliseconds.
    pub elapsed_ms: u64,
}

/// What a completed pipeline run reports back to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterOutcome {
    /// The request's source layer.
    pub source: LayerRef,
    /// One entry per filtered layer, in request order (source last when the
    /// source itself received a filter).
    pub layers: Vec<LayerOutcome>,
}

impl FilterOutcome {
    /// Total matched rows across all layers.
    pub fn total_matched(&self) -> u64 {
        self.layers.iter().map(|x| x.matched).sum()
    }

    /// JSON rendering for host-side logging or session persistence.
    pub fn to_json(&self) -> Result<String, FilterError> {
        let s = serde_json::to_string(self)?;
        Ok(s)
    }
}
