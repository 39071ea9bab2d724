// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Backend-polymorphic spatial vector-data filtering engine.
//!
//! Given a *source layer*, zero or more *target layers*, attribute and
//! spatial predicates, buffer parameters and a prior filter state, the
//! engine computes a new per-layer filter (a backend-native WHERE clause
//! or an explicit feature-id set), applies it through the host, and keeps
//! history for undo/redo.
//!
//! # The pipeline
//!
//! The central type is [`Core`], the context struct owning the result
//! cache, the filter history and the backend sessions. A [`FilterRequest`]
//! goes in, a [`FilterOutcome`] comes out:
//! ```rust,no_run
//! use geosieve::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn demo(host: Arc<MemoryHost>, request: FilterRequest) -> Result<(), FilterError> {
//! let mut core = Core::new(host, Config::default());
//! let outcome = core.execute(&request, &TaskContext::detached("demo")).await?;
//! for layer in &outcome.layers {
//!     println!("{}: {} rows ({})", layer.layer, layer.matched, layer.backend);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Backends
//!
//! Three implementations of one port ([`FilterPort`]):
//!
//! * **PostgreSQL/PostGIS**: the source probe is materialised in a
//!   session-scoped view with a GIST index; target filters are `EXISTS`
//!   subset strings joining against it.
//! * **Spatialite**: temporary probe tables with R-tree indexes; subset
//!   strings consumed by the host layer. GeoPackage files ride this
//!   backend through the `GeomFromGPB` conversion.
//! * **OGR**: no SQL at all. Features stream through the host's vector
//!   abstraction and predicates are computed in-process with GEOS,
//!   producing explicit fid sets.
//!
//! The factory ([`plan_backend`]) picks among them from the layer's
//! provider and the request's predicates; a capability mismatch walks the
//! sanctioned fallback chain instead of silently substituting.
//!
//! # Caching and history
//!
//! Results are cached by a [`Fingerprint`] over the canonical probe WKT,
//! the buffer distance, the sorted predicate list and the target identity,
//! so multi-step combine requests (AND / OR / NOT-AND) reuse prior spatial
//! matches without re-running predicates. Every successful request pushes
//! per-layer and (for multi-layer runs) global snapshots to the
//! [`FilterHistory`]; undo restores them atomically.
//!
//! # Third-party crates
//!
//! The heavy lifting rides on a few well-worn crates:
//!
//! 1. Geometry + CRS:
//!    * [`geos`](https://crates.io/crates/geos): buffering, validity
//!      repair, interior points and the spatial predicates themselves.
//!    * [`proj`](https://crates.io/crates/proj): CRS validation and the
//!      geographic-to-metric normalisation.
//! 2. Storage:
//!    * [`sqlx`](https://crates.io/crates/sqlx): PostgreSQL and
//!      SQLite/Spatialite access, async throughout.
//! 3. Parsing:
//!    * [`peg`](https://crates.io/crates/peg): the attribute-expression
//!      grammar.
//! 4. Plumbing:
//!    * [`tokio`](https://crates.io/crates/tokio) +
//!      [`tokio-util`](https://crates.io/crates/tokio-util): the task
//!      model and cooperative cancellation.
//!    * [`xxhash-rust`](https://crates.io/crates/xxhash-rust): content
//!      fingerprints.
//!    * [`schnellru`](https://crates.io/crates/schnellru): the bounded
//!      result cache.
//!

mod backend;
mod cache;
mod config;
mod crs;
mod error;
mod expr;
mod fid;
mod fingerprint;
mod geom;
mod history;
mod host;
mod layer;
mod orchestrator;
mod parse;
mod predicate;
mod state;
mod subset;
mod task;
mod translate;
mod value;

pub use backend::*;
pub use cache::*;
pub use config::*;
pub use crs::*;
pub use error::FilterError;
pub use fid::*;
pub use fingerprint::*;
pub use history::*;
pub use host::*;
pub use layer::*;
pub use orchestrator::*;
pub use parse::ensure_safe;
pub use predicate::*;
pub use state::*;
pub use subset::*;
pub use task::*;
pub use translate::*;
pub use value::*;

pub mod geometry {
    //! Re-export of the pure geometry utilities, for hosts that want the
    //! probe-shaping primitives without the pipeline.
    pub use crate::geom::*;
}

pub mod prelude;
