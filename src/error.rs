// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Errors raised from this library.
//!

use crate::{backend::BackendKind, layer::LayerRef};
use std::borrow::Cow;
use thiserror::Error;

/// Variants of error raised from this library.
///
/// The first group mirrors the failure kinds surfaced to an embedding host;
/// the second wraps third-party errors crossing the crate boundary.
#[derive(Debug, Error)]
pub enum FilterError {
    /// Layer lacks a resolvable primary key, geometry column or SRID.
    #[error("layer '{layer}' is not filterable: {reason}")]
    LayerNotFilterable {
        /// Offending layer.
        layer: LayerRef,
        /// Which requirement failed.
        reason: Cow<'static, str>,
    },

    /// The backend chosen by the factory cannot be opened.
    #[error("backend {backend} unavailable: {reason}")]
    BackendUnavailable {
        /// Backend kind that failed to open.
        backend: BackendKind,
        /// Connection-level detail.
        reason: String,
    },

    /// The chosen backend lacks a capability the request needs. Retryable on
    /// the next-best backend when the factory's fallback chain allows it.
    #[error("backend {backend} lacks capability: {capability}")]
    CapabilityMismatch {
        /// Backend kind that was rejected.
        backend: BackendKind,
        /// Human-readable capability name.
        capability: Cow<'static, str>,
    },

    /// Unknown or backend-unsupported spatial predicate.
    #[error("predicate '{0}' is not supported")]
    PredicateNotSupported(String),

    /// Attribute expression cannot be lowered to the backend's SQL dialect.
    #[error("expression not translatable: {0}")]
    ExpressionNotTranslatable(Cow<'static, str>),

    /// Expression contains disallowed constructs. Never retried.
    #[error("unsafe expression: {0}")]
    UnsafeExpression(Cow<'static, str>),

    /// Column reference not found in the layer schema.
    #[error("unknown column '{0}'")]
    UnknownColumn(String),

    /// Source geometry could not be repaired.
    #[error("source geometry is invalid and not repairable ({hint})")]
    GeometryInvalid {
        /// What the repair pipeline tried last.
        hint: Cow<'static, str>,
    },

    /// A backend query failed. Carries the backend's own error text.
    #[error("backend {backend} query failed: {detail}")]
    BackendQueryFailed {
        /// Backend kind that raised the error.
        backend: BackendKind,
        /// Backend-native error text.
        detail: String,
    },

    /// Task was cancelled. Guaranteed side-effect free.
    #[error("cancelled")]
    Cancelled,

    /// Host-imposed deadline exceeded. Rolled back like a cancellation.
    #[error("timed out")]
    Timeout,

    /// Cache disagreed with the backend; the entry has been invalidated.
    #[error("cache inconsistency for fingerprint {0}")]
    CacheInconsistency(String),

    /// Attribute-expression parse error.
    #[error("expression parse error: {0}")]
    Parse(#[from] peg::error::ParseError<peg::str::LineCol>),

    /// JSON (`serde`) encoding error.
    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    IO(#[from] std::io::Error),

    /// SQL driver (`sqlx`) error.
    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    /// Geometry (`geos`) error.
    #[error("Geos error: {0}")]
    Geos(#[from] geos::Error),

    /// CRS construction error.
    #[error("CRS creation error: {0}")]
    Crs(#[from] proj::ProjCreateError),

    /// Coordinate transformation (`proj`) error.
    #[error("Proj error: {0}")]
    Proj(#[from] proj::ProjError),

    /// Date + time (`jiff`) error.
    #[error("Date-Time error: {0}")]
    Time(#[from] jiff::Error),

    /// Catch-all runtime error.
    #[error("Runtime error: {0}")]
    Runtime(Cow<'static, str>),
}

impl FilterError {
    /// Return TRUE if this error belongs to a transient class worth one
    /// retry: SQLite `database is locked` and PostgreSQL connection resets.
    pub fn is_transient(&self) -> bool {
        match self {
            FilterError::BackendQueryFailed { detail, .. } => {
                let d = detail.to_ascii_lowercase();
                d.contains("database is locked")
                    || d.contains("connection reset")
                    || d.contains("connection closed")
            }
            FilterError::Sql(x) => {
                let d = x.to_string().to_ascii_lowercase();
                d.contains("database is locked") || d.contains("connection reset")
            }
            _ => false,
        }
    }

    /// Exit code for an outer CLI surface wrapping the engine: 2 invalid
    /// arguments, 3 layer not filterable, 4 backend unavailable, 5
    /// cancelled, 1 anything else. The embedded core itself never exits.
    pub fn exit_code(&self) -> i32 {
        match self {
            FilterError::PredicateNotSupported(_)
            | FilterError::ExpressionNotTranslatable(_)
            | FilterError::UnsafeExpression(_)
            | FilterError::UnknownColumn(_)
            | FilterError::Parse(_) => 2,
            FilterError::LayerNotFilterable { .. } => 3,
            FilterError::BackendUnavailable { .. } => 4,
            FilterError::Cancelled | FilterError::Timeout => 5,
            _ => 1,
        }
    }

    /// One-line structured diagnostic: kind, layer, backend, brief text.
    /// This is the sentence the host shows for "filter failed for layer X".
    pub fn diagnostic(&self) -> String {
        match self {
            FilterError::LayerNotFilterable { layer, reason } => {
                format!("LayerNotFilterable[{layer}]: {reason}")
            }
            FilterError::BackendUnavailable { backend, reason } => {
                format!("BackendUnavailable[{backend}]: {reason}")
            }
            FilterError::CapabilityMismatch {
                backend,
                capability,
            } => format!("CapabilityMismatch[{backend}]: {capability}"),
            FilterError::BackendQueryFailed { backend, detail } => {
                format!("BackendQueryFailed[{backend}]: {detail}")
            }
            x => format!("{x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;

    #[test]
    fn test_transient_classes() {
        let locked = FilterError::BackendQueryFailed {
            backend: BackendKind::Spatialite,
            detail: "database is locked".into(),
        };
        assert!(locked.is_transient());

        let reset = FilterError::BackendQueryFailed {
            backend: BackendKind::Postgres,
            detail: "Connection reset by peer".into(),
        };
        assert!(reset.is_transient());

        let surfaced = FilterError::UnknownColumn("popluation".into());
        assert!(!surfaced.is_transient());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(FilterError::UnknownColumn("x".into()).exit_code(), 2);
        assert_eq!(
            FilterError::LayerNotFilterable {
                layer: crate::layer::LayerRef::from("l"),
                reason: "no SRID".into(),
            }
            .exit_code(),
            3
        );
        assert_eq!(
            FilterError::BackendUnavailable {
                backend: BackendKind::Postgres,
                reason: "refused".into(),
            }
            .exit_code(),
            4
        );
        assert_eq!(FilterError::Cancelled.exit_code(), 5);
        assert_eq!(FilterError::Runtime("boom".into()).exit_code(), 1);
    }
}
