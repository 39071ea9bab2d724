// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Registry of spatial predicates: canonical names, the host application's
//! integer codes, and the SQL function templates per backend dialect.
//!
//! Every template takes exactly two geometry arguments (`{a}` for the
//! target geometry expression, `{b}` for the source probe) and returns a
//! boolean; `dwithin` additionally takes the `{d}` distance hole. The
//! native-support table here is the single source of truth consulted by the
//! capability checks.
//!

use crate::{backend::BackendKind, error::FilterError};
use core::fmt;
use serde::{Deserialize, Serialize};

/// Canonical spatial predicates.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Predicate {
    /// Geometries share at least one point.
    Intersects,
    /// Target contains the probe.
    Contains,
    /// Target lies within the probe.
    Within,
    /// Boundaries touch without interior overlap.
    Touches,
    /// Interiors cross with lower-dimensional intersection.
    Crosses,
    /// Interiors overlap with same-dimension intersection.
    Overlaps,
    /// Geometries share no point.
    Disjoint,
    /// Geometries are spatially equal.
    Equals,
    /// Target covers the probe (contains, boundary included).
    Covers,
    /// Target is covered by the probe.
    CoveredBy,
    /// Geometries lie within a given distance of each other.
    DWithin,
}

/// All predicates in canonical (alphabetical-name) order.
pub const ALL_PREDICATES: [Predicate; 11] = [
    Predicate::Contains,
    Predicate::CoveredBy,
    Predicate::Covers,
    Predicate::Crosses,
    Predicate::Disjoint,
    Predicate::DWithin,
    Predicate::Equals,
    Predicate::Intersects,
    Predicate::Overlaps,
    Predicate::Touches,
    Predicate::Within,
];

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical_name())
    }
}

impl Predicate {
    /// The canonical snake-case name used in fingerprints and diagnostics.
    pub fn canonical_name(&self) -> &'static str {
        match self {
            Predicate::Intersects => "intersects",
            Predicate::Contains => "contains",
            Predicate::Within => "within",
            Predicate::Touches => "touches",
            Predicate::Crosses => "crosses",
            Predicate::Overlaps => "overlaps",
            Predicate::Disjoint => "disjoint",
            Predicate::Equals => "equals",
            Predicate::Covers => "covers",
            Predicate::CoveredBy => "covered_by",
            Predicate::DWithin => "dwithin",
        }
    }

    /// Parse a canonical name.
    pub fn from_canonical_name(name: &str) -> Result<Self, FilterError> {
        match name {
            "intersects" => Ok(Predicate::Intersects),
            "contains" => Ok(Predicate::Contains),
            "within" => Ok(Predicate::Within),
            "touches" => Ok(Predicate::Touches),
            "crosses" => Ok(Predicate::Crosses),
            "overlaps" => Ok(Predicate::Overlaps),
            "disjoint" => Ok(Predicate::Disjoint),
            "equals" => Ok(Predicate::Equals),
            "covers" => Ok(Predicate::Covers),
            "covered_by" => Ok(Predicate::CoveredBy),
            "dwithin" => Ok(Predicate::DWithin),
            x => Err(FilterError::PredicateNotSupported(x.to_owned())),
        }
    }

    /// Map the host application's integer predicate code to the canonical
    /// predicate. Codes beyond the host's table are rejected.
    pub fn from_host_code(code: i32) -> Result<Self, FilterError> {
        match code {
            0 => Ok(Predicate::Intersects),
            1 => Ok(Predicate::Contains),
            2 => Ok(Predicate::Disjoint),
            3 => Ok(Predicate::Equals),
            4 => Ok(Predicate::Touches),
            5 => Ok(Predicate::Overlaps),
            6 => Ok(Predicate::Within),
            7 => Ok(Predicate::Crosses),
            x => Err(FilterError::PredicateNotSupported(format!("host code {x}"))),
        }
    }

    /// The SQL template for one backend, or `None` when the backend has no
    /// native form and the orchestrator must decompose or re-plan.
    pub fn sql_template(&self, kind: BackendKind) -> Option<&'static str> {
        match kind {
            BackendKind::Postgres => Some(match self {
                Predicate::Intersects => "ST_Intersects({a}, {b})",
                Predicate::Contains => "ST_Contains({a}, {b})",
                Predicate::Within => "ST_Within({a}, {b})",
                Predicate::Touches => "ST_Touches({a}, {b})",
                Predicate::Crosses => "ST_Crosses({a}, {b})",
                Predicate::Overlaps => "ST_Overlaps({a}, {b})",
                Predicate::Disjoint => "ST_Disjoint({a}, {b})",
                Predicate::Equals => "ST_Equals({a}, {b})",
                Predicate::Covers => "ST_Covers({a}, {b})",
                Predicate::CoveredBy => "ST_CoveredBy({a}, {b})",
                Predicate::DWithin => "ST_DWithin({a}, {b}, {d})",
            }),
            BackendKind::Spatialite => match self {
                Predicate::Intersects => Some("Intersects({a}, {b})"),
                Predicate::Contains => Some("Contains({a}, {b})"),
                Predicate::Within => Some("Within({a}, {b})"),
                Predicate::Touches => Some("Touches({a}, {b})"),
                Predicate::Crosses => Some("Crosses({a}, {b})"),
                Predicate::Overlaps => Some("Overlaps({a}, {b})"),
                Predicate::Disjoint => Some("Disjoint({a}, {b})"),
                Predicate::Equals => Some("Equals({a}, {b})"),
                // older mod_spatialite builds lack the covers pair...
                Predicate::Covers | Predicate::CoveredBy => None,
                Predicate::DWithin => Some("PtDistWithin({a}, {b}, {d})"),
            },
            // the OGR backend computes predicates in-process, never in SQL.
            BackendKind::Ogr => None,
        }
    }

    /// TRUE when the backend can evaluate this predicate itself, in SQL or
    /// (for OGR) in-process.
    pub fn supported_natively(&self, kind: BackendKind) -> bool {
        match kind {
            BackendKind::Ogr => true,
            x => self.sql_template(x).is_some(),
        }
    }

    /// Render the SQL for this predicate with the template holes filled.
    /// `distance` is only consulted by `dwithin`.
    pub fn to_sql(
        &self,
        kind: BackendKind,
        target_geom: &str,
        source_geom: &str,
        distance: f64,
    ) -> Result<String, FilterError> {
        let template = self
            .sql_template(kind)
            .ok_or_else(|| FilterError::PredicateNotSupported(self.canonical_name().to_owned()))?;
        Ok(template
            .replace("{a}", target_geom)
            .replace("{b}", source_geom)
            .replace("{d}", &distance.to_string()))
    }
}

/// Normalise a predicate list for fingerprinting and planning: sorted by
/// canonical name, deduplicated.
pub fn normalise(predicates: &[Predicate]) -> Vec<Predicate> {
    let mut out: Vec<Predicate> = predicates.to_vec();
    out.sort_by_key(|p| p.canonical_name());
    out.dedup();
    out
}
