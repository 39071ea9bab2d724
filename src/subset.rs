// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Subset-string composition: wrapping a fresh filter fragment with the
//! previous one under a combine operator, and the shape heuristic deciding
//! when a previous subset string is *invalid to combine* and must be
//! replaced instead.
//!

use crate::{backend::BackendKind, fid::CombineOp};
use tracing::debug;

/// Per-backend token lists feeding the combinability heuristic. Encoded as
/// data because the poison-token set is provider-specific.
#[derive(Debug)]
pub struct CombineRules {
    /// Substrings whose presence marks a subset string as non-combinable,
    /// e.g. `EXISTS` sub-selects or spatial function calls.
    pub poison_tokens: &'static [&'static str],
    /// Prefix of source-probe aliases this engine itself emits.
    pub alias_prefix: &'static str,
}

const PG_RULES: CombineRules = CombineRules {
    poison_tokens: &[
        "EXISTS",
        "ST_Intersects(",
        "ST_Contains(",
        "ST_Within(",
        "ST_Touches(",
        "ST_Crosses(",
        "ST_Overlaps(",
        "ST_Disjoint(",
        "ST_Equals(",
        "ST_Covers(",
        "ST_CoveredBy(",
        "ST_DWithin(",
    ],
    alias_prefix: "fm_src_",
};

const SPATIALITE_RULES: CombineRules = CombineRules {
    poison_tokens: &[
        "EXISTS",
        "Intersects(",
        "Contains(",
        "Within(",
        "Touches(",
        "Crosses(",
        "Overlaps(",
        "Disjoint(",
        "Equals(",
        "PtDistWithin(",
        "GeomFromGPB(",
    ],
    alias_prefix: "fm_src_",
};

const OGR_RULES: CombineRules = CombineRules {
    poison_tokens: &["EXISTS"],
    alias_prefix: "fm_src_",
};

impl CombineRules {
    /// The rule set for one backend.
    pub fn for_backend(kind: BackendKind) -> &'static CombineRules {
        match kind {
            BackendKind::Postgres => &PG_RULES,
            BackendKind::Spatialite => &SPATIALITE_RULES,
            BackendKind::Ogr => &OGR_RULES,
        }
    }

    /// Decide whether a previous subset string may be wrapped with a new
    /// fragment. Rejected shapes: poison tokens (spatial predicates and
    /// sub-selects), references to this engine's own probe aliases, the
    /// universally-false marker, and bare PK `IN`-lists left over from a
    /// prior multi-step run.
    pub fn is_combinable(&self, previous: &str) -> bool {
        let trimmed = previous.trim();
        if trimmed.is_empty() {
            return false;
        }
        if trimmed == "0 = 1" {
            return false;
        }
        for token in self.poison_tokens {
            if trimmed.contains(token) {
                return false;
            }
        }
        if trimmed.contains(self.alias_prefix) {
            return false;
        }
        if looks_like_pk_in_list(trimmed) {
            return false;
        }
        true
    }
}

// `"fid" IN (1, 2, 3)` possibly OR-chained over chunks: a fid-list filter
// written by a previous pipeline run, not a user attribute filter.
fn looks_like_pk_in_list(s: &str) -> bool {
    s.split(" OR ").all(|part| {
        let part = part.trim();
        let Some(open) = part.find(" IN (") else {
            return false;
        };
        let Some(head) = part.get(..open) else {
            return false;
        };
        let head_ok = {
            let h = head.trim().trim_matches('"');
            !h.is_empty() && h.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        };
        let Some(tail) = part.get(open + 5..) else {
            return false;
        };
        let Some(close) = tail.rfind(')') else {
            return false;
        };
        let body_ok = tail[..close]
            .chars()
            .all(|c| c.is_ascii_digit() || c == ',' || c == ' ' || c == '-');
        head_ok && body_ok && tail[close + 1..].trim().is_empty()
    })
}

/// Wrap a previous subset string with a new fragment under a combine
/// operator. When the previous string is invalid to combine the result is
/// the new fragment alone (logged), matching the REPLACE semantics shared
/// across backends.
pub fn wrap_previous(
    kind: BackendKind,
    previous: Option<&str>,
    new: &str,
    op: CombineOp,
) -> String {
    let Some(previous) = previous else {
        return new.to_owned();
    };
    if op == CombineOp::Replace {
        return new.to_owned();
    }
    let rules = CombineRules::for_backend(kind);
    if !rules.is_combinable(previous) {
        debug!("previous subset not combinable; replacing: {previous}");
        return new.to_owned();
    }
    match op {
        CombineOp::And => format!("({previous}) AND ({new})"),
        CombineOp::Or => format!("({previous}) OR ({new})"),
        CombineOp::NotAnd => format!("({previous}) AND NOT ({new})"),
        CombineOp::Replace => new.to_owned(),
    }
}
