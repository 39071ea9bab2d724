// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! OGR backend: no side SQL at all. The probe is kept in memory, target
//! features are streamed from the host under a bounding-box pre-filter, and
//! every predicate is computed in-process with GEOS. The result is always
//! an explicit fid set.
//!

use crate::{
    backend::{BackendKind, FilterPort, PreparedSource, Session, SourceProbe},
    config::CentroidMode,
    crs::Reprojector,
    error::FilterError,
    fid::FidSet,
    geom,
    host::Host,
    layer::LayerDescriptor,
    parse::parse_expression,
    predicate::Predicate,
    state::FilterPayload,
    task::TaskContext,
};
use async_trait::async_trait;
use geos::{Geom, Geometry};
use std::sync::Arc;
use tracing::debug;

/// The in-process backend. Owns nothing but a reference to the host; the
/// session artifact ledger stays empty by construction.
pub struct OgrBackend {
    host: Arc<dyn Host>,
    session: Session,
    centroid_mode: CentroidMode,
    progress_every: u32,
}

impl std::fmt::Debug for OgrBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OgrBackend")
            .field("session", &self.session)
            .field("progress_every", &self.progress_every)
            .finish()
    }
}

impl OgrBackend {
    /// A backend iterating features through `host`.
    pub fn new(host: Arc<dyn Host>, centroid_mode: CentroidMode, progress_every: u32) -> Self {
        Self {
            host,
            session: Session::new(BackendKind::Ogr),
            centroid_mode,
            progress_every: progress_every.max(1),
        }
    }

    fn eval_predicate(
        &self,
        p: Predicate,
        target_geom: &Geometry,
        probe: &SourceProbe,
    ) -> Result<bool, FilterError> {
        let src = &probe.geometry;
        let hit = match p {
            Predicate::Intersects => target_geom.intersects(src)?,
            Predicate::Contains => target_geom.contains(src)?,
            Predicate::Within => target_geom.within(src)?,
            Predicate::Touches => target_geom.touches(src)?,
            Predicate::Crosses => target_geom.crosses(src)?,
            Predicate::Overlaps => target_geom.overlaps(src)?,
            Predicate::Disjoint => target_geom.disjoint(src)?,
            Predicate::Equals => target_geom.equals(src)?,
            Predicate::Covers => target_geom.covers(src)?,
            Predicate::CoveredBy => target_geom.covered_by(src)?,
            Predicate::DWithin => geom::within_distance(target_geom, src, probe.buffer)?,
        };
        Ok(hit)
    }
}

// Project a probe-CRS bounding box into the target CRS, taking the hull of
// the four transformed corners.
fn transform_bbox(
    bbox: (f64, f64, f64, f64),
    re: &Reprojector,
) -> Result<(f64, f64, f64, f64), FilterError> {
    let (x0, y0, x1, y1) = bbox;
    let corners = [(x0, y0), (x0, y1), (x1, y0), (x1, y1)];
    let mut out = (f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
    for (x, y) in corners {
        let (tx, ty) = re.convert(x, y)?;
        out.0 = out.0.min(tx);
        out.1 = out.1.min(ty);
        out.2 = out.2.max(tx);
        out.3 = out.3.max(ty);
    }
    Ok(out)
}

#[async_trait]
impl FilterPort for OgrBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Ogr
    }

    async fn open_session(&mut self, _uri: &str) -> Result<(), FilterError> {
        // the host is the connection.
        Ok(())
    }

    async fn prepare_source(
        &mut self,
        probe: &SourceProbe,
        _ctx: &TaskContext,
    ) -> Result<PreparedSource, FilterError> {
        // the probe stays in memory; nothing to materialise.
        Ok(PreparedSource {
            probe: probe.clone(),
            artifact: None,
            created: false,
        })
    }

    async fn apply_filter(
        &mut self,
        target: &LayerDescriptor,
        prepared: &PreparedSource,
        predicates: &[Predicate],
        use_target_centroid: bool,
        ctx: &TaskContext,
    ) -> Result<FilterPayload, FilterError> {
        let probe = &prepared.probe;
        // an eroded-to-empty probe matches nothing...
        if probe.geometry.is_empty()? {
            return Ok(FilterPayload::Fids(FidSet::new()));
        }
        // target features living in another CRS are pulled into the probe's
        // CRS before testing, so distances stay metric...
        let crs_mismatch = target.srid > 0 && probe.srid > 0 && target.srid != probe.srid;
        let to_target = if crs_mismatch {
            Some(Reprojector::new(probe.srid, target.srid)?)
        } else {
            None
        };
        let to_probe = if crs_mismatch {
            Some(Reprojector::new(target.srid, probe.srid)?)
        } else {
            None
        };
        // the disjoint predicate must see *every* feature; a bbox
        // pre-filter would hide exactly the matches...
        let bbox = if predicates.contains(&Predicate::Disjoint) {
            None
        } else {
            let (x0, y0, x1, y1) = geom::bounds(&probe.geometry)?;
            // dwithin reaches past the probe's own extent...
            let pad = if predicates.contains(&Predicate::DWithin) {
                probe.buffer.abs()
            } else {
                0.0
            };
            let padded = (x0 - pad, y0 - pad, x1 + pad, y1 + pad);
            Some(match &to_target {
                Some(re) => transform_bbox(padded, re)?,
                None => padded,
            })
        };
        let features = self
            .host
            .iter_features(&target.layer, None, bbox)?;

        let total = target.feature_count_hint.unwrap_or(0);
        let mut seen: u64 = 0;
        let mut fids = FidSet::new();
        for feature in features {
            seen += 1;
            if seen % u64::from(self.progress_every) == 0 {
                let percent = if total > 0 {
                    40 + ((seen.min(total) * 50) / total) as u8
                } else {
                    50
                };
                ctx.checkpoint(
                    percent,
                    &format!("filtering {} ({seen} features)", target.layer),
                )?;
            }
            let Some(g) = feature.geometry.as_ref() else {
                continue;
            };
            let mut tested: Geometry = if use_target_centroid {
                geom::interior_point(g, self.centroid_mode)?
            } else {
                g.clone()
            };
            if let Some(re) = &to_probe {
                tested = geom::transform(&tested, re)?;
            }
            for p in predicates {
                if self.eval_predicate(*p, &tested, probe)? {
                    fids.insert(feature.fid);
                    break;
                }
            }
        }
        debug!(
            "ogr filter on {}: {} of {seen} features match",
            target.layer,
            fids.len()
        );
        Ok(FilterPayload::Fids(fids))
    }

    async fn count_features(
        &self,
        target: &LayerDescriptor,
        subset: &str,
    ) -> Result<u64, FilterError> {
        if subset.is_empty() {
            let n = self.host.iter_features(&target.layer, None, None)?.count();
            return Ok(n as u64);
        }
        // no SQL engine here: evaluate the subset in-process, with the
        // primary key injected as a pseudo-attribute...
        let expr = parse_expression(subset)?;
        let pk = target.require_filterable()?.to_owned();
        let mut n: u64 = 0;
        for feature in self.host.iter_features(&target.layer, None, None)? {
            let mut attrs = feature.attributes.clone();
            attrs.insert(pk.clone(), feature.fid.into());
            if expr.matches(&attrs)? == Some(true) {
                n += 1;
            }
        }
        Ok(n)
    }

    async fn cleanup(&mut self) -> Result<(), FilterError> {
        // nothing is ever materialised.
        debug_assert_eq!(self.session.artifact_count(), 0);
        Ok(())
    }

    fn artifact_count(&self) -> usize {
        self.session.artifact_count()
    }
}
