// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Backend selection: provider kind to backend kind, capability checking,
//! and the one sanctioned fallback chain (GeoPackage layers may retry
//! spatialite -> ogr). The factory never silently substitutes an arbitrary
//! backend.
//!

use crate::{
    backend::{Backend, BackendKind, CapabilitySet, OgrBackend, PgBackend, SpatialiteBackend},
    config::Config,
    error::FilterError,
    host::Host,
    layer::{LayerDescriptor, LayerKind},
    predicate::Predicate,
};
use std::sync::Arc;
use tracing::debug;

/// Map a layer to the backend kind its provider calls for, before any
/// capability checking.
pub fn select_backend(layer: &LayerDescriptor, config: &Config) -> BackendKind {
    match layer.kind {
        LayerKind::Postgres if config.postgresql_enabled => BackendKind::Postgres,
        // PostgreSQL administratively disabled: the layer is still
        // reachable through the host's vector abstraction...
        LayerKind::Postgres => BackendKind::Ogr,
        LayerKind::Spatialite => BackendKind::Spatialite,
        LayerKind::Ogr => BackendKind::Ogr,
    }
}

/// Verify a backend kind can serve the request's predicates.
pub fn check_capabilities(
    kind: BackendKind,
    predicates: &[Predicate],
) -> Result<(), FilterError> {
    let caps = CapabilitySet::of(kind);
    for p in predicates {
        if !caps.supports_predicate(*p) {
            return Err(FilterError::CapabilityMismatch {
                backend: kind,
                capability: format!("predicate {p}").into(),
            });
        }
    }
    Ok(())
}

/// The next-best backend after a capability mismatch, when policy allows
/// one. Only Spatialite-served (GeoPackage) layers may step down to OGR.
pub fn fallback(layer: &LayerDescriptor, rejected: BackendKind) -> Option<BackendKind> {
    match (layer.kind, rejected) {
        (LayerKind::Spatialite, BackendKind::Spatialite) => Some(BackendKind::Ogr),
        _ => None,
    }
}

/// Pick the backend kind for a layer and request, walking the fallback
/// chain on capability mismatches.
pub fn plan_backend(
    layer: &LayerDescriptor,
    config: &Config,
    predicates: &[Predicate],
) -> Result<BackendKind, FilterError> {
    let mut kind = select_backend(layer, config);
    loop {
        match check_capabilities(kind, predicates) {
            Ok(()) => return Ok(kind),
            Err(e) => match fallback(layer, kind) {
                Some(next) => {
                    debug!("capability mismatch on {kind}, retrying on {next}: {e}");
                    kind = next;
                }
                None => return Err(e),
            },
        }
    }
}

/// Instantiate the backend state for a kind.
pub fn create_backend(kind: BackendKind, config: &Config, host: Arc<dyn Host>) -> Backend {
    match kind {
        BackendKind::Postgres => {
            Backend::Postgres(PgBackend::new(config.materialised_view_schema.clone()))
        }
        BackendKind::Spatialite => Backend::Spatialite(SpatialiteBackend::new()),
        BackendKind::Ogr => Backend::Ogr(OgrBackend::new(
            host,
            config.centroid_mode,
            config.progress_every_n_features,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        host::MemoryHost,
        layer::{GeomEncoding, LayerRef},
    };

    fn layer(kind: LayerKind) -> LayerDescriptor {
        LayerDescriptor {
            layer: LayerRef::from("l"),
            kind,
            provider_uri: "x".into(),
            table_name: "l".into(),
            geometry_column: "geom".into(),
            srid: 3857,
            geometry_type: "Point".into(),
            encoding: GeomEncoding::GeoPackage,
            declared_primary_key: Some("fid".into()),
            host_row_id: None,
            feature_count_hint: None,
            columns: vec![],
        }
    }

    #[test]
    fn test_selection_rules() {
        let cfg = Config::default();
        assert_eq!(
            select_backend(&layer(LayerKind::Postgres), &cfg),
            BackendKind::Postgres
        );
        assert_eq!(
            select_backend(&layer(LayerKind::Spatialite), &cfg),
            BackendKind::Spatialite
        );
        assert_eq!(select_backend(&layer(LayerKind::Ogr), &cfg), BackendKind::Ogr);

        let mut no_pg = Config::default();
        no_pg.postgresql_enabled = false;
        assert_eq!(
            select_backend(&layer(LayerKind::Postgres), &no_pg),
            BackendKind::Ogr
        );
    }

    #[test]
    fn test_geopackage_falls_back_to_ogr_for_covers() {
        let cfg = Config::default();
        // spatialite has touches natively; no fallback needed...
        assert_eq!(
            plan_backend(&layer(LayerKind::Spatialite), &cfg, &[Predicate::Touches]).unwrap(),
            BackendKind::Spatialite
        );
        // covers it lacks; the sanctioned chain steps down to OGR...
        assert_eq!(
            plan_backend(&layer(LayerKind::Spatialite), &cfg, &[Predicate::Covers]).unwrap(),
            BackendKind::Ogr
        );
    }

    #[test]
    fn test_no_arbitrary_fallback() {
        assert_eq!(fallback(&layer(LayerKind::Ogr), BackendKind::Ogr), None);
        assert_eq!(
            fallback(&layer(LayerKind::Postgres), BackendKind::Postgres),
            None
        );
    }

    #[test]
    fn test_create_backend_kinds() {
        let cfg = Config::default();
        let host = Arc::new(MemoryHost::new());
        for kind in [BackendKind::Postgres, BackendKind::Spatialite, BackendKind::Ogr] {
            let b = create_backend(kind, &cfg, host.clone());
            use crate::backend::FilterPort;
            assert_eq!(b.kind(), kind);
        }
    }
}
