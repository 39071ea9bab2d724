// SPDX-License-Identifier: Apache-2.0

//! Common test harness: in-memory layers and request builders used by the
//! end-to-end pipeline scenarios.
//!

// each scenario crate pulls in the slice of the harness it needs.
#![allow(dead_code)]

use geos::Geometry;
use geosieve::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

/// A point feature with no attributes beyond its fid.
pub fn point_feature(fid: i64, x: f64, y: f64) -> Feature {
    Feature {
        fid,
        geometry: Some(
            Geometry::new_from_wkt(&format!("POINT ({x} {y})")).expect("valid WKT"),
        ),
        attributes: HashMap::new(),
    }
}

/// An OGR point layer descriptor with a host row id as its primary key.
pub fn point_layer(id: &str, srid: i32, columns: Vec<Column>) -> LayerDescriptor {
    LayerDescriptor {
        layer: LayerRef::from(id),
        kind: LayerKind::Ogr,
        provider_uri: format!("/data/{id}.shp"),
        table_name: id.to_owned(),
        geometry_column: "geometry".into(),
        srid,
        geometry_type: "Point".into(),
        encoding: GeomEncoding::Native,
        declared_primary_key: None,
        host_row_id: Some("fid".into()),
        feature_count_hint: None,
        columns,
    }
}

/// The S1 towns layer: ten features, `population` = (fid - 1) * 5.
pub fn towns_layer(host: &MemoryHost) -> LayerRef {
    let descriptor = point_layer(
        "towns",
        3857,
        vec![Column::new("population", ColumnType::Integer)],
    );
    let layer = descriptor.layer.clone();
    let features = (1..=10)
        .map(|fid| {
            let mut f = point_feature(fid, fid as f64 * 10.0, 0.0);
            f.attributes
                .insert("population".into(), Value::from((fid - 1) * 5));
            f
        })
        .collect();
    host.add_layer(descriptor, features);
    layer
}

/// The geographic scenario pair: a single-point source near the Paris
/// meridian and a three-point target, both in EPSG:4326. Web-mercator
/// distances from the source: fid 1 ~250 m, fid 2 ~4.1 km, fid 3 ~29 km.
pub fn geographic_pair(host: &MemoryHost) -> (LayerRef, LayerRef) {
    let source = point_layer("probe_pts", 4326, vec![]);
    let source_ref = source.layer.clone();
    host.add_layer(source, vec![point_feature(1, 2.3522, 48.8566)]);

    let target = point_layer("poi", 4326, vec![]);
    let target_ref = target.layer.clone();
    host.add_layer(
        target,
        vec![
            point_feature(1, 2.3530, 48.8580),
            point_feature(2, 2.3600, 48.8800),
            point_feature(3, 2.5000, 49.0000),
        ],
    );
    (source_ref, target_ref)
}

/// A request skeleton with sane defaults; tests override what they need.
pub fn request(source: &LayerRef) -> FilterRequest {
    FilterRequest {
        source_layer: source.clone(),
        source_expression: String::new(),
        target_layers: Vec::new(),
        predicates: Vec::new(),
        buffer: 0.0,
        use_source_centroid: false,
        use_target_centroid: false,
        combine: CombineOp::Replace,
        previous: HashMap::new(),
        crs_policy: CrsPolicy::Auto,
    }
}

/// A spatial request against one target.
pub fn spatial_request(
    source: &LayerRef,
    target: &LayerRef,
    predicates: &[Predicate],
    buffer: f64,
) -> FilterRequest {
    let mut r = request(source);
    r.target_layers = vec![target.clone()];
    r.predicates = predicates.to_vec();
    r.buffer = buffer;
    r
}

/// Fresh engine over a fresh host.
pub fn engine() -> (Arc<MemoryHost>, Core) {
    let host = Arc::new(MemoryHost::new());
    let core = Core::new(host.clone(), Config::default());
    (host, core)
}

/// Shorthand for a fid set literal.
pub fn fids(ids: &[i64]) -> FidSet {
    ids.iter().copied().collect()
}
