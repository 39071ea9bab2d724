// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Geometry utilities used when shaping the source probe geometry: validity
//! repair, buffering, interior points, simplification, CRS normalisation and
//! canonical WKT encoding.
//!
//! Every function here is pure: inputs are never mutated and structurally
//! valid input never fails. Unrepairable geometry yields an *empty* geometry
//! rather than an error.
//!

use crate::{
    config::{BufferEndcap, CentroidMode, CrsPolicy},
    crs::{CrsInfo, METRIC_SRID, Reprojector},
    error::FilterError,
};
use geos::{CapStyle, CoordSeq, Geom, Geometry, GeometryTypes, JoinStyle};
use tracing::debug;

/// Coordinate precision (fractional decimal digits) used for canonical WKT
/// of metric geometries.
pub const METRIC_PRECISION: u32 = 6;
/// Likewise for geographic (degree-unit) geometries.
pub const GEOGRAPHIC_PRECISION: u32 = 7;

// quadrant segments used for all buffer approximations.
const BUFFER_QUADSEGS: i32 = 8;

/// The canonical empty geometry returned when repair or buffering collapses
/// the input to nothing.
pub fn empty() -> Result<Geometry, FilterError> {
    let g = Geometry::new_from_wkt("POLYGON EMPTY")?;
    Ok(g)
}

/// Attempt to make a geometry valid. Tries, in order: a validity repair, a
/// zero-buffer cleanup, and a polygonal extraction from geometry-collection
/// results. Returns an empty geometry if nothing succeeds.
///
/// Idempotent: `repair(repair(g))` equals `repair(g)`.
pub fn repair(g: &Geometry) -> Result<Geometry, FilterError> {
    if g.is_valid() {
        return Ok(g.clone());
    }
    // first try GEOS validity repair...
    if let Ok(fixed) = g.make_valid() {
        if let Some(ok) = polygonal_or_valid(&fixed)? {
            return Ok(ok);
        }
    }
    // then the zero-buffer trick, which drops lower-dimension fragments...
    if let Ok(fixed) = g.buffer(0.0, BUFFER_QUADSEGS) {
        if fixed.is_valid() && !fixed.is_empty()? {
            return Ok(fixed);
        }
    }
    debug!("geometry not repairable; collapsing to empty");
    empty()
}

// A make_valid() result may be a GEOMETRYCOLLECTION carrying point/line
// fragments next to the polygonal parts we care about. Keep the polygonal
// members only; `None` when nothing usable remains.
fn polygonal_or_valid(g: &Geometry) -> Result<Option<Geometry>, FilterError> {
    if g.is_empty()? {
        return Ok(None);
    }
    match g.geometry_type() {
        GeometryTypes::GeometryCollection => {
            let n = g.get_num_geometries()?;
            let mut parts = Vec::with_capacity(n);
            for ndx in 0..n {
                let part = g.get_geometry_n(ndx)?;
                if matches!(
                    part.geometry_type(),
                    GeometryTypes::Polygon | GeometryTypes::MultiPolygon
                ) {
                    parts.push(Geometry::new_from_wkt(&part.to_wkt()?)?);
                }
            }
            if parts.is_empty() {
                Ok(None)
            } else {
                let merged = Geometry::create_geometry_collection(parts)?.unary_union()?;
                Ok(Some(merged))
            }
        }
        _ if g.is_valid() => Ok(Some(g.clone())),
        _ => Ok(None),
    }
}

/// Morphological dilation (positive) or erosion (negative) of a geometry.
/// A zero distance is the identity. An eroded-to-nothing result comes back
/// as an empty geometry, never an error.
pub fn buffer(g: &Geometry, distance: f64, endcap: BufferEndcap) -> Result<Geometry, FilterError> {
    if distance == 0.0 {
        return Ok(g.clone());
    }
    let cap = match endcap {
        BufferEndcap::Round => CapStyle::Round,
        BufferEndcap::Flat => CapStyle::Flat,
        BufferEndcap::Square => CapStyle::Square,
    };
    let out = g.buffer_with_style(distance, BUFFER_QUADSEGS, cap, JoinStyle::Round, 5.0)?;
    if out.is_empty()? {
        return empty();
    }
    Ok(out)
}

/// Compute an interior point for a geometry.
///
/// `PointOnSurface` guarantees the point lies on the geometry even for
/// non-convex polygons; `Centroid` is the geometric mean; `Auto` picks
/// point-on-surface for areal geometries and the centroid otherwise.
pub fn interior_point(g: &Geometry, mode: CentroidMode) -> Result<Geometry, FilterError> {
    let pt = match mode {
        CentroidMode::PointOnSurface => g.point_on_surface()?,
        CentroidMode::Centroid => g.get_centroid()?,
        CentroidMode::Auto => {
            if matches!(
                g.geometry_type(),
                GeometryTypes::Polygon | GeometryTypes::MultiPolygon
            ) {
                g.point_on_surface()?
            } else {
                g.get_centroid()?
            }
        }
    };
    Ok(pt)
}

/// Simplify a geometry ahead of an expensive buffer, with a tolerance
/// adapted to the buffer distance: `clamp(|distance| * 0.1, 0.5, 10.0)` in
/// metric units. A zero buffer distance skips simplification entirely.
pub fn simplify_before_buffer(
    g: &Geometry,
    buffer_distance: f64,
) -> Result<Geometry, FilterError> {
    if buffer_distance == 0.0 {
        return Ok(g.clone());
    }
    let tolerance = (buffer_distance.abs() * 0.1).clamp(0.5, 10.0);
    let out = g.topology_preserve_simplify(tolerance)?;
    Ok(out)
}

/// Reproject a geographic geometry to the metric normalisation target
/// (EPSG:3857) unless the policy forbids it. Metric input is returned
/// unchanged (as a fresh value). The input geometry is never mutated.
pub fn ensure_metric(
    g: &Geometry,
    from: &CrsInfo,
    policy: CrsPolicy,
) -> Result<(Geometry, CrsInfo), FilterError> {
    let must_reproject = match policy {
        CrsPolicy::AsIs => false,
        CrsPolicy::Auto => from.is_geographic,
        CrsPolicy::ForceMetric => from.srid != METRIC_SRID,
    };
    if !must_reproject || from.srid <= 0 {
        return Ok((g.clone(), from.clone()));
    }
    let re = Reprojector::new(from.srid, METRIC_SRID)?;
    let out = transform(g, &re)?;
    Ok((out, CrsInfo::metric()))
}

/// Rebuild a geometry with every vertex pushed through a [`Reprojector`].
pub fn transform(g: &Geometry, re: &Reprojector) -> Result<Geometry, FilterError> {
    transform_impl(g, re)
}

fn transform_impl<T: Geom>(g: &T, re: &Reprojector) -> Result<Geometry, FilterError> {
    match g.geometry_type() {
        GeometryTypes::Point => {
            let cs = transform_coords(g, re)?;
            Ok(Geometry::create_point(cs)?)
        }
        GeometryTypes::LineString => {
            let cs = transform_coords(g, re)?;
            Ok(Geometry::create_line_string(cs)?)
        }
        GeometryTypes::LinearRing => {
            let cs = transform_coords(g, re)?;
            Ok(Geometry::create_linear_ring(cs)?)
        }
        GeometryTypes::Polygon => {
            let outer = g.get_exterior_ring()?;
            let exterior = Geometry::create_linear_ring(transform_coords(&outer, re)?)?;
            let num_inners = g.get_num_interior_rings()?;
            let mut interiors = Vec::with_capacity(num_inners);
            for ndx in 0..num_inners {
                let inner = g.get_interior_ring_n(ndx)?;
                interiors.push(Geometry::create_linear_ring(transform_coords(&inner, re)?)?);
            }
            Ok(Geometry::create_polygon(exterior, interiors)?)
        }
        GeometryTypes::MultiPoint
        | GeometryTypes::MultiLineString
        | GeometryTypes::MultiPolygon
        | GeometryTypes::GeometryCollection => {
            let n = g.get_num_geometries()?;
            let mut parts = Vec::with_capacity(n);
            for ndx in 0..n {
                let part = g.get_geometry_n(ndx)?;
                parts.push(transform_impl(&part, re)?);
            }
            match g.geometry_type() {
                GeometryTypes::MultiPoint => Ok(Geometry::create_multipoint(parts)?),
                GeometryTypes::MultiLineString => Ok(Geometry::create_multiline_string(parts)?),
                GeometryTypes::MultiPolygon => Ok(Geometry::create_multipolygon(parts)?),
                _ => Ok(Geometry::create_geometry_collection(parts)?),
            }
        }
        x => Err(FilterError::Runtime(
            format!("Cannot transform ({x:?}) geometry").into(),
        )),
    }
}

fn transform_coords<T: Geom>(g: &T, re: &Reprojector) -> Result<CoordSeq, FilterError> {
    let cs = g.get_coord_seq()?;
    let num_vertices = cs.size()?;
    let mut xy: Vec<Vec<f64>> = Vec::with_capacity(num_vertices);
    for ndx in 0..num_vertices {
        let (x, y) = re.convert(cs.get_x(ndx)?, cs.get_y(ndx)?)?;
        xy.push(vec![x, y]);
    }
    let out = CoordSeq::new_from_vec(&xy)?;
    Ok(out)
}

/// WKT encoding with fixed coordinate precision for stable fingerprinting:
/// 6 decimals for metric units, 7 for geographic degrees.
pub fn canonical_wkt(g: &Geometry, crs: &CrsInfo) -> Result<String, FilterError> {
    let precision = if crs.is_geographic {
        GEOGRAPHIC_PRECISION
    } else {
        METRIC_PRECISION
    };
    let wkt = g.to_wkt_precision(precision)?;
    Ok(wkt)
}

/// Union a set of geometries into a single probe geometry. An empty input
/// set yields an empty geometry.
pub fn union_all(geoms: Vec<Geometry>) -> Result<Geometry, FilterError> {
    if geoms.is_empty() {
        return empty();
    }
    let collected = Geometry::create_geometry_collection(geoms)?;
    let merged = collected.unary_union()?;
    Ok(merged)
}

/// Axis-aligned bounding box of a geometry: `(min_x, min_y, max_x, max_y)`.
pub fn bounds(g: &Geometry) -> Result<(f64, f64, f64, f64), FilterError> {
    Ok((
        g.get_x_min()?,
        g.get_y_min()?,
        g.get_x_max()?,
        g.get_y_max()?,
    ))
}

/// TRUE when the two geometries lie within `distance` of each other.
pub fn within_distance(a: &Geometry, b: &Geometry, distance: f64) -> Result<bool, FilterError> {
    let d = a.distance(b)?;
    Ok(d <= distance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crate::crs::WGS84_SRID;

    fn poly(wkt: &str) -> Geometry {
        Geometry::new_from_wkt(wkt).unwrap()
    }

    #[test]
    fn test_repair_keeps_valid_input() {
        let g = poly("POLYGON ((0 0, 10 0, 10 10, 0 10, 0 0))");
        let fixed = repair(&g).unwrap();
        assert!(fixed.equals(&g).unwrap());
        // input not mutated...
        assert!(g.is_valid());
    }

    #[test]
    fn test_repair_bowtie() {
        // self-intersecting "bowtie" polygon...
        let g = poly("POLYGON ((0 0, 10 10, 10 0, 0 10, 0 0))");
        assert!(!g.is_valid());
        let fixed = repair(&g).unwrap();
        assert!(fixed.is_valid());
        assert!(!fixed.is_empty().unwrap());
        // idempotent...
        let again = repair(&fixed).unwrap();
        assert!(again.equals(&fixed).unwrap());
    }

    #[test]
    fn test_buffer_zero_is_identity() {
        let g = poly("POINT (3 4)");
        let out = buffer(&g, 0.0, BufferEndcap::Round).unwrap();
        assert!(out.equals(&g).unwrap());
    }

    #[test]
    fn test_buffer_grows_point() {
        let g = poly("POINT (0 0)");
        let out = buffer(&g, 10.0, BufferEndcap::Round).unwrap();
        assert_eq!(out.geometry_type(), GeometryTypes::Polygon);
        let a = out.area().unwrap();
        // octagon-ish approximation of a circle of r=10...
        assert!(a > 300.0 && a < 315.0, "area = {a}");
    }

    #[test]
    fn test_negative_buffer_can_empty() {
        let g = poly("POLYGON ((0 0, 4 0, 4 4, 0 4, 0 0))");
        let out = buffer(&g, -10.0, BufferEndcap::Round).unwrap();
        assert!(out.is_empty().unwrap());
    }

    #[test]
    fn test_point_on_surface_is_interior() {
        // a C-shaped polygon whose centroid falls outside it...
        let g = poly("POLYGON ((0 0, 10 0, 10 2, 2 2, 2 8, 10 8, 10 10, 0 10, 0 0))");
        let pos = interior_point(&g, CentroidMode::PointOnSurface).unwrap();
        assert!(g.contains(&pos).unwrap());
        let c = interior_point(&g, CentroidMode::Centroid).unwrap();
        assert!(!g.contains(&c).unwrap());
    }

    #[test]
    fn test_simplify_skipped_for_zero_buffer() {
        let g = poly("LINESTRING (0 0, 1 0.01, 2 0, 3 0.01, 4 0)");
        let out = simplify_before_buffer(&g, 0.0).unwrap();
        assert!(out.equals(&g).unwrap());
    }

    #[test]
    fn test_simplify_tolerance_clamped() {
        let g = poly("LINESTRING (0 0, 1 0.2, 2 0, 3 0.2, 4 0)");
        // |d| * 0.1 = 0.05 clamps up to 0.5 which flattens the wiggles...
        let out = simplify_before_buffer(&g, 0.5).unwrap();
        let n = out.get_coord_seq().unwrap().size().unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn test_ensure_metric_reprojects_wgs84() {
        let from = CrsInfo::from_srid(WGS84_SRID).unwrap();
        let g = poly("POINT (1 0)");
        let (out, crs) = ensure_metric(&g, &from, CrsPolicy::Auto).unwrap();
        assert_eq!(crs.srid, METRIC_SRID);
        assert_relative_eq!(out.get_x().unwrap(), 111_319.49, epsilon = 1.0);
        assert_relative_eq!(out.get_y().unwrap(), 0.0, epsilon = 1e-6);
        // original untouched...
        assert_relative_eq!(g.get_x().unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_ensure_metric_as_is() {
        let from = CrsInfo::from_srid(WGS84_SRID).unwrap();
        let g = poly("POINT (1 0)");
        let (out, crs) = ensure_metric(&g, &from, CrsPolicy::AsIs).unwrap();
        assert_eq!(crs.srid, WGS84_SRID);
        assert!(out.equals(&g).unwrap());
    }

    #[test]
    fn test_canonical_wkt_precision() {
        let metric = CrsInfo::from_srid(METRIC_SRID).unwrap();
        let g = poly("POINT (1.23456789 2.98765432)");
        let wkt = canonical_wkt(&g, &metric).unwrap();
        assert_eq!(wkt, "POINT (1.234568 2.987654)");
        let geographic = CrsInfo::from_srid(WGS84_SRID).unwrap();
        let wkt = canonical_wkt(&g, &geographic).unwrap();
        assert_eq!(wkt, "POINT (1.2345679 2.9876543)");
    }

    #[test]
    fn test_union_all() {
        let a = poly("POLYGON ((0 0, 2 0, 2 2, 0 2, 0 0))");
        let b = poly("POLYGON ((1 1, 3 1, 3 3, 1 3, 1 1))");
        let u = union_all(vec![a, b]).unwrap();
        assert_relative_eq!(u.area().unwrap(), 7.0, epsilon = 1e-9);
        assert!(union_all(vec![]).unwrap().is_empty().unwrap());
    }

    #[test]
    fn test_bounds() {
        let g = poly("LINESTRING (1 2, 5 8)");
        let (x0, y0, x1, y1) = bounds(&g).unwrap();
        assert_relative_eq!(x0, 1.0);
        assert_relative_eq!(y0, 2.0);
        assert_relative_eq!(x1, 5.0);
        assert_relative_eq!(y1, 8.0);
    }

    #[test]
    fn test_within_distance() {
        let a = poly("POINT (0 0)");
        let b = poly("POINT (3 4)");
        assert!(within_distance(&a, &b, 5.0).unwrap());
        assert!(!within_distance(&a, &b, 4.9).unwrap());
    }
}
