// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Coordinate Reference System (CRS) handling. Codes are assumed to be under
//! the "EPSG" Authority.
//!

use crate::error::FilterError;
use core::fmt;
use proj::Proj;
use tracing::debug;

/// SRID of the planar CRS used when a geographic source geometry must be
/// normalised to metric units (web-mercator-equivalent).
pub const METRIC_SRID: i32 = 3857;

/// The ubiquitous `EPSG:4326` / WGS'84 SRID.
pub const WGS84_SRID: i32 = 4326;

/// What the pipeline needs to know about a layer's CRS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrsInfo {
    /// EPSG code, e.g. `4326`. `0` and `-1` are the GeoPackage "undefined"
    /// indicators.
    pub srid: i32,
    /// Authority-qualified identifier, e.g. `EPSG:4326`.
    pub auth: String,
    /// TRUE when coordinates are degrees rather than linear units.
    pub is_geographic: bool,
}

impl fmt::Display for CrsInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.srid {
            -1 => write!(f, "Undefined (Cartesian)"),
            0 => write!(f, "Undefined (geographic)"),
            _ => write!(f, "{}", self.auth),
        }
    }
}

impl CrsInfo {
    /// Construct from a bare EPSG code, validating it against Proj.
    ///
    /// `-1` and `0` are accepted as the GeoPackage undefined-Cartesian and
    /// undefined-geographic indicators and bypass Proj validation.
    pub fn from_srid(srid: i32) -> Result<Self, FilterError> {
        match srid {
            -1 | 0 => Ok(Self {
                srid,
                auth: String::new(),
                is_geographic: srid == 0,
            }),
            x => {
                let auth = format!("EPSG:{x}");
                // raise an error if Proj cannot handle it...
                let _ = Proj::new(&auth)?;
                Ok(Self {
                    srid: x,
                    auth,
                    is_geographic: is_geographic_epsg(x),
                })
            }
        }
    }

    /// The metric normalisation target.
    pub fn metric() -> Self {
        Self {
            srid: METRIC_SRID,
            auth: format!("EPSG:{METRIC_SRID}"),
            is_geographic: false,
        }
    }
}

/// EPSG reserves the 4001-4999 band for geographic 2D systems; everything
/// this library is asked to normalise in practice (4326, 4258, 4269, ...)
/// falls in it.
fn is_geographic_epsg(code: i32) -> bool {
    (4001..=4999).contains(&code)
}

/// A reusable coordinate transformer between two EPSG codes.
///
/// Wraps [`Proj::new_known_crs`] which normalises axis order to (x, y) /
/// (east, north) for both ends of the pipeline.
pub struct Reprojector {
    from: i32,
    to: i32,
    inner: Proj,
}

impl fmt::Debug for Reprojector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reprojector")
            .field("from", &self.from)
            .field("to", &self.to)
            .finish()
    }
}

impl Reprojector {
    /// Build a transformer from one EPSG code to another.
    pub fn new(from: i32, to: i32) -> Result<Self, FilterError> {
        let inner = Proj::new_known_crs(&format!("EPSG:{from}"), &format!("EPSG:{to}"), None)?;
        debug!("Reprojector EPSG:{from} -> EPSG:{to}");
        Ok(Self { from, to, inner })
    }

    /// Transform a single (x, y) coordinate pair.
    pub fn convert(&self, x: f64, y: f64) -> Result<(f64, f64), FilterError> {
        let out = self.inner.convert((x, y))?;
        Ok(out)
    }

    /// Source EPSG code.
    pub fn from_srid(&self) -> i32 {
        self.from
    }

    /// Destination EPSG code.
    pub fn to_srid(&self) -> i32 {
        self.to
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_wgs84_is_geographic() {
        let info = CrsInfo::from_srid(WGS84_SRID).unwrap();
        assert!(info.is_geographic);
        assert_eq!(info.auth, "EPSG:4326");
    }

    #[test]
    fn test_metric_is_not_geographic() {
        let info = CrsInfo::from_srid(METRIC_SRID).unwrap();
        assert!(!info.is_geographic);
    }

    #[test]
    fn test_undefined_srids() {
        assert!(CrsInfo::from_srid(0).unwrap().is_geographic);
        assert!(!CrsInfo::from_srid(-1).unwrap().is_geographic);
    }

    #[test]
    fn test_convert_4326_to_3857() {
        let t = Reprojector::new(WGS84_SRID, METRIC_SRID).unwrap();
        // Greenwich meridian at the equator maps to the web-mercator origin.
        let (x, y) = t.convert(0.0, 0.0).unwrap();
        assert_relative_eq!(x, 0.0, epsilon = 1e-6);
        assert_relative_eq!(y, 0.0, epsilon = 1e-6);
        // one degree of longitude is ~111.3 km at the equator.
        let (x, _) = t.convert(1.0, 0.0).unwrap();
        assert_relative_eq!(x, 111_319.49, epsilon = 1.0);
    }
}
