// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Layer references and descriptors. A [`LayerRef`] is a stable opaque
//! identifier handed out by the host; the [`LayerDescriptor`] is everything
//! the pipeline must resolve about it before the layer may participate in
//! filtering.
//!

use crate::error::FilterError;
use core::fmt;
use serde::{Deserialize, Serialize};

/// Stable opaque identifier of a vector dataset, borrowed from the host.
/// Possibly invalid at any moment; revalidate before issuing I/O.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerRef(String);

impl LayerRef {
    /// Wrap a host layer id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw host id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LayerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for LayerRef {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Which data-source family backs a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerKind {
    /// PostgreSQL + PostGIS table.
    Postgres,
    /// SQLite/Spatialite database, including GeoPackage files.
    Spatialite,
    /// Anything else reachable through the host's vector abstraction.
    Ogr,
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerKind::Postgres => write!(f, "postgresql"),
            LayerKind::Spatialite => write!(f, "spatialite"),
            LayerKind::Ogr => write!(f, "ogr"),
        }
    }
}

/// How the provider stores geometry blobs; decides whether subset strings
/// must wrap the geometry column in `GeomFromGPB(...)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeomEncoding {
    /// Provider-native geometry (PostGIS geometry, Spatialite BLOB).
    Native,
    /// GeoPackage binary, needing `GeomFromGPB` conversion in SQL.
    GeoPackage,
}

/// Attribute column type as reported by the provider. Used for identifier
/// validation and the textual-vs-numeric cast heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    /// Character data.
    Text,
    /// Whole numbers.
    Integer,
    /// Floating-point numbers.
    Real,
    /// Booleans.
    Boolean,
    /// Calendar dates.
    Date,
    /// Timestamps.
    Timestamp,
}

impl ColumnType {
    /// TRUE for the numeric families.
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Real)
    }
}

/// One attribute column of a layer schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name as the provider reports it.
    pub name: String,
    /// Provider-reported type.
    pub ty: ColumnType,
    /// TRUE when the provider fills the column automatically with
    /// monotonically increasing integers.
    pub auto_increment: bool,
}

impl Column {
    /// Convenience constructor for plain columns.
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            auto_increment: false,
        }
    }
}

/// Everything the pipeline needs to know about a layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerDescriptor {
    /// Host identity of the layer.
    pub layer: LayerRef,
    /// Backing data-source family.
    pub kind: LayerKind,
    /// Provider URI for backend reconnection; opaque above the backends.
    pub provider_uri: String,
    /// Name of the backing table or OGR layer inside the provider.
    pub table_name: String,
    /// Geometry column name; empty when unresolvable.
    pub geometry_column: String,
    /// Declared SRID; `0` when unresolvable.
    pub srid: i32,
    /// Provider geometry type, e.g. `Point`, `MultiPolygon`.
    pub geometry_type: String,
    /// Geometry blob encoding.
    pub encoding: GeomEncoding,
    /// Primary key declared by the provider, if any.
    pub declared_primary_key: Option<String>,
    /// Row identifier exposed by the host API, if any.
    pub host_row_id: Option<String>,
    /// Advisory feature count; may be stale.
    pub feature_count_hint: Option<u64>,
    /// Attribute schema.
    pub columns: Vec<Column>,
}

// Conventional auto-increment PK names probed when the provider declares none.
const IMPLICIT_PK_NAMES: [&str; 3] = ["fid", "ogc_fid", "id"];

impl LayerDescriptor {
    /// Look a column up by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Resolve the canonical primary key for filtering:
    /// the provider's declared PK first, else an auto-incrementing integer
    /// column conventionally named `fid`/`ogc_fid`/`id`, else the host row
    /// identifier. `None` means the layer is not filterable.
    pub fn primary_key(&self) -> Option<&str> {
        if let Some(pk) = self.declared_primary_key.as_deref() {
            return Some(pk);
        }
        for candidate in IMPLICIT_PK_NAMES {
            if let Some(col) = self.column(candidate) {
                if col.ty == ColumnType::Integer && col.auto_increment {
                    return Some(&col.name);
                }
            }
        }
        self.host_row_id.as_deref()
    }

    /// Ensure the three filterability requirements hold: geometry column,
    /// SRID and primary key. Returns the resolved primary key.
    pub fn require_filterable(&self) -> Result<&str, FilterError> {
        if self.geometry_column.is_empty() {
            return Err(FilterError::LayerNotFilterable {
                layer: self.layer.clone(),
                reason: "no geometry column".into(),
            });
        }
        if self.srid == 0 && self.kind != LayerKind::Ogr {
            return Err(FilterError::LayerNotFilterable {
                layer: self.layer.clone(),
                reason: "no SRID".into(),
            });
        }
        match self.primary_key() {
            Some(pk) => Ok(pk),
            None => Err(FilterError::LayerNotFilterable {
                layer: self.layer.clone(),
                reason: "no resolvable primary key".into(),
            }),
        }
    }
}
