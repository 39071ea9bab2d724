// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Spatialite backend: the source probe lives in a temporary table with an
//! R-tree index; target filters are subset strings the host layer consumes,
//! never rewrites of the underlying tables. GeoPackage layers are read
//! through the `GeomFromGPB` conversion.
//!

use crate::{
    backend::{
        Artifact, BackendKind, FilterPort, PreparedSource, Session, SourceProbe,
    },
    error::FilterError,
    layer::{GeomEncoding, LayerDescriptor},
    predicate::Predicate,
    state::FilterPayload,
    task::TaskContext,
    translate::quote_ident,
};
use async_trait::async_trait;
use sqlx::{AssertSqlSafe, FromRow, Pool, Sqlite, pool::PoolOptions, sqlite::SqliteConnectOptions};
use std::str::FromStr;
use tracing::{debug, error, info, warn};

// structure to read back a textual PRAGMA value.
#[derive(Debug, FromRow)]
struct Pragma(String);

#[derive(Debug, FromRow)]
struct Count(i64);

/// The Spatialite backend state: one reusable single-writer connection pool
/// per database file, plus the session owning the probe temp tables.
#[derive(Debug)]
pub struct SpatialiteBackend {
    uri: Option<String>,
    pool: Option<Pool<Sqlite>>,
    session: Session,
}

impl Default for SpatialiteBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SpatialiteBackend {
    /// A backend with no open session yet.
    pub fn new() -> Self {
        Self {
            uri: None,
            pool: None,
            session: Session::new(BackendKind::Spatialite),
        }
    }

    fn pool(&self) -> Result<&Pool<Sqlite>, FilterError> {
        self.pool.as_ref().ok_or(FilterError::BackendUnavailable {
            backend: BackendKind::Spatialite,
            reason: "no open session".into(),
        })
    }

    fn query_failed(e: sqlx::Error) -> FilterError {
        FilterError::BackendQueryFailed {
            backend: BackendKind::Spatialite,
            detail: e.to_string(),
        }
    }

    fn table_name(&self, short_hash: &str) -> String {
        format!("fm_src_{short_hash}")
    }

    async fn execute(&self, sql: String) -> Result<(), FilterError> {
        debug!("-- sql = {sql}");
        let safe_sql = AssertSqlSafe(sql);
        sqlx::query(safe_sql)
            .execute(self.pool()?)
            .await
            .map_err(Self::query_failed)?;
        Ok(())
    }
}

/// DDL for the one-row probe temp table.
pub(crate) fn temp_ddl(table: &str, wkt: &str, srid: i32) -> String {
    format!(
        "CREATE TEMP TABLE {} AS SELECT 1 AS probe_id, GeomFromText('{wkt}', {srid}) AS geom;",
        quote_ident(table)
    )
}

/// The geometry expression reading one target row, honouring the provider's
/// blob encoding and the centroid flag.
pub(crate) fn target_geom_expr(target: &LayerDescriptor, use_target_centroid: bool) -> String {
    let raw = format!(
        "{}.{}",
        quote_ident(&target.table_name),
        quote_ident(&target.geometry_column)
    );
    let decoded = match target.encoding {
        GeomEncoding::GeoPackage => format!("GeomFromGPB({raw})"),
        GeomEncoding::Native => raw,
    };
    if use_target_centroid {
        format!("PointOnSurface({decoded})")
    } else {
        decoded
    }
}

/// Build the target subset string: `EXISTS` against the probe temp table
/// with an MBR pre-filter, predicates OR-combined. A probe in another CRS
/// is wrapped with `Transform` to the target's SRID.
pub(crate) fn build_subset(
    target: &LayerDescriptor,
    table: &str,
    predicates: &[Predicate],
    probe_srid: i32,
    distance: f64,
    use_target_centroid: bool,
) -> Result<String, FilterError> {
    let geom = target_geom_expr(target, use_target_centroid);
    let decoded = target_geom_expr(target, false);
    let src = if target.srid > 0 && probe_srid > 0 && target.srid != probe_srid {
        format!("Transform(src.geom, {})", target.srid)
    } else {
        "src.geom".to_owned()
    };
    let mut parts = Vec::with_capacity(predicates.len());
    for p in predicates {
        parts.push(p.to_sql(BackendKind::Spatialite, &geom, &src, distance)?);
    }
    Ok(format!(
        "EXISTS (SELECT 1 FROM {} src WHERE MbrIntersects({decoded}, {src}) AND ({}))",
        quote_ident(table),
        parts.join(" OR ")
    ))
}

#[async_trait]
impl FilterPort for SpatialiteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Spatialite
    }

    async fn open_session(&mut self, uri: &str) -> Result<(), FilterError> {
        if self.pool.is_some() && self.uri.as_deref() == Some(uri) {
            return Ok(());
        }
        // IMPORTANT - loading an extension is UNSAFE but there is no other
        // way in: Spatialite and GeoPackage handling is a no go w/o
        // `mod_spatialite`...
        let pool_opts = unsafe {
            SqliteConnectOptions::from_str(uri)
                .map_err(|e| FilterError::BackendUnavailable {
                    backend: BackendKind::Spatialite,
                    reason: e.to_string(),
                })?
                .extension("mod_spatialite")
        };
        let pool = PoolOptions::new()
            .max_connections(1)
            .connect_with(pool_opts)
            .await
            .map_err(|e| FilterError::BackendUnavailable {
                backend: BackendKind::Spatialite,
                reason: e.to_string(),
            })?;

        // ensure the extension actually answers...
        let pragma = sqlx::query_as::<_, Pragma>("SELECT spatialite_version();")
            .fetch_one(&pool)
            .await
            .map_err(|e| FilterError::BackendUnavailable {
                backend: BackendKind::Spatialite,
                reason: format!("spatialite probe failed: {e}"),
            })?;
        info!("spatialite version = {}", pragma.0);

        self.uri = Some(uri.to_owned());
        self.pool = Some(pool);
        Ok(())
    }

    async fn prepare_source(
        &mut self,
        probe: &SourceProbe,
        _ctx: &TaskContext,
    ) -> Result<PreparedSource, FilterError> {
        let table = self.table_name(&probe.short_hash);
        let artifact = Artifact::TempTable(table.clone());
        let created = if self.session.owns(&artifact) {
            false
        } else {
            self.execute(temp_ddl(&table, &probe.wkt, probe.srid)).await?;
            // an R-tree over a temp table is best effort; some builds
            // refuse, and the MBR pre-filter still applies...
            let index_sql = format!("SELECT CreateSpatialIndex('{table}', 'geom');");
            if let Err(e) = self.execute(index_sql).await {
                warn!("no R-tree for {table}: {e}");
            }
            self.session.adopt(artifact);
            true
        };
        Ok(PreparedSource {
            probe: probe.clone(),
            artifact: Some(table),
            created,
        })
    }

    async fn apply_filter(
        &mut self,
        target: &LayerDescriptor,
        prepared: &PreparedSource,
        predicates: &[Predicate],
        use_target_centroid: bool,
        _ctx: &TaskContext,
    ) -> Result<FilterPayload, FilterError> {
        let table = prepared
            .artifact
            .as_deref()
            .ok_or(FilterError::Runtime("prepared source has no table".into()))?;
        let subset = build_subset(
            target,
            table,
            predicates,
            prepared.probe.srid,
            prepared.probe.buffer,
            use_target_centroid,
        )?;
        Ok(FilterPayload::SubsetString(subset))
    }

    async fn count_features(
        &self,
        target: &LayerDescriptor,
        subset: &str,
    ) -> Result<u64, FilterError> {
        let sql = format!(
            "SELECT count(*) FROM {} WHERE {subset};",
            quote_ident(&target.table_name)
        );
        debug!("-- sql = {sql}");
        let safe_sql = AssertSqlSafe(sql);
        let row = sqlx::query_as::<_, Count>(safe_sql)
            .fetch_one(self.pool()?)
            .await
            .map_err(Self::query_failed)?;
        Ok(row.0.max(0) as u64)
    }

    async fn cleanup(&mut self) -> Result<(), FilterError> {
        let artifacts = self.session.drain_lifo();
        if let Ok(pool) = self.pool() {
            let pool = pool.clone();
            for artifact in artifacts {
                let sql = match &artifact {
                    Artifact::TempTable(t) => {
                        format!("DROP TABLE IF EXISTS {};", quote_ident(t))
                    }
                    Artifact::MaterialisedView(v) => {
                        format!("DROP VIEW IF EXISTS {};", quote_ident(v))
                    }
                };
                debug!("-- sql = {sql}");
                let safe_sql = AssertSqlSafe(sql);
                if let Err(e) = sqlx::query(safe_sql).execute(&pool).await {
                    error!("failed dropping {artifact}: {e}");
                }
            }
        }
        // release the extension handle with the pool...
        self.pool = None;
        self.uri = None;
        Ok(())
    }

    fn artifact_count(&self) -> usize {
        self.session.artifact_count()
    }
}

impl SpatialiteBackend {
    /// Roll back the temp table created for a probe (cancellation path).
    pub async fn drop_probe(&mut self, prepared: &PreparedSource) -> Result<(), FilterError> {
        if let Some(table) = prepared.artifact.as_deref() {
            let artifact = Artifact::TempTable(table.to_owned());
            if self.session.owns(&artifact) {
                self.execute(format!("DROP TABLE IF EXISTS {};", quote_ident(table)))
                    .await?;
                self.session.disown(&artifact);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{Column, ColumnType, LayerKind, LayerRef};

    fn target(encoding: GeomEncoding) -> LayerDescriptor {
        LayerDescriptor {
            layer: LayerRef::from("parcels"),
            kind: LayerKind::Spatialite,
            provider_uri: "sqlite:///data/parcels.gpkg".into(),
            table_name: "parcels".into(),
            geometry_column: "geom".into(),
            srid: 3857,
            geometry_type: "Polygon".into(),
            encoding,
            declared_primary_key: Some("fid".into()),
            host_row_id: None,
            feature_count_hint: None,
            columns: vec![Column::new("owner", ColumnType::Text)],
        }
    }

    #[test]
    fn test_temp_ddl() {
        assert_eq!(
            temp_ddl("fm_src_ab12cd34", "POINT (1 2)", 3857),
            "CREATE TEMP TABLE \"fm_src_ab12cd34\" AS \
             SELECT 1 AS probe_id, GeomFromText('POINT (1 2)', 3857) AS geom;"
        );
    }

    #[test]
    fn test_subset_native_encoding() {
        let subset = build_subset(
            &target(GeomEncoding::Native),
            "fm_src_x",
            &[Predicate::Touches],
            3857,
            0.0,
            false,
        )
        .unwrap();
        assert_eq!(
            subset,
            "EXISTS (SELECT 1 FROM \"fm_src_x\" src WHERE \
             MbrIntersects(\"parcels\".\"geom\", src.geom) AND \
             (Touches(\"parcels\".\"geom\", src.geom)))"
        );
    }

    #[test]
    fn test_subset_geopackage_encoding() {
        let subset = build_subset(
            &target(GeomEncoding::GeoPackage),
            "fm_src_x",
            &[Predicate::Intersects],
            3857,
            0.0,
            false,
        )
        .unwrap();
        assert!(subset.contains("Intersects(GeomFromGPB(\"parcels\".\"geom\"), src.geom)"));
        assert!(subset.contains("MbrIntersects(GeomFromGPB(\"parcels\".\"geom\"), src.geom)"));
    }

    #[test]
    fn test_subset_centroid_dwithin() {
        let subset = build_subset(
            &target(GeomEncoding::Native),
            "fm_src_x",
            &[Predicate::DWithin],
            3857,
            100.0,
            true,
        )
        .unwrap();
        assert!(subset.contains(
            "PtDistWithin(PointOnSurface(\"parcels\".\"geom\"), src.geom, 100)"
        ));
    }

    #[test]
    fn test_covers_rejected() {
        let err = build_subset(
            &target(GeomEncoding::Native),
            "fm_src_x",
            &[Predicate::Covers],
            3857,
            0.0,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, FilterError::PredicateNotSupported(_)));
    }
}
