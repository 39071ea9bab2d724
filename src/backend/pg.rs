// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! PostgreSQL/PostGIS backend: the source probe lives in a session-scoped
//! materialised view with a GIST index; target filters are subset strings
//! joining against it through an `EXISTS` sub-select.
//!

use crate::{
    backend::{
        Artifact, BackendKind, FilterPort, PreparedSource, Session, SourceProbe,
    },
    error::FilterError,
    layer::LayerDescriptor,
    predicate::Predicate,
    state::FilterPayload,
    task::TaskContext,
    translate::quote_ident,
};
use async_trait::async_trait;
use sqlx::{
    AssertSqlSafe, FromRow, PgPool,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use tracing::{debug, error, info};

// structure to read back a textual value.
#[derive(Debug, FromRow)]
struct Pragma(String);

// structure to read back a count.
#[derive(Debug, FromRow)]
struct Count(i64);

/// The PostgreSQL backend state: a lazily opened pool plus the session
/// owning the materialised views created for source probes.
#[derive(Debug)]
pub struct PgBackend {
    schema: String,
    uri: Option<String>,
    pool: Option<PgPool>,
    session: Session,
}

impl PgBackend {
    /// A backend creating materialised views inside `schema`.
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            uri: None,
            pool: None,
            session: Session::new(BackendKind::Postgres),
        }
    }

    fn pool(&self) -> Result<&PgPool, FilterError> {
        self.pool.as_ref().ok_or(FilterError::BackendUnavailable {
            backend: BackendKind::Postgres,
            reason: "no open session".into(),
        })
    }

    fn query_failed(e: sqlx::Error) -> FilterError {
        FilterError::BackendQueryFailed {
            backend: BackendKind::Postgres,
            detail: e.to_string(),
        }
    }

    // `"schema"."fm_src_{session}_{short}"`.
    fn view_name(&self, short_hash: &str) -> String {
        format!(
            "{}.{}",
            quote_ident(&self.schema),
            quote_ident(&format!("fm_src_{}_{}", self.session.id(), short_hash))
        )
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

/// DDL for the one-row probe view.
pub(crate) fn mv_ddl(qualified_view: &str, wkt: &str, srid: i32) -> String {
    format!(
        "CREATE MATERIALIZED VIEW {qualified_view} AS \
         SELECT 1 AS probe_id, ST_GeomFromText('{wkt}', {srid}) AS geom;"
    )
}

/// DDL for the GIST index backing the probe view.
pub(crate) fn gist_ddl(qualified_view: &str, index_name: &str) -> String {
    format!("CREATE INDEX {} ON {qualified_view} USING GIST (geom);", quote_ident(index_name))
}

/// Build the target subset string: an `EXISTS` join against the probe view,
/// bounding-box pre-filter first so the planner reaches for the indexes.
/// Multiple predicates are OR-combined; a probe in another CRS is wrapped
/// with `ST_Transform` to the target's SRID.
pub(crate) fn build_subset(
    target: &LayerDescriptor,
    qualified_view: &str,
    predicates: &[Predicate],
    probe_srid: i32,
    distance: f64,
    use_target_centroid: bool,
) -> Result<String, FilterError> {
    let raw = format!(
        "{}.{}",
        quote_ident(&target.table_name),
        quote_ident(&target.geometry_column)
    );
    let target_geom = if use_target_centroid {
        format!("ST_PointOnSurface({raw})")
    } else {
        raw.clone()
    };
    let src = if target.srid > 0 && probe_srid > 0 && target.srid != probe_srid {
        format!("ST_Transform(src.geom, {})", target.srid)
    } else {
        "src.geom".to_owned()
    };
    let mut parts = Vec::with_capacity(predicates.len());
    for p in predicates {
        parts.push(p.to_sql(BackendKind::Postgres, &target_geom, &src, distance)?);
    }
    Ok(format!(
        "EXISTS (SELECT 1 FROM {qualified_view} src WHERE {raw} && ST_Envelope({src}) AND ({}))",
        parts.join(" OR ")
    ))
}

#[async_trait]
impl FilterPort for PgBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    async fn open_session(&mut self, uri: &str) -> Result<(), FilterError> {
        if self.pool.is_some() && self.uri.as_deref() == Some(uri) {
            return Ok(());
        }
        let pool_opts = uri
            .parse::<PgConnectOptions>()
            .map_err(|e| FilterError::BackendUnavailable {
                backend: BackendKind::Postgres,
                reason: e.to_string(),
            })?
            .application_name("geosieve");
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_with(pool_opts)
            .await
            .map_err(|e| FilterError::BackendUnavailable {
                backend: BackendKind::Postgres,
                reason: e.to_string(),
            })?;

        // ensure the DB has the PostGIS extension installed. an OK result
        // from PostGIS_Version() will suffice...
        let pragma = sqlx::query_as::<_, Pragma>("SELECT PostGIS_Version();")
            .fetch_one(&pool)
            .await
            .map_err(|e| FilterError::BackendUnavailable {
                backend: BackendKind::Postgres,
                reason: format!("PostGIS probe failed: {e}"),
            })?;
        info!("PostGIS version = {}", pragma.0);

        self.uri = Some(uri.to_owned());
        self.pool = Some(pool);
        Ok(())
    }

    async fn prepare_source(
        &mut self,
        probe: &SourceProbe,
        _ctx: &TaskContext,
    ) -> Result<PreparedSource, FilterError> {
        let view = self.view_name(&probe.short_hash);
        let artifact = Artifact::MaterialisedView(view.clone());
        let created = if self.session.owns(&artifact) {
            // same probe as a previous run in this session: refresh...
            self.execute(format!("REFRESH MATERIALIZED VIEW {view};")).await?;
            false
        } else {
            self.execute(mv_ddl(&view, &probe.wkt, probe.srid)).await?;
            let index = format!("fm_src_{}_{}_gix", self.session.id(), probe.short_hash);
            if let Err(e) = self.execute(gist_ddl(&view, &index)).await {
                // no partial artifacts on failure...
                let _ = self
                    .execute(format!("DROP MATERIALIZED VIEW IF EXISTS {view};"))
                    .await;
                return Err(e);
            }
            self.session.adopt(artifact);
            true
        };
        Ok(PreparedSource {
            probe: probe.clone(),
            artifact: Some(view),
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
        let view = prepared
            .artifact
            .as_deref()
            .ok_or(FilterError::Runtime("prepared source has no view".into()))?;
        let subset = build_subset(
            target,
            view,
            predicates,
            prepared.probe.srid,
            prepared.probe.buffer,
            use_target_centroid,
        )?;
        Ok(FilterPayload::MaterialisedView {
            view: view.to_owned(),
            subset,
        })
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
        if artifacts.is_empty() {
            return Ok(());
        }
        let pool = match self.pool() {
            Ok(p) => p.clone(),
            Err(_) => return Ok(()),
        };
        for artifact in artifacts {
            let sql = match &artifact {
                Artifact::MaterialisedView(v) => {
                    format!("DROP MATERIALIZED VIEW IF EXISTS {v};")
                }
                Artifact::TempTable(t) => format!("DROP TABLE IF EXISTS {t};"),
            };
            debug!("-- sql = {sql}");
            let safe_sql = AssertSqlSafe(sql);
            if let Err(e) = sqlx::query(safe_sql).execute(&pool).await {
                // drop failures are logged and skipped; cleanup continues...
                error!("failed dropping {artifact}: {e}");
            }
        }
        Ok(())
    }

    fn artifact_count(&self) -> usize {
        self.session.artifact_count()
    }
}

impl PgBackend {
    /// Roll back the artifact created for a probe (cancellation path):
    /// drop the view and disown it.
    pub async fn drop_probe(&mut self, prepared: &PreparedSource) -> Result<(), FilterError> {
        if let Some(view) = prepared.artifact.as_deref() {
            let artifact = Artifact::MaterialisedView(view.to_owned());
            if self.session.owns(&artifact) {
                self.execute(format!("DROP MATERIALIZED VIEW IF EXISTS {view};"))
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
    use crate::layer::{Column, ColumnType, GeomEncoding, LayerKind, LayerRef};

    fn target() -> LayerDescriptor {
        LayerDescriptor {
            layer: LayerRef::from("roads"),
            kind: LayerKind::Postgres,
            provider_uri: "postgres://gis/db".into(),
            table_name: "roads".into(),
            geometry_column: "geom".into(),
            srid: 3857,
            geometry_type: "LineString".into(),
            encoding: GeomEncoding::Native,
            declared_primary_key: Some("gid".into()),
            host_row_id: None,
            feature_count_hint: None,
            columns: vec![Column::new("name", ColumnType::Text)],
        }
    }

    #[test]
    fn test_mv_ddl() {
        let ddl = mv_ddl("\"public\".\"fm_src_ab_12\"", "POINT (1 2)", 3857);
        assert_eq!(
            ddl,
            "CREATE MATERIALIZED VIEW \"public\".\"fm_src_ab_12\" AS \
             SELECT 1 AS probe_id, ST_GeomFromText('POINT (1 2)', 3857) AS geom;"
        );
    }

    #[test]
    fn test_subset_has_bbox_prefilter_and_or_combined_predicates() {
        let subset = build_subset(
            &target(),
            "\"public\".\"fm_src_x\"",
            &[Predicate::Intersects, Predicate::Touches],
            3857,
            0.0,
            false,
        )
        .unwrap();
        assert!(subset.starts_with("EXISTS (SELECT 1 FROM \"public\".\"fm_src_x\" src WHERE "));
        assert!(subset.contains("\"roads\".\"geom\" && ST_Envelope(src.geom)"));
        assert!(subset.contains(
            "ST_Intersects(\"roads\".\"geom\", src.geom) OR ST_Touches(\"roads\".\"geom\", src.geom)"
        ));
    }

    #[test]
    fn test_subset_with_centroid_and_dwithin() {
        let subset = build_subset(
            &target(),
            "\"public\".\"fm_src_x\"",
            &[Predicate::DWithin],
            3857,
            250.0,
            true,
        )
        .unwrap();
        assert!(subset.contains(
            "ST_DWithin(ST_PointOnSurface(\"roads\".\"geom\"), src.geom, 250)"
        ));
        // the raw column drives the bbox pre-filter even in centroid mode...
        assert!(subset.contains("\"roads\".\"geom\" && ST_Envelope(src.geom)"));
    }

    #[test]
    fn test_subset_transforms_probe_to_target_srid() {
        let mut t = target();
        t.srid = 4326;
        let subset = build_subset(
            &t,
            "\"public\".\"fm_src_x\"",
            &[Predicate::Intersects],
            3857,
            0.0,
            false,
        )
        .unwrap();
        assert!(subset.contains("ST_Intersects(\"roads\".\"geom\", ST_Transform(src.geom, 4326))"));
        assert!(subset.contains("&& ST_Envelope(ST_Transform(src.geom, 4326))"));
    }
}
