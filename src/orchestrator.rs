// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! The filter orchestrator: one context struct owning the cache, the
//! history and the backend sessions, and the pipeline dispatching a request
//! through source preparation, predicate execution, combination and history
//! recording.
//!
//! No hidden globals: everything lives in [`Core`], and only the
//! orchestrator mutates the shared structures.
//!

use crate::{
    backend::{
        Backend, BackendKind, FilterPort, PreparedSource, SourceProbe, create_backend,
        plan_backend, select_backend,
    },
    cache::ResultCache,
    config::Config,
    crs::CrsInfo,
    error::FilterError,
    fid::{CombineOp, FidSet},
    fingerprint::{Fingerprint, TargetKey},
    geom,
    history::{FilterHistory, Restore, UndoScope},
    host::{Host, MessageLevel},
    layer::{LayerDescriptor, LayerRef},
    predicate::{Predicate, normalise},
    state::{
        FilterOutcome, FilterPayload, FilterRequest, FilterState, GlobalFilterState, LayerOutcome,
    },
    subset::wrap_previous,
    task::TaskContext,
    translate::{ParamMode, translate_expression},
};
use geos::Geom;
use jiff::Timestamp;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

// backends are keyed by kind + provider URI; the OGR backend is host-wide.
type BackendSlot = (BackendKind, String);

/// The engine context: configuration, result cache, filter history and the
/// open backend sessions. The orchestrator owns all of it exclusively.
pub struct Core {
    host: Arc<dyn Host>,
    config: Config,
    cache: ResultCache,
    history: FilterHistory,
    backends: HashMap<BackendSlot, Backend>,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("cache", &self.cache)
            .field("backends", &self.backends.len())
            .finish()
    }
}

impl Core {
    /// Build an engine bound to a host.
    pub fn new(host: Arc<dyn Host>, config: Config) -> Self {
        let cache = ResultCache::new(config.cache_capacity);
        let history = FilterHistory::new(config.history_capacity);
        Self {
            host,
            config,
            cache,
            history,
            backends: HashMap::new(),
        }
    }

    /// Read access to the history (undo depth inspection, tests).
    pub fn history(&self) -> &FilterHistory {
        &self.history
    }

    /// Number of live cache entries.
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Artifacts currently owned across all backend sessions.
    pub fn total_artifacts(&self) -> usize {
        self.backends.values().map(|b| b.artifact_count()).sum()
    }

    /// Run one filter request through the pipeline. On any failure,
    /// cancellation included, partially created backend artifacts are
    /// rolled back and history is left untouched.
    pub async fn execute(
        &mut self,
        request: &FilterRequest,
        ctx: &TaskContext,
    ) -> Result<FilterOutcome, FilterError> {
        let mut created: Vec<(BackendSlot, PreparedSource)> = Vec::new();
        let mut applied: Vec<(LayerRef, String)> = Vec::new();
        match self.execute_inner(request, ctx, &mut created, &mut applied).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.rollback(&created, &applied).await;
                let text = format!(
                    "filter failed for layer {}: {}",
                    request.source_layer,
                    e.diagnostic()
                );
                self.host.report_message(MessageLevel::Error, &text);
                Err(e)
            }
        }
    }

    async fn execute_inner(
        &mut self,
        request: &FilterRequest,
        ctx: &TaskContext,
        created: &mut Vec<(BackendSlot, PreparedSource)>,
        applied: &mut Vec<(LayerRef, String)>,
    ) -> Result<FilterOutcome, FilterError> {
        request.validate()?;
        ctx.checkpoint(5, "resolving layers")?;

        let source = self.resolve_layer(&request.source_layer)?;
        source.require_filterable()?;
        let source_kind = select_backend(&source, &self.config);
        let predicates = normalise(&request.predicates);

        // resolve + plan every target before touching any backend...
        let mut plans: Vec<(LayerDescriptor, BackendKind)> = Vec::new();
        for t in &request.target_layers {
            let desc = self.resolve_layer(t)?;
            desc.require_filterable()?;
            let kind = plan_backend(&desc, &self.config, &predicates)?;
            plans.push((desc, kind));
        }

        // the source's own attribute filter, translated early so schema
        // errors surface before any side effects...
        let source_subset = if request.source_expression.trim().is_empty() {
            None
        } else {
            Some(
                translate_expression(
                    &request.source_expression,
                    &source,
                    source_kind,
                    ParamMode::Inline,
                )?
                .sql,
            )
        };

        if plans.is_empty() {
            return self
                .execute_attribute_only(request, ctx, &source, source_kind, source_subset, applied)
                .await;
        }

        // ----- source probe ------------------------------------------------
        ctx.checkpoint(10, "collecting source features")?;
        let mut source_matched: u64 = 0;
        let mut geoms = Vec::new();
        for feature in self.host.iter_features(
            &source.layer,
            source_subset.is_some().then_some(request.source_expression.as_str()),
            None,
        )? {
            source_matched += 1;
            if let Some(g) = feature.geometry {
                if request.use_source_centroid {
                    geoms.push(geom::interior_point(&g, self.config.centroid_mode)?);
                } else {
                    geoms.push(g);
                }
            }
        }
        let probe = self.build_probe(geoms, &source, request, &predicates)?;
        let probe_is_empty = probe.geometry.is_empty()?;
        debug!(
            "probe for {}: {} ({} source features)",
            source.layer, probe.wkt, source_matched
        );

        // ----- per-target filtering, in request order ----------------------
        let mut prepared_map: HashMap<BackendSlot, PreparedSource> = HashMap::new();
        let mut outcome_layers = Vec::with_capacity(plans.len());
        let mut target_states: Vec<(LayerRef, FilterState)> = Vec::with_capacity(plans.len());
        let total = plans.len() as u64;
        for (ndx, (target, kind)) in plans.iter().enumerate() {
            let started = Instant::now();
            let percent = (30 + 60 * (ndx as u64) / total) as u8;
            let target_pk = target.require_filterable()?.to_owned();
            let fp = Fingerprint::compute(
                &probe.wkt,
                request.buffer,
                &predicates,
                &TargetKey::for_layer(target),
                request.use_source_centroid,
                request.use_target_centroid,
            );

            let (mut new_payload, mut cache_hit) = if probe_is_empty {
                (FilterPayload::Fids(FidSet::new()), false)
            } else {
                match self.cache.get(&fp).cloned() {
                    Some(fids) => (FilterPayload::Fids(fids), true),
                    None => {
                        let payload = self
                            .spatial_match(
                                target, *kind, &probe, &predicates, request, &fp,
                                &mut prepared_map, created, ctx, percent,
                            )
                            .await?;
                        (payload, false)
                    }
                }
            };

            loop {
                let final_payload = combine_payloads(
                    *kind,
                    &target_pk,
                    request.previous.get(&target.layer),
                    new_payload.clone(),
                    request.combine,
                );
                let subset = final_payload.to_subset_string(&target_pk);
                let prior = self
                    .host
                    .current_subset_string(&target.layer)
                    .unwrap_or_default();
                match self.host.apply_subset_string(&target.layer, &subset) {
                    Ok(()) => {
                        applied.push((target.layer.clone(), prior));
                        let matched = match final_payload.as_fids() {
                            Some(f) => {
                                // mirror explicit fid sets into the host's
                                // selection model...
                                self.host.set_selected_fids(&target.layer, f);
                                f.len() as u64
                            }
                            None => self.count_subset(target, *kind, &subset).await?,
                        };
                        outcome_layers.push(LayerOutcome {
                            layer: target.layer.clone(),
                            backend: *kind,
                            matched,
                            cache_hit,
                            elapsed_ms: started.elapsed().as_millis() as u64,
                        });
                        target_states.push((
                            target.layer.clone(),
                            FilterState {
                                backend: *kind,
                                payload: final_payload,
                                feature_count: matched,
                                created_at: Timestamp::now(),
                                description: describe(&predicates, request),
                            },
                        ));
                        break;
                    }
                    Err(e) if cache_hit => {
                        // the cached result no longer applies cleanly:
                        // invalidate and run the backend once for real...
                        warn!("cached filter for {fp} failed to apply: {e}");
                        self.cache.invalidate(&fp);
                        cache_hit = false;
                        new_payload = self
                            .spatial_match(
                                target, *kind, &probe, &predicates, request, &fp,
                                &mut prepared_map, created, ctx, percent,
                            )
                            .await
                            .map_err(|e| match e {
                                FilterError::Cancelled => FilterError::Cancelled,
                                _ => FilterError::CacheInconsistency(fp.to_string()),
                            })?;
                    }
                    Err(e) => return Err(e),
                }
            }
            ctx.checkpoint(percent.saturating_add(5), &format!("filtered {}", target.layer))?;
        }

        // ----- source layer state + history --------------------------------
        if let Some(s) = source_subset.as_deref() {
            let prior = self
                .host
                .current_subset_string(&source.layer)
                .unwrap_or_default();
            self.host.apply_subset_string(&source.layer, s)?;
            applied.push((source.layer.clone(), prior));
        }
        let source_state = FilterState {
            backend: source_kind,
            payload: FilterPayload::SubsetString(source_subset.unwrap_or_default()),
            feature_count: source_matched,
            created_at: Timestamp::now(),
            description: "source attribute filter".to_owned(),
        };

        // the last suspension point sits before the history push...
        ctx.checkpoint(95, "committing")?;
        let global = if target_states.is_empty() {
            None
        } else {
            let mut states = target_states.clone();
            states.push((source.layer.clone(), source_state.clone()));
            Some(GlobalFilterState { states })
        };
        self.history.push(global, &source.layer, source_state);
        ctx.report(100, "done");

        Ok(FilterOutcome {
            source: source.layer.clone(),
            layers: outcome_layers,
        })
    }

    // Attribute-only request: no spatial work, no global history entry.
    async fn execute_attribute_only(
        &mut self,
        request: &FilterRequest,
        ctx: &TaskContext,
        source: &LayerDescriptor,
        source_kind: BackendKind,
        source_subset: Option<String>,
        applied: &mut Vec<(LayerRef, String)>,
    ) -> Result<FilterOutcome, FilterError> {
        let started = Instant::now();
        let subset = wrap_previous(
            source_kind,
            request
                .previous
                .get(&source.layer)
                .map(|p| p.to_subset_string(source.primary_key().unwrap_or("fid")))
                .as_deref(),
            source_subset.as_deref().unwrap_or_default(),
            request.combine,
        );
        ctx.checkpoint(40, "applying attribute filter")?;
        let prior = self
            .host
            .current_subset_string(&source.layer)
            .unwrap_or_default();
        self.host.apply_subset_string(&source.layer, &subset)?;
        applied.push((source.layer.clone(), prior));
        let matched = self.count_subset(source, source_kind, &subset).await?;

        ctx.checkpoint(95, "committing")?;
        let state = FilterState {
            backend: source_kind,
            payload: FilterPayload::SubsetString(subset),
            feature_count: matched,
            created_at: Timestamp::now(),
            description: "attribute filter".to_owned(),
        };
        self.history.push(None, &source.layer, state);
        ctx.report(100, "done");

        Ok(FilterOutcome {
            source: source.layer.clone(),
            layers: vec![LayerOutcome {
                layer: source.layer.clone(),
                backend: source_kind,
                matched,
                cache_hit: false,
                elapsed_ms: started.elapsed().as_millis() as u64,
            }],
        })
    }

    // CRS-normalise, simplify and buffer the unioned source geometry into
    // the probe every backend consumes.
    fn build_probe(
        &self,
        geoms: Vec<geos::Geometry>,
        source: &LayerDescriptor,
        request: &FilterRequest,
        predicates: &[Predicate],
    ) -> Result<SourceProbe, FilterError> {
        let had_input = !geoms.is_empty();
        let unioned = geom::union_all(geoms)?;
        let repaired = geom::repair(&unioned)?;
        if had_input && repaired.is_empty()? && !unioned.is_empty()? {
            return Err(FilterError::GeometryInvalid {
                hint: "validity repair and zero-buffer cleanup both failed".into(),
            });
        }
        let crs = CrsInfo::from_srid(source.srid)?;
        let (metric, crs) = geom::ensure_metric(&repaired, &crs, request.crs_policy)?;
        // with dwithin in play the buffer value is the predicate's distance,
        // not a probe dilation...
        let dilation = if predicates.contains(&Predicate::DWithin) {
            0.0
        } else {
            request.buffer
        };
        let simplified = if self.config.simplify_before_buffer {
            geom::simplify_before_buffer(&metric, dilation)?
        } else {
            metric
        };
        let buffered = geom::buffer(&simplified, dilation, self.config.buffer_endcap)?;
        let wkt = geom::canonical_wkt(&buffered, &crs)?;
        let short_hash = format!("{:08x}", xxh3_64(wkt.as_bytes()) >> 32);
        Ok(SourceProbe {
            geometry: buffered,
            wkt,
            srid: crs.srid,
            short_hash,
            buffer: request.buffer,
        })
    }

    // Run the backend for one target: open the session, prepare the probe
    // (memoised per backend within the request), apply the filter, fill the
    // cache. Transient query failures get one retry.
    #[allow(clippy::too_many_arguments)]
    async fn spatial_match(
        &mut self,
        target: &LayerDescriptor,
        kind: BackendKind,
        probe: &SourceProbe,
        predicates: &[Predicate],
        request: &FilterRequest,
        fp: &Fingerprint,
        prepared_map: &mut HashMap<BackendSlot, PreparedSource>,
        created: &mut Vec<(BackendSlot, PreparedSource)>,
        ctx: &TaskContext,
        percent: u8,
    ) -> Result<FilterPayload, FilterError> {
        let slot = backend_slot(kind, target);
        let uri = slot.1.clone();
        let backend = self
            .backends
            .entry(slot.clone())
            .or_insert_with(|| create_backend(kind, &self.config, self.host.clone()));
        backend.open_session(&uri).await?;

        let prepared = match prepared_map.get(&slot) {
            Some(p) => p.clone(),
            None => {
                let p = match backend.prepare_source(probe, ctx).await {
                    Ok(x) => x,
                    Err(e) if e.is_transient() => {
                        warn!("transient failure preparing source, retrying once: {e}");
                        backend.prepare_source(probe, ctx).await?
                    }
                    Err(e) => return Err(e),
                };
                if p.created {
                    created.push((slot.clone(), p.clone()));
                }
                prepared_map.insert(slot.clone(), p.clone());
                // suspension point after prepare_source...
                ctx.checkpoint(percent, "prepared source geometry")?;
                p
            }
        };

        let payload = match backend
            .apply_filter(target, &prepared, predicates, request.use_target_centroid, ctx)
            .await
        {
            Ok(x) => x,
            Err(e) if e.is_transient() => {
                warn!("transient failure applying filter, retrying once: {e}");
                backend
                    .apply_filter(target, &prepared, predicates, request.use_target_centroid, ctx)
                    .await?
            }
            Err(e) => return Err(e),
        };
        if let Some(fids) = payload.as_fids() {
            self.cache.insert(*fp, target.layer.clone(), fids.clone());
        }
        Ok(payload)
    }

    async fn count_subset(
        &mut self,
        layer: &LayerDescriptor,
        kind: BackendKind,
        subset: &str,
    ) -> Result<u64, FilterError> {
        let slot = backend_slot(kind, layer);
        let uri = slot.1.clone();
        let backend = self
            .backends
            .entry(slot)
            .or_insert_with(|| create_backend(kind, &self.config, self.host.clone()));
        backend.open_session(&uri).await?;
        backend.count_features(layer, subset).await
    }

    async fn rollback(
        &mut self,
        created: &[(BackendSlot, PreparedSource)],
        applied: &[(LayerRef, String)],
    ) {
        // restore subset strings the failed request already applied...
        for (layer, prior) in applied.iter().rev() {
            if let Err(e) = self.host.apply_subset_string(layer, prior) {
                warn!("rollback of subset on {layer} failed: {e}");
            }
        }
        // and drop artifacts it created, newest first...
        for (slot, prepared) in created.iter().rev() {
            if let Some(backend) = self.backends.get_mut(slot) {
                if let Err(e) = backend.rollback_probe(prepared).await {
                    warn!("rollback of {:?} failed: {e}", prepared.artifact);
                }
            }
        }
    }

    fn resolve_layer(&self, layer: &LayerRef) -> Result<LayerDescriptor, FilterError> {
        self.host
            .get_layer(layer)
            .ok_or_else(|| FilterError::LayerNotFilterable {
                layer: layer.clone(),
                reason: "layer no longer exists".into(),
            })
    }

    // ----- undo / redo -----------------------------------------------------

    /// Undo one step, with context detection: the global stack when its top
    /// snapshot still matches an actively filtered layer, the current
    /// layer's own stack otherwise. Returns the scope walked, or `None`
    /// when there was nothing to undo.
    pub fn undo(&mut self, current: &LayerRef) -> Result<Option<UndoScope>, FilterError> {
        let scope = self.history.undo_scope(current, |l| {
            self.host
                .current_subset_string(l)
                .is_some_and(|s| !s.is_empty())
        });
        let restore = match &scope {
            UndoScope::Global => self.history.undo_global(),
            UndoScope::PerLayer(l) => self.history.undo_layer(l),
        };
        match restore {
            Some(r) => {
                self.apply_restore(&r)?;
                Ok(Some(scope))
            }
            None => Ok(None),
        }
    }

    /// Redo one step; symmetric to [`Core::undo`].
    pub fn redo(&mut self, current: &LayerRef) -> Result<Option<UndoScope>, FilterError> {
        let scope = self.history.redo_scope(current);
        let restore = match &scope {
            UndoScope::Global => self.history.redo_global(),
            UndoScope::PerLayer(l) => self.history.redo_layer(l),
        };
        match restore {
            Some(r) => {
                self.apply_restore(&r)?;
                Ok(Some(scope))
            }
            None => Ok(None),
        }
    }

    fn apply_restore(&self, restore: &Restore) -> Result<(), FilterError> {
        for (layer, state) in &restore.apply {
            match self.host.get_layer(layer) {
                Some(desc) => {
                    let pk = desc.primary_key().unwrap_or("fid").to_owned();
                    self.host
                        .apply_subset_string(layer, &state.payload.to_subset_string(&pk))?;
                }
                None => warn!("layer {layer} gone; skipping restore"),
            }
        }
        for layer in &restore.clear {
            if self.host.get_layer(layer).is_some() {
                self.host.apply_subset_string(layer, "")?;
            }
        }
        Ok(())
    }

    // ----- host events and lifecycle ---------------------------------------

    /// Host reported an edit on a layer: its cached results are stale.
    /// (The embedding also cancels in-flight tasks via the task runner.)
    pub fn on_layer_edited(&mut self, layer: &LayerRef) {
        self.cache.invalidate_layer(layer);
    }

    /// Host dropped a layer entirely.
    pub fn on_layer_removed(&mut self, layer: &LayerRef) {
        self.cache.invalidate_layer(layer);
    }

    /// Remove any filter applied to a layer.
    pub fn reset_layer(&self, layer: &LayerRef) -> Result<(), FilterError> {
        self.host.apply_subset_string(layer, "")
    }

    /// Tear the engine down: drop every backend artifact, close sessions,
    /// clear cache and history. Runs on plugin shutdown and explicit reset.
    pub async fn shutdown(&mut self) {
        for (slot, backend) in self.backends.iter_mut() {
            if let Err(e) = backend.cleanup().await {
                warn!("cleanup of {:?} failed: {e}", slot);
            }
            if backend.artifact_count() != 0 {
                warn!("backend {:?} leaked {} artifacts", slot, backend.artifact_count());
            }
        }
        self.backends.clear();
        self.cache.clear();
        self.history.clear();
        info!("engine shut down");
    }
}

fn backend_slot(kind: BackendKind, layer: &LayerDescriptor) -> BackendSlot {
    match kind {
        // one OGR backend serves every host layer...
        BackendKind::Ogr => (kind, String::new()),
        _ => (kind, layer.provider_uri.clone()),
    }
}

// Combine the fresh spatial match with the previous filter. Fid sets meet
// fid sets with exact set semantics; anything involving a subset string
// goes through the shape heuristic and may degrade to REPLACE.
fn combine_payloads(
    kind: BackendKind,
    pk: &str,
    previous: Option<&FilterPayload>,
    new: FilterPayload,
    op: CombineOp,
) -> FilterPayload {
    let previous = previous.filter(|p| !p.is_unfiltered());
    let Some(prev) = previous else {
        return new;
    };
    if !op.reads_previous() {
        return new;
    }
    match (prev, &new) {
        (FilterPayload::Fids(p), FilterPayload::Fids(n)) => FilterPayload::Fids(p.combine(op, n)),
        _ => {
            let prev_s = prev.to_subset_string(pk);
            let new_s = new.to_subset_string(pk);
            let combined = wrap_previous(kind, Some(&prev_s), &new_s, op);
            match new {
                FilterPayload::MaterialisedView { view, .. } => FilterPayload::MaterialisedView {
                    view,
                    subset: combined,
                },
                _ => FilterPayload::SubsetString(combined),
            }
        }
    }
}

fn describe(predicates: &[Predicate], request: &FilterRequest) -> String {
    let names: Vec<&str> = predicates.iter().map(|p| p.canonical_name()).collect();
    if request.buffer != 0.0 {
        format!("{} (buffer {})", names.join("+"), request.buffer)
    } else {
        names.join("+")
    }
}
