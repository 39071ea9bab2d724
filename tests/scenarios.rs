// SPDX-License-Identifier: Apache-2.0

//! End-to-end pipeline scenarios over the in-memory host and the OGR
//! backend: attribute-only filtering, geographic buffering, multi-step
//! combines and undo/redo context walking.
//!

mod utils;

use geosieve::prelude::*;
use tracing_test::traced_test;
use utils::*;

#[tokio::test]
#[traced_test]
async fn attribute_only_filter_on_source() -> Result<(), FilterError> {
    let (host, mut core) = engine();
    let towns = towns_layer(&host);

    let mut r = request(&towns);
    r.source_expression = "population >= 20 AND population < 40".into();
    let outcome = core.execute(&r, &TaskContext::detached("s1")).await?;

    // populations 20, 25, 30, 35 live on fids 5..=8...
    assert_eq!(host.matching_fids(&towns)?, fids(&[5, 6, 7, 8]));
    assert_eq!(outcome.layers.len(), 1);
    assert_eq!(outcome.layers[0].matched, 4);
    assert_eq!(outcome.layers[0].backend, BackendKind::Ogr);

    // the source stack grows by one; the global stack stays put...
    assert_eq!(core.history().layer_len(&towns), 1);
    assert_eq!(core.history().global_len(), 0);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn geographic_buffer_reprojects_to_metric() -> Result<(), FilterError> {
    let (host, mut core) = engine();
    let (source, target) = geographic_pair(&host);

    // 500 metres around the probe point only reaches the first target...
    let r = spatial_request(&source, &target, &[Predicate::Intersects], 500.0);
    let ctx = TaskContext::reporting_to(
        "filter:poi",
        tokio_util::sync::CancellationToken::new(),
        host.clone(),
    );
    let outcome = core.execute(&r, &ctx).await?;

    assert_eq!(host.matching_fids(&target)?, fids(&[1]));
    assert_eq!(outcome.layers[0].matched, 1);
    assert!(!outcome.layers[0].cache_hit);
    assert_eq!(core.cache_len(), 1);
    // the fid set was mirrored into the host selection model...
    assert_eq!(host.selected_of(&target).unwrap(), fids(&[1]));
    // and progress flowed to the host, ending at 100...
    let progress = host.progress_reports();
    assert_eq!(progress.last().map(|(_, p, _)| *p), Some(100));

    // identical request again: served from the cache, same answer...
    let again = core.execute(&r, &TaskContext::detached("s2b")).await?;
    assert!(again.layers[0].cache_hit);
    assert_eq!(host.matching_fids(&target)?, fids(&[1]));
    assert_eq!(core.cache_len(), 1);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn multi_step_combine_and_not_and() -> Result<(), FilterError> {
    let (host, mut core) = engine();
    let (source, target) = geographic_pair(&host);

    // step 1: 500 m intersects -> {1}...
    let r1 = spatial_request(&source, &target, &[Predicate::Intersects], 500.0);
    core.execute(&r1, &TaskContext::detached("c1")).await?;
    let step1 = host.matching_fids(&target)?;
    assert_eq!(step1, fids(&[1]));

    // step 2: widen to 2000 m but AND with the previous set -> still {1}...
    let mut r2 = spatial_request(&source, &target, &[Predicate::Intersects], 2000.0);
    r2.combine = CombineOp::And;
    r2.previous
        .insert(target.clone(), FilterPayload::Fids(step1.clone()));
    core.execute(&r2, &TaskContext::detached("c2")).await?;
    assert_eq!(host.matching_fids(&target)?, fids(&[1]));

    // step 3: 5000 m captures {1, 2}; NOT_AND removes everything the new
    // match shares with the previous set -> empty, applied as 0 = 1...
    let mut r3 = spatial_request(&source, &target, &[Predicate::Intersects], 5000.0);
    r3.combine = CombineOp::NotAnd;
    r3.previous
        .insert(target.clone(), FilterPayload::Fids(fids(&[1])));
    let outcome = core.execute(&r3, &TaskContext::detached("c3")).await?;

    assert_eq!(outcome.layers[0].matched, 0);
    assert_eq!(host.subset_of(&target).unwrap(), "0 = 1");
    assert!(host.matching_fids(&target)?.is_empty());

    // three spatial matches were computed, three cache entries remain...
    assert_eq!(core.cache_len(), 3);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn undo_redo_walks_global_states() -> Result<(), FilterError> {
    let (host, mut core) = engine();
    let (source, target) = geographic_pair(&host);

    // the same three steps as the combine scenario...
    let r1 = spatial_request(&source, &target, &[Predicate::Intersects], 500.0);
    core.execute(&r1, &TaskContext::detached("u1")).await?;
    let mut r2 = spatial_request(&source, &target, &[Predicate::Intersects], 2000.0);
    r2.combine = CombineOp::And;
    r2.previous
        .insert(target.clone(), FilterPayload::Fids(fids(&[1])));
    core.execute(&r2, &TaskContext::detached("u2")).await?;
    let mut r3 = spatial_request(&source, &target, &[Predicate::Intersects], 5000.0);
    r3.combine = CombineOp::NotAnd;
    r3.previous
        .insert(target.clone(), FilterPayload::Fids(fids(&[1])));
    core.execute(&r3, &TaskContext::detached("u3")).await?;

    assert_eq!(core.history().global_len(), 3);
    let source_depth = core.history().layer_len(&source);

    // undo #1: back to the AND state -> {1}...
    let scope = core.undo(&target)?.expect("undo available");
    assert_eq!(scope, UndoScope::Global);
    assert_eq!(host.matching_fids(&target)?, fids(&[1]));

    // undo #2: back to the 500 m state -> {1}...
    core.undo(&target)?.expect("undo available");
    assert_eq!(host.matching_fids(&target)?, fids(&[1]));

    // undo #3: nothing left -> the target is cleared...
    core.undo(&target)?.expect("undo available");
    assert_eq!(host.subset_of(&target).unwrap(), "");
    assert_eq!(host.matching_fids(&target)?.len(), 3);

    // redo x3 walks forward to the NOT_AND (empty) state...
    core.redo(&target)?.expect("redo available");
    assert_eq!(host.matching_fids(&target)?, fids(&[1]));
    core.redo(&target)?.expect("redo available");
    assert_eq!(host.matching_fids(&target)?, fids(&[1]));
    core.redo(&target)?.expect("redo available");
    assert!(host.matching_fids(&target)?.is_empty());
    assert_eq!(host.subset_of(&target).unwrap(), "0 = 1");

    // the source-layer stack never moved...
    assert_eq!(core.history().layer_len(&source), source_depth);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn combine_or_widens_the_previous_set() -> Result<(), FilterError> {
    let (host, mut core) = engine();
    let (source, target) = geographic_pair(&host);

    let r1 = spatial_request(&source, &target, &[Predicate::Intersects], 500.0);
    core.execute(&r1, &TaskContext::detached("o1")).await?;
    assert_eq!(host.matching_fids(&target)?, fids(&[1]));

    // OR in the 5000 m match: {1} ∪ {1, 2} = {1, 2}...
    let mut r2 = spatial_request(&source, &target, &[Predicate::Intersects], 5000.0);
    r2.combine = CombineOp::Or;
    r2.previous
        .insert(target.clone(), FilterPayload::Fids(fids(&[1])));
    let outcome = core.execute(&r2, &TaskContext::detached("o2")).await?;

    assert_eq!(outcome.layers[0].matched, 2);
    assert_eq!(host.matching_fids(&target)?, fids(&[1, 2]));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn target_centroid_tests_interior_points() -> Result<(), FilterError> {
    let (host, mut core) = engine();

    let source = point_layer("probe", 3857, vec![]);
    let source_ref = source.layer.clone();
    host.add_layer(source, vec![point_feature(1, 0.0, 0.0)]);

    // a big parcel whose interior point sits far from the probe, and a
    // small one right on it...
    let mut parcels = point_layer("parcels", 3857, vec![]);
    parcels.geometry_type = "Polygon".into();
    let parcels_ref = parcels.layer.clone();
    let poly = |wkt: &str| geos::Geometry::new_from_wkt(wkt).unwrap();
    host.add_layer(
        parcels,
        vec![
            Feature {
                fid: 1,
                geometry: Some(poly("POLYGON ((-5 -5, 200 -5, 200 5, -5 5, -5 -5))")),
                attributes: Default::default(),
            },
            Feature {
                fid: 2,
                geometry: Some(poly("POLYGON ((-4 -4, 4 -4, 4 4, -4 4, -4 -4))")),
                attributes: Default::default(),
            },
        ],
    );

    // full geometries: both parcels intersect a 10 m buffer...
    let r = spatial_request(&source_ref, &parcels_ref, &[Predicate::Intersects], 10.0);
    core.execute(&r, &TaskContext::detached("cen1")).await?;
    assert_eq!(host.matching_fids(&parcels_ref)?, fids(&[1, 2]));

    // interior points: parcel 1's lies ~97 m out and drops off...
    let mut r = spatial_request(&source_ref, &parcels_ref, &[Predicate::Intersects], 10.0);
    r.use_target_centroid = true;
    core.execute(&r, &TaskContext::detached("cen2")).await?;
    assert_eq!(host.matching_fids(&parcels_ref)?, fids(&[2]));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn multi_target_snapshot_restores_atomically() -> Result<(), FilterError> {
    let (host, mut core) = engine();

    let source = point_layer("probe", 3857, vec![]);
    let source_ref = source.layer.clone();
    host.add_layer(source, vec![point_feature(1, 0.0, 0.0)]);

    let near = point_layer("near", 3857, vec![]);
    let near_ref = near.layer.clone();
    host.add_layer(near, vec![point_feature(1, 5.0, 0.0), point_feature(2, 90.0, 0.0)]);

    let far = point_layer("far", 3857, vec![]);
    let far_ref = far.layer.clone();
    host.add_layer(far, vec![point_feature(1, 8.0, 0.0), point_feature(2, 400.0, 0.0)]);

    // one request over both targets, processed in declared order...
    let mut r = spatial_request(&source_ref, &near_ref, &[Predicate::Intersects], 10.0);
    r.target_layers.push(far_ref.clone());
    let outcome = core.execute(&r, &TaskContext::detached("multi")).await?;

    assert_eq!(outcome.layers.len(), 2);
    assert_eq!(outcome.layers[0].layer, near_ref);
    assert_eq!(outcome.layers[1].layer, far_ref);
    assert_eq!(host.matching_fids(&near_ref)?, fids(&[1]));
    assert_eq!(host.matching_fids(&far_ref)?, fids(&[1]));
    assert_eq!(core.history().global_len(), 1);

    // one undo clears both layers together...
    let scope = core.undo(&near_ref)?.expect("undo available");
    assert_eq!(scope, UndoScope::Global);
    assert_eq!(host.matching_fids(&near_ref)?.len(), 2);
    assert_eq!(host.matching_fids(&far_ref)?.len(), 2);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn layer_edit_invalidates_cache() -> Result<(), FilterError> {
    let (host, mut core) = engine();
    let (source, target) = geographic_pair(&host);

    let r = spatial_request(&source, &target, &[Predicate::Intersects], 500.0);
    core.execute(&r, &TaskContext::detached("e1")).await?;
    assert_eq!(core.cache_len(), 1);

    core.on_layer_edited(&target);
    assert_eq!(core.cache_len(), 0);

    // the next identical request recomputes...
    let outcome = core.execute(&r, &TaskContext::detached("e2")).await?;
    assert!(!outcome.layers[0].cache_hit);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn vanished_layer_fails_without_history_churn() -> Result<(), FilterError> {
    let (host, mut core) = engine();
    let (source, target) = geographic_pair(&host);
    host.remove_layer(&target);

    let r = spatial_request(&source, &target, &[Predicate::Intersects], 500.0);
    let err = core
        .execute(&r, &TaskContext::detached("gone"))
        .await
        .unwrap_err();
    assert!(matches!(err, FilterError::LayerNotFilterable { .. }));
    assert_eq!(core.history().global_len(), 0);
    // the failure reached the host's message area...
    assert!(
        host.messages()
            .iter()
            .any(|(level, text)| *level == MessageLevel::Error && text.contains("filter failed"))
    );
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn empty_source_selection_yields_universally_false() -> Result<(), FilterError> {
    let (host, mut core) = engine();
    let towns = towns_layer(&host);
    let target = {
        let d = point_layer("empty_target", 3857, vec![]);
        let l = d.layer.clone();
        host.add_layer(d, vec![point_feature(1, 0.0, 0.0)]);
        l
    };

    let mut r = spatial_request(&towns, &target, &[Predicate::Intersects], 10.0);
    r.source_expression = "population > 9000".into();
    let outcome = core.execute(&r, &TaskContext::detached("empty")).await?;

    assert_eq!(outcome.layers[0].matched, 0);
    assert_eq!(host.subset_of(&target).unwrap(), "0 = 1");
    Ok(())
}
