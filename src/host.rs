// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! The host-application boundary: how the engine reaches layers, features
//! and the user-visible progress/message channels of the embedding GIS
//! environment.
//!
//! [`MemoryHost`] is a complete in-process implementation backed by plain
//! vectors; it doubles as the test harness and as a reference for real
//! integrations.
//!

use crate::{
    error::FilterError,
    expr::Attributes,
    fid::FidSet,
    geom,
    layer::{LayerDescriptor, LayerRef},
    parse::parse_expression,
};
use geos::Geometry;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Message severity forwarded to the host's notification area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    /// Informational.
    Info,
    /// Something degraded but the run continued.
    Warning,
    /// The run failed.
    Error,
}

/// One vector feature as the host hands it out.
#[derive(Debug, Clone)]
pub struct Feature {
    /// Primary-key value.
    pub fid: i64,
    /// Feature geometry; absent for attribute-only rows.
    pub geometry: Option<Geometry>,
    /// Attribute values keyed by column name.
    pub attributes: Attributes,
}

/// Axis-aligned bounding box used for pre-filtering feature iteration:
/// `(min_x, min_y, max_x, max_y)`.
pub type BBox = (f64, f64, f64, f64);

/// What the engine needs from the embedding GIS application.
///
/// Layer references are borrowed: any call may find the layer gone, which
/// surfaces as `None`/an error rather than a panic.
pub trait Host: Send + Sync {
    /// Resolve a layer reference, or `None` when the host dropped it.
    fn get_layer(&self, layer: &LayerRef) -> Option<LayerDescriptor>;

    /// Iterate features, optionally narrowed by an attribute expression in
    /// the host's own language and/or a bounding box.
    fn iter_features(
        &self,
        layer: &LayerRef,
        attribute_where: Option<&str>,
        bbox: Option<BBox>,
    ) -> Result<Box<dyn Iterator<Item = Feature> + Send>, FilterError>;

    /// Apply a subset string to a layer; the empty string clears it.
    fn apply_subset_string(&self, layer: &LayerRef, subset: &str) -> Result<(), FilterError>;

    /// The subset string currently applied to a layer; `None` when the
    /// layer is gone, the empty string when it is unfiltered.
    fn current_subset_string(&self, layer: &LayerRef) -> Option<String>;

    /// Push a fid selection to the host's selection model.
    fn set_selected_fids(&self, layer: &LayerRef, fids: &FidSet);

    /// Show a message in the host's notification area.
    fn report_message(&self, level: MessageLevel, text: &str);

    /// Report task progress, 0-100, with a short description.
    fn report_progress(&self, task: &str, percent: u8, text: &str);
}

// ----- MemoryHost ----------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryLayer {
    descriptor: Option<LayerDescriptor>,
    features: Vec<Feature>,
    subset: String,
    selected: FidSet,
}

#[derive(Debug, Default)]
struct MemoryHostInner {
    layers: HashMap<LayerRef, MemoryLayer>,
    messages: Vec<(MessageLevel, String)>,
    progress: Vec<(String, u8, String)>,
}

/// An in-memory [`Host`]: layers are vectors of features, subset strings are
/// evaluated with the engine's own expression machinery.
#[derive(Debug, Default)]
pub struct MemoryHost {
    inner: Mutex<MemoryHostInner>,
}

impl MemoryHost {
    /// An empty host.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a layer with its features.
    pub fn add_layer(&self, descriptor: LayerDescriptor, features: Vec<Feature>) {
        let mut inner = self.lock();
        inner.layers.insert(
            descriptor.layer.clone(),
            MemoryLayer {
                descriptor: Some(descriptor),
                features,
                subset: String::new(),
                selected: FidSet::new(),
            },
        );
    }

    /// Simulate the host dropping a layer out from under the engine.
    pub fn remove_layer(&self, layer: &LayerRef) {
        self.lock().layers.remove(layer);
    }

    /// The subset string currently applied to a layer.
    pub fn subset_of(&self, layer: &LayerRef) -> Option<String> {
        self.lock().layers.get(layer).map(|l| l.subset.clone())
    }

    /// The current fid selection of a layer.
    pub fn selected_of(&self, layer: &LayerRef) -> Option<FidSet> {
        self.lock().layers.get(layer).map(|l| l.selected.clone())
    }

    /// Evaluate the layer's applied subset string against its features and
    /// return the matching fids; an empty subset matches everything.
    pub fn matching_fids(&self, layer: &LayerRef) -> Result<FidSet, FilterError> {
        let inner = self.lock();
        let l = inner
            .layers
            .get(layer)
            .ok_or_else(|| FilterError::Runtime(format!("no such layer {layer}").into()))?;
        if l.subset.is_empty() {
            return Ok(l.features.iter().map(|f| f.fid).collect());
        }
        let pk = l
            .descriptor
            .as_ref()
            .and_then(|d| d.primary_key())
            .unwrap_or("fid")
            .to_owned();
        let expr = parse_expression(&l.subset)?;
        let mut out = FidSet::new();
        for f in &l.features {
            let mut attrs = f.attributes.clone();
            attrs.insert(pk.clone(), f.fid.into());
            if expr.matches(&attrs)? == Some(true) {
                out.insert(f.fid);
            }
        }
        Ok(out)
    }

    /// Messages reported so far.
    pub fn messages(&self) -> Vec<(MessageLevel, String)> {
        self.lock().messages.clone()
    }

    /// Progress reports seen so far as `(task, percent, text)`.
    pub fn progress_reports(&self) -> Vec<(String, u8, String)> {
        self.lock().progress.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryHostInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Host for MemoryHost {
    fn get_layer(&self, layer: &LayerRef) -> Option<LayerDescriptor> {
        self.lock()
            .layers
            .get(layer)
            .and_then(|l| l.descriptor.clone())
    }

    fn iter_features(
        &self,
        layer: &LayerRef,
        attribute_where: Option<&str>,
        bbox: Option<BBox>,
    ) -> Result<Box<dyn Iterator<Item = Feature> + Send>, FilterError> {
        let inner = self.lock();
        let l = inner
            .layers
            .get(layer)
            .ok_or_else(|| FilterError::Runtime(format!("no such layer {layer}").into()))?;
        let expr = match attribute_where {
            Some(w) if !w.is_empty() => Some(parse_expression(w)?),
            _ => None,
        };
        let mut out = Vec::new();
        for f in &l.features {
            if let Some(e) = &expr {
                if e.matches(&f.attributes)? != Some(true) {
                    continue;
                }
            }
            if let (Some((x0, y0, x1, y1)), Some(g)) = (bbox, f.geometry.as_ref()) {
                let (gx0, gy0, gx1, gy1) = geom::bounds(g)?;
                if gx1 < x0 || gx0 > x1 || gy1 < y0 || gy0 > y1 {
                    continue;
                }
            }
            out.push(f.clone());
        }
        Ok(Box::new(out.into_iter()))
    }

    fn apply_subset_string(&self, layer: &LayerRef, subset: &str) -> Result<(), FilterError> {
        let mut inner = self.lock();
        let l = inner
            .layers
            .get_mut(layer)
            .ok_or_else(|| FilterError::Runtime(format!("no such layer {layer}").into()))?;
        debug!("subset[{layer}] = {subset}");
        l.subset = subset.to_owned();
        Ok(())
    }

    fn current_subset_string(&self, layer: &LayerRef) -> Option<String> {
        self.subset_of(layer)
    }

    fn set_selected_fids(&self, layer: &LayerRef, fids: &FidSet) {
        if let Some(l) = self.lock().layers.get_mut(layer) {
            l.selected = fids.clone();
        }
    }

    fn report_message(&self, level: MessageLevel, text: &str) {
        self.lock().messages.push((level, text.to_owned()));
    }

    fn report_progress(&self, task: &str, percent: u8, text: &str) {
        self.lock()
            .progress
            .push((task.to_owned(), percent, text.to_owned()));
    }
}
