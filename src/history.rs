// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Filter history: per-layer stacks plus a global stack of multi-layer
//! snapshots, with undo/redo and the context detection deciding which stack
//! an undo should walk.
//!
//! Only the orchestrator mutates this structure; everything returned is
//! cloned so callers never hold references into the stacks.
//!

use crate::{
    layer::LayerRef,
    state::{FilterState, GlobalFilterState},
};
use std::collections::HashMap;
use tracing::debug;

/// Which stack an undo/redo should operate on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoScope {
    /// Restore the whole top-most global snapshot atomically.
    Global,
    /// Restore only the named layer's own stack.
    PerLayer(LayerRef),
}

/// Result of one undo step: the states to re-apply and the layers whose
/// filter must be cleared because no earlier state exists for them.
#[derive(Debug, Clone, Default)]
pub struct Restore {
    /// Layer states to re-apply, in snapshot order.
    pub apply: Vec<(LayerRef, FilterState)>,
    /// Layers to clear entirely.
    pub clear: Vec<LayerRef>,
}

// A bounded done/undone pair of stacks. Pushing clears the redo side and
// never stores the same value twice in a row.
#[derive(Debug)]
struct UndoStack<T: Clone + PartialEq> {
    done: Vec<T>,
    undone: Vec<T>,
    capacity: usize,
}

impl<T: Clone + PartialEq> UndoStack<T> {
    fn new(capacity: usize) -> Self {
        Self {
            done: Vec::new(),
            undone: Vec::new(),
            capacity,
        }
    }

    // `same` compares the applied filter only, so re-running an identical
    // request does not pile up indistinguishable entries.
    fn push_with<F>(&mut self, value: T, same: F)
    where
        F: Fn(&T, &T) -> bool,
    {
        self.undone.clear();
        if self.done.last().is_some_and(|top| same(top, &value)) {
            return;
        }
        self.done.push(value);
        if self.done.len() > self.capacity {
            self.done.remove(0);
        }
    }

    // Pop the current state into the redo side; the caller restores the new
    // top (or clears, when `None`).
    fn undo(&mut self) -> Option<(T, Option<T>)> {
        let popped = self.done.pop()?;
        self.undone.push(popped.clone());
        Some((popped, self.done.last().cloned()))
    }

    // Walk one step forward again.
    fn redo(&mut self) -> Option<T> {
        let value = self.undone.pop()?;
        self.done.push(value.clone());
        Some(value)
    }

    fn top(&self) -> Option<&T> {
        self.done.last()
    }

    fn peek_undone(&self) -> Option<&T> {
        self.undone.last()
    }

    fn len(&self) -> usize {
        self.done.len()
    }
}

/// The engine's undo/redo memory.
#[derive(Debug)]
pub struct FilterHistory {
    per_layer: HashMap<LayerRef, UndoStack<FilterState>>,
    global: UndoStack<GlobalFilterState>,
    capacity: usize,
}

impl FilterHistory {
    /// Create history with the given per-stack capacity.
    pub fn new(capacity: u32) -> Self {
        Self {
            per_layer: HashMap::new(),
            global: UndoStack::new(capacity as usize),
            capacity: capacity as usize,
        }
    }

    /// Record the outcome of a successful request: the global snapshot (when
    /// targets received filters) and the source layer's own state.
    pub fn push(
        &mut self,
        global: Option<GlobalFilterState>,
        source: &LayerRef,
        source_state: FilterState,
    ) {
        if let Some(snapshot) = global {
            debug!(
                "history: global push covering {} layer(s)",
                snapshot.states.len()
            );
            self.global.push_with(snapshot, GlobalFilterState::same_filter);
        }
        self.per_layer
            .entry(source.clone())
            .or_insert_with(|| UndoStack::new(self.capacity))
            .push_with(source_state, FilterState::same_filter);
    }

    /// Decide which stack an undo should walk: the global one when any layer
    /// of its top snapshot still carries an active filter, the current
    /// layer's own stack otherwise.
    pub fn undo_scope<F>(&self, current: &LayerRef, has_active_filter: F) -> UndoScope
    where
        F: Fn(&LayerRef) -> bool,
    {
        if let Some(top) = self.global.top() {
            if top.layers().any(|l| has_active_filter(l)) {
                return UndoScope::Global;
            }
        }
        UndoScope::PerLayer(current.clone())
    }

    /// Symmetric context detection for redo: the global stack when its next
    /// redo snapshot involves the current layer, the layer's own stack
    /// otherwise.
    pub fn redo_scope(&self, current: &LayerRef) -> UndoScope {
        if let Some(next) = self.global.peek_undone() {
            if next.layers().any(|l| l == current) {
                return UndoScope::Global;
            }
        }
        UndoScope::PerLayer(current.clone())
    }

    /// Undo the top global snapshot. Every layer of the popped snapshot is
    /// either restored to its previous captured state or cleared.
    pub fn undo_global(&mut self) -> Option<Restore> {
        let (popped, previous) = self.global.undo()?;
        let mut restore = Restore::default();
        for (layer, _) in &popped.states {
            match previous.as_ref().and_then(|p| p.state_for(layer)) {
                Some(state) => restore.apply.push((layer.clone(), state.clone())),
                None => restore.clear.push(layer.clone()),
            }
        }
        Some(restore)
    }

    /// Redo the most recently undone global snapshot.
    pub fn redo_global(&mut self) -> Option<Restore> {
        let snapshot = self.global.redo()?;
        Some(Restore {
            apply: snapshot.states.clone(),
            clear: Vec::new(),
        })
    }

    /// Undo the top of one layer's own stack.
    pub fn undo_layer(&mut self, layer: &LayerRef) -> Option<Restore> {
        let stack = self.per_layer.get_mut(layer)?;
        let (_, previous) = stack.undo()?;
        Some(match previous {
            Some(state) => Restore {
                apply: vec![(layer.clone(), state)],
                clear: Vec::new(),
            },
            None => Restore {
                apply: Vec::new(),
                clear: vec![layer.clone()],
            },
        })
    }

    /// Redo one layer's most recently undone state.
    pub fn redo_layer(&mut self, layer: &LayerRef) -> Option<Restore> {
        let stack = self.per_layer.get_mut(layer)?;
        let state = stack.redo()?;
        Some(Restore {
            apply: vec![(layer.clone(), state)],
            clear: Vec::new(),
        })
    }

    /// Depth of the global stack.
    pub fn global_len(&self) -> usize {
        self.global.len()
    }

    /// Depth of one layer's stack.
    pub fn layer_len(&self, layer: &LayerRef) -> usize {
        self.per_layer.get(layer).map(|s| s.len()).unwrap_or(0)
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.per_layer.clear();
        self.global = UndoStack::new(self.capacity);
    }
}
