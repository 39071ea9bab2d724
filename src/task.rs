// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Cooperative task wrapper for pipeline runs: cancellation checkpoints at
//! the pipeline's suspension points, per-layer single-flight, and the
//! concurrency cap on overlapping backend work.
//!

use crate::{
    error::FilterError,
    layer::LayerRef,
    predicate::normalise,
    state::{FilterOutcome, FilterRequest},
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

/// Progress sink: `(percent, text)`.
pub type ProgressFn = Arc<dyn Fn(u8, &str) + Send + Sync>;

/// Execution context handed down the pipeline. Carries the cancellation
/// token and the progress sink; the orchestrator consults it at every
/// suspension point.
#[derive(Clone)]
pub struct TaskContext {
    name: String,
    cancel: CancellationToken,
    progress: ProgressFn,
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("name", &self.name)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl TaskContext {
    /// Build a context from an externally owned token and progress sink.
    pub fn new(name: impl Into<String>, cancel: CancellationToken, progress: ProgressFn) -> Self {
        Self {
            name: name.into(),
            cancel,
            progress,
        }
    }

    /// A context with a fresh token and no progress reporting; for tests
    /// and fire-and-forget callers.
    pub fn detached(name: impl Into<String>) -> Self {
        Self::new(name, CancellationToken::new(), Arc::new(|_, _| ()))
    }

    /// A context whose progress reports flow straight to the host's
    /// progress API under the task's name.
    pub fn reporting_to(
        name: impl Into<String>,
        cancel: CancellationToken,
        host: Arc<dyn crate::host::Host>,
    ) -> Self {
        let name = name.into();
        let task = name.clone();
        Self::new(
            name,
            cancel,
            Arc::new(move |percent, text| host.report_progress(&task, percent, text)),
        )
    }

    /// Task name shown in progress UIs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// TRUE once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A suspension point: report progress, then honour a pending
    /// cancellation by returning [`FilterError::Cancelled`].
    pub fn checkpoint(&self, percent: u8, text: &str) -> Result<(), FilterError> {
        (self.progress)(percent.min(100), text);
        if self.cancel.is_cancelled() {
            debug!("task '{}' observed cancellation at {percent}%", self.name);
            return Err(FilterError::Cancelled);
        }
        Ok(())
    }

    /// Progress report without a cancellation check; for the stretch after
    /// the last suspension point where rollback is no longer possible.
    pub fn report(&self, percent: u8, text: &str) {
        (self.progress)(percent.min(100), text);
    }
}

/// Shared (clonable) result of a pipeline run, as observed by every caller
/// collapsed onto the same task.
pub type SharedOutcome = Result<Arc<FilterOutcome>, Arc<FilterError>>;

struct PendingTask {
    key: u64,
    cancel: CancellationToken,
    rx: watch::Receiver<Option<SharedOutcome>>,
}

/// Runs pipeline closures under the single-flight and concurrency rules:
/// identical concurrent requests observe one shared outcome, a *different*
/// request on a busy source layer cancels the pending one, and at most
/// `concurrency` tasks hold a backend at any moment.
pub struct TaskRunner {
    pending: Mutex<HashMap<LayerRef, PendingTask>>,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

/// Deterministic identity of a request for single-flight collapsing:
/// everything that shapes the spatial result, in canonical order. The
/// previous-filter payloads are excluded; they follow from the targets'
/// current state.
pub fn request_key(r: &FilterRequest) -> u64 {
    let mut targets: Vec<&str> = r.target_layers.iter().map(|l| l.as_str()).collect();
    targets.sort_unstable();
    let predicates: Vec<&str> = normalise(&r.predicates)
        .iter()
        .map(|p| p.canonical_name())
        .collect();
    let canonical = format!(
        "{src}|{expr}|{targets}|{preds}|{buffer:.4}|{sc}{tc}|{combine:?}|{crs:?}",
        src = r.source_layer.as_str(),
        expr = r.source_expression,
        targets = targets.join(","),
        preds = predicates.join(","),
        buffer = r.buffer,
        sc = if r.use_source_centroid { 'T' } else { 'F' },
        tc = if r.use_target_centroid { 'T' } else { 'F' },
        combine = r.combine,
        crs = r.crs_policy,
    );
    xxh3_64(canonical.as_bytes())
}

impl TaskRunner {
    /// A runner allowing `concurrency` overlapping tasks (minimum 1).
    pub fn new(concurrency: u32) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(concurrency.max(1) as usize)),
        }
    }

    /// Run a pipeline closure for `request`, enforcing single-flight per
    /// source layer. The closure receives a [`TaskContext`] wired to the
    /// runner-managed cancellation token and the given progress sink.
    pub async fn run<F, Fut>(
        &self,
        request: &FilterRequest,
        progress: ProgressFn,
        f: F,
    ) -> SharedOutcome
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = Result<FilterOutcome, FilterError>>,
    {
        let key = request_key(request);
        let source = request.source_layer.clone();

        let (cancel, tx) = {
            let mut pending = self.lock();
            if let Some(p) = pending.get(&source) {
                if p.key == key {
                    // identical request already in flight: await its outcome...
                    debug!("collapsing request onto in-flight task for {source}");
                    let rx = p.rx.clone();
                    drop(pending);
                    return Self::await_shared(rx).await;
                }
                // a different request on a busy layer cancels the pending one...
                debug!("cancelling pending task on {source}");
                p.cancel.cancel();
            }
            let (tx, rx) = watch::channel(None);
            let cancel = CancellationToken::new();
            pending.insert(
                source.clone(),
                PendingTask {
                    key,
                    cancel: cancel.clone(),
                    rx,
                },
            );
            (cancel, tx)
        };

        let result = match self.permits.acquire().await {
            Ok(_permit) => {
                let ctx = TaskContext::new(format!("filter:{source}"), cancel, progress);
                f(ctx).await
            }
            Err(_) => Err(FilterError::Cancelled),
        };

        let shared: SharedOutcome = match result {
            Ok(outcome) => Ok(Arc::new(outcome)),
            Err(e) => Err(Arc::new(e)),
        };
        // publish for collapsed waiters, then retire the slot if still ours...
        let _ = tx.send(Some(shared.clone()));
        let mut pending = self.lock();
        if pending.get(&source).is_some_and(|p| p.key == key) {
            pending.remove(&source);
        }
        shared
    }

    /// Cancel whatever task is pending on a layer; used when the host
    /// reports the layer edited or removed.
    pub fn cancel_layer(&self, layer: &LayerRef) {
        if let Some(p) = self.lock().get(layer) {
            p.cancel.cancel();
        }
    }

    async fn await_shared(mut rx: watch::Receiver<Option<SharedOutcome>>) -> SharedOutcome {
        loop {
            if let Some(result) = rx.borrow().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(Arc::new(FilterError::Cancelled));
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<LayerRef, PendingTask>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}
