use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::config::DeletionStrategy;
use crate::plan::MergePlan;

/// Incremental progress reporting, injected by the caller. The CLI renders
/// it; tests pass a null or recording sink.
pub trait ProgressSink: Send + Sync {
    /// Announce a unit of work with its total item count.
    fn begin(&self, module: &str, total: usize);
    /// Advance by `n` processed items, successful or not.
    fn advance(&self, n: usize);
}

pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn begin(&self, _module: &str, _total: usize) {}
    fn advance(&self, _n: usize) {}
}

/// Non-fatal anomaly reporting, injected alongside progress.
pub trait Diagnostics: Send + Sync {
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

pub struct NullDiagnostics;

impl Diagnostics for NullDiagnostics {
    fn info(&self, _message: &str) {}
    fn warn(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
}

/// Outcome of one sync module run. Key sets record what succeeded; failures
/// keep the rendered error per key so no item's failure can silently vanish.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransferResults {
    pub created: BTreeSet<String>,
    pub updated: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    pub unmodified: BTreeSet<String>,
    pub failed: BTreeMap<String, String>,
}

impl TransferResults {
    pub fn success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "created {} / updated {} / removed {} / unmodified {} / failed {}",
            self.created.len(),
            self.updated.len(),
            self.removed.len(),
            self.unmodified.len(),
            self.failed.len(),
        )
    }
}

/// The three effectful operations a driver supplies to apply a merge plan.
/// `key` is the plan key (primary key); the item is the side being acted on
/// (local for create/update, remote for remove).
#[async_trait]
pub trait MergeActions<T: Send + Sync>: Send + Sync {
    async fn create(&self, key: &str, item: &T) -> Result<()>;
    async fn update(&self, key: &str, item: &T) -> Result<()>;
    async fn remove(&self, key: &str, item: &T) -> Result<()>;
}

/// Apply a merge plan. Every partition entry is visited exactly once; one
/// item's failure never aborts the batch, it is recorded against that key and
/// the remaining items are still attempted. Progress advances once per
/// create/update/remove item regardless of outcome.
pub async fn process_plan<T, A>(
    actions: &A,
    plan: &MergePlan<T>,
    deletion_strategy: DeletionStrategy,
    progress: &dyn ProgressSink,
) -> TransferResults
where
    T: Send + Sync,
    A: MergeActions<T>,
{
    let mut results = TransferResults::default();

    for (key, item) in &plan.to_create {
        match actions.create(key, item).await {
            Ok(()) => {
                results.created.insert(key.clone());
            }
            Err(error) => {
                results.failed.insert(key.clone(), format!("{error:#}"));
            }
        }
        progress.advance(1);
    }

    for (key, item) in &plan.to_update {
        match actions.update(key, item).await {
            Ok(()) => {
                results.updated.insert(key.clone());
            }
            Err(error) => {
                results.failed.insert(key.clone(), format!("{error:#}"));
            }
        }
        progress.advance(1);
    }

    for (key, item) in &plan.to_remove {
        if deletion_strategy != DeletionStrategy::Delete {
            // Remote-only item left alone by policy: unmodified, not an error.
            results.unmodified.insert(key.clone());
            continue;
        }
        match actions.remove(key, item).await {
            Ok(()) => {
                results.removed.insert(key.clone());
            }
            Err(error) => {
                results.failed.insert(key.clone(), format!("{error:#}"));
            }
        }
        progress.advance(1);
    }

    for key in &plan.to_skip {
        results.unmodified.insert(key.clone());
    }

    results
}
