use anyhow::Result;
use serde::Serialize;

use crate::api::{CmsApi, ResourceKind};
use crate::config::DeletionStrategy;
use crate::entries::{entries_module_name, pull_entries};
use crate::labels::{LABELS_MODULE, pull_labels};
use crate::process::{Diagnostics, ProgressSink, TransferResults};
use crate::resources::pull_resources;
use crate::runtime::ResolvedPaths;

/// Per-module result of one sync run.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleOutcome {
    pub module: String,
    pub results: TransferResults,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PullReport {
    pub success: bool,
    pub modules: Vec<ModuleOutcome>,
    /// Module-level failures that prevented a module from running at all,
    /// as opposed to per-item failures inside `modules`.
    pub errors: Vec<String>,
    pub request_count: usize,
}

impl PullReport {
    fn record(&mut self, module: &str, outcome: Result<TransferResults>) {
        match outcome {
            Ok(results) => self.modules.push(ModuleOutcome {
                module: module.to_string(),
                results,
            }),
            Err(error) => self.errors.push(format!("{module}: {error:#}")),
        }
    }

    fn finalize(&mut self, request_count: usize) {
        self.request_count = request_count;
        self.success = self.errors.is_empty()
            && self.modules.iter().all(|outcome| outcome.results.success());
    }
}

/// Mirror the whole remote stack into the schema directory. One module's
/// failure is recorded and the remaining modules still run.
pub async fn pull_stack(
    api: &dyn CmsApi,
    paths: &ResolvedPaths,
    deletion_strategy: DeletionStrategy,
    progress: &dyn ProgressSink,
    diagnostics: &dyn Diagnostics,
) -> Result<PullReport> {
    let mut report = PullReport::default();

    for kind in ResourceKind::ALL {
        report.record(
            kind.display_name(),
            pull_resources(api, paths, kind, deletion_strategy, progress).await,
        );
    }

    report.record(
        LABELS_MODULE,
        pull_labels(api, paths, progress).await,
    );

    // Entries depend on content types, so the list comes from the remote
    // side rather than whatever the local mirror held before this run.
    match api.get_items(ResourceKind::ContentType).await {
        Ok(mut content_types) => {
            content_types.sort_by(|a, b| a.title.cmp(&b.title));
            for content_type in &content_types {
                if content_type.uid.is_empty() {
                    diagnostics.warn(&format!(
                        "content type \"{}\" has no uid, skipping its entries",
                        content_type.title
                    ));
                    continue;
                }
                report.record(
                    &entries_module_name(&content_type.uid),
                    pull_entries(
                        api,
                        paths,
                        &content_type.uid,
                        deletion_strategy,
                        progress,
                        diagnostics,
                    )
                    .await,
                );
            }
        }
        Err(error) => report
            .errors
            .push(format!("Entries: {error:#}")),
    }

    report.finalize(api.request_count());
    Ok(report)
}
