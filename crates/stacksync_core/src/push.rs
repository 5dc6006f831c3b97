use anyhow::Result;
use serde::Serialize;

use crate::api::{CmsApi, ResourceKind};
use crate::config::DeletionStrategy;
use crate::entries::{entries_module_name, push_entries};
use crate::filesystem::load_collection;
use crate::labels::{LABELS_MODULE, push_labels};
use crate::process::{Diagnostics, ProgressSink, TransferResults};
use crate::pull::ModuleOutcome;
use crate::resources::push_resources;
use crate::runtime::{ResolvedPaths, ensure_ready_for_push};

#[derive(Debug, Clone, Default, Serialize)]
pub struct PushReport {
    pub success: bool,
    pub modules: Vec<ModuleOutcome>,
    pub errors: Vec<String>,
    pub request_count: usize,
}

impl PushReport {
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

/// Push the whole schema directory to the remote stack. Kinds go in
/// dependency order so content-type schemas can reference global fields and
/// taxonomies created in the same run; entries go last, per content type.
pub async fn push_stack(
    api: &dyn CmsApi,
    paths: &ResolvedPaths,
    deletion_strategy: DeletionStrategy,
    progress: &dyn ProgressSink,
    diagnostics: &dyn Diagnostics,
) -> Result<PushReport> {
    ensure_ready_for_push(paths)?;
    let mut report = PushReport::default();

    for kind in ResourceKind::ALL {
        report.record(
            kind.display_name(),
            push_resources(api, paths, kind, deletion_strategy, progress).await,
        );
    }

    report.record(
        LABELS_MODULE,
        push_labels(api, paths, deletion_strategy, progress, diagnostics).await,
    );

    // The local content-type mirror decides which entry directories exist.
    match load_collection(&paths.kind_dir(ResourceKind::ContentType)) {
        Ok(content_types) => {
            for content_type in content_types.items.values() {
                if content_type.uid.is_empty() {
                    diagnostics.warn(&format!(
                        "content type \"{}\" has no uid, skipping its entries",
                        content_type.title
                    ));
                    continue;
                }
                report.record(
                    &entries_module_name(&content_type.uid),
                    push_entries(
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
        Err(error) => report.errors.push(format!("Entries: {error:#}")),
    }

    report.finalize(api.request_count());
    Ok(report)
}
