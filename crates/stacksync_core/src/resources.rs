use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;

use crate::api::{CmsApi, Item, ResourceKind};
use crate::canonical;
use crate::config::DeletionStrategy;
use crate::filesystem::{load_collection, remove_file, write_item};
use crate::plan::plan_merge;
use crate::process::{MergeActions, ProgressSink, TransferResults, process_plan};
use crate::runtime::ResolvedPaths;

/// Remote-side actions for the flat resource kinds. All four kinds share one
/// shape: titles are the primary key and the payload goes over the wire as-is.
struct ResourcePusher<'a> {
    api: &'a dyn CmsApi,
    kind: ResourceKind,
    remote_by_title: BTreeMap<String, Item>,
}

#[async_trait]
impl MergeActions<Item> for ResourcePusher<'_> {
    async fn create(&self, _key: &str, item: &Item) -> Result<()> {
        self.api.create_item(self.kind, item).await?;
        Ok(())
    }

    async fn update(&self, key: &str, item: &Item) -> Result<()> {
        let Some(remote) = self.remote_by_title.get(key) else {
            bail!(
                "{} \"{key}\" was planned as an update but has no remote match",
                self.kind.singular()
            );
        };
        self.api.update_item(self.kind, &remote.uid, item).await?;
        Ok(())
    }

    async fn remove(&self, _key: &str, item: &Item) -> Result<()> {
        self.api.delete_item(self.kind, &item.uid).await?;
        Ok(())
    }
}

/// Local-side actions used by pull: creates and updates write item files,
/// removes delete the file a stale local item came from.
struct FileWriter {
    dir: PathBuf,
    local_paths: BTreeMap<String, PathBuf>,
}

#[async_trait]
impl MergeActions<Item> for FileWriter {
    async fn create(&self, _key: &str, item: &Item) -> Result<()> {
        write_item(&self.dir, item)?;
        Ok(())
    }

    async fn update(&self, key: &str, item: &Item) -> Result<()> {
        // Rewrite in place so a hand-named local file keeps its name.
        match self.local_paths.get(key) {
            Some(path) => crate::filesystem::write_yaml(path, item),
            None => write_item(&self.dir, item).map(|_| ()),
        }
    }

    async fn remove(&self, key: &str, _item: &Item) -> Result<()> {
        let Some(path) = self.local_paths.get(key) else {
            bail!("no local file recorded for \"{key}\"");
        };
        remove_file(path)
    }
}

/// Push one resource kind: local YAML files are the source of truth.
pub async fn push_resources(
    api: &dyn CmsApi,
    paths: &ResolvedPaths,
    kind: ResourceKind,
    deletion_strategy: DeletionStrategy,
    progress: &dyn ProgressSink,
) -> Result<TransferResults> {
    let local = load_collection(&paths.kind_dir(kind))?;
    let remote_by_title = fetch_keyed(api, kind).await?;

    let plan = plan_merge(canonical::equivalent, &local.items, &remote_by_title);
    progress.begin(kind.display_name(), plan.work_len(deletion_strategy));

    let pusher = ResourcePusher {
        api,
        kind,
        remote_by_title,
    };
    Ok(process_plan(&pusher, &plan, deletion_strategy, progress).await)
}

/// Pull one resource kind: the remote collection is the source of truth and
/// the kind directory is rewritten to mirror it.
pub async fn pull_resources(
    api: &dyn CmsApi,
    paths: &ResolvedPaths,
    kind: ResourceKind,
    deletion_strategy: DeletionStrategy,
    progress: &dyn ProgressSink,
) -> Result<TransferResults> {
    let dir = paths.kind_dir(kind);
    let local = load_collection(&dir)?;
    let remote_by_title = fetch_keyed(api, kind).await?;

    let plan = plan_merge(canonical::equivalent, &remote_by_title, &local.items);
    progress.begin(kind.display_name(), plan.work_len(deletion_strategy));

    let writer = FileWriter {
        dir,
        local_paths: local.paths,
    };
    Ok(process_plan(&writer, &plan, deletion_strategy, progress).await)
}

async fn fetch_keyed(
    api: &dyn CmsApi,
    kind: ResourceKind,
) -> Result<BTreeMap<String, Item>> {
    let remote = api
        .get_items(kind)
        .await
        .with_context(|| format!("failed to fetch {}", kind.display_name()))?;
    Ok(remote
        .into_iter()
        .map(|item| (item.title.clone(), item))
        .collect())
}
