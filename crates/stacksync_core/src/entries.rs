use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures::future::try_join_all;
use futures::stream::{self, StreamExt};

use crate::api::{ApiError, CmsApi, Item};
use crate::canonical;
use crate::config::DeletionStrategy;
use crate::filesystem::{
    self, EntryLocaleVersion, entry_locale_path, generate_filenames, load_entry_collection,
    load_entry_locale_versions, read_yaml, write_yaml,
};
use crate::plan::{is_remote_uid, plan_entry_merge};
use crate::process::{Diagnostics, MergeActions, ProgressSink, TransferResults, process_plan};
use crate::runtime::ResolvedPaths;

const LOCALE_CONCURRENCY: usize = 4;

pub fn entries_module_name(content_type_uid: &str) -> String {
    format!("Entries: {content_type_uid}")
}

/// Applies an entry merge plan for one content type. Each local entry is a
/// base file plus optional locale variants; the default locale drives
/// matching and the variants fan out after it lands.
pub struct EntryPusher<'a> {
    api: &'a dyn CmsApi,
    content_type_uid: String,
    entries_dir: PathBuf,
    local_paths: BTreeMap<String, PathBuf>,
    remote_by_title: BTreeMap<String, Item>,
    remote_by_uid: BTreeMap<String, Item>,
    diagnostics: &'a dyn Diagnostics,
}

impl<'a> EntryPusher<'a> {
    fn local_versions(&self, title: &str) -> Result<Vec<EntryLocaleVersion>> {
        let base = self
            .local_paths
            .get(title)
            .and_then(|path| path.file_stem())
            .and_then(|stem| stem.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| filesystem::slugify(title));
        let versions = load_entry_locale_versions(&self.entries_dir, &base)?;
        if versions.is_empty() {
            bail!("no local file found for entry \"{title}\"");
        }
        Ok(versions)
    }

    /// Import one locale version, retrying once when the remote rejects a
    /// reference. References to entries created moments ago can lag; a second
    /// attempt usually lands. Both errors are surfaced if it does not.
    async fn import_with_reference_retry(
        &self,
        entry: &Item,
        overwrite: bool,
        locale: Option<&str>,
    ) -> Result<Item> {
        match self
            .api
            .import_entry(&self.content_type_uid, entry, overwrite, locale)
            .await
        {
            Ok(imported) => Ok(imported),
            Err(first @ ApiError::InvalidReference { .. }) => {
                self.diagnostics.warn(&format!(
                    "entry \"{}\" was rejected for an invalid reference, retrying once: {first}",
                    entry.title
                ));
                match self
                    .api
                    .import_entry(&self.content_type_uid, entry, overwrite, locale)
                    .await
                {
                    Ok(imported) => Ok(imported),
                    Err(second) => bail!(
                        "entry \"{}\" failed twice: first: {first}; retry: {second}",
                        entry.title
                    ),
                }
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Apply the localized versions as a bounded concurrent group, capturing
    /// each locale's failure instead of aborting the siblings.
    async fn push_localized_versions(
        &self,
        remote_uid: &str,
        versions: &[EntryLocaleVersion],
    ) -> Result<()> {
        let mut pending = Vec::new();
        for version in versions {
            if version.locale == filesystem::DEFAULT_LOCALE {
                continue;
            }
            let mut entry = version.entry.clone();
            entry.uid = remote_uid.to_string();
            let locale = version.locale.clone();
            pending.push(async move {
                self.import_with_reference_retry(&entry, true, Some(&locale))
                    .await
                    .map(|_| ())
                    .map_err(|error| format!("locale {locale}: {error:#}"))
            });
        }
        let mut failures: Vec<String> = stream::iter(pending)
            .buffer_unordered(LOCALE_CONCURRENCY)
            .filter_map(|result| async move { result.err() })
            .collect()
            .await;
        if failures.is_empty() {
            return Ok(());
        }
        failures.sort();
        bail!("{}", failures.join("; "))
    }

    /// The remote uid a local entry corresponds to: a stable uid carried in
    /// the local file wins, the title match covers entries that were never
    /// pulled with their uid.
    fn resolve_remote_uid(&self, title: &str, item: &Item) -> Option<String> {
        if is_remote_uid(&item.uid) && self.remote_by_uid.contains_key(&item.uid) {
            return Some(item.uid.clone());
        }
        self.remote_by_title
            .get(title)
            .map(|remote| remote.uid.clone())
    }
}

#[async_trait]
impl MergeActions<Item> for EntryPusher<'_> {
    async fn create(&self, key: &str, _item: &Item) -> Result<()> {
        let versions = self.local_versions(key)?;
        let mut outgoing = versions[0].entry.clone();
        outgoing.uid = String::new();

        let created = match self
            .import_with_reference_retry(&outgoing, false, None)
            .await
            .map_err(|error| error.downcast::<ApiError>())
        {
            Ok(created) => created,
            Err(Err(error)) => return Err(error),
            Err(Ok(duplicate @ ApiError::DuplicateTitle { .. })) => {
                // The title exists remotely under a uid the plan did not see,
                // usually left over from a half-finished earlier run. Find it
                // and overwrite in place instead of failing the entry.
                let refreshed = self
                    .api
                    .get_entries(&self.content_type_uid)
                    .await
                    .context("failed to re-query entries after duplicate title")?;
                let Some(existing) = refreshed.iter().find(|entry| entry.title == key) else {
                    return Err(duplicate).with_context(|| {
                        format!("duplicate title reported for \"{key}\" but no such entry found on re-query")
                    });
                };
                self.diagnostics.warn(&format!(
                    "entry \"{key}\" already exists remotely as {}, overwriting",
                    existing.uid
                ));
                outgoing.uid = existing.uid.clone();
                self.import_with_reference_retry(&outgoing, true, None)
                    .await?
            }
            Err(Ok(other)) => return Err(other.into()),
        };

        self.push_localized_versions(&created.uid, &versions).await
    }

    async fn update(&self, key: &str, item: &Item) -> Result<()> {
        let Some(remote_uid) = self.resolve_remote_uid(key, item) else {
            bail!("entry \"{key}\" was planned as an update but has no remote match");
        };

        let versions = self.local_versions(key)?;
        let remote_locales: BTreeSet<String> = self
            .api
            .get_entry_locales(&self.content_type_uid, &remote_uid)
            .await?
            .into_iter()
            .map(|locale| locale.code)
            .collect();
        let local_locales: BTreeSet<&str> = versions
            .iter()
            .filter(|version| version.locale != filesystem::DEFAULT_LOCALE)
            .map(|version| version.locale.as_str())
            .collect();
        for remote_only in remote_locales
            .iter()
            .filter(|code| !local_locales.contains(code.as_str()))
        {
            self.diagnostics.info(&format!(
                "entry \"{key}\" has remote locale {remote_only} with no local file, leaving it untouched"
            ));
        }

        let mut outgoing = versions[0].entry.clone();
        outgoing.uid = remote_uid.clone();
        self.import_with_reference_retry(&outgoing, true, None)
            .await?;

        self.push_localized_versions(&remote_uid, &versions).await
    }

    async fn remove(&self, _key: &str, item: &Item) -> Result<()> {
        self.api
            .delete_entry(&self.content_type_uid, &item.uid)
            .await?;
        Ok(())
    }
}

/// Push all local entries of one content type.
pub async fn push_entries(
    api: &dyn CmsApi,
    paths: &ResolvedPaths,
    content_type_uid: &str,
    deletion_strategy: DeletionStrategy,
    progress: &dyn ProgressSink,
    diagnostics: &dyn Diagnostics,
) -> Result<TransferResults> {
    let entries_dir = paths.entries_dir_for(content_type_uid);
    let local = load_entry_collection(&entries_dir)?;

    let remote = api
        .get_entries(content_type_uid)
        .await
        .with_context(|| format!("failed to fetch entries of {content_type_uid}"))?;
    let remote_by_title: BTreeMap<String, Item> = remote
        .iter()
        .map(|entry| (entry.title.clone(), entry.clone()))
        .collect();
    let remote_by_uid: BTreeMap<String, Item> = remote
        .iter()
        .map(|entry| (entry.uid.clone(), entry.clone()))
        .collect();

    let plan = plan_entry_merge(
        canonical::equivalent,
        &local.items,
        &remote_by_title,
        diagnostics,
    );
    progress.begin(
        &entries_module_name(content_type_uid),
        plan.work_len(deletion_strategy),
    );

    let pusher = EntryPusher {
        api,
        content_type_uid: content_type_uid.to_string(),
        entries_dir,
        local_paths: local.paths,
        remote_by_title,
        remote_by_uid,
        diagnostics,
    };

    Ok(process_plan(&pusher, &plan, deletion_strategy, progress).await)
}

/// Mirror all remote entries of one content type into local files: one base
/// file per entry plus one variant file per additional locale. Local base
/// files with no remote counterpart are removed when the deletion strategy
/// allows it.
pub async fn pull_entries(
    api: &dyn CmsApi,
    paths: &ResolvedPaths,
    content_type_uid: &str,
    deletion_strategy: DeletionStrategy,
    progress: &dyn ProgressSink,
    diagnostics: &dyn Diagnostics,
) -> Result<TransferResults> {
    let entries_dir = paths.entries_dir_for(content_type_uid);
    let local = load_entry_collection(&entries_dir)?;

    let remote = api
        .get_entries(content_type_uid)
        .await
        .with_context(|| format!("failed to fetch entries of {content_type_uid}"))?;
    let filenames = generate_filenames(remote.iter().map(|entry| entry.title.as_str()));

    // Every remote entry is one unit of work (fetched and compared either
    // way); stale local files count only when they will actually be removed.
    let remote_titles: BTreeSet<String> =
        remote.iter().map(|entry| entry.title.clone()).collect();
    let stale: Vec<(&String, &PathBuf)> = local
        .paths
        .iter()
        .filter(|(title, _)| !remote_titles.contains(*title))
        .collect();
    let total = remote.len()
        + match deletion_strategy {
            DeletionStrategy::Delete => stale.len(),
            DeletionStrategy::Ignore => 0,
        };
    progress.begin(&entries_module_name(content_type_uid), total);

    let mut results = TransferResults::default();

    for entry in &remote {
        let base = &filenames[&entry.title];
        match pull_one_entry(api, content_type_uid, &entries_dir, base, entry).await {
            Ok(changed) => {
                if changed {
                    if local.items.contains_key(&entry.title) {
                        results.updated.insert(entry.title.clone());
                    } else {
                        results.created.insert(entry.title.clone());
                    }
                } else {
                    results.unmodified.insert(entry.title.clone());
                }
            }
            Err(error) => {
                diagnostics.warn(&format!(
                    "failed to pull entry \"{}\": {error:#}",
                    entry.title
                ));
                results.failed.insert(entry.title.clone(), format!("{error:#}"));
            }
        }
        progress.advance(1);
    }

    for (title, path) in stale {
        if deletion_strategy != DeletionStrategy::Delete {
            results.unmodified.insert(title.clone());
            continue;
        }
        match remove_entry_files(path) {
            Ok(()) => {
                results.removed.insert(title.clone());
            }
            Err(error) => {
                results.failed.insert(title.clone(), format!("{error:#}"));
            }
        }
        progress.advance(1);
    }

    Ok(results)
}

/// Write one entry's base file and locale variants. Returns whether anything
/// on disk changed.
async fn pull_one_entry(
    api: &dyn CmsApi,
    content_type_uid: &str,
    entries_dir: &std::path::Path,
    base: &str,
    entry: &Item,
) -> Result<bool> {
    let mut changed = write_if_different(&entry_locale_path(entries_dir, base, None), entry)?;

    let locales = api.get_entry_locales(content_type_uid, &entry.uid).await?;
    let localized = locales
        .iter()
        .filter(|locale| locale.fallback_locale.is_some())
        .map(|locale| async move {
            let version = api
                .get_entry(content_type_uid, &entry.uid, Some(&locale.code))
                .await
                .with_context(|| format!("locale {}", locale.code))?;
            anyhow::Ok((locale.code.clone(), version))
        });
    for (code, version) in try_join_all(localized).await? {
        changed |= write_if_different(&entry_locale_path(entries_dir, base, Some(&code)), &version)?;
    }

    Ok(changed)
}

fn write_if_different(path: &std::path::Path, entry: &Item) -> Result<bool> {
    if path.exists() {
        let existing: Item = read_yaml(path)?;
        if canonical::equivalent(&existing, entry) {
            return Ok(false);
        }
    }
    write_yaml(path, entry)?;
    Ok(true)
}

/// Remove an entry's base file along with any `<base>.<locale>.yaml` variants
/// next to it.
fn remove_entry_files(base_path: &std::path::Path) -> Result<()> {
    filesystem::remove_file(base_path)?;

    let Some(dir) = base_path.parent() else {
        return Ok(());
    };
    let Some(base) = base_path.file_stem().and_then(|stem| stem.to_str()) else {
        return Ok(());
    };
    let prefix = format!("{base}.");
    for entry in walkdir::WalkDir::new(dir).max_depth(1) {
        let entry = entry.with_context(|| format!("failed to scan {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.strip_prefix(&prefix).is_some_and(|rest| rest.ends_with(".yaml")) {
            filesystem::remove_file(entry.path())?;
        }
    }
    Ok(())
}
