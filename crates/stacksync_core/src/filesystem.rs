use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use walkdir::WalkDir;

use crate::api::Item;
use crate::plan::is_remote_uid;

pub const DEFAULT_LOCALE: &str = "default";

/// One locale version of an entry as stored on disk: `<base>.yaml` holds the
/// default locale, `<base>.<locale>.yaml` the localized variants.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryLocaleVersion {
    pub locale: String,
    pub entry: Item,
}

/// A local keyed collection plus the file each item came from, so removals
/// can target the right path without re-deriving filenames.
#[derive(Debug, Clone, Default)]
pub struct LocalCollection {
    pub items: BTreeMap<String, Item>,
    pub paths: BTreeMap<String, PathBuf>,
}

pub fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let rendered = serde_yaml::to_string(value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    fs::write(path, rendered).with_context(|| format!("failed to write {}", path.display()))
}

/// Load every item file in a kind directory, keyed by title. A missing
/// directory is an empty collection, not an error.
pub fn load_collection(dir: &Path) -> Result<LocalCollection> {
    let mut collection = LocalCollection::default();
    if !dir.exists() {
        return Ok(collection);
    }

    for entry in WalkDir::new(dir).max_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to scan {}", dir.display()))?;
        if !entry.file_type().is_file() || !is_yaml(entry.path()) {
            continue;
        }
        let item: Item = read_yaml(entry.path())?;
        collection
            .paths
            .insert(item.title.clone(), entry.path().to_path_buf());
        collection.items.insert(item.title.clone(), item);
    }

    Ok(collection)
}

/// Like `load_collection` but only base entry files; locale variants
/// (`<base>.<locale>.yaml`) are indexed separately per entry.
pub fn load_entry_collection(dir: &Path) -> Result<LocalCollection> {
    let mut collection = LocalCollection::default();
    if !dir.exists() {
        return Ok(collection);
    }

    for entry in WalkDir::new(dir).max_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to scan {}", dir.display()))?;
        if !entry.file_type().is_file() || !is_yaml(entry.path()) {
            continue;
        }
        if file_stem(entry.path()).contains('.') {
            continue;
        }
        let item: Item = read_yaml(entry.path())?;
        collection
            .paths
            .insert(item.title.clone(), entry.path().to_path_buf());
        collection.items.insert(item.title.clone(), item);
    }

    Ok(collection)
}

/// All locale versions of one entry, default locale first, then localized
/// variants in locale order.
pub fn load_entry_locale_versions(dir: &Path, base: &str) -> Result<Vec<EntryLocaleVersion>> {
    let mut versions = Vec::new();

    let base_path = dir.join(format!("{base}.yaml"));
    if base_path.exists() {
        versions.push(EntryLocaleVersion {
            locale: DEFAULT_LOCALE.to_string(),
            entry: read_yaml(&base_path)?,
        });
    }

    let mut localized = Vec::new();
    if dir.exists() {
        let prefix = format!("{base}.");
        for entry in WalkDir::new(dir).max_depth(1).sort_by_file_name() {
            let entry = entry.with_context(|| format!("failed to scan {}", dir.display()))?;
            if !entry.file_type().is_file() || !is_yaml(entry.path()) {
                continue;
            }
            let stem = file_stem(entry.path());
            if let Some(locale) = stem.strip_prefix(&prefix)
                && !locale.is_empty()
                && !locale.contains('.')
            {
                localized.push(EntryLocaleVersion {
                    locale: locale.to_string(),
                    entry: read_yaml(entry.path())?,
                });
            }
        }
    }
    localized.sort_by(|a, b| a.locale.cmp(&b.locale));
    versions.extend(localized);

    Ok(versions)
}

pub fn entry_locale_path(dir: &Path, base: &str, locale: Option<&str>) -> PathBuf {
    match locale {
        None => dir.join(format!("{base}.yaml")),
        Some(locale) => dir.join(format!("{base}.{locale}.yaml")),
    }
}

/// Write one item into a kind directory. Items the remote has already named
/// use their uid as filename; everything else falls back to a title slug.
pub fn write_item(dir: &Path, item: &Item) -> Result<PathBuf> {
    let name = if is_remote_uid(&item.uid) {
        item.uid.clone()
    } else {
        slugify(&item.title)
    };
    let path = dir.join(format!("{name}.yaml"));
    write_yaml(&path, item)?;
    Ok(path)
}

pub fn remove_file(path: &Path) -> Result<()> {
    fs::remove_file(path).with_context(|| format!("failed to remove {}", path.display()))
}

/// Stable filesystem names for a set of titles. Slug collisions get a
/// numeric suffix in title order, so the mapping is deterministic.
pub fn generate_filenames<'a, I>(titles: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut names = BTreeMap::new();
    let mut used: BTreeMap<String, usize> = BTreeMap::new();

    let mut sorted: Vec<&str> = titles.into_iter().collect();
    sorted.sort_unstable();

    for title in sorted {
        let slug = slugify(title);
        let count = used.entry(slug.clone()).or_insert(0);
        *count += 1;
        let name = if *count == 1 {
            slug
        } else {
            format!("{slug}-{count}")
        };
        names.insert(title.to_string(), name);
    }

    names
}

pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_was_dash = true;
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_was_dash = false;
        } else if !last_was_dash {
            slug.push('-');
            last_was_dash = true;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

fn is_yaml(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("yaml")
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default()
        .to_string()
}
