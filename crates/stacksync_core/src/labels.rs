use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::api::CmsApi;
use crate::canonical;
use crate::config::DeletionStrategy;
use crate::filesystem::{read_yaml, write_yaml};
use crate::plan::{MergePlan, is_remote_uid, plan_merge};
use crate::process::{Diagnostics, ProgressSink, TransferResults};
use crate::runtime::ResolvedPaths;

pub const LABELS_MODULE: &str = "Labels";

/// A label as the management API sees it: flat, with an optional parent uid.
/// The wire format historically sent `parent` as an array; a single uid is
/// the canonical shape, so deserialization accepts both and serialization
/// always emits the scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    pub name: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "parent_from_wire"
    )]
    pub parent: Option<String>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

impl Label {
    pub fn new(uid: &str, name: &str, parent: Option<&str>) -> Self {
        Self {
            uid: uid.to_string(),
            name: name.to_string(),
            parent: parent.map(str::to_string),
            fields: serde_json::Map::new(),
        }
    }
}

fn parent_from_wire<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Null => Ok(None),
        Value::String(uid) if uid.is_empty() => Ok(None),
        Value::String(uid) => Ok(Some(uid)),
        Value::Array(items) => match items.first() {
            None => Ok(None),
            Some(Value::String(uid)) if !uid.is_empty() => Ok(Some(uid.clone())),
            Some(other) => Err(serde::de::Error::custom(format!(
                "parent array must hold a uid string, got {other}"
            ))),
        },
        other => Err(serde::de::Error::custom(format!(
            "parent must be a uid, null, or an array of one uid, got {other}"
        ))),
    }
}

/// The nested form labels take on disk: parentage is expressed by nesting,
/// so the flat `parent` field disappears.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelTreeNode {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<LabelTreeNode>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelFile {
    #[serde(default)]
    pub labels: Vec<LabelTreeNode>,
}

/// Build the nested tree from the flat wire form. Sibling order follows the
/// input order. A parent reference to a uid that is not in the input is
/// fatal: silently re-rooting the child would corrupt the hierarchy.
pub fn organize(labels: &[Label]) -> Result<Vec<LabelTreeNode>> {
    let mut index_of: BTreeMap<&str, usize> = BTreeMap::new();
    for (index, label) in labels.iter().enumerate() {
        if index_of.insert(label.uid.as_str(), index).is_some() {
            bail!("duplicate label uid \"{}\"", label.uid);
        }
    }

    let mut children_of: Vec<Vec<usize>> = vec![Vec::new(); labels.len()];
    let mut roots: Vec<usize> = Vec::new();
    for (index, label) in labels.iter().enumerate() {
        match &label.parent {
            None => roots.push(index),
            Some(parent_uid) => match index_of.get(parent_uid.as_str()) {
                Some(&parent_index) => children_of[parent_index].push(index),
                None => bail!(
                    "label \"{}\" references missing parent \"{parent_uid}\"",
                    label.uid
                ),
            },
        }
    }

    fn build(index: usize, labels: &[Label], children_of: &[Vec<usize>], built: &mut usize) -> LabelTreeNode {
        *built += 1;
        let label = &labels[index];
        LabelTreeNode {
            uid: label.uid.clone(),
            name: label.name.clone(),
            children: children_of[index]
                .iter()
                .map(|&child| build(child, labels, children_of, built))
                .collect(),
            fields: label.fields.clone(),
        }
    }

    let mut built = 0usize;
    let tree: Vec<LabelTreeNode> = roots
        .iter()
        .map(|&root| build(root, labels, &children_of, &mut built))
        .collect();
    if built != labels.len() {
        bail!("label parent references form a cycle");
    }
    Ok(tree)
}

/// Invert `organize`: walk the tree in pre-order, re-deriving each node's
/// `parent` from its position. Parents always precede their children in the
/// output, which is what the push driver relies on. A node with children
/// must carry a uid for those children to reference; emitting them without
/// one would silently re-root them.
pub fn flatten(tree: &[LabelTreeNode]) -> Result<Vec<Label>> {
    fn walk(node: &LabelTreeNode, parent: Option<&str>, out: &mut Vec<Label>) -> Result<()> {
        out.push(Label {
            uid: node.uid.clone(),
            name: node.name.clone(),
            parent: parent.map(str::to_string),
            fields: node.fields.clone(),
        });
        if !node.children.is_empty() && node.uid.is_empty() {
            bail!(
                "label \"{}\" has children but no uid for them to reference as parent",
                node.name
            );
        }
        for child in &node.children {
            walk(child, Some(node.uid.as_str()), out)?;
        }
        Ok(())
    }

    let mut out = Vec::new();
    for node in tree {
        walk(node, None, &mut out)?;
    }
    Ok(out)
}

/// Mirror the remote label hierarchy into `labels.yaml`.
pub async fn pull_labels(
    api: &dyn CmsApi,
    paths: &ResolvedPaths,
    progress: &dyn ProgressSink,
) -> Result<TransferResults> {
    let remote = api.get_labels().await.context("failed to fetch labels")?;
    let tree = organize(&remote)?;
    let file = LabelFile { labels: tree };

    progress.begin(LABELS_MODULE, 1);
    let mut results = TransferResults::default();

    let existing: Option<LabelFile> = if paths.labels_path.exists() {
        Some(read_yaml(&paths.labels_path)?)
    } else {
        None
    };

    // One unit of work either way: the tree is always fetched and compared.
    match existing {
        Some(previous) if canonical::equivalent(&previous, &file) => {
            results.unmodified.insert(LABELS_MODULE.to_string());
        }
        Some(_) => {
            write_yaml(&paths.labels_path, &file)?;
            results.updated.insert(LABELS_MODULE.to_string());
        }
        None => {
            write_yaml(&paths.labels_path, &file)?;
            results.created.insert(LABELS_MODULE.to_string());
        }
    }
    progress.advance(1);

    Ok(results)
}

/// Push the local label tree to the remote. Creates and updates run in
/// flattened pre-order so every parent exists before its children, with a
/// local-to-remote uid map translating parent references as labels get their
/// server-assigned uids. Removals run deepest first.
pub async fn push_labels(
    api: &dyn CmsApi,
    paths: &ResolvedPaths,
    deletion_strategy: DeletionStrategy,
    progress: &dyn ProgressSink,
    diagnostics: &dyn Diagnostics,
) -> Result<TransferResults> {
    let file: LabelFile = if paths.labels_path.exists() {
        read_yaml(&paths.labels_path)?
    } else {
        LabelFile::default()
    };
    let local_flat = flatten(&file.labels)?;

    let mut local_by_name: BTreeMap<String, Label> = BTreeMap::new();
    for label in &local_flat {
        if local_by_name
            .insert(label.name.clone(), label.clone())
            .is_some()
        {
            bail!("duplicate label name \"{}\" in {}", label.name, paths.labels_path.display());
        }
    }

    let remote = api.get_labels().await.context("failed to fetch labels")?;
    let remote_by_name: BTreeMap<String, Label> = remote
        .iter()
        .map(|label| (label.name.clone(), label.clone()))
        .collect();
    let remote_by_uid: BTreeMap<String, Label> = remote
        .iter()
        .map(|label| (label.uid.clone(), label.clone()))
        .collect();

    let plan: MergePlan<Label> = plan_merge(canonical::equivalent, &local_by_name, &remote_by_name);
    progress.begin(LABELS_MODULE, plan.work_len(deletion_strategy));
    let mut results = TransferResults::default();

    // Local file uid (possibly a placeholder) to the uid the remote knows.
    let mut uid_map: BTreeMap<String, String> = BTreeMap::new();
    for (name, local) in &local_by_name {
        if let Some(remote) = remote_by_name.get(name)
            && !local.uid.is_empty()
        {
            uid_map.insert(local.uid.clone(), remote.uid.clone());
        }
    }

    for local in &local_flat {
        let name = &local.name;
        if plan.to_skip.contains(name) {
            results.unmodified.insert(name.clone());
            continue;
        }

        let parent = match resolve_parent(local, &uid_map) {
            Ok(parent) => parent,
            Err(error) => {
                results.failed.insert(name.clone(), format!("{error:#}"));
                progress.advance(1);
                continue;
            }
        };
        let mut outgoing = local.clone();
        outgoing.parent = parent;

        if plan.to_create.contains_key(name) {
            outgoing.uid = String::new();
            match api.create_label(&outgoing).await {
                Ok(created) => {
                    if !local.uid.is_empty() {
                        uid_map.insert(local.uid.clone(), created.uid.clone());
                    }
                    results.created.insert(name.clone());
                }
                Err(error) => {
                    diagnostics.warn(&format!("failed to create label \"{name}\": {error}"));
                    results.failed.insert(name.clone(), format!("{error:#}"));
                }
            }
            progress.advance(1);
        } else if plan.to_update.contains_key(name) {
            let remote_uid = remote_by_name
                .get(name)
                .map(|remote| remote.uid.clone())
                .unwrap_or_default();
            outgoing.uid = remote_uid.clone();
            match api.update_label(&remote_uid, &outgoing).await {
                Ok(_) => {
                    results.updated.insert(name.clone());
                }
                Err(error) => {
                    diagnostics.warn(&format!("failed to update label \"{name}\": {error}"));
                    results.failed.insert(name.clone(), format!("{error:#}"));
                }
            }
            progress.advance(1);
        }
    }

    // Children must go before their parents or the remote rejects the delete.
    let mut removals: Vec<&Label> = plan.to_remove.values().collect();
    removals.sort_by(|a, b| {
        remote_depth(b, &remote_by_uid)
            .cmp(&remote_depth(a, &remote_by_uid))
            .then_with(|| a.name.cmp(&b.name))
    });
    for label in removals {
        if deletion_strategy != DeletionStrategy::Delete {
            results.unmodified.insert(label.name.clone());
            continue;
        }
        match api.delete_label(&label.uid).await {
            Ok(()) => {
                results.removed.insert(label.name.clone());
            }
            Err(error) => {
                diagnostics.warn(&format!(
                    "failed to delete label \"{}\": {error}",
                    label.name
                ));
                results.failed.insert(label.name.clone(), format!("{error:#}"));
            }
        }
        progress.advance(1);
    }

    Ok(results)
}

fn resolve_parent(local: &Label, uid_map: &BTreeMap<String, String>) -> Result<Option<String>> {
    match &local.parent {
        None => Ok(None),
        Some(parent_uid) => {
            if let Some(remote_uid) = uid_map.get(parent_uid) {
                return Ok(Some(remote_uid.clone()));
            }
            if is_remote_uid(parent_uid) {
                return Ok(Some(parent_uid.clone()));
            }
            bail!(
                "parent label \"{parent_uid}\" of \"{}\" has no remote uid yet",
                local.name
            )
        }
    }
}

fn remote_depth(label: &Label, remote_by_uid: &BTreeMap<String, Label>) -> usize {
    let mut depth = 0;
    let mut current = label;
    while let Some(parent_uid) = &current.parent {
        match remote_by_uid.get(parent_uid) {
            Some(parent) if depth < remote_by_uid.len() => {
                depth += 1;
                current = parent;
            }
            _ => break,
        }
    }
    depth
}
