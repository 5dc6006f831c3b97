use std::collections::{BTreeMap, BTreeSet};

use crate::api::Item;
use crate::config::DeletionStrategy;
use crate::process::Diagnostics;

/// Prefix carried by every uid the remote system assigns. Anything else is a
/// local placeholder and must not participate in uid-based matching.
pub const REMOTE_UID_PREFIX: &str = "blt";

pub fn is_remote_uid(uid: &str) -> bool {
    uid.starts_with(REMOTE_UID_PREFIX)
}

/// Four-way partition of a local/remote comparison. Partitions are disjoint;
/// together their keys cover the union of both key sets.
#[derive(Debug, Clone)]
pub struct MergePlan<T> {
    /// Exists locally, not remotely.
    pub to_create: BTreeMap<String, T>,
    /// Exists on both sides and differs; the local version wins.
    pub to_update: BTreeMap<String, T>,
    /// Exists on both sides and is equivalent.
    pub to_skip: BTreeSet<String>,
    /// Exists remotely, not locally.
    pub to_remove: BTreeMap<String, T>,
}

// Derived Default would demand T: Default, which plan items need not be.
impl<T> Default for MergePlan<T> {
    fn default() -> Self {
        Self {
            to_create: BTreeMap::new(),
            to_update: BTreeMap::new(),
            to_skip: BTreeSet::new(),
            to_remove: BTreeMap::new(),
        }
    }
}

impl<T> MergePlan<T> {
    /// Items the processor will actually touch under the given deletion
    /// policy: skips never count, removals only when they will be applied.
    pub fn work_len(&self, deletion_strategy: DeletionStrategy) -> usize {
        let removals = match deletion_strategy {
            DeletionStrategy::Delete => self.to_remove.len(),
            DeletionStrategy::Ignore => 0,
        };
        self.to_create.len() + self.to_update.len() + removals
    }

    pub fn is_noop(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_remove.is_empty()
    }
}

/// Classify every key of two keyed collections: local-only keys are creates,
/// remote-only keys are removes, shared keys are updates or skips depending
/// on the equality predicate. Each key lands in exactly one partition.
pub fn plan_merge<T, F>(
    equals: F,
    local: &BTreeMap<String, T>,
    remote: &BTreeMap<String, T>,
) -> MergePlan<T>
where
    T: Clone,
    F: Fn(&T, &T) -> bool,
{
    let mut plan = MergePlan::default();

    for (key, local_item) in local {
        match remote.get(key) {
            None => {
                plan.to_create.insert(key.clone(), local_item.clone());
            }
            Some(remote_item) if equals(local_item, remote_item) => {
                plan.to_skip.insert(key.clone());
            }
            Some(_) => {
                plan.to_update.insert(key.clone(), local_item.clone());
            }
        }
    }

    for (key, remote_item) in remote {
        if !local.contains_key(key) {
            plan.to_remove.insert(key.clone(), remote_item.clone());
        }
    }

    plan
}

/// Entry-specialized planning: entries carry a stable uid distinct from their
/// title, and the title may differ across locales or edits. Match by uid
/// first, fall back to title matching, and only then classify the leftover
/// remote titles as removes.
pub fn plan_entry_merge<F>(
    equals: F,
    local: &BTreeMap<String, Item>,
    remote: &BTreeMap<String, Item>,
    diagnostics: &dyn Diagnostics,
) -> MergePlan<Item>
where
    F: Fn(&Item, &Item) -> bool,
{
    let remote_by_uid: BTreeMap<&str, &Item> = remote
        .values()
        .filter(|entry| is_remote_uid(&entry.uid))
        .map(|entry| (entry.uid.as_str(), entry))
        .collect();

    let mut plan = MergePlan::default();
    // Remote titles consumed by either pass; whatever is left is a remove.
    let mut matched: BTreeSet<String> = BTreeSet::new();

    for (title, local_entry) in local {
        if is_remote_uid(&local_entry.uid) {
            if let Some(remote_entry) = remote_by_uid.get(local_entry.uid.as_str()) {
                matched.insert(remote_entry.title.clone());
                if equals(local_entry, remote_entry) {
                    plan.to_skip.insert(title.clone());
                } else {
                    plan.to_update.insert(title.clone(), local_entry.clone());
                }
                continue;
            }
            diagnostics.warn(&format!(
                "Entry \"{title}\" has uid {} but was not found remotely. It will be created.",
                local_entry.uid
            ));
        }

        match remote.get(title) {
            Some(remote_entry) => {
                matched.insert(remote_entry.title.clone());
                if equals(local_entry, remote_entry) {
                    plan.to_skip.insert(title.clone());
                } else {
                    plan.to_update.insert(title.clone(), local_entry.clone());
                }
            }
            None => {
                plan.to_create.insert(title.clone(), local_entry.clone());
            }
        }
    }

    for (title, remote_entry) in remote {
        if !matched.contains(title) {
            plan.to_remove.insert(title.clone(), remote_entry.clone());
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::NullDiagnostics;

    fn keyed(items: &[(&str, &str)]) -> BTreeMap<String, Item> {
        items
            .iter()
            .map(|(title, uid)| (title.to_string(), Item::new(uid, title)))
            .collect()
    }

    fn by_content(a: &Item, b: &Item) -> bool {
        crate::canonical::equivalent(a, b)
    }

    #[test]
    fn disjoint_sets_split_into_create_and_remove() {
        let local = keyed(&[("Alpha", ""), ("Beta", "")]);
        let remote = keyed(&[("Gamma", "blt3")]);

        let plan = plan_merge(by_content, &local, &remote);

        assert_eq!(plan.to_create.len(), 2);
        assert!(plan.to_create.contains_key("Alpha"));
        assert!(plan.to_create.contains_key("Beta"));
        assert_eq!(plan.to_remove.len(), 1);
        assert!(plan.to_remove.contains_key("Gamma"));
        assert!(plan.to_update.is_empty());
        assert!(plan.to_skip.is_empty());
    }

    #[test]
    fn shared_keys_split_by_equality() {
        let mut local = keyed(&[("Same", ""), ("Changed", "")]);
        local
            .get_mut("Changed")
            .expect("changed")
            .fields
            .insert("body".to_string(), serde_json::json!("local text"));
        let remote = keyed(&[("Same", "blt1"), ("Changed", "blt2")]);

        let plan = plan_merge(by_content, &local, &remote);

        assert!(plan.to_skip.contains("Same"));
        assert!(plan.to_update.contains_key("Changed"));
        assert!(plan.to_create.is_empty());
        assert!(plan.to_remove.is_empty());
    }

    #[test]
    fn no_key_is_classified_twice() {
        let local = keyed(&[("A", ""), ("B", ""), ("C", "")]);
        let remote = keyed(&[("B", "blt1"), ("C", "blt2"), ("D", "blt3")]);

        let plan = plan_merge(|_, _| false, &local, &remote);

        let mut seen = BTreeSet::new();
        for key in plan
            .to_create
            .keys()
            .chain(plan.to_update.keys())
            .chain(plan.to_remove.keys())
            .chain(plan.to_skip.iter())
        {
            assert!(seen.insert(key.clone()), "{key} classified twice");
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn plan_merge_accepts_items_without_a_default() {
        #[derive(Clone, PartialEq)]
        struct Opaque(&'static str);

        let local: BTreeMap<String, Opaque> =
            [("A".to_string(), Opaque("a"))].into_iter().collect();
        let remote: BTreeMap<String, Opaque> =
            [("B".to_string(), Opaque("b"))].into_iter().collect();

        let plan = plan_merge(|a, b| a == b, &local, &remote);
        assert!(plan.to_create.contains_key("A"));
        assert!(plan.to_remove.contains_key("B"));
    }

    #[test]
    fn work_len_counts_removals_only_when_they_will_run() {
        let local = keyed(&[("New", "")]);
        let remote = keyed(&[("Stale", "blt1")]);
        let plan = plan_merge(by_content, &local, &remote);

        assert_eq!(plan.work_len(DeletionStrategy::Delete), 2);
        assert_eq!(plan.work_len(DeletionStrategy::Ignore), 1);
        assert!(!plan.is_noop());
        assert!(MergePlan::<Item>::default().is_noop());
    }

    #[test]
    fn entry_merge_matches_by_uid_despite_title_change() {
        let local = keyed(&[("Chinese Title", "blt123")]);
        let remote = keyed(&[("English Title", "blt123")]);

        let plan = plan_entry_merge(by_content, &local, &remote, &NullDiagnostics);

        assert!(plan.to_update.contains_key("Chinese Title"));
        assert!(plan.to_create.is_empty());
        assert!(plan.to_remove.is_empty());
    }

    #[test]
    fn entry_merge_skips_uid_match_when_equivalent() {
        // Titles differ but title participates in content equality, so force
        // equality with a predicate that only inspects a payload field.
        let mut local = keyed(&[("Titre", "blt9")]);
        let mut remote = keyed(&[("Title", "blt9")]);
        local
            .get_mut("Titre")
            .expect("local")
            .fields
            .insert("body".to_string(), serde_json::json!("same"));
        remote
            .get_mut("Title")
            .expect("remote")
            .fields
            .insert("body".to_string(), serde_json::json!("same"));

        let plan = plan_entry_merge(
            |a, b| a.fields.get("body") == b.fields.get("body"),
            &local,
            &remote,
            &NullDiagnostics,
        );

        assert!(plan.to_skip.contains("Titre"));
        assert!(plan.to_remove.is_empty());
    }

    #[test]
    fn entry_with_stale_uid_falls_back_to_title_then_create() {
        // The uid looks remote but no longer exists there; the title is also
        // absent, so the entry is re-created.
        let local = keyed(&[("Ghost", "blt404")]);
        let remote = keyed(&[("Other", "blt1")]);

        let plan = plan_entry_merge(by_content, &local, &remote, &NullDiagnostics);

        assert!(plan.to_create.contains_key("Ghost"));
        assert!(plan.to_remove.contains_key("Other"));
    }

    #[test]
    fn synthetic_uids_do_not_participate_in_uid_matching() {
        let local = keyed(&[("Draft", "local-0001")]);
        let remote = keyed(&[("Draft", "blt77")]);

        let plan = plan_entry_merge(by_content, &local, &remote, &NullDiagnostics);

        // Matched by title; uid difference alone is not a content difference.
        assert!(plan.to_skip.contains("Draft"));
    }

    #[test]
    fn uid_matched_remote_title_is_not_also_removed() {
        // One local entry matches remote "English Title" by uid; the other
        // remote entry is genuinely gone.
        let local = keyed(&[("Chinese Title", "blt123")]);
        let remote = keyed(&[("English Title", "blt123"), ("Stale", "blt9")]);

        let plan = plan_entry_merge(by_content, &local, &remote, &NullDiagnostics);

        assert_eq!(plan.to_remove.len(), 1);
        assert!(plan.to_remove.contains_key("Stale"));
    }
}
