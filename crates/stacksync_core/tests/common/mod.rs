#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::json;

use stacksync_core::api::{ApiError, CmsApi, Item, LocaleInfo, ResourceKind};
use stacksync_core::labels::Label;
use stacksync_core::process::{Diagnostics, ProgressSink};

pub const DEFAULT_LOCALE_CODE: &str = "en-us";

/// Captures announced totals and ticks so tests can check they line up.
#[derive(Default)]
pub struct RecordingProgress {
    pub totals: Mutex<Vec<(String, usize)>>,
    pub ticks: AtomicUsize,
}

impl RecordingProgress {
    pub fn announced_total(&self) -> usize {
        self.totals
            .lock()
            .expect("lock")
            .iter()
            .map(|(_, total)| total)
            .sum()
    }

    pub fn ticked(&self) -> usize {
        self.ticks.load(Ordering::Relaxed)
    }
}

impl ProgressSink for RecordingProgress {
    fn begin(&self, module: &str, total: usize) {
        self.totals
            .lock()
            .expect("lock")
            .push((module.to_string(), total));
    }

    fn advance(&self, n: usize) {
        self.ticks.fetch_add(n, Ordering::Relaxed);
    }
}

/// Captures emitted messages, prefixed with their level.
#[derive(Default)]
pub struct RecordingDiagnostics {
    pub messages: Mutex<Vec<String>>,
}

impl RecordingDiagnostics {
    pub fn contains(&self, needle: &str) -> bool {
        self.messages
            .lock()
            .expect("lock")
            .iter()
            .any(|message| message.contains(needle))
    }
}

impl Diagnostics for RecordingDiagnostics {
    fn info(&self, message: &str) {
        self.messages
            .lock()
            .expect("lock")
            .push(format!("info: {message}"));
    }

    fn warn(&self, message: &str) {
        self.messages
            .lock()
            .expect("lock")
            .push(format!("warn: {message}"));
    }

    fn error(&self, message: &str) {
        self.messages
            .lock()
            .expect("lock")
            .push(format!("error: {message}"));
    }
}

/// In-memory stand-in for the management API. Behaves like the real remote
/// where the drivers depend on it: uid assignment, duplicate-title
/// rejection, parent validation for labels, and localized entry storage.
#[derive(Default)]
pub struct MockCms {
    pub state: Mutex<MockState>,
    requests: AtomicUsize,
}

#[derive(Default)]
pub struct MockState {
    pub items: BTreeMap<String, Vec<Item>>,
    pub labels: Vec<Label>,
    pub entries: BTreeMap<String, Vec<Item>>,
    /// (content type uid, entry uid, locale) -> localized payload.
    pub localized: BTreeMap<(String, String, String), Item>,
    pub calls: Vec<String>,
    next_uid: usize,
    /// Pretend the entry collection is empty for the next `get_entries`
    /// call, so a push plans a create that then collides on title.
    pub hide_entries_once: bool,
    /// Fail this many imports with an invalid-reference error first.
    pub fail_imports_with_invalid_reference: usize,
}

impl MockState {
    fn mint_uid(&mut self) -> String {
        self.next_uid += 1;
        format!("blt{:06}", self.next_uid)
    }
}

impl MockCms {
    pub fn with_items(kind: ResourceKind, items: Vec<Item>) -> Self {
        let mock = Self::default();
        mock.state
            .lock()
            .expect("lock")
            .items
            .insert(kind.path().to_string(), items);
        mock
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().expect("lock").calls.clone()
    }

    fn bump(&self, call: String) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.state.lock().expect("lock").calls.push(call);
    }

    fn duplicate_title(key: &str) -> ApiError {
        ApiError::DuplicateTitle {
            key: key.to_string(),
            details: json!({ "title": ["is not unique."] }),
        }
    }

    fn not_found(what: &str) -> ApiError {
        ApiError::Api {
            code: 404,
            message: format!("{what} not found"),
            details: serde_json::Value::Null,
        }
    }
}

#[async_trait]
impl CmsApi for MockCms {
    async fn get_items(&self, kind: ResourceKind) -> Result<Vec<Item>, ApiError> {
        self.bump(format!("get_items {}", kind.path()));
        let state = self.state.lock().expect("lock");
        Ok(state.items.get(kind.path()).cloned().unwrap_or_default())
    }

    async fn create_item(&self, kind: ResourceKind, item: &Item) -> Result<Item, ApiError> {
        self.bump(format!("create_item {} {}", kind.path(), item.title));
        let mut state = self.state.lock().expect("lock");
        let clash = state
            .items
            .get(kind.path())
            .is_some_and(|collection| collection.iter().any(|e| e.title == item.title));
        if clash {
            return Err(Self::duplicate_title(&item.title));
        }
        let mut created = item.clone();
        if created.uid.is_empty() {
            created.uid = state.mint_uid();
        }
        state
            .items
            .entry(kind.path().to_string())
            .or_default()
            .push(created.clone());
        Ok(created)
    }

    async fn update_item(
        &self,
        kind: ResourceKind,
        uid: &str,
        item: &Item,
    ) -> Result<Item, ApiError> {
        self.bump(format!("update_item {} {uid}", kind.path()));
        let mut state = self.state.lock().expect("lock");
        let collection = state.items.entry(kind.path().to_string()).or_default();
        let Some(existing) = collection.iter_mut().find(|existing| existing.uid == uid) else {
            return Err(Self::not_found(kind.singular()));
        };
        let mut updated = item.clone();
        updated.uid = uid.to_string();
        *existing = updated.clone();
        Ok(updated)
    }

    async fn delete_item(&self, kind: ResourceKind, uid: &str) -> Result<(), ApiError> {
        self.bump(format!("delete_item {} {uid}", kind.path()));
        let mut state = self.state.lock().expect("lock");
        let collection = state.items.entry(kind.path().to_string()).or_default();
        let before = collection.len();
        collection.retain(|existing| existing.uid != uid);
        if collection.len() == before {
            return Err(Self::not_found(kind.singular()));
        }
        Ok(())
    }

    async fn get_labels(&self) -> Result<Vec<Label>, ApiError> {
        self.bump("get_labels".to_string());
        Ok(self.state.lock().expect("lock").labels.clone())
    }

    async fn create_label(&self, label: &Label) -> Result<Label, ApiError> {
        self.bump(format!("create_label {}", label.name));
        let mut state = self.state.lock().expect("lock");
        if let Some(parent) = &label.parent
            && !state.labels.iter().any(|existing| &existing.uid == parent)
        {
            return Err(ApiError::InvalidReference {
                key: label.name.clone(),
                detail: format!("parent \"{parent}\" is not valid"),
            });
        }
        let mut created = label.clone();
        created.uid = state.mint_uid();
        state.labels.push(created.clone());
        Ok(created)
    }

    async fn update_label(&self, uid: &str, label: &Label) -> Result<Label, ApiError> {
        self.bump(format!("update_label {uid}"));
        let mut state = self.state.lock().expect("lock");
        let Some(existing) = state.labels.iter_mut().find(|existing| existing.uid == uid) else {
            return Err(Self::not_found("label"));
        };
        let mut updated = label.clone();
        updated.uid = uid.to_string();
        *existing = updated.clone();
        Ok(updated)
    }

    async fn delete_label(&self, uid: &str) -> Result<(), ApiError> {
        self.bump(format!("delete_label {uid}"));
        let mut state = self.state.lock().expect("lock");
        if state
            .labels
            .iter()
            .any(|existing| existing.parent.as_deref() == Some(uid))
        {
            return Err(ApiError::Api {
                code: 422,
                message: "label still has children".to_string(),
                details: serde_json::Value::Null,
            });
        }
        let before = state.labels.len();
        state.labels.retain(|existing| existing.uid != uid);
        if state.labels.len() == before {
            return Err(Self::not_found("label"));
        }
        Ok(())
    }

    async fn get_entries(&self, content_type_uid: &str) -> Result<Vec<Item>, ApiError> {
        self.bump(format!("get_entries {content_type_uid}"));
        let mut state = self.state.lock().expect("lock");
        if state.hide_entries_once {
            state.hide_entries_once = false;
            return Ok(Vec::new());
        }
        Ok(state
            .entries
            .get(content_type_uid)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_entry(
        &self,
        content_type_uid: &str,
        entry_uid: &str,
        locale: Option<&str>,
    ) -> Result<Item, ApiError> {
        self.bump(format!("get_entry {content_type_uid}/{entry_uid}"));
        let state = self.state.lock().expect("lock");
        match locale {
            Some(locale) if locale != DEFAULT_LOCALE_CODE => state
                .localized
                .get(&(
                    content_type_uid.to_string(),
                    entry_uid.to_string(),
                    locale.to_string(),
                ))
                .cloned()
                .ok_or_else(|| Self::not_found("entry locale")),
            _ => state
                .entries
                .get(content_type_uid)
                .and_then(|entries| entries.iter().find(|entry| entry.uid == entry_uid))
                .cloned()
                .ok_or_else(|| Self::not_found("entry")),
        }
    }

    async fn get_entry_locales(
        &self,
        content_type_uid: &str,
        entry_uid: &str,
    ) -> Result<Vec<LocaleInfo>, ApiError> {
        self.bump(format!("get_entry_locales {content_type_uid}/{entry_uid}"));
        let state = self.state.lock().expect("lock");
        let mut locales = vec![LocaleInfo {
            code: DEFAULT_LOCALE_CODE.to_string(),
            name: "English - United States".to_string(),
            uid: "blt_locale_default".to_string(),
            fallback_locale: None,
        }];
        for (ct, uid, code) in state.localized.keys() {
            if ct == content_type_uid && uid == entry_uid {
                locales.push(LocaleInfo {
                    code: code.clone(),
                    name: code.clone(),
                    uid: format!("blt_locale_{code}"),
                    fallback_locale: Some(DEFAULT_LOCALE_CODE.to_string()),
                });
            }
        }
        Ok(locales)
    }

    async fn import_entry(
        &self,
        content_type_uid: &str,
        entry: &Item,
        overwrite: bool,
        locale: Option<&str>,
    ) -> Result<Item, ApiError> {
        self.bump(format!(
            "import_entry {content_type_uid} {} overwrite={overwrite} locale={}",
            entry.title,
            locale.unwrap_or("default")
        ));
        let mut state = self.state.lock().expect("lock");
        if state.fail_imports_with_invalid_reference > 0 {
            state.fail_imports_with_invalid_reference -= 1;
            return Err(ApiError::InvalidReference {
                key: entry.title.clone(),
                detail: "referenced entry is not valid".to_string(),
            });
        }

        match locale {
            Some(locale) => {
                let known = state
                    .entries
                    .get(content_type_uid)
                    .is_some_and(|entries| entries.iter().any(|e| e.uid == entry.uid));
                if !known {
                    return Err(Self::not_found("entry"));
                }
                state.localized.insert(
                    (
                        content_type_uid.to_string(),
                        entry.uid.clone(),
                        locale.to_string(),
                    ),
                    entry.clone(),
                );
                Ok(entry.clone())
            }
            None => {
                let clash = state.entries.get(content_type_uid).is_some_and(|entries| {
                    entries
                        .iter()
                        .any(|e| e.title == entry.title && e.uid != entry.uid)
                });
                if clash && !overwrite {
                    return Err(Self::duplicate_title(&entry.title));
                }
                let mut outgoing = entry.clone();
                if outgoing.uid.is_empty() {
                    outgoing.uid = state.mint_uid();
                }
                let collection = state
                    .entries
                    .entry(content_type_uid.to_string())
                    .or_default();
                if let Some(existing) = collection.iter_mut().find(|e| e.uid == outgoing.uid) {
                    *existing = outgoing.clone();
                } else if let Some(existing) = clash
                    .then(|| collection.iter_mut().find(|e| e.title == outgoing.title))
                    .flatten()
                {
                    outgoing.uid = existing.uid.clone();
                    *existing = outgoing.clone();
                } else {
                    collection.push(outgoing.clone());
                }
                Ok(outgoing)
            }
        }
    }

    async fn delete_entry(
        &self,
        content_type_uid: &str,
        entry_uid: &str,
    ) -> Result<(), ApiError> {
        self.bump(format!("delete_entry {content_type_uid}/{entry_uid}"));
        let mut state = self.state.lock().expect("lock");
        let collection = state
            .entries
            .entry(content_type_uid.to_string())
            .or_default();
        let before = collection.len();
        collection.retain(|entry| entry.uid != entry_uid);
        if collection.len() == before {
            return Err(Self::not_found("entry"));
        }
        state
            .localized
            .retain(|(ct, uid, _), _| !(ct == content_type_uid && uid == entry_uid));
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }
}
