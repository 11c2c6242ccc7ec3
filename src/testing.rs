//! In-memory fixtures shared by the unit tests.

use crate::{
    cancel::CancelToken,
    config::Settings,
    context::AnalysisContext,
    installed::{InstalledSet, ModList, ModListEntry},
    item::{Item, Requirement},
    rules::RuleSet,
    store::{FetchPolicy, MetadataSource, MetadataStore, SourceError},
};
use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

pub struct FixtureSource {
    items: HashMap<String, Item>,
    unavailable: HashMap<String, String>,
    calls: Mutex<HashMap<String, usize>>,
}

impl FixtureSource {
    pub fn new(items: Vec<Item>) -> Self {
        Self {
            items: items.into_iter().map(|item| (item.id.clone(), item)).collect(),
            unavailable: HashMap::new(),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_unavailable(mut self, id: &str, reason: &str) -> Self {
        self.unavailable.insert(id.to_string(), reason.to_string());
        self
    }

    pub fn fetch_count(&self, id: &str) -> usize {
        self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn policy() -> FetchPolicy {
        FetchPolicy {
            expiration_days: 0,
            max_retries: 3,
            request_delay: Duration::ZERO,
            retry_delay: Duration::ZERO,
            max_workers: 4,
        }
    }
}

impl MetadataSource for FixtureSource {
    fn fetch(&self, id: &str) -> Result<Item, SourceError> {
        *self.calls.lock().unwrap().entry(id.to_string()).or_default() += 1;
        if let Some(reason) = self.unavailable.get(id) {
            return Err(SourceError::Unavailable {
                id: id.to_string(),
                reason: reason.clone(),
            });
        }
        self.items
            .get(id)
            .cloned()
            .ok_or_else(|| SourceError::Transport {
                id: id.to_string(),
                message: "connection refused".to_string(),
            })
    }
}

pub fn item(id: &str, name: &str, category: &str, requires: &[&str]) -> Item {
    let requires: Vec<(&str, &str)> = requires.iter().map(|id| (*id, "")).collect();
    item_with_notes(id, name, category, &requires)
}

pub fn item_with_notes(id: &str, name: &str, category: &str, requires: &[(&str, &str)]) -> Item {
    Item {
        id: id.to_string(),
        name: name.to_string(),
        category: category.to_string(),
        update_timestamp: 0,
        requires: requires
            .iter()
            .map(|(target, notes)| Requirement {
                name: format!("Item {target}"),
                url: format!("https://www.nexusmods.com/skyrimspecialedition/mods/{target}"),
                notes: notes.to_string(),
            })
            .collect(),
        required_by: Vec::new(),
        translations: Vec::new(),
        error: None,
    }
}

/// Builds a priority list, lowest priority first. An empty id marks a separator label.
pub fn mod_list(entries: &[(&str, &str)]) -> ModList {
    ModList::from_entries(
        entries
            .iter()
            .map(|(folder, id)| {
                if id.is_empty() {
                    ModListEntry::separator(folder)
                } else {
                    ModListEntry::item(folder, id)
                }
            })
            .collect(),
    )
}

pub fn installed(entries: &[(&str, &str)]) -> InstalledSet {
    mod_list(entries).snapshot()
}

pub fn context(entries: &[(&str, &str)], rules: RuleSet) -> AnalysisContext {
    AnalysisContext {
        settings: Settings::default(),
        rules,
        installed: installed(entries),
        cancel: CancelToken::new(),
    }
}

pub fn store(dir: &Path, items: Vec<Item>) -> MetadataStore {
    MetadataStore::open(
        &dir.join("cache.json"),
        FixtureSource::policy(),
        Box::new(Arc::new(FixtureSource::new(items))),
    )
    .unwrap()
}
