use crate::{
    cancel::Outcome,
    context::AnalysisContext,
    item::{Item, DEFAULT_CATEGORY},
    network::DependencyGraph,
};
use serde::{Deserialize, Serialize};
use std::{
    cmp::{Ordering, Reverse},
    collections::{BTreeMap, BTreeSet, BinaryHeap},
};
use tracing::{debug, info, warn};

/// Ready-queue key: category priority, then current position, then folder name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderKey {
    pub category_priority: i32,
    pub position: usize,
    pub folder: String,
}

impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        let priority = self.category_priority.cmp(&other.category_priority);
        if priority != Ordering::Equal {
            return priority;
        }
        let position = self.position.cmp(&other.position);
        if position != Ordering::Equal {
            return position;
        }
        self.folder.cmp(&other.folder)
    }
}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortedOrder {
    /// Installed folders, lowest priority first.
    pub order: Vec<String>,
    /// Folders whose incoming constraints were dropped to get past a cycle.
    pub cycle_breaks: Vec<String>,
}

/// Priority-aware Kahn sort over installed folders. Only requirements whose provider
/// is installed constrain the result.
pub fn topological_order(
    ctx: &AnalysisContext,
    graph: &DependencyGraph,
    items: &BTreeMap<String, Item>,
) -> Outcome<SortedOrder> {
    let installed = &ctx.installed;
    let positions = installed.positions();
    let folders = installed.installed_order();

    let mut keys: BTreeMap<&str, OrderKey> = BTreeMap::new();
    for folder in &folders {
        let category = installed
            .folder_to_id
            .get(folder)
            .and_then(|id| items.get(id))
            .map(|item| item.category.as_str())
            .unwrap_or(DEFAULT_CATEGORY);
        keys.insert(
            folder,
            OrderKey {
                category_priority: ctx.settings.category_priority(category),
                position: positions.get(folder.as_str()).copied().unwrap_or(usize::MAX),
                folder: folder.clone(),
            },
        );
    }

    let mut dependents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let mut in_degree: BTreeMap<&str, usize> = folders.iter().map(|f| (f.as_str(), 0)).collect();
    for folder in &folders {
        let Some(id) = installed.folder_to_id.get(folder) else {
            continue;
        };
        if ctx.rules.skips_requirements_of(id) {
            continue;
        }
        for edge in graph.requirements_of(id) {
            let provider_id = ctx.effective_id(&edge.target);
            for provider in installed.folders_of(provider_id) {
                if provider == folder {
                    continue;
                }
                if dependents
                    .entry(provider.as_str())
                    .or_default()
                    .insert(folder.as_str())
                {
                    *in_degree.entry(folder.as_str()).or_default() += 1;
                }
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<OrderKey>> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .filter_map(|(folder, _)| keys.get(folder).cloned())
        .map(Reverse)
        .collect();
    let mut placed: BTreeSet<&str> = BTreeSet::new();
    let mut order = Vec::with_capacity(folders.len());
    let mut cycle_breaks = Vec::new();

    while order.len() < folders.len() {
        if ctx.is_cancelled() {
            return Outcome::Cancelled;
        }
        let Some(Reverse(next)) = ready.pop() else {
            let Some(stuck) = keys
                .values()
                .filter(|key| !placed.contains(key.folder.as_str()))
                .min()
                .cloned()
            else {
                break;
            };
            warn!("dependency cycle: placing {} before its requirements", stuck.folder);
            in_degree.insert(keys_ref(&keys, &stuck.folder), 0);
            cycle_breaks.push(stuck.folder.clone());
            ready.push(Reverse(stuck));
            continue;
        };
        let folder = keys_ref(&keys, &next.folder);
        if !placed.insert(folder) {
            continue;
        }
        order.push(next.folder.clone());
        let Some(children) = dependents.get(folder) else {
            continue;
        };
        for child in children {
            if placed.contains(child) {
                continue;
            }
            let Some(degree) = in_degree.get_mut(child) else {
                continue;
            };
            if *degree == 0 {
                continue;
            }
            *degree -= 1;
            if *degree == 0 {
                if let Some(key) = keys.get(child) {
                    ready.push(Reverse(key.clone()));
                }
            }
        }
    }

    debug!("sorted {} folder(s)", order.len());
    if !cycle_breaks.is_empty() {
        info!("{} cycle break(s): {}", cycle_breaks.len(), cycle_breaks.join(", "));
    }
    Outcome::Completed(SortedOrder {
        order,
        cycle_breaks,
    })
}

/// The map-owned copy of a folder name, so borrows outlive the popped key.
fn keys_ref<'a>(keys: &BTreeMap<&'a str, OrderKey>, folder: &str) -> &'a str {
    keys.get_key_value(folder).map(|(key, _)| *key).unwrap_or_default()
}
