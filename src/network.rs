use crate::{
    cancel::Outcome,
    context::AnalysisContext,
    item::{Item, Tags},
    store::{MetadataStore, StoreError},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// One annotated "requires" relation. In the forward map `target` is the provider,
/// in the reverse map it is the dependent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub target: String,
    pub notes: String,
    pub tags: Tags,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyGraph {
    pub forward: BTreeMap<String, Vec<Edge>>,
    pub reverse: BTreeMap<String, Vec<Edge>>,
}

impl DependencyGraph {
    /// Records `from` requires `to`. Self references and repeated pairs are dropped.
    pub fn add_edge(&mut self, from: &str, to: &str, notes: &str, tags: Tags) -> bool {
        if from == to {
            return false;
        }
        let forward = self.forward.entry(from.to_string()).or_default();
        if forward.iter().any(|edge| edge.target == to) {
            return false;
        }
        forward.push(Edge {
            target: to.to_string(),
            notes: notes.to_string(),
            tags: tags.clone(),
        });
        self.reverse.entry(to.to_string()).or_default().push(Edge {
            target: from.to_string(),
            notes: notes.to_string(),
            tags,
        });
        true
    }

    pub fn requirements_of(&self, id: &str) -> &[Edge] {
        self.forward.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn requirers_of(&self, id: &str) -> &[Edge] {
        self.reverse.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn edge_count(&self) -> usize {
        self.forward.values().map(Vec::len).sum()
    }
}

/// Everything learned about the installed set and its requirement neighbourhood.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub items: BTreeMap<String, Item>,
    pub graph: DependencyGraph,
    /// Fetched ids plus every id referenced by a requirement.
    pub known_ids: BTreeSet<String>,
}

impl Network {
    pub fn name_of(&self, id: &str) -> String {
        self.items
            .get(id)
            .map(|item| item.name.clone())
            .unwrap_or_else(|| format!("Unknown (ID: {id})"))
    }
}

/// Fetches the installed items and `uninstalled_fetch_depth` layers of their
/// requirements, then assembles the graph from the fetched records.
/// A cancelled build returns nothing so no partial graph escapes.
pub fn build_network(
    ctx: &AnalysisContext,
    store: &MetadataStore,
) -> Result<Outcome<Network>, StoreError> {
    let mut items: BTreeMap<String, Item> = BTreeMap::new();

    info!(
        "network phase 1: fetching {} installed item(s)",
        ctx.installed.installed_ids.len()
    );
    let installed: Vec<String> = ctx.installed.installed_ids.iter().cloned().collect();
    if fetch_layer(ctx, store, &installed, &mut items)?.is_cancelled() {
        return Ok(Outcome::Cancelled);
    }
    let mut frontier = next_frontier(ctx, &items, &installed);

    let depth = ctx.settings.uninstalled_fetch_depth;
    for layer in 0..depth {
        let pending: Vec<String> = frontier
            .iter()
            .filter(|id| !items.contains_key(*id))
            .cloned()
            .collect();
        if pending.is_empty() {
            break;
        }
        info!(
            "network phase 2: layer {}/{depth}, {} uninstalled requirement(s)",
            layer + 1,
            pending.len()
        );
        if fetch_layer(ctx, store, &pending, &mut items)?.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        if ctx.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        frontier = if layer + 1 < depth {
            next_frontier(ctx, &items, &pending)
        } else {
            BTreeSet::new()
        };
    }

    let mut graph = DependencyGraph::default();
    let mut known_ids: BTreeSet<String> = items.keys().cloned().collect();
    for (id, item) in &items {
        if ctx.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        if ctx.rules.skips_requirements_of(id) {
            debug!("skipping requirements of {id}");
            continue;
        }
        for (target, requirement) in item.requirement_targets() {
            graph.add_edge(id, &target, &requirement.notes, requirement.tags());
            known_ids.insert(target);
        }
    }
    info!(
        "network phase 3: {} item(s), {} edge(s), {} known id(s)",
        items.len(),
        graph.edge_count(),
        known_ids.len()
    );

    Ok(Outcome::Completed(Network {
        items,
        graph,
        known_ids,
    }))
}

fn fetch_layer(
    ctx: &AnalysisContext,
    store: &MetadataStore,
    ids: &[String],
    items: &mut BTreeMap<String, Item>,
) -> Result<Outcome<()>, StoreError> {
    if store.prefetch(ids, &ctx.cancel)?.is_cancelled() {
        return Ok(Outcome::Cancelled);
    }
    for id in ids {
        if ctx.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        match store.get(id, &ctx.cancel)? {
            Outcome::Completed(item) => {
                items.insert(id.clone(), item);
            }
            Outcome::Cancelled => return Ok(Outcome::Cancelled),
        }
    }
    Ok(Outcome::Completed(()))
}

/// Requirement ids of `sources` that still need fetching. Ignored ids and the
/// requirements of silenced items are left out.
fn next_frontier(
    ctx: &AnalysisContext,
    items: &BTreeMap<String, Item>,
    sources: &[String],
) -> BTreeSet<String> {
    sources
        .iter()
        .filter(|id| !ctx.rules.skips_requirements_of(id))
        .filter_map(|id| items.get(id))
        .flat_map(|item| item.requirement_targets().map(|(target, _)| target))
        .filter(|target| !ctx.rules.is_ignored(target) && !items.contains_key(target))
        .collect()
}
