use crate::{
    cancel::Outcome,
    context::AnalysisContext,
    diagnose::{diagnose, Violation},
    files::write_atomic_text,
    item::Item,
    missing::{identify_missing, MissingReport},
    network::{build_network, DependencyGraph},
    sort::{topological_order, SortedOrder},
    store::{MetadataStore, StoreError},
};
use anyhow::{Context, Result};
use blake3::Hasher;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path};
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("no installed items with a catalog id were found")]
    NoInstalledItems,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Output of one complete run, in the shape reports and the corrector consume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullAnalysis {
    pub fingerprint: String,
    pub created_at: String,
    pub sorted: SortedOrder,
    pub missing: BTreeMap<String, MissingReport>,
    pub graph: DependencyGraph,
    /// Catalog id of each installed folder at analysis time.
    #[serde(default)]
    pub folder_ids: BTreeMap<String, String>,
    /// `None` when diagnosis was skipped.
    pub violations: Option<Vec<Violation>>,
    pub items: BTreeMap<String, Item>,
}

/// Network build, missing report, sort and optional diagnosis, strictly in that order.
pub fn run_full(
    ctx: &AnalysisContext,
    store: &MetadataStore,
    run_diagnosis: bool,
) -> Result<Outcome<FullAnalysis>, AnalysisError> {
    if ctx.installed.installed_ids.is_empty() {
        return Err(AnalysisError::NoInstalledItems);
    }
    info!("full analysis of {} installed id(s)", ctx.installed.installed_ids.len());

    let Outcome::Completed(network) = build_network(ctx, store)? else {
        return Ok(Outcome::Cancelled);
    };
    let Outcome::Completed(missing) = identify_missing(ctx, &network) else {
        return Ok(Outcome::Cancelled);
    };
    let Outcome::Completed(sorted) = topological_order(ctx, &network.graph, &network.items) else {
        return Ok(Outcome::Cancelled);
    };
    if ctx.is_cancelled() {
        return Ok(Outcome::Cancelled);
    }
    let violations = run_diagnosis.then(|| diagnose(ctx, &network.graph));
    let fingerprint = fingerprint(ctx, store, network.items.keys());

    Ok(Outcome::Completed(FullAnalysis {
        fingerprint,
        created_at: OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default(),
        sorted,
        missing,
        graph: network.graph,
        folder_ids: ctx.installed.folder_to_id.clone(),
        violations,
        items: network.items,
    }))
}

/// Identifies the inputs of an analysis: install listing, ids, rules, expansion depth,
/// and when each record in `item_ids` was cached.
pub fn fingerprint<'a>(
    ctx: &AnalysisContext,
    store: &MetadataStore,
    item_ids: impl IntoIterator<Item = &'a String>,
) -> String {
    let mut hasher = Hasher::new();
    hasher.update(b"analysis-v1");
    for folder in &ctx.installed.order {
        hasher.update(folder.as_bytes());
        hasher.update(&[0]);
        if let Some(id) = ctx.installed.folder_to_id.get(folder) {
            hasher.update(id.as_bytes());
        }
        hasher.update(&[1]);
    }
    for id in &ctx.rules.ignore {
        hasher.update(b"ignore:");
        hasher.update(id.as_bytes());
    }
    for (from, to) in &ctx.rules.replace {
        hasher.update(b"replace:");
        hasher.update(from.as_bytes());
        hasher.update(b"=");
        hasher.update(to.as_bytes());
    }
    for id in &ctx.rules.ignore_requirements_of {
        hasher.update(b"skip:");
        hasher.update(id.as_bytes());
    }
    hasher.update(&(ctx.settings.uninstalled_fetch_depth as u64).to_le_bytes());
    for id in item_ids {
        hasher.update(b"item:");
        hasher.update(id.as_bytes());
        hasher.update(b"@");
        hasher.update(store.cached_at(id).unwrap_or_default().as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

pub fn save(analysis: &FullAnalysis, path: &Path) -> Result<()> {
    let raw = serde_json::to_string(analysis).context("serialize analysis")?;
    write_atomic_text(path, &raw).context("write analysis")?;
    Ok(())
}

/// The stored analysis when it was produced from exactly these inputs.
pub fn load_matching(
    path: &Path,
    ctx: &AnalysisContext,
    store: &MetadataStore,
) -> Option<FullAnalysis> {
    let raw = fs::read_to_string(path).ok()?;
    let analysis: FullAnalysis = match serde_json::from_str(&raw) {
        Ok(analysis) => analysis,
        Err(err) => {
            warn!("stored analysis {} unreadable: {err}", path.display());
            return None;
        }
    };
    if analysis.fingerprint != fingerprint(ctx, store, analysis.items.keys()) {
        info!("stored analysis is out of date");
        return None;
    }
    Some(analysis)
}

/// Reuses the stored analysis when it still matches, otherwise runs and stores a new one.
pub fn load_or_run(
    path: &Path,
    ctx: &AnalysisContext,
    store: &MetadataStore,
) -> Result<Outcome<FullAnalysis>> {
    if let Some(analysis) = load_matching(path, ctx, store) {
        info!("reusing analysis from {}", analysis.created_at);
        return Ok(Outcome::Completed(analysis));
    }
    let outcome = run_full(ctx, store, false)?;
    if let Outcome::Completed(analysis) = &outcome {
        save(analysis, path)?;
    }
    Ok(outcome)
}
