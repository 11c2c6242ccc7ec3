use crate::{
    cancel::Outcome,
    context::AnalysisContext,
    diagnose::{Diagnostics, Violation},
    installed::{position_map, separator_groups},
    network::DependencyGraph,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correction {
    /// Full priority list including separators, lowest priority first.
    pub proposed_order: Vec<String>,
    /// Every folder whose index changed, selected or not.
    pub moved: Vec<String>,
    pub selected_dependents: Vec<String>,
    /// Selected violations the proposed order still contains.
    pub residual: Vec<Violation>,
    pub disruption_before: usize,
    pub disruption_after: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CorrectionResult {
    Proposed(Correction),
    NoChange { residual: Vec<Violation> },
}

/// One dependent to reposition and the providers it has to follow.
#[derive(Debug)]
struct MovePlan {
    folder: String,
    original_index: usize,
    marker: Option<String>,
    providers: BTreeSet<String>,
}

/// Repositions the dependents of `selected` so they follow their providers,
/// keeping each one inside its separator group unless a provider forces it out,
/// and never returning an order that breaks more constraints than the current one.
pub fn correct(
    ctx: &AnalysisContext,
    graph: &DependencyGraph,
    selected: &[Violation],
) -> Outcome<CorrectionResult> {
    let diagnostics = Diagnostics::new(ctx, graph);
    let separators = &ctx.installed.separators;
    let original = ctx.installed.order.clone();
    let original_positions = position_map(&original);
    let baseline = diagnostics.disruption_score(&original);

    let mut markers: BTreeMap<&str, Option<String>> = BTreeMap::new();
    for group in separator_groups(&original, separators) {
        for folder in &original[group.start..group.end] {
            markers.insert(folder, group.marker.clone());
        }
    }

    let mut plans: BTreeMap<&str, MovePlan> = BTreeMap::new();
    for violation in selected {
        let Some(&index) = original_positions.get(violation.dependent.as_str()) else {
            warn!("{} is no longer in the load order; skipping", violation.dependent);
            continue;
        };
        plans
            .entry(violation.dependent.as_str())
            .or_insert_with(|| MovePlan {
                folder: violation.dependent.clone(),
                original_index: index,
                marker: markers.get(violation.dependent.as_str()).cloned().flatten(),
                providers: BTreeSet::new(),
            })
            .providers
            .insert(violation.provider.clone());
    }
    let mut plans: Vec<MovePlan> = plans.into_values().collect();
    plans.sort_by_key(|plan| plan.original_index);
    let selected_dependents: Vec<String> = plans.iter().map(|plan| plan.folder.clone()).collect();

    let mut working = original.clone();
    let max_passes = plans.len() + 2;
    for pass in 1..=max_passes {
        if ctx.is_cancelled() {
            return Outcome::Cancelled;
        }
        let mut changed = false;
        for plan in &plans {
            let Some(next) = best_placement(&diagnostics, &working, plan, separators) else {
                continue;
            };
            if next != working {
                working = next;
                changed = true;
            }
        }
        debug!(
            "correction pass {pass}/{max_passes}: disruption {}",
            diagnostics.disruption_score(&working)
        );
        if !changed {
            break;
        }
    }

    let mut disruption_after = diagnostics.disruption_score(&working);
    if disruption_after > baseline {
        warn!(
            "correction would raise disruption from {baseline} to {disruption_after}; keeping current order"
        );
        working = original.clone();
        disruption_after = baseline;
    }

    let selected_pairs: BTreeSet<(&str, &str)> = selected.iter().map(Violation::pair).collect();
    let residual: Vec<Violation> = diagnostics
        .violations(&working, separators)
        .into_iter()
        .filter(|violation| selected_pairs.contains(&violation.pair()))
        .collect();
    if !residual.is_empty() {
        warn!("{} selected violation(s) could not be resolved", residual.len());
    }

    let moved: Vec<String> = working
        .iter()
        .enumerate()
        .filter(|(index, folder)| original_positions.get(folder.as_str()) != Some(index))
        .map(|(_, folder)| folder.clone())
        .collect();
    if moved.is_empty() {
        info!("no load order change needed");
        return Outcome::Completed(CorrectionResult::NoChange { residual });
    }

    info!(
        "proposed order moves {} folder(s); disruption {baseline} -> {disruption_after}",
        moved.len()
    );
    Outcome::Completed(CorrectionResult::Proposed(Correction {
        proposed_order: working,
        moved,
        selected_dependents,
        residual,
        disruption_before: baseline,
        disruption_after,
    }))
}

/// Lowest-disruption position for `plan.folder` within its window, closest to where
/// it started on ties. `None` when the folder has vanished from `working`.
fn best_placement(
    diagnostics: &Diagnostics,
    working: &[String],
    plan: &MovePlan,
    separators: &BTreeSet<String>,
) -> Option<Vec<String>> {
    let current = working.iter().position(|folder| *folder == plan.folder)?;
    let mut order = working.to_vec();
    order.remove(current);

    let lower = plan
        .providers
        .iter()
        .filter_map(|provider| order.iter().position(|folder| folder == provider))
        .map(|index| index + 1)
        .max()
        .unwrap_or(0);
    let group_start = plan
        .marker
        .as_ref()
        .and_then(|marker| order.iter().position(|folder| folder == marker))
        .map(|index| index + 1)
        .unwrap_or(0);
    let group_end = order[group_start..]
        .iter()
        .position(|folder| separators.contains(folder))
        .map(|offset| group_start + offset)
        .unwrap_or(order.len());
    let start = group_start.max(lower).min(order.len());
    let end = group_end.max(start).min(order.len());

    let mut best: Option<(usize, usize, usize)> = None;
    for index in start..=end {
        order.insert(index, plan.folder.clone());
        let score = diagnostics.disruption_score(&order);
        order.remove(index);
        let candidate = (score, index.abs_diff(plan.original_index), index);
        if best.map_or(true, |current| candidate < current) {
            best = Some(candidate);
        }
    }
    let (_, _, index) = best?;
    order.insert(index, plan.folder.clone());
    Some(order)
}
