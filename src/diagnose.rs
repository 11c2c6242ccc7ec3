use crate::{
    context::AnalysisContext,
    installed::{group_labels, position_map, NO_SEPARATOR},
    network::DependencyGraph,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::info;

/// Folder-level form of one satisfied requirement edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub dependent: String,
    pub dependent_id: String,
    pub provider: String,
    pub provider_id: String,
    pub notes: String,
}

/// A provider placed after the folder that needs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub dependent: String,
    pub dependent_id: String,
    pub provider: String,
    pub provider_id: String,
    pub notes: String,
    pub separator: String,
}

impl Violation {
    pub fn pair(&self) -> (&str, &str) {
        (self.dependent.as_str(), self.provider.as_str())
    }
}

/// Satisfied requirement edges between installed folders, checked against any order.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    constraints: Vec<Constraint>,
}

impl Diagnostics {
    pub fn new(ctx: &AnalysisContext, graph: &DependencyGraph) -> Self {
        let installed = &ctx.installed;
        let mut seen = BTreeSet::new();
        let mut constraints = Vec::new();
        for folder in &installed.order {
            let Some(dependent_id) = installed.folder_to_id.get(folder) else {
                continue;
            };
            if ctx.rules.skips_requirements_of(dependent_id) {
                continue;
            }
            for edge in graph.requirements_of(dependent_id) {
                let provider_id = ctx.effective_id(&edge.target);
                for provider in installed.folders_of(provider_id) {
                    if provider == folder || !seen.insert((folder.clone(), provider.clone())) {
                        continue;
                    }
                    constraints.push(Constraint {
                        dependent: folder.clone(),
                        dependent_id: dependent_id.clone(),
                        provider: provider.clone(),
                        provider_id: provider_id.to_string(),
                        notes: edge.notes.clone(),
                    });
                }
            }
        }
        Self { constraints }
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Every constraint whose provider sits after its dependent in `order`.
    pub fn violations(&self, order: &[String], separators: &BTreeSet<String>) -> Vec<Violation> {
        let positions = position_map(order);
        let labels = group_labels(order, separators);
        self.constraints
            .iter()
            .filter(|c| is_violated(&positions, c))
            .map(|c| Violation {
                dependent: c.dependent.clone(),
                dependent_id: c.dependent_id.clone(),
                provider: c.provider.clone(),
                provider_id: c.provider_id.clone(),
                notes: c.notes.clone(),
                separator: labels
                    .get(&c.dependent)
                    .cloned()
                    .unwrap_or_else(|| NO_SEPARATOR.to_string()),
            })
            .collect()
    }

    /// How many constraints `order` breaks.
    pub fn disruption_score(&self, order: &[String]) -> usize {
        let positions = position_map(order);
        self.constraints
            .iter()
            .filter(|c| is_violated(&positions, c))
            .count()
    }
}

fn is_violated(positions: &HashMap<&str, usize>, constraint: &Constraint) -> bool {
    match (
        positions.get(constraint.dependent.as_str()),
        positions.get(constraint.provider.as_str()),
    ) {
        (Some(dependent), Some(provider)) => provider > dependent,
        _ => false,
    }
}

/// Violations of the current installed order.
pub fn diagnose(ctx: &AnalysisContext, graph: &DependencyGraph) -> Vec<Violation> {
    let violations = Diagnostics::new(ctx, graph)
        .violations(&ctx.installed.order, &ctx.installed.separators);
    info!("{} load order violation(s)", violations.len());
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{item::Tags, rules::RuleSet, testing::context};

    fn graph(edges: &[(&str, &str, &str)]) -> DependencyGraph {
        let mut graph = DependencyGraph::default();
        for (from, to, notes) in edges {
            graph.add_edge(from, to, notes, Tags::new());
        }
        graph
    }

    #[test]
    fn ordered_list_has_no_violations() {
        let ctx = context(&[("A", "1"), ("B", "2"), ("C", "3")], RuleSet::default());
        assert!(diagnose(&ctx, &graph(&[("2", "1", "")])).is_empty());
    }

    #[test]
    fn provider_after_dependent_is_reported() {
        let ctx = context(&[("B", "2"), ("A", "1"), ("C", "3")], RuleSet::default());
        let violations = diagnose(&ctx, &graph(&[("2", "1", "needs A")]));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].pair(), ("B", "A"));
        assert_eq!(violations[0].notes, "needs A");
        assert_eq!(violations[0].separator, NO_SEPARATOR);
    }

    #[test]
    fn reports_separator_and_every_provider_folder() {
        let ctx = context(
            &[("Core", ""), ("Dep", "2"), ("Lib", "1"), ("Lib Patch", "1")],
            RuleSet::default(),
        );
        let violations = diagnose(&ctx, &graph(&[("2", "1", "")]));
        let pairs: Vec<(&str, &str)> = violations.iter().map(Violation::pair).collect();
        assert_eq!(pairs, vec![("Dep", "Lib"), ("Dep", "Lib Patch")]);
        assert!(violations.iter().all(|v| v.separator == "Core"));
    }

    #[test]
    fn silenced_and_uninstalled_providers_are_skipped() {
        let mut rules = RuleSet::default();
        rules.ignore_requirements_of.insert("3".into());
        let ctx = context(&[("C", "3"), ("B", "2"), ("A", "1")], rules);
        let violations = diagnose(&ctx, &graph(&[("3", "1", ""), ("2", "99", "")]));
        assert!(violations.is_empty());
    }

    #[test]
    fn soundness_against_every_satisfied_edge() {
        let ctx = context(
            &[("D", "4"), ("C", "3"), ("B", "2"), ("A", "1")],
            RuleSet::default(),
        );
        let g = graph(&[("4", "1", ""), ("3", "2", ""), ("2", "1", ""), ("1", "4", "")]);
        let diagnostics = Diagnostics::new(&ctx, &g);
        let violations = diagnostics.violations(&ctx.installed.order, &ctx.installed.separators);
        let positions = position_map(&ctx.installed.order);
        for constraint in diagnostics.constraints() {
            let broken = positions[constraint.provider.as_str()] > positions[constraint.dependent.as_str()];
            let reported = violations
                .iter()
                .any(|v| v.pair() == (constraint.dependent.as_str(), constraint.provider.as_str()));
            assert_eq!(broken, reported);
        }
        assert_eq!(diagnostics.disruption_score(&ctx.installed.order), violations.len());
    }
}
