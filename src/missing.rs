use crate::{
    cancel::Outcome,
    context::AnalysisContext,
    item::Tags,
    network::Network,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstalledRequirer {
    pub folder: String,
    pub notes: String,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MissingRequirer {
    pub name: String,
    pub id: String,
}

/// An unmet requirement and everyone who asked for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingReport {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_name: Option<String>,
    pub required_by_installed: Vec<InstalledRequirer>,
    pub required_by_missing: BTreeSet<MissingRequirer>,
}

pub fn identify_missing(
    ctx: &AnalysisContext,
    network: &Network,
) -> Outcome<BTreeMap<String, MissingReport>> {
    let mut reports = BTreeMap::new();
    for id in &network.known_ids {
        if ctx.is_cancelled() {
            return Outcome::Cancelled;
        }
        if ctx.is_satisfied(id) {
            continue;
        }

        let mut required_by_installed = Vec::new();
        let mut required_by_missing = BTreeSet::new();
        for edge in network.graph.requirers_of(id) {
            let requirer = edge.target.as_str();
            if ctx.rules.skips_requirements_of(requirer) {
                continue;
            }
            if ctx.installed.is_installed(requirer) {
                for folder in ctx.installed.folders_of(requirer) {
                    required_by_installed.push(InstalledRequirer {
                        folder: folder.clone(),
                        notes: edge.notes.clone(),
                        tags: edge.tags.clone(),
                    });
                }
            } else if !ctx.is_satisfied(requirer) {
                required_by_missing.insert(MissingRequirer {
                    name: network.name_of(requirer),
                    id: requirer.to_string(),
                });
            }
        }
        if required_by_installed.is_empty() && required_by_missing.is_empty() {
            continue;
        }
        required_by_installed.sort();

        let effective = ctx.effective_id(id);
        let (effective_id, effective_name) = if effective != id {
            (Some(effective.to_string()), Some(network.name_of(effective)))
        } else {
            (None, None)
        };
        reports.insert(
            id.clone(),
            MissingReport {
                id: id.clone(),
                name: network.name_of(id),
                effective_id,
                effective_name,
                required_by_installed,
                required_by_missing,
            },
        );
    }
    info!("{} missing requirement(s)", reports.len());
    Outcome::Completed(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        item::Tag,
        network::build_network,
        rules::RuleSet,
        testing::{context, item, item_with_notes, store},
    };

    fn report_for(
        entries: &[(&str, &str)],
        rules: RuleSet,
        items: Vec<crate::item::Item>,
    ) -> BTreeMap<String, MissingReport> {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), items);
        let ctx = context(entries, rules);
        let network = build_network(&ctx, &store).unwrap().completed().unwrap();
        identify_missing(&ctx, &network).completed().unwrap()
    }

    #[test]
    fn optional_requirement_of_installed_item() {
        let reports = report_for(
            &[("X Folder", "1")],
            RuleSet::default(),
            vec![
                item_with_notes("1", "X", "Default", &[("999", "Optional addon")]),
                item("999", "Addon", "Default", &[]),
            ],
        );
        let report = &reports["999"];
        assert_eq!(report.name, "Addon");
        assert_eq!(report.required_by_installed.len(), 1);
        let requirer = &report.required_by_installed[0];
        assert_eq!(requirer.folder, "X Folder");
        assert!(requirer.tags.contains(&Tag::Optional));
        assert!(report.required_by_missing.is_empty());
    }

    #[test]
    fn missing_items_list_their_missing_requirers() {
        let reports = report_for(
            &[("X", "1")],
            RuleSet::default(),
            vec![
                item("1", "X", "Default", &["2"]),
                item("2", "Middle", "Default", &["3"]),
                item("3", "Leaf", "Default", &[]),
            ],
        );
        assert_eq!(reports["2"].required_by_installed[0].folder, "X");
        let leaf = &reports["3"];
        assert!(leaf.required_by_installed.is_empty());
        let requirers: Vec<&str> = leaf.required_by_missing.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(requirers, vec!["2"]);
        assert_eq!(leaf.required_by_missing.iter().next().unwrap().name, "Middle");
    }

    #[test]
    fn ignored_satisfied_and_orphaned_ids_are_omitted() {
        let mut rules = RuleSet::default();
        rules.ignore.insert("4".into());
        rules.ignore_requirements_of.insert("5".into());
        let reports = report_for(
            &[("X", "1"), ("Y", "2"), ("Z", "5")],
            rules,
            vec![
                item("1", "X", "Default", &["2", "4"]),
                item("2", "Y", "Default", &[]),
                item("5", "Z", "Default", &["6"]),
            ],
        );
        assert!(reports.is_empty());
    }

    #[test]
    fn replacement_target_is_attached() {
        let mut rules = RuleSet::default();
        rules.replace.insert("2".into(), "3".into());
        let reports = report_for(
            &[("X", "1")],
            rules,
            vec![
                item("1", "X", "Default", &["2"]),
                item("2", "Old", "Default", &[]),
                item("3", "New", "Default", &[]),
            ],
        );
        let report = &reports["2"];
        assert_eq!(report.effective_id.as_deref(), Some("3"));
        // The replacement was never fetched, so only its id is known.
        assert_eq!(report.effective_name.as_deref(), Some("Unknown (ID: 3)"));
    }
}
