use crate::{
    cancel::Outcome,
    context::AnalysisContext,
    item::{tag_labels, ItemError, Tags, TreeFilters},
    store::{MetadataStore, StoreError},
};
use serde::Serialize;
use std::{
    collections::BTreeSet,
    fmt::Write as _,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Satisfied,
    Missing,
    Cycle,
    Truncated,
}

impl NodeStatus {
    pub fn label(self) -> &'static str {
        match self {
            NodeStatus::Satisfied => "satisfied",
            NodeStatus::Missing => "missing",
            NodeStatus::Cycle => "cycle",
            NodeStatus::Truncated => "truncated",
        }
    }

    fn colour(self) -> &'static str {
        match self {
            NodeStatus::Satisfied => "lightgreen",
            NodeStatus::Missing => "lightcoral",
            NodeStatus::Cycle => "orange",
            NodeStatus::Truncated => "#8e44ad",
        }
    }
}

/// The item a replacement rule redirects to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Replacement {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeNode {
    pub id: String,
    pub name: String,
    pub category: String,
    pub status: NodeStatus,
    pub is_installed: bool,
    pub is_fully_satisfied: bool,
    /// Note on the edge from the parent. Empty on the root.
    pub notes: String,
    pub tags: Tags,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replacement: Option<Replacement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ItemError>,
    pub children: Vec<TreeNode>,
}

/// Expands one item's requirement chain.
pub struct TreeBuilder<'a> {
    ctx: &'a AnalysisContext,
    store: &'a MetadataStore,
    filters: TreeFilters,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(ctx: &'a AnalysisContext, store: &'a MetadataStore, filters: TreeFilters) -> Self {
        Self {
            ctx,
            store,
            filters,
        }
    }

    /// Returns `None` when the root itself is on the ignore list.
    pub fn build(&self, root_id: &str) -> Result<Outcome<Option<TreeNode>>, StoreError> {
        self.build_node(root_id, "", Tags::new(), &BTreeSet::new(), 0)
    }

    fn build_node(
        &self,
        id: &str,
        notes: &str,
        tags: Tags,
        visited: &BTreeSet<String>,
        depth: usize,
    ) -> Result<Outcome<Option<TreeNode>>, StoreError> {
        if self.ctx.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        if self.ctx.rules.is_ignored(id) {
            return Ok(Outcome::Completed(None));
        }

        let effective = self.ctx.effective_id(id);
        let is_installed = self.ctx.installed.is_installed(effective);
        let Outcome::Completed(item) = self.store.get(id, &self.ctx.cancel)? else {
            return Ok(Outcome::Cancelled);
        };
        let replacement = if effective != id {
            match self.store.get(effective, &self.ctx.cancel)? {
                Outcome::Completed(target) => Some(Replacement {
                    id: effective.to_string(),
                    name: target.name,
                }),
                Outcome::Cancelled => return Ok(Outcome::Cancelled),
            }
        } else {
            None
        };

        let mut node = TreeNode {
            id: id.to_string(),
            name: item.name.clone(),
            category: item.category.clone(),
            status: NodeStatus::Missing,
            is_installed,
            is_fully_satisfied: false,
            notes: notes.to_string(),
            tags,
            replacement,
            error: item.error.clone(),
            children: Vec::new(),
        };

        if visited.contains(id) {
            node.status = NodeStatus::Cycle;
            node.is_fully_satisfied = is_installed;
            return Ok(Outcome::Completed(Some(node)));
        }
        if item.is_degraded() {
            return Ok(Outcome::Completed(Some(node)));
        }
        if depth >= self.ctx.settings.max_recursion_depth {
            node.status = NodeStatus::Truncated;
            return Ok(Outcome::Completed(Some(node)));
        }

        node.status = if is_installed {
            NodeStatus::Satisfied
        } else {
            NodeStatus::Missing
        };

        let mut branch = visited.clone();
        branch.insert(id.to_string());
        let mut seen = BTreeSet::new();
        let mut all_children_satisfied = true;
        for (target, requirement) in item.requirement_targets() {
            let tags = requirement.tags();
            if self.filters.excludes(&tags) || !seen.insert(target.clone()) {
                continue;
            }
            match self.build_node(&target, &requirement.notes, tags, &branch, depth + 1)? {
                Outcome::Completed(Some(child)) => {
                    all_children_satisfied &= child.is_fully_satisfied;
                    node.children.push(child);
                }
                Outcome::Completed(None) => {}
                Outcome::Cancelled => return Ok(Outcome::Cancelled),
            }
        }
        node.is_fully_satisfied = is_installed && all_children_satisfied;
        Ok(Outcome::Completed(Some(node)))
    }
}

pub fn render_text(root: &TreeNode) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", node_line(root));
    render_children(&root.children, "", &mut out);
    out
}

fn render_children(children: &[TreeNode], prefix: &str, out: &mut String) {
    for (index, child) in children.iter().enumerate() {
        let last = index + 1 == children.len();
        let branch = if last { "└── " } else { "├── " };
        let _ = writeln!(out, "{prefix}{branch}{}", node_line(child));
        let next = format!("{prefix}{}", if last { "    " } else { "│   " });
        render_children(&child.children, &next, out);
    }
}

fn node_line(node: &TreeNode) -> String {
    let mut line = format!("{} ({}) [{}]", node.name, node.id, node.status.label());
    if !node.is_fully_satisfied && node.status == NodeStatus::Satisfied {
        line.push_str(" (incomplete)");
    }
    if let Some(replacement) = &node.replacement {
        let _ = write!(line, " -> replaced by {} ({})", replacement.name, replacement.id);
    }
    if !node.tags.is_empty() {
        let _ = write!(line, " {{{}}}", tag_labels(&node.tags).join(", "));
    }
    if let Some(error) = &node.error {
        let _ = write!(line, " !{error}");
    }
    line
}

/// Graphviz source for the tree. Repeated ids collapse into one node.
pub fn render_dot(root: &TreeNode) -> String {
    let mut out = String::from("digraph dependencies {\n");
    out.push_str("    rankdir=LR;\n    node [shape=box, style=filled];\n");
    let mut nodes = BTreeSet::new();
    let mut edges = BTreeSet::new();
    dot_node(root, None, &mut nodes, &mut edges, &mut out);
    out.push_str("}\n");
    out
}

fn dot_node(
    node: &TreeNode,
    parent: Option<&str>,
    nodes: &mut BTreeSet<String>,
    edges: &mut BTreeSet<(String, String)>,
    out: &mut String,
) {
    if nodes.insert(node.id.clone()) {
        let _ = writeln!(
            out,
            "    \"{}\" [label=\"{}\\n({})\", fillcolor=\"{}\"];",
            node.id,
            escape(&node.name),
            node.id,
            node.status.colour()
        );
        if let Some(replacement) = &node.replacement {
            let _ = writeln!(
                out,
                "    \"{}\" [label=\"{}\\n({})\", fillcolor=\"lightblue\"];",
                replacement.id,
                escape(&replacement.name),
                replacement.id
            );
            let _ = writeln!(
                out,
                "    \"{}\" -> \"{}\" [style=dashed, label=\"replaced by\"];",
                node.id, replacement.id
            );
        }
    }
    if let Some(parent) = parent {
        if edges.insert((parent.to_string(), node.id.clone())) {
            let label = if node.notes.is_empty() {
                String::new()
            } else {
                format!(" [label=\"{}\"]", escape(&node.notes))
            };
            let _ = writeln!(out, "    \"{parent}\" -> \"{}\"{label};", node.id);
        }
    }
    for child in &node.children {
        dot_node(child, Some(&node.id), nodes, edges, out);
    }
}

fn escape(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', " ")
}
