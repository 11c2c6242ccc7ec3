use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const DEFAULT_CATEGORY: &str = "Default";

static MOD_URL_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/mods/(\d+)").expect("valid mod url regex"));

const OPTIONAL_KEYWORDS: [&str; 5] = [
    "optional",
    "addon",
    "not mandatory",
    "not needed",
    "not required",
];

/// Scraped catalog record for one mod page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub name: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub update_timestamp: i64,
    #[serde(default)]
    pub requires: Vec<Requirement>,
    #[serde(default)]
    pub required_by: Vec<Requirement>,
    #[serde(default)]
    pub translations: Vec<Translation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ItemError>,
}

impl Item {
    pub fn unavailable(id: &str, reason: &str) -> Self {
        Self::degraded(
            id,
            format!("Unavailable ({reason}) (ID: {id})"),
            ItemError::Unavailable {
                reason: reason.to_string(),
            },
        )
    }

    pub fn fetch_failed(id: &str, message: &str) -> Self {
        Self::degraded(
            id,
            format!("Fetch failed: ID {id}"),
            ItemError::FetchFailed {
                message: message.to_string(),
            },
        )
    }

    fn degraded(id: &str, name: String, error: ItemError) -> Self {
        Self {
            id: id.to_string(),
            name,
            category: default_category(),
            update_timestamp: 0,
            requires: Vec::new(),
            required_by: Vec::new(),
            translations: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }

    /// Requirements that resolve to a catalog id, paired with that id.
    pub fn requirement_targets(&self) -> impl Iterator<Item = (String, &Requirement)> {
        self.requires
            .iter()
            .filter_map(|req| req.target_id().map(|id| (id, req)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemError {
    Unavailable { reason: String },
    FetchFailed { message: String },
}

impl std::fmt::Display for ItemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemError::Unavailable { reason } => write!(f, "unavailable: {reason}"),
            ItemError::FetchFailed { message } => write!(f, "fetch failed: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    #[serde(default)]
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub notes: String,
}

impl Requirement {
    pub fn target_id(&self) -> Option<String> {
        extract_item_id(&self.url)
    }

    pub fn tags(&self) -> Tags {
        tags_from_notes(&self.notes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Translation {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub language: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tag {
    Vr,
    Optional,
    Recommended,
}

impl Tag {
    pub fn label(self) -> &'static str {
        match self {
            Tag::Vr => "vr",
            Tag::Optional => "optional",
            Tag::Recommended => "recommended",
        }
    }
}

pub type Tags = BTreeSet<Tag>;

pub fn tags_from_notes(notes: &str) -> Tags {
    let lower = notes.to_lowercase();
    let mut tags = Tags::new();
    if lower.contains("vr") {
        tags.insert(Tag::Vr);
    }
    if OPTIONAL_KEYWORDS.iter().any(|keyword| lower.contains(keyword)) {
        tags.insert(Tag::Optional);
    }
    if lower.contains("recommend") {
        tags.insert(Tag::Recommended);
    }
    tags
}

/// Requirement kinds the tree builder should skip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeFilters {
    pub hide_vr: bool,
    pub hide_optional: bool,
    pub hide_recommended: bool,
}

impl TreeFilters {
    pub fn excludes(&self, tags: &Tags) -> bool {
        (self.hide_vr && tags.contains(&Tag::Vr))
            || (self.hide_optional && tags.contains(&Tag::Optional))
            || (self.hide_recommended && tags.contains(&Tag::Recommended))
    }
}

/// Pulls the numeric catalog id out of a mod page URL. Bare numeric references pass through.
pub fn extract_item_id(reference: &str) -> Option<String> {
    if let Some(captures) = MOD_URL_ID.captures(reference) {
        return captures.get(1).map(|m| m.as_str().to_string());
    }
    let trimmed = reference.trim();
    if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        return Some(trimmed.to_string());
    }
    None
}

pub fn tag_labels(tags: &Tags) -> Vec<&'static str> {
    tags.iter().map(|tag| tag.label()).collect()
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_ids_from_urls_and_bare_numbers() {
        assert_eq!(
            extract_item_id("https://www.nexusmods.com/skyrimspecialedition/mods/266?tab=files"),
            Some("266".to_string())
        );
        assert_eq!(extract_item_id(" 12604 "), Some("12604".to_string()));
        assert_eq!(extract_item_id("https://example.com/users/5"), None);
        assert_eq!(extract_item_id(""), None);
    }

    #[test]
    fn notes_map_to_tags() {
        let tags = tags_from_notes("Optional addon");
        assert_eq!(tag_labels(&tags), vec!["optional"]);

        let tags = tags_from_notes("Only for VR users, recommended");
        assert!(tags.contains(&Tag::Vr));
        assert!(tags.contains(&Tag::Recommended));
        assert!(!tags.contains(&Tag::Optional));

        assert!(tags_from_notes("Required for the main plugin").is_empty());
        assert!(tags_from_notes("Not required if you use the lite version").contains(&Tag::Optional));
    }

    #[test]
    fn filters_match_any_hidden_tag() {
        let filters = TreeFilters {
            hide_optional: true,
            ..TreeFilters::default()
        };
        assert!(filters.excludes(&tags_from_notes("not mandatory")));
        assert!(!filters.excludes(&tags_from_notes("vr support")));
        assert!(!TreeFilters::default().excludes(&tags_from_notes("optional")));
    }

    #[test]
    fn degraded_items_carry_no_requirements() {
        let item = Item::unavailable("42", "Hidden mod");
        assert!(item.is_degraded());
        assert_eq!(item.category, DEFAULT_CATEGORY);
        assert!(item.requires.is_empty());
        assert!(matches!(item.error, Some(ItemError::Unavailable { .. })));
    }

    #[test]
    fn item_json_fills_defaults() {
        let raw = r#"{"id":"7","name":"Seven","requires":[{"url":"/mods/8"}]}"#;
        let item: Item = serde_json::from_str(raw).unwrap();
        assert_eq!(item.category, DEFAULT_CATEGORY);
        let targets: Vec<String> = item.requirement_targets().map(|(id, _)| id).collect();
        assert_eq!(targets, vec!["8".to_string()]);
    }
}
