use crate::files::write_atomic_text;
use anyhow::{Context, Result};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};
use thiserror::Error;
use toml::{Table, Value};
use tracing::{info, warn};

const IGNORE_SECTION: &str = "Ignore";
const REPLACE_SECTION: &str = "Replace";
const IGNORE_REQUIREMENTS_SECTION: &str = "IgnoreRequirementsOf";
const IDS_KEY: &str = "ids";

const DEFAULT_RULES: &str = r#"# Ids listed here are always treated as installed.
[Ignore]
ids = [3863, 12604]

# "replaced id" = "replacement id"
[Replace]
"658" = "97145"

# Installed items whose own requirements are skipped entirely.
[IgnoreRequirementsOf]
ids = []
"#;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rules file is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("[{section}] holds a value that is not an id: {value}")]
    InvalidId { section: String, value: String },
    #[error("[{section}] must be a table")]
    InvalidSection { section: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleList {
    Ignore,
    IgnoreRequirementsOf,
}

/// Override tables consulted by every graph stage. Immutable for the duration of an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    pub ignore: BTreeSet<String>,
    pub replace: BTreeMap<String, String>,
    pub ignore_requirements_of: BTreeSet<String>,
}

impl RuleSet {
    /// Loads the rules file, writing the default template when it does not exist yet.
    /// Unreadable or malformed files yield an empty rule set.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            if let Err(err) = write_atomic_text(path, DEFAULT_RULES) {
                warn!("could not create default rules file {}: {err}", path.display());
            } else {
                info!("created default rules file {}", path.display());
            }
        }

        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("could not read rules file {}: {err}", path.display());
                return RuleSet::default();
            }
        };
        match RuleSet::parse(&raw) {
            Ok(rules) => {
                info!(
                    "loaded {} ignore, {} replace, {} ignore-requirements rules",
                    rules.ignore.len(),
                    rules.replace.len(),
                    rules.ignore_requirements_of.len()
                );
                rules
            }
            Err(err) => {
                warn!("rules file {} ignored: {err}", path.display());
                RuleSet::default()
            }
        }
    }

    /// Strict load used before rewriting the file, so a malformed file is never overwritten.
    fn load_for_edit(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(RuleSet::load(path));
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read rules file {}", path.display()))?;
        RuleSet::parse(&raw).with_context(|| {
            format!("rules file {} is malformed; fix it before editing", path.display())
        })
    }

    pub fn parse(raw: &str) -> Result<Self, RuleError> {
        let table: Table = raw.parse()?;
        Ok(Self {
            ignore: read_id_list(&table, IGNORE_SECTION)?,
            replace: read_replacements(&table)?,
            ignore_requirements_of: read_id_list(&table, IGNORE_REQUIREMENTS_SECTION)?,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = self.to_toml().context("serialize rules")?;
        write_atomic_text(path, &raw).context("write rules")?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        let mut root = Table::new();
        root.insert(IGNORE_SECTION.to_string(), id_list_section(&self.ignore));
        let replace: Table = self
            .replace
            .iter()
            .map(|(from, to)| (from.clone(), Value::String(to.clone())))
            .collect();
        root.insert(REPLACE_SECTION.to_string(), Value::Table(replace));
        root.insert(
            IGNORE_REQUIREMENTS_SECTION.to_string(),
            id_list_section(&self.ignore_requirements_of),
        );
        toml::to_string(&root)
    }

    /// Adds ids to one of the list sections of the file at `path` and saves it.
    /// Returns how many ids were new.
    pub fn add_ids(path: &Path, list: RuleList, ids: &[String]) -> Result<usize> {
        let mut rules = RuleSet::load_for_edit(path)?;
        let target = match list {
            RuleList::Ignore => &mut rules.ignore,
            RuleList::IgnoreRequirementsOf => &mut rules.ignore_requirements_of,
        };
        let mut added = 0usize;
        for id in ids {
            let id = id.trim();
            if !id.is_empty() && target.insert(id.to_string()) {
                added += 1;
            }
        }
        if added == 0 {
            info!("all ids already present in {list:?}");
            return Ok(0);
        }
        rules.save(path)?;
        info!("added {added} id(s) to {list:?}");
        Ok(added)
    }

    pub fn add_replacement(path: &Path, from: &str, to: &str) -> Result<()> {
        let mut rules = RuleSet::load_for_edit(path)?;
        rules.replace.insert(from.trim().to_string(), to.trim().to_string());
        rules.save(path)
    }

    pub fn is_ignored(&self, id: &str) -> bool {
        self.ignore.contains(id)
    }

    pub fn skips_requirements_of(&self, id: &str) -> bool {
        self.ignore_requirements_of.contains(id)
    }

    /// Applies a single replacement hop. Chains are not followed.
    pub fn effective_id<'a>(&'a self, id: &'a str) -> &'a str {
        self.replace.get(id).map(String::as_str).unwrap_or(id)
    }
}

fn read_id_list(table: &Table, section: &str) -> Result<BTreeSet<String>, RuleError> {
    let Some(value) = table.get(section) else {
        return Ok(BTreeSet::new());
    };
    let Some(section_table) = value.as_table() else {
        return Err(RuleError::InvalidSection {
            section: section.to_string(),
        });
    };
    let Some(ids) = section_table.get(IDS_KEY).and_then(Value::as_array) else {
        return Ok(BTreeSet::new());
    };
    ids.iter()
        .map(|value| id_from_value(section, value))
        .collect()
}

fn read_replacements(table: &Table) -> Result<BTreeMap<String, String>, RuleError> {
    let Some(value) = table.get(REPLACE_SECTION) else {
        return Ok(BTreeMap::new());
    };
    let Some(section_table) = value.as_table() else {
        return Err(RuleError::InvalidSection {
            section: REPLACE_SECTION.to_string(),
        });
    };
    let mut out = BTreeMap::new();
    for (from, to) in section_table {
        if from.starts_with('#') {
            continue;
        }
        out.insert(from.trim().to_string(), id_from_value(REPLACE_SECTION, to)?);
    }
    Ok(out)
}

fn id_from_value(section: &str, value: &Value) -> Result<String, RuleError> {
    match value {
        Value::Integer(number) => Ok(number.to_string()),
        Value::String(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
        other => Err(RuleError::InvalidId {
            section: section.to_string(),
            value: other.to_string(),
        }),
    }
}

fn id_list_section(ids: &BTreeSet<String>) -> Value {
    let mut sorted: Vec<&String> = ids.iter().collect();
    let numeric: Option<Vec<i64>> = sorted.iter().map(|id| id.parse::<i64>().ok()).collect();
    let values = match numeric {
        Some(mut numbers) => {
            numbers.sort_unstable();
            numbers.into_iter().map(Value::Integer).collect()
        }
        None => {
            sorted.sort();
            sorted.into_iter().map(|id| Value::String(id.clone())).collect()
        }
    };
    let mut section = Table::new();
    section.insert(IDS_KEY.to_string(), Value::Array(values));
    Value::Table(section)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        let rules = RuleSet::load(&path);
        assert!(path.exists());
        assert!(rules.is_ignored("3863"));
        assert!(rules.is_ignored("12604"));
        assert_eq!(rules.effective_id("658"), "97145");
        assert!(rules.ignore_requirements_of.is_empty());
    }

    #[test]
    fn accepts_integer_and_string_ids() {
        let rules = RuleSet::parse(
            r##"
            [Ignore]
            ids = [1, "2"]
            [Replace]
            "10" = 11
            "#comment" = "ignored"
            [IgnoreRequirementsOf]
            ids = ["30"]
            "##,
        )
        .unwrap();
        assert!(rules.is_ignored("1") && rules.is_ignored("2"));
        assert_eq!(rules.effective_id("10"), "11");
        assert_eq!(rules.replace.len(), 1);
        assert!(rules.skips_requirements_of("30"));
    }

    #[test]
    fn replacement_is_a_single_hop() {
        let mut rules = RuleSet::default();
        rules.replace.insert("1".into(), "2".into());
        rules.replace.insert("2".into(), "3".into());
        assert_eq!(rules.effective_id("1"), "2");
        assert_eq!(rules.effective_id("9"), "9");
    }

    #[test]
    fn corrupt_file_falls_back_to_empty_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        fs::write(&path, "[Ignore\nids = [").unwrap();
        assert_eq!(RuleSet::load(&path), RuleSet::default());
    }

    #[test]
    fn add_ids_dedupes_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        let added = RuleSet::add_ids(
            &path,
            RuleList::IgnoreRequirementsOf,
            &["500".to_string(), "40".to_string(), "500".to_string()],
        )
        .unwrap();
        assert_eq!(added, 2);
        let again = RuleSet::add_ids(&path, RuleList::IgnoreRequirementsOf, &["40".to_string()])
            .unwrap();
        assert_eq!(again, 0);

        let rules = RuleSet::load(&path);
        assert!(rules.skips_requirements_of("40"));
        assert!(rules.skips_requirements_of("500"));
        assert!(rules.is_ignored("3863"));
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("ids = [40, 500]"));
    }

    #[test]
    fn edits_refuse_to_overwrite_a_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        let original = "[Ignore]\nids = [1, 2, 3]\n\n[Replace]\n\"658\" = \"97145\"\n\n[IgnoreRequirementsOf]\nids = [";
        fs::write(&path, original).unwrap();

        assert!(RuleSet::add_ids(&path, RuleList::Ignore, &["77".to_string()]).is_err());
        assert!(RuleSet::add_replacement(&path, "5", "6").is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), original);
    }

    #[test]
    fn add_replacement_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        RuleSet::add_replacement(&path, "100", "200").unwrap();
        assert_eq!(RuleSet::load(&path).effective_id("100"), "200");
    }
}
