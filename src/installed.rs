use crate::files::write_atomic_text;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

pub const NO_SEPARATOR: &str = "(no separator)";
const SEPARATOR_SUFFIX: &str = "_separator";
const MODLIST_HEADER: &str = "# This file was automatically generated by Mod Organizer.";

/// One line of the user's priority list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModListEntry {
    pub folder: String,
    pub item_id: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub unmanaged: bool,
}

impl ModListEntry {
    pub fn item(folder: &str, item_id: &str) -> Self {
        Self {
            folder: folder.to_string(),
            item_id: Some(item_id.to_string()),
            enabled: true,
            unmanaged: false,
        }
    }

    pub fn separator(label: &str) -> Self {
        Self {
            folder: format!("{label}{SEPARATOR_SUFFIX}"),
            item_id: None,
            enabled: false,
            unmanaged: false,
        }
    }

    pub fn is_separator(&self) -> bool {
        is_separator_folder(&self.folder)
    }
}

/// The full priority list of a profile, lowest priority first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModList {
    pub entries: Vec<ModListEntry>,
}

impl ModList {
    #[cfg(test)]
    pub fn from_entries(entries: Vec<ModListEntry>) -> Self {
        Self { entries }
    }

    /// Reads `profiles/<profile>/modlist.txt` and each mod's `meta.ini` from a Mod Organizer instance.
    pub fn load(instance: &Path, profile: &str) -> Result<Self> {
        let path = modlist_path(instance, profile);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("read mod list {}", path.display()))?;
        let mods_dir = instance.join("mods");
        let list = ModList::parse(&raw, |folder| read_meta_mod_id(&mods_dir.join(folder)));
        info!(
            "parsed {} entries ({} with ids) from {}",
            list.entries.len(),
            list.entries.iter().filter(|e| e.item_id.is_some()).count(),
            path.display()
        );
        Ok(list)
    }

    /// Parses modlist.txt text. The file lists the highest priority first.
    pub fn parse(raw: &str, lookup_id: impl Fn(&str) -> Option<String>) -> Self {
        let mut entries = Vec::new();
        for line in raw.lines() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let mut chars = line.chars();
            let prefix = chars.next();
            let folder = chars.as_str().trim();
            if folder.is_empty() {
                continue;
            }
            let (enabled, unmanaged) = match prefix {
                Some('+') => (true, false),
                Some('-') => (false, false),
                Some('*') => (true, true),
                _ => continue,
            };
            let item_id = if unmanaged || is_separator_folder(folder) {
                None
            } else {
                lookup_id(folder)
            };
            entries.push(ModListEntry {
                folder: folder.to_string(),
                item_id,
                enabled,
                unmanaged,
            });
        }
        entries.reverse();
        Self { entries }
    }

    pub fn render(&self) -> String {
        let mut out = String::from(MODLIST_HEADER);
        out.push('\n');
        for entry in self.entries.iter().rev() {
            let prefix = if entry.unmanaged {
                '*'
            } else if entry.enabled {
                '+'
            } else {
                '-'
            };
            out.push(prefix);
            out.push_str(&entry.folder);
            out.push('\n');
        }
        out
    }

    /// Writes the list back, keeping the previous file as `modlist.txt.bak`.
    pub fn save(&self, instance: &Path, profile: &str) -> Result<()> {
        let path = modlist_path(instance, profile);
        if path.exists() {
            let backup = path.with_extension("txt.bak");
            fs::copy(&path, &backup).context("back up mod list")?;
        }
        write_atomic_text(&path, &self.render()).context("write mod list")?;
        Ok(())
    }

    /// Rebuilds the list in `order`. Folders not named in `order` are dropped.
    pub fn reordered(&self, order: &[String]) -> ModList {
        let by_folder: HashMap<&str, &ModListEntry> = self
            .entries
            .iter()
            .map(|entry| (entry.folder.as_str(), entry))
            .collect();
        let entries = order
            .iter()
            .filter_map(|folder| by_folder.get(folder.as_str()).map(|entry| (*entry).clone()))
            .collect();
        ModList { entries }
    }

    pub fn snapshot(&self) -> InstalledSet {
        let mut folder_to_id = BTreeMap::new();
        let mut id_to_folders: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut separators = BTreeSet::new();
        let mut order = Vec::with_capacity(self.entries.len());

        for entry in &self.entries {
            order.push(entry.folder.clone());
            if entry.is_separator() {
                separators.insert(entry.folder.clone());
                continue;
            }
            let Some(id) = entry.item_id.as_deref().filter(|id| is_valid_item_id(id)) else {
                continue;
            };
            folder_to_id.insert(entry.folder.clone(), id.to_string());
            id_to_folders
                .entry(id.to_string())
                .or_default()
                .push(entry.folder.clone());
        }

        let installed_ids = folder_to_id.values().cloned().collect();
        debug!("installed snapshot: {} folders", folder_to_id.len());
        InstalledSet {
            order,
            separators,
            folder_to_id,
            id_to_folders,
            installed_ids,
        }
    }
}

/// Point-in-time view of what is installed and where it sits in the priority list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstalledSet {
    /// Every folder including separators, lowest priority first.
    pub order: Vec<String>,
    pub separators: BTreeSet<String>,
    pub folder_to_id: BTreeMap<String, String>,
    /// Folders per id, in priority order.
    pub id_to_folders: BTreeMap<String, Vec<String>>,
    pub installed_ids: BTreeSet<String>,
}

impl InstalledSet {
    pub fn is_installed(&self, id: &str) -> bool {
        self.installed_ids.contains(id)
    }

    pub fn folders_of(&self, id: &str) -> &[String] {
        self.id_to_folders.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn positions(&self) -> HashMap<&str, usize> {
        position_map(&self.order)
    }

    pub fn is_separator(&self, folder: &str) -> bool {
        self.separators.contains(folder)
    }

    /// Folders with an id, in current priority order.
    pub fn installed_order(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|folder| self.folder_to_id.contains_key(*folder))
            .cloned()
            .collect()
    }

    pub fn groups(&self) -> Vec<SeparatorGroup> {
        separator_groups(&self.order, &self.separators)
    }
}

/// A contiguous run of entries following one separator marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeparatorGroup {
    pub label: String,
    pub marker: Option<String>,
    /// First member index. Equal to `end` for an empty group.
    pub start: usize,
    /// One past the last member index.
    pub end: usize,
}

impl SeparatorGroup {
    pub fn contains(&self, index: usize) -> bool {
        index >= self.start && index < self.end
    }
}

/// Splits `order` at separator markers. The leading run before any marker forms the
/// sentinel group, so every non-separator entry lands in exactly one group.
pub fn separator_groups(order: &[String], separators: &BTreeSet<String>) -> Vec<SeparatorGroup> {
    let mut groups = vec![SeparatorGroup {
        label: NO_SEPARATOR.to_string(),
        marker: None,
        start: 0,
        end: 0,
    }];
    for (index, folder) in order.iter().enumerate() {
        if separators.contains(folder) {
            if let Some(last) = groups.last_mut() {
                last.end = index;
            }
            groups.push(SeparatorGroup {
                label: separator_label(folder),
                marker: Some(folder.clone()),
                start: index + 1,
                end: index + 1,
            });
        } else if let Some(last) = groups.last_mut() {
            last.end = index + 1;
        }
    }
    groups
}

/// Label of the group each non-separator folder belongs to.
pub fn group_labels(order: &[String], separators: &BTreeSet<String>) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    for group in separator_groups(order, separators) {
        for folder in &order[group.start..group.end] {
            labels.insert(folder.clone(), group.label.clone());
        }
    }
    labels
}

pub fn position_map(order: &[String]) -> HashMap<&str, usize> {
    order
        .iter()
        .enumerate()
        .map(|(index, folder)| (folder.as_str(), index))
        .collect()
}

pub fn separator_label(folder: &str) -> String {
    folder
        .strip_suffix(SEPARATOR_SUFFIX)
        .unwrap_or(folder)
        .to_string()
}

pub fn is_separator_folder(folder: &str) -> bool {
    folder.ends_with(SEPARATOR_SUFFIX)
}

fn is_valid_item_id(id: &str) -> bool {
    !id.is_empty() && id.parse::<u64>().map(|value| value > 0).unwrap_or(true)
}

fn modlist_path(instance: &Path, profile: &str) -> PathBuf {
    instance.join("profiles").join(profile).join("modlist.txt")
}

/// Reads `modid=` from the `[General]` section of a mod folder's meta.ini.
pub fn read_meta_mod_id(mod_dir: &Path) -> Option<String> {
    let raw = fs::read_to_string(mod_dir.join("meta.ini")).ok()?;
    parse_meta_mod_id(&raw)
}

fn parse_meta_mod_id(raw: &str) -> Option<String> {
    let mut in_general = false;
    for line in raw.lines() {
        let line = line.trim();
        if line.starts_with('[') && line.ends_with(']') {
            in_general = line.eq_ignore_ascii_case("[General]");
            continue;
        }
        if !in_general {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case("modid") {
            let value = value.trim();
            if is_valid_item_id(value) && value.chars().all(|c| c.is_ascii_digit()) {
                return Some(value.to_string());
            }
            return None;
        }
    }
    None
}
