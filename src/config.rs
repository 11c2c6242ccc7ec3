use crate::{files::write_atomic_text, item::DEFAULT_CATEGORY};
use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::warn;

pub const DEFAULT_CATEGORY_PRIORITY: i32 = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_cache_expiration_days")]
    pub cache_expiration_days: u32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_recursion_depth")]
    pub max_recursion_depth: usize,
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    #[serde(default = "default_uninstalled_fetch_depth")]
    pub uninstalled_fetch_depth: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_game_name")]
    pub game_name: String,
    #[serde(default = "default_metadata_endpoint")]
    pub metadata_endpoint: String,
    /// Base of the public mod pages linked from reports.
    #[serde(default = "default_site_url")]
    pub site_url: String,
    #[serde(default)]
    pub instance_dir: Option<PathBuf>,
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_category_priorities")]
    pub category_priorities: BTreeMap<String, i32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_expiration_days: default_cache_expiration_days(),
            request_timeout_ms: default_request_timeout_ms(),
            max_recursion_depth: default_max_recursion_depth(),
            request_delay_ms: default_request_delay_ms(),
            uninstalled_fetch_depth: default_uninstalled_fetch_depth(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            max_workers: default_max_workers(),
            log_level: default_log_level(),
            game_name: default_game_name(),
            metadata_endpoint: default_metadata_endpoint(),
            site_url: default_site_url(),
            instance_dir: None,
            profile: default_profile(),
            category_priorities: default_category_priorities(),
        }
    }
}

impl Settings {
    /// Reads `settings.json`, creating it with defaults on first run.
    /// A file that no longer parses is left alone and defaults are used.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path).context("read settings")?;
            return match serde_json::from_str::<Settings>(&raw) {
                Ok(settings) => Ok(settings),
                Err(err) => {
                    warn!("settings file {} is invalid ({err}); using defaults", path.display());
                    Ok(Settings::default())
                }
            };
        }

        let settings = Settings::default();
        settings.save(path)?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self).context("serialize settings")?;
        write_atomic_text(path, &raw).context("write settings")?;
        Ok(())
    }

    pub fn category_priority(&self, category: &str) -> i32 {
        self.category_priorities
            .get(category)
            .or_else(|| self.category_priorities.get(DEFAULT_CATEGORY))
            .copied()
            .unwrap_or(DEFAULT_CATEGORY_PRIORITY)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn item_page_url(&self, id: &str) -> String {
        format!(
            "{}/{}/mods/{id}",
            self.site_url.trim_end_matches('/'),
            self.game_name
        )
    }

    /// File-safe form of the game name, used to keep caches per game.
    pub fn sanitized_game_name(&self) -> String {
        self.game_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect()
    }
}

/// Every file the tool owns, rooted at one data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    pub data_dir: PathBuf,
}

impl DataPaths {
    pub fn resolve(override_dir: Option<&Path>) -> Result<Self> {
        let data_dir = match override_dir {
            Some(dir) => dir.to_path_buf(),
            None => base_data_dir()?,
        };
        fs::create_dir_all(&data_dir).context("create data dir")?;
        Ok(Self { data_dir })
    }

    pub fn settings(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }

    pub fn rules(&self) -> PathBuf {
        self.data_dir.join("rules.toml")
    }

    pub fn log(&self) -> PathBuf {
        self.data_dir.join("modorder.log")
    }

    pub fn cache(&self, settings: &Settings) -> PathBuf {
        self.data_dir
            .join("cache")
            .join(format!("{}.json", settings.sanitized_game_name()))
    }

    pub fn last_analysis(&self) -> PathBuf {
        self.data_dir.join("last_analysis.json")
    }
}

fn base_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("modorder"))
}

fn default_cache_expiration_days() -> u32 {
    180
}

fn default_request_timeout_ms() -> u64 {
    45_000
}

fn default_max_recursion_depth() -> usize {
    10
}

fn default_request_delay_ms() -> u64 {
    3_000
}

fn default_uninstalled_fetch_depth() -> usize {
    2
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    3_000
}

fn default_max_workers() -> usize {
    4
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_game_name() -> String {
    "skyrimspecialedition".to_string()
}

fn default_metadata_endpoint() -> String {
    "http://127.0.0.1:8431".to_string()
}

fn default_site_url() -> String {
    "https://www.nexusmods.com".to_string()
}

fn default_profile() -> String {
    "Default".to_string()
}

fn default_category_priorities() -> BTreeMap<String, i32> {
    [
        ("VR", 10),
        ("Modders Resources", 10),
        ("Utilities", 10),
        ("Bug Fixes", 11),
        ("User Interface", 15),
        ("Gameplay", 20),
        ("Immersion", 21),
        ("Combat", 25),
        ("Stealth", 26),
        ("Skills and Leveling", 30),
        ("Magic - Gameplay", 35),
        ("Races, Classes, and Birthsigns", 36),
        ("Guilds/Factions", 40),
        ("Quests and Adventures", 50),
        ("Locations - New", 51),
        ("Dungeons", 52),
        ("Creatures and Mounts", 55),
        ("NPC", 58),
        ("Followers & Companions", 59),
        ("Weapons", 60),
        ("Armour", 61),
        ("Clothing and Accessories", 62),
        ("Items and Objects - Player", 65),
        ("Models and Textures", 70),
        ("Visuals and Graphics", 71),
        ("Environmental", 72),
        ("Animation", 75),
        ("Body, Face, and Hair", 78),
        ("Audio", 80),
        ("Presets - ENB and ReShade", 85),
        ("Overhauls", 90),
        ("Miscellaneous", 95),
        ("Patches", 99),
        (DEFAULT_CATEGORY, DEFAULT_CATEGORY_PRIORITY),
    ]
    .into_iter()
    .map(|(name, priority)| (name.to_string(), priority))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_load_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = Settings::load_or_create(&path).unwrap();
        assert_eq!(settings, Settings::default());
        assert!(path.exists());
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"max_workers": 1, "game_name": "fallout4"}"#).unwrap();
        let settings = Settings::load_or_create(&path).unwrap();
        assert_eq!(settings.max_workers, 1);
        assert_eq!(settings.game_name, "fallout4");
        assert_eq!(settings.max_recursion_depth, 10);
        assert_eq!(settings.category_priority("Patches"), 99);
    }

    #[test]
    fn corrupt_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        let settings = Settings::load_or_create(&path).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn unknown_category_uses_default_priority() {
        let settings = Settings::default();
        assert_eq!(settings.category_priority("Something New"), DEFAULT_CATEGORY_PRIORITY);
        assert_eq!(settings.category_priority("Utilities"), 10);
    }

    #[test]
    fn game_name_is_sanitized_for_paths() {
        let settings = Settings {
            game_name: "skyrim special-edition".to_string(),
            ..Settings::default()
        };
        assert_eq!(settings.sanitized_game_name(), "skyrim_special_edition");
    }

    #[test]
    fn item_pages_link_under_the_site() {
        let settings = Settings {
            site_url: "https://mods.example/".to_string(),
            game_name: "fallout4".to_string(),
            ..Settings::default()
        };
        assert_eq!(settings.item_page_url("266"), "https://mods.example/fallout4/mods/266");
    }
}
