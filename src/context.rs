use crate::{
    cancel::CancelToken,
    config::{DataPaths, Settings},
    installed::{InstalledSet, ModList},
    rules::RuleSet,
    source::HttpSource,
    store::{FetchPolicy, MetadataStore},
};
use anyhow::{bail, Context, Result};
use std::path::PathBuf;

/// Everything one operation reads. Built fresh per operation and never mutated while it runs.
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    pub settings: Settings,
    pub rules: RuleSet,
    pub installed: InstalledSet,
    pub cancel: CancelToken,
}

impl AnalysisContext {
    pub fn effective_id<'a>(&'a self, id: &'a str) -> &'a str {
        self.rules.effective_id(id)
    }

    /// Ignored ids count as present; everything else is checked after one replacement hop.
    pub fn is_satisfied(&self, id: &str) -> bool {
        self.rules.is_ignored(id) || self.installed.is_installed(self.effective_id(id))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Where an operation finds its inputs: data dir, settings and the Mod Organizer profile.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub paths: DataPaths,
    pub settings: Settings,
    pub instance: Option<PathBuf>,
    pub profile: String,
}

impl Workspace {
    pub fn new(
        paths: DataPaths,
        settings: Settings,
        instance: Option<PathBuf>,
        profile: Option<String>,
    ) -> Self {
        let instance = instance.or_else(|| settings.instance_dir.clone());
        let profile = profile.unwrap_or_else(|| settings.profile.clone());
        Self {
            paths,
            settings,
            instance,
            profile,
        }
    }

    pub fn mod_list(&self) -> Result<ModList> {
        let Some(instance) = &self.instance else {
            bail!("no Mod Organizer instance configured; pass --instance or set instance_dir");
        };
        ModList::load(instance, &self.profile)
    }

    /// Reloads rules and the installed listing so nothing leaks between operations.
    pub fn context(&self, cancel: &CancelToken) -> Result<(AnalysisContext, ModList)> {
        let mod_list = self.mod_list()?;
        let ctx = AnalysisContext {
            settings: self.settings.clone(),
            rules: RuleSet::load(&self.paths.rules()),
            installed: mod_list.snapshot(),
            cancel: cancel.clone(),
        };
        Ok((ctx, mod_list))
    }

    pub fn open_store(&self) -> Result<MetadataStore> {
        let store = MetadataStore::open(
            &self.paths.cache(&self.settings),
            FetchPolicy::from_settings(&self.settings),
            Box::new(HttpSource::new(&self.settings)),
        )
        .context("open metadata cache")?;
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::context;
    use std::fs;

    #[test]
    fn satisfaction_uses_ignore_and_one_replacement_hop() {
        let mut rules = RuleSet::default();
        rules.ignore.insert("5".into());
        rules.replace.insert("7".into(), "2".into());
        rules.replace.insert("8".into(), "7".into());
        let ctx = context(&[("Alpha", "1"), ("Beta", "2")], rules);
        assert!(ctx.is_satisfied("1"));
        assert!(ctx.is_satisfied("5"));
        assert!(ctx.is_satisfied("7"));
        assert!(!ctx.is_satisfied("8"));
        assert!(!ctx.is_satisfied("3"));
    }

    #[test]
    fn workspace_reads_instance_and_rules() {
        let dir = tempfile::tempdir().unwrap();
        let instance = dir.path().join("mo2");
        fs::create_dir_all(instance.join("profiles/Default")).unwrap();
        fs::create_dir_all(instance.join("mods/SkyUI")).unwrap();
        fs::write(instance.join("mods/SkyUI/meta.ini"), "[General]\nmodid=3863\n").unwrap();
        fs::write(instance.join("profiles/Default/modlist.txt"), "+SkyUI\n").unwrap();

        let paths = DataPaths::resolve(Some(&dir.path().join("data"))).unwrap();
        let workspace = Workspace::new(paths, Settings::default(), Some(instance), None);
        let (ctx, list) = workspace.context(&CancelToken::new()).unwrap();
        assert_eq!(list.entries.len(), 1);
        assert!(ctx.installed.is_installed("3863"));
        assert!(ctx.rules.is_ignored("12604"));
    }

    #[test]
    fn missing_instance_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::resolve(Some(dir.path())).unwrap();
        let workspace = Workspace::new(paths, Settings::default(), None, None);
        assert!(workspace.mod_list().is_err());
    }
}
