use crate::{
    cancel::Outcome,
    context::AnalysisContext,
    store::{MetadataStore, StoreError},
};
use serde::Serialize;
use tracing::info;

/// A translation of an installed item that is not installed itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranslationMatch {
    pub original_id: String,
    pub original_name: String,
    pub folders: Vec<String>,
    pub translation_id: String,
    pub translation_name: String,
    pub language: String,
    /// Last update of the translation.
    pub update_timestamp: i64,
    /// Last update of the translated item.
    pub original_update_timestamp: i64,
}

/// Items with no installed translation that offer one in `language` (substring, any case).
pub fn find_missing_translations(
    ctx: &AnalysisContext,
    store: &MetadataStore,
    language: &str,
) -> Result<Outcome<Vec<TranslationMatch>>, StoreError> {
    let query = language.trim().to_lowercase();
    let mut matches = Vec::new();
    for id in &ctx.installed.installed_ids {
        if ctx.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        let Outcome::Completed(item) = store.get(id, &ctx.cancel)? else {
            return Ok(Outcome::Cancelled);
        };
        if item.translations.is_empty()
            || item
                .translations
                .iter()
                .any(|translation| ctx.installed.is_installed(&translation.id))
        {
            continue;
        }
        for translation in &item.translations {
            if !translation.language.to_lowercase().contains(&query) {
                continue;
            }
            let Outcome::Completed(details) = store.get(&translation.id, &ctx.cancel)? else {
                return Ok(Outcome::Cancelled);
            };
            let translation_name = if details.is_degraded() && !translation.name.is_empty() {
                translation.name.clone()
            } else {
                details.name
            };
            matches.push(TranslationMatch {
                original_id: id.clone(),
                original_name: item.name.clone(),
                folders: ctx.installed.folders_of(id).to_vec(),
                translation_id: translation.id.clone(),
                translation_name,
                language: translation.language.clone(),
                update_timestamp: details.update_timestamp,
                original_update_timestamp: item.update_timestamp,
            });
        }
    }
    info!("{} missing {language} translation(s)", matches.len());
    Ok(Outcome::Completed(matches))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        item::{Item, Translation},
        rules::RuleSet,
        testing::{context, item, store},
    };

    fn with_translations(mut base: Item, translations: &[(&str, &str)]) -> Item {
        base.translations = translations
            .iter()
            .map(|(id, language)| Translation {
                id: id.to_string(),
                name: format!("Translation {id}"),
                language: language.to_string(),
            })
            .collect();
        base
    }

    #[test]
    fn finds_uninstalled_translations_by_language() {
        let dir = tempfile::tempdir().unwrap();
        let mut german = item("20", "Mod One - Deutsch", "Default", &[]);
        german.update_timestamp = 1_700_000_000;
        let mut original = item("1", "Mod One", "Default", &[]);
        original.update_timestamp = 1_600_000_000;
        let store = store(
            dir.path(),
            vec![
                with_translations(original, &[("20", "German"), ("21", "French")]),
                with_translations(item("2", "Mod Two", "Default", &[]), &[("30", "German")]),
                german,
            ],
        );
        let ctx = context(&[("One", "1"), ("Two", "2"), ("Two DE", "30")], RuleSet::default());
        let found = find_missing_translations(&ctx, &store, "german")
            .unwrap()
            .completed()
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].original_id, "1");
        assert_eq!(found[0].folders, vec!["One".to_string()]);
        assert_eq!(found[0].translation_name, "Mod One - Deutsch");
        assert_eq!(found[0].update_timestamp, 1_700_000_000);
        assert_eq!(found[0].original_update_timestamp, 1_600_000_000);
    }

    #[test]
    fn degraded_translation_keeps_listed_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(
            dir.path(),
            vec![with_translations(item("1", "Mod One", "Default", &[]), &[("40", "Polish")])],
        );
        let ctx = context(&[("One", "1")], RuleSet::default());
        let found = find_missing_translations(&ctx, &store, "POL")
            .unwrap()
            .completed()
            .unwrap();
        assert_eq!(found[0].translation_name, "Translation 40");
    }
}
