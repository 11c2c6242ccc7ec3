use crate::{
    cancel::{CancelToken, Outcome},
    config::Settings,
    files::write_atomic_text,
    item::Item,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Mutex, MutexGuard,
    },
    thread,
    time::Duration,
};
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{debug, error, info, warn};

const CACHE_VERSION: u32 = 1;

/// Fetches one catalog record. Implementations may be called from several threads at once.
pub trait MetadataSource: Send + Sync {
    fn fetch(&self, id: &str) -> Result<Item, SourceError>;
}

impl<T: MetadataSource + ?Sized> MetadataSource for std::sync::Arc<T> {
    fn fetch(&self, id: &str) -> Result<Item, SourceError> {
        (**self).fetch(id)
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    /// The catalog answered but the item cannot be shown. Not retried.
    #[error("item {id} unavailable: {reason}")]
    Unavailable { id: String, reason: String },
    #[error("request for item {id} failed: {message}")]
    Transport { id: String, message: String },
    #[error("item {id} could not be decoded: {message}")]
    Decode { id: String, message: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cache serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPolicy {
    /// Zero keeps entries forever.
    pub expiration_days: u32,
    pub max_retries: u32,
    pub request_delay: Duration,
    pub retry_delay: Duration,
    pub max_workers: usize,
}

impl FetchPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            expiration_days: settings.cache_expiration_days,
            max_retries: settings.max_retries,
            request_delay: settings.request_delay(),
            retry_delay: settings.retry_delay(),
            max_workers: settings.max_workers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub cached_at: String,
    pub item: Item,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheDocument {
    version: u32,
    entries: BTreeMap<String, CacheEntry>,
}

/// Row shown by cache listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheListing {
    pub id: String,
    pub name: String,
    pub category: String,
    pub cached_at: String,
}

/// Item cache backed by one JSON document per game, with a fetch collaborator behind it.
/// All writes go through a single lock, so concurrent fetch workers never interleave saves.
pub struct MetadataStore {
    path: PathBuf,
    policy: FetchPolicy,
    source: Box<dyn MetadataSource>,
    entries: Mutex<BTreeMap<String, CacheEntry>>,
    saves: AtomicUsize,
}

impl MetadataStore {
    pub fn open(
        path: &Path,
        policy: FetchPolicy,
        source: Box<dyn MetadataSource>,
    ) -> Result<Self, StoreError> {
        let entries = if path.exists() {
            let raw = fs::read_to_string(path).map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            match serde_json::from_str::<CacheDocument>(&raw) {
                Ok(doc) if doc.version == CACHE_VERSION => doc.entries,
                Ok(doc) => {
                    warn!("cache version {} unsupported; starting empty", doc.version);
                    BTreeMap::new()
                }
                Err(err) => {
                    warn!("cache {} unreadable ({err}); starting empty", path.display());
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };
        debug!("opened cache {} with {} entries", path.display(), entries.len());
        Ok(Self {
            path: path.to_path_buf(),
            policy,
            source,
            entries: Mutex::new(entries),
            saves: AtomicUsize::new(0),
        })
    }

    /// Returns the cached record when fresh, otherwise fetches and persists it.
    /// Every id resolves to a record; fetch failures come back as degraded items.
    pub fn get(&self, id: &str, cancel: &CancelToken) -> Result<Outcome<Item>, StoreError> {
        if cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        if let Some(item) = self.cached(id) {
            debug!("cache hit: {id}");
            return Ok(Outcome::Completed(item));
        }
        match self.fetch_with_retries(id, cancel) {
            Outcome::Completed(item) => {
                self.insert(item.clone())?;
                Ok(Outcome::Completed(item))
            }
            Outcome::Cancelled => Ok(Outcome::Cancelled),
        }
    }

    /// Warms the cache for `ids` using up to `max_workers` fetch threads.
    /// Returns how many records were fetched.
    pub fn prefetch<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a String>,
        cancel: &CancelToken,
    ) -> Result<Outcome<usize>, StoreError> {
        let pending: BTreeSet<String> = ids
            .into_iter()
            .filter(|id| self.cached(id).is_none())
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(Outcome::Completed(0));
        }
        let workers = self.policy.max_workers.clamp(1, pending.len());
        debug!("prefetching {} item(s) with {workers} worker(s)", pending.len());
        let queue = Mutex::new(pending.into_iter().collect::<VecDeque<_>>());

        let fetched: Vec<Item> = thread::scope(|scope| {
            let (tx, rx) = mpsc::channel();
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                scope.spawn(move || loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let next = lock(queue).pop_front();
                    let Some(id) = next else {
                        break;
                    };
                    if let Outcome::Completed(item) = self.fetch_with_retries(&id, cancel) {
                        if tx.send(item).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);

            rx.into_iter().collect()
        });

        // One save per call, including the records fetched before a cancel.
        let count = fetched.len();
        self.insert_all(fetched)?;
        if cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        Ok(Outcome::Completed(count))
    }

    pub fn entries(&self) -> Vec<CacheListing> {
        lock(&self.entries)
            .iter()
            .map(|(id, entry)| CacheListing {
                id: id.clone(),
                name: entry.item.name.clone(),
                category: entry.item.category.clone(),
                cached_at: entry.cached_at.clone(),
            })
            .collect()
    }

    pub fn delete(&self, ids: &[String]) -> Result<usize, StoreError> {
        let mut entries = lock(&self.entries);
        let removed = ids.iter().filter(|id| entries.remove(*id).is_some()).count();
        self.persist(&entries)?;
        info!("removed {removed} cache entries");
        Ok(removed)
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        let mut entries = lock(&self.entries);
        entries.clear();
        self.persist(&entries)?;
        info!("cache cleared");
        Ok(())
    }

    fn cached(&self, id: &str) -> Option<Item> {
        let entries = lock(&self.entries);
        let entry = entries.get(id)?;
        if is_fresh(entry, self.policy.expiration_days, OffsetDateTime::now_utc()) {
            Some(entry.item.clone())
        } else {
            None
        }
    }

    /// When `id` was last stored, if it is cached at all.
    pub fn cached_at(&self, id: &str) -> Option<String> {
        lock(&self.entries)
            .get(id)
            .map(|entry| entry.cached_at.clone())
    }

    fn insert(&self, item: Item) -> Result<(), StoreError> {
        self.insert_all(vec![item])
    }

    fn insert_all(&self, items: Vec<Item>) -> Result<(), StoreError> {
        if items.is_empty() {
            return Ok(());
        }
        let cached_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        let mut entries = lock(&self.entries);
        for item in items {
            entries.insert(
                item.id.clone(),
                CacheEntry {
                    cached_at: cached_at.clone(),
                    item,
                },
            );
        }
        self.persist(&entries)
    }

    #[cfg(test)]
    fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }

    fn persist(&self, entries: &BTreeMap<String, CacheEntry>) -> Result<(), StoreError> {
        let saves = self.saves.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("saving cache {} ({} entries, save #{saves})", self.path.display(), entries.len());
        let doc = CacheDocumentRef {
            version: CACHE_VERSION,
            entries,
        };
        let raw = serde_json::to_string(&doc)?;
        write_atomic_text(&self.path, &raw).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })
    }

    fn fetch_with_retries(&self, id: &str, cancel: &CancelToken) -> Outcome<Item> {
        let attempts = self.policy.max_retries.max(1);
        let mut last_error = String::new();
        for attempt in 0..attempts {
            let delay = if attempt == 0 {
                self.policy.request_delay
            } else {
                info!(
                    "retrying {id} in {:.1}s ({}/{attempts})",
                    self.policy.retry_delay.as_secs_f32(),
                    attempt + 1
                );
                self.policy.retry_delay
            };
            if !cancel.pause(delay) {
                return Outcome::Cancelled;
            }
            debug!("fetching {id}");
            match self.source.fetch(id) {
                Ok(mut item) => {
                    item.id = id.to_string();
                    info!("fetched {} ({id})", item.name);
                    return Outcome::Completed(item);
                }
                Err(SourceError::Unavailable { reason, .. }) => {
                    warn!("item {id} unavailable ({reason}); skipping");
                    return Outcome::Completed(Item::unavailable(id, &reason));
                }
                Err(err) => {
                    warn!("fetch of {id} failed (attempt {}/{attempts}): {err}", attempt + 1);
                    last_error = err.to_string();
                }
            }
        }
        error!("all attempts failed for {id}");
        Outcome::Completed(Item::fetch_failed(id, &last_error))
    }
}

#[derive(Serialize)]
struct CacheDocumentRef<'a> {
    version: u32,
    entries: &'a BTreeMap<String, CacheEntry>,
}

fn is_fresh(entry: &CacheEntry, expiration_days: u32, now: OffsetDateTime) -> bool {
    if expiration_days == 0 {
        return true;
    }
    let Ok(cached_at) = OffsetDateTime::parse(&entry.cached_at, &Rfc3339) else {
        return false;
    };
    now - cached_at < time::Duration::days(i64::from(expiration_days))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{item, FixtureSource};
    use std::sync::Arc;

    fn open(dir: &Path, source: Arc<FixtureSource>, policy: FetchPolicy) -> MetadataStore {
        MetadataStore::open(&dir.join("cache.json"), policy, Box::new(source)).unwrap()
    }

    #[test]
    fn caches_and_persists_fetches() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FixtureSource::new(vec![item("1", "One", "Utilities", &[])]));
        let cancel = CancelToken::new();

        let store = open(dir.path(), source.clone(), FixtureSource::policy());
        let first = store.get("1", &cancel).unwrap().completed().unwrap();
        let second = store.get("1", &cancel).unwrap().completed().unwrap();
        assert_eq!(first, second);
        assert_eq!(source.fetch_count("1"), 1);

        let reopened = open(dir.path(), source.clone(), FixtureSource::policy());
        assert_eq!(reopened.get("1", &cancel).unwrap().completed().unwrap().name, "One");
        assert_eq!(source.fetch_count("1"), 1);
        assert_eq!(reopened.entries().len(), 1);
    }

    #[test]
    fn failures_become_degraded_records_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FixtureSource::new(Vec::new()));
        let store = open(dir.path(), source.clone(), FixtureSource::policy());
        let record = store
            .get("77", &CancelToken::new())
            .unwrap()
            .completed()
            .unwrap();
        assert!(matches!(record.error, Some(crate::item::ItemError::FetchFailed { .. })));
        assert_eq!(source.fetch_count("77"), 3);
        assert_eq!(store.entries().len(), 1);
    }

    #[test]
    fn unavailable_items_are_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FixtureSource::new(Vec::new()).with_unavailable("5", "Hidden"));
        let store = open(dir.path(), source.clone(), FixtureSource::policy());
        let record = store
            .get("5", &CancelToken::new())
            .unwrap()
            .completed()
            .unwrap();
        assert!(matches!(record.error, Some(crate::item::ItemError::Unavailable { .. })));
        assert_eq!(source.fetch_count("5"), 1);
    }

    #[test]
    fn cancelled_get_fetches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FixtureSource::new(vec![item("1", "One", "Default", &[])]));
        let store = open(dir.path(), source.clone(), FixtureSource::policy());
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(store.get("1", &cancel).unwrap().is_cancelled());
        assert_eq!(source.fetch_count("1"), 0);
    }

    #[test]
    fn prefetch_fills_cache_in_parallel() {
        let dir = tempfile::tempdir().unwrap();
        let items = (1..=6)
            .map(|n| item(&n.to_string(), &format!("Item {n}"), "Default", &[]))
            .collect();
        let source = Arc::new(FixtureSource::new(items));
        let store = open(dir.path(), source.clone(), FixtureSource::policy());
        let ids: Vec<String> = (1..=6).map(|n| n.to_string()).collect();
        let fetched = store.prefetch(&ids, &CancelToken::new()).unwrap();
        assert_eq!(fetched, Outcome::Completed(6));
        assert_eq!(store.save_count(), 1);
        let again = store.prefetch(&ids, &CancelToken::new()).unwrap();
        assert_eq!(again, Outcome::Completed(0));
        assert_eq!(store.save_count(), 1);

        let reopened = open(dir.path(), source, FixtureSource::policy());
        assert_eq!(reopened.entries().len(), 6);
        assert!(reopened.cached_at("4").is_some());
        assert_eq!(reopened.cached_at("9"), None);
    }

    #[test]
    fn delete_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FixtureSource::new(vec![
            item("1", "One", "Default", &[]),
            item("2", "Two", "Default", &[]),
        ]));
        let store = open(dir.path(), source, FixtureSource::policy());
        let cancel = CancelToken::new();
        store.get("1", &cancel).unwrap();
        store.get("2", &cancel).unwrap();
        assert_eq!(store.delete(&["1".to_string(), "9".to_string()]).unwrap(), 1);
        assert_eq!(store.entries().len(), 1);
        store.clear().unwrap();
        assert!(store.entries().is_empty());
    }

    #[test]
    fn freshness_respects_expiration() {
        let now = OffsetDateTime::now_utc();
        let entry = |age_days: i64| CacheEntry {
            cached_at: (now - time::Duration::days(age_days)).format(&Rfc3339).unwrap(),
            item: Item::fetch_failed("1", "x"),
        };
        assert!(is_fresh(&entry(3), 7, now));
        assert!(!is_fresh(&entry(10), 7, now));
        assert!(is_fresh(&entry(1000), 0, now));
        let broken = CacheEntry {
            cached_at: "yesterday".to_string(),
            item: Item::fetch_failed("1", "x"),
        };
        assert!(!is_fresh(&broken, 7, now));
    }

    #[test]
    fn corrupt_cache_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cache.json"), "not json").unwrap();
        let store = open(
            dir.path(),
            Arc::new(FixtureSource::new(Vec::new())),
            FixtureSource::policy(),
        );
        assert!(store.entries().is_empty());
    }
}
