use crate::store::Store;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheRegion {
    DriveFiles,
    RecentFiles,
    ViewFiles,
    FavoriteFiles,
    FileLinkedViews,
    AllViews,
    FileContent,
    DriveFolders,
    FavoriteFolders,
    Conversations,
    Messages,
}

impl CacheRegion {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheRegion::DriveFiles => "drive-files",
            CacheRegion::RecentFiles => "recent-files",
            CacheRegion::ViewFiles => "view-files",
            CacheRegion::FavoriteFiles => "favorite-files",
            CacheRegion::FileLinkedViews => "file-linked-views",
            CacheRegion::AllViews => "all-views",
            CacheRegion::FileContent => "file-content",
            CacheRegion::DriveFolders => "drive-folders",
            CacheRegion::FavoriteFolders => "favorite-folders",
            CacheRegion::Conversations => "conversations",
            CacheRegion::Messages => "messages",
        }
    }
}

impl fmt::Display for CacheRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cached query: a region plus an optional scope such as a file id or a
/// folder id. A key without scope used as an invalidation pattern covers the
/// whole region.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub region: CacheRegion,
    pub scope: Option<String>,
}

impl QueryKey {
    pub fn region(region: CacheRegion) -> Self {
        Self { region, scope: None }
    }

    pub fn scoped(region: CacheRegion, scope: impl Into<String>) -> Self {
        Self {
            region,
            scope: Some(scope.into()),
        }
    }

    pub fn file_content(file_id: &str) -> Self {
        Self::scoped(CacheRegion::FileContent, file_id)
    }

    pub fn messages(conversation_id: &str) -> Self {
        Self::scoped(CacheRegion::Messages, conversation_id)
    }

    /// Prefix match: a region-wide pattern matches every key in the region.
    pub fn covers(&self, key: &QueryKey) -> bool {
        if self.region != key.region {
            return false;
        }
        match &self.scope {
            None => true,
            Some(scope) => key.scope.as_deref() == Some(scope.as_str()),
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}/{}", self.region, scope),
            None => f.write_str(self.region.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedQuery {
    pub value: Value,
    pub stale: bool,
    pub fetched_at: Instant,
}

/// Published after every invalidation batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheSignal {
    pub generation: u64,
    pub invalidated: Vec<QueryKey>,
}

#[derive(Debug, Default)]
pub struct QueryCache {
    entries: Mutex<HashMap<QueryKey, CachedQuery>>,
    signal: Store<CacheSignal>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<QueryKey, CachedQuery>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn put(&self, key: QueryKey, value: Value) {
        self.entries().insert(
            key,
            CachedQuery {
                value,
                stale: false,
                fetched_at: Instant::now(),
            },
        );
    }

    pub fn get(&self, key: &QueryKey) -> Option<CachedQuery> {
        self.entries().get(key).cloned()
    }

    /// Missing entries count as stale: the next read fetches.
    pub fn is_stale(&self, key: &QueryKey) -> bool {
        self.entries().get(key).map_or(true, |entry| entry.stale)
    }

    pub fn remove(&self, key: &QueryKey) -> Option<CachedQuery> {
        self.entries().remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Marks every entry covered by any pattern stale and publishes one
    /// signal for the batch. Returns the number of entries marked.
    pub fn invalidate(&self, patterns: &[QueryKey]) -> usize {
        if patterns.is_empty() {
            return 0;
        }
        let mut marked = 0;
        {
            let mut entries = self.entries();
            for (key, entry) in entries.iter_mut() {
                if patterns.iter().any(|pattern| pattern.covers(key)) {
                    entry.stale = true;
                    marked += 1;
                }
            }
        }
        self.signal.mutate(|signal| {
            signal.generation += 1;
            signal.invalidated = patterns.to_vec();
            true
        });
        marked
    }

    pub fn invalidate_region(&self, region: CacheRegion) -> usize {
        self.invalidate(&[QueryKey::region(region)])
    }

    pub fn generation(&self) -> u64 {
        self.signal.read(|signal| signal.generation)
    }

    pub fn last_signal(&self) -> CacheSignal {
        self.signal.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<CacheSignal> {
        self.signal.subscribe()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn region_pattern_covers_scoped_keys() {
        let pattern = QueryKey::region(CacheRegion::FileContent);
        assert!(pattern.covers(&QueryKey::file_content("f1")));
        assert!(!pattern.covers(&QueryKey::region(CacheRegion::DriveFiles)));
        assert!(QueryKey::file_content("f1").covers(&QueryKey::file_content("f1")));
        assert!(!QueryKey::file_content("f1").covers(&QueryKey::file_content("f2")));
        assert!(!QueryKey::file_content("f1").covers(&pattern));
        assert_eq!(QueryKey::file_content("f1").to_string(), "file-content/f1");
    }

    #[test]
    fn invalidation_marks_stale_and_bumps_generation() {
        let cache = QueryCache::new();
        cache.put(QueryKey::scoped(CacheRegion::DriveFiles, "root"), json!([]));
        cache.put(QueryKey::file_content("f1"), json!("body"));
        cache.put(QueryKey::file_content("f2"), json!("other"));
        let mut rx = cache.subscribe();

        let marked = cache.invalidate(&[
            QueryKey::region(CacheRegion::DriveFiles),
            QueryKey::file_content("f1"),
        ]);
        assert_eq!(marked, 2);
        assert!(cache.is_stale(&QueryKey::file_content("f1")));
        assert!(!cache.is_stale(&QueryKey::file_content("f2")));
        assert_eq!(cache.generation(), 1);
        assert!(rx.has_changed().expect("alive"));
        assert_eq!(rx.borrow_and_update().invalidated.len(), 2);

        // Stale entries keep their value until refetched.
        let entry = cache.get(&QueryKey::file_content("f1")).expect("entry");
        assert_eq!(entry.value, json!("body"));

        cache.put(QueryKey::file_content("f1"), json!("fresh"));
        assert!(!cache.is_stale(&QueryKey::file_content("f1")));
    }

    #[test]
    fn empty_regions_still_signal() {
        let cache = QueryCache::new();
        assert!(cache.is_stale(&QueryKey::region(CacheRegion::Conversations)));
        assert_eq!(cache.invalidate_region(CacheRegion::Conversations), 0);
        assert_eq!(cache.generation(), 1);
        assert_eq!(cache.invalidate(&[]), 0);
        assert_eq!(cache.generation(), 1);
    }
}
