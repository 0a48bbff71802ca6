use crate::cache::{CacheRegion, QueryCache, QueryKey};
use crate::drive::DriveStore;
use crate::protocol::{EntityKind, EntityMutation, MutationOp};

const FILE_REGIONS: &[CacheRegion] = &[
    CacheRegion::DriveFiles,
    CacheRegion::RecentFiles,
    CacheRegion::ViewFiles,
    CacheRegion::FavoriteFiles,
    CacheRegion::FileLinkedViews,
    CacheRegion::AllViews,
];

const FOLDER_REGIONS: &[CacheRegion] = &[CacheRegion::DriveFolders, CacheRegion::FavoriteFolders];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeOutcome {
    pub invalidated: Vec<QueryKey>,
    pub cleared_selection: bool,
}

/// Cache keys a mutation notice makes stale.
pub fn invalidation_keys(mutation: &EntityMutation) -> Vec<QueryKey> {
    let regions = match mutation.entity {
        EntityKind::File => FILE_REGIONS,
        EntityKind::Folder => FOLDER_REGIONS,
    };
    let mut keys: Vec<QueryKey> = regions.iter().copied().map(QueryKey::region).collect();
    if let (EntityKind::File, MutationOp::Updated, Some(id)) =
        (mutation.entity, mutation.op, mutation.id.as_deref())
    {
        keys.push(QueryKey::file_content(id));
    }
    keys
}

/// Applies a mutation notice: invalidates the affected regions and, when the
/// open file was deleted elsewhere, drops the selection.
pub fn apply(cache: &QueryCache, drive: &DriveStore, mutation: &EntityMutation) -> BridgeOutcome {
    let invalidated = invalidation_keys(mutation);
    cache.invalidate(&invalidated);

    let cleared_selection = match (mutation.entity, mutation.op, mutation.id.as_deref()) {
        (EntityKind::File, MutationOp::Deleted, Some(id)) => drive.clear_if_selected(id),
        _ => false,
    };
    if cleared_selection {
        tracing::info!(
            event = "selection_cleared",
            reason = "remote_delete",
            file_id = mutation.id.as_deref().unwrap_or_default()
        );
    }

    BridgeOutcome {
        invalidated,
        cleared_selection,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn file(op: MutationOp, id: &str) -> EntityMutation {
        EntityMutation {
            entity: EntityKind::File,
            op,
            id: Some(id.to_string()),
        }
    }

    #[test]
    fn file_updates_also_invalidate_content() {
        let keys = invalidation_keys(&file(MutationOp::Updated, "f1"));
        assert_eq!(keys.len(), FILE_REGIONS.len() + 1);
        assert!(keys.contains(&QueryKey::file_content("f1")));

        let keys = invalidation_keys(&file(MutationOp::Created, "f1"));
        assert!(!keys.iter().any(|k| k.region == CacheRegion::FileContent));
    }

    #[test]
    fn folder_notices_touch_folder_regions_only() {
        let keys = invalidation_keys(&EntityMutation {
            entity: EntityKind::Folder,
            op: MutationOp::Deleted,
            id: Some("d1".to_string()),
        });
        assert_eq!(
            keys,
            vec![
                QueryKey::region(CacheRegion::DriveFolders),
                QueryKey::region(CacheRegion::FavoriteFolders),
            ]
        );
    }

    #[test]
    fn deleting_the_open_file_clears_selection() {
        let cache = QueryCache::new();
        let drive = DriveStore::new();
        drive.select_file("f1", "notes.md", None);

        let outcome = apply(&cache, &drive, &file(MutationOp::Deleted, "f2"));
        assert!(!outcome.cleared_selection);
        assert_eq!(drive.selected_file_id().as_deref(), Some("f1"));

        let outcome = apply(&cache, &drive, &file(MutationOp::Deleted, "f1"));
        assert!(outcome.cleared_selection);
        assert_eq!(drive.selected_file_id(), None);
        assert_eq!(cache.generation(), 2);
    }

    #[test]
    fn updates_never_touch_selection() {
        let cache = QueryCache::new();
        let drive = DriveStore::new();
        drive.select_file("f1", "notes.md", None);
        cache.put(QueryKey::file_content("f1"), json!("old"));

        let outcome = apply(&cache, &drive, &file(MutationOp::Updated, "f1"));
        assert!(!outcome.cleared_selection);
        assert!(cache.is_stale(&QueryKey::file_content("f1")));
        assert_eq!(drive.selected_file_id().as_deref(), Some("f1"));
    }
}
