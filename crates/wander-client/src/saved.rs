//! Saved tours and companies.
//!
//! Each cache keeps two lists in the key/value table: the saved identifiers
//! and a denormalized snapshot per identifier. The two are always written in
//! one transaction and always cover the same identifiers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::{debug, info, warn};

use wander_db::Database;
use wander_types::models::ItemSnapshot;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavedKind {
    Tours,
    Companies,
}

impl SavedKind {
    fn index_key(self) -> &'static str {
        match self {
            Self::Tours => "savedTours",
            Self::Companies => "savedCompanies",
        }
    }

    fn snapshot_key(self) -> &'static str {
        match self {
            Self::Tours => "savedTourSnapshots",
            Self::Companies => "savedCompanySnapshots",
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SavedState {
    ids: Vec<String>,
    snapshots: Vec<ItemSnapshot>,
}

pub struct SavedItemsCache {
    db: Arc<Database>,
    kind: SavedKind,
    state: Mutex<SavedState>,
}

impl SavedItemsCache {
    /// Load both lists, upgrading legacy data and repairing any mismatch
    /// between them. Repairs are written back once.
    pub fn load(db: Arc<Database>, kind: SavedKind) -> Result<Self, StoreError> {
        let (ids, ids_migrated) = load_ids(&db, kind)?;
        let (snapshots, snapshots_migrated) = load_snapshots(&db, kind)?;

        let mut state = SavedState { ids, snapshots };
        let repaired = reconcile(&mut state);

        let cache = Self {
            db,
            kind,
            state: Mutex::new(SavedState::default()),
        };

        if ids_migrated || snapshots_migrated || repaired {
            info!(kind = ?kind, "Upgraded stored saved items");
            cache.persist(&state)?;
        }
        *cache.state() = state;
        Ok(cache)
    }

    /// Save `identifier` if absent, unsave it if present. Returns whether it
    /// is saved afterwards.
    pub fn toggle_saved(&self, identifier: &str, snapshot: Option<ItemSnapshot>) -> Result<bool, StoreError> {
        if identifier.is_empty() {
            return Err(StoreError::Validation("identifier is empty".into()));
        }
        if let Some(snap) = &snapshot {
            if snap.identifier != identifier {
                return Err(StoreError::Validation(format!(
                    "snapshot is for {:?}, not {:?}",
                    snap.identifier, identifier
                )));
            }
        }

        let mut state = self.state();
        let mut next = state.clone();

        let saved = if next.ids.iter().any(|id| id == identifier) {
            next.ids.retain(|id| id != identifier);
            next.snapshots.retain(|s| s.identifier != identifier);
            false
        } else {
            next.ids.push(identifier.to_string());
            if !next.snapshots.iter().any(|s| s.identifier == identifier) {
                next.snapshots
                    .push(snapshot.unwrap_or_else(|| ItemSnapshot::bare(identifier)));
            }
            true
        };

        self.persist(&next)?;
        *state = next;
        debug!(kind = ?self.kind, identifier, saved, "Toggled saved item");
        Ok(saved)
    }

    pub fn is_saved(&self, identifier: &str) -> bool {
        self.state().ids.iter().any(|id| id == identifier)
    }

    pub fn ids(&self) -> Vec<String> {
        self.state().ids.clone()
    }

    /// Snapshots in the order items were saved.
    pub fn snapshots(&self) -> Vec<ItemSnapshot> {
        self.state().snapshots.clone()
    }

    pub fn len(&self) -> usize {
        self.state().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the cached snapshot of an already saved item with fresher
    /// catalog data. Returns false when the item is not saved.
    pub fn update_snapshot(&self, snapshot: ItemSnapshot) -> Result<bool, StoreError> {
        let mut state = self.state();
        let Some(pos) = state
            .snapshots
            .iter()
            .position(|s| s.identifier == snapshot.identifier)
        else {
            return Ok(false);
        };

        let mut next = state.clone();
        next.snapshots[pos] = snapshot;
        self.persist(&next)?;
        *state = next;
        Ok(true)
    }

    /// Drop every saved item whose identifier is not in `valid`.
    ///
    /// `valid` must be the full catalog: an identifier missing from a partial
    /// page is indistinguishable from one deleted upstream. Nothing is written
    /// when nothing is dropped. Returns the number of items removed.
    pub fn cleanup_stale(&self, valid: &HashSet<String>) -> Result<usize, StoreError> {
        let mut state = self.state();
        let removed = state.ids.iter().filter(|id| !valid.contains(*id)).count();
        if removed == 0 {
            return Ok(0);
        }

        let mut next = state.clone();
        next.ids.retain(|id| valid.contains(id));
        next.snapshots.retain(|s| valid.contains(&s.identifier));

        self.persist(&next)?;
        *state = next;
        info!(kind = ?self.kind, removed, "Removed stale saved items");
        Ok(removed)
    }

    fn persist(&self, state: &SavedState) -> Result<(), StoreError> {
        let ids = serde_json::to_string(&state.ids)?;
        let snapshots = serde_json::to_string(&state.snapshots)?;
        self.db.kv_set_many(&[
            (self.kind.index_key(), ids.as_str()),
            (self.kind.snapshot_key(), snapshots.as_str()),
        ])?;
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, SavedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read a JSON array, treating absence or corruption as empty.
fn load_array(db: &Database, key: &str) -> Result<Vec<Value>, StoreError> {
    let Some(raw) = db.kv_get(key)? else {
        return Ok(Vec::new());
    };
    match serde_json::from_str(&raw) {
        Ok(values) => Ok(values),
        Err(e) => {
            warn!(key, "Corrupt saved items, starting empty: {}", e);
            Ok(Vec::new())
        }
    }
}

/// Identifiers as strings. Older clients stored numbers; those are
/// converted and the bool reports that a write-back is needed.
fn load_ids(db: &Database, kind: SavedKind) -> Result<(Vec<String>, bool), StoreError> {
    let mut migrated = false;
    let mut ids: Vec<String> = Vec::new();

    for value in load_array(db, kind.index_key())? {
        let id = match value {
            Value::String(s) => s,
            Value::Number(n) => {
                migrated = true;
                n.to_string()
            }
            other => {
                warn!(kind = ?kind, "Dropping unusable saved identifier {}", other);
                migrated = true;
                continue;
            }
        };
        if id.is_empty() || ids.contains(&id) {
            migrated = true;
            continue;
        }
        ids.push(id);
    }

    Ok((ids, migrated))
}

fn load_snapshots(db: &Database, kind: SavedKind) -> Result<(Vec<ItemSnapshot>, bool), StoreError> {
    let mut migrated = false;
    let mut snapshots = Vec::new();

    for value in load_array(db, kind.snapshot_key())? {
        if value.get("identifier").is_some_and(Value::is_number) {
            migrated = true;
        }
        match serde_json::from_value::<ItemSnapshot>(value) {
            Ok(snapshot) => snapshots.push(snapshot),
            Err(e) => {
                warn!(kind = ?kind, "Dropping unreadable snapshot: {}", e);
                migrated = true;
            }
        }
    }

    Ok((snapshots, migrated))
}

/// Bring the snapshot list in line with the identifier list: one snapshot
/// per identifier, in identifier order. Returns true if anything changed.
fn reconcile(state: &mut SavedState) -> bool {
    let before: Vec<String> = state.snapshots.iter().map(|s| s.identifier.clone()).collect();
    let mut remaining = std::mem::take(&mut state.snapshots);

    for id in &state.ids {
        let snapshot = match remaining.iter().position(|s| &s.identifier == id) {
            Some(pos) => remaining.swap_remove(pos),
            None => ItemSnapshot::bare(id.clone()),
        };
        state.snapshots.push(snapshot);
    }

    before != state.ids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> (SavedItemsCache, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        (SavedItemsCache::load(db.clone(), SavedKind::Tours).unwrap(), db)
    }

    fn bali() -> ItemSnapshot {
        ItemSnapshot {
            title: Some("Bali Tour".into()),
            price: Some(89.0),
            ..ItemSnapshot::bare("tour-123")
        }
    }

    fn assert_lockstep(cache: &SavedItemsCache) {
        let ids: HashSet<String> = cache.ids().into_iter().collect();
        let snaps: HashSet<String> = cache.snapshots().into_iter().map(|s| s.identifier).collect();
        assert_eq!(ids, snaps);
    }

    #[test]
    fn toggle_twice_round_trips() {
        let (cache, db) = cache();

        assert!(cache.toggle_saved("tour-123", Some(bali())).unwrap());
        assert!(cache.is_saved("tour-123"));
        assert_eq!(cache.snapshots()[0].title.as_deref(), Some("Bali Tour"));

        assert!(!cache.toggle_saved("tour-123", None).unwrap());
        assert!(cache.is_empty());
        assert!(cache.snapshots().is_empty());
        assert_eq!(db.kv_get("savedTourSnapshots").unwrap().as_deref(), Some("[]"));
    }

    #[test]
    fn save_without_snapshot_keeps_lists_in_lockstep() {
        let (cache, _) = cache();
        cache.toggle_saved("tour-1", None).unwrap();
        cache.toggle_saved("tour-2", Some(ItemSnapshot::bare("tour-2"))).unwrap();
        cache.toggle_saved("tour-3", None).unwrap();
        cache.toggle_saved("tour-2", None).unwrap();
        assert_lockstep(&cache);

        let valid = HashSet::from(["tour-3".to_string()]);
        assert_eq!(cache.cleanup_stale(&valid).unwrap(), 1);
        assert_lockstep(&cache);
        assert_eq!(cache.ids(), vec!["tour-3"]);
    }

    #[test]
    fn mismatched_snapshot_is_rejected() {
        let (cache, _) = cache();
        let err = cache.toggle_saved("tour-9", Some(bali())).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert!(!cache.is_saved("tour-9"));
    }

    #[test]
    fn cleanup_without_changes_does_not_write() {
        let (cache, db) = cache();
        cache.toggle_saved("tour-123", Some(bali())).unwrap();

        // Anything written now would overwrite this sentinel.
        db.kv_set("savedTours", "[\"sentinel\"]").unwrap();
        let valid = HashSet::from(["tour-123".to_string(), "tour-999".to_string()]);
        assert_eq!(cache.cleanup_stale(&valid).unwrap(), 0);
        assert_eq!(db.kv_get("savedTours").unwrap().as_deref(), Some("[\"sentinel\"]"));
    }

    #[test]
    fn legacy_numeric_ids_are_migrated_once() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.kv_set("savedTours", "[12, \"tour-7\", 12]").unwrap();
        db.kv_set(
            "savedTourSnapshots",
            r#"[{"identifier": 12, "title": "Old"}, {"identifier": "tour-7"}]"#,
        )
        .unwrap();

        let cache = SavedItemsCache::load(db.clone(), SavedKind::Tours).unwrap();
        assert_eq!(cache.ids(), vec!["12", "tour-7"]);
        assert!(cache.is_saved("12"));
        assert_eq!(db.kv_get("savedTours").unwrap().as_deref(), Some("[\"12\",\"tour-7\"]"));

        let snapshots = db.kv_get("savedTourSnapshots").unwrap().unwrap();
        assert!(snapshots.contains(r#""identifier":"12""#), "got: {snapshots}");
    }

    #[test]
    fn load_repairs_orphans_and_missing_snapshots() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.kv_set("savedCompanies", "[\"co-1\", \"co-2\"]").unwrap();
        db.kv_set(
            "savedCompanySnapshots",
            r#"[{"identifier": "co-2", "title": "Reef Divers"}, {"identifier": "co-gone"}]"#,
        )
        .unwrap();

        let cache = SavedItemsCache::load(db, SavedKind::Companies).unwrap();
        assert_lockstep(&cache);
        let snaps = cache.snapshots();
        assert_eq!(snaps[0], ItemSnapshot::bare("co-1"));
        assert_eq!(snaps[1].title.as_deref(), Some("Reef Divers"));
    }

    #[test]
    fn corrupt_json_loads_empty() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.kv_set("savedTours", "{{{").unwrap();
        let cache = SavedItemsCache::load(db, SavedKind::Tours).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn update_snapshot_only_touches_saved_items() {
        let (cache, _) = cache();
        cache.toggle_saved("tour-123", None).unwrap();

        assert!(cache.update_snapshot(bali()).unwrap());
        assert_eq!(cache.snapshots()[0].price, Some(89.0));
        assert!(!cache.update_snapshot(ItemSnapshot::bare("tour-404")).unwrap());
        assert_lockstep(&cache);
    }

    #[test]
    fn tours_and_companies_are_independent() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let tours = SavedItemsCache::load(db.clone(), SavedKind::Tours).unwrap();
        tours.toggle_saved("shared-id", None).unwrap();

        let companies = SavedItemsCache::load(db, SavedKind::Companies).unwrap();
        assert!(!companies.is_saved("shared-id"));
    }
}
