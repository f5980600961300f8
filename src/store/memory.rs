//! In-memory entity store with cheap snapshot semantics.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;
use crate::store::{Entity, EntityStore, Snapshot};

type Collections = BTreeMap<String, BTreeMap<String, Arc<Entity>>>;

/// Ordered in-memory store. Entities are shared by `Arc`, so a snapshot is
/// a clone of the collection maps while the records themselves are not
/// copied.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<Collections>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an entity.
    pub fn insert(&self, collection: impl Into<String>, entity: Entity) {
        let mut collections = self.collections.write();
        collections
            .entry(collection.into())
            .or_default()
            .insert(entity.id.clone(), Arc::new(entity));
    }

    /// Inserts an entity built from a JSON object. Objects without a usable
    /// `id` are ignored.
    pub fn insert_json(&self, collection: &str, json: serde_json::Value) {
        if let Some(entity) = Entity::from_json(json) {
            self.insert(collection, entity);
        }
    }

    /// Removes an entity by id, returning whether it existed.
    pub fn delete(&self, collection: &str, id: &str) -> bool {
        let mut collections = self.collections.write();
        collections
            .get_mut(collection)
            .map(|entities| entities.remove(id).is_some())
            .unwrap_or(false)
    }
}

impl EntityStore for MemoryStore {
    fn snapshot(&self) -> Result<Box<dyn Snapshot + '_>> {
        let collections = self.collections.read().clone();
        Ok(Box::new(MemorySnapshot { collections }))
    }
}

/// Frozen view of the store at snapshot time.
pub struct MemorySnapshot {
    collections: Collections,
}

impl Snapshot for MemorySnapshot {
    fn get_entity(&self, collection: &str, id: &str) -> Result<Option<Arc<Entity>>> {
        Ok(self
            .collections
            .get(collection)
            .and_then(|entities| entities.get(id))
            .cloned())
    }

    fn scan_collection<'a>(
        &'a self,
        collection: &str,
    ) -> Result<Box<dyn Iterator<Item = Result<Arc<Entity>>> + 'a>> {
        match self.collections.get(collection) {
            Some(entities) => Ok(Box::new(entities.values().cloned().map(Ok))),
            None => Ok(Box::new(std::iter::empty())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::value::Value;

    fn user(id: &str, age: i64) -> Entity {
        Entity::new(
            id,
            BTreeMap::from([("age".to_owned(), Value::Int(age))]),
        )
    }

    #[test]
    fn snapshot_is_stable_across_writes() -> Result<()> {
        let store = MemoryStore::new();
        store.insert("users", user("u1", 30));
        let snapshot = store.snapshot()?;
        store.insert("users", user("u2", 25));
        store.delete("users", "u1");

        let seen: Vec<_> = snapshot
            .scan_collection("users")?
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, "u1");
        Ok(())
    }

    #[test]
    fn unknown_collection_scans_empty() -> Result<()> {
        let store = MemoryStore::new();
        let snapshot = store.snapshot()?;
        assert_eq!(snapshot.scan_collection("ghosts")?.count(), 0);
        assert!(snapshot.get_entity("ghosts", "g1")?.is_none());
        Ok(())
    }

    #[test]
    fn id_is_mirrored_into_attrs() {
        let entity = user("u9", 1);
        assert_eq!(entity.attrs.get("id"), Some(&Value::String("u9".into())));
    }
}
