#![forbid(unsafe_code)]

//! Entity store abstraction.
//!
//! The step interpreter needs exactly two reads from storage: point lookup
//! of an entity by id and an ordered scan of a collection. Both run through
//! a snapshot handle so a whole fetch observes one consistent state; the
//! interpreter never opens transactions itself.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::query::ast::Path;
use crate::query::value::Value;

mod memory;

pub use memory::MemoryStore;

/// Stored record identified by `id` within a collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity identifier, also mirrored in `attrs` under `"id"`.
    pub id: String,
    /// Attribute values keyed by name.
    pub attrs: BTreeMap<String, Value>,
}

impl Entity {
    /// Builds an entity, mirroring the id into the attribute map.
    pub fn new(id: impl Into<String>, attrs: BTreeMap<String, Value>) -> Self {
        let id = id.into();
        let mut attrs = attrs;
        attrs
            .entry("id".into())
            .or_insert_with(|| Value::String(id.clone()));
        Self { id, attrs }
    }

    /// Builds an entity from a JSON object; the `id` field is required.
    pub fn from_json(json: serde_json::Value) -> Option<Self> {
        let Value::Object(attrs) = Value::from(json) else {
            return None;
        };
        let id = match attrs.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Int(id)) => id.to_string(),
            _ => return None,
        };
        Some(Entity::new(id, attrs))
    }

    /// Resolves a dotted attribute path, descending into nested objects.
    pub fn get_path(&self, path: &Path) -> Option<&Value> {
        let mut segments = path.0.iter();
        let mut current = self.attrs.get(segments.next()?)?;
        for segment in segments {
            match current {
                Value::Object(map) => current = map.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }
}

/// Read snapshot over the store. All reads within one fetch go through a
/// single snapshot.
pub trait Snapshot {
    /// Point lookup of an entity by id. Absent entities are `None`.
    fn get_entity(&self, collection: &str, id: &str) -> Result<Option<Arc<Entity>>>;

    /// Ordered scan over all entities in a collection. Iteration order is
    /// store-defined (primary-key order here); the engine imposes ordering
    /// only through explicit sort steps. Unknown collections scan empty.
    fn scan_collection<'a>(
        &'a self,
        collection: &str,
    ) -> Result<Box<dyn Iterator<Item = Result<Arc<Entity>>> + 'a>>;
}

/// Storage engine surface consumed by the query engine.
pub trait EntityStore {
    /// Opens a read snapshot.
    fn snapshot(&self) -> Result<Box<dyn Snapshot + '_>>;
}
