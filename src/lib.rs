//! Loam query core: declarative query planning and execution over an
//! embedded entity store.
//!
//! The crate compiles a normalized relational query (filters, ordering,
//! limits, nested inclusion, existence subqueries) into a linear step plan,
//! then interprets that plan against a key-value entity store. Repeatedly
//! evaluated relational subqueries are hoisted into materializable views so
//! they are computed once per fetch instead of once per candidate row.

#![warn(missing_docs)]

pub mod error;
pub mod query;
pub mod schema;
pub mod store;

pub use error::{LoamError, Result};
pub use query::QueryBuilder;
pub use schema::{Schema, SchemaBuilder};
pub use store::{Entity, EntityStore, MemoryStore};
