//! Collection schema: attribute types, relations, and read rules.
//!
//! The prepare pass validates queries against this model and uses relation
//! definitions to expand relationship shorthand into existence subqueries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::query::ast::{Cardinality, Filter, Path};
use crate::query::errors::QueryError;

/// Scalar or array type of a stored attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    /// Boolean attribute.
    Bool,
    /// Signed 64-bit integer attribute.
    Int,
    /// 64-bit floating point attribute.
    Float,
    /// UTF-8 string attribute.
    String,
    /// Ordered list attribute.
    Array,
}

impl AttributeType {
    /// True when the type supports ordering comparisons and sorting.
    pub fn is_orderable(&self) -> bool {
        !matches!(self, AttributeType::Array)
    }
}

/// Declared attribute of a collection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSchema {
    /// Value type.
    pub ty: AttributeType,
    /// Whether `null` is a legal stored value.
    pub nullable: bool,
    /// Whether the attribute may be absent entirely.
    pub optional: bool,
}

impl AttributeSchema {
    /// Required, non-nullable attribute of the given type.
    pub fn required(ty: AttributeType) -> Self {
        Self {
            ty,
            nullable: false,
            optional: false,
        }
    }
}

/// Declared relationship from one collection to another.
///
/// `where_` holds the relation's base filters, typically a single equality
/// joining the related collection back to the enclosing entity through a
/// depth-1 stack reference.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    /// Related collection name.
    pub collection: String,
    /// Whether the relation yields at most one entity.
    pub cardinality: Cardinality,
    /// Base filters of the relation's query.
    #[serde(rename = "where")]
    pub where_: Vec<Filter>,
}

/// Schema of a single collection.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct CollectionSchema {
    /// Stored attributes keyed by name. Always contains `id`.
    pub attributes: BTreeMap<String, AttributeSchema>,
    /// Relations keyed by alias.
    pub relations: BTreeMap<String, Relation>,
    /// Read-permission alternatives. When non-empty, preparation AND-joins
    /// an OR-group of these filters onto the query unless rules are
    /// skipped.
    pub read_rules: Vec<Filter>,
}

impl CollectionSchema {
    /// Looks up the attribute a path starts at, if it names one.
    pub fn attribute(&self, path: &Path) -> Option<&AttributeSchema> {
        path.first().and_then(|head| self.attributes.get(head))
    }

    /// Looks up the relation a path starts at, if it names one.
    pub fn relation(&self, path: &Path) -> Option<&Relation> {
        path.first().and_then(|head| self.relations.get(head))
    }
}

/// Full database schema.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Schema {
    /// Collections keyed by name.
    pub collections: BTreeMap<String, CollectionSchema>,
}

impl Schema {
    /// Starts a fluent schema builder.
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Returns the named collection or an `UnknownCollection` error.
    pub fn collection(&self, name: &str) -> Result<&CollectionSchema, QueryError> {
        self.collections
            .get(name)
            .ok_or_else(|| QueryError::UnknownCollection(name.to_owned()))
    }
}

/// Fluent builder for [`Schema`].
#[derive(Default)]
pub struct SchemaBuilder {
    collections: BTreeMap<String, CollectionSchema>,
}

impl SchemaBuilder {
    /// Adds a collection built by the supplied closure. An `id` attribute
    /// is always present.
    pub fn collection<F>(mut self, name: impl Into<String>, build: F) -> Self
    where
        F: FnOnce(&mut CollectionBuilder),
    {
        let mut builder = CollectionBuilder::default();
        build(&mut builder);
        self.collections.insert(name.into(), builder.finish());
        self
    }

    /// Finishes the schema.
    pub fn build(self) -> Schema {
        Schema {
            collections: self.collections,
        }
    }
}

/// Builder for a single collection schema.
#[derive(Default)]
pub struct CollectionBuilder {
    schema: CollectionSchema,
}

impl CollectionBuilder {
    /// Adds a required attribute.
    pub fn attribute(&mut self, name: impl Into<String>, ty: AttributeType) -> &mut Self {
        self.schema
            .attributes
            .insert(name.into(), AttributeSchema::required(ty));
        self
    }

    /// Adds a nullable attribute.
    pub fn nullable(&mut self, name: impl Into<String>, ty: AttributeType) -> &mut Self {
        self.schema.attributes.insert(
            name.into(),
            AttributeSchema {
                ty,
                nullable: true,
                optional: false,
            },
        );
        self
    }

    /// Adds an optional (possibly absent) attribute.
    pub fn optional(&mut self, name: impl Into<String>, ty: AttributeType) -> &mut Self {
        self.schema.attributes.insert(
            name.into(),
            AttributeSchema {
                ty,
                nullable: false,
                optional: true,
            },
        );
        self
    }

    /// Adds a cardinality-one relation.
    pub fn relation_one(
        &mut self,
        alias: impl Into<String>,
        collection: impl Into<String>,
        where_: Vec<Filter>,
    ) -> &mut Self {
        self.schema.relations.insert(
            alias.into(),
            Relation {
                collection: collection.into(),
                cardinality: Cardinality::One,
                where_,
            },
        );
        self
    }

    /// Adds a cardinality-many relation.
    pub fn relation_many(
        &mut self,
        alias: impl Into<String>,
        collection: impl Into<String>,
        where_: Vec<Filter>,
    ) -> &mut Self {
        self.schema.relations.insert(
            alias.into(),
            Relation {
                collection: collection.into(),
                cardinality: Cardinality::Many,
                where_,
            },
        );
        self
    }

    /// Adds a read-rule alternative.
    pub fn read_rule(&mut self, filter: Filter) -> &mut Self {
        self.schema.read_rules.push(filter);
        self
    }

    fn finish(mut self) -> CollectionSchema {
        self.schema
            .attributes
            .entry("id".into())
            .or_insert_with(|| AttributeSchema::required(AttributeType::String));
        self.schema
    }
}
