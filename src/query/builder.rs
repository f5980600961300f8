//! Fluent query builder.
//!
//! Builds a loose [`Query`] programmatically. Construction never panics;
//! the first structural mistake is remembered and surfaced by the terminal
//! methods, so call chains stay uninterrupted.

use crate::error::Result;
use crate::query::ast::{
    Cursor, Filter, FilterValue, GroupMod, IncludeSpec, Operator, OrderDirection, PreparedQuery,
    Query,
};
use crate::query::engine::{fetch, FetchOptions, ViewEntity};
use crate::query::errors::QueryError;
use crate::query::prepare::{prepare, PrepareOptions};
use crate::query::value::Value;
use crate::schema::Schema;
use crate::store::EntityStore;

/// Fluent builder over the loose query shape.
#[derive(Default)]
pub struct QueryBuilder {
    query: Query,
    error: Option<QueryError>,
}

impl QueryBuilder {
    /// Starts a query against a collection.
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            query: Query {
                collection_name: collection.into(),
                ..Default::default()
            },
            error: None,
        }
    }

    /// Shorthand for an `['id', '=', id]` filter.
    pub fn entity_id(mut self, id: impl Into<String>) -> Self {
        self.query.entity_id = Some(id.into());
        self
    }

    /// Restricts the output to the given attribute paths.
    pub fn select<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query.select = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    /// Adds a filter statement. String values starting with `$` are parsed
    /// as variable references during preparation.
    pub fn filter(
        mut self,
        path: impl Into<String>,
        op: Operator,
        value: impl Into<Value>,
    ) -> Self {
        self.query.where_.push(Filter::stmt(
            path.into().as_str(),
            op,
            FilterValue::Literal(value.into()),
        ));
        self
    }

    /// Adds a pre-built filter entry (group, exists, or statement).
    pub fn where_filter(mut self, filter: Filter) -> Self {
        self.query.where_.push(filter);
        self
    }

    /// Adds an OR group assembled by the supplied closure.
    pub fn or_where<F>(self, build: F) -> Self
    where
        F: FnOnce(&mut GroupBuilder),
    {
        self.group(GroupMod::Or, build)
    }

    /// Adds an AND group assembled by the supplied closure.
    pub fn and_where<F>(self, build: F) -> Self
    where
        F: FnOnce(&mut GroupBuilder),
    {
        self.group(GroupMod::And, build)
    }

    fn group<F>(mut self, mode: GroupMod, build: F) -> Self
    where
        F: FnOnce(&mut GroupBuilder),
    {
        if self.error.is_some() {
            return self;
        }
        let mut builder = GroupBuilder::default();
        build(&mut builder);
        if builder.filters.is_empty() {
            self.error = Some(QueryError::InvalidWhereClause(
                "filter group requires at least one filter".into(),
            ));
            return self;
        }
        self.query.where_.push(Filter::group(mode, builder.filters));
        self
    }

    /// Appends an order term.
    pub fn order(mut self, path: impl Into<String>, direction: OrderDirection) -> Self {
        self.query.order.push((path.into(), direction));
        self
    }

    /// Appends an ascending order term.
    pub fn order_asc(self, path: impl Into<String>) -> Self {
        self.order(path, OrderDirection::Asc)
    }

    /// Appends a descending order term.
    pub fn order_desc(self, path: impl Into<String>) -> Self {
        self.order(path, OrderDirection::Desc)
    }

    /// Caps the number of returned rows.
    pub fn limit(mut self, count: usize) -> Self {
        self.query.limit = Some(count);
        self
    }

    /// Sets a keyset cursor; the query must carry an order by then.
    pub fn after(mut self, values: Vec<Value>, inclusive: bool) -> Self {
        if self.error.is_some() {
            return self;
        }
        if self.query.order.is_empty() {
            self.error = Some(QueryError::AfterRequiresOrder);
            return self;
        }
        self.query.after = Some(Cursor { values, inclusive });
        self
    }

    /// Binds a query variable referenced as `$name`.
    pub fn var(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.query.vars.insert(name.into(), value.into());
        self
    }

    /// Includes a relation under its alias with no refinement.
    pub fn include(mut self, alias: impl Into<String>) -> Self {
        self.query
            .include
            .insert(alias.into(), IncludeSpec::default());
        self
    }

    /// Includes a relation with a refined subquery.
    pub fn include_with<F>(mut self, alias: impl Into<String>, build: F) -> Self
    where
        F: FnOnce(&mut IncludeBuilder),
    {
        let mut builder = IncludeBuilder::default();
        build(&mut builder);
        self.query.include.insert(alias.into(), builder.spec);
        self
    }

    /// Returns the assembled loose query.
    pub fn build(self) -> std::result::Result<Query, QueryError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.query),
        }
    }

    /// Builds and normalizes the query against a schema.
    pub fn prepare(self, schema: &Schema) -> std::result::Result<PreparedQuery, QueryError> {
        prepare(self.build()?, schema, PrepareOptions::default())
    }

    /// Builds, prepares, and executes the query in one call.
    pub fn fetch(
        self,
        store: &dyn EntityStore,
        schema: &Schema,
        options: &FetchOptions,
    ) -> Result<Vec<ViewEntity>> {
        let prepared = self.prepare(schema)?;
        fetch(store, &prepared, options)
    }
}

/// Collects the members of an AND/OR group.
#[derive(Default)]
pub struct GroupBuilder {
    filters: Vec<Filter>,
}

impl GroupBuilder {
    /// Adds a filter statement to the group.
    pub fn filter(
        &mut self,
        path: impl Into<String>,
        op: Operator,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.filters.push(Filter::stmt(
            path.into().as_str(),
            op,
            FilterValue::Literal(value.into()),
        ));
        self
    }

    /// Adds a pre-built filter entry to the group.
    pub fn push(&mut self, filter: Filter) -> &mut Self {
        self.filters.push(filter);
        self
    }

    /// Adds a nested group.
    pub fn group<F>(&mut self, mode: GroupMod, build: F) -> &mut Self
    where
        F: FnOnce(&mut GroupBuilder),
    {
        let mut builder = GroupBuilder::default();
        build(&mut builder);
        self.filters.push(Filter::group(mode, builder.filters));
        self
    }
}

/// Refines an included relation's subquery.
#[derive(Default)]
pub struct IncludeBuilder {
    spec: IncludeSpec,
}

impl IncludeBuilder {
    /// Adds a filter on the included rows.
    pub fn filter(
        &mut self,
        path: impl Into<String>,
        op: Operator,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.spec.where_.push(Filter::stmt(
            path.into().as_str(),
            op,
            FilterValue::Literal(value.into()),
        ));
        self
    }

    /// Restricts the included rows to the given attributes.
    pub fn select<I, S>(&mut self, paths: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.select = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    /// Orders the included rows.
    pub fn order(&mut self, path: impl Into<String>, direction: OrderDirection) -> &mut Self {
        self.spec.order.push((path.into(), direction));
        self
    }

    /// Caps the number of included rows.
    pub fn limit(&mut self, count: usize) -> &mut Self {
        self.spec.limit = Some(count);
        self
    }

    /// Nests a further inclusion on the related collection.
    pub fn include<F>(&mut self, alias: impl Into<String>, build: F) -> &mut Self
    where
        F: FnOnce(&mut IncludeBuilder),
    {
        let mut builder = IncludeBuilder::default();
        build(&mut builder);
        self.spec.include.insert(alias.into(), builder.spec);
        self
    }
}

impl From<Query> for QueryBuilder {
    fn from(query: Query) -> Self {
        Self { query, error: None }
    }
}
