//! Query preparation.
//!
//! Normalizes a loose user query against the schema so everything
//! downstream can assume a canonical shape: variable strings are parsed
//! into typed references, relationship shorthand becomes explicit existence
//! subqueries, read rules are injected, selections default to all
//! non-relation attributes, and every path is validated. This is the single
//! normalization point; the view extractor and the compiler never see
//! dotted relation paths or raw `$...` strings.

use std::collections::BTreeMap;

use tracing::debug;

use crate::query::ast::{
    Cardinality, Cursor, Filter, FilterGroup, FilterStatement, FilterValue, GroupMod, IncludeSpec,
    Inclusion, OrderDirection, OrderTerm, Path, PreparedQuery, Query, SubQueryFilter, VarRef,
};
use crate::query::errors::QueryError;
use crate::schema::{CollectionSchema, Schema};

/// Options controlling preparation.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrepareOptions {
    /// Skip read-rule injection (trusted/internal callers).
    pub skip_rules: bool,
}

/// Normalizes `query` against `schema` into a [`PreparedQuery`].
pub fn prepare(
    query: Query,
    schema: &Schema,
    opts: PrepareOptions,
) -> Result<PreparedQuery, QueryError> {
    let preparer = Preparer { schema, opts };
    let prepared = preparer.prepare_root(query)?;
    debug!(
        collection = %prepared.collection_name,
        filters = prepared.where_.len(),
        includes = prepared.include.len(),
        "prepared query"
    );
    Ok(prepared)
}

struct Preparer<'a> {
    schema: &'a Schema,
    opts: PrepareOptions,
}

impl Preparer<'_> {
    fn prepare_root(&self, query: Query) -> Result<PreparedQuery, QueryError> {
        let collection = self.schema.collection(&query.collection_name)?;

        let mut where_ = Vec::with_capacity(query.where_.len() + 2);
        if let Some(id) = &query.entity_id {
            where_.push(Filter::stmt(
                "id",
                crate::query::ast::Operator::Eq,
                FilterValue::Literal(id.clone().into()),
            ));
        }
        for filter in query.where_ {
            where_.push(self.normalize_filter(&query.collection_name, collection, filter)?);
        }
        self.inject_read_rules(&query.collection_name, collection, &mut where_)?;

        let order = self.prepare_order(collection, &query.order)?;
        self.check_after(&query.after, &order)?;

        let select = match query.select {
            Some(raw) => Some(self.prepare_select(&query.collection_name, collection, raw)?),
            None => Some(default_select(collection)),
        };

        let include = self.prepare_includes(&query.collection_name, collection, query.include)?;

        Ok(PreparedQuery {
            collection_name: query.collection_name,
            select,
            where_,
            order,
            limit: query.limit,
            after: query.after,
            include,
            vars: query.vars,
        })
    }

    /// Normalizes one `where` entry: parses reference strings, expands
    /// relation shorthand, and recurses into groups and subqueries.
    fn normalize_filter(
        &self,
        collection_name: &str,
        collection: &CollectionSchema,
        filter: Filter,
    ) -> Result<Filter, QueryError> {
        match filter {
            Filter::Statement(stmt) => self.normalize_statement(collection_name, collection, stmt),
            Filter::Group(group) => {
                let filters = group
                    .filters
                    .into_iter()
                    .map(|f| self.normalize_filter(collection_name, collection, f))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Filter::Group(FilterGroup {
                    mode: group.mode,
                    filters,
                }))
            }
            Filter::Exists(sub) => {
                let inner = self.prepare_subquery(*sub.exists)?;
                Ok(Filter::Exists(SubQueryFilter {
                    exists: Box::new(inner),
                }))
            }
        }
    }

    fn normalize_statement(
        &self,
        collection_name: &str,
        collection: &CollectionSchema,
        stmt: FilterStatement,
    ) -> Result<Filter, QueryError> {
        let value = parse_filter_value(stmt.value)?;
        if let Some(relation) = collection.relation(&stmt.path) {
            // A filter on a relation path becomes an existence subquery
            // rooted on the remainder of the path, chained per hop.
            let rest = stmt.path.rest();
            if rest.is_empty() {
                return Err(QueryError::InvalidFilter(format!(
                    "cannot compare directly against relation '{}'",
                    stmt.path
                )));
            }
            let related = self.schema.collection(&relation.collection)?;
            let inner_stmt = FilterStatement {
                path: rest,
                op: stmt.op,
                value,
            };
            let inner = self.normalize_statement(&relation.collection, related, inner_stmt)?;
            let mut sub_where = self.normalize_relation_base(relation)?;
            sub_where.push(inner);
            let subquery = PreparedQuery {
                collection_name: relation.collection.clone(),
                select: Some(default_select(related)),
                where_: sub_where,
                ..Default::default()
            };
            return Ok(Filter::exists(subquery));
        }
        if collection.attribute(&stmt.path).is_none() {
            return Err(QueryError::UnknownAttribute {
                attribute: stmt.path.to_string(),
                collection: collection_name.to_owned(),
            });
        }
        Ok(Filter::Statement(FilterStatement {
            path: stmt.path,
            op: stmt.op,
            value,
        }))
    }

    /// Prepares an embedded subquery (existence filter or relation base).
    fn prepare_subquery(&self, query: PreparedQuery) -> Result<PreparedQuery, QueryError> {
        let collection = self.schema.collection(&query.collection_name)?;
        let mut where_ = query
            .where_
            .into_iter()
            .map(|f| self.normalize_filter(&query.collection_name, collection, f))
            .collect::<Result<Vec<_>, _>>()?;
        self.inject_read_rules(&query.collection_name, collection, &mut where_)?;
        Ok(PreparedQuery {
            collection_name: query.collection_name,
            select: query.select.or_else(|| Some(default_select(collection))),
            where_,
            order: query.order,
            limit: query.limit,
            after: query.after,
            include: query.include,
            vars: query.vars,
        })
    }

    fn normalize_relation_base(
        &self,
        relation: &crate::schema::Relation,
    ) -> Result<Vec<Filter>, QueryError> {
        let related = self.schema.collection(&relation.collection)?;
        relation
            .where_
            .iter()
            .cloned()
            .map(|f| self.normalize_filter(&relation.collection, related, f))
            .collect()
    }

    fn inject_read_rules(
        &self,
        collection_name: &str,
        collection: &CollectionSchema,
        where_: &mut Vec<Filter>,
    ) -> Result<(), QueryError> {
        if self.opts.skip_rules || collection.read_rules.is_empty() {
            return Ok(());
        }
        let alternatives = collection
            .read_rules
            .iter()
            .cloned()
            .map(|f| self.normalize_filter(collection_name, collection, f))
            .collect::<Result<Vec<_>, _>>()?;
        where_.push(Filter::group(GroupMod::Or, alternatives));
        Ok(())
    }

    fn prepare_order(
        &self,
        collection: &CollectionSchema,
        order: &[(String, OrderDirection)],
    ) -> Result<Option<Vec<OrderTerm>>, QueryError> {
        if order.is_empty() {
            return Ok(None);
        }
        let mut terms = Vec::with_capacity(order.len());
        for (raw, direction) in order {
            let path = Path::parse(raw);
            if let Some(relation) = collection.relation(&path) {
                if relation.cardinality != Cardinality::One {
                    return Err(QueryError::InvalidOrderClause(format!(
                        "order path '{raw}' traverses a cardinality-many relation"
                    )));
                }
                let related = self.schema.collection(&relation.collection)?;
                let rest = path.rest();
                if rest.is_empty() || !is_orderable(related, &rest) {
                    return Err(QueryError::InvalidOrderClause(format!(
                        "order path '{raw}' does not reach a sortable attribute"
                    )));
                }
                let subquery = PreparedQuery {
                    collection_name: relation.collection.clone(),
                    select: Some(default_select(related)),
                    where_: self.normalize_relation_base(relation)?,
                    limit: Some(1),
                    ..Default::default()
                };
                terms.push(OrderTerm {
                    path: rest,
                    direction: *direction,
                    relation: Some(Box::new(subquery)),
                });
            } else {
                if !is_orderable(collection, &path) {
                    return Err(QueryError::InvalidOrderClause(format!(
                        "order path '{raw}' is not a sortable attribute"
                    )));
                }
                terms.push(OrderTerm {
                    path,
                    direction: *direction,
                    relation: None,
                });
            }
        }
        Ok(Some(terms))
    }

    fn check_after(
        &self,
        after: &Option<Cursor>,
        order: &Option<Vec<OrderTerm>>,
    ) -> Result<(), QueryError> {
        if after.is_some() && order.is_none() {
            return Err(QueryError::AfterRequiresOrder);
        }
        if let (Some(cursor), Some(terms)) = (after, order) {
            if cursor.values.len() != terms.len() {
                return Err(QueryError::InvalidOrderClause(format!(
                    "cursor has {} values but order has {} terms",
                    cursor.values.len(),
                    terms.len()
                )));
            }
        }
        Ok(())
    }

    fn prepare_select(
        &self,
        collection_name: &str,
        collection: &CollectionSchema,
        raw: Vec<String>,
    ) -> Result<Vec<Path>, QueryError> {
        raw.into_iter()
            .map(|s| {
                let path = Path::parse(&s);
                if collection.attribute(&path).is_none() {
                    return Err(QueryError::UnknownAttribute {
                        attribute: s,
                        collection: collection_name.to_owned(),
                    });
                }
                Ok(path)
            })
            .collect()
    }

    fn prepare_includes(
        &self,
        collection_name: &str,
        collection: &CollectionSchema,
        include: BTreeMap<String, IncludeSpec>,
    ) -> Result<BTreeMap<String, Inclusion>, QueryError> {
        let mut prepared = BTreeMap::new();
        for (alias, spec) in include {
            let Some(relation) = collection.relations.get(&alias) else {
                if collection.attributes.contains_key(&alias) {
                    return Err(QueryError::IncludedNonRelation {
                        key: alias,
                        collection: collection_name.to_owned(),
                    });
                }
                return Err(QueryError::RelationDoesNotExist {
                    relation: alias,
                    collection: collection_name.to_owned(),
                });
            };
            let related = self.schema.collection(&relation.collection)?;

            // Merge policy: concatenate `where` and `select`, shallow
            // override everything else with the refinement.
            let mut where_ = self.normalize_relation_base(relation)?;
            for filter in spec.where_ {
                where_.push(self.normalize_filter(&relation.collection, related, filter)?);
            }
            self.inject_read_rules(&relation.collection, related, &mut where_)?;

            let select = match spec.select {
                Some(raw) => {
                    let extra = self.prepare_select(&relation.collection, related, raw)?;
                    let mut merged = default_select(related);
                    merged.retain(|p| extra.contains(p));
                    Some(merged)
                }
                None => Some(default_select(related)),
            };

            let order = self.prepare_order(related, &spec.order)?;
            let include = self.prepare_includes(&relation.collection, related, spec.include)?;

            let subquery = PreparedQuery {
                collection_name: relation.collection.clone(),
                select,
                where_,
                order,
                limit: spec.limit,
                after: None,
                include,
                vars: BTreeMap::new(),
            };
            prepared.insert(
                alias,
                Inclusion {
                    subquery,
                    cardinality: relation.cardinality,
                },
            );
        }
        Ok(prepared)
    }
}

/// All non-relation attributes of a collection, in declaration order.
fn default_select(collection: &CollectionSchema) -> Vec<Path> {
    collection
        .attributes
        .keys()
        .map(|name| Path::single(name.clone()))
        .collect()
}

fn is_orderable(collection: &CollectionSchema, path: &Path) -> bool {
    collection
        .attribute(path)
        .map(|attr| attr.ty.is_orderable())
        .unwrap_or(false)
}

/// Parses `$`-prefixed literal strings into typed references; anything else
/// passes through unchanged.
fn parse_filter_value(value: FilterValue) -> Result<FilterValue, QueryError> {
    match value {
        FilterValue::Literal(crate::query::value::Value::String(s))
            if VarRef::is_reference(&s) =>
        {
            Ok(FilterValue::Var(VarRef::parse(&s)?))
        }
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::Operator;
    use crate::query::value::Value;
    use crate::schema::AttributeType;

    fn schema() -> Schema {
        Schema::builder()
            .collection("users", |c| {
                c.attribute("name", AttributeType::String)
                    .nullable("age", AttributeType::Int)
                    .relation_many(
                        "todos",
                        "todos",
                        vec![Filter::stmt(
                            "author_id",
                            Operator::Eq,
                            FilterValue::Literal("$1.id".into()),
                        )],
                    );
            })
            .collection("todos", |c| {
                c.attribute("text", AttributeType::String)
                    .attribute("author_id", AttributeType::String)
                    .relation_one(
                        "author",
                        "users",
                        vec![Filter::stmt(
                            "id",
                            Operator::Eq,
                            FilterValue::Literal("$1.author_id".into()),
                        )],
                    );
            })
            .build()
    }

    fn base(collection: &str) -> Query {
        Query {
            collection_name: collection.into(),
            ..Default::default()
        }
    }

    #[test]
    fn entity_id_shorthand_becomes_id_filter() {
        let mut query = base("users");
        query.entity_id = Some("u1".into());
        let prepared = prepare(query, &schema(), PrepareOptions::default()).unwrap();
        match &prepared.where_[0] {
            Filter::Statement(stmt) => {
                assert_eq!(stmt.path, Path::parse("id"));
                assert_eq!(stmt.op, Operator::Eq);
                assert_eq!(stmt.value, FilterValue::Literal("u1".into()));
            }
            other => panic!("expected id statement, got {other:?}"),
        }
    }

    #[test]
    fn relation_shorthand_expands_to_exists() {
        let mut query = base("users");
        query.where_.push(Filter::stmt(
            "todos.text",
            Operator::Eq,
            FilterValue::Literal("buy milk".into()),
        ));
        let prepared = prepare(query, &schema(), PrepareOptions::default()).unwrap();
        let Filter::Exists(sub) = &prepared.where_[0] else {
            panic!("expected exists filter");
        };
        assert_eq!(sub.exists.collection_name, "todos");
        // Base join filter plus the re-rooted statement.
        assert_eq!(sub.exists.where_.len(), 2);
        match &sub.exists.where_[0] {
            Filter::Statement(stmt) => {
                assert_eq!(
                    stmt.value,
                    FilterValue::Var(VarRef::parse("$1.id").unwrap())
                );
            }
            other => panic!("expected join statement, got {other:?}"),
        }
    }

    #[test]
    fn dotted_relation_chain_nests_exists() {
        let mut query = base("users");
        query.where_.push(Filter::stmt(
            "todos.author.name",
            Operator::Eq,
            FilterValue::Literal("ada".into()),
        ));
        let prepared = prepare(query, &schema(), PrepareOptions::default()).unwrap();
        let Filter::Exists(outer) = &prepared.where_[0] else {
            panic!("expected exists");
        };
        assert_eq!(outer.exists.collection_name, "todos");
        let inner = outer
            .exists
            .where_
            .iter()
            .find_map(|f| match f {
                Filter::Exists(sub) => Some(sub),
                _ => None,
            })
            .expect("nested exists for second hop");
        assert_eq!(inner.exists.collection_name, "users");
    }

    #[test]
    fn variable_strings_parse_once_at_prepare_time() {
        let mut query = base("todos");
        query.where_.push(Filter::stmt(
            "author_id",
            Operator::Eq,
            FilterValue::Literal("$session_user".into()),
        ));
        let prepared = prepare(query, &schema(), PrepareOptions::default()).unwrap();
        match &prepared.where_[0] {
            Filter::Statement(stmt) => assert_eq!(
                stmt.value,
                FilterValue::Var(VarRef::Local(Path::parse("session_user")))
            ),
            other => panic!("expected statement, got {other:?}"),
        }
    }

    #[test]
    fn read_rules_inject_as_or_group() {
        let schema = Schema::builder()
            .collection("docs", |c| {
                c.attribute("owner", AttributeType::String).read_rule(
                    Filter::stmt(
                        "owner",
                        Operator::Eq,
                        FilterValue::Literal("$role.user_id".into()),
                    ),
                );
            })
            .build();
        let prepared =
            prepare(base("docs"), &schema, PrepareOptions::default()).unwrap();
        assert_eq!(prepared.where_.len(), 1);
        assert!(prepared.where_[0].is_group());

        let skipped = prepare(
            base("docs"),
            &schema,
            PrepareOptions { skip_rules: true },
        )
        .unwrap();
        assert!(skipped.where_.is_empty());
    }

    #[test]
    fn select_defaults_to_non_relation_attributes() {
        let prepared = prepare(base("users"), &schema(), PrepareOptions::default()).unwrap();
        let select = prepared.select.unwrap();
        assert!(select.contains(&Path::parse("id")));
        assert!(select.contains(&Path::parse("age")));
        assert!(!select.iter().any(|p| p.first() == Some("todos")));
    }

    #[test]
    fn after_without_order_is_rejected() {
        let mut query = base("users");
        query.after = Some(Cursor {
            values: vec![Value::Int(1)],
            inclusive: false,
        });
        let err = prepare(query, &schema(), PrepareOptions::default()).unwrap_err();
        assert_eq!(err, QueryError::AfterRequiresOrder);
    }

    #[test]
    fn order_through_many_relation_is_rejected() {
        let mut query = base("users");
        query.order.push(("todos.text".into(), OrderDirection::Asc));
        let err = prepare(query, &schema(), PrepareOptions::default()).unwrap_err();
        assert_eq!(err.code(), "InvalidOrderClause");
    }

    #[test]
    fn order_through_one_relation_carries_subquery() {
        let mut query = base("todos");
        query.order.push(("author.name".into(), OrderDirection::Asc));
        let prepared = prepare(query, &schema(), PrepareOptions::default()).unwrap();
        let terms = prepared.order.unwrap();
        assert_eq!(terms.len(), 1);
        assert!(terms[0].relation.is_some());
        assert_eq!(terms[0].path, Path::parse("name"));
    }

    #[test]
    fn include_merges_relation_base_query() {
        let mut query = base("users");
        query.include.insert(
            "todos".into(),
            IncludeSpec {
                where_: vec![Filter::stmt(
                    "text",
                    Operator::Like,
                    FilterValue::Literal("%milk%".into()),
                )],
                limit: Some(5),
                ..Default::default()
            },
        );
        let prepared = prepare(query, &schema(), PrepareOptions::default()).unwrap();
        let inclusion = prepared.include.get("todos").unwrap();
        assert_eq!(inclusion.cardinality, Cardinality::Many);
        assert_eq!(inclusion.subquery.limit, Some(5));
        // Join filter first, then the refinement.
        assert_eq!(inclusion.subquery.where_.len(), 2);
    }

    #[test]
    fn include_of_plain_attribute_is_typed_error() {
        let mut query = base("users");
        query.include.insert("name".into(), IncludeSpec::default());
        let err = prepare(query, &schema(), PrepareOptions::default()).unwrap_err();
        assert_eq!(err.code(), "IncludedNonRelation");
    }

    #[test]
    fn unknown_attribute_in_where_is_rejected() {
        let mut query = base("users");
        query.where_.push(Filter::stmt(
            "nope",
            Operator::Eq,
            FilterValue::Literal(Value::Int(1)),
        ));
        let err = prepare(query, &schema(), PrepareOptions::default()).unwrap_err();
        assert_eq!(err.code(), "UnknownAttribute");
    }
}
