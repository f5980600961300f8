//! Variable-aware cache.
//!
//! Splits a correlated subquery into a parameterized view (everything that
//! does not depend on the enclosing entity) plus residual variable filters,
//! and resolves those filters against the materialized view rows with an
//! equality hash index instead of a store scan. The index is built lazily
//! per view column and reused for every parent row within one fetch.

use std::collections::BTreeMap;

use ahash::AHashMap;

use crate::query::ast::{
    Filter, FilterStatement, FilterValue, Operator, Path, PreparedQuery, VarRef,
};
use crate::query::filter::{get_path, satisfies_statement};
use crate::query::value::Value;

/// Filter statement with its variable reference resolved to a value.
#[derive(Clone, Debug)]
pub struct ResolvedStatement {
    /// Attribute path within a view row.
    pub path: Path,
    /// Comparison operator.
    pub op: Operator,
    /// Resolved right-hand side; `None` when the reference resolved to an
    /// absent attribute.
    pub value: Option<Value>,
}

/// Split produced by [`query_to_views`].
#[derive(Debug)]
pub struct VacSplit {
    /// The subquery with its parent-referencing filters stripped; safe to
    /// materialize with an empty entity stack.
    pub view: PreparedQuery,
    /// The stripped filters, re-applied per parent at resolution time.
    pub variable_filters: Vec<FilterStatement>,
}

/// Heuristic gate: a query is cacheable when every reference that escapes
/// it is a strippable top-level depth-1 statement, and it carries none of
/// the features the cache cannot index through (limit, cursor, order,
/// inclusions).
pub fn can_cache_query(query: &PreparedQuery) -> bool {
    if query.limit.is_some()
        || query.after.is_some()
        || query.order.is_some()
        || !query.include.is_empty()
    {
        return false;
    }
    for filter in &query.where_ {
        match filter {
            // Top-level depth-1 statements are strippable; anything deeper
            // cannot be parameterized.
            Filter::Statement(stmt) => {
                if matches!(&stmt.value, FilterValue::Var(VarRef::Stack { depth, .. }) if *depth > 1)
                {
                    return false;
                }
            }
            // Escaping references inside groups or nested subqueries would
            // survive into the view, which runs with an empty stack.
            Filter::Group(_) | Filter::Exists(_) => {
                if filter_escapes(filter, 0) {
                    return false;
                }
            }
        }
    }
    true
}

fn filter_escapes(filter: &Filter, nesting: usize) -> bool {
    match filter {
        Filter::Statement(stmt) => {
            matches!(&stmt.value, FilterValue::Var(VarRef::Stack { depth, .. }) if *depth > nesting)
        }
        Filter::Group(group) => group.filters.iter().any(|f| filter_escapes(f, nesting)),
        Filter::Exists(sub) => sub
            .exists
            .where_
            .iter()
            .any(|f| filter_escapes(f, nesting + 1)),
    }
}

/// Splits a cacheable query into a view and its residual variable filters.
///
/// Callers must gate on [`can_cache_query`]; the split only strips
/// top-level depth-1 statements.
pub fn query_to_views(mut query: PreparedQuery) -> VacSplit {
    let mut variable_filters = Vec::new();
    query.where_ = query
        .where_
        .into_iter()
        .filter_map(|filter| match filter {
            Filter::Statement(stmt)
                if matches!(
                    &stmt.value,
                    FilterValue::Var(VarRef::Stack { depth: 1, .. })
                ) =>
            {
                variable_filters.push(stmt);
                None
            }
            other => Some(other),
        })
        .collect();
    VacSplit {
        view: query,
        variable_filters,
    }
}

/// Lazily built equality indexes over materialized view columns, keyed by
/// view id and column path.
#[derive(Default)]
pub struct ViewIndexCache {
    indexes: AHashMap<(u32, String), AHashMap<String, Vec<usize>>>,
}

impl ViewIndexCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn index_for(
        &mut self,
        view_id: u32,
        path: &Path,
        rows: &[BTreeMap<String, Value>],
    ) -> &AHashMap<String, Vec<usize>> {
        self.indexes
            .entry((view_id, path.to_string()))
            .or_insert_with(|| {
                let mut index: AHashMap<String, Vec<usize>> = AHashMap::new();
                for (row_idx, row) in rows.iter().enumerate() {
                    if let Some(value) = get_path(row, path) {
                        index.entry(value_key(value)).or_default().push(row_idx);
                    }
                }
                index
            })
    }
}

/// Applies resolved filters against a materialized view, returning the
/// indices of matching rows in order.
///
/// Equality filters on defined values go through the column index; every
/// other operator (and equality against null/absent) falls back to a
/// linear pass over the surviving candidates.
pub fn resolve_query_from_view(
    view_id: u32,
    rows: &[BTreeMap<String, Value>],
    filters: &[ResolvedStatement],
    cache: &mut ViewIndexCache,
) -> Vec<usize> {
    let mut candidates: Option<Vec<usize>> = None;

    for stmt in filters {
        let indexable = stmt.op == Operator::Eq
            && matches!(&stmt.value, Some(v) if !v.is_null());
        if indexable {
            let value = stmt.value.as_ref().unwrap();
            let index = cache.index_for(view_id, &stmt.path, rows);
            let matched = index.get(&value_key(value)).cloned().unwrap_or_default();
            candidates = Some(match candidates {
                None => matched,
                Some(current) => intersect_sorted(&current, &matched),
            });
        } else {
            let survivors: Vec<usize> = match &candidates {
                None => (0..rows.len()).collect(),
                Some(current) => current.clone(),
            };
            candidates = Some(
                survivors
                    .into_iter()
                    .filter(|&i| {
                        satisfies_statement(
                            get_path(&rows[i], &stmt.path),
                            stmt.op,
                            stmt.value.as_ref(),
                        )
                    })
                    .collect(),
            );
        }
        if matches!(&candidates, Some(c) if c.is_empty()) {
            return Vec::new();
        }
    }

    candidates.unwrap_or_else(|| (0..rows.len()).collect())
}

fn intersect_sorted(a: &[usize], b: &[usize]) -> Vec<usize> {
    let (mut i, mut j) = (0, 0);
    let mut out = Vec::new();
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

/// Canonical hashable encoding of a value under the comparison order:
/// numbers that compare equal encode identically regardless of int/float
/// representation.
fn value_key(value: &Value) -> String {
    match value {
        Value::Null => "n".into(),
        Value::Bool(b) => format!("b:{}", *b as u8),
        Value::Int(v) => {
            // Integers that survive an f64 round trip share the float
            // encoding so `Int(3)` and `Float(3.0)` coincide; the rest keep
            // their exact value.
            if *v as f64 as i64 == *v {
                format!("f:{}", (*v as f64).to_bits())
            } else {
                format!("i:{v}")
            }
        }
        Value::Float(v) => format!("f:{}", v.to_bits()),
        Value::String(s) => format!("s:{s}"),
        Value::Array(vs) => {
            let parts: Vec<_> = vs.iter().map(value_key).collect();
            format!("a:[{}]", parts.join(","))
        }
        Value::Object(map) => {
            let parts: Vec<_> = map
                .iter()
                .map(|(k, v)| format!("{k}={}", value_key(v)))
                .collect();
            format!("o:{{{}}}", parts.join(","))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::Filter;

    fn row(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    fn rows() -> Vec<BTreeMap<String, Value>> {
        vec![
            row(&[("from", "u1".into()), ("to", "u2".into())]),
            row(&[("from", "u1".into()), ("to", "u3".into())]),
            row(&[("from", "u2".into()), ("to", "u1".into())]),
        ]
    }

    fn eq(path: &str, value: Value) -> ResolvedStatement {
        ResolvedStatement {
            path: Path::parse(path),
            op: Operator::Eq,
            value: Some(value),
        }
    }

    #[test]
    fn cacheable_query_splits_into_view_and_variable_filters() {
        let query = PreparedQuery {
            collection_name: "follows".into(),
            where_: vec![
                Filter::stmt(
                    "from",
                    Operator::Eq,
                    FilterValue::Var(VarRef::parse("$1.id").unwrap()),
                ),
                Filter::stmt("kind", Operator::Eq, FilterValue::Literal("friend".into())),
            ],
            ..Default::default()
        };
        assert!(can_cache_query(&query));
        let split = query_to_views(query);
        assert_eq!(split.variable_filters.len(), 1);
        assert_eq!(split.view.where_.len(), 1);
    }

    #[test]
    fn limit_and_order_block_caching() {
        let mut query = PreparedQuery {
            collection_name: "follows".into(),
            ..Default::default()
        };
        assert!(can_cache_query(&query));
        query.limit = Some(1);
        assert!(!can_cache_query(&query));
    }

    #[test]
    fn escaping_reference_in_group_blocks_caching() {
        let query = PreparedQuery {
            collection_name: "follows".into(),
            where_: vec![Filter::group(
                crate::query::ast::GroupMod::Or,
                vec![Filter::stmt(
                    "from",
                    Operator::Eq,
                    FilterValue::Var(VarRef::parse("$1.id").unwrap()),
                )],
            )],
            ..Default::default()
        };
        assert!(!can_cache_query(&query));
    }

    #[test]
    fn indexed_resolution_matches_linear_semantics() {
        let rows = rows();
        let mut cache = ViewIndexCache::new();
        let matched =
            resolve_query_from_view(0, &rows, &[eq("from", "u1".into())], &mut cache);
        assert_eq!(matched, vec![0, 1]);

        // Second resolution reuses the same index.
        let matched =
            resolve_query_from_view(0, &rows, &[eq("from", "u2".into())], &mut cache);
        assert_eq!(matched, vec![2]);
        assert_eq!(cache.indexes.len(), 1);
    }

    #[test]
    fn multiple_equalities_intersect() {
        let rows = rows();
        let mut cache = ViewIndexCache::new();
        let matched = resolve_query_from_view(
            0,
            &rows,
            &[eq("from", "u1".into()), eq("to", "u3".into())],
            &mut cache,
        );
        assert_eq!(matched, vec![1]);
    }

    #[test]
    fn non_equality_falls_back_to_linear_scan() {
        let rows = vec![
            row(&[("age", Value::Int(20))]),
            row(&[("age", Value::Int(30))]),
        ];
        let mut cache = ViewIndexCache::new();
        let matched = resolve_query_from_view(
            0,
            &rows,
            &[ResolvedStatement {
                path: Path::parse("age"),
                op: Operator::Gt,
                value: Some(Value::Int(25)),
            }],
            &mut cache,
        );
        assert_eq!(matched, vec![1]);
        assert!(cache.indexes.is_empty());
    }

    #[test]
    fn int_and_float_keys_coincide() {
        assert_eq!(value_key(&Value::Int(3)), value_key(&Value::Float(3.0)));
    }

    #[test]
    fn large_integer_keys_stay_distinct() {
        let lo = Value::Int(9_007_199_254_740_992);
        let hi = Value::Int(9_007_199_254_740_993);
        assert_ne!(value_key(&lo), value_key(&hi));

        let rows = vec![row(&[("seq", lo)]), row(&[("seq", hi.clone())])];
        let mut cache = ViewIndexCache::new();
        let matched = resolve_query_from_view(0, &rows, &[eq("seq", hi)], &mut cache);
        assert_eq!(matched, vec![1]);
    }
}
