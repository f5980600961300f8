//! View extraction.
//!
//! Walks a prepared query's filter, include, and order trees and hoists
//! relational subqueries into standalone views that execution can
//! materialize once per fetch. Two strategies apply, tried in order:
//!
//! 1. **Inversion**: a correlated existence subquery whose only link to
//!    the parent is a single depth-1 equality becomes an uncorrelated view;
//!    the `exists` filter is replaced by a membership test
//!    `[local_key, in, $view_<id>.<filtered_key>]` against the view's
//!    flattened column.
//! 2. **Variable-aware cache**: a cacheable subquery becomes a
//!    parameterized view plus residual variable filters that are re-applied
//!    per parent against the materialized rows, without re-scanning the
//!    store.
//!
//! Anything else stays a nested-loop existence check. Group structure is
//! preserved; extraction recurses into groups, include subqueries, and
//! order-relation subqueries, merging all produced views into one flat map.

use std::collections::BTreeMap;

use tracing::trace;

use crate::query::ast::{
    view_collection_name, Filter, FilterStatement, FilterValue, Operator, PreparedQuery, VarRef,
};
use crate::query::vac;

/// Monotonic view-id generator, scoped to one compile call.
#[derive(Debug, Default)]
pub struct ViewIdGen {
    next: u32,
}

impl ViewIdGen {
    /// Returns a fresh view id.
    pub fn next_id(&mut self) -> u32 {
        let id = self.next;
        self.next += 1;
        id
    }
}

/// Result of view extraction over one query.
#[derive(Debug)]
pub struct ExtractedViews {
    /// Rewritten query with hoisted subqueries replaced.
    pub query: PreparedQuery,
    /// Extracted views keyed by id.
    pub views: BTreeMap<u32, PreparedQuery>,
}

/// Extracts views from `query`, rewriting it in place.
pub fn extract_views(query: PreparedQuery, gen: &mut ViewIdGen) -> ExtractedViews {
    let mut views = BTreeMap::new();
    let query = extract_into(query, gen, &mut views);
    ExtractedViews { query, views }
}

fn extract_into(
    mut query: PreparedQuery,
    gen: &mut ViewIdGen,
    views: &mut BTreeMap<u32, PreparedQuery>,
) -> PreparedQuery {
    query.where_ = query
        .where_
        .into_iter()
        .map(|filter| extract_filter(filter, gen, views))
        .collect();

    for inclusion in query.include.values_mut() {
        let sub = std::mem::take(&mut inclusion.subquery);
        inclusion.subquery = extract_into(sub, gen, views);
    }
    if let Some(order) = &mut query.order {
        for term in order.iter_mut() {
            if let Some(relation) = term.relation.take() {
                term.relation = Some(Box::new(extract_into(*relation, gen, views)));
            }
        }
    }
    query
}

fn extract_filter(
    filter: Filter,
    gen: &mut ViewIdGen,
    views: &mut BTreeMap<u32, PreparedQuery>,
) -> Filter {
    match filter {
        Filter::Statement(stmt) => Filter::Statement(stmt),
        Filter::Group(mut group) => {
            group.filters = group
                .filters
                .into_iter()
                .map(|f| extract_filter(f, gen, views))
                .collect();
            Filter::Group(group)
        }
        Filter::Exists(sub) => extract_exists(*sub.exists, gen, views),
    }
}

fn extract_exists(
    sub: PreparedQuery,
    gen: &mut ViewIdGen,
    views: &mut BTreeMap<u32, PreparedQuery>,
) -> Filter {
    // Depth-first: hoist the subquery's own nested subqueries before
    // deciding a strategy for this level.
    let sub = extract_into(sub, gen, views);

    if references_above_parent(&sub, 1) {
        trace!(collection = %sub.collection_name, "exists kept nested: grandparent reference");
        return Filter::exists(sub);
    }

    match parent_link(&sub) {
        ParentLink::Single { index } => {
            // Inversion: strip the linking filter out of the view and turn
            // the existence check into set membership on the view column.
            let mut view = sub;
            let Filter::Statement(link) = view.where_.remove(index) else {
                unreachable!("parent_link only indexes statements");
            };
            let FilterValue::Var(VarRef::Stack { path: local_key, .. }) = link.value else {
                unreachable!("parent_link only matches stack references");
            };
            let id = gen.next_id();
            trace!(view = id, collection = %view.collection_name, "inverted exists into view");
            views.insert(id, view);
            Filter::stmt(
                local_key,
                Operator::In,
                FilterValue::Var(VarRef::View {
                    id,
                    path: link.path,
                }),
            )
        }
        ParentLink::None => {
            // Uncorrelated existence: materialize once, then the check is a
            // non-emptiness test on the view.
            let id = gen.next_id();
            trace!(view = id, collection = %sub.collection_name, "hoisted uncorrelated exists");
            views.insert(id, sub);
            Filter::exists(PreparedQuery {
                collection_name: view_collection_name(id),
                select: None,
                ..Default::default()
            })
        }
        ParentLink::Complex => {
            if vac::can_cache_query(&sub) {
                let split = vac::query_to_views(sub);
                let id = gen.next_id();
                trace!(view = id, collection = %split.view.collection_name, "extracted VAC view");
                views.insert(id, split.view);
                Filter::exists(PreparedQuery {
                    collection_name: view_collection_name(id),
                    select: None,
                    where_: split
                        .variable_filters
                        .into_iter()
                        .map(Filter::Statement)
                        .collect(),
                    ..Default::default()
                })
            } else {
                trace!(collection = %sub.collection_name, "exists kept nested: not cacheable");
                Filter::exists(sub)
            }
        }
    }
}

/// How a subquery's top-level filters reference the enclosing entity.
enum ParentLink {
    /// No depth-1 references anywhere at the top level.
    None,
    /// Exactly one strippable equality statement `[path, =, $1.key]`.
    Single {
        /// Index of that statement within `where_`.
        index: usize,
    },
    /// Multiple references, references inside groups, or a non-equality
    /// link; not invertible.
    Complex,
}

fn parent_link(sub: &PreparedQuery) -> ParentLink {
    let mut single: Option<usize> = None;
    for (index, filter) in sub.where_.iter().enumerate() {
        match filter {
            Filter::Statement(stmt) => {
                if statement_refs_parent(stmt) {
                    if single.is_some() || !invertible_link(stmt) {
                        return ParentLink::Complex;
                    }
                    single = Some(index);
                }
            }
            Filter::Group(_) => {
                if filter_refs_depth(filter, 1) {
                    return ParentLink::Complex;
                }
            }
            // Depth-2 references inside a nested exists resolve to this
            // subquery's parent; they cannot be stripped at this level.
            Filter::Exists(inner) => {
                if query_refs_exact_depth(&inner.exists, 2) {
                    return ParentLink::Complex;
                }
            }
        }
    }
    match single {
        Some(index) => ParentLink::Single { index },
        None => ParentLink::None,
    }
}

fn invertible_link(stmt: &FilterStatement) -> bool {
    stmt.op == Operator::Eq
        && matches!(
            &stmt.value,
            FilterValue::Var(VarRef::Stack { depth: 1, path }) if !path.is_empty()
        )
}

fn statement_refs_parent(stmt: &FilterStatement) -> bool {
    matches!(&stmt.value, FilterValue::Var(VarRef::Stack { depth: 1, .. }))
}

/// True when any reference in the query's tree reaches above the query's
/// immediate parent. `level` is how many entity-stack frames the current
/// nesting depth owns; a reference deeper than that escapes to a
/// grandparent or beyond.
pub(crate) fn references_above_parent(query: &PreparedQuery, level: usize) -> bool {
    any_stack_ref(query, &mut |depth, nesting| depth > level + nesting)
}

/// True when any reference in the tree resolves exactly `target` frames
/// above its own query.
fn query_refs_exact_depth(query: &PreparedQuery, target: usize) -> bool {
    any_stack_ref(query, &mut |depth, nesting| {
        depth == target + nesting
    })
}

/// True when the filter subtree (not descending into exists) holds a stack
/// reference at the given depth.
fn filter_refs_depth(filter: &Filter, depth: usize) -> bool {
    match filter {
        Filter::Statement(stmt) => {
            matches!(&stmt.value, FilterValue::Var(VarRef::Stack { depth: d, .. }) if *d == depth)
        }
        Filter::Group(group) => group.filters.iter().any(|f| filter_refs_depth(f, depth)),
        Filter::Exists(_) => false,
    }
}

/// Walks every statement in the query tree, calling `pred` with the
/// reference depth and the nesting level (0 for the query's own filters)
/// at which it appears.
fn any_stack_ref(query: &PreparedQuery, pred: &mut dyn FnMut(usize, usize) -> bool) -> bool {
    fn walk_filter(
        filter: &Filter,
        nesting: usize,
        pred: &mut dyn FnMut(usize, usize) -> bool,
    ) -> bool {
        match filter {
            Filter::Statement(stmt) => {
                matches!(&stmt.value, FilterValue::Var(VarRef::Stack { depth, .. }) if pred(*depth, nesting))
            }
            Filter::Group(group) => group
                .filters
                .iter()
                .any(|f| walk_filter(f, nesting, pred)),
            Filter::Exists(sub) => walk_query(&sub.exists, nesting + 1, pred),
        }
    }
    fn walk_query(
        query: &PreparedQuery,
        nesting: usize,
        pred: &mut dyn FnMut(usize, usize) -> bool,
    ) -> bool {
        query
            .where_
            .iter()
            .any(|f| walk_filter(f, nesting, pred))
            || query
                .include
                .values()
                .any(|inc| walk_query(&inc.subquery, nesting + 1, pred))
            || query.order.as_deref().unwrap_or_default().iter().any(|t| {
                t.relation
                    .as_deref()
                    .map(|r| walk_query(r, nesting + 1, pred))
                    .unwrap_or(false)
            })
    }
    walk_query(query, 0, pred)
}
