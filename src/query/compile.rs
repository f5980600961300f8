//! Step plan compiler.
//!
//! Lowers a prepared query into a linear sequence of execution steps, one
//! list per extracted view plus the root list. Steps are immutable plan
//! data; all mutable execution state lives in the interpreter. The
//! iterator/collect split is deliberate: filters and limits that can run
//! during iteration avoid materializing the candidate set, so collection
//! happens at the latest point consistent with correctness.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::query::ast::{
    Cardinality, Cursor, Filter, FilterStatement, FilterValue, Operator, OrderTerm, Path,
    PreparedQuery,
};
use crate::query::errors::QueryError;
use crate::query::views::{extract_views, ViewIdGen};

/// Cursor check carried by a filter step.
///
/// Fused into iteration when every order term reads a plain attribute;
/// deferred to a post-collection filter when a term reads through a
/// relation, since its order alias only exists once the order subqueries
/// have run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AfterSpec {
    /// The keyset cursor.
    pub cursor: Cursor,
    /// Order terms the cursor values positionally match.
    pub order: Vec<OrderTerm>,
}

/// Single execution step. The interpreter matches exhaustively, so adding
/// a variant without handling it is a compile error there.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Step {
    /// Open a lazy iterator over every entity in a collection.
    Scan {
        /// Collection to scan.
        collection: String,
    },
    /// Resolve a set of ids and look each up directly.
    IdLookup {
        /// Collection to look up in.
        collection: String,
        /// Literal id set or a reference resolving to one.
        ids: FilterValue,
    },
    /// Materialize a view exactly once per fetch; idempotent re-entry.
    PrepareView {
        /// View to materialize.
        id: u32,
    },
    /// Resolve bound filters against an already-materialized view through
    /// the variable-aware cache.
    ResolveFromView {
        /// View to resolve from.
        id: u32,
        /// Plain statements bound per enclosing entity at execution time.
        filters: Vec<FilterStatement>,
    },
    /// Exhaust the candidate iterator into the result array.
    Collect,
    /// Lazily filter the candidate iterator.
    IteratorFilter {
        /// Non-relational filters, variables bound at execution time.
        filters: Vec<Filter>,
        /// Keyset cursor check, when the query paginates.
        after: Option<AfterSpec>,
    },
    /// Truncate the candidate iterator to the first `count` entities.
    IteratorLimit {
        /// Maximum number of candidates to let through.
        count: usize,
    },
    /// Keep candidates for which the nested plan yields at least one row.
    IteratorSubqueryFilter {
        /// Compiled existence subquery.
        steps: Vec<Step>,
    },
    /// Filter the materialized result array.
    Filter {
        /// Non-relational filters, variables bound at execution time.
        filters: Vec<Filter>,
        /// Keyset cursor check evaluated against the flattened row, used
        /// when pagination orders through a relation.
        after: Option<AfterSpec>,
    },
    /// Stable multi-key sort of the materialized results.
    Sort {
        /// Order terms; relation-backed terms are rewritten to read from
        /// their order alias before this step runs.
        terms: Vec<OrderTerm>,
        /// Synthetic order aliases attached only for sorting, detached
        /// from every row once ordering is done.
        scratch_aliases: Vec<String>,
    },
    /// Truncate the materialized results.
    Limit {
        /// Maximum number of rows.
        count: usize,
    },
    /// Execute a nested plan per result row and attach the output under an
    /// alias.
    Subquery {
        /// Alias the output is attached under.
        alias: String,
        /// Compiled subquery plan.
        steps: Vec<Step>,
    },
    /// Reduce the result array to its first element or null.
    Pick,
}

/// Step list of a single view.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewPlan {
    /// Steps materializing the view.
    pub steps: Vec<Step>,
}

/// Executable plan: root steps plus a flat sibling map of view plans.
///
/// Views are never nested inside one another's step lists; a view may be
/// shared by several consumers within one query and is materialized at
/// most once per execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompiledPlan {
    /// Root step list.
    pub steps: Vec<Step>,
    /// View plans keyed by id.
    pub views: BTreeMap<u32, ViewPlan>,
}

/// Compiles a prepared query into an executable plan.
///
/// Pure function; determinism is keyed only by the per-call view-id
/// counter.
pub fn compile_query(query: &PreparedQuery) -> Result<CompiledPlan, QueryError> {
    let mut gen = ViewIdGen::default();
    let extracted = extract_views(query.clone(), &mut gen);

    let mut views = BTreeMap::new();
    for (id, view_query) in &extracted.views {
        views.insert(
            *id,
            ViewPlan {
                steps: compile_steps(view_query)?,
            },
        );
    }
    let steps = compile_steps(&extracted.query)?;
    debug!(
        collection = %query.collection_name,
        root_steps = steps.len(),
        views = views.len(),
        "compiled query"
    );
    Ok(CompiledPlan { steps, views })
}

fn compile_steps(query: &PreparedQuery) -> Result<Vec<Step>, QueryError> {
    let mut steps = Vec::new();

    // Partition the conjunction into static filters and existence checks.
    let mut static_filters: Vec<Filter> = Vec::new();
    let mut subquery_filters: Vec<&PreparedQuery> = Vec::new();
    for filter in &query.where_ {
        match filter {
            Filter::Exists(sub) => subquery_filters.push(&sub.exists),
            other => static_filters.push(other.clone()),
        }
    }

    let mut limit_applied = false;

    if let Some(view_id) = query.view_collection_id() {
        // Resolution against a materialized view. Variable-bound statements
        // go through the cache's indexed resolution; literal leftovers are
        // re-applied after collection.
        steps.push(Step::PrepareView { id: view_id });
        let mut bound = Vec::new();
        let mut residual = Vec::new();
        for filter in static_filters {
            let Filter::Statement(stmt) = filter else {
                return Err(QueryError::PlanInvariant(
                    "view resolution requires plain filter statements",
                ));
            };
            if matches!(stmt.value, FilterValue::Var(_)) {
                bound.push(stmt);
            } else {
                residual.push(Filter::Statement(stmt));
            }
        }
        steps.push(Step::ResolveFromView {
            id: view_id,
            filters: bound,
        });
        for sub in &subquery_filters {
            steps.push(Step::IteratorSubqueryFilter {
                steps: compile_steps(sub)?,
            });
        }
        steps.push(Step::Collect);
        if !residual.is_empty() {
            steps.push(Step::Filter {
                filters: residual,
                after: None,
            });
        }
    } else {
        // Candidate source: a point lookup when an id equality exists,
        // otherwise a full scan.
        let id_filter = take_id_filter(&mut static_filters);
        match id_filter {
            Some(stmt) => {
                if let Some(view_id) = stmt.value.view_id() {
                    steps.push(Step::PrepareView { id: view_id });
                }
                steps.push(Step::IdLookup {
                    collection: query.collection_name.clone(),
                    ids: stmt.value,
                });
            }
            None => steps.push(Step::Scan {
                collection: query.collection_name.clone(),
            }),
        }

        // Views referenced by remaining filters must be materialized
        // before the iterator starts pulling.
        for view_id in referenced_views(&static_filters) {
            steps.push(Step::PrepareView { id: view_id });
        }

        // A cursor over a relation-backed order cannot be checked during
        // iteration: its key only exists once the order alias is attached.
        let fused_after = if order_traverses_relation(query) {
            None
        } else {
            query.after.clone().map(|cursor| AfterSpec {
                cursor,
                order: query.order.clone().unwrap_or_default(),
            })
        };
        if !static_filters.is_empty() || fused_after.is_some() {
            steps.push(Step::IteratorFilter {
                filters: static_filters,
                after: fused_after,
            });
        }
        for sub in &subquery_filters {
            steps.push(Step::IteratorSubqueryFilter {
                steps: compile_steps(sub)?,
            });
        }
        // Limiting before sort is invalid once ordering is required.
        if let (Some(count), None) = (query.limit, &query.order) {
            steps.push(Step::IteratorLimit { count });
            limit_applied = true;
        }
        steps.push(Step::Collect);
    }

    if let Some(terms) = &query.order {
        let mut rewritten = Vec::with_capacity(terms.len());
        let mut scratch_aliases = Vec::new();
        for (i, term) in terms.iter().enumerate() {
            match &term.relation {
                Some(relation) => {
                    let alias = format!("_order_{i}");
                    let mut sub_steps = compile_steps(relation)?;
                    sub_steps.push(Step::Pick);
                    steps.push(Step::Subquery {
                        alias: alias.clone(),
                        steps: sub_steps,
                    });
                    let mut path = Path::single(alias.clone());
                    path.0.extend(term.path.0.iter().cloned());
                    scratch_aliases.push(alias);
                    rewritten.push(OrderTerm {
                        path,
                        direction: term.direction,
                        relation: None,
                    });
                }
                None => rewritten.push(term.clone()),
            }
        }
        if order_traverses_relation(query) {
            if let Some(cursor) = query.after.clone() {
                steps.push(Step::Filter {
                    filters: Vec::new(),
                    after: Some(AfterSpec {
                        cursor,
                        order: rewritten.clone(),
                    }),
                });
            }
        }
        steps.push(Step::Sort {
            terms: rewritten,
            scratch_aliases,
        });
    }

    if let Some(count) = query.limit {
        if !limit_applied {
            steps.push(Step::Limit { count });
        }
    }

    for (alias, inclusion) in &query.include {
        let mut sub_steps = compile_steps(&inclusion.subquery)?;
        if inclusion.cardinality == Cardinality::One {
            sub_steps.push(Step::Pick);
        }
        steps.push(Step::Subquery {
            alias: alias.clone(),
            steps: sub_steps,
        });
    }

    Ok(steps)
}

/// True when any order term reads through a relation.
fn order_traverses_relation(query: &PreparedQuery) -> bool {
    query
        .order
        .as_deref()
        .is_some_and(|terms| terms.iter().any(|term| term.relation.is_some()))
}

/// Removes and returns the first top-level `id =` statement, if any.
fn take_id_filter(filters: &mut Vec<Filter>) -> Option<FilterStatement> {
    let index = filters.iter().position(|filter| {
        matches!(
            filter,
            Filter::Statement(stmt)
                if stmt.op == Operator::Eq && stmt.path.0.as_slice() == ["id"]
        )
    })?;
    match filters.remove(index) {
        Filter::Statement(stmt) => Some(stmt),
        _ => unreachable!("position matched a statement"),
    }
}

/// View ids referenced by filter values, in first-appearance order.
fn referenced_views(filters: &[Filter]) -> Vec<u32> {
    fn walk(filter: &Filter, out: &mut Vec<u32>) {
        match filter {
            Filter::Statement(stmt) => {
                if let Some(id) = stmt.value.view_id() {
                    if !out.contains(&id) {
                        out.push(id);
                    }
                }
            }
            Filter::Group(group) => group.filters.iter().for_each(|f| walk(f, out)),
            Filter::Exists(_) => {}
        }
    }
    let mut out = Vec::new();
    filters.iter().for_each(|f| walk(f, &mut out));
    out
}
