//! Step interpreter.
//!
//! Executes a compiled plan against a store snapshot. The interpreter is a
//! loop over the step list with two pieces of state: a lazy candidate
//! iterator and a materialized result array. Iterator steps compose onto
//! the candidate without pulling from the store; `Collect` is the single
//! point where candidates materialize. Views are shared through a per-fetch
//! memo, so a view referenced by several consumers is materialized once.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::query::ast::{Filter, FilterStatement, FilterValue, PreparedQuery, VarRef};
use crate::query::compile::{compile_query, CompiledPlan, Step, ViewPlan};
use crate::query::errors::QueryError;
use crate::query::filter::{get_path, satisfies, BoundFilter};
use crate::query::vac::{self, ResolvedStatement, ViewIndexCache};
use crate::query::value::{compare_values, Value};
use crate::store::{Entity, EntityStore, Snapshot};

/// Session-scoped execution options.
#[derive(Clone, Debug, Default)]
pub struct FetchOptions {
    /// Session/role variable bag backing `$role.*` references.
    pub role: BTreeMap<String, Value>,
}

/// Result row: the stored entity plus subquery outputs attached under
/// their aliases.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewEntity {
    /// The underlying entity, shared with the store snapshot.
    pub data: Arc<Entity>,
    /// Subquery outputs keyed by alias.
    pub subqueries: BTreeMap<String, SubqueryResult>,
}

/// Output of a nested plan: an array of rows, or a single optional row
/// after a pick.
#[derive(Clone, Debug, PartialEq)]
pub enum SubqueryResult {
    /// All rows the plan produced.
    Many(Vec<ViewEntity>),
    /// First row or nothing.
    One(Option<ViewEntity>),
}

impl SubqueryResult {
    /// True when the result carries at least one row.
    pub fn has_rows(&self) -> bool {
        match self {
            SubqueryResult::Many(rows) => !rows.is_empty(),
            SubqueryResult::One(row) => row.is_some(),
        }
    }

    fn into_rows(self) -> Vec<ViewEntity> {
        match self {
            SubqueryResult::Many(rows) => rows,
            SubqueryResult::One(row) => row.into_iter().collect(),
        }
    }
}

impl ViewEntity {
    fn from_entity(data: Arc<Entity>) -> Self {
        Self {
            data,
            subqueries: BTreeMap::new(),
        }
    }

    /// Flattens the row into a single attribute map; see
    /// [`flatten_view_entity`].
    pub fn flatten(&self) -> BTreeMap<String, Value> {
        flatten_view_entity(self)
    }
}

/// Merges a row's entity attributes with its subquery outputs into one
/// value map.
///
/// Many-results become arrays of objects, picked results become an object
/// or null. A subquery alias shadows an entity attribute of the same name.
pub fn flatten_view_entity(entity: &ViewEntity) -> BTreeMap<String, Value> {
    let mut flat = entity.data.attrs.clone();
    for (alias, sub) in &entity.subqueries {
        let value = match sub {
            SubqueryResult::Many(rows) => Value::Array(
                rows.iter()
                    .map(|row| Value::Object(flatten_view_entity(row)))
                    .collect(),
            ),
            SubqueryResult::One(Some(row)) => Value::Object(flatten_view_entity(row)),
            SubqueryResult::One(None) => Value::Null,
        };
        flat.insert(alias.clone(), value);
    }
    flat
}

/// Materialized view: result rows plus their flattened projections, cached
/// for column reads and indexed resolution.
struct MaterializedView {
    rows: Vec<ViewEntity>,
    flat: Vec<BTreeMap<String, Value>>,
}

/// State shared by every plan executing within one fetch.
struct Shared<'a> {
    snapshot: &'a dyn Snapshot,
    view_plans: &'a BTreeMap<u32, ViewPlan>,
    /// Query-scoped variable bag; nested subqueries resolve `$name`
    /// references against the root query's bag.
    vars: &'a BTreeMap<String, Value>,
    role: &'a BTreeMap<String, Value>,
    views: RefCell<BTreeMap<u32, Arc<MaterializedView>>>,
    vac_cache: RefCell<ViewIndexCache>,
}

/// Per-plan execution context: shared state plus the entity stack the
/// current plan runs under.
struct ExecCtx<'a> {
    shared: &'a Shared<'a>,
    stack: Vec<Arc<BTreeMap<String, Value>>>,
}

impl<'a> ExecCtx<'a> {
    fn descend(&self, frame: BTreeMap<String, Value>) -> ExecCtx<'a> {
        let mut stack = self.stack.clone();
        stack.push(Arc::new(frame));
        ExecCtx {
            shared: self.shared,
            stack,
        }
    }
}

/// Compiles and executes a prepared query, returning the result tree.
pub fn fetch(
    store: &dyn EntityStore,
    query: &PreparedQuery,
    options: &FetchOptions,
) -> Result<Vec<ViewEntity>> {
    let plan = compile_query(query)?;
    fetch_plan(store, &plan, &query.vars, options)
}

/// Convenience wrapper returning only the first result row.
pub fn fetch_one(
    store: &dyn EntityStore,
    query: &PreparedQuery,
    options: &FetchOptions,
) -> Result<Option<ViewEntity>> {
    Ok(fetch(store, query, options)?.into_iter().next())
}

/// Executes a query and flattens each row, applying the query's selection.
///
/// Included aliases always survive selection; everything else is dropped
/// when a `select` is present.
pub fn fetch_flat(
    store: &dyn EntityStore,
    query: &PreparedQuery,
    options: &FetchOptions,
) -> Result<Vec<BTreeMap<String, Value>>> {
    let rows = fetch(store, query, options)?;
    let keep: Option<BTreeSet<String>> = query.select.as_ref().map(|select| {
        let mut keep: BTreeSet<String> = select
            .iter()
            .filter_map(|path| path.first().map(str::to_owned))
            .collect();
        keep.extend(query.include.keys().cloned());
        keep
    });
    Ok(rows
        .iter()
        .map(|row| {
            let mut flat = flatten_view_entity(row);
            if let Some(keep) = &keep {
                flat.retain(|key, _| keep.contains(key));
            }
            flat
        })
        .collect())
}

/// Executes an already-compiled plan against a fresh store snapshot.
pub fn fetch_plan(
    store: &dyn EntityStore,
    plan: &CompiledPlan,
    vars: &BTreeMap<String, Value>,
    options: &FetchOptions,
) -> Result<Vec<ViewEntity>> {
    let snapshot = store.snapshot()?;
    let shared = Shared {
        snapshot: snapshot.as_ref(),
        view_plans: &plan.views,
        vars,
        role: &options.role,
        views: RefCell::new(BTreeMap::new()),
        vac_cache: RefCell::new(ViewIndexCache::new()),
    };
    let ctx = ExecCtx {
        shared: &shared,
        stack: Vec::new(),
    };
    debug!(
        steps = plan.steps.len(),
        views = plan.views.len(),
        "executing plan"
    );
    Ok(execute_steps(&plan.steps, &ctx)?.into_rows())
}

type RowIter<'b> = Box<dyn Iterator<Item = Result<ViewEntity>> + 'b>;

fn execute_steps<'a, 'b>(steps: &'b [Step], ctx: &'b ExecCtx<'a>) -> Result<SubqueryResult>
where
    'a: 'b,
{
    let mut candidate: Option<RowIter<'b>> = None;
    let mut results: Vec<ViewEntity> = Vec::new();
    let mut picked = false;

    for step in steps {
        match step {
            Step::Scan { collection } => {
                let scan = ctx.shared.snapshot.scan_collection(collection)?;
                candidate = Some(Box::new(
                    scan.map(|item| item.map(ViewEntity::from_entity)),
                ));
            }
            Step::IdLookup { collection, ids } => {
                let mut found = Vec::new();
                for id in resolve_ids(ids, ctx)? {
                    if let Some(entity) = ctx.shared.snapshot.get_entity(collection, &id)? {
                        found.push(ViewEntity::from_entity(entity));
                    }
                }
                candidate = Some(Box::new(found.into_iter().map(Ok)));
            }
            Step::PrepareView { id } => prepare_view(*id, ctx)?,
            Step::ResolveFromView { id, filters } => {
                let view = materialized_view(*id, ctx)?;
                let resolved = resolve_statements(filters, ctx)?;
                let indices = {
                    let mut cache = ctx.shared.vac_cache.borrow_mut();
                    vac::resolve_query_from_view(*id, &view.flat, &resolved, &mut cache)
                };
                candidate = Some(Box::new(
                    indices.into_iter().map(move |i| Ok(view.rows[i].clone())),
                ));
            }
            Step::Collect => {
                let iter = take_candidate(&mut candidate)?;
                for item in iter {
                    results.push(item?);
                }
            }
            Step::IteratorFilter { filters, after } => {
                let iter = take_candidate(&mut candidate)?;
                let mut bound = bind_filters(filters, ctx)?;
                if let Some(spec) = after {
                    bound.push(BoundFilter::After {
                        cursor: spec.cursor.clone(),
                        order: spec.order.clone(),
                    });
                }
                candidate = Some(Box::new(iter.filter(move |item| match item {
                    Ok(row) => bound.iter().all(|f| satisfies(&row.data.attrs, f)),
                    Err(_) => true,
                })));
            }
            Step::IteratorLimit { count } => {
                let iter = take_candidate(&mut candidate)?;
                candidate = Some(Box::new(iter.take(*count)));
            }
            Step::IteratorSubqueryFilter { steps: sub_steps } => {
                let iter = take_candidate(&mut candidate)?;
                candidate = Some(Box::new(iter.filter_map(move |item| {
                    let row = match item {
                        Ok(row) => row,
                        Err(err) => return Some(Err(err)),
                    };
                    let child = ctx.descend(flatten_view_entity(&row));
                    match execute_steps(sub_steps, &child) {
                        Ok(out) if out.has_rows() => Some(Ok(row)),
                        Ok(_) => None,
                        Err(err) => Some(Err(err)),
                    }
                })));
            }
            Step::Filter { filters, after } => {
                let mut bound = bind_filters(filters, ctx)?;
                if let Some(spec) = after {
                    bound.push(BoundFilter::After {
                        cursor: spec.cursor.clone(),
                        order: spec.order.clone(),
                    });
                }
                results.retain(|row| {
                    let flat = flatten_view_entity(row);
                    bound.iter().all(|f| satisfies(&flat, f))
                });
            }
            Step::Sort {
                terms,
                scratch_aliases,
            } => {
                let mut keyed: Vec<(Vec<Option<Value>>, ViewEntity)> = results
                    .drain(..)
                    .map(|row| {
                        let flat = flatten_view_entity(&row);
                        let keys = terms
                            .iter()
                            .map(|term| get_path(&flat, &term.path).cloned())
                            .collect();
                        (keys, row)
                    })
                    .collect();
                keyed.sort_by(|(a, _), (b, _)| {
                    for (i, term) in terms.iter().enumerate() {
                        let mut ord = compare_values(a[i].as_ref(), b[i].as_ref());
                        if term.direction == crate::query::ast::OrderDirection::Desc {
                            ord = ord.reverse();
                        }
                        if ord != std::cmp::Ordering::Equal {
                            return ord;
                        }
                    }
                    std::cmp::Ordering::Equal
                });
                results = keyed.into_iter().map(|(_, row)| row).collect();
                // Order scaffolding does not survive into the output rows.
                if !scratch_aliases.is_empty() {
                    for row in &mut results {
                        for alias in scratch_aliases {
                            row.subqueries.remove(alias);
                        }
                    }
                }
            }
            Step::Limit { count } => results.truncate(*count),
            Step::Subquery { alias, steps: sub_steps } => {
                for i in 0..results.len() {
                    let child = ctx.descend(flatten_view_entity(&results[i]));
                    let out = execute_steps(sub_steps, &child)?;
                    results[i].subqueries.insert(alias.clone(), out);
                }
            }
            Step::Pick => picked = true,
        }
    }

    if let Some(iter) = candidate {
        for item in iter {
            results.push(item?);
        }
    }

    if picked {
        Ok(SubqueryResult::One(results.into_iter().next()))
    } else {
        Ok(SubqueryResult::Many(results))
    }
}

fn take_candidate<'b>(candidate: &mut Option<RowIter<'b>>) -> Result<RowIter<'b>> {
    candidate
        .take()
        .ok_or_else(|| QueryError::PlanInvariant("step consumed a missing candidate iterator").into())
}

/// Materializes a view into the fetch-scoped memo. Re-entry is a no-op.
fn prepare_view(id: u32, ctx: &ExecCtx<'_>) -> Result<()> {
    if ctx.shared.views.borrow().contains_key(&id) {
        return Ok(());
    }
    let plan = ctx
        .shared
        .view_plans
        .get(&id)
        .ok_or(QueryError::UnknownView(id))?;
    // Views run with an empty entity stack: everything parent-dependent
    // was stripped during extraction.
    let root = ExecCtx {
        shared: ctx.shared,
        stack: Vec::new(),
    };
    let rows = execute_steps(&plan.steps, &root)?.into_rows();
    let flat = rows.iter().map(flatten_view_entity).collect();
    debug!(view = id, rows = rows.len(), "materialized view");
    ctx.shared
        .views
        .borrow_mut()
        .entry(id)
        .or_insert_with(|| Arc::new(MaterializedView { rows, flat }));
    Ok(())
}

fn materialized_view(id: u32, ctx: &ExecCtx<'_>) -> Result<Arc<MaterializedView>> {
    ctx.shared
        .views
        .borrow()
        .get(&id)
        .cloned()
        .ok_or_else(|| QueryError::PlanInvariant("view resolved before preparation").into())
}

/// Resolves a variable reference against the execution context.
///
/// `None` means the reference named an absent attribute; referencing a
/// stack frame that does not exist is an error, not an absence.
fn resolve_var(ctx: &ExecCtx<'_>, var: &VarRef) -> Result<Option<Value>> {
    match var {
        VarRef::Local(path) => Ok(resolve_bag(ctx.shared.vars, path)),
        VarRef::Role(path) => Ok(resolve_bag(ctx.shared.role, path)),
        VarRef::Stack { depth, path } => {
            let actual = ctx.stack.len();
            if *depth > actual {
                return Err(QueryError::StackDepthUnderflow {
                    requested: *depth,
                    actual,
                }
                .into());
            }
            let frame = &ctx.stack[actual - depth];
            Ok(get_path(frame, path).cloned())
        }
        VarRef::View { id, path } => {
            let view = materialized_view(*id, ctx)?;
            let column = view
                .flat
                .iter()
                .filter_map(|row| get_path(row, path).cloned())
                .collect();
            Ok(Some(Value::Array(column)))
        }
    }
}

/// Whole-key lookup first, so a variable named `a.b` wins over descending
/// into an object `a`.
fn resolve_bag(bag: &BTreeMap<String, Value>, path: &crate::query::ast::Path) -> Option<Value> {
    if let Some(value) = bag.get(&path.to_string()) {
        return Some(value.clone());
    }
    get_path(bag, path).cloned()
}

fn bind_value(value: &FilterValue, ctx: &ExecCtx<'_>) -> Result<Option<Value>> {
    match value {
        FilterValue::Literal(v) => Ok(Some(v.clone())),
        FilterValue::Var(var) => resolve_var(ctx, var),
    }
}

fn bind_filters(filters: &[Filter], ctx: &ExecCtx<'_>) -> Result<Vec<BoundFilter>> {
    filters
        .iter()
        .map(|filter| match filter {
            Filter::Statement(stmt) => Ok(BoundFilter::Statement {
                path: stmt.path.clone(),
                op: stmt.op,
                value: bind_value(&stmt.value, ctx)?,
            }),
            Filter::Group(group) => Ok(BoundFilter::Group {
                mode: group.mode,
                filters: bind_filters(&group.filters, ctx)?,
            }),
            Filter::Exists(_) => Err(QueryError::PlanInvariant(
                "existence filter reached predicate evaluation",
            )
            .into()),
        })
        .collect()
}

fn resolve_statements(
    filters: &[FilterStatement],
    ctx: &ExecCtx<'_>,
) -> Result<Vec<ResolvedStatement>> {
    filters
        .iter()
        .map(|stmt| {
            Ok(ResolvedStatement {
                path: stmt.path.clone(),
                op: stmt.op,
                value: bind_value(&stmt.value, ctx)?,
            })
        })
        .collect()
}

/// Expands an id-lookup operand into the list of ids to probe.
///
/// A view column resolves to an array; a set-shaped membership map
/// contributes its keys. Null and absent contribute nothing.
fn resolve_ids(ids: &FilterValue, ctx: &ExecCtx<'_>) -> Result<Vec<String>> {
    let Some(value) = bind_value(ids, ctx)? else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    collect_ids(&value, &mut out)?;
    out.dedup();
    Ok(out)
}

fn collect_ids(value: &Value, out: &mut Vec<String>) -> Result<()> {
    match value {
        Value::Null => {}
        Value::String(id) => {
            if !out.contains(id) {
                out.push(id.clone());
            }
        }
        Value::Int(id) => {
            let id = id.to_string();
            if !out.contains(&id) {
                out.push(id);
            }
        }
        Value::Array(members) => {
            for member in members {
                collect_ids(member, out)?;
            }
        }
        Value::Object(map) => out.extend(map.keys().cloned()),
        other @ (Value::Bool(_) | Value::Float(_)) => {
            return Err(QueryError::MalformedViewEntity(format!(
                "id lookup resolved to unusable value {other:?}"
            ))
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::{Cardinality, Filter, Inclusion, Operator, Path};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn setup_store() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .insert_json("users", json!({"id": "u1", "name": "ada", "age": 36}));
        store
            .insert_json("users", json!({"id": "u2", "name": "grace", "age": 29}));
        store
            .insert_json("todos", json!({"id": "t1", "author_id": "u1", "text": "ship"}));
        store
            .insert_json("todos", json!({"id": "t2", "author_id": "u2", "text": "review"}));
        store
    }

    fn query(collection: &str) -> PreparedQuery {
        PreparedQuery {
            collection_name: collection.into(),
            ..Default::default()
        }
    }

    #[test]
    fn scan_returns_every_entity() {
        let store = setup_store();
        let rows = fetch(&store, &query("users"), &FetchOptions::default()).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn literal_filter_prunes_during_iteration() {
        let store = setup_store();
        let mut q = query("users");
        q.where_.push(Filter::stmt(
            "age",
            Operator::Gt,
            FilterValue::Literal(Value::Int(30)),
        ));
        let rows = fetch(&store, &q, &FetchOptions::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data.id, "u1");
    }

    #[test]
    fn include_attaches_correlated_rows_under_alias() {
        let store = setup_store();
        let mut q = query("users");
        q.include.insert(
            "todos".into(),
            Inclusion {
                subquery: PreparedQuery {
                    collection_name: "todos".into(),
                    where_: vec![Filter::stmt(
                        "author_id",
                        Operator::Eq,
                        FilterValue::Var(VarRef::parse("$1.id").unwrap()),
                    )],
                    ..Default::default()
                },
                cardinality: Cardinality::Many,
            },
        );
        let rows = fetch(&store, &q, &FetchOptions::default()).unwrap();
        let ada = rows.iter().find(|r| r.data.id == "u1").unwrap();
        let SubqueryResult::Many(todos) = &ada.subqueries["todos"] else {
            panic!("expected many-result");
        };
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].data.id, "t1");
    }

    #[test]
    fn pick_flattens_to_object_or_null() {
        let store = setup_store();
        let mut q = query("todos");
        q.include.insert(
            "author".into(),
            Inclusion {
                subquery: PreparedQuery {
                    collection_name: "users".into(),
                    where_: vec![Filter::stmt(
                        "id",
                        Operator::Eq,
                        FilterValue::Var(VarRef::parse("$1.author_id").unwrap()),
                    )],
                    ..Default::default()
                },
                cardinality: Cardinality::One,
            },
        );
        let rows = fetch(&store, &q, &FetchOptions::default()).unwrap();
        let flat = flatten_view_entity(&rows[0]);
        match flat.get("author") {
            Some(Value::Object(author)) => {
                assert!(matches!(author.get("name"), Some(Value::String(_))));
            }
            other => panic!("expected picked object, got {other:?}"),
        }
    }

    #[test]
    fn local_variables_resolve_from_query_bag() {
        let store = setup_store();
        let mut q = query("users");
        q.vars.insert("target".into(), Value::String("u2".into()));
        q.where_.push(Filter::stmt(
            "id",
            Operator::Eq,
            FilterValue::Var(VarRef::parse("$target").unwrap()),
        ));
        let rows = fetch(&store, &q, &FetchOptions::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data.id, "u2");
    }

    #[test]
    fn role_variables_resolve_from_options() {
        let store = setup_store();
        let mut q = query("todos");
        q.where_.push(Filter::stmt(
            "author_id",
            Operator::Eq,
            FilterValue::Var(VarRef::parse("$role.user_id").unwrap()),
        ));
        let mut options = FetchOptions::default();
        options.role.insert("user_id".into(), "u1".into());
        let rows = fetch(&store, &q, &options).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data.id, "t1");
    }

    #[test]
    fn stack_underflow_is_an_error_not_a_miss() {
        let store = setup_store();
        let mut q = query("users");
        q.where_.push(Filter::stmt(
            "id",
            Operator::Eq,
            FilterValue::Var(VarRef::parse("$2.id").unwrap()),
        ));
        let err = fetch(&store, &q, &FetchOptions::default()).unwrap_err();
        assert!(err
            .to_string()
            .contains("variable stack depth 2 exceeds stack size 0"));
    }

    #[test]
    fn subquery_alias_shadows_attribute_when_flattening() {
        let entity = Arc::new(Entity::new(
            "e1",
            [("tag".to_owned(), Value::String("old".into()))]
                .into_iter()
                .collect(),
        ));
        let mut row = ViewEntity::from_entity(entity);
        row.subqueries
            .insert("tag".into(), SubqueryResult::One(None));
        let flat = flatten_view_entity(&row);
        assert_eq!(flat.get("tag"), Some(&Value::Null));
        assert_eq!(flat.get("id"), Some(&Value::String("e1".into())));
    }

    #[test]
    fn fetch_flat_applies_selection_but_keeps_aliases() {
        let store = setup_store();
        let mut q = query("users");
        q.select = Some(vec![Path::parse("id")]);
        q.include.insert(
            "todos".into(),
            Inclusion {
                subquery: PreparedQuery {
                    collection_name: "todos".into(),
                    where_: vec![Filter::stmt(
                        "author_id",
                        Operator::Eq,
                        FilterValue::Var(VarRef::parse("$1.id").unwrap()),
                    )],
                    ..Default::default()
                },
                cardinality: Cardinality::Many,
            },
        );
        let rows = fetch_flat(&store, &q, &FetchOptions::default()).unwrap();
        for row in &rows {
            assert!(row.contains_key("id"));
            assert!(row.contains_key("todos"));
            assert!(!row.contains_key("name"));
        }
    }
}
