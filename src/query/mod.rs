#![forbid(unsafe_code)]

//! Query planning and execution engine.
//!
//! This module provides the pipeline that turns a declarative query into
//! results: preparation against a schema, view extraction, compilation to a
//! linear step plan, and step interpretation against the entity store.

/// Prepared query structures: filters, variable references, ordering,
/// cursors, and inclusions.
pub mod ast;

/// Fluent builder for programmatic query construction.
pub mod builder;

/// Step plan compiler.
///
/// Lowers a view-extracted query into a linear sequence of execution steps.
pub mod compile;

/// Step interpreter.
///
/// Executes compiled plans against the entity store and assembles the
/// nested view-entity result tree.
pub mod engine;

/// Structured errors for query preparation, compilation, and execution.
pub mod errors;

/// Non-relational predicate evaluation and keyset cursor checks.
pub mod filter;

/// Query preparation.
///
/// Normalizes a user-supplied query against the schema before any planning
/// decisions are made.
pub mod prepare;

/// Variable-aware cache: parameterized view resolution with an equality
/// index.
pub mod vac;

/// Canonical runtime value representation and its total order.
pub mod value;

/// View extraction.
///
/// Hoists repeatedly-evaluated relational subqueries into standalone views.
pub mod views;

pub use ast::{PreparedQuery, Query};
pub use builder::QueryBuilder;
pub use compile::{compile_query, CompiledPlan};
pub use engine::{
    fetch, fetch_flat, fetch_one, fetch_plan, flatten_view_entity, FetchOptions, SubqueryResult,
    ViewEntity,
};
pub use prepare::{prepare, PrepareOptions};
pub use value::Value;
