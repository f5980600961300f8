#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Structured errors emitted by the query layer.
//!
//! Variants split along the failure taxonomy: structural errors raised while
//! preparing or compiling a query are caller mistakes and surface
//! immediately; plan-invariant and data-shape errors raised during
//! interpretation indicate a bug in the compiler or a malformed result tree
//! and must fail loudly rather than return partial results.

use thiserror::Error;

/// Errors raised while preparing, compiling, or executing a query.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueryError {
    // --- preparation / compilation (caller errors) ---
    /// A filter statement is malformed (bad operator, bad variable
    /// reference, bad value shape).
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    /// The `where` clause contains an entry that is neither a statement,
    /// a group, nor an existence subquery.
    #[error("invalid where clause: {0}")]
    InvalidWhereClause(String),
    /// An order term references an unknown or unsortable attribute.
    #[error("invalid order clause: {0}")]
    InvalidOrderClause(String),
    /// A filter or include path names a relation that does not exist.
    #[error("relation '{relation}' does not exist on collection '{collection}'")]
    RelationDoesNotExist { relation: String, collection: String },
    /// An include alias points at a non-relation attribute.
    #[error("included key '{key}' on collection '{collection}' is not a relation")]
    IncludedNonRelation { key: String, collection: String },
    /// An `after` cursor was supplied without an `order` clause.
    #[error("'after' requires 'order' to be set")]
    AfterRequiresOrder,
    /// The named collection is absent from the schema.
    #[error("unknown collection '{0}'")]
    UnknownCollection(String),
    /// A filter or order path names an attribute the schema does not define.
    #[error("unknown attribute '{attribute}' on collection '{collection}'")]
    UnknownAttribute { attribute: String, collection: String },

    // --- execution (plan invariant violations: engine bugs) ---
    /// A step that consumes the candidate iterator ran before any step
    /// produced one.
    #[error("plan invariant violated: {0}")]
    PlanInvariant(&'static str),
    /// A step referenced a view id with no registered plan.
    #[error("unknown view id {0}")]
    UnknownView(u32),
    /// A relative variable reference asked for more enclosing entities
    /// than the current entity stack holds.
    #[error("variable stack depth {requested} exceeds stack size {actual}")]
    StackDepthUnderflow { requested: usize, actual: usize },

    // --- data shape (defensive detection) ---
    /// A view entity had an unexpected shape while flattening.
    #[error("malformed view entity: {0}")]
    MalformedViewEntity(String),
}

impl QueryError {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::InvalidFilter(_) => "InvalidFilter",
            QueryError::InvalidWhereClause(_) => "InvalidWhereClause",
            QueryError::InvalidOrderClause(_) => "InvalidOrderClause",
            QueryError::RelationDoesNotExist { .. } => "RelationDoesNotExist",
            QueryError::IncludedNonRelation { .. } => "IncludedNonRelation",
            QueryError::AfterRequiresOrder => "AfterRequiresOrder",
            QueryError::UnknownCollection(_) => "UnknownCollection",
            QueryError::UnknownAttribute { .. } => "UnknownAttribute",
            QueryError::PlanInvariant(_) => "PlanInvariant",
            QueryError::UnknownView(_) => "UnknownView",
            QueryError::StackDepthUnderflow { .. } => "StackDepthUnderflow",
            QueryError::MalformedViewEntity(_) => "MalformedViewEntity",
        }
    }

    /// True when the error indicates a broken plan invariant rather than a
    /// caller mistake.
    pub fn is_engine_bug(&self) -> bool {
        matches!(
            self,
            QueryError::PlanInvariant(_)
                | QueryError::UnknownView(_)
                | QueryError::MalformedViewEntity(_)
        )
    }
}
