//! Prepared query structures.
//!
//! The types here are plain data: filters, variable references, ordering,
//! cursors, and inclusions. They are produced by [`crate::query::prepare`]
//! and consumed by the view extractor and the compiler; no planning
//! decisions live here.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::query::errors::QueryError;
use crate::query::value::Value;

/// Dotted attribute path split into segments.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Path(pub SmallVec<[String; 2]>);

impl Path {
    /// Parses a dotted path string into segments.
    pub fn parse(raw: &str) -> Self {
        Path(raw.split('.').map(str::to_owned).collect())
    }

    /// Builds a single-segment path.
    pub fn single(segment: impl Into<String>) -> Self {
        Path(SmallVec::from_vec(vec![segment.into()]))
    }

    /// First segment, if any.
    pub fn first(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Path formed by the segments after the first.
    pub fn rest(&self) -> Path {
        Path(self.0.iter().skip(1).cloned().collect())
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the path has no segments.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl From<&str> for Path {
    fn from(raw: &str) -> Self {
        Path::parse(raw)
    }
}

/// Parsed variable reference.
///
/// References are parsed once at prepare time into this closed set of kinds
/// instead of being re-sniffed as strings at every resolution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarRef {
    /// `$name`: a path into the query's bound variable bag.
    Local(Path),
    /// `$<n>.path`: a path into the entity `n` levels up the entity stack.
    Stack {
        /// 1-based depth; 1 is the immediately enclosing entity.
        depth: usize,
        /// Attribute path within that entity.
        path: Path,
    },
    /// `$role.path`: a path into the session/role variable bag.
    Role(Path),
    /// `$view_<id>.path`: a column of a materialized view's flattened
    /// output.
    View {
        /// Identifier of the extracted view.
        id: u32,
        /// Attribute path within each view row.
        path: Path,
    },
}

impl VarRef {
    /// Parses a `$`-prefixed reference string.
    pub fn parse(raw: &str) -> Result<VarRef, QueryError> {
        let Some(body) = raw.strip_prefix('$') else {
            return Err(QueryError::InvalidFilter(format!(
                "variable reference '{raw}' must start with '$'"
            )));
        };
        if body.is_empty() {
            return Err(QueryError::InvalidFilter(
                "empty variable reference '$'".into(),
            ));
        }
        let path = Path::parse(body);
        let head = path.first().unwrap_or_default();
        if let Some(id) = head.strip_prefix("view_") {
            let id: u32 = id.parse().map_err(|_| {
                QueryError::InvalidFilter(format!("malformed view reference '{raw}'"))
            })?;
            return Ok(VarRef::View {
                id,
                path: path.rest(),
            });
        }
        if head.chars().all(|c| c.is_ascii_digit()) {
            let depth: usize = head.parse().map_err(|_| {
                QueryError::InvalidFilter(format!("malformed stack reference '{raw}'"))
            })?;
            if depth == 0 {
                return Err(QueryError::InvalidFilter(format!(
                    "stack reference '{raw}' must use depth >= 1"
                )));
            }
            return Ok(VarRef::Stack {
                depth,
                path: path.rest(),
            });
        }
        if head == "role" {
            return Ok(VarRef::Role(path.rest()));
        }
        Ok(VarRef::Local(path))
    }

    /// True when the literal string would parse as a variable reference.
    pub fn is_reference(raw: &str) -> bool {
        raw.starts_with('$')
    }
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarRef::Local(path) => write!(f, "${path}"),
            VarRef::Stack { depth, path } if path.is_empty() => write!(f, "${depth}"),
            VarRef::Stack { depth, path } => write!(f, "${depth}.{path}"),
            VarRef::Role(path) => write!(f, "$role.{path}"),
            VarRef::View { id, path } if path.is_empty() => write!(f, "$view_{id}"),
            VarRef::View { id, path } => write!(f, "$view_{id}.{path}"),
        }
    }
}

/// Comparison operator of a filter statement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    /// `=`
    #[serde(rename = "=")]
    Eq,
    /// `!=`
    #[serde(rename = "!=")]
    Ne,
    /// `<`
    #[serde(rename = "<")]
    Lt,
    /// `<=`
    #[serde(rename = "<=")]
    Lte,
    /// `>`
    #[serde(rename = ">")]
    Gt,
    /// `>=`
    #[serde(rename = ">=")]
    Gte,
    /// `in`, membership in a literal or view-resolved set.
    #[serde(rename = "in")]
    In,
    /// `nin`, negated membership.
    #[serde(rename = "nin")]
    Nin,
    /// `like`, SQL-style pattern with `%` and `_` wildcards.
    #[serde(rename = "like")]
    Like,
    /// `nlike`, negated pattern match.
    #[serde(rename = "nlike")]
    Nlike,
    /// `has`, true when an array attribute contains the value.
    #[serde(rename = "has")]
    Has,
    /// `!has`, true when an array attribute does not contain the value.
    #[serde(rename = "!has")]
    Nhas,
    /// `isDefined`, whether the attribute is present (value `true`) or absent
    /// (value `false`).
    #[serde(rename = "isDefined")]
    IsDefined,
}

impl Operator {
    /// Canonical operator spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::In => "in",
            Operator::Nin => "nin",
            Operator::Like => "like",
            Operator::Nlike => "nlike",
            Operator::Has => "has",
            Operator::Nhas => "!has",
            Operator::IsDefined => "isDefined",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Right-hand side of a filter statement: either a literal value or a
/// variable reference resolved at execution time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FilterValue {
    /// Literal value known at compile time.
    Literal(Value),
    /// Variable reference resolved against the execution context.
    Var(VarRef),
}

impl FilterValue {
    /// Returns the contained view id when the value references a view.
    pub fn view_id(&self) -> Option<u32> {
        match self {
            FilterValue::Var(VarRef::View { id, .. }) => Some(*id),
            _ => None,
        }
    }
}

impl From<Value> for FilterValue {
    fn from(value: Value) -> Self {
        FilterValue::Literal(value)
    }
}

/// Single comparison predicate: attribute path, operator, value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterStatement {
    /// Attribute path within the candidate entity.
    pub path: Path,
    /// Comparison operator.
    pub op: Operator,
    /// Right-hand side value.
    pub value: FilterValue,
}

impl FilterStatement {
    /// Builds a statement from loose parts.
    pub fn new(path: impl Into<Path>, op: Operator, value: impl Into<FilterValue>) -> Self {
        Self {
            path: path.into(),
            op,
            value: value.into(),
        }
    }
}

/// Connective of a filter group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupMod {
    /// Every child filter must hold.
    And,
    /// At least one child filter must hold.
    Or,
}

/// Recursive AND/OR group of filters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterGroup {
    /// Connective applied to the children.
    #[serde(rename = "mod")]
    pub mode: GroupMod,
    /// Child filters, evaluated in order with short-circuiting.
    pub filters: Vec<Filter>,
}

/// Existence subquery: true iff the nested query yields at least one row
/// when evaluated with the candidate entity pushed onto the entity stack.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubQueryFilter {
    /// The nested query whose non-emptiness is tested.
    pub exists: Box<PreparedQuery>,
}

/// Entry of a `where` clause.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Filter {
    /// Plain comparison statement.
    Statement(FilterStatement),
    /// AND/OR group.
    Group(FilterGroup),
    /// Existence subquery.
    Exists(SubQueryFilter),
}

impl Filter {
    /// Convenience constructor for a statement filter.
    pub fn stmt(path: impl Into<Path>, op: Operator, value: impl Into<FilterValue>) -> Self {
        Filter::Statement(FilterStatement::new(path, op, value))
    }

    /// Convenience constructor for an existence filter.
    pub fn exists(query: PreparedQuery) -> Self {
        Filter::Exists(SubQueryFilter {
            exists: Box::new(query),
        })
    }

    /// Convenience constructor for a group filter.
    pub fn group(mode: GroupMod, filters: Vec<Filter>) -> Self {
        Filter::Group(FilterGroup { mode, filters })
    }

    /// True for a plain statement.
    pub fn is_statement(&self) -> bool {
        matches!(self, Filter::Statement(_))
    }

    /// True for an AND/OR group.
    pub fn is_group(&self) -> bool {
        matches!(self, Filter::Group(_))
    }

    /// True for an existence subquery.
    pub fn is_exists(&self) -> bool {
        matches!(self, Filter::Exists(_))
    }
}

/// Sort direction of an order term.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderDirection {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// Single order term.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderTerm {
    /// Attribute path to sort by. When `relation` is set, the path reads
    /// from the materialized relation alias instead of the entity itself.
    pub path: Path,
    /// Sort direction.
    pub direction: OrderDirection,
    /// Cardinality-one relation subquery the path traverses, if any.
    pub relation: Option<Box<PreparedQuery>>,
}

/// Keyset pagination cursor: one value per order term.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    /// Cursor values positionally matching the query's order terms.
    pub values: Vec<Value>,
    /// Whether a row equal to the cursor is included.
    pub inclusive: bool,
}

/// Cardinality of a relation or inclusion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    /// At most one related entity; results reduce to the first row or null.
    One,
    /// Any number of related entities.
    Many,
}

/// Included relationship attached to each result row under an alias.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Inclusion {
    /// Subquery producing the related rows.
    pub subquery: PreparedQuery,
    /// Whether the alias carries a single row or an array.
    pub cardinality: Cardinality,
}

/// Fully normalized query ready for view extraction and compilation.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct PreparedQuery {
    /// Target collection, or a `$view_<id>` pseudo-collection reference.
    pub collection_name: String,
    /// Attribute paths included in the output; `None` selects everything.
    pub select: Option<Vec<Path>>,
    /// Conjunction of filters applied to candidates.
    #[serde(rename = "where")]
    pub where_: Vec<Filter>,
    /// Sort specification.
    pub order: Option<Vec<OrderTerm>>,
    /// Maximum number of rows returned.
    pub limit: Option<usize>,
    /// Keyset cursor; requires `order`.
    pub after: Option<Cursor>,
    /// Included relationships keyed by alias.
    pub include: BTreeMap<String, Inclusion>,
    /// Bound variable bag.
    pub vars: BTreeMap<String, Value>,
}

impl PreparedQuery {
    /// Parses a `$view_<id>` pseudo-collection reference, if this query
    /// targets one.
    pub fn view_collection_id(&self) -> Option<u32> {
        self.collection_name
            .strip_prefix("$view_")
            .and_then(|id| id.parse().ok())
    }
}

/// Pseudo-collection name addressing a materialized view.
pub fn view_collection_name(id: u32) -> String {
    format!("$view_{id}")
}

/// Loose user-facing query accepted by [`crate::query::prepare`].
///
/// Filter values may still contain unparsed `$...` reference strings,
/// filter paths may traverse relations, and `select` may be absent.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Query {
    /// Target collection name.
    pub collection_name: String,
    /// Shorthand for an `['id', '=', value]` filter.
    pub entity_id: Option<String>,
    /// Dotted attribute paths to select.
    pub select: Option<Vec<String>>,
    /// Conjunction of filters; relation paths are expanded during
    /// preparation.
    #[serde(rename = "where")]
    pub where_: Vec<Filter>,
    /// Order terms as dotted path + direction.
    pub order: Vec<(String, OrderDirection)>,
    /// Maximum number of rows returned.
    pub limit: Option<usize>,
    /// Keyset cursor; requires `order`.
    pub after: Option<Cursor>,
    /// Include refinements keyed by relation alias.
    pub include: BTreeMap<String, IncludeSpec>,
    /// Bound variable bag.
    pub vars: BTreeMap<String, Value>,
}

/// Refinement applied on top of a relation's base query when including it.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct IncludeSpec {
    /// Extra filters concatenated onto the relation's base `where`.
    #[serde(rename = "where")]
    pub where_: Vec<Filter>,
    /// Extra selections concatenated onto the relation's base `select`.
    pub select: Option<Vec<String>>,
    /// Order override for the included rows.
    pub order: Vec<(String, OrderDirection)>,
    /// Limit override for the included rows.
    pub limit: Option<usize>,
    /// Nested inclusions on the related collection.
    pub include: BTreeMap<String, IncludeSpec>,
}
