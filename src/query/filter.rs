//! Non-relational predicate evaluation.
//!
//! Filters arrive here with their variable references already resolved, so
//! evaluation is pure: an attribute lookup (where absence is distinct from
//! null), an operator truth table, and short-circuiting group traversal.
//! Keyset cursor checks live here too since they are just a tuple
//! comparison over the order spec.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::query::ast::{Cursor, GroupMod, Operator, OrderDirection, OrderTerm, Path};
use crate::query::value::{compare_values, values_equal, Value};

/// Filter with every variable reference substituted by its resolved value.
///
/// `None` in a statement's value means the reference resolved to an absent
/// attribute; the truth tables below treat that explicitly.
#[derive(Clone, Debug)]
pub enum BoundFilter {
    /// Plain comparison against a resolved right-hand side.
    Statement {
        /// Attribute path within the candidate.
        path: Path,
        /// Comparison operator.
        op: Operator,
        /// Resolved right-hand side; `None` when the reference resolved to
        /// nothing.
        value: Option<Value>,
    },
    /// AND/OR group of bound filters.
    Group {
        /// Connective.
        mode: GroupMod,
        /// Children, evaluated in order.
        filters: Vec<BoundFilter>,
    },
    /// Keyset cursor check derived from an `after` clause.
    After {
        /// The cursor to compare against.
        cursor: Cursor,
        /// Order terms the cursor values positionally match.
        order: Vec<OrderTerm>,
    },
}

/// Resolves a dotted path inside a flattened attribute map, descending into
/// nested objects.
pub fn get_path<'a>(attrs: &'a BTreeMap<String, Value>, path: &Path) -> Option<&'a Value> {
    let mut segments = path.0.iter();
    let mut current = attrs.get(segments.next()?)?;
    for segment in segments {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            _ => return None,
        }
    }
    Some(current)
}

/// Evaluates a bound filter against a flattened entity.
pub fn satisfies(attrs: &BTreeMap<String, Value>, filter: &BoundFilter) -> bool {
    match filter {
        BoundFilter::Statement { path, op, value } => {
            satisfies_statement(get_path(attrs, path), *op, value.as_ref())
        }
        BoundFilter::Group { mode, filters } => match mode {
            GroupMod::And => filters.iter().all(|f| satisfies(attrs, f)),
            GroupMod::Or => filters.iter().any(|f| satisfies(attrs, f)),
        },
        BoundFilter::After { cursor, order } => satisfies_after(attrs, cursor, order),
    }
}

/// Operator truth table over a possibly-absent attribute and a
/// possibly-absent right-hand side.
///
/// Equality never matches across absent and a present value; `= null`
/// matches only an actually-null attribute. Ordering operators rank absent
/// and null as the same MIN sentinel, before every defined value.
pub fn satisfies_statement(attr: Option<&Value>, op: Operator, rhs: Option<&Value>) -> bool {
    match op {
        Operator::Eq => loose_eq(attr, rhs),
        Operator::Ne => !loose_eq(attr, rhs),
        Operator::Lt => compare_values(attr, rhs) == Ordering::Less,
        Operator::Lte => compare_values(attr, rhs) != Ordering::Greater,
        Operator::Gt => compare_values(attr, rhs) == Ordering::Greater,
        Operator::Gte => compare_values(attr, rhs) != Ordering::Less,
        Operator::In => in_set(attr, rhs),
        Operator::Nin => !in_set(attr, rhs),
        Operator::Like => match (attr, rhs) {
            (Some(Value::String(text)), Some(Value::String(pattern))) => {
                like_match(pattern, text)
            }
            _ => false,
        },
        Operator::Nlike => !satisfies_statement(attr, Operator::Like, rhs),
        Operator::Has => has_member(attr, rhs),
        Operator::Nhas => !has_member(attr, rhs),
        Operator::IsDefined => {
            let expected = matches!(rhs, Some(Value::Bool(true)));
            attr.is_some() == expected
        }
    }
}

fn loose_eq(attr: Option<&Value>, rhs: Option<&Value>) -> bool {
    match (attr, rhs) {
        (None, None) => true,
        (Some(Value::Null), Some(Value::Null)) => true,
        // Null and absent never equal a defined value, and never each other.
        (None, Some(_)) | (Some(_), None) => false,
        (Some(Value::Null), Some(_)) | (Some(_), Some(Value::Null)) => false,
        (Some(a), Some(b)) => values_equal(a, b),
    }
}

fn in_set(attr: Option<&Value>, rhs: Option<&Value>) -> bool {
    match rhs {
        Some(Value::Array(members)) => members
            .iter()
            .any(|member| loose_eq(attr, Some(member))),
        // A scalar right-hand side acts as a one-element set.
        Some(other) => loose_eq(attr, Some(other)),
        None => false,
    }
}

fn has_member(attr: Option<&Value>, rhs: Option<&Value>) -> bool {
    match (attr, rhs) {
        (Some(Value::Array(members)), Some(needle)) => {
            members.iter().any(|member| values_equal(member, needle))
        }
        _ => false,
    }
}

/// SQL-style `LIKE` match: `%` matches any run, `_` matches one character,
/// `\` escapes the next pattern character.
pub fn like_match(pattern: &str, text: &str) -> bool {
    #[derive(Clone, Copy, PartialEq)]
    enum Tok {
        Any,
        One,
        Lit(char),
    }
    let mut toks = Vec::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => toks.push(Tok::Any),
            '_' => toks.push(Tok::One),
            '\\' => match chars.next() {
                Some(escaped) => toks.push(Tok::Lit(escaped)),
                None => toks.push(Tok::Lit('\\')),
            },
            other => toks.push(Tok::Lit(other)),
        }
    }
    let text: Vec<char> = text.chars().collect();

    fn matches(toks: &[Tok], text: &[char]) -> bool {
        match toks.split_first() {
            None => text.is_empty(),
            Some((Tok::Any, rest)) => {
                (0..=text.len()).any(|skip| matches(rest, &text[skip..]))
            }
            Some((Tok::One, rest)) => !text.is_empty() && matches(rest, &text[1..]),
            Some((Tok::Lit(c), rest)) => {
                text.first() == Some(c) && matches(rest, &text[1..])
            }
        }
    }
    matches(&toks, &text)
}

/// True when the entity lies after the cursor in the order spec, i.e. it
/// belongs to the next page.
///
/// Tuple comparison honoring each term's direction; a tuple equal to the
/// cursor passes only when the cursor is inclusive.
pub fn satisfies_after(
    attrs: &BTreeMap<String, Value>,
    cursor: &Cursor,
    order: &[OrderTerm],
) -> bool {
    for (term, bound) in order.iter().zip(cursor.values.iter()) {
        let mut cmp = compare_values(get_path(attrs, &term.path), Some(bound));
        if term.direction == OrderDirection::Desc {
            cmp = cmp.reverse();
        }
        match cmp {
            Ordering::Greater => return true,
            Ordering::Less => return false,
            Ordering::Equal => {}
        }
    }
    cursor.inclusive
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn equality_never_crosses_absent_and_present() {
        assert!(!satisfies_statement(None, Operator::Eq, Some(&Value::Int(1))));
        assert!(!satisfies_statement(Some(&Value::Int(1)), Operator::Eq, None));
        assert!(!satisfies_statement(None, Operator::Eq, Some(&Value::Null)));
        assert!(satisfies_statement(
            Some(&Value::Null),
            Operator::Eq,
            Some(&Value::Null)
        ));
        assert!(satisfies_statement(None, Operator::Eq, None));
    }

    #[test]
    fn range_operators_treat_null_as_min_sentinel() {
        // Data [1, 2, 3, 4, null]: `> null` keeps exactly the defined rows.
        let data = [
            Some(Value::Int(1)),
            Some(Value::Int(2)),
            Some(Value::Int(3)),
            Some(Value::Int(4)),
            Some(Value::Null),
        ];
        let above: Vec<_> = data
            .iter()
            .filter(|v| satisfies_statement(v.as_ref(), Operator::Gt, Some(&Value::Null)))
            .collect();
        assert_eq!(above.len(), 4);
        let below: Vec<_> = data
            .iter()
            .filter(|v| satisfies_statement(v.as_ref(), Operator::Lt, Some(&Value::Null)))
            .collect();
        assert!(below.is_empty());
        // Absent behaves exactly like null for ordering.
        assert!(!satisfies_statement(None, Operator::Gt, Some(&Value::Null)));
        assert!(satisfies_statement(None, Operator::Gte, Some(&Value::Null)));
    }

    #[test]
    fn empty_set_membership() {
        let empty = Value::Array(vec![]);
        assert!(!satisfies_statement(
            Some(&Value::Int(1)),
            Operator::In,
            Some(&empty)
        ));
        assert!(satisfies_statement(
            Some(&Value::Int(1)),
            Operator::Nin,
            Some(&empty)
        ));
    }

    #[test]
    fn like_patterns() {
        assert!(like_match("a%", "abc"));
        assert!(like_match("%bc", "abc"));
        assert!(like_match("a_c", "abc"));
        assert!(!like_match("a_c", "abbc"));
        assert!(like_match("100\\%", "100%"));
        assert!(!like_match("100\\%", "1000"));
        assert!(like_match("%", ""));
    }

    #[test]
    fn has_requires_array_attribute() {
        let tags = Value::Array(vec!["a".into(), "b".into()]);
        assert!(satisfies_statement(Some(&tags), Operator::Has, Some(&"a".into())));
        assert!(!satisfies_statement(Some(&tags), Operator::Has, Some(&"z".into())));
        assert!(!satisfies_statement(
            Some(&Value::String("a".into())),
            Operator::Has,
            Some(&"a".into())
        ));
        assert!(satisfies_statement(None, Operator::Nhas, Some(&"a".into())));
    }

    #[test]
    fn group_short_circuits() {
        let entity = attrs(&[("age", Value::Int(30))]);
        let group = BoundFilter::Group {
            mode: GroupMod::Or,
            filters: vec![
                BoundFilter::Statement {
                    path: Path::parse("age"),
                    op: Operator::Gt,
                    value: Some(Value::Int(26)),
                },
                BoundFilter::Statement {
                    path: Path::parse("missing"),
                    op: Operator::Eq,
                    value: Some(Value::Int(1)),
                },
            ],
        };
        assert!(satisfies(&entity, &group));
    }

    #[test]
    fn after_cursor_tuple_comparison() {
        let order = vec![OrderTerm {
            path: Path::parse("age"),
            direction: OrderDirection::Asc,
            relation: None,
        }];
        let cursor = Cursor {
            values: vec![Value::Int(25)],
            inclusive: false,
        };
        assert!(satisfies_after(&attrs(&[("age", Value::Int(30))]), &cursor, &order));
        assert!(!satisfies_after(&attrs(&[("age", Value::Int(25))]), &cursor, &order));
        assert!(!satisfies_after(&attrs(&[("age", Value::Int(20))]), &cursor, &order));

        let inclusive = Cursor {
            values: vec![Value::Int(25)],
            inclusive: true,
        };
        assert!(satisfies_after(
            &attrs(&[("age", Value::Int(25))]),
            &inclusive,
            &order
        ));
    }

    #[test]
    fn after_cursor_respects_direction() {
        let order = vec![OrderTerm {
            path: Path::parse("age"),
            direction: OrderDirection::Desc,
            relation: None,
        }];
        let cursor = Cursor {
            values: vec![Value::Int(25)],
            inclusive: false,
        };
        assert!(satisfies_after(&attrs(&[("age", Value::Int(20))]), &cursor, &order));
        assert!(!satisfies_after(&attrs(&[("age", Value::Int(30))]), &cursor, &order));
    }
}
