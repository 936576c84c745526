//! Row predicates in conjunctive normal form
//!
//! The host query engine hands the adapter layer the predicates it did not
//! push down to a physical source. They are evaluated locally, row by row.
//!
//! The first group is a list of ANDed qualifiers; every following group is a
//! list of ORed qualifiers; all groups are ANDed together.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::types::{LogicalColumn, Value};

/// Comparison operator of a qualifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    LessThan,
    LessOrEquals,
    GreaterThan,
    GreaterOrEquals,
}

impl Operator {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Operator::Equals => ordering == Ordering::Equal,
            Operator::LessThan => ordering == Ordering::Less,
            Operator::LessOrEquals => ordering != Ordering::Greater,
            Operator::GreaterThan => ordering == Ordering::Greater,
            Operator::GreaterOrEquals => ordering != Ordering::Less,
        }
    }

    /// Operator equivalent to `NOT (x op c)`, or `None` for `!=`.
    pub fn negated(self) -> Option<Operator> {
        match self {
            Operator::Equals => None,
            Operator::LessThan => Some(Operator::GreaterOrEquals),
            Operator::LessOrEquals => Some(Operator::GreaterThan),
            Operator::GreaterThan => Some(Operator::LessOrEquals),
            Operator::GreaterOrEquals => Some(Operator::LessThan),
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Operator::Equals => "=",
            Operator::LessThan => "<",
            Operator::LessOrEquals => "<=",
            Operator::GreaterThan => ">",
            Operator::GreaterOrEquals => ">=",
        }
    }
}

/// One comparison of a logical column against a constant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Qualifier {
    /// 0-based logical column position
    pub column: usize,
    pub operator: Operator,
    pub value: Value,
    /// Negate the comparison result
    #[serde(default)]
    pub negate: bool,
    /// When set, nulls sort after every other value instead of yielding `unknown_rv`
    #[serde(default)]
    pub ordered_nulls: bool,
    /// Result used when a null is compared and `ordered_nulls` is off
    #[serde(default)]
    pub unknown_rv: bool,
}

impl Qualifier {
    pub fn new(column: usize, operator: Operator, value: Value) -> Self {
        Self {
            column,
            operator,
            value,
            negate: false,
            ordered_nulls: false,
            unknown_rv: false,
        }
    }

    /// `column != value`
    pub fn not_equals(column: usize, value: Value) -> Self {
        Self::new(column, Operator::Equals, value).negated()
    }

    pub fn negated(mut self) -> Self {
        self.negate = !self.negate;
        self
    }

    pub fn with_ordered_nulls(mut self, ordered_nulls: bool) -> Self {
        self.ordered_nulls = ordered_nulls;
        self
    }

    pub fn with_unknown_rv(mut self, unknown_rv: bool) -> Self {
        self.unknown_rv = unknown_rv;
        self
    }

    /// Operator after folding in `negate`; `None` when the qualifier is a `!=`.
    pub fn effective_operator(&self) -> Option<Operator> {
        if self.negate {
            self.operator.negated()
        } else {
            Some(self.operator)
        }
    }

    /// Tests one cell. A missing cell (column past the row's width) is a null.
    pub fn test(&self, cell: Option<&Value>) -> bool {
        let cell = cell.unwrap_or(&Value::Null);
        let outcome = if cell.is_null() || self.value.is_null() {
            if self.ordered_nulls {
                let ordering = match (cell.is_null(), self.value.is_null()) {
                    (true, true) => Ordering::Equal,
                    (true, false) => Ordering::Greater,
                    _ => Ordering::Less,
                };
                self.operator.holds(ordering)
            } else {
                self.unknown_rv
            }
        } else {
            match cell.compare(&self.value) {
                Some(ordering) => self.operator.holds(ordering),
                None => self.unknown_rv,
            }
        };
        self.negate ^ outcome
    }
}

/// Predicates in conjunctive normal form
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Predicates {
    /// Qualifiers that must all hold
    #[serde(default)]
    pub and_group: Vec<Qualifier>,
    /// Groups of which at least one qualifier must hold
    #[serde(default)]
    pub or_groups: Vec<Vec<Qualifier>>,
}

impl Predicates {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn and(mut self, qualifier: Qualifier) -> Self {
        self.and_group.push(qualifier);
        self
    }

    pub fn or_group(mut self, group: Vec<Qualifier>) -> Self {
        self.or_groups.push(group);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.and_group.is_empty() && self.or_groups.iter().all(|g| g.is_empty())
    }

    pub fn qualifiers(&self) -> impl Iterator<Item = &Qualifier> {
        self.and_group.iter().chain(self.or_groups.iter().flatten())
    }

    /// Logical columns referenced by any qualifier, ascending.
    pub fn columns(&self) -> BTreeSet<usize> {
        self.qualifiers().map(|q| q.column).collect()
    }

    /// Evaluates the predicates against a logical row.
    ///
    /// An empty OR group places no constraint on the row.
    pub fn matches(&self, row: &[Value]) -> bool {
        if !self.and_group.iter().all(|q| q.test(row.get(q.column))) {
            return false;
        }
        self.or_groups
            .iter()
            .filter(|group| !group.is_empty())
            .all(|group| group.iter().any(|q| q.test(row.get(q.column))))
    }

    /// Converts every qualifier constant to its column's logical type, so
    /// comparisons run between values of the same type.
    pub fn coerced_to(&self, columns: &[LogicalColumn]) -> EngineResult<Predicates> {
        let coerce = |q: &Qualifier| -> EngineResult<Qualifier> {
            let mut q = q.clone();
            if let Some(column) = columns.get(q.column) {
                q.value = q.value.coerce(column.logical_type).map_err(|e| {
                    crate::error::EngineError::type_conversion(
                        column.name.as_str(),
                        format!("predicate constant: {}", e),
                    )
                })?;
            }
            Ok(q)
        };

        Ok(Predicates {
            and_group: self.and_group.iter().map(coerce).collect::<EngineResult<_>>()?,
            or_groups: self
                .or_groups
                .iter()
                .map(|group| group.iter().map(coerce).collect::<EngineResult<Vec<_>>>())
                .collect::<EngineResult<_>>()?,
        })
    }

    /// Renders the predicates in SQL-like form for log lines.
    pub fn describe(&self) -> String {
        let render = |q: &Qualifier| {
            let expr = format!("c{} {} {}", q.column + 1, q.operator.symbol(), q.value);
            if q.negate {
                format!("NOT ({})", expr)
            } else {
                expr
            }
        };
        let mut parts: Vec<String> = self.and_group.iter().map(render).collect();
        for group in self.or_groups.iter().filter(|g| !g.is_empty()) {
            let ors: Vec<String> = group.iter().map(render).collect();
            parts.push(format!("({})", ors.join(" OR ")));
        }
        parts.join(" AND ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogicalType;

    fn row() -> Vec<Value> {
        vec![Value::Int(5), Value::Text("b".into()), Value::Null]
    }

    #[test]
    fn and_group_requires_every_qualifier() {
        let p = Predicates::none()
            .and(Qualifier::new(0, Operator::GreaterThan, Value::Int(1)))
            .and(Qualifier::new(1, Operator::Equals, Value::Text("b".into())));
        assert!(p.matches(&row()));

        let p = p.and(Qualifier::new(0, Operator::LessThan, Value::Int(5)));
        assert!(!p.matches(&row()));
    }

    #[test]
    fn or_groups_need_one_match_each() {
        let p = Predicates::none()
            .or_group(vec![
                Qualifier::new(0, Operator::Equals, Value::Int(7)),
                Qualifier::new(1, Operator::Equals, Value::Text("b".into())),
            ])
            .or_group(vec![Qualifier::new(0, Operator::GreaterOrEquals, Value::Int(5))]);
        assert!(p.matches(&row()));

        let p = p.or_group(vec![Qualifier::new(0, Operator::Equals, Value::Int(0))]);
        assert!(!p.matches(&row()));
    }

    #[test]
    fn negate_flips_result() {
        let q = Qualifier::not_equals(0, Value::Int(5));
        assert!(!q.test(Some(&Value::Int(5))));
        assert!(q.test(Some(&Value::Int(6))));
        assert_eq!(q.effective_operator(), None);
        assert_eq!(
            Qualifier::new(0, Operator::LessThan, Value::Int(1))
                .negated()
                .effective_operator(),
            Some(Operator::GreaterOrEquals)
        );
    }

    #[test]
    fn null_comparison_uses_unknown_rv() {
        let q = Qualifier::new(2, Operator::Equals, Value::Int(1));
        assert!(!q.test(row().get(2)));
        assert!(q.clone().with_unknown_rv(true).test(row().get(2)));
    }

    #[test]
    fn ordered_nulls_sort_high() {
        let q = Qualifier::new(2, Operator::GreaterThan, Value::Int(100)).with_ordered_nulls(true);
        assert!(q.test(row().get(2)));
        let q = Qualifier::new(2, Operator::Equals, Value::Null).with_ordered_nulls(true);
        assert!(q.test(Some(&Value::Null)));
    }

    #[test]
    fn column_outside_row_is_null() {
        let q = Qualifier::new(9, Operator::Equals, Value::Int(1)).with_unknown_rv(true);
        assert!(q.test(row().get(9)));
    }

    #[test]
    fn constants_coerce_to_logical_types() {
        let columns = vec![LogicalColumn::new("id", LogicalType::Integer)];
        let p = Predicates::none().and(Qualifier::new(0, Operator::Equals, Value::Text("5".into())));
        let coerced = p.coerced_to(&columns).unwrap();
        assert_eq!(coerced.and_group[0].value, Value::Int(5));

        let bad = Predicates::none().and(Qualifier::new(0, Operator::Equals, Value::Text("x".into())));
        assert!(bad.coerced_to(&columns).is_err());
    }

    #[test]
    fn columns_are_collected_once() {
        let p = Predicates::none()
            .and(Qualifier::new(3, Operator::Equals, Value::Int(1)))
            .or_group(vec![
                Qualifier::new(1, Operator::Equals, Value::Int(1)),
                Qualifier::new(3, Operator::Equals, Value::Int(2)),
            ]);
        assert_eq!(p.columns().into_iter().collect::<Vec<_>>(), vec![1, 3]);
    }
}
