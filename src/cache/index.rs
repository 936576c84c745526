//! Secondary indexes over a cached row set

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;

use qore_core::{LogicalType, Operator, Qualifier, Value};

/// Sorted-map key wrapping a logical value
#[derive(Debug, Clone)]
pub struct IndexKey(pub Value);

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Row numbers sharing one key, in insertion order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexBucket {
    Single(usize),
    Many(Vec<usize>),
}

impl IndexBucket {
    fn push(&mut self, row: usize) {
        match self {
            IndexBucket::Single(first) => *self = IndexBucket::Many(vec![*first, row]),
            IndexBucket::Many(rows) => rows.push(row),
        }
    }

    pub fn rows(&self) -> &[usize] {
        match self {
            IndexBucket::Single(row) => std::slice::from_ref(row),
            IndexBucket::Many(rows) => rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows().is_empty()
    }
}

/// Why an index could not be built
#[derive(Debug, Clone, PartialEq)]
pub enum IndexAbandoned {
    NullValue { row: usize },
    Conversion { row: usize, message: String },
}

impl fmt::Display for IndexAbandoned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexAbandoned::NullValue { row } => write!(f, "row {} holds a NULL", row + 1),
            IndexAbandoned::Conversion { row, message } => {
                write!(f, "row {}: {}", row + 1, message)
            }
        }
    }
}

/// Sorted map from one logical column's values to the rows holding them
#[derive(Debug, Clone)]
pub struct SecondaryIndex {
    logical_column: usize,
    entries: BTreeMap<IndexKey, IndexBucket>,
}

/// A candidate bound: value plus inclusiveness
type Edge = Option<(Value, bool)>;

impl SecondaryIndex {
    /// Indexes physical column `physical_column` of `rows`, keyed by values
    /// coerced to `logical_type`.
    pub fn build(
        logical_column: usize,
        physical_column: usize,
        logical_type: LogicalType,
        rows: &[Vec<Value>],
    ) -> Result<Self, IndexAbandoned> {
        let mut entries: BTreeMap<IndexKey, IndexBucket> = BTreeMap::new();
        for (row, values) in rows.iter().enumerate() {
            let raw = values.get(physical_column).unwrap_or(&Value::Null);
            if raw.is_null() {
                return Err(IndexAbandoned::NullValue { row });
            }
            let key = raw
                .coerce(logical_type)
                .map_err(|e| IndexAbandoned::Conversion {
                    row,
                    message: e.to_string(),
                })?;
            if key.is_null() {
                return Err(IndexAbandoned::NullValue { row });
            }
            entries
                .entry(IndexKey(key))
                .and_modify(|bucket| bucket.push(row))
                .or_insert(IndexBucket::Single(row));
        }
        Ok(Self {
            logical_column,
            entries,
        })
    }

    pub fn logical_column(&self) -> usize {
        self.logical_column
    }

    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, value: &Value) -> Option<&IndexBucket> {
        self.entries.get(&IndexKey(value.clone()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &IndexBucket)> {
        self.entries.iter().map(|(k, b)| (&k.0, b))
    }

    /// Rows whose key satisfies every usable qualifier, with the number of
    /// distinct keys they span.
    ///
    /// Qualifiers on other columns, `!=` qualifiers and null constants are
    /// ignored. Returns `None` when nothing narrows the index.
    pub fn lookup<'a>(
        &self,
        qualifiers: impl IntoIterator<Item = &'a Qualifier>,
    ) -> Option<IndexLookup> {
        let mut lower: Edge = None;
        let mut upper: Edge = None;
        let mut equality = false;

        for qualifier in qualifiers {
            if qualifier.column != self.logical_column || qualifier.value.is_null() {
                continue;
            }
            let Some(operator) = qualifier.effective_operator() else {
                continue;
            };
            let value = &qualifier.value;
            match operator {
                Operator::Equals => {
                    equality = true;
                    tighten_lower(&mut lower, value, true);
                    tighten_upper(&mut upper, value, true);
                }
                Operator::LessThan => tighten_upper(&mut upper, value, false),
                Operator::LessOrEquals => tighten_upper(&mut upper, value, true),
                Operator::GreaterThan => tighten_lower(&mut lower, value, false),
                Operator::GreaterOrEquals => tighten_lower(&mut lower, value, true),
            }
        }

        if lower.is_none() && upper.is_none() {
            return None;
        }

        if let (Some((lo, lo_inc)), Some((hi, hi_inc))) = (&lower, &upper) {
            match IndexKey(lo.clone()).cmp(&IndexKey(hi.clone())) {
                Ordering::Greater => return Some(IndexLookup::empty(equality)),
                Ordering::Equal if !(*lo_inc && *hi_inc) => {
                    return Some(IndexLookup::empty(equality))
                }
                _ => {}
            }
        }

        let bound = |edge: Edge| match edge {
            None => Bound::Unbounded,
            Some((value, true)) => Bound::Included(IndexKey(value)),
            Some((value, false)) => Bound::Excluded(IndexKey(value)),
        };
        let mut keys = 0;
        let mut rows = Vec::new();
        for (_, bucket) in self.entries.range((bound(lower), bound(upper))) {
            keys += 1;
            rows.extend_from_slice(bucket.rows());
        }
        Some(IndexLookup {
            rows,
            keys,
            equality,
        })
    }
}

fn tighten_lower(edge: &mut Edge, value: &Value, inclusive: bool) {
    let replace = match edge {
        None => true,
        Some((current, current_inclusive)) => match value.total_cmp(current) {
            Ordering::Greater => true,
            Ordering::Equal => *current_inclusive && !inclusive,
            Ordering::Less => false,
        },
    };
    if replace {
        *edge = Some((value.clone(), inclusive));
    }
}

fn tighten_upper(edge: &mut Edge, value: &Value, inclusive: bool) {
    let replace = match edge {
        None => true,
        Some((current, current_inclusive)) => match value.total_cmp(current) {
            Ordering::Less => true,
            Ordering::Equal => *current_inclusive && !inclusive,
            Ordering::Greater => false,
        },
    };
    if replace {
        *edge = Some((value.clone(), inclusive));
    }
}

/// Result of narrowing one index
#[derive(Debug, Clone, PartialEq)]
pub struct IndexLookup {
    /// Matching row numbers, in key order
    pub rows: Vec<usize>,
    /// Distinct keys the rows span
    pub keys: usize,
    /// An `=` qualifier took part
    pub equality: bool,
}

impl IndexLookup {
    fn empty(equality: bool) -> Self {
        Self {
            rows: Vec::new(),
            keys: 0,
            equality,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rows(values: &[i64]) -> Vec<Vec<Value>> {
        values
            .iter()
            .map(|v| vec![Value::Text(format!("r{}", v)), Value::Int(*v)])
            .collect()
    }

    #[test]
    fn duplicates_chain_in_insertion_order() {
        let rows = rows(&[5, 3, 5, 7, 5]);
        let index = SecondaryIndex::build(0, 1, LogicalType::Integer, &rows).unwrap();
        assert_eq!(index.key_count(), 3);
        assert_eq!(index.get(&Value::Int(3)), Some(&IndexBucket::Single(1)));
        assert_eq!(
            index.get(&Value::Int(5)),
            Some(&IndexBucket::Many(vec![0, 2, 4]))
        );
    }

    #[test]
    fn null_or_bad_value_abandons_index() {
        let mut with_null = rows(&[1, 2]);
        with_null[1][1] = Value::Null;
        assert_eq!(
            SecondaryIndex::build(0, 1, LogicalType::Integer, &with_null).unwrap_err(),
            IndexAbandoned::NullValue { row: 1 }
        );

        let bad = vec![vec![Value::Text("x".into())]];
        assert!(matches!(
            SecondaryIndex::build(0, 0, LogicalType::Integer, &bad),
            Err(IndexAbandoned::Conversion { row: 0, .. })
        ));
    }

    #[test]
    fn keys_are_coerced_to_logical_type() {
        let rows = vec![vec![Value::Text("10".into())], vec![Value::Text("9".into())]];
        let index = SecondaryIndex::build(0, 0, LogicalType::Integer, &rows).unwrap();
        let ordered: Vec<&Value> = index.iter().map(|(k, _)| k).collect();
        assert_eq!(ordered, vec![&Value::Int(9), &Value::Int(10)]);
    }

    #[test]
    fn lookup_combines_range_bounds() {
        let rows = rows(&[1, 2, 3, 4, 5, 6]);
        let index = SecondaryIndex::build(0, 1, LogicalType::Integer, &rows).unwrap();

        let q = [
            Qualifier::new(0, Operator::GreaterThan, Value::Int(2)),
            Qualifier::new(0, Operator::LessOrEquals, Value::Int(4)),
            Qualifier::new(0, Operator::LessThan, Value::Int(6)),
        ];
        let lookup = index.lookup(&q).unwrap();
        assert_eq!(lookup.rows, vec![2, 3]);
        assert_eq!(lookup.keys, 2);
        assert!(!lookup.equality);

        // NOT (c < 5) is c >= 5
        let negated = [Qualifier::new(0, Operator::LessThan, Value::Int(5)).negated()];
        assert_eq!(index.lookup(&negated).unwrap().rows, vec![4, 5]);
    }

    #[test]
    fn lookup_ignores_unusable_qualifiers() {
        let rows = rows(&[1, 2]);
        let index = SecondaryIndex::build(0, 1, LogicalType::Integer, &rows).unwrap();

        assert!(index
            .lookup(&[Qualifier::not_equals(0, Value::Int(1))])
            .is_none());
        assert!(index
            .lookup(&[Qualifier::new(1, Operator::Equals, Value::Int(1))])
            .is_none());
        assert!(index
            .lookup(&[Qualifier::new(0, Operator::Equals, Value::Null)])
            .is_none());
    }

    #[test]
    fn contradictory_bounds_select_nothing() {
        let rows = rows(&[1, 2, 3]);
        let index = SecondaryIndex::build(0, 1, LogicalType::Integer, &rows).unwrap();

        let inverted = [
            Qualifier::new(0, Operator::GreaterThan, Value::Int(3)),
            Qualifier::new(0, Operator::LessThan, Value::Int(1)),
        ];
        assert_eq!(index.lookup(&inverted).unwrap().rows, Vec::<usize>::new());

        let touching = [
            Qualifier::new(0, Operator::GreaterThan, Value::Int(2)),
            Qualifier::new(0, Operator::LessThan, Value::Int(2)),
        ];
        assert_eq!(index.lookup(&touching).unwrap().keys, 0);

        let conflicting = [
            Qualifier::new(0, Operator::Equals, Value::Int(1)),
            Qualifier::new(0, Operator::Equals, Value::Int(3)),
        ];
        let lookup = index.lookup(&conflicting).unwrap();
        assert!(lookup.rows.is_empty());
        assert!(lookup.equality);
    }

    fn bucket_sets(index: &SecondaryIndex, rows: &[Vec<Value>]) -> Vec<(Value, Vec<Value>)> {
        index
            .iter()
            .map(|(key, bucket)| {
                let mut members: Vec<Value> =
                    bucket.rows().iter().map(|&r| rows[r][0].clone()).collect();
                members.sort_by(|a, b| a.total_cmp(b));
                (key.clone(), members)
            })
            .collect()
    }

    proptest! {
        #[test]
        fn rebuild_is_order_independent(
            keys in proptest::collection::vec(0i64..8, 0..40),
            seed in any::<u64>(),
        ) {
            // Row payload is unique, so buckets compare by row content
            let original: Vec<Vec<Value>> = keys
                .iter()
                .enumerate()
                .map(|(i, k)| vec![Value::Int(i as i64), Value::Int(*k)])
                .collect();

            let mut shuffled = original.clone();
            let mut state = seed;
            for i in (1..shuffled.len()).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let j = (state >> 33) as usize % (i + 1);
                shuffled.swap(i, j);
            }

            let a = SecondaryIndex::build(0, 1, LogicalType::Integer, &original).unwrap();
            let b = SecondaryIndex::build(0, 1, LogicalType::Integer, &shuffled).unwrap();
            prop_assert_eq!(bucket_sets(&a, &original), bucket_sets(&b, &shuffled));
        }
    }
}
