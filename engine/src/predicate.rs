//! Predicate engine for filtering records.
//!
//! A predicate is a tree of field comparisons combined with `and`, `or` and
//! `not`. The same tree is evaluated locally against records and translated
//! into a remote filter for delta and live queries.
//!
//! ```rust
//! use ferry_engine::Predicate;
//! use serde_json::json;
//!
//! let predicate = Predicate::or(vec![
//!     Predicate::field("title").starts_with("draft"),
//!     Predicate::field("priority").ge(3),
//! ]);
//!
//! let record = json!({"title": "draft: ferry", "priority": 1});
//! assert!(predicate.evaluate(record.as_object().unwrap()));
//! ```

use crate::{error::Result, Error, Record};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Comparison operator of a field predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Field value is an element of the given array, or a substring of the given string
    In,
    /// Field array contains the value, or field string contains the substring
    Contains,
    StartsWith,
    EndsWith,
}

impl Operator {
    /// All operators.
    pub const ALL: [Operator; 10] = [
        Operator::Eq,
        Operator::Ne,
        Operator::Lt,
        Operator::Le,
        Operator::Gt,
        Operator::Ge,
        Operator::In,
        Operator::Contains,
        Operator::StartsWith,
        Operator::EndsWith,
    ];

    /// Name used in remote filters.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Lt => "lt",
            Operator::Le => "le",
            Operator::Gt => "gt",
            Operator::Ge => "ge",
            Operator::In => "in",
            Operator::Contains => "contains",
            Operator::StartsWith => "startsWith",
            Operator::EndsWith => "endsWith",
        }
    }

    /// Apply the operator to a field value (`None` when absent) and operand.
    pub fn apply(&self, field: Option<&Value>, operand: &Value) -> bool {
        let field = field.unwrap_or(&Value::Null);
        match self {
            Operator::Eq => values_equal(field, operand),
            Operator::Ne => !values_equal(field, operand),
            Operator::Lt => compare_values(field, operand) == Some(Ordering::Less),
            Operator::Le => matches!(
                compare_values(field, operand),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::Gt => compare_values(field, operand) == Some(Ordering::Greater),
            Operator::Ge => matches!(
                compare_values(field, operand),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::In => match operand {
                Value::Array(items) => items.iter().any(|item| values_equal(field, item)),
                _ => false,
            },
            Operator::Contains => match (field, operand) {
                (Value::Array(items), _) => items.iter().any(|item| values_equal(item, operand)),
                (Value::String(haystack), Value::String(needle)) => {
                    haystack.contains(needle.as_str())
                }
                _ => false,
            },
            Operator::StartsWith => match (field, operand) {
                (Value::String(s), Value::String(prefix)) => s.starts_with(prefix.as_str()),
                _ => false,
            },
            Operator::EndsWith => match (field, operand) {
                (Value::String(s), Value::String(suffix)) => s.ends_with(suffix.as_str()),
                _ => false,
            },
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numbers compare by value so `1` equals `1.0`.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Ordering between values of the same kind; `None` for mixed kinds.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// A boolean filter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Predicate {
    /// `record[field] <op> value`
    Field {
        field: String,
        op: Operator,
        value: Value,
    },
    /// Conjunction; vacuously true.
    And { predicates: Vec<Predicate> },
    /// Disjunction; vacuously false.
    Or { predicates: Vec<Predicate> },
    /// Negation of the conjunction of its children.
    Not { predicates: Vec<Predicate> },
}

impl Predicate {
    /// Start a field predicate.
    pub fn field(name: impl Into<String>) -> FieldPredicate {
        FieldPredicate { field: name.into() }
    }

    pub fn and(predicates: Vec<Predicate>) -> Self {
        Predicate::And { predicates }
    }

    pub fn or(predicates: Vec<Predicate>) -> Self {
        Predicate::Or { predicates }
    }

    /// Negate a single predicate.
    pub fn not(predicate: Predicate) -> Self {
        Predicate::Not {
            predicates: vec![predicate],
        }
    }

    /// Negate the conjunction of several predicates.
    pub fn not_all(predicates: Vec<Predicate>) -> Self {
        Predicate::Not { predicates }
    }

    /// Evaluate the predicate against a record.
    pub fn evaluate(&self, record: &Record) -> bool {
        match self {
            Predicate::Field { field, op, value } => op.apply(record.get(field), value),
            Predicate::And { predicates } => predicates.iter().all(|p| p.evaluate(record)),
            Predicate::Or { predicates } => predicates.iter().any(|p| p.evaluate(record)),
            Predicate::Not { predicates } => !predicates.iter().all(|p| p.evaluate(record)),
        }
    }

    /// Keep the records the predicate accepts.
    pub fn filter<'a>(&self, records: impl IntoIterator<Item = &'a Record>) -> Vec<Record> {
        records
            .into_iter()
            .filter(|r| self.evaluate(r))
            .cloned()
            .collect()
    }

    /// Check the tree is well formed.
    pub fn validate(&self) -> Result<()> {
        match self {
            Predicate::Field { field, .. } if field.is_empty() => Err(Error::InvalidPredicate(
                "field predicate has an empty field name".into(),
            )),
            Predicate::Field {
                field,
                op: Operator::In,
                value,
            } if !value.is_array() => Err(Error::InvalidPredicate(format!(
                "'in' on {} needs an array operand",
                field
            ))),
            Predicate::Field { .. } => Ok(()),
            Predicate::And { predicates }
            | Predicate::Or { predicates }
            | Predicate::Not { predicates } => predicates.iter().try_for_each(Predicate::validate),
        }
    }

    /// Field names referenced anywhere in the tree.
    pub fn fields(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Predicate::Field { field, .. } => {
                out.insert(field.as_str());
            }
            Predicate::And { predicates }
            | Predicate::Or { predicates }
            | Predicate::Not { predicates } => {
                for p in predicates {
                    p.collect_fields(out);
                }
            }
        }
    }

    /// Translate into a remote filter object.
    ///
    /// The mapping is structural: a field predicate becomes
    /// `{"field": {"op": value}}`, and composites become `and`/`or`/`not`
    /// keys. Any operator outside the dialect fails the translation.
    pub fn to_remote_filter(&self, dialect: &FilterDialect) -> Result<Value> {
        self.validate()?;
        self.translate(dialect)
    }

    fn translate(&self, dialect: &FilterDialect) -> Result<Value> {
        match self {
            Predicate::Field { field, op, value } => {
                if !dialect.supports(*op) {
                    return Err(Error::UnsupportedOperator(op.to_string()));
                }
                Ok(json!({ field.as_str(): { op.as_str(): value } }))
            }
            Predicate::And { predicates } => Ok(json!({ "and": translate_all(predicates, dialect)? })),
            Predicate::Or { predicates } => Ok(json!({ "or": translate_all(predicates, dialect)? })),
            Predicate::Not { predicates } => {
                let inner = match predicates.as_slice() {
                    [single] => single.translate(dialect)?,
                    many => json!({ "and": translate_all(many, dialect)? }),
                };
                Ok(json!({ "not": inner }))
            }
        }
    }
}

fn translate_all(predicates: &[Predicate], dialect: &FilterDialect) -> Result<Vec<Value>> {
    predicates.iter().map(|p| p.translate(dialect)).collect()
}

/// Builder for a field predicate.
#[derive(Debug, Clone)]
pub struct FieldPredicate {
    field: String,
}

impl FieldPredicate {
    fn make(self, op: Operator, value: impl Into<Value>) -> Predicate {
        Predicate::Field {
            field: self.field,
            op,
            value: value.into(),
        }
    }

    pub fn eq(self, value: impl Into<Value>) -> Predicate {
        self.make(Operator::Eq, value)
    }

    pub fn ne(self, value: impl Into<Value>) -> Predicate {
        self.make(Operator::Ne, value)
    }

    pub fn lt(self, value: impl Into<Value>) -> Predicate {
        self.make(Operator::Lt, value)
    }

    pub fn le(self, value: impl Into<Value>) -> Predicate {
        self.make(Operator::Le, value)
    }

    pub fn gt(self, value: impl Into<Value>) -> Predicate {
        self.make(Operator::Gt, value)
    }

    pub fn ge(self, value: impl Into<Value>) -> Predicate {
        self.make(Operator::Ge, value)
    }

    pub fn is_in(self, value: impl Into<Value>) -> Predicate {
        self.make(Operator::In, value)
    }

    pub fn contains(self, value: impl Into<Value>) -> Predicate {
        self.make(Operator::Contains, value)
    }

    pub fn starts_with(self, value: impl Into<Value>) -> Predicate {
        self.make(Operator::StartsWith, value)
    }

    pub fn ends_with(self, value: impl Into<Value>) -> Predicate {
        self.make(Operator::EndsWith, value)
    }
}

/// Set of operators a remote understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterDialect {
    supported: BTreeSet<Operator>,
}

impl FilterDialect {
    /// Dialect supporting exactly the given operators.
    pub fn new(supported: impl IntoIterator<Item = Operator>) -> Self {
        Self {
            supported: supported.into_iter().collect(),
        }
    }

    /// GraphQLCRUD filters accept every operator.
    pub fn graphql_crud() -> Self {
        Self::new(Operator::ALL)
    }

    pub fn supports(&self, op: Operator) -> bool {
        self.supported.contains(&op)
    }
}

impl Default for FilterDialect {
    fn default() -> Self {
        Self::graphql_crud()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::into_record;

    fn note(value: Value) -> Record {
        into_record(value).unwrap()
    }

    #[test]
    fn comparison_operators() {
        let r = note(json!({"title": "hello", "count": 5, "ratio": 0.5, "done": false}));

        assert!(Predicate::field("title").eq("hello").evaluate(&r));
        assert!(Predicate::field("title").ne("bye").evaluate(&r));
        assert!(Predicate::field("count").eq(5.0).evaluate(&r));
        assert!(Predicate::field("count").lt(6).evaluate(&r));
        assert!(Predicate::field("count").le(5).evaluate(&r));
        assert!(Predicate::field("count").gt(4).evaluate(&r));
        assert!(Predicate::field("ratio").ge(0.5).evaluate(&r));
        assert!(Predicate::field("done").lt(true).evaluate(&r));
        assert!(!Predicate::field("count").gt("4").evaluate(&r));
    }

    #[test]
    fn string_and_collection_operators() {
        let r = note(json!({"title": "hello world", "tags": ["a", "b"], "kind": "b"}));

        assert!(Predicate::field("title").starts_with("hello").evaluate(&r));
        assert!(Predicate::field("title").ends_with("world").evaluate(&r));
        assert!(Predicate::field("title").contains("lo wo").evaluate(&r));
        assert!(Predicate::field("tags").contains("b").evaluate(&r));
        assert!(!Predicate::field("tags").contains("c").evaluate(&r));
        assert!(Predicate::field("kind").is_in(json!(["a", "b"])).evaluate(&r));
        assert!(!Predicate::field("kind").is_in("abc").evaluate(&r));
        assert!(!Predicate::field("kind").is_in(json!(["x"])).evaluate(&r));
    }

    #[test]
    fn missing_field_behaves_as_null() {
        let r = note(json!({"title": "a"}));
        assert!(!Predicate::field("other").eq("a").evaluate(&r));
        assert!(Predicate::field("other").ne("a").evaluate(&r));
        assert!(Predicate::field("other").eq(Value::Null).evaluate(&r));
        assert!(!Predicate::field("other").starts_with("a").evaluate(&r));
    }

    #[test]
    fn composite_identities() {
        let r = note(json!({"title": "a"}));
        assert!(Predicate::and(vec![]).evaluate(&r));
        assert!(!Predicate::or(vec![]).evaluate(&r));
        assert!(!Predicate::not_all(vec![]).evaluate(&r));

        let t = Predicate::field("title").eq("a");
        let f = Predicate::field("title").eq("b");
        assert!(!Predicate::not(t.clone()).evaluate(&r));
        assert!(Predicate::not_all(vec![t.clone(), f.clone()]).evaluate(&r));
        assert!(Predicate::or(vec![f, t]).evaluate(&r));
    }

    #[test]
    fn filter_keeps_matching() {
        let records = vec![
            note(json!({"id": "1", "n": 1})),
            note(json!({"id": "2", "n": 2})),
            note(json!({"id": "3", "n": 3})),
        ];
        let kept = Predicate::field("n").ge(2).filter(&records);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0]["id"], "2");
    }

    #[test]
    fn remote_filter_structure() {
        let predicate = Predicate::and(vec![
            Predicate::field("title").eq("a"),
            Predicate::or(vec![
                Predicate::field("count").gt(1),
                Predicate::not(Predicate::field("done").eq(true)),
            ]),
        ]);

        let filter = predicate
            .to_remote_filter(&FilterDialect::graphql_crud())
            .unwrap();
        assert_eq!(
            filter,
            json!({
                "and": [
                    {"title": {"eq": "a"}},
                    {"or": [
                        {"count": {"gt": 1}},
                        {"not": {"done": {"eq": true}}}
                    ]}
                ]
            })
        );
    }

    #[test]
    fn remote_filter_not_with_many_children() {
        let predicate = Predicate::not_all(vec![
            Predicate::field("a").eq(1),
            Predicate::field("b").eq(2),
        ]);
        let filter = predicate.to_remote_filter(&FilterDialect::default()).unwrap();
        assert_eq!(
            filter,
            json!({"not": {"and": [{"a": {"eq": 1}}, {"b": {"eq": 2}}]}})
        );
    }

    #[test]
    fn remote_filter_rejects_unsupported_operator() {
        let dialect = FilterDialect::new([Operator::Eq, Operator::Ne]);
        let predicate = Predicate::and(vec![
            Predicate::field("title").eq("a"),
            Predicate::field("title").starts_with("a"),
        ]);
        let result = predicate.to_remote_filter(&dialect);
        assert!(matches!(result, Err(Error::UnsupportedOperator(op)) if op == "startsWith"));
    }

    #[test]
    fn empty_field_name_is_invalid() {
        let predicate = Predicate::or(vec![Predicate::field("").eq(1)]);
        assert!(matches!(
            predicate.to_remote_filter(&FilterDialect::default()),
            Err(Error::InvalidPredicate(_))
        ));
    }

    #[test]
    fn in_requires_an_array() {
        let predicate = Predicate::field("kind").is_in("abc");
        assert!(matches!(predicate.validate(), Err(Error::InvalidPredicate(_))));
        assert!(Predicate::field("kind").is_in(json!(["a"])).validate().is_ok());
    }

    #[test]
    fn referenced_fields() {
        let predicate = Predicate::and(vec![
            Predicate::field("a").eq(1),
            Predicate::not(Predicate::field("b").eq(2)),
        ]);
        let fields: Vec<_> = predicate.fields().into_iter().collect();
        assert_eq!(fields, vec!["a", "b"]);
    }

    #[test]
    fn serde_shape() {
        let predicate = Predicate::not(Predicate::field("title").starts_with("x"));
        let value = serde_json::to_value(&predicate).unwrap();
        assert_eq!(value["type"], "not");
        assert_eq!(value["predicates"][0]["op"], "startsWith");
        let back: Predicate = serde_json::from_value(value).unwrap();
        assert_eq!(back, predicate);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_value() -> impl Strategy<Value = Value> {
            prop_oneof![
                (0i64..5).prop_map(Value::from),
                prop::sample::select(vec!["a", "ab", "b", "ba"]).prop_map(Value::from),
                any::<bool>().prop_map(Value::from),
                Just(Value::Null),
            ]
        }

        fn arb_record() -> impl Strategy<Value = Record> {
            (arb_value(), arb_value(), arb_value()).prop_map(|(x, y, z)| {
                let mut r = Record::new();
                r.insert("x".into(), x);
                r.insert("y".into(), y);
                r.insert("z".into(), z);
                r
            })
        }

        fn arb_leaf() -> impl Strategy<Value = Predicate> {
            (
                prop::sample::select(vec!["x", "y", "z", "missing"]),
                prop::sample::select(Operator::ALL.to_vec()),
                arb_value(),
            )
                .prop_map(|(field, op, value)| Predicate::Field {
                    field: field.to_string(),
                    op,
                    value: match op {
                        Operator::In => Value::Array(vec![value]),
                        _ => value,
                    },
                })
        }

        fn arb_predicate() -> impl Strategy<Value = Predicate> {
            arb_leaf().prop_recursive(3, 16, 3, |inner| {
                prop_oneof![
                    prop::collection::vec(inner.clone(), 0..3).prop_map(Predicate::and),
                    prop::collection::vec(inner.clone(), 0..3).prop_map(Predicate::or),
                    prop::collection::vec(inner, 0..3).prop_map(Predicate::not_all),
                ]
            })
        }

        proptest! {
            #[test]
            fn prop_evaluate_is_stable(p in arb_predicate(), r in arb_record()) {
                let first = p.evaluate(&r);
                let second = p.evaluate(&r);
                prop_assert_eq!(first, second);
            }

            #[test]
            fn prop_de_morgan(a in arb_predicate(), b in arb_predicate(), r in arb_record()) {
                let lhs = Predicate::not(Predicate::and(vec![a.clone(), b.clone()]));
                let rhs = Predicate::or(vec![Predicate::not(a), Predicate::not(b)]);
                prop_assert_eq!(lhs.evaluate(&r), rhs.evaluate(&r));
            }

            #[test]
            fn prop_full_dialect_translates(p in arb_predicate()) {
                prop_assert!(p.to_remote_filter(&FilterDialect::graphql_crud()).is_ok());
            }
        }
    }
}
