//! Structured queries over a document collection.
//!
//! Queries are plain data so the remote gateway can receive them as JSON and
//! the in-memory store can evaluate them locally with the same semantics.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use super::Document;
use crate::decode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Dotted field path
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(name: &str) -> Self {
        Query {
            collection: name.to_string(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    fn with_filter(mut self, field: &str, op: FilterOp, value: Value) -> Self {
        self.filters.push(Filter {
            field: field.to_string(),
            op,
            value,
        });
        self
    }

    pub fn where_eq(self, field: &str, value: Value) -> Self {
        self.with_filter(field, FilterOp::Eq, value)
    }

    pub fn where_gt(self, field: &str, value: Value) -> Self {
        self.with_filter(field, FilterOp::Gt, value)
    }

    pub fn where_gte(self, field: &str, value: Value) -> Self {
        self.with_filter(field, FilterOp::Gte, value)
    }

    pub fn where_lte(self, field: &str, value: Value) -> Self {
        self.with_filter(field, FilterOp::Lte, value)
    }

    pub fn order_by(mut self, field: &str) -> Self {
        self.order_by = Some(OrderBy {
            field: field.to_string(),
            descending: false,
        });
        self
    }

    pub fn order_by_desc(mut self, field: &str) -> Self {
        self.order_by = Some(OrderBy {
            field: field.to_string(),
            descending: true,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a document passes every filter. A missing field fails the filter.
    pub fn matches(&self, doc: &Document) -> bool {
        self.filters.iter().all(|f| {
            let Some(actual) = doc.get(&f.field) else {
                return false;
            };
            let ord = || compare_values(actual, &f.value);
            match f.op {
                FilterOp::Eq => values_equal(actual, &f.value),
                FilterOp::Gt => ord() == Some(Ordering::Greater),
                FilterOp::Gte => matches!(ord(), Some(Ordering::Greater | Ordering::Equal)),
                FilterOp::Lt => ord() == Some(Ordering::Less),
                FilterOp::Lte => matches!(ord(), Some(Ordering::Less | Ordering::Equal)),
            }
        })
    }

    /// Filter, order and truncate a collection the way the store would.
    pub fn apply<'a>(&self, docs: impl IntoIterator<Item = &'a Document>) -> Vec<Document> {
        let mut out: Vec<Document> = docs
            .into_iter()
            .filter(|d| self.matches(d))
            .cloned()
            .collect();

        if let Some(order) = &self.order_by {
            // Documents missing the order field sort first, like a null value
            out.sort_by(|a, b| {
                let ord = match (a.get(&order.field), b.get(&order.field)) {
                    (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                    (None, Some(_)) => Ordering::Less,
                    (Some(_), None) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                if order.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }

        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Some(Ordering::Equal),
        _ => match compare_timestamps(a, b) {
            Some(ord) => ord == Ordering::Equal,
            None => a == b,
        },
    }
}

/// Order two field values. Numbers compare numerically; any pair that both
/// decode as timestamps compares chronologically whatever their encodings.
/// Other mixed kinds are incomparable.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => compare_timestamps(a, b).or_else(|| match (a, b) {
            (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
            _ => None,
        }),
    }
}

fn compare_timestamps(a: &Value, b: &Value) -> Option<Ordering> {
    let x = decode::timestamp(Some(a))?;
    let y = decode::timestamp(Some(b))?;
    Some(x.cmp(&y))
}
