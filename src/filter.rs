//! Definition filters.
//!
//! A [`Filter`] carries two forms of the same condition: an optional
//! [`FilterExpr`] that durable stores can push down into their query
//! language, and a compiled predicate evaluated against in-memory values.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Declarative condition over a definition's serialized payload.
///
/// Field paths are dotted (`"trigger.cron"`) and resolved against the JSON
/// form of the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterExpr {
    All,
    Eq { field: String, value: Value },
    Ne { field: String, value: Value },
    Exists { field: String },
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
}

impl FilterExpr {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ne {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Self::Exists {
            field: field.into(),
        }
    }

    /// Evaluate against a JSON document.
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Self::All => true,
            Self::Eq { field, value } => {
                extract_json_path(doc, field).is_some_and(|found| json_eq(found, value))
            }
            Self::Ne { field, value } => {
                !extract_json_path(doc, field).is_some_and(|found| json_eq(found, value))
            }
            Self::Exists { field } => {
                extract_json_path(doc, field).is_some_and(|v| !v.is_null())
            }
            Self::And(exprs) => exprs.iter().all(|e| e.matches(doc)),
            Self::Or(exprs) => exprs.iter().any(|e| e.matches(doc)),
            Self::Not(expr) => !expr.matches(doc),
        }
    }

    /// Every field path referenced by the expression.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::All => {}
            Self::Eq { field, .. } | Self::Ne { field, .. } | Self::Exists { field } => {
                out.push(field)
            }
            Self::And(exprs) | Self::Or(exprs) => {
                for expr in exprs {
                    expr.collect_fields(out);
                }
            }
            Self::Not(expr) => expr.collect_fields(out),
        }
    }
}

/// Structural equality where numbers compare by value, so `1` equals `1.0`
/// the way it does in SurrealQL.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => match (x.as_u64(), y.as_u64()) {
                (Some(x), Some(y)) => x == y,
                _ => x.as_f64() == y.as_f64(),
            },
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| json_eq(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(key, x)| ys.get(key).is_some_and(|y| json_eq(x, y)))
        }
        _ => a == b,
    }
}

/// Resolve a dotted path inside a JSON value. Numeric segments index arrays.
pub fn extract_json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;

    for part in path.split('.') {
        match current {
            Value::Object(map) => {
                current = map.get(part)?;
            }
            Value::Array(arr) => {
                let index = part.parse::<usize>().ok()?;
                current = arr.get(index)?;
            }
            _ => return None,
        }
    }

    Some(current)
}

type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Filter over definitions of type `T`.
pub struct Filter<T> {
    expr: Option<FilterExpr>,
    predicate: Predicate<T>,
}

impl<T> Clone for Filter<T> {
    fn clone(&self) -> Self {
        Self {
            expr: self.expr.clone(),
            predicate: self.predicate.clone(),
        }
    }
}

impl<T> fmt::Debug for Filter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter").field("expr", &self.expr).finish_non_exhaustive()
    }
}

impl<T: Serialize + 'static> Filter<T> {
    /// Build a filter from an expression. The compiled predicate evaluates
    /// the same expression against the serialized value.
    pub fn from_expr(expr: FilterExpr) -> Self {
        let compiled = expr.clone();
        Self {
            expr: Some(expr),
            predicate: Arc::new(move |value: &T| {
                serde_json::to_value(value)
                    .map(|doc| compiled.matches(&doc))
                    .unwrap_or(false)
            }),
        }
    }

    pub fn all() -> Self {
        Self::from_expr(FilterExpr::All)
    }
}

impl<T: 'static> Filter<T> {
    /// Filter that only exists as code. Durable stores cannot push it down
    /// and evaluate it after loading candidates.
    pub fn predicate(predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self {
            expr: None,
            predicate: Arc::new(predicate),
        }
    }

    pub fn expr(&self) -> Option<&FilterExpr> {
        self.expr.as_ref()
    }

    pub fn matches(&self, value: &T) -> bool {
        (self.predicate)(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct Doc {
        name: String,
        nested: Nested,
    }

    #[derive(Serialize)]
    struct Nested {
        enabled: bool,
        tags: Vec<String>,
    }

    fn doc(name: &str, enabled: bool) -> Doc {
        Doc {
            name: name.to_string(),
            nested: Nested {
                enabled,
                tags: vec!["a".to_string(), "b".to_string()],
            },
        }
    }

    #[test]
    fn test_extract_json_path() {
        let value = json!({"a": {"b": [10, {"c": "x"}]}});
        assert_eq!(extract_json_path(&value, "a.b.0"), Some(&json!(10)));
        assert_eq!(extract_json_path(&value, "a.b.1.c"), Some(&json!("x")));
        assert_eq!(extract_json_path(&value, "a.z"), None);
        assert_eq!(extract_json_path(&value, "a.b.x"), None);
    }

    #[test]
    fn test_expr_matching() {
        let value = json!({"name": "nightly", "nested": {"enabled": true}});

        assert!(FilterExpr::eq("name", "nightly").matches(&value));
        assert!(!FilterExpr::eq("name", "hourly").matches(&value));
        assert!(FilterExpr::ne("name", "hourly").matches(&value));
        assert!(FilterExpr::exists("nested.enabled").matches(&value));
        assert!(!FilterExpr::exists("nested.missing").matches(&value));

        let both = FilterExpr::And(vec![
            FilterExpr::eq("name", "nightly"),
            FilterExpr::eq("nested.enabled", true),
        ]);
        assert!(both.matches(&value));
        assert!(!FilterExpr::Not(Box::new(both)).matches(&value));

        let either = FilterExpr::Or(vec![
            FilterExpr::eq("name", "hourly"),
            FilterExpr::eq("nested.enabled", true),
        ]);
        assert!(either.matches(&value));
    }

    #[test]
    fn test_compiled_predicate_follows_expr() {
        let filter = Filter::<Doc>::from_expr(FilterExpr::eq("nested.enabled", true));

        assert!(filter.matches(&doc("x", true)));
        assert!(!filter.matches(&doc("x", false)));
        assert!(filter.expr().is_some());
    }

    #[test]
    fn test_code_only_predicate() {
        let filter = Filter::<Doc>::predicate(|d| d.name.starts_with("n"));

        assert!(filter.matches(&doc("nightly", false)));
        assert!(!filter.matches(&doc("hourly", false)));
        assert!(filter.expr().is_none());
    }

    #[test]
    fn test_numbers_compare_by_value() {
        let value = json!({"retries": 1, "limits": {"max": [2, 3.5]}});

        assert!(FilterExpr::eq("retries", 1.0).matches(&value));
        assert!(!FilterExpr::ne("retries", 1.0).matches(&value));
        assert!(FilterExpr::ne("retries", 1.5).matches(&value));
        assert!(FilterExpr::eq("limits", json!({"max": [2.0, 3.5]})).matches(&value));
        assert!(FilterExpr::ne("missing", 1).matches(&value));
        assert!(!FilterExpr::eq("retries", "1").matches(&value));
    }

    #[test]
    fn test_fields() {
        let expr = FilterExpr::And(vec![
            FilterExpr::eq("a", 1),
            FilterExpr::Not(Box::new(FilterExpr::exists("b.c"))),
        ]);
        assert_eq!(expr.fields(), vec!["a", "b.c"]);
    }
}
