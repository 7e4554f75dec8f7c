//! Per-endpoint predicate engine.
//!
//! Filters decide whether a specific event instance produces a delivery
//! for an endpoint. Each rule extracts a value at a field path from the
//! event payload and applies a typed operator; rule contributions are
//! combined under the endpoint's conjunction policy.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How multiple rules on one endpoint are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterConjunction {
    /// Every rule must evaluate to "include".
    All,
    /// At least one rule must evaluate to "include".
    Any,
}

/// Typed filter operator.
///
/// Carrying the comparison value inside the variant keeps rule evaluation
/// an exhaustive match instead of a stringly-typed dictionary lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum FilterOperator {
    Equals(Value),
    NotEquals(Value),
    /// Substring match for strings, element match for arrays.
    Contains(Value),
    GreaterThan(f64),
    LessThan(f64),
    /// Membership in a value set.
    In(Vec<Value>),
    /// Regex match against a string field.
    Regex(String),
    Exists,
    NotExists,
}

/// A single predicate attached to an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    /// Dotted path into the event payload; numeric segments index arrays,
    /// e.g. `lines.0.amount`.
    pub field_path: String,

    pub operator: FilterOperator,

    /// When true, a match means "include this event"; when false, a match
    /// means "exclude it".
    pub include_on_match: bool,
}

impl FilterRule {
    pub fn new(field_path: impl Into<String>, operator: FilterOperator) -> Self {
        Self {
            field_path: field_path.into(),
            operator,
            include_on_match: true,
        }
    }

    pub fn excluding(mut self) -> Self {
        self.include_on_match = false;
        self
    }
}

/// Walk a dotted path through a JSON value. Numeric segments index arrays.
pub fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = payload;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Evaluate one rule's operator against the payload.
///
/// Missing fields: `Exists` -> false, `NotExists` -> true, everything
/// else -> false.
fn operator_matches(operator: &FilterOperator, field: Option<&Value>) -> bool {
    let Some(value) = field else {
        return matches!(operator, FilterOperator::NotExists);
    };

    match operator {
        FilterOperator::Equals(expected) => value == expected,
        FilterOperator::NotEquals(expected) => value != expected,
        FilterOperator::Contains(needle) => match (value, needle) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), needle) => items.contains(needle),
            _ => false,
        },
        FilterOperator::GreaterThan(threshold) => {
            value.as_f64().map_or(false, |n| n > *threshold)
        }
        FilterOperator::LessThan(threshold) => value.as_f64().map_or(false, |n| n < *threshold),
        FilterOperator::In(candidates) => candidates.contains(value),
        FilterOperator::Regex(pattern) => match (value.as_str(), regex::Regex::new(pattern)) {
            (Some(s), Ok(re)) => re.is_match(s),
            _ => false,
        },
        FilterOperator::Exists => true,
        FilterOperator::NotExists => false,
    }
}

/// A rule's contribution to the endpoint decision: does this rule vote to
/// include the event?
fn rule_includes(rule: &FilterRule, payload: &Value) -> bool {
    let matched = operator_matches(&rule.operator, lookup(payload, &rule.field_path));
    if rule.include_on_match {
        matched
    } else {
        !matched
    }
}

/// Decide whether an event payload should produce a delivery.
///
/// The endpoint receives the event iff filtering is disabled, there are no
/// rules, or the rule contributions combine to "include" under the
/// conjunction policy.
pub fn matches(
    enabled: bool,
    rules: &[FilterRule],
    conjunction: FilterConjunction,
    payload: &Value,
) -> bool {
    if !enabled || rules.is_empty() {
        return true;
    }

    match conjunction {
        FilterConjunction::All => rules.iter().all(|rule| rule_includes(rule, payload)),
        FilterConjunction::Any => rules.iter().any(|rule| rule_includes(rule, payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Value {
        json!({
            "status": "vip",
            "amount": 120.5,
            "customer": { "id": 42, "email": "a@b.com" },
            "tags": ["fiber", "business"],
            "lines": [{ "amount": 10 }, { "amount": 20 }],
        })
    }

    #[test]
    fn lookup_walks_nested_objects_and_arrays() {
        let p = payload();
        assert_eq!(lookup(&p, "customer.id"), Some(&json!(42)));
        assert_eq!(lookup(&p, "lines.1.amount"), Some(&json!(20)));
        assert_eq!(lookup(&p, "customer.missing"), None);
        assert_eq!(lookup(&p, "lines.7.amount"), None);
        assert_eq!(lookup(&p, "status.nested"), None);
    }

    #[test]
    fn equals_and_not_equals() {
        let p = payload();
        let rule = FilterRule::new("status", FilterOperator::Equals(json!("vip")));
        assert!(rule_includes(&rule, &p));

        let rule = FilterRule::new("status", FilterOperator::NotEquals(json!("regular")));
        assert!(rule_includes(&rule, &p));
    }

    #[test]
    fn contains_on_strings_and_arrays() {
        let p = payload();
        let rule = FilterRule::new("customer.email", FilterOperator::Contains(json!("@b.")));
        assert!(rule_includes(&rule, &p));

        let rule = FilterRule::new("tags", FilterOperator::Contains(json!("fiber")));
        assert!(rule_includes(&rule, &p));

        let rule = FilterRule::new("amount", FilterOperator::Contains(json!("1")));
        assert!(!rule_includes(&rule, &p));
    }

    #[test]
    fn numeric_comparisons() {
        let p = payload();
        assert!(rule_includes(
            &FilterRule::new("amount", FilterOperator::GreaterThan(100.0)),
            &p
        ));
        assert!(rule_includes(
            &FilterRule::new("amount", FilterOperator::LessThan(121.0)),
            &p
        ));
        assert!(!rule_includes(
            &FilterRule::new("status", FilterOperator::GreaterThan(1.0)),
            &p
        ));
    }

    #[test]
    fn in_and_regex() {
        let p = payload();
        assert!(rule_includes(
            &FilterRule::new("status", FilterOperator::In(vec![json!("vip"), json!("gold")])),
            &p
        ));
        assert!(rule_includes(
            &FilterRule::new("customer.email", FilterOperator::Regex("^[a-z]+@".into())),
            &p
        ));
        assert!(!rule_includes(
            &FilterRule::new("customer.email", FilterOperator::Regex("^[0-9]+".into())),
            &p
        ));
    }

    #[test]
    fn missing_field_semantics() {
        let p = payload();
        // Any operator other than NotExists is a non-match on a missing field.
        assert!(!rule_includes(
            &FilterRule::new("missing", FilterOperator::Equals(json!("x"))),
            &p
        ));
        assert!(!rule_includes(
            &FilterRule::new("missing", FilterOperator::Exists),
            &p
        ));
        assert!(rule_includes(
            &FilterRule::new("missing", FilterOperator::NotExists),
            &p
        ));
    }

    #[test]
    fn include_on_match_inverts_contribution() {
        let p = payload();
        let rule = FilterRule::new("status", FilterOperator::Equals(json!("vip"))).excluding();
        assert!(!rule_includes(&rule, &p));

        let rule = FilterRule::new("status", FilterOperator::Equals(json!("regular"))).excluding();
        assert!(rule_includes(&rule, &p));
    }

    #[test]
    fn conjunction_policies() {
        let p = payload();
        let hit = FilterRule::new("status", FilterOperator::Equals(json!("vip")));
        let miss = FilterRule::new("status", FilterOperator::Equals(json!("regular")));

        let rules = vec![hit.clone(), miss.clone()];
        assert!(!matches(true, &rules, FilterConjunction::All, &p));
        assert!(matches(true, &rules, FilterConjunction::Any, &p));

        let rules = vec![hit.clone(), hit];
        assert!(matches(true, &rules, FilterConjunction::All, &p));
    }

    #[test]
    fn disabled_or_empty_filters_always_match() {
        let p = payload();
        let miss = FilterRule::new("status", FilterOperator::Equals(json!("regular")));
        assert!(matches(false, &[miss], FilterConjunction::All, &p));
        assert!(matches(true, &[], FilterConjunction::All, &p));
    }
}
