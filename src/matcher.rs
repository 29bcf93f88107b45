//! Rule matching.
//!
//! [`Matcher`] is the seam the dispatcher depends on; [`StubStore`] is the
//! in-memory implementation every endpoint gets by default.

use crate::codec::{bytes_from_text, integer_from_text};
use crate::error::MatchError;
use crate::rule::{PayloadMatch, Query, Rule};
use crate::value::{GenericValue, Payload};
use regex::Regex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Stores rules and answers queries.
///
/// Implementations must tolerate concurrent lookups from in-flight calls
/// alongside concurrent `submit`/`clear_all`.
pub trait Matcher: Send + Sync {
    /// Store a rule.
    fn submit(&self, rule: Rule) -> Result<(), MatchError>;

    /// Remove every stored rule.
    fn clear_all(&self);

    /// The single best rule for `query`, if any.
    fn find_best_match(&self, query: &Query) -> Result<Option<Arc<Rule>>, MatchError>;

    /// Number of stored rules.
    fn rule_count(&self) -> usize;
}

/// In-memory rule store.
///
/// Among rules for the query's service and method whose headers are
/// satisfied, `equals` rules win over `matches` rules, then the rule with
/// more constrained fields wins, then the earliest registered.
#[derive(Debug, Default)]
pub struct StubStore {
    rules: RwLock<Vec<StoredRule>>,
}

/// A rule with the regexes for its partial string constraints, keyed by
/// the rule string they came from.
#[derive(Debug)]
struct StoredRule {
    rule: Arc<Rule>,
    patterns: Patterns,
}

type Patterns = HashMap<String, Regex>;

impl StoredRule {
    fn new(rule: Rule) -> Self {
        let mut patterns = Patterns::new();
        if let PayloadMatch::Matches(expected) = &rule.input.payload {
            for value in expected.values() {
                compile_patterns(value, &mut patterns);
            }
        }
        Self {
            rule: Arc::new(rule),
            patterns,
        }
    }
}

/// Strings that are not valid regexes get no entry and match by equality
/// only.
fn compile_patterns(value: &GenericValue, patterns: &mut Patterns) {
    match value {
        GenericValue::String(pattern) if !patterns.contains_key(pattern) => {
            if let Ok(regex) = Regex::new(&format!("^(?:{pattern})$")) {
                patterns.insert(pattern.clone(), regex);
            }
        }
        GenericValue::List(items) => {
            for item in items {
                compile_patterns(item, patterns);
            }
        }
        GenericValue::Map(map) => {
            for item in map.values() {
                compile_patterns(item, patterns);
            }
        }
        _ => {}
    }
}

impl StubStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Matcher for StubStore {
    fn submit(&self, rule: Rule) -> Result<(), MatchError> {
        if rule.service.is_empty() {
            return Err(MatchError::InvalidRule("service is empty".to_string()));
        }
        if rule.method.is_empty() {
            return Err(MatchError::InvalidRule("method is empty".to_string()));
        }

        let stored = StoredRule::new(rule);
        let mut rules = self.rules.write().map_err(|_| MatchError::Poisoned)?;
        debug!(
            service = %stored.rule.service,
            method = %stored.rule.method,
            exact = stored.rule.input.payload.is_exact(),
            patterns = stored.patterns.len(),
            "Rule stored"
        );
        rules.push(stored);
        Ok(())
    }

    fn clear_all(&self) {
        // Clearing is also how a poisoned store recovers.
        let mut rules = match self.rules.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        debug!(count = rules.len(), "Rules cleared");
        rules.clear();
    }

    fn find_best_match(&self, query: &Query) -> Result<Option<Arc<Rule>>, MatchError> {
        let rules = self.rules.read().map_err(|_| MatchError::Poisoned)?;

        let best = rules
            .iter()
            .enumerate()
            .filter(|(_, s)| s.rule.service == query.service && s.rule.method == query.method)
            .filter(|(_, s)| headers_match(&s.rule.input.headers, query.headers.as_ref()))
            .filter(|(_, s)| payload_matches(s, &query.payload))
            .max_by_key(|(idx, s)| {
                (
                    s.rule.input.payload.is_exact(),
                    constraint_count(s.rule.input.payload.payload()) + s.rule.input.headers.len(),
                    Reverse(*idx),
                )
            })
            .map(|(_, s)| Arc::clone(&s.rule));

        Ok(best)
    }

    fn rule_count(&self) -> usize {
        match self.rules.read() {
            Ok(rules) => rules.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

fn headers_match(expected: &BTreeMap<String, String>, actual: Option<&BTreeMap<String, String>>) -> bool {
    if expected.is_empty() {
        return true;
    }
    let Some(actual) = actual else {
        return false;
    };
    // Metadata keys arrive lowercase
    expected
        .iter()
        .all(|(name, value)| actual.get(&name.to_lowercase()) == Some(value))
}

fn payload_matches(stored: &StoredRule, query: &Payload) -> bool {
    match &stored.rule.input.payload {
        PayloadMatch::Equals(expected) => maps_equal(expected, query),
        PayloadMatch::Matches(expected) => map_contains(expected, query, &stored.patterns),
    }
}

/// Proto3 drops default-valued fields on the wire, so a field missing on
/// one side equals a zero value on the other.
fn is_zero(value: &GenericValue) -> bool {
    match value {
        GenericValue::Null => true,
        GenericValue::Bool(b) => !b,
        GenericValue::Int(i) => *i == 0,
        GenericValue::Uint(u) => *u == 0,
        GenericValue::Float(f) => *f == 0.0,
        GenericValue::String(s) => s.is_empty(),
        GenericValue::Bytes(b) => b.is_empty(),
        GenericValue::List(l) => l.is_empty(),
        GenericValue::Map(m) => m.is_empty(),
    }
}

fn maps_equal(expected: &Payload, actual: &Payload) -> bool {
    let keys_match = |a: &Payload, b: &Payload| {
        a.iter().all(|(key, value)| match b.get(key) {
            Some(other) => values_equal(value, other),
            None => is_zero(value),
        })
    };
    keys_match(expected, actual) && keys_match(actual, expected)
}

fn values_equal(expected: &GenericValue, actual: &GenericValue) -> bool {
    match (expected, actual) {
        (GenericValue::Map(e), GenericValue::Map(a)) => maps_equal(e, a),
        (GenericValue::List(e), GenericValue::List(a)) => {
            e.len() == a.len() && e.iter().zip(a).all(|(x, y)| values_equal(x, y))
        }
        (GenericValue::String(text), other) | (other, GenericValue::String(text))
            if !matches!(other, GenericValue::String(_)) =>
        {
            text_form_equal(text, other)
        }
        (e, a) => e == a,
    }
}

fn map_contains(expected: &Payload, actual: &Payload, patterns: &Patterns) -> bool {
    expected.iter().all(|(key, value)| match actual.get(key) {
        Some(other) => value_contains(value, other, patterns),
        None => is_zero(value),
    })
}

fn value_contains(expected: &GenericValue, actual: &GenericValue, patterns: &Patterns) -> bool {
    match (expected, actual) {
        (GenericValue::Map(e), GenericValue::Map(a)) => map_contains(e, a, patterns),
        (GenericValue::List(e), GenericValue::List(a)) => {
            e.len() == a.len() && e.iter().zip(a).all(|(x, y)| value_contains(x, y, patterns))
        }
        (GenericValue::String(pattern), GenericValue::String(s)) => {
            pattern == s || patterns.get(pattern).is_some_and(|regex| regex.is_match(s))
        }
        (GenericValue::String(text), other) => text_form_equal(text, other),
        (e, a) => e == a,
    }
}

/// Rules written in JSON carry bytes as base64 and 64-bit integers as
/// decimal strings, the same forms encoding accepts.
fn text_form_equal(text: &str, other: &GenericValue) -> bool {
    match other {
        GenericValue::Bytes(bytes) => bytes_from_text(text).is_some_and(|b| b == *bytes),
        GenericValue::Int(n) => integer_from_text(text) == Some(i128::from(*n)),
        GenericValue::Uint(n) => integer_from_text(text) == Some(i128::from(*n)),
        _ => false,
    }
}

/// Number of leaf constraints in a payload, used to rank rules.
fn constraint_count(payload: &Payload) -> usize {
    payload
        .values()
        .map(|value| match value {
            GenericValue::Map(m) => constraint_count(m).max(1),
            _ => 1,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{RuleInput, RuleOutput};
    use serde_json::json;

    fn payload(json: serde_json::Value) -> Payload {
        GenericValue::from(json).into_map().unwrap()
    }

    fn query(data: serde_json::Value) -> Query {
        Query {
            service: "helloworld.Greeter".to_string(),
            method: "SayHello".to_string(),
            payload: payload(data),
            headers: None,
        }
    }

    fn rule(input: RuleInput, reply: &str) -> Rule {
        Rule::new(
            "helloworld.Greeter",
            "SayHello",
            input,
            RuleOutput::data(payload(json!({ "reply": reply }))),
        )
    }

    fn reply_of(rule: &Rule) -> &str {
        match &rule.output {
            RuleOutput::Data { payload, .. } => payload["reply"].as_str().unwrap(),
            RuleOutput::Error { message, .. } => message,
        }
    }

    #[test]
    fn test_exact_matching() {
        let store = StubStore::new();
        store
            .submit(rule(RuleInput::equals(payload(json!({"name": "world"}))), "hi"))
            .unwrap();

        let found = store.find_best_match(&query(json!({"name": "world"}))).unwrap();
        assert_eq!(reply_of(&found.unwrap()), "hi");

        let found = store.find_best_match(&query(json!({"name": "other"}))).unwrap();
        assert!(found.is_none());

        // Exact means no extra fields
        let found = store
            .find_best_match(&query(json!({"name": "world", "age": 3})))
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_zero_values_match_missing_fields() {
        let store = StubStore::new();
        store
            .submit(rule(RuleInput::equals(payload(json!({"name": "world"}))), "hi"))
            .unwrap();

        // Decoded requests always carry repeated fields, even when empty
        let found = store
            .find_best_match(&query(json!({"name": "world", "tags": []})))
            .unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn test_partial_matching() {
        let store = StubStore::new();
        store
            .submit(rule(RuleInput::matches(payload(json!({"name": "world"}))), "hi"))
            .unwrap();

        let found = store
            .find_best_match(&query(json!({"name": "world", "age": 3})))
            .unwrap();
        assert!(found.is_some());

        let found = store.find_best_match(&query(json!({"age": 3}))).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_partial_regex() {
        let store = StubStore::new();
        store
            .submit(rule(RuleInput::matches(payload(json!({"name": "wor.*"}))), "hi"))
            .unwrap();

        assert!(store
            .find_best_match(&query(json!({"name": "world"})))
            .unwrap()
            .is_some());
        assert!(store
            .find_best_match(&query(json!({"name": "hello world"})))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_patterns_compiled_on_submit() {
        let store = StubStore::new();
        store
            .submit(rule(
                RuleInput::matches(payload(json!({"name": "wor.*", "tags": ["a+", "("]}))),
                "hi",
            ))
            .unwrap();
        store
            .submit(rule(RuleInput::equals(payload(json!({"name": "wor.*"}))), "exact"))
            .unwrap();

        {
            let rules = store.rules.read().unwrap();
            let patterns = &rules[0].patterns;
            assert!(patterns.contains_key("wor.*"));
            assert!(patterns.contains_key("a+"));
            // Invalid regex gets no entry
            assert!(!patterns.contains_key("("));
            // Exact rules never use regexes
            assert!(rules[1].patterns.is_empty());
        }

        let found = store
            .find_best_match(&query(json!({"name": "world", "tags": ["aaa", "("]})))
            .unwrap();
        assert_eq!(reply_of(&found.unwrap()), "hi");

        let found = store
            .find_best_match(&query(json!({"name": "world", "tags": ["aaa", "(("]})))
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_text_forms_of_bytes_and_64_bit_integers() {
        let store = StubStore::new();
        store
            .submit(rule(
                RuleInput::equals(payload(json!({"blob": "aGk=", "name": "a"}))),
                "bytes",
            ))
            .unwrap();
        store
            .submit(rule(RuleInput::matches(payload(json!({"i64": "9000000000"}))), "int"))
            .unwrap();
        store
            .submit(rule(RuleInput::matches(payload(json!({"u64": "18446744073709551615"}))), "uint"))
            .unwrap();

        let mut q = query(json!({"name": "a"}));
        q.payload.insert("blob".to_string(), GenericValue::Bytes(b"hi".to_vec()));
        assert_eq!(reply_of(&store.find_best_match(&q).unwrap().unwrap()), "bytes");

        q.payload.insert("blob".to_string(), GenericValue::Bytes(b"ho".to_vec()));
        assert!(store.find_best_match(&q).unwrap().is_none());

        let mut q = query(json!({}));
        q.payload.insert("i64".to_string(), GenericValue::Int(9_000_000_000));
        assert_eq!(reply_of(&store.find_best_match(&q).unwrap().unwrap()), "int");

        q.payload.insert("i64".to_string(), GenericValue::Int(9_000_000_001));
        assert!(store.find_best_match(&q).unwrap().is_none());

        let mut q = query(json!({}));
        q.payload.insert("u64".to_string(), GenericValue::Uint(u64::MAX));
        assert_eq!(reply_of(&store.find_best_match(&q).unwrap().unwrap()), "uint");
    }

    #[test]
    fn test_nested_partial() {
        let store = StubStore::new();
        store
            .submit(rule(
                RuleInput::matches(payload(json!({"user": {"id": 7}}))),
                "nested",
            ))
            .unwrap();

        let found = store
            .find_best_match(&query(json!({"user": {"id": 7, "name": "ada"}})))
            .unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn test_ranking() {
        let store = StubStore::new();
        store
            .submit(rule(RuleInput::matches(Payload::new()), "catch-all"))
            .unwrap();
        store
            .submit(rule(RuleInput::matches(payload(json!({"name": "world"}))), "partial"))
            .unwrap();
        store
            .submit(rule(RuleInput::matches(payload(json!({"name": "world"}))), "later"))
            .unwrap();
        store
            .submit(rule(RuleInput::equals(payload(json!({"name": "world"}))), "exact"))
            .unwrap();

        let best = store
            .find_best_match(&query(json!({"name": "world"})))
            .unwrap()
            .unwrap();
        assert_eq!(reply_of(&best), "exact");

        let best = store
            .find_best_match(&query(json!({"name": "world", "age": 1})))
            .unwrap()
            .unwrap();
        assert_eq!(reply_of(&best), "partial");

        let best = store
            .find_best_match(&query(json!({"name": "other"})))
            .unwrap()
            .unwrap();
        assert_eq!(reply_of(&best), "catch-all");
    }

    #[test]
    fn test_header_constraints() {
        let store = StubStore::new();
        store
            .submit(rule(
                RuleInput::matches(Payload::new()).with_header("X-Tenant", "acme"),
                "acme",
            ))
            .unwrap();

        let mut q = query(json!({}));
        assert!(store.find_best_match(&q).unwrap().is_none());

        q.headers = Some(BTreeMap::from([("x-tenant".to_string(), "acme".to_string())]));
        assert!(store.find_best_match(&q).unwrap().is_some());
    }

    #[test]
    fn test_service_and_method_must_match() {
        let store = StubStore::new();
        store
            .submit(rule(RuleInput::matches(Payload::new()), "hi"))
            .unwrap();

        let mut q = query(json!({}));
        q.method = "SayGoodbye".to_string();
        assert!(store.find_best_match(&q).unwrap().is_none());
    }

    #[test]
    fn test_invalid_rule_rejected() {
        let store = StubStore::new();
        let err = store
            .submit(Rule::new("", "SayHello", RuleInput::default(), RuleOutput::default()))
            .unwrap_err();
        assert!(matches!(err, MatchError::InvalidRule(_)));
        assert_eq!(store.rule_count(), 0);
    }

    #[test]
    fn test_clear_all() {
        let store = StubStore::new();
        store
            .submit(rule(RuleInput::default(), "hi"))
            .unwrap();
        assert_eq!(store.rule_count(), 1);
        store.clear_all();
        assert_eq!(store.rule_count(), 0);
        assert!(store.find_best_match(&query(json!({}))).unwrap().is_none());
    }

    #[test]
    fn test_concurrent_submit_and_lookup() {
        let store = Arc::new(StubStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .submit(rule(
                            RuleInput::equals(payload(json!({ "name": format!("n{i}") }))),
                            "hi",
                        ))
                        .unwrap();
                    store.find_best_match(&query(json!({"name": "n0"}))).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.rule_count(), 8);
    }
}
