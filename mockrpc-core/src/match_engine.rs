//! Match/Select Engine: picks one response option from a rule document for a
//! given request, following the four-step algorithm —
//!
//! 1. If the rule is absent or has no response options, return the engine's
//!    built-in default (`{}` body, `grpc-status: 0` trailer).
//! 2. If the document has a top-level `match`, evaluate its `metadata` and
//!    `request` subpredicates. On failure, pick the highest-priority
//!    response option with no `when` clause (ties broken by declaration
//!    order).
//! 3. Otherwise, among options whose `when` evaluates true (an absent `when`
//!    always counts as matching), pick the highest-priority one (ties broken
//!    by declaration order). If none match, fall back to the highest-priority
//!    option with no `when`.
//! 4. If no option can be selected at all, return the built-in default.

use crate::rules::{Leaf, Predicate, ResponseOption, RuleDocument, TopLevelMatch};
use crate::value::Value;

/// Request metadata: stored case-preserving, looked up case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    pub fn new() -> Self {
        Metadata::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)).map(|(_, v)| v.as_str())
    }

    fn as_value(&self) -> Value {
        let mut map = std::collections::BTreeMap::new();
        for (k, v) in &self.entries {
            map.insert(k.clone(), Value::String(v.clone()));
        }
        Value::Map(map)
    }
}

/// The engine's built-in default, selected when no rule document or no
/// response option applies.
pub struct SelectedResponse<'a> {
    pub option: Option<&'a ResponseOption>,
}

impl<'a> SelectedResponse<'a> {
    fn builtin_default() -> Self {
        SelectedResponse { option: None }
    }

    fn from_option(option: &'a ResponseOption) -> Self {
        SelectedResponse { option: Some(option) }
    }
}

/// Selects a response for `request`/`metadata` against an optional rule
/// document. `doc` is `None` when no rule document exists for the method at
/// all, which is handled identically to an empty `responses` list.
pub fn select<'a>(doc: Option<&'a RuleDocument>, request: &Value, metadata: &Metadata) -> SelectedResponse<'a> {
    let Some(doc) = doc else {
        return SelectedResponse::builtin_default();
    };

    // Step 1.
    if doc.responses.is_empty() {
        return SelectedResponse::builtin_default();
    }

    // Step 2: top-level match gate.
    if let Some(top) = &doc.top_level_match {
        if !top_level_matches(top, request, metadata) {
            return highest_priority_without_when(&doc.responses)
                .map(SelectedResponse::from_option)
                .unwrap_or_else(SelectedResponse::builtin_default);
        }
    }

    // Step 3: conditional selection among matching `when` clauses.
    let mut candidates: Vec<(usize, &ResponseOption)> = doc
        .responses
        .iter()
        .enumerate()
        .filter(|(_, r)| match &r.when {
            None => true,
            Some(pred) => eval_predicate(pred, request, metadata),
        })
        .collect();
    candidates.sort_by(|(idx_a, a), (idx_b, b)| b.priority.cmp(&a.priority).then(idx_a.cmp(idx_b)));

    if let Some((_, picked)) = candidates.into_iter().next() {
        return SelectedResponse::from_option(picked);
    }

    // No conditional matched: fall back to the highest-priority option with
    // no `when` clause.
    highest_priority_without_when(&doc.responses)
        .map(SelectedResponse::from_option)
        .unwrap_or_else(SelectedResponse::builtin_default)
}

fn highest_priority_without_when(responses: &[ResponseOption]) -> Option<&ResponseOption> {
    responses
        .iter()
        .enumerate()
        .filter(|(_, r)| r.when.is_none())
        .max_by(|(idx_a, a), (idx_b, b)| a.priority.cmp(&b.priority).then(idx_b.cmp(idx_a)))
        .map(|(_, r)| r)
}

fn top_level_matches(top: &TopLevelMatch, request: &Value, metadata: &Metadata) -> bool {
    if let Some(p) = &top.metadata {
        if !eval_predicate(p, &metadata.as_value(), metadata) {
            return false;
        }
    }
    if let Some(p) = &top.request {
        if !eval_predicate(p, request, metadata) {
            return false;
        }
    }
    true
}

/// Evaluates every condition of a predicate (AND semantics) against a root
/// value. `request`/`metadata` are both supplied so that a path can be
/// resolved whichever subject the caller is evaluating (the root passed in
/// as `subject` IS the thing being matched against; `metadata` additionally
/// backs `metadata.*`-prefixed paths that may appear inside a `request`
/// predicate, though this is rarely used).
fn eval_predicate(predicate: &Predicate, subject: &Value, metadata: &Metadata) -> bool {
    predicate.conditions.iter().all(|(path, leaf)| {
        let resolved = resolve_path(path, subject, metadata);
        eval_leaf(leaf, resolved.as_ref())
    })
}

fn resolve_path(path: &str, subject: &Value, metadata: &Metadata) -> Option<Value> {
    if let Some(rest) = path.strip_prefix("request.") {
        return subject.get_path(rest).cloned();
    }
    if let Some(rest) = path.strip_prefix("metadata.") {
        return metadata.get(rest).map(|s| Value::String(s.to_string()));
    }
    subject.get_path(path).cloned()
}

fn eval_leaf(leaf: &Leaf, actual: Option<&Value>) -> bool {
    match leaf {
        Leaf::Eq(expected) => actual.map(|a| values_loosely_equal(a, expected)).unwrap_or(expected.is_null()),
        Leaf::Ne(expected) => !actual.map(|a| values_loosely_equal(a, expected)).unwrap_or(expected.is_null()),
        Leaf::Gt(n) => actual.and_then(Value::as_f64).map(|a| a > *n).unwrap_or(false),
        Leaf::Gte(n) => actual.and_then(Value::as_f64).map(|a| a >= *n).unwrap_or(false),
        Leaf::Lt(n) => actual.and_then(Value::as_f64).map(|a| a < *n).unwrap_or(false),
        Leaf::Lte(n) => actual.and_then(Value::as_f64).map(|a| a <= *n).unwrap_or(false),
        Leaf::In(items) => {
            let Some(actual) = actual else { return false };
            let needle = actual.coerce_string();
            items.iter().any(|v| v.coerce_string() == needle)
        }
        Leaf::Contains(expected) => {
            let Some(actual) = actual else { return false };
            match actual {
                Value::List(items) => items.iter().any(|v| values_loosely_equal(v, expected)),
                Value::String(s) => s.contains(&expected.coerce_string()),
                _ => false,
            }
        }
        Leaf::Regex(pattern) => {
            let Some(actual) = actual else { return false };
            regex::Regex::new(pattern).map(|re| re.is_match(&actual.coerce_string())).unwrap_or(false)
        }
        Leaf::Exists(expect_present) => {
            let present = actual.map(|v| !v.is_null()).unwrap_or(false);
            present == *expect_present
        }
        Leaf::Not(inner) => !eval_leaf(inner, actual),
    }
}

fn values_loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x == y,
        _ => a.coerce_string() == b.coerce_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;

    fn req(fields: Vec<(&str, Value)>) -> Value {
        let mut m = Map::new();
        for (k, v) in fields {
            m.insert(k.to_string(), v);
        }
        Value::Map(m)
    }

    fn predicate(path: &str, leaf: Leaf) -> Predicate {
        Predicate { conditions: vec![(path.to_string(), leaf)] }
    }

    fn response(when: Option<Predicate>, priority: i64, tag: &str) -> ResponseOption {
        ResponseOption {
            when,
            priority,
            body: Some(serde_yaml::Value::String(tag.to_string())),
            trailers: Default::default(),
            stream_items: None,
            stream_delay_ms: None,
            stream_loop: false,
        }
    }

    fn tag(opt: &ResponseOption) -> &str {
        opt.body.as_ref().unwrap().as_str().unwrap()
    }

    #[test]
    fn empty_responses_yields_builtin_default() {
        let doc = RuleDocument { method: "a.b.c".into(), top_level_match: None, responses: vec![] };
        let picked = select(Some(&doc), &req(vec![]), &Metadata::new());
        assert!(picked.option.is_none());
    }

    #[test]
    fn picks_highest_priority_matching_when() {
        let doc = RuleDocument {
            method: "a.b.c".into(),
            top_level_match: None,
            responses: vec![
                response(Some(predicate("request.name", Leaf::Eq(Value::String("x".into())))), 1, "FIRST"),
                response(Some(predicate("request.name", Leaf::Eq(Value::String("x".into())))), 10, "SECOND"),
            ],
        };
        let r = req(vec![("name", Value::String("x".into()))]);
        let picked = select(Some(&doc), &r, &Metadata::new());
        assert_eq!(tag(picked.option.unwrap()), "SECOND");
    }

    #[test]
    fn declaration_order_breaks_priority_ties() {
        let doc = RuleDocument {
            method: "a.b.c".into(),
            top_level_match: None,
            responses: vec![
                response(Some(predicate("request.name", Leaf::Eq(Value::String("x".into())))), 5, "FIRST"),
                response(Some(predicate("request.name", Leaf::Eq(Value::String("x".into())))), 5, "SECOND"),
            ],
        };
        let r = req(vec![("name", Value::String("x".into()))]);
        let picked = select(Some(&doc), &r, &Metadata::new());
        assert_eq!(tag(picked.option.unwrap()), "FIRST");
    }

    #[test]
    fn no_conditional_match_falls_back_to_option_without_when() {
        let doc = RuleDocument {
            method: "a.b.c".into(),
            top_level_match: None,
            responses: vec![
                response(Some(predicate("request.name", Leaf::Eq(Value::String("x".into())))), 10, "CONDITIONAL"),
                response(None, 0, "FALLBACK"),
            ],
        };
        let r = req(vec![("name", Value::String("y".into()))]);
        let picked = select(Some(&doc), &r, &Metadata::new());
        assert_eq!(tag(picked.option.unwrap()), "FALLBACK");
    }

    #[test]
    fn failed_top_level_match_skips_straight_to_unconditional_fallback() {
        let doc = RuleDocument {
            method: "a.b.c".into(),
            top_level_match: Some(TopLevelMatch {
                metadata: None,
                request: Some(predicate("request.role", Leaf::Eq(Value::String("admin".into())))),
            }),
            responses: vec![
                response(Some(predicate("request.name", Leaf::Eq(Value::String("x".into())))), 10, "CONDITIONAL"),
                response(None, 0, "FALLBACK"),
            ],
        };
        let r = req(vec![("role", Value::String("guest".into())), ("name", Value::String("x".into()))]);
        let picked = select(Some(&doc), &r, &Metadata::new());
        assert_eq!(tag(picked.option.unwrap()), "FALLBACK");
    }

    #[test]
    fn metadata_lookup_is_case_insensitive() {
        let doc = RuleDocument {
            method: "a.b.c".into(),
            top_level_match: None,
            responses: vec![
                response(Some(predicate("metadata.x-api-key", Leaf::Eq(Value::String("secret".into())))), 1, "AUTHED"),
                response(None, 0, "DEFAULT"),
            ],
        };
        let mut md = Metadata::new();
        md.insert("X-API-Key", "secret");
        let picked = select(Some(&doc), &req(vec![]), &md);
        assert_eq!(tag(picked.option.unwrap()), "AUTHED");
    }

    #[test]
    fn not_operator_negates_nested_leaf() {
        let doc = RuleDocument {
            method: "a.b.c".into(),
            top_level_match: None,
            responses: vec![
                response(
                    Some(predicate(
                        "request.name",
                        Leaf::Not(Box::new(Leaf::Eq(Value::String("x".into())))),
                    )),
                    1,
                    "NOT_X",
                ),
                response(None, 0, "DEFAULT"),
            ],
        };
        let r = req(vec![("name", Value::String("y".into()))]);
        let picked = select(Some(&doc), &r, &Metadata::new());
        assert_eq!(tag(picked.option.unwrap()), "NOT_X");
    }

    #[test]
    fn no_document_yields_builtin_default() {
        let picked = select(None, &req(vec![]), &Metadata::new());
        assert!(picked.option.is_none());
    }
}
