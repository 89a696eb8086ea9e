//! Validation Engine (spec §4.3): checks a decoded message tree against a
//! `ValidationIr` and reports violations.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cel;
use crate::constraints::ir::{FieldConstraint, FieldKind, ValidationIr};
use crate::value::{to_snake_case, Value};

/// One violation reported against a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub field: String,
    pub description: String,
    pub rule: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl Violation {
    fn new(field: impl Into<String>, rule: impl Into<String>, description: impl Into<String>) -> Self {
        Violation {
            field: field.into(),
            rule: rule.into(),
            description: description.into(),
            value: None,
        }
    }

    fn with_value(mut self, value: serde_json::Value) -> Self {
        self.value = Some(value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub ok: bool,
    pub violations: Vec<Violation>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        ValidationResult { ok: true, violations: Vec::new() }
    }

    pub fn with_violations(violations: Vec<Violation>) -> Self {
        ValidationResult { ok: violations.is_empty(), violations }
    }
}

/// Whether message-level CEL rules are enforced; gated by
/// `VALIDATION_CEL_MESSAGE=experimental` per spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CelEnforcement {
    Off,
    Experimental,
}

/// Cache of compiled regexes keyed by `(pattern, flags)`, shared across
/// validation calls. Unbounded, per spec §9 ("bounded eviction is
/// acceptable but not required").
#[derive(Default)]
pub struct RegexCache {
    cache: Mutex<HashMap<(String, String), std::sync::Arc<Regex>>>,
}

impl RegexCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_compile(&self, pattern: &str, flags: &str) -> Option<std::sync::Arc<Regex>> {
        let key = (pattern.to_string(), flags.to_string());
        let mut guard = self.cache.lock().expect("regex cache poisoned");
        if let Some(r) = guard.get(&key) {
            return Some(r.clone());
        }
        let compiled = Regex::new(pattern).ok()?;
        let arc = std::sync::Arc::new(compiled);
        guard.insert(key, arc.clone());
        Some(arc)
    }
}

pub struct Validator<'a> {
    regex_cache: &'a RegexCache,
    cel_enforcement: CelEnforcement,
}

impl<'a> Validator<'a> {
    pub fn new(regex_cache: &'a RegexCache, cel_enforcement: CelEnforcement) -> Self {
        Validator { regex_cache, cel_enforcement }
    }

    pub fn validate(&self, ir: &ValidationIr, message: &Value) -> ValidationResult {
        let mut violations = Vec::new();

        for (name, constraint) in &ir.fields {
            let value = message.get_field(name);
            self.validate_field(name, constraint, value, &mut violations);
        }

        for oneof in &ir.oneofs {
            let present: Vec<&str> = oneof
                .fields
                .iter()
                .filter(|f| message.get_field(f).map(|v| !v.is_null()).unwrap_or(false))
                .map(String::as_str)
                .collect();

            if present.len() > 1 {
                violations.push(Violation::new(
                    oneof.name.clone(),
                    "oneof_multiple",
                    format!(
                        "exactly one of [{}] may be set, but {} were set",
                        oneof.fields.join(", "),
                        present.len()
                    ),
                ));
            } else if oneof.required && present.is_empty() {
                violations.push(Violation::new(
                    oneof.name.clone(),
                    "oneof_required",
                    format!("one of [{}] is required", oneof.fields.join(", ")),
                ));
            }
        }

        if self.cel_enforcement == CelEnforcement::Experimental {
            for rule in &ir.message_rules {
                match cel::eval(&rule.expression, message) {
                    Ok(true) => {}
                    Ok(false) => violations.push(Violation::new(
                        "",
                        "cel",
                        rule.message.clone().unwrap_or_else(|| "message constraint failed".into()),
                    )),
                    Err(_) => {
                        // Parse/eval errors disable only this rule (spec §7).
                    }
                }
            }
        }

        ValidationResult::with_violations(violations)
    }

    fn validate_field(
        &self,
        name: &str,
        constraint: &FieldConstraint,
        value: Option<&Value>,
        violations: &mut Vec<Violation>,
    ) {
        if constraint.kind == FieldKind::Presence {
            let present = value.map(|v| !v.is_null()).unwrap_or(false);
            if constraint.required && !present {
                violations.push(Violation::new(name, "required", format!("{name} is required")));
            }
            return;
        }

        let Some(value) = value else {
            if constraint.required {
                violations.push(Violation::new(name, "required", format!("{name} is required")));
            }
            return;
        };

        if value.is_null() {
            if constraint.required {
                violations.push(Violation::new(name, "required", format!("{name} is required")));
            }
            return;
        }

        let ignore_empty = constraint.has_op("ignore_empty");
        if ignore_empty && value.is_empty_ish() {
            return;
        }

        if matches!(constraint.kind, FieldKind::String | FieldKind::Number | FieldKind::Bool | FieldKind::Bytes | FieldKind::Enum) {
            if let Value::List(items) = value {
                for (i, item) in items.iter().enumerate() {
                    let path = format!("{name}[{i}]");
                    self.validate_scalar(&path, constraint, item, violations);
                }
                return;
            }
        }

        match constraint.kind {
            FieldKind::Repeated => self.validate_repeated(name, constraint, value, violations),
            FieldKind::Map => self.validate_map(name, constraint, value, violations),
            FieldKind::Any | FieldKind::Cel => {
                if let Some(expr) = &constraint.cel_expression {
                    match cel::eval_on_field(expr, value) {
                        Ok(true) | Err(_) => {}
                        Ok(false) => violations.push(Violation::new(
                            name,
                            "cel",
                            format!("{name} failed constraint: {expr}"),
                        )),
                    }
                }
            }
            _ => self.validate_scalar(name, constraint, value, violations),
        }
    }

    fn validate_scalar(
        &self,
        path: &str,
        constraint: &FieldConstraint,
        value: &Value,
        violations: &mut Vec<Violation>,
    ) {
        for op in &constraint.ops {
            let violation = match op.name.as_str() {
                "min_len" => check_len(path, value, op, true),
                "max_len" => check_len(path, value, op, false),
                "min_bytes" => check_byte_len(path, value, op, true),
                "max_bytes" => check_byte_len(path, value, op, false),
                "pattern" => self.check_pattern(path, value, op),
                "email" => check_email(path, value),
                "uuid" => check_uuid(path, value),
                "hostname" => check_hostname(path, value),
                "ipv4" => check_ipv4(path, value),
                "ipv6" => check_ipv6(path, value),
                "uri" => check_uri(path, value),
                "prefix" => check_affix(path, value, op, true),
                "suffix" => check_affix(path, value, op, false),
                "contains" => check_contains(path, value, op),
                "not_contains" => check_not_contains(path, value, op),
                "in" => check_in(path, value, op),
                "not_in" => check_not_in(path, value, op),
                "const" => check_const(path, value, op),
                "gt" => check_numeric(path, value, op, |a, b| a > b, "gt"),
                "gte" => check_numeric(path, value, op, |a, b| a >= b, "gte"),
                "lt" => check_numeric(path, value, op, |a, b| a < b, "lt"),
                "lte" => check_numeric(path, value, op, |a, b| a <= b, "lte"),
                "defined_only" => None, // informational; enum decode already rejects unknowns upstream
                _ => None,
            };
            if let Some(v) = violation {
                violations.push(v);
            }
        }
    }

    fn check_pattern(&self, path: &str, value: &Value, op: &crate::constraints::ir::Op) -> Option<Violation> {
        let pattern = op.arg(0)?.as_str()?;
        let regex = self.regex_cache.get_or_compile(pattern, "")?;
        let s = value.as_str().unwrap_or_default();
        if regex.is_match(s) {
            None
        } else {
            Some(
                Violation::new(path, "pattern", format!("{path} does not match pattern {pattern}"))
                    .with_value(serde_json::Value::String(s.to_string())),
            )
        }
    }

    fn validate_repeated(
        &self,
        name: &str,
        constraint: &FieldConstraint,
        value: &Value,
        violations: &mut Vec<Violation>,
    ) {
        let Value::List(items) = value else { return };

        for op in &constraint.ops {
            match op.name.as_str() {
                "min_items" => {
                    if let Some(min) = op.arg(0).and_then(|a| a.as_f64()) {
                        if (items.len() as f64) < min {
                            violations.push(Violation::new(
                                name,
                                "min_items",
                                format!("{name} must have at least {min} items"),
                            ));
                        }
                    }
                }
                "max_items" => {
                    if let Some(max) = op.arg(0).and_then(|a| a.as_f64()) {
                        if (items.len() as f64) > max {
                            violations.push(Violation::new(
                                name,
                                "max_items",
                                format!("{name} must have at most {max} items"),
                            ));
                        }
                    }
                }
                "unique" => {
                    let mut seen = HashSet::new();
                    let mut dupes = Vec::new();
                    for item in items {
                        let key = serde_json::to_string(&serde_json::Value::from(item)).unwrap_or_default();
                        if !seen.insert(key.clone()) {
                            dupes.push(key);
                        }
                    }
                    if !dupes.is_empty() {
                        violations.push(Violation::new(
                            name,
                            "unique",
                            format!("{name} contains duplicate values: {}", dupes.join(", ")),
                        ));
                    }
                }
                _ => {}
            }
        }
    }

    fn validate_map(
        &self,
        name: &str,
        constraint: &FieldConstraint,
        value: &Value,
        violations: &mut Vec<Violation>,
    ) {
        let Value::Map(entries) = value else { return };
        for op in &constraint.ops {
            match op.name.as_str() {
                "min_pairs" => {
                    if let Some(min) = op.arg(0).and_then(|a| a.as_f64()) {
                        if (entries.len() as f64) < min {
                            violations.push(Violation::new(
                                name,
                                "min_pairs",
                                format!("{name} must have at least {min} entries"),
                            ));
                        }
                    }
                }
                "max_pairs" => {
                    if let Some(max) = op.arg(0).and_then(|a| a.as_f64()) {
                        if (entries.len() as f64) > max {
                            violations.push(Violation::new(
                                name,
                                "max_pairs",
                                format!("{name} must have at most {max} entries"),
                            ));
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

fn check_len(path: &str, value: &Value, op: &crate::constraints::ir::Op, is_min: bool) -> Option<Violation> {
    let bound = op.arg(0)?.as_f64()?;
    let s = value.as_str()?;
    let len = s.chars().count() as f64;
    let ok = if is_min { len >= bound } else { len <= bound };
    if ok {
        None
    } else {
        let rule = if is_min { "min_len" } else { "max_len" };
        let cmp = if is_min { "at least" } else { "at most" };
        Some(
            Violation::new(path, rule, format!("string length must be {cmp} {bound} characters"))
                .with_value(serde_json::Value::from(len)),
        )
    }
}

fn check_byte_len(path: &str, value: &Value, op: &crate::constraints::ir::Op, is_min: bool) -> Option<Violation> {
    let bound = op.arg(0)?.as_f64()?;
    let len = match value {
        Value::Bytes(b) => b.len(),
        Value::String(s) => s.len(),
        _ => return None,
    } as f64;
    let ok = if is_min { len >= bound } else { len <= bound };
    if ok {
        None
    } else {
        let rule = if is_min { "min_bytes" } else { "max_bytes" };
        Some(Violation::new(path, rule, format!("{path} byte length out of range")))
    }
}

fn check_email(path: &str, value: &Value) -> Option<Violation> {
    let s = value.as_str()?;
    let valid = s.contains('@')
        && s.matches('@').count() == 1
        && s.split('@').all(|part| !part.is_empty())
        && s.rsplit('@').next().map(|d| d.contains('.')).unwrap_or(false);
    if valid {
        None
    } else {
        Some(Violation::new(path, "email", format!("{path} must be a valid email address")))
    }
}

fn check_uuid(path: &str, value: &Value) -> Option<Violation> {
    let s = value.as_str()?;
    let parts: Vec<&str> = s.split('-').collect();
    let valid = parts.len() == 5
        && [8, 4, 4, 4, 12]
            .iter()
            .zip(parts.iter())
            .all(|(len, part)| part.len() == *len && part.chars().all(|c| c.is_ascii_hexdigit()));
    if valid {
        None
    } else {
        Some(Violation::new(path, "uuid", format!("{path} must be a valid UUID")))
    }
}

fn check_hostname(path: &str, value: &Value) -> Option<Violation> {
    let s = value.as_str()?;
    let valid = !s.is_empty()
        && s.len() <= 253
        && s.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                && !label.starts_with('-')
                && !label.ends_with('-')
        });
    if valid {
        None
    } else {
        Some(Violation::new(path, "hostname", format!("{path} must be a valid hostname")))
    }
}

fn check_ipv4(path: &str, value: &Value) -> Option<Violation> {
    let s = value.as_str()?;
    let octets: Vec<&str> = s.split('.').collect();
    let valid = octets.len() == 4
        && octets.iter().all(|o| o.parse::<u16>().map(|n| n <= 255).unwrap_or(false) && !o.is_empty());
    if valid {
        None
    } else {
        Some(Violation::new(path, "ipv4", format!("{path} must be a valid IPv4 address")))
    }
}

fn check_ipv6(path: &str, value: &Value) -> Option<Violation> {
    let s = value.as_str()?;
    if s.parse::<std::net::Ipv6Addr>().is_ok() {
        None
    } else {
        Some(Violation::new(path, "ipv6", format!("{path} must be a valid IPv6 address")))
    }
}

fn check_uri(path: &str, value: &Value) -> Option<Violation> {
    let s = value.as_str()?;
    let valid = s
        .split_once("://")
        .map(|(scheme, rest)| {
            !scheme.is_empty()
                && scheme.chars().next().map(|c| c.is_ascii_alphabetic()).unwrap_or(false)
                && scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
                && !rest.is_empty()
        })
        .unwrap_or(false);
    if valid {
        None
    } else {
        Some(Violation::new(path, "uri", format!("{path} must be a valid URI")))
    }
}

fn check_affix(path: &str, value: &Value, op: &crate::constraints::ir::Op, is_prefix: bool) -> Option<Violation> {
    let needle = op.arg(0)?.as_str()?;
    let s = value.as_str()?;
    let ok = if is_prefix { s.starts_with(needle) } else { s.ends_with(needle) };
    if ok {
        None
    } else {
        let rule = if is_prefix { "prefix" } else { "suffix" };
        Some(Violation::new(path, rule, format!("{path} must {rule} with {needle:?}")))
    }
}

fn check_contains(path: &str, value: &Value, op: &crate::constraints::ir::Op) -> Option<Violation> {
    match (value, op.arg(0)) {
        (Value::String(s), Some(arg)) => {
            let needle = arg.as_str()?;
            if s.contains(needle) {
                None
            } else {
                Some(Violation::new(path, "contains", format!("{path} must contain {needle:?}")))
            }
        }
        (Value::List(items), Some(arg)) => {
            let target = match arg {
                crate::constraints::ir::OpArg::Text(s) => Value::String(s.clone()),
                crate::constraints::ir::OpArg::Number(n) => Value::Number(*n),
                crate::constraints::ir::OpArg::Bool(b) => Value::Bool(*b),
                _ => return None,
            };
            if items.contains(&target) {
                None
            } else {
                Some(Violation::new(path, "contains", format!("{path} must contain {target}")))
            }
        }
        _ => None,
    }
}

fn check_not_contains(path: &str, value: &Value, op: &crate::constraints::ir::Op) -> Option<Violation> {
    let needle = op.arg(0)?.as_str()?;
    let s = value.as_str()?;
    if s.contains(needle) {
        Some(Violation::new(path, "not_contains", format!("{path} must not contain {needle:?}")))
    } else {
        None
    }
}

fn check_in(path: &str, value: &Value, op: &crate::constraints::ir::Op) -> Option<Violation> {
    let list = op.arg(0)?.as_list()?;
    let s = value.coerce_string();
    let found = list.iter().any(|a| a.as_str().map(|x| x == s).unwrap_or(false) || a.as_f64().map(|n| format!("{n}") == s).unwrap_or(false));
    if found {
        None
    } else {
        Some(Violation::new(path, "in", format!("{path} must be one of the allowed values")))
    }
}

fn check_not_in(path: &str, value: &Value, op: &crate::constraints::ir::Op) -> Option<Violation> {
    let list = op.arg(0)?.as_list()?;
    let s = value.coerce_string();
    let found = list.iter().any(|a| a.as_str().map(|x| x == s).unwrap_or(false));
    if found {
        Some(Violation::new(path, "not_in", format!("{path} must not be one of the disallowed values")))
    } else {
        None
    }
}

fn check_const(path: &str, value: &Value, op: &crate::constraints::ir::Op) -> Option<Violation> {
    let arg = op.arg(0)?;
    let matches = match (value, arg) {
        (Value::String(s), crate::constraints::ir::OpArg::Text(t)) => s == t,
        (Value::Number(n), crate::constraints::ir::OpArg::Number(m)) => n == m,
        (Value::Bool(b), crate::constraints::ir::OpArg::Bool(c)) => b == c,
        _ => false,
    };
    if matches {
        None
    } else {
        Some(Violation::new(path, "const", format!("{path} must equal the configured constant")))
    }
}

fn check_numeric(
    path: &str,
    value: &Value,
    op: &crate::constraints::ir::Op,
    cmp: impl Fn(f64, f64) -> bool,
    rule: &str,
) -> Option<Violation> {
    let bound = op.arg(0)?.as_f64()?;
    let n = value.as_f64()?;
    if cmp(n, bound) {
        None
    } else {
        Some(
            Violation::new(path, rule, format!("{path} must satisfy {rule} {bound}"))
                .with_value(serde_json::Value::from(n)),
        )
    }
}

/// Tries a field path under both its stored name and the snake_case
/// derivation, per spec §4.3's field-name lookup tolerance.
pub fn lookup_tolerant<'a>(message: &'a Value, name: &str) -> Option<&'a Value> {
    message.get_field(name).or_else(|| message.get_field(&to_snake_case(name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::ir::{ConstraintSource, Op, OpArg};
    use std::collections::BTreeMap;

    fn string_min_len_ir(min: f64) -> ValidationIr {
        let mut fc = FieldConstraint::new("name", FieldKind::String, ConstraintSource::Protovalidate);
        fc.ops.push(Op::new("min_len", vec![OpArg::Number(min)]));
        ValidationIr { fields: vec![("name".into(), fc)], oneofs: vec![], message_rules: vec![] }
    }

    fn msg(fields: Vec<(&str, Value)>) -> Value {
        let mut m = BTreeMap::new();
        for (k, v) in fields {
            m.insert(k.to_string(), v);
        }
        Value::Map(m)
    }

    #[test]
    fn scenario_b_validation_rejects_short_string() {
        let cache = RegexCache::new();
        let validator = Validator::new(&cache, CelEnforcement::Off);
        let ir = string_min_len_ir(3.0);
        let message = msg(vec![("name", Value::String("ab".into()))]);
        let result = validator.validate(&ir, &message);
        assert!(!result.ok);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].field, "name");
        assert_eq!(result.violations[0].rule, "min_len");
    }

    #[test]
    fn satisfying_message_has_no_violations() {
        let cache = RegexCache::new();
        let validator = Validator::new(&cache, CelEnforcement::Off);
        let ir = string_min_len_ir(3.0);
        let message = msg(vec![("name", Value::String("abcd".into()))]);
        let result = validator.validate(&ir, &message);
        assert!(result.ok);
    }

    #[test]
    fn oneof_multiple_set_is_a_violation() {
        let cache = RegexCache::new();
        let validator = Validator::new(&cache, CelEnforcement::Off);
        let ir = ValidationIr {
            fields: vec![],
            oneofs: vec![crate::constraints::ir::OneofConstraint {
                name: "choice".into(),
                fields: vec!["a".into(), "b".into()],
                required: false,
                source: ConstraintSource::Protovalidate,
            }],
            message_rules: vec![],
        };
        let message = msg(vec![("a", Value::String("x".into())), ("b", Value::String("y".into()))]);
        let result = validator.validate(&ir, &message);
        assert!(!result.ok);
        assert_eq!(result.violations[0].rule, "oneof_multiple");
    }

    #[test]
    fn oneof_required_zero_set_is_a_violation() {
        let cache = RegexCache::new();
        let validator = Validator::new(&cache, CelEnforcement::Off);
        let ir = ValidationIr {
            fields: vec![],
            oneofs: vec![crate::constraints::ir::OneofConstraint {
                name: "choice".into(),
                fields: vec!["a".into(), "b".into()],
                required: true,
                source: ConstraintSource::Protovalidate,
            }],
            message_rules: vec![],
        };
        let message = msg(vec![]);
        let result = validator.validate(&ir, &message);
        assert!(!result.ok);
        assert_eq!(result.violations[0].rule, "oneof_required");
    }

    #[test]
    fn ignore_empty_skips_zero_value() {
        let cache = RegexCache::new();
        let validator = Validator::new(&cache, CelEnforcement::Off);
        let mut fc = FieldConstraint::new("name", FieldKind::String, ConstraintSource::Protovalidate);
        fc.ops.push(Op::new("min_len", vec![OpArg::Number(3.0)]));
        fc.ops.push(Op::flag("ignore_empty"));
        let ir = ValidationIr { fields: vec![("name".into(), fc)], oneofs: vec![], message_rules: vec![] };
        let message = msg(vec![("name", Value::String("".into()))]);
        let result = validator.validate(&ir, &message);
        assert!(result.ok);
    }

    #[test]
    fn scalar_constraint_applied_elementwise_to_array() {
        let cache = RegexCache::new();
        let validator = Validator::new(&cache, CelEnforcement::Off);
        let mut fc = FieldConstraint::new("tags", FieldKind::String, ConstraintSource::Protovalidate);
        fc.ops.push(Op::new("min_len", vec![OpArg::Number(2.0)]));
        let ir = ValidationIr { fields: vec![("tags".into(), fc)], oneofs: vec![], message_rules: vec![] };
        let message = msg(vec![(
            "tags",
            Value::List(vec![Value::String("ok".into()), Value::String("x".into())]),
        )]);
        let result = validator.validate(&ir, &message);
        assert!(!result.ok);
        assert_eq!(result.violations[0].field, "tags[1]");
    }
}
