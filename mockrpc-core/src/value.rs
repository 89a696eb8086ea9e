//! Generic tagged value tree used for decoded messages and rule bodies alike.
//!
//! Request payloads arrive from three different wire encodings (binary proto,
//! gRPC-Web, and JSON) and rule bodies are authored by hand in YAML. Both
//! sides need one shape to meet in: a small tagged tree, following the
//! (scalar | list | map | bytes | null) model.

use std::collections::BTreeMap;
use std::fmt;

use prost_reflect::{DynamicMessage, Kind, MapKey, ReflectMessage, Value as ReflectValue};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A protocol- and format-independent value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    #[serde(with = "bytes_as_base64")]
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn map() -> Self {
        Value::Map(BTreeMap::new())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True if the value is present in the "natural empty" sense used by
    /// `ignore_empty`: empty string, zero number, empty list/map, or null.
    pub fn is_empty_ish(&self) -> bool {
        match self {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::Number(n) => *n == 0.0,
            Value::Bool(_) => false,
            Value::Bytes(b) => b.is_empty(),
            Value::List(items) => items.is_empty(),
            Value::Map(m) => m.is_empty(),
        }
    }

    /// Renders the value as a string for substitution / coercion purposes.
    pub fn coerce_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.clone(),
            Value::Bytes(b) => base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b),
            Value::List(_) | Value::Map(_) => {
                serde_json::to_string(self).unwrap_or_default()
            }
        }
    }

    /// Looks up a dotted path (`a.b.c`) against this value, treated as the
    /// root context. Each path segment is matched first against its literal
    /// key, then against its snake_case form, per the field-name-lookup
    /// tolerance the validation and template engines both require.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        if path.is_empty() {
            return Some(self);
        }
        let mut current = self;
        for segment in path.split('.') {
            let (key, index) = split_index_suffix(segment);
            current = current.get_field(key)?;
            if let Some(idx) = index {
                current = current.as_list()?.get(idx)?;
            }
        }
        Some(current)
    }

    /// Looks up a single field by exact name, falling back to its
    /// snake_case-normalized form.
    pub fn get_field(&self, name: &str) -> Option<&Value> {
        let map = self.as_map()?;
        if let Some(v) = map.get(name) {
            return Some(v);
        }
        let snake = to_snake_case(name);
        map.get(&snake)
    }
}

/// Splits `items[2]` into (`"items"`, `Some(2)`); returns (`segment`, `None`)
/// when there is no index suffix.
fn split_index_suffix(segment: &str) -> (&str, Option<usize>) {
    if let Some(open) = segment.find('[') {
        if let Some(close) = segment.rfind(']') {
            if close > open {
                if let Ok(idx) = segment[open + 1..close].parse::<usize>() {
                    return (&segment[..open], Some(idx));
                }
            }
        }
    }
    (segment, None)
}

pub fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for c in name.chars() {
        if c.is_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.extend(c.to_lowercase());
            prev_lower = false;
        } else {
            if c == '-' {
                out.push('_');
            } else {
                out.push(c);
            }
            prev_lower = c.is_lowercase() || c.is_numeric();
        }
    }
    out
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

mod bytes_as_base64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.coerce_string())
    }
}

impl From<&JsonValue> for Value {
    fn from(json: &JsonValue) -> Self {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            JsonValue::String(s) => Value::String(s.clone()),
            JsonValue::Array(items) => Value::List(items.iter().map(Value::from).collect()),
            JsonValue::Object(map) => {
                Value::Map(map.iter().map(|(k, v)| (k.clone(), Value::from(v))).collect())
            }
        }
    }
}

impl From<&serde_yaml::Value> for Value {
    fn from(yaml: &serde_yaml::Value) -> Self {
        match yaml {
            serde_yaml::Value::Null => Value::Null,
            serde_yaml::Value::Bool(b) => Value::Bool(*b),
            serde_yaml::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            serde_yaml::Value::String(s) => Value::String(s.clone()),
            serde_yaml::Value::Sequence(items) => Value::List(items.iter().map(Value::from).collect()),
            serde_yaml::Value::Mapping(map) => Value::Map(
                map.iter()
                    .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), Value::from(v))))
                    .collect(),
            ),
        }
    }
}

impl From<&Value> for JsonValue {
    fn from(v: &Value) -> Self {
        match v {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Bytes(b) => JsonValue::String(
                base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b),
            ),
            Value::List(items) => JsonValue::Array(items.iter().map(JsonValue::from).collect()),
            Value::Map(map) => {
                JsonValue::Object(map.iter().map(|(k, v)| (k.clone(), JsonValue::from(v))).collect())
            }
        }
    }
}

/// Converts a decoded `DynamicMessage` into the generic value tree, walking
/// field-by-field in descriptor order rather than relying on
/// `prost-reflect`'s JSON serde impl, so that every field (including ones
/// set to a default/zero value but present on the wire) participates
/// consistently with how the validation engine expects to see them.
pub fn from_dynamic_message(msg: &DynamicMessage) -> Value {
    let mut map = BTreeMap::new();
    for field in msg.descriptor().fields() {
        // Non-optional scalar fields are included even when unset so that
        // `exists` reads against the proto3 zero value rather than absence.
        if msg.has_field(&field) || !field.supports_presence() {
            let value = msg.get_field(&field);
            map.insert(field.name().to_string(), reflect_value_to_value(&value, &field));
        }
    }
    Value::Map(map)
}

fn reflect_value_to_value(
    value: &ReflectValue,
    field: &prost_reflect::FieldDescriptor,
) -> Value {
    match value {
        ReflectValue::Bool(b) => Value::Bool(*b),
        ReflectValue::I32(n) => Value::Number(*n as f64),
        ReflectValue::I64(n) => Value::Number(*n as f64),
        ReflectValue::U32(n) => Value::Number(*n as f64),
        ReflectValue::U64(n) => Value::Number(*n as f64),
        ReflectValue::F32(n) => Value::Number(*n as f64),
        ReflectValue::F64(n) => Value::Number(*n),
        ReflectValue::String(s) => Value::String(s.clone()),
        ReflectValue::Bytes(b) => Value::Bytes(b.to_vec()),
        ReflectValue::EnumNumber(n) => {
            if let Kind::Enum(enum_desc) = field.kind() {
                if let Some(ev) = enum_desc.get_value(*n) {
                    return Value::String(ev.name().to_string());
                }
            }
            Value::Number(*n as f64)
        }
        ReflectValue::Message(msg) => from_dynamic_message(msg),
        ReflectValue::List(items) => {
            Value::List(items.iter().map(|v| reflect_value_to_value(v, field)).collect())
        }
        ReflectValue::Map(entries) => {
            let mut m = BTreeMap::new();
            for (k, v) in entries {
                let key = map_key_to_string(k);
                m.insert(key, reflect_value_to_value(v, field));
            }
            Value::Map(m)
        }
    }
}

fn map_key_to_string(key: &MapKey) -> String {
    match key {
        MapKey::Bool(b) => b.to_string(),
        MapKey::I32(n) => n.to_string(),
        MapKey::I64(n) => n.to_string(),
        MapKey::U32(n) => n.to_string(),
        MapKey::U64(n) => n.to_string(),
        MapKey::String(s) => s.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_path_exact_and_snake_case() {
        let mut inner = BTreeMap::new();
        inner.insert("user_id".to_string(), Value::String("u1".into()));
        let mut root = BTreeMap::new();
        root.insert("userInfo".to_string(), Value::Map(inner));
        let v = Value::Map(root);

        assert_eq!(
            v.get_path("userInfo.user_id").unwrap().as_str(),
            Some("u1")
        );
        assert_eq!(
            v.get_path("user_info.user_id").unwrap().as_str(),
            Some("u1")
        );
    }

    #[test]
    fn get_path_with_index_suffix() {
        let mut root = BTreeMap::new();
        root.insert(
            "items".to_string(),
            Value::List(vec![Value::Number(1.0), Value::Number(2.0)]),
        );
        let v = Value::Map(root);
        assert_eq!(v.get_path("items[1]").unwrap().as_f64(), Some(2.0));
    }

    #[test]
    fn is_empty_ish_matches_natural_defaults() {
        assert!(Value::Null.is_empty_ish());
        assert!(Value::String(String::new()).is_empty_ish());
        assert!(Value::Number(0.0).is_empty_ish());
        assert!(!Value::Number(1.0).is_empty_ish());
        assert!(!Value::Bool(false).is_empty_ish());
    }

    #[test]
    fn json_roundtrip_preserves_shape() {
        let json: JsonValue = serde_json::json!({"a": 1, "b": [true, null, "x"]});
        let v = Value::from(&json);
        let back = JsonValue::from(&v);
        assert_eq!(json["a"], back["a"]);
        assert_eq!(json["b"], back["b"]);
    }

    #[test]
    fn to_snake_case_examples() {
        assert_eq!(to_snake_case("userId"), "user_id");
        assert_eq!(to_snake_case("UserID"), "user_id");
        assert_eq!(to_snake_case("already_snake"), "already_snake");
    }
}
