//! The Validation IR: a descriptor-graph-independent, serializable
//! constraint set per message type (spec §3 "Validation IR").

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Where a constraint came from. Downstream components (e.g. `VALIDATION_SOURCE`
/// filtering) use this to include/exclude constraints by dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintSource {
    Pgv,
    Protovalidate,
    Proto,
}

/// The broad shape of value a field constraint applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Number,
    Repeated,
    Presence,
    Enum,
    Cel,
    Bytes,
    Map,
    Timestamp,
    Duration,
    Any,
    Bool,
}

/// A single named constraint operation, e.g. `min_len(3)` or `gte(0)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub name: String,
    pub args: Vec<OpArg>,
}

impl Op {
    pub fn new(name: impl Into<String>, args: Vec<OpArg>) -> Self {
        Op { name: name.into(), args }
    }

    pub fn flag(name: impl Into<String>) -> Self {
        Op { name: name.into(), args: Vec::new() }
    }

    pub fn arg(&self, i: usize) -> Option<&OpArg> {
        self.args.get(i)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpArg {
    Number(f64),
    Text(String),
    Bool(bool),
    List(Vec<OpArg>),
}

impl OpArg {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            OpArg::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OpArg::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OpArg::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[OpArg]> {
        match self {
            OpArg::List(items) => Some(items),
            _ => None,
        }
    }
}

/// A per-field constraint: everything the Validation Engine needs to check
/// one field, regardless of which dialect produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConstraint {
    pub kind: FieldKind,
    pub ops: Vec<Op>,
    pub field_path: String,
    pub field_type: String,
    pub source: ConstraintSource,
    /// Present only on `FieldKind::Presence` rules.
    pub required: bool,
    /// Present only on `FieldKind::Cel` rules.
    pub cel_expression: Option<String>,
}

impl FieldConstraint {
    pub fn new(field_path: impl Into<String>, kind: FieldKind, source: ConstraintSource) -> Self {
        FieldConstraint {
            kind,
            ops: Vec::new(),
            field_path: field_path.into(),
            field_type: String::new(),
            source,
            required: false,
            cel_expression: None,
        }
    }

    pub fn has_op(&self, name: &str) -> bool {
        self.ops.iter().any(|o| o.name == name)
    }

    pub fn op(&self, name: &str) -> Option<&Op> {
        self.ops.iter().find(|o| o.name == name)
    }
}

/// A non-synthetic oneof group's constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneofConstraint {
    pub name: String,
    pub fields: Vec<String>,
    pub required: bool,
    pub source: ConstraintSource,
}

/// A message-level CEL rule, enforcement-gated per spec §4.2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageConstraint {
    pub expression: String,
    pub message: Option<String>,
    pub source: ConstraintSource,
}

/// The full constraint set for one message type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationIr {
    /// Keyed by field name (IR storage order preserved via `Vec` of pairs,
    /// mirroring spec §3's "ordered mapping").
    pub fields: Vec<(String, FieldConstraint)>,
    pub oneofs: Vec<OneofConstraint>,
    pub message_rules: Vec<MessageConstraint>,
}

impl ValidationIr {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.oneofs.is_empty() && self.message_rules.is_empty()
    }

    pub fn field(&self, name: &str) -> Option<&FieldConstraint> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }
}

/// `Map<fully-qualified-type-name, ValidationIR>`, skipping types with no
/// constraints, per spec §4.2's documented output shape.
pub type IrMap = BTreeMap<String, ValidationIr>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ir_reports_empty() {
        let ir = ValidationIr::default();
        assert!(ir.is_empty());
    }

    #[test]
    fn field_lookup_by_name() {
        let mut ir = ValidationIr::default();
        ir.fields.push((
            "name".into(),
            FieldConstraint::new("name", FieldKind::String, ConstraintSource::Protovalidate),
        ));
        assert!(ir.field("name").is_some());
        assert!(ir.field("missing").is_none());
    }
}
