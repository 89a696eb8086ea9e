//! Walks a descriptor graph and emits a `ValidationIr` per message type
//! (spec §4.2).
//!
//! Field options are read reflectively off `google.protobuf.FieldOptions`/
//! `MessageOptions`/`OneofOptions` via `prost_reflect`'s extension API,
//! the same reflective-options path the teacher already relies on for
//! well-known-type handling in `format.rs`. Neither constraint dialect's
//! generated Rust types are a dependency of this crate — their extension
//! numbers are well-known and public, and both dialects happen to name
//! their constraint fields (`min_len`, `pattern`, `gt`, `ignore_empty`, …)
//! identically to the operator vocabulary this spec already uses, so one
//! generic "read every set field off the rules submessage" walk covers
//! both without per-dialect field lists.

use prost_reflect::{DescriptorPool, DynamicMessage, FieldDescriptor, Kind, MessageDescriptor, Value as ReflectValue};

use super::ir::{ConstraintSource, FieldConstraint, FieldKind, IrMap, MessageConstraint, Op, OpArg, OneofConstraint, ValidationIr};
use crate::config::ValidationSource;
use crate::descriptor::DescriptorGraph;

const PROTOVALIDATE_FIELD_EXT: &str = "buf.validate.field";
const PROTOVALIDATE_ONEOF_EXT: &str = "buf.validate.oneof";
const PROTOVALIDATE_MESSAGE_EXT: &str = "buf.validate.message";
const PGV_FIELD_EXT: &str = "validate.rules";
const PGV_ONEOF_EXT: &str = "validate.required";

/// Extracts a `ValidationIr` for every message type reachable from the
/// graph's services, skipping types that yield no constraints at all.
/// `source` gates which dialect(s) are attempted per `VALIDATION_SOURCE`
/// (spec §6): `Auto` tries both (protovalidate first, falling back to pgv),
/// `Pgv`/`Protovalidate` commit to one.
pub fn extract_all(graph: &DescriptorGraph, source: ValidationSource) -> IrMap {
    let pool = graph.pool();
    let mut out = IrMap::new();
    let mut seen = std::collections::HashSet::new();

    for service in graph.services() {
        for method in service.methods() {
            for msg in [method.input(), method.output()] {
                extract_transitively(pool, &msg, source, &mut out, &mut seen);
            }
        }
    }
    out
}

fn extract_transitively(
    pool: &DescriptorPool,
    msg: &MessageDescriptor,
    source: ValidationSource,
    out: &mut IrMap,
    seen: &mut std::collections::HashSet<String>,
) {
    if !seen.insert(msg.full_name().to_string()) {
        return;
    }
    let ir = extract_message(pool, msg, source);
    if !ir.is_empty() {
        out.insert(msg.full_name().to_string(), ir);
    }
    for field in msg.fields() {
        if let Kind::Message(nested) = field.kind() {
            if nested.full_name() != msg.full_name() {
                extract_transitively(pool, &nested, source, out, seen);
            }
        }
    }
}

fn extract_message(pool: &DescriptorPool, msg: &MessageDescriptor, source: ValidationSource) -> ValidationIr {
    let mut ir = ValidationIr::default();

    for field in msg.fields() {
        if let Some(fc) = extract_field(pool, &field, source) {
            ir.fields.push((field.name().to_string(), fc));
        }
    }

    for oneof in msg.oneofs() {
        if oneof.fields().count() <= 1 && oneof.fields().all(|f| is_synthetic_oneof(&f)) {
            continue;
        }
        if let Some(oc) = extract_oneof(pool, &oneof, source) {
            ir.oneofs.push(oc);
        }
    }

    if let Some(mc) = extract_message_cel(pool, msg, source) {
        ir.message_rules.push(mc);
    }

    ir
}

fn is_synthetic_oneof(field: &FieldDescriptor) -> bool {
    field
        .containing_oneof()
        .map(|o| o.fields().count() == 1 && field.supports_presence())
        .unwrap_or(false)
        && field.cardinality() == prost_reflect::Cardinality::Optional
        && !field.is_list()
        && !field.is_map()
}

/// `field.options()` returns the `google.protobuf.FieldOptions` for this
/// field as a `DynamicMessage`; because it is dynamic (not the plain
/// generated `prost_types::FieldOptions`), any extension registered in the
/// same pool — i.e. present because the user's proto tree imports
/// validate.proto / buf/validate/validate.proto, per spec §4.1's documented
/// import resolution — is reachable through `has_extension`/`get_extension`.
fn field_options_message(_pool: &DescriptorPool, field: &FieldDescriptor) -> Option<DynamicMessage> {
    Some(field.options())
}

fn find_extension(pool: &DescriptorPool, full_name: &str) -> Option<prost_reflect::ExtensionDescriptor> {
    pool.get_extension_by_name(full_name)
}

fn extract_field(pool: &DescriptorPool, field: &FieldDescriptor, source: ValidationSource) -> Option<FieldConstraint> {
    let mut constraint: Option<FieldConstraint> = None;

    if source != ValidationSource::Pgv {
        if let Some(ext) = find_extension(pool, PROTOVALIDATE_FIELD_EXT) {
            if let Some(opts) = field_options_message(pool, field) {
                if opts.has_extension(&ext) {
                    let rules = opts.get_extension(&ext);
                    if let ReflectValue::Message(rules_msg) = rules.as_ref() {
                        constraint = build_field_constraint(
                            field,
                            rules_msg,
                            ConstraintSource::Protovalidate,
                        );
                    }
                }
            }
        }
    }

    if constraint.is_none() && source != ValidationSource::Protovalidate {
        if let Some(ext) = find_extension(pool, PGV_FIELD_EXT) {
            if let Some(opts) = field_options_message(pool, field) {
                if opts.has_extension(&ext) {
                    let rules = opts.get_extension(&ext);
                    if let ReflectValue::Message(rules_msg) = rules.as_ref() {
                        constraint = build_field_constraint(field, rules_msg, ConstraintSource::Pgv);
                    }
                }
            }
        }
    }

    constraint
}

/// Picks the oneof-case submessage matching `field`'s kind (e.g. `string`,
/// `int32`, `repeated`) out of the dialect's top-level `FieldRules`/
/// `FieldConstraints` message, then reads every field it has set as an `Op`.
fn build_field_constraint(
    field: &FieldDescriptor,
    rules_msg: &DynamicMessage,
    source: ConstraintSource,
) -> Option<FieldConstraint> {
    let kind = classify_field_kind(field);
    let case_name = rules_case_name(field);

    let case_field = rules_msg
        .descriptor()
        .get_field_by_name(case_name)
        .filter(|f| rules_msg.has_field(f));

    let mut fc = FieldConstraint::new(field.name(), kind, source);
    fc.field_type = field_type_label(field);

    // For Any/custom fields, `cel` lives directly on the top-level rules
    // message rather than inside a kind-specific oneof case, handled below.
    if let Some(case_field) = case_field {
        let submsg = rules_msg.get_field(&case_field);
        if let ReflectValue::Message(submsg) = submsg.as_ref() {
            fc.ops = ops_from_submessage(submsg);
        }
    }

    if let Some(cel_field) = rules_msg.descriptor().get_field_by_name("cel") {
        if rules_msg.has_field(&cel_field) {
            let cel_value = rules_msg.get_field(&cel_field);
            if let ReflectValue::List(items) = cel_value.as_ref() {
                let exprs: Vec<String> = items
                    .iter()
                    .filter_map(|item| {
                        if let ReflectValue::Message(constraint_msg) = item {
                            constraint_msg
                                .descriptor()
                                .get_field_by_name("expression")
                                .map(|f| constraint_msg.get_field(&f).as_str().unwrap_or("").to_string())
                        } else {
                            None
                        }
                    })
                    .collect();
                if !exprs.is_empty() {
                    fc.cel_expression = Some(exprs.join(" && "));
                }
            }
        }
    }

    if let Some(required_field) = rules_msg.descriptor().get_field_by_name("required") {
        if rules_msg.has_field(&required_field) {
            fc.required = rules_msg
                .get_field(&required_field)
                .as_bool()
                .unwrap_or(false);
        }
    }

    if fc.ops.is_empty() && fc.cel_expression.is_none() && !fc.required {
        return None;
    }

    Some(fc)
}

fn classify_field_kind(field: &FieldDescriptor) -> FieldKind {
    if field.is_map() {
        return FieldKind::Map;
    }
    if field.is_list() {
        return FieldKind::Repeated;
    }
    match field.kind() {
        Kind::String => FieldKind::String,
        Kind::Bytes => FieldKind::Bytes,
        Kind::Bool => FieldKind::Bool,
        Kind::Enum(_) => FieldKind::Enum,
        Kind::Message(m) if m.full_name() == "google.protobuf.Timestamp" => FieldKind::Timestamp,
        Kind::Message(m) if m.full_name() == "google.protobuf.Duration" => FieldKind::Duration,
        Kind::Message(m) if m.full_name() == "google.protobuf.Any" => FieldKind::Any,
        Kind::Int32
        | Kind::Int64
        | Kind::Uint32
        | Kind::Uint64
        | Kind::Sint32
        | Kind::Sint64
        | Kind::Fixed32
        | Kind::Fixed64
        | Kind::Sfixed32
        | Kind::Sfixed64
        | Kind::Float
        | Kind::Double => FieldKind::Number,
        _ => FieldKind::Presence,
    }
}

fn rules_case_name(field: &FieldDescriptor) -> &'static str {
    if field.is_map() {
        return "map";
    }
    if field.is_list() {
        return "repeated";
    }
    match field.kind() {
        Kind::String => "string",
        Kind::Bytes => "bytes",
        Kind::Bool => "bool",
        Kind::Enum(_) => "enum",
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => "int32",
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => "int64",
        Kind::Uint32 | Kind::Fixed32 => "uint32",
        Kind::Uint64 | Kind::Fixed64 => "uint64",
        Kind::Float => "float",
        Kind::Double => "double",
        Kind::Message(m) if m.full_name() == "google.protobuf.Timestamp" => "timestamp",
        Kind::Message(m) if m.full_name() == "google.protobuf.Duration" => "duration",
        Kind::Message(_) => "any",
        _ => "any",
    }
}

fn field_type_label(field: &FieldDescriptor) -> String {
    match field.kind() {
        Kind::Message(m) => m.full_name().to_string(),
        Kind::Enum(e) => e.full_name().to_string(),
        other => format!("{other:?}"),
    }
}

fn ops_from_submessage(msg: &DynamicMessage) -> Vec<Op> {
    let mut ops = Vec::new();
    for field in msg.descriptor().fields() {
        if !msg.has_field(&field) {
            continue;
        }
        let name = field.name().to_string();
        let value = msg.get_field(&field);
        if let Some(op) = reflect_value_to_op(&name, value.as_ref()) {
            ops.push(op);
        }
    }
    ops
}

fn reflect_value_to_op(name: &str, value: &ReflectValue) -> Option<Op> {
    match value {
        ReflectValue::Bool(true) => Some(Op::flag(name)),
        ReflectValue::Bool(false) => None,
        ReflectValue::I32(n) => Some(Op::new(name, vec![OpArg::Number(*n as f64)])),
        ReflectValue::I64(n) => Some(Op::new(name, vec![OpArg::Number(*n as f64)])),
        ReflectValue::U32(n) => Some(Op::new(name, vec![OpArg::Number(*n as f64)])),
        ReflectValue::U64(n) => Some(Op::new(name, vec![OpArg::Number(*n as f64)])),
        ReflectValue::F32(n) => Some(Op::new(name, vec![OpArg::Number(*n as f64)])),
        ReflectValue::F64(n) => Some(Op::new(name, vec![OpArg::Number(*n)])),
        ReflectValue::String(s) => Some(Op::new(name, vec![OpArg::Text(s.clone())])),
        ReflectValue::List(items) => {
            let args: Vec<OpArg> = items
                .iter()
                .filter_map(|v| reflect_scalar_to_arg(v))
                .collect();
            Some(Op::new(name, vec![OpArg::List(args)]))
        }
        _ => None,
    }
}

fn reflect_scalar_to_arg(value: &ReflectValue) -> Option<OpArg> {
    match value {
        ReflectValue::Bool(b) => Some(OpArg::Bool(*b)),
        ReflectValue::I32(n) => Some(OpArg::Number(*n as f64)),
        ReflectValue::I64(n) => Some(OpArg::Number(*n as f64)),
        ReflectValue::U32(n) => Some(OpArg::Number(*n as f64)),
        ReflectValue::U64(n) => Some(OpArg::Number(*n as f64)),
        ReflectValue::F32(n) => Some(OpArg::Number(*n as f64)),
        ReflectValue::F64(n) => Some(OpArg::Number(*n)),
        ReflectValue::String(s) => Some(OpArg::Text(s.clone())),
        _ => None,
    }
}

fn extract_oneof(
    pool: &DescriptorPool,
    oneof: &prost_reflect::OneofDescriptor,
    source: ValidationSource,
) -> Option<OneofConstraint> {
    let parent = oneof.parent_message();
    let opts = parent.options();

    let mut required = false;
    let mut constraint_source = ConstraintSource::Proto;
    let mut found = false;

    if source != ValidationSource::Pgv {
        if let Some(ext) = find_extension(pool, PROTOVALIDATE_ONEOF_EXT) {
            if opts.has_extension(&ext) {
                found = true;
                constraint_source = ConstraintSource::Protovalidate;
                if let ReflectValue::Message(m) = opts.get_extension(&ext).as_ref() {
                    if let Some(f) = m.descriptor().get_field_by_name("required") {
                        required = m.get_field(&f).as_bool().unwrap_or(false);
                    }
                }
            }
        }
    }
    if !found && source != ValidationSource::Protovalidate {
        if let Some(ext) = find_extension(pool, PGV_ONEOF_EXT) {
            if opts.has_extension(&ext) {
                found = true;
                constraint_source = ConstraintSource::Pgv;
                required = opts.get_extension(&ext).as_bool().unwrap_or(false);
            }
        }
    }

    if !found {
        return None;
    }

    Some(OneofConstraint {
        name: oneof.name().to_string(),
        fields: oneof.fields().map(|f| f.name().to_string()).collect(),
        required,
        source: constraint_source,
    })
}

/// `VALIDATION_SOURCE=pgv` skips this entirely: pgv has no message-level CEL
/// equivalent, only protovalidate does.
fn extract_message_cel(pool: &DescriptorPool, msg: &MessageDescriptor, source: ValidationSource) -> Option<MessageConstraint> {
    if source == ValidationSource::Pgv {
        return None;
    }
    let ext = find_extension(pool, PROTOVALIDATE_MESSAGE_EXT)?;
    let opts = msg.options();
    if !opts.has_extension(&ext) {
        return None;
    }
    let ReflectValue::Message(rules) = opts.get_extension(&ext).into_owned() else {
        return None;
    };
    let cel_field = rules.descriptor().get_field_by_name("cel")?;
    if !rules.has_field(&cel_field) {
        return None;
    }
    let ReflectValue::List(items) = rules.get_field(&cel_field).into_owned() else {
        return None;
    };
    let first = items.into_iter().find_map(|item| {
        if let ReflectValue::Message(m) = item {
            let expr = m
                .descriptor()
                .get_field_by_name("expression")
                .map(|f| m.get_field(&f).as_str().unwrap_or("").to_string())?;
            let message = m
                .descriptor()
                .get_field_by_name("message")
                .map(|f| m.get_field(&f).as_str().unwrap_or("").to_string());
            Some((expr, message))
        } else {
            None
        }
    })?;

    Some(MessageConstraint {
        expression: first.0,
        message: first.1,
        source: ConstraintSource::Protovalidate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DescriptorGraph;

    #[test]
    fn messages_without_constraints_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("plain.proto"),
            r#"
                syntax = "proto3";
                package test.v1;
                message Plain { string name = 1; }
                message Empty {}
                service Svc { rpc Do(Plain) returns (Empty); }
            "#,
        )
        .unwrap();
        let (graph, _) = DescriptorGraph::load_dir(dir.path(), &[]);
        let ir = extract_all(&graph, ValidationSource::Auto);
        assert!(ir.is_empty());
    }

    #[test]
    fn determinism_running_twice_yields_equal_irs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("svc.proto"),
            r#"
                syntax = "proto3";
                package test.v1;
                message Req { string name = 1; }
                message Resp {}
                service Svc { rpc Do(Req) returns (Resp); }
            "#,
        )
        .unwrap();
        let (graph, _) = DescriptorGraph::load_dir(dir.path(), &[]);
        let ir1 = extract_all(&graph, ValidationSource::Auto);
        let ir2 = extract_all(&graph, ValidationSource::Auto);
        assert_eq!(ir1.len(), ir2.len());
        for (k, v1) in &ir1 {
            let v2 = ir2.get(k).expect("same key present");
            assert_eq!(v1.fields.len(), v2.fields.len());
        }
    }
}
