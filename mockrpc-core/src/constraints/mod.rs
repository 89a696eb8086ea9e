//! Constraint Extractor + Validation IR.
//!
//! Submodules: `ir` defines the pure-data IR; `extract` walks a descriptor
//! graph to build one.

pub mod extract;
pub mod ir;

pub use extract::extract_all;
pub use ir::{
    ConstraintSource, FieldConstraint, FieldKind, MessageConstraint, OneofConstraint, ValidationIr,
};
