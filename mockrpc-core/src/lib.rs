//! Core dispatch plane for the protobuf RPC mock server.
//!
//! Loads `.proto` schemas at runtime, extracts validation constraints from
//! PGV/protovalidate extensions, checks decoded requests against them,
//! matches mock rule documents, and renders templated responses — all
//! independent of any one wire transport. The façade binary (`mockrpc-server`)
//! wires this plane to actual gRPC/Connect/gRPC-Web listeners.

pub mod cel;
pub mod codec;
pub mod config;
pub mod constraints;
pub mod descriptor;
pub mod dispatcher;
pub mod error;
pub mod match_engine;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod rules;
pub mod snapshot;
pub mod template;
pub mod validation;
pub mod value;

pub use config::Config;
pub use constraints::{extract_all, FieldConstraint, ValidationIr};
pub use descriptor::DescriptorGraph;
pub use dispatcher::{
    dispatch_bidi_stream, dispatch_client_stream, dispatch_server_stream, dispatch_unary, CancellationToken,
    DispatchResponse, StreamItem, StreamOutcome, UnaryOutcome, ValidationMode,
};
pub use error::{MockError, Result};
pub use match_engine::Metadata;
pub use metrics::Metrics;
pub use registry::ServiceRegistry;
pub use rules::{RuleDocument, RuleIndex};
pub use snapshot::{Snapshot, SnapshotHandle};
pub use validation::{ValidationResult, Validator, Violation};
pub use value::Value;
