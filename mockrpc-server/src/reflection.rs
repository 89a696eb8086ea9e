//! Server reflection (spec §4.9): a hand-rolled JSON resolver for the
//! combined port (`list services`, `file by filename`, `file containing
//! symbol`) plus the binary `tonic_reflection` service wired onto the native
//! port.
//!
//! Grounded in `descriptor::find_symbol`'s `Symbol` enum for name resolution
//! and in `prost_reflect::DescriptorPool::file_descriptor_set` for
//! serializing file descriptors back out.

use mockrpc_core::descriptor::{find_symbol, Symbol};
use mockrpc_core::Snapshot;
use prost::Message;
use serde_json::{json, Value as Json};

/// JSON reflection request body: `{"method": "list_services" | "file_by_filename" | "file_containing_symbol", "name"?: "..."}`.
pub struct ReflectionRequest {
    pub method: String,
    pub name: Option<String>,
}

pub enum ReflectionResponse {
    Ok(Json),
    NotFound(String),
    UnsupportedMedia,
}

/// Answers a JSON reflection request against the current snapshot's
/// descriptor pool.
pub fn handle(snapshot: &Snapshot, request: &ReflectionRequest) -> ReflectionResponse {
    let pool = snapshot.descriptors.pool();

    match request.method.as_str() {
        "list_services" => {
            let services: Vec<String> = snapshot.registry.service_names();
            ReflectionResponse::Ok(json!({ "services": services }))
        }
        "file_by_filename" => {
            let Some(name) = &request.name else {
                return ReflectionResponse::NotFound("file_by_filename requires a name".to_string());
            };
            match pool.files().find(|f| f.name() == name) {
                Some(file) => ReflectionResponse::Ok(encode_file(&file)),
                None => ReflectionResponse::NotFound(format!("no such file: {name}")),
            }
        }
        "file_containing_symbol" => {
            let Some(name) = &request.name else {
                return ReflectionResponse::NotFound("file_containing_symbol requires a name".to_string());
            };
            match find_symbol(pool, name) {
                Ok(symbol) => {
                    let file = symbol_file(&symbol);
                    ReflectionResponse::Ok(encode_file(&file))
                }
                Err(_) => ReflectionResponse::NotFound(format!("unknown symbol: {name}")),
            }
        }
        _ => ReflectionResponse::NotFound(format!("unknown reflection method: {}", request.method)),
    }
}

fn symbol_file(symbol: &Symbol) -> prost_reflect::FileDescriptor {
    match symbol {
        Symbol::Service(s) => s.parent_file(),
        Symbol::Method(m) => m.parent_service().parent_file(),
        Symbol::Message(m) => m.parent_file(),
        Symbol::Enum(e) => e.parent_file(),
        Symbol::Field(f) => f.parent_message().parent_file(),
        Symbol::EnumValue(v) => v.parent_enum().parent_file(),
        Symbol::File(f) => f.clone(),
    }
}

fn encode_file(file: &prost_reflect::FileDescriptor) -> Json {
    let bytes = file.file_descriptor_proto().encode_to_vec();
    json!({
        "filename": file.name(),
        "file_descriptor_proto_base64": base64_encode(&bytes),
    })
}

fn base64_encode(bytes: &[u8]) -> String {
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes)
}

/// A binary reflection request arriving on the JSON endpoint is a protocol
/// mismatch, not a missing route: the façade must answer `415`, per spec
/// §4.9, rather than attempt to decode it as JSON.
pub fn is_binary_reflection_request(content_type: &str) -> bool {
    let ct = content_type.split(';').next().unwrap_or("").trim();
    matches!(ct, "application/grpc" | "application/grpc+proto" | "application/connect+proto")
}
