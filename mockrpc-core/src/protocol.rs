//! Protocol Adapter (spec §4.6): normalizes the four wire encodings the
//! façade accepts (binary gRPC, gRPC-Web, gRPC-Web-text, Connect JSON) into
//! one shape the dispatcher works with, and converts dispatcher output back
//! into protocol-appropriate bytes.
//!
//! The normalized shape is styled after the `ProtocolRequest`/
//! `ProtocolResponse`/`ResponseStatus` triad the pack's protocol-abstraction
//! module uses to unify HTTP/GraphQL/gRPC/WebSocket traffic, specialized
//! here to the families this server actually serves.

use std::collections::BTreeMap;

use prost_reflect::{DynamicMessage, MessageDescriptor};

use crate::error::{MockError, Result};
use crate::match_engine::Metadata;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireProtocol {
    Grpc,
    GrpcWeb,
    GrpcWebText,
    ConnectJson,
    ConnectProto,
}

/// Detects the wire protocol from a request's `content-type` header, per
/// spec §4.6's documented content-type families. An absent or unrecognized
/// content-type is not an error: it defaults to the JSON/Connect variant.
pub fn detect_protocol(content_type: &str) -> WireProtocol {
    let ct = content_type.split(';').next().unwrap_or("").trim();
    match ct {
        "application/grpc" | "application/grpc+proto" => WireProtocol::Grpc,
        "application/grpc-web" | "application/grpc-web+proto" => WireProtocol::GrpcWeb,
        "application/grpc-web-text" | "application/grpc-web-text+proto" => WireProtocol::GrpcWebText,
        "application/proto" | "application/connect+proto" => WireProtocol::ConnectProto,
        _ => WireProtocol::ConnectJson,
    }
}

#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    pub protocol: WireProtocol,
    pub service: String,
    pub method: String,
    pub metadata: Metadata,
    pub body: Value,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct NormalizedResponse {
    pub status_code: tonic::Code,
    pub body: Value,
    pub metadata: BTreeMap<String, String>,
    pub trailers: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct NormalizedError {
    pub status_code: tonic::Code,
    pub message: String,
    pub details: Option<Value>,
}

/// Pseudo-headers stripped from HTTP/2 metadata before it reaches rule
/// matching or template rendering — they're transport plumbing, not
/// application-visible metadata.
const PSEUDO_HEADERS: &[&str] = &[":method", ":scheme", ":authority", ":path", "content-type", "te", "user-agent"];

pub fn extract_metadata(headers: impl IntoIterator<Item = (String, String)>) -> Metadata {
    let mut metadata = Metadata::new();
    for (key, value) in headers {
        let lower = key.to_lowercase();
        if PSEUDO_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        metadata.insert(lower, value);
    }
    metadata
}

/// Resolves the effective timeout, preferring Connect's `connect-timeout-ms`
/// over gRPC's `grpc-timeout` header when both are present, per spec §4.6.
pub fn resolve_timeout_ms(connect_timeout_ms: Option<&str>, grpc_timeout: Option<&str>) -> Option<u64> {
    if let Some(ms) = connect_timeout_ms.and_then(|s| s.parse::<u64>().ok()) {
        return Some(ms);
    }
    grpc_timeout.and_then(parse_grpc_timeout)
}

/// Parses gRPC's `<digits><unit>` timeout header (`H`,`M`,`S`,`m`,`u`,`n`)
/// into milliseconds.
fn parse_grpc_timeout(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let (digits, unit) = raw.split_at(raw.len() - 1);
    let value: u64 = digits.parse().ok()?;
    let ms = match unit {
        "H" => value.checked_mul(3_600_000)?,
        "M" => value.checked_mul(60_000)?,
        "S" => value.checked_mul(1_000)?,
        "m" => value,
        "u" => value / 1_000,
        "n" => value / 1_000_000,
        _ => return None,
    };
    Some(ms)
}

/// Decodes a request body into the generic value tree, dispatching on
/// protocol family: binary proto families decode via the message
/// descriptor; JSON families parse directly.
pub fn decode_body(protocol: WireProtocol, bytes: &[u8], request_desc: &MessageDescriptor) -> Result<Value> {
    match protocol {
        WireProtocol::Grpc | WireProtocol::GrpcWeb | WireProtocol::GrpcWebText | WireProtocol::ConnectProto => {
            let msg = DynamicMessage::decode(request_desc.clone(), bytes)
                .map_err(|e| MockError::InvalidArgument(format!("failed to decode request body: {e}")))?;
            Ok(crate::value::from_dynamic_message(&msg))
        }
        WireProtocol::ConnectJson => {
            let json: serde_json::Value = serde_json::from_slice(bytes)
                .map_err(|e| MockError::InvalidArgument(format!("failed to parse JSON request body: {e}")))?;
            Ok(Value::from(&json))
        }
    }
}

/// Encodes a response body for the wire, mirroring `decode_body`'s protocol
/// dispatch.
pub fn encode_body(protocol: WireProtocol, value: &Value, response_desc: &MessageDescriptor) -> Result<Vec<u8>> {
    match protocol {
        WireProtocol::Grpc | WireProtocol::GrpcWeb | WireProtocol::GrpcWebText | WireProtocol::ConnectProto => {
            let msg = value_to_dynamic_message(value, response_desc)?;
            Ok(msg.encode_to_vec())
        }
        WireProtocol::ConnectJson => {
            let json = serde_json::Value::from(value);
            serde_json::to_vec(&json).map_err(|e| MockError::Other(Box::new(e)))
        }
    }
}

/// Builds a `DynamicMessage` from the generic value tree by round-tripping
/// through JSON, which `prost-reflect`'s `serde` feature already knows how
/// to deserialize against a descriptor.
fn value_to_dynamic_message(value: &Value, desc: &MessageDescriptor) -> Result<DynamicMessage> {
    let json = serde_json::Value::from(value);
    DynamicMessage::deserialize(desc.clone(), json)
        .map_err(|e| MockError::Other(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_known_content_types() {
        assert_eq!(detect_protocol("application/grpc"), WireProtocol::Grpc);
        assert_eq!(detect_protocol("application/grpc-web+proto"), WireProtocol::GrpcWeb);
        assert_eq!(detect_protocol("application/json; charset=utf-8"), WireProtocol::ConnectJson);
    }

    #[test]
    fn unrecognized_or_absent_content_type_defaults_to_connect_json() {
        assert_eq!(detect_protocol("text/plain"), WireProtocol::ConnectJson);
        assert_eq!(detect_protocol(""), WireProtocol::ConnectJson);
    }

    #[test]
    fn pseudo_headers_are_stripped() {
        let metadata = extract_metadata(vec![
            (":method".to_string(), "POST".to_string()),
            ("x-api-key".to_string(), "abc".to_string()),
        ]);
        assert!(metadata.get(":method").is_none());
        assert_eq!(metadata.get("x-api-key"), Some("abc"));
    }

    #[test]
    fn connect_timeout_takes_precedence_over_grpc_timeout() {
        assert_eq!(resolve_timeout_ms(Some("500"), Some("10S")), Some(500));
        assert_eq!(resolve_timeout_ms(None, Some("2S")), Some(2000));
        assert_eq!(resolve_timeout_ms(None, None), None);
    }

    #[test]
    fn grpc_timeout_units() {
        assert_eq!(parse_grpc_timeout("10S"), Some(10_000));
        assert_eq!(parse_grpc_timeout("5M"), Some(300_000));
        assert_eq!(parse_grpc_timeout("100m"), Some(100));
    }
}
