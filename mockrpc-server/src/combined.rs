//! Combined-port façade handler (spec §4.9): JSON (Connect), gRPC-Web, and
//! binary-over-HTTP/2 colocated on one port, multiplexed by content-type and
//! path, all funneled through the same Streaming Dispatcher the native port
//! uses.
//!
//! Bodies are buffered in full rather than streamed frame-by-frame off the
//! HTTP/2 connection: client-stream/bidi inputs arrive as several
//! length-prefixed frames in one request body (`framing::decode_frames`),
//! and server-stream/bidi outputs are rendered up front by the dispatcher
//! (`StreamOutcome::items`) and then written out as one concatenated,
//! length-prefixed body. This trades true backpressure for a much smaller
//! façade; the dispatcher's suspension-point contract (checking
//! cancellation before each emit/sleep) still applies to the pacing loop
//! that assembles that body.

use std::convert::Infallible;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};

use mockrpc_core::dispatcher::{
    self, CancellationToken, DispatchResponse, StreamOutcome, UnaryOutcome, ValidationMode,
};
use mockrpc_core::protocol::{self, WireProtocol};
use mockrpc_core::registry::StreamShape;
use mockrpc_core::template::DefaultUtils;
use mockrpc_core::value::Value;

use crate::framing;
use crate::reflection::{self, ReflectionRequest, ReflectionResponse};
use crate::state::AppState;

pub type BoxBody = Full<Bytes>;

fn text_response(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", content_type)
        .body(Full::new(body.into()))
        .expect("building a static response never fails")
}

/// Entry point for every request on the combined port.
pub async fn serve(req: Request<hyper::body::Incoming>, state: AppState) -> Result<Response<BoxBody>, Infallible> {
    let (parts, body) = req.into_parts();

    if parts.method == http::Method::OPTIONS {
        return Ok(if state.connect_cors_enabled {
            cors_preflight_response()
        } else {
            text_response(StatusCode::NOT_FOUND, "text/plain", "")
        });
    }

    if parts.uri.path() == "/health" {
        return Ok(health_response(&state));
    }

    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return Ok(text_response(StatusCode::BAD_REQUEST, "text/plain", "failed to read request body")),
    };

    if parts.uri.path() == "/reflect" {
        return Ok(handle_reflect(&parts, &body_bytes, &state));
    }

    Ok(handle_rpc(&parts, body_bytes, &state).await)
}

fn cors_preflight_response() -> Response<BoxBody> {
    let origins = std::env::var("CONNECT_CORS_ORIGINS").unwrap_or_else(|_| "*".to_string());
    let methods = std::env::var("CONNECT_CORS_METHODS").unwrap_or_else(|_| "POST, OPTIONS".to_string());
    let headers =
        std::env::var("CONNECT_CORS_HEADERS").unwrap_or_else(|_| "content-type, x-grpc-web, x-user-agent".to_string());
    let exposed = std::env::var("CONNECT_CORS_EXPOSED_HEADERS")
        .unwrap_or_else(|_| "grpc-status, grpc-message".to_string());

    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("access-control-allow-origin", origins)
        .header("access-control-allow-methods", methods)
        .header("access-control-allow-headers", headers)
        .header("access-control-expose-headers", exposed)
        .header("access-control-max-age", "86400")
        .body(Full::new(Bytes::new()))
        .expect("building a static response never fails")
}

fn health_response(state: &AppState) -> Response<BoxBody> {
    let snapshot = state.snapshot.current();
    let body = serde_json::json!({
        "status": "serving",
        "services": snapshot.registry.service_names(),
        "reflection": true,
    });
    text_response(StatusCode::OK, "application/json", serde_json::to_vec(&body).unwrap_or_default())
}

fn handle_reflect(parts: &http::request::Parts, body: &Bytes, state: &AppState) -> Response<BoxBody> {
    let content_type = parts.headers.get("content-type").and_then(|v| v.to_str().ok()).unwrap_or("");
    if reflection::is_binary_reflection_request(content_type) {
        return text_response(StatusCode::UNSUPPORTED_MEDIA_TYPE, "text/plain", "binary reflection is served on the native port");
    }

    let parsed: Result<ReflectionRequestBody, _> = serde_json::from_slice(body);
    let Ok(parsed) = parsed else {
        return text_response(StatusCode::BAD_REQUEST, "text/plain", "malformed reflection request");
    };

    let snapshot = state.snapshot.current();
    let request = ReflectionRequest { method: parsed.method, name: parsed.name };
    match reflection::handle(&snapshot, &request) {
        ReflectionResponse::Ok(json) => text_response(StatusCode::OK, "application/json", serde_json::to_vec(&json).unwrap_or_default()),
        ReflectionResponse::NotFound(msg) => {
            text_response(StatusCode::NOT_FOUND, "application/json", serde_json::to_vec(&serde_json::json!({"error": msg})).unwrap_or_default())
        }
        ReflectionResponse::UnsupportedMedia => text_response(StatusCode::UNSUPPORTED_MEDIA_TYPE, "text/plain", "unsupported media type"),
    }
}

#[derive(serde::Deserialize)]
struct ReflectionRequestBody {
    method: String,
    name: Option<String>,
}

async fn handle_rpc(parts: &http::request::Parts, body: Bytes, state: &AppState) -> Response<BoxBody> {
    let content_type = parts.headers.get("content-type").and_then(|v| v.to_str().ok()).unwrap_or("");
    let protocol = protocol::detect_protocol(content_type);

    let path = parts.uri.path().trim_start_matches('/');
    let Some((service_path, method_name)) = path.rsplit_once('/') else {
        return text_response(StatusCode::NOT_FOUND, "text/plain", "path must be /<service>/<method>");
    };

    let snapshot = state.snapshot.current();
    let Some(entry) = snapshot.registry.find(service_path, method_name) else {
        return json_error_or_trailer_response(protocol, tonic::Status::unimplemented(format!("no method {path}")));
    };

    let metadata = protocol::extract_metadata(
        parts
            .headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string()))),
    );

    let connect_timeout = parts.headers.get("connect-timeout-ms").and_then(|v| v.to_str().ok());
    let grpc_timeout = parts.headers.get("grpc-timeout").and_then(|v| v.to_str().ok());
    let timeout_ms = protocol::resolve_timeout_ms(connect_timeout, grpc_timeout);

    let cancel = CancellationToken::new();
    if let Some(ms) = timeout_ms {
        let cancel_for_timer = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            cancel_for_timer.cancel();
        });
    }

    let request_desc = entry.method.input();
    let response_desc = entry.method.output();
    let utils = DefaultUtils;

    let messages: Vec<Value> = match decode_messages(protocol, &body, &request_desc) {
        Ok(msgs) => msgs,
        Err(status) => return json_error_or_trailer_response(protocol, status),
    };

    match entry.shape {
        StreamShape::Unary => {
            let request = messages.into_iter().next().unwrap_or(Value::map());
            let outcome = dispatcher::dispatch_unary(
                &snapshot,
                entry,
                request,
                &metadata,
                &state.metrics,
                state.cel_enforcement,
                &state.regex_cache,
                &utils,
                state.validation_enabled,
            );
            unary_response(protocol, &response_desc, outcome)
        }
        StreamShape::ServerStreaming => {
            let request = messages.into_iter().next().unwrap_or(Value::map());
            let outcome = dispatcher::dispatch_server_stream(
                &snapshot,
                entry,
                request,
                &metadata,
                &state.metrics,
                state.cel_enforcement,
                &state.regex_cache,
                &utils,
                state.validation_enabled,
            );
            stream_response(protocol, &response_desc, outcome, &cancel).await
        }
        StreamShape::ClientStreaming => {
            let outcome = dispatcher::dispatch_client_stream(
                &snapshot,
                entry,
                messages,
                &metadata,
                state.validation_mode,
                &state.metrics,
                state.cel_enforcement,
                &state.regex_cache,
                &utils,
                &cancel,
                state.validation_enabled,
            );
            unary_response(protocol, &response_desc, outcome)
        }
        StreamShape::Bidi => {
            let outcome = dispatcher::dispatch_bidi_stream(
                &snapshot,
                entry,
                messages,
                &metadata,
                state.validation_mode,
                &state.metrics,
                state.cel_enforcement,
                &state.regex_cache,
                &utils,
                &cancel,
                state.validation_enabled,
            );
            stream_response(protocol, &response_desc, outcome, &cancel).await
        }
    }
}

fn decode_messages(
    protocol: WireProtocol,
    body: &Bytes,
    request_desc: &prost_reflect::MessageDescriptor,
) -> Result<Vec<Value>, tonic::Status> {
    let payloads: Vec<Vec<u8>> = match protocol {
        WireProtocol::Grpc | WireProtocol::GrpcWeb | WireProtocol::GrpcWebText => framing::decode_frames(body),
        WireProtocol::ConnectProto | WireProtocol::ConnectJson => vec![body.to_vec()],
    };

    payloads
        .iter()
        .map(|p| protocol::decode_body(protocol, p, request_desc))
        .collect::<mockrpc_core::Result<Vec<Value>>>()
        .map_err(|e| tonic::Status::invalid_argument(e.to_string()))
}

fn unary_response(protocol: WireProtocol, response_desc: &prost_reflect::MessageDescriptor, outcome: UnaryOutcome) -> Response<BoxBody> {
    match outcome {
        UnaryOutcome::Ok(response) => ok_response(protocol, response_desc, &response),
        UnaryOutcome::Err(status) => json_error_or_trailer_response(protocol, status),
    }
}

async fn stream_response(
    protocol: WireProtocol,
    response_desc: &prost_reflect::MessageDescriptor,
    outcome: StreamOutcome,
    cancel: &CancellationToken,
) -> Response<BoxBody> {
    match outcome {
        StreamOutcome::Err(status) => json_error_or_trailer_response(protocol, status),
        StreamOutcome::Ok { items, delay_ms, looping } => {
            let mut encoded = Vec::new();
            let mut iteration = 0usize;
            loop {
                for (index, item) in items.iter().enumerate() {
                    if cancel.is_cancelled() {
                        return json_error_or_trailer_response(protocol, tonic::Status::cancelled("stream cancelled during emission"));
                    }
                    if index > 0 || iteration > 0 {
                        if let Some(ms) = delay_ms {
                            tokio::time::sleep(Duration::from_millis(ms)).await;
                        }
                    }
                    match protocol::encode_body(protocol, &item.body, response_desc) {
                        Ok(bytes) => match protocol {
                            WireProtocol::ConnectJson => encoded.extend(bytes),
                            _ => encoded.extend(framing::encode_frame(&bytes)),
                        },
                        Err(e) => return json_error_or_trailer_response(protocol, tonic::Status::internal(e.to_string())),
                    }
                }
                if !looping || cancel.is_cancelled() {
                    break;
                }
                iteration += 1;
            }
            ok_body_response(protocol, encoded)
        }
    }
}

fn ok_response(protocol: WireProtocol, response_desc: &prost_reflect::MessageDescriptor, response: &DispatchResponse) -> Response<BoxBody> {
    match protocol::encode_body(protocol, &response.body, response_desc) {
        Ok(bytes) => {
            let framed = match protocol {
                WireProtocol::ConnectJson => bytes,
                _ => framing::encode_frame(&bytes),
            };
            let mut builder = Response::builder().status(StatusCode::OK).header("content-type", content_type_for(protocol));
            for (k, v) in &response.trailers {
                builder = builder.header(format!("trailer-{k}"), v);
            }
            builder.body(Full::new(Bytes::from(framed))).expect("building a response never fails")
        }
        Err(e) => json_error_or_trailer_response(protocol, tonic::Status::internal(e.to_string())),
    }
}

fn ok_body_response(protocol: WireProtocol, body: Vec<u8>) -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", content_type_for(protocol))
        .body(Full::new(Bytes::from(body)))
        .expect("building a response never fails")
}

fn content_type_for(protocol: WireProtocol) -> &'static str {
    match protocol {
        WireProtocol::Grpc => "application/grpc+proto",
        WireProtocol::GrpcWeb => "application/grpc-web+proto",
        WireProtocol::GrpcWebText => "application/grpc-web-text+proto",
        WireProtocol::ConnectJson => "application/json",
        WireProtocol::ConnectProto => "application/connect+proto",
    }
}

/// Maps a terminal `Status` to protocol-appropriate wire bytes: trailers for
/// binary families, a JSON error envelope `{code, message, details?}` for
/// Connect JSON, per spec §6's "Wire protocols on the combined port".
fn json_error_or_trailer_response(protocol: WireProtocol, status: tonic::Status) -> Response<BoxBody> {
    match protocol {
        WireProtocol::ConnectJson => {
            let body = serde_json::json!({
                "code": code_name(status.code()),
                "message": status.message(),
            });
            Response::builder()
                .status(http_status_for(status.code()))
                .header("content-type", "application/json")
                .body(Full::new(Bytes::from(serde_json::to_vec(&body).unwrap_or_default())))
                .expect("building a response never fails")
        }
        _ => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", content_type_for(protocol))
            .header("grpc-status", (status.code() as i32).to_string())
            .header("grpc-message", status.message())
            .body(Full::new(Bytes::new()))
            .expect("building a response never fails"),
    }
}

fn code_name(code: tonic::Code) -> &'static str {
    match code {
        tonic::Code::Ok => "ok",
        tonic::Code::Cancelled => "cancelled",
        tonic::Code::Unknown => "unknown",
        tonic::Code::InvalidArgument => "invalid_argument",
        tonic::Code::DeadlineExceeded => "deadline_exceeded",
        tonic::Code::NotFound => "not_found",
        tonic::Code::AlreadyExists => "already_exists",
        tonic::Code::PermissionDenied => "permission_denied",
        tonic::Code::ResourceExhausted => "resource_exhausted",
        tonic::Code::FailedPrecondition => "failed_precondition",
        tonic::Code::Aborted => "aborted",
        tonic::Code::OutOfRange => "out_of_range",
        tonic::Code::Unimplemented => "unimplemented",
        tonic::Code::Internal => "internal",
        tonic::Code::Unavailable => "unavailable",
        tonic::Code::DataLoss => "data_loss",
        tonic::Code::Unauthenticated => "unauthenticated",
    }
}

fn http_status_for(code: tonic::Code) -> StatusCode {
    match code {
        tonic::Code::Ok => StatusCode::OK,
        tonic::Code::InvalidArgument | tonic::Code::FailedPrecondition | tonic::Code::OutOfRange => StatusCode::BAD_REQUEST,
        tonic::Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        tonic::Code::PermissionDenied => StatusCode::FORBIDDEN,
        tonic::Code::NotFound | tonic::Code::Unimplemented => StatusCode::NOT_FOUND,
        tonic::Code::AlreadyExists | tonic::Code::Aborted => StatusCode::CONFLICT,
        tonic::Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        tonic::Code::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        tonic::Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        tonic::Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
