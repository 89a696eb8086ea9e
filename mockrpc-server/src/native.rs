//! Native binary port (spec §4.9): a second, gRPC-only port alongside the
//! combined port, carrying real HTTP/2 trailers and wired with
//! `tonic_reflection`'s binary reflection services — the form a native gRPC
//! client (grpcurl, a generated stub) expects, rather than the JSON/Web
//! framing the combined port also understands.
//!
//! The descriptor pool is assembled at runtime rather than compiled in via
//! `tonic::include_file_descriptor_set!`, so every registered method is
//! served by one dynamic catch-all service instead of one generated
//! `*Server` per proto service. `NamedService::NAME` is normally a fixed
//! service name tonic's router matches as a path prefix; giving it the
//! empty string makes every `/service/method` path match, which is what
//! lets one service stand in for every service the descriptor pool knows
//! about.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Request, Response};
use http_body::Frame;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, StreamBody};
use tonic::server::NamedService;
use tower::Service;

use mockrpc_core::dispatcher::{self, CancellationToken};
use mockrpc_core::protocol;
use mockrpc_core::registry::StreamShape;
use mockrpc_core::template::DefaultUtils;
use mockrpc_core::value::Value;

use crate::state::AppState;

pub type NativeBody = BoxBody<Bytes, Infallible>;

#[derive(Clone)]
pub struct DynamicGrpcService {
    pub state: AppState,
}

impl NamedService for DynamicGrpcService {
    const NAME: &'static str = "";
}

impl<ReqBody> Service<Request<ReqBody>> for DynamicGrpcService
where
    ReqBody: http_body::Body<Data = Bytes> + Send + 'static,
    ReqBody::Error: Send,
{
    type Response = Response<NativeBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let state = self.state.clone();
        Box::pin(async move { Ok(handle(req, state).await) })
    }
}

async fn handle<ReqBody>(req: Request<ReqBody>, state: AppState) -> Response<NativeBody>
where
    ReqBody: http_body::Body<Data = Bytes> + Send + 'static,
    ReqBody::Error: Send,
{
    let (parts, body) = req.into_parts();

    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return trailers_only(tonic::Status::invalid_argument("failed to read request body")),
    };

    let path = parts.uri.path().trim_start_matches('/');
    let Some((service_path, method_name)) = path.rsplit_once('/') else {
        return trailers_only(tonic::Status::unimplemented("path must be /<service>/<method>"));
    };

    let snapshot = state.snapshot.current();
    let Some(entry) = snapshot.registry.find(service_path, method_name) else {
        return trailers_only(tonic::Status::unimplemented(format!("no method /{path}")));
    };

    let metadata = protocol::extract_metadata(
        parts
            .headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string()))),
    );
    let timeout_ms = protocol::resolve_timeout_ms(None, parts.headers.get("grpc-timeout").and_then(|v| v.to_str().ok()));

    let cancel = CancellationToken::new();
    if let Some(ms) = timeout_ms {
        let timer_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            timer_cancel.cancel();
        });
    }

    let request_desc = entry.method.input();
    let response_desc = entry.method.output();
    let utils = DefaultUtils;

    let frames = crate::framing::decode_frames(&body_bytes);
    let messages: Result<Vec<Value>, tonic::Status> = frames
        .iter()
        .map(|p| protocol::decode_body(protocol::WireProtocol::Grpc, p, &request_desc))
        .collect::<mockrpc_core::Result<Vec<Value>>>()
        .map_err(|e| tonic::Status::invalid_argument(e.to_string()));
    let messages = match messages {
        Ok(m) => m,
        Err(status) => return trailers_only(status),
    };

    match entry.shape {
        StreamShape::Unary => {
            let request = messages.into_iter().next().unwrap_or(Value::map());
            match dispatcher::dispatch_unary(
                &snapshot,
                entry,
                request,
                &metadata,
                &state.metrics,
                state.cel_enforcement,
                &state.regex_cache,
                &utils,
                state.validation_enabled,
            ) {
                dispatcher::UnaryOutcome::Ok(response) => encode_ok(&response_desc, &response.body, &response.trailers),
                dispatcher::UnaryOutcome::Err(status) => trailers_only(status),
            }
        }
        StreamShape::ServerStreaming => {
            let request = messages.into_iter().next().unwrap_or(Value::map());
            match dispatcher::dispatch_server_stream(
                &snapshot,
                entry,
                request,
                &metadata,
                &state.metrics,
                state.cel_enforcement,
                &state.regex_cache,
                &utils,
                state.validation_enabled,
            ) {
                dispatcher::StreamOutcome::Ok { items, .. } => encode_stream(&response_desc, items),
                dispatcher::StreamOutcome::Err(status) => trailers_only(status),
            }
        }
        StreamShape::ClientStreaming => {
            match dispatcher::dispatch_client_stream(
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
            ) {
                dispatcher::UnaryOutcome::Ok(response) => encode_ok(&response_desc, &response.body, &response.trailers),
                dispatcher::UnaryOutcome::Err(status) => trailers_only(status),
            }
        }
        StreamShape::Bidi => {
            match dispatcher::dispatch_bidi_stream(
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
            ) {
                dispatcher::StreamOutcome::Ok { items, .. } => encode_stream(&response_desc, items),
                dispatcher::StreamOutcome::Err(status) => trailers_only(status),
            }
        }
    }
}

fn encode_ok(response_desc: &prost_reflect::MessageDescriptor, body: &Value, extra_trailers: &std::collections::BTreeMap<String, String>) -> Response<NativeBody> {
    match protocol::encode_body(protocol::WireProtocol::Grpc, body, response_desc) {
        Ok(bytes) => ok_response(crate::framing::encode_frame(&bytes), extra_trailers, tonic::Code::Ok, ""),
        Err(e) => trailers_only(tonic::Status::internal(e.to_string())),
    }
}

fn encode_stream(response_desc: &prost_reflect::MessageDescriptor, items: Vec<dispatcher::StreamItem>) -> Response<NativeBody> {
    let mut payload = Vec::new();
    for item in &items {
        match protocol::encode_body(protocol::WireProtocol::Grpc, &item.body, response_desc) {
            Ok(bytes) => payload.extend(crate::framing::encode_frame(&bytes)),
            Err(e) => return trailers_only(tonic::Status::internal(e.to_string())),
        }
    }
    ok_response(payload, &std::collections::BTreeMap::new(), tonic::Code::Ok, "")
}

fn ok_response(data: Vec<u8>, extra_trailers: &std::collections::BTreeMap<String, String>, code: tonic::Code, message: &str) -> Response<NativeBody> {
    let mut trailer_map = HeaderMap::new();
    trailer_map.insert("grpc-status", HeaderValue::from_str(&(code as i32).to_string()).unwrap_or(HeaderValue::from_static("0")));
    if !message.is_empty() {
        trailer_map.insert("grpc-message", HeaderValue::from_str(message).unwrap_or(HeaderValue::from_static("")));
    }
    for (k, v) in extra_trailers {
        if k.eq_ignore_ascii_case("grpc-status") || k.eq_ignore_ascii_case("grpc-message") {
            continue;
        }
        if let (Ok(name), Ok(value)) = (http::header::HeaderName::try_from(k.to_lowercase()), HeaderValue::from_str(v)) {
            trailer_map.insert(name, value);
        }
    }

    let frames: Vec<Result<Frame<Bytes>, Infallible>> = vec![Ok(Frame::data(Bytes::from(data))), Ok(Frame::trailers(trailer_map))];
    let body: NativeBody = StreamBody::new(tokio_stream::iter(frames)).boxed();

    Response::builder()
        .status(200)
        .header("content-type", "application/grpc+proto")
        .header("grpc-encoding", "identity")
        .body(body)
        .expect("building a response never fails")
}

fn trailers_only(status: tonic::Status) -> Response<NativeBody> {
    let mut trailer_map = HeaderMap::new();
    trailer_map.insert(
        "grpc-status",
        HeaderValue::from_str(&(status.code() as i32).to_string()).unwrap_or(HeaderValue::from_static("2")),
    );
    trailer_map.insert("grpc-message", HeaderValue::from_str(status.message()).unwrap_or(HeaderValue::from_static("")));

    let frames: Vec<Result<Frame<Bytes>, Infallible>> = vec![Ok(Frame::trailers(trailer_map))];
    let body: NativeBody = StreamBody::new(tokio_stream::iter(frames)).boxed();

    Response::builder()
        .status(200)
        .header("content-type", "application/grpc+proto")
        .body(body)
        .expect("building a response never fails")
}

/// Builds the encoded `FileDescriptorSet` tonic_reflection expects, from the
/// descriptor pool assembled at snapshot-build time (spec §4.3). Reflection
/// reflects the snapshot in effect when the native port started; a config
/// reload updates dispatch immediately but the reflection service keeps
/// describing the file set it was built with until the process restarts.
pub fn encode_reflection_file_descriptor_set(snapshot: &mockrpc_core::Snapshot) -> Vec<u8> {
    use prost::Message;
    let files: Vec<_> = snapshot.descriptors.pool().files().map(|f| f.file_descriptor_proto().clone()).collect();
    let set = prost_types::FileDescriptorSet { file: files };
    set.encode_to_vec()
}
