mod combined;
mod framing;
mod native;
mod reflection;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use mockrpc_core::Config;
use state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env();
    let state = AppState::from_config(config);

    eprintln!(
        "snapshot loaded: {} proto file(s), {} rule document(s), {} method(s)",
        state.snapshot.current().load_report.loaded_files.len(),
        state.snapshot.current().rules.len(),
        state.snapshot.current().registry.entries().len()
    );

    let shutdown = CancellationToken::new();

    if matches!(state.config.reload_signal, mockrpc_core::config::ReloadSignal::Sighup) {
        spawn_reload_listener(state.clone());
    }

    let mut handles = Vec::new();
    if state.config.connect_enabled {
        handles.push(tokio::spawn(run_combined_port(state.clone(), shutdown.clone())));
    } else {
        eprintln!("combined port: CONNECT_ENABLED=false, not starting");
    }
    handles.push(tokio::spawn(run_native_port(
        state.clone(),
        state.config.grpc_port_plaintext,
        false,
        shutdown.clone(),
    )));
    if let Some(tls_port) = state.config.grpc_port_tls {
        handles.push(tokio::spawn(run_native_port(state.clone(), tls_port, true, shutdown.clone())));
    }

    tokio::signal::ctrl_c().await.ok();
    eprintln!("shutting down...");
    shutdown.cancel();

    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}

#[cfg(unix)]
fn spawn_reload_listener(state: AppState) {
    use tokio::signal::unix::{signal, SignalKind};
    tokio::spawn(async move {
        let Ok(mut sighup) = signal(SignalKind::hangup()) else {
            eprintln!("reload: failed to install SIGHUP handler");
            return;
        };
        loop {
            sighup.recv().await;
            eprintln!("reload: SIGHUP received, rebuilding snapshot");
            state.reload();
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_listener(_state: AppState) {
    eprintln!("reload: RELOAD_SIGNAL=sighup is only supported on unix platforms");
}

async fn run_combined_port(state: AppState, shutdown: CancellationToken) {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.connect_port));
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("combined port: failed to bind {addr}: {e}");
            return;
        }
    };
    eprintln!("combined port listening on {addr}");

    let tls_acceptor = build_tls_acceptor(&state);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let Ok((stream, _peer)) = accepted else { continue };
                let state = state.clone();
                let tls_acceptor = tls_acceptor.clone();
                tokio::spawn(async move {
                    let io = match tls_acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => Ok(TokioIo::new(tls_stream)),
                            Err(e) => {
                                eprintln!("combined port: TLS handshake failed: {e}");
                                Err(())
                            }
                        },
                        None => Ok(TokioIo::new(stream)),
                    };
                    let Ok(io) = io else { return };

                    let service = service_fn(move |req| {
                        let state = state.clone();
                        async move { combined::serve(req, state).await }
                    });

                    if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await
                    {
                        eprintln!("combined port: connection error: {e}");
                    }
                });
            }
        }
    }
}

/// Builds the native binary port's reflection services once, from the
/// snapshot in effect at startup, and wires them alongside the dynamic
/// dispatch catch-all. Called once per configured native port (`GRPC_PORT_PLAINTEXT`
/// always, plus `GRPC_PORT_TLS` when set); TLS falls back to plaintext with a
/// logged warning when the configured cert/key is missing or unreadable, per
/// spec §4.9.
async fn run_native_port(state: AppState, port: u16, want_tls: bool, shutdown: CancellationToken) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let descriptor_set = native::encode_reflection_file_descriptor_set(&state.snapshot.current());
    let reflection_v1 = match tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(&descriptor_set)
        .build_v1()
    {
        Ok(svc) => svc,
        Err(e) => {
            eprintln!("native port: failed to build reflection v1 service: {e}");
            return;
        }
    };
    let reflection_v1alpha = match tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(&descriptor_set)
        .build_v1alpha()
    {
        Ok(svc) => svc,
        Err(e) => {
            eprintln!("native port: failed to build reflection v1alpha service: {e}");
            return;
        }
    };

    let dynamic_service = native::DynamicGrpcService { state: state.clone() };

    let mut builder = Server::builder();
    if want_tls {
        match tls_server_config(&state) {
            Some(tls_config) => {
                builder = match builder.tls_config(tls_config) {
                    Ok(b) => b,
                    Err(e) => {
                        eprintln!("native port: invalid TLS config on {addr}, falling back to plaintext: {e}");
                        Server::builder()
                    }
                };
            }
            None => eprintln!("native port: GRPC_PORT_TLS set but CONNECT_TLS_CERT_PATH/CONNECT_TLS_KEY_PATH missing or unreadable, serving {addr} as plaintext"),
        }
    }

    eprintln!("native port listening on {addr}");

    let result = builder
        .add_service(reflection_v1)
        .add_service(reflection_v1alpha)
        .add_service(dynamic_service)
        .serve_with_shutdown(addr, async move {
            shutdown.cancelled().await;
        })
        .await;

    if let Err(e) = result {
        eprintln!("native port: server error: {e}");
    }
}

fn tls_server_config(state: &AppState) -> Option<tonic::transport::ServerTlsConfig> {
    let cert_path = state.config.connect_tls_cert_path.as_ref()?;
    let key_path = state.config.connect_tls_key_path.as_ref()?;
    let cert = std::fs::read(cert_path).map_err(|e| eprintln!("native port: failed to read TLS cert {cert_path:?}: {e}")).ok()?;
    let key = std::fs::read(key_path).map_err(|e| eprintln!("native port: failed to read TLS key {key_path:?}: {e}")).ok()?;
    let identity = tonic::transport::Identity::from_pem(cert, key);
    Some(tonic::transport::ServerTlsConfig::new().identity(identity))
}

fn build_tls_acceptor(state: &AppState) -> Option<tokio_rustls::TlsAcceptor> {
    let cert_path = state.config.connect_tls_cert_path.as_ref()?;
    let key_path = state.config.connect_tls_key_path.as_ref()?;

    let cert_bytes = std::fs::read(cert_path)
        .map_err(|e| eprintln!("combined port: failed to read TLS cert {cert_path:?}: {e}, falling back to plaintext"))
        .ok()?;
    let key_bytes = std::fs::read(key_path)
        .map_err(|e| eprintln!("combined port: failed to read TLS key {key_path:?}: {e}, falling back to plaintext"))
        .ok()?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_bytes.as_slice()).filter_map(|c| c.ok()).collect();
    let key = rustls_pemfile::private_key(&mut key_bytes.as_slice()).ok().flatten()?;

    if certs.is_empty() {
        eprintln!("combined port: no certificates found in {cert_path:?}, falling back to plaintext");
        return None;
    }

    let config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| eprintln!("combined port: invalid TLS cert/key pair: {e}, falling back to plaintext"))
        .ok()?;

    Some(tokio_rustls::TlsAcceptor::from(Arc::new(config)))
}
