//! `Config::from_env()`: the server's entire configuration surface is
//! environment variables (spec §6) — there is no CLI flag parser, matching
//! the environment-only configuration model the spec documents.

use std::path::PathBuf;

use crate::validation::CelEnforcement;

#[derive(Debug, Clone)]
pub struct Config {
    pub proto_dir: PathBuf,
    pub proto_include_paths: Vec<PathBuf>,
    pub rule_dir: PathBuf,
    pub connect_port: u16,
    pub connect_enabled: bool,
    pub connect_tls_cert_path: Option<PathBuf>,
    pub connect_tls_key_path: Option<PathBuf>,
    pub grpc_port_plaintext: u16,
    pub grpc_port_tls: Option<u16>,
    pub cel_enforcement: CelEnforcement,
    pub validation_source: ValidationSource,
    pub reload_signal: ReloadSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadSignal {
    /// Reload only at startup; no live reload.
    None,
    /// Reload on SIGHUP.
    Sighup,
}

/// Which constraint dialect(s) the Constraint Extractor attempts, selected
/// by `VALIDATION_SOURCE` (spec §6). `Auto` tries `protovalidate` then falls
/// back to `pgv` per field, matching the extractor's original dialect-
/// agnostic walk; `Pgv`/`Protovalidate` commit to one dialect only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationSource {
    Auto,
    Pgv,
    Protovalidate,
}

impl Config {
    /// Reads configuration from the environment, falling back to documented
    /// defaults for anything unset or malformed — a bad env var never
    /// panics the process at startup, it just falls back.
    pub fn from_env() -> Self {
        Config {
            proto_dir: env_path("PROTO_DIR", "./protos"),
            proto_include_paths: env_path_list("PROTO_INCLUDE_PATHS"),
            rule_dir: env_path("RULE_DIR", "./rules"),
            connect_port: env_u16("CONNECT_PORT", 8080),
            connect_enabled: env_bool("CONNECT_ENABLED", true),
            connect_tls_cert_path: env_opt_path("CONNECT_TLS_CERT_PATH"),
            connect_tls_key_path: env_opt_path("CONNECT_TLS_KEY_PATH"),
            grpc_port_plaintext: env_u16("GRPC_PORT_PLAINTEXT", 50051),
            grpc_port_tls: env_opt_u16("GRPC_PORT_TLS"),
            cel_enforcement: env_cel_enforcement("VALIDATION_CEL_MESSAGE"),
            validation_source: env_validation_source("VALIDATION_SOURCE"),
            reload_signal: env_reload_signal("RELOAD_SIGNAL"),
        }
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

fn env_opt_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().map(PathBuf::from)
}

fn env_path_list(key: &str) -> Vec<PathBuf> {
    std::env::var(key)
        .ok()
        .map(|v| v.split(':').filter(|s| !s.is_empty()).map(PathBuf::from).collect())
        .unwrap_or_default()
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_opt_u16(key: &str) -> Option<u16> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key).ok().map(|v| v != "false" && v != "0").unwrap_or(default)
}

fn env_validation_source(key: &str) -> ValidationSource {
    match std::env::var(key).ok().as_deref() {
        Some("pgv") => ValidationSource::Pgv,
        Some("protovalidate") => ValidationSource::Protovalidate,
        _ => ValidationSource::Auto,
    }
}

fn env_cel_enforcement(key: &str) -> CelEnforcement {
    match std::env::var(key).ok().as_deref() {
        Some("experimental") => CelEnforcement::Experimental,
        _ => CelEnforcement::Off,
    }
}

fn env_reload_signal(key: &str) -> ReloadSignal {
    match std::env::var(key).ok().as_deref() {
        Some("sighup") => ReloadSignal::Sighup,
        _ => ReloadSignal::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_u16_falls_back_on_malformed_value() {
        // SAFETY: test-only, single-threaded access to this one var.
        unsafe { std::env::set_var("MOCKRPC_TEST_PORT", "not-a-number") };
        assert_eq!(env_u16("MOCKRPC_TEST_PORT", 1234), 1234);
        unsafe { std::env::remove_var("MOCKRPC_TEST_PORT") };
    }

    #[test]
    fn env_path_list_splits_on_colon() {
        unsafe { std::env::set_var("MOCKRPC_TEST_PATHS", "/a:/b:/c") };
        let paths = env_path_list("MOCKRPC_TEST_PATHS");
        assert_eq!(paths, vec![PathBuf::from("/a"), PathBuf::from("/b"), PathBuf::from("/c")]);
        unsafe { std::env::remove_var("MOCKRPC_TEST_PATHS") };
    }

    #[test]
    fn unset_cel_enforcement_defaults_to_off() {
        unsafe { std::env::remove_var("MOCKRPC_TEST_CEL") };
        assert_eq!(env_cel_enforcement("MOCKRPC_TEST_CEL"), CelEnforcement::Off);
    }

    #[test]
    fn validation_source_recognizes_both_dialect_names_and_defaults_to_auto() {
        unsafe { std::env::set_var("MOCKRPC_TEST_SOURCE", "pgv") };
        assert_eq!(env_validation_source("MOCKRPC_TEST_SOURCE"), ValidationSource::Pgv);
        unsafe { std::env::set_var("MOCKRPC_TEST_SOURCE", "protovalidate") };
        assert_eq!(env_validation_source("MOCKRPC_TEST_SOURCE"), ValidationSource::Protovalidate);
        unsafe { std::env::remove_var("MOCKRPC_TEST_SOURCE") };
        assert_eq!(env_validation_source("MOCKRPC_TEST_SOURCE"), ValidationSource::Auto);
    }
}
