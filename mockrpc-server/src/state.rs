//! Shared façade state: everything a request handler on either port needs,
//! cloned cheaply behind `Arc`s so the hot path never takes a write lock.

use std::sync::Arc;

use mockrpc_core::{Config, Metrics, SnapshotHandle};

use mockrpc_core::dispatcher::ValidationMode;
use mockrpc_core::validation::{CelEnforcement, RegexCache};

#[derive(Clone)]
pub struct AppState {
    pub snapshot: Arc<SnapshotHandle>,
    pub metrics: Arc<Metrics>,
    pub regex_cache: Arc<RegexCache>,
    pub config: Arc<Config>,
    pub validation_enabled: bool,
    pub validation_mode: ValidationMode,
    pub cel_enforcement: CelEnforcement,
    pub connect_cors_enabled: bool,
}

impl AppState {
    pub fn from_config(config: Config) -> Self {
        let snapshot = mockrpc_core::Snapshot::build(
            &config.proto_dir,
            &config.proto_include_paths,
            &config.rule_dir,
            config.validation_source,
        );
        let cel_enforcement = config.cel_enforcement;
        AppState {
            snapshot: Arc::new(SnapshotHandle::new(snapshot)),
            metrics: Arc::new(Metrics::new()),
            regex_cache: Arc::new(RegexCache::new()),
            validation_enabled: env_bool("VALIDATION_ENABLED", true),
            validation_mode: env_validation_mode("VALIDATION_MODE"),
            cel_enforcement,
            connect_cors_enabled: env_bool("CONNECT_CORS_ENABLED", false),
            config: Arc::new(config),
        }
    }

    /// Rebuilds a fresh snapshot off to the side and swaps it in atomically,
    /// per spec §5's reload contract.
    pub fn reload(&self) {
        let next = mockrpc_core::Snapshot::build(
            &self.config.proto_dir,
            &self.config.proto_include_paths,
            &self.config.rule_dir,
            self.config.validation_source,
        );
        eprintln!(
            "reload: {} proto file(s) loaded, {} rule document(s) indexed",
            next.load_report.loaded_files.len(),
            next.rules.len()
        );
        self.snapshot.swap(next);
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key).ok().map(|v| v != "false" && v != "0").unwrap_or(default)
}

fn env_validation_mode(key: &str) -> ValidationMode {
    match std::env::var(key).ok().as_deref() {
        Some("aggregate") => ValidationMode::Aggregate,
        _ => ValidationMode::PerMessage,
    }
}
