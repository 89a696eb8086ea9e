//! Bundles everything a reload rebuilds — descriptor graph, validation IR,
//! rule index, and service registry — into one value that can be swapped in
//! atomically.
//!
//! No crate in this lineage depends on `arc-swap`, so reload uses
//! `RwLock<Arc<Snapshot>>`: handlers clone the `Arc` under a short read
//! lock and then work against an immutable snapshot for the rest of the
//! request, while a reload builds the next snapshot fully off to the side
//! before taking the write lock for the swap itself.

use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::config::ValidationSource;
use crate::constraints::{self, ir::IrMap};
use crate::descriptor::{DescriptorGraph, LoadReport};
use crate::registry::ServiceRegistry;
use crate::rules::RuleIndex;

pub struct Snapshot {
    pub descriptors: DescriptorGraph,
    pub validation_ir: IrMap,
    pub rules: RuleIndex,
    pub registry: ServiceRegistry,
    pub load_report: LoadReport,
    pub rule_errors: Vec<(String, String)>,
}

impl Snapshot {
    pub fn build(
        proto_dir: &Path,
        proto_include_paths: &[std::path::PathBuf],
        rule_dir: &Path,
        validation_source: ValidationSource,
    ) -> Self {
        let (descriptors, load_report) = DescriptorGraph::load_dir(proto_dir, proto_include_paths);
        let validation_ir = constraints::extract_all(&descriptors, validation_source);
        let registry = ServiceRegistry::build(&descriptors);
        let (rules, rule_errors) = RuleIndex::load_dir(rule_dir);

        Snapshot { descriptors, validation_ir, rules, registry, load_report, rule_errors }
    }

    pub fn empty() -> Self {
        Snapshot {
            descriptors: DescriptorGraph::empty(),
            validation_ir: IrMap::default(),
            rules: RuleIndex::empty(),
            registry: ServiceRegistry::default(),
            load_report: LoadReport::default(),
            rule_errors: Vec::new(),
        }
    }
}

/// A hot-swappable handle to the current snapshot.
pub struct SnapshotHandle {
    inner: RwLock<Arc<Snapshot>>,
}

impl SnapshotHandle {
    pub fn new(snapshot: Snapshot) -> Self {
        SnapshotHandle { inner: RwLock::new(Arc::new(snapshot)) }
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.inner.read().expect("snapshot lock poisoned").clone()
    }

    /// Swaps in a fully-built snapshot. Callers build the new `Snapshot`
    /// off the hot path (it touches the filesystem) and only take the
    /// write lock for the pointer swap itself.
    pub fn swap(&self, next: Snapshot) {
        let mut guard = self.inner.write().expect("snapshot lock poisoned");
        *guard = Arc::new(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot_has_no_services() {
        let snapshot = Snapshot::empty();
        assert!(snapshot.registry.entries().is_empty());
        assert!(snapshot.validation_ir.is_empty());
    }

    #[test]
    fn handle_swap_replaces_the_visible_snapshot() {
        let handle = SnapshotHandle::new(Snapshot::empty());
        let before = handle.current();
        handle.swap(Snapshot::empty());
        let after = handle.current();
        assert!(!Arc::ptr_eq(&before, &after));
    }
}
