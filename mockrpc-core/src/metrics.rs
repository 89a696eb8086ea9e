//! Metrics (spec §3/§9): process-local counters for validation and rule
//! matching outcomes.
//!
//! Generalizes bankdemo's `static REQ_COUNTER: AtomicU64` into a struct with
//! one scalar counter per outcome and a label map for per-rule/per-violation
//! breakdowns, still backed by plain atomics and a mutex rather than a
//! metrics crate — no pack repo in this server's lineage depends on one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct Metrics {
    validation_checks_total: AtomicU64,
    validation_failures_total: AtomicU64,
    validation_failures_by_rule: Mutex<HashMap<String, u64>>,

    rule_matching_attempts_total: AtomicU64,
    rule_matching_matches_total: AtomicU64,
    rule_matching_misses_total: AtomicU64,
    rule_matching_matches_by_key: Mutex<HashMap<String, u64>>,
}

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub validation_checks_total: u64,
    pub validation_failures_total: u64,
    pub validation_failures_by_rule: HashMap<String, u64>,
    pub rule_matching_attempts_total: u64,
    pub rule_matching_matches_total: u64,
    pub rule_matching_misses_total: u64,
    pub rule_matching_matches_by_key: HashMap<String, u64>,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub fn record_validation(&self, violation_rules: &[String]) {
        self.validation_checks_total.fetch_add(1, Ordering::Relaxed);
        if violation_rules.is_empty() {
            return;
        }
        self.validation_failures_total.fetch_add(1, Ordering::Relaxed);
        let mut by_rule = self.validation_failures_by_rule.lock().expect("metrics mutex poisoned");
        for rule in violation_rules {
            *by_rule.entry(rule.clone()).or_insert(0) += 1;
        }
    }

    pub fn record_rule_match(&self, rule_key: &str, matched: bool) {
        self.rule_matching_attempts_total.fetch_add(1, Ordering::Relaxed);
        if matched {
            self.rule_matching_matches_total.fetch_add(1, Ordering::Relaxed);
            let mut by_key = self.rule_matching_matches_by_key.lock().expect("metrics mutex poisoned");
            *by_key.entry(rule_key.to_string()).or_insert(0) += 1;
        } else {
            self.rule_matching_misses_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Reads every counter under a held lock so the by-rule/by-key maps are
    /// consistent with the scalar totals at the moment of the call.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let by_rule = self.validation_failures_by_rule.lock().expect("metrics mutex poisoned");
        let by_key = self.rule_matching_matches_by_key.lock().expect("metrics mutex poisoned");
        MetricsSnapshot {
            validation_checks_total: self.validation_checks_total.load(Ordering::Relaxed),
            validation_failures_total: self.validation_failures_total.load(Ordering::Relaxed),
            validation_failures_by_rule: by_rule.clone(),
            rule_matching_attempts_total: self.rule_matching_attempts_total.load(Ordering::Relaxed),
            rule_matching_matches_total: self.rule_matching_matches_total.load(Ordering::Relaxed),
            rule_matching_misses_total: self.rule_matching_misses_total.load(Ordering::Relaxed),
            rule_matching_matches_by_key: by_key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_counters_track_checks_and_failures() {
        let metrics = Metrics::new();
        metrics.record_validation(&[]);
        metrics.record_validation(&["min_len".to_string(), "min_len".to_string()]);
        let snap = metrics.snapshot();
        assert_eq!(snap.validation_checks_total, 2);
        assert_eq!(snap.validation_failures_total, 1);
        assert_eq!(snap.validation_failures_by_rule.get("min_len"), Some(&2));
    }

    #[test]
    fn rule_matching_counters_track_hits_and_misses() {
        let metrics = Metrics::new();
        metrics.record_rule_match("a.b.c", true);
        metrics.record_rule_match("a.b.c", true);
        metrics.record_rule_match("x.y.z", false);
        let snap = metrics.snapshot();
        assert_eq!(snap.rule_matching_attempts_total, 3);
        assert_eq!(snap.rule_matching_matches_total, 2);
        assert_eq!(snap.rule_matching_misses_total, 1);
        assert_eq!(snap.rule_matching_matches_by_key.get("a.b.c"), Some(&2));
    }
}
