// src/core/proxy/reconfig.rs

//! The Reconfiguration Pipeline (§4.K): parse and validate every document in
//! a batch, diff each against the pool it would replace, create or update
//! pools that changed, scatter the new config version to every worker, and
//! retire pools no longer named by the batch.
//!
//! Idempotence guarantee: resubmitting byte-identical documents is a no-op
//! — no version bump, no counted reconfiguration, no worker scatter — since
//! the pipeline tracks a fingerprint of the last-applied raw document per
//! pool name rather than relying on every downstream consumer to notice
//! nothing changed.
//!
//! Generalizes the teacher's config-reload path (`config.rs`'s
//! `Config::from_file` + `validate()`) from "one process-wide config
//! replaced on SIGHUP" to "N named pool configs replaced independently, live,
//! from a push channel."

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::core::errors::HiveError;
use crate::core::metrics;
use crate::core::proxy::config_doc::{self, PoolDefaults};
use crate::core::proxy::proxy_main::ProxyMain;

#[derive(Debug, Default, Clone)]
pub struct ReconfigReport {
    pub applied: Vec<String>,
    pub noop: Vec<String>,
    pub retired: Vec<String>,
    pub rejected: Vec<(String, String)>,
}

/// Cheap pre-parse used only to order a batch, not to validate it — a
/// document that fails this check still gets a full parse (and a proper
/// rejection) in the main loop below.
fn names_default_pool(raw: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| v.get("name").and_then(|n| n.as_str().map(str::to_string)))
        .is_some_and(|name| name == "default")
}

fn fingerprint(raw: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    raw.hash(&mut hasher);
    hasher.finish()
}

pub struct ReconfigPipeline {
    proxy_main: Arc<ProxyMain>,
    defaults: PoolDefaults,
    last_applied: Mutex<HashMap<String, u64>>,
}

impl ReconfigPipeline {
    pub fn new(proxy_main: Arc<ProxyMain>, defaults: PoolDefaults) -> Self {
        Self {
            proxy_main,
            defaults,
            last_applied: Mutex::new(HashMap::new()),
        }
    }

    /// Applies a batch of raw management-channel documents. A document that
    /// fails to parse is rejected individually (recorded in the report) and
    /// does not prevent the rest of the batch from applying — one tenant's
    /// bad push shouldn't wedge every other pool's reconfiguration.
    pub fn apply_documents(&self, raw_documents: &[String]) -> ReconfigReport {
        let mut report = ReconfigReport::default();
        let mut seen_names = HashSet::new();

        // The `default` pool is processed first so default-bucket clients
        // observe it as early as possible within the batch (§4.K step "a
        // default pool is processed first"). Stable sort preserves the
        // relative order of every other document.
        let mut ordered: Vec<&String> = raw_documents.iter().collect();
        ordered.sort_by_key(|raw| if names_default_pool(raw) { 0 } else { 1 });

        for raw in ordered {
            match config_doc::parse_document(raw, &self.defaults) {
                Ok((name, port, config)) => {
                    seen_names.insert(name.clone());
                    let digest = fingerprint(raw);
                    let unchanged = self.last_applied.lock().get(&name) == Some(&digest);
                    if unchanged {
                        metrics::RECONFIG_NOOP_TOTAL.inc();
                        report.noop.push(name);
                        continue;
                    }
                    let pool = self.proxy_main.upsert_pool(&name, port, config);
                    self.last_applied.lock().insert(name.clone(), digest);
                    metrics::RECONFIG_APPLIED_TOTAL.inc();
                    info!(pool = %name, version = pool.version(), "reconfiguration applied");
                    report.applied.push(name);
                }
                Err(e) => {
                    let reason = e.kind();
                    metrics::RECONFIG_REJECTED_TOTAL
                        .with_label_values(&[&format!("{reason:?}")])
                        .inc();
                    warn!(error = %e, "rejected reconfiguration document");
                    report.rejected.push((raw.clone(), e.to_string()));
                }
            }
        }

        for name in self.proxy_main.pool_names() {
            if seen_names.contains(&name) {
                continue;
            }
            // The NULL bucket is a tenant-less fallback pool and is never
            // retired by reconfig, even when a batch omits it (§4.G, §4.K).
            if self.proxy_main.pool(&name).is_some_and(|p| p.is_null_bucket()) {
                continue;
            }
            match self.proxy_main.remove_pool(&name) {
                Ok(()) => {
                    self.last_applied.lock().remove(&name);
                    report.retired.push(name);
                }
                Err(e) => warn!(pool = %name, error = %e, "failed to retire stale pool"),
            }
        }

        report
    }

    /// Applies the flat key-value bootstrap form (§6's alternative config),
    /// used once at startup rather than pushed over the management channel.
    pub fn apply_kv_config(&self, kv: &HashMap<String, String>) -> Result<ReconfigReport, HiveError> {
        let pools = config_doc::parse_kv_config(kv, &self.defaults)?;
        let mut report = ReconfigReport::default();
        for (name, port, config) in pools {
            let pool = self.proxy_main.upsert_pool(&name, port, config);
            metrics::RECONFIG_APPLIED_TOTAL.inc();
            report.applied.push(name);
            info!(pool = %pool.name, port, "bootstrap pool created");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc(name: &str, port: u16) -> String {
        format!(
            r#"{{"name": "{name}", "nodeLocator": "ketama", "listen_port": {port},
                "nodes": [{{"hostname": "127.0.0.1", "ports": {{"direct": 11211}}}}]}}"#
        )
    }

    #[test]
    fn reapplying_an_identical_document_is_a_noop() {
        let main = ProxyMain::new(1);
        let pipeline = ReconfigPipeline::new(main, PoolDefaults::default());
        let doc = sample_doc("a", 11311);
        let first = pipeline.apply_documents(&[doc.clone()]);
        assert_eq!(first.applied, vec!["a".to_string()]);
        let second = pipeline.apply_documents(&[doc]);
        assert_eq!(second.noop, vec!["a".to_string()]);
        assert!(second.applied.is_empty());
    }

    #[test]
    fn pools_missing_from_a_later_batch_are_retired() {
        let main = ProxyMain::new(1);
        let pipeline = ReconfigPipeline::new(main, PoolDefaults::default());
        pipeline.apply_documents(&[sample_doc("a", 11311)]);
        let report = pipeline.apply_documents(&[sample_doc("b", 11312)]);
        assert_eq!(report.applied, vec!["b".to_string()]);
        assert_eq!(report.retired, vec!["a".to_string()]);
    }

    #[test]
    fn the_null_bucket_survives_a_batch_that_omits_it() {
        let main = ProxyMain::new(1);
        let pipeline = ReconfigPipeline::new(main, PoolDefaults::default());
        pipeline.apply_documents(&[sample_doc("default", 11211), sample_doc("tenant-a", 11311)]);
        let report = pipeline.apply_documents(&[sample_doc("tenant-b", 11312)]);
        assert_eq!(report.retired, vec!["tenant-a".to_string()]);
        assert!(!report.retired.contains(&"default".to_string()));
        assert!(pipeline.proxy_main.pool("default").is_some());
    }

    #[test]
    fn the_default_pool_is_applied_before_others_in_the_same_batch() {
        let main = ProxyMain::new(1);
        let pipeline = ReconfigPipeline::new(main, PoolDefaults::default());
        let report = pipeline.apply_documents(&[sample_doc("tenant-a", 11311), sample_doc("default", 11211)]);
        assert_eq!(report.applied, vec!["default".to_string(), "tenant-a".to_string()]);
    }

    #[test]
    fn a_bad_document_is_rejected_without_blocking_the_rest_of_the_batch() {
        let main = ProxyMain::new(1);
        let pipeline = ReconfigPipeline::new(main, PoolDefaults::default());
        let report = pipeline.apply_documents(&[sample_doc("a", 11311), "not json".to_string()]);
        assert_eq!(report.applied, vec!["a".to_string()]);
        assert_eq!(report.rejected.len(), 1);
    }
}
