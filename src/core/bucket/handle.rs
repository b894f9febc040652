// src/core/bucket/handle.rs

//! The Bucket Handle: a reference-counted handle for a single embedded cache
//! engine instance with a four-state lifecycle (§4.I).
//!
//! State transitions and the refcount/active-callers invariants follow
//! `bucket_state_t` in the original bucket engine exactly: a handle's engine
//! vtable is only meaningful in `Running`; `active_callers` is only ever
//! non-zero there; and the handle cannot advance past `StopRequested` while
//! callers are still in flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::core::bucket::engine::EngineOps;
use crate::core::errors::HiveError;
use crate::core::metrics;

/// The lifecycle state of a bucket handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketState {
    Null,
    Running,
    StopRequested,
    Stopping,
    Stopped,
}

impl BucketState {
    pub fn name(self) -> &'static str {
        match self {
            BucketState::Null => "NULL",
            BucketState::Running => "running",
            BucketState::StopRequested => "stop requested",
            BucketState::Stopping => "stopping",
            BucketState::Stopped => "stopped",
        }
    }
}

/// Fields mutated together under `inner.lock`: refcount, active-callers,
/// state, and the disconnect cookie. The original guards exactly this set
/// with a single per-handle lock.
struct Inner {
    state: BucketState,
    refcount: u64,
    active_callers: u64,
    teardown_cookie: Option<u64>,
}

/// A reference-counted handle for a single embedded cache engine instance.
pub struct BucketHandle {
    pub name: String,
    pub module_path: String,
    engine: Mutex<Option<Box<dyn EngineOps>>>,
    inner: Mutex<Inner>,
    /// Set once `delete_bucket(force=true)` has been requested; bounds how
    /// long the teardown task will wait for `active_callers` to drain and is
    /// passed through to the engine's own `destroy(force)`.
    pub force_shutdown: AtomicBool,
    /// Notified whenever a transition might unblock a waiter (teardown task,
    /// `release` waiting for refcount to hit zero).
    pub(crate) notify: Notify,
    /// Updated independently of whatever the loaded engine reports; see
    /// SPEC_FULL.md's "Per-bucket stats struct" supplement.
    pub stats: BucketStats,
}

/// Hit/miss/op counters kept per bucket, separate from the loaded engine's
/// own stats, per the original's `struct thread_stats *stats` split.
#[derive(Default)]
pub struct BucketStats {
    pub gets: AtomicU64,
    pub sets: AtomicU64,
    pub deletes: AtomicU64,
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub last_access_unix_ms: AtomicU64,
}

impl BucketHandle {
    pub fn new(name: String, module_path: String, engine: Box<dyn EngineOps>) -> Arc<Self> {
        Arc::new(Self {
            name,
            module_path,
            engine: Mutex::new(Some(engine)),
            inner: Mutex::new(Inner {
                state: BucketState::Running,
                refcount: 1,
                active_callers: 0,
                teardown_cookie: None,
            }),
            force_shutdown: AtomicBool::new(false),
            notify: Notify::new(),
            stats: BucketStats::default(),
        })
    }

    pub fn state(&self) -> BucketState {
        self.inner.lock().state
    }

    pub fn refcount(&self) -> u64 {
        self.inner.lock().refcount
    }

    pub fn active_callers(&self) -> u64 {
        self.inner.lock().active_callers
    }

    /// `acquire(handle)`: increments refcount only if state == RUNNING.
    pub fn acquire(self: &Arc<Self>) -> Result<(), HiveError> {
        let mut inner = self.inner.lock();
        if inner.state != BucketState::Running {
            return Err(HiveError::BucketNotRunning(self.name.clone()));
        }
        inner.refcount += 1;
        Ok(())
    }

    /// `release(handle)`: decrements refcount; if it hits zero and state ==
    /// STOPPED, signals the teardown task so handle memory can be freed.
    pub fn release(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.refcount > 0, "refcount underflow on release");
        inner.refcount = inner.refcount.saturating_sub(1);
        if inner.refcount == 0 && inner.state == BucketState::Stopped {
            drop(inner);
            self.notify.notify_waiters();
        }
    }

    /// Begins a call: requires RUNNING, increments `active_callers` for the
    /// duration of one operation. Returns a guard that decrements on drop and
    /// drives the STOP_REQUESTED -> STOPPING transition when appropriate.
    pub fn begin_call(self: &Arc<Self>) -> Result<CallGuard, HiveError> {
        let mut inner = self.inner.lock();
        if inner.state != BucketState::Running {
            return Err(HiveError::BucketNotRunning(self.name.clone()));
        }
        inner.active_callers += 1;
        Ok(CallGuard {
            handle: Arc::clone(self),
        })
    }

    /// Returns the loaded engine vtable, or `None` if the bucket is not
    /// RUNNING (callers must hold an active call guard to use this safely).
    pub fn with_engine<R>(&self, f: impl FnOnce(&dyn EngineOps) -> R) -> Option<R> {
        let guard = self.engine.lock();
        guard.as_deref().map(f)
    }

    /// `delete_bucket`: RUNNING -> STOP_REQUESTED, releasing the registry's
    /// own reference. Idempotent if already past RUNNING. Returns the state
    /// the handle is left in immediately after this call: `Stopping` if
    /// teardown could start right away, `StopRequested` if active callers
    /// are still draining (the caller should report EWOULDBLOCK, §7).
    pub fn request_stop(self: &Arc<Self>, force: bool) -> BucketState {
        let mut inner = self.inner.lock();
        if inner.state == BucketState::Running {
            inner.state = BucketState::StopRequested;
            self.force_shutdown.store(force, Ordering::SeqCst);
            metrics::BUCKET_STATE_TRANSITIONS_TOTAL
                .with_label_values(&["stop_requested"])
                .inc();
            let should_advance = inner.active_callers == 0;
            if should_advance {
                inner.state = BucketState::Stopping;
                metrics::BUCKET_STATE_TRANSITIONS_TOTAL
                    .with_label_values(&["stopping"])
                    .inc();
            }
            let result_state = inner.state;
            drop(inner);
            // Release the registry's own reference (refcount=1 held at creation).
            self.release();
            self.notify.notify_waiters();
            return result_state;
        }
        inner.state
    }

    /// Runs the teardown task body: waits until STOPPING, calls the engine's
    /// `destroy(force)`, transitions to STOPPED. The handle lock is released
    /// around the destroy call, matching the original: a disconnect callback
    /// invoked from inside `destroy` may observe a STOP_REQUESTED bucket
    /// (Open Question 1 in DESIGN.md).
    pub async fn run_teardown(self: &Arc<Self>) {
        loop {
            {
                let inner = self.inner.lock();
                if inner.state == BucketState::Stopping {
                    break;
                }
                if inner.state != BucketState::StopRequested {
                    return;
                }
            }
            self.notify.notified().await;
        }

        let force = self.force_shutdown.load(Ordering::SeqCst);
        let engine = self.engine.lock().take();
        if let Some(engine) = engine {
            engine.destroy(force);
        }

        let mut inner = self.inner.lock();
        inner.state = BucketState::Stopped;
        metrics::BUCKET_STATE_TRANSITIONS_TOTAL
            .with_label_values(&["stopped"])
            .inc();
        metrics::BUCKET_DELETED_TOTAL.inc();
        let refcount_zero = inner.refcount == 0;
        drop(inner);
        debug!(bucket = %self.name, "teardown complete");
        if refcount_zero {
            self.notify.notify_waiters();
        }
    }

    pub(crate) fn set_teardown_cookie(&self, cookie: u64) {
        self.inner.lock().teardown_cookie = Some(cookie);
    }
}

/// RAII guard returned by `begin_call`. On drop, decrements
/// `active_callers`; if it reaches zero while STOP_REQUESTED, advances the
/// handle to STOPPING and wakes the teardown task.
pub struct CallGuard {
    handle: Arc<BucketHandle>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        let mut inner = self.handle.inner.lock();
        debug_assert!(inner.active_callers > 0);
        inner.active_callers -= 1;
        if inner.active_callers == 0 && inner.state == BucketState::StopRequested {
            inner.state = BucketState::Stopping;
            metrics::BUCKET_STATE_TRANSITIONS_TOTAL
                .with_label_values(&["stopping"])
                .inc();
            drop(inner);
            self.handle.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bucket::engine::EngineStats;

    struct NoopEngine;
    impl EngineOps for NoopEngine {
        fn destroy(&self, _force: bool) {}
        fn aggregate_stats(&self) -> EngineStats {
            EngineStats::default()
        }
    }

    #[test]
    fn acquire_fails_once_not_running() {
        let h = BucketHandle::new("b1".into(), "kv.so".into(), Box::new(NoopEngine));
        h.request_stop(false);
        assert_eq!(h.state(), BucketState::Stopping);
        assert!(h.acquire().is_err());
    }

    #[test]
    fn stop_requested_waits_for_active_callers() {
        let h = BucketHandle::new("b1".into(), "kv.so".into(), Box::new(NoopEngine));
        let guard = h.begin_call().unwrap();
        h.request_stop(false);
        assert_eq!(h.state(), BucketState::StopRequested);
        drop(guard);
        assert_eq!(h.state(), BucketState::Stopping);
    }
}
