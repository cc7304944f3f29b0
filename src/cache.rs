//! The artifact cache: the only channel through which independently scheduled
//! tasks exchange fitted state.
//!
//! Fit tasks write fitted transformers and estimators under structured string
//! keys; estimator tasks that depend on their case's preprocessing read those
//! keys back, waiting with bounded, coarse polling when the transformer task
//! has not finished yet. Writes are single-writer-per-key, so the only
//! ordering problem is read-after-write, and the wait protocol is the only
//! thing handling it.

use crate::error::EstimationError;
use crate::index::IndexSet;
use crate::layer::CaseTag;
use crate::learner::{Estimator, Transformer};
use dashmap::DashMap;
use log::warn;
use std::sync::Arc;
use std::time::Duration;

/// An ordered list of fitted transform steps for one case/fold.
pub type FittedSteps = Vec<(String, Arc<dyn Transformer>)>;

/// A fitted estimator plus the metadata needed to place and score its
/// predictions: the fold-tagged instance label, the held-out partition and
/// output column, and the fold score (if a scorer ran and succeeded).
#[derive(Clone)]
pub struct FittedEstimator {
    pub name: String,
    pub unit: Arc<dyn Estimator>,
    /// `(test partition, column)`; the partition is `None` for full-data fits.
    pub placement: (Option<IndexSet>, usize),
    pub score: Option<f64>,
}

/// What a fit task deposits in the cache.
pub enum Artifact {
    Transformer(FittedSteps),
    Estimator(FittedEstimator),
}

/// Cache key for a case/fold's fitted preprocessing pipeline.
pub fn transformer_key(tag: &CaseTag) -> String {
    format!(
        "{}__{}__t",
        tag.case.as_deref().unwrap_or(""),
        fold_part(tag)
    )
}

/// Cache key for a case/fold/instance's fitted estimator.
pub fn estimator_key(tag: &CaseTag, name: &str) -> String {
    format!(
        "{}__{}__{}__e",
        tag.case.as_deref().unwrap_or(""),
        name,
        fold_part(tag)
    )
}

fn fold_part(tag: &CaseTag) -> String {
    match tag.fold {
        Some(fold) => fold.to_string(),
        None => "full".to_string(),
    }
}

/// The narrow storage interface tasks exchange artifacts through. A write
/// must be visible to any subsequent read once `put` returns; nothing more is
/// required of a backend.
pub trait ArtifactStore: Send + Sync {
    fn put(&self, key: &str, value: Arc<Artifact>);
    fn get(&self, key: &str) -> Result<Arc<Artifact>, EstimationError>;
    fn exists(&self, key: &str) -> bool;
}

/// The in-process store: a concurrent map of shared artifacts. Tasks run as
/// threads in one address space, so sharing `Arc`s through a [`DashMap`] is
/// the whole implementation.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Arc<Artifact>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ArtifactStore for MemoryStore {
    fn put(&self, key: &str, value: Arc<Artifact>) {
        self.entries.insert(key.to_string(), value);
    }

    fn get(&self, key: &str) -> Result<Arc<Artifact>, EstimationError> {
        self.entries
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EstimationError::NotFound(key.to_string()))
    }

    fn exists(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

/// Poll interval and timeout for one dependency wait.
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub interval: Duration,
    pub limit: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            limit: Duration::from_secs(600),
        }
    }
}

/// Injectable sleep, so timeout behavior is testable without wall-clock time.
pub trait WaitClock: Send + Sync {
    fn sleep(&self, interval: Duration);
}

/// The production clock: actually sleeps.
pub struct SystemClock;

impl WaitClock for SystemClock {
    fn sleep(&self, interval: Duration) {
        std::thread::sleep(interval);
    }
}

/// Wait-protocol states. A wait that starts with `raise_on_exception` set
/// skips straight to `WarnedOnce`, so its first timeout is fatal; otherwise
/// the first timeout warns and re-arms, and only the second reaches `Fatal`.
/// The grace is one-shot, never unlimited retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitState {
    Waiting,
    WarnedOnce,
    Fatal,
}

/// Retrieve `key`, polling until it appears or the bounded wait gives up.
///
/// Elapsed time is accounted as the sum of poll intervals, which keeps the
/// protocol deterministic under an injected clock and within one interval of
/// wall time under the real one.
pub fn wait_get(
    store: &dyn ArtifactStore,
    key: &str,
    poll: PollConfig,
    raise_on_exception: bool,
    clock: &dyn WaitClock,
) -> Result<Arc<Artifact>, EstimationError> {
    if let Ok(artifact) = store.get(key) {
        return Ok(artifact);
    }

    let mut state = if raise_on_exception {
        WaitState::WarnedOnce
    } else {
        WaitState::Waiting
    };
    let mut waited = Duration::ZERO;
    let mut window = Duration::ZERO;

    loop {
        clock.sleep(poll.interval);
        waited += poll.interval;
        window += poll.interval;

        if store.exists(key) {
            return store.get(key);
        }

        if window >= poll.limit {
            state = match state {
                WaitState::Waiting => {
                    warn!(
                        "artifact '{}' not in cache after {:.1}s; will poll every {:.1}s for \
                         another {:.1}s before aborting",
                        key,
                        waited.as_secs_f64(),
                        poll.interval.as_secs_f64(),
                        poll.limit.as_secs_f64(),
                    );
                    window = Duration::ZERO;
                    WaitState::WarnedOnce
                }
                WaitState::WarnedOnce | WaitState::Fatal => WaitState::Fatal,
            };
            if state == WaitState::Fatal {
                return Err(EstimationError::ParallelProcessing {
                    key: key.to_string(),
                    waited: waited.as_secs_f64(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn empty_transformer() -> Arc<Artifact> {
        Arc::new(Artifact::Transformer(Vec::new()))
    }

    #[derive(Default)]
    struct CountingClock {
        sleeps: AtomicUsize,
    }

    impl WaitClock for CountingClock {
        fn sleep(&self, _interval: Duration) {
            self.sleeps.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Deposits an artifact after a fixed number of polls.
    struct DepositingClock {
        store: Arc<MemoryStore>,
        key: String,
        after: usize,
        sleeps: AtomicUsize,
    }

    impl WaitClock for DepositingClock {
        fn sleep(&self, _interval: Duration) {
            if self.sleeps.fetch_add(1, Ordering::Relaxed) + 1 == self.after {
                self.store.put(&self.key, empty_transformer());
            }
        }
    }

    fn quick_poll() -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(100),
            limit: Duration::from_secs(1),
        }
    }

    #[test]
    fn store_round_trip_and_missing_key() {
        let store = MemoryStore::new();
        assert!(!store.exists("a__t"));
        match store.get("a__t") {
            Err(EstimationError::NotFound(key)) => assert_eq!(key, "a__t"),
            _ => panic!("expected NotFound"),
        }

        store.put("a__t", empty_transformer());
        assert!(store.exists("a__t"));
        assert!(store.get("a__t").is_ok());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn keys_distinguish_case_fold_and_role() {
        let unnamed_full = CaseTag::new(None, None);
        let unnamed_fold = CaseTag::new(None, Some(0));
        let named_fold = CaseTag::new(Some("pre".to_string()), Some(0));

        assert_eq!(transformer_key(&unnamed_full), "__full__t");
        assert_eq!(transformer_key(&unnamed_fold), "__0__t");
        assert_eq!(transformer_key(&named_fold), "pre__0__t");
        assert_eq!(estimator_key(&named_fold, "svc"), "pre__svc__0__e");
        assert_eq!(estimator_key(&unnamed_full, "svc"), "__svc__full__e");
    }

    #[test]
    fn wait_returns_immediately_when_present() {
        let store = MemoryStore::new();
        store.put("k", empty_transformer());
        let clock = CountingClock::default();
        assert!(wait_get(&store, "k", quick_poll(), true, &clock).is_ok());
        assert_eq!(clock.sleeps.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn wait_picks_up_an_artifact_deposited_mid_wait() {
        let store = Arc::new(MemoryStore::new());
        let clock = DepositingClock {
            store: Arc::clone(&store),
            key: "late__t".to_string(),
            after: 3,
            sleeps: AtomicUsize::new(0),
        };
        let result = wait_get(store.as_ref(), "late__t", quick_poll(), true, &clock);
        assert!(result.is_ok());
        assert_eq!(clock.sleeps.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn first_timeout_is_fatal_when_raising() {
        let store = MemoryStore::new();
        let clock = CountingClock::default();
        match wait_get(&store, "never", quick_poll(), true, &clock) {
            Err(EstimationError::ParallelProcessing { key, waited }) => {
                assert_eq!(key, "never");
                assert!((waited - 1.0).abs() < 0.11);
            }
            _ => panic!("expected ParallelProcessing"),
        }
        // limit / interval polls, within one interval.
        assert_eq!(clock.sleeps.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn first_timeout_warns_then_second_is_fatal() {
        let store = MemoryStore::new();
        let clock = CountingClock::default();
        match wait_get(&store, "never", quick_poll(), false, &clock) {
            Err(EstimationError::ParallelProcessing { waited, .. }) => {
                assert!((waited - 2.0).abs() < 0.11);
            }
            _ => panic!("expected ParallelProcessing"),
        }
        assert_eq!(clock.sleeps.load(Ordering::Relaxed), 20);
    }
}
