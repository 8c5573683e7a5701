//! Tracks the newest resource version this process wrote or saw per object.
//!
//! Watch caches lag behind the API server. After writing a budget status, the next cached read
//! may still return the previous version. Acting on such a read would, for example, let the
//! admission gate hand out an allowance that it already consumed. Consumers therefore check
//! [`ResourceVersionExpectations::is_satisfied`] before trusting a cached object and fall back
//! to a live read otherwise.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use tokio::task::JoinHandle;

use crate::crd::BudgetKey;

const BUDGET_KIND: &str = "PodUnavailableBudget";

/// Identifies a tracked object.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ObjectKey {
    pub kind: &'static str,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: &'static str, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl From<&BudgetKey> for ObjectKey {
    fn from(key: &BudgetKey) -> Self {
        Self::new(BUDGET_KIND, &key.namespace, &key.name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

#[derive(Debug)]
struct Entry {
    resource_version: u64,
    touched: Instant,
}

/// Process-local expectation cache, shared between the reconciler, the admission gate and the
/// event handlers. Cloning is cheap and clones share their state.
#[derive(Clone, Debug, Default)]
pub struct ResourceVersionExpectations {
    entries: Arc<Mutex<HashMap<ObjectKey, Entry>>>,
}

impl ResourceVersionExpectations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `resource_version` of the object was written or seen. Older versions than
    /// the recorded one are ignored, as are versions which are not numeric.
    pub fn observe(&self, key: &ObjectKey, resource_version: &str) {
        let Some(version) = parse(resource_version) else {
            tracing::trace!(%key, resource_version, "ignoring unordered resource version");
            return;
        };

        let mut entries = self.lock();
        let now = Instant::now();
        entries
            .entry(key.clone())
            .and_modify(|entry| {
                entry.resource_version = entry.resource_version.max(version);
                entry.touched = now;
            })
            .or_insert(Entry {
                resource_version: version,
                touched: now,
            });
    }

    /// Whether a copy of the object at `resource_version` is at least as new as expected.
    ///
    /// Never blocks progress: without an expectation, or if the version cannot be ordered, the
    /// copy is considered fresh.
    pub fn is_satisfied(&self, key: &ObjectKey, resource_version: &str) -> bool {
        let Some(version) = parse(resource_version) else {
            return true;
        };
        self.lock()
            .get(key)
            .is_none_or(|entry| version >= entry.resource_version)
    }

    /// Forgets the object, usually because it was deleted.
    pub fn delete(&self, key: &ObjectKey) {
        self.lock().remove(key);
    }

    /// Removes all entries which were not touched within `idle_timeout` before `now`.
    /// Returns the number of removed entries.
    pub fn sweep(&self, now: Instant, idle_timeout: Duration) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| now.saturating_duration_since(entry.touched) < idle_timeout);
        before - entries.len()
    }

    /// Spawns a task sweeping idle entries in the background. The task stops when the handle
    /// is aborted or dropped together with the runtime.
    pub fn spawn_sweeper(&self, idle_timeout: Duration) -> JoinHandle<()> {
        let expectations = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(idle_timeout.max(Duration::from_secs(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let removed = expectations.sweep(Instant::now(), idle_timeout);
                if removed > 0 {
                    tracing::debug!(removed, "swept idle resource version expectations");
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // The map stays consistent even if a holder panicked, every critical section is a single
    // map operation.
    fn lock(&self) -> MutexGuard<'_, HashMap<ObjectKey, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse(resource_version: &str) -> Option<u64> {
    resource_version.parse().ok()
}
