//! In-memory cluster for tests, with the conditional-write semantics of the API server.

use std::{
    collections::BTreeMap,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use k8s_openapi::{api::core::v1::Pod, apimachinery::pkg::apis::meta::v1::LabelSelector};
use kube::{
    ResourceExt,
    api::{ApiResource, DynamicObject},
};
use snafu::ResultExt;

use super::{BudgetStore, ClusterReader, ConflictSnafu, InvalidSelectorSnafu, Read, Result};
use crate::{
    crd::{BudgetKey, PodUnavailableBudget},
    selector::LabelSelectorExt,
};

type ObjectId = (String, String);

#[derive(Default)]
struct State {
    budgets: BTreeMap<BudgetKey, PodUnavailableBudget>,
    /// Overrides the cached view of a budget, to simulate a lagging watch cache.
    cached_budgets: BTreeMap<BudgetKey, PodUnavailableBudget>,
    pods: BTreeMap<ObjectId, Pod>,
    workloads: BTreeMap<(String, String, String, String), DynamicObject>,
    resource_version: u64,
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
    injected_conflicts: AtomicUsize,
    status_writes: AtomicUsize,
    live_reads: AtomicUsize,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the budget, assigning a fresh resource version and generation 1 if unset.
    pub fn put_budget(&self, mut budget: PodUnavailableBudget) -> PodUnavailableBudget {
        let mut state = self.lock();
        state.resource_version += 1;
        budget.metadata.resource_version = Some(state.resource_version.to_string());
        budget.metadata.generation.get_or_insert(1);
        let key = budget.key().expect("test budgets must be namespaced");
        state.cached_budgets.remove(&key);
        state.budgets.insert(key, budget.clone());
        budget
    }

    /// Makes cached reads of the budget return `budget` until it is written again.
    pub fn set_cached_budget(&self, budget: PodUnavailableBudget) {
        let key = budget.key().expect("test budgets must be namespaced");
        self.lock().cached_budgets.insert(key, budget);
    }

    pub fn budget(&self, key: &BudgetKey) -> Option<PodUnavailableBudget> {
        self.lock().budgets.get(key).cloned()
    }

    pub fn put_pod(&self, pod: Pod) {
        let id = (pod.namespace().unwrap_or_default(), pod.name_any());
        self.lock().pods.insert(id, pod);
    }

    pub fn put_workload(&self, workload: DynamicObject) {
        let types = workload.types.clone().unwrap_or_default();
        let group = types
            .api_version
            .split_once('/')
            .map_or("", |(group, _)| group)
            .to_string();
        let id = (
            group,
            types.kind,
            workload.namespace().unwrap_or_default(),
            workload.name_any(),
        );
        self.lock().workloads.insert(id, workload);
    }

    /// Lets the next `count` status writes fail as if another writer got there first. The
    /// stored budget gets a new resource version, as it would in that case.
    pub fn inject_conflicts(&self, count: usize) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    pub fn live_reads(&self) -> usize {
        self.live_reads.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BudgetStore for FakeCluster {
    async fn list_budgets(&self, namespace: &str) -> Result<Vec<PodUnavailableBudget>> {
        tokio::task::yield_now().await;
        let state = self.lock();
        Ok(state
            .budgets
            .iter()
            .filter(|(key, _)| key.namespace == namespace)
            .map(|(key, budget)| state.cached_budgets.get(key).unwrap_or(budget).clone())
            .collect())
    }

    async fn get_budget(
        &self,
        key: &BudgetKey,
        read: Read,
    ) -> Result<Option<PodUnavailableBudget>> {
        tokio::task::yield_now().await;
        let state = self.lock();
        let budget = match read {
            Read::Cached => state.cached_budgets.get(key).or_else(|| state.budgets.get(key)),
            Read::Live => {
                self.live_reads.fetch_add(1, Ordering::SeqCst);
                state.budgets.get(key)
            }
        };
        Ok(budget.cloned())
    }

    async fn replace_status(
        &self,
        budget: &PodUnavailableBudget,
    ) -> Result<PodUnavailableBudget> {
        tokio::task::yield_now().await;
        let key = budget.key().expect("test budgets must be namespaced");
        let object = key.to_string();
        let mut state = self.lock();
        state.resource_version += 1;
        let resource_version = state.resource_version.to_string();

        let Some(stored) = state.budgets.get_mut(&key) else {
            return ConflictSnafu { object }.fail();
        };
        if self.take_injected_conflict() {
            stored.metadata.resource_version = Some(resource_version);
            return ConflictSnafu { object }.fail();
        }
        if stored.metadata.resource_version != budget.metadata.resource_version {
            return ConflictSnafu { object }.fail();
        }

        stored.status = budget.status.clone();
        stored.metadata.resource_version = Some(resource_version);
        let updated = stored.clone();
        state.cached_budgets.remove(&key);
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }
}

#[async_trait]
impl ClusterReader for FakeCluster {
    async fn list_pods(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<Pod>> {
        tokio::task::yield_now().await;
        let state = self.lock();
        let mut pods = Vec::new();
        for ((pod_namespace, _), pod) in &state.pods {
            if pod_namespace == namespace
                && selector.matches(pod.labels()).context(InvalidSelectorSnafu)?
            {
                pods.push(pod.clone());
            }
        }
        Ok(pods)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        tokio::task::yield_now().await;
        Ok(self
            .lock()
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn get_workload(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        tokio::task::yield_now().await;
        let id = (
            resource.group.clone(),
            resource.kind.clone(),
            namespace.to_string(),
            name.to_string(),
        );
        Ok(self.lock().workloads.get(&id).cloned())
    }
}
