use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::Pod, apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::{
    Api, ResourceExt,
    api::{ApiResource, DynamicObject, PostParams},
    runtime::reflector::{ObjectRef, Store, store::WriterDropped},
};
use snafu::ResultExt;
use tracing::instrument;

use super::{
    BudgetStore, ClusterReader, ConflictSnafu, InvalidSelectorSnafu, Read, RequestSnafu, Result,
    SerializeSnafu,
};
use crate::{
    crd::{BudgetKey, PodUnavailableBudget},
    selector::LabelSelectorExt,
    workload::GroupKind,
};

/// Reflector stores of the workload kinds served by the cluster, keyed by their group and kind.
#[derive(Clone, Default)]
pub struct WorkloadStores {
    stores: HashMap<GroupKind, (ApiResource, Store<DynamicObject>)>,
}

impl WorkloadStores {
    pub fn insert(&mut self, resource: ApiResource, store: Store<DynamicObject>) {
        self.stores.insert(
            GroupKind::new(&resource.group, &resource.kind),
            (resource, store),
        );
    }

    /// The cached workload, [`None`] if it is not cached or its kind is not watched.
    pub fn get(
        &self,
        group_kind: &GroupKind,
        namespace: &str,
        name: &str,
    ) -> Option<Arc<DynamicObject>> {
        let (resource, store) = self.stores.get(group_kind)?;
        store.get(&ObjectRef::new_with(name, resource.clone()).within(namespace))
    }

    pub async fn wait_until_ready(&self) -> Result<(), WriterDropped> {
        for (_, store) in self.stores.values() {
            store.wait_until_ready().await?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

/// This `KubeClient` can be used to access Kubernetes.
///
/// It wraps an underlying [`kube::Client`] and serves budget, pod and workload reads from
/// reflector stores, which are driven by the watches of the budget controller (see
/// [`crate::reconciler::controller`]).
#[derive(Clone)]
pub struct KubeClient {
    client: kube::Client,
    budgets: Store<PodUnavailableBudget>,
    pods: Store<Pod>,
    workloads: WorkloadStores,
    post_params: PostParams,
}

impl KubeClient {
    pub fn new(
        client: kube::Client,
        budgets: Store<PodUnavailableBudget>,
        pods: Store<Pod>,
        workloads: WorkloadStores,
        field_manager: impl Into<String>,
    ) -> Self {
        Self {
            client,
            budgets,
            pods,
            workloads,
            post_params: PostParams {
                field_manager: Some(field_manager.into()),
                ..PostParams::default()
            },
        }
    }

    fn budget_api(&self, namespace: &str) -> Api<PodUnavailableBudget> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl BudgetStore for KubeClient {
    async fn list_budgets(&self, namespace: &str) -> Result<Vec<PodUnavailableBudget>> {
        Ok(self
            .budgets
            .state()
            .into_iter()
            .filter(|budget| budget.namespace().as_deref() == Some(namespace))
            .map(Arc::unwrap_or_clone)
            .collect())
    }

    #[instrument(skip(self), fields(k8s.budget = %key))]
    async fn get_budget(
        &self,
        key: &BudgetKey,
        read: Read,
    ) -> Result<Option<PodUnavailableBudget>> {
        match read {
            Read::Cached => Ok(self
                .budgets
                .get(&ObjectRef::new(&key.name).within(&key.namespace))
                .map(Arc::unwrap_or_clone)),
            Read::Live => self
                .budget_api(&key.namespace)
                .get_opt(&key.name)
                .await
                .with_context(|_| RequestSnafu {
                    operation: "get",
                    object: key.to_string(),
                }),
        }
    }

    #[instrument(skip_all, fields(k8s.budget.name = %budget.name_any()))]
    async fn replace_status(
        &self,
        budget: &PodUnavailableBudget,
    ) -> Result<PodUnavailableBudget> {
        let namespace = budget.namespace().unwrap_or_default();
        let object = format!("{namespace}/{}", budget.name_any());
        let _data = serde_json::to_vec(budget).with_context(|_| SerializeSnafu {
            object: object.clone(),
        })?;

        match self
            .budget_api(&namespace)
            .replace_status(&budget.name_any(), &self.post_params, budget)
            .await
        {
            Ok(updated) => Ok(updated),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                ConflictSnafu { object }.fail()
            }
            Err(source) => Err(source).context(RequestSnafu {
                operation: "replace status of",
                object,
            }),
        }
    }
}

#[async_trait]
impl ClusterReader for KubeClient {
    async fn list_pods(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<Pod>> {
        let mut pods = Vec::new();
        for pod in self.pods.state() {
            if pod.namespace().as_deref() != Some(namespace) {
                continue;
            }
            if selector.matches(pod.labels()).context(InvalidSelectorSnafu)? {
                pods.push(Arc::unwrap_or_clone(pod));
            }
        }
        Ok(pods)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        if let Some(pod) = self.pods.get(&ObjectRef::new(name).within(namespace)) {
            return Ok(Some(Arc::unwrap_or_clone(pod)));
        }

        // Not watched yet, e.g. created moments ago
        Api::<Pod>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .with_context(|_| RequestSnafu {
                operation: "get",
                object: format!("Pod {namespace}/{name}"),
            })
    }

    async fn get_workload(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let group_kind = GroupKind::new(&resource.group, &resource.kind);
        if let Some(workload) = self.workloads.get(&group_kind, namespace, name) {
            return Ok(Some(Arc::unwrap_or_clone(workload)));
        }

        // Deleted, not watched yet, or of a kind the cluster did not serve at startup
        Api::<DynamicObject>::namespaced_with(self.client.clone(), namespace, resource)
            .get_opt(name)
            .await
            .with_context(|_| RequestSnafu {
                operation: "get",
                object: format!("{} {namespace}/{name}", resource.kind),
            })
    }
}
