//! Runs [`reconcile`] in a [`kube::runtime::Controller`], triggered by watches of budgets, pods
//! and every served workload kind.
//!
//! The watches are reflected into the caches the [`KubeClient`](crate::client::KubeClient)
//! reads from, so the caches are only filled while the controller runs.

use std::{collections::BTreeMap, future::Future, sync::Arc};

use futures::{StreamExt, TryStreamExt, future};
use k8s_openapi::{
    NamespaceResourceScope, api::core::v1::Pod,
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::{
    Api, Resource, ResourceExt,
    api::{ApiResource, DynamicObject, ListParams},
    runtime::{
        Controller, WatchStreamExt, controller,
        events::Recorder,
        reflector::{self, ObjectRef, Store, store::Writer},
        watcher,
    },
};

use super::{CONTROLLER_NAME, Context, error_policy, reconcile};
use crate::{
    client::WorkloadStores,
    crd::{BudgetTarget, PodUnavailableBudget},
    expectations::{ObjectKey, ResourceVersionExpectations},
    logging::controller::report_controller_reconciled,
    selector::LabelSelectorExt,
    workload::{GroupKind, WorkloadRegistry},
};

/// The reflector stores filled by the watches of the [`BudgetController`].
#[derive(Clone)]
pub struct Caches {
    pub budgets: Store<PodUnavailableBudget>,
    pub pods: Store<Pod>,
    pub workloads: WorkloadStores,
}

pub struct BudgetController {
    controller: Controller<PodUnavailableBudget>,
    caches: Caches,
}

impl BudgetController {
    /// Sets up the watches of budgets, pods and all registered workload kinds the cluster
    /// serves. Nothing is watched until [`Self::run`] is polled.
    pub async fn new(
        client: kube::Client,
        namespace: Option<String>,
        registry: Arc<WorkloadRegistry>,
        expectations: ResourceVersionExpectations,
    ) -> Self {
        let scope = Scope { client, namespace };

        let (budgets, budget_writer) = reflector::store();
        let budget_events = watcher(scope.api(), watcher::Config::default())
            .default_backoff()
            .reflect(budget_writer)
            .inspect_ok(move |event| observe_budget_event(event, &expectations))
            .touched_objects();
        let mut controller = Controller::for_stream(budget_events, budgets.clone());

        let mut workloads = WorkloadStores::default();
        for resource in registry.api_resources() {
            let api = scope.dynamic_api(&resource);
            if !is_served(&api, &resource).await {
                continue;
            }

            let writer = Writer::new(resource.clone());
            workloads.insert(resource.clone(), writer.as_reader());
            let events = watcher(api, watcher::Config::default())
                .default_backoff()
                .reflect(writer)
                .touched_objects();
            let group_kind = GroupKind::new(&resource.group, &resource.kind);
            let budgets = budgets.clone();
            controller = controller.watches_stream_with(
                events,
                move |workload| budgets_for_workload(&budgets.state(), &group_kind, &workload),
                resource,
            );
        }

        let (pods, pod_writer) = reflector::store();
        let pod_events = watcher(scope.api(), watcher::Config::default())
            .default_backoff()
            .reflect(pod_writer)
            .touched_objects();
        let mapper_budgets = budgets.clone();
        let mapper_workloads = workloads.clone();
        controller = controller.watches_stream(pod_events, move |pod: Pod| {
            budgets_for_pod(&mapper_budgets.state(), &mapper_workloads, &registry, &pod)
        });

        Self {
            controller,
            caches: Caches {
                budgets,
                pods,
                workloads,
            },
        }
    }

    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    /// Reconciles budgets until `shutdown` resolves and all running reconciliations finished.
    ///
    /// At most `concurrency` budgets are reconciled at the same time, each of them at most once
    /// at a time. Failures are reported as Kubernetes events on the budget.
    pub fn run(
        self,
        ctx: Arc<Context>,
        recorder: Recorder,
        concurrency: u16,
        shutdown: impl Future<Output = ()> + Send + Sync + 'static,
    ) -> impl Future<Output = ()> {
        self.controller
            .with_config(controller::Config::default().concurrency(concurrency.max(1)))
            .graceful_shutdown_on(shutdown)
            .run(reconcile, error_policy, ctx)
            .for_each(move |result| {
                report_controller_reconciled(&recorder, CONTROLLER_NAME, &result);
                future::ready(())
            })
    }
}

struct Scope {
    client: kube::Client,

    /// Namespace to watch, all namespaces if [`None`].
    namespace: Option<String>,
}

impl Scope {
    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        match &self.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }

    fn dynamic_api(&self, resource: &ApiResource) -> Api<DynamicObject> {
        match &self.namespace {
            Some(namespace) => Api::namespaced_with(self.client.clone(), namespace, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }
}

/// Optional workload kinds, such as the OpenKruise ones, are only watched if installed.
async fn is_served(api: &Api<DynamicObject>, resource: &ApiResource) -> bool {
    match api.list_metadata(&ListParams::default().limit(1)).await {
        Err(kube::Error::Api(response)) if response.code == 404 => {
            tracing::info!(
                kind = %resource.kind,
                api_version = %resource.api_version,
                "workload kind is not served by the cluster, not watching it"
            );
            false
        }
        _ => true,
    }
}

/// Records the resource version of a watched budget, or forgets the budget once deleted.
pub fn observe_budget_event(
    event: &watcher::Event<PodUnavailableBudget>,
    expectations: &ResourceVersionExpectations,
) {
    let budget = match event {
        watcher::Event::Apply(budget)
        | watcher::Event::InitApply(budget)
        | watcher::Event::Delete(budget) => budget,
        watcher::Event::Init | watcher::Event::InitDone => return,
    };
    let Ok(key) = budget.key() else {
        return;
    };

    let object_key = ObjectKey::from(&key);
    if let watcher::Event::Delete(_) = event {
        expectations.delete(&object_key);
    } else if let Some(resource_version) = budget.resource_version() {
        expectations.observe(&object_key, &resource_version);
    }
}

/// Budgets whose governed pods may change with `pod`.
///
/// Selector budgets are matched by labels only, attribution to a workload is left to the
/// reconciliation.
pub fn budgets_for_pod(
    budgets: &[Arc<PodUnavailableBudget>],
    workloads: &WorkloadStores,
    registry: &WorkloadRegistry,
    pod: &Pod,
) -> Vec<ObjectRef<PodUnavailableBudget>> {
    let Some(namespace) = pod.namespace() else {
        return Vec::new();
    };

    budgets
        .iter()
        .filter(|budget| budget.namespace().as_deref() == Some(&namespace))
        .filter(|budget| match budget.spec.target() {
            Ok(BudgetTarget::Selector(selector)) => matches_labels(selector, pod.labels()),
            Ok(BudgetTarget::Reference(target)) => {
                let group_kind = GroupKind::from_api_version(&target.api_version, &target.kind);
                registry
                    .get(&group_kind)
                    .zip(workloads.get(&group_kind, &namespace, &target.name))
                    .and_then(|(capability, workload)| capability.pod_selector(&workload).ok())
                    .is_some_and(|selector| matches_labels(&selector, pod.labels()))
            }
            Err(_) => false,
        })
        .map(|budget| ObjectRef::from_obj(budget.as_ref()))
        .collect()
}

/// Budgets which may count replicas of the workload: budgets referencing it and selector
/// budgets matching the labels of its pod template.
pub fn budgets_for_workload(
    budgets: &[Arc<PodUnavailableBudget>],
    group_kind: &GroupKind,
    workload: &DynamicObject,
) -> Vec<ObjectRef<PodUnavailableBudget>> {
    let template_labels: BTreeMap<String, String> = workload
        .data
        .pointer("/spec/template/metadata/labels")
        .and_then(|labels| serde_json::from_value(labels.clone()).ok())
        .unwrap_or_default();

    budgets
        .iter()
        .filter(|budget| budget.namespace() == workload.namespace())
        .filter(|budget| match budget.spec.target() {
            Ok(BudgetTarget::Reference(target)) => {
                target.name == workload.name_any()
                    && GroupKind::from_api_version(&target.api_version, &target.kind)
                        == *group_kind
            }
            Ok(BudgetTarget::Selector(selector)) => matches_labels(selector, &template_labels),
            Err(_) => false,
        })
        .map(|budget| ObjectRef::from_obj(budget.as_ref()))
        .collect()
}

fn matches_labels(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    selector.matches(labels).unwrap_or(false)
}
