//! Finds the pods governed by a budget and the replicas their workloads declare.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use k8s_openapi::{api::core::v1::Pod, apimachinery::pkg::apis::meta::v1::OwnerReference};
use kube::{ResourceExt, api::DynamicObject};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::instrument;

use super::{GroupKind, WorkloadCapability, WorkloadError, WorkloadRegistry, is_same_object};
use crate::{
    client::{self, ClusterReader},
    crd::{BudgetTarget, InvalidBudgetError, PodUnavailableBudget, TargetReference},
    pod_utils,
    selector::{LabelSelectorExt, SelectorError},
};

type Result<T, E = Error> = std::result::Result<T, E>;

/// Bounds walking up owner references, e.g. Pod -> ReplicaSet -> Deployment.
const MAX_OWNER_DEPTH: usize = 4;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid budget"))]
    InvalidBudget { source: InvalidBudgetError },

    #[snafu(display("budget has no namespace"))]
    MissingNamespace,

    #[snafu(display("workload kind {group_kind} of {target} is not supported"))]
    UnsupportedKind {
        group_kind: GroupKind,
        target: TargetReference,
    },

    #[snafu(display("failed to read {target}"))]
    ReadTarget {
        source: client::Error,
        target: TargetReference,
    },

    #[snafu(display("failed to read workload {owner}"))]
    ReadOwner { source: client::Error, owner: String },

    #[snafu(display("failed to list pods"))]
    ListPods { source: client::Error },

    #[snafu(display("failed to evaluate workload"))]
    Workload { source: WorkloadError },

    #[snafu(display("invalid label selector"))]
    InvalidSelector { source: SelectorError },
}

/// The governed pods of a budget.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Resolution {
    pub pods: Vec<Pod>,

    /// Sum of the declared replicas of all distinct governing workloads.
    pub total_replicas: i32,
}

#[derive(Clone)]
pub struct WorkloadResolver {
    cluster: Arc<dyn ClusterReader>,
    registry: Arc<WorkloadRegistry>,
}

impl WorkloadResolver {
    pub fn new(cluster: Arc<dyn ClusterReader>, registry: Arc<WorkloadRegistry>) -> Self {
        Self { cluster, registry }
    }

    pub fn registry(&self) -> &WorkloadRegistry {
        &self.registry
    }

    /// Resolves the pods governed by `budget`.
    ///
    /// A missing target resolves to nothing. In selector mode, pods without a controller or
    /// with a controller of an unsupported kind are left out, as are pods whose controller no
    /// longer exists.
    #[instrument(skip_all, fields(k8s.budget.name = %budget.name_any()))]
    pub async fn resolve(&self, budget: &PodUnavailableBudget) -> Result<Resolution> {
        let namespace = budget.namespace().context(MissingNamespaceSnafu)?;
        match budget.spec.target().context(InvalidBudgetSnafu)? {
            BudgetTarget::Selector(selector) => {
                if LabelSelectorExt::is_empty(selector) {
                    return Ok(Resolution::default());
                }
                let pods = self
                    .cluster
                    .list_pods(&namespace, selector)
                    .await
                    .context(ListPodsSnafu)?;
                self.attribute_to_workloads(&namespace, pods).await
            }
            BudgetTarget::Reference(target) => self.resolve_target(&namespace, target).await,
        }
    }

    /// Whether `budget` governs `pod`.
    ///
    /// Agrees with [`Self::resolve`]: in selector mode a pod whose labels match is only governed
    /// if it can be attributed to a supported workload that still exists.
    pub async fn governs(&self, budget: &PodUnavailableBudget, pod: &Pod) -> Result<bool> {
        if budget.namespace().is_none() || budget.namespace() != pod.namespace() {
            return Ok(false);
        }
        let namespace = budget.namespace().unwrap_or_default();
        match budget.spec.target().context(InvalidBudgetSnafu)? {
            BudgetTarget::Selector(selector) => {
                if !selector.matches(pod.labels()).context(InvalidSelectorSnafu)? {
                    return Ok(false);
                }
                let Some(owner) = pod_utils::controller_ref(pod) else {
                    return Ok(false);
                };
                Ok(self.find_governor(&namespace, owner).await?.is_some())
            }
            BudgetTarget::Reference(target) => {
                let Some((capability, workload)) = self.fetch_target(&namespace, target).await?
                else {
                    return Ok(false);
                };
                let selector = capability.pod_selector(&workload).context(WorkloadSnafu)?;
                selector.matches(pod.labels()).context(InvalidSelectorSnafu)
            }
        }
    }

    async fn resolve_target(&self, namespace: &str, target: &TargetReference) -> Result<Resolution> {
        let Some((capability, workload)) = self.fetch_target(namespace, target).await? else {
            tracing::debug!(%target, "budget target not found, nothing is governed");
            return Ok(Resolution::default());
        };

        let total_replicas = capability
            .declared_replicas(&workload)
            .context(WorkloadSnafu)?;
        let selector = capability.pod_selector(&workload).context(WorkloadSnafu)?;
        let pods = if LabelSelectorExt::is_empty(&selector) {
            Vec::new()
        } else {
            self.cluster
                .list_pods(namespace, &selector)
                .await
                .context(ListPodsSnafu)?
        };

        Ok(Resolution {
            pods,
            total_replicas,
        })
    }

    async fn fetch_target(
        &self,
        namespace: &str,
        target: &TargetReference,
    ) -> Result<Option<(&dyn WorkloadCapability, DynamicObject)>> {
        let group_kind = GroupKind::from_api_version(&target.api_version, &target.kind);
        let Some(capability) = self.registry.get(&group_kind) else {
            return UnsupportedKindSnafu {
                group_kind,
                target: target.clone(),
            }
            .fail();
        };

        let workload = self
            .cluster
            .get_workload(&capability.api_resource(), namespace, &target.name)
            .await
            .with_context(|_| ReadTargetSnafu {
                target: target.clone(),
            })?;
        Ok(workload.map(|workload| (capability, workload)))
    }

    async fn attribute_to_workloads(&self, namespace: &str, pods: Vec<Pod>) -> Result<Resolution> {
        // Keyed by the UID of the pods' direct controller
        let mut controllers: HashMap<String, Option<Governor>> = HashMap::new();
        let mut governors = BTreeMap::new();
        let mut governed = Vec::with_capacity(pods.len());

        for pod in pods {
            let Some(owner) = pod_utils::controller_ref(&pod) else {
                tracing::debug!(pod.name = %pod.name_any(), "ignoring pod without controller");
                continue;
            };

            let governor = match controllers.get(&owner.uid) {
                Some(governor) => governor.clone(),
                None => {
                    let governor = self.find_governor(namespace, owner).await?;
                    controllers.insert(owner.uid.clone(), governor.clone());
                    governor
                }
            };

            if let Some(governor) = governor {
                governors
                    .entry(governor.uid)
                    .or_insert(governor.declared_replicas);
                governed.push(pod);
            } else {
                tracing::debug!(
                    pod.name = %pod.name_any(),
                    owner.kind = %owner.kind,
                    owner.name = %owner.name,
                    "ignoring pod with unsupported or missing controller"
                );
            }
        }

        Ok(Resolution {
            pods: governed,
            total_replicas: governors.values().sum(),
        })
    }

    /// Walks up from the direct controller of a pod to the workload its replicas are declared
    /// on. Returns [`None`] if any step is of an unsupported kind or missing.
    async fn find_governor(
        &self,
        namespace: &str,
        owner: &OwnerReference,
    ) -> Result<Option<Governor>> {
        let mut owner = owner.clone();

        for _ in 0..MAX_OWNER_DEPTH {
            let Some(capability) = self.registry.get(&GroupKind::of_owner(&owner)) else {
                return Ok(None);
            };
            let workload = self
                .cluster
                .get_workload(&capability.api_resource(), namespace, &owner.name)
                .await
                .with_context(|_| ReadOwnerSnafu {
                    owner: format!("{} {namespace}/{}", owner.kind, owner.name),
                })?;
            let Some(workload) = workload.filter(|workload| is_same_object(&owner, workload))
            else {
                return Ok(None);
            };

            match capability.parent(&workload) {
                Some(parent) => owner = parent.clone(),
                None => {
                    return Ok(Some(Governor {
                        uid: owner.uid.clone(),
                        declared_replicas: capability
                            .declared_replicas(&workload)
                            .context(WorkloadSnafu)?,
                    }));
                }
            }
        }

        Ok(None)
    }
}

#[derive(Clone, Debug)]
struct Governor {
    uid: String,
    declared_replicas: i32,
}

#[cfg(test)]
mod tests {
    use indoc::{formatdoc, indoc};
    use rstest::rstest;

    use super::*;
    use crate::{
        client::fake::FakeCluster,
        test_utils::{TestPod, clone_set, deployment, object, replica_set},
    };

    fn selector_budget() -> PodUnavailableBudget {
        object(indoc! {"
            apiVersion: policy.disruption-budget.dev/v1alpha1
            kind: PodUnavailableBudget
            metadata:
              name: web
              namespace: default
            spec:
              selector:
                matchLabels:
                  pub: web
              maxUnavailable: 20%
        "})
    }

    fn target_budget(kind: &str, api_version: &str, name: &str) -> PodUnavailableBudget {
        object(&formatdoc! {"
            apiVersion: policy.disruption-budget.dev/v1alpha1
            kind: PodUnavailableBudget
            metadata:
              name: web
              namespace: default
            spec:
              targetRef:
                apiVersion: {api_version}
                kind: {kind}
                name: {name}
              maxUnavailable: 1
        "})
    }

    fn resolver(cluster: &Arc<FakeCluster>) -> WorkloadResolver {
        WorkloadResolver::new(
            cluster.clone(),
            Arc::new(WorkloadRegistry::with_builtin_kinds()),
        )
    }

    fn pod_names(resolution: &Resolution) -> Vec<String> {
        let mut names: Vec<String> = resolution.pods.iter().map(ResourceExt::name_any).collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn selector_aggregates_distinct_workloads() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.put_workload(deployment("busybox", 5));
        cluster.put_workload(replica_set("busybox-1", "busybox", 3));
        cluster.put_workload(replica_set("busybox-2", "busybox", 2));
        cluster.put_workload(clone_set("web", 5));
        for index in 0..3 {
            cluster.put_pod(
                TestPod::new(&format!("busybox-1-{index}"))
                    .label("pub", "web")
                    .owned_by("apps/v1", "ReplicaSet", "busybox-1")
                    .build(),
            );
        }
        for index in 0..2 {
            cluster.put_pod(
                TestPod::new(&format!("busybox-2-{index}"))
                    .label("pub", "web")
                    .owned_by("apps/v1", "ReplicaSet", "busybox-2")
                    .build(),
            );
        }
        for index in 0..5 {
            cluster.put_pod(
                TestPod::new(&format!("web-{index}"))
                    .label("pub", "web")
                    .owned_by("apps.kruise.io/v1alpha1", "CloneSet", "web")
                    .build(),
            );
        }

        let resolution = resolver(&cluster).resolve(&selector_budget()).await.unwrap();

        // both replica sets are attributed to the deployment, which is counted once
        assert_eq!(resolution.total_replicas, 10);
        assert_eq!(resolution.pods.len(), 10);
    }

    #[tokio::test]
    async fn selector_excludes_unattributable_pods() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.put_workload(clone_set("web", 2));
        cluster.put_pod(
            TestPod::new("web-0")
                .label("pub", "web")
                .owned_by("apps.kruise.io/v1alpha1", "CloneSet", "web")
                .build(),
        );
        cluster.put_pod(TestPod::new("orphan").label("pub", "web").build());
        cluster.put_pod(
            TestPod::new("job-0")
                .label("pub", "web")
                .owned_by("batch/v1", "Job", "job")
                .build(),
        );
        cluster.put_pod(
            TestPod::new("gone-0")
                .label("pub", "web")
                .owned_by("apps.kruise.io/v1alpha1", "CloneSet", "gone")
                .build(),
        );
        cluster.put_pod(
            TestPod::new("other")
                .label("pub", "other")
                .owned_by("apps.kruise.io/v1alpha1", "CloneSet", "web")
                .build(),
        );

        let resolution = resolver(&cluster).resolve(&selector_budget()).await.unwrap();

        assert_eq!(pod_names(&resolution), ["web-0"]);
        assert_eq!(resolution.total_replicas, 2);
    }

    #[tokio::test]
    async fn stale_owner_uid_is_excluded() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.put_workload(clone_set("web", 2));
        let mut pod = TestPod::new("web-0")
            .label("pub", "web")
            .owned_by("apps.kruise.io/v1alpha1", "CloneSet", "web")
            .build();
        // owned by a previous incarnation of the clone set
        for owner in pod.metadata.owner_references.iter_mut().flatten() {
            owner.uid = "recreated".to_string();
        }
        cluster.put_pod(pod);

        let resolution = resolver(&cluster).resolve(&selector_budget()).await.unwrap();
        assert_eq!(resolution, Resolution::default());
    }

    #[tokio::test]
    async fn target_reference() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.put_workload(deployment("busybox", 2));
        cluster.put_pod(TestPod::new("busybox-0").label("app", "busybox").build());
        cluster.put_pod(TestPod::new("busybox-1").label("app", "busybox").build());
        cluster.put_pod(TestPod::new("unrelated").label("app", "other").build());

        let budget = target_budget("Deployment", "apps/v1", "busybox");
        let resolver = resolver(&cluster);
        let resolution = resolver.resolve(&budget).await.unwrap();

        assert_eq!(pod_names(&resolution), ["busybox-0", "busybox-1"]);
        assert_eq!(resolution.total_replicas, 2);

        let governed = TestPod::new("busybox-0").label("app", "busybox").build();
        let ungoverned = TestPod::new("unrelated").label("app", "other").build();
        assert!(resolver.governs(&budget, &governed).await.unwrap());
        assert!(!resolver.governs(&budget, &ungoverned).await.unwrap());
    }

    #[tokio::test]
    async fn missing_target_governs_nothing() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.put_pod(TestPod::new("busybox-0").label("app", "busybox").build());

        let budget = target_budget("Deployment", "apps/v1", "busybox");
        let resolver = resolver(&cluster);

        assert_eq!(resolver.resolve(&budget).await.unwrap(), Resolution::default());
        let pod = TestPod::new("busybox-0").label("app", "busybox").build();
        assert!(!resolver.governs(&budget, &pod).await.unwrap());
    }

    #[tokio::test]
    async fn unsupported_target_kind() {
        let cluster = Arc::new(FakeCluster::new());
        let budget = target_budget("DaemonSet", "apps/v1", "agent");

        let error = resolver(&cluster).resolve(&budget).await.unwrap_err();
        assert!(matches!(error, Error::UnsupportedKind { .. }), "{error}");
    }

    #[tokio::test]
    async fn selector_governs_by_labels_in_the_same_namespace() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.put_workload(clone_set("web", 2));
        let resolver = resolver(&cluster);
        let budget = selector_budget();

        let pod = TestPod::new("web-0")
            .label("pub", "web")
            .owned_by("apps.kruise.io/v1alpha1", "CloneSet", "web")
            .build();
        assert!(resolver.governs(&budget, &pod).await.unwrap());

        let mut elsewhere = pod.clone();
        elsewhere.metadata.namespace = Some("other".to_string());
        assert!(!resolver.governs(&budget, &elsewhere).await.unwrap());
    }

    #[rstest]
    #[case::without_controller(TestPod::new("orphan").label("pub", "web").build())]
    #[case::unsupported_controller(
        TestPod::new("job-0").label("pub", "web").owned_by("batch/v1", "Job", "job").build()
    )]
    #[case::missing_controller(
        TestPod::new("web-rs-0")
            .label("pub", "web")
            .owned_by("apps/v1", "ReplicaSet", "web-rs")
            .build()
    )]
    #[tokio::test]
    async fn selector_does_not_govern_unattributable_pods(#[case] pod: Pod) {
        let cluster = Arc::new(FakeCluster::new());
        cluster.put_workload(clone_set("web", 2));
        cluster.put_pod(pod.clone());
        let resolver = resolver(&cluster);
        let budget = selector_budget();

        assert!(!resolver.governs(&budget, &pod).await.unwrap());
        assert_eq!(resolver.resolve(&budget).await.unwrap(), Resolution::default());
    }
}
