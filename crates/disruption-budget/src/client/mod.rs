//! Access to the cluster state.
//!
//! The reconciler and the admission gate only depend on the [`BudgetStore`] and
//! [`ClusterReader`] traits. [`KubeClient`] implements both against the Kubernetes API.

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::Pod, apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::api::{ApiResource, DynamicObject};
use snafu::Snafu;

use crate::{
    crd::{BudgetKey, PodUnavailableBudget},
    selector::SelectorError,
};

#[cfg(test)]
pub mod fake;
mod kube_client;

pub use kube_client::{KubeClient, WorkloadStores};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("the write to {object} conflicts with a concurrent modification"))]
    Conflict { object: String },

    #[snafu(display("failed to {operation} {object}"))]
    Request {
        source: kube::Error,
        operation: &'static str,
        object: String,
    },

    #[snafu(display("failed to serialize {object}"))]
    Serialize {
        source: serde_json::Error,
        object: String,
    },

    #[snafu(display("invalid label selector"))]
    InvalidSelector { source: SelectorError },
}

impl Error {
    /// Whether the error is the result of a failed conditional write.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// How fresh a read needs to be.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Read {
    /// From the local watch cache, possibly lagging behind the API server.
    Cached,

    /// From the API server.
    Live,
}

/// Reads and conditionally writes [`PodUnavailableBudget`]s.
#[async_trait]
pub trait BudgetStore: Send + Sync {
    /// All budgets in `namespace`, from the watch cache.
    async fn list_budgets(&self, namespace: &str) -> Result<Vec<PodUnavailableBudget>>;

    async fn get_budget(&self, key: &BudgetKey, read: Read)
    -> Result<Option<PodUnavailableBudget>>;

    /// Replaces the status of the budget if, and only if, the stored object still has the
    /// `metadata.resourceVersion` of `budget`. Fails with [`Error::Conflict`] otherwise.
    async fn replace_status(&self, budget: &PodUnavailableBudget)
    -> Result<PodUnavailableBudget>;
}

/// Reads pods and workloads. None of them are ever written.
#[async_trait]
pub trait ClusterReader: Send + Sync {
    /// Pods in `namespace` matching `selector`.
    async fn list_pods(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<Pod>>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    async fn get_workload(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>>;
}
