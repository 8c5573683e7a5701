//! Workload kinds whose pods can be governed by a budget.
//!
//! Every supported kind is described by a [`WorkloadCapability`] registered in the
//! [`WorkloadRegistry`]. The [`resolver`] only ever talks to capabilities, so new kinds are
//! supported by registering another implementation.

use std::{collections::HashMap, fmt, sync::Arc};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use kube::{
    ResourceExt,
    api::{ApiResource, DynamicObject},
};
use snafu::Snafu;

pub mod kinds;
pub mod resolver;

pub use resolver::{Resolution, WorkloadResolver};

#[derive(Debug, Snafu)]
pub enum WorkloadError {
    #[snafu(display("failed to parse {kind} {name:?}"))]
    ParseWorkload {
        source: kube::core::dynamic::ParseDynamicObjectError,
        kind: String,
        name: String,
    },

    #[snafu(display("{kind} {name:?} has no pod selector"))]
    MissingPodSelector { kind: String, name: String },

    #[snafu(display("{kind} {name:?} has an invalid {field}"))]
    InvalidField {
        source: serde_json::Error,
        kind: String,
        name: String,
        field: &'static str,
    },
}

/// Group and kind of a workload, the key of the [`WorkloadRegistry`].
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
        }
    }

    /// Splits the group off an `apiVersion` such as `apps/v1`. The core group is empty.
    pub fn from_api_version(api_version: &str, kind: impl Into<String>) -> Self {
        let group = api_version
            .split_once('/')
            .map_or("", |(group, _version)| group);
        Self::new(group, kind)
    }

    pub fn of_owner(owner: &OwnerReference) -> Self {
        Self::from_api_version(&owner.api_version, &owner.kind)
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// What the resolver needs to know about a workload kind.
pub trait WorkloadCapability: Send + Sync {
    /// The resource used to fetch objects of this kind.
    fn api_resource(&self) -> ApiResource;

    /// The number of replicas the workload intends to run.
    fn declared_replicas(&self, workload: &DynamicObject) -> Result<i32, WorkloadError>;

    /// The selector the workload uses to find its pods.
    fn pod_selector(&self, workload: &DynamicObject) -> Result<LabelSelector, WorkloadError>;

    /// The controller managing this workload, if pods of this kind should be attributed to it
    /// instead. Returns [`None`] for top-level workloads.
    fn parent<'a>(&self, _workload: &'a DynamicObject) -> Option<&'a OwnerReference> {
        None
    }
}

/// Capabilities of all supported workload kinds, keyed by [`GroupKind`].
#[derive(Clone, Default)]
pub struct WorkloadRegistry {
    capabilities: HashMap<GroupKind, Arc<dyn WorkloadCapability>>,
}

impl WorkloadRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry knowing the built-in kinds, see [`kinds`].
    pub fn with_builtin_kinds() -> Self {
        let mut registry = Self::new();
        kinds::register_builtin(&mut registry);
        registry
    }

    /// Registers the capability under the group and kind of its [`ApiResource`], replacing an
    /// earlier registration of the same kind.
    pub fn register(&mut self, capability: impl WorkloadCapability + 'static) -> &mut Self {
        let resource = capability.api_resource();
        self.capabilities.insert(
            GroupKind::new(resource.group, resource.kind),
            Arc::new(capability),
        );
        self
    }

    pub fn get(&self, group_kind: &GroupKind) -> Option<&dyn WorkloadCapability> {
        self.capabilities.get(group_kind).map(AsRef::as_ref)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &GroupKind> {
        self.capabilities.keys()
    }

    /// Resources of all registered kinds, used to watch workloads.
    pub fn api_resources(&self) -> Vec<ApiResource> {
        self.capabilities
            .values()
            .map(|capability| capability.api_resource())
            .collect()
    }
}

impl fmt::Debug for WorkloadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.kinds()).finish()
    }
}

/// Whether `owner` refers to exactly this `workload`, including its UID.
pub fn is_same_object(owner: &OwnerReference, workload: &DynamicObject) -> bool {
    workload.name_any() == owner.name && workload.uid().is_none_or(|uid| uid == owner.uid)
}
