//! The built-in workload kinds.
//!
//! The `apps/v1` kinds are parsed into their typed `k8s-openapi` representation. The OpenKruise
//! kinds have no Rust types, their replicas and selector are read from the `spec` directly.

use std::marker::PhantomData;

use k8s_openapi::{
    api::apps::v1::{Deployment, ReplicaSet, StatefulSet},
    apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference},
};
use kube::{
    Resource, ResourceExt,
    api::{ApiResource, DynamicObject, GroupVersionKind},
};
use serde::de::DeserializeOwned;
use snafu::{OptionExt, ResultExt};

use super::{
    GroupKind, InvalidFieldSnafu, MissingPodSelectorSnafu, ParseWorkloadSnafu, WorkloadCapability,
    WorkloadError, WorkloadRegistry,
};

pub const KRUISE_GROUP: &str = "apps.kruise.io";

/// Replicas used when a workload does not declare any, matching the API server default.
const DEFAULT_REPLICAS: i32 = 1;

pub fn register_builtin(registry: &mut WorkloadRegistry) {
    registry
        .register(TypedWorkload::<Deployment>::new())
        .register(TypedWorkload::<ReplicaSet>::new())
        .register(TypedWorkload::<StatefulSet>::new())
        .register(SpecFieldWorkload::new(KRUISE_GROUP, "v1alpha1", "CloneSet", "clonesets"))
        .register(SpecFieldWorkload::new(KRUISE_GROUP, "v1beta1", "StatefulSet", "statefulsets"))
        .register(SpecFieldWorkload::new(
            KRUISE_GROUP,
            "v1alpha1",
            "UnitedDeployment",
            "uniteddeployments",
        ));
}

/// Access to the replica related fields of a typed workload.
pub trait Replicated {
    /// Kind of the controller this workload is attributed to when it is owned by one.
    const PARENT: Option<(&'static str, &'static str)> = None;

    fn replicas(&self) -> Option<i32>;
    fn selector(&self) -> Option<&LabelSelector>;
}

impl Replicated for Deployment {
    fn replicas(&self) -> Option<i32> {
        self.spec.as_ref()?.replicas
    }

    fn selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|spec| &spec.selector)
    }
}

impl Replicated for ReplicaSet {
    const PARENT: Option<(&'static str, &'static str)> = Some(("apps", "Deployment"));

    fn replicas(&self) -> Option<i32> {
        self.spec.as_ref()?.replicas
    }

    fn selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|spec| &spec.selector)
    }
}

impl Replicated for StatefulSet {
    fn replicas(&self) -> Option<i32> {
        self.spec.as_ref()?.replicas
    }

    fn selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|spec| &spec.selector)
    }
}

/// Capability of a workload kind with a `k8s-openapi` type.
pub struct TypedWorkload<K> {
    _kind: PhantomData<fn() -> K>,
}

impl<K> TypedWorkload<K> {
    pub fn new() -> Self {
        Self { _kind: PhantomData }
    }
}

impl<K> Default for TypedWorkload<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> TypedWorkload<K>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    fn parse(workload: &DynamicObject) -> Result<K, WorkloadError> {
        workload
            .clone()
            .try_parse::<K>()
            .with_context(|_| ParseWorkloadSnafu {
                kind: K::kind(&()).to_string(),
                name: workload.name_any(),
            })
    }
}

impl<K> WorkloadCapability for TypedWorkload<K>
where
    K: Resource<DynamicType = ()> + DeserializeOwned + Replicated,
{
    fn api_resource(&self) -> ApiResource {
        ApiResource::erase::<K>(&())
    }

    fn declared_replicas(&self, workload: &DynamicObject) -> Result<i32, WorkloadError> {
        Ok(Self::parse(workload)?.replicas().unwrap_or(DEFAULT_REPLICAS))
    }

    fn pod_selector(&self, workload: &DynamicObject) -> Result<LabelSelector, WorkloadError> {
        Self::parse(workload)?
            .selector()
            .cloned()
            .with_context(|| MissingPodSelectorSnafu {
                kind: K::kind(&()).to_string(),
                name: workload.name_any(),
            })
    }

    fn parent<'a>(&self, workload: &'a DynamicObject) -> Option<&'a OwnerReference> {
        let (group, kind) = K::PARENT?;
        let parent = GroupKind::new(group, kind);
        workload
            .owner_references()
            .iter()
            .find(|owner| owner.controller == Some(true) && GroupKind::of_owner(owner) == parent)
    }
}

/// Capability of a workload kind which keeps its replicas in `spec.replicas` and its pod
/// selector in `spec.selector`, without a typed representation.
pub struct SpecFieldWorkload {
    resource: ApiResource,
}

impl SpecFieldWorkload {
    pub fn new(group: &str, version: &str, kind: &str, plural: &str) -> Self {
        let gvk = GroupVersionKind::gvk(group, version, kind);
        Self {
            resource: ApiResource::from_gvk_with_plural(&gvk, plural),
        }
    }

    fn spec_field(&self, workload: &DynamicObject, field: &str) -> Option<serde_json::Value> {
        workload
            .data
            .get("spec")?
            .get(field)
            .filter(|value| !value.is_null())
            .cloned()
    }
}

impl WorkloadCapability for SpecFieldWorkload {
    fn api_resource(&self) -> ApiResource {
        self.resource.clone()
    }

    fn declared_replicas(&self, workload: &DynamicObject) -> Result<i32, WorkloadError> {
        let Some(replicas) = self.spec_field(workload, "replicas") else {
            return Ok(DEFAULT_REPLICAS);
        };
        serde_json::from_value(replicas).with_context(|_| InvalidFieldSnafu {
            kind: self.resource.kind.clone(),
            name: workload.name_any(),
            field: "spec.replicas",
        })
    }

    fn pod_selector(&self, workload: &DynamicObject) -> Result<LabelSelector, WorkloadError> {
        let selector = self
            .spec_field(workload, "selector")
            .with_context(|| MissingPodSelectorSnafu {
                kind: self.resource.kind.clone(),
                name: workload.name_any(),
            })?;
        serde_json::from_value(selector).with_context(|_| InvalidFieldSnafu {
            kind: self.resource.kind.clone(),
            name: workload.name_any(),
            field: "spec.selector",
        })
    }
}
