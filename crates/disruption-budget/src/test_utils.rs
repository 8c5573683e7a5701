//! Fixtures shared by the unit tests.

use std::collections::BTreeMap;

use indoc::formatdoc;
use k8s_openapi::{
    api::core::v1::{Container, Pod, PodCondition, PodSpec, PodStatus},
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time},
    jiff::Timestamp,
};
use kube::api::DynamicObject;

pub const NAMESPACE: &str = "default";

pub fn timestamp(value: &str) -> Timestamp {
    value.parse().expect("invalid test timestamp")
}

pub fn object<T: serde::de::DeserializeOwned>(yaml: &str) -> T {
    serde_yaml::from_str(yaml).expect("invalid test input")
}

/// A Deployment selecting `app: <name>`, with the UID [`TestPod::owned_by`] refers to.
pub fn deployment(name: &str, replicas: i32) -> DynamicObject {
    object(&formatdoc! {"
        apiVersion: apps/v1
        kind: Deployment
        metadata:
          name: {name}
          namespace: {NAMESPACE}
          uid: {name}-uid
        spec:
          replicas: {replicas}
          selector:
            matchLabels:
              app: {name}
          template: {{}}
    "})
}

pub fn replica_set(name: &str, deployment: &str, replicas: i32) -> DynamicObject {
    object(&formatdoc! {"
        apiVersion: apps/v1
        kind: ReplicaSet
        metadata:
          name: {name}
          namespace: {NAMESPACE}
          uid: {name}-uid
          ownerReferences:
            - apiVersion: apps/v1
              kind: Deployment
              name: {deployment}
              uid: {deployment}-uid
              controller: true
        spec:
          replicas: {replicas}
          selector:
            matchLabels:
              app: {deployment}
    "})
}

pub fn clone_set(name: &str, replicas: i32) -> DynamicObject {
    object(&formatdoc! {"
        apiVersion: apps.kruise.io/v1alpha1
        kind: CloneSet
        metadata:
          name: {name}
          namespace: {NAMESPACE}
          uid: {name}-uid
        spec:
          replicas: {replicas}
          selector:
            matchLabels:
              app: {name}
    "})
}

/// Builds [`Pod`]s in [`NAMESPACE`] which are Ready unless told otherwise.
pub struct TestPod {
    pod: Pod,
}

impl TestPod {
    pub fn new(name: &str) -> Self {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NAMESPACE.to_string()),
                resource_version: Some("1".to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "main".to_string(),
                    image: Some("busybox:1.36".to_string()),
                    ..Container::default()
                }],
                ..PodSpec::default()
            }),
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    last_transition_time: Some(Time(timestamp("2024-05-01T09:00:00Z"))),
                    ..PodCondition::default()
                }]),
                ..PodStatus::default()
            }),
        };
        Self { pod }
    }

    pub fn not_ready(self) -> Self {
        self.ready_condition("False", "2024-05-01T09:00:00Z")
    }

    pub fn ready_since(self, since: &str) -> Self {
        self.ready_condition("True", since)
    }

    pub fn terminating(mut self) -> Self {
        self.pod.metadata.deletion_timestamp = Some(Time(timestamp("2024-05-01T10:00:00Z")));
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.pod
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn owned_by(mut self, api_version: &str, kind: &str, name: &str) -> Self {
        self.pod
            .metadata
            .owner_references
            .get_or_insert_with(Vec::new)
            .push(OwnerReference {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
                name: name.to_string(),
                uid: format!("{name}-uid"),
                controller: Some(true),
                ..OwnerReference::default()
            });
        self
    }

    pub fn image(mut self, image: &str) -> Self {
        if let Some(container) = self
            .pod
            .spec
            .as_mut()
            .and_then(|spec| spec.containers.first_mut())
        {
            container.image = Some(image.to_string());
        }
        self
    }

    pub fn build(self) -> Pod {
        self.pod
    }

    fn ready_condition(mut self, status: &str, since: &str) -> Self {
        self.pod.status = Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: status.to_string(),
                last_transition_time: Some(Time(timestamp(since))),
                ..PodCondition::default()
            }]),
            ..PodStatus::default()
        });
        self
    }
}
