//! Helpers for inspecting [`Pod`] state.

use k8s_openapi::{
    api::core::v1::Pod,
    apimachinery::pkg::apis::meta::v1::OwnerReference,
    jiff::Timestamp,
};

const READY_CONDITION: &str = "Ready";

/// Whether the pod reports the `Ready` condition as `True`.
pub fn is_ready(pod: &Pod) -> bool {
    ready_condition(pod).is_some_and(|condition| condition.status == "True")
}

/// Whether the pod has been marked for deletion.
pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// A pod counts as available if it is Ready and not being deleted.
pub fn is_available(pod: &Pod) -> bool {
    is_ready(pod) && !is_terminating(pod)
}

/// The last time the `Ready` condition changed, if known.
pub fn ready_transition_time(pod: &Pod) -> Option<Timestamp> {
    ready_condition(pod)?
        .last_transition_time
        .as_ref()
        .map(|time| time.0)
}

/// The owner reference marked as the managing controller of the pod.
pub fn controller_ref(pod: &Pod) -> Option<&OwnerReference> {
    pod.metadata
        .owner_references
        .iter()
        .flatten()
        .find(|owner| owner.controller == Some(true))
}

/// The containers' images, in order, used to detect in-place updates.
pub fn container_images(pod: &Pod) -> Vec<Option<&str>> {
    pod.spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .map(|container| container.image.as_deref())
        .collect()
}

fn ready_condition(pod: &Pod) -> Option<&k8s_openapi::api::core::v1::PodCondition> {
    pod.status
        .as_ref()?
        .conditions
        .iter()
        .flatten()
        .find(|condition| condition.type_ == READY_CONDITION)
}
