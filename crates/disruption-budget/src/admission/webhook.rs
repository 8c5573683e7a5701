//! `ValidatingWebhook` endpoint translating `AdmissionReview`s of pods into disruption requests.
//!
//! Expected registrations: `pods` for `DELETE` and `UPDATE`, `pods/eviction` for `CREATE`, all
//! with `admissionReviewVersions: ["v1"]`.

use std::sync::Arc;

use axum::{Json, Router, routing::post};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::DynamicObject,
    core::{
        admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
        dynamic::ParseDynamicObjectError,
    },
};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::instrument;

use super::{AdmissionGate, Decision, Disruption, DisruptionKind};
use crate::{
    client::{self, ClusterReader},
    pod_utils,
};

pub const VALIDATE_PATH: &str = "/validate/pods";

const EVICTION_SUBRESOURCE: &str = "eviction";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("the admission request for {operation:?} carries no {field}"))]
    MissingObject {
        operation: Operation,
        field: &'static str,
    },

    #[snafu(display("failed to parse {field} as a pod"))]
    ParsePod {
        source: ParseDynamicObjectError,
        field: &'static str,
    },

    #[snafu(display("the eviction of pod {name} has no namespace"))]
    MissingNamespace { name: String },

    #[snafu(display("failed to read evicted pod {namespace}/{name}"))]
    ReadPod {
        source: client::Error,
        namespace: String,
        name: String,
    },
}

/// What an admission request asks for.
#[derive(Debug, PartialEq)]
enum Request {
    /// Does not disrupt anything.
    Ignore,

    Disrupt { pod: Box<Pod>, kind: DisruptionKind },

    /// Eviction of a pod that needs to be looked up first.
    Evict { namespace: String, name: String },
}

pub struct AdmissionState {
    pub gate: AdmissionGate,
    pub cluster: Arc<dyn ClusterReader>,
}

/// Routes serving the disruption webhook.
pub fn router(state: Arc<AdmissionState>) -> Router {
    let handler = |Json(review): Json<AdmissionReview<DynamicObject>>| async move {
        let request: AdmissionRequest<DynamicObject> = match review.try_into() {
            Ok(request) => request,
            Err(err) => {
                return Json(
                    AdmissionResponse::invalid(format!("failed to convert to request: {err}"))
                        .into_review(),
                );
            }
        };

        let response = review_disruption(&state, request).await;
        Json(response.into_review())
    };

    Router::new().route(VALIDATE_PATH, post(handler))
}

#[instrument(skip_all, fields(
    uid = %request.uid,
    operation = ?request.operation,
    k8s.pod.name = %request.name,
    k8s.pod.namespace = ?request.namespace,
))]
pub async fn review_disruption(
    state: &AdmissionState,
    request: AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let response = AdmissionResponse::from(&request);
    let (pod, kind) = match classify(&request) {
        Ok(Request::Ignore) => return response,
        Ok(Request::Disrupt { pod, kind }) => (pod, kind),
        Ok(Request::Evict { namespace, name }) => {
            match state.cluster.get_pod(&namespace, &name).await {
                Ok(Some(pod)) => (Box::new(pod), DisruptionKind::Eviction),
                // the eviction fails on its own
                Ok(None) => return response,
                Err(source) => {
                    let error = Error::ReadPod {
                        source,
                        namespace,
                        name,
                    };
                    return deny_on_error(state, response, &error);
                }
            }
        }
        Err(error) => return deny_on_error(state, response, &error),
    };

    let decision = state
        .gate
        .admit(Disruption {
            pod: &pod,
            kind,
            dry_run: request.dry_run,
        })
        .await;
    match decision {
        Decision::Allow => response,
        deny @ Decision::Deny { .. } => response.deny(deny.to_string()),
    }
}

fn deny_on_error(
    state: &AdmissionState,
    response: AdmissionResponse,
    error: &Error,
) -> AdmissionResponse {
    tracing::warn!(
        error = error as &dyn std::error::Error,
        "failed to interpret admission request"
    );
    if state.gate.config.fail_open {
        response
    } else {
        response.deny(error.to_string())
    }
}

fn classify(request: &AdmissionRequest<DynamicObject>) -> Result<Request, Error> {
    if request.sub_resource.as_deref() == Some(EVICTION_SUBRESOURCE) {
        if request.operation != Operation::Create {
            return Ok(Request::Ignore);
        }
        let namespace = request.namespace.clone().context(MissingNamespaceSnafu {
            name: &request.name,
        })?;
        return Ok(Request::Evict {
            namespace,
            name: request.name.clone(),
        });
    }
    if request.sub_resource.is_some() {
        return Ok(Request::Ignore);
    }

    match request.operation {
        Operation::Delete => {
            let pod = parse_pod(request, request.old_object.as_ref(), "oldObject")?;
            Ok(Request::Disrupt {
                pod: Box::new(pod),
                kind: DisruptionKind::Deletion,
            })
        }
        Operation::Update => {
            let old = parse_pod(request, request.old_object.as_ref(), "oldObject")?;
            let new = parse_pod(request, request.object.as_ref(), "object")?;
            if pod_utils::container_images(&old) == pod_utils::container_images(&new) {
                return Ok(Request::Ignore);
            }
            Ok(Request::Disrupt {
                pod: Box::new(old),
                kind: DisruptionKind::Update,
            })
        }
        Operation::Create | Operation::Connect => Ok(Request::Ignore),
    }
}

fn parse_pod(
    request: &AdmissionRequest<DynamicObject>,
    object: Option<&DynamicObject>,
    field: &'static str,
) -> Result<Pod, Error> {
    object
        .context(MissingObjectSnafu {
            operation: request.operation.clone(),
            field,
        })?
        .clone()
        .try_parse()
        .context(ParsePodSnafu { field })
}
