//! Facilities for reporting Kubernetes controller outcomes
//!
//! The primary entry point is [`report_controller_reconciled`].

use std::error::Error;

use kube::{
    Resource,
    runtime::{
        controller::{self, Action},
        events::Recorder,
        reflector::ObjectRef,
    },
};

use crate::logging::k8s_events::publish_controller_error_as_k8s_event;

/// [`Error`] extensions that help report reconciliation errors
pub trait ReconcilerError: Error {
    /// `PascalCase`d name for the error category
    ///
    /// This can typically be implemented by delegating to [`strum::EnumDiscriminants`] and [`strum::IntoStaticStr`].
    fn category(&self) -> &'static str;
}

/// Reports the controller reconciliation result to all relevant targets
///
/// Currently this means that the result is reported to:
/// * The current [`tracing::Subscriber`], typically at least stderr
/// * Kubernetes events on the reconciled object, if the reconciler failed
pub fn report_controller_reconciled<K, ReconcileErr, QueueErr>(
    recorder: &Recorder,
    controller_name: &str,
    result: &Result<(ObjectRef<K>, Action), controller::Error<ReconcileErr, QueueErr>>,
) where
    K: Resource,
    ReconcileErr: ReconcilerError + 'static,
    QueueErr: std::error::Error + 'static,
{
    match result {
        Ok((obj, action)) => {
            tracing::info!(
                controller.name = controller_name,
                object = %obj,
                ?action,
                "Reconciled object"
            );
        }
        Err(err) => report_controller_error(recorder, controller_name, err),
    }
}

/// Reports an error to the operator administrator and, if relevant, the end user
fn report_controller_error<ReconcileErr, QueueErr>(
    recorder: &Recorder,
    controller_name: &str,
    error: &controller::Error<ReconcileErr, QueueErr>,
) where
    ReconcileErr: ReconcilerError + 'static,
    QueueErr: std::error::Error + 'static,
{
    tracing::error!(
        controller.name = controller_name,
        error = error as &dyn std::error::Error,
        "Failed to reconcile object",
    );
    publish_controller_error_as_k8s_event(recorder, error);
}
