//! Utilities for publishing Kubernetes events

use std::error::Error;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::{
    controller,
    events::{Event, EventType, Recorder},
};
use tracing::Instrument;

use super::controller::ReconcilerError;

/// Converts an [`Error`] into a publishable Kubernetes [`Event`]
fn error_to_event<E: ReconcilerError>(err: &E) -> Event {
    // Walk the whole error chain, so that we get all the full reason for the error
    let mut full_msg = {
        use std::fmt::Write;
        let mut buf = err.to_string();
        let mut err: &dyn Error = err;
        loop {
            err = match err.source() {
                Some(err) => {
                    // writing into a String cannot fail
                    let _ = write!(buf, ": {err}");
                    err
                }
                None => break buf,
            }
        }
    };
    message::truncate_with_ellipsis(&mut full_msg, 1024);
    Event {
        type_: EventType::Warning,
        reason: err.category().to_string(),
        note: Some(full_msg),
        action: "Reconcile".to_string(),
        secondary: None,
    }
}

/// Publishes the error of a failed reconciliation as an event on the reconciled object, in the
/// background
///
/// Other controller errors concern the operator administrator and are only logged.
#[tracing::instrument(skip_all)]
pub fn publish_controller_error_as_k8s_event<ReconcileErr, QueueErr>(
    recorder: &Recorder,
    controller_error: &controller::Error<ReconcileErr, QueueErr>,
) where
    ReconcileErr: ReconcilerError + 'static,
    QueueErr: Error + 'static,
{
    let controller::Error::ReconcilerFailed(error, obj) = controller_error else {
        return;
    };
    let recorder = recorder.clone();
    let object: ObjectReference = obj.clone().into();
    let event = error_to_event(error);
    tokio::spawn(
        async move {
            if let Err(err) = recorder.publish(&event, &object).await {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "Failed to report error as K8s event"
                );
            }
        }
        .in_current_span(),
    );
}

mod message {
    /// Ensures that `msg` is at most `max_len` _bytes_ long
    ///
    /// If `msg` is longer than `max_len` then the extra text is replaced with an ellipsis.
    pub fn truncate_with_ellipsis(msg: &mut String, max_len: usize) {
        const ELLIPSIS: char = '…';
        const ELLIPSIS_LEN: usize = ELLIPSIS.len_utf8();
        if msg.len() > max_len {
            let start_of_trunc_char = find_start_of_char(msg, max_len.saturating_sub(ELLIPSIS_LEN));
            msg.truncate(start_of_trunc_char);
            if ELLIPSIS_LEN <= max_len {
                msg.push(ELLIPSIS);
            }
        }
        debug_assert!(msg.len() <= max_len);
    }

    fn find_start_of_char(s: &str, mut pos: usize) -> usize {
        while !s.is_char_boundary(pos) {
            pos -= 1;
        }
        pos
    }

    #[cfg(test)]
    mod tests {
        use rstest::rstest;

        use super::{find_start_of_char, truncate_with_ellipsis};

        #[rstest]
        #[case("hello", 5, "hello")]
        #[case("hello", 4, "h…")]
        #[case("hello, this is a much larger string", 4, "h…")]
        #[case("hello🙋", 8, "hello…")]
        #[case("hello", 2, "")]
        fn truncate(#[case] input: &str, #[case] max_len: usize, #[case] expected: &str) {
            let mut msg = input.to_string();
            truncate_with_ellipsis(&mut msg, max_len);
            assert_eq!(msg, expected);
        }

        #[test]
        fn find_start_of_char_should_find_start_of_emoji() {
            assert_eq!(find_start_of_char("hello", 2), 2);
            // in the middle of the emoji
            assert_eq!(find_start_of_char("hello🙋", 7), 5);
        }
    }
}
