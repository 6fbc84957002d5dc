//! Utilities for publishing Kubernetes events

use std::error::Error;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::{
    controller,
    events::{Event, EventType, Recorder},
};
use tracing::Instrument;

use super::controller::ReconcilerError;

/// Events carry at most this many bytes in their note.
const MAX_NOTE_LENGTH: usize = 1024;

/// Converts an [`Error`] into a publishable Kubernetes [`Event`]
fn error_to_event<E: ReconcilerError>(err: &E) -> Event {
    // Walk the whole error chain, so that we get all the full reason for the error
    let mut full_msg = {
        let mut buf = err.to_string();
        let mut err: &dyn Error = err;
        while let Some(source) = err.source() {
            buf.push_str(": ");
            buf.push_str(&source.to_string());
            err = source;
        }
        buf
    };
    message::truncate_with_ellipsis(&mut full_msg, MAX_NOTE_LENGTH);
    Event {
        type_: EventType::Warning,
        reason: err.category().to_owned(),
        note: Some(full_msg),
        action: "Reconcile".to_owned(),
        secondary: err.secondary_object().map(Into::into),
    }
}

/// Reports an error coming from a controller to Kubernetes
///
/// This is intended to be executed on the log entries returned by [`kube::runtime::Controller::run`]
#[tracing::instrument(skip(recorder))]
pub(super) fn publish_controller_error_as_k8s_event<ReconcileErr, QueueErr>(
    recorder: &Recorder,
    controller_error: &controller::Error<ReconcileErr, QueueErr>,
) where
    ReconcileErr: ReconcilerError,
    QueueErr: Error,
{
    let controller::Error::ReconcilerFailed(error, obj) = controller_error else {
        // Other error types are intended for the operator administrator, and aren't linked to a specific object
        return;
    };

    let recorder = recorder.clone();
    let reference: ObjectReference = obj.clone().into();
    let event = error_to_event(error);

    // Run in the background
    tokio::spawn(
        async move {
            if let Err(err) = recorder.publish(&event, &reference).await {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "Failed to report error as K8s event"
                );
            }
        }
        .in_current_span(),
    );
}

/// Publishes an event about `reference`.
///
/// Failing to publish is logged and otherwise ignored, an event must never fail a reconciliation.
pub async fn publish_event(
    recorder: &Recorder,
    reference: &ObjectReference,
    type_: EventType,
    reason: &str,
    mut note: String,
) {
    message::truncate_with_ellipsis(&mut note, MAX_NOTE_LENGTH);

    let event = Event {
        type_,
        reason: reason.to_owned(),
        note: Some(note),
        action: "Reconcile".to_owned(),
        secondary: None,
    };

    if let Err(err) = recorder.publish(&event, reference).await {
        tracing::warn!(
            reason,
            error = &err as &dyn std::error::Error,
            "Failed to publish K8s event"
        );
    }
}

mod message {
    /// Ensures that `msg` is at most `max_len` _bytes_ long
    ///
    /// If `msg` is longer than `max_len` then the extra text is replaced with an ellipsis.
    pub fn truncate_with_ellipsis(msg: &mut String, max_len: usize) {
        const ELLIPSIS: char = '…';
        const ELLIPSIS_LEN: usize = ELLIPSIS.len_utf8();
        let len = msg.len();
        if len > max_len {
            let start_of_trunc_char = find_start_of_char(msg, max_len.saturating_sub(ELLIPSIS_LEN));
            msg.truncate(start_of_trunc_char);
            if ELLIPSIS_LEN <= max_len {
                msg.push(ELLIPSIS);
            }
        }
        debug_assert!(msg.len() <= max_len);
    }

    fn find_start_of_char(s: &str, mut pos: usize) -> usize {
        loop {
            if s.is_char_boundary(pos) {
                break pos;
            }
            pos -= 1;
        }
    }

    #[cfg(test)]
    mod tests {
        use super::{find_start_of_char, truncate_with_ellipsis};

        #[test]
        fn truncate_should_be_noop_if_string_fits() {
            let mut x = "hello".to_owned();
            truncate_with_ellipsis(&mut x, 5);
            assert_eq!(&x, "hello");
        }

        #[test]
        fn truncate_should_ellipsize_large_string() {
            let mut x = "hello".to_owned();
            truncate_with_ellipsis(&mut x, 4);
            assert_eq!(&x, "h…");
            x = "hello, this is a much larger string".to_owned();
            truncate_with_ellipsis(&mut x, 4);
            assert_eq!(&x, "h…");
        }

        #[test]
        fn truncate_should_ellipsize_emoji() {
            let mut x = "hello🙋".to_owned();
            truncate_with_ellipsis(&mut x, 8);
            assert_eq!(&x, "hello…");
        }

        #[test]
        fn truncate_to_event_note_length() {
            let mut x = "ä".repeat(1000);
            truncate_with_ellipsis(&mut x, 1024);
            assert!(x.len() <= 1024);
            assert!(x.ends_with('…'));
        }

        #[test]
        fn find_start_of_char_should_be_noop_for_ascii() {
            assert_eq!(find_start_of_char("hello", 2 /* l */), 2);
        }

        #[test]
        fn find_start_of_char_should_find_start_of_emoji() {
            assert_eq!(
                find_start_of_char("hello🙋", 7 /* in the middle of the emoji */),
                5
            );
        }
    }
}
