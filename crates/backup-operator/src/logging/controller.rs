//! Logging of reconciliation results.
//!
//! Every result of the controller stream ends up in the log. Failed reconciliations of a
//! `BackupPolicy` are additionally published as a Warning event on the policy, so users see them
//! with `kubectl describe`.

use std::error::Error;

use kube::{
    Resource,
    core::DynamicObject,
    runtime::{
        controller::{self, Action},
        events::Recorder,
        reflector::ObjectRef,
    },
};

use crate::logging::k8s_events::publish_controller_error_as_k8s_event;

/// Errors returned by a reconcile function.
pub trait ReconcilerError: Error {
    /// Short name of the error kind, used as the event reason (for example `CreateJob`).
    ///
    /// Deriving [`strum::EnumDiscriminants`] with [`strum::IntoStaticStr`] gives this for free.
    fn category(&self) -> &'static str;

    /// The object the error is about besides the reconciled one, such as the backup job which
    /// could not be created. It is attached to the event as related object.
    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        None
    }
}

type ReconcileResult<K, ReconcileErr, QueueErr> =
    Result<(ObjectRef<K>, Action), controller::Error<ReconcileErr, QueueErr>>;

/// Logs one item of the controller stream and publishes reconcile errors as events.
pub fn report_controller_reconciled<K, ReconcileErr, QueueErr>(
    recorder: &Recorder,
    controller_name: &str,
    result: &ReconcileResult<K, ReconcileErr, QueueErr>,
) where
    K: Resource,
    ReconcileErr: ReconcilerError + 'static,
    QueueErr: Error + 'static,
{
    let error = match result {
        Ok((object, action)) => {
            tracing::info!(
                controller.name = controller_name,
                object = %object,
                ?action,
                "Reconciled object"
            );
            return;
        }
        Err(error) => error,
    };

    tracing::error!(
        controller.name = controller_name,
        error = error as &dyn Error,
        "Failed to reconcile object",
    );

    // Queue and watch errors have no object to attach an event to, they only go to the log
    publish_controller_error_as_k8s_event(recorder, error);
}
