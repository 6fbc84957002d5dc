//! The controller turning [`BackupPolicy`] objects into backup [`Job`]s.
//!
//! Every reconciliation lists the jobs owned by a policy, prunes finished jobs according to the
//! retention settings, starts a job if a fire time of the schedule passed and writes the observed
//! state back into the status of the policy.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use futures::{StreamExt, future};
use jiff::{SignedDuration, Timestamp};
use k8s_openapi::{api::batch::v1::Job, apimachinery::pkg::apis::meta::v1::Time};
use kube::{
    Resource, ResourceExt,
    core::DynamicObject,
    runtime::{
        Controller,
        controller::Action,
        events::{EventType, Recorder, Reporter},
        reflector::ObjectRef,
        watcher,
    },
};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    client::{self, Client},
    crd::{BackupPolicy, BackupPolicyPhase, BackupPolicySpec, BackupPolicyStatus, ConcurrencyPolicy},
    job::{self, JobState, K8S_APP_MANAGED_BY_KEY, MANAGED_BY},
    logging::{
        controller::{ReconcilerError, report_controller_reconciled},
        publish_event,
    },
    namespace::WatchNamespace,
    retention::{self, FinishedJob, JobOutcome},
    schedule::{self, CronSchedule},
    status::condition::{backup_policy::BackupPolicyConditionBuilder, compute_conditions_at},
};

pub mod backoff;

use backoff::BackoffTable;

pub const CONTROLLER_NAME: &str = "backuppolicy";

/// Upper bound of the time between two reconciliations of a policy with a schedule.
pub const MAX_REQUEUE: Duration = Duration::from_secs(5 * 60);

/// Lower bound of the requeue delay, so that a fire time which is just about to pass is not
/// hammered.
const MIN_REQUEUE: Duration = Duration::from_secs(1);

/// Settings of the controller which are the same for every policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Name of the operator, used as the field manager and event reporter.
    pub operator_name: String,

    /// Image of backup jobs whose policy does not set one.
    pub default_image: Option<String>,
}

/// State shared between all reconciliations.
pub struct Ctx {
    pub client: Client,
    pub recorder: Recorder,
    pub config: ControllerConfig,
    pub backoff: Mutex<BackoffTable>,
}

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("BackupPolicy object has no namespace"))]
    ObjectHasNoNamespace,

    #[snafu(display("failed to list backup jobs"))]
    ListJobs { source: client::Error },

    #[snafu(display("failed to delete backup job"))]
    DeleteJob {
        source: client::Error,
        job: ObjectRef<Job>,
    },

    #[snafu(display("failed to build backup job"))]
    BuildJob { source: job::Error },

    #[snafu(display("failed to create backup job"))]
    CreateJob {
        source: client::Error,
        job: ObjectRef<Job>,
    },

    #[snafu(display("failed to update status"))]
    ApplyStatus { source: client::Error },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Self::DeleteJob { job, .. } | Self::CreateJob { job, .. } => Some(job.clone().erase()),
            Self::ObjectHasNoNamespace
            | Self::ListJobs { .. }
            | Self::BuildJob { .. }
            | Self::ApplyStatus { .. } => None,
        }
    }
}

/// Problems with the spec of a policy. These are reported in the status instead of being retried.
#[derive(Debug, Snafu)]
pub enum ValidationError {
    #[snafu(display("invalid schedule: {source}"))]
    InvalidSchedule { source: schedule::Error },

    #[snafu(display(
        "no backup image configured, set spec.job.image or the operator's default backup image"
    ))]
    NoImage,

    #[snafu(display("spec.destination.s3.bucket must not be empty"))]
    EmptyBucket,
}

/// A policy which passed validation.
#[derive(Debug)]
pub struct ValidPolicy<'a> {
    /// The schedule along with the image of the jobs it starts, [`None`] if no schedule is set.
    pub schedule: Option<(CronSchedule, &'a str)>,
}

/// Checks everything about `policy` which can be checked without talking to Kubernetes.
///
/// An image is only required if backups are scheduled.
pub fn validate<'a>(
    policy: &'a BackupPolicy,
    default_image: Option<&'a str>,
) -> Result<ValidPolicy<'a>, ValidationError> {
    let schedule = match policy.schedule() {
        Some(expression) => {
            let schedule = expression
                .parse::<CronSchedule>()
                .context(InvalidScheduleSnafu)?;
            let image = policy.image(default_image).context(NoImageSnafu)?;
            Some((schedule, image))
        }
        None => None,
    };

    if let Some(s3) = &policy.spec.destination.s3
        && s3.bucket.trim().is_empty()
    {
        return EmptyBucketSnafu.fail();
    }

    Ok(ValidPolicy { schedule })
}

/// What to do about the schedule in this reconciliation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// No fire time passed since the last run.
    Wait,

    /// The run is too late to be started. It still counts as scheduled.
    SkipMissedDeadline {
        scheduled_at: Timestamp,
        late_by: SignedDuration,
    },

    /// A previous job is still running and concurrent runs are forbidden.
    Postpone { scheduled_at: Timestamp },

    /// Start a job, deleting the active ones first if `replace_active` is set.
    Start {
        scheduled_at: Timestamp,
        replace_active: bool,
    },
}

/// Decides whether a backup has to be started at `now`.
///
/// `since` is the last fire time that was handled, or the creation time of the policy if none was.
pub fn decide(
    schedule: &CronSchedule,
    spec: &BackupPolicySpec,
    since: Timestamp,
    now: Timestamp,
    has_active_jobs: bool,
) -> Decision {
    let Some(missed) = schedule.most_recent_missed(since, now) else {
        return Decision::Wait;
    };

    if missed.too_many {
        tracing::warn!(
            %since,
            scheduled_at = %missed.scheduled_at,
            "too many missed fire times, only the latest one is considered"
        );
    }

    let scheduled_at = missed.scheduled_at;
    let late_by = now.duration_since(scheduled_at);

    if let Some(deadline) = spec
        .starting_deadline
        .and_then(|deadline| SignedDuration::try_from(deadline).ok())
        && late_by > deadline
    {
        return Decision::SkipMissedDeadline {
            scheduled_at,
            late_by,
        };
    }

    match (spec.concurrency_policy, has_active_jobs) {
        (ConcurrencyPolicy::Forbid, true) => Decision::Postpone { scheduled_at },
        (ConcurrencyPolicy::Replace, true) => Decision::Start {
            scheduled_at,
            replace_active: true,
        },
        _ => Decision::Start {
            scheduled_at,
            replace_active: false,
        },
    }
}

/// How long to wait before looking at a policy again, given its next fire time.
pub fn requeue_after(next_schedule_time: Option<Timestamp>, now: Timestamp) -> Duration {
    next_schedule_time.map_or(MAX_REQUEUE, |next| {
        Duration::try_from(next.duration_since(now))
            .unwrap_or(Duration::ZERO)
            .clamp(MIN_REQUEUE, MAX_REQUEUE)
    })
}

pub fn phase(
    suspended: bool,
    has_schedule: bool,
    active_jobs: usize,
    last_backup_failed: bool,
) -> BackupPolicyPhase {
    if suspended {
        BackupPolicyPhase::Suspended
    } else if !has_schedule {
        BackupPolicyPhase::Idle
    } else if active_jobs > 0 {
        BackupPolicyPhase::Running
    } else if last_backup_failed {
        BackupPolicyPhase::Failed
    } else {
        BackupPolicyPhase::Scheduled
    }
}

/// The backup jobs owned by a policy, split by their state.
#[derive(Debug, Default)]
pub struct ObservedJobs {
    /// All owned jobs by name.
    pub jobs: BTreeMap<String, Job>,

    /// Names of the jobs which did not finish yet.
    pub active: Vec<String>,

    pub finished: Vec<FinishedJob>,

    /// The newest fire time any of the jobs was created for.
    pub last_scheduled: Option<Timestamp>,
}

impl ObservedJobs {
    /// Classifies `jobs`, ignoring the ones not controlled by the policy with `owner_uid`.
    pub fn new(jobs: Vec<Job>, owner_uid: Option<&str>, now: Timestamp) -> Self {
        let mut observed = Self::default();

        for job in jobs {
            if !is_controlled_by(&job, owner_uid) {
                continue;
            }

            let name = job.name_any();
            let fallback = || {
                job.metadata
                    .creation_timestamp
                    .as_ref()
                    .map_or(now, |time| time.0)
            };

            observed.last_scheduled = observed.last_scheduled.max(job::scheduled_at(&job));

            match job::classify(&job) {
                JobState::Active => observed.active.push(name.clone()),
                JobState::Succeeded { finished_at } => observed.finished.push(FinishedJob {
                    name: name.clone(),
                    finished_at: finished_at.unwrap_or_else(fallback),
                    outcome: JobOutcome::Succeeded,
                }),
                JobState::Failed { finished_at } => observed.finished.push(FinishedJob {
                    name: name.clone(),
                    finished_at: finished_at.unwrap_or_else(fallback),
                    outcome: JobOutcome::Failed,
                }),
            }

            observed.jobs.insert(name, job);
        }

        observed.active.sort();
        observed
    }

    /// The newest finish time of a job with `outcome`.
    pub fn last_finished(&self, outcome: JobOutcome) -> Option<Timestamp> {
        self.finished
            .iter()
            .filter(|job| job.outcome == outcome)
            .map(|job| job.finished_at)
            .max()
    }

    /// Adds a job that was just created to the active ones.
    pub fn record_started(&mut self, name: String) {
        if !self.active.contains(&name) {
            self.active.push(name);
            self.active.sort();
        }
    }

    fn forget(&mut self, name: &str) {
        self.jobs.remove(name);
        self.active.retain(|active| active != name);
        self.finished.retain(|finished| finished.name != name);
    }
}

fn is_controlled_by(job: &Job, owner_uid: Option<&str>) -> bool {
    let Some(owner_uid) = owner_uid else {
        return true;
    };

    job.owner_references()
        .iter()
        .any(|owner| owner.controller == Some(true) && owner.uid == owner_uid)
}

/// Combines the times stored in the status with the times observed on the existing jobs. Jobs
/// may have been pruned since, so the newer of both wins.
fn newest(stored: Option<&Time>, observed: Option<Timestamp>) -> Option<Time> {
    stored.map(|time| time.0).max(observed).map(Time)
}

#[allow(clippy::needless_pass_by_value)]
pub async fn reconcile(policy: Arc<BackupPolicy>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    tracing::info!("Starting reconcile");

    let now = Timestamp::now();
    let namespace = policy.namespace().context(ObjectHasNoNamespaceSnafu)?;
    let backoff_key = format!("{namespace}/{}", policy.name_any());

    let action = reconcile_policy(&policy, &ctx, &namespace, now).await?;

    ctx.backoff
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .reset(&backoff_key);

    Ok(action)
}

async fn reconcile_policy(
    policy: &BackupPolicy,
    ctx: &Ctx,
    namespace: &str,
    now: Timestamp,
) -> Result<Action, Error> {
    let client = &ctx.client;
    let spec = &policy.spec;
    let old_status = policy.status.clone().unwrap_or_default();

    let valid = match validate(policy, ctx.config.default_image.as_deref()) {
        Ok(valid) => valid,
        Err(error) => return report_invalid(policy, client, &error, now).await,
    };

    let jobs: Vec<Job> = client
        .list_with_label_selector(namespace, &job::job_label_selector(&policy.name_any()))
        .await
        .context(ListJobsSnafu)?;

    let mut observed = ObservedJobs::new(jobs, policy.meta().uid.as_deref(), now);

    let last_successful_time = newest(
        old_status.last_successful_time.as_ref(),
        observed.last_finished(JobOutcome::Succeeded),
    );
    let last_failed_time = newest(
        old_status.last_failed_time.as_ref(),
        observed.last_finished(JobOutcome::Failed),
    );

    for name in retention::jobs_to_delete(&observed.finished, &spec.retention, now) {
        delete_job(client, &mut observed, &name).await?;
    }

    // Jobs remember their fire time, in case the status was lost
    let mut last_schedule_time = newest(
        old_status.last_schedule_time.as_ref(),
        observed.last_scheduled,
    );
    let mut next_schedule_time = None;

    if let Some((schedule, image)) = &valid.schedule
        && !spec.suspend
    {
        let since = last_schedule_time
            .as_ref()
            .or(policy.metadata.creation_timestamp.as_ref())
            .map_or(now, |time| time.0);

        let decision = decide(schedule, spec, since, now, !observed.active.is_empty());
        if let Some(scheduled_at) =
            apply_decision(policy, ctx, decision, image, &mut observed).await?
        {
            last_schedule_time = Some(Time(scheduled_at));
        }

        next_schedule_time = schedule.next_after(now);
    }

    let last_backup_failed = match (&last_failed_time, &last_successful_time) {
        (Some(failed), Some(succeeded)) => failed.0 > succeeded.0,
        (Some(_), None) => true,
        (None, _) => false,
    };

    let has_schedule = valid.schedule.is_some();
    let conditions = compute_conditions_at(
        policy,
        &[&BackupPolicyConditionBuilder::new()
            .with_schedule(has_schedule)
            .with_suspended(spec.suspend)
            .with_active_jobs(observed.active.len())
            .with_last_backup_failed(last_backup_failed)],
        now,
    );

    let status = BackupPolicyStatus {
        phase: Some(phase(
            spec.suspend,
            has_schedule,
            observed.active.len(),
            last_backup_failed,
        )),
        conditions,
        active: observed.active,
        last_schedule_time,
        last_successful_time,
        last_failed_time,
        next_schedule_time: next_schedule_time.map(Time),
        observed_generation: policy.metadata.generation,
    };

    client
        .merge_patch_status(policy, &status)
        .await
        .context(ApplyStatusSnafu)?;

    if spec.suspend || !has_schedule {
        return Ok(Action::await_change());
    }

    Ok(Action::requeue(requeue_after(next_schedule_time, now)))
}

/// Writes the validation error into the status. Invalid policies are not retried until they
/// change.
async fn report_invalid(
    policy: &BackupPolicy,
    client: &Client,
    error: &ValidationError,
    now: Timestamp,
) -> Result<Action, Error> {
    tracing::warn!(
        error = error as &dyn std::error::Error,
        "BackupPolicy is invalid"
    );

    let old_status = policy.status.clone().unwrap_or_default();
    let message = error.to_string();
    let conditions = compute_conditions_at(
        policy,
        &[&BackupPolicyConditionBuilder::new()
            .invalid(&message)
            .with_schedule(policy.schedule().is_some())
            .with_suspended(policy.spec.suspend)
            .with_active_jobs(old_status.active.len())],
        now,
    );

    let status = BackupPolicyStatus {
        phase: Some(BackupPolicyPhase::Failed),
        conditions,
        next_schedule_time: None,
        observed_generation: policy.metadata.generation,
        ..old_status
    };

    client
        .merge_patch_status(policy, &status)
        .await
        .context(ApplyStatusSnafu)?;

    Ok(Action::await_change())
}

/// The fire time a [`Decision`] counts as handled. A postponed run stays pending, so
/// `lastScheduleTime` does not move and the run is picked up again once the active jobs are gone.
pub fn handled_fire_time(decision: Decision) -> Option<Timestamp> {
    match decision {
        Decision::Wait | Decision::Postpone { .. } => None,
        Decision::SkipMissedDeadline { scheduled_at, .. } | Decision::Start { scheduled_at, .. } => {
            Some(scheduled_at)
        }
    }
}

/// The active jobs which have to be deleted before the job of `decision` is created.
pub fn jobs_to_replace(decision: Decision, active: &[String]) -> Vec<String> {
    match decision {
        Decision::Start {
            replace_active: true,
            ..
        } => active.to_vec(),
        _ => Vec::new(),
    }
}

/// Acts on a [`Decision`]. Returns the fire time which was handled, [`None`] if the run is still
/// pending.
async fn apply_decision(
    policy: &BackupPolicy,
    ctx: &Ctx,
    decision: Decision,
    image: &str,
    observed: &mut ObservedJobs,
) -> Result<Option<Timestamp>, Error> {
    let reference = policy.object_ref(&());

    match decision {
        Decision::Wait => {}
        Decision::SkipMissedDeadline {
            scheduled_at,
            late_by,
        } => {
            tracing::warn!(
                %scheduled_at,
                %late_by,
                "skipping backup, the starting deadline passed"
            );
            publish_event(
                &ctx.recorder,
                &reference,
                EventType::Warning,
                "MissedSchedule",
                format!(
                    "Skipped backup scheduled at {scheduled_at}, it is {late_by:#} past its starting deadline"
                ),
            )
            .await;
        }
        Decision::Postpone { scheduled_at } => {
            tracing::info!(
                %scheduled_at,
                active = ?observed.active,
                "postponing backup, a previous job is still running"
            );
        }
        Decision::Start { scheduled_at, .. } => {
            for name in jobs_to_replace(decision, &observed.active) {
                tracing::info!(job.name = %name, "replacing active backup job");
                delete_job(&ctx.client, observed, &name).await?;
            }

            let job = job::build_backup_job(policy, scheduled_at, image).context(BuildJobSnafu)?;
            let job_name = job.name_any();

            let created = ctx
                .client
                .create_if_missing(&job)
                .await
                .with_context(|_| CreateJobSnafu {
                    job: ObjectRef::from_obj(&job),
                })?;

            if created {
                tracing::info!(job.name = %job_name, %scheduled_at, "created backup job");
                publish_event(
                    &ctx.recorder,
                    &reference,
                    EventType::Normal,
                    "BackupScheduled",
                    format!("Created backup job {job_name} for {scheduled_at}"),
                )
                .await;
            } else {
                tracing::debug!(job.name = %job_name, "backup job already exists");
            }

            observed.record_started(job_name);
        }
    }

    Ok(handled_fire_time(decision))
}

async fn delete_job(client: &Client, observed: &mut ObservedJobs, name: &str) -> Result<(), Error> {
    if let Some(job) = observed.jobs.get(name) {
        tracing::info!(job.name = name, "deleting backup job");
        client
            .delete(job)
            .await
            .with_context(|_| DeleteJobSnafu {
                job: ObjectRef::from_obj(job),
            })?;
    }

    observed.forget(name);
    Ok(())
}

#[allow(clippy::needless_pass_by_value)]
pub fn error_policy(policy: Arc<BackupPolicy>, error: &Error, ctx: Arc<Ctx>) -> Action {
    let key = format!(
        "{}/{}",
        policy.namespace().unwrap_or_default(),
        policy.name_any()
    );

    let delay = ctx
        .backoff
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .next_delay(&key);

    tracing::debug!(
        error = error as &dyn std::error::Error,
        ?delay,
        "requeueing after failed reconcile"
    );

    Action::requeue(delay)
}

/// Runs the controller until `shutdown` completes.
pub async fn run(
    client: Client,
    config: ControllerConfig,
    watch_namespace: WatchNamespace,
    shutdown: impl Future<Output = ()> + Send + Sync + 'static,
) {
    let recorder = Recorder::new(client.as_kube_client(), Reporter {
        controller: config.operator_name.clone(),
        instance: None,
    });

    let ctx = Arc::new(Ctx {
        client: client.clone(),
        recorder: recorder.clone(),
        config,
        backoff: Mutex::new(BackoffTable::default()),
    });

    tracing::info!(%watch_namespace, "starting {CONTROLLER_NAME} controller");

    Controller::new(
        watch_namespace.get_api::<BackupPolicy>(&client),
        watcher::Config::default(),
    )
    .owns(
        watch_namespace.get_api::<Job>(&client),
        watcher::Config::default().labels(&format!("{K8S_APP_MANAGED_BY_KEY}={MANAGED_BY}")),
    )
    .graceful_shutdown_on(shutdown)
    .run(reconcile, error_policy, ctx)
    .for_each(|result| {
        report_controller_reconciled(&recorder, CONTROLLER_NAME, &result);
        future::ready(())
    })
    .await;
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use k8s_openapi::{
        api::batch::v1::{JobCondition, JobStatus},
        apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference},
    };
    use rstest::rstest;

    use super::*;
    use crate::crd::S3Destination;

    fn ts(input: &str) -> Timestamp {
        input.parse().unwrap()
    }

    fn policy(schedule: Option<&str>) -> BackupPolicy {
        BackupPolicy::new("nightly", BackupPolicySpec {
            schedule: schedule.map(ToOwned::to_owned),
            ..BackupPolicySpec::default()
        })
    }

    fn spec(concurrency_policy: ConcurrencyPolicy, starting_deadline: Option<&str>) -> BackupPolicySpec {
        BackupPolicySpec {
            concurrency_policy,
            starting_deadline: starting_deadline.map(|deadline| deadline.parse().unwrap()),
            ..BackupPolicySpec::default()
        }
    }

    fn hourly() -> CronSchedule {
        CronSchedule::from_str("0 * * * *").unwrap()
    }

    fn job(name: &str, owner_uid: &str, condition: Option<&str>) -> Job {
        Job {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                owner_references: Some(vec![OwnerReference {
                    uid: owner_uid.to_owned(),
                    controller: Some(true),
                    ..OwnerReference::default()
                }]),
                ..ObjectMeta::default()
            },
            status: condition.map(|type_| JobStatus {
                conditions: Some(vec![JobCondition {
                    type_: type_.to_owned(),
                    status: "True".to_owned(),
                    last_transition_time: Some(Time(ts("2024-05-01T10:05:00Z"))),
                    ..JobCondition::default()
                }]),
                ..JobStatus::default()
            }),
            ..Job::default()
        }
    }

    #[test]
    fn valid_policy_without_schedule_needs_no_image() {
        let policy = policy(None);
        let valid = validate(&policy, None).unwrap();
        assert!(valid.schedule.is_none());
    }

    #[test]
    fn scheduled_policy_needs_image() {
        let policy = policy(Some("@daily"));

        assert!(matches!(
            validate(&policy, None),
            Err(ValidationError::NoImage)
        ));
        let (schedule, image) = validate(&policy, Some("restic:0.17"))
            .unwrap()
            .schedule
            .unwrap();
        assert_eq!(schedule.to_string(), "@daily");
        assert_eq!(image, "restic:0.17");
    }

    #[test]
    fn invalid_schedule_is_reported() {
        let policy = policy(Some("every day"));
        let err = validate(&policy, Some("restic")).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidSchedule { .. }));
        assert!(err.to_string().contains("every day"));
    }

    #[test]
    fn empty_bucket_is_invalid() {
        let mut policy = policy(None);
        policy.spec.destination.s3 = Some(S3Destination {
            bucket: " ".to_owned(),
            ..S3Destination::default()
        });

        assert!(matches!(
            validate(&policy, None),
            Err(ValidationError::EmptyBucket)
        ));
    }

    #[test]
    fn nothing_due() {
        let decision = decide(
            &hourly(),
            &BackupPolicySpec::default(),
            ts("2024-05-01T10:00:00Z"),
            ts("2024-05-01T10:30:00Z"),
            false,
        );
        assert_eq!(decision, Decision::Wait);
    }

    #[rstest]
    #[case::forbid_idle(ConcurrencyPolicy::Forbid, false, Decision::Start { scheduled_at: ts("2024-05-01T11:00:00Z"), replace_active: false })]
    #[case::forbid_active(ConcurrencyPolicy::Forbid, true, Decision::Postpone { scheduled_at: ts("2024-05-01T11:00:00Z") })]
    #[case::allow_active(ConcurrencyPolicy::Allow, true, Decision::Start { scheduled_at: ts("2024-05-01T11:00:00Z"), replace_active: false })]
    #[case::replace_active(ConcurrencyPolicy::Replace, true, Decision::Start { scheduled_at: ts("2024-05-01T11:00:00Z"), replace_active: true })]
    #[case::replace_idle(ConcurrencyPolicy::Replace, false, Decision::Start { scheduled_at: ts("2024-05-01T11:00:00Z"), replace_active: false })]
    fn concurrency(
        #[case] concurrency_policy: ConcurrencyPolicy,
        #[case] has_active_jobs: bool,
        #[case] expected: Decision,
    ) {
        let decision = decide(
            &hourly(),
            &spec(concurrency_policy, None),
            ts("2024-05-01T10:00:00Z"),
            ts("2024-05-01T11:00:30Z"),
            has_active_jobs,
        );
        assert_eq!(decision, expected);
    }

    #[test]
    fn missed_starting_deadline_is_skipped() {
        let decision = decide(
            &hourly(),
            &spec(ConcurrencyPolicy::Forbid, Some("5m")),
            ts("2024-05-01T10:00:00Z"),
            ts("2024-05-01T11:10:00Z"),
            false,
        );

        assert_eq!(decision, Decision::SkipMissedDeadline {
            scheduled_at: ts("2024-05-01T11:00:00Z"),
            late_by: SignedDuration::from_mins(10),
        });
    }

    #[test]
    fn run_within_starting_deadline_starts() {
        let decision = decide(
            &hourly(),
            &spec(ConcurrencyPolicy::Forbid, Some("15m")),
            ts("2024-05-01T10:00:00Z"),
            ts("2024-05-01T11:10:00Z"),
            false,
        );

        assert_eq!(decision, Decision::Start {
            scheduled_at: ts("2024-05-01T11:00:00Z"),
            replace_active: false,
        });
    }

    #[test]
    fn only_latest_missed_run_starts() {
        let decision = decide(
            &hourly(),
            &BackupPolicySpec::default(),
            ts("2024-05-01T06:00:00Z"),
            ts("2024-05-01T11:10:00Z"),
            false,
        );

        assert_eq!(decision, Decision::Start {
            scheduled_at: ts("2024-05-01T11:00:00Z"),
            replace_active: false,
        });
    }

    #[rstest]
    #[case::no_schedule(None, "2024-05-01T10:00:00Z", 300)]
    #[case::soon(Some("2024-05-01T10:00:30Z"), "2024-05-01T10:00:00Z", 30)]
    #[case::far_away(Some("2024-05-02T10:00:00Z"), "2024-05-01T10:00:00Z", 300)]
    #[case::already_passed(Some("2024-05-01T09:59:00Z"), "2024-05-01T10:00:00Z", 1)]
    fn requeue(#[case] next: Option<&str>, #[case] now: &str, #[case] expected_secs: u64) {
        assert_eq!(
            requeue_after(next.map(ts), ts(now)),
            Duration::from_secs(expected_secs)
        );
    }

    #[rstest]
    #[case::suspended(true, true, 1, true, BackupPolicyPhase::Suspended)]
    #[case::idle(false, false, 0, false, BackupPolicyPhase::Idle)]
    #[case::running(false, true, 2, true, BackupPolicyPhase::Running)]
    #[case::failed(false, true, 0, true, BackupPolicyPhase::Failed)]
    #[case::scheduled(false, true, 0, false, BackupPolicyPhase::Scheduled)]
    fn phases(
        #[case] suspended: bool,
        #[case] has_schedule: bool,
        #[case] active_jobs: usize,
        #[case] last_backup_failed: bool,
        #[case] expected: BackupPolicyPhase,
    ) {
        assert_eq!(
            phase(suspended, has_schedule, active_jobs, last_backup_failed),
            expected
        );
    }

    #[test]
    fn observes_owned_jobs_only() {
        let now = ts("2024-05-01T12:00:00Z");
        let observed = ObservedJobs::new(
            vec![
                job("b-running", "uid-1", None),
                job("a-done", "uid-1", Some("Complete")),
                job("c-failed", "uid-1", Some("Failed")),
                job("foreign", "uid-2", None),
            ],
            Some("uid-1"),
            now,
        );

        assert_eq!(observed.active, ["b-running"]);
        assert_eq!(observed.jobs.len(), 3);
        assert_eq!(observed.finished.len(), 2);
        assert_eq!(
            observed.last_finished(JobOutcome::Succeeded),
            Some(ts("2024-05-01T10:05:00Z"))
        );
        assert_eq!(
            observed.last_finished(JobOutcome::Failed),
            Some(ts("2024-05-01T10:05:00Z"))
        );
    }

    #[test]
    fn remembers_newest_fire_time_of_jobs() {
        let mut older = job("a", "uid", Some("Complete"));
        older.metadata.annotations = Some(BTreeMap::from([(
            job::SCHEDULED_AT_ANNOTATION_KEY.to_owned(),
            "2024-05-01T09:00:00Z".to_owned(),
        )]));
        let mut newer = job("b", "uid", None);
        newer.metadata.annotations = Some(BTreeMap::from([(
            job::SCHEDULED_AT_ANNOTATION_KEY.to_owned(),
            "2024-05-01T10:00:00Z".to_owned(),
        )]));

        let observed = ObservedJobs::new(
            vec![older, newer, job("unannotated", "uid", None)],
            Some("uid"),
            ts("2024-05-01T12:00:00Z"),
        );

        assert_eq!(observed.last_scheduled, Some(ts("2024-05-01T10:00:00Z")));
    }

    #[rstest]
    #[case::wait(Decision::Wait, None)]
    #[case::postponed_run_stays_pending(
        Decision::Postpone { scheduled_at: ts("2024-05-01T11:00:00Z") },
        None
    )]
    #[case::skipped_run_is_handled(
        Decision::SkipMissedDeadline {
            scheduled_at: ts("2024-05-01T11:00:00Z"),
            late_by: SignedDuration::from_mins(70),
        },
        Some(ts("2024-05-01T11:00:00Z"))
    )]
    #[case::started_run_is_handled(
        Decision::Start { scheduled_at: ts("2024-05-01T11:00:00Z"), replace_active: true },
        Some(ts("2024-05-01T11:00:00Z"))
    )]
    fn handled_fire_times(#[case] decision: Decision, #[case] expected: Option<Timestamp>) {
        assert_eq!(handled_fire_time(decision), expected);
    }

    #[rstest]
    #[case::replace(true, vec!["nightly-1", "nightly-2"])]
    #[case::allow(false, vec![])]
    fn replaced_jobs(#[case] replace_active: bool, #[case] expected: Vec<&str>) {
        let active = vec!["nightly-1".to_owned(), "nightly-2".to_owned()];
        let decision = Decision::Start {
            scheduled_at: ts("2024-05-01T11:00:00Z"),
            replace_active,
        };

        assert_eq!(jobs_to_replace(decision, &active), expected);
    }

    #[test]
    fn postponed_run_replaces_nothing() {
        let active = vec!["nightly-1".to_owned()];
        let decision = Decision::Postpone {
            scheduled_at: ts("2024-05-01T11:00:00Z"),
        };

        assert!(jobs_to_replace(decision, &active).is_empty());
    }

    #[test]
    fn replacing_leaves_only_the_new_job_active() {
        let mut observed = ObservedJobs::new(
            vec![job("nightly-1", "uid", None), job("nightly-2", "uid", None)],
            Some("uid"),
            ts("2024-05-01T12:00:00Z"),
        );
        let decision = Decision::Start {
            scheduled_at: ts("2024-05-01T11:00:00Z"),
            replace_active: true,
        };

        for name in jobs_to_replace(decision, &observed.active) {
            observed.forget(&name);
        }
        observed.record_started("nightly-28575960".to_owned());
        observed.record_started("nightly-28575960".to_owned());

        assert_eq!(observed.active, ["nightly-28575960"]);
        assert!(observed.jobs.is_empty());
    }

    #[test]
    fn forgetting_a_job_removes_it_everywhere() {
        let mut observed = ObservedJobs::new(
            vec![job("a", "uid", None), job("b", "uid", Some("Complete"))],
            Some("uid"),
            ts("2024-05-01T12:00:00Z"),
        );

        observed.forget("a");
        observed.forget("b");

        assert!(observed.jobs.is_empty());
        assert!(observed.active.is_empty());
        assert!(observed.finished.is_empty());
    }

    #[test]
    fn newest_time_wins() {
        let stored = Time(ts("2024-05-01T10:00:00Z"));

        assert_eq!(
            newest(Some(&stored), Some(ts("2024-05-01T11:00:00Z"))),
            Some(Time(ts("2024-05-01T11:00:00Z")))
        );
        assert_eq!(
            newest(Some(&stored), Some(ts("2024-05-01T09:00:00Z"))),
            Some(stored.clone())
        );
        assert_eq!(newest(None, None), None);
    }

    #[test]
    fn error_categories() {
        assert_eq!(Error::ObjectHasNoNamespace.category(), "ObjectHasNoNamespace");
        assert!(Error::ObjectHasNoNamespace.secondary_object().is_none());
    }
}
