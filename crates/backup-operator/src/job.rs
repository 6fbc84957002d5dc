//! Builds the `Job`s performing a backup and reads their state back.

use std::collections::BTreeMap;

use jiff::Timestamp;
use k8s_openapi::{
    api::{
        batch::v1::{Job, JobSpec},
        core::v1::{
            Container, EnvVar, EnvVarSource, PersistentVolumeClaimVolumeSource, PodSpec,
            PodTemplateSpec, SecretKeySelector, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::{Resource, ResourceExt};
use snafu::{OptionExt, Snafu};

use crate::crd::BackupPolicy;

/// The well-known Kubernetes app name key `app.kubernetes.io/name`.
pub const K8S_APP_NAME_KEY: &str = "app.kubernetes.io/name";

/// The well-known Kubernetes app managed-by key `app.kubernetes.io/managed-by`.
pub const K8S_APP_MANAGED_BY_KEY: &str = "app.kubernetes.io/managed-by";

/// Label pointing from a backup job to the [`BackupPolicy`] it was created for.
pub const POLICY_LABEL_KEY: &str = "backup.operator.dev/policy";

/// Annotation holding the fire time a backup job was created for, in RFC 3339 format.
pub const SCHEDULED_AT_ANNOTATION_KEY: &str = "backup.operator.dev/scheduled-at";

pub const APP_NAME: &str = "backup";
pub const MANAGED_BY: &str = "backup-operator";

pub const CONTAINER_NAME: &str = "backup";
pub const SOURCE_VOLUME_NAME: &str = "source";
pub const SOURCE_MOUNT_PATH: &str = "/backup/source";

/// Maximum length of a job name, so that the name can be used as a label value.
pub const MAX_JOB_NAME_LENGTH: usize = 63;

/// Maximum length of a label value.
const MAX_LABEL_VALUE_LENGTH: usize = 63;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display("backup policy has no namespace"))]
    MissingNamespace,

    #[snafu(display("failed to create owner reference, the backup policy has no uid"))]
    MissingOwnerReference,
}

/// The state of a backup job, as read from its status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Active,
    Succeeded { finished_at: Option<Timestamp> },
    Failed { finished_at: Option<Timestamp> },
}

/// The name of the job started for `policy_name` at `scheduled`.
///
/// Names are deterministic, so a run which was already created is not started twice.
pub fn job_name(policy_name: &str, scheduled: Timestamp) -> String {
    let suffix = format!("-{}", scheduled.as_second().div_euclid(60));
    let prefix = truncate(policy_name, MAX_JOB_NAME_LENGTH - suffix.len());

    // A truncated name must not end in a dash
    format!("{}{suffix}", prefix.trim_end_matches(['-', '.']))
}

/// The labels every backup job of `policy_name` carries.
pub fn job_labels(policy_name: &str) -> BTreeMap<String, String> {
    [
        (K8S_APP_NAME_KEY, APP_NAME),
        (K8S_APP_MANAGED_BY_KEY, MANAGED_BY),
        (
            POLICY_LABEL_KEY,
            truncate(policy_name, MAX_LABEL_VALUE_LENGTH).trim_end_matches(['-', '.']),
        ),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_owned(), value.to_owned()))
    .collect()
}

/// A label selector matching all backup jobs of `policy_name`.
pub fn job_label_selector(policy_name: &str) -> String {
    job_labels(policy_name)
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Builds the job running the backup of `policy` scheduled at `scheduled`.
///
/// The policy must have been validated before, `image` is the resolved container image.
pub fn build_backup_job(
    policy: &BackupPolicy,
    scheduled: Timestamp,
    image: &str,
) -> Result<Job, Error> {
    let policy_name = policy.name_any();
    let namespace = policy.namespace().context(MissingNamespaceSnafu)?;
    let owner_reference = policy
        .controller_owner_ref(&())
        .context(MissingOwnerReferenceSnafu)?;

    let spec = &policy.spec;
    let scheduled_at = scheduled.to_string();

    let mut env = vec![
        env_var("BACKUP_POLICY_NAME", &policy_name),
        env_var("BACKUP_POLICY_NAMESPACE", &namespace),
        env_var("BACKUP_SCHEDULED_TIME", &scheduled_at),
        env_var("BACKUP_PATHS", &spec.target.paths.join(",")),
    ];

    if let Some(s3) = &spec.destination.s3 {
        env.push(env_var("BACKUP_S3_BUCKET", &s3.bucket));
        env.extend(
            [
                ("BACKUP_S3_ENDPOINT", &s3.endpoint),
                ("BACKUP_S3_REGION", &s3.region),
                ("BACKUP_S3_PREFIX", &s3.prefix),
            ]
            .into_iter()
            .filter_map(|(name, value)| value.as_deref().map(|value| env_var(name, value))),
        );

        if let Some(secret) = &s3.credentials_secret {
            env.push(secret_env_var("AWS_ACCESS_KEY_ID", secret, "accessKey"));
            env.push(secret_env_var("AWS_SECRET_ACCESS_KEY", secret, "secretKey"));
        }
    }

    let (volumes, volume_mounts) = match &spec.target.persistent_volume_claim {
        Some(claim_name) => (
            Some(vec![Volume {
                name: SOURCE_VOLUME_NAME.to_owned(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim_name.clone(),
                    read_only: Some(true),
                }),
                ..Volume::default()
            }]),
            Some(vec![VolumeMount {
                name: SOURCE_VOLUME_NAME.to_owned(),
                mount_path: SOURCE_MOUNT_PATH.to_owned(),
                read_only: Some(true),
                ..VolumeMount::default()
            }]),
        ),
        None => (None, None),
    };

    let container = Container {
        name: CONTAINER_NAME.to_owned(),
        image: Some(image.to_owned()),
        command: non_empty(&spec.job.command),
        args: non_empty(&spec.job.args),
        env: Some(env),
        volume_mounts,
        ..Container::default()
    };

    let labels = job_labels(&policy_name);

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(job_name(&policy_name, scheduled)),
            namespace: Some(namespace),
            labels: Some(labels.clone()),
            annotations: Some(BTreeMap::from([(
                SCHEDULED_AT_ANNOTATION_KEY.to_owned(),
                scheduled_at,
            )])),
            owner_references: Some(vec![owner_reference]),
            ..ObjectMeta::default()
        },
        spec: Some(JobSpec {
            backoff_limit: spec.job.backoff_limit,
            active_deadline_seconds: spec
                .job
                .active_deadline
                .map(|deadline| i64::try_from(deadline.as_secs()).unwrap_or(i64::MAX)),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    restart_policy: Some("Never".to_owned()),
                    volumes,
                    ..PodSpec::default()
                }),
            },
            ..JobSpec::default()
        }),
        ..Job::default()
    })
}

/// Reads the state of a job from its `Complete` and `Failed` conditions.
///
/// The finish time is the completion time of the job, or the transition time of the condition if
/// the job has none (failed jobs never have a completion time).
pub fn classify(job: &Job) -> JobState {
    let Some(status) = &job.status else {
        return JobState::Active;
    };

    let finished_condition = status
        .conditions
        .iter()
        .flatten()
        .filter(|condition| condition.status == "True")
        .find(|condition| condition.type_ == "Complete" || condition.type_ == "Failed");

    let Some(condition) = finished_condition else {
        return JobState::Active;
    };

    let finished_at = status
        .completion_time
        .as_ref()
        .or(condition.last_transition_time.as_ref())
        .map(|time| time.0);

    if condition.type_ == "Complete" {
        JobState::Succeeded { finished_at }
    } else {
        JobState::Failed { finished_at }
    }
}

/// The fire time stored on a job, if present and parseable.
pub fn scheduled_at(job: &Job) -> Option<Timestamp> {
    job.annotations()
        .get(SCHEDULED_AT_ANNOTATION_KEY)
        .and_then(|value| value.parse().ok())
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_owned(),
        value: Some(value.to_owned()),
        ..EnvVar::default()
    }
}

fn secret_env_var(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_owned(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_owned(),
                key: key.to_owned(),
                ..SecretKeySelector::default()
            }),
            ..EnvVarSource::default()
        }),
        ..EnvVar::default()
    }
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    (!values.is_empty()).then(|| values.to_vec())
}

/// Truncates `value` to at most `max` bytes on a character boundary.
fn truncate(value: &str, max: usize) -> &str {
    if value.len() <= max {
        return value;
    }

    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }

    &value[..end]
}

#[cfg(test)]
mod tests {
    use k8s_openapi::{
        api::batch::v1::{JobCondition, JobStatus},
        apimachinery::pkg::apis::meta::v1::Time,
    };

    use super::*;
    use crate::crd::{BackupPolicySpec, S3Destination};

    fn ts(input: &str) -> Timestamp {
        input.parse().unwrap()
    }

    fn policy(name: &str) -> BackupPolicy {
        let mut policy = BackupPolicy::new(name, BackupPolicySpec::default());
        policy.metadata.namespace = Some("default".to_owned());
        policy.metadata.uid = Some("0b1e3e4b-6e0f-4b4f-8d3a-5f2d4e0c7a11".to_owned());
        policy
    }

    fn env_value<'a>(job: &'a Job, name: &str) -> Option<&'a EnvVar> {
        job.spec.as_ref()?.template.spec.as_ref()?.containers[0]
            .env
            .as_ref()?
            .iter()
            .find(|env| env.name == name)
    }

    fn job_with_condition(type_: &str, status: &str) -> Job {
        Job {
            status: Some(JobStatus {
                conditions: Some(vec![JobCondition {
                    type_: type_.to_owned(),
                    status: status.to_owned(),
                    last_transition_time: Some(Time(ts("2024-05-01T10:05:00Z"))),
                    ..JobCondition::default()
                }]),
                ..JobStatus::default()
            }),
            ..Job::default()
        }
    }

    #[test]
    fn job_name_is_deterministic() {
        let scheduled = ts("2024-05-01T10:00:00Z");
        assert_eq!(job_name("nightly", scheduled), "nightly-28575960");
        assert_eq!(job_name("nightly", scheduled), job_name("nightly", scheduled));
        assert_ne!(
            job_name("nightly", scheduled),
            job_name("nightly", ts("2024-05-01T10:01:00Z"))
        );
    }

    #[test]
    fn long_job_name_is_truncated() {
        let policy_name = "a".repeat(100);
        let name = job_name(&policy_name, ts("2024-05-01T10:00:00Z"));

        assert_eq!(name.len(), MAX_JOB_NAME_LENGTH);
        assert!(name.ends_with("-28575960"));
    }

    #[test]
    fn truncated_job_name_does_not_end_in_dash() {
        let policy_name = format!("{}-{}", "a".repeat(53), "b".repeat(20));
        let name = job_name(&policy_name, ts("2024-05-01T10:00:00Z"));

        assert_eq!(name, format!("{}-28575960", "a".repeat(53)));
    }

    #[test]
    fn builds_minimal_job() {
        let policy = policy("nightly");
        let job = build_backup_job(&policy, ts("2024-05-01T10:00:00Z"), "restic:0.17").unwrap();

        assert_eq!(job.metadata.name.as_deref(), Some("nightly-28575960"));
        assert_eq!(job.metadata.namespace.as_deref(), Some("default"));

        let labels = job.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[K8S_APP_MANAGED_BY_KEY], "backup-operator");
        assert_eq!(labels[K8S_APP_NAME_KEY], "backup");
        assert_eq!(labels[POLICY_LABEL_KEY], "nightly");
        assert_eq!(
            job.metadata.annotations.as_ref().unwrap()[SCHEDULED_AT_ANNOTATION_KEY],
            "2024-05-01T10:00:00Z"
        );

        let owner = &job.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "BackupPolicy");
        assert_eq!(owner.name, "nightly");
        assert_eq!(owner.controller, Some(true));

        let job_spec = job.spec.as_ref().unwrap();
        let pod_spec = job_spec.template.spec.as_ref().unwrap();
        assert_eq!(pod_spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod_spec.containers.len(), 1);
        assert_eq!(pod_spec.containers[0].name, "backup");
        assert_eq!(pod_spec.containers[0].image.as_deref(), Some("restic:0.17"));
        assert_eq!(pod_spec.containers[0].command, None);
        assert_eq!(pod_spec.volumes, None);

        assert_eq!(
            env_value(&job, "BACKUP_PATHS").and_then(|e| e.value.as_deref()),
            Some("")
        );
        assert!(env_value(&job, "BACKUP_S3_BUCKET").is_none());
    }

    #[test]
    fn builds_full_job() {
        let mut policy = policy("nightly");
        policy.spec.target.persistent_volume_claim = Some("data".to_owned());
        policy.spec.target.paths = vec!["/var/lib/db".to_owned(), "/etc/db".to_owned()];
        policy.spec.destination.s3 = Some(S3Destination {
            bucket: "backups".to_owned(),
            region: Some("eu-central-1".to_owned()),
            credentials_secret: Some("s3-creds".to_owned()),
            ..S3Destination::default()
        });
        policy.spec.job.args = vec!["backup".to_owned()];
        policy.spec.job.backoff_limit = Some(2);
        policy.spec.job.active_deadline = Some("1h".parse().unwrap());

        let job = build_backup_job(&policy, ts("2024-05-01T10:00:00Z"), "restic:0.17").unwrap();

        let value = |name| env_value(&job, name).and_then(|e| e.value.as_deref());
        assert_eq!(value("BACKUP_POLICY_NAME"), Some("nightly"));
        assert_eq!(value("BACKUP_POLICY_NAMESPACE"), Some("default"));
        assert_eq!(value("BACKUP_SCHEDULED_TIME"), Some("2024-05-01T10:00:00Z"));
        assert_eq!(value("BACKUP_PATHS"), Some("/var/lib/db,/etc/db"));
        assert_eq!(value("BACKUP_S3_BUCKET"), Some("backups"));
        assert_eq!(value("BACKUP_S3_REGION"), Some("eu-central-1"));
        assert!(env_value(&job, "BACKUP_S3_ENDPOINT").is_none());

        let secret_ref = env_value(&job, "AWS_SECRET_ACCESS_KEY")
            .and_then(|e| e.value_from.as_ref())
            .and_then(|source| source.secret_key_ref.as_ref())
            .unwrap();
        assert_eq!(secret_ref.name, "s3-creds");
        assert_eq!(secret_ref.key, "secretKey");

        let job_spec = job.spec.as_ref().unwrap();
        assert_eq!(job_spec.backoff_limit, Some(2));
        assert_eq!(job_spec.active_deadline_seconds, Some(3600));

        let pod_spec = job_spec.template.spec.as_ref().unwrap();
        let volume = &pod_spec.volumes.as_ref().unwrap()[0];
        let claim = volume.persistent_volume_claim.as_ref().unwrap();
        assert_eq!(claim.claim_name, "data");
        assert_eq!(claim.read_only, Some(true));

        let mount = &pod_spec.containers[0].volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.mount_path, "/backup/source");
        assert_eq!(mount.read_only, Some(true));
        assert_eq!(
            pod_spec.containers[0].args.as_deref(),
            Some(&["backup".to_owned()][..])
        );
    }

    #[test]
    fn missing_uid_is_an_error() {
        let mut policy = policy("nightly");
        policy.metadata.uid = None;

        let err = build_backup_job(&policy, ts("2024-05-01T10:00:00Z"), "restic").unwrap_err();
        assert_eq!(err, Error::MissingOwnerReference);
    }

    #[test]
    fn label_selector_matches_labels() {
        assert_eq!(
            job_label_selector("nightly"),
            "app.kubernetes.io/managed-by=backup-operator,app.kubernetes.io/name=backup,backup.operator.dev/policy=nightly"
        );
    }

    #[test]
    fn classifies_jobs() {
        assert_eq!(classify(&Job::default()), JobState::Active);
        assert_eq!(
            classify(&job_with_condition("Complete", "False")),
            JobState::Active
        );
        assert_eq!(
            classify(&job_with_condition("Complete", "True")),
            JobState::Succeeded {
                finished_at: Some(ts("2024-05-01T10:05:00Z"))
            }
        );
        assert_eq!(
            classify(&job_with_condition("Failed", "True")),
            JobState::Failed {
                finished_at: Some(ts("2024-05-01T10:05:00Z"))
            }
        );
    }

    #[test]
    fn completion_time_wins_over_condition() {
        let mut job = job_with_condition("Complete", "True");
        if let Some(status) = job.status.as_mut() {
            status.completion_time = Some(Time(ts("2024-05-01T10:04:00Z")));
        }

        assert_eq!(classify(&job), JobState::Succeeded {
            finished_at: Some(ts("2024-05-01T10:04:00Z"))
        });
    }

    #[test]
    fn reads_scheduled_at() {
        let job = build_backup_job(&policy("p"), ts("2024-05-01T10:00:00Z"), "restic").unwrap();
        assert_eq!(scheduled_at(&job), Some(ts("2024-05-01T10:00:00Z")));
    }
}
