use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{CustomResource, core::ObjectList};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    status::condition::{ClusterCondition, HasStatusCondition},
    time::Duration,
};

/// A policy describing how and when a backup job is run.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "backup.operator.dev",
    version = "v1alpha1",
    kind = "BackupPolicy",
    plural = "backuppolicies",
    shortname = "bp",
    status = "BackupPolicyStatus",
    namespaced,
    printcolumn = r#"{"name":"Schedule","type":"string","jsonPath":".spec.schedule"}"#,
    printcolumn = r#"{"name":"Suspended","type":"boolean","jsonPath":".spec.suspend"}"#,
    printcolumn = r#"{"name":"Last Success","type":"date","jsonPath":".status.lastSuccessfulTime"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    crates(
        kube_core = "kube::core",
        k8s_openapi = "k8s_openapi",
        schemars = "schemars",
        serde = "serde",
        serde_json = "serde_json"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct BackupPolicySpec {
    /// Example field without any behavior attached. It is stored and returned unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foo: Option<String>,

    /// The cron expression backups are scheduled by, either five fields or one of `@hourly`,
    /// `@daily`, `@weekly`, `@monthly` and `@yearly`. Day-of-week uses 0 or 7 for Sunday.
    /// Without a schedule no backup is ever started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    /// Stop creating new backup jobs. Jobs that are already running are left alone.
    #[serde(default)]
    pub suspend: bool,

    /// What to do when a backup is due while the previous one is still running.
    #[serde(default)]
    pub concurrency_policy: ConcurrencyPolicy,

    /// Runs which are more than this late are skipped instead of started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_deadline: Option<Duration>,

    /// What to back up.
    #[serde(default)]
    pub target: BackupTarget,

    /// Where the backup is written to.
    #[serde(default)]
    pub destination: BackupDestination,

    /// Settings of the job performing the backup.
    #[serde(default)]
    pub job: BackupJobTemplate,

    /// How many finished backup jobs are kept around.
    #[serde(default)]
    pub retention: RetentionPolicy,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize, strum::Display,
)]
pub enum ConcurrencyPolicy {
    /// Start the new job next to the running ones.
    Allow,

    /// Skip the run as long as a previous job is active.
    #[default]
    Forbid,

    /// Delete the running jobs and start the new one.
    Replace,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupTarget {
    /// Name of a PersistentVolumeClaim, mounted read-only at `/backup/source`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<String>,

    /// Paths the backup job should include, handed over as `BACKUP_PATHS`.
    #[serde(default)]
    pub paths: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupDestination {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Destination>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Destination {
    pub bucket: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Key prefix inside the bucket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Name of a Secret containing the keys `accessKey` and `secretKey`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupJobTemplate {
    /// Container image running the backup. Defaults to the operator's `--default-backup-image`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default)]
    pub args: Vec<String>,

    /// Number of retries before the job is considered failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,

    /// Maximum time a single job may run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline: Option<Duration>,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    /// Number of successful jobs to keep.
    #[serde(default = "RetentionPolicy::default_successful_jobs_history_limit")]
    pub successful_jobs_history_limit: u32,

    /// Number of failed jobs to keep.
    #[serde(default = "RetentionPolicy::default_failed_jobs_history_limit")]
    pub failed_jobs_history_limit: u32,

    /// Finished jobs older than this are deleted regardless of the limits above.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<Duration>,
}

impl RetentionPolicy {
    const fn default_successful_jobs_history_limit() -> u32 {
        3
    }

    const fn default_failed_jobs_history_limit() -> u32 {
        1
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            successful_jobs_history_limit: Self::default_successful_jobs_history_limit(),
            failed_jobs_history_limit: Self::default_failed_jobs_history_limit(),
            max_age: None,
        }
    }
}

/// Observed state of a [`BackupPolicy`].
///
/// Optional fields are serialized as `null` so that a merge patch of the whole status clears them.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupPolicyStatus {
    #[serde(default)]
    pub phase: Option<BackupPolicyPhase>,

    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,

    /// Names of the backup jobs which are currently running.
    #[serde(default)]
    pub active: Vec<String>,

    /// Scheduled time of the last run that was started or skipped.
    #[serde(default)]
    pub last_schedule_time: Option<Time>,

    #[serde(default)]
    pub last_successful_time: Option<Time>,

    #[serde(default)]
    pub last_failed_time: Option<Time>,

    #[serde(default)]
    pub next_schedule_time: Option<Time>,

    #[serde(default)]
    pub observed_generation: Option<i64>,
}

impl HasStatusCondition for BackupPolicy {
    fn conditions(&self) -> Vec<ClusterCondition> {
        self.status
            .as_ref()
            .map(|status| status.conditions.clone())
            .unwrap_or_default()
    }
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize, strum::Display,
)]
pub enum BackupPolicyPhase {
    /// No schedule is set.
    Idle,

    /// Waiting for the next fire time.
    Scheduled,

    /// At least one backup job is running.
    Running,

    Suspended,

    /// The spec is invalid or the last backup failed.
    Failed,
}

/// A list of [`BackupPolicy`] objects as returned by the API server.
pub type BackupPolicyList = ObjectList<BackupPolicy>;

impl BackupPolicy {
    /// The cron expression of this policy, [`None`] if unset or blank.
    pub fn schedule(&self) -> Option<&str> {
        self.spec
            .schedule
            .as_deref()
            .map(str::trim)
            .filter(|schedule| !schedule.is_empty())
    }

    /// The image the backup job runs, falling back to `default_image`.
    pub fn image<'a>(&'a self, default_image: Option<&'a str>) -> Option<&'a str> {
        self.spec
            .job
            .image
            .as_deref()
            .filter(|image| !image.is_empty())
            .or(default_image)
    }
}
