use crate::status::condition::{
    ClusterCondition, ClusterConditionSet, ClusterConditionStatus, ClusterConditionType,
    ConditionBuilder,
};

/// Builds the [`ClusterCondition`]s of a `BackupPolicy` from the outcome of a reconciliation.
#[derive(Debug, Clone, Default)]
pub struct BackupPolicyConditionBuilder<'a> {
    validation_error: Option<&'a str>,
    has_schedule: bool,
    suspended: bool,
    active_jobs: usize,
    last_backup_failed: bool,
}

impl ConditionBuilder for BackupPolicyConditionBuilder<'_> {
    fn build_conditions(&self) -> ClusterConditionSet {
        vec![
            self.ready(),
            self.running(),
            self.degraded(),
            self.suspended(),
        ]
        .into()
    }
}

impl<'a> BackupPolicyConditionBuilder<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the policy as invalid. The message ends up in the `Ready` condition.
    pub fn invalid(mut self, message: &'a str) -> Self {
        self.validation_error = Some(message);
        self
    }

    pub fn with_schedule(mut self, has_schedule: bool) -> Self {
        self.has_schedule = has_schedule;
        self
    }

    pub fn with_suspended(mut self, suspended: bool) -> Self {
        self.suspended = suspended;
        self
    }

    pub fn with_active_jobs(mut self, active_jobs: usize) -> Self {
        self.active_jobs = active_jobs;
        self
    }

    /// Whether the newest finished backup job failed.
    pub fn with_last_backup_failed(mut self, failed: bool) -> Self {
        self.last_backup_failed = failed;
        self
    }

    fn ready(&self) -> ClusterCondition {
        let (status, reason, message) = match self.validation_error {
            Some(error) => (
                ClusterConditionStatus::False,
                "InvalidSpec",
                format!("The backup policy is invalid: {error}"),
            ),
            None if !self.has_schedule => (
                ClusterConditionStatus::True,
                "NoSchedule",
                "No schedule is set, backups are never started.".to_owned(),
            ),
            None => (
                ClusterConditionStatus::True,
                "Scheduled",
                "Backups are scheduled as configured.".to_owned(),
            ),
        };

        condition(ClusterConditionType::Ready, status, reason, message)
    }

    fn running(&self) -> ClusterCondition {
        if self.active_jobs > 0 {
            condition(
                ClusterConditionType::Running,
                ClusterConditionStatus::True,
                "JobsActive",
                format!("{} backup job(s) running.", self.active_jobs),
            )
        } else {
            condition(
                ClusterConditionType::Running,
                ClusterConditionStatus::False,
                "NoJobsActive",
                "No backup job is running.".to_owned(),
            )
        }
    }

    fn degraded(&self) -> ClusterCondition {
        if self.last_backup_failed {
            condition(
                ClusterConditionType::Degraded,
                ClusterConditionStatus::True,
                "BackupFailed",
                "The most recent backup job failed.".to_owned(),
            )
        } else {
            condition(
                ClusterConditionType::Degraded,
                ClusterConditionStatus::False,
                "BackupHealthy",
                "The most recent backup job did not fail.".to_owned(),
            )
        }
    }

    fn suspended(&self) -> ClusterCondition {
        let status = if self.suspended {
            ClusterConditionStatus::True
        } else {
            ClusterConditionStatus::False
        };

        let message = match status {
            ClusterConditionStatus::True => "The policy is suspended, no new backups are started.",
            ClusterConditionStatus::False | ClusterConditionStatus::Unknown => {
                "The policy is not suspended."
            }
        };

        condition(
            ClusterConditionType::Suspended,
            status,
            if self.suspended { "Suspended" } else { "Active" },
            message.to_owned(),
        )
    }
}

fn condition(
    type_: ClusterConditionType,
    status: ClusterConditionStatus,
    reason: &str,
    message: String,
) -> ClusterCondition {
    ClusterCondition {
        reason: Some(reason.to_owned()),
        message: Some(message),
        status,
        type_,
        last_transition_time: None,
        last_update_time: None,
    }
}
