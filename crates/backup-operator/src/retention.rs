//! Selects finished backup jobs that are no longer kept by a [`RetentionPolicy`].

use std::collections::BTreeSet;

use jiff::{SignedDuration, Timestamp};

use crate::crd::RetentionPolicy;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed,
}

/// A backup job which ran to completion, successfully or not.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinishedJob {
    pub name: String,
    pub finished_at: Timestamp,
    pub outcome: JobOutcome,
}

/// Returns the names of the jobs to delete, sorted by name.
///
/// The newest `successfulJobsHistoryLimit` successful and `failedJobsHistoryLimit` failed jobs are
/// kept, unless they finished longer than `maxAge` ago. Jobs finished at the same time are ordered
/// by name.
pub fn jobs_to_delete(
    finished: &[FinishedJob],
    retention: &RetentionPolicy,
    now: Timestamp,
) -> Vec<String> {
    let mut to_delete = BTreeSet::new();

    for (outcome, limit) in [
        (JobOutcome::Succeeded, retention.successful_jobs_history_limit),
        (JobOutcome::Failed, retention.failed_jobs_history_limit),
    ] {
        let mut jobs: Vec<&FinishedJob> = finished
            .iter()
            .filter(|job| job.outcome == outcome)
            .collect();

        // Newest first
        jobs.sort_by(|a, b| {
            b.finished_at
                .cmp(&a.finished_at)
                .then_with(|| b.name.cmp(&a.name))
        });

        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        to_delete.extend(jobs.into_iter().skip(limit).map(|job| job.name.as_str()));
    }

    if let Some(cutoff) = retention.max_age.and_then(|max_age| {
        let max_age = SignedDuration::try_from(max_age).ok()?;
        now.checked_sub(max_age).ok()
    }) {
        to_delete.extend(
            finished
                .iter()
                .filter(|job| job.finished_at < cutoff)
                .map(|job| job.name.as_str()),
        );
    }

    to_delete.into_iter().map(ToOwned::to_owned).collect()
}
