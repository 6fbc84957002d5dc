//! A Kubernetes operator which runs backup jobs on a schedule.
//!
//! Backups are described by [`BackupPolicy`](crd::BackupPolicy) objects. The
//! [`controller`] creates a `Job` for every fire time of a policy's cron schedule, prunes old
//! jobs according to its retention settings and reports progress in the policy's status.

pub mod cli;
pub mod client;
pub mod controller;
pub mod crd;
pub mod job;
pub mod logging;
pub mod namespace;
pub mod retention;
pub mod schedule;
pub mod status;
pub mod time;
pub mod utils;
pub mod yaml;

// External re-exports
pub use k8s_openapi;
pub use kube;
pub use schemars;

pub use crate::{crd::CustomResourceExt, yaml::YamlSchema};

/// Name of the operator, used as field manager and event reporter.
pub const OPERATOR_NAME: &str = "backup-operator";
