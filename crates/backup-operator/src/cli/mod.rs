//! Command line interface of the backup operator, built with `clap`.
//!
//! ```no_run
//! use backup_operator::cli::Command;
//! use clap::Parser;
//!
//! #[derive(Parser)]
//! struct Opts {
//!     #[clap(subcommand)]
//!     command: Command,
//! }
//!
//! let opts = Opts::parse();
//!
//! match opts.command {
//!     Command::Crd => {
//!         // Print the CRD
//!     }
//!     Command::Run(run) => {
//!         // Run the operator in `run.watch_namespace`
//!     }
//! }
//! ```
use backup_telemetry::TelemetryOptions;
use clap::{Args, Parser};

use crate::namespace::WatchNamespace;

mod maintenance;

pub use maintenance::*;

/// The commands of the operator.
///
/// This enum is generic over the arguments available to the [`Command::Run`] subcommand. By
/// default, [`RunArguments`] is used.
#[derive(Debug, PartialEq, Eq, Parser)]
pub enum Command<Run: Args = RunArguments> {
    /// Print the BackupPolicy CRD.
    Crd,

    /// Run the operator.
    Run(Run),
}

/// Arguments of the `run` command.
#[derive(Debug, PartialEq, Eq, Parser)]
#[command(long_about = "")]
pub struct RunArguments {
    /// Provides a specific namespace to watch (instead of watching all namespaces)
    #[arg(long, env, default_value = "")]
    pub watch_namespace: WatchNamespace,

    /// Container IMAGE running backups of policies which do not set `spec.job.image`.
    #[arg(long, env, value_name = "IMAGE")]
    pub default_backup_image: Option<String>,

    // IMPORTANT: All (flattened) sub structs should be placed at the end to ensure the help
    // headings are correct.
    #[command(flatten)]
    pub common: CommonOptions,

    #[command(flatten)]
    pub maintenance: MaintenanceOptions,
}

/// Options every command running against Kubernetes takes.
#[derive(Debug, PartialEq, Eq, Args)]
pub struct CommonOptions {
    #[command(flatten)]
    pub telemetry: TelemetryOptions,
}

#[cfg(test)]
mod tests {
    use backup_telemetry::tracing::settings::LogFormat;

    use super::*;

    #[derive(Debug, Parser)]
    struct Opts {
        #[clap(subcommand)]
        command: Command,
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;

        RunArguments::command().print_long_help().unwrap();
        RunArguments::command().debug_assert();
        Opts::command().debug_assert();
    }

    #[test]
    fn parse_crd() {
        let opts = Opts::try_parse_from(["backup-operator", "crd"]).unwrap();
        assert_eq!(opts.command, Command::Crd);
    }

    #[test]
    fn parse_run_defaults() {
        let opts = Opts::try_parse_from(["backup-operator", "run"]).unwrap();

        let Command::Run(run) = opts.command else {
            panic!("expected the run command");
        };
        assert_eq!(run.watch_namespace, WatchNamespace::All);
        assert_eq!(run.default_backup_image, None);
        assert!(!run.maintenance.disable_crd_maintenance);
        assert!(!run.common.telemetry.console_log_disabled);
    }

    #[test]
    fn parse_run_arguments() {
        let opts = Opts::try_parse_from([
            "backup-operator",
            "run",
            "--watch-namespace",
            "backups",
            "--default-backup-image",
            "restic:0.17",
            "--disable-crd-maintenance",
            "--console-log-format",
            "json",
        ])
        .unwrap();

        let Command::Run(run) = opts.command else {
            panic!("expected the run command");
        };
        assert_eq!(run.watch_namespace, WatchNamespace::One("backups".to_owned()));
        assert_eq!(run.default_backup_image.as_deref(), Some("restic:0.17"));
        assert!(run.maintenance.disable_crd_maintenance);
        assert_eq!(run.common.telemetry.console_log_format, Some(LogFormat::Json));
    }
}
