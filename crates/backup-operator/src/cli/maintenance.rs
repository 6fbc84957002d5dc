use clap::Args;

#[derive(Debug, PartialEq, Eq, Args)]
#[command(next_help_heading = "Maintenance Options")]
pub struct MaintenanceOptions {
    /// Don't maintain the BackupPolicy CustomResourceDefinition (CRD).
    ///
    /// Maintenance means applying the CRD on startup so that it matches the operator version.
    /// Turning this off can be desirable to reduce the RBAC permissions of the operator.
    ///
    /// WARNING: If you disable CRD maintenance you are responsible for installing and updating
    /// the CRD yourself.
    #[arg(long, env)]
    pub disable_crd_maintenance: bool,
}
