use backup_operator::{
    OPERATOR_NAME,
    cli::{Command, RunArguments},
    client::Client,
    controller::{self, ControllerConfig},
    crd::{
        self, BackupPolicy, CustomResourceExt as _,
        maintainer::{
            self, CustomResourceDefinitionMaintainer, CustomResourceDefinitionMaintainerOptions,
        },
    },
    utils::signal::{SignalError, SignalWatcher},
};
use backup_telemetry::Tracing;
use clap::Parser;
use kube::CustomResourceExt as _;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to print CRD"))]
    PrintCrd { source: crd::Error },

    #[snafu(display("failed to initialize tracing"))]
    InitTracing {
        source: backup_telemetry::tracing::Error,
    },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("failed to maintain custom resource definitions"))]
    MaintainCrds { source: maintainer::Error },

    #[snafu(display("failed to watch for shutdown signals"))]
    WatchSignals { source: SignalError },
}

#[derive(Debug, Parser)]
#[command(
    name = "backup-operator",
    author,
    version,
    about = "Kubernetes operator running scheduled backups described by BackupPolicy objects"
)]
struct Opts {
    #[clap(subcommand)]
    command: Command,
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    let opts = Opts::parse();

    match opts.command {
        Command::Crd => BackupPolicy::print_yaml_schema().context(PrintCrdSnafu),
        Command::Run(run) => run_operator(run).await,
    }
}

async fn run_operator(
    RunArguments {
        watch_namespace,
        default_backup_image,
        common,
        maintenance,
    }: RunArguments,
) -> Result<(), Error> {
    // Dropping the guard flushes and shuts down all exporters
    let _tracing_guard = Tracing::pre_configured(OPERATOR_NAME, common.telemetry)
        .init()
        .context(InitTracingSnafu)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        %watch_namespace,
        "starting {OPERATOR_NAME}"
    );

    let signal_watcher = SignalWatcher::sigterm().context(WatchSignalsSnafu)?;

    let kube_client = kube::Client::try_default()
        .await
        .context(CreateClientSnafu)?;

    CustomResourceDefinitionMaintainer::new(
        kube_client.clone(),
        [BackupPolicy::crd()],
        CustomResourceDefinitionMaintainerOptions {
            operator_name: OPERATOR_NAME,
            disabled: maintenance.disable_crd_maintenance,
        },
    )
    .run()
    .await
    .context(MaintainCrdsSnafu)?;

    let client = Client::new(kube_client, Some(OPERATOR_NAME.to_owned()));

    controller::run(
        client,
        ControllerConfig {
            operator_name: OPERATOR_NAME.to_owned(),
            default_image: default_backup_image,
        },
        watch_namespace,
        signal_watcher.handle(),
    )
    .await;

    tracing::info!("{OPERATOR_NAME} stopped");

    Ok(())
}
