//! Keel Operator - reconciles Keel custom resources

use clap::{Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;

use keel_common::crd::MaintenanceTask;
use keel_common::telemetry::{init_telemetry, TelemetryConfig};
use keel_common::{ControllerConfig, OPERATOR_NAME};

/// Keel - Kubernetes operator for database maintenance workloads
#[derive(Parser, Debug)]
#[command(name = "keel", version, about, long_about = None)]
struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Human-readable logs instead of JSON
    #[arg(long, env = "KEEL_PRETTY_LOGS")]
    pretty_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controllers (default mode)
    Controller {
        /// Concurrent sync workers per controller; overrides KEEL_WORKERS
        #[arg(long)]
        workers: Option<usize>,

        /// Do not install or update CRDs on startup
        #[arg(long)]
        skip_crd_install: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&MaintenanceTask::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        pretty: cli.pretty_logs,
        ..Default::default()
    })?;

    match cli.command {
        Some(Commands::Controller {
            workers,
            skip_crd_install,
        }) => run_controller(workers, skip_crd_install).await,
        None => run_controller(None, false).await,
    }
}

/// Install the Keel CRDs with server-side apply
///
/// Keeps the installed schema in lockstep with the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(OPERATOR_NAME).force();

    tracing::info!("Installing MaintenanceTask CRD...");
    let crd = MaintenanceTask::crd();
    let name = crd.metadata.name.clone().unwrap_or_default();
    crds.patch(&name, &params, &Patch::Apply(&crd))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install MaintenanceTask CRD: {}", e))?;

    Ok(())
}

/// Apply command-line overrides on top of the environment config
fn with_cli_overrides(
    mut config: ControllerConfig,
    workers: Option<usize>,
) -> keel_common::Result<ControllerConfig> {
    if let Some(workers) = workers {
        config.workers = workers;
    }
    config.validate()?;
    Ok(config)
}

async fn run_controller(workers: Option<usize>, skip_crd_install: bool) -> anyhow::Result<()> {
    let config = with_cli_overrides(ControllerConfig::from_env()?, workers)?;
    tracing::info!(?config, "Starting Keel controller");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if !skip_crd_install {
        ensure_crds_installed(&client).await?;
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown signal received");
        signal.cancel();
    });

    keel_task::run(client, config, shutdown).await?;

    tracing::info!("Keel controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_subcommand_accepts_workers() {
        let cli = Cli::parse_from(["keel", "controller", "--workers", "3"]);
        match cli.command {
            Some(Commands::Controller {
                workers,
                skip_crd_install,
            }) => {
                assert_eq!(workers, Some(3));
                assert!(!skip_crd_install);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn no_subcommand_defaults_to_controller() {
        let cli = Cli::parse_from(["keel"]);
        assert!(cli.command.is_none());
        assert!(!cli.crd);
    }

    #[test]
    fn workers_override_is_validated() {
        let config = with_cli_overrides(ControllerConfig::default(), Some(4)).unwrap();
        assert_eq!(config.workers, 4);

        assert!(with_cli_overrides(ControllerConfig::default(), Some(0)).is_err());
        assert_eq!(
            with_cli_overrides(ControllerConfig::default(), None).unwrap().workers,
            ControllerConfig::default().workers
        );
    }

    #[test]
    fn crd_manifest_serializes() {
        let yaml = serde_yaml::to_string(&MaintenanceTask::crd()).unwrap();
        assert!(yaml.contains("maintenancetasks.keel.dev"));
    }
}
