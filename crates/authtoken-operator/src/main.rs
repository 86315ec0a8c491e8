//! AuthTokenRequest Operator - service accounts and tokens provisioned across clusters

use clap::{Parser, Subcommand};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use tokio_util::sync::CancellationToken;

use authtoken_common::crd::auth_token_request_crd;
use authtoken_common::kube_utils::create_client;
use authtoken_common::telemetry::init_logging;
use authtoken_operator::controller_runner::run_controller;
use authtoken_operator::OperatorConfig;

/// Name of the AuthTokenRequest CRD object
const CRD_NAME: &str = "authtokenrequests.multicluster.x-k8s.io";

/// AuthTokenRequest operator - provisions service accounts and tokens in target clusters
#[derive(Parser, Debug)]
#[command(name = "authtoken-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    Controller(OperatorConfig),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = auth_token_request_crd()
            .map_err(|e| anyhow::anyhow!("Failed to build CRD: {}", e))?;
        let yaml = serde_yaml::to_string(&crd)
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{yaml}");
        return Ok(());
    }

    let config = match cli.command {
        Some(Commands::Controller(config)) => config,
        None => OperatorConfig::from_env_defaults()?,
    };
    run(config).await
}

async fn run(config: OperatorConfig) -> anyhow::Result<()> {
    init_logging(config.log_format)?;
    let settings = config.controller_settings()?;

    let client = create_client(config.kubeconfig.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if config.skip_crd_install {
        tracing::info!("Skipping CRD installation");
    } else {
        ensure_crd_installed(&client, &config.field_manager).await?;
    }

    tracing::info!(
        fallback_namespace = %settings.fallback_namespace,
        token_expiration_secs = settings.token_expiration.as_secs(),
        call_timeout_secs = settings.call_timeout.as_secs(),
        "Starting AuthTokenRequest operator"
    );

    run_controller(
        client,
        settings,
        config.watch_namespace.clone(),
        config.max_concurrent_reconciles,
        CancellationToken::new(),
    )
    .await;

    tracing::info!("Operator shut down");
    Ok(())
}

/// Ensure the AuthTokenRequest CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply.
/// This ensures the CRD version always matches the operator version.
async fn ensure_crd_installed(client: &Client, field_manager: &str) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(field_manager).force();
    let crd = auth_token_request_crd()
        .map_err(|e| anyhow::anyhow!("Failed to build CRD: {}", e))?;

    tracing::info!("Installing AuthTokenRequest CRD...");
    crds.patch(CRD_NAME, &params, &Patch::Apply(&crd))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install AuthTokenRequest CRD: {}", e))?;

    tracing::info!("AuthTokenRequest CRD installed/updated");
    Ok(())
}
