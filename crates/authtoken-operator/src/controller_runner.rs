//! Controller runner - wires the AuthTokenRequest controller to the kube-runtime loop

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;

use authtoken_common::crd::AuthTokenRequest;
use authtoken_common::CONTROLLER_NAME;
use authtoken_controller::{error_policy, reconcile, Context, ControllerSettings};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Label selector for ConfigMaps written by this controller
pub fn owned_config_map_selector() -> String {
    format!(
        "{}={}",
        authtoken_common::LABEL_MANAGED_BY,
        CONTROLLER_NAME
    )
}

/// Request API scoped to the watch namespace, or all namespaces
pub fn scoped_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Future that completes once `cancel` fires
pub fn shutdown_trigger(
    cancel: &CancellationToken,
) -> impl std::future::Future<Output = ()> + Send + Sync + 'static {
    cancel.clone().cancelled_owned()
}

/// Cancel `cancel` on SIGINT or SIGTERM
pub async fn cancel_on_signal(cancel: CancellationToken) {
    wait_for_signal().await;
    tracing::info!("Shutdown signal received, aborting in-flight calls");
    cancel.cancel();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, listening for SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Run the AuthTokenRequest controller until a shutdown signal arrives
///
/// A signal cancels `cancel` right away, which aborts the external calls of
/// passes still running, and stops the controller once they return.
pub async fn run_controller(
    client: Client,
    settings: ControllerSettings,
    watch_namespace: Option<String>,
    max_concurrent_reconciles: u16,
    cancel: CancellationToken,
) {
    let ctx = Arc::new(
        Context::builder(client.clone())
            .settings(settings)
            .cancellation(cancel.clone())
            .build(),
    );
    let signals = tokio::spawn(cancel_on_signal(cancel.clone()));
    let requests: Api<AuthTokenRequest> = scoped_api(client.clone(), watch_namespace.as_deref());
    let config_maps: Api<ConfigMap> = scoped_api(client, watch_namespace.as_deref());

    tracing::info!(
        namespace = watch_namespace.as_deref().unwrap_or("<all>"),
        max_concurrent_reconciles,
        "Starting AuthTokenRequest controller"
    );

    Controller::new(requests, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .owns(
            config_maps,
            WatcherConfig::default()
                .timeout(WATCH_TIMEOUT_SECS)
                .labels(&owned_config_map_selector()),
        )
        .with_config(ControllerConfig::default().concurrency(max_concurrent_reconciles))
        .graceful_shutdown_on(shutdown_trigger(&cancel))
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("AuthTokenRequest"))
        .await;

    signals.abort();
    tracing::info!("AuthTokenRequest controller stopped");
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
