use futures::StreamExt;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client};
use kulta_updater::controller::clock::{Clock, SystemClock};
use kulta_updater::controller::notification::{
    HttpNotificationSink, NoopNotificationSink, NotificationSink,
};
use kulta_updater::controller::registrar::{
    HttpMetadataSource, ReleaseRegistrar, DEFAULT_CHANNEL_CHECK_INTERVAL, METADATA_TIMEOUT,
};
use kulta_updater::controller::requirements::{min_version_check, RequirementRegistry};
use kulta_updater::controller::settings::Settings;
use kulta_updater::controller::store::{DeployTarget, KubeReleaseStore};
use kulta_updater::controller::updater::{
    run_gc_loop, SettingsLoader, DEFAULT_GC_INTERVAL, DEFAULT_KEEP,
};
use kulta_updater::controller::version::parse_version;
use kulta_updater::controller::{error_policy, reconcile, Context};
use kulta_updater::crd::release::PlatformRelease;
use kulta_updater::server::{
    create_metrics, run_health_server, shutdown_channel, wait_for_signal, ReadinessState,
};
use semver::Version;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Default port for health and metrics endpoints
const HEALTH_PORT: u16 = 8080;

/// Cluster version from the API server's git version, e.g. "v1.30.4-eks-a737599"
fn parse_apiserver_version(git_version: &str) -> Option<Version> {
    let core = git_version
        .split(['-', '+'])
        .next()
        .unwrap_or(git_version);
    parse_version(core).ok()
}

/// Disruption reasons keyed by disruption name, from `KULTA_UPDATER_DISRUPTIONS`
fn parse_disruptions(raw: Option<&str>) -> Result<HashMap<String, String>, serde_json::Error> {
    match raw.map(str::trim).filter(|r| !r.is_empty()) {
        Some(raw) => serde_json::from_str(raw),
        None => Ok(HashMap::new()),
    }
}

/// Settings reloaded per pass; an unset cluster id gets a random one for the process lifetime
fn settings_loader() -> SettingsLoader {
    let fallback_cluster_id = uuid::Uuid::new_v4().to_string();
    Arc::new(move || {
        let mut settings = Settings::from_env()?;
        if settings.cluster_id.is_empty() {
            settings.cluster_id = fallback_cluster_id.clone();
        }
        Ok(settings)
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // reqwest's rustls backend needs a process-wide crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!("Starting KULTA release updater");

    let (shutdown_controller, shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();
    let metrics = create_metrics()?;

    let settings = settings_loader();
    let initial = settings()?;
    info!(
        mode = ?initial.mode,
        channel = %initial.release_channel,
        cluster_id = %initial.cluster_id,
        "Updater settings loaded"
    );

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_handle = tokio::spawn(async move {
        if let Err(e) = run_health_server(HEALTH_PORT, health_readiness, health_metrics).await {
            warn!(error = %e, "Health server failed");
        }
    });

    let disruptions =
        parse_disruptions(std::env::var("KULTA_UPDATER_DISRUPTIONS").ok().as_deref())?;
    let mut requirements = RequirementRegistry::new().with_disruptions(disruptions);
    match client.apiserver_version().await {
        Ok(info) => match parse_apiserver_version(&info.git_version) {
            Some(version) => {
                info!(version = %version, "Registered kubernetes version requirement");
                requirements.register("kubernetes", min_version_check("kubernetes", version));
            }
            None => warn!(
                git_version = %info.git_version,
                "Unparseable cluster version, kubernetes requirements will block releases"
            ),
        },
        Err(e) => warn!(
            error = %e,
            "Failed to read cluster version, kubernetes requirements will block releases"
        ),
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let target = DeployTarget::from_env();
    if target.is_none() {
        warn!("No deploy target configured, releases will be recorded without rolling a workload");
    }
    let store = Arc::new(KubeReleaseStore::<PlatformRelease>::new(
        client.clone(),
        target,
        clock.clone(),
    ));

    let notifier: Arc<dyn NotificationSink> =
        match HttpNotificationSink::from_config(&initial.notification) {
            Some(sink) => {
                info!("Release notification webhook configured");
                Arc::new(sink)
            }
            None => Arc::new(NoopNotificationSink),
        };

    let gc_handle = tokio::spawn(run_gc_loop::<PlatformRelease>(
        store.clone(),
        DEFAULT_GC_INTERVAL,
        DEFAULT_KEEP,
        shutdown_signal.clone(),
    ));

    let channel_handle = match std::env::var("KULTA_UPDATER_RELEASE_SOURCE_URL") {
        Ok(base_url) if !base_url.trim().is_empty() && !initial.release_channel.is_empty() => {
            info!(source = %base_url, "Release channel polling enabled");
            let registrar = ReleaseRegistrar::<PlatformRelease, _>::new(
                Arc::new(HttpMetadataSource::new(base_url, METADATA_TIMEOUT)),
                store.clone(),
                clock.clone(),
            );
            let loader = settings.clone();
            Some(tokio::spawn(registrar.run(
                DEFAULT_CHANNEL_CHECK_INTERVAL,
                move || loader(),
                shutdown_signal.clone(),
            )))
        }
        _ => {
            info!("Release source or channel not configured - channel polling disabled");
            None
        }
    };

    let ctx = Arc::new(Context::new(
        store,
        Arc::new(requirements),
        notifier,
        clock,
        settings,
        Some(metrics.clone()),
    ));

    readiness.set_ready();
    info!("Controller ready, starting reconciliation loop");

    // error_policy already logs failures
    let releases = Api::<PlatformRelease>::all(client.clone());
    let controller = Controller::new(releases, watcher::Config::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            if let Ok(o) = res {
                info!("Reconciled: {:?}", o);
            }
        });

    tokio::select! {
        _ = controller => {
            info!("Controller stream ended");
        }
        signal = wait_for_signal() => {
            info!(signal = signal, "Initiating graceful shutdown");
            readiness.set_not_ready();
        }
    }

    shutdown_controller.shutdown();
    info!("Stopping components...");

    if let Some(handle) = channel_handle {
        let _ = handle.await;
    }
    let _ = gc_handle.await;
    health_handle.abort();

    info!("KULTA release updater shut down gracefully");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[path = "main_test.rs"]
mod tests;
